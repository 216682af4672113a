// Shader bytecode handed to pipeline creation
//
// Compilation happens offline; the RHI only carries the compiled blob and its
// entry point into pipeline state objects.

use std::sync::Arc;

const SPIRV_MAGIC: u32 = 0x0723_0203;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShaderBytecode {
    code: Arc<[u8]>,
    entry_point: String,
}

impl ShaderBytecode {
    pub fn new(code: impl Into<Arc<[u8]>>, entry_point: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            entry_point: entry_point.into(),
        }
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// The blob as SPIR-V words, or `None` when it is not a SPIR-V module.
    pub fn spirv_words(&self) -> Option<Vec<u32>> {
        if self.code.len() < 4 || self.code.len() % 4 != 0 {
            return None;
        }
        // SPIR-V uses 4-byte little-endian words
        let words: Vec<u32> = self
            .code
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        (words[0] == SPIRV_MAGIC).then_some(words)
    }
}
