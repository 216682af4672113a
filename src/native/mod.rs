// Native backends
//
// Each backend is a zero-sized marker implementing `Backend`. `Device<B>` and
// `CommandBuffer<B>` are monomorphized over it, so barrier translation and
// encoding are direct calls into the backend's tables.

pub mod d3d12;
pub mod metal;
pub mod vulkan;

use raw_window_handle::RawWindowHandle;
use serde::Deserialize;
use std::fmt::Debug;

use crate::backend::command::{LoadOp, PassKind, StoreOp};
use crate::backend::memory::MemoryType;
use crate::backend::pipeline::PrimitiveTopology;
use crate::backend::texture::TextureDesc;
use crate::backend::tracker::{ResolvedBufferBarrier, ResolvedTextureBarrier};
use crate::format::Format;

pub use d3d12::D3D12;
pub use metal::Metal;
pub use vulkan::Vulkan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    D3D12,
    Vulkan,
    Metal,
}

impl BackendKind {
    /// Backend native to the build target.
    pub fn platform_default() -> Self {
        if cfg!(target_os = "windows") {
            BackendKind::D3D12
        } else if cfg!(any(target_os = "macos", target_os = "ios")) {
            BackendKind::Metal
        } else {
            BackendKind::Vulkan
        }
    }
}

impl Default for BackendKind {
    fn default() -> Self {
        Self::platform_default()
    }
}

/// Where a barrier batch is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierContext {
    pub pass: PassKind,
    pub queue_family: u32,
}

pub trait Backend: Debug + Clone + Copy + Default + Send + Sync + 'static {
    const KIND: BackendKind;
    /// Cross-family use without a release/acquire pair is an error.
    const EXPLICIT_QUEUE_OWNERSHIP: bool;

    type Barrier: Debug + Clone + PartialEq + Send + Sync;
    type NativeFormat: Debug + Clone + Copy + PartialEq + Send + Sync;
    type NativeIndexType: Debug + Clone + Copy + PartialEq + Send + Sync;
    type NativeLoadAction: Debug + Clone + Copy + PartialEq + Send + Sync;
    type NativeStoreAction: Debug + Clone + Copy + PartialEq + Send + Sync;
    type NativeTopology: Debug + Clone + Copy + PartialEq + Send + Sync;

    /// `None` when the backend has no equivalent.
    fn encode_format(format: Format) -> Option<Self::NativeFormat>;

    fn encode_index_type(format: Format) -> Option<Self::NativeIndexType>;

    fn encode_load_action(op: LoadOp) -> Self::NativeLoadAction;

    fn encode_store_action(op: StoreOp, resolve: bool) -> Self::NativeStoreAction;

    fn encode_primitive_topology(topology: PrimitiveTopology) -> Self::NativeTopology;

    /// Whether a texture described by `desc` may live in `memory_type`.
    fn supports_texture_memory(memory_type: MemoryType, desc: &TextureDesc) -> bool {
        let _ = desc;
        memory_type == MemoryType::Local
    }

    fn supports_window(window: &RawWindowHandle) -> bool;

    /// Whether swap-chain back buffers may use `format`.
    fn is_presentable_format(format: Format) -> bool {
        matches!(
            format,
            Format::Bgra8Unorm
                | Format::Bgra8UnormSrgb
                | Format::Rgba8Unorm
                | Format::Rgba8UnormSrgb
                | Format::Rgb10a2Unorm
                | Format::Rgba16Float
        )
    }

    fn translate_buffer_barrier(ctx: &BarrierContext, barrier: &ResolvedBufferBarrier, out: &mut Vec<Self::Barrier>);

    fn translate_texture_barrier(ctx: &BarrierContext, barrier: &ResolvedTextureBarrier, out: &mut Vec<Self::Barrier>);

    /// Called once per `resource_barrier` call after every barrier of the
    /// batch was translated; `out[batch_start..]` holds this batch.
    fn finish_barrier_batch(ctx: &BarrierContext, out: &mut Vec<Self::Barrier>, batch_start: usize) {
        let _ = (ctx, out, batch_start);
    }
}
