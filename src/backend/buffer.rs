// Buffers - linear GPU memory for vertices, indices, constants and storage
//
// A buffer is either committed (owns its DeviceMemory) or placed inside a
// shared DeviceMemory for aliasing. Both expose the same contract.

use bitflags::bitflags;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use super::memory::{DeviceMemory, MemoryType};
use super::state::BufferStateFlags;
use super::tracker::StateTracker;
use crate::error::{RhiError, RhiResult};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsageFlags: u32 {
        const COPY_SOURCE = 1 << 0;
        const COPY_DEST = 1 << 1;
        const UNIFORM_BUFFER = 1 << 2;
        const READ_BUFFER = 1 << 3;
        const READ_WRITE_BUFFER = 1 << 4;
        const VERTEX_BUFFER = 1 << 5;
        const INDEX_BUFFER = 1 << 6;
        const INDIRECT_BUFFER = 1 << 7;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub usages: BufferUsageFlags,
}

impl BufferDesc {
    pub fn new(size: u64, usages: BufferUsageFlags) -> Self {
        Self { size, usages }
    }
}

/// State a freshly created buffer is tracked in.
pub fn initial_buffer_state(memory_type: MemoryType) -> BufferStateFlags {
    match memory_type {
        MemoryType::Upload => BufferStateFlags::GENERAL_READ,
        MemoryType::Readback => BufferStateFlags::COPY_DEST,
        MemoryType::Local => BufferStateFlags::AUTOMATIC,
    }
}

#[derive(Debug)]
pub struct Buffer {
    handle: u64,
    desc: BufferDesc,
    memory: Arc<DeviceMemory>,
    offset: u64,
    aliasing: bool,
    tracker: StateTracker,
}

impl Buffer {
    pub(crate) fn new(handle: u64, desc: BufferDesc, memory: Arc<DeviceMemory>, offset: u64, aliasing: bool) -> Self {
        let initial = initial_buffer_state(memory.memory_type());
        Self {
            handle,
            desc,
            memory,
            offset,
            aliasing,
            tracker: StateTracker::new(1, initial.bits()),
        }
    }

    pub fn get_desc(&self) -> &BufferDesc {
        &self.desc
    }

    /// Native object id, never zero.
    pub fn native_handle(&self) -> u64 {
        self.handle
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory.memory_type()
    }

    pub fn memory(&self) -> &Arc<DeviceMemory> {
        &self.memory
    }

    /// Byte offset of this buffer inside its memory.
    pub fn memory_offset(&self) -> u64 {
        self.offset
    }

    pub fn is_aliasing(&self) -> bool {
        self.aliasing
    }

    pub fn gpu_address(&self) -> u64 {
        self.memory.gpu_address() + self.offset
    }

    /// Last recorded state. Empty means undefined/common.
    pub fn tracked_state(&self) -> BufferStateFlags {
        BufferStateFlags::from_bits_truncate(self.tracker.state(0).unwrap_or_default())
    }

    pub fn owning_queue_family(&self) -> Option<u32> {
        self.tracker.owner(0)
    }

    pub(crate) fn tracker(&self) -> &StateTracker {
        &self.tracker
    }

    /// States a barrier may move this buffer into.
    pub fn allowed_states(&self) -> BufferStateFlags {
        let usages = self.desc.usages;
        let mut states = BufferStateFlags::empty();
        if usages.contains(BufferUsageFlags::COPY_SOURCE) {
            states |= BufferStateFlags::COPY_SOURCE;
        }
        if usages.contains(BufferUsageFlags::COPY_DEST) {
            states |= BufferStateFlags::COPY_DEST;
        }
        if usages.contains(BufferUsageFlags::UNIFORM_BUFFER) {
            states |= BufferStateFlags::UNIFORM_BUFFER_VS
                | BufferStateFlags::UNIFORM_BUFFER_PS
                | BufferStateFlags::UNIFORM_BUFFER_CS;
        }
        if usages.intersects(BufferUsageFlags::READ_BUFFER | BufferUsageFlags::READ_WRITE_BUFFER) {
            states |= BufferStateFlags::SHADER_READ_VS
                | BufferStateFlags::SHADER_READ_PS
                | BufferStateFlags::SHADER_READ_CS;
        }
        if usages.contains(BufferUsageFlags::READ_WRITE_BUFFER) {
            states |= BufferStateFlags::SHADER_WRITES;
        }
        if usages.contains(BufferUsageFlags::VERTEX_BUFFER) {
            states |= BufferStateFlags::VERTEX_BUFFER;
        }
        if usages.contains(BufferUsageFlags::INDEX_BUFFER) {
            states |= BufferStateFlags::INDEX_BUFFER;
        }
        if usages.contains(BufferUsageFlags::INDIRECT_BUFFER) {
            states |= BufferStateFlags::INDIRECT_ARGUMENT;
        }
        match self.memory_type() {
            MemoryType::Upload => states | BufferStateFlags::GENERAL_READ,
            MemoryType::Readback => states | BufferStateFlags::COPY_DEST,
            MemoryType::Local => states,
        }
    }

    /// Maps the buffer for CPU access. `[read_begin, read_end)` is the range the
    /// CPU intends to read; pass an empty range for write-only mappings.
    ///
    /// The mapping is a private copy of the buffer's bytes taken here. Nothing
    /// stays locked while it is alive, so other buffers in the same memory can be
    /// mapped and queues keep executing. Only `unmap` publishes CPU writes, and
    /// only inside the write range it is given.
    pub fn map(&self, read_begin: u64, read_end: u64) -> RhiResult<BufferMapping<'_>> {
        if !self.memory_type().is_host_visible() {
            return Err(RhiError::not_supported(format!(
                "buffer #{} lives in {:?} memory and cannot be mapped",
                self.handle,
                self.memory_type()
            )));
        }
        self.check_range("read", read_begin, read_end)?;
        log::trace!("Map buffer #{} (read {}..{})", self.handle, read_begin, read_end);

        let mut data = vec![0; self.desc.size as usize];
        self.memory.read_bytes(self.offset, &mut data);
        Ok(BufferMapping { buffer: self, data })
    }

    fn check_range(&self, what: &str, begin: u64, end: u64) -> RhiResult<()> {
        if begin > end || end > self.desc.size {
            return Err(RhiError::bad_arguments(format!(
                "{} range {}..{} is outside buffer #{} of {} bytes",
                what, begin, end, self.handle, self.desc.size
            )));
        }
        Ok(())
    }
}

/// CPU view of a mapped buffer. Dropping it without `unmap` discards writes.
pub struct BufferMapping<'a> {
    buffer: &'a Buffer,
    data: Vec<u8>,
}

impl BufferMapping<'_> {
    /// Ends the mapping. `[write_begin, write_end)` is the range the CPU wrote
    /// and the only part copied back into device memory.
    pub fn unmap(self, write_begin: u64, write_end: u64) -> RhiResult<()> {
        self.buffer.check_range("write", write_begin, write_end)?;
        if write_begin < write_end {
            let written = &self.data[write_begin as usize..write_end as usize];
            self.buffer.memory.write_bytes(self.buffer.offset + write_begin, written);
        }
        log::trace!(
            "Unmap buffer #{} (wrote {}..{})",
            self.buffer.handle,
            write_begin,
            write_end
        );
        Ok(())
    }
}

impl Deref for BufferMapping<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for BufferMapping<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryAllocator, MemoryBudget, ResourceHeapUsageFlags, BUFFER_ALIGNMENT};

    fn buffer(memory_type: MemoryType, usages: BufferUsageFlags) -> Buffer {
        let allocator = Arc::new(MemoryAllocator::new(MemoryBudget {
            local: 1 << 20,
            upload: 1 << 20,
            readback: 1 << 20,
            max_allocation: 1 << 20,
        }));
        let memory = DeviceMemory::allocate(&allocator, 1, memory_type, 64, BUFFER_ALIGNMENT, ResourceHeapUsageFlags::BUFFER)
            .unwrap();
        Buffer::new(2, BufferDesc::new(64, usages), memory, 0, false)
    }

    #[test]
    fn initial_states_follow_memory_type() {
        assert_eq!(
            buffer(MemoryType::Upload, BufferUsageFlags::COPY_SOURCE).tracked_state(),
            BufferStateFlags::GENERAL_READ
        );
        assert_eq!(
            buffer(MemoryType::Readback, BufferUsageFlags::COPY_DEST).tracked_state(),
            BufferStateFlags::COPY_DEST
        );
        assert!(buffer(MemoryType::Local, BufferUsageFlags::VERTEX_BUFFER)
            .tracked_state()
            .is_empty());
    }

    #[test]
    fn allowed_states_follow_usage() {
        let b = buffer(MemoryType::Local, BufferUsageFlags::READ_BUFFER);
        assert!(b.allowed_states().contains(BufferStateFlags::SHADER_READ_CS));
        assert!(!b.allowed_states().contains(BufferStateFlags::SHADER_WRITE_CS));
    }

    #[test]
    fn local_memory_cannot_be_mapped() {
        let b = buffer(MemoryType::Local, BufferUsageFlags::VERTEX_BUFFER);
        assert!(matches!(b.map(0, 0), Err(RhiError::NotSupported(_))));
    }

    #[test]
    fn map_write_read() {
        let b = buffer(MemoryType::Upload, BufferUsageFlags::COPY_SOURCE);
        let mut mapping = b.map(0, 0).unwrap();
        mapping[..4].copy_from_slice(&[1, 2, 3, 4]);
        mapping.unmap(0, 4).unwrap();
        assert_eq!(&b.map(0, 4).unwrap()[..4], &[1, 2, 3, 4]);
        assert!(matches!(b.map(0, 65), Err(RhiError::BadArguments(_))));
    }

    #[test]
    fn unmap_publishes_only_the_written_range() {
        let b = buffer(MemoryType::Upload, BufferUsageFlags::COPY_SOURCE);
        let mut mapping = b.map(0, 0).unwrap();
        mapping[..8].fill(0xaa);
        mapping.unmap(4, 8).unwrap();
        assert_eq!(&b.map(0, 8).unwrap()[..8], &[0, 0, 0, 0, 0xaa, 0xaa, 0xaa, 0xaa]);

        let mut dropped = b.map(0, 0).unwrap();
        dropped[..4].fill(0xff);
        drop(dropped);
        assert_eq!(&b.map(0, 4).unwrap()[..4], &[0, 0, 0, 0]);
    }

    #[test]
    fn mappings_do_not_hold_the_memory_lock() {
        let b = buffer(MemoryType::Upload, BufferUsageFlags::COPY_SOURCE);
        let first = b.map(0, 0).unwrap();
        let second = b.map(0, 0).unwrap();
        b.memory().write_bytes(0, &[7]);
        assert_eq!(first[0], 0);
        second.unmap(0, 0).unwrap();
        first.unmap(0, 0).unwrap();
        assert_eq!(b.map(0, 1).unwrap()[0], 7);
    }
}
