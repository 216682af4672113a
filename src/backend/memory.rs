// Device memory and budget accounting
//
// Every resource lives in a `DeviceMemory`: committed resources own one
// exclusively, placed (aliasing) resources share one created explicitly
// through `Device::new_device_memory`. Allocations are host resident and are
// charged against the per-memory-type budgets from `[memory]` in config.toml.

use bitflags::bitflags;
use gpu_allocator::MemoryLocation;
use parking_lot::{Mutex, MutexGuard};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::MemoryConfig;
use crate::error::{RhiError, RhiResult};

pub const DEFAULT_PLACEMENT_ALIGNMENT: u64 = 64 * 1024;
pub const MSAA_PLACEMENT_ALIGNMENT: u64 = 4 * 1024 * 1024;
pub const BUFFER_ALIGNMENT: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// GPU only.
    Local,
    /// CPU writes, GPU reads.
    Upload,
    /// GPU writes, CPU reads.
    Readback,
}

impl MemoryType {
    pub fn location(self) -> MemoryLocation {
        match self {
            MemoryType::Local => MemoryLocation::GpuOnly,
            MemoryType::Upload => MemoryLocation::CpuToGpu,
            MemoryType::Readback => MemoryLocation::GpuToCpu,
        }
    }

    pub fn is_host_visible(self) -> bool {
        self != MemoryType::Local
    }

    fn slot(self) -> usize {
        match self {
            MemoryType::Local => 0,
            MemoryType::Upload => 1,
            MemoryType::Readback => 2,
        }
    }
}

bitflags! {
    /// What a shared heap may hold.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ResourceHeapUsageFlags: u32 {
        const BUFFER = 1 << 0;
        const TEXTURE_RT_DS = 1 << 1;
        const TEXTURE_NON_RT_DS = 1 << 2;
        const TEXTURE_MSAA = 1 << 3;
    }
}

bitflags! {
    /// What a shared heap refuses, derived once from its usage flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HeapDenyFlags: u32 {
        const DENY_BUFFERS = 1 << 0;
        const DENY_RT_DS_TEXTURES = 1 << 1;
        const DENY_NON_RT_DS_TEXTURES = 1 << 2;
    }
}

impl HeapDenyFlags {
    pub fn from_usages(usages: ResourceHeapUsageFlags) -> Self {
        let mut deny = HeapDenyFlags::empty();
        if !usages.contains(ResourceHeapUsageFlags::BUFFER) {
            deny |= HeapDenyFlags::DENY_BUFFERS;
        }
        if !usages.contains(ResourceHeapUsageFlags::TEXTURE_RT_DS) {
            deny |= HeapDenyFlags::DENY_RT_DS_TEXTURES;
        }
        if !usages.contains(ResourceHeapUsageFlags::TEXTURE_NON_RT_DS) {
            deny |= HeapDenyFlags::DENY_NON_RT_DS_TEXTURES;
        }
        deny
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceHeapDesc {
    pub memory_type: MemoryType,
    pub size: u64,
    pub usages: ResourceHeapUsageFlags,
}

/// Byte budgets per memory type.
#[derive(Debug, Clone, Copy)]
pub struct MemoryBudget {
    pub local: u64,
    pub upload: u64,
    pub readback: u64,
    pub max_allocation: u64,
}

impl From<&MemoryConfig> for MemoryBudget {
    fn from(config: &MemoryConfig) -> Self {
        const MIB: u64 = 1024 * 1024;
        Self {
            local: config.local_budget_mb * MIB,
            upload: config.upload_budget_mb * MIB,
            readback: config.readback_budget_mb * MIB,
            max_allocation: config.max_allocation_mb * MIB,
        }
    }
}

impl MemoryBudget {
    fn limit(&self, memory_type: MemoryType) -> u64 {
        match memory_type {
            MemoryType::Local => self.local,
            MemoryType::Upload => self.upload,
            MemoryType::Readback => self.readback,
        }
    }
}

/// Budget bookkeeping and virtual address assignment.
#[derive(Debug)]
pub struct MemoryAllocator {
    budget: MemoryBudget,
    used: Mutex<[u64; 3]>,
    next_address: AtomicU64,
}

impl MemoryAllocator {
    pub fn new(budget: MemoryBudget) -> Self {
        Self {
            budget,
            used: Mutex::new([0; 3]),
            // Address zero stays invalid.
            next_address: AtomicU64::new(DEFAULT_PLACEMENT_ALIGNMENT),
        }
    }

    pub fn used(&self, memory_type: MemoryType) -> u64 {
        self.used.lock()[memory_type.slot()]
    }

    fn reserve(&self, memory_type: MemoryType, size: u64, alignment: u64) -> RhiResult<u64> {
        if size > self.budget.max_allocation {
            return Err(RhiError::bad_platform_call(format!(
                "allocation of {} bytes exceeds the maximum single allocation of {} bytes",
                size, self.budget.max_allocation
            )));
        }
        {
            let mut used = self.used.lock();
            let slot = &mut used[memory_type.slot()];
            let limit = self.budget.limit(memory_type);
            if *slot + size > limit {
                return Err(RhiError::bad_platform_call(format!(
                    "{:?} memory budget exhausted: {} of {} bytes in use, {} requested",
                    memory_type, *slot, limit, size
                )));
            }
            *slot += size;
        }

        let span = size.max(1).next_multiple_of(alignment) + alignment;
        let base = self.next_address.fetch_add(span, Ordering::Relaxed);
        Ok(base.next_multiple_of(alignment))
    }

    fn release(&self, memory_type: MemoryType, size: u64) {
        let mut used = self.used.lock();
        let slot = &mut used[memory_type.slot()];
        *slot = slot.saturating_sub(size);
    }
}

/// One allocation. Dropping it returns the bytes to the budget.
#[derive(Debug)]
pub struct DeviceMemory {
    id: u64,
    memory_type: MemoryType,
    size: u64,
    alignment: u64,
    usages: ResourceHeapUsageFlags,
    deny: HeapDenyFlags,
    gpu_address: u64,
    storage: Mutex<Vec<u8>>,
    allocator: Arc<MemoryAllocator>,
}

impl DeviceMemory {
    pub(crate) fn allocate(
        allocator: &Arc<MemoryAllocator>,
        id: u64,
        memory_type: MemoryType,
        size: u64,
        alignment: u64,
        usages: ResourceHeapUsageFlags,
    ) -> RhiResult<Arc<Self>> {
        let gpu_address = allocator.reserve(memory_type, size, alignment)?;

        let mut storage = Vec::new();
        if let Err(e) = storage.try_reserve_exact(size as usize) {
            allocator.release(memory_type, size);
            return Err(RhiError::bad_platform_call(format!(
                "failed to allocate {} bytes of {:?} memory: {}",
                size, memory_type, e
            )));
        }
        storage.resize(size as usize, 0);

        log::trace!(
            "Allocated {} bytes of {:?} memory ({:?}) at {:#x}",
            size,
            memory_type,
            memory_type.location(),
            gpu_address
        );

        Ok(Arc::new(Self {
            id,
            memory_type,
            size,
            alignment,
            usages,
            deny: HeapDenyFlags::from_usages(usages),
            gpu_address,
            storage: Mutex::new(storage),
            allocator: allocator.clone(),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    pub fn location(&self) -> MemoryLocation {
        self.memory_type.location()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Alignment required for resources placed in this memory.
    pub fn placement_alignment(&self) -> u64 {
        self.alignment
    }

    pub fn usages(&self) -> ResourceHeapUsageFlags {
        self.usages
    }

    pub fn deny_flags(&self) -> HeapDenyFlags {
        self.deny
    }

    pub fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    /// Locks the backing bytes. Hold the guard only for the duration of one
    /// copy; queue workers take the same lock while replaying.
    pub(crate) fn storage(&self) -> MutexGuard<'_, Vec<u8>> {
        self.storage.lock()
    }

    /// Copies `[offset, offset + out.len())` out of the backing bytes.
    pub(crate) fn read_bytes(&self, offset: u64, out: &mut [u8]) {
        let start = offset as usize;
        out.copy_from_slice(&self.storage.lock()[start..start + out.len()]);
    }

    /// Copies `bytes` into the backing bytes at `offset`.
    pub(crate) fn write_bytes(&self, offset: u64, bytes: &[u8]) {
        let start = offset as usize;
        self.storage.lock()[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Checks that `[offset, offset + size)` fits and that `offset` honours the
    /// placement alignment.
    pub(crate) fn check_placement(&self, offset: u64, size: u64) -> RhiResult<()> {
        if offset % self.alignment != 0 {
            return Err(RhiError::bad_arguments(format!(
                "placement offset {} is not aligned to {}",
                offset, self.alignment
            )));
        }
        match offset.checked_add(size) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(RhiError::bad_arguments(format!(
                "placement [{}, +{}) exceeds memory size {}",
                offset, size, self.size
            ))),
        }
    }
}

impl Drop for DeviceMemory {
    fn drop(&mut self) {
        self.allocator.release(self.memory_type, self.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(local: u64) -> Arc<MemoryAllocator> {
        Arc::new(MemoryAllocator::new(MemoryBudget {
            local,
            upload: 1 << 20,
            readback: 1 << 20,
            max_allocation: 1 << 20,
        }))
    }

    #[test]
    fn deny_flags_follow_usages() {
        let deny = HeapDenyFlags::from_usages(ResourceHeapUsageFlags::BUFFER);
        assert_eq!(
            deny,
            HeapDenyFlags::DENY_RT_DS_TEXTURES | HeapDenyFlags::DENY_NON_RT_DS_TEXTURES
        );
        let deny = HeapDenyFlags::from_usages(
            ResourceHeapUsageFlags::TEXTURE_RT_DS | ResourceHeapUsageFlags::TEXTURE_NON_RT_DS,
        );
        assert_eq!(deny, HeapDenyFlags::DENY_BUFFERS);
    }

    #[test]
    fn budget_is_charged_and_returned() {
        let alloc = allocator(4096);
        let mem = DeviceMemory::allocate(&alloc, 1, MemoryType::Local, 3000, 256, ResourceHeapUsageFlags::BUFFER)
            .unwrap();
        assert_eq!(alloc.used(MemoryType::Local), 3000);
        assert_eq!(mem.gpu_address() % 256, 0);

        let err = DeviceMemory::allocate(&alloc, 2, MemoryType::Local, 2000, 256, ResourceHeapUsageFlags::BUFFER)
            .unwrap_err();
        assert!(matches!(err, RhiError::BadPlatformCall(_)));

        drop(mem);
        assert_eq!(alloc.used(MemoryType::Local), 0);
    }

    #[test]
    fn addresses_do_not_overlap() {
        let alloc = allocator(1 << 20);
        let a = DeviceMemory::allocate(&alloc, 1, MemoryType::Local, 100, 256, ResourceHeapUsageFlags::BUFFER)
            .unwrap();
        let b = DeviceMemory::allocate(&alloc, 2, MemoryType::Local, 100, 256, ResourceHeapUsageFlags::BUFFER)
            .unwrap();
        assert!(b.gpu_address() >= a.gpu_address() + 100);
    }

    #[test]
    fn placement_checks() {
        let alloc = allocator(1 << 20);
        let mem = DeviceMemory::allocate(
            &alloc,
            1,
            MemoryType::Local,
            256 * 1024,
            DEFAULT_PLACEMENT_ALIGNMENT,
            ResourceHeapUsageFlags::BUFFER,
        )
        .unwrap();
        assert!(mem.check_placement(64 * 1024, 1024).is_ok());
        assert!(mem.check_placement(100, 1024).is_err());
        assert!(mem.check_placement(192 * 1024, 128 * 1024).is_err());
    }
}
