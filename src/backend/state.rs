// Portable resource states and barrier requests
//
// A barrier names a resource, the state it leaves and the state it enters.
// An empty `before` means "automatic": the tracker fills it in from the last
// recorded state. Native translation happens later in `native::*`.

use bitflags::bitflags;
use std::sync::Arc;

use super::buffer::Buffer;
use super::texture::Texture;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferStateFlags: u32 {
        /// Resolve from tracking. Never valid as an `after` state.
        const AUTOMATIC = 0;
        const INDIRECT_ARGUMENT = 1 << 0;
        const VERTEX_BUFFER = 1 << 1;
        const INDEX_BUFFER = 1 << 2;
        const UNIFORM_BUFFER_VS = 1 << 3;
        const SHADER_READ_VS = 1 << 4;
        const UNIFORM_BUFFER_PS = 1 << 5;
        const SHADER_READ_PS = 1 << 6;
        const SHADER_WRITE_PS = 1 << 7;
        const UNIFORM_BUFFER_CS = 1 << 8;
        const SHADER_READ_CS = 1 << 9;
        const SHADER_WRITE_CS = 1 << 10;
        const COPY_DEST = 1 << 11;
        const COPY_SOURCE = 1 << 12;

        /// Every read-only state. Upload heaps live here permanently.
        const GENERAL_READ = Self::INDIRECT_ARGUMENT.bits()
            | Self::VERTEX_BUFFER.bits()
            | Self::INDEX_BUFFER.bits()
            | Self::UNIFORM_BUFFER_VS.bits()
            | Self::SHADER_READ_VS.bits()
            | Self::UNIFORM_BUFFER_PS.bits()
            | Self::SHADER_READ_PS.bits()
            | Self::UNIFORM_BUFFER_CS.bits()
            | Self::SHADER_READ_CS.bits()
            | Self::COPY_SOURCE.bits();
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TextureStateFlags: u32 {
        const AUTOMATIC = 0;
        const SHADER_READ_VS = 1 << 0;
        const SHADER_READ_PS = 1 << 1;
        const SHADER_WRITE_PS = 1 << 2;
        const SHADER_READ_CS = 1 << 3;
        const SHADER_WRITE_CS = 1 << 4;
        const COLOR_ATTACHMENT_READ = 1 << 5;
        const COLOR_ATTACHMENT_WRITE = 1 << 6;
        const DEPTH_STENCIL_ATTACHMENT_READ = 1 << 7;
        const DEPTH_STENCIL_ATTACHMENT_WRITE = 1 << 8;
        const RESOLVE_ATTACHMENT = 1 << 9;
        const COPY_DEST = 1 << 10;
        const COPY_SOURCE = 1 << 11;
        const PRESENT = 1 << 12;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ResourceBarrierFlags: u32 {
        /// Old contents may be dropped.
        const DISCARD_CONTENT = 1 << 0;
        /// The resource starts using memory another placed resource used before.
        const ALIASING = 1 << 1;
    }
}

impl BufferStateFlags {
    pub const SHADER_WRITES: Self = Self::SHADER_WRITE_PS.union(Self::SHADER_WRITE_CS);

    pub fn is_write(self) -> bool {
        self.intersects(Self::SHADER_WRITES | Self::COPY_DEST)
    }
}

impl TextureStateFlags {
    pub const SHADER_WRITES: Self = Self::SHADER_WRITE_PS.union(Self::SHADER_WRITE_CS);

    pub fn is_write(self) -> bool {
        self.intersects(
            Self::SHADER_WRITES
                | Self::COLOR_ATTACHMENT_WRITE
                | Self::DEPTH_STENCIL_ATTACHMENT_WRITE
                | Self::RESOLVE_ATTACHMENT
                | Self::COPY_DEST,
        )
    }
}

/// Which subresources of a texture a barrier covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubresourceSelector {
    #[default]
    All,
    Single { mip_slice: u32, array_slice: u32 },
}

/// Queue ownership movement carried by a barrier. Queue indices refer to the
/// device's command queues, not to native queue families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OwnershipTransfer {
    #[default]
    None,
    /// Recorded on the source queue.
    Release { dst_queue: u32 },
    /// Recorded on the destination queue after the release executed.
    Acquire { src_queue: u32 },
}

#[derive(Debug, Clone)]
pub struct BufferBarrier {
    pub buffer: Arc<Buffer>,
    pub before: BufferStateFlags,
    pub after: BufferStateFlags,
    pub flags: ResourceBarrierFlags,
    pub ownership: OwnershipTransfer,
}

impl BufferBarrier {
    pub fn new(buffer: &Arc<Buffer>, after: BufferStateFlags) -> Self {
        Self {
            buffer: buffer.clone(),
            before: BufferStateFlags::AUTOMATIC,
            after,
            flags: ResourceBarrierFlags::empty(),
            ownership: OwnershipTransfer::None,
        }
    }

    pub fn before(mut self, before: BufferStateFlags) -> Self {
        self.before = before;
        self
    }

    pub fn flags(mut self, flags: ResourceBarrierFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn release_to(mut self, dst_queue: u32) -> Self {
        self.ownership = OwnershipTransfer::Release { dst_queue };
        self
    }

    pub fn acquire_from(mut self, src_queue: u32) -> Self {
        self.ownership = OwnershipTransfer::Acquire { src_queue };
        self
    }
}

#[derive(Debug, Clone)]
pub struct TextureBarrier {
    pub texture: Arc<Texture>,
    pub subresource: SubresourceSelector,
    pub before: TextureStateFlags,
    pub after: TextureStateFlags,
    pub flags: ResourceBarrierFlags,
    pub ownership: OwnershipTransfer,
}

impl TextureBarrier {
    /// Barrier over every subresource of `texture`.
    pub fn new(texture: &Arc<Texture>, after: TextureStateFlags) -> Self {
        Self {
            texture: texture.clone(),
            subresource: SubresourceSelector::All,
            before: TextureStateFlags::AUTOMATIC,
            after,
            flags: ResourceBarrierFlags::empty(),
            ownership: OwnershipTransfer::None,
        }
    }

    pub fn subresource(mut self, mip_slice: u32, array_slice: u32) -> Self {
        self.subresource = SubresourceSelector::Single { mip_slice, array_slice };
        self
    }

    pub fn before(mut self, before: TextureStateFlags) -> Self {
        self.before = before;
        self
    }

    pub fn flags(mut self, flags: ResourceBarrierFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn release_to(mut self, dst_queue: u32) -> Self {
        self.ownership = OwnershipTransfer::Release { dst_queue };
        self
    }

    pub fn acquire_from(mut self, src_queue: u32) -> Self {
        self.ownership = OwnershipTransfer::Acquire { src_queue };
        self
    }
}
