// Vulkan translation
//
// Portable states map onto synchronization2 stage/access masks and image
// layouts. Barrier records are plain data; `to_vk()` builds the
// `vk::*MemoryBarrier2` structs a command buffer would pass to
// vkCmdPipelineBarrier2.

use ash::vk;
use ash::vk::Handle;
use raw_window_handle::RawWindowHandle;

use super::{Backend, BackendKind, BarrierContext};
use crate::backend::command::{LoadOp, StoreOp};
use crate::backend::pipeline::PrimitiveTopology;
use crate::backend::state::{BufferStateFlags, ResourceBarrierFlags, TextureStateFlags};
use crate::backend::tracker::{
    merge_subresource_ranges, QueueTransfer, ResolvedBufferBarrier, ResolvedTextureBarrier, SubresourceRange,
};
use crate::format::Format;

/// Stage and access of one side of a barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VkAccess {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

impl VkAccess {
    const NONE: Self = Self {
        stage: vk::PipelineStageFlags2::NONE,
        access: vk::AccessFlags2::NONE,
    };

    const fn new(stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        Self { stage, access }
    }

    fn merge(self, other: Self) -> Self {
        Self {
            stage: self.stage | other.stage,
            access: self.access | other.access,
        }
    }

    /// Only writes need to be made available on the source side.
    fn src(self) -> Self {
        Self {
            stage: self.stage,
            access: self.access & write_access_mask(),
        }
    }
}

fn write_access_mask() -> vk::AccessFlags2 {
    vk::AccessFlags2::SHADER_WRITE
        | vk::AccessFlags2::SHADER_STORAGE_WRITE
        | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE
        | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE
        | vk::AccessFlags2::TRANSFER_WRITE
        | vk::AccessFlags2::HOST_WRITE
        | vk::AccessFlags2::MEMORY_WRITE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VkImageBarrier {
    pub image: vk::Image,
    pub src: VkAccess,
    pub dst: VkAccess,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_queue_family_index: u32,
    pub dst_queue_family_index: u32,
    pub aspect_mask: vk::ImageAspectFlags,
    pub range: SubresourceRange,
}

impl VkImageBarrier {
    pub fn to_vk(&self) -> vk::ImageMemoryBarrier2 {
        vk::ImageMemoryBarrier2::builder()
            .src_stage_mask(self.src.stage)
            .src_access_mask(self.src.access)
            .dst_stage_mask(self.dst.stage)
            .dst_access_mask(self.dst.access)
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_queue_family_index(self.src_queue_family_index)
            .dst_queue_family_index(self.dst_queue_family_index)
            .image(self.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: self.aspect_mask,
                base_mip_level: self.range.base_mip_level,
                level_count: self.range.level_count,
                base_array_layer: self.range.base_array_layer,
                layer_count: self.range.layer_count,
            })
            .build()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VkBufferBarrier {
    pub buffer: vk::Buffer,
    pub src: VkAccess,
    pub dst: VkAccess,
    pub src_queue_family_index: u32,
    pub dst_queue_family_index: u32,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

impl VkBufferBarrier {
    pub fn to_vk(&self) -> vk::BufferMemoryBarrier2 {
        vk::BufferMemoryBarrier2::builder()
            .src_stage_mask(self.src.stage)
            .src_access_mask(self.src.access)
            .dst_stage_mask(self.dst.stage)
            .dst_access_mask(self.dst.access)
            .src_queue_family_index(self.src_queue_family_index)
            .dst_queue_family_index(self.dst_queue_family_index)
            .buffer(self.buffer)
            .offset(self.offset)
            .size(self.size)
            .build()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VkBarrier {
    Image(VkImageBarrier),
    Buffer(VkBufferBarrier),
}

/// Store op plus the resolve mode of the matching resolve attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VkStoreAction {
    pub store_op: vk::AttachmentStoreOp,
    pub resolve_mode: vk::ResolveModeFlags,
}

pub fn buffer_access(state: BufferStateFlags) -> VkAccess {
    use vk::AccessFlags2 as A;
    use vk::PipelineStageFlags2 as S;
    let table = [
        (BufferStateFlags::INDIRECT_ARGUMENT, VkAccess::new(S::DRAW_INDIRECT, A::INDIRECT_COMMAND_READ)),
        (BufferStateFlags::VERTEX_BUFFER, VkAccess::new(S::VERTEX_ATTRIBUTE_INPUT, A::VERTEX_ATTRIBUTE_READ)),
        (BufferStateFlags::INDEX_BUFFER, VkAccess::new(S::INDEX_INPUT, A::INDEX_READ)),
        (BufferStateFlags::UNIFORM_BUFFER_VS, VkAccess::new(S::VERTEX_SHADER, A::UNIFORM_READ)),
        (BufferStateFlags::SHADER_READ_VS, VkAccess::new(S::VERTEX_SHADER, A::SHADER_STORAGE_READ)),
        (BufferStateFlags::UNIFORM_BUFFER_PS, VkAccess::new(S::FRAGMENT_SHADER, A::UNIFORM_READ)),
        (BufferStateFlags::SHADER_READ_PS, VkAccess::new(S::FRAGMENT_SHADER, A::SHADER_STORAGE_READ)),
        (BufferStateFlags::SHADER_WRITE_PS, VkAccess::new(S::FRAGMENT_SHADER, A::SHADER_STORAGE_WRITE)),
        (BufferStateFlags::UNIFORM_BUFFER_CS, VkAccess::new(S::COMPUTE_SHADER, A::UNIFORM_READ)),
        (BufferStateFlags::SHADER_READ_CS, VkAccess::new(S::COMPUTE_SHADER, A::SHADER_STORAGE_READ)),
        (BufferStateFlags::SHADER_WRITE_CS, VkAccess::new(S::COMPUTE_SHADER, A::SHADER_STORAGE_WRITE)),
        (BufferStateFlags::COPY_DEST, VkAccess::new(S::TRANSFER, A::TRANSFER_WRITE)),
        (BufferStateFlags::COPY_SOURCE, VkAccess::new(S::TRANSFER, A::TRANSFER_READ)),
    ];
    table
        .iter()
        .filter(|(flag, _)| state.contains(*flag))
        .fold(VkAccess::NONE, |acc, (_, a)| acc.merge(*a))
}

pub fn texture_access(state: TextureStateFlags) -> VkAccess {
    use vk::AccessFlags2 as A;
    use vk::PipelineStageFlags2 as S;
    let fragment_tests = S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS;
    let table = [
        (TextureStateFlags::SHADER_READ_VS, VkAccess::new(S::VERTEX_SHADER, A::SHADER_SAMPLED_READ)),
        (TextureStateFlags::SHADER_READ_PS, VkAccess::new(S::FRAGMENT_SHADER, A::SHADER_SAMPLED_READ)),
        (TextureStateFlags::SHADER_WRITE_PS, VkAccess::new(S::FRAGMENT_SHADER, A::SHADER_STORAGE_WRITE)),
        (TextureStateFlags::SHADER_READ_CS, VkAccess::new(S::COMPUTE_SHADER, A::SHADER_SAMPLED_READ)),
        (TextureStateFlags::SHADER_WRITE_CS, VkAccess::new(S::COMPUTE_SHADER, A::SHADER_STORAGE_WRITE)),
        (
            TextureStateFlags::COLOR_ATTACHMENT_READ,
            VkAccess::new(S::COLOR_ATTACHMENT_OUTPUT, A::COLOR_ATTACHMENT_READ),
        ),
        (
            TextureStateFlags::COLOR_ATTACHMENT_WRITE,
            VkAccess::new(S::COLOR_ATTACHMENT_OUTPUT, A::COLOR_ATTACHMENT_WRITE),
        ),
        (
            TextureStateFlags::DEPTH_STENCIL_ATTACHMENT_READ,
            VkAccess::new(fragment_tests, A::DEPTH_STENCIL_ATTACHMENT_READ),
        ),
        (
            TextureStateFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            VkAccess::new(fragment_tests, A::DEPTH_STENCIL_ATTACHMENT_WRITE),
        ),
        (
            TextureStateFlags::RESOLVE_ATTACHMENT,
            VkAccess::new(S::COLOR_ATTACHMENT_OUTPUT, A::COLOR_ATTACHMENT_WRITE),
        ),
        (TextureStateFlags::COPY_DEST, VkAccess::new(S::TRANSFER, A::TRANSFER_WRITE)),
        (TextureStateFlags::COPY_SOURCE, VkAccess::new(S::TRANSFER, A::TRANSFER_READ)),
    ];
    table
        .iter()
        .filter(|(flag, _)| state.contains(*flag))
        .fold(VkAccess::NONE, |acc, (_, a)| acc.merge(*a))
}

const SHADER_READS: TextureStateFlags = TextureStateFlags::SHADER_READ_VS
    .union(TextureStateFlags::SHADER_READ_PS)
    .union(TextureStateFlags::SHADER_READ_CS);

pub fn texture_layout(state: TextureStateFlags) -> vk::ImageLayout {
    if state.is_empty() {
        return vk::ImageLayout::UNDEFINED;
    }
    // Sampling a depth buffer while it is bound read-only.
    if state.contains(TextureStateFlags::DEPTH_STENCIL_ATTACHMENT_READ)
        && (SHADER_READS | TextureStateFlags::DEPTH_STENCIL_ATTACHMENT_READ).contains(state)
    {
        return vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL;
    }
    let candidates = [
        (SHADER_READS, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
        (TextureStateFlags::SHADER_WRITES, vk::ImageLayout::GENERAL),
        (
            TextureStateFlags::COLOR_ATTACHMENT_READ
                | TextureStateFlags::COLOR_ATTACHMENT_WRITE
                | TextureStateFlags::RESOLVE_ATTACHMENT,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ),
        (
            TextureStateFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ),
        (
            TextureStateFlags::DEPTH_STENCIL_ATTACHMENT_READ,
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        ),
        (TextureStateFlags::COPY_DEST, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
        (TextureStateFlags::COPY_SOURCE, vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
        (TextureStateFlags::PRESENT, vk::ImageLayout::PRESENT_SRC_KHR),
    ];
    let mut layouts = candidates
        .iter()
        .filter(|(flags, _)| state.intersects(*flags))
        .map(|(_, layout)| *layout);
    match layouts.next() {
        Some(first) if layouts.all(|l| l == first) => first,
        _ => vk::ImageLayout::GENERAL,
    }
}

pub fn infer_image_aspect(format: Format) -> vk::ImageAspectFlags {
    if format.has_stencil() {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else if format.is_depth_stencil() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Queue family indices and masks adjusted for an ownership transfer.
fn apply_transfer(transfer: Option<QueueTransfer>, src: &mut VkAccess, dst: &mut VkAccess) -> (u32, u32) {
    match transfer {
        None => (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED),
        Some(QueueTransfer::Release { src_family, dst_family }) => {
            *dst = VkAccess::NONE;
            (src_family, dst_family)
        }
        Some(QueueTransfer::Acquire { src_family, dst_family }) => {
            *src = VkAccess::NONE;
            (src_family, dst_family)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Vulkan;

impl Backend for Vulkan {
    const KIND: BackendKind = BackendKind::Vulkan;
    const EXPLICIT_QUEUE_OWNERSHIP: bool = true;

    type Barrier = VkBarrier;
    type NativeFormat = vk::Format;
    type NativeIndexType = vk::IndexType;
    type NativeLoadAction = vk::AttachmentLoadOp;
    type NativeStoreAction = VkStoreAction;
    type NativeTopology = vk::PrimitiveTopology;

    fn encode_format(format: Format) -> Option<vk::Format> {
        Some(match format {
            Format::Unknown => vk::Format::UNDEFINED,
            Format::R8Unorm => vk::Format::R8_UNORM,
            Format::R8Uint => vk::Format::R8_UINT,
            Format::Rg8Unorm => vk::Format::R8G8_UNORM,
            Format::R16Unorm => vk::Format::R16_UNORM,
            Format::R16Uint => vk::Format::R16_UINT,
            Format::R16Float => vk::Format::R16_SFLOAT,
            Format::R32Uint => vk::Format::R32_UINT,
            Format::R32Sint => vk::Format::R32_SINT,
            Format::R32Float => vk::Format::R32_SFLOAT,
            Format::Rg16Float => vk::Format::R16G16_SFLOAT,
            Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
            Format::Rgba8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
            Format::Rgba8Uint => vk::Format::R8G8B8A8_UINT,
            Format::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
            Format::Bgra8UnormSrgb => vk::Format::B8G8R8A8_SRGB,
            Format::Rgb10a2Unorm => vk::Format::A2B10G10R10_UNORM_PACK32,
            Format::Rg11b10Float => vk::Format::B10G11R11_UFLOAT_PACK32,
            Format::Rg32Float => vk::Format::R32G32_SFLOAT,
            Format::Rgba16Unorm => vk::Format::R16G16B16A16_UNORM,
            Format::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
            Format::Rgba32Uint => vk::Format::R32G32B32A32_UINT,
            Format::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
            Format::D16Unorm => vk::Format::D16_UNORM,
            Format::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
            Format::D32Float => vk::Format::D32_SFLOAT,
            Format::D32FloatS8UintX24 => vk::Format::D32_SFLOAT_S8_UINT,
            Format::Bc1RgbaUnorm => vk::Format::BC1_RGBA_UNORM_BLOCK,
            Format::Bc1RgbaUnormSrgb => vk::Format::BC1_RGBA_SRGB_BLOCK,
            Format::Bc3RgbaUnorm => vk::Format::BC3_UNORM_BLOCK,
            Format::Bc5RgUnorm => vk::Format::BC5_UNORM_BLOCK,
            Format::Bc7RgbaUnorm => vk::Format::BC7_UNORM_BLOCK,
            Format::Bc7RgbaUnormSrgb => vk::Format::BC7_SRGB_BLOCK,
        })
    }

    fn encode_index_type(format: Format) -> Option<vk::IndexType> {
        match format {
            Format::R16Uint => Some(vk::IndexType::UINT16),
            Format::R32Uint => Some(vk::IndexType::UINT32),
            _ => None,
        }
    }

    fn encode_load_action(op: LoadOp) -> vk::AttachmentLoadOp {
        match op {
            LoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
            LoadOp::Load => vk::AttachmentLoadOp::LOAD,
            LoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
        }
    }

    fn encode_store_action(op: StoreOp, resolve: bool) -> VkStoreAction {
        VkStoreAction {
            store_op: match op {
                StoreOp::DontCare => vk::AttachmentStoreOp::DONT_CARE,
                StoreOp::Store => vk::AttachmentStoreOp::STORE,
            },
            resolve_mode: if resolve {
                vk::ResolveModeFlags::AVERAGE
            } else {
                vk::ResolveModeFlags::NONE
            },
        }
    }

    fn encode_primitive_topology(topology: PrimitiveTopology) -> vk::PrimitiveTopology {
        match topology {
            PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
            PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
            PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
            PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
            PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        }
    }

    fn supports_window(window: &RawWindowHandle) -> bool {
        matches!(
            window,
            RawWindowHandle::Win32(_)
                | RawWindowHandle::Xlib(_)
                | RawWindowHandle::Xcb(_)
                | RawWindowHandle::Wayland(_)
                | RawWindowHandle::AndroidNdk(_)
                | RawWindowHandle::AppKit(_)
        )
    }

    fn translate_buffer_barrier(_ctx: &BarrierContext, barrier: &ResolvedBufferBarrier, out: &mut Vec<VkBarrier>) {
        let needed = barrier.before.is_write()
            || barrier.after.is_write()
            || barrier.transfer.is_some()
            || barrier.flags.contains(ResourceBarrierFlags::ALIASING);
        if !needed {
            return;
        }
        let mut src = buffer_access(barrier.before).src();
        let mut dst = buffer_access(barrier.after);
        let (src_family, dst_family) = apply_transfer(barrier.transfer, &mut src, &mut dst);
        log::trace!(
            "Vulkan buffer #{}: {:?} -> {:?}",
            barrier.handle,
            barrier.before,
            barrier.after
        );
        out.push(VkBarrier::Buffer(VkBufferBarrier {
            buffer: vk::Buffer::from_raw(barrier.handle),
            src,
            dst,
            src_queue_family_index: src_family,
            dst_queue_family_index: dst_family,
            offset: 0,
            size: vk::WHOLE_SIZE,
        }));
    }

    fn translate_texture_barrier(_ctx: &BarrierContext, barrier: &ResolvedTextureBarrier, out: &mut Vec<VkBarrier>) {
        let discard = barrier
            .flags
            .intersects(ResourceBarrierFlags::DISCARD_CONTENT | ResourceBarrierFlags::ALIASING);

        // Group subresources sharing one transition, keeping first-seen order.
        let mut groups: Vec<(TextureStateFlags, TextureStateFlags, Vec<(u32, u32)>)> = Vec::new();
        for t in &barrier.transitions {
            match groups.iter_mut().find(|(b, a, _)| *b == t.before && *a == t.after) {
                Some((_, _, subs)) => subs.push((t.mip_slice, t.array_slice)),
                None => groups.push((t.before, t.after, vec![(t.mip_slice, t.array_slice)])),
            }
        }

        let aspect_mask = infer_image_aspect(barrier.format);
        for (before, after, subresources) in groups {
            let old_layout = if discard {
                vk::ImageLayout::UNDEFINED
            } else {
                texture_layout(before)
            };
            let new_layout = texture_layout(after);
            let needed = old_layout != new_layout
                || before.is_write()
                || after.is_write()
                || barrier.transfer.is_some()
                || barrier.flags.contains(ResourceBarrierFlags::ALIASING);
            if !needed {
                continue;
            }
            let mut src = texture_access(before).src();
            let mut dst = texture_access(after);
            let (src_family, dst_family) = apply_transfer(barrier.transfer, &mut src, &mut dst);
            for range in merge_subresource_ranges(&subresources) {
                out.push(VkBarrier::Image(VkImageBarrier {
                    image: vk::Image::from_raw(barrier.handle),
                    src,
                    dst,
                    old_layout,
                    new_layout,
                    src_queue_family_index: src_family,
                    dst_queue_family_index: dst_family,
                    aspect_mask,
                    range,
                }));
            }
            log::trace!(
                "Vulkan texture #{}: {:?} -> {:?} over {} subresources",
                barrier.handle,
                old_layout,
                new_layout,
                subresources.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::command::PassKind;
    use crate::backend::tracker::TextureTransition;

    const CTX: BarrierContext = BarrierContext {
        pass: PassKind::Compute,
        queue_family: 0,
    };

    fn image(barriers: &[VkBarrier]) -> Vec<VkImageBarrier> {
        barriers
            .iter()
            .filter_map(|b| match b {
                VkBarrier::Image(i) => Some(*i),
                VkBarrier::Buffer(_) => None,
            })
            .collect()
    }

    #[test]
    fn layouts() {
        assert_eq!(texture_layout(TextureStateFlags::empty()), vk::ImageLayout::UNDEFINED);
        assert_eq!(
            texture_layout(TextureStateFlags::SHADER_READ_PS | TextureStateFlags::SHADER_READ_CS),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(
            texture_layout(TextureStateFlags::DEPTH_STENCIL_ATTACHMENT_READ | TextureStateFlags::SHADER_READ_PS),
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        );
        assert_eq!(
            texture_layout(TextureStateFlags::COPY_SOURCE | TextureStateFlags::SHADER_READ_PS),
            vk::ImageLayout::GENERAL
        );
        assert_eq!(texture_layout(TextureStateFlags::PRESENT), vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn source_access_keeps_only_writes() {
        let a = texture_access(TextureStateFlags::SHADER_READ_CS).src();
        assert_eq!(a.access, vk::AccessFlags2::NONE);
        assert_eq!(a.stage, vk::PipelineStageFlags2::COMPUTE_SHADER);
    }

    #[test]
    fn read_to_read_same_layout_skipped() {
        let barrier = ResolvedBufferBarrier {
            handle: 3,
            size: 64,
            before: BufferStateFlags::SHADER_READ_PS,
            after: BufferStateFlags::SHADER_READ_CS,
            flags: ResourceBarrierFlags::empty(),
            transfer: None,
        };
        let mut out = Vec::new();
        Vulkan::translate_buffer_barrier(&CTX, &barrier, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn mips_merge_into_one_range() {
        let transitions = (1..4)
            .map(|mip| TextureTransition {
                mip_slice: mip,
                array_slice: 0,
                before: TextureStateFlags::empty(),
                after: TextureStateFlags::SHADER_WRITE_CS,
            })
            .collect();
        let barrier = ResolvedTextureBarrier {
            handle: 9,
            format: Format::D32Float,
            mip_levels: 4,
            array_size: 1,
            transitions,
            flags: ResourceBarrierFlags::empty(),
            transfer: None,
        };
        let mut out = Vec::new();
        Vulkan::translate_texture_barrier(&CTX, &barrier, &mut out);
        let images = image(&out);
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].range.base_mip_level, 1);
        assert_eq!(images[0].range.level_count, 3);
        assert_eq!(images[0].aspect_mask, vk::ImageAspectFlags::DEPTH);
        assert_eq!(images[0].new_layout, vk::ImageLayout::GENERAL);
        assert_eq!(images[0].src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(images[0].to_vk().image, vk::Image::from_raw(9));
    }

    #[test]
    fn release_clears_destination_masks() {
        let barrier = ResolvedTextureBarrier {
            handle: 9,
            format: Format::Rgba8Unorm,
            mip_levels: 1,
            array_size: 1,
            transitions: vec![TextureTransition {
                mip_slice: 0,
                array_slice: 0,
                before: TextureStateFlags::COPY_DEST,
                after: TextureStateFlags::SHADER_READ_PS,
            }],
            flags: ResourceBarrierFlags::empty(),
            transfer: Some(QueueTransfer::Release { src_family: 2, dst_family: 0 }),
        };
        let mut out = Vec::new();
        Vulkan::translate_texture_barrier(&CTX, &barrier, &mut out);
        let images = image(&out);
        assert_eq!(images[0].dst, VkAccess::NONE);
        assert_eq!(images[0].src.access, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!((images[0].src_queue_family_index, images[0].dst_queue_family_index), (2, 0));
    }
}
