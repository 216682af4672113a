// Metal translation
//
// Metal tracks hazards per encoder for every resource it sees bound, so most
// barriers only update tracking. The exception is a compute encoder: resources
// reached indirectly (argument buffers) are invisible to the tracker, so a
// transition touching shader writes inside a compute pass becomes
// `memoryBarrierWithResources:`. All such transitions of one
// `resource_barrier` call are coalesced into a single barrier.

use bitflags::bitflags;
use raw_window_handle::RawWindowHandle;

use super::{Backend, BackendKind, BarrierContext};
use crate::backend::command::{LoadOp, PassKind, StoreOp};
use crate::backend::memory::MemoryType;
use crate::backend::pipeline::PrimitiveTopology;
use crate::backend::state::{BufferStateFlags, TextureStateFlags};
use crate::backend::texture::TextureDesc;
use crate::backend::tracker::{ResolvedBufferBarrier, ResolvedTextureBarrier};
use crate::format::Format;

bitflags! {
    /// MTLBarrierScope
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MtlBarrierScope: u64 {
        const BUFFERS = 1 << 0;
        const TEXTURES = 1 << 1;
        const RENDER_TARGETS = 1 << 2;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetalBarrier {
    MemoryBarrier {
        scope: MtlBarrierScope,
        resources: Vec<u64>,
    },
}

/// MTLPixelFormat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MtlPixelFormat(pub u64);

impl MtlPixelFormat {
    pub const INVALID: Self = Self(0);
    pub const R8_UNORM: Self = Self(10);
    pub const R8_UINT: Self = Self(13);
    pub const R16_UNORM: Self = Self(20);
    pub const R16_UINT: Self = Self(23);
    pub const R16_FLOAT: Self = Self(25);
    pub const RG8_UNORM: Self = Self(30);
    pub const R32_UINT: Self = Self(53);
    pub const R32_SINT: Self = Self(54);
    pub const R32_FLOAT: Self = Self(55);
    pub const RG16_FLOAT: Self = Self(65);
    pub const RGBA8_UNORM: Self = Self(70);
    pub const RGBA8_UNORM_SRGB: Self = Self(71);
    pub const RGBA8_UINT: Self = Self(73);
    pub const BGRA8_UNORM: Self = Self(80);
    pub const BGRA8_UNORM_SRGB: Self = Self(81);
    pub const RGB10A2_UNORM: Self = Self(90);
    pub const RG11B10_FLOAT: Self = Self(92);
    pub const RG32_FLOAT: Self = Self(105);
    pub const RGBA16_UNORM: Self = Self(110);
    pub const RGBA16_FLOAT: Self = Self(115);
    pub const RGBA32_UINT: Self = Self(123);
    pub const RGBA32_FLOAT: Self = Self(125);
    pub const BC1_RGBA: Self = Self(130);
    pub const BC1_RGBA_SRGB: Self = Self(131);
    pub const BC3_RGBA: Self = Self(134);
    pub const BC5_RG_UNORM: Self = Self(142);
    pub const BC7_RGBA_UNORM: Self = Self(152);
    pub const BC7_RGBA_UNORM_SRGB: Self = Self(153);
    pub const DEPTH16_UNORM: Self = Self(250);
    pub const DEPTH32_FLOAT: Self = Self(252);
    pub const DEPTH32_FLOAT_STENCIL8: Self = Self(260);
}

/// MTLLoadAction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MtlLoadAction(pub u64);

impl MtlLoadAction {
    pub const DONT_CARE: Self = Self(0);
    pub const LOAD: Self = Self(1);
    pub const CLEAR: Self = Self(2);
}

/// MTLStoreAction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MtlStoreAction(pub u64);

impl MtlStoreAction {
    pub const DONT_CARE: Self = Self(0);
    pub const STORE: Self = Self(1);
    pub const MULTISAMPLE_RESOLVE: Self = Self(2);
    pub const STORE_AND_MULTISAMPLE_RESOLVE: Self = Self(3);
}

/// MTLIndexType
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MtlIndexType(pub u64);

impl MtlIndexType {
    pub const UINT16: Self = Self(0);
    pub const UINT32: Self = Self(1);
}

/// MTLPrimitiveType
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MtlPrimitiveType(pub u64);

impl MtlPrimitiveType {
    pub const POINT: Self = Self(0);
    pub const LINE: Self = Self(1);
    pub const LINE_STRIP: Self = Self(2);
    pub const TRIANGLE: Self = Self(3);
    pub const TRIANGLE_STRIP: Self = Self(4);
}

fn memory_barrier(scope: MtlBarrierScope, resource: u64) -> MetalBarrier {
    MetalBarrier::MemoryBarrier {
        scope,
        resources: vec![resource],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Metal;

impl Backend for Metal {
    const KIND: BackendKind = BackendKind::Metal;
    const EXPLICIT_QUEUE_OWNERSHIP: bool = false;

    type Barrier = MetalBarrier;
    type NativeFormat = MtlPixelFormat;
    type NativeIndexType = MtlIndexType;
    type NativeLoadAction = MtlLoadAction;
    type NativeStoreAction = MtlStoreAction;
    type NativeTopology = MtlPrimitiveType;

    fn encode_format(format: Format) -> Option<MtlPixelFormat> {
        Some(match format {
            Format::Unknown => MtlPixelFormat::INVALID,
            Format::R8Unorm => MtlPixelFormat::R8_UNORM,
            Format::R8Uint => MtlPixelFormat::R8_UINT,
            Format::Rg8Unorm => MtlPixelFormat::RG8_UNORM,
            Format::R16Unorm => MtlPixelFormat::R16_UNORM,
            Format::R16Uint => MtlPixelFormat::R16_UINT,
            Format::R16Float => MtlPixelFormat::R16_FLOAT,
            Format::R32Uint => MtlPixelFormat::R32_UINT,
            Format::R32Sint => MtlPixelFormat::R32_SINT,
            Format::R32Float => MtlPixelFormat::R32_FLOAT,
            Format::Rg16Float => MtlPixelFormat::RG16_FLOAT,
            Format::Rgba8Unorm => MtlPixelFormat::RGBA8_UNORM,
            Format::Rgba8UnormSrgb => MtlPixelFormat::RGBA8_UNORM_SRGB,
            Format::Rgba8Uint => MtlPixelFormat::RGBA8_UINT,
            Format::Bgra8Unorm => MtlPixelFormat::BGRA8_UNORM,
            Format::Bgra8UnormSrgb => MtlPixelFormat::BGRA8_UNORM_SRGB,
            Format::Rgb10a2Unorm => MtlPixelFormat::RGB10A2_UNORM,
            Format::Rg11b10Float => MtlPixelFormat::RG11B10_FLOAT,
            Format::Rg32Float => MtlPixelFormat::RG32_FLOAT,
            Format::Rgba16Unorm => MtlPixelFormat::RGBA16_UNORM,
            Format::Rgba16Float => MtlPixelFormat::RGBA16_FLOAT,
            Format::Rgba32Uint => MtlPixelFormat::RGBA32_UINT,
            Format::Rgba32Float => MtlPixelFormat::RGBA32_FLOAT,
            Format::D16Unorm => MtlPixelFormat::DEPTH16_UNORM,
            // Not available on Apple GPUs.
            Format::D24UnormS8Uint => return None,
            Format::D32Float => MtlPixelFormat::DEPTH32_FLOAT,
            Format::D32FloatS8UintX24 => MtlPixelFormat::DEPTH32_FLOAT_STENCIL8,
            Format::Bc1RgbaUnorm => MtlPixelFormat::BC1_RGBA,
            Format::Bc1RgbaUnormSrgb => MtlPixelFormat::BC1_RGBA_SRGB,
            Format::Bc3RgbaUnorm => MtlPixelFormat::BC3_RGBA,
            Format::Bc5RgUnorm => MtlPixelFormat::BC5_RG_UNORM,
            Format::Bc7RgbaUnorm => MtlPixelFormat::BC7_RGBA_UNORM,
            Format::Bc7RgbaUnormSrgb => MtlPixelFormat::BC7_RGBA_UNORM_SRGB,
        })
    }

    fn encode_index_type(format: Format) -> Option<MtlIndexType> {
        match format {
            Format::R16Uint => Some(MtlIndexType::UINT16),
            Format::R32Uint => Some(MtlIndexType::UINT32),
            _ => None,
        }
    }

    fn encode_load_action(op: LoadOp) -> MtlLoadAction {
        match op {
            LoadOp::DontCare => MtlLoadAction::DONT_CARE,
            LoadOp::Load => MtlLoadAction::LOAD,
            LoadOp::Clear => MtlLoadAction::CLEAR,
        }
    }

    fn encode_store_action(op: StoreOp, resolve: bool) -> MtlStoreAction {
        match (op, resolve) {
            (StoreOp::Store, true) => MtlStoreAction::STORE_AND_MULTISAMPLE_RESOLVE,
            (StoreOp::DontCare, true) => MtlStoreAction::MULTISAMPLE_RESOLVE,
            (StoreOp::Store, false) => MtlStoreAction::STORE,
            (StoreOp::DontCare, false) => MtlStoreAction::DONT_CARE,
        }
    }

    fn encode_primitive_topology(topology: PrimitiveTopology) -> MtlPrimitiveType {
        match topology {
            PrimitiveTopology::PointList => MtlPrimitiveType::POINT,
            PrimitiveTopology::LineList => MtlPrimitiveType::LINE,
            PrimitiveTopology::LineStrip => MtlPrimitiveType::LINE_STRIP,
            PrimitiveTopology::TriangleList => MtlPrimitiveType::TRIANGLE,
            PrimitiveTopology::TriangleStrip => MtlPrimitiveType::TRIANGLE_STRIP,
        }
    }

    /// Shared storage textures are allowed for sampled, non-attachment textures.
    fn supports_texture_memory(memory_type: MemoryType, desc: &TextureDesc) -> bool {
        match memory_type {
            MemoryType::Local => true,
            MemoryType::Upload => !desc.usages.is_render_target() && !desc.format.is_depth_stencil(),
            MemoryType::Readback => false,
        }
    }

    fn supports_window(window: &RawWindowHandle) -> bool {
        matches!(window, RawWindowHandle::AppKit(_) | RawWindowHandle::UiKit(_))
    }

    /// CAMetalLayer drawables.
    fn is_presentable_format(format: Format) -> bool {
        matches!(
            format,
            Format::Bgra8Unorm | Format::Bgra8UnormSrgb | Format::Rgb10a2Unorm | Format::Rgba16Float
        )
    }

    fn translate_buffer_barrier(ctx: &BarrierContext, barrier: &ResolvedBufferBarrier, out: &mut Vec<MetalBarrier>) {
        let writes = (barrier.before | barrier.after).intersects(BufferStateFlags::SHADER_WRITES);
        if ctx.pass == PassKind::Compute && writes {
            out.push(memory_barrier(MtlBarrierScope::BUFFERS, barrier.handle));
        }
    }

    fn translate_texture_barrier(ctx: &BarrierContext, barrier: &ResolvedTextureBarrier, out: &mut Vec<MetalBarrier>) {
        if ctx.pass != PassKind::Compute {
            return;
        }
        let writes = barrier
            .transitions
            .iter()
            .any(|t| (t.before | t.after).intersects(TextureStateFlags::SHADER_WRITES));
        if writes {
            out.push(memory_barrier(MtlBarrierScope::TEXTURES, barrier.handle));
        }
    }

    fn finish_barrier_batch(_ctx: &BarrierContext, out: &mut Vec<MetalBarrier>, batch_start: usize) {
        if out.len() <= batch_start + 1 {
            return;
        }
        let mut scope = MtlBarrierScope::empty();
        let mut resources: Vec<u64> = Vec::new();
        for barrier in out.drain(batch_start..) {
            let MetalBarrier::MemoryBarrier { scope: s, resources: r } = barrier;
            scope |= s;
            for handle in r {
                if !resources.contains(&handle) {
                    resources.push(handle);
                }
            }
        }
        log::trace!("Metal memory barrier over {} resources ({:?})", resources.len(), scope);
        out.push(MetalBarrier::MemoryBarrier { scope, resources });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::state::ResourceBarrierFlags;

    fn buffer(handle: u64, before: BufferStateFlags, after: BufferStateFlags) -> ResolvedBufferBarrier {
        ResolvedBufferBarrier {
            handle,
            size: 16,
            before,
            after,
            flags: ResourceBarrierFlags::empty(),
            transfer: None,
        }
    }

    #[test]
    fn outside_compute_is_bookkeeping_only() {
        let ctx = BarrierContext {
            pass: PassKind::None,
            queue_family: 0,
        };
        let mut out = Vec::new();
        Metal::translate_buffer_barrier(
            &ctx,
            &buffer(1, BufferStateFlags::SHADER_WRITE_CS, BufferStateFlags::SHADER_READ_CS),
            &mut out,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn compute_writes_coalesce() {
        let ctx = BarrierContext {
            pass: PassKind::Compute,
            queue_family: 0,
        };
        let mut out = Vec::new();
        Metal::translate_buffer_barrier(
            &ctx,
            &buffer(1, BufferStateFlags::SHADER_WRITE_CS, BufferStateFlags::SHADER_READ_CS),
            &mut out,
        );
        Metal::translate_buffer_barrier(
            &ctx,
            &buffer(2, BufferStateFlags::SHADER_READ_CS, BufferStateFlags::SHADER_WRITE_CS),
            &mut out,
        );
        Metal::translate_buffer_barrier(
            &ctx,
            &buffer(3, BufferStateFlags::SHADER_READ_CS, BufferStateFlags::UNIFORM_BUFFER_CS),
            &mut out,
        );
        Metal::finish_barrier_batch(&ctx, &mut out, 0);
        assert_eq!(
            out,
            vec![MetalBarrier::MemoryBarrier {
                scope: MtlBarrierScope::BUFFERS,
                resources: vec![1, 2],
            }]
        );
    }

    #[test]
    fn depth24_stencil8_unsupported() {
        assert_eq!(Metal::encode_format(Format::D24UnormS8Uint), None);
        assert_eq!(Metal::encode_format(Format::Bgra8Unorm), Some(MtlPixelFormat::BGRA8_UNORM));
    }
}
