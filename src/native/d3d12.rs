// Direct3D 12 translation
//
// Portable states map onto D3D12_RESOURCE_STATES. Transitions are emitted
// only when the native states differ; UAV-to-UAV becomes a UAV barrier, and a
// transition shared by every subresource collapses to one barrier on
// D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES.

use bitflags::bitflags;
use raw_window_handle::RawWindowHandle;

use super::{Backend, BackendKind, BarrierContext};
use crate::backend::command::{LoadOp, StoreOp};
use crate::backend::pipeline::PrimitiveTopology;
use crate::backend::state::{BufferStateFlags, ResourceBarrierFlags, TextureStateFlags};
use crate::backend::tracker::{ResolvedBufferBarrier, ResolvedTextureBarrier};
use crate::format::Format;

pub const ALL_SUBRESOURCES: u32 = 0xffff_ffff;

bitflags! {
    /// D3D12_RESOURCE_STATES
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ResourceStates: u32 {
        const COMMON = 0;
        const VERTEX_AND_CONSTANT_BUFFER = 0x1;
        const INDEX_BUFFER = 0x2;
        const RENDER_TARGET = 0x4;
        const UNORDERED_ACCESS = 0x8;
        const DEPTH_WRITE = 0x10;
        const DEPTH_READ = 0x20;
        const NON_PIXEL_SHADER_RESOURCE = 0x40;
        const PIXEL_SHADER_RESOURCE = 0x80;
        const INDIRECT_ARGUMENT = 0x200;
        const COPY_DEST = 0x400;
        const COPY_SOURCE = 0x800;
        const RESOLVE_DEST = 0x1000;
        const RESOLVE_SOURCE = 0x2000;
        const GENERIC_READ = 0xac3;
        const PRESENT = 0;
    }
}

/// D3D12_RESOURCE_BARRIER plus the discard operations that go with them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum D3d12Barrier {
    Transition {
        resource: u64,
        subresource: u32,
        before: ResourceStates,
        after: ResourceStates,
    },
    Uav {
        resource: u64,
    },
    Aliasing {
        before: Option<u64>,
        after: u64,
    },
    /// ID3D12GraphicsCommandList::DiscardResource
    Discard {
        resource: u64,
        subresource: u32,
    },
}

/// DXGI_FORMAT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DxgiFormat(pub u32);

impl DxgiFormat {
    pub const UNKNOWN: Self = Self(0);
    pub const R32G32B32A32_FLOAT: Self = Self(2);
    pub const R32G32B32A32_UINT: Self = Self(3);
    pub const R16G16B16A16_FLOAT: Self = Self(10);
    pub const R16G16B16A16_UNORM: Self = Self(11);
    pub const R32G32_FLOAT: Self = Self(16);
    pub const D32_FLOAT_S8X24_UINT: Self = Self(20);
    pub const R10G10B10A2_UNORM: Self = Self(24);
    pub const R11G11B10_FLOAT: Self = Self(26);
    pub const R8G8B8A8_UNORM: Self = Self(28);
    pub const R8G8B8A8_UNORM_SRGB: Self = Self(29);
    pub const R8G8B8A8_UINT: Self = Self(30);
    pub const R16G16_FLOAT: Self = Self(34);
    pub const D32_FLOAT: Self = Self(40);
    pub const R32_FLOAT: Self = Self(41);
    pub const R32_UINT: Self = Self(42);
    pub const R32_SINT: Self = Self(43);
    pub const D24_UNORM_S8_UINT: Self = Self(45);
    pub const R8G8_UNORM: Self = Self(49);
    pub const R16_FLOAT: Self = Self(54);
    pub const D16_UNORM: Self = Self(55);
    pub const R16_UNORM: Self = Self(56);
    pub const R16_UINT: Self = Self(57);
    pub const R8_UNORM: Self = Self(61);
    pub const R8_UINT: Self = Self(62);
    pub const BC1_UNORM: Self = Self(71);
    pub const BC1_UNORM_SRGB: Self = Self(72);
    pub const BC3_UNORM: Self = Self(77);
    pub const BC5_UNORM: Self = Self(83);
    pub const B8G8R8A8_UNORM: Self = Self(87);
    pub const B8G8R8A8_UNORM_SRGB: Self = Self(91);
    pub const BC7_UNORM: Self = Self(98);
    pub const BC7_UNORM_SRGB: Self = Self(99);
}

/// D3D12_RENDER_PASS_BEGINNING_ACCESS_TYPE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum D3d12BeginningAccess {
    Discard,
    Preserve,
    Clear,
}

/// D3D12_RENDER_PASS_ENDING_ACCESS_TYPE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum D3d12EndingAccess {
    Discard,
    Preserve,
    Resolve { preserve_source: bool },
}

/// D3D_PRIMITIVE_TOPOLOGY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct D3dPrimitiveTopology(pub u32);

impl D3dPrimitiveTopology {
    pub const POINTLIST: Self = Self(1);
    pub const LINELIST: Self = Self(2);
    pub const LINESTRIP: Self = Self(3);
    pub const TRIANGLELIST: Self = Self(4);
    pub const TRIANGLESTRIP: Self = Self(5);
}

pub fn encode_buffer_state(state: BufferStateFlags) -> ResourceStates {
    if state == BufferStateFlags::GENERAL_READ {
        return ResourceStates::GENERIC_READ;
    }
    let mut native = ResourceStates::COMMON;
    if state.contains(BufferStateFlags::INDIRECT_ARGUMENT) {
        native |= ResourceStates::INDIRECT_ARGUMENT;
    }
    if state.intersects(
        BufferStateFlags::VERTEX_BUFFER
            | BufferStateFlags::UNIFORM_BUFFER_VS
            | BufferStateFlags::UNIFORM_BUFFER_PS
            | BufferStateFlags::UNIFORM_BUFFER_CS,
    ) {
        native |= ResourceStates::VERTEX_AND_CONSTANT_BUFFER;
    }
    if state.contains(BufferStateFlags::INDEX_BUFFER) {
        native |= ResourceStates::INDEX_BUFFER;
    }
    if state.intersects(BufferStateFlags::SHADER_READ_VS | BufferStateFlags::SHADER_READ_CS) {
        native |= ResourceStates::NON_PIXEL_SHADER_RESOURCE;
    }
    if state.contains(BufferStateFlags::SHADER_READ_PS) {
        native |= ResourceStates::PIXEL_SHADER_RESOURCE;
    }
    if state.intersects(BufferStateFlags::SHADER_WRITES) {
        native |= ResourceStates::UNORDERED_ACCESS;
    }
    if state.contains(BufferStateFlags::COPY_DEST) {
        native |= ResourceStates::COPY_DEST;
    }
    if state.contains(BufferStateFlags::COPY_SOURCE) {
        native |= ResourceStates::COPY_SOURCE;
    }
    native
}

pub fn encode_texture_state(state: TextureStateFlags) -> ResourceStates {
    let mut native = ResourceStates::COMMON;
    if state.intersects(TextureStateFlags::SHADER_READ_VS | TextureStateFlags::SHADER_READ_CS) {
        native |= ResourceStates::NON_PIXEL_SHADER_RESOURCE;
    }
    if state.contains(TextureStateFlags::SHADER_READ_PS) {
        native |= ResourceStates::PIXEL_SHADER_RESOURCE;
    }
    if state.intersects(TextureStateFlags::SHADER_WRITES) {
        native |= ResourceStates::UNORDERED_ACCESS;
    }
    if state.intersects(TextureStateFlags::COLOR_ATTACHMENT_READ | TextureStateFlags::COLOR_ATTACHMENT_WRITE) {
        native |= ResourceStates::RENDER_TARGET;
    }
    // DEPTH_WRITE already implies read access and must not be combined with DEPTH_READ.
    if state.contains(TextureStateFlags::DEPTH_STENCIL_ATTACHMENT_WRITE) {
        native |= ResourceStates::DEPTH_WRITE;
    } else if state.contains(TextureStateFlags::DEPTH_STENCIL_ATTACHMENT_READ) {
        native |= ResourceStates::DEPTH_READ;
    }
    if state.contains(TextureStateFlags::RESOLVE_ATTACHMENT) {
        native |= ResourceStates::RESOLVE_DEST;
    }
    if state.contains(TextureStateFlags::COPY_DEST) {
        native |= ResourceStates::COPY_DEST;
    }
    if state.contains(TextureStateFlags::COPY_SOURCE) {
        native |= ResourceStates::COPY_SOURCE;
    }
    native
}

fn is_uav_to_uav(before: ResourceStates, after: ResourceStates) -> bool {
    before.contains(ResourceStates::UNORDERED_ACCESS) && after.contains(ResourceStates::UNORDERED_ACCESS)
}

fn discards(flags: ResourceBarrierFlags, after: ResourceStates) -> bool {
    flags.contains(ResourceBarrierFlags::DISCARD_CONTENT)
        && after.intersects(ResourceStates::RENDER_TARGET | ResourceStates::DEPTH_WRITE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct D3D12;

impl Backend for D3D12 {
    const KIND: BackendKind = BackendKind::D3D12;
    const EXPLICIT_QUEUE_OWNERSHIP: bool = false;

    type Barrier = D3d12Barrier;
    type NativeFormat = DxgiFormat;
    type NativeIndexType = DxgiFormat;
    type NativeLoadAction = D3d12BeginningAccess;
    type NativeStoreAction = D3d12EndingAccess;
    type NativeTopology = D3dPrimitiveTopology;

    fn encode_format(format: Format) -> Option<DxgiFormat> {
        Some(match format {
            Format::Unknown => DxgiFormat::UNKNOWN,
            Format::R8Unorm => DxgiFormat::R8_UNORM,
            Format::R8Uint => DxgiFormat::R8_UINT,
            Format::Rg8Unorm => DxgiFormat::R8G8_UNORM,
            Format::R16Unorm => DxgiFormat::R16_UNORM,
            Format::R16Uint => DxgiFormat::R16_UINT,
            Format::R16Float => DxgiFormat::R16_FLOAT,
            Format::R32Uint => DxgiFormat::R32_UINT,
            Format::R32Sint => DxgiFormat::R32_SINT,
            Format::R32Float => DxgiFormat::R32_FLOAT,
            Format::Rg16Float => DxgiFormat::R16G16_FLOAT,
            Format::Rgba8Unorm => DxgiFormat::R8G8B8A8_UNORM,
            Format::Rgba8UnormSrgb => DxgiFormat::R8G8B8A8_UNORM_SRGB,
            Format::Rgba8Uint => DxgiFormat::R8G8B8A8_UINT,
            Format::Bgra8Unorm => DxgiFormat::B8G8R8A8_UNORM,
            Format::Bgra8UnormSrgb => DxgiFormat::B8G8R8A8_UNORM_SRGB,
            Format::Rgb10a2Unorm => DxgiFormat::R10G10B10A2_UNORM,
            Format::Rg11b10Float => DxgiFormat::R11G11B10_FLOAT,
            Format::Rg32Float => DxgiFormat::R32G32_FLOAT,
            Format::Rgba16Unorm => DxgiFormat::R16G16B16A16_UNORM,
            Format::Rgba16Float => DxgiFormat::R16G16B16A16_FLOAT,
            Format::Rgba32Uint => DxgiFormat::R32G32B32A32_UINT,
            Format::Rgba32Float => DxgiFormat::R32G32B32A32_FLOAT,
            Format::D16Unorm => DxgiFormat::D16_UNORM,
            Format::D24UnormS8Uint => DxgiFormat::D24_UNORM_S8_UINT,
            Format::D32Float => DxgiFormat::D32_FLOAT,
            Format::D32FloatS8UintX24 => DxgiFormat::D32_FLOAT_S8X24_UINT,
            Format::Bc1RgbaUnorm => DxgiFormat::BC1_UNORM,
            Format::Bc1RgbaUnormSrgb => DxgiFormat::BC1_UNORM_SRGB,
            Format::Bc3RgbaUnorm => DxgiFormat::BC3_UNORM,
            Format::Bc5RgUnorm => DxgiFormat::BC5_UNORM,
            Format::Bc7RgbaUnorm => DxgiFormat::BC7_UNORM,
            Format::Bc7RgbaUnormSrgb => DxgiFormat::BC7_UNORM_SRGB,
        })
    }

    fn encode_index_type(format: Format) -> Option<DxgiFormat> {
        match format {
            Format::R16Uint => Some(DxgiFormat::R16_UINT),
            Format::R32Uint => Some(DxgiFormat::R32_UINT),
            _ => None,
        }
    }

    fn encode_load_action(op: LoadOp) -> D3d12BeginningAccess {
        match op {
            LoadOp::DontCare => D3d12BeginningAccess::Discard,
            LoadOp::Load => D3d12BeginningAccess::Preserve,
            LoadOp::Clear => D3d12BeginningAccess::Clear,
        }
    }

    fn encode_store_action(op: StoreOp, resolve: bool) -> D3d12EndingAccess {
        match (op, resolve) {
            (StoreOp::Store, true) => D3d12EndingAccess::Resolve { preserve_source: true },
            (StoreOp::DontCare, true) => D3d12EndingAccess::Resolve { preserve_source: false },
            (StoreOp::Store, false) => D3d12EndingAccess::Preserve,
            (StoreOp::DontCare, false) => D3d12EndingAccess::Discard,
        }
    }

    fn encode_primitive_topology(topology: PrimitiveTopology) -> D3dPrimitiveTopology {
        match topology {
            PrimitiveTopology::PointList => D3dPrimitiveTopology::POINTLIST,
            PrimitiveTopology::LineList => D3dPrimitiveTopology::LINELIST,
            PrimitiveTopology::LineStrip => D3dPrimitiveTopology::LINESTRIP,
            PrimitiveTopology::TriangleList => D3dPrimitiveTopology::TRIANGLELIST,
            PrimitiveTopology::TriangleStrip => D3dPrimitiveTopology::TRIANGLESTRIP,
        }
    }

    fn supports_window(window: &RawWindowHandle) -> bool {
        matches!(window, RawWindowHandle::Win32(_))
    }

    /// Flip-model swap chains reject sRGB buffer formats.
    fn is_presentable_format(format: Format) -> bool {
        matches!(
            format,
            Format::Bgra8Unorm | Format::Rgba8Unorm | Format::Rgb10a2Unorm | Format::Rgba16Float
        )
    }

    fn translate_buffer_barrier(_ctx: &BarrierContext, barrier: &ResolvedBufferBarrier, out: &mut Vec<D3d12Barrier>) {
        if barrier.flags.contains(ResourceBarrierFlags::ALIASING) {
            out.push(D3d12Barrier::Aliasing {
                before: None,
                after: barrier.handle,
            });
        }
        let before = encode_buffer_state(barrier.before);
        let after = encode_buffer_state(barrier.after);
        if before != after {
            out.push(D3d12Barrier::Transition {
                resource: barrier.handle,
                subresource: ALL_SUBRESOURCES,
                before,
                after,
            });
        } else if is_uav_to_uav(before, after) {
            out.push(D3d12Barrier::Uav { resource: barrier.handle });
        }
        log::trace!("D3D12 buffer #{}: {:?} -> {:?}", barrier.handle, before, after);
    }

    fn translate_texture_barrier(_ctx: &BarrierContext, barrier: &ResolvedTextureBarrier, out: &mut Vec<D3d12Barrier>) {
        if barrier.flags.contains(ResourceBarrierFlags::ALIASING) {
            out.push(D3d12Barrier::Aliasing {
                before: None,
                after: barrier.handle,
            });
        }

        let native: Vec<(u32, ResourceStates, ResourceStates)> = barrier
            .transitions
            .iter()
            .map(|t| {
                (
                    t.mip_slice + t.array_slice * barrier.mip_levels,
                    encode_texture_state(t.before),
                    encode_texture_state(t.after),
                )
            })
            .collect();

        let uniform = native
            .first()
            .map(|&(_, b, a)| native.iter().all(|&(_, nb, na)| nb == b && na == a))
            .unwrap_or(false);

        let targets: Vec<(u32, ResourceStates, ResourceStates)> =
            if uniform && barrier.covers_all_subresources() && native.len() > 1 {
                vec![(ALL_SUBRESOURCES, native[0].1, native[0].2)]
            } else {
                native
            };

        let mut needs_uav = false;
        for &(subresource, before, after) in &targets {
            if before != after {
                out.push(D3d12Barrier::Transition {
                    resource: barrier.handle,
                    subresource,
                    before,
                    after,
                });
            } else if is_uav_to_uav(before, after) {
                needs_uav = true;
            }
        }
        // UAV barriers always cover the whole resource.
        if needs_uav {
            out.push(D3d12Barrier::Uav { resource: barrier.handle });
        }
        for &(subresource, _, after) in &targets {
            if discards(barrier.flags, after) {
                out.push(D3d12Barrier::Discard {
                    resource: barrier.handle,
                    subresource,
                });
            }
        }
        log::trace!(
            "D3D12 texture #{}: {} subresource transitions",
            barrier.handle,
            targets.len()
        );
    }
}
