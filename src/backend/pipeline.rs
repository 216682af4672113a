// Pipeline layouts and pipeline state objects
//
// A pipeline layout is the ordered list of descriptor set layouts a pipeline
// binds. Graphics pipelines capture the fixed-function state and render target
// formats; compute pipelines capture the thread-group size used by dispatch.

use bitflags::bitflags;
use glam::UVec3;
use std::sync::Arc;

use super::descriptor::{CompareFunction, DescriptorSetLayout};
use super::shader::ShaderBytecode;
use crate::error::{RhiError, RhiResult};
use crate::format::Format;
use crate::native::Backend;

pub const MAX_COLOR_ATTACHMENTS: usize = 8;
pub const MAX_DESCRIPTOR_SETS: usize = 8;
pub const MAX_VERTEX_BUFFERS: usize = 16;
/// Upper bound on threads in one group shared by all backends.
pub const MAX_THREADS_PER_GROUP: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PipelineLayoutFlags: u32 {
        /// Graphics pipelines using this layout read vertex buffers.
        const ALLOW_INPUT_LAYOUT = 1 << 0;
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineLayoutDesc {
    pub set_layouts: Vec<Arc<DescriptorSetLayout>>,
    pub flags: PipelineLayoutFlags,
}

#[derive(Debug)]
pub struct PipelineLayout {
    handle: u64,
    desc: PipelineLayoutDesc,
}

impl PipelineLayout {
    pub(crate) fn new(handle: u64, desc: PipelineLayoutDesc) -> RhiResult<Self> {
        if desc.set_layouts.len() > MAX_DESCRIPTOR_SETS {
            return Err(RhiError::bad_arguments(format!(
                "pipeline layout declares {} sets, at most {} are supported",
                desc.set_layouts.len(),
                MAX_DESCRIPTOR_SETS
            )));
        }
        Ok(Self { handle, desc })
    }

    pub fn native_handle(&self) -> u64 {
        self.handle
    }

    pub fn get_desc(&self) -> &PipelineLayoutDesc {
        &self.desc
    }

    pub fn num_sets(&self) -> usize {
        self.desc.set_layouts.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputRate {
    #[default]
    PerVertex,
    PerInstance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBufferLayout {
    pub buffer_slot: u32,
    pub stride: u32,
    pub input_rate: InputRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub buffer_slot: u32,
    pub format: Format,
    pub offset: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputLayoutDesc {
    pub buffers: Vec<VertexBufferLayout>,
    pub attributes: Vec<VertexAttribute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillMode {
    #[default]
    Solid,
    Wireframe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterizerDesc {
    pub fill_mode: FillMode,
    pub cull_mode: CullMode,
    pub front_counter_clockwise: bool,
    pub depth_bias: i32,
    pub depth_bias_clamp: f32,
    pub slope_scaled_depth_bias: f32,
    pub depth_clip: bool,
}

impl Default for RasterizerDesc {
    fn default() -> Self {
        Self {
            fill_mode: FillMode::Solid,
            cull_mode: CullMode::Back,
            front_counter_clockwise: false,
            depth_bias: 0,
            depth_bias_clamp: 0.0,
            slope_scaled_depth_bias: 0.0,
            depth_clip: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthStencilDesc {
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_func: CompareFunction,
    pub stencil_test: bool,
    pub stencil_read_mask: u8,
    pub stencil_write_mask: u8,
}

impl Default for DepthStencilDesc {
    fn default() -> Self {
        Self {
            depth_test: false,
            depth_write: false,
            depth_func: CompareFunction::Less,
            stencil_test: false,
            stencil_read_mask: 0xff,
            stencil_write_mask: 0xff,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GraphicsPipelineStateDesc {
    pub layout: Arc<PipelineLayout>,
    pub vs: ShaderBytecode,
    pub ps: Option<ShaderBytecode>,
    pub input_layout: InputLayoutDesc,
    pub primitive_topology: PrimitiveTopology,
    pub rasterizer: RasterizerDesc,
    pub depth_stencil: DepthStencilDesc,
    pub color_formats: Vec<Format>,
    pub depth_stencil_format: Format,
    pub sample_count: u32,
}

impl GraphicsPipelineStateDesc {
    pub fn new(layout: &Arc<PipelineLayout>, vs: ShaderBytecode, ps: Option<ShaderBytecode>) -> Self {
        Self {
            layout: layout.clone(),
            vs,
            ps,
            input_layout: InputLayoutDesc::default(),
            primitive_topology: PrimitiveTopology::TriangleList,
            rasterizer: RasterizerDesc::default(),
            depth_stencil: DepthStencilDesc::default(),
            color_formats: Vec::new(),
            depth_stencil_format: Format::Unknown,
            sample_count: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ComputePipelineStateDesc {
    pub layout: Arc<PipelineLayout>,
    pub cs: ShaderBytecode,
    pub num_threads_per_group: UVec3,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineKind {
    Graphics {
        primitive_topology: PrimitiveTopology,
        color_formats: Vec<Format>,
        depth_stencil_format: Format,
        sample_count: u32,
        /// Stride of every vertex buffer slot the input layout declares.
        vertex_strides: Vec<(u32, u32)>,
    },
    Compute {
        threads_per_group: UVec3,
    },
}

#[derive(Debug)]
pub struct PipelineState {
    handle: u64,
    layout: Arc<PipelineLayout>,
    kind: PipelineKind,
}

impl PipelineState {
    pub(crate) fn new_graphics<B: Backend>(handle: u64, desc: &GraphicsPipelineStateDesc) -> RhiResult<Self> {
        if desc.vs.is_empty() {
            return Err(RhiError::bad_arguments("graphics pipeline requires a vertex shader"));
        }
        if desc.color_formats.len() > MAX_COLOR_ATTACHMENTS {
            return Err(RhiError::bad_arguments(format!(
                "{} color formats exceed the limit of {}",
                desc.color_formats.len(),
                MAX_COLOR_ATTACHMENTS
            )));
        }
        for &format in &desc.color_formats {
            if format == Format::Unknown || format.is_depth_stencil() || format.is_compressed() {
                return Err(RhiError::bad_arguments(format!("{:?} is not a color attachment format", format)));
            }
            if B::encode_format(format).is_none() {
                return Err(RhiError::not_supported(format!("{:?} has no {:?} equivalent", format, B::KIND)));
            }
        }
        if desc.depth_stencil_format != Format::Unknown {
            if !desc.depth_stencil_format.is_depth_stencil() {
                return Err(RhiError::bad_arguments(format!(
                    "{:?} is not a depth-stencil format",
                    desc.depth_stencil_format
                )));
            }
            if B::encode_format(desc.depth_stencil_format).is_none() {
                return Err(RhiError::not_supported(format!(
                    "{:?} has no {:?} equivalent",
                    desc.depth_stencil_format,
                    B::KIND
                )));
            }
        }
        if !matches!(desc.sample_count, 1 | 2 | 4 | 8) {
            return Err(RhiError::not_supported(format!("sample count {}", desc.sample_count)));
        }

        let input = &desc.input_layout;
        if input.buffers.len() > MAX_VERTEX_BUFFERS {
            return Err(RhiError::bad_arguments(format!(
                "{} vertex buffer slots exceed the limit of {}",
                input.buffers.len(),
                MAX_VERTEX_BUFFERS
            )));
        }
        if !input.attributes.is_empty()
            && !desc.layout.get_desc().flags.contains(PipelineLayoutFlags::ALLOW_INPUT_LAYOUT)
        {
            return Err(RhiError::bad_arguments("pipeline layout does not allow an input layout"));
        }
        for attribute in &input.attributes {
            if !input.buffers.iter().any(|b| b.buffer_slot == attribute.buffer_slot) {
                return Err(RhiError::bad_arguments(format!(
                    "attribute at location {} reads undeclared buffer slot {}",
                    attribute.location, attribute.buffer_slot
                )));
            }
            if B::encode_format(attribute.format).is_none() {
                return Err(RhiError::not_supported(format!(
                    "vertex format {:?} on {:?}",
                    attribute.format,
                    B::KIND
                )));
            }
        }

        Ok(Self {
            handle,
            layout: desc.layout.clone(),
            kind: PipelineKind::Graphics {
                primitive_topology: desc.primitive_topology,
                color_formats: desc.color_formats.clone(),
                depth_stencil_format: desc.depth_stencil_format,
                sample_count: desc.sample_count,
                vertex_strides: input.buffers.iter().map(|b| (b.buffer_slot, b.stride)).collect(),
            },
        })
    }

    pub(crate) fn new_compute(handle: u64, desc: &ComputePipelineStateDesc) -> RhiResult<Self> {
        if desc.cs.is_empty() {
            return Err(RhiError::bad_arguments("compute pipeline requires a compute shader"));
        }
        let threads = desc.num_threads_per_group;
        if threads.min_element() == 0 {
            return Err(RhiError::bad_arguments(format!("thread group size {} has a zero dimension", threads)));
        }
        // An overflowing product is over the limit too.
        let total = threads
            .x
            .checked_mul(threads.y)
            .and_then(|xy| xy.checked_mul(threads.z));
        if total.map_or(true, |total| total > MAX_THREADS_PER_GROUP) {
            return Err(RhiError::not_supported(format!(
                "thread group size {} exceeds {} threads",
                threads, MAX_THREADS_PER_GROUP
            )));
        }
        Ok(Self {
            handle,
            layout: desc.layout.clone(),
            kind: PipelineKind::Compute {
                threads_per_group: threads,
            },
        })
    }

    pub fn native_handle(&self) -> u64 {
        self.handle
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }

    pub fn kind(&self) -> &PipelineKind {
        &self.kind
    }

    pub fn is_compute(&self) -> bool {
        matches!(self.kind, PipelineKind::Compute { .. })
    }

    pub fn threads_per_group(&self) -> Option<UVec3> {
        match self.kind {
            PipelineKind::Compute { threads_per_group } => Some(threads_per_group),
            PipelineKind::Graphics { .. } => None,
        }
    }

    pub fn primitive_topology(&self) -> Option<PrimitiveTopology> {
        match self.kind {
            PipelineKind::Graphics { primitive_topology, .. } => Some(primitive_topology),
            PipelineKind::Compute { .. } => None,
        }
    }
}
