// Backend module - portable RHI objects
//
// Everything here is backend independent; `B: Backend` parameters route the
// native parts (formats, barriers, load/store actions) to `crate::native`.

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod memory;
pub mod pipeline;
pub mod queue;
pub mod shader;
pub mod state;
pub mod swapchain;
pub mod sync;
pub mod texture;
pub mod tracker;

pub use buffer::{Buffer, BufferDesc, BufferMapping, BufferUsageFlags};
pub use command::{
    ColorAttachment, Command, CommandBuffer, DepthStencilAttachment, IndexBufferView, LoadOp, PassKind,
    RenderPassDesc, ResourceRef, ScissorRect, StoreOp, VertexBufferView, Viewport,
};
pub use descriptor::{
    BufferViewDesc, DescriptorSet, DescriptorSetDesc, DescriptorSetLayout, DescriptorSetLayoutBinding,
    DescriptorSetLayoutDesc, DescriptorSetLayoutFlags, DescriptorType, SamplerDesc, ShaderVisibilityFlags,
    TextureViewBinding, WriteDescriptorSet,
};
pub use device::{Device, DeviceObject};
pub use memory::{DeviceMemory, MemoryType, ResourceHeapDesc, ResourceHeapUsageFlags};
pub use pipeline::{
    ComputePipelineStateDesc, GraphicsPipelineStateDesc, PipelineLayout, PipelineLayoutDesc, PipelineLayoutFlags,
    PipelineState, PrimitiveTopology,
};
pub use queue::{CommandQueueDesc, CommandQueueFlags, CommandQueueType};
pub use shader::ShaderBytecode;
pub use state::{
    BufferBarrier, BufferStateFlags, OwnershipTransfer, ResourceBarrierFlags, SubresourceSelector, TextureBarrier,
    TextureStateFlags,
};
pub use swapchain::{SwapChain, SwapChainDesc};
pub use sync::Fence;
pub use texture::{ClearValue, Texture, TextureDesc, TextureType, TextureUsageFlags, TextureView, TextureViewDesc, TextureViewType};
