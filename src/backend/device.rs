// Device - owner of queues, the memory allocator and every creation API
//
// Responsibilities:
// - Start one worker per configured queue
// - Allocate committed and placed resources against the memory budget
// - Validate descriptors against backend capabilities
//
// Creation APIs take `&self` and are safe to call from many threads.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use raw_window_handle::RawWindowHandle;

use super::buffer::{Buffer, BufferDesc, BufferUsageFlags};
use super::command::CommandBuffer;
use super::descriptor::{DescriptorSet, DescriptorSetDesc, DescriptorSetLayout, DescriptorSetLayoutDesc, Sampler};
use super::memory::{
    DeviceMemory, HeapDenyFlags, MemoryAllocator, MemoryBudget, MemoryType, ResourceHeapDesc,
    ResourceHeapUsageFlags, BUFFER_ALIGNMENT, DEFAULT_PLACEMENT_ALIGNMENT, MSAA_PLACEMENT_ALIGNMENT,
};
use super::pipeline::{ComputePipelineStateDesc, GraphicsPipelineStateDesc, PipelineLayout, PipelineLayoutDesc, PipelineState};
use super::queue::{CommandQueue, CommandQueueDesc, CommandQueueFlags};
use super::swapchain::{SwapChain, SwapChainDesc};
use super::sync::Fence;
use super::texture::{compute_footprints, ClearValue, Texture, TextureDesc, TextureType, TextureUsageFlags, TextureView};
use crate::config::Config;
use crate::error::{RhiError, RhiResult};
use crate::format::Format;
use crate::native::Backend;

/// State shared with objects that create sub-objects after device creation
/// (descriptor sets create samplers, textures create views).
#[derive(Debug)]
pub(crate) struct DeviceContext {
    next_id: AtomicU64,
    allocator: Arc<MemoryAllocator>,
    validate: bool,
}

impl DeviceContext {
    pub fn new(allocator: Arc<MemoryAllocator>, validate: bool) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            allocator,
            validate,
        }
    }

    /// Native handles are never zero.
    pub fn next_object_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn allocator(&self) -> &Arc<MemoryAllocator> {
        &self.allocator
    }

    pub fn validate(&self) -> bool {
        self.validate
    }
}

/// Strong reference to any device object, used by retain lists.
#[derive(Debug, Clone)]
pub enum DeviceObject {
    Buffer(Arc<Buffer>),
    Texture(Arc<Texture>),
    TextureView(Arc<TextureView>),
    DeviceMemory(Arc<DeviceMemory>),
    Sampler(Arc<Sampler>),
    DescriptorSetLayout(Arc<DescriptorSetLayout>),
    DescriptorSet(Arc<DescriptorSet>),
    PipelineLayout(Arc<PipelineLayout>),
    PipelineState(Arc<PipelineState>),
    Fence(Arc<Fence>),
}

macro_rules! device_object_from {
    ($($variant:ident),+ $(,)?) => {
        $(
            impl From<Arc<$variant>> for DeviceObject {
                fn from(object: Arc<$variant>) -> Self {
                    DeviceObject::$variant(object)
                }
            }

            impl From<&Arc<$variant>> for DeviceObject {
                fn from(object: &Arc<$variant>) -> Self {
                    DeviceObject::$variant(object.clone())
                }
            }
        )+
    };
}

device_object_from!(
    Buffer,
    Texture,
    TextureView,
    DeviceMemory,
    Sampler,
    DescriptorSetLayout,
    DescriptorSet,
    PipelineLayout,
    PipelineState,
    Fence,
);

pub struct Device<B: Backend> {
    ctx: Arc<DeviceContext>,
    adapter_name: String,
    queues: Vec<CommandQueue<B>>,
    queue_families: Vec<u32>,
    shutdown: Arc<AtomicBool>,
    _backend: PhantomData<B>,
}

impl<B: Backend> Device<B> {
    pub fn new(config: &Config) -> RhiResult<Arc<Self>> {
        if config.device.backend != B::KIND {
            log::warn!(
                "Configured backend {:?} differs from requested {:?}",
                config.device.backend,
                B::KIND
            );
        }
        if config.queues.is_empty() {
            return Err(RhiError::bad_arguments("device needs at least one queue"));
        }

        let validate = cfg!(debug_assertions) && config.device.validation;
        log::info!(
            "Creating {:?} device '{}' (validation: {}, {} queues)",
            B::KIND,
            config.device.adapter_name,
            validate,
            config.queues.len()
        );

        let allocator = Arc::new(MemoryAllocator::new(MemoryBudget::from(&config.memory)));
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut queues = Vec::with_capacity(config.queues.len());
        for (index, queue) in config.queues.iter().enumerate() {
            let mut flags = CommandQueueFlags::empty();
            if queue.presenting {
                flags |= CommandQueueFlags::PRESENTING;
            }
            let desc = CommandQueueDesc::new(queue.ty, flags);
            queues.push(CommandQueue::spawn(index as u32, desc, shutdown.clone())?);
        }
        let queue_families = queues.iter().map(|q| q.desc().family_index()).collect();

        Ok(Arc::new(Self {
            ctx: Arc::new(DeviceContext::new(allocator, validate)),
            adapter_name: config.device.adapter_name.clone(),
            queues,
            queue_families,
            shutdown,
            _backend: PhantomData,
        }))
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    pub fn validation_enabled(&self) -> bool {
        self.ctx.validate()
    }

    pub fn memory_used(&self, memory_type: MemoryType) -> u64 {
        self.ctx.allocator().used(memory_type)
    }

    pub fn get_num_command_queues(&self) -> u32 {
        self.queues.len() as u32
    }

    pub fn get_command_queue_desc(&self, queue_index: u32) -> Option<CommandQueueDesc> {
        self.queues.get(queue_index as usize).map(|q| *q.desc())
    }

    pub(crate) fn queue(&self, queue_index: u32) -> Option<&CommandQueue<B>> {
        self.queues.get(queue_index as usize)
    }

    /// Family of every queue, by queue index.
    pub(crate) fn queue_families(&self) -> &[u32] {
        &self.queue_families
    }

    // -- memory and resources -----------------------------------------------

    pub fn new_device_memory(&self, desc: &ResourceHeapDesc) -> RhiResult<Arc<DeviceMemory>> {
        if desc.size == 0 || desc.usages.is_empty() {
            return Err(RhiError::bad_arguments(format!(
                "device memory needs a size and usages, got {} bytes / {:?}",
                desc.size, desc.usages
            )));
        }
        let alignment = if desc.usages.contains(ResourceHeapUsageFlags::TEXTURE_MSAA) {
            MSAA_PLACEMENT_ALIGNMENT
        } else {
            DEFAULT_PLACEMENT_ALIGNMENT
        };
        DeviceMemory::allocate(
            self.ctx.allocator(),
            self.ctx.next_object_id(),
            desc.memory_type,
            desc.size,
            alignment,
            desc.usages,
        )
    }

    pub fn new_buffer(&self, memory_type: MemoryType, desc: &BufferDesc) -> RhiResult<Arc<Buffer>> {
        Self::validate_buffer_desc(memory_type, desc)?;
        let size = desc.size.div_ceil(BUFFER_ALIGNMENT) * BUFFER_ALIGNMENT;
        let memory = DeviceMemory::allocate(
            self.ctx.allocator(),
            self.ctx.next_object_id(),
            memory_type,
            size,
            BUFFER_ALIGNMENT,
            ResourceHeapUsageFlags::BUFFER,
        )?;
        let buffer = Buffer::new(self.ctx.next_object_id(), *desc, memory, 0, false);
        log::debug!(
            "New buffer #{}: {} bytes of {:?} memory, {:?}",
            buffer.native_handle(),
            desc.size,
            memory_type,
            desc.usages
        );
        Ok(Arc::new(buffer))
    }

    pub fn new_aliasing_buffer(
        &self,
        memory: &Arc<DeviceMemory>,
        offset: u64,
        desc: &BufferDesc,
    ) -> RhiResult<Arc<Buffer>> {
        Self::validate_buffer_desc(memory.memory_type(), desc)?;
        if memory.deny_flags().contains(HeapDenyFlags::DENY_BUFFERS) {
            return Err(RhiError::bad_arguments(format!(
                "memory #{} ({:?}) cannot hold buffers",
                memory.id(),
                memory.usages()
            )));
        }
        memory.check_placement(offset, desc.size)?;
        let buffer = Buffer::new(self.ctx.next_object_id(), *desc, memory.clone(), offset, true);
        log::debug!(
            "New aliasing buffer #{} in memory #{} at {}",
            buffer.native_handle(),
            memory.id(),
            offset
        );
        Ok(Arc::new(buffer))
    }

    pub fn new_texture(
        &self,
        memory_type: MemoryType,
        desc: &TextureDesc,
        clear_value: Option<ClearValue>,
    ) -> RhiResult<Arc<Texture>> {
        let desc = self.validate_texture_desc(memory_type, desc, clear_value)?;
        let (_, size) = compute_footprints(&desc);
        let (alignment, usages) = Self::texture_heap(&desc);
        let memory = DeviceMemory::allocate(
            self.ctx.allocator(),
            self.ctx.next_object_id(),
            memory_type,
            size,
            alignment,
            usages,
        )?;
        let texture = Texture::new(self.ctx.next_object_id(), desc, memory, 0, false, clear_value);
        log::debug!(
            "New texture #{}: {:?} {}x{}x{} [{} mips, {} slices] in {:?} memory",
            texture.native_handle(),
            desc.format,
            desc.width,
            desc.height,
            desc.depth,
            desc.mip_levels,
            desc.array_size,
            memory_type
        );
        Ok(Arc::new(texture))
    }

    pub fn new_aliasing_texture(
        &self,
        memory: &Arc<DeviceMemory>,
        offset: u64,
        desc: &TextureDesc,
        clear_value: Option<ClearValue>,
    ) -> RhiResult<Arc<Texture>> {
        let desc = self.validate_texture_desc(memory.memory_type(), desc, clear_value)?;
        let (_, required) = Self::texture_heap(&desc);
        let deny = memory.deny_flags();
        let denied = if required.contains(ResourceHeapUsageFlags::TEXTURE_RT_DS) {
            deny.contains(HeapDenyFlags::DENY_RT_DS_TEXTURES)
        } else {
            deny.contains(HeapDenyFlags::DENY_NON_RT_DS_TEXTURES)
        };
        let msaa_denied = desc.sample_count > 1 && !memory.usages().contains(ResourceHeapUsageFlags::TEXTURE_MSAA);
        if denied || msaa_denied {
            return Err(RhiError::bad_arguments(format!(
                "memory #{} ({:?}) cannot hold texture with usages {:?} and {} samples",
                memory.id(),
                memory.usages(),
                desc.usages,
                desc.sample_count
            )));
        }
        let (_, size) = compute_footprints(&desc);
        memory.check_placement(offset, size)?;
        let texture = Texture::new(self.ctx.next_object_id(), desc, memory.clone(), offset, true, clear_value);
        log::debug!(
            "New aliasing texture #{} in memory #{} at {}",
            texture.native_handle(),
            memory.id(),
            offset
        );
        Ok(Arc::new(texture))
    }

    fn validate_buffer_desc(memory_type: MemoryType, desc: &BufferDesc) -> RhiResult<()> {
        if desc.size == 0 {
            return Err(RhiError::bad_arguments("buffer size must be non-zero"));
        }
        let unsupported = match memory_type {
            MemoryType::Local => BufferUsageFlags::empty(),
            MemoryType::Upload => BufferUsageFlags::READ_WRITE_BUFFER | BufferUsageFlags::COPY_DEST,
            MemoryType::Readback => !BufferUsageFlags::COPY_DEST,
        };
        if desc.usages.intersects(unsupported) {
            return Err(RhiError::not_supported(format!(
                "buffer usages {:?} in {:?} memory",
                desc.usages & unsupported,
                memory_type
            )));
        }
        Ok(())
    }

    /// Checks `desc` and resolves a zero mip count to the full chain.
    fn validate_texture_desc(
        &self,
        memory_type: MemoryType,
        desc: &TextureDesc,
        clear_value: Option<ClearValue>,
    ) -> RhiResult<TextureDesc> {
        let mut desc = *desc;
        if desc.width == 0 || desc.height == 0 || desc.depth == 0 || desc.array_size == 0 {
            return Err(RhiError::bad_arguments(format!(
                "texture extent {}x{}x{} with {} slices",
                desc.width, desc.height, desc.depth, desc.array_size
            )));
        }
        if desc.format == Format::Unknown {
            return Err(RhiError::bad_arguments("texture format must be known"));
        }
        if desc.mip_levels == 0 {
            desc.mip_levels = desc.max_mip_levels();
        }
        if desc.mip_levels > desc.max_mip_levels() {
            return Err(RhiError::bad_arguments(format!(
                "{} mips requested, {}x{}x{} has at most {}",
                desc.mip_levels,
                desc.width,
                desc.height,
                desc.depth,
                desc.max_mip_levels()
            )));
        }
        match desc.texture_type {
            TextureType::Tex1D if desc.height != 1 || desc.depth != 1 => {
                return Err(RhiError::bad_arguments("1D textures have height and depth 1"));
            }
            TextureType::Tex2D if desc.depth != 1 => {
                return Err(RhiError::bad_arguments("2D textures have depth 1"));
            }
            TextureType::Tex3D if desc.array_size != 1 => {
                return Err(RhiError::bad_arguments("3D textures cannot be arrays"));
            }
            _ => {}
        }
        if desc.usages.contains(TextureUsageFlags::CUBE)
            && (desc.texture_type != TextureType::Tex2D || desc.width != desc.height || desc.array_size % 6 != 0)
        {
            return Err(RhiError::bad_arguments(
                "cube textures are square 2D arrays with a multiple of 6 slices",
            ));
        }

        if !matches!(desc.sample_count, 1 | 2 | 4 | 8) {
            return Err(RhiError::not_supported(format!("sample count {}", desc.sample_count)));
        }
        if desc.sample_count > 1
            && (desc.texture_type != TextureType::Tex2D
                || desc.mip_levels != 1
                || !desc.usages.is_render_target()
                || desc.usages.contains(TextureUsageFlags::READ_WRITE_TEXTURE))
        {
            return Err(RhiError::bad_arguments(
                "multisampled textures are single-mip 2D render targets without storage access",
            ));
        }

        let format = desc.format;
        if desc.usages.contains(TextureUsageFlags::DEPTH_STENCIL_ATTACHMENT) && !format.is_depth_stencil() {
            return Err(RhiError::bad_arguments(format!("{:?} cannot be a depth-stencil attachment", format)));
        }
        if desc
            .usages
            .intersects(TextureUsageFlags::COLOR_ATTACHMENT | TextureUsageFlags::RESOLVE_ATTACHMENT)
            && (format.is_depth_stencil() || format.is_compressed())
        {
            return Err(RhiError::bad_arguments(format!("{:?} cannot be a color attachment", format)));
        }
        if format.is_compressed()
            && (desc.usages.contains(TextureUsageFlags::READ_WRITE_TEXTURE) || desc.texture_type == TextureType::Tex1D)
        {
            return Err(RhiError::not_supported(format!(
                "{:?} with usages {:?} as {:?}",
                format, desc.usages, desc.texture_type
            )));
        }
        if B::encode_format(format).is_none() {
            return Err(RhiError::not_supported(format!("{:?} has no {:?} equivalent", format, B::KIND)));
        }
        if !B::supports_texture_memory(memory_type, &desc) {
            return Err(RhiError::not_supported(format!(
                "{:?} textures with usages {:?} in {:?} memory",
                B::KIND,
                desc.usages,
                memory_type
            )));
        }

        match clear_value {
            Some(ClearValue::Color(_)) if !desc.usages.contains(TextureUsageFlags::COLOR_ATTACHMENT) => {
                return Err(RhiError::bad_arguments("color clear value on a non color attachment"));
            }
            Some(ClearValue::DepthStencil { .. })
                if !desc.usages.contains(TextureUsageFlags::DEPTH_STENCIL_ATTACHMENT) =>
            {
                return Err(RhiError::bad_arguments("depth clear value on a non depth-stencil attachment"));
            }
            _ => {}
        }
        Ok(desc)
    }

    /// Placement alignment and heap usage a texture needs.
    fn texture_heap(desc: &TextureDesc) -> (u64, ResourceHeapUsageFlags) {
        let kind = if desc.usages.is_render_target() {
            ResourceHeapUsageFlags::TEXTURE_RT_DS
        } else {
            ResourceHeapUsageFlags::TEXTURE_NON_RT_DS
        };
        if desc.sample_count > 1 {
            (MSAA_PLACEMENT_ALIGNMENT, kind | ResourceHeapUsageFlags::TEXTURE_MSAA)
        } else {
            (DEFAULT_PLACEMENT_ALIGNMENT, kind)
        }
    }

    // -- descriptors and pipelines ------------------------------------------

    pub fn new_descriptor_set_layout(&self, desc: &DescriptorSetLayoutDesc) -> RhiResult<Arc<DescriptorSetLayout>> {
        DescriptorSetLayout::new(self.ctx.next_object_id(), desc.clone()).map(Arc::new)
    }

    pub fn new_descriptor_set(&self, desc: &DescriptorSetDesc) -> RhiResult<Arc<DescriptorSet>> {
        let layout = &desc.layout;
        match layout.variable_binding() {
            None if desc.num_variable_descriptors > 0 => {
                return Err(RhiError::bad_arguments(
                    "variable descriptors requested for a layout without VARIABLE_DESCRIPTORS",
                ));
            }
            Some(binding) if desc.num_variable_descriptors > binding.num_descs => {
                return Err(RhiError::bad_arguments(format!(
                    "{} variable descriptors exceed the declared bound of {}",
                    desc.num_variable_descriptors, binding.num_descs
                )));
            }
            _ => {}
        }

        let num_arguments = layout.num_fixed_descriptors() as u64 + desc.num_variable_descriptors as u64;
        let table = DeviceMemory::allocate(
            self.ctx.allocator(),
            self.ctx.next_object_id(),
            MemoryType::Upload,
            num_arguments.max(1) * 8,
            BUFFER_ALIGNMENT,
            ResourceHeapUsageFlags::BUFFER,
        )?;
        let set = DescriptorSet::new(self.ctx.next_object_id(), desc, table, self.ctx.clone());
        log::debug!(
            "New descriptor set #{} with {} arguments",
            set.native_handle(),
            set.num_arguments()
        );
        Ok(Arc::new(set))
    }

    pub fn new_pipeline_layout(&self, desc: &PipelineLayoutDesc) -> RhiResult<Arc<PipelineLayout>> {
        PipelineLayout::new(self.ctx.next_object_id(), desc.clone()).map(Arc::new)
    }

    pub fn new_graphics_pipeline_state(&self, desc: &GraphicsPipelineStateDesc) -> RhiResult<Arc<PipelineState>> {
        PipelineState::new_graphics::<B>(self.ctx.next_object_id(), desc).map(Arc::new)
    }

    pub fn new_compute_pipeline_state(&self, desc: &ComputePipelineStateDesc) -> RhiResult<Arc<PipelineState>> {
        PipelineState::new_compute(self.ctx.next_object_id(), desc).map(Arc::new)
    }

    // -- submission ---------------------------------------------------------

    pub fn new_command_buffer(self: &Arc<Self>, queue_index: u32) -> RhiResult<CommandBuffer<B>> {
        let desc = self.get_command_queue_desc(queue_index).ok_or_else(|| {
            RhiError::bad_arguments(format!(
                "queue {} does not exist ({} queues)",
                queue_index,
                self.queues.len()
            ))
        })?;
        Ok(CommandBuffer::new(self.clone(), queue_index, desc.ty))
    }

    pub fn new_fence(&self) -> Arc<Fence> {
        Arc::new(Fence::new(self.ctx.next_object_id()))
    }

    pub fn new_swap_chain(
        self: &Arc<Self>,
        queue_index: u32,
        window: &RawWindowHandle,
        desc: &SwapChainDesc,
    ) -> RhiResult<SwapChain<B>> {
        let queue = self
            .get_command_queue_desc(queue_index)
            .ok_or_else(|| RhiError::bad_arguments(format!("queue {} does not exist", queue_index)))?;
        if !queue.flags.contains(CommandQueueFlags::PRESENTING) {
            return Err(RhiError::not_supported(format!("queue {} cannot present", queue_index)));
        }
        if !B::supports_window(window) {
            return Err(RhiError::not_supported(format!(
                "{:?} cannot present to this window handle",
                B::KIND
            )));
        }
        SwapChain::new(self.clone(), queue_index, desc)
    }
}

impl<B: Backend> Drop for Device<B> {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        // Dropping the queues joins their workers.
        self.queues.clear();
        log::info!("Destroyed {:?} device '{}'", B::KIND, self.adapter_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{Metal, Vulkan, D3D12};

    fn device<B: Backend>() -> Arc<Device<B>> {
        Device::<B>::new(&Config::default()).unwrap()
    }

    #[test]
    fn object_ids_are_unique_and_non_zero() {
        let device = device::<Vulkan>();
        let a = device.new_fence();
        let b = device.new_fence();
        assert_ne!(a.native_handle(), 0);
        assert_ne!(a.native_handle(), b.native_handle());
    }

    #[test]
    fn queue_topology_follows_config() {
        let device = device::<D3D12>();
        assert_eq!(device.get_num_command_queues(), 3);
        let graphics = device.get_command_queue_desc(0).unwrap();
        assert!(graphics.flags.contains(CommandQueueFlags::PRESENTING));
        assert_eq!(device.queue_families(), &[0, 1, 2]);
        assert!(device.get_command_queue_desc(3).is_none());
        assert!(device.new_command_buffer(3).is_err());
    }

    #[test]
    fn zero_mips_resolve_to_full_chain() {
        let device = device::<Vulkan>();
        let desc = TextureDesc::tex2d(Format::Rgba8Unorm, TextureUsageFlags::READ_TEXTURE, 256, 64, 1, 0);
        let texture = device.new_texture(MemoryType::Local, &desc, None).unwrap();
        assert_eq!(texture.get_desc().mip_levels, 9);
    }

    #[test]
    fn upload_textures_only_on_metal() {
        let desc = TextureDesc::tex2d(Format::Rgba8Unorm, TextureUsageFlags::READ_TEXTURE, 16, 16, 1, 1);
        assert!(device::<Metal>().new_texture(MemoryType::Upload, &desc, None).is_ok());
        assert!(matches!(
            device::<D3D12>().new_texture(MemoryType::Upload, &desc, None),
            Err(RhiError::NotSupported(_))
        ));
    }

    #[test]
    fn readback_buffers_only_receive_copies() {
        let device = device::<Vulkan>();
        let ok = BufferDesc::new(64, BufferUsageFlags::COPY_DEST);
        assert!(device.new_buffer(MemoryType::Readback, &ok).is_ok());
        let bad = BufferDesc::new(64, BufferUsageFlags::VERTEX_BUFFER);
        assert!(matches!(
            device.new_buffer(MemoryType::Readback, &bad),
            Err(RhiError::NotSupported(_))
        ));
    }

    #[test]
    fn memory_is_returned_on_drop() {
        let device = device::<Vulkan>();
        let buffer = device
            .new_buffer(MemoryType::Local, &BufferDesc::new(1000, BufferUsageFlags::VERTEX_BUFFER))
            .unwrap();
        assert_eq!(device.memory_used(MemoryType::Local), 1024);
        drop(buffer);
        assert_eq!(device.memory_used(MemoryType::Local), 0);
    }
}
