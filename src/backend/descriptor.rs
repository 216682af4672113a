// Descriptor sets - argument tables bound to shader slots
//
// A set owns an argument table in upload memory: one 64-bit word per
// descriptor, laid out binding after binding in layout order. Bound objects are
// retained by the set until overwritten, and snapshotted into a command
// buffer's retain list whenever the set is bound.

use bitflags::bitflags;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::buffer::{Buffer, BufferUsageFlags};
use super::device::{DeviceContext, DeviceObject};
use super::memory::DeviceMemory;
use super::texture::{Texture, TextureUsageFlags, TextureViewDesc};
use crate::error::{check_precondition, RhiError, RhiResult};
use crate::format::Format;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    UniformBufferView,
    ReadBufferView,
    ReadWriteBufferView,
    ReadTextureView,
    ReadWriteTextureView,
    Sampler,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ShaderVisibilityFlags: u32 {
        const VERTEX = 1 << 0;
        const PIXEL = 1 << 1;
        const COMPUTE = 1 << 2;
        const ALL = Self::VERTEX.bits() | Self::PIXEL.bits() | Self::COMPUTE.bits();
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DescriptorSetLayoutFlags: u32 {
        /// The last binding is variable sized; its `num_descs` is an upper bound.
        const VARIABLE_DESCRIPTORS = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorSetLayoutBinding {
    pub binding_slot: u32,
    pub ty: DescriptorType,
    pub num_descs: u32,
    pub shader_visibility: ShaderVisibilityFlags,
}

impl DescriptorSetLayoutBinding {
    pub fn new(ty: DescriptorType, binding_slot: u32, num_descs: u32, shader_visibility: ShaderVisibilityFlags) -> Self {
        Self {
            binding_slot,
            ty,
            num_descs,
            shader_visibility,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorSetLayoutDesc {
    pub bindings: Vec<DescriptorSetLayoutBinding>,
    pub flags: DescriptorSetLayoutFlags,
}

#[derive(Debug)]
pub struct DescriptorSetLayout {
    handle: u64,
    desc: DescriptorSetLayoutDesc,
    /// Argument offset of every binding.
    offsets: Vec<u32>,
    num_fixed: u32,
}

impl DescriptorSetLayout {
    pub(crate) fn new(handle: u64, desc: DescriptorSetLayoutDesc) -> RhiResult<Self> {
        let variable = desc.flags.contains(DescriptorSetLayoutFlags::VARIABLE_DESCRIPTORS);
        if variable && desc.bindings.is_empty() {
            return Err(RhiError::bad_arguments(
                "VARIABLE_DESCRIPTORS requires at least one binding",
            ));
        }
        for (i, binding) in desc.bindings.iter().enumerate() {
            if binding.num_descs == 0 {
                return Err(RhiError::bad_arguments(format!(
                    "binding slot {} declares zero descriptors",
                    binding.binding_slot
                )));
            }
            if desc.bindings[..i].iter().any(|b| b.binding_slot == binding.binding_slot) {
                return Err(RhiError::bad_arguments(format!(
                    "binding slot {} declared twice",
                    binding.binding_slot
                )));
            }
        }

        let fixed_bindings = if variable {
            &desc.bindings[..desc.bindings.len() - 1]
        } else {
            &desc.bindings[..]
        };
        let mut offsets = Vec::with_capacity(desc.bindings.len());
        let mut num_fixed = 0u32;
        for binding in fixed_bindings {
            offsets.push(num_fixed);
            num_fixed += binding.num_descs;
        }
        if variable {
            offsets.push(num_fixed);
        }

        Ok(Self {
            handle,
            desc,
            offsets,
            num_fixed,
        })
    }

    pub fn native_handle(&self) -> u64 {
        self.handle
    }

    pub fn get_desc(&self) -> &DescriptorSetLayoutDesc {
        &self.desc
    }

    /// Descriptors of every binding except a variable one.
    pub fn num_fixed_descriptors(&self) -> u32 {
        self.num_fixed
    }

    pub fn variable_binding(&self) -> Option<&DescriptorSetLayoutBinding> {
        if self.desc.flags.contains(DescriptorSetLayoutFlags::VARIABLE_DESCRIPTORS) {
            self.desc.bindings.last()
        } else {
            None
        }
    }

    fn find_binding(&self, binding_slot: u32) -> Option<usize> {
        self.desc.bindings.iter().position(|b| b.binding_slot == binding_slot)
    }

    fn is_variable(&self, index: usize) -> bool {
        self.variable_binding().is_some() && index + 1 == self.desc.bindings.len()
    }
}

#[derive(Debug, Clone)]
pub struct DescriptorSetDesc {
    pub layout: Arc<DescriptorSetLayout>,
    pub num_variable_descriptors: u32,
}

impl DescriptorSetDesc {
    pub fn new(layout: &Arc<DescriptorSetLayout>) -> Self {
        Self {
            layout: layout.clone(),
            num_variable_descriptors: 0,
        }
    }

    pub fn with_variable_descriptors(mut self, count: u32) -> Self {
        self.num_variable_descriptors = count;
        self
    }
}

/// Element range of a buffer seen by a shader. With `format == Unknown` the
/// stride is `element_size`, otherwise the format's texel size.
#[derive(Debug, Clone)]
pub struct BufferViewDesc {
    pub buffer: Arc<Buffer>,
    pub first_element: u64,
    pub element_count: u32,
    pub element_size: u32,
    pub format: Format,
}

impl BufferViewDesc {
    pub fn uniform(buffer: &Arc<Buffer>, offset: u64, size: u32) -> Self {
        Self {
            buffer: buffer.clone(),
            first_element: offset,
            element_count: size,
            element_size: 1,
            format: Format::Unknown,
        }
    }

    pub fn structured(buffer: &Arc<Buffer>, first_element: u64, element_count: u32, element_size: u32) -> Self {
        Self {
            buffer: buffer.clone(),
            first_element,
            element_count,
            element_size,
            format: Format::Unknown,
        }
    }

    pub fn typed(buffer: &Arc<Buffer>, first_element: u64, element_count: u32, format: Format) -> Self {
        Self {
            buffer: buffer.clone(),
            first_element,
            element_count,
            element_size: 0,
            format,
        }
    }

    pub fn stride(&self) -> u64 {
        if self.format == Format::Unknown {
            self.element_size as u64
        } else {
            (self.format.bits_per_pixel() / 8) as u64
        }
    }

    /// Byte offset of the first element, `None` if it does not fit in 64 bits.
    pub fn byte_offset(&self) -> Option<u64> {
        self.first_element.checked_mul(self.stride())
    }
}

#[derive(Debug, Clone)]
pub struct TextureViewBinding {
    pub texture: Arc<Texture>,
    pub view: TextureViewDesc,
}

impl TextureViewBinding {
    pub fn new(texture: &Arc<Texture>, view: TextureViewDesc) -> Self {
        Self {
            texture: texture.clone(),
            view,
        }
    }

    pub fn whole(texture: &Arc<Texture>) -> Self {
        Self::new(texture, TextureViewDesc::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    Nearest,
    #[default]
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressMode {
    #[default]
    Repeat,
    Mirror,
    Clamp,
    Border,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareFunction {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BorderColor {
    #[default]
    FloatZeroAlpha,
    FloatZero,
    FloatOne,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
    pub mip_filter: FilterMode,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    pub mip_lod_bias: f32,
    pub max_anisotropy: u32,
    pub comparison: Option<CompareFunction>,
    pub border_color: BorderColor,
    pub min_lod: f32,
    pub max_lod: f32,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            min_filter: FilterMode::Linear,
            mag_filter: FilterMode::Linear,
            mip_filter: FilterMode::Linear,
            address_u: AddressMode::Repeat,
            address_v: AddressMode::Repeat,
            address_w: AddressMode::Repeat,
            mip_lod_bias: 0.0,
            max_anisotropy: 1,
            comparison: None,
            border_color: BorderColor::FloatZeroAlpha,
            min_lod: 0.0,
            max_lod: f32::MAX,
        }
    }
}

/// Immutable sampler object owned by the set that created it.
#[derive(Debug)]
pub struct Sampler {
    handle: u64,
    desc: SamplerDesc,
}

impl Sampler {
    pub fn native_handle(&self) -> u64 {
        self.handle
    }

    pub fn desc(&self) -> &SamplerDesc {
        &self.desc
    }
}

#[derive(Debug, Clone)]
pub enum DescriptorWrites {
    Buffers(Vec<BufferViewDesc>),
    Textures(Vec<TextureViewBinding>),
    Samplers(Vec<SamplerDesc>),
}

impl DescriptorWrites {
    fn len(&self) -> usize {
        match self {
            DescriptorWrites::Buffers(v) => v.len(),
            DescriptorWrites::Textures(v) => v.len(),
            DescriptorWrites::Samplers(v) => v.len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WriteDescriptorSet {
    pub binding_slot: u32,
    pub first_array_index: u32,
    pub ty: DescriptorType,
    pub writes: DescriptorWrites,
}

impl WriteDescriptorSet {
    pub fn uniform_buffer_view(binding_slot: u32, view: BufferViewDesc) -> Self {
        Self::buffers(binding_slot, DescriptorType::UniformBufferView, vec![view])
    }

    pub fn read_buffer_view(binding_slot: u32, view: BufferViewDesc) -> Self {
        Self::buffers(binding_slot, DescriptorType::ReadBufferView, vec![view])
    }

    pub fn read_write_buffer_view(binding_slot: u32, view: BufferViewDesc) -> Self {
        Self::buffers(binding_slot, DescriptorType::ReadWriteBufferView, vec![view])
    }

    pub fn read_texture_view(binding_slot: u32, view: TextureViewBinding) -> Self {
        Self::textures(binding_slot, DescriptorType::ReadTextureView, vec![view])
    }

    pub fn read_write_texture_view(binding_slot: u32, view: TextureViewBinding) -> Self {
        Self::textures(binding_slot, DescriptorType::ReadWriteTextureView, vec![view])
    }

    pub fn sampler(binding_slot: u32, desc: SamplerDesc) -> Self {
        Self {
            binding_slot,
            first_array_index: 0,
            ty: DescriptorType::Sampler,
            writes: DescriptorWrites::Samplers(vec![desc]),
        }
    }

    pub fn buffers(binding_slot: u32, ty: DescriptorType, views: Vec<BufferViewDesc>) -> Self {
        Self {
            binding_slot,
            first_array_index: 0,
            ty,
            writes: DescriptorWrites::Buffers(views),
        }
    }

    pub fn textures(binding_slot: u32, ty: DescriptorType, views: Vec<TextureViewBinding>) -> Self {
        Self {
            binding_slot,
            first_array_index: 0,
            ty,
            writes: DescriptorWrites::Textures(views),
        }
    }

    pub fn array_index(mut self, first_array_index: u32) -> Self {
        self.first_array_index = first_array_index;
        self
    }
}

#[derive(Debug, Default)]
struct DescriptorSetState {
    objects: Vec<Option<DeviceObject>>,
    samplers: HashMap<(u32, u32), Arc<Sampler>>,
}

/// One prepared argument: index, table word, retained object.
struct PreparedWrite {
    argument: usize,
    word: u64,
    object: DeviceObject,
    sampler_key: Option<(u32, u32)>,
}

#[derive(Debug)]
pub struct DescriptorSet {
    handle: u64,
    layout: Arc<DescriptorSetLayout>,
    num_variable: u32,
    table: Arc<DeviceMemory>,
    state: Mutex<DescriptorSetState>,
    ctx: Arc<DeviceContext>,
}

impl DescriptorSet {
    pub(crate) fn new(
        handle: u64,
        desc: &DescriptorSetDesc,
        table: Arc<DeviceMemory>,
        ctx: Arc<DeviceContext>,
    ) -> Self {
        let num_arguments = (desc.layout.num_fixed_descriptors() + desc.num_variable_descriptors) as usize;
        Self {
            handle,
            layout: desc.layout.clone(),
            num_variable: desc.num_variable_descriptors,
            table,
            state: Mutex::new(DescriptorSetState {
                objects: vec![None; num_arguments],
                samplers: HashMap::new(),
            }),
            ctx,
        }
    }

    pub fn native_handle(&self) -> u64 {
        self.handle
    }

    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }

    pub fn num_arguments(&self) -> u32 {
        self.layout.num_fixed_descriptors() + self.num_variable
    }

    pub fn gpu_address(&self) -> u64 {
        self.table.gpu_address()
    }

    /// Word written for argument `index`, as the GPU would read it.
    pub fn argument(&self, index: u32) -> Option<u64> {
        if index >= self.num_arguments() {
            return None;
        }
        let storage = self.table.storage();
        let start = index as usize * 8;
        let bytes: [u8; 8] = storage.get(start..start + 8)?.try_into().ok()?;
        Some(u64::from_le_bytes(bytes))
    }

    pub fn num_cached_samplers(&self) -> usize {
        self.state.lock().samplers.len()
    }

    /// Strong references to everything currently bound.
    pub fn bound_objects(&self) -> Vec<DeviceObject> {
        self.state.lock().objects.iter().flatten().cloned().collect()
    }

    fn binding_capacity(&self, index: usize) -> u32 {
        if self.layout.is_variable(index) {
            self.num_variable
        } else {
            self.layout.desc.bindings[index].num_descs
        }
    }

    pub fn update_descriptors(&self, writes: &[WriteDescriptorSet]) -> RhiResult<()> {
        let mut prepared = Vec::new();
        for write in writes {
            self.prepare(write, &mut prepared)?;
        }

        let mut state = self.state.lock();
        let mut table = self.table.storage();
        for p in prepared {
            let start = p.argument * 8;
            table[start..start + 8].copy_from_slice(&p.word.to_le_bytes());
            if let (Some(key), DeviceObject::Sampler(sampler)) = (p.sampler_key, &p.object) {
                // Replacing drops the stale sampler once nothing else holds it.
                state.samplers.insert(key, sampler.clone());
            }
            state.objects[p.argument] = Some(p.object);
        }
        Ok(())
    }

    fn prepare(&self, write: &WriteDescriptorSet, out: &mut Vec<PreparedWrite>) -> RhiResult<()> {
        let index = self.layout.find_binding(write.binding_slot).ok_or_else(|| {
            RhiError::bad_arguments(format!(
                "binding slot {} is not declared by the layout",
                write.binding_slot
            ))
        })?;
        let binding = &self.layout.desc.bindings[index];
        if binding.ty != write.ty {
            return Err(RhiError::bad_arguments(format!(
                "binding slot {} is {:?}, write is {:?}",
                write.binding_slot, binding.ty, write.ty
            )));
        }

        let capacity = self.binding_capacity(index);
        let end = write.first_array_index as usize + write.writes.len();
        check_precondition!(
            self.ctx.validate(),
            end <= capacity as usize,
            "descriptor write [{}, {}) overflows binding slot {} of {} descriptors",
            write.first_array_index,
            end,
            write.binding_slot,
            capacity
        );
        if end > capacity as usize {
            return Err(RhiError::bad_arguments(format!(
                "descriptor write overflows binding slot {}",
                write.binding_slot
            )));
        }

        let base = self.layout.offsets[index] as usize + write.first_array_index as usize;
        match &write.writes {
            DescriptorWrites::Buffers(views) => {
                for (i, view) in views.iter().enumerate() {
                    let word = self.buffer_word(write.ty, view)?;
                    out.push(PreparedWrite {
                        argument: base + i,
                        word,
                        object: DeviceObject::Buffer(view.buffer.clone()),
                        sampler_key: None,
                    });
                }
            }
            DescriptorWrites::Textures(views) => {
                for (i, view) in views.iter().enumerate() {
                    let word = self.texture_word(write.ty, view)?;
                    out.push(PreparedWrite {
                        argument: base + i,
                        word,
                        object: DeviceObject::Texture(view.texture.clone()),
                        sampler_key: None,
                    });
                }
            }
            DescriptorWrites::Samplers(descs) => {
                for (i, desc) in descs.iter().enumerate() {
                    let sampler = Arc::new(Sampler {
                        handle: self.ctx.next_object_id(),
                        desc: *desc,
                    });
                    out.push(PreparedWrite {
                        argument: base + i,
                        word: sampler.handle,
                        object: DeviceObject::Sampler(sampler),
                        sampler_key: Some((write.binding_slot, write.first_array_index + i as u32)),
                    });
                }
            }
        }
        Ok(())
    }

    fn buffer_word(&self, ty: DescriptorType, view: &BufferViewDesc) -> RhiResult<u64> {
        let usages = view.buffer.get_desc().usages;
        let allowed = match ty {
            DescriptorType::UniformBufferView => usages.contains(BufferUsageFlags::UNIFORM_BUFFER),
            DescriptorType::ReadBufferView => {
                usages.intersects(BufferUsageFlags::READ_BUFFER | BufferUsageFlags::READ_WRITE_BUFFER)
            }
            DescriptorType::ReadWriteBufferView => usages.contains(BufferUsageFlags::READ_WRITE_BUFFER),
            _ => false,
        };
        if !allowed {
            return Err(RhiError::bad_arguments(format!(
                "buffer #{} with usages {:?} cannot back a {:?} descriptor",
                view.buffer.native_handle(),
                usages,
                ty
            )));
        }
        let size = u64::from(view.element_count) * view.stride();
        let end = view.byte_offset().and_then(|offset| offset.checked_add(size));
        let offset = match end {
            Some(end) if end <= view.buffer.get_desc().size => end - size,
            _ => {
                return Err(RhiError::bad_arguments(format!(
                    "buffer view of {} elements from element {} exceeds buffer #{}",
                    view.element_count,
                    view.first_element,
                    view.buffer.native_handle()
                )))
            }
        };
        Ok(view.buffer.gpu_address() + offset)
    }

    fn texture_word(&self, ty: DescriptorType, binding: &TextureViewBinding) -> RhiResult<u64> {
        let texture = &binding.texture;
        let usages = texture.get_desc().usages;
        let allowed = match ty {
            DescriptorType::ReadTextureView => {
                usages.intersects(TextureUsageFlags::READ_TEXTURE | TextureUsageFlags::READ_WRITE_TEXTURE)
            }
            DescriptorType::ReadWriteTextureView => usages.contains(TextureUsageFlags::READ_WRITE_TEXTURE),
            _ => false,
        };
        if !allowed {
            return Err(RhiError::bad_arguments(format!(
                "texture #{} with usages {:?} cannot back a {:?} descriptor",
                texture.native_handle(),
                usages,
                ty
            )));
        }
        let view = texture.require_view(&binding.view, &self.ctx)?;
        Ok(view.map_or(texture.native_handle(), |v| v.native_handle()))
    }
}
