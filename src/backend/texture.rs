// Textures - images with per-subresource state tracking
//
// Subresources are laid out slice-major in memory: for each array slice,
// every mip in order, rows tightly packed in whole compression blocks.

use bitflags::bitflags;
use glam::Vec4;
use parking_lot::Mutex;
use std::sync::Arc;

use super::device::DeviceContext;
use super::memory::{DeviceMemory, MemoryType};
use super::state::TextureStateFlags;
use super::tracker::StateTracker;
use crate::error::{RhiError, RhiResult};
use crate::format::Format;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TextureUsageFlags: u32 {
        const COPY_SOURCE = 1 << 0;
        const COPY_DEST = 1 << 1;
        const READ_TEXTURE = 1 << 2;
        const READ_WRITE_TEXTURE = 1 << 3;
        const COLOR_ATTACHMENT = 1 << 4;
        const DEPTH_STENCIL_ATTACHMENT = 1 << 5;
        const RESOLVE_ATTACHMENT = 1 << 6;
        const CUBE = 1 << 7;
    }
}

impl TextureUsageFlags {
    pub fn is_render_target(self) -> bool {
        self.intersects(Self::COLOR_ATTACHMENT | Self::DEPTH_STENCIL_ATTACHMENT | Self::RESOLVE_ATTACHMENT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureType {
    Tex1D,
    Tex2D,
    Tex3D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub texture_type: TextureType,
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub array_size: u32,
    /// Zero requests the full mip chain.
    pub mip_levels: u32,
    pub sample_count: u32,
    pub usages: TextureUsageFlags,
}

impl TextureDesc {
    pub fn tex1d(format: Format, usages: TextureUsageFlags, width: u32, array_size: u32, mip_levels: u32) -> Self {
        Self {
            texture_type: TextureType::Tex1D,
            format,
            width,
            height: 1,
            depth: 1,
            array_size,
            mip_levels,
            sample_count: 1,
            usages,
        }
    }

    pub fn tex2d(
        format: Format,
        usages: TextureUsageFlags,
        width: u32,
        height: u32,
        array_size: u32,
        mip_levels: u32,
    ) -> Self {
        Self {
            texture_type: TextureType::Tex2D,
            format,
            width,
            height,
            depth: 1,
            array_size,
            mip_levels,
            sample_count: 1,
            usages,
        }
    }

    pub fn tex3d(format: Format, usages: TextureUsageFlags, width: u32, height: u32, depth: u32, mip_levels: u32) -> Self {
        Self {
            texture_type: TextureType::Tex3D,
            format,
            width,
            height,
            depth,
            array_size: 1,
            mip_levels,
            sample_count: 1,
            usages,
        }
    }

    pub fn with_sample_count(mut self, sample_count: u32) -> Self {
        self.sample_count = sample_count;
        self
    }

    pub fn max_mip_levels(&self) -> u32 {
        let largest = self.width.max(self.height).max(self.depth).max(1);
        32 - largest.leading_zeros()
    }

    pub fn subresource_count(&self) -> u32 {
        self.mip_levels * self.array_size
    }

    pub fn mip_extent(&self, mip_slice: u32) -> (u32, u32, u32) {
        (
            (self.width >> mip_slice).max(1),
            (self.height >> mip_slice).max(1),
            (self.depth >> mip_slice).max(1),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color(Vec4),
    DepthStencil { depth: f32, stencil: u8 },
}

/// Placement of one subresource inside the texture's memory range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubresourceFootprint {
    pub offset: u64,
    pub row_pitch: u64,
    pub slice_pitch: u64,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl SubresourceFootprint {
    pub fn size(&self) -> u64 {
        self.slice_pitch * self.depth as u64
    }
}

/// Computes every subresource footprint and the total byte size.
pub fn compute_footprints(desc: &TextureDesc) -> (Vec<SubresourceFootprint>, u64) {
    let (block_w, block_h, block_bytes) = desc.format.block_info();
    let mut footprints = Vec::with_capacity(desc.subresource_count() as usize);
    let mut offset = 0u64;
    for _slice in 0..desc.array_size {
        for mip in 0..desc.mip_levels {
            let (width, height, depth) = desc.mip_extent(mip);
            let row_pitch = width.div_ceil(block_w) as u64 * block_bytes as u64;
            let slice_pitch = row_pitch * height.div_ceil(block_h) as u64;
            let footprint = SubresourceFootprint {
                offset,
                row_pitch,
                slice_pitch,
                width,
                height,
                depth,
            };
            offset += footprint.size();
            footprints.push(footprint);
        }
    }
    (footprints, offset * desc.sample_count.max(1) as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureViewType {
    /// Same dimensionality as the texture.
    #[default]
    Unspecified,
    Tex1D,
    Tex1DArray,
    Tex2D,
    Tex2DArray,
    Tex2DMs,
    Tex2DMsArray,
    Tex3D,
    TexCube,
    TexCubeArray,
}

/// Requested view of a texture. `Format::Unknown` and zero sizes inherit from
/// the texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TextureViewDesc {
    pub view_type: TextureViewType,
    pub format: Format,
    pub mip_slice: u32,
    pub mip_size: u32,
    pub array_slice: u32,
    pub array_size: u32,
}

impl TextureViewDesc {
    pub fn mip(mip_slice: u32) -> Self {
        Self {
            mip_slice,
            mip_size: 1,
            ..Default::default()
        }
    }
}

/// View object for a view the base resource cannot express on its own.
#[derive(Debug)]
pub struct TextureView {
    handle: u64,
    texture: u64,
    desc: TextureViewDesc,
}

impl TextureView {
    pub fn native_handle(&self) -> u64 {
        self.handle
    }

    pub fn texture_handle(&self) -> u64 {
        self.texture
    }

    pub fn desc(&self) -> &TextureViewDesc {
        &self.desc
    }
}

/// Tracked state every texture starts in.
pub fn initial_texture_state() -> TextureStateFlags {
    TextureStateFlags::AUTOMATIC
}

#[derive(Debug)]
pub struct Texture {
    handle: u64,
    desc: TextureDesc,
    memory: Arc<DeviceMemory>,
    offset: u64,
    aliasing: bool,
    footprints: Vec<SubresourceFootprint>,
    clear_value: Option<ClearValue>,
    tracker: StateTracker,
    views: Mutex<Vec<Arc<TextureView>>>,
}

impl Texture {
    /// `desc.mip_levels` must already be resolved.
    pub(crate) fn new(
        handle: u64,
        desc: TextureDesc,
        memory: Arc<DeviceMemory>,
        offset: u64,
        aliasing: bool,
        clear_value: Option<ClearValue>,
    ) -> Self {
        let (footprints, _) = compute_footprints(&desc);
        Self {
            handle,
            desc,
            memory,
            offset,
            aliasing,
            footprints,
            clear_value,
            tracker: StateTracker::new(desc.subresource_count() as usize, initial_texture_state().bits()),
            views: Mutex::new(Vec::new()),
        }
    }

    pub fn get_desc(&self) -> &TextureDesc {
        &self.desc
    }

    pub fn native_handle(&self) -> u64 {
        self.handle
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory.memory_type()
    }

    pub fn memory(&self) -> &Arc<DeviceMemory> {
        &self.memory
    }

    pub fn memory_offset(&self) -> u64 {
        self.offset
    }

    pub fn is_aliasing(&self) -> bool {
        self.aliasing
    }

    pub fn clear_value(&self) -> Option<ClearValue> {
        self.clear_value
    }

    pub fn subresource_index(&self, mip_slice: u32, array_slice: u32) -> Option<usize> {
        (mip_slice < self.desc.mip_levels && array_slice < self.desc.array_size)
            .then(|| (mip_slice + array_slice * self.desc.mip_levels) as usize)
    }

    /// Footprint with `offset` relative to the start of the backing memory.
    pub fn footprint(&self, mip_slice: u32, array_slice: u32) -> Option<SubresourceFootprint> {
        let index = self.subresource_index(mip_slice, array_slice)?;
        let mut footprint = self.footprints[index];
        footprint.offset += self.offset;
        Some(footprint)
    }

    pub fn tracked_state(&self, mip_slice: u32, array_slice: u32) -> Option<TextureStateFlags> {
        let index = self.subresource_index(mip_slice, array_slice)?;
        self.tracker.state(index).map(TextureStateFlags::from_bits_truncate)
    }

    pub fn owning_queue_family(&self, mip_slice: u32, array_slice: u32) -> Option<u32> {
        self.tracker.owner(self.subresource_index(mip_slice, array_slice)?)
    }

    pub(crate) fn tracker(&self) -> &StateTracker {
        &self.tracker
    }

    pub fn allowed_states(&self) -> TextureStateFlags {
        let usages = self.desc.usages;
        let mut states = TextureStateFlags::empty();
        if usages.contains(TextureUsageFlags::COPY_SOURCE) {
            states |= TextureStateFlags::COPY_SOURCE;
        }
        if usages.contains(TextureUsageFlags::COPY_DEST) {
            states |= TextureStateFlags::COPY_DEST;
        }
        if usages.intersects(TextureUsageFlags::READ_TEXTURE | TextureUsageFlags::READ_WRITE_TEXTURE) {
            states |= TextureStateFlags::SHADER_READ_VS
                | TextureStateFlags::SHADER_READ_PS
                | TextureStateFlags::SHADER_READ_CS;
        }
        if usages.contains(TextureUsageFlags::READ_WRITE_TEXTURE) {
            states |= TextureStateFlags::SHADER_WRITES;
        }
        if usages.contains(TextureUsageFlags::COLOR_ATTACHMENT) {
            states |= TextureStateFlags::COLOR_ATTACHMENT_READ
                | TextureStateFlags::COLOR_ATTACHMENT_WRITE
                | TextureStateFlags::PRESENT;
        }
        if usages.contains(TextureUsageFlags::DEPTH_STENCIL_ATTACHMENT) {
            states |= TextureStateFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | TextureStateFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        }
        if usages.contains(TextureUsageFlags::RESOLVE_ATTACHMENT) {
            states |= TextureStateFlags::RESOLVE_ATTACHMENT;
        }
        states
    }

    fn default_view_type(&self) -> TextureViewType {
        let desc = &self.desc;
        match desc.texture_type {
            TextureType::Tex1D if desc.array_size > 1 => TextureViewType::Tex1DArray,
            TextureType::Tex1D => TextureViewType::Tex1D,
            TextureType::Tex3D => TextureViewType::Tex3D,
            TextureType::Tex2D if desc.usages.contains(TextureUsageFlags::CUBE) && desc.array_size == 6 => {
                TextureViewType::TexCube
            }
            TextureType::Tex2D if desc.usages.contains(TextureUsageFlags::CUBE) && desc.array_size % 6 == 0 => {
                TextureViewType::TexCubeArray
            }
            TextureType::Tex2D if desc.sample_count > 1 && desc.array_size > 1 => TextureViewType::Tex2DMsArray,
            TextureType::Tex2D if desc.sample_count > 1 => TextureViewType::Tex2DMs,
            TextureType::Tex2D if desc.array_size > 1 => TextureViewType::Tex2DArray,
            TextureType::Tex2D => TextureViewType::Tex2D,
        }
    }

    /// View description the base resource handle already expresses.
    pub fn base_view_desc(&self) -> TextureViewDesc {
        TextureViewDesc {
            view_type: self.default_view_type(),
            format: self.desc.format,
            mip_slice: 0,
            mip_size: self.desc.mip_levels,
            array_slice: 0,
            array_size: self.desc.array_size,
        }
    }

    /// Fills inherited fields and validates the requested view.
    pub fn normalize_view_desc(&self, desc: &TextureViewDesc) -> RhiResult<TextureViewDesc> {
        let mut view = *desc;
        if view.view_type == TextureViewType::Unspecified {
            view.view_type = self.default_view_type();
        }
        if view.format == Format::Unknown {
            view.format = self.desc.format;
        }
        if view.mip_slice >= self.desc.mip_levels || view.array_slice >= self.desc.array_size {
            return Err(RhiError::bad_arguments(format!(
                "view starts at mip {} slice {}, texture #{} has {} mips and {} slices",
                view.mip_slice, view.array_slice, self.handle, self.desc.mip_levels, self.desc.array_size
            )));
        }
        if view.mip_size == 0 {
            view.mip_size = self.desc.mip_levels - view.mip_slice;
        }
        if view.array_size == 0 {
            view.array_size = self.desc.array_size - view.array_slice;
        }
        if view.mip_slice + view.mip_size > self.desc.mip_levels
            || view.array_slice + view.array_size > self.desc.array_size
        {
            return Err(RhiError::bad_arguments(format!(
                "view range exceeds texture #{}",
                self.handle
            )));
        }
        if view.format != self.desc.format
            && (view.format.bits_per_pixel() != self.desc.format.bits_per_pixel()
                || view.format.is_depth_stencil()
                || self.desc.format.is_depth_stencil()
                || view.format.is_compressed() != self.desc.format.is_compressed())
        {
            return Err(RhiError::bad_arguments(format!(
                "format {:?} cannot reinterpret texture #{} of format {:?}",
                view.format, self.handle, self.desc.format
            )));
        }
        Ok(view)
    }

    /// Returns the cached view object for `desc`, creating it on first use.
    /// `None` means the base resource already expresses the view.
    pub(crate) fn require_view(
        &self,
        desc: &TextureViewDesc,
        ctx: &DeviceContext,
    ) -> RhiResult<Option<Arc<TextureView>>> {
        let view = self.normalize_view_desc(desc)?;
        if view == self.base_view_desc() {
            return Ok(None);
        }
        let mut views = self.views.lock();
        if let Some(existing) = views.iter().find(|v| v.desc == view) {
            return Ok(Some(existing.clone()));
        }
        let created = Arc::new(TextureView {
            handle: ctx.next_object_id(),
            texture: self.handle,
            desc: view,
        });
        log::trace!("Texture #{}: new view #{} {:?}", self.handle, created.handle, view);
        views.push(created.clone());
        Ok(Some(created))
    }

    pub fn num_cached_views(&self) -> usize {
        self.views.lock().len()
    }
}
