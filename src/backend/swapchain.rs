// Swapchain - Window presentation
//
// Manages the ring of back buffers rendered to and handed to the window.
// Back buffers are ordinary tracked textures: the application transitions the
// current one to PRESENT before calling `present`.

use std::sync::Arc;

use super::device::Device;
use super::memory::MemoryType;
use super::state::TextureStateFlags;
use super::texture::{Texture, TextureDesc, TextureUsageFlags};
use crate::error::{RhiError, RhiResult};
use crate::format::Format;
use crate::native::Backend;

pub const MIN_BACK_BUFFERS: u32 = 2;
pub const MAX_BACK_BUFFERS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapChainDesc {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub num_buffers: u32,
    pub vsync: bool,
}

impl Default for SwapChainDesc {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            format: Format::Bgra8Unorm,
            num_buffers: 2,
            vsync: true,
        }
    }
}

pub struct SwapChain<B: Backend> {
    device: Arc<Device<B>>,
    queue_index: u32,
    desc: SwapChainDesc,
    back_buffers: Vec<Arc<Texture>>,
    current: usize,
    presented: u64,
}

impl<B: Backend> std::fmt::Debug for SwapChain<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapChain")
            .field("queue_index", &self.queue_index)
            .field("desc", &self.desc)
            .field("back_buffers", &self.back_buffers)
            .field("current", &self.current)
            .field("presented", &self.presented)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> SwapChain<B> {
    pub(crate) fn new(device: Arc<Device<B>>, queue_index: u32, desc: &SwapChainDesc) -> RhiResult<Self> {
        let back_buffers = Self::create_back_buffers(&device, desc)?;
        log::info!(
            "Created swap chain: {}x{} {:?}, {} buffers on queue {}",
            desc.width,
            desc.height,
            desc.format,
            desc.num_buffers,
            queue_index
        );
        Ok(Self {
            device,
            queue_index,
            desc: *desc,
            back_buffers,
            current: 0,
            presented: 0,
        })
    }

    fn create_back_buffers(device: &Device<B>, desc: &SwapChainDesc) -> RhiResult<Vec<Arc<Texture>>> {
        if desc.width == 0 || desc.height == 0 {
            return Err(RhiError::bad_arguments(format!(
                "swap chain extent {}x{}",
                desc.width, desc.height
            )));
        }
        if !(MIN_BACK_BUFFERS..=MAX_BACK_BUFFERS).contains(&desc.num_buffers) {
            return Err(RhiError::bad_arguments(format!(
                "{} back buffers, expected {}..={}",
                desc.num_buffers, MIN_BACK_BUFFERS, MAX_BACK_BUFFERS
            )));
        }
        if !B::is_presentable_format(desc.format) {
            return Err(RhiError::not_supported(format!(
                "{:?} cannot present {:?}",
                B::KIND,
                desc.format
            )));
        }

        let texture_desc = TextureDesc::tex2d(
            desc.format,
            TextureUsageFlags::COLOR_ATTACHMENT | TextureUsageFlags::COPY_SOURCE | TextureUsageFlags::COPY_DEST,
            desc.width,
            desc.height,
            1,
            1,
        );
        (0..desc.num_buffers)
            .map(|_| device.new_texture(MemoryType::Local, &texture_desc, None))
            .collect()
    }

    pub fn get_desc(&self) -> &SwapChainDesc {
        &self.desc
    }

    pub fn queue_index(&self) -> u32 {
        self.queue_index
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn presented_frames(&self) -> u64 {
        self.presented
    }

    pub fn get_current_back_buffer(&self) -> &Arc<Texture> {
        &self.back_buffers[self.current]
    }

    /// Presents the current back buffer and advances to the next one.
    pub fn present(&mut self) -> RhiResult<()> {
        let back_buffer = &self.back_buffers[self.current];
        let state = back_buffer.tracked_state(0, 0);
        if state != Some(TextureStateFlags::PRESENT) {
            return Err(RhiError::bad_arguments(format!(
                "back buffer #{} is in {:?}, expected PRESENT",
                back_buffer.native_handle(),
                state
            )));
        }
        log::trace!(
            "Present back buffer {} (#{}), vsync {}",
            self.current,
            back_buffer.native_handle(),
            self.desc.vsync
        );
        self.presented += 1;
        self.current = (self.current + 1) % self.back_buffers.len();
        Ok(())
    }

    /// Recreates every back buffer, e.g. after a window resize. Previous back
    /// buffers stay alive while command buffers still retain them.
    pub fn reset(&mut self, desc: &SwapChainDesc) -> RhiResult<()> {
        let back_buffers = Self::create_back_buffers(&self.device, desc)?;
        log::info!(
            "Swap chain reset: {}x{} -> {}x{}",
            self.desc.width,
            self.desc.height,
            desc.width,
            desc.height
        );
        self.back_buffers = back_buffers;
        self.desc = *desc;
        self.current = 0;
        Ok(())
    }
}
