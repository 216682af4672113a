// Command buffers - recording contexts bound to one queue
//
// Recording is a small state machine: Idle -> {Render, Compute, Copy} pass ->
// Idle. Every call is validated against the current pass, translated into the
// backend's native vocabulary and appended to the command list. Objects a
// command references are retained until `reset`.
//
// Submitted commands replay on the queue's worker thread. Copies and
// attachment clears operate on host storage; draws and dispatches are recorded
// for inspection only.

use glam::{UVec3, Vec4};
use std::ops::Range;
use std::sync::Arc;

use super::buffer::{Buffer, BufferUsageFlags};
use super::descriptor::DescriptorSet;
use super::device::{Device, DeviceObject};
use super::memory::DeviceMemory;
use super::pipeline::{PipelineLayout, PipelineState, MAX_COLOR_ATTACHMENTS, MAX_VERTEX_BUFFERS};
use super::queue::{CommandQueueType, Submission};
use super::state::{BufferBarrier, TextureBarrier};
use super::sync::{Fence, SubmissionStatus};
use super::texture::{ClearValue, Texture, TextureUsageFlags};
use super::tracker::{resolve_buffer_barrier, resolve_texture_barrier, ResolveContext};
use crate::error::{check_precondition, RhiError, RhiResult};
use crate::format::Format;
use crate::native::{Backend, BarrierContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PassKind {
    #[default]
    None,
    Render,
    Compute,
    Copy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LoadOp {
    DontCare,
    #[default]
    Load,
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StoreOp {
    DontCare,
    #[default]
    Store,
}

// ---------------------------------------------------------------------------
// Pass descriptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ResolveTarget {
    pub texture: Arc<Texture>,
    pub mip_slice: u32,
    pub array_slice: u32,
}

#[derive(Debug, Clone)]
pub struct ColorAttachment {
    pub texture: Arc<Texture>,
    pub mip_slice: u32,
    pub array_slice: u32,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    /// Falls back to the texture's optimized clear value, then to zero.
    pub clear_color: Option<Vec4>,
    pub resolve: Option<ResolveTarget>,
}

impl ColorAttachment {
    pub fn new(texture: &Arc<Texture>) -> Self {
        Self {
            texture: texture.clone(),
            mip_slice: 0,
            array_slice: 0,
            load_op: LoadOp::Load,
            store_op: StoreOp::Store,
            clear_color: None,
            resolve: None,
        }
    }

    pub fn subresource(mut self, mip_slice: u32, array_slice: u32) -> Self {
        self.mip_slice = mip_slice;
        self.array_slice = array_slice;
        self
    }

    pub fn clear(mut self, color: Vec4) -> Self {
        self.load_op = LoadOp::Clear;
        self.clear_color = Some(color);
        self
    }

    pub fn load_op(mut self, load_op: LoadOp) -> Self {
        self.load_op = load_op;
        self
    }

    pub fn store_op(mut self, store_op: StoreOp) -> Self {
        self.store_op = store_op;
        self
    }

    pub fn resolve_to(mut self, texture: &Arc<Texture>, mip_slice: u32, array_slice: u32) -> Self {
        self.resolve = Some(ResolveTarget {
            texture: texture.clone(),
            mip_slice,
            array_slice,
        });
        self
    }
}

#[derive(Debug, Clone)]
pub struct DepthStencilAttachment {
    pub texture: Arc<Texture>,
    pub mip_slice: u32,
    pub array_slice: u32,
    pub depth_load_op: LoadOp,
    pub depth_store_op: StoreOp,
    pub stencil_load_op: LoadOp,
    pub stencil_store_op: StoreOp,
    pub clear_depth: f32,
    pub clear_stencil: u8,
}

impl DepthStencilAttachment {
    pub fn new(texture: &Arc<Texture>) -> Self {
        let (clear_depth, clear_stencil) = match texture.clear_value() {
            Some(ClearValue::DepthStencil { depth, stencil }) => (depth, stencil),
            _ => (1.0, 0),
        };
        Self {
            texture: texture.clone(),
            mip_slice: 0,
            array_slice: 0,
            depth_load_op: LoadOp::Load,
            depth_store_op: StoreOp::Store,
            stencil_load_op: LoadOp::DontCare,
            stencil_store_op: StoreOp::DontCare,
            clear_depth,
            clear_stencil,
        }
    }

    pub fn subresource(mut self, mip_slice: u32, array_slice: u32) -> Self {
        self.mip_slice = mip_slice;
        self.array_slice = array_slice;
        self
    }

    pub fn clear(mut self, depth: f32, stencil: u8) -> Self {
        self.depth_load_op = LoadOp::Clear;
        self.clear_depth = depth;
        if self.texture.get_desc().format.has_stencil() {
            self.stencil_load_op = LoadOp::Clear;
            self.clear_stencil = stencil;
        }
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RenderPassDesc {
    pub color_attachments: Vec<ColorAttachment>,
    pub depth_stencil: Option<DepthStencilAttachment>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn new(width: f32, height: f32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width,
            height,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScissorRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct VertexBufferView {
    pub buffer: Arc<Buffer>,
    pub offset: u64,
}

#[derive(Debug, Clone)]
pub struct IndexBufferView {
    pub buffer: Arc<Buffer>,
    pub offset: u64,
    pub format: Format,
}

/// Either kind of copyable resource.
#[derive(Debug, Clone, Copy)]
pub enum ResourceRef<'a> {
    Buffer(&'a Arc<Buffer>),
    Texture(&'a Arc<Texture>),
}

impl<'a> From<&'a Arc<Buffer>> for ResourceRef<'a> {
    fn from(buffer: &'a Arc<Buffer>) -> Self {
        ResourceRef::Buffer(buffer)
    }
}

impl<'a> From<&'a Arc<Texture>> for ResourceRef<'a> {
    fn from(texture: &'a Arc<Texture>) -> Self {
        ResourceRef::Texture(texture)
    }
}

// ---------------------------------------------------------------------------
// Recorded commands
// ---------------------------------------------------------------------------

/// Pitched region of a memory object.
#[derive(Debug, Clone)]
pub struct CopyRegion {
    pub memory: Arc<DeviceMemory>,
    pub offset: u64,
    pub row_pitch: u64,
    pub slice_pitch: u64,
}

impl CopyRegion {
    fn row(&self, z: u32, y: u32, len: u64, storage_len: usize) -> RhiResult<Range<usize>> {
        let start = self.offset + z as u64 * self.slice_pitch + y as u64 * self.row_pitch;
        let end = start + len;
        if end > storage_len as u64 {
            return Err(RhiError::bad_platform_call(format!(
                "access [{}, {}) beyond memory #{} of {} bytes",
                start,
                end,
                self.memory.id(),
                storage_len
            )));
        }
        Ok(start as usize..end as usize)
    }
}

#[derive(Debug, Clone)]
pub struct CopyBox {
    pub src: CopyRegion,
    pub dst: CopyRegion,
    pub row_bytes: u64,
    pub rows: u32,
    pub depth: u32,
}

impl CopyBox {
    fn execute(&self) -> RhiResult<()> {
        let (src, dst) = (&self.src, &self.dst);
        if Arc::ptr_eq(&src.memory, &dst.memory) {
            let mut storage = src.memory.storage();
            let len = storage.len();
            for z in 0..self.depth {
                for y in 0..self.rows {
                    let from = src.row(z, y, self.row_bytes, len)?;
                    let to = dst.row(z, y, self.row_bytes, len)?;
                    storage.copy_within(from, to.start);
                }
            }
            return Ok(());
        }

        // Lock in id order so queues copying in opposite directions cannot deadlock.
        let (src_storage, mut dst_storage) = if src.memory.id() < dst.memory.id() {
            let s = src.memory.storage();
            (s, dst.memory.storage())
        } else {
            let d = dst.memory.storage();
            (src.memory.storage(), d)
        };
        for z in 0..self.depth {
            for y in 0..self.rows {
                let from = src.row(z, y, self.row_bytes, src_storage.len())?;
                let to = dst.row(z, y, self.row_bytes, dst_storage.len())?;
                dst_storage[to].copy_from_slice(&src_storage[from]);
            }
        }
        Ok(())
    }
}

/// Region filled with a repeated texel pattern.
#[derive(Debug, Clone)]
pub struct FillBox {
    pub dst: CopyRegion,
    pub pattern: Vec<u8>,
    pub row_bytes: u64,
    pub rows: u32,
    pub depth: u32,
}

impl FillBox {
    fn execute(&self) -> RhiResult<()> {
        if self.pattern.is_empty() {
            return Ok(());
        }
        let mut storage = self.dst.memory.storage();
        let len = storage.len();
        for z in 0..self.depth {
            for y in 0..self.rows {
                let row = self.dst.row(z, y, self.row_bytes, len)?;
                for texel in storage[row].chunks_exact_mut(self.pattern.len()) {
                    texel.copy_from_slice(&self.pattern);
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ColorTarget<B: Backend> {
    pub texture: u64,
    pub format: Option<B::NativeFormat>,
    pub load_op: LoadOp,
    pub load_action: B::NativeLoadAction,
    pub store_op: StoreOp,
    pub store_action: B::NativeStoreAction,
    pub clear: Option<FillBox>,
}

#[derive(Debug, Clone)]
pub struct DepthStencilTarget<B: Backend> {
    pub texture: u64,
    pub format: Option<B::NativeFormat>,
    pub depth_load_action: B::NativeLoadAction,
    pub depth_store_action: B::NativeStoreAction,
    pub stencil_load_action: B::NativeLoadAction,
    pub stencil_store_action: B::NativeStoreAction,
    pub clear: Option<FillBox>,
}

#[derive(Debug, Clone)]
pub enum Command<B: Backend> {
    BeginRenderPass {
        color_targets: Vec<ColorTarget<B>>,
        depth_stencil: Option<DepthStencilTarget<B>>,
        width: u32,
        height: u32,
    },
    EndRenderPass {
        resolves: Vec<CopyBox>,
    },
    BeginComputePass,
    EndComputePass,
    BeginCopyPass,
    EndCopyPass,
    Barrier(Vec<B::Barrier>),
    SetPipelineLayout {
        handle: u64,
        compute: bool,
    },
    SetPipelineState {
        handle: u64,
        topology: Option<B::NativeTopology>,
    },
    SetVertexBuffers {
        first_slot: u32,
        addresses: Vec<u64>,
    },
    SetIndexBuffer {
        address: u64,
        index_type: B::NativeIndexType,
    },
    SetDescriptorSet {
        set_index: u32,
        handle: u64,
        address: u64,
        compute: bool,
    },
    SetViewports(Vec<Viewport>),
    SetScissorRects(Vec<ScissorRect>),
    SetBlendFactor(Vec4),
    SetStencilRef(u32),
    Draw {
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        start_index_byte_offset: u64,
        base_vertex: i32,
        start_instance: u32,
    },
    Dispatch {
        groups: UVec3,
        threads_per_group: UVec3,
    },
    CopyBuffer(CopyBox),
    CopyTexture(CopyBox),
    CopyBufferToTexture(CopyBox),
    CopyTextureToBuffer(CopyBox),
    BeginEvent(String),
    EndEvent,
}

impl<B: Backend> Command<B> {
    /// Host-side effect of the command, if any.
    pub(crate) fn execute(&self) -> RhiResult<()> {
        match self {
            Command::BeginRenderPass {
                color_targets,
                depth_stencil,
                ..
            } => {
                for clear in color_targets.iter().filter_map(|t| t.clear.as_ref()) {
                    clear.execute()?;
                }
                if let Some(clear) = depth_stencil.as_ref().and_then(|d| d.clear.as_ref()) {
                    clear.execute()?;
                }
                Ok(())
            }
            Command::EndRenderPass { resolves } => resolves.iter().try_for_each(CopyBox::execute),
            Command::CopyBuffer(copy)
            | Command::CopyTexture(copy)
            | Command::CopyBufferToTexture(copy)
            | Command::CopyTextureToBuffer(copy) => copy.execute(),
            Command::Barrier(barriers) => {
                log::trace!("{:?} barrier batch: {:?}", B::KIND, barriers);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Recording
// ---------------------------------------------------------------------------

struct TextureRegion {
    region: CopyRegion,
    row_bytes: u64,
    rows: u32,
    depth: u32,
    width: u32,
    height: u32,
}

fn texture_region(texture: &Texture, mip_slice: u32, array_slice: u32) -> RhiResult<TextureRegion> {
    let footprint = texture.footprint(mip_slice, array_slice).ok_or_else(|| {
        RhiError::bad_arguments(format!(
            "texture #{} has no subresource (mip {}, slice {})",
            texture.native_handle(),
            mip_slice,
            array_slice
        ))
    })?;
    let (_, block_h, _) = texture.get_desc().format.block_info();
    Ok(TextureRegion {
        region: CopyRegion {
            memory: texture.memory().clone(),
            offset: footprint.offset,
            row_pitch: footprint.row_pitch,
            slice_pitch: footprint.slice_pitch,
        },
        row_bytes: footprint.row_pitch,
        rows: footprint.height.div_ceil(block_h),
        depth: footprint.depth,
        width: footprint.width,
        height: footprint.height,
    })
}

fn require_buffer_usage(buffer: &Buffer, usage: BufferUsageFlags) -> RhiResult<()> {
    if buffer.get_desc().usages.contains(usage) {
        Ok(())
    } else {
        Err(RhiError::bad_arguments(format!(
            "buffer #{} lacks usage {:?}",
            buffer.native_handle(),
            usage
        )))
    }
}

fn require_texture_usage(texture: &Texture, usage: TextureUsageFlags) -> RhiResult<()> {
    if texture.get_desc().usages.contains(usage) {
        Ok(())
    } else {
        Err(RhiError::bad_arguments(format!(
            "texture #{} lacks usage {:?}",
            texture.native_handle(),
            usage
        )))
    }
}

#[derive(Debug, Clone, Copy)]
struct IndexBinding {
    stride: u32,
}

pub struct CommandBuffer<B: Backend> {
    // Target queue (fixed at creation)
    device: Arc<Device<B>>,
    queue_index: u32,
    queue_type: CommandQueueType,
    queue_family: u32,

    // Recorded work and everything it points at
    commands: Vec<Command<B>>,
    pass: PassKind,
    retained: Vec<DeviceObject>,

    // Bindings later commands depend on (index offsets, group sizes)
    index_buffer: Option<IndexBinding>,
    graphics_layout: Option<Arc<PipelineLayout>>,
    compute_layout: Option<Arc<PipelineLayout>>,
    compute_pipeline: Option<Arc<PipelineState>>,
    /// Resolves recorded by `end_render_pass`.
    pending_resolves: Vec<CopyBox>,
    event_depth: u32,

    // Completion of the last submission; reset clears it, or swaps in a fresh
    // one while that submission is still executing
    status: Arc<SubmissionStatus>,
    validate: bool,
}

impl<B: Backend> CommandBuffer<B> {
    pub(crate) fn new(device: Arc<Device<B>>, queue_index: u32, queue_type: CommandQueueType) -> Self {
        let validate = device.validation_enabled();
        Self {
            device,
            queue_index,
            queue_type,
            queue_family: queue_type.family_index(),
            commands: Vec::new(),
            pass: PassKind::None,
            retained: Vec::new(),
            index_buffer: None,
            graphics_layout: None,
            compute_layout: None,
            compute_pipeline: None,
            pending_resolves: Vec::new(),
            event_depth: 0,
            status: Arc::new(SubmissionStatus::default()),
            validate,
        }
    }

    pub fn device(&self) -> &Arc<Device<B>> {
        &self.device
    }

    pub fn queue_index(&self) -> u32 {
        self.queue_index
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    pub fn current_pass(&self) -> PassKind {
        self.pass
    }

    pub fn commands(&self) -> &[Command<B>] {
        &self.commands
    }

    pub fn retained_objects(&self) -> &[DeviceObject] {
        &self.retained
    }

    /// Keeps `object` alive until the next `reset`.
    pub fn attach_device_object(&mut self, object: impl Into<DeviceObject>) {
        self.retained.push(object.into());
    }

    // -- lifetime -----------------------------------------------------------

    /// Returns the buffer to Idle and drops every retained object.
    pub fn reset(&mut self) {
        check_precondition!(
            self.validate,
            !self.status.is_executing(),
            "command buffer reset while its submission is executing"
        );
        self.commands.clear();
        self.retained.clear();
        self.pass = PassKind::None;
        self.index_buffer = None;
        self.graphics_layout = None;
        self.compute_layout = None;
        self.compute_pipeline = None;
        self.pending_resolves.clear();
        self.event_depth = 0;
        if self.status.is_executing() {
            // Never share a status with work still in flight.
            self.status = Arc::new(SubmissionStatus::default());
        } else {
            self.status.reset();
        }
    }

    /// Blocks until the last submission completes and returns its result.
    pub fn wait(&self) -> RhiResult<()> {
        self.status.wait();
        self.status.result().unwrap_or(Ok(()))
    }

    /// `true` once nothing submitted from this buffer is still executing.
    pub fn try_wait(&self) -> bool {
        !self.status.is_executing()
    }

    pub fn completion_result(&self) -> Option<RhiResult<()>> {
        self.status.result()
    }

    pub fn submit(
        &mut self,
        wait_fences: &[Arc<Fence>],
        signal_fences: &[Arc<Fence>],
        wait_for_completion: bool,
    ) -> RhiResult<()> {
        check_precondition!(self.validate, self.pass == PassKind::None, "submit with a {:?} pass open", self.pass);
        check_precondition!(self.validate, self.event_depth == 0, "submit with {} open debug events", self.event_depth);
        check_precondition!(
            self.validate,
            self.status.is_idle(),
            "command buffer submitted twice without reset"
        );

        let queue = self
            .device
            .queue(self.queue_index)
            .ok_or_else(|| RhiError::bad_arguments(format!("queue {} does not exist", self.queue_index)))?;

        // The submission keeps its own copy of the retain list: a reset while
        // it is still executing must not free resources the worker is reading.
        let mut retained = self.retained.clone();
        retained.extend(wait_fences.iter().chain(signal_fences).cloned().map(DeviceObject::Fence));

        log::debug!(
            "Submit {} commands to queue {} (wait {}, signal {})",
            self.commands.len(),
            self.queue_index,
            wait_fences.len(),
            signal_fences.len()
        );
        // Mark busy before handing off so wait() cannot race the worker
        self.status.begin();
        queue.submit(Submission {
            commands: self.commands.clone(),
            retained,
            wait_fences: wait_fences.to_vec(),
            signal_fences: signal_fences.to_vec(),
            status: self.status.clone(),
        })?;

        if wait_for_completion {
            self.wait()
        } else {
            Ok(())
        }
    }

    // -- barriers -----------------------------------------------------------

    /// Resolves every barrier against tracked state and records the native
    /// barriers. On error the barriers resolved before the failing one stay
    /// recorded.
    pub fn resource_barrier(
        &mut self,
        buffer_barriers: &[BufferBarrier],
        texture_barriers: &[TextureBarrier],
    ) -> RhiResult<()> {
        check_precondition!(
            self.validate,
            self.pass != PassKind::Render,
            "resource_barrier inside a render pass"
        );

        let queue_families = self.device.queue_families();
        let ctx = ResolveContext {
            family: self.queue_family,
            explicit_ownership: B::EXPLICIT_QUEUE_OWNERSHIP,
            queue_families,
        };
        let barrier_ctx = BarrierContext {
            pass: self.pass,
            queue_family: self.queue_family,
        };

        let mut native = Vec::new();
        let mut result = Ok(());
        for barrier in buffer_barriers {
            match resolve_buffer_barrier(&ctx, barrier) {
                Ok(resolved) => {
                    log::trace!("Buffer barrier {:?}", resolved);
                    B::translate_buffer_barrier(&barrier_ctx, &resolved, &mut native);
                    self.retained.push(DeviceObject::Buffer(barrier.buffer.clone()));
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        if result.is_ok() {
            for barrier in texture_barriers {
                match resolve_texture_barrier(&ctx, barrier) {
                    Ok(resolved) => {
                        log::trace!("Texture barrier {:?}", resolved);
                        B::translate_texture_barrier(&barrier_ctx, &resolved, &mut native);
                        self.retained.push(DeviceObject::Texture(barrier.texture.clone()));
                    }
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
        }

        B::finish_barrier_batch(&barrier_ctx, &mut native, 0);
        if !native.is_empty() {
            self.commands.push(Command::Barrier(native));
        }
        result
    }

    // -- render pass --------------------------------------------------------

    pub fn begin_render_pass(&mut self, desc: &RenderPassDesc) -> RhiResult<()> {
        check_precondition!(
            self.validate,
            self.pass == PassKind::None,
            "begin_render_pass while a {:?} pass is open",
            self.pass
        );
        if !self.queue_type.supports_graphics() {
            return Err(RhiError::not_supported(format!(
                "render pass on {:?} queue {}",
                self.queue_type, self.queue_index
            )));
        }
        if desc.color_attachments.len() > MAX_COLOR_ATTACHMENTS {
            return Err(RhiError::bad_arguments(format!(
                "{} color attachments exceed the limit of {}",
                desc.color_attachments.len(),
                MAX_COLOR_ATTACHMENTS
            )));
        }

        // Render target size comes from the first attachment (at its mip);
        // every other attachment must match it, sample count included.
        let mut size: Option<(u32, u32, u32)> = None;
        let mut check_extent = |texture: &Texture, mip: u32| -> RhiResult<()> {
            let (w, h, _) = texture.get_desc().mip_extent(mip);
            let samples = texture.get_desc().sample_count;
            match size {
                None => size = Some((w, h, samples)),
                Some(expected) if expected == (w, h, samples) => {}
                Some(expected) => {
                    return Err(RhiError::bad_arguments(format!(
                        "attachment #{} is {}x{}x{} samples, pass is {}x{}x{}",
                        texture.native_handle(),
                        w,
                        h,
                        samples,
                        expected.0,
                        expected.1,
                        expected.2
                    )))
                }
            }
            Ok(())
        };

        let mut color_targets = Vec::with_capacity(desc.color_attachments.len());
        let mut resolves = Vec::new();
        let mut retained = Vec::new();
        for attachment in &desc.color_attachments {
            let texture = &attachment.texture;
            require_texture_usage(texture, TextureUsageFlags::COLOR_ATTACHMENT)?;
            let target = texture_region(texture, attachment.mip_slice, attachment.array_slice)?;
            check_extent(texture, attachment.mip_slice)?;
            let format = texture.get_desc().format;

            // Clear color: explicit value first, then the texture's optimized
            // clear value, then black.
            let clear = if attachment.load_op == LoadOp::Clear {
                let color = attachment
                    .clear_color
                    .or(match texture.clear_value() {
                        Some(ClearValue::Color(color)) => Some(color),
                        _ => None,
                    })
                    .unwrap_or(Vec4::ZERO);
                format.encode_clear_color(color).map(|pattern| FillBox {
                    dst: target.region.clone(),
                    pattern,
                    row_bytes: target.row_bytes,
                    rows: target.rows,
                    depth: target.depth,
                })
            } else {
                None
            };

            // A resolve target turns the store action into store-and-resolve;
            // the copy itself runs when the pass ends.
            if let Some(resolve) = &attachment.resolve {
                let dst = &resolve.texture;
                require_texture_usage(dst, TextureUsageFlags::RESOLVE_ATTACHMENT)?;
                let dst_region = texture_region(dst, resolve.mip_slice, resolve.array_slice)?;
                if dst.get_desc().format != format
                    || (dst_region.width, dst_region.height) != (target.width, target.height)
                {
                    return Err(RhiError::bad_arguments(format!(
                        "resolve target #{} does not match attachment #{}",
                        dst.native_handle(),
                        texture.native_handle()
                    )));
                }
                if texture.get_desc().sample_count <= 1 || dst.get_desc().sample_count != 1 {
                    return Err(RhiError::bad_arguments(format!(
                        "resolve needs a multisampled source and single-sampled target (#{} -> #{})",
                        texture.native_handle(),
                        dst.native_handle()
                    )));
                }
                resolves.push(CopyBox {
                    src: target.region.clone(),
                    dst: dst_region.region,
                    row_bytes: target.row_bytes,
                    rows: target.rows,
                    depth: target.depth,
                });
                retained.push(DeviceObject::Texture(dst.clone()));
            }

            color_targets.push(ColorTarget {
                texture: texture.native_handle(),
                format: B::encode_format(format),
                load_op: attachment.load_op,
                load_action: B::encode_load_action(attachment.load_op),
                store_op: attachment.store_op,
                store_action: B::encode_store_action(attachment.store_op, attachment.resolve.is_some()),
                clear,
            });
            retained.push(DeviceObject::Texture(texture.clone()));
        }

        let depth_stencil = match &desc.depth_stencil {
            Some(attachment) => {
                let texture = &attachment.texture;
                require_texture_usage(texture, TextureUsageFlags::DEPTH_STENCIL_ATTACHMENT)?;
                let target = texture_region(texture, attachment.mip_slice, attachment.array_slice)?;
                check_extent(texture, attachment.mip_slice)?;
                let format = texture.get_desc().format;
                let clear = if attachment.depth_load_op == LoadOp::Clear {
                    format.encode_clear_depth(attachment.clear_depth).map(|pattern| FillBox {
                        dst: target.region.clone(),
                        pattern,
                        row_bytes: target.row_bytes,
                        rows: target.rows,
                        depth: target.depth,
                    })
                } else {
                    None
                };
                retained.push(DeviceObject::Texture(texture.clone()));
                Some(DepthStencilTarget {
                    texture: texture.native_handle(),
                    format: B::encode_format(format),
                    depth_load_action: B::encode_load_action(attachment.depth_load_op),
                    depth_store_action: B::encode_store_action(attachment.depth_store_op, false),
                    stencil_load_action: B::encode_load_action(attachment.stencil_load_op),
                    stencil_store_action: B::encode_store_action(attachment.stencil_store_op, false),
                    clear,
                })
            }
            None => None,
        };

        let (width, height, _) = size.unwrap_or((0, 0, 1));
        self.retained.extend(retained);
        self.commands.push(Command::BeginRenderPass {
            color_targets,
            depth_stencil,
            width,
            height,
        });
        self.pending_resolves = resolves;
        self.pass = PassKind::Render;
        Ok(())
    }

    pub fn end_render_pass(&mut self) {
        check_precondition!(self.validate, self.pass == PassKind::Render, "end_render_pass without a render pass");
        let resolves = std::mem::take(&mut self.pending_resolves);
        self.commands.push(Command::EndRenderPass { resolves });
        self.pass = PassKind::None;
    }

    pub fn set_graphics_pipeline_layout(&mut self, layout: &Arc<PipelineLayout>) {
        self.graphics_layout = Some(layout.clone());
        self.retained.push(DeviceObject::PipelineLayout(layout.clone()));
        self.commands.push(Command::SetPipelineLayout {
            handle: layout.native_handle(),
            compute: false,
        });
    }

    pub fn set_graphics_pipeline_state(&mut self, pipeline: &Arc<PipelineState>) {
        check_precondition!(self.validate, !pipeline.is_compute(), "compute pipeline bound as graphics pipeline");
        self.retained.push(DeviceObject::PipelineState(pipeline.clone()));
        self.commands.push(Command::SetPipelineState {
            handle: pipeline.native_handle(),
            topology: pipeline.primitive_topology().map(B::encode_primitive_topology),
        });
    }

    pub fn set_vertex_buffers(&mut self, first_slot: u32, views: &[VertexBufferView]) -> RhiResult<()> {
        if first_slot as usize + views.len() > MAX_VERTEX_BUFFERS {
            return Err(RhiError::bad_arguments(format!(
                "vertex buffer slots {}..{} exceed the limit of {}",
                first_slot,
                first_slot as usize + views.len(),
                MAX_VERTEX_BUFFERS
            )));
        }
        let mut addresses = Vec::with_capacity(views.len());
        for view in views {
            require_buffer_usage(&view.buffer, BufferUsageFlags::VERTEX_BUFFER)?;
            if view.offset >= view.buffer.get_desc().size {
                return Err(RhiError::bad_arguments(format!(
                    "vertex buffer offset {} is outside buffer #{}",
                    view.offset,
                    view.buffer.native_handle()
                )));
            }
            addresses.push(view.buffer.gpu_address() + view.offset);
        }
        self.retained
            .extend(views.iter().map(|v| DeviceObject::Buffer(v.buffer.clone())));
        self.commands.push(Command::SetVertexBuffers { first_slot, addresses });
        Ok(())
    }

    pub fn set_index_buffer(&mut self, view: &IndexBufferView) -> RhiResult<()> {
        require_buffer_usage(&view.buffer, BufferUsageFlags::INDEX_BUFFER)?;
        let (stride, index_type) = match (view.format.index_stride(), B::encode_index_type(view.format)) {
            (Some(stride), Some(index_type)) => (stride, index_type),
            _ => {
                return Err(RhiError::bad_arguments(format!(
                    "{:?} is not an index format",
                    view.format
                )))
            }
        };
        if view.offset % stride as u64 != 0 || view.offset >= view.buffer.get_desc().size {
            return Err(RhiError::bad_arguments(format!(
                "index buffer offset {} is invalid for buffer #{}",
                view.offset,
                view.buffer.native_handle()
            )));
        }
        self.index_buffer = Some(IndexBinding { stride });
        self.retained.push(DeviceObject::Buffer(view.buffer.clone()));
        self.commands.push(Command::SetIndexBuffer {
            address: view.buffer.gpu_address() + view.offset,
            index_type,
        });
        Ok(())
    }

    pub fn set_graphics_descriptor_set(&mut self, set_index: u32, set: &Arc<DescriptorSet>) {
        self.bind_descriptor_set(set_index, set, false);
    }

    pub fn set_graphics_descriptor_sets(&mut self, first_set: u32, sets: &[Arc<DescriptorSet>]) {
        for (i, set) in sets.iter().enumerate() {
            self.bind_descriptor_set(first_set + i as u32, set, false);
        }
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.set_viewports(&[viewport]);
    }

    pub fn set_viewports(&mut self, viewports: &[Viewport]) {
        check_precondition!(self.validate, self.pass == PassKind::Render, "set_viewports outside a render pass");
        check_precondition!(
            self.validate,
            viewports.len() <= MAX_VIEWPORTS,
            "{} viewports exceed the limit of {}",
            viewports.len(),
            MAX_VIEWPORTS
        );
        self.commands.push(Command::SetViewports(viewports.to_vec()));
    }

    pub fn set_scissor_rect(&mut self, rect: ScissorRect) {
        self.set_scissor_rects(&[rect]);
    }

    pub fn set_scissor_rects(&mut self, rects: &[ScissorRect]) {
        check_precondition!(self.validate, self.pass == PassKind::Render, "set_scissor_rects outside a render pass");
        check_precondition!(
            self.validate,
            rects.len() <= MAX_VIEWPORTS,
            "{} scissor rects exceed the limit of {}",
            rects.len(),
            MAX_VIEWPORTS
        );
        self.commands.push(Command::SetScissorRects(rects.to_vec()));
    }

    pub fn set_blend_factor(&mut self, factor: Vec4) {
        check_precondition!(self.validate, self.pass == PassKind::Render, "set_blend_factor outside a render pass");
        self.commands.push(Command::SetBlendFactor(factor));
    }

    pub fn set_stencil_ref(&mut self, reference: u32) {
        check_precondition!(self.validate, self.pass == PassKind::Render, "set_stencil_ref outside a render pass");
        self.commands.push(Command::SetStencilRef(reference));
    }

    pub fn draw(&mut self, vertex_count: u32, start_vertex: u32) {
        self.draw_instanced(vertex_count, 1, start_vertex, 0);
    }

    pub fn draw_instanced(&mut self, vertex_count: u32, instance_count: u32, start_vertex: u32, start_instance: u32) {
        check_precondition!(self.validate, self.pass == PassKind::Render, "draw outside a render pass");
        self.commands.push(Command::Draw {
            vertex_count,
            instance_count,
            start_vertex,
            start_instance,
        });
    }

    pub fn draw_indexed(&mut self, index_count: u32, start_index: u32, base_vertex: i32) {
        self.draw_indexed_instanced(index_count, 1, start_index, base_vertex, 0);
    }

    pub fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    ) {
        check_precondition!(self.validate, self.pass == PassKind::Render, "draw_indexed outside a render pass");
        check_precondition!(
            self.validate,
            self.index_buffer.is_some(),
            "draw_indexed without an index buffer"
        );
        let stride = self.index_buffer.map_or(4, |binding| binding.stride);
        self.commands.push(Command::DrawIndexed {
            index_count,
            instance_count,
            start_index_byte_offset: start_index as u64 * stride as u64,
            base_vertex,
            start_instance,
        });
    }

    // -- compute pass -------------------------------------------------------

    pub fn begin_compute_pass(&mut self) -> RhiResult<()> {
        check_precondition!(
            self.validate,
            self.pass == PassKind::None,
            "begin_compute_pass while a {:?} pass is open",
            self.pass
        );
        if !self.queue_type.supports_compute() {
            return Err(RhiError::not_supported(format!(
                "compute pass on {:?} queue {}",
                self.queue_type, self.queue_index
            )));
        }
        self.commands.push(Command::BeginComputePass);
        self.pass = PassKind::Compute;
        Ok(())
    }

    pub fn end_compute_pass(&mut self) {
        check_precondition!(self.validate, self.pass == PassKind::Compute, "end_compute_pass without a compute pass");
        self.commands.push(Command::EndComputePass);
        self.pass = PassKind::None;
    }

    pub fn set_compute_pipeline_layout(&mut self, layout: &Arc<PipelineLayout>) {
        self.compute_layout = Some(layout.clone());
        self.retained.push(DeviceObject::PipelineLayout(layout.clone()));
        self.commands.push(Command::SetPipelineLayout {
            handle: layout.native_handle(),
            compute: true,
        });
    }

    pub fn set_compute_pipeline_state(&mut self, pipeline: &Arc<PipelineState>) {
        check_precondition!(self.validate, pipeline.is_compute(), "graphics pipeline bound as compute pipeline");
        self.compute_pipeline = Some(pipeline.clone());
        self.retained.push(DeviceObject::PipelineState(pipeline.clone()));
        self.commands.push(Command::SetPipelineState {
            handle: pipeline.native_handle(),
            topology: None,
        });
    }

    pub fn set_compute_descriptor_set(&mut self, set_index: u32, set: &Arc<DescriptorSet>) {
        self.bind_descriptor_set(set_index, set, true);
    }

    pub fn set_compute_descriptor_sets(&mut self, first_set: u32, sets: &[Arc<DescriptorSet>]) {
        for (i, set) in sets.iter().enumerate() {
            self.bind_descriptor_set(first_set + i as u32, set, true);
        }
    }

    /// Dispatches `groups` thread groups sized by the bound compute pipeline.
    pub fn dispatch(&mut self, groups_x: u32, groups_y: u32, groups_z: u32) {
        check_precondition!(self.validate, self.pass == PassKind::Compute, "dispatch outside a compute pass");
        check_precondition!(
            self.validate,
            self.compute_pipeline.is_some(),
            "dispatch without a compute pipeline"
        );
        let threads_per_group = self
            .compute_pipeline
            .as_ref()
            .and_then(|p| p.threads_per_group())
            .unwrap_or(UVec3::ONE);
        self.commands.push(Command::Dispatch {
            groups: UVec3::new(groups_x, groups_y, groups_z),
            threads_per_group,
        });
    }

    // -- copy pass ----------------------------------------------------------

    pub fn begin_copy_pass(&mut self) {
        check_precondition!(
            self.validate,
            self.pass == PassKind::None,
            "begin_copy_pass while a {:?} pass is open",
            self.pass
        );
        self.commands.push(Command::BeginCopyPass);
        self.pass = PassKind::Copy;
    }

    pub fn end_copy_pass(&mut self) {
        check_precondition!(self.validate, self.pass == PassKind::Copy, "end_copy_pass without a copy pass");
        self.commands.push(Command::EndCopyPass);
        self.pass = PassKind::None;
    }

    pub fn copy_buffer(
        &mut self,
        dst: &Arc<Buffer>,
        dst_offset: u64,
        src: &Arc<Buffer>,
        src_offset: u64,
        size: u64,
    ) -> RhiResult<()> {
        check_precondition!(self.validate, self.pass == PassKind::Copy, "copy_buffer outside a copy pass");
        require_buffer_usage(src, BufferUsageFlags::COPY_SOURCE)?;
        require_buffer_usage(dst, BufferUsageFlags::COPY_DEST)?;
        for (buffer, offset) in [(src, src_offset), (dst, dst_offset)] {
            if offset.checked_add(size).map_or(true, |end| end > buffer.get_desc().size) {
                return Err(RhiError::bad_arguments(format!(
                    "copy range [{}, +{}) is outside buffer #{} of {} bytes",
                    offset,
                    size,
                    buffer.native_handle(),
                    buffer.get_desc().size
                )));
            }
        }
        self.push_buffer_copy(dst, dst_offset, src, src_offset, size);
        Ok(())
    }

    /// Copies one whole subresource. Extents and texel block sizes must match.
    pub fn copy_texture(
        &mut self,
        dst: &Arc<Texture>,
        dst_mip: u32,
        dst_slice: u32,
        src: &Arc<Texture>,
        src_mip: u32,
        src_slice: u32,
    ) -> RhiResult<()> {
        check_precondition!(self.validate, self.pass == PassKind::Copy, "copy_texture outside a copy pass");
        require_texture_usage(src, TextureUsageFlags::COPY_SOURCE)?;
        require_texture_usage(dst, TextureUsageFlags::COPY_DEST)?;
        let copy = Self::texture_copy_box(dst, dst_mip, dst_slice, src, src_mip, src_slice)?;
        self.retain_textures(&[dst, src]);
        self.commands.push(Command::CopyTexture(copy));
        Ok(())
    }

    /// `src_row_pitch == 0` means rows are tightly packed.
    pub fn copy_buffer_to_texture(
        &mut self,
        dst: &Arc<Texture>,
        dst_mip: u32,
        dst_slice: u32,
        src: &Arc<Buffer>,
        src_offset: u64,
        src_row_pitch: u64,
    ) -> RhiResult<()> {
        check_precondition!(
            self.validate,
            self.pass == PassKind::Copy,
            "copy_buffer_to_texture outside a copy pass"
        );
        require_buffer_usage(src, BufferUsageFlags::COPY_SOURCE)?;
        require_texture_usage(dst, TextureUsageFlags::COPY_DEST)?;
        let target = texture_region(dst, dst_mip, dst_slice)?;
        let linear = Self::linear_region(src, src_offset, src_row_pitch, &target)?;
        self.retained.push(DeviceObject::Buffer(src.clone()));
        self.retain_textures(&[dst]);
        self.commands.push(Command::CopyBufferToTexture(CopyBox {
            src: linear,
            dst: target.region,
            row_bytes: target.row_bytes,
            rows: target.rows,
            depth: target.depth,
        }));
        Ok(())
    }

    /// `dst_row_pitch == 0` means rows are tightly packed.
    pub fn copy_texture_to_buffer(
        &mut self,
        dst: &Arc<Buffer>,
        dst_offset: u64,
        dst_row_pitch: u64,
        src: &Arc<Texture>,
        src_mip: u32,
        src_slice: u32,
    ) -> RhiResult<()> {
        check_precondition!(
            self.validate,
            self.pass == PassKind::Copy,
            "copy_texture_to_buffer outside a copy pass"
        );
        require_texture_usage(src, TextureUsageFlags::COPY_SOURCE)?;
        require_buffer_usage(dst, BufferUsageFlags::COPY_DEST)?;
        let source = texture_region(src, src_mip, src_slice)?;
        let linear = Self::linear_region(dst, dst_offset, dst_row_pitch, &source)?;
        self.retained.push(DeviceObject::Buffer(dst.clone()));
        self.retain_textures(&[src]);
        self.commands.push(Command::CopyTextureToBuffer(CopyBox {
            src: source.region,
            dst: linear,
            row_bytes: source.row_bytes,
            rows: source.rows,
            depth: source.depth,
        }));
        Ok(())
    }

    /// Buffer to buffer copies `min(dst, src)` bytes; texture to texture
    /// copies every subresource. Mixing kinds records nothing.
    pub fn copy_resource<'a>(
        &mut self,
        dst: impl Into<ResourceRef<'a>>,
        src: impl Into<ResourceRef<'a>>,
    ) -> RhiResult<()> {
        check_precondition!(self.validate, self.pass == PassKind::Copy, "copy_resource outside a copy pass");
        match (dst.into(), src.into()) {
            (ResourceRef::Buffer(dst), ResourceRef::Buffer(src)) => {
                require_buffer_usage(src, BufferUsageFlags::COPY_SOURCE)?;
                require_buffer_usage(dst, BufferUsageFlags::COPY_DEST)?;
                let size = dst.get_desc().size.min(src.get_desc().size);
                self.push_buffer_copy(dst, 0, src, 0, size);
                Ok(())
            }
            (ResourceRef::Texture(dst), ResourceRef::Texture(src)) => {
                require_texture_usage(src, TextureUsageFlags::COPY_SOURCE)?;
                require_texture_usage(dst, TextureUsageFlags::COPY_DEST)?;
                let (d, s) = (dst.get_desc(), src.get_desc());
                if (d.mip_levels, d.array_size, d.sample_count) != (s.mip_levels, s.array_size, s.sample_count) {
                    return Err(RhiError::bad_arguments(format!(
                        "texture #{} and #{} have different subresource layouts",
                        dst.native_handle(),
                        src.native_handle()
                    )));
                }
                let mut copies = Vec::with_capacity(d.subresource_count() as usize);
                for slice in 0..d.array_size {
                    for mip in 0..d.mip_levels {
                        copies.push(Self::texture_copy_box(dst, mip, slice, src, mip, slice)?);
                    }
                }
                self.retain_textures(&[dst, src]);
                self.commands.extend(copies.into_iter().map(Command::CopyTexture));
                Ok(())
            }
            (dst, src) => {
                log::debug!("copy_resource between {:?} and {:?} ignored", dst, src);
                Ok(())
            }
        }
    }

    // -- debug events -------------------------------------------------------

    pub fn begin_event(&mut self, name: &str) {
        self.event_depth += 1;
        self.commands.push(Command::BeginEvent(name.to_string()));
    }

    pub fn end_event(&mut self) {
        check_precondition!(self.validate, self.event_depth > 0, "end_event without begin_event");
        self.event_depth = self.event_depth.saturating_sub(1);
        self.commands.push(Command::EndEvent);
    }

    // -- helpers ------------------------------------------------------------

    fn bind_descriptor_set(&mut self, set_index: u32, set: &Arc<DescriptorSet>, compute: bool) {
        let layout = if compute { &self.compute_layout } else { &self.graphics_layout };
        if let Some(layout) = layout {
            check_precondition!(
                self.validate,
                (set_index as usize) < layout.num_sets(),
                "descriptor set {} is outside pipeline layout #{} with {} sets",
                set_index,
                layout.native_handle(),
                layout.num_sets()
            );
        }
        // The set may be rewritten before this buffer executes.
        self.retained.extend(set.bound_objects());
        self.retained.push(DeviceObject::DescriptorSet(set.clone()));
        self.commands.push(Command::SetDescriptorSet {
            set_index,
            handle: set.native_handle(),
            address: set.gpu_address(),
            compute,
        });
    }

    fn push_buffer_copy(&mut self, dst: &Arc<Buffer>, dst_offset: u64, src: &Arc<Buffer>, src_offset: u64, size: u64) {
        self.retained.push(DeviceObject::Buffer(dst.clone()));
        self.retained.push(DeviceObject::Buffer(src.clone()));
        self.commands.push(Command::CopyBuffer(CopyBox {
            src: CopyRegion {
                memory: src.memory().clone(),
                offset: src.memory_offset() + src_offset,
                row_pitch: size,
                slice_pitch: size,
            },
            dst: CopyRegion {
                memory: dst.memory().clone(),
                offset: dst.memory_offset() + dst_offset,
                row_pitch: size,
                slice_pitch: size,
            },
            row_bytes: size,
            rows: 1,
            depth: 1,
        }));
    }

    fn retain_textures(&mut self, textures: &[&Arc<Texture>]) {
        self.retained
            .extend(textures.iter().map(|t| DeviceObject::Texture((*t).clone())));
    }

    fn texture_copy_box(
        dst: &Texture,
        dst_mip: u32,
        dst_slice: u32,
        src: &Texture,
        src_mip: u32,
        src_slice: u32,
    ) -> RhiResult<CopyBox> {
        let to = texture_region(dst, dst_mip, dst_slice)?;
        let from = texture_region(src, src_mip, src_slice)?;
        let compatible = dst.get_desc().format.block_info() == src.get_desc().format.block_info();
        if !compatible || (to.row_bytes, to.rows, to.depth) != (from.row_bytes, from.rows, from.depth) {
            return Err(RhiError::bad_arguments(format!(
                "subresource (mip {}, slice {}) of #{} cannot receive (mip {}, slice {}) of #{}",
                dst_mip,
                dst_slice,
                dst.native_handle(),
                src_mip,
                src_slice,
                src.native_handle()
            )));
        }
        Ok(CopyBox {
            src: from.region,
            dst: to.region,
            row_bytes: to.row_bytes,
            rows: to.rows,
            depth: to.depth,
        })
    }

    /// Pitched view of `buffer` laid out like `texture`.
    fn linear_region(buffer: &Buffer, offset: u64, row_pitch: u64, texture: &TextureRegion) -> RhiResult<CopyRegion> {
        let row_pitch = if row_pitch == 0 { texture.row_bytes } else { row_pitch };
        if row_pitch < texture.row_bytes {
            return Err(RhiError::bad_arguments(format!(
                "row pitch {} is smaller than a row of {} bytes",
                row_pitch, texture.row_bytes
            )));
        }
        let slice_pitch = row_pitch * texture.rows as u64;
        let needed = slice_pitch * (texture.depth as u64 - 1) + row_pitch * (texture.rows as u64 - 1) + texture.row_bytes;
        if offset.checked_add(needed).map_or(true, |end| end > buffer.get_desc().size) {
            return Err(RhiError::bad_arguments(format!(
                "buffer #{} of {} bytes cannot hold {} bytes at offset {}",
                buffer.native_handle(),
                buffer.get_desc().size,
                needed,
                offset
            )));
        }
        Ok(CopyRegion {
            memory: buffer.memory().clone(),
            offset: buffer.memory_offset() + offset,
            row_pitch,
            slice_pitch,
        })
    }
}

/// Viewport and scissor slots available on every backend.
pub const MAX_VIEWPORTS: usize = 16;
