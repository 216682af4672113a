// Command recording, submission and host-timeline replay

#[macro_use]
mod common;

use std::sync::Arc;
use std::time::Duration;

use glam::{UVec3, Vec4};
use prism_rhi::{
    Backend, Buffer, BufferDesc, BufferUsageFlags, ColorAttachment, Command, ComputePipelineStateDesc, Device,
    Format, IndexBufferView, MemoryType, PassKind, PipelineLayoutDesc, RenderPassDesc, ResourceHeapDesc,
    ResourceHeapUsageFlags, RhiError, ShaderBytecode, Texture, TextureBarrier, TextureDesc, TextureStateFlags,
    TextureUsageFlags, Vulkan, D3D12,
};

use common::{device, finishes_within_timeout, COMPUTE_QUEUE, COPY_QUEUE, EMPTY_SPIRV, GRAPHICS_QUEUE};

fn render_target<B: Backend>(device: &Device<B>, format: Format, size: u32) -> Arc<Texture> {
    device
        .new_texture(
            MemoryType::Local,
            &TextureDesc::tex2d(
                format,
                TextureUsageFlags::COLOR_ATTACHMENT | TextureUsageFlags::COPY_SOURCE,
                size,
                size,
                1,
                1,
            ),
            None,
        )
        .unwrap()
}

fn upload_buffer<B: Backend>(device: &Device<B>, bytes: &[u8]) -> Arc<Buffer> {
    let buffer = device
        .new_buffer(
            MemoryType::Upload,
            &BufferDesc::new(bytes.len() as u64, BufferUsageFlags::COPY_SOURCE),
        )
        .unwrap();
    let mut mapping = buffer.map(0, 0).unwrap();
    mapping.copy_from_slice(bytes);
    mapping.unmap(0, bytes.len() as u64).unwrap();
    buffer
}

fn readback_buffer<B: Backend>(device: &Device<B>, size: u64) -> Arc<Buffer> {
    device
        .new_buffer(MemoryType::Readback, &BufferDesc::new(size, BufferUsageFlags::COPY_DEST))
        .unwrap()
}

fn draw_indexed_offset<B: Backend>(format: Format, start_index: u32) -> u64 {
    let device = device::<B>();
    let target = render_target(&device, Format::Rgba8Unorm, 4);
    let indices = device
        .new_buffer(MemoryType::Local, &BufferDesc::new(256, BufferUsageFlags::INDEX_BUFFER))
        .unwrap();

    let mut cmd = device.new_command_buffer(GRAPHICS_QUEUE).unwrap();
    cmd.begin_render_pass(&RenderPassDesc {
        color_attachments: vec![ColorAttachment::new(&target)],
        depth_stencil: None,
    })
    .unwrap();
    cmd.set_index_buffer(&IndexBufferView {
        buffer: indices,
        offset: 0,
        format,
    })
    .unwrap();
    cmd.draw_indexed(3, start_index, 0);
    cmd.end_render_pass();

    cmd.commands()
        .iter()
        .find_map(|c| match c {
            Command::DrawIndexed {
                start_index_byte_offset,
                ..
            } => Some(*start_index_byte_offset),
            _ => None,
        })
        .unwrap()
}

// ---------------------------------------------------------------------------
// Recording
// ---------------------------------------------------------------------------

fn index_offsets_follow_index_size<B: Backend>() {
    assert_eq!(draw_indexed_offset::<B>(Format::R16Uint, 5), 10);
    assert_eq!(draw_indexed_offset::<B>(Format::R32Uint, 10), 40);
}

fn copy_resource_uses_smaller_buffer<B: Backend>() {
    let device = device::<B>();
    let pattern: Vec<u8> = (0..64).map(|i| i as u8 + 1).collect();
    let src = upload_buffer(&device, &pattern);
    let dst = readback_buffer(&device, 100);

    let mut cmd = device.new_command_buffer(COPY_QUEUE).unwrap();
    cmd.begin_copy_pass();
    cmd.copy_resource(&dst, &src).unwrap();
    let recorded = cmd.commands().len();
    cmd.end_copy_pass();

    match &cmd.commands()[recorded - 1] {
        Command::CopyBuffer(copy) => assert_eq!(copy.row_bytes, 64),
        other => panic!("expected a buffer copy, got {:?}", other),
    }

    cmd.submit(&[], &[], true).unwrap();
    let mapping = dst.map(0, 100).unwrap();
    assert_eq!(&mapping[..64], pattern.as_slice());
    assert!(mapping[64..].iter().all(|&b| b == 0));
    mapping.unmap(0, 0).unwrap();
}

fn copy_resource_ignores_mixed_kinds<B: Backend>() {
    let device = device::<B>();
    let buffer = readback_buffer(&device, 64);
    let texture = render_target(&device, Format::Rgba8Unorm, 4);

    let mut cmd = device.new_command_buffer(COPY_QUEUE).unwrap();
    cmd.begin_copy_pass();
    let before = cmd.commands().len();
    cmd.copy_resource(&buffer, &texture).unwrap();
    assert_eq!(cmd.commands().len(), before);
    cmd.end_copy_pass();
}

fn clear_and_read_back<B: Backend>() {
    let device = device::<B>();
    let target = render_target(&device, Format::Bgra8Unorm, 8);
    let readback = readback_buffer(&device, 8 * 8 * 4);

    let mut cmd = device.new_command_buffer(GRAPHICS_QUEUE).unwrap();
    cmd.resource_barrier(&[], &[TextureBarrier::new(&target, TextureStateFlags::COLOR_ATTACHMENT_WRITE)])
        .unwrap();
    cmd.begin_render_pass(&RenderPassDesc {
        color_attachments: vec![ColorAttachment::new(&target).clear(Vec4::new(1.0, 0.5, 0.0, 1.0))],
        depth_stencil: None,
    })
    .unwrap();
    assert_eq!(cmd.current_pass(), PassKind::Render);
    cmd.end_render_pass();
    cmd.resource_barrier(&[], &[TextureBarrier::new(&target, TextureStateFlags::COPY_SOURCE)])
        .unwrap();
    cmd.begin_copy_pass();
    cmd.copy_texture_to_buffer(&readback, 0, 0, &target, 0, 0).unwrap();
    cmd.end_copy_pass();
    cmd.submit(&[], &[], true).unwrap();

    let mapping = readback.map(0, 8 * 8 * 4).unwrap();
    for texel in mapping.chunks_exact(4) {
        assert_eq!(texel, &[0, 128, 255, 255]);
    }
    mapping.unmap(0, 0).unwrap();
}

fn compute_queue_rejects_render_pass<B: Backend>() {
    let device = device::<B>();
    let target = render_target(&device, Format::Rgba8Unorm, 4);
    let mut cmd = device.new_command_buffer(COMPUTE_QUEUE).unwrap();
    let err = cmd
        .begin_render_pass(&RenderPassDesc {
            color_attachments: vec![ColorAttachment::new(&target)],
            depth_stencil: None,
        })
        .unwrap_err();
    assert!(matches!(err, RhiError::NotSupported(_)));
    assert_eq!(cmd.current_pass(), PassKind::None);

    let mut copy = device.new_command_buffer(COPY_QUEUE).unwrap();
    assert!(matches!(copy.begin_compute_pass(), Err(RhiError::NotSupported(_))));
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

fn fence_orders_queues<B: Backend>() {
    let device = device::<B>();
    let pattern = [7u8; 256];
    let src = upload_buffer(&device, &pattern);
    let staging = device
        .new_buffer(
            MemoryType::Local,
            &BufferDesc::new(256, BufferUsageFlags::COPY_DEST | BufferUsageFlags::COPY_SOURCE),
        )
        .unwrap();
    let dst = readback_buffer(&device, 256);
    let fence = device.new_fence();

    let mut graphics = device.new_command_buffer(GRAPHICS_QUEUE).unwrap();
    graphics.begin_copy_pass();
    graphics.copy_buffer(&dst, 0, &staging, 0, 256).unwrap();
    graphics.end_copy_pass();
    // Submitted first; blocks on the fence until the copy queue signals it.
    graphics.submit(&[fence.clone()], &[], false).unwrap();
    assert!(!graphics.try_wait());

    let mut copy = device.new_command_buffer(COPY_QUEUE).unwrap();
    copy.begin_copy_pass();
    copy.copy_buffer(&staging, 0, &src, 0, 256).unwrap();
    copy.end_copy_pass();
    copy.submit(&[], &[fence.clone()], false).unwrap();

    copy.wait().unwrap();
    graphics.wait().unwrap();
    assert_eq!(fence.pending_signals(), 0);
    assert_eq!(fence.outstanding_signals(), 0);

    let mapping = dst.map(0, 256).unwrap();
    assert!(mapping.iter().all(|&b| b == 7));
    mapping.unmap(0, 0).unwrap();
}

fn reset_allows_resubmission<B: Backend>() {
    let device = device::<B>();
    let fence = device.new_fence();
    let mut cmd = device.new_command_buffer(GRAPHICS_QUEUE).unwrap();
    cmd.begin_event("frame");
    cmd.end_event();
    cmd.submit(&[], &[fence.clone()], true).unwrap();
    assert!(fence.wait_signaled(Duration::from_secs(1)));
    assert_eq!(cmd.completion_result(), Some(Ok(())));

    cmd.reset();
    assert!(cmd.commands().is_empty());
    assert_eq!(cmd.completion_result(), None);
    cmd.submit(&[], &[fence.clone()], true).unwrap();
    assert_eq!(fence.pending_signals(), 2);
}

fn aliased_buffers_share_bytes<B: Backend>() {
    let device = device::<B>();
    let memory = device
        .new_device_memory(&ResourceHeapDesc {
            memory_type: MemoryType::Upload,
            size: 64 * 1024,
            usages: ResourceHeapUsageFlags::BUFFER,
        })
        .unwrap();
    let desc = BufferDesc::new(1024, BufferUsageFlags::COPY_SOURCE);
    let writer = device.new_aliasing_buffer(&memory, 0, &desc).unwrap();
    let source = device.new_aliasing_buffer(&memory, 0, &desc).unwrap();
    let dst = readback_buffer(&device, 1024);
    {
        let mut mapping = writer.map(0, 0).unwrap();
        mapping.fill(0x5a);
        mapping.unmap(0, 1024).unwrap();
    }

    let mut cmd = device.new_command_buffer(COPY_QUEUE).unwrap();
    cmd.begin_copy_pass();
    cmd.copy_buffer(&dst, 0, &source, 0, 1024).unwrap();
    cmd.end_copy_pass();
    cmd.submit(&[], &[], true).unwrap();

    let mapping = dst.map(0, 1024).unwrap();
    assert!(mapping.iter().all(|&b| b == 0x5a));
    mapping.unmap(0, 0).unwrap();
}

fn buffers_in_one_heap_map_independently<B: Backend>() {
    finishes_within_timeout("mapping two buffers placed in one heap", || {
        let device = device::<B>();
        let memory = device
            .new_device_memory(&ResourceHeapDesc {
                memory_type: MemoryType::Upload,
                size: 128 * 1024,
                usages: ResourceHeapUsageFlags::BUFFER,
            })
            .unwrap();
        let desc = BufferDesc::new(1024, BufferUsageFlags::COPY_SOURCE);
        let first = device.new_aliasing_buffer(&memory, 0, &desc).unwrap();
        let second = device.new_aliasing_buffer(&memory, 64 * 1024, &desc).unwrap();

        let mut first_mapping = first.map(0, 0).unwrap();
        let mut second_mapping = second.map(0, 0).unwrap();
        first_mapping.fill(1);
        second_mapping.fill(2);
        second_mapping.unmap(0, 1024).unwrap();
        first_mapping.unmap(0, 1024).unwrap();

        assert!(first.map(0, 1024).unwrap().iter().all(|&b| b == 1));
        assert!(second.map(0, 1024).unwrap().iter().all(|&b| b == 2));
    });
}

fn submit_completes_while_source_is_mapped<B: Backend>() {
    finishes_within_timeout("submit copying from a mapped buffer", || {
        let device = device::<B>();
        let src = upload_buffer(&device, &[9; 256]);
        let dst = readback_buffer(&device, 256);

        let mapping = src.map(0, 256).unwrap();
        let mut cmd = device.new_command_buffer(COPY_QUEUE).unwrap();
        cmd.begin_copy_pass();
        cmd.copy_buffer(&dst, 0, &src, 0, 256).unwrap();
        cmd.end_copy_pass();
        cmd.submit(&[], &[], true).unwrap();
        assert_eq!(mapping[0], 9);
        mapping.unmap(0, 0).unwrap();

        assert!(dst.map(0, 256).unwrap().iter().all(|&b| b == 9));
    });
}

for_each_backend!(
    index_offsets_follow_index_size,
    copy_resource_uses_smaller_buffer,
    copy_resource_ignores_mixed_kinds,
    clear_and_read_back,
    compute_queue_rejects_render_pass,
    fence_orders_queues,
    reset_allows_resubmission,
    aliased_buffers_share_bytes,
    buffers_in_one_heap_map_independently,
    submit_completes_while_source_is_mapped,
);

// ---------------------------------------------------------------------------
// Preconditions
// ---------------------------------------------------------------------------

#[test]
#[should_panic(expected = "begin_render_pass while a Compute pass is open")]
fn render_pass_inside_compute_pass_panics() {
    let device = device::<Vulkan>();
    let target = render_target(&device, Format::Rgba8Unorm, 4);
    let mut cmd = device.new_command_buffer(GRAPHICS_QUEUE).unwrap();
    cmd.begin_compute_pass().unwrap();
    let _ = cmd.begin_render_pass(&RenderPassDesc {
        color_attachments: vec![ColorAttachment::new(&target)],
        depth_stencil: None,
    });
}

#[test]
#[should_panic(expected = "begin_render_pass while a Copy pass is open")]
fn render_pass_inside_copy_pass_panics() {
    let device = device::<D3D12>();
    let target = render_target(&device, Format::Rgba8Unorm, 4);
    let mut cmd = device.new_command_buffer(GRAPHICS_QUEUE).unwrap();
    cmd.begin_copy_pass();
    let _ = cmd.begin_render_pass(&RenderPassDesc {
        color_attachments: vec![ColorAttachment::new(&target)],
        depth_stencil: None,
    });
}

#[test]
#[should_panic(expected = "draw outside a render pass")]
fn draw_outside_render_pass_panics() {
    let device = device::<D3D12>();
    let mut cmd = device.new_command_buffer(GRAPHICS_QUEUE).unwrap();
    cmd.draw(3, 0);
}

#[test]
#[should_panic(expected = "dispatch without a compute pipeline")]
fn dispatch_without_pipeline_panics() {
    let device = device::<Vulkan>();
    let mut cmd = device.new_command_buffer(COMPUTE_QUEUE).unwrap();
    cmd.begin_compute_pass().unwrap();
    cmd.dispatch(1, 1, 1);
}

#[test]
#[should_panic(expected = "submit with a Render pass open")]
fn submit_with_open_pass_panics() {
    let device = device::<Vulkan>();
    let target = render_target(&device, Format::Rgba8Unorm, 4);
    let mut cmd = device.new_command_buffer(GRAPHICS_QUEUE).unwrap();
    cmd.begin_render_pass(&RenderPassDesc {
        color_attachments: vec![ColorAttachment::new(&target)],
        depth_stencil: None,
    })
    .unwrap();
    let _ = cmd.submit(&[], &[], false);
}

#[test]
#[should_panic(expected = "submitted twice without reset")]
fn double_submit_panics() {
    let device = device::<D3D12>();
    let mut cmd = device.new_command_buffer(GRAPHICS_QUEUE).unwrap();
    cmd.submit(&[], &[], true).unwrap();
    let _ = cmd.submit(&[], &[], true);
}

#[test]
fn validation_off_skips_preconditions() {
    let mut config = prism_rhi::Config::default();
    config.device.validation = false;
    let device = common::device_with::<Vulkan>(config);
    assert!(!device.validation_enabled());
    let layout = device.new_pipeline_layout(&PipelineLayoutDesc::default()).unwrap();
    let pipeline = device
        .new_compute_pipeline_state(&ComputePipelineStateDesc {
            layout,
            cs: ShaderBytecode::new(EMPTY_SPIRV.to_vec(), "main"),
            num_threads_per_group: UVec3::new(64, 1, 1),
        })
        .unwrap();

    let mut cmd = device.new_command_buffer(COMPUTE_QUEUE).unwrap();
    // Dispatch outside a compute pass is recorded as-is.
    cmd.set_compute_pipeline_state(&pipeline);
    cmd.dispatch(2, 1, 1);
    assert!(matches!(cmd.commands().last(), Some(Command::Dispatch { .. })));
}
