// Barrier resolution against tracked subresource state

#[macro_use]
mod common;

use std::sync::Arc;

use ash::vk;
use glam::UVec3;
use prism_rhi::native::d3d12::{D3d12Barrier, ResourceStates, ALL_SUBRESOURCES};
use prism_rhi::native::metal::MetalBarrier;
use prism_rhi::native::vulkan::VkBarrier;
use prism_rhi::{
    Backend, BufferBarrier, BufferDesc, BufferStateFlags, BufferUsageFlags, Command, ComputePipelineStateDesc,
    Device, Format, MemoryType, Metal, PipelineLayoutDesc, RhiError, ShaderBytecode, Texture, TextureBarrier,
    TextureDesc, TextureStateFlags, TextureUsageFlags, Vulkan, D3D12,
};

use common::{device, COMPUTE_QUEUE, COPY_QUEUE, EMPTY_SPIRV, GRAPHICS_QUEUE};

fn mipped_texture<B: Backend>(device: &Device<B>, usages: TextureUsageFlags, mips: u32) -> Arc<Texture> {
    device
        .new_texture(
            MemoryType::Local,
            &TextureDesc::tex2d(Format::Rgba8Unorm, usages, 64, 64, 1, mips),
            None,
        )
        .unwrap()
}

fn last_barrier_batch<B: Backend>(commands: &[Command<B>]) -> Option<&Vec<B::Barrier>> {
    commands.iter().rev().find_map(|c| match c {
        Command::Barrier(batch) => Some(batch),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// Backend independent
// ---------------------------------------------------------------------------

fn automatic_before_resolves_to_recorded_state<B: Backend>() {
    let device = device::<B>();
    let texture = mipped_texture(&device, TextureUsageFlags::COPY_DEST | TextureUsageFlags::READ_TEXTURE, 4);
    for mip in 0..4 {
        assert_eq!(texture.tracked_state(mip, 0), Some(TextureStateFlags::AUTOMATIC));
    }

    let mut cmd = device.new_command_buffer(GRAPHICS_QUEUE).unwrap();
    cmd.resource_barrier(&[], &[TextureBarrier::new(&texture, TextureStateFlags::COPY_DEST)])
        .unwrap();
    for mip in 0..4 {
        assert_eq!(texture.tracked_state(mip, 0), Some(TextureStateFlags::COPY_DEST));
    }

    cmd.resource_barrier(
        &[],
        &[TextureBarrier::new(&texture, TextureStateFlags::SHADER_READ_PS).subresource(2, 0)],
    )
    .unwrap();
    assert_eq!(texture.tracked_state(1, 0), Some(TextureStateFlags::COPY_DEST));
    assert_eq!(texture.tracked_state(2, 0), Some(TextureStateFlags::SHADER_READ_PS));
    assert_eq!(texture.owning_queue_family(2, 0), Some(0));
}

fn compute_downsample_walks_the_mip_chain<B: Backend>() {
    let device = device::<B>();
    let texture = mipped_texture(
        &device,
        TextureUsageFlags::READ_TEXTURE | TextureUsageFlags::READ_WRITE_TEXTURE,
        4,
    );
    let layout = device.new_pipeline_layout(&PipelineLayoutDesc::default()).unwrap();
    let pipeline = device
        .new_compute_pipeline_state(&ComputePipelineStateDesc {
            layout: layout.clone(),
            cs: ShaderBytecode::new(EMPTY_SPIRV.to_vec(), "main"),
            num_threads_per_group: UVec3::new(8, 8, 1),
        })
        .unwrap();

    let mut cmd = device.new_command_buffer(COMPUTE_QUEUE).unwrap();
    cmd.begin_compute_pass().unwrap();
    cmd.set_compute_pipeline_layout(&layout);
    cmd.set_compute_pipeline_state(&pipeline);
    for mip in 1..4 {
        cmd.resource_barrier(
            &[],
            &[
                TextureBarrier::new(&texture, TextureStateFlags::SHADER_READ_CS).subresource(mip - 1, 0),
                TextureBarrier::new(&texture, TextureStateFlags::SHADER_WRITE_CS).subresource(mip, 0),
            ],
        )
        .unwrap();
        let groups = (64 >> mip) / 8;
        cmd.dispatch(groups.max(1), groups.max(1), 1);
    }
    cmd.end_compute_pass();

    assert_eq!(texture.tracked_state(0, 0), Some(TextureStateFlags::SHADER_READ_CS));
    assert_eq!(texture.tracked_state(1, 0), Some(TextureStateFlags::SHADER_READ_CS));
    assert_eq!(texture.tracked_state(2, 0), Some(TextureStateFlags::SHADER_READ_CS));
    assert_eq!(texture.tracked_state(3, 0), Some(TextureStateFlags::SHADER_WRITE_CS));

    let dispatches: Vec<_> = cmd
        .commands()
        .iter()
        .filter_map(|c| match c {
            Command::Dispatch { groups, threads_per_group } => Some((*groups, *threads_per_group)),
            _ => None,
        })
        .collect();
    assert_eq!(dispatches.len(), 3);
    assert_eq!(dispatches[0], (UVec3::new(4, 4, 1), UVec3::new(8, 8, 1)));
    cmd.submit(&[], &[], true).unwrap();
}

fn released_resource_needs_acquire<B: Backend>() {
    let device = device::<B>();
    let buffer = device
        .new_buffer(
            MemoryType::Local,
            &BufferDesc::new(1024, BufferUsageFlags::COPY_DEST | BufferUsageFlags::READ_BUFFER),
        )
        .unwrap();

    let mut upload = device.new_command_buffer(COPY_QUEUE).unwrap();
    upload
        .resource_barrier(&[BufferBarrier::new(&buffer, BufferStateFlags::COPY_DEST)], &[])
        .unwrap();
    upload
        .resource_barrier(
            &[BufferBarrier::new(&buffer, BufferStateFlags::SHADER_READ_CS).release_to(GRAPHICS_QUEUE)],
            &[],
        )
        .unwrap();
    assert_eq!(buffer.tracked_state(), BufferStateFlags::SHADER_READ_CS);

    let mut frame = device.new_command_buffer(GRAPHICS_QUEUE).unwrap();
    let err = frame
        .resource_barrier(&[BufferBarrier::new(&buffer, BufferStateFlags::SHADER_READ_PS)], &[])
        .unwrap_err();
    assert!(matches!(err, RhiError::BadArguments(_)), "{:?}", err);

    let err = frame
        .resource_barrier(
            &[BufferBarrier::new(&buffer, BufferStateFlags::SHADER_READ_PS).acquire_from(COPY_QUEUE)],
            &[],
        )
        .unwrap_err();
    assert!(matches!(err, RhiError::BadArguments(_)), "acquire must mirror the release: {:?}", err);

    frame
        .resource_barrier(
            &[BufferBarrier::new(&buffer, BufferStateFlags::SHADER_READ_CS).acquire_from(COPY_QUEUE)],
            &[],
        )
        .unwrap();
    assert_eq!(buffer.owning_queue_family(), Some(0));

    // Nothing pending any more.
    let err = frame
        .resource_barrier(
            &[BufferBarrier::new(&buffer, BufferStateFlags::SHADER_READ_CS).acquire_from(COPY_QUEUE)],
            &[],
        )
        .unwrap_err();
    assert!(matches!(err, RhiError::BadArguments(_)));
}

fn rejected_barrier_keeps_earlier_ones<B: Backend>() {
    let device = device::<B>();
    let a = mipped_texture(&device, TextureUsageFlags::READ_TEXTURE | TextureUsageFlags::COPY_DEST, 1);
    let b = mipped_texture(&device, TextureUsageFlags::READ_TEXTURE, 1);

    let mut cmd = device.new_command_buffer(GRAPHICS_QUEUE).unwrap();
    let err = cmd
        .resource_barrier(
            &[],
            &[
                TextureBarrier::new(&a, TextureStateFlags::COPY_DEST),
                // Not allowed by READ_TEXTURE alone.
                TextureBarrier::new(&b, TextureStateFlags::COPY_DEST),
            ],
        )
        .unwrap_err();
    assert!(matches!(err, RhiError::BadArguments(_)));
    assert_eq!(a.tracked_state(0, 0), Some(TextureStateFlags::COPY_DEST));
    assert_eq!(b.tracked_state(0, 0), Some(TextureStateFlags::AUTOMATIC));

    let err = cmd
        .resource_barrier(&[], &[TextureBarrier::new(&a, TextureStateFlags::AUTOMATIC)])
        .unwrap_err();
    assert!(matches!(err, RhiError::BadArguments(_)));
    let err = cmd
        .resource_barrier(
            &[],
            &[TextureBarrier::new(&a, TextureStateFlags::SHADER_READ_PS).subresource(1, 0)],
        )
        .unwrap_err();
    assert!(matches!(err, RhiError::BadArguments(_)));
}

for_each_backend!(
    automatic_before_resolves_to_recorded_state,
    compute_downsample_walks_the_mip_chain,
    released_resource_needs_acquire,
    rejected_barrier_keeps_earlier_ones,
);

// ---------------------------------------------------------------------------
// Ownership across queue families
// ---------------------------------------------------------------------------

fn use_on_second_family<B: Backend>() -> Result<(), RhiError> {
    let device = device::<B>();
    let texture = mipped_texture(&device, TextureUsageFlags::READ_TEXTURE | TextureUsageFlags::COPY_DEST, 1);
    let mut graphics = device.new_command_buffer(GRAPHICS_QUEUE).unwrap();
    graphics.resource_barrier(&[], &[TextureBarrier::new(&texture, TextureStateFlags::SHADER_READ_PS)])?;
    let mut compute = device.new_command_buffer(COMPUTE_QUEUE).unwrap();
    compute.resource_barrier(&[], &[TextureBarrier::new(&texture, TextureStateFlags::SHADER_READ_CS)])?;
    assert_eq!(texture.owning_queue_family(0, 0), Some(1));
    Ok(())
}

#[test]
fn vulkan_rejects_implicit_ownership_change() {
    let err = use_on_second_family::<Vulkan>().unwrap_err();
    assert!(matches!(err, RhiError::BadArguments(_)), "{:?}", err);
}

#[test]
fn implicit_ownership_change_is_allowed_elsewhere() {
    use_on_second_family::<D3D12>().unwrap();
    use_on_second_family::<Metal>().unwrap();
}

#[test]
fn vulkan_discard_skips_ownership_transfer() {
    let device = device::<Vulkan>();
    let texture = mipped_texture(&device, TextureUsageFlags::READ_TEXTURE | TextureUsageFlags::COPY_DEST, 1);
    let mut graphics = device.new_command_buffer(GRAPHICS_QUEUE).unwrap();
    graphics
        .resource_barrier(&[], &[TextureBarrier::new(&texture, TextureStateFlags::SHADER_READ_PS)])
        .unwrap();
    let mut copy = device.new_command_buffer(COPY_QUEUE).unwrap();
    copy.resource_barrier(
        &[],
        &[TextureBarrier::new(&texture, TextureStateFlags::COPY_DEST)
            .flags(prism_rhi::ResourceBarrierFlags::DISCARD_CONTENT)],
    )
    .unwrap();
    assert_eq!(texture.owning_queue_family(0, 0), Some(2));
}

// ---------------------------------------------------------------------------
// Native translation
// ---------------------------------------------------------------------------

#[test]
fn vulkan_merges_uniform_mips_into_one_range() {
    let device = device::<Vulkan>();
    let texture = mipped_texture(&device, TextureUsageFlags::COPY_DEST | TextureUsageFlags::READ_TEXTURE, 4);
    let mut cmd = device.new_command_buffer(GRAPHICS_QUEUE).unwrap();
    cmd.resource_barrier(&[], &[TextureBarrier::new(&texture, TextureStateFlags::COPY_DEST)])
        .unwrap();
    cmd.resource_barrier(&[], &[TextureBarrier::new(&texture, TextureStateFlags::SHADER_READ_PS)])
        .unwrap();

    let batch = last_barrier_batch::<Vulkan>(cmd.commands()).unwrap();
    assert_eq!(batch.len(), 1);
    let VkBarrier::Image(image) = &batch[0] else {
        panic!("expected an image barrier, got {:?}", batch[0]);
    };
    assert_eq!(image.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    assert_eq!(image.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    assert_eq!(image.range.base_mip_level, 0);
    assert_eq!(image.range.level_count, 4);
    assert_eq!(image.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
}

#[test]
fn vulkan_release_carries_queue_families() {
    let device = device::<Vulkan>();
    let texture = mipped_texture(&device, TextureUsageFlags::COPY_DEST | TextureUsageFlags::READ_TEXTURE, 1);
    let mut copy = device.new_command_buffer(COPY_QUEUE).unwrap();
    copy.resource_barrier(&[], &[TextureBarrier::new(&texture, TextureStateFlags::COPY_DEST)])
        .unwrap();
    copy.resource_barrier(
        &[],
        &[TextureBarrier::new(&texture, TextureStateFlags::SHADER_READ_PS).release_to(GRAPHICS_QUEUE)],
    )
    .unwrap();

    let batch = last_barrier_batch::<Vulkan>(copy.commands()).unwrap();
    let VkBarrier::Image(image) = &batch[0] else {
        panic!("expected an image barrier, got {:?}", batch[0]);
    };
    assert_eq!((image.src_queue_family_index, image.dst_queue_family_index), (2, 0));
}

#[test]
fn d3d12_collapses_whole_resource_transition() {
    let device = device::<D3D12>();
    let texture = mipped_texture(&device, TextureUsageFlags::COPY_DEST | TextureUsageFlags::READ_TEXTURE, 4);
    let mut cmd = device.new_command_buffer(GRAPHICS_QUEUE).unwrap();
    cmd.resource_barrier(&[], &[TextureBarrier::new(&texture, TextureStateFlags::COPY_DEST)])
        .unwrap();

    let batch = last_barrier_batch::<D3D12>(cmd.commands()).unwrap();
    assert_eq!(
        batch.as_slice(),
        &[D3d12Barrier::Transition {
            resource: texture.native_handle(),
            subresource: ALL_SUBRESOURCES,
            before: ResourceStates::COMMON,
            after: ResourceStates::COPY_DEST,
        }]
    );

    cmd.resource_barrier(
        &[],
        &[TextureBarrier::new(&texture, TextureStateFlags::SHADER_READ_PS).subresource(3, 0)],
    )
    .unwrap();
    let batch = last_barrier_batch::<D3D12>(cmd.commands()).unwrap();
    assert_eq!(
        batch.as_slice(),
        &[D3d12Barrier::Transition {
            resource: texture.native_handle(),
            subresource: 3,
            before: ResourceStates::COPY_DEST,
            after: ResourceStates::PIXEL_SHADER_RESOURCE,
        }]
    );
}

#[test]
fn metal_coalesces_compute_barriers() {
    let device = device::<Metal>();
    let usages = TextureUsageFlags::READ_TEXTURE | TextureUsageFlags::READ_WRITE_TEXTURE;
    let a = mipped_texture(&device, usages, 1);
    let b = mipped_texture(&device, usages, 1);

    let mut cmd = device.new_command_buffer(GRAPHICS_QUEUE).unwrap();
    // Outside a compute pass Metal tracks hazards itself.
    cmd.resource_barrier(
        &[],
        &[
            TextureBarrier::new(&a, TextureStateFlags::SHADER_WRITE_CS),
            TextureBarrier::new(&b, TextureStateFlags::SHADER_WRITE_CS),
        ],
    )
    .unwrap();
    assert!(last_barrier_batch::<Metal>(cmd.commands()).is_none());

    cmd.begin_compute_pass().unwrap();
    cmd.resource_barrier(
        &[],
        &[
            TextureBarrier::new(&a, TextureStateFlags::SHADER_READ_CS),
            TextureBarrier::new(&b, TextureStateFlags::SHADER_READ_CS),
        ],
    )
    .unwrap();
    cmd.end_compute_pass();

    let batch = last_barrier_batch::<Metal>(cmd.commands()).unwrap();
    assert_eq!(batch.len(), 1);
    let MetalBarrier::MemoryBarrier { resources, .. } = &batch[0];
    assert_eq!(resources, &vec![a.native_handle(), b.native_handle()]);
}
