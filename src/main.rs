// =============================================================================
// PRISM RHI DEMO - Upload, mip downsample and readback on the host timeline
// =============================================================================
//
// FRAME FLOW:
// 1. Copy queue uploads mip 0 of a texture and releases it to graphics
// 2. Graphics queue acquires it and walks the mip chain in a compute pass
// 3. A render pass clears a target which is then read back
// 4. Fences order the two submissions
//
// The backend comes from `[device] backend` in config.toml.
//
// =============================================================================

use anyhow::{Context, Result};
use glam::{UVec3, Vec4};
use prism_rhi::{
    Backend, BackendKind, BufferDesc, BufferUsageFlags, ColorAttachment, ComputePipelineStateDesc, Config,
    DescriptorSetDesc, DescriptorSetLayoutBinding, DescriptorSetLayoutDesc, DescriptorType, Device, Format,
    MemoryType, Metal, PipelineLayoutDesc, RenderPassDesc, ShaderBytecode, ShaderVisibilityFlags, TextureBarrier,
    TextureDesc, TextureStateFlags, TextureUsageFlags, TextureViewBinding, TextureViewDesc, Vulkan,
    WriteDescriptorSet, D3D12,
};
use std::fs::OpenOptions;
use std::io::Write;

const GRAPHICS_QUEUE: u32 = 0;
const COPY_QUEUE: u32 = 2;
const SIZE: u32 = 64;
const MIPS: u32 = 4;

/// Header-only SPIR-V module; compute work is recorded, not executed.
const DOWNSAMPLE_CS: [u8; 20] = [
    0x03, 0x02, 0x23, 0x07, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00,
];

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();
    init_logging(&config);
    log::info!("Starting prism-rhi demo on {:?}", config.device.backend);

    match config.device.backend {
        BackendKind::D3D12 => run::<D3D12>(&config),
        BackendKind::Vulkan => run::<Vulkan>(&config),
        BackendKind::Metal => run::<Metal>(&config),
    }
}

/// Initialize logging with optional log file header
fn init_logging(config: &Config) {
    use env_logger::Builder;

    Builder::new()
        .filter_level(config.debug.level_filter())
        .parse_default_env()
        .init();

    if config.debug.log_to_file {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            let _ = writeln!(file, "=== prism-rhi Log ===");
            let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
            let _ = writeln!(file);
        }
    }
}

// =============================================================================
// DEMO
// =============================================================================

fn run<B: Backend>(config: &Config) -> Result<()> {
    let device = Device::<B>::new(config).context("Failed to create device")?;

    let texture_desc = TextureDesc::tex2d(
        Format::Rgba8Unorm,
        TextureUsageFlags::COPY_DEST | TextureUsageFlags::READ_TEXTURE | TextureUsageFlags::READ_WRITE_TEXTURE,
        SIZE,
        SIZE,
        1,
        MIPS,
    );
    let texture = device.new_texture(MemoryType::Local, &texture_desc, None)?;

    // ── Upload ───────────────────────────────────────────────────────────────
    let texels = (SIZE * SIZE) as usize;
    let staging = device.new_buffer(
        MemoryType::Upload,
        &BufferDesc::new(texels as u64 * 4, BufferUsageFlags::COPY_SOURCE),
    )?;
    {
        let mut mapping = staging.map(0, 0)?;
        for (i, texel) in mapping.chunks_exact_mut(4).enumerate() {
            let (x, y) = ((i % SIZE as usize) as u8, (i / SIZE as usize) as u8);
            texel.copy_from_slice(&[x * 4, y * 4, 0x80, 0xff]);
        }
        mapping.unmap(0, texels as u64 * 4)?;
    }

    let uploaded = device.new_fence();
    let mut upload = device.new_command_buffer(COPY_QUEUE)?;
    upload.begin_event("upload");
    upload.resource_barrier(
        &[],
        &[TextureBarrier::new(&texture, TextureStateFlags::COPY_DEST).subresource(0, 0)],
    )?;
    upload.begin_copy_pass();
    upload.copy_buffer_to_texture(&texture, 0, 0, &staging, 0, 0)?;
    upload.end_copy_pass();
    upload.resource_barrier(
        &[],
        &[TextureBarrier::new(&texture, TextureStateFlags::SHADER_READ_CS)
            .subresource(0, 0)
            .release_to(GRAPHICS_QUEUE)],
    )?;
    upload.end_event();
    upload.submit(&[], &[uploaded.clone()], false)?;

    // ── Downsample ───────────────────────────────────────────────────────────
    let set_layout = device.new_descriptor_set_layout(&DescriptorSetLayoutDesc {
        bindings: vec![
            DescriptorSetLayoutBinding::new(DescriptorType::ReadTextureView, 0, 1, ShaderVisibilityFlags::COMPUTE),
            DescriptorSetLayoutBinding::new(
                DescriptorType::ReadWriteTextureView,
                1,
                1,
                ShaderVisibilityFlags::COMPUTE,
            ),
        ],
        ..Default::default()
    })?;
    let layout = device.new_pipeline_layout(&PipelineLayoutDesc {
        set_layouts: vec![set_layout.clone()],
        ..Default::default()
    })?;
    let pipeline = device.new_compute_pipeline_state(&ComputePipelineStateDesc {
        layout: layout.clone(),
        cs: ShaderBytecode::new(DOWNSAMPLE_CS.to_vec(), "main"),
        num_threads_per_group: UVec3::new(8, 8, 1),
    })?;

    let mut frame = device.new_command_buffer(GRAPHICS_QUEUE)?;
    frame.resource_barrier(
        &[],
        &[TextureBarrier::new(&texture, TextureStateFlags::SHADER_READ_CS)
            .subresource(0, 0)
            .acquire_from(COPY_QUEUE)],
    )?;
    frame.begin_compute_pass()?;
    frame.set_compute_pipeline_layout(&layout);
    frame.set_compute_pipeline_state(&pipeline);
    for mip in 1..MIPS {
        let set = device.new_descriptor_set(&DescriptorSetDesc::new(&set_layout))?;
        set.update_descriptors(&[
            WriteDescriptorSet::read_texture_view(0, TextureViewBinding::new(&texture, TextureViewDesc::mip(mip - 1))),
            WriteDescriptorSet::read_write_texture_view(1, TextureViewBinding::new(&texture, TextureViewDesc::mip(mip))),
        ])?;
        frame.resource_barrier(
            &[],
            &[
                TextureBarrier::new(&texture, TextureStateFlags::SHADER_READ_CS).subresource(mip - 1, 0),
                TextureBarrier::new(&texture, TextureStateFlags::SHADER_WRITE_CS).subresource(mip, 0),
            ],
        )?;
        frame.set_compute_descriptor_set(0, &set);
        let extent = (SIZE >> mip).div_ceil(8);
        frame.dispatch(extent, extent, 1);
    }
    frame.end_compute_pass();

    // ── Clear and read back ──────────────────────────────────────────────────
    let target = device.new_texture(
        MemoryType::Local,
        &TextureDesc::tex2d(
            Format::Bgra8Unorm,
            TextureUsageFlags::COLOR_ATTACHMENT | TextureUsageFlags::COPY_SOURCE,
            SIZE,
            SIZE,
            1,
            1,
        ),
        None,
    )?;
    let readback = device.new_buffer(
        MemoryType::Readback,
        &BufferDesc::new(texels as u64 * 4, BufferUsageFlags::COPY_DEST),
    )?;

    frame.resource_barrier(&[], &[TextureBarrier::new(&target, TextureStateFlags::COLOR_ATTACHMENT_WRITE)])?;
    frame.begin_render_pass(&RenderPassDesc {
        color_attachments: vec![ColorAttachment::new(&target).clear(Vec4::new(0.25, 0.5, 0.75, 1.0))],
        depth_stencil: None,
    })?;
    frame.end_render_pass();
    frame.resource_barrier(&[], &[TextureBarrier::new(&target, TextureStateFlags::COPY_SOURCE)])?;
    frame.begin_copy_pass();
    frame.copy_texture_to_buffer(&readback, 0, 0, &target, 0, 0)?;
    frame.end_copy_pass();

    log::info!("Recorded {} commands on the graphics queue", frame.commands().len());
    frame
        .submit(&[uploaded], &[], true)
        .context("Graphics submission failed")?;
    upload.wait().context("Upload submission failed")?;

    let mapping = readback.map(0, 4)?;
    log::info!(
        "Readback texel 0 = {:?}, mip 3 of texture #{} is {:?}",
        &mapping[..4],
        texture.native_handle(),
        texture.tracked_state(3, 0)
    );
    mapping.unmap(0, 0)?;

    for memory_type in [MemoryType::Local, MemoryType::Upload, MemoryType::Readback] {
        log::info!("{:?} memory in use: {} bytes", memory_type, device.memory_used(memory_type));
    }
    Ok(())
}
