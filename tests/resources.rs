// Buffer, texture and device memory creation

#[macro_use]
mod common;

use prism_rhi::{
    Backend, BufferDesc, BufferStateFlags, BufferUsageFlags, ClearValue, Config, Format, MemoryType, Metal,
    ResourceHeapDesc, ResourceHeapUsageFlags, RhiError, TextureDesc, TextureUsageFlags, Vulkan, D3D12,
};

use common::{device, device_with};

const KIB: u64 = 1024;

fn buffer_memory_rules<B: Backend>() {
    let device = device::<B>();

    let local = device
        .new_buffer(MemoryType::Local, &BufferDesc::new(100, BufferUsageFlags::VERTEX_BUFFER))
        .unwrap();
    assert_eq!(local.get_desc().size, 100);
    assert_eq!(local.memory().size(), 256);
    assert!(matches!(local.map(0, 0), Err(RhiError::NotSupported(_))));

    let upload = device
        .new_buffer(MemoryType::Upload, &BufferDesc::new(64, BufferUsageFlags::UNIFORM_BUFFER))
        .unwrap();
    assert_eq!(upload.tracked_state(), BufferStateFlags::GENERAL_READ);
    let mapping = upload.map(0, 64).unwrap();
    assert_eq!(mapping.len(), 64);
    assert!(matches!(mapping.unmap(0, 65), Err(RhiError::BadArguments(_))));

    let err = device
        .new_buffer(MemoryType::Upload, &BufferDesc::new(64, BufferUsageFlags::COPY_DEST))
        .unwrap_err();
    assert!(matches!(err, RhiError::NotSupported(_)));
    let err = device
        .new_buffer(MemoryType::Readback, &BufferDesc::new(64, BufferUsageFlags::VERTEX_BUFFER))
        .unwrap_err();
    assert!(matches!(err, RhiError::NotSupported(_)));
    let err = device
        .new_buffer(MemoryType::Local, &BufferDesc::new(0, BufferUsageFlags::VERTEX_BUFFER))
        .unwrap_err();
    assert!(matches!(err, RhiError::BadArguments(_)));
}

fn aliasing_respects_heap_usage<B: Backend>() {
    let device = device::<B>();
    let buffers_only = device
        .new_device_memory(&ResourceHeapDesc {
            memory_type: MemoryType::Local,
            size: 256 * KIB,
            usages: ResourceHeapUsageFlags::BUFFER,
        })
        .unwrap();

    let desc = BufferDesc::new(4 * KIB, BufferUsageFlags::READ_BUFFER);
    let a = device.new_aliasing_buffer(&buffers_only, 64 * KIB, &desc).unwrap();
    let b = device.new_aliasing_buffer(&buffers_only, 64 * KIB, &desc).unwrap();
    assert!(a.is_aliasing());
    assert_eq!(a.gpu_address(), b.gpu_address());
    assert_ne!(a.native_handle(), b.native_handle());

    let err = device.new_aliasing_buffer(&buffers_only, 100, &desc).unwrap_err();
    assert!(matches!(err, RhiError::BadArguments(_)), "misaligned offset: {:?}", err);
    let err = device
        .new_aliasing_buffer(&buffers_only, 192 * KIB, &BufferDesc::new(128 * KIB, BufferUsageFlags::READ_BUFFER))
        .unwrap_err();
    assert!(matches!(err, RhiError::BadArguments(_)), "out of range: {:?}", err);

    let sampled = TextureDesc::tex2d(Format::Rgba8Unorm, TextureUsageFlags::READ_TEXTURE, 32, 32, 1, 1);
    let err = device.new_aliasing_texture(&buffers_only, 0, &sampled, None).unwrap_err();
    assert!(matches!(err, RhiError::BadArguments(_)));

    let textures = device
        .new_device_memory(&ResourceHeapDesc {
            memory_type: MemoryType::Local,
            size: 256 * KIB,
            usages: ResourceHeapUsageFlags::TEXTURE_NON_RT_DS,
        })
        .unwrap();
    let texture = device.new_aliasing_texture(&textures, 0, &sampled, None).unwrap();
    assert!(texture.is_aliasing());
    let target = TextureDesc::tex2d(Format::Rgba8Unorm, TextureUsageFlags::COLOR_ATTACHMENT, 32, 32, 1, 1);
    assert!(device.new_aliasing_texture(&textures, 0, &target, None).is_err());
    assert!(device.new_aliasing_buffer(&textures, 0, &desc).is_err());

    let err = device
        .new_device_memory(&ResourceHeapDesc {
            memory_type: MemoryType::Local,
            size: 0,
            usages: ResourceHeapUsageFlags::BUFFER,
        })
        .unwrap_err();
    assert!(matches!(err, RhiError::BadArguments(_)));
}

fn texture_descriptions_are_validated<B: Backend>() {
    let device = device::<B>();
    let texture = device
        .new_texture(
            MemoryType::Local,
            &TextureDesc::tex2d(Format::Rgba8Unorm, TextureUsageFlags::READ_TEXTURE, 256, 64, 6, 0),
            None,
        )
        .unwrap();
    assert_eq!(texture.get_desc().mip_levels, 9);
    assert_eq!(texture.get_desc().subresource_count(), 54);
    assert_eq!(texture.subresource_index(2, 1), Some(11));
    assert_eq!(texture.subresource_index(9, 0), None);

    let reject = |desc: TextureDesc, clear: Option<ClearValue>| {
        device.new_texture(MemoryType::Local, &desc, clear).unwrap_err()
    };
    let depth_on_color = reject(
        TextureDesc::tex2d(Format::Rgba8Unorm, TextureUsageFlags::DEPTH_STENCIL_ATTACHMENT, 16, 16, 1, 1),
        None,
    );
    assert!(matches!(depth_on_color, RhiError::BadArguments(_)));
    let too_many_mips = reject(
        TextureDesc::tex2d(Format::Rgba8Unorm, TextureUsageFlags::READ_TEXTURE, 16, 16, 1, 6),
        None,
    );
    assert!(matches!(too_many_mips, RhiError::BadArguments(_)));
    let msaa_mips = reject(
        TextureDesc::tex2d(Format::Rgba8Unorm, TextureUsageFlags::COLOR_ATTACHMENT, 16, 16, 1, 2).with_sample_count(4),
        None,
    );
    assert!(matches!(msaa_mips, RhiError::BadArguments(_)));
    let odd_samples = reject(
        TextureDesc::tex2d(Format::Rgba8Unorm, TextureUsageFlags::COLOR_ATTACHMENT, 16, 16, 1, 1).with_sample_count(3),
        None,
    );
    assert!(matches!(odd_samples, RhiError::NotSupported(_)));
    let clear_on_sampled = reject(
        TextureDesc::tex2d(Format::Rgba8Unorm, TextureUsageFlags::READ_TEXTURE, 16, 16, 1, 1),
        Some(ClearValue::Color(glam::Vec4::ONE)),
    );
    assert!(matches!(clear_on_sampled, RhiError::BadArguments(_)));
    let err = device
        .new_texture(
            MemoryType::Readback,
            &TextureDesc::tex2d(Format::Rgba8Unorm, TextureUsageFlags::READ_TEXTURE, 16, 16, 1, 1),
            None,
        )
        .unwrap_err();
    assert!(matches!(err, RhiError::NotSupported(_)));
}

fn memory_budget_is_enforced<B: Backend>() {
    let mut config = Config::default();
    config.memory.upload_budget_mb = 1;
    config.memory.max_allocation_mb = 1;
    let device = device_with::<B>(config);

    let half = BufferDesc::new(512 * KIB, BufferUsageFlags::COPY_SOURCE);
    let first = device.new_buffer(MemoryType::Upload, &half).unwrap();
    assert_eq!(device.memory_used(MemoryType::Upload), 512 * KIB);
    let second = device.new_buffer(MemoryType::Upload, &half).unwrap();
    let err = device
        .new_buffer(MemoryType::Upload, &BufferDesc::new(256, BufferUsageFlags::COPY_SOURCE))
        .unwrap_err();
    assert!(matches!(err, RhiError::BadPlatformCall(_)), "{:?}", err);

    drop(first);
    drop(second);
    assert_eq!(device.memory_used(MemoryType::Upload), 0);

    let err = device
        .new_buffer(MemoryType::Upload, &BufferDesc::new(2 * 1024 * KIB, BufferUsageFlags::COPY_SOURCE))
        .unwrap_err();
    assert!(matches!(err, RhiError::BadPlatformCall(_)));
}

for_each_backend!(
    buffer_memory_rules,
    aliasing_respects_heap_usage,
    texture_descriptions_are_validated,
    memory_budget_is_enforced,
);

#[test]
fn upload_textures_are_a_metal_feature() {
    let desc = TextureDesc::tex2d(Format::Rgba8Unorm, TextureUsageFlags::READ_TEXTURE, 16, 16, 1, 1);
    let metal = device::<Metal>();
    assert!(metal.new_texture(MemoryType::Upload, &desc, None).is_ok());

    let err = device::<Vulkan>().new_texture(MemoryType::Upload, &desc, None).unwrap_err();
    assert!(matches!(err, RhiError::NotSupported(_)));
    let err = device::<D3D12>().new_texture(MemoryType::Upload, &desc, None).unwrap_err();
    assert!(matches!(err, RhiError::NotSupported(_)));
}
