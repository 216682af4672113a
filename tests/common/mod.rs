// Shared helpers for the scenario tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use prism_rhi::{Backend, Config, Device};

pub const GRAPHICS_QUEUE: u32 = 0;
pub const COMPUTE_QUEUE: u32 = 1;
pub const COPY_QUEUE: u32 = 2;

/// Header-only SPIR-V module, enough for pipeline creation.
pub const EMPTY_SPIRV: [u8; 20] = [
    0x03, 0x02, 0x23, 0x07, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00,
];

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Device with the default queue set: graphics (presenting), compute, copy.
pub fn device<B: Backend>() -> Arc<Device<B>> {
    device_with::<B>(Config::default())
}

pub fn device_with<B: Backend>(config: Config) -> Arc<Device<B>> {
    init_logging();
    Device::<B>::new(&config).expect("device creation")
}

/// Runs `scenario` on its own thread and fails if it has not returned after
/// five seconds, so a hang shows up as a failure instead of a stuck test run.
pub fn finishes_within_timeout<F>(what: &str, scenario: F)
where
    F: FnOnce() + Send + 'static,
{
    let (done_tx, done_rx) = flume::bounded(1);
    std::thread::spawn(move || {
        scenario();
        let _ = done_tx.send(());
    });
    match done_rx.recv_timeout(Duration::from_secs(5)) {
        Ok(()) => {}
        Err(flume::RecvTimeoutError::Timeout) => panic!("{} hung", what),
        Err(flume::RecvTimeoutError::Disconnected) => panic!("{} panicked", what),
    }
}

/// Instantiates a generic scenario once per backend.
macro_rules! for_each_backend {
    ($($scenario:ident),+ $(,)?) => {
        $(
            mod $scenario {
                #[test]
                fn d3d12() {
                    super::$scenario::<prism_rhi::D3D12>();
                }

                #[test]
                fn vulkan() {
                    super::$scenario::<prism_rhi::Vulkan>();
                }

                #[test]
                fn metal() {
                    super::$scenario::<prism_rhi::Metal>();
                }
            }
        )+
    };
}
