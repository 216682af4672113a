// =============================================================================
// PRISM RHI - Portable render hardware interface
// =============================================================================
//
// One command recording and resource state model, translated into the native
// synchronization vocabulary of Direct3D12, Vulkan and Metal.
//
// LAYERS:
// ┌─────────────────────────────────────────────────────────────────┐
// │  Device<B> (queues, allocator, creation APIs)                   │
// │    └── CommandBuffer<B> (pass state machine, retain list)       │
// │          └── tracker (per-subresource state and ownership)      │
// │                └── native::Backend (barrier/format translation) │
// └─────────────────────────────────────────────────────────────────┘
//
// =============================================================================

pub mod backend;
pub mod config;
pub mod error;
pub mod format;
pub mod native;

pub use backend::*;
pub use config::Config;
pub use error::{RhiError, RhiResult};
pub use format::Format;
pub use native::{Backend, BackendKind, Metal, Vulkan, D3D12};
