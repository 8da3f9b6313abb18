//! D3D12-style resource and synchronization core. Device objects are reference counted through
//! `diligent-base`, GPU work is recorded through the `native` traits and a `null` backend is
//! provided for running without a GPU.

pub use buffer::*;
pub use device_context::*;
pub use error::*;
pub use pipeline_state::*;
pub use render_device::RenderDevice;
pub use sampler::*;
pub use texture::*;
pub use types::*;

pub mod backends;
pub mod command_context;
pub mod command_queues;
pub mod descriptor_heap;
pub mod dynamic_heap;
pub mod native;
pub mod root_signature;
pub mod shader_resource_cache;

mod buffer;
mod device_context;
mod error;
mod pipeline_state;
mod render_device;
mod sampler;
mod texture;
mod types;
