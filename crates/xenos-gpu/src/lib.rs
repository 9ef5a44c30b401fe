//! `xenos-gpu` is the host side of an emulated Xenos GPU.
//!
//! The [`CommandProcessor`] consumes guest register writes and draw/copy
//! requests and records command lists for a host graphics backend:
//! - Register writes only update a shadow register file and dirty flags; host
//!   state is rebuilt lazily at the next draw.
//! - Frames are pipelined over a fixed number of slots. Resources a frame may
//!   still reference are released through a frame-epoch deletion queue.
//! - Shaders, pipelines, root signatures, textures and render targets are
//!   cached; descriptors and constants come from per-frame ring allocators.
//!
//! The host API is abstracted by [`GpuBackend`]. [`backend::NullBackend`] is
//! a headless implementation with a controllable fence clock; the
//! `wgpu-backend` feature adds a wgpu device.

mod command_processor;
mod ring;

pub mod backend;
pub mod cmd;
pub mod config;
pub mod deferred;
pub mod descriptor_pool;
pub mod error;
pub mod guest_memory;
pub mod pipeline_cache;
pub mod registers;
pub mod render_target_cache;
pub mod root_signature;
pub mod scratch;
pub mod shader;
pub mod shared_memory;
pub mod stats;
pub mod texture_cache;
pub mod trace;
pub mod upload_pool;
pub mod worker;
pub mod xenos;

pub use backend::{GpuBackend, NullBackend};
pub use command_processor::{CacheClearHandle, CommandProcessor, IndexBufferInfo};
pub use config::CommandProcessorConfig;
pub use error::GpuError;
pub use guest_memory::{GuestMemory, VecGuestMemory};
pub use shader::{NullShaderTranslator, ShaderId, ShaderTranslator, TranslatedShader};
pub use stats::{GpuStats, GpuStatsSnapshot};
pub use worker::{GpuCommand, GpuWorker};
pub use xenos::{PrimitiveType, ShaderType};
