use crate::backend::BackendError;
use crate::guest_memory::GuestMemoryError;
use crate::shader::ShaderTranslateError;

/// Errors surfaced by the command processor.
///
/// Only device-level failures and guest memory faults are reported this way.
/// Incomplete guest state makes draws return `Ok(false)` instead, and caller
/// contract violations panic.
#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("host GPU backend failure: {0}")]
    Backend(#[from] BackendError),

    #[error("guest memory access failed: {0}")]
    GuestMemory(#[from] GuestMemoryError),

    #[error("shader translation failed: {0}")]
    ShaderTranslate(#[from] ShaderTranslateError),

    #[error("upload pool cannot satisfy {requested} bytes (page size {page_size})")]
    UploadTooLarge { requested: u64, page_size: u64 },

    #[error("GPU worker thread is gone")]
    WorkerDisconnected,
}
