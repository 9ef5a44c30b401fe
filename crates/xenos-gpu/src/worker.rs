//! Dedicated GPU thread.
//!
//! The command processor is single-threaded. [`GpuWorker`] owns it on its own
//! thread and feeds it guest requests in order through a channel. Stats, the
//! cache-clear flag and the shared-memory watch are the only state reachable
//! from other threads.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, warn};

use crate::backend::GpuBackend;
use crate::command_processor::{CacheClearHandle, CommandProcessor, IndexBufferInfo};
use crate::error::GpuError;
use crate::shader::ShaderId;
use crate::shared_memory::SharedMemoryWatch;
use crate::stats::GpuStats;
use crate::trace::FrameTrace;
use crate::xenos::{PrimitiveType, ShaderType};

/// One request for the GPU thread. Requests are handled in send order.
#[derive(Debug)]
pub enum GpuCommand {
    WriteRegister {
        index: u32,
        value: u32,
    },
    LoadShader {
        shader_type: ShaderType,
        guest_address: u32,
        microcode: Vec<u32>,
        reply: Sender<ShaderId>,
    },
    SetActiveShaders {
        vertex: Option<ShaderId>,
        pixel: Option<ShaderId>,
    },
    Draw {
        primitive_type: PrimitiveType,
        index_count: u32,
        index_buffer: Option<IndexBufferInfo>,
    },
    Copy,
    Swap {
        frontbuffer: u32,
        width: u32,
        height: u32,
    },
    ClearCaches,
    /// Captures the next frame; the trace is sent once the frame is submitted.
    RequestFrameTrace(Sender<FrameTrace>),
    Shutdown,
}

/// Handle to a command processor running on its own thread.
pub struct GpuWorker {
    sender: Sender<GpuCommand>,
    thread: Option<JoinHandle<Result<(), GpuError>>>,
    stats: Arc<GpuStats>,
    cache_clear: CacheClearHandle,
    watch: SharedMemoryWatch,
}

impl std::fmt::Debug for GpuWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuWorker")
            .field("running", &self.thread.is_some())
            .finish_non_exhaustive()
    }
}

impl GpuWorker {
    /// Starts the GPU thread. `build` runs on that thread, so the backend
    /// never has to cross threads.
    pub fn spawn<B, F>(build: F) -> Result<Self, GpuError>
    where
        B: GpuBackend + 'static,
        F: FnOnce() -> Result<CommandProcessor<B>, GpuError> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("xenos-gpu".into())
            .spawn(move || {
                let mut processor = match build() {
                    Ok(processor) => processor,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return Ok(());
                    }
                };
                let shared = (
                    processor.stats(),
                    processor.cache_clear_handle(),
                    processor.shared_memory_watch(),
                );
                if ready_tx.send(Ok(shared)).is_err() {
                    return Ok(());
                }
                run(&mut processor, &receiver)
            })
            .map_err(|_| GpuError::WorkerDisconnected)?;

        match ready_rx.recv() {
            Ok(Ok((stats, cache_clear, watch))) => Ok(Self {
                sender,
                thread: Some(thread),
                stats,
                cache_clear,
                watch,
            }),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(GpuError::WorkerDisconnected)
            }
        }
    }

    pub fn send(&self, command: GpuCommand) -> Result<(), GpuError> {
        self.sender
            .send(command)
            .map_err(|_| GpuError::WorkerDisconnected)
    }

    pub fn write_register(&self, index: u32, value: u32) -> Result<(), GpuError> {
        self.send(GpuCommand::WriteRegister { index, value })
    }

    /// Registers microcode and waits for its handle.
    pub fn load_shader(
        &self,
        shader_type: ShaderType,
        guest_address: u32,
        microcode: Vec<u32>,
    ) -> Result<ShaderId, GpuError> {
        let (reply, response) = mpsc::channel();
        self.send(GpuCommand::LoadShader {
            shader_type,
            guest_address,
            microcode,
            reply,
        })?;
        response.recv().map_err(|_| GpuError::WorkerDisconnected)
    }

    /// Requests a trace of the next frame. The receiver yields it once that
    /// frame has been submitted.
    pub fn request_frame_trace(&self) -> Result<Receiver<FrameTrace>, GpuError> {
        let (reply, trace) = mpsc::channel();
        self.send(GpuCommand::RequestFrameTrace(reply))?;
        Ok(trace)
    }

    pub fn stats(&self) -> &Arc<GpuStats> {
        &self.stats
    }

    /// Lets any thread schedule a cache clear without going through the
    /// queue.
    pub fn cache_clear_handle(&self) -> CacheClearHandle {
        self.cache_clear.clone()
    }

    pub fn shared_memory_watch(&self) -> SharedMemoryWatch {
        self.watch.clone()
    }

    /// Stops the thread after the queued requests have been handled and
    /// returns the first error the thread hit, if any.
    pub fn shutdown(mut self) -> Result<(), GpuError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), GpuError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        let _ = self.sender.send(GpuCommand::Shutdown);
        thread.join().map_err(|_| GpuError::WorkerDisconnected)?
    }
}

impl Drop for GpuWorker {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(%err, "GPU thread stopped with an error");
        }
    }
}

fn run<B: GpuBackend>(
    processor: &mut CommandProcessor<B>,
    receiver: &Receiver<GpuCommand>,
) -> Result<(), GpuError> {
    let mut trace_replies: Vec<Sender<FrameTrace>> = Vec::new();
    // A closed channel shuts down like an explicit request.
    while let Ok(command) = receiver.recv() {
        let result = match command {
            GpuCommand::WriteRegister { index, value } => {
                processor.write_register(index, value);
                Ok(())
            }
            GpuCommand::LoadShader {
                shader_type,
                guest_address,
                microcode,
                reply,
            } => {
                let id = processor.load_shader(shader_type, guest_address, &microcode);
                let _ = reply.send(id);
                Ok(())
            }
            GpuCommand::SetActiveShaders { vertex, pixel } => {
                processor.set_active_shaders(vertex, pixel);
                Ok(())
            }
            GpuCommand::Draw {
                primitive_type,
                index_count,
                index_buffer,
            } => processor
                .issue_draw(primitive_type, index_count, index_buffer.as_ref())
                .map(drop),
            GpuCommand::Copy => processor.issue_copy().map(drop),
            GpuCommand::Swap {
                frontbuffer,
                width,
                height,
            } => processor.perform_swap(frontbuffer, width, height),
            GpuCommand::ClearCaches => {
                processor.clear_caches();
                Ok(())
            }
            GpuCommand::RequestFrameTrace(reply) => {
                processor.request_frame_trace();
                trace_replies.push(reply);
                Ok(())
            }
            GpuCommand::Shutdown => break,
        };
        if let Err(err) = result {
            error!(%err, "GPU thread failed");
            let _ = processor.shutdown();
            return Err(err);
        }
        if let Some(trace) = processor.take_frame_trace() {
            for reply in trace_replies.drain(..) {
                let _ = reply.send(trace.clone());
            }
        }
    }
    debug!("GPU thread exiting");
    processor.shutdown()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NullBackend;
    use crate::config::CommandProcessorConfig;
    use crate::guest_memory::VecGuestMemory;
    use crate::registers::RB_SURFACE_INFO;
    use crate::shader::NullShaderTranslator;

    fn spawn() -> GpuWorker {
        GpuWorker::spawn(|| {
            let config = CommandProcessorConfig {
                shared_memory_size: 1 << 20,
                ..CommandProcessorConfig::default()
            };
            CommandProcessor::new(
                NullBackend::default(),
                Arc::new(VecGuestMemory::new(1 << 20)),
                config,
                Box::new(NullShaderTranslator),
            )
        })
        .unwrap()
    }

    #[test]
    fn requests_run_in_order() {
        let worker = spawn();
        let vs = worker
            .load_shader(ShaderType::Vertex, 0x100, vec![1, 2])
            .unwrap();
        let again = worker
            .load_shader(ShaderType::Vertex, 0x100, vec![1, 2])
            .unwrap();
        assert_eq!(vs, again);

        worker.write_register(RB_SURFACE_INFO, 640).unwrap();
        worker
            .send(GpuCommand::Swap {
                frontbuffer: 0,
                width: 640,
                height: 480,
            })
            .unwrap();
        let stats = Arc::clone(worker.stats());
        worker.shutdown().unwrap();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.swaps, 1);
        assert_eq!(snapshot.frames_submitted, 1);
    }

    #[test]
    fn frame_trace_is_delivered_after_submission() {
        let worker = spawn();
        let trace = worker.request_frame_trace().unwrap();
        worker
            .send(GpuCommand::Swap {
                frontbuffer: 0,
                width: 64,
                height: 64,
            })
            .unwrap();
        let trace = trace.recv().unwrap();
        assert_eq!(trace.frame, 1);
        worker.shutdown().unwrap();
    }

    #[test]
    fn build_failure_is_reported() {
        let err = GpuWorker::spawn::<NullBackend, _>(|| Err(GpuError::WorkerDisconnected))
            .unwrap_err();
        assert!(matches!(err, GpuError::WorkerDisconnected));
    }
}
