use crate::backend::TextureFormat;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to initialise graphics backend: {0}")]
    Init(String),
    #[error("required render-target format {0:?} is not supported")]
    UnsupportedFormat(TextureFormat),
    #[error("failed to allocate {width}x{height} {format:?} render target: {reason}")]
    Allocation {
        width: u32,
        height: u32,
        format: TextureFormat,
        reason: String,
    },
    #[error("kernel '{kernel}' failed to compile: {log}")]
    KernelCompile { kernel: String, log: String },
    #[error("program '{program}' failed to link: {log}")]
    KernelLink { program: String, log: String },
    #[error("kernel '{0}' was not compiled")]
    MissingKernel(String),
    #[error("unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u64 },
    #[error("pass '{0}' samples the texture it renders into")]
    FeedbackLoop(String),
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
    #[error("simulation has been destroyed")]
    Destroyed,
    #[error("failed to read back render target: {0}")]
    Readback(String),
    #[error("surface error: {0}")]
    Surface(String),
    #[error(transparent)]
    Config(#[from] fluidconfig::ConfigError),
}
