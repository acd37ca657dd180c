//! The host process: the session manager (the only entry point other host
//! subsystems call), the renderer process supervisor, and the per-session
//! frame sink that runs on the render tick.

pub mod manager;
pub mod sink;
pub mod supervisor;

pub use manager::{SessionManager, SessionState};
pub use sink::{FrameConsumer, FrameSink};
pub use supervisor::RendererSupervisor;
