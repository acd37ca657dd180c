//! The renderer process: the control service, per-session state, and the
//! boundary to the page-rendering engine.
//!
//! Everything here runs on one cooperative thread — the service's event
//! loop interleaves socket readiness with one paint-pump iteration per
//! tick, so paint callbacks and control handling never race each other and
//! each session has exactly one producer.

pub mod paint;
pub mod service;
pub mod session;

pub use paint::{pattern_factory, PaintSource, PaintSourceFactory, PatternSource};
pub use service::{RendererService, ServiceError};
pub use session::SessionParams;
