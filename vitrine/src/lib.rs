//! Vitrine: a cross-process frame bridge.
//!
//! An isolated renderer process paints web pages off-screen and streams
//! the pixels to a host compositor at interactive rates. The two processes
//! share nothing but an authenticated newline-JSON control channel
//! ([`protocol`], [`net`]) and one lock-free triple-buffered shared-memory
//! segment per session ([`ipc::ring`]); when shared memory cannot be
//! established, frames fall back to inline base64 delivery on the control
//! channel.
//!
//! The host side lives in [`host`] (session manager, process supervisor,
//! frame sink); the renderer side in [`renderer`] (control service,
//! per-session state, the paint-source boundary).

// Allow the crate to reference itself as ::vitrine for derive macro usage
extern crate self as vitrine;

pub mod config;
pub mod host;
pub mod ipc;
pub mod net;
pub mod protocol;
pub mod renderer;
pub mod trace;

#[doc(inline)]
pub use vitrine_derive::SharedMemorySafe;

#[doc(inline)]
pub use ipc::shmem::SharedMemorySafe;

// Hidden re-export for the derive macro
#[doc(hidden)]
pub use ipc::shmem::SharedMemorySafe as __SharedMemorySafePrivate;

pub use trace::init_tracing;
