//! Nonblocking TCP plumbing shared by both ends of the control channel.

pub mod line;

pub use line::{connect_with_timeout, write_line_all, FillOutcome, LineBuffer, LineError};
