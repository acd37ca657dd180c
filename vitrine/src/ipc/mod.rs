//! Cross-process transport primitives: the shared-memory mapping layer and
//! the per-session triple-buffered frame segment built on top of it.

pub mod ring;
pub mod shmem;
