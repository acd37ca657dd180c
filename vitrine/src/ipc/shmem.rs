//! POSIX shared memory with typestate-enforced cleanup.
//!
//! The frame bridge has exactly one cross-process shared resource: the
//! per-session frame segment. This module provides the safe mapping layer
//! under it.
//!
//! - [`Shm<T, Creator>`] creates, initializes, and *unlinks* the segment on
//!   drop. The renderer process is always the creator.
//! - [`Shm<T, Opener>`] maps an existing segment and only unmaps on drop.
//!   The host process is always the opener; it never deletes a segment.
//!
//! Segment types are declared `#[derive(SharedMemorySafe)]` and initialized
//! **in place**: a frame segment is tens of megabytes, so construction goes
//! through a `MaybeUninit` closure rather than a stack value. Bytes the
//! closure does not touch are zero (fresh `ftruncate` pages), which is the
//! correct initial state for pixel slots.

use std::fmt;
use std::marker::PhantomData;
use std::mem::{size_of, MaybeUninit};
use std::ops::Deref;
use std::ptr::{null_mut, NonNull};
use std::sync::atomic::*;

use rustix::fs::{fstat, ftruncate, Mode};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::{io, shm};
use thiserror::Error;

/// Errors from segment creation, opening, and validation.
#[derive(Debug, Error)]
pub enum ShmError {
    /// The segment name does not satisfy POSIX `shm_open` rules.
    #[error("invalid shared memory name `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    /// A POSIX call failed with an errno.
    #[error("{op} failed for `{path}`: {source}")]
    Posix {
        op: &'static str,
        path: String,
        source: io::Errno,
    },
    /// The existing object's size does not match the expected layout.
    #[error("shared memory `{path}` size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch {
        path: String,
        expected: usize,
        actual: i64,
    },
    /// The creator never published its init marker in time.
    #[error("shared memory `{path}` was never initialized by its creator")]
    InitTimeout { path: String },
}

impl ShmError {
    fn posix(op: &'static str, path: &ShmPath, source: io::Errno) -> Self {
        Self::Posix {
            op,
            path: path.as_str().to_owned(),
            source,
        }
    }
}

const POSIX_NAME_MAX: usize = 255;

/// A validated POSIX shared memory object name.
///
/// Portable `shm_open` names start with `/`, contain no further `/`, and
/// fit in `NAME_MAX`. Validating once at construction keeps every later
/// syscall site infallible with respect to the name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShmPath(String);

impl ShmPath {
    pub fn new(path: impl Into<String>) -> Result<Self, ShmError> {
        let path = path.into();
        let reason = if !path.starts_with('/') {
            Some("name must start with '/'")
        } else if path[1..].contains('/') {
            Some("name must not contain further '/' characters")
        } else if path.len() > POSIX_NAME_MAX {
            Some("name must be at most 255 bytes")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(ShmError::InvalidPath { path, reason }),
            None => Ok(Self(path)),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShmPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Removes a leftover segment from a previous crashed owner, if any.
///
/// SIGKILL bypasses `Drop`, so a creator that died leaves its name behind.
/// Callers invoke this before `create`; a missing name is not an error.
pub fn unlink_stale(path: &ShmPath) {
    let _ = shm::unlink(path.as_str());
}

/// Cleanup behavior marker for [`Shm`]. Implemented by [`Creator`] and
/// [`Opener`]; not intended for user impls.
pub trait ShmMode {
    /// Whether dropping the mapping also unlinks the name.
    const UNLINK_ON_DROP: bool;
}

/// The owning side: unmaps *and* unlinks on drop.
pub struct Creator;
impl ShmMode for Creator {
    const UNLINK_ON_DROP: bool = true;
}

/// The borrowing side: unmaps only; the name outlives this mapping.
pub struct Opener;
impl ShmMode for Opener {
    const UNLINK_ON_DROP: bool = false;
}

/// Types that may be placed in shared memory and accessed by two processes.
///
/// # Safety
///
/// Implementers guarantee all of:
/// - stable layout (`#[repr(C)]` / `#[repr(transparent)]` / integer repr);
/// - no pointers, references, or process-local primitives anywhere inside;
/// - soundness even if `Drop` never runs (a crashed peer skips destructors);
/// - cross-process concurrent access is mediated entirely by atomic fields.
///
/// Use `#[derive(SharedMemorySafe)]` (from `vitrine-derive`) to get the
/// layout and pointer-freedom checks at compile time.
pub unsafe trait SharedMemorySafe: Send + Sync {}

macro_rules! impl_shared_memory_safe {
    ($($t:ty),* $(,)?) => {
        $( unsafe impl SharedMemorySafe for $t {} )*
    };
}

impl_shared_memory_safe! {
    i8, i16, i32, i64, i128, isize,
    u8, u16, u32, u64, u128, usize,
    f32, f64, bool,
    AtomicBool,
    AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize,
    AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
}

unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for [T; N] {}

/// A mapped shared memory object holding one `T`.
///
/// Dereferences to `&T`; cleanup on drop is decided at compile time by the
/// `Mode` parameter. The mapping stays valid for the lifetime of the value
/// even if the name is unlinked concurrently — the kernel frees the pages
/// only once every mapping is gone, which is what lets the host keep
/// presenting the last frame of a session the renderer already tore down.
pub struct Shm<T: SharedMemorySafe, Mode: ShmMode> {
    ptr: NonNull<T>,
    size: usize,
    path: ShmPath,
    _mode: PhantomData<Mode>,
}

// SAFETY: the pointer targets shared memory, not thread-local state, and
// T: SharedMemorySafe already requires Send + Sync.
unsafe impl<T: SharedMemorySafe, Mode: ShmMode> Send for Shm<T, Mode> {}
// SAFETY: concurrent &-access is mediated by T's atomics per the trait
// contract.
unsafe impl<T: SharedMemorySafe, Mode: ShmMode> Sync for Shm<T, Mode> {}

impl<T: SharedMemorySafe> Shm<T, Creator> {
    /// Creates a new segment sized for `T`, maps it, and initializes it in
    /// place via `init`.
    ///
    /// The name must not already exist (`EEXIST` otherwise); callers that
    /// tolerate a stale leftover run [`unlink_stale`] first. Bytes `init`
    /// leaves untouched read as zero.
    ///
    /// # Errors
    ///
    /// Propagates `shm_open`, `ftruncate`, and `mmap` failures; the name is
    /// unlinked again on any partial failure.
    pub fn create(path: ShmPath, init: impl FnOnce(&mut MaybeUninit<T>)) -> Result<Self, ShmError> {
        let fd = shm::open(
            path.as_str(),
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|e| ShmError::posix("shm_open", &path, e))?;

        if let Err(e) = ftruncate(&fd, size_of::<T>() as u64) {
            drop(fd);
            let _ = shm::unlink(path.as_str());
            return Err(ShmError::posix("ftruncate", &path, e));
        }

        // SAFETY: fresh mapping of a fresh object; size matches the
        // ftruncate above, the fd is valid, and mmap returns page-aligned
        // addresses which satisfy any T's alignment.
        let mapped = unsafe {
            mmap(
                null_mut(),
                size_of::<T>(),
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        };
        let raw = match mapped {
            Ok(p) => p,
            Err(e) => {
                drop(fd);
                let _ = shm::unlink(path.as_str());
                return Err(ShmError::posix("mmap", &path, e));
            }
        };

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(raw.cast::<T>()) };
        let shm = Self {
            ptr,
            size: size_of::<T>(),
            path,
            _mode: PhantomData,
        };

        // SAFETY: no other process can have mapped the object yet (EXCL
        // create above), so this is exclusive access to uninitialized
        // memory. `init` must publish any readiness marker itself with
        // release ordering; see the frame ring.
        init(unsafe { &mut *shm.ptr.as_ptr().cast::<MaybeUninit<T>>() });

        Ok(shm)
    }
}

impl<T: SharedMemorySafe> Shm<T, Opener> {
    /// Maps an existing segment created by another process.
    ///
    /// # Errors
    ///
    /// `ENOENT` when the creator has not created (or already unlinked) the
    /// name, [`ShmError::SizeMismatch`] when the object's size differs from
    /// `T` (a peer built against a different layout), plus `mmap` failures.
    pub fn open(path: ShmPath) -> Result<Self, ShmError> {
        let fd = shm::open(path.as_str(), shm::OFlags::RDWR, Mode::empty())
            .map_err(|e| ShmError::posix("shm_open", &path, e))?;

        let stat = match fstat(&fd) {
            Ok(stat) => stat,
            Err(e) => {
                drop(fd);
                return Err(ShmError::posix("fstat", &path, e));
            }
        };
        if stat.st_size != size_of::<T>() as i64 {
            drop(fd);
            return Err(ShmError::SizeMismatch {
                path: path.as_str().to_owned(),
                expected: size_of::<T>(),
                actual: stat.st_size,
            });
        }

        // SAFETY: object exists and fstat confirmed its size; mmap returns
        // page-aligned addresses; cross-process access safety is T's
        // SharedMemorySafe contract.
        let mapped = unsafe {
            mmap(
                null_mut(),
                size_of::<T>(),
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        };
        let raw = match mapped {
            Ok(p) => p,
            Err(e) => {
                drop(fd);
                return Err(ShmError::posix("mmap", &path, e));
            }
        };

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(raw.cast::<T>()) };
        Ok(Self {
            ptr,
            size: size_of::<T>(),
            path,
            _mode: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Shm<T, Mode> {
    /// The name this mapping was created from or opened at.
    #[must_use]
    pub fn path(&self) -> &ShmPath {
        &self.path
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Drop for Shm<T, Mode> {
    fn drop(&mut self) {
        // SAFETY: ptr/size describe exactly the mapping made at
        // construction.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), self.size);
        }
        if Mode::UNLINK_ON_DROP {
            let _ = shm::unlink(self.path.as_str());
        }
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Deref for Shm<T, Mode> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the mapping is live until Drop and T's contract covers
        // concurrent access.
        unsafe { &*self.ptr.as_ptr() }
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> fmt::Debug for Shm<T, Mode> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shm")
            .field("path", &self.path)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}
