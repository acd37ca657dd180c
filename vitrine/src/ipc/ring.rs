//! Lock-free triple-buffered frame segment.
//!
//! One segment per session. The renderer process owns the writer end and
//! publishes one completed paint per call; the host opens the reader end
//! and copies out the freshest complete frame once per render tick.
//! Neither end ever blocks:
//!
//! - the writer refuses to advance into the slot the reader most recently
//!   claimed — it drops the frame and counts it instead;
//! - the reader observes "no new frame" when the counter is unchanged.
//!
//! Three slots is the minimum that keeps a non-blocking single producer a
//! full frame ahead of a single consumer. Slot bytes are published strictly
//! before `write_index` (release), and a reader claims a slot by storing
//! `read_index` before copying, so a torn frame is never observable.
//!
//! Slots are sized for the maximum supported resolution; a session's actual
//! dimensions are fixed at segment creation and a resize replaces the whole
//! segment.

use std::cell::UnsafeCell;
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;

use super::shmem::{unlink_stale, Creator, Opener, SharedMemorySafe, Shm, ShmError, ShmPath};

/// Largest frame the bridge transports over shared memory.
pub const MAX_WIDTH: u32 = 1920;
/// See [`MAX_WIDTH`].
pub const MAX_HEIGHT: u32 = 1080;
/// BGRA, one byte per channel.
pub const BYTES_PER_PIXEL: u32 = 4;
/// Slot capacity in bytes.
pub const MAX_FRAME_BYTES: usize = (MAX_WIDTH * MAX_HEIGHT * BYTES_PER_PIXEL) as usize;
/// Triple buffering.
pub const SLOT_COUNT: u64 = 3;
/// `format` header value for 8-bit BGRA.
pub const FORMAT_BGRA: u32 = 1;

/// "VTRNRING" — published last, with release ordering, by the creator.
const INIT_MAGIC: u64 = 0x5654_524e_5249_4e47;
const INIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors from segment construction and frame publication.
#[derive(Debug, Error)]
pub enum RingError {
    #[error(transparent)]
    Shm(#[from] ShmError),
    /// Requested dimensions are zero or exceed the slot capacity.
    #[error("frame dimensions {width}x{height} outside supported range")]
    DimensionsOutOfRange { width: u32, height: u32 },
    /// A pixel buffer does not match the segment's fixed frame length.
    #[error("frame byte length mismatch: expected {expected}, got {actual}")]
    FrameSizeMismatch { expected: usize, actual: usize },
}

/// Derives the segment name both processes use for a session id.
///
/// Session ids are caller-supplied opaque strings while POSIX shm names
/// forbid inner slashes, so every byte outside `[A-Za-z0-9_-]` maps to `_`.
/// Both ends apply the same mapping, which is all the agreement the naming
/// scheme needs.
pub fn segment_path(session_id: &str) -> ShmPath {
    let mut name = String::with_capacity(session_id.len() + 9);
    name.push_str("/vitrine-");
    for ch in session_id.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            name.push(ch);
        } else {
            name.push('_');
        }
    }
    name.truncate(240);
    ShmPath::new(name).expect("sanitized segment name is always valid")
}

/// One fixed-capacity pixel slot.
///
/// Interior mutability is required because both ends hold `&FrameSegment`;
/// exclusivity of writes is the index protocol's job, not the type
/// system's.
#[repr(transparent)]
struct PixelCell(UnsafeCell<[u8; MAX_FRAME_BYTES]>);

// SAFETY: plain bytes, no pointers; cross-process access is mediated by the
// header atomics per the slot protocol.
unsafe impl Send for PixelCell {}
unsafe impl Sync for PixelCell {}
unsafe impl SharedMemorySafe for PixelCell {}

/// Segment header. Exactly one cache line; the atomics are the only
/// cross-process synchronization in the whole bridge.
#[derive(vitrine_derive::SharedMemorySafe)]
#[repr(C)]
#[repr(align(64))]
struct RingHeader {
    /// `INIT_MAGIC` once the creator finished initialization.
    init: AtomicU64,
    /// Index of the last fully written slot.
    write_index: AtomicU64,
    /// Index of the slot the reader most recently claimed.
    read_index: AtomicU64,
    /// Total frames published; one increment per completed write.
    frame_counter: AtomicU64,
    /// Frames the writer refused rather than racing the reader.
    dropped_frames: AtomicU64,
    /// Unix nanoseconds of the most recent publish.
    last_write_ns: AtomicU64,
    /// Write-once at creation; valid after `init` reads `INIT_MAGIC`.
    width: u32,
    height: u32,
    format: u32,
    frame_len: u32,
}

/// The shared segment layout. The pixel area past the header is
/// zero-initialized by the kernel at creation.
#[derive(vitrine_derive::SharedMemorySafe)]
#[repr(C)]
struct FrameSegment {
    header: RingHeader,
    slots: [PixelCell; SLOT_COUNT as usize],
}

fn check_dimensions(width: u32, height: u32) -> Result<usize, RingError> {
    if width == 0 || height == 0 || width > MAX_WIDTH || height > MAX_HEIGHT {
        return Err(RingError::DimensionsOutOfRange { width, height });
    }
    Ok((width * height * BYTES_PER_PIXEL) as usize)
}

/// Spins until the creator publishes `INIT_MAGIC`, bounded by
/// `INIT_TIMEOUT`.
fn wait_for_init(segment: &FrameSegment, path: &ShmPath) -> Result<(), ShmError> {
    let start = Instant::now();
    loop {
        if segment.header.init.load(Ordering::Acquire) == INIT_MAGIC {
            return Ok(());
        }
        if start.elapsed() >= INIT_TIMEOUT {
            return Err(ShmError::InitTimeout {
                path: path.as_str().to_owned(),
            });
        }
        std::hint::spin_loop();
    }
}

/// Outcome of a publish attempt. Dropping is normal operation under a slow
/// reader, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    Dropped,
}

/// Writer end. Exactly one per segment, owned by the renderer-side session;
/// dropping it unlinks the segment.
pub struct FrameWriter {
    shm: Shm<FrameSegment, Creator>,
    frame_len: usize,
    anchor: minstant::Anchor,
}

impl FrameWriter {
    /// Creates the segment for a session at the given dimensions.
    ///
    /// A stale segment left by a crashed predecessor is unlinked first; the
    /// renderer is the segment's owner and is entitled to reclaim its name.
    ///
    /// # Errors
    ///
    /// Rejects out-of-range dimensions and propagates mapping failures —
    /// the caller falls back to inline frame delivery on any error.
    pub fn create(path: ShmPath, width: u32, height: u32) -> Result<Self, RingError> {
        let frame_len = check_dimensions(width, height)?;
        unlink_stale(&path);

        let shm = Shm::<FrameSegment, Creator>::create(path, |uninit| {
            let ptr = uninit.as_mut_ptr();
            // SAFETY: exclusive access to freshly created, zeroed shared
            // memory; only header fields are written, slot bytes stay
            // zero. The init marker is stored last with release ordering
            // so openers that observe it also observe every field here.
            unsafe {
                addr_of_mut!((*ptr).header.write_index).write(AtomicU64::new(0));
                addr_of_mut!((*ptr).header.read_index).write(AtomicU64::new(0));
                addr_of_mut!((*ptr).header.frame_counter).write(AtomicU64::new(0));
                addr_of_mut!((*ptr).header.dropped_frames).write(AtomicU64::new(0));
                addr_of_mut!((*ptr).header.last_write_ns).write(AtomicU64::new(0));
                addr_of_mut!((*ptr).header.width).write(width);
                addr_of_mut!((*ptr).header.height).write(height);
                addr_of_mut!((*ptr).header.format).write(FORMAT_BGRA);
                addr_of_mut!((*ptr).header.frame_len).write(frame_len as u32);
                addr_of_mut!((*ptr).header.init).write(AtomicU64::new(0));
                (*ptr).header.init.store(INIT_MAGIC, Ordering::Release);
            }
        })?;

        Ok(Self {
            shm,
            frame_len,
            anchor: minstant::Anchor::new(),
        })
    }

    /// Publishes one completed paint.
    ///
    /// Copies the pixels into the next free slot and only then advances
    /// `write_index`. When the next slot is the one the reader claimed, the
    /// frame is dropped and counted instead — the writer never waits.
    ///
    /// # Errors
    ///
    /// Rejects buffers whose length differs from the segment's frame
    /// length; a mismatch means the caller resized without recreating the
    /// segment.
    pub fn publish(&self, pixels: &[u8]) -> Result<PublishOutcome, RingError> {
        if pixels.len() != self.frame_len {
            return Err(RingError::FrameSizeMismatch {
                expected: self.frame_len,
                actual: pixels.len(),
            });
        }

        let header = &self.shm.header;
        let write_index = header.write_index.load(Ordering::Acquire);
        let read_index = header.read_index.load(Ordering::Acquire);
        let candidate = (write_index + 1) % SLOT_COUNT;

        if candidate == read_index {
            header.dropped_frames.fetch_add(1, Ordering::Relaxed);
            return Ok(PublishOutcome::Dropped);
        }

        // SAFETY: `candidate` differs from both `write_index` (the slot a
        // concurrent reader may copy) and `read_index` (the slot a reader
        // claimed), and this is the single writer, so no other access to
        // this slot exists until the release store below publishes it.
        unsafe {
            let slot = self.shm.slots[candidate as usize].0.get();
            std::ptr::copy_nonoverlapping(pixels.as_ptr(), slot.cast::<u8>(), self.frame_len);
        }

        header
            .last_write_ns
            .store(minstant::Instant::now().as_unix_nanos(&self.anchor), Ordering::Relaxed);
        header.write_index.store(candidate, Ordering::Release);
        header.frame_counter.fetch_add(1, Ordering::Release);
        Ok(PublishOutcome::Published)
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.shm.header.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.shm.header.height
    }

    #[must_use]
    pub fn frame_counter(&self) -> u64 {
        self.shm.header.frame_counter.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn dropped_frames(&self) -> u64 {
        self.shm.header.dropped_frames.load(Ordering::Relaxed)
    }
}

/// Metadata accompanying a frame handed out by [`FrameReader::latest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    /// The segment's counter value at the time of the copy.
    pub frame_counter: u64,
}

/// Reader end. Opened by the host; never unlinks the segment.
pub struct FrameReader {
    shm: Shm<FrameSegment, Opener>,
    last_seen: u64,
}

impl FrameReader {
    /// Maps a session's segment.
    ///
    /// # Errors
    ///
    /// `ENOENT` simply means the renderer has not created (or has already
    /// destroyed) the segment — callers treat that as "no session" and
    /// retry on a later tick.
    pub fn open(path: ShmPath) -> Result<Self, RingError> {
        let shm = Shm::<FrameSegment, Opener>::open(path.clone())?;
        wait_for_init(&shm, &path)?;
        Ok(Self { shm, last_seen: 0 })
    }

    /// Copies out the freshest complete frame, if one was published since
    /// the previous call.
    ///
    /// Claims the slot by storing `read_index` before copying, which stops
    /// the writer from reusing it until the next claim. Returns `None`
    /// when nothing new was published — the reader never waits.
    pub fn latest(&mut self, dst: &mut Vec<u8>) -> Option<FrameInfo> {
        let header = &self.shm.header;

        let counter = header.frame_counter.load(Ordering::Acquire);
        if counter == self.last_seen {
            return None;
        }

        let write_index = header.write_index.load(Ordering::Acquire);
        header.read_index.store(write_index, Ordering::Release);

        let frame_len = header.frame_len as usize;
        dst.resize(frame_len, 0);
        // SAFETY: the writer never advances into `read_index` nor into the
        // published `write_index` slot, so these bytes are stable for the
        // duration of the copy, and the acquire load above ordered them
        // after the writer's full copy.
        unsafe {
            let slot = self.shm.slots[write_index as usize].0.get();
            std::ptr::copy_nonoverlapping(slot.cast::<u8>(), dst.as_mut_ptr(), frame_len);
        }

        self.last_seen = counter;
        Some(FrameInfo {
            width: header.width,
            height: header.height,
            frame_counter: counter,
        })
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.shm.header.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.shm.header.height
    }

    #[must_use]
    pub fn frame_counter(&self) -> u64 {
        self.shm.header.frame_counter.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn dropped_frames(&self) -> u64 {
        self.shm.header.dropped_frames.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CACHE_LINE: usize = 64;

    fn create_or_skip(path: &ShmPath, w: u32, h: u32) -> Option<FrameWriter> {
        match FrameWriter::create(path.clone(), w, h) {
            Ok(writer) => Some(writer),
            Err(RingError::Shm(err @ ShmError::Posix { source, .. }))
                if source == rustix::io::Errno::ACCESS =>
            {
                eprintln!("skipping: {err}");
                None
            }
            Err(err) => panic!("create failed: {err}"),
        }
    }

    fn frame(len: usize, fill: u8) -> Vec<u8> {
        vec![fill; len]
    }

    #[test]
    fn header_is_one_cache_line() {
        assert_eq!(std::mem::align_of::<RingHeader>(), CACHE_LINE);
        assert_eq!(std::mem::size_of::<RingHeader>(), CACHE_LINE);
        assert_eq!(
            std::mem::size_of::<FrameSegment>(),
            CACHE_LINE + SLOT_COUNT as usize * MAX_FRAME_BYTES
        );
    }

    #[test]
    fn segment_path_is_deterministic_and_sanitized() {
        assert_eq!(segment_path("s1").as_str(), "/vitrine-s1");
        assert_eq!(segment_path("s1").as_str(), segment_path("s1").as_str());
        assert_eq!(segment_path("a/b:c").as_str(), "/vitrine-a_b_c");
        // Over-long ids stay within POSIX name limits.
        assert!(segment_path(&"x".repeat(500)).as_str().len() <= 240);
    }

    #[test]
    fn rejects_bad_dimensions() {
        assert!(matches!(
            check_dimensions(0, 720),
            Err(RingError::DimensionsOutOfRange { .. })
        ));
        assert!(matches!(
            check_dimensions(MAX_WIDTH + 1, 720),
            Err(RingError::DimensionsOutOfRange { .. })
        ));
        assert_eq!(check_dimensions(1280, 720).unwrap(), 1280 * 720 * 4);
    }

    #[test]
    fn publish_then_read_round_trips() {
        let path = segment_path("test-ring-roundtrip");
        let Some(writer) = create_or_skip(&path, 4, 2) else {
            return;
        };
        let mut reader = FrameReader::open(path).unwrap();

        let len = 4 * 2 * 4;
        assert_eq!(writer.publish(&frame(len, 0xAB)).unwrap(), PublishOutcome::Published);

        let mut dst = Vec::new();
        let info = reader.latest(&mut dst).expect("one frame published");
        assert_eq!((info.width, info.height, info.frame_counter), (4, 2, 1));
        assert_eq!(dst, frame(len, 0xAB));

        // Unchanged counter: no new frame.
        assert!(reader.latest(&mut dst).is_none());

        assert_eq!(writer.publish(&frame(len, 0xCD)).unwrap(), PublishOutcome::Published);
        let info = reader.latest(&mut dst).expect("second frame");
        assert_eq!(info.frame_counter, 2);
        assert_eq!(dst, frame(len, 0xCD));
    }

    #[test]
    fn reader_skips_to_freshest_frame() {
        let path = segment_path("test-ring-freshest");
        let Some(writer) = create_or_skip(&path, 2, 2) else {
            return;
        };
        let mut reader = FrameReader::open(path).unwrap();
        let len = 2 * 2 * 4;

        writer.publish(&frame(len, 1)).unwrap();
        writer.publish(&frame(len, 2)).unwrap();

        let mut dst = Vec::new();
        let info = reader.latest(&mut dst).unwrap();
        assert_eq!(info.frame_counter, 2);
        assert_eq!(dst, frame(len, 2));
    }

    #[test]
    fn writer_drops_instead_of_overrunning_pinned_reader() {
        let path = segment_path("test-ring-pinned");
        let Some(writer) = create_or_skip(&path, 2, 2) else {
            return;
        };
        // Reader present but never consuming: read_index stays 0.
        let _reader = FrameReader::open(path).unwrap();
        let len = 2 * 2 * 4;

        // Slots 1 and 2 fill, then every further publish would advance into
        // the claimed slot and is dropped instead.
        assert_eq!(writer.publish(&frame(len, 1)).unwrap(), PublishOutcome::Published);
        assert_eq!(writer.publish(&frame(len, 2)).unwrap(), PublishOutcome::Published);
        for _ in 0..5 {
            assert_eq!(writer.publish(&frame(len, 3)).unwrap(), PublishOutcome::Dropped);
        }
        assert_eq!(writer.frame_counter(), 2);
        assert_eq!(writer.dropped_frames(), 5);
    }

    #[test]
    fn publish_rejects_wrong_length() {
        let path = segment_path("test-ring-length");
        let Some(writer) = create_or_skip(&path, 2, 2) else {
            return;
        };
        assert!(matches!(
            writer.publish(&frame(3, 0)),
            Err(RingError::FrameSizeMismatch { expected: 16, actual: 3 })
        ));
    }

    #[test]
    fn reopen_after_destroy_reports_no_session() {
        let path = segment_path("test-ring-destroy");
        let Some(writer) = create_or_skip(&path, 2, 2) else {
            return;
        };
        drop(writer); // unlinks

        match FrameReader::open(path) {
            Err(RingError::Shm(ShmError::Posix { source, .. })) => {
                assert_eq!(source, rustix::io::Errno::NOENT);
            }
            Err(other) => panic!("expected ENOENT, got {other}"),
            Ok(_) => panic!("open succeeded after the segment was destroyed"),
        }
    }
}
