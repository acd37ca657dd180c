//! Per-session renderer state.
//!
//! One session binds one paint source to one id and exactly one frame
//! transport. The transport is decided at creation — shared memory when
//! the segment can be established, inline delivery otherwise — and never
//! switches mid-session, so the consumer can never see the same frame on
//! both paths.

use std::time::Duration;

use minstant::Instant;

use crate::ipc::ring::{segment_path, FrameWriter, PublishOutcome, RingError};
use crate::renderer::paint::{PaintSource, PaintSourceFactory};
use crate::trace::{debug, info, warn};

/// Default URL when `initBrowser` omits one.
pub const DEFAULT_URL: &str = "about:blank";
/// Default dimensions when `initBrowser` omits them.
pub const DEFAULT_WIDTH: u32 = 1280;
/// See [`DEFAULT_WIDTH`].
pub const DEFAULT_HEIGHT: u32 = 720;
/// Default paint rate.
pub const DEFAULT_FPS: u32 = 30;
/// Paint rates are clamped into this range.
pub const FPS_RANGE: std::ops::RangeInclusive<u32> = 1..=120;

/// Resolved creation parameters for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub id: String,
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl SessionParams {
    /// Applies the protocol's defaults and clamps to supported ranges.
    #[must_use]
    pub fn resolve(
        id: String,
        url: Option<String>,
        width: Option<u32>,
        height: Option<u32>,
        fps: Option<u32>,
    ) -> Self {
        let fps = fps
            .unwrap_or(DEFAULT_FPS)
            .clamp(*FPS_RANGE.start(), *FPS_RANGE.end());
        Self {
            id,
            url: url.unwrap_or_else(|| DEFAULT_URL.to_owned()),
            width: width.unwrap_or(DEFAULT_WIDTH),
            height: height.unwrap_or(DEFAULT_HEIGHT),
            fps,
        }
    }
}

/// A completed paint that must travel inline because the session is on the
/// fallback transport.
pub struct InlineFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// The session's single frame transport.
enum Transport {
    /// Shared segment. `None` after a resize failed to recreate it; frames
    /// are then dropped rather than switching transports mid-session.
    Shared(Option<FrameWriter>),
    Inline,
}

pub struct RendererSession {
    params: SessionParams,
    source: Box<dyn PaintSource>,
    transport: Transport,
    interval: Duration,
    next_paint: Instant,
}

impl RendererSession {
    /// Creates the session, its paint source, and its frame transport.
    ///
    /// Segment creation failure is not fatal — the session commits to
    /// inline delivery instead.
    pub fn create(params: SessionParams, factory: &PaintSourceFactory) -> Self {
        let source = factory(&params);
        let transport = match FrameWriter::create(
            segment_path(&params.id),
            params.width,
            params.height,
        ) {
            Ok(writer) => {
                info!(session = %params.id, "frame segment created");
                Transport::Shared(Some(writer))
            }
            Err(error) => {
                warn!(session = %params.id, error = %error, "no shared segment, falling back to inline frames");
                Transport::Inline
            }
        };

        let interval = Duration::from_secs(1) / params.fps.max(1);
        Self {
            params,
            source,
            transport,
            interval,
            next_paint: Instant::now(),
        }
    }

    #[must_use]
    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    #[must_use]
    pub fn uses_shared_transport(&self) -> bool {
        matches!(self.transport, Transport::Shared(_))
    }

    /// Applies an `updateBrowser` in place: navigation and, when the
    /// dimensions changed, a resize. Resizing a shared-transport session
    /// destroys the segment and recreates it at the new size before
    /// painting resumes.
    pub fn apply_update(&mut self, url: Option<&str>, width: Option<u32>, height: Option<u32>) {
        if let Some(url) = url {
            if url != self.params.url {
                debug!(session = %self.params.id, url, "navigating");
                self.params.url = url.to_owned();
                self.source.navigate(url);
            }
        }

        let width = width.unwrap_or(self.params.width);
        let height = height.unwrap_or(self.params.height);
        if (width, height) == (self.params.width, self.params.height) {
            return;
        }

        info!(
            session = %self.params.id,
            width, height,
            "resizing"
        );
        self.params.width = width;
        self.params.height = height;
        self.source.resize(width, height);

        if let Transport::Shared(writer) = &mut self.transport {
            // Old segment must be gone (unlinked) before the replacement
            // claims the name.
            *writer = None;
            *writer = match FrameWriter::create(segment_path(&self.params.id), width, height) {
                Ok(new_writer) => Some(new_writer),
                Err(error) => {
                    warn!(session = %self.params.id, error = %error, "segment recreate failed; frames will drop until next resize");
                    None
                }
            };
        }
    }

    /// Runs one paint-pump iteration if the session's frame interval has
    /// elapsed. Returns a frame only when it must be delivered inline.
    pub fn pump(&mut self, now: Instant) -> Option<InlineFrame> {
        if now < self.next_paint {
            return None;
        }
        // Skip missed intervals rather than bursting to catch up.
        while self.next_paint <= now {
            self.next_paint = self.next_paint + self.interval;
        }

        let source = &mut self.source;
        let transport = &mut self.transport;
        let (width, height) = (self.params.width, self.params.height);
        let id = self.params.id.as_str();

        let mut inline = None;
        source.tick(&mut |pixels| match transport {
            Transport::Shared(Some(writer)) => match writer.publish(pixels) {
                Ok(PublishOutcome::Published | PublishOutcome::Dropped) => {}
                Err(RingError::FrameSizeMismatch { expected, actual }) => {
                    warn!(session = %id, expected, actual, "paint buffer does not match segment, frame skipped");
                }
                Err(error) => {
                    warn!(session = %id, error = %error, "frame publish failed");
                }
            },
            Transport::Shared(None) => {} // resize recreate failed; drop
            Transport::Inline => {
                inline = Some(InlineFrame {
                    width,
                    height,
                    pixels: pixels.to_vec(),
                });
            }
        });
        inline
    }

    /// Frames published to this session's segment so far, if shared.
    #[must_use]
    pub fn frames_published(&self) -> u64 {
        match &self.transport {
            Transport::Shared(Some(writer)) => writer.frame_counter(),
            _ => 0,
        }
    }
}
