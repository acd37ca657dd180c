//! Host-side frame consumption.
//!
//! A [`FrameSink`] is polled on the host's render tick and hands complete
//! BGRA frames to the texture boundary, represented as a [`FrameConsumer`]
//! capability supplied at construction.
//!
//! Each sink commits to exactly one transport for its session's lifetime:
//! the first successful segment open commits it to shared memory, the
//! first inline frame commits it to the fallback. Frames arriving on the
//! other path afterwards are ignored, so a frame can never be presented
//! twice through both routes.

use std::sync::Arc;

use crate::ipc::ring::{segment_path, FrameReader};
use crate::trace::{debug, info};

/// Where decoded frames go — the host's texture/draw pipeline, which the
/// bridge only knows as "accepts a BGRA buffer".
pub trait FrameConsumer: Send + Sync {
    fn on_frame(&self, width: u32, height: u32, pixels: &[u8]);
}

impl<F> FrameConsumer for F
where
    F: Fn(u32, u32, &[u8]) + Send + Sync,
{
    fn on_frame(&self, width: u32, height: u32, pixels: &[u8]) {
        self(width, height, pixels);
    }
}

enum Transport {
    /// No frame seen and no segment mapped yet.
    Undecided,
    Shared(FrameReader),
    Inline,
}

/// Per-session frame receiver.
pub struct FrameSink {
    session_id: String,
    consumer: Arc<dyn FrameConsumer>,
    transport: Transport,
    staging: Vec<u8>,
    frames_received: u64,
}

impl FrameSink {
    #[must_use]
    pub fn new(session_id: impl Into<String>, consumer: Arc<dyn FrameConsumer>) -> Self {
        Self {
            session_id: session_id.into(),
            consumer,
            transport: Transport::Undecided,
            staging: Vec::new(),
            frames_received: 0,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Total frames delivered to the consumer, both transports.
    #[must_use]
    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    #[must_use]
    pub fn uses_shared_transport(&self) -> bool {
        matches!(self.transport, Transport::Shared(_))
    }

    /// One render-tick poll. While undecided, tries to map the session's
    /// segment — a missing segment is "no session yet", not an error.
    /// Once shared, copies out the freshest frame if one was published.
    pub fn tick(&mut self) {
        if matches!(self.transport, Transport::Undecided) {
            if let Ok(reader) = FrameReader::open(segment_path(&self.session_id)) {
                info!(session = %self.session_id, "attached to frame segment");
                self.transport = Transport::Shared(reader);
            }
        }

        if let Transport::Shared(reader) = &mut self.transport {
            if let Some(info) = reader.latest(&mut self.staging) {
                self.frames_received += 1;
                self.consumer
                    .on_frame(info.width, info.height, &self.staging);
            }
        }
    }

    /// Inline (fallback) delivery, routed here by the session manager.
    /// Ignored once the sink is committed to shared memory.
    pub fn handle_inline(&mut self, width: u32, height: u32, pixels: &[u8]) {
        match self.transport {
            Transport::Shared(_) => {
                debug!(session = %self.session_id, "ignoring inline frame on shared-transport session");
            }
            Transport::Undecided => {
                info!(session = %self.session_id, "committing to inline frame delivery");
                self.transport = Transport::Inline;
                self.frames_received += 1;
                self.consumer.on_frame(width, height, pixels);
            }
            Transport::Inline => {
                self.frames_received += 1;
                self.consumer.on_frame(width, height, pixels);
            }
        }
    }

    /// Drops any mapping and returns the transport decision to undecided.
    ///
    /// Called after an update that resized the session (the renderer
    /// replaced the segment) and after a renderer relaunch (the new
    /// process recreates segments from scratch).
    pub fn reset(&mut self) {
        if !matches!(self.transport, Transport::Undecided) {
            debug!(session = %self.session_id, "sink reset");
        }
        self.transport = Transport::Undecided;
    }

    /// Dropped-frame count from the segment header, when shared.
    #[must_use]
    pub fn dropped_frames(&self) -> u64 {
        match &self.transport {
            Transport::Shared(reader) => reader.dropped_frames(),
            _ => 0,
        }
    }
}
