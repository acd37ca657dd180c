//! Boundary to the page-rendering engine.
//!
//! The engine itself (page load, script execution, compositing) is an
//! external collaborator. The bridge sees it only as a [`PaintSource`]:
//! something that can be pointed at a URL, resized, and ticked, and that
//! hands over a completed BGRA buffer through a callback. Embedders inject
//! a factory; the crate ships [`PatternSource`] so the binary and the
//! tests have a source that paints without an engine.

use crate::renderer::session::SessionParams;

/// One off-screen page renderer bound to a session.
///
/// `tick` performs one unit of engine work and invokes `on_frame` at most
/// once with a buffer of exactly the current `width * height * 4` bytes.
/// The buffer is only valid for the duration of the callback.
pub trait PaintSource: Send {
    fn navigate(&mut self, url: &str);
    fn resize(&mut self, width: u32, height: u32);
    fn tick(&mut self, on_frame: &mut dyn FnMut(&[u8]));
}

/// Builds a paint source for a newly created session.
pub type PaintSourceFactory = Box<dyn Fn(&SessionParams) -> Box<dyn PaintSource> + Send>;

/// Engine-free paint source: an animated gradient seeded by the URL.
///
/// Every tick yields a full frame, so pacing is entirely the session's
/// decision.
pub struct PatternSource {
    width: u32,
    height: u32,
    seed: u8,
    frame: u64,
    buffer: Vec<u8>,
}

impl PatternSource {
    #[must_use]
    pub fn new(width: u32, height: u32, url: &str) -> Self {
        let mut source = Self {
            width,
            height,
            seed: 0,
            frame: 0,
            buffer: Vec::new(),
        };
        source.navigate(url);
        source.resize(width, height);
        source
    }

    fn repaint(&mut self) {
        let (w, h) = (self.width as usize, self.height as usize);
        self.buffer.resize(w * h * 4, 0);
        let shift = (self.frame % 256) as u8;
        for y in 0..h {
            for x in 0..w {
                let px = (y * w + x) * 4;
                self.buffer[px] = (x as u8).wrapping_add(shift); // B
                self.buffer[px + 1] = (y as u8).wrapping_add(self.seed); // G
                self.buffer[px + 2] = shift ^ self.seed; // R
                self.buffer[px + 3] = 0xFF; // A
            }
        }
    }
}

impl PaintSource for PatternSource {
    fn navigate(&mut self, url: &str) {
        self.seed = url.bytes().fold(0u8, |acc, b| acc.wrapping_mul(31).wrapping_add(b));
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.buffer.clear();
    }

    fn tick(&mut self, on_frame: &mut dyn FnMut(&[u8])) {
        self.repaint();
        self.frame += 1;
        on_frame(&self.buffer);
    }
}

/// The factory the renderer binary uses when no engine is wired in.
#[must_use]
pub fn pattern_factory() -> PaintSourceFactory {
    Box::new(|params: &SessionParams| -> Box<dyn PaintSource> {
        Box::new(PatternSource::new(params.width, params.height, &params.url))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_full_frames_of_the_right_size() {
        let mut source = PatternSource::new(8, 4, "https://example.com");
        let mut sizes = Vec::new();
        for _ in 0..3 {
            source.tick(&mut |frame| sizes.push(frame.len()));
        }
        assert_eq!(sizes, vec![8 * 4 * 4; 3]);
    }

    #[test]
    fn frames_change_between_ticks() {
        let mut source = PatternSource::new(4, 4, "https://example.com");
        let mut first = Vec::new();
        let mut second = Vec::new();
        source.tick(&mut |f| first = f.to_vec());
        source.tick(&mut |f| second = f.to_vec());
        assert_ne!(first, second);
    }

    #[test]
    fn resize_changes_frame_length() {
        let mut source = PatternSource::new(4, 4, "x");
        source.resize(2, 2);
        source.tick(&mut |frame| assert_eq!(frame.len(), 2 * 2 * 4));
    }

    #[test]
    fn navigation_reseeds_the_pattern() {
        let mut a = PatternSource::new(4, 4, "https://one.example");
        let mut b = PatternSource::new(4, 4, "https://two.example");
        let mut fa = Vec::new();
        let mut fb = Vec::new();
        a.tick(&mut |f| fa = f.to_vec());
        b.tick(&mut |f| fb = f.to_vec());
        assert_ne!(fa, fb);
    }
}
