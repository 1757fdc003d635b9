//! Sample-accurate playback timeline.
//!
//! Buffers are placed at absolute frame positions on the output clock and
//! rendered period by period. A buffer scheduled to start exactly where the
//! previous one ends continues it with no silent frame in between.

use super::device::UnitId;

struct Voice {
    id: UnitId,
    start: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

#[derive(Default)]
pub struct Mixer {
    position: u64,
    voices: Vec<Voice>,
}

impl Mixer {
    pub fn new() -> Self {
        Self::default()
    }

    /// First frame of the next period to be rendered.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn active(&self) -> usize {
        self.voices.len()
    }

    pub fn schedule(&mut self, id: UnitId, samples: Vec<f32>, start: u64) {
        if start < self.position {
            log::debug!(
                "Unit {} scheduled {} frames behind the render head, leading frames are skipped",
                id,
                self.position - start
            );
        }
        self.voices.push(Voice { id, start, samples });
    }

    pub fn stop(&mut self, id: UnitId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.id != id);
        self.voices.len() != before
    }

    /// Render `out.len()` frames from the current position and advance it.
    /// Returns the buffers whose last frame was rendered in this period.
    pub fn render(&mut self, out: &mut [f32]) -> Vec<UnitId> {
        out.fill(0.0);
        let period_start = self.position;
        let period_end = period_start + out.len() as u64;
        let mut finished = Vec::new();

        for voice in &self.voices {
            let from = voice.start.max(period_start);
            let to = voice.end().min(period_end);
            for t in from..to {
                out[(t - period_start) as usize] += voice.samples[(t - voice.start) as usize];
            }
            if voice.end() <= period_end {
                finished.push(voice.id);
            }
        }

        self.voices.retain(|v| v.end() > period_end);
        self.position = period_end;
        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjacent_buffers_render_without_gap() {
        let mut mixer = Mixer::new();
        mixer.schedule(1, vec![0.25; 6], 2);
        mixer.schedule(2, vec![0.5; 4], 8);

        let mut out = vec![1.0; 8];
        assert_eq!(mixer.render(&mut out), vec![1]);
        assert_eq!(out, vec![0.0, 0.0, 0.25, 0.25, 0.25, 0.25, 0.25, 0.25]);

        let mut out = vec![1.0; 8];
        assert_eq!(mixer.render(&mut out), vec![2]);
        assert_eq!(out, vec![0.5, 0.5, 0.5, 0.5, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(mixer.position(), 16);
        assert_eq!(mixer.active(), 0);
    }

    #[test]
    fn buffer_ending_on_period_boundary_is_reported_once() {
        let mut mixer = Mixer::new();
        mixer.schedule(7, vec![0.1; 4], 0);
        let mut out = vec![0.0; 4];
        assert_eq!(mixer.render(&mut out), vec![7]);
        assert_eq!(mixer.render(&mut out), Vec::<UnitId>::new());
    }

    #[test]
    fn stopped_buffer_goes_silent_and_is_not_reported() {
        let mut mixer = Mixer::new();
        mixer.schedule(3, vec![0.5; 10], 0);
        let mut out = vec![0.0; 4];
        mixer.render(&mut out);
        assert!(mixer.stop(3));
        assert!(!mixer.stop(3));
        let finished = mixer.render(&mut out);
        assert!(finished.is_empty());
        assert_eq!(out, vec![0.0; 4]);
    }

    #[test]
    fn late_buffer_skips_frames_behind_the_head() {
        let mut mixer = Mixer::new();
        let mut out = vec![0.0; 4];
        mixer.render(&mut out);
        mixer.schedule(9, vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6], 2);
        assert_eq!(mixer.render(&mut out), vec![9]);
        assert_eq!(out, vec![0.3, 0.4, 0.5, 0.6]);
    }
}
