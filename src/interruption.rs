//! Barge-in: when the remote side reports the user talked over the model,
//! everything still queued for playback is cut at once.

use crate::audio::PlaybackScheduler;

#[derive(Debug, Default)]
pub struct InterruptionController {
    interruptions: u64,
    units_cut: u64,
}

impl InterruptionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel all scheduled playback. Safe to call with nothing queued.
    pub fn interrupt(&mut self, scheduler: &mut PlaybackScheduler) -> usize {
        let cut = scheduler.cancel_all();
        self.interruptions += 1;
        self.units_cut += cut as u64;
        log::info!(
            "Interrupted: cut {} playback units, cursor back at {} (at rest: {})",
            cut,
            scheduler.cursor(),
            scheduler.is_at_rest()
        );
        cut
    }

    pub fn interruptions(&self) -> u64 {
        self.interruptions
    }

    pub fn units_cut(&self) -> u64 {
        self.units_cut
    }
}
