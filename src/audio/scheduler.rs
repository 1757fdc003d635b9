//! Gapless playback of inbound audio deltas.
//!
//! Each delta becomes a playback unit placed on the output clock at
//! `max(cursor, now)`, where `cursor` is the end of the previously scheduled
//! unit. Back-to-back deltas therefore abut exactly; a delta that arrives after
//! the queue has drained starts immediately.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::device::{AudioBackend, OutputEvent, OutputStream, UnitId};
use super::pcm::EncodedChunk;
use crate::error::{SessionError, SessionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackUnit {
    pub id: UnitId,
    /// Output clock position (frames) at which the unit starts.
    pub start: u64,
    pub frames: u64,
}

impl PlaybackUnit {
    pub fn end(&self) -> u64 {
        self.start + self.frames
    }
}

pub struct PlaybackScheduler {
    output: Option<Box<dyn OutputStream>>,
    /// End of the last scheduled unit, in output frames.
    cursor: u64,
    live: BTreeMap<UnitId, PlaybackUnit>,
    next_id: UnitId,
}

impl PlaybackScheduler {
    /// Open the output device off the async workers; opening may block.
    pub async fn open(
        backend: Arc<dyn AudioBackend>,
        sample_rate: u32,
        events: mpsc::UnboundedSender<OutputEvent>,
    ) -> SessionResult<Self> {
        let output = tokio::task::spawn_blocking(move || backend.open_output(sample_rate, events))
            .await
            .map_err(SessionError::device)?
            .map_err(SessionError::device)?;
        Ok(Self::with_output(output))
    }

    pub fn with_output(output: Box<dyn OutputStream>) -> Self {
        let cursor = output.now();
        Self {
            output: Some(output),
            cursor,
            live: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Decode `chunk` and schedule it right after everything already queued.
    ///
    /// Returns `Ok(None)` once the output has been closed.
    pub fn enqueue(&mut self, chunk: &EncodedChunk) -> SessionResult<Option<PlaybackUnit>> {
        let Some(output) = self.output.as_mut() else {
            return Ok(None);
        };
        if !chunk.is_pcm() {
            return Err(SessionError::MalformedInbound(format!(
                "unsupported audio format: {}",
                chunk.mime_type
            )));
        }

        let rate = output.sample_rate();
        let frame = chunk.decode(rate);
        let duration = frame.duration();
        let samples = frame.into_mono(rate);
        if samples.is_empty() {
            return Err(SessionError::MalformedInbound(
                "audio delta decodes to zero frames".to_string(),
            ));
        }

        let unit = PlaybackUnit {
            id: self.next_id,
            start: self.cursor.max(output.now()),
            frames: samples.len() as u64,
        };
        self.next_id += 1;

        output.schedule_buffer(unit.id, samples, unit.start);
        self.cursor = unit.end();
        self.live.insert(unit.id, unit);
        log::trace!("Scheduled unit {} at {} ({:?})", unit.id, unit.start, duration);
        Ok(Some(unit))
    }

    /// A unit played to its end. Returns true when nothing is left queued.
    pub fn on_unit_ended(&mut self, id: UnitId) -> bool {
        if self.live.remove(&id).is_none() {
            log::debug!("Completion for unknown playback unit {}", id);
        }
        self.live.is_empty()
    }

    /// Stop every scheduled unit and rewind the cursor to the present.
    /// Returns how many units were cut.
    pub fn cancel_all(&mut self) -> usize {
        let cut = self.live.len();
        if let Some(output) = self.output.as_mut() {
            for id in self.live.keys() {
                output.stop(*id);
            }
            if cut > 0 {
                output.flush();
            }
            self.cursor = output.now();
        }
        self.live.clear();
        cut
    }

    pub fn is_at_rest(&self) -> bool {
        self.live.is_empty()
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Cut all audio and release the output device without stalling the
    /// async workers. Idempotent.
    pub async fn release(&mut self) {
        self.cancel_all();
        if let Some(mut output) = self.output.take() {
            if let Err(e) = tokio::task::spawn_blocking(move || output.close()).await {
                log::error!("Closing playback output panicked: {}", e);
            }
            log::info!("Playback output released");
        }
    }

    /// Blocking variant of [`release`](Self::release), used on drop. Idempotent.
    pub fn close(&mut self) {
        self.cancel_all();
        if let Some(mut output) = self.output.take() {
            output.close();
            log::info!("Playback output released");
        }
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.close();
    }
}
