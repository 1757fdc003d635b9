//! Microphone → wire: fixed-size frames, PCM16 encoded, gated on session state.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::device::{AudioBackend, InputStream};
use super::pcm::{self, EncodedChunk};
use crate::error::{SessionError, SessionResult};
use crate::net_link::{NetCommand, Outbound};

/// Device blocks queued between the capture thread and the encoder.
const CAPTURE_QUEUE_DEPTH: usize = 32;

/// Regroups arbitrary-length device blocks into frames of exactly `frame_len` samples.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_len: usize,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(frame_len: usize) -> Self {
        let frame_len = frame_len.max(1);
        Self {
            frame_len,
            pending: Vec::with_capacity(frame_len),
        }
    }

    pub fn push(&mut self, block: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(block);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_len {
            let rest = self.pending.split_off(self.frame_len);
            frames.push(std::mem::replace(&mut self.pending, rest));
        }
        frames
    }
}

/// Owns the input stream and the task that encodes and forwards its frames.
pub struct CapturePipeline {
    input: Option<Box<dyn InputStream>>,
    task: Option<JoinHandle<()>>,
}

impl CapturePipeline {
    /// Open the microphone and start forwarding frames. Opening runs on the
    /// blocking pool.
    pub async fn start(
        backend: Arc<dyn AudioBackend>,
        sample_rate: u32,
        frame_len: usize,
        outbound: Outbound,
    ) -> SessionResult<Self> {
        let (block_tx, mut block_rx) = mpsc::channel::<Vec<f32>>(CAPTURE_QUEUE_DEPTH);
        let input = tokio::task::spawn_blocking(move || backend.open_input(sample_rate, block_tx))
            .await
            .map_err(SessionError::device)?
            .map_err(SessionError::device)?;

        let task = tokio::spawn(async move {
            let mut assembler = FrameAssembler::new(frame_len);
            let mut sent = 0u64;
            while let Some(block) = block_rx.recv().await {
                for frame in assembler.push(&block) {
                    let chunk = EncodedChunk::pcm16(pcm::encode(&frame), sample_rate);
                    if !outbound.send(NetCommand::Audio(chunk)).await {
                        log::debug!("Capture gate closed after {} frames", sent);
                        return;
                    }
                    sent += 1;
                }
            }
            log::debug!("Capture stream ended after {} frames", sent);
        });

        log::info!("Capture started: rate={}, frame={}", sample_rate, frame_len);
        Ok(Self {
            input: Some(input),
            task: Some(task),
        })
    }

    /// Stop forwarding, then release the microphone. When this returns no
    /// further frame can reach the link. A trailing partial frame is
    /// discarded. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            // 等任务真正结束：abort 只在下一个 await 点生效
            if let Err(e) = task.await {
                if e.is_panic() {
                    log::error!("Capture task panicked: {}", e);
                }
            }
        }
        if let Some(mut input) = self.input.take() {
            if let Err(e) = tokio::task::spawn_blocking(move || input.close()).await {
                log::error!("Closing capture input panicked: {}", e);
            }
            log::info!("Capture stopped");
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(mut input) = self.input.take() {
            input.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::{OutputEvent, OutputStream};
    use crate::net_link::OutboundGate;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[test]
    fn assembler_emits_exact_frames() {
        let mut asm = FrameAssembler::new(4);
        assert!(asm.push(&[0.1, 0.2, 0.3]).is_empty());
        let frames = asm.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9]);
        assert_eq!(frames, vec![vec![0.1, 0.2, 0.3, 0.4], vec![0.5, 0.6, 0.7, 0.8]]);
        assert_eq!(asm.push(&[1.0, 1.1, 1.2]), vec![vec![0.9, 1.0, 1.1, 1.2]]);
    }

    #[derive(Default)]
    struct FakeMic {
        sink: Mutex<Option<mpsc::Sender<Vec<f32>>>>,
        closes: Arc<AtomicU32>,
    }

    struct FakeInput(Arc<AtomicU32>);

    impl InputStream for FakeInput {
        fn close(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl AudioBackend for FakeMic {
        fn open_input(
            &self,
            _sample_rate: u32,
            sink: mpsc::Sender<Vec<f32>>,
        ) -> anyhow::Result<Box<dyn InputStream>> {
            *self.sink.lock().unwrap() = Some(sink);
            Ok(Box::new(FakeInput(self.closes.clone())))
        }

        fn open_output(
            &self,
            _sample_rate: u32,
            _events: mpsc::UnboundedSender<OutputEvent>,
        ) -> anyhow::Result<Box<dyn OutputStream>> {
            anyhow::bail!("no speaker")
        }
    }

    #[tokio::test]
    async fn frames_are_encoded_in_capture_order() {
        let mic = Arc::new(FakeMic::default());
        let (tx, mut rx) = mpsc::channel(8);
        let gate = OutboundGate::default();
        gate.open();
        let mut pipeline = CapturePipeline::start(mic.clone(), 16000, 2, Outbound::new(tx, gate))
            .await
            .unwrap();

        let sink = mic.sink.lock().unwrap().clone().unwrap();
        sink.send(vec![0.5, 0.5, -0.5]).await.unwrap();
        sink.send(vec![-0.5]).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(
            first,
            NetCommand::Audio(EncodedChunk::pcm16(pcm::encode(&[0.5, 0.5]), 16000))
        );
        assert_eq!(
            second,
            NetCommand::Audio(EncodedChunk::pcm16(pcm::encode(&[-0.5, -0.5]), 16000))
        );

        pipeline.stop().await;
        pipeline.stop().await;
        assert_eq!(mic.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn nothing_is_forwarded_once_stop_returns() {
        let mic = Arc::new(FakeMic::default());
        let (tx, mut rx) = mpsc::channel(64);
        let gate = OutboundGate::default();
        gate.open();
        let mut pipeline = CapturePipeline::start(mic.clone(), 16000, 1, Outbound::new(tx, gate))
            .await
            .unwrap();

        let sink = mic.sink.lock().unwrap().clone().unwrap();
        let feeder = tokio::spawn(async move {
            while sink.send(vec![0.25; 8]).await.is_ok() {
                tokio::task::yield_now().await;
            }
        });
        rx.recv().await.unwrap();

        pipeline.stop().await;
        while rx.try_recv().is_ok() {}
        // the encoder has exited, so its sender is gone
        assert_eq!(rx.recv().await, None);
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn closed_gate_sends_nothing() {
        let mic = Arc::new(FakeMic::default());
        let (tx, mut rx) = mpsc::channel(8);
        let _pipeline =
            CapturePipeline::start(mic.clone(), 16000, 1, Outbound::new(tx, OutboundGate::default()))
                .await
                .unwrap();

        let sink = mic.sink.lock().unwrap().clone().unwrap();
        sink.send(vec![0.1, 0.2]).await.unwrap();
        tokio::task::yield_now().await;
        // the task exits at the closed gate and drops its sender
        assert_eq!(rx.recv().await, None);
    }
}
