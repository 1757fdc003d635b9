//! Session lifecycle: one `VoiceSession` handle per conversation, driving a
//! single engine task that owns every piece of mutable session state.
//!
//! All inputs (caller stop, transport events, playback completions) funnel
//! into one `select!` loop, so inbound events are handled strictly in arrival
//! order and nothing else touches the scheduler, cursor or transcript.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::{AudioBackend, CapturePipeline, OutputEvent, PlaybackScheduler, UnitId};
use crate::config::Config;
use crate::error::{SessionError, SessionResult};
use crate::interruption::InterruptionController;
use crate::net_link::{NetCommand, NetEvent, Outbound, OutboundGate, Transport};
use crate::protocol::{ServerEvent, SessionSetup};
use crate::state_machine::{SessionState, StateCell};
use crate::transcript::{TranscriptAggregator, TranscriptEntry};

const EVENT_QUEUE_DEPTH: usize = 64;
const OUTBOUND_QUEUE_DEPTH: usize = 64;
/// Updates buffered for a slow consumer before new ones are dropped.
const UPDATE_QUEUE_DEPTH: usize = 256;

/// What the caller (UI layer) is told, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    State(SessionState),
    /// The model's audio started (true) or stopped (false) playing.
    Speaking(bool),
    /// The entry at `index` was added or grew.
    Transcript { index: usize, entry: TranscriptEntry },
    TranscriptCleared,
    Failed(SessionError),
}

enum Control {
    Stop(oneshot::Sender<()>),
    ClearTranscript(oneshot::Sender<()>),
}

type SharedTranscript = Arc<Mutex<TranscriptAggregator>>;

pub struct VoiceSession {
    id: Uuid,
    config: Config,
    backend: Arc<dyn AudioBackend>,
    transport: Option<Box<dyn Transport>>,
    state: Arc<StateCell>,
    transcript: SharedTranscript,
    updates_tx: mpsc::Sender<SessionUpdate>,
    updates_rx: Option<mpsc::Receiver<SessionUpdate>>,
    control_tx: Option<mpsc::Sender<Control>>,
    engine: Option<JoinHandle<()>>,
}

impl VoiceSession {
    pub fn new(config: Config, backend: Arc<dyn AudioBackend>, transport: Box<dyn Transport>) -> Self {
        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_QUEUE_DEPTH);
        Self {
            id: Uuid::new_v4(),
            config,
            backend,
            transport: Some(transport),
            state: Arc::new(StateCell::new()),
            transcript: Arc::new(Mutex::new(TranscriptAggregator::new())),
            updates_tx,
            updates_rx: Some(updates_rx),
            control_tx: None,
            engine: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// The ordered update stream. Can be taken once. Updates that find the
    /// queue full are dropped; `state()` and `transcript()` stay authoritative.
    pub fn take_updates(&mut self) -> Option<mpsc::Receiver<SessionUpdate>> {
        self.updates_rx.take()
    }

    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.transcript.lock().unwrap_or_else(PoisonError::into_inner).snapshot()
    }

    pub fn render_transcript(&self) -> String {
        self.transcript.lock().unwrap_or_else(PoisonError::into_inner).render()
    }

    /// Empty the transcript. While the engine runs it performs the clear, so
    /// every update published after `TranscriptCleared` describes new text.
    pub async fn clear_transcript(&self) {
        if let Some(control_tx) = self.control_tx.as_ref() {
            let (reply_tx, reply_rx) = oneshot::channel();
            if control_tx.send(Control::ClearTranscript(reply_tx)).await.is_ok()
                && reply_rx.await.is_ok()
            {
                return;
            }
        }
        // 引擎已退出，没有其他写者
        clear_transcript(&self.transcript, &self.updates_tx);
    }

    /// Open the output device, connect, and wait until the remote side has
    /// accepted the session. The microphone is acquired only once it has.
    ///
    /// Valid only from `Idle`. If the future is dropped early the session keeps
    /// connecting in the background; `stop()` tears it down.
    pub async fn start(&mut self) -> SessionResult<()> {
        let state = self.state.get();
        let transport = match (state, self.transport.take()) {
            (SessionState::Idle, Some(transport)) => transport,
            (_, transport) => {
                self.transport = transport;
                return Err(SessionError::InvalidState { op: "start", state });
            }
        };

        self.state.transition(SessionState::Connecting)?;
        offer(&self.updates_tx, SessionUpdate::State(SessionState::Connecting));
        log::info!("[{}] Session starting, model={}", self.id, self.config.model);

        let (ready_tx, ready_rx) = oneshot::channel();
        let (control_tx, control_rx) = mpsc::channel(4);
        let engine = SessionEngine {
            id: self.id,
            setup: SessionSetup::from_config(&self.config),
            config: self.config.clone(),
            backend: self.backend.clone(),
            transport,
            state: self.state.clone(),
            transcript: self.transcript.clone(),
            updates: self.updates_tx.clone(),
            control_rx,
            ready: Some(ready_tx),
            scheduler: None,
            capture: None,
            interruption: InterruptionController::new(),
            gate: OutboundGate::default(),
            out_tx: None,
            speaking: false,
            dropped_updates: 0,
        };
        self.control_tx = Some(control_tx);
        self.engine = Some(tokio::spawn(engine.run()));

        ready_rx.await.unwrap_or(Err(SessionError::Cancelled))
    }

    /// Tear the session down and release every device. Callable from any state
    /// and any number of times; only the first call does work.
    pub async fn stop(&mut self) {
        if self.state.get() == SessionState::Idle {
            self.transport = None;
            if self.state.transition(SessionState::Closed).is_ok() {
                offer(&self.updates_tx, SessionUpdate::State(SessionState::Closed));
                log::info!("[{}] Session closed before it started", self.id);
            }
            return;
        }

        if let Some(control_tx) = self.control_tx.take() {
            let (reply_tx, reply_rx) = oneshot::channel();
            // A closed channel means the engine already finished on its own
            if control_tx.send(Control::Stop(reply_tx)).await.is_ok() {
                let _ = reply_rx.await;
            }
        }
        if let Some(engine) = self.engine.take() {
            if let Err(e) = engine.await {
                log::error!("[{}] Session engine panicked: {}", self.id, e);
            }
        }
    }
}

// ======================== Engine ========================

struct SessionEngine {
    id: Uuid,
    config: Config,
    setup: SessionSetup,
    backend: Arc<dyn AudioBackend>,
    transport: Box<dyn Transport>,
    state: Arc<StateCell>,
    transcript: SharedTranscript,
    updates: mpsc::Sender<SessionUpdate>,
    control_rx: mpsc::Receiver<Control>,
    ready: Option<oneshot::Sender<SessionResult<()>>>,
    scheduler: Option<PlaybackScheduler>,
    capture: Option<CapturePipeline>,
    interruption: InterruptionController,
    gate: OutboundGate,
    out_tx: Option<mpsc::Sender<NetCommand>>,
    speaking: bool,
    dropped_updates: u64,
}

impl SessionEngine {
    async fn run(mut self) {
        let (output_tx, mut output_rx) = mpsc::unbounded_channel::<OutputEvent>();
        match PlaybackScheduler::open(
            self.backend.clone(),
            self.config.playback_sample_rate,
            output_tx,
        )
        .await
        {
            Ok(scheduler) => self.scheduler = Some(scheduler),
            Err(e) => {
                self.teardown(Some(e)).await;
                return;
            }
        }

        let (event_tx, mut event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        self.out_tx = Some(out_tx);

        // 连接期间也要响应 stop
        let connected = {
            let connect = self.transport.connect(&self.setup, event_tx, out_rx);
            tokio::pin!(connect);
            loop {
                tokio::select! {
                    biased;
                    ctrl = self.control_rx.recv() => match ctrl {
                        Some(Control::ClearTranscript(reply)) => {
                            clear_transcript(&self.transcript, &self.updates);
                            let _ = reply.send(());
                        }
                        ctrl => break Err(ctrl),
                    },
                    res = &mut connect => break Ok(res),
                }
            }
        };
        match connected {
            Ok(Ok(())) => log::info!("[{}] Transport connected, waiting for setup", self.id),
            Ok(Err(e)) => {
                self.teardown(Some(SessionError::transport(e))).await;
                return;
            }
            Err(ctrl) => {
                self.teardown(None).await;
                acknowledge(ctrl);
                return;
            }
        }

        loop {
            tokio::select! {
                biased;
                ctrl = self.control_rx.recv() => match ctrl {
                    Some(Control::ClearTranscript(reply)) => {
                        clear_transcript(&self.transcript, &self.updates);
                        let _ = reply.send(());
                    }
                    ctrl => {
                        self.teardown(None).await;
                        acknowledge(ctrl);
                        return;
                    }
                },
                event = event_rx.recv() => match event {
                    Some(NetEvent::Opened) => {
                        if let Err(e) = self.on_open().await {
                            self.teardown(Some(e)).await;
                            return;
                        }
                    }
                    Some(NetEvent::Inbound(event)) => self.on_server_event(event),
                    Some(NetEvent::Error(msg)) => {
                        self.teardown(Some(SessionError::Transport(msg))).await;
                        return;
                    }
                    Some(NetEvent::Closed(reason)) => {
                        self.on_remote_close(reason).await;
                        return;
                    }
                    None => {
                        self.on_remote_close(None).await;
                        return;
                    }
                },
                Some(event) = output_rx.recv() => match event {
                    OutputEvent::Ended(id) => self.on_unit_ended(id),
                    OutputEvent::Failed(reason) => {
                        self.teardown(Some(SessionError::DeviceUnavailable(reason))).await;
                        return;
                    }
                },
            }
        }
    }

    async fn on_open(&mut self) -> SessionResult<()> {
        if self.state.get() != SessionState::Connecting {
            log::debug!("[{}] Duplicate setup acknowledgement ignored", self.id);
            return Ok(());
        }
        self.set_state(SessionState::Open);
        self.gate.open();

        let Some(out_tx) = self.out_tx.clone() else {
            return Err(SessionError::Transport("outbound link already closed".to_string()));
        };
        let capture = CapturePipeline::start(
            self.backend.clone(),
            self.config.capture_sample_rate,
            self.config.capture_frame_size,
            Outbound::new(out_tx, self.gate.clone()),
        )
        .await?;
        self.capture = Some(capture);

        log::info!("[{}] Session open", self.id);
        self.resolve(Ok(()));
        Ok(())
    }

    fn on_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::AudioDelta(chunk) => {
                let Some(scheduler) = self.scheduler.as_mut() else {
                    return;
                };
                match scheduler.enqueue(&chunk) {
                    Ok(Some(_)) => self.set_speaking(true),
                    Ok(None) => {}
                    Err(e) => log::warn!("[{}] Skipping audio delta: {}", self.id, e),
                }
            }
            ServerEvent::TranscriptDelta { speaker, text } => {
                let changed = {
                    let mut transcript = self.transcript.lock().unwrap_or_else(PoisonError::into_inner);
                    if transcript.append(speaker, &text) {
                        transcript.entries().iter().cloned().enumerate().last()
                    } else {
                        None
                    }
                };
                if let Some((index, entry)) = changed {
                    self.publish(SessionUpdate::Transcript { index, entry });
                }
            }
            ServerEvent::Interrupted => {
                if let Some(scheduler) = self.scheduler.as_mut() {
                    self.interruption.interrupt(scheduler);
                }
                self.set_speaking(false);
                self.seal_transcript();
            }
            ServerEvent::TurnComplete => {
                log::debug!("[{}] Turn complete", self.id);
                self.seal_transcript();
            }
        }
    }

    fn on_unit_ended(&mut self, id: UnitId) {
        let at_rest = match self.scheduler.as_mut() {
            Some(scheduler) => scheduler.on_unit_ended(id),
            None => true,
        };
        if at_rest {
            self.set_speaking(false);
        }
    }

    async fn on_remote_close(&mut self, reason: Option<String>) {
        let reason = reason.unwrap_or_else(|| "no reason given".to_string());
        if self.state.get() == SessionState::Open {
            log::info!("[{}] Remote closed the session: {}", self.id, reason);
            self.teardown(None).await;
        } else {
            let e = SessionError::Transport(format!("closed before the session opened: {}", reason));
            self.teardown(Some(e)).await;
        }
    }

    /// Release everything this session holds. Devices go first so they are
    /// freed even if the transport close hangs.
    async fn teardown(&mut self, failure: Option<SessionError>) {
        let was_open = self.state.get() == SessionState::Open;

        // 先停采集并等编码任务退出，流结束标记之后不能再有音频
        self.gate.close();
        if let Some(mut capture) = self.capture.take() {
            capture.stop().await;
        }
        if was_open {
            self.send_stream_end().await;
        }
        if failure.is_none() && !self.state.get().is_terminal() {
            self.set_state(SessionState::Closing);
        }

        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.release().await;
        }
        self.set_speaking(false);

        // 释放发送端后 transport 才能完成关闭
        self.out_tx = None;
        match tokio::time::timeout(self.config.close_timeout(), self.transport.close()).await {
            Ok(Ok(())) => log::debug!("[{}] Transport closed", self.id),
            Ok(Err(e)) => log::warn!("[{}] Transport close failed: {:#}", self.id, e),
            Err(_) => log::warn!(
                "[{}] Transport close timed out after {}ms",
                self.id,
                self.config.close_timeout_ms
            ),
        }

        log::info!(
            "[{}] {} interruptions, {} playback units cut",
            self.id,
            self.interruption.interruptions(),
            self.interruption.units_cut()
        );
        if self.dropped_updates > 0 {
            log::warn!("[{}] {} session updates were dropped", self.id, self.dropped_updates);
        }

        match failure {
            Some(e) => {
                log::error!("[{}] Session failed: {}", self.id, e);
                self.set_state(SessionState::Failed);
                self.publish(SessionUpdate::Failed(e.clone()));
                self.resolve(Err(e));
            }
            None => {
                self.set_state(SessionState::Closed);
                log::info!("[{}] Session closed", self.id);
                self.resolve(Err(SessionError::Cancelled));
            }
        }
    }

    async fn send_stream_end(&mut self) {
        let Some(out_tx) = self.out_tx.as_ref() else {
            return;
        };
        let sent = tokio::time::timeout(
            self.config.close_timeout(),
            out_tx.send(NetCommand::AudioStreamEnd),
        )
        .await;
        if !matches!(sent, Ok(Ok(()))) {
            log::debug!("[{}] Could not queue end of audio stream", self.id);
        }
    }

    fn seal_transcript(&self) {
        self.transcript.lock().unwrap_or_else(PoisonError::into_inner).seal();
    }

    fn set_state(&mut self, to: SessionState) {
        match self.state.transition(to) {
            Ok(_) => self.publish(SessionUpdate::State(to)),
            Err(e) => log::debug!("[{}] {}", self.id, e),
        }
    }

    fn set_speaking(&mut self, speaking: bool) {
        if self.speaking != speaking {
            self.speaking = speaking;
            self.publish(SessionUpdate::Speaking(speaking));
        }
    }

    fn publish(&mut self, update: SessionUpdate) {
        if !offer(&self.updates, update) {
            self.dropped_updates += 1;
        }
    }

    /// Settle the pending `start()`, if it is still waiting.
    fn resolve(&mut self, result: SessionResult<()>) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(result);
        }
    }
}

fn acknowledge(ctrl: Option<Control>) {
    if let Some(Control::Stop(reply) | Control::ClearTranscript(reply)) = ctrl {
        let _ = reply.send(());
    }
}

fn clear_transcript(transcript: &SharedTranscript, updates: &mpsc::Sender<SessionUpdate>) {
    transcript.lock().unwrap_or_else(PoisonError::into_inner).clear();
    offer(updates, SessionUpdate::TranscriptCleared);
}

/// Queue an update without waiting. Returns false if it had to be dropped
/// because the consumer is behind; a consumer that went away is not counted.
fn offer(updates: &mpsc::Sender<SessionUpdate>, update: SessionUpdate) -> bool {
    match updates.try_send(update) {
        Ok(()) | Err(TrySendError::Closed(_)) => true,
        Err(TrySendError::Full(update)) => {
            log::debug!("Update queue full, dropping {:?}", update);
            false
        }
    }
}
