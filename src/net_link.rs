use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

use crate::audio::pcm::EncodedChunk;
use crate::config::Config;
use crate::protocol::{self, ServerEvent, SessionSetup};

#[derive(Debug)]
pub enum NetEvent {
    /// The remote side acknowledged the setup frame.
    Opened,
    Inbound(ServerEvent),
    Error(String),
    Closed(Option<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum NetCommand {
    Audio(EncodedChunk),
    AudioStreamEnd,
}

/// A bidirectional link to the conversational model.
///
/// `connect` returns once the setup frame is on the wire; `NetEvent::Opened`
/// follows when the remote acknowledges it. Outbound commands are sent in the
/// order they are received until `outbound` is closed. Audio received after
/// `AudioStreamEnd` is dropped.
#[async_trait]
pub trait Transport: Send {
    async fn connect(
        &mut self,
        setup: &SessionSetup,
        events: mpsc::Sender<NetEvent>,
        outbound: mpsc::Receiver<NetCommand>,
    ) -> Result<()>;

    /// Flush pending outbound frames and close. Callers drop the outbound
    /// sender first.
    async fn close(&mut self) -> Result<()>;
}

// ======================== Outbound gate ========================

/// Lets captured audio through only while the session is open.
#[derive(Debug, Clone, Default)]
pub struct OutboundGate(Arc<AtomicBool>);

impl OutboundGate {
    pub fn open(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<NetCommand>,
    gate: OutboundGate,
}

impl Outbound {
    pub fn new(tx: mpsc::Sender<NetCommand>, gate: OutboundGate) -> Self {
        Self { tx, gate }
    }

    /// Returns false once the gate is shut or the link is gone.
    pub async fn send(&self, cmd: NetCommand) -> bool {
        if !self.gate.is_open() {
            return false;
        }
        self.tx.send(cmd).await.is_ok()
    }
}

// ======================== WebSocket link ========================

pub struct LiveLink {
    ws_url: String,
    api_key: String,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl LiveLink {
    pub fn new(config: &Config) -> Self {
        Self {
            ws_url: config.ws_url.to_string(),
            api_key: config.api_key.clone(),
            writer: None,
            reader: None,
        }
    }

    fn endpoint(&self) -> Result<Url> {
        let mut url = Url::parse(&self.ws_url)?;
        if !self.api_key.is_empty() {
            url.query_pairs_mut().append_pair("key", &self.api_key);
        }
        Ok(url)
    }
}

#[async_trait]
impl Transport for LiveLink {
    async fn connect(
        &mut self,
        setup: &SessionSetup,
        events: mpsc::Sender<NetEvent>,
        mut outbound: mpsc::Receiver<NetCommand>,
    ) -> Result<()> {
        let url = self.endpoint()?;
        // 不打印带 key 的完整 URL
        log::info!(
            "Connecting to {}://{}{}...",
            url.scheme(),
            url.host_str().unwrap_or("?"),
            url.path()
        );
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        log::info!("Connected!");

        let (mut write, mut read) = ws_stream.split();

        // 首帧必须是 setup
        let setup_json = serde_json::to_string(&setup.to_message())?;
        log::debug!("Sending setup: {}", setup_json);
        write.send(Message::Text(setup_json.into())).await?;

        self.writer = Some(tokio::spawn(async move {
            let mut stream_ended = false;
            while let Some(cmd) = outbound.recv().await {
                let text = match encode_outbound(&cmd, &mut stream_ended) {
                    Some(Ok(text)) => text,
                    Some(Err(e)) => {
                        log::error!("Failed to encode {:?}: {}", cmd, e);
                        continue;
                    }
                    None => {
                        log::debug!("Dropping audio after stream end");
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    log::warn!("WebSocket write failed: {}", e);
                    return;
                }
            }
            // 发送端全部释放：走关闭握手
            if let Err(e) = write.close().await {
                log::debug!("WebSocket close: {}", e);
            }
        }));

        self.reader = Some(tokio::spawn(async move {
            loop {
                let event = match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if forward_inbound(text.as_bytes(), &events).await {
                            continue;
                        }
                        return;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if forward_inbound(&data, &events).await {
                            continue;
                        }
                        return;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("Server closed connection: {:?}", frame);
                        NetEvent::Closed(frame.map(|f| f.reason.as_str().to_string()))
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => NetEvent::Error(e.to_string()),
                    None => NetEvent::Closed(None),
                };
                let _ = events.send(event).await;
                return;
            }
        }));

        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.await?;
            self.writer = None;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        Ok(())
    }
}

impl Drop for LiveLink {
    fn drop(&mut self) {
        for handle in [self.writer.take(), self.reader.take()].into_iter().flatten() {
            handle.abort();
        }
    }
}

/// Serialize one outbound command. Returns `None` for audio that follows
/// `AudioStreamEnd`.
fn encode_outbound(cmd: &NetCommand, stream_ended: &mut bool) -> Option<serde_json::Result<String>> {
    match cmd {
        NetCommand::Audio(_) if *stream_ended => None,
        NetCommand::Audio(chunk) => Some(serde_json::to_string(&protocol::audio_input(chunk))),
        NetCommand::AudioStreamEnd => {
            *stream_ended = true;
            Some(serde_json::to_string(&protocol::audio_stream_end()))
        }
    }
}

/// Decode one inbound frame and forward its events. Returns false once the
/// receiving side is gone.
async fn forward_inbound(raw: &[u8], events: &mpsc::Sender<NetEvent>) -> bool {
    let inbound = match protocol::decode_server_message(raw) {
        Ok(inbound) => inbound,
        Err(e) => {
            log::warn!("Skipping inbound frame: {}", e);
            return true;
        }
    };
    for e in &inbound.malformed {
        log::warn!("Skipping inbound payload: {}", e);
    }
    if let Some(time_left) = &inbound.go_away {
        log::warn!("Server is going away, time left: {}", time_left);
    }
    if inbound.setup_complete && events.send(NetEvent::Opened).await.is_err() {
        return false;
    }
    for event in inbound.events {
        if events.send(NetEvent::Inbound(event)).await.is_err() {
            return false;
        }
    }
    true
}
