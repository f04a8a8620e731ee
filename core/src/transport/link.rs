//! Stream link state machine shared by all concrete transports
//!
//! A link owns one byte stream and runs two tasks over its halves:
//!
//! - the output task sends HELLO first, then drains a FIFO of frames one at a
//!   time, adding heartbeats while the link is connected
//! - the input task decodes frames, performs the HELLO exchange and reports
//!   everything it receives to the owning transport as [`LinkEvent`]s
//!
//! Read errors, read timeouts, EOF, fatal framing errors and a closed output
//! side all end in the same place: the link becomes `Disconnected` and the
//! owner gets exactly one `Disconnected` event.

use super::abstraction::{LinkKind, TransportError};
use crate::config::Config;
use crate::frame::{encode_body, Frame, FrameDecoder, HelloFrame};
use crate::identity::NodeId;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, warn};

/// Size of a single read from the stream
const READ_CHUNK_SIZE: usize = 4096;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Any ordered, reliable byte stream a link can run over
pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> LinkStream for T {}

pub type BoxedStream = Box<dyn LinkStream>;

/// Process-unique link identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    fn next() -> Self {
        Self(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Link lifecycle; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
}

/// Requests accepted by a link's output task
#[derive(Debug)]
pub enum LinkCommand {
    Send(Frame),
    /// Close once every frame queued before this command is written
    Disconnect,
}

/// Per-link I/O settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub frame_size_max: usize,
    /// Send HEARTBEAT at this interval while connected
    pub heartbeat_interval: Option<Duration>,
    /// Tear the link down when no bytes arrive for this long
    pub read_timeout: Option<Duration>,
}

impl LinkConfig {
    /// Heartbeats and read timeout enabled (Wi-Fi links)
    pub fn with_keepalive(config: &Config) -> Self {
        Self {
            frame_size_max: config.frame_size_max,
            heartbeat_interval: Some(config.heartbeat_interval()),
            read_timeout: Some(config.timeout_interval()),
        }
    }

    /// Socket errors are the only liveness signal (Bluetooth links)
    pub fn without_keepalive(config: &Config) -> Self {
        Self {
            frame_size_max: config.frame_size_max,
            heartbeat_interval: None,
            read_timeout: None,
        }
    }
}

/// Event reported by a link to its owning transport
#[derive(Debug)]
pub struct LinkEvent {
    pub link: LinkId,
    pub kind: LinkEventKind,
}

#[derive(Debug)]
pub enum LinkEventKind {
    /// HELLO received; the link is now connected
    Connected(HelloFrame),
    /// Non-empty application payload
    Frame(Vec<u8>),
    /// PORTS / CONNECTED / DISCONNECTED
    Control(Frame),
    /// Terminal event, sent exactly once
    Disconnected { was_connected: bool },
}

/// Owner-side control of a link that may not have finished its HELLO yet
#[derive(Debug, Clone)]
pub struct LinkControl {
    id: LinkId,
    kind: LinkKind,
    commands: mpsc::UnboundedSender<LinkCommand>,
}

impl LinkControl {
    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    /// Handle for the connected link, once the partner's node id is known
    pub fn handle(&self, node_id: NodeId) -> LinkHandle {
        LinkHandle {
            id: self.id,
            kind: self.kind,
            node_id,
            commands: self.commands.clone(),
        }
    }

    pub fn send_link_frame(&self, frame: Frame) {
        if self.commands.send(LinkCommand::Send(frame)).is_err() {
            debug!("{} already closed, dropping frame", self.id);
        }
    }

    pub fn disconnect(&self) {
        let _ = self.commands.send(LinkCommand::Disconnect);
    }
}

/// A connected link: identity, priority, send and disconnect
#[derive(Debug, Clone)]
pub struct LinkHandle {
    id: LinkId,
    kind: LinkKind,
    node_id: NodeId,
    commands: mpsc::UnboundedSender<LinkCommand>,
}

impl LinkHandle {
    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn priority(&self) -> u8 {
        self.kind.priority()
    }

    /// Queue application data as a PAYLOAD frame
    pub fn send_frame(&self, data: Vec<u8>) -> Result<(), TransportError> {
        self.send_link_frame(Frame::payload(data))
    }

    /// Queue any frame, including switcher control frames
    pub fn send_link_frame(&self, frame: Frame) -> Result<(), TransportError> {
        self.commands
            .send(LinkCommand::Send(frame))
            .map_err(|_| TransportError::LinkClosed(self.id.to_string()))
    }

    /// Close after already queued frames are written
    pub fn disconnect(&self) {
        let _ = self.commands.send(LinkCommand::Disconnect);
    }
}

impl PartialEq for LinkHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for LinkHandle {}

impl fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} node {}", self.id, self.kind, self.node_id)
    }
}

/// Connect future for a stream that is already open (accepted sockets)
pub fn ready_stream<S>(stream: S) -> std::future::Ready<io::Result<BoxedStream>>
where
    S: LinkStream + 'static,
{
    std::future::ready(Ok(Box::new(stream) as BoxedStream))
}

/// Start a link over the stream produced by `connect`
///
/// Must be called from within a tokio runtime. The returned control accepts
/// commands right away; they are applied once the stream is open.
pub fn spawn_link<F>(
    kind: LinkKind,
    connect: F,
    hello: HelloFrame,
    config: LinkConfig,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> LinkControl
where
    F: Future<Output = io::Result<BoxedStream>> + Send + 'static,
{
    let id = LinkId::next();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();

    tokio::spawn(run_link(id, kind, connect, hello, config, commands_rx, events));

    LinkControl {
        id,
        kind,
        commands: commands_tx,
    }
}

async fn run_link<F>(
    id: LinkId,
    kind: LinkKind,
    connect: F,
    hello: HelloFrame,
    config: LinkConfig,
    commands: mpsc::UnboundedReceiver<LinkCommand>,
    events: mpsc::UnboundedSender<LinkEvent>,
) where
    F: Future<Output = io::Result<BoxedStream>>,
{
    let stream = match connect.await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("{} {} connect failed: {}", id, kind, e);
            let _ = events.send(LinkEvent {
                link: id,
                kind: LinkEventKind::Disconnected {
                    was_connected: false,
                },
            });
            return;
        }
    };
    debug!("{} {} stream open", id, kind);

    let (reader, writer) = tokio::io::split(stream);
    let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
    let closed = Arc::new(Notify::new());

    tokio::spawn(run_output(
        id,
        writer,
        commands,
        Frame::Hello(hello),
        config.clone(),
        state_rx,
        closed.clone(),
    ));

    let was_connected = run_input(id, reader, &config, &events, &state_tx, &closed).await;

    // Single teardown path for every way the input side can end.
    state_tx.send_replace(LinkState::Disconnected);
    debug!("{} {} disconnected (was connected: {})", id, kind, was_connected);
    let _ = events.send(LinkEvent {
        link: id,
        kind: LinkEventKind::Disconnected { was_connected },
    });
}

async fn run_input(
    id: LinkId,
    mut reader: ReadHalf<BoxedStream>,
    config: &LinkConfig,
    events: &mpsc::UnboundedSender<LinkEvent>,
    state: &watch::Sender<LinkState>,
    closed: &Notify,
) -> bool {
    let mut decoder = FrameDecoder::new(config.frame_size_max);
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    let mut connected = false;

    loop {
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    if let Some(event) = accept_frame(id, frame, &mut connected) {
                        if matches!(event, LinkEventKind::Connected(_)) {
                            state.send_replace(LinkState::Connected);
                        }
                        let _ = events.send(LinkEvent { link: id, kind: event });
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("{} framing error: {}", id, e);
                    return connected;
                }
            }
        }

        let read = tokio::select! {
            _ = closed.notified() => {
                debug!("{} output side closed", id);
                return connected;
            }
            read = read_chunk(&mut reader, &mut buf, config.read_timeout) => read,
        };

        match read {
            Ok(0) => {
                debug!("{} end of stream", id);
                return connected;
            }
            Ok(n) => decoder.extend(&buf[..n]),
            Err(e) => {
                debug!("{} read failed: {}", id, e);
                return connected;
            }
        }
    }
}

/// Apply the HELLO gate and filtering rules to one decoded frame
fn accept_frame(id: LinkId, frame: Frame, connected: &mut bool) -> Option<LinkEventKind> {
    if !*connected {
        return match frame {
            Frame::Hello(hello) => {
                *connected = true;
                Some(LinkEventKind::Connected(hello))
            }
            other => {
                debug!("{} dropping {} before HELLO", id, other.kind());
                None
            }
        };
    }

    match frame {
        Frame::Hello(_) => {
            debug!("{} ignoring repeated HELLO", id);
            None
        }
        Frame::Heartbeat => None,
        Frame::Payload(payload) if payload.payload.is_empty() => {
            debug!("{} dropping empty payload", id);
            None
        }
        Frame::Payload(payload) => Some(LinkEventKind::Frame(payload.payload)),
        control => Some(LinkEventKind::Control(control)),
    }
}

async fn read_chunk(
    reader: &mut ReadHalf<BoxedStream>,
    buf: &mut [u8],
    timeout: Option<Duration>,
) -> io::Result<usize> {
    match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, reader.read(buf)).await {
            Ok(read) => read,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
        },
        None => reader.read(buf).await,
    }
}

async fn run_output(
    id: LinkId,
    mut writer: WriteHalf<BoxedStream>,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    hello: Frame,
    config: LinkConfig,
    mut state: watch::Receiver<LinkState>,
    closed: Arc<Notify>,
) {
    let mut heartbeat = config.heartbeat_interval.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    if let Err(e) = write_frame(&mut writer, &hello, config.frame_size_max).await {
        debug!("{} failed to send HELLO: {}", id, e);
    } else {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(LinkCommand::Send(frame)) => {
                        if let Err(e) = write_frame(&mut writer, &frame, config.frame_size_max).await {
                            debug!("{} write failed, dropping queue: {}", id, e);
                            break;
                        }
                    }
                    Some(LinkCommand::Disconnect) | None => {
                        drain(id, &mut writer, &mut commands, config.frame_size_max).await;
                        break;
                    }
                },
                _ = next_heartbeat(&mut heartbeat) => {
                    if *state.borrow() == LinkState::Connected {
                        if let Err(e) = write_frame(&mut writer, &Frame::Heartbeat, config.frame_size_max).await {
                            debug!("{} heartbeat failed: {}", id, e);
                            break;
                        }
                    }
                }
                changed = state.changed() => {
                    if changed.is_err() || *state.borrow() == LinkState::Disconnected {
                        break;
                    }
                }
            }
        }
    }

    let _ = writer.shutdown().await;
    closed.notify_one();
}

/// Write whatever is still queued, then stop
async fn drain(
    id: LinkId,
    writer: &mut WriteHalf<BoxedStream>,
    commands: &mut mpsc::UnboundedReceiver<LinkCommand>,
    frame_size_max: usize,
) {
    while let Ok(command) = commands.try_recv() {
        if let LinkCommand::Send(frame) = command {
            if let Err(e) = write_frame(writer, &frame, frame_size_max).await {
                debug!("{} write failed while draining: {}", id, e);
                return;
            }
        }
    }
}

async fn next_heartbeat(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Write one frame: length prefix, body, flush
///
/// A frame that cannot be encoded is logged and skipped; only I/O errors are
/// returned.
async fn write_frame(
    writer: &mut WriteHalf<BoxedStream>,
    frame: &Frame,
    frame_size_max: usize,
) -> io::Result<()> {
    let body = match encode_body(frame, frame_size_max) {
        Ok(body) => body,
        Err(e) => {
            warn!("Dropping unencodable {} frame: {}", frame.kind(), e);
            return Ok(());
        }
    };
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}
