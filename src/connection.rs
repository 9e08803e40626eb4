//! The per-socket connection state machine.
//!
//! A [`WebSocketConnection`] is a cheap handle over shared state. A dedicated
//! reader task owns the inbound half of the stream and drives the codec; all
//! writers (data frames, pong replies, close frames) serialize through one
//! fair lock over the outbound half, so frames never interleave on the wire.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tokio_util::task::TaskTracker;

use crate::error::{Error, Result};
use crate::protocol::frame::CloseFrame;
use crate::protocol::{CloseCode, FrameEncoder, Message, Role, WireCodec, WireEvent};
use crate::stream::ByteStream;

/// How long the closing handshake may take before the reader task is torn
/// down and the stream closed regardless.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bytes per read on the inbound path.
const RECV_CHUNK: usize = 4096;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Why a connection was closed.
///
/// Available from [`WebSocketConnection::close_reason`] once the connection
/// is closed, and carried by [`Error::ConnectionClosed`]. Reflects local or
/// remote intent, whichever arrived first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    code: CloseCode,
    reason: Option<String>,
}

impl CloseReason {
    pub(crate) fn new(code: CloseCode, reason: Option<String>) -> Self {
        CloseReason { code, reason }
    }

    /// The close code.
    pub fn code(&self) -> CloseCode {
        self.code
    }

    /// The registry mnemonic of the close code (`NORMAL_CLOSURE`, ...).
    pub fn name(&self) -> &'static str {
        self.code.name()
    }

    /// The close reason text, if any.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.reason {
            Some(ref reason) => write!(f, "{} {}: {}", self.code, self.name(), reason),
            None => write!(f, "{} {}", self.code, self.name()),
        }
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    /// The opening handshake is not finished yet.
    Connecting,
    /// Both data and control traffic flow.
    Open,
    /// We sent a close frame and wait for the reply.
    LocalClosing,
    /// The peer sent a close frame.
    RemoteClosing,
    /// The connection does not exist anymore.
    Closed,
}

struct WriteEnd {
    half: WriteHalf<Box<dyn ByteStream>>,
    encoder: FrameEncoder,
}

impl WriteEnd {
    async fn write(&mut self, out: &[u8]) -> Result<()> {
        self.half.write_all(out).await?;
        self.half.flush().await?;
        Ok(())
    }
}

struct Shared {
    id: u64,
    role: Role,
    path: String,
    subprotocol: Option<String>,
    state: StdMutex<ConnectionState>,
    close_reason: StdMutex<Option<CloseReason>>,
    /// Set once `aclose` ran locally: buffered messages are then discarded.
    local_closed: AtomicBool,
    /// Single-slot guard over the outbound stream; acquisition is FIFO-fair.
    writer: Mutex<WriteEnd>,
    /// Consumer side of the message buffer, shared first-come-first-served.
    receiver: Mutex<mpsc::UnboundedReceiver<Message>>,
    /// In-flight pings by exact payload bytes.
    pending_pings: StdMutex<HashMap<Vec<u8>, oneshot::Sender<()>>>,
    /// Flips to `true` when the reader task terminates.
    reader_done: watch::Receiver<bool>,
    reader_abort: StdMutex<Option<AbortHandle>>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.lock().expect("Bug: state lock poisoned")
    }

    fn set_state(&self, next: ConnectionState) {
        *self.state.lock().expect("Bug: state lock poisoned") = next;
    }

    /// Record the close reason, unless one was recorded before.
    fn record_close_reason(&self, reason: CloseReason) {
        let mut slot = self.close_reason.lock().expect("Bug: close_reason lock poisoned");
        if slot.is_none() {
            debug!("conn#{}: closing, {reason}", self.id);
            *slot = Some(reason);
        }
    }

    fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().expect("Bug: close_reason lock poisoned").clone()
    }

    fn closed_error(&self) -> Error {
        let reason = self
            .close_reason()
            .unwrap_or_else(|| CloseReason::new(CloseCode::Abnormal, None));
        Error::ConnectionClosed(reason)
    }

    /// Map a failed write on a dead transport to `ConnectionClosed`.
    fn translate_write_error(&self, err: Error) -> Error {
        match err {
            Error::Io(_) => {
                self.record_close_reason(CloseReason::new(CloseCode::Abnormal, None));
                self.closed_error()
            }
            err => err,
        }
    }

    async fn send_data(&self, message: Message) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let mut out = Vec::new();
        writer.encoder.encode_message(message, &mut out);
        writer.write(&out).await
    }

    async fn send_ping_frame(&self, payload: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let mut out = Vec::new();
        writer.encoder.encode_ping(payload, &mut out)?;
        writer.write(&out).await
    }

    async fn send_pong_frame(&self, payload: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let mut out = Vec::new();
        writer.encoder.encode_pong(payload, &mut out)?;
        writer.write(&out).await
    }

    async fn send_close_frame(&self, close: Option<CloseFrame>) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let mut out = Vec::new();
        writer.encoder.encode_close(close, &mut out)?;
        writer.write(&out).await
    }
}

/// A message-oriented WebSocket connection.
///
/// Handles are cheap to clone; all clones observe the same connection. Every
/// operation that touches the stream may suspend, the plain accessors
/// ([`is_closed`](Self::is_closed), [`subprotocol`](Self::subprotocol),
/// [`path`](Self::path), [`close_reason`](Self::close_reason)) never do.
#[derive(Clone)]
pub struct WebSocketConnection {
    shared: Arc<Shared>,
}

impl WebSocketConnection {
    /// Take ownership of a stream whose handshake already finished and start
    /// the reader task in `scope`.
    pub(crate) fn spawn(
        scope: &TaskTracker,
        stream: Box<dyn ByteStream>,
        role: Role,
        path: String,
        subprotocol: Option<String>,
        leftover: Vec<u8>,
    ) -> Self {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        debug!("conn#{id}: {role:?} connection for {path:?}");

        let (read_half, write_half) = tokio::io::split(stream);
        let (messages, receiver) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);
        let codec = WireCodec::new(role, leftover);

        let shared = Arc::new(Shared {
            id,
            role,
            path,
            subprotocol,
            state: StdMutex::new(ConnectionState::Connecting),
            close_reason: StdMutex::new(None),
            local_closed: AtomicBool::new(false),
            writer: Mutex::new(WriteEnd { half: write_half, encoder: FrameEncoder::new(role) }),
            receiver: Mutex::new(receiver),
            pending_pings: StdMutex::new(HashMap::new()),
            reader_done: done_rx,
            reader_abort: StdMutex::new(None),
        });
        shared.set_state(ConnectionState::Open);

        let reader = scope.spawn(reader_task(shared.clone(), read_half, codec, messages, done_tx));
        *shared.reader_abort.lock().expect("Bug: reader_abort lock poisoned") =
            Some(reader.abort_handle());

        WebSocketConnection { shared }
    }

    /// The connection id, unique within the process.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Whether this is the client or the server end.
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// The subprotocol agreed during the handshake, if any.
    pub fn subprotocol(&self) -> Option<&str> {
        self.shared.subprotocol.as_deref()
    }

    /// The request target: what this client requested, or what this server
    /// received. Query strings are preserved verbatim.
    pub fn path(&self) -> &str {
        &self.shared.path
    }

    /// `true` once the connection reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.shared.state() == ConnectionState::Closed
    }

    /// The recorded close reason; set once the connection is closing.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.close_reason()
    }

    /// Wait for and return the next buffered message.
    ///
    /// Messages the peer sent before closing stay readable after the close;
    /// once the buffer is drained (or after a local [`aclose`](Self::aclose),
    /// immediately) this fails with [`Error::ConnectionClosed`].
    pub async fn get_message(&self) -> Result<Message> {
        if self.shared.local_closed.load(Ordering::Acquire) {
            return Err(self.shared.closed_error());
        }
        let mut receiver = self.shared.receiver.lock().await;
        if self.shared.local_closed.load(Ordering::Acquire) {
            return Err(self.shared.closed_error());
        }
        match receiver.recv().await {
            Some(message) => Ok(message),
            None => Err(self.shared.closed_error()),
        }
    }

    /// Send one data message: a text frame for [`Message::Text`], a binary
    /// frame for [`Message::Binary`].
    pub async fn send_message(&self, message: impl Into<Message>) -> Result<()> {
        if self.shared.state() != ConnectionState::Open {
            return Err(self.shared.closed_error());
        }
        self.shared
            .send_data(message.into())
            .await
            .map_err(|err| self.shared.translate_write_error(err))
    }

    /// Send a ping and wait for the matching pong.
    ///
    /// With `None` a fresh 32-bit payload is generated. Fails with
    /// [`Error::PingInFlight`] if a ping with the same payload is already
    /// outstanding; no frame is sent in that case.
    pub async fn ping(&self, payload: Option<Vec<u8>>) -> Result<()> {
        if self.shared.state() != ConnectionState::Open {
            return Err(self.shared.closed_error());
        }
        let payload =
            payload.unwrap_or_else(|| rand::random::<u32>().to_be_bytes().to_vec());
        let pong = {
            let mut pending =
                self.shared.pending_pings.lock().expect("Bug: pending_pings lock poisoned");
            if pending.contains_key(&payload) {
                return Err(Error::PingInFlight);
            }
            let (tx, rx) = oneshot::channel();
            pending.insert(payload.clone(), tx);
            rx
        };
        // Frees the payload again if this future is cancelled or the send
        // fails.
        let claimed = PendingPing { shared: self.shared.clone(), payload: Some(payload) };

        if let Err(err) = self.shared.send_ping_frame(claimed.payload()).await {
            return Err(self.shared.translate_write_error(err));
        }
        trace!("conn#{}: ping {:?} sent", self.shared.id, claimed.payload());

        match pong.await {
            Ok(()) => {
                // The reader removed the entry with the pong; a fresh ping
                // may reuse the payload, so the claim must not fire.
                claimed.disarm();
                Ok(())
            }
            // The reader dropped the map: connection torn down mid-ping.
            Err(_) => Err(self.shared.closed_error()),
        }
    }

    /// Send an unsolicited pong.
    pub async fn pong(&self, payload: &[u8]) -> Result<()> {
        if self.shared.state() != ConnectionState::Open {
            return Err(self.shared.closed_error());
        }
        self.shared
            .send_pong_frame(payload)
            .await
            .map_err(|err| self.shared.translate_write_error(err))
    }

    /// Close the connection with code 1000 (normal closure).
    pub async fn aclose(&self) -> Result<()> {
        self.aclose_with(CloseCode::Normal, None).await
    }

    /// Initiate the closing handshake with the given code and reason.
    ///
    /// Idempotent: later calls (and calls racing a remote close) only wait
    /// for the teardown to finish. The underlying stream is closed by the
    /// time this returns, even if the peer never answers: the wait is bounded
    /// by an internal 10 second timeout.
    pub async fn aclose_with(&self, code: CloseCode, reason: Option<&str>) -> Result<()> {
        let initiate = {
            let mut state = self.shared.state.lock().expect("Bug: state lock poisoned");
            match *state {
                ConnectionState::Connecting | ConnectionState::Open => {
                    *state = ConnectionState::LocalClosing;
                    true
                }
                _ => false,
            }
        };

        if initiate {
            self.shared
                .record_close_reason(CloseReason::new(code, reason.map(str::to_owned)));
        }
        self.shared.local_closed.store(true, Ordering::Release);

        if initiate {
            let frame = CloseFrame { code, reason: reason.map(str::to_owned) };
            if let Err(err) = self.shared.send_close_frame(Some(frame)).await {
                debug!("conn#{}: could not send close frame: {err}", self.shared.id);
            }
        }

        let mut done = self.shared.reader_done.clone();
        // Reader finished the handshake (or is already gone) and closed
        // the stream on its way out.
        let timed_out = { timeout(CLOSE_TIMEOUT, done.wait_for(|done| *done)).await.is_err() };
        if timed_out {
            warn!("conn#{}: close handshake timed out", self.shared.id);
            let handle = self
                .shared
                .reader_abort
                .lock()
                .expect("Bug: reader_abort lock poisoned")
                .take();
            if let Some(handle) = handle {
                handle.abort();
            }
            self.shared.set_state(ConnectionState::Closed);
            self.shared
                .pending_pings
                .lock()
                .expect("Bug: pending_pings lock poisoned")
                .clear();
            let mut writer = self.shared.writer.lock().await;
            if let Err(err) = writer.half.shutdown().await {
                trace!("conn#{}: stream shutdown failed: {err}", self.shared.id);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .field("state", &self.shared.state())
            .finish()
    }
}

/// Claim on a ping payload, released when the ping settles.
struct PendingPing {
    shared: Arc<Shared>,
    payload: Option<Vec<u8>>,
}

impl PendingPing {
    fn payload(&self) -> &[u8] {
        self.payload.as_deref().expect("Bug: ping claim already released")
    }

    fn disarm(mut self) {
        self.payload = None;
    }
}

impl Drop for PendingPing {
    fn drop(&mut self) {
        if let Some(payload) = self.payload.take() {
            if let Ok(mut pending) = self.shared.pending_pings.lock() {
                pending.remove(&payload);
            }
        }
    }
}

enum EventOutcome {
    Continue,
    Closed,
}

/// Inbound loop: reads chunks, drains codec events, reacts.
async fn reader_task(
    shared: Arc<Shared>,
    mut read_half: ReadHalf<Box<dyn ByteStream>>,
    mut codec: WireCodec,
    messages: mpsc::UnboundedSender<Message>,
    done: watch::Sender<bool>,
) {
    let mut buf = vec![0u8; RECV_CHUNK];
    let mut events: Vec<WireEvent> = Vec::new();

    // Frames may already sit behind the handshake response.
    let mut decoded = codec.receive_bytes(&[], &mut events);

    'outer: loop {
        // Events decoded before a protocol error still get delivered.
        for event in events.drain(..) {
            match handle_event(&shared, &messages, event).await {
                EventOutcome::Continue => {}
                EventOutcome::Closed => break 'outer,
            }
        }

        if let Err(ref err) = decoded {
            warn!("conn#{}: protocol error: {err}", shared.id);
            shared.record_close_reason(CloseReason::new(CloseCode::Protocol, None));
            let close = CloseFrame { code: CloseCode::Protocol, reason: None };
            if let Err(err) = shared.send_close_frame(Some(close)).await {
                trace!("conn#{}: could not send close frame: {err}", shared.id);
            }
            break;
        }

        match read_half.read(&mut buf).await {
            Ok(0) => {
                debug!("conn#{}: transport closed by peer", shared.id);
                shared.record_close_reason(CloseReason::new(CloseCode::Abnormal, None));
                break;
            }
            Ok(n) => decoded = codec.receive_bytes(&buf[..n], &mut events),
            Err(err) => {
                debug!("conn#{}: transport error: {err}", shared.id);
                shared.record_close_reason(CloseReason::new(CloseCode::Abnormal, None));
                break;
            }
        }
    }

    finish_reader(&shared).await;
    // Dropping the sender is the sentinel: blocked `get_message` calls drain
    // what is buffered and then fail with `ConnectionClosed`.
    drop(messages);
    let _ = done.send(true);
}

async fn handle_event(
    shared: &Arc<Shared>,
    messages: &mpsc::UnboundedSender<Message>,
    event: WireEvent,
) -> EventOutcome {
    match event {
        WireEvent::Message(message) => {
            // Fails only when every handle is gone; nobody is left to read.
            let _ = messages.send(message);
            EventOutcome::Continue
        }
        WireEvent::Ping(payload) => {
            trace!("conn#{}: ping {payload:?}, answering", shared.id);
            if let Err(err) = shared.send_pong_frame(&payload).await {
                debug!("conn#{}: could not answer ping: {err}", shared.id);
            }
            EventOutcome::Continue
        }
        WireEvent::Pong(payload) => {
            let sender = shared
                .pending_pings
                .lock()
                .expect("Bug: pending_pings lock poisoned")
                .remove(&payload);
            match sender {
                Some(sender) => {
                    trace!("conn#{}: pong {payload:?}", shared.id);
                    let _ = sender.send(());
                }
                // Unsolicited pongs are legal and ignored.
                None => trace!("conn#{}: unsolicited pong {payload:?}", shared.id),
            }
            EventOutcome::Continue
        }
        WireEvent::Close(frame) => {
            let (code, reason) = match frame {
                Some(frame) => (frame.code, frame.reason),
                // A bare close frame carries no status.
                None => (CloseCode::Status, None),
            };
            shared.record_close_reason(CloseReason::new(code, reason));

            let was_open = {
                let mut state = shared.state.lock().expect("Bug: state lock poisoned");
                match *state {
                    ConnectionState::Connecting | ConnectionState::Open => {
                        *state = ConnectionState::RemoteClosing;
                        true
                    }
                    _ => false,
                }
            };
            if was_open {
                // Echo the close unless we initiated the handshake ourselves.
                let echo = CloseFrame { code, reason: None };
                if let Err(err) = shared.send_close_frame(Some(echo)).await {
                    debug!("conn#{}: could not echo close frame: {err}", shared.id);
                }
            }
            EventOutcome::Closed
        }
    }
}

/// Terminal bookkeeping: runs exactly once, when the reader loop ends.
async fn finish_reader(shared: &Arc<Shared>) {
    shared.record_close_reason(CloseReason::new(CloseCode::Abnormal, None));
    shared.set_state(ConnectionState::Closed);

    // Wake anyone still waiting for a pong; dropping the senders fails the
    // receivers.
    shared.pending_pings.lock().expect("Bug: pending_pings lock poisoned").clear();

    let mut writer = shared.writer.lock().await;
    if let Err(err) = writer.half.shutdown().await {
        trace!("conn#{}: stream shutdown failed: {err}", shared.id);
    }
    debug!("conn#{}: reader finished", shared.id);
}
