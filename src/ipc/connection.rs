//! A connection to one worker: fire-and-forget sends, synchronous and
//! asynchronous request/reply, and liveness.

use super::protocol::{Envelope, MessageKind};
use super::transport::{Transport, TransportEvent, Wait};
use crate::error::{PoolError, Result};
use crate::types::ProcessId;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

type ReplyCallback = Box<dyn FnOnce(Option<Value>)>;

/// Completion handler for an asynchronous request.
///
/// The callback runs exactly once: with `Some(body)` when the reply arrives,
/// or with `None` if the handler is dropped first (connection invalidated,
/// send failure). Callbacks run on the coordinating thread while the pool is
/// processing events and must not call back into the pool.
pub struct ReplyHandler {
    callback: Option<ReplyCallback>,
}

impl ReplyHandler {
    pub fn new(callback: impl FnOnce(Option<Value>) + 'static) -> Self {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    pub fn complete(mut self, reply: Option<Value>) {
        if let Some(callback) = self.callback.take() {
            callback(reply);
        }
    }
}

impl Drop for ReplyHandler {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(None);
        }
    }
}

impl fmt::Debug for ReplyHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyHandler")
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

/// Frames collected by one [`Connection::poll`].
#[derive(Debug, Default)]
pub struct Incoming {
    /// Non-reply messages in arrival order.
    pub messages: Vec<Envelope>,
    pub malformed: usize,
    /// Replies that matched no pending request.
    pub stray_replies: usize,
    /// The peer went away during this poll.
    pub closed: bool,
}

pub struct Connection {
    process: ProcessId,
    transport: Box<dyn Transport>,
    next_request_id: u64,
    pending: HashMap<u64, ReplyHandler>,
    /// Frames that arrived while blocked in a synchronous send.
    deferred: VecDeque<Envelope>,
    deferred_malformed: usize,
    ignore_timeouts: bool,
    valid: bool,
    /// The peer closed while blocked in a synchronous send; reported by the
    /// next poll.
    peer_closed: bool,
}

impl Connection {
    pub fn new(process: ProcessId, transport: Box<dyn Transport>) -> Self {
        Self {
            process,
            transport,
            next_request_id: 1,
            pending: HashMap::new(),
            deferred: VecDeque::new(),
            deferred_malformed: 0,
            ignore_timeouts: false,
            valid: true,
            peer_closed: false,
        }
    }

    /// Make synchronous sends wait indefinitely. Testing only.
    pub fn set_ignore_timeouts(&mut self, ignore: bool) {
        self.ignore_timeouts = ignore;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn pending_replies(&self) -> usize {
        self.pending.len()
    }

    /// Send a fire-and-forget message.
    pub fn send(&mut self, mut message: Envelope) -> Result<()> {
        if !self.valid {
            return Err(PoolError::ChannelClosed(self.process));
        }
        message.kind = MessageKind::Oneway;
        message.request_id = None;
        self.transport.send_frame(&message)
    }

    /// Send a request and block until its reply or `timeout`.
    ///
    /// Other frames arriving in the meantime are kept for the next poll.
    pub fn send_sync(&mut self, mut message: Envelope, timeout: Duration) -> Result<Value> {
        if !self.valid {
            return Err(PoolError::ChannelClosed(self.process));
        }
        let request_id = self.allocate_request_id();
        message.kind = MessageKind::Sync;
        message.request_id = Some(request_id);
        self.transport.send_frame(&message)?;

        let deadline = Instant::now() + timeout;
        loop {
            let wait = if self.ignore_timeouts {
                Wait::Forever
            } else {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    tracing::warn!(
                        process_id = %self.process,
                        message = %message.name,
                        timeout_ms = timeout.as_millis() as u64,
                        "Synchronous message timed out"
                    );
                    return Err(PoolError::SyncTimeout {
                        name: message.name,
                        timeout,
                    });
                }
                Wait::Timeout(remaining)
            };

            match self.transport.recv_frame(wait) {
                TransportEvent::Frame(frame)
                    if frame.kind == MessageKind::Reply
                        && frame.request_id == Some(request_id) =>
                {
                    return Ok(frame.body);
                }
                TransportEvent::Frame(frame) => self.deferred.push_back(frame),
                TransportEvent::Malformed(error) => {
                    tracing::warn!(process_id = %self.process, error = %error, "Malformed frame");
                    self.deferred_malformed += 1;
                }
                TransportEvent::Empty => {}
                TransportEvent::Closed => {
                    self.peer_closed = true;
                    self.invalidate();
                    return Err(PoolError::ChannelClosed(self.process));
                }
            }
        }
    }

    /// Send a request whose reply resumes `handler`.
    ///
    /// If the connection is already invalid the handler completes with `None`
    /// immediately.
    pub fn send_with_async_reply(&mut self, mut message: Envelope, handler: ReplyHandler) {
        if !self.valid {
            handler.complete(None);
            return;
        }
        let request_id = self.allocate_request_id();
        message.kind = MessageKind::Async;
        message.request_id = Some(request_id);
        if let Err(e) = self.transport.send_frame(&message) {
            tracing::debug!(process_id = %self.process, error = %e, "Async send failed");
            handler.complete(None);
            return;
        }
        self.pending.insert(request_id, handler);
    }

    /// Answer a sync or async request received from the peer.
    pub fn send_reply(&mut self, request: &Envelope, body: Value) -> Result<()> {
        if !self.valid {
            return Err(PoolError::ChannelClosed(self.process));
        }
        self.transport.send_frame(&request.reply(body))
    }

    /// Drain everything that has arrived, completing matched async replies.
    pub fn poll(&mut self) -> Incoming {
        let mut incoming = Incoming {
            malformed: std::mem::take(&mut self.deferred_malformed),
            closed: std::mem::take(&mut self.peer_closed),
            ..Default::default()
        };

        let mut frames: Vec<Envelope> = self.deferred.drain(..).collect();
        if self.valid {
            loop {
                match self.transport.recv_frame(Wait::NonBlocking) {
                    TransportEvent::Frame(frame) => frames.push(frame),
                    TransportEvent::Malformed(error) => {
                        tracing::warn!(process_id = %self.process, error = %error, "Malformed frame");
                        incoming.malformed += 1;
                    }
                    TransportEvent::Empty => break,
                    TransportEvent::Closed => {
                        incoming.closed = true;
                        break;
                    }
                }
            }
        }

        for frame in frames {
            if frame.kind != MessageKind::Reply {
                incoming.messages.push(frame);
                continue;
            }
            match frame.request_id.and_then(|id| self.pending.remove(&id)) {
                Some(handler) => handler.complete(Some(frame.body)),
                None => {
                    tracing::debug!(
                        process_id = %self.process,
                        message = %frame.name,
                        "Reply matches no pending request"
                    );
                    incoming.stray_replies += 1;
                }
            }
        }

        if incoming.closed {
            self.invalidate();
        }
        incoming
    }

    /// Tear the connection down. Every pending async reply completes with `None`.
    pub fn invalidate(&mut self) {
        if !self.valid {
            return;
        }
        self.valid = false;
        self.transport.close();
        let pending: Vec<ReplyHandler> = self.pending.drain().map(|(_, h)| h).collect();
        drop(pending);
    }

    fn allocate_request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.invalidate();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("process", &self.process)
            .field("valid", &self.valid)
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::{names, receivers};
    use crate::ipc::transport::{LoopbackHandle, LoopbackTransport, PeerOutput};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn responder() -> (Connection, LoopbackHandle) {
        let (transport, handle) = LoopbackTransport::new(|frame| {
            let mut output = PeerOutput::default();
            if frame.expects_reply() {
                output.frames.push(frame.reply(serde_json::json!("pong")));
            }
            output
        });
        (Connection::new(ProcessId(1), Box::new(transport)), handle)
    }

    fn ping() -> Envelope {
        Envelope::new(receivers::PROCESS, names::PING)
    }

    #[test]
    fn test_send_sync_returns_reply() {
        let (mut conn, _handle) = responder();
        let reply = conn.send_sync(ping(), Duration::from_secs(1)).unwrap();
        assert_eq!(reply, serde_json::json!("pong"));
    }

    #[test]
    fn test_send_sync_times_out() {
        let (mut conn, handle) = responder();
        handle.hang();
        let err = conn.send_sync(ping(), Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, PoolError::SyncTimeout { .. }));
        // A timeout does not invalidate the connection.
        assert!(conn.is_valid());
    }

    #[test]
    fn test_send_sync_defers_other_frames() {
        let (mut conn, handle) = responder();
        handle
            .inject(&Envelope::new(receivers::WORKER_PROCESS, names::STARTED_USING_GAMEPADS))
            .unwrap();
        conn.send_sync(ping(), Duration::from_secs(1)).unwrap();

        let incoming = conn.poll();
        assert_eq!(incoming.messages.len(), 1);
        assert_eq!(incoming.messages[0].name, names::STARTED_USING_GAMEPADS);
    }

    #[test]
    fn test_async_reply_completes_once() {
        let (mut conn, _handle) = responder();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let seen = calls.clone();
        conn.send_with_async_reply(
            ping(),
            ReplyHandler::new(move |reply| seen.borrow_mut().push(reply)),
        );
        assert_eq!(conn.pending_replies(), 1);

        conn.poll();
        conn.poll();
        conn.invalidate();
        assert_eq!(*calls.borrow(), vec![Some(serde_json::json!("pong"))]);
    }

    #[test]
    fn test_invalidate_completes_pending_with_none() {
        let (mut conn, handle) = responder();
        handle.hang();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let seen = calls.clone();
        conn.send_with_async_reply(
            ping(),
            ReplyHandler::new(move |reply| seen.borrow_mut().push(reply)),
        );

        handle.crash();
        let incoming = conn.poll();
        assert!(incoming.closed);
        assert!(!conn.is_valid());
        assert_eq!(*calls.borrow(), vec![None]);
    }

    #[test]
    fn test_peer_exit_during_sync_is_reported_by_next_poll() {
        let (transport, _handle) = LoopbackTransport::new(|_| PeerOutput {
            frames: Vec::new(),
            exit: true,
        });
        let mut conn = Connection::new(ProcessId(7), Box::new(transport));

        let err = conn.send_sync(ping(), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, PoolError::ChannelClosed(ProcessId(7))));
        assert!(!conn.is_valid());

        assert!(conn.poll().closed);
        // Reported once.
        assert!(!conn.poll().closed);
    }

    #[test]
    fn test_async_on_invalid_connection_completes_immediately() {
        let (mut conn, _handle) = responder();
        conn.invalidate();
        let calls = Rc::new(RefCell::new(0));
        let seen = calls.clone();
        conn.send_with_async_reply(
            ping(),
            ReplyHandler::new(move |reply| {
                assert!(reply.is_none());
                *seen.borrow_mut() += 1;
            }),
        );
        assert_eq!(*calls.borrow(), 1);
        assert!(matches!(conn.send(ping()), Err(PoolError::ChannelClosed(_))));
    }

    #[test]
    fn test_malformed_and_stray_frames_are_counted() {
        let (mut conn, handle) = responder();
        handle.inject_raw("garbage");
        let mut stray = ping().reply(Value::Null);
        stray.request_id = Some(999);
        handle.inject(&stray).unwrap();

        let incoming = conn.poll();
        assert_eq!(incoming.malformed, 1);
        assert_eq!(incoming.stray_replies, 1);
        assert!(incoming.messages.is_empty());
        assert!(conn.is_valid());
    }
}
