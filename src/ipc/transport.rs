//! Transports carry framed envelopes between the orchestrator and one worker.
//!
//! The pool only depends on the [`Transport`] trait. [`PipeTransport`] talks to
//! a real child over its stdin/stdout; [`LoopbackTransport`] runs the worker
//! side in-process so pool behavior can be exercised deterministically.

use super::pipe::{FrameReader, FrameWriter, PipeFd};
use super::protocol::Envelope;
use crate::error::{PoolError, Result};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::thread::JoinHandle;
use std::time::Duration;

/// How long a receive may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    NonBlocking,
    Timeout(Duration),
    Forever,
}

/// Result of a receive.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Frame(Envelope),
    /// Nothing arrived within the wait.
    Empty,
    /// The peer is gone; no further frames will arrive.
    Closed,
    /// A frame arrived but could not be decoded.
    Malformed(String),
}

/// Bidirectional ordered frame channel to one peer.
pub trait Transport {
    fn send_frame(&mut self, envelope: &Envelope) -> Result<()>;
    fn recv_frame(&mut self, wait: Wait) -> TransportEvent;
    /// Stop sending; the peer observes end-of-stream.
    fn close(&mut self);
}

fn decode(line: &str) -> TransportEvent {
    match Envelope::from_line(line) {
        Ok(envelope) => TransportEvent::Frame(envelope),
        Err(e) => TransportEvent::Malformed(e.to_string()),
    }
}

/// Transport over a child's stdin/stdout pipes.
///
/// A reader thread blocks on the child's stdout and forwards raw frames, so
/// the coordinating thread can poll without blocking.
pub struct PipeTransport {
    writer: Option<FrameWriter<PipeFd>>,
    incoming: Receiver<String>,
    _reader: JoinHandle<()>,
}

impl PipeTransport {
    pub fn new(to_peer: PipeFd, from_peer: PipeFd) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let reader = std::thread::Builder::new()
            .name("sitepool-ipc-reader".to_string())
            .spawn(move || {
                let mut reader = FrameReader::new(from_peer);
                loop {
                    match reader.read_frame() {
                        Ok(Some(frame)) => {
                            if tx.send(frame.to_string()).is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::debug!(error = %e, "IPC reader stopped");
                            break;
                        }
                    }
                }
            })?;

        Ok(Self {
            writer: Some(FrameWriter::new(to_peer)),
            incoming: rx,
            _reader: reader,
        })
    }
}

impl Transport for PipeTransport {
    fn send_frame(&mut self, envelope: &Envelope) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| PoolError::Worker("transport is closed".into()))?;
        writer
            .write_frame(&envelope.to_line()?)
            .map_err(|e| PoolError::Worker(format!("Failed to send to worker: {}", e)))
    }

    fn recv_frame(&mut self, wait: Wait) -> TransportEvent {
        let line = match wait {
            Wait::NonBlocking => match self.incoming.try_recv() {
                Ok(line) => line,
                Err(TryRecvError::Empty) => return TransportEvent::Empty,
                Err(TryRecvError::Disconnected) => return TransportEvent::Closed,
            },
            Wait::Timeout(timeout) => match self.incoming.recv_timeout(timeout) {
                Ok(line) => line,
                Err(RecvTimeoutError::Timeout) => return TransportEvent::Empty,
                Err(RecvTimeoutError::Disconnected) => return TransportEvent::Closed,
            },
            Wait::Forever => match self.incoming.recv() {
                Ok(line) => line,
                Err(_) => return TransportEvent::Closed,
            },
        };
        decode(&line)
    }

    fn close(&mut self) {
        self.writer = None;
    }
}

/// Output of an in-process peer after handling one frame.
#[derive(Debug, Default)]
pub struct PeerOutput {
    pub frames: Vec<Envelope>,
    /// The peer shuts down after emitting `frames`.
    pub exit: bool,
}

type PeerHandler = Box<dyn FnMut(&Envelope) -> PeerOutput>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    Open,
    /// Frames are swallowed without a response.
    Unresponsive,
    Closed,
}

struct LoopbackPeer {
    handler: PeerHandler,
    inbox: VecDeque<String>,
    received: Vec<Envelope>,
    state: PeerState,
    /// The peer dies on receiving a message with this name.
    exit_on: Option<String>,
}

/// In-process transport whose peer is a frame handler.
///
/// Frames sent to the peer are handled synchronously; whatever the peer
/// emits is queued, serialized, for the next receive.
pub struct LoopbackTransport {
    peer: Rc<RefCell<LoopbackPeer>>,
}

/// Control side of a [`LoopbackTransport`], used to inject events.
#[derive(Clone)]
pub struct LoopbackHandle {
    peer: Rc<RefCell<LoopbackPeer>>,
}

impl LoopbackTransport {
    pub fn new(handler: impl FnMut(&Envelope) -> PeerOutput + 'static) -> (Self, LoopbackHandle) {
        let peer = Rc::new(RefCell::new(LoopbackPeer {
            handler: Box::new(handler),
            inbox: VecDeque::new(),
            received: Vec::new(),
            state: PeerState::Open,
            exit_on: None,
        }));
        (
            Self { peer: peer.clone() },
            LoopbackHandle { peer },
        )
    }
}

impl Transport for LoopbackTransport {
    fn send_frame(&mut self, envelope: &Envelope) -> Result<()> {
        // Round-trip through the wire format.
        let line = envelope.to_line()?;
        let envelope = Envelope::from_line(&line)?;

        let mut peer = self.peer.borrow_mut();
        match peer.state {
            PeerState::Closed => return Err(PoolError::Worker("peer has exited".into())),
            PeerState::Unresponsive => {
                peer.received.push(envelope);
                return Ok(());
            }
            PeerState::Open => {}
        }
        if peer.exit_on.as_deref() == Some(envelope.name.as_str()) {
            peer.received.push(envelope);
            peer.state = PeerState::Closed;
            return Ok(());
        }

        let output = (peer.handler)(&envelope);
        peer.received.push(envelope);
        for frame in output.frames {
            let line = frame.to_line()?;
            peer.inbox.push_back(line);
        }
        if output.exit {
            peer.state = PeerState::Closed;
        }
        Ok(())
    }

    fn recv_frame(&mut self, wait: Wait) -> TransportEvent {
        let next = {
            let mut peer = self.peer.borrow_mut();
            match peer.inbox.pop_front() {
                Some(line) => Some(line),
                None if peer.state == PeerState::Closed => return TransportEvent::Closed,
                None => None,
            }
        };
        match next {
            Some(line) => decode(&line),
            None => {
                // Nothing can arrive while we block; emulate the wait.
                match wait {
                    Wait::NonBlocking => {}
                    Wait::Timeout(timeout) => std::thread::sleep(timeout),
                    Wait::Forever => std::thread::sleep(Duration::from_millis(10)),
                }
                TransportEvent::Empty
            }
        }
    }

    fn close(&mut self) {
        self.peer.borrow_mut().state = PeerState::Closed;
    }
}

impl LoopbackHandle {
    /// Make the peer vanish as if its process crashed. Queued frames are lost.
    pub fn crash(&self) {
        let mut peer = self.peer.borrow_mut();
        peer.inbox.clear();
        peer.state = PeerState::Closed;
    }

    /// Stop answering frames (simulates a hung worker).
    pub fn hang(&self) {
        let mut peer = self.peer.borrow_mut();
        if peer.state == PeerState::Open {
            peer.state = PeerState::Unresponsive;
        }
    }

    /// Die without answering when a message named `name` arrives.
    pub fn exit_on(&self, name: impl Into<String>) {
        self.peer.borrow_mut().exit_on = Some(name.into());
    }

    pub fn is_closed(&self) -> bool {
        self.peer.borrow().state == PeerState::Closed
    }

    /// Queue a frame as if the peer had sent it.
    pub fn inject(&self, envelope: &Envelope) -> Result<()> {
        let line = envelope.to_line()?;
        self.peer.borrow_mut().inbox.push_back(line);
        Ok(())
    }

    /// Queue raw bytes as if the peer had sent a frame.
    pub fn inject_raw(&self, line: impl Into<String>) {
        self.peer.borrow_mut().inbox.push_back(line.into());
    }

    /// Names of every message the peer has received, in order.
    pub fn received_names(&self) -> Vec<String> {
        self.peer
            .borrow()
            .received
            .iter()
            .map(|e| e.name.clone())
            .collect()
    }

    /// Every message the peer has received, in order.
    pub fn received(&self) -> Vec<Envelope> {
        self.peer.borrow().received.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::{MessageKind, names, receivers};

    fn echo() -> (LoopbackTransport, LoopbackHandle) {
        LoopbackTransport::new(|frame| {
            if frame.name == names::EXIT {
                return PeerOutput {
                    frames: Vec::new(),
                    exit: true,
                };
            }
            PeerOutput {
                frames: vec![frame.reply(serde_json::json!(frame.name))],
                exit: false,
            }
        })
    }

    #[test]
    fn test_loopback_preserves_order() {
        let (mut transport, handle) = echo();
        transport
            .send_frame(&Envelope::new(receivers::PROCESS, "First"))
            .unwrap();
        transport
            .send_frame(&Envelope::new(receivers::PROCESS, "Second"))
            .unwrap();

        let names: Vec<String> = (0..2)
            .map(|_| match transport.recv_frame(Wait::NonBlocking) {
                TransportEvent::Frame(f) => {
                    assert_eq!(f.kind, MessageKind::Reply);
                    f.name
                }
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(names, vec!["First", "Second"]);
        assert_eq!(transport.recv_frame(Wait::NonBlocking), TransportEvent::Empty);
        assert_eq!(handle.received_names(), vec!["First", "Second"]);
    }

    #[test]
    fn test_loopback_exit_closes() {
        let (mut transport, handle) = echo();
        transport
            .send_frame(&Envelope::new(receivers::PROCESS, names::EXIT))
            .unwrap();
        assert!(handle.is_closed());
        assert_eq!(transport.recv_frame(Wait::NonBlocking), TransportEvent::Closed);
        assert!(
            transport
                .send_frame(&Envelope::new(receivers::PROCESS, "Late"))
                .is_err()
        );
    }

    #[test]
    fn test_loopback_exit_on_message() {
        let (mut transport, handle) = echo();
        handle.exit_on("Fatal");
        transport
            .send_frame(&Envelope::new(receivers::PROCESS, "Fine"))
            .unwrap();
        assert!(!handle.is_closed());
        transport
            .send_frame(&Envelope::new(receivers::PROCESS, "Fatal"))
            .unwrap();
        assert!(handle.is_closed());
        assert_eq!(handle.received_names(), vec!["Fine", "Fatal"]);
    }

    #[test]
    fn test_loopback_crash_and_hang() {
        let (mut transport, handle) = echo();
        handle.hang();
        transport
            .send_frame(&Envelope::new(receivers::PROCESS, "Ignored"))
            .unwrap();
        assert_eq!(transport.recv_frame(Wait::NonBlocking), TransportEvent::Empty);

        handle.crash();
        assert_eq!(transport.recv_frame(Wait::NonBlocking), TransportEvent::Closed);
    }

    #[test]
    fn test_loopback_malformed_frame() {
        let (mut transport, handle) = echo();
        handle.inject_raw("{ not json");
        assert!(matches!(
            transport.recv_frame(Wait::NonBlocking),
            TransportEvent::Malformed(_)
        ));
    }

    #[test]
    fn test_pipe_transport_with_cat() {
        use std::process::{Command, Stdio};

        let mut child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn cat");
        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        let mut transport =
            PipeTransport::new(PipeFd::new(stdin), PipeFd::new(stdout)).unwrap();

        let msg = Envelope::new(receivers::PROCESS, names::PING);
        transport.send_frame(&msg).unwrap();
        match transport.recv_frame(Wait::Timeout(Duration::from_secs(5))) {
            TransportEvent::Frame(frame) => assert_eq!(frame, msg),
            other => panic!("unexpected {:?}", other),
        }

        transport.close();
        assert_eq!(
            transport.recv_frame(Wait::Timeout(Duration::from_secs(5))),
            TransportEvent::Closed
        );
        child.wait().unwrap();
    }
}
