//! Inter-process messaging between the orchestrator and its workers.

pub mod connection;
pub mod dispatch;
pub mod pipe;
pub mod protocol;
pub mod transport;

pub use connection::{Connection, Incoming, ReplyHandler};
pub use dispatch::{MessageReceiver, MessageReceiverMap, SharedReceiver};
pub use protocol::{Envelope, MessageKind};
pub use transport::{LoopbackHandle, LoopbackTransport, PeerOutput, PipeTransport, Transport};
