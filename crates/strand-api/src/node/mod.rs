// Node protocol: opcodes, messages and framing

pub mod codec;
pub mod message;
pub mod proto;

pub use codec::{Envelope, Payload};
pub use message::{NodeMessage, NodeRequest, NodeResponse, PartAck, SyncPart};
pub use proto::Proto;
