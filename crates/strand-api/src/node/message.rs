// Node-to-node messages, requests and responses

use serde::{Deserialize, Serialize};

use strand_common::{ChangeId, ErrorCode, NodeId, StrandError};

use super::proto::Proto;
use crate::model::{ChangePackage, NodeInfo};

/// Fire-and-forget message, no response is expected
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeMessage {
    Change { change: ChangePackage },
    Info { info: NodeInfo },
    MissingChange { change_id: ChangeId },
}

impl NodeMessage {
    pub fn proto(&self) -> Proto {
        match self {
            NodeMessage::Change { .. } => Proto::NodeChange,
            NodeMessage::Info { .. } => Proto::NodeInfo,
            NodeMessage::MissingChange { .. } => Proto::NodeMissingChange,
        }
    }
}

/// One bounded chunk of a snapshot file or an archive artifact
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPart {
    /// File name relative to the store being transferred
    pub target: String,
    pub offset: u64,
    pub data: Vec<u8>,
    pub more: bool,
}

/// Acknowledgement of a sync part
///
/// `offset` is the next expected offset in `target`, or `0` once the file is
/// complete.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartAck {
    pub target: String,
    pub offset: u64,
}

impl PartAck {
    pub fn is_complete(&self) -> bool {
        self.offset == 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeRequest {
    Connect {
        info: NodeInfo,
    },
    ChangeId {
        change_id: ChangeId,
    },
    Away {
        node_id: NodeId,
        counter: u32,
    },
    Setup,
    Sync {
        start: ChangeId,
    },
    SyncFPart {
        part: SyncPart,
    },
    SyncFDone,
    SyncAPart {
        part: SyncPart,
    },
    SyncADone,
    SyncEPart {
        change: ChangePackage,
        /// Highest change id the sending node has committed
        frontier: ChangeId,
    },
    SyncEDone,
}

impl NodeRequest {
    pub fn proto(&self) -> Proto {
        match self {
            NodeRequest::Connect { .. } => Proto::ReqConnect,
            NodeRequest::ChangeId { .. } => Proto::ReqChangeId,
            NodeRequest::Away { .. } => Proto::ReqAway,
            NodeRequest::Setup => Proto::ReqSetup,
            NodeRequest::Sync { .. } => Proto::ReqSync,
            NodeRequest::SyncFPart { .. } => Proto::ReqSyncFPart,
            NodeRequest::SyncFDone => Proto::ReqSyncFDone,
            NodeRequest::SyncAPart { .. } => Proto::ReqSyncAPart,
            NodeRequest::SyncADone => Proto::ReqSyncADone,
            NodeRequest::SyncEPart { .. } => Proto::ReqSyncEPart,
            NodeRequest::SyncEDone => Proto::ReqSyncEDone,
        }
    }

    pub fn name(&self) -> &'static str {
        self.proto().as_str()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeResponse {
    Connect {
        info: NodeInfo,
    },
    Accept,
    Setup {
        nodes: Vec<NodeInfo>,
    },
    Sync,
    SyncFPart {
        ack: PartAck,
    },
    SyncFDone {
        next_change_id: ChangeId,
    },
    SyncAPart {
        ack: PartAck,
    },
    SyncADone {
        next_change_id: ChangeId,
    },
    /// `None` once the receiver needs nothing more from the sender
    SyncEPart {
        next_change_id: Option<ChangeId>,
    },
    SyncEDone,
    Reject,
    Collision {
        node_id: NodeId,
    },
    Error {
        code: i32,
        message: String,
    },
}

impl NodeResponse {
    pub fn proto(&self) -> Proto {
        match self {
            NodeResponse::Connect { .. } => Proto::ResConnect,
            NodeResponse::Accept => Proto::ResAccept,
            NodeResponse::Setup { .. } => Proto::ResSetup,
            NodeResponse::Sync => Proto::ResSync,
            NodeResponse::SyncFPart { .. } => Proto::ResSyncFPart,
            NodeResponse::SyncFDone { .. } => Proto::ResSyncFDone,
            NodeResponse::SyncAPart { .. } => Proto::ResSyncAPart,
            NodeResponse::SyncADone { .. } => Proto::ResSyncADone,
            NodeResponse::SyncEPart { .. } => Proto::ResSyncEPart,
            NodeResponse::SyncEDone => Proto::ResSyncEDone,
            NodeResponse::Reject => Proto::ErrReject,
            NodeResponse::Collision { .. } => Proto::ErrCollision,
            NodeResponse::Error { .. } => Proto::ErrRes,
        }
    }

    pub fn error(code: ErrorCode<'_>, message: impl Into<String>) -> Self {
        NodeResponse::Error {
            code: code.code,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.proto().is_error()
    }
}

impl From<StrandError> for NodeResponse {
    fn from(err: StrandError) -> Self {
        NodeResponse::error(err.error_code(), err.to_string())
    }
}
