// Node protocol opcodes and default request timeouts

use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Protocol opcodes for node-to-node traffic
///
/// - `128..160`: fire-and-forget messages
/// - `160..192`: requests
/// - `192..224`: responses
/// - `224..=255`: errors
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Proto {
    NodeChange = 128,
    NodeInfo = 129,
    NodeMissingChange = 130,

    ReqConnect = 168,
    ReqChangeId = 169,
    ReqAway = 170,
    ReqSetup = 171,
    ReqSync = 172,
    ReqSyncFPart = 173,
    ReqSyncFDone = 174,
    ReqSyncAPart = 175,
    ReqSyncADone = 176,
    ReqSyncEPart = 177,
    ReqSyncEDone = 178,

    ResConnect = 192,
    ResAccept = 193,
    ResSetup = 194,
    ResSync = 195,
    ResSyncFPart = 196,
    ResSyncFDone = 197,
    ResSyncAPart = 198,
    ResSyncADone = 199,
    ResSyncEPart = 200,
    ResSyncEDone = 201,

    Err = 224,
    ErrRes = 225,
    ErrReject = 226,
    ErrCollision = 227,
}

impl Proto {
    pub fn is_message(&self) -> bool {
        (128..160).contains(&(*self as u8))
    }

    pub fn is_request(&self) -> bool {
        (160..192).contains(&(*self as u8))
    }

    pub fn is_response(&self) -> bool {
        (192..224).contains(&(*self as u8))
    }

    pub fn is_error(&self) -> bool {
        *self as u8 >= 224
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Proto::NodeChange => "NODE_CHANGE",
            Proto::NodeInfo => "NODE_INFO",
            Proto::NodeMissingChange => "NODE_MISSING_CHANGE",
            Proto::ReqConnect => "REQ_CONNECT",
            Proto::ReqChangeId => "REQ_CHANGE_ID",
            Proto::ReqAway => "REQ_AWAY",
            Proto::ReqSetup => "REQ_SETUP",
            Proto::ReqSync => "REQ_SYNC",
            Proto::ReqSyncFPart => "REQ_SYNCFPART",
            Proto::ReqSyncFDone => "REQ_SYNCFDONE",
            Proto::ReqSyncAPart => "REQ_SYNCAPART",
            Proto::ReqSyncADone => "REQ_SYNCADONE",
            Proto::ReqSyncEPart => "REQ_SYNCEPART",
            Proto::ReqSyncEDone => "REQ_SYNCEDONE",
            Proto::ResConnect => "RES_CONNECT",
            Proto::ResAccept => "RES_ACCEPT",
            Proto::ResSetup => "RES_SETUP",
            Proto::ResSync => "RES_SYNC",
            Proto::ResSyncFPart => "RES_SYNCFPART",
            Proto::ResSyncFDone => "RES_SYNCFDONE",
            Proto::ResSyncAPart => "RES_SYNCAPART",
            Proto::ResSyncADone => "RES_SYNCADONE",
            Proto::ResSyncEPart => "RES_SYNCEPART",
            Proto::ResSyncEDone => "RES_SYNCEDONE",
            Proto::Err => "ERR",
            Proto::ErrRes => "ERR_RES",
            Proto::ErrReject => "ERR_REJECT",
            Proto::ErrCollision => "ERR_COLLISION",
        }
    }

    /// Default timeout for a request opcode, `None` for anything else
    pub fn default_timeout(&self) -> Option<Duration> {
        let secs = match self {
            Proto::ReqConnect => 5,
            Proto::ReqChangeId => 60,
            Proto::ReqAway => 5,
            Proto::ReqSetup => 10,
            Proto::ReqSync
            | Proto::ReqSyncFPart
            | Proto::ReqSyncAPart
            | Proto::ReqSyncEPart => 10,
            Proto::ReqSyncFDone | Proto::ReqSyncADone | Proto::ReqSyncEDone => 300,
            _ => return None,
        };
        Some(Duration::from_secs(secs))
    }
}

impl Display for Proto {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<u8> for Proto {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let proto = match value {
            128 => Proto::NodeChange,
            129 => Proto::NodeInfo,
            130 => Proto::NodeMissingChange,
            168 => Proto::ReqConnect,
            169 => Proto::ReqChangeId,
            170 => Proto::ReqAway,
            171 => Proto::ReqSetup,
            172 => Proto::ReqSync,
            173 => Proto::ReqSyncFPart,
            174 => Proto::ReqSyncFDone,
            175 => Proto::ReqSyncAPart,
            176 => Proto::ReqSyncADone,
            177 => Proto::ReqSyncEPart,
            178 => Proto::ReqSyncEDone,
            192 => Proto::ResConnect,
            193 => Proto::ResAccept,
            194 => Proto::ResSetup,
            195 => Proto::ResSync,
            196 => Proto::ResSyncFPart,
            197 => Proto::ResSyncFDone,
            198 => Proto::ResSyncAPart,
            199 => Proto::ResSyncADone,
            200 => Proto::ResSyncEPart,
            201 => Proto::ResSyncEDone,
            224 => Proto::Err,
            225 => Proto::ErrRes,
            226 => Proto::ErrReject,
            227 => Proto::ErrCollision,
            _ => return Err(format!("unknown protocol opcode: {}", value)),
        };
        Ok(proto)
    }
}
