use thiserror::Error;

use crate::file_store::FileStoreError;
use crate::packet::{ErrorCode, PacketFormatError};

/// Reasons for a transfer session to end in the 'errored' state.
///
/// Malformed datagrams, datagrams from unknown transfer IDs and single timeouts are recovered
///  inside the session and never surface here.
#[derive(Debug, Error)]
pub enum TransferError {
    /// wrong packet type or out-of-order block; the peer was sent an 'illegal operation' error
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("transfer aborted: no valid reply after {attempts} attempts")]
    TransferAborted { attempts: u32 },
    #[error("peer reported error {code:?}: {message}")]
    RemoteError { code: ErrorCode, message: String },
    #[error(transparent)]
    FileStore(#[from] FileStoreError),
    #[error("file needs more than {max_blocks} blocks")]
    FileTooLarge { max_blocks: u16 },
    #[error("socket closed")]
    SocketClosed,
    #[error("cannot encode packet: {0}")]
    Encoding(#[from] PacketFormatError),
}
