use std::num::ParseIntError;
use std::{io, net};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// Indicates the agent is closed.
    #[error("the agent is closed")]
    ErrClosed,

    /// Indicates an unknown stream id was given.
    #[error("no such stream")]
    ErrStreamNotFound,

    /// Indicates an unknown component id was given.
    #[error("no such component")]
    ErrComponentNotFound,

    /// Indicates local username fragment insufficient length is provided.
    /// Have to be between 4 and 256 characters.
    #[error("local username fragment must be between 4 and 256 characters")]
    ErrLocalUfragInvalidLength,

    /// Indicates local password insufficient length is provided.
    /// Have to be between 22 and 256 characters.
    #[error("local password must be between 22 and 256 characters")]
    ErrLocalPwdInvalidLength,

    /// Indicates the given port range is empty or inverted.
    #[error("invalid port range")]
    ErrInvalidPortRange,

    /// Indicates no free port could be bound inside the configured range.
    #[error("port range exhausted")]
    ErrPortRangeExhausted,

    /// Indicates an unsupported transport type was provided.
    #[error("invalid transport protocol type")]
    ErrProtoType,

    /// Indicates agent does not have a valid candidate pair.
    #[error("no candidate pairs available")]
    ErrNoCandidatePairs,

    /// Indicates the component has no selected pair to send on.
    #[error("no selected candidate pair")]
    ErrNoSelectedPair,

    /// Indicates a send was attempted on a component that is not writable.
    #[error("component is not writable")]
    ErrNotWritable,

    /// Indicates agent was given TURN info with an empty username.
    #[error("username is empty")]
    ErrUsernameEmpty,

    /// Indicates agent was given TURN info with an empty password.
    #[error("password is empty")]
    ErrPasswordEmpty,

    /// Indicates we were unable to parse a candidate address.
    #[error("failed to parse address")]
    ErrAddressParseFailed,

    /// Indicates a remote candidate with a mismatched address family.
    #[error("address family mismatch")]
    ErrAddressFamilyMismatch,

    /// Indicates the remote candidate limit for a component was hit.
    #[error("maximum number of remote candidates reached")]
    ErrMaxRemoteCandidates,

    /// Indicates attach_recv was called twice for the same component.
    #[error("receive sink already attached")]
    ErrRecvAlreadyAttached,

    /// Indicates a foundation passed to set_selected_pair was unknown.
    #[error("no candidate with the given foundation")]
    ErrFoundationNotFound,

    /// Indicates the transaction id is not registered with the agent.
    #[error("unknown transaction id")]
    ErrTransactionNotFound,

    /// Indicates a transaction was started twice.
    #[error("transaction already exists")]
    ErrTransactionExists,

    /// Indicates a STUN transaction ran out of retransmissions.
    #[error("stun transaction timed out")]
    ErrTransactionTimeout,

    /// Indicates a TURN allocation could not be created or refreshed.
    #[error("turn allocation failed")]
    ErrAllocationFailed,

    /// Indicates the TCP send queue for a socket is full.
    #[error("tcp send queue overflow")]
    ErrTcpQueueOverflow,

    /// Indicates an established TCP connection with this remote exists.
    #[error("conn with same remote addr already exists")]
    ErrTcpRemoteAddrAlreadyExists,

    /// Indicates a proxy handshake did not complete.
    #[error("proxy negotiation failed")]
    ErrProxyNegotiationFailed,

    /// Indicates an unsupported scheme in a server URL.
    #[error("unknown scheme type")]
    ErrSchemeType,

    /// Indicates a malformed host in a server URL.
    #[error("invalid hostname")]
    ErrHost,

    /// Indicates a malformed port in a server URL.
    #[error("invalid port number")]
    ErrPort,

    #[error("failed to send packet")]
    ErrSendPacket,
    #[error("the ICE conn can't write STUN messages")]
    ErrIceWriteStunMessage,
    #[error("username mismatch")]
    ErrMismatchUsername,
    #[error("error reading streaming packet")]
    ErrReadingStreamingPacket,
    #[error("error writing to")]
    ErrWriting,

    #[error("parse int: {0}")]
    ParseInt(#[from] ParseIntError),
    #[error("parse addr: {0}")]
    ParseIp(#[from] net::AddrParseError),
    #[error("{0}")]
    Io(#[source] IoError),
    #[error("{0}")]
    Util(#[from] util::Error),
    #[error("{0}")]
    Stun(#[from] stun::Error),
    #[error("{0}")]
    ParseUrl(#[from] url::ParseError),
    #[error("{0}")]
    Turn(#[from] turn::Error),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}
