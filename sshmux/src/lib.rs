#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
#![allow(clippy::single_match, clippy::upper_case_acronyms)]
// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Connection layer of an SSH client and server, based on tokio/futures.
//!
//! This crate sits between an already-established, already-encrypted
//! [`transport::Transport`] (which hands over decoded [`message::Message`]s)
//! and the application. It owns user authentication, channel
//! multiplexing with window-based flow control, connection-wide
//! ("global") requests such as port forwarding, the sub-requests of
//! session channels, and the timing of key re-exchanges.
//!
//! The normal way to use this library, both for clients and for
//! servers, is by creating *handlers*, i.e. types that implement
//! `client::Handler` for clients and `server::Handler` for
//! servers.
//!
//! # Writing servers
//!
//! A server is run once per transport with [`server::run_stream`], or for
//! a stream of incoming transports with [`server::run_on`]. Every
//! authentication attempt, channel open and channel request reaches the
//! handler together with a decision token ([`AuthDecision`],
//! [`ChannelOpenDecision`], [`RequestDecision`], [`GlobalDecision`]).
//! Tokens may be resolved later, from another task; replies still reach
//! the peer in the order the requests were received.
//!
//! # Writing clients
//!
//! [`client::connect_stream`] returns a [`client::Handle`], on which
//! authentication methods are tried and channels are opened.
//! [`client::Client`] wraps this with a configured credential order and
//! reconnection semantics.
//!
//! # Using channels
//!
//! Channels are handles to logical streams multiplexed on one
//! connection. [`Channel::wait`] yields [`ChannelMsg`] events in order;
//! in particular `ExitStatus` always precedes `Close`, and `Eof` is
//! always delivered before `Close`. Writes suspend while the peer's
//! window is exhausted.

use std::convert::TryFrom;
use std::fmt::{Debug, Display, Formatter};
use std::future::{Future, Pending};

use futures::future::Either as EitherFuture;
use thiserror::Error;

#[cfg(test)]
mod tests;

pub mod auth;
pub mod keys;
pub mod message;
mod msg;
mod negotiation;
pub mod transport;

pub use negotiation::{Names, Preferred};

mod decision;
pub use decision::{AuthDecision, ChannelOpenDecision, GlobalDecision, RequestDecision};

mod channels;
pub use channels::{Channel, ChannelCommand, ChannelMsg, ChannelRx, ChannelTx, SessionRequest};

mod global;
mod session;
pub use session::ConnectionEvent;

/// Server side of this library.
pub mod server;

/// Client side of this library.
pub mod client;

pub use auth::{AuthResult, MethodKind, MethodSet, Signer};

#[derive(Debug)]
pub enum AlgorithmKind {
    Key,
}

#[derive(Debug, Error)]
pub enum Error {
    /// The protocol is in an inconsistent state.
    #[error("Inconsistent state of the protocol")]
    Inconsistent,

    /// A message arrived that is not valid in the current state.
    #[error("Unexpected message {0} in this state")]
    UnexpectedMessage(u8),

    /// The client is not yet authenticated.
    #[error("Not yet authenticated")]
    NotAuthenticated,

    /// No connection is established.
    #[error("Not connected")]
    NotConnected,

    /// The client has presented an unsupported authentication method.
    #[error("Unsupported authentication method")]
    UnsupportedAuthMethod,

    /// Every configured authentication method was rejected.
    #[error("All configured authentication methods failed")]
    AuthFailed,

    /// Missing authentication method.
    #[error("No authentication method")]
    NoAuthMethod,

    /// Unknown server key.
    #[error("Unknown server key")]
    UnknownKey,

    /// No common algorithm found during the handshake.
    #[error("No common {kind:?} algorithm - ours: {ours:?}, theirs: {theirs:?}")]
    NoCommonAlgo {
        kind: AlgorithmKind,
        ours: Vec<String>,
        theirs: Vec<String>,
    },

    /// Error during key exchange.
    #[error("Key exchange failed")]
    Kex,

    /// Message received/sent on unopened channel.
    #[error("Channel not open")]
    WrongChannel,

    /// The peer refused to open a channel.
    #[error("Failed to open channel ({0:?})")]
    ChannelOpenFailure(ChannelOpenFailure),

    /// The channel was closed before the operation completed.
    #[error("Channel closed")]
    ChannelClosed,

    /// A terminal request (exec, shell or subsystem) was already made.
    #[error("A shell, exec or subsystem request was already made on this channel")]
    SessionAlreadyStarted,

    /// The subsystem exited before its initiation exchange completed.
    #[error("Subsystem exited before initialization (exit status {exit_status:?})")]
    SubsystemAborted { exit_status: Option<u32> },

    /// The connection ended before the peer replied.
    #[error("No response from server")]
    NoResponse,

    /// Disconnected
    #[error("Disconnected")]
    Disconnect,

    /// Connection closed by the remote side.
    #[error("Connection closed by the remote side")]
    HUP,

    /// Connection timeout.
    #[error("Connection timeout")]
    ConnectionTimeout,

    /// Inactivity timeout.
    #[error("Inactivity timeout")]
    InactivityTimeout,

    #[error("Channel send error")]
    SendError,

    #[error("The request was rejected by the other party")]
    RequestDenied,

    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Elapsed(#[from] tokio::time::error::Elapsed),

    #[error("Signature: {0}")]
    Signature(#[from] signature::Error),

    #[error("SshKey: {0}")]
    SshKey(#[from] ssh_key::Error),

    #[error("SshEncoding: {0}")]
    SshEncoding(#[from] ssh_encoding::Error),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// The channel is closed and its buffer is drained.
    #[error("Unable to receive more messages from the channel")]
    RecvError,
}

#[derive(Debug, Error)]
#[error("Could not reach the event loop")]
pub struct SendError {}

impl From<SendError> for Error {
    fn from(_: SendError) -> Self {
        Error::SendError
    }
}

/// The number of bytes read/written, and the number of seconds before a key
/// re-exchange is requested.
#[derive(Debug, Clone)]
pub struct Limits {
    pub rekey_write_limit: usize,
    pub rekey_read_limit: usize,
    pub rekey_time_limit: std::time::Duration,
}

impl Limits {
    pub fn new(write_limit: usize, read_limit: usize, time_limit: std::time::Duration) -> Limits {
        Limits {
            rekey_write_limit: write_limit,
            rekey_read_limit: read_limit,
            rekey_time_limit: time_limit,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        // Following the recommendations of
        // https://tools.ietf.org/html/rfc4253#section-9
        Limits {
            rekey_write_limit: 1 << 30, // 1 Gb
            rekey_read_limit: 1 << 30,  // 1 Gb
            rekey_time_limit: std::time::Duration::from_secs(3600),
        }
    }
}

/// A reason for disconnection.
#[allow(missing_docs)] // This should be relatively self-explanatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    HostNotAllowedToConnect = 1,
    ProtocolError = 2,
    KeyExchangeFailed = 3,
    #[doc(hidden)]
    Reserved = 4,
    MACError = 5,
    CompressionError = 6,
    ServiceNotAvailable = 7,
    ProtocolVersionNotSupported = 8,
    HostKeyNotVerifiable = 9,
    ConnectionLost = 10,
    ByApplication = 11,
    TooManyConnections = 12,
    AuthCancelledByUser = 13,
    NoMoreAuthMethodsAvailable = 14,
    IllegalUserName = 15,
}

impl TryFrom<u32> for Disconnect {
    type Error = crate::Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::HostNotAllowedToConnect,
            2 => Self::ProtocolError,
            3 => Self::KeyExchangeFailed,
            4 => Self::Reserved,
            5 => Self::MACError,
            6 => Self::CompressionError,
            7 => Self::ServiceNotAvailable,
            8 => Self::ProtocolVersionNotSupported,
            9 => Self::HostKeyNotVerifiable,
            10 => Self::ConnectionLost,
            11 => Self::ByApplication,
            12 => Self::TooManyConnections,
            13 => Self::AuthCancelledByUser,
            14 => Self::NoMoreAuthMethodsAvailable,
            15 => Self::IllegalUserName,
            _ => return Err(crate::Error::Inconsistent),
        })
    }
}

/// The type of signals that can be sent to a remote process. If you
/// plan to use custom signals, read [the
/// RFC](https://tools.ietf.org/html/rfc4254#section-6.10) to
/// understand the encoding.
#[allow(missing_docs)]
// This should be relatively self-explanatory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sig {
    ABRT,
    ALRM,
    FPE,
    HUP,
    ILL,
    INT,
    KILL,
    PIPE,
    QUIT,
    SEGV,
    TERM,
    USR1,
    Custom(String),
}

impl Sig {
    pub fn name(&self) -> &str {
        match *self {
            Sig::ABRT => "ABRT",
            Sig::ALRM => "ALRM",
            Sig::FPE => "FPE",
            Sig::HUP => "HUP",
            Sig::ILL => "ILL",
            Sig::INT => "INT",
            Sig::KILL => "KILL",
            Sig::PIPE => "PIPE",
            Sig::QUIT => "QUIT",
            Sig::SEGV => "SEGV",
            Sig::TERM => "TERM",
            Sig::USR1 => "USR1",
            Sig::Custom(ref c) => c,
        }
    }

    pub fn from_name(name: &str) -> Sig {
        match name {
            "ABRT" => Sig::ABRT,
            "ALRM" => Sig::ALRM,
            "FPE" => Sig::FPE,
            "HUP" => Sig::HUP,
            "ILL" => Sig::ILL,
            "INT" => Sig::INT,
            "KILL" => Sig::KILL,
            "PIPE" => Sig::PIPE,
            "QUIT" => Sig::QUIT,
            "SEGV" => Sig::SEGV,
            "TERM" => Sig::TERM,
            "USR1" => Sig::USR1,
            x => Sig::Custom(x.to_string()),
        }
    }
}

/// Reason for not being able to open a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ChannelOpenFailure {
    AdministrativelyProhibited = 1,
    ConnectFailed = 2,
    UnknownChannelType = 3,
    ResourceShortage = 4,
    Unknown = 0,
}

impl ChannelOpenFailure {
    pub fn from_u32(x: u32) -> ChannelOpenFailure {
        match x {
            1 => ChannelOpenFailure::AdministrativelyProhibited,
            2 => ChannelOpenFailure::ConnectFailed,
            3 => ChannelOpenFailure::UnknownChannelType,
            4 => ChannelOpenFailure::ResourceShortage,
            _ => ChannelOpenFailure::Unknown,
        }
    }

    pub fn code(&self) -> u32 {
        *self as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
/// The identifier of a channel.
pub struct ChannelId(u32);

impl From<ChannelId> for u32 {
    fn from(c: ChannelId) -> u32 {
        c.0
    }
}

impl From<u32> for ChannelId {
    fn from(c: u32) -> ChannelId {
        ChannelId(c)
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returns `f(val)` if `val` it is [Some], or a forever pending [Future] if it is [None].
pub(crate) fn future_or_pending<R, F: Future<Output = R>, T>(
    val: Option<T>,
    f: impl FnOnce(T) -> F,
) -> EitherFuture<Pending<R>, F> {
    match val {
        None => EitherFuture::Left(core::future::pending()),
        Some(x) => EitherFuture::Right(f(x)),
    }
}
