//! Decoded protocol messages exchanged with a [`Transport`](crate::transport::Transport).
//!
//! The transport is in charge of the binary packet format, so the
//! engine only ever sees and produces these typed values.

use bytes::Bytes;

use crate::auth::MethodSet;
use crate::msg;
use crate::{ChannelOpenFailure, Disconnect, Sig};

/// One message of the SSH transport, authentication or connection protocol.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub enum Message {
    Disconnect {
        reason: Disconnect,
        description: String,
        language_tag: String,
    },
    Ignore,
    Debug {
        always_display: bool,
        message: String,
    },
    Unimplemented {
        sequence_number: u32,
    },
    ServiceRequest {
        name: String,
    },
    ServiceAccept {
        name: String,
    },
    /// Start of a key re-exchange. The algorithm lists are handled by the transport.
    KexInit,
    /// End of a key re-exchange.
    NewKeys,
    UserauthRequest {
        user: String,
        service: String,
        method: AuthRequestMethod,
    },
    UserauthFailure {
        remaining_methods: MethodSet,
        partial_success: bool,
    },
    UserauthSuccess,
    UserauthBanner {
        message: String,
        language_tag: String,
    },
    UserauthPkOk {
        algorithm: String,
        key: Bytes,
    },
    UserauthInfoRequest {
        name: String,
        instructions: String,
        prompts: Vec<Prompt>,
    },
    UserauthInfoResponse {
        responses: Vec<String>,
    },
    GlobalRequest {
        want_reply: bool,
        request: GlobalRequest,
    },
    RequestSuccess {
        /// Port allocated by the server for a `tcpip-forward` to port 0.
        bound_port: Option<u32>,
    },
    RequestFailure,
    ChannelOpen {
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
        channel_type: ChannelType,
    },
    ChannelOpenConfirmation {
        recipient_channel: u32,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    },
    ChannelOpenFailure {
        recipient_channel: u32,
        reason: ChannelOpenFailure,
        description: String,
        language_tag: String,
    },
    ChannelWindowAdjust {
        recipient_channel: u32,
        bytes_to_add: u32,
    },
    ChannelData {
        recipient_channel: u32,
        data: Bytes,
    },
    ChannelExtendedData {
        recipient_channel: u32,
        data_type: u32,
        data: Bytes,
    },
    ChannelEof {
        recipient_channel: u32,
    },
    ChannelClose {
        recipient_channel: u32,
    },
    ChannelRequest {
        recipient_channel: u32,
        want_reply: bool,
        request: ChannelRequest,
    },
    ChannelSuccess {
        recipient_channel: u32,
    },
    ChannelFailure {
        recipient_channel: u32,
    },
}

impl Message {
    /// The message number of this message on the wire.
    pub fn number(&self) -> u8 {
        match self {
            Message::Disconnect { .. } => msg::DISCONNECT,
            Message::Ignore => msg::IGNORE,
            Message::Debug { .. } => msg::DEBUG,
            Message::Unimplemented { .. } => msg::UNIMPLEMENTED,
            Message::ServiceRequest { .. } => msg::SERVICE_REQUEST,
            Message::ServiceAccept { .. } => msg::SERVICE_ACCEPT,
            Message::KexInit => msg::KEXINIT,
            Message::NewKeys => msg::NEWKEYS,
            Message::UserauthRequest { .. } => msg::USERAUTH_REQUEST,
            Message::UserauthFailure { .. } => msg::USERAUTH_FAILURE,
            Message::UserauthSuccess => msg::USERAUTH_SUCCESS,
            Message::UserauthBanner { .. } => msg::USERAUTH_BANNER,
            Message::UserauthPkOk { .. } | Message::UserauthInfoRequest { .. } => {
                msg::USERAUTH_INFO_REQUEST_OR_USERAUTH_PK_OK
            }
            Message::UserauthInfoResponse { .. } => msg::USERAUTH_INFO_RESPONSE,
            Message::GlobalRequest { .. } => msg::GLOBAL_REQUEST,
            Message::RequestSuccess { .. } => msg::REQUEST_SUCCESS,
            Message::RequestFailure => msg::REQUEST_FAILURE,
            Message::ChannelOpen { .. } => msg::CHANNEL_OPEN,
            Message::ChannelOpenConfirmation { .. } => msg::CHANNEL_OPEN_CONFIRMATION,
            Message::ChannelOpenFailure { .. } => msg::CHANNEL_OPEN_FAILURE,
            Message::ChannelWindowAdjust { .. } => msg::CHANNEL_WINDOW_ADJUST,
            Message::ChannelData { .. } => msg::CHANNEL_DATA,
            Message::ChannelExtendedData { .. } => msg::CHANNEL_EXTENDED_DATA,
            Message::ChannelEof { .. } => msg::CHANNEL_EOF,
            Message::ChannelClose { .. } => msg::CHANNEL_CLOSE,
            Message::ChannelRequest { .. } => msg::CHANNEL_REQUEST,
            Message::ChannelSuccess { .. } => msg::CHANNEL_SUCCESS,
            Message::ChannelFailure { .. } => msg::CHANNEL_FAILURE,
        }
    }

    pub(crate) fn category(&self) -> msg::Category {
        msg::category(self.number())
    }

    /// Messages that may be sent while a key re-exchange is in progress.
    pub(crate) fn allowed_during_kex(&self) -> bool {
        matches!(
            self.category(),
            msg::Category::Kex | msg::Category::Transport
        )
    }

    /// Length of the channel payload, used for rekey accounting.
    pub(crate) fn payload_len(&self) -> usize {
        match self {
            Message::ChannelData { data, .. } | Message::ChannelExtendedData { data, .. } => {
                data.len()
            }
            _ => 0,
        }
    }
}

/// The method-specific part of a `SSH_MSG_USERAUTH_REQUEST`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum AuthRequestMethod {
    None,
    Password {
        password: String,
    },
    PublicKey {
        algorithm: String,
        key: Bytes,
        /// Absent for a query ("would this key be acceptable?").
        signature: Option<Bytes>,
    },
    HostBased {
        algorithm: String,
        key: Bytes,
        client_host: String,
        client_user: String,
        signature: Bytes,
    },
    KeyboardInteractive {
        submethods: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub prompt: String,
    pub echo: bool,
}

/// Connection-wide requests (<https://tools.ietf.org/html/rfc4254#section-4>).
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum GlobalRequest {
    TcpIpForward { address: String, port: u32 },
    CancelTcpIpForward { address: String, port: u32 },
    /// `keepalive@openssh.com`
    KeepAlive,
    Unknown { name: String },
}

impl GlobalRequest {
    pub fn name(&self) -> &str {
        match self {
            GlobalRequest::TcpIpForward { .. } => "tcpip-forward",
            GlobalRequest::CancelTcpIpForward { .. } => "cancel-tcpip-forward",
            GlobalRequest::KeepAlive => "keepalive@openssh.com",
            GlobalRequest::Unknown { name } => name,
        }
    }
}

/// Channel types, with their type-specific open parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelType {
    Session,
    X11 {
        originator_address: String,
        originator_port: u32,
    },
    DirectTcpip(TcpChannelInfo),
    ForwardedTcpIp(TcpChannelInfo),
    AgentForward,
    Unknown {
        typ: String,
    },
}

impl ChannelType {
    pub fn name(&self) -> &str {
        match self {
            ChannelType::Session => "session",
            ChannelType::X11 { .. } => "x11",
            ChannelType::DirectTcpip(_) => "direct-tcpip",
            ChannelType::ForwardedTcpIp(_) => "forwarded-tcpip",
            ChannelType::AgentForward => "auth-agent@openssh.com",
            ChannelType::Unknown { typ } => typ,
        }
    }
}

/// Addresses carried by `direct-tcpip` and `forwarded-tcpip` opens.
///
/// For `forwarded-tcpip`, `host_to_connect`/`port_to_connect` are the
/// address and port that were bound by the `tcpip-forward` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpChannelInfo {
    pub host_to_connect: String,
    pub port_to_connect: u32,
    pub originator_address: String,
    pub originator_port: u32,
}

/// Requests sent on a channel (<https://tools.ietf.org/html/rfc4254#section-6>).
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ChannelRequest {
    PtyReq {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        /// Encoded terminal modes, as (opcode, argument) pairs.
        terminal_modes: Vec<(u8, u32)>,
    },
    X11Req {
        single_connection: bool,
        x11_authentication_protocol: String,
        x11_authentication_cookie: String,
        x11_screen_number: u32,
    },
    Env {
        variable_name: String,
        variable_value: String,
    },
    Shell,
    Exec {
        command: Vec<u8>,
    },
    Subsystem {
        name: String,
    },
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    XonXoff {
        client_can_do: bool,
    },
    Signal {
        signal: Sig,
    },
    ExitStatus {
        exit_status: u32,
    },
    ExitSignal {
        signal_name: Sig,
        core_dumped: bool,
        error_message: String,
        lang_tag: String,
    },
    /// `auth-agent-req@openssh.com`
    AuthAgentReq,
    /// `keepalive@openssh.com`
    KeepAlive,
    Unknown {
        name: String,
    },
}

impl ChannelRequest {
    pub fn name(&self) -> &str {
        match self {
            ChannelRequest::PtyReq { .. } => "pty-req",
            ChannelRequest::X11Req { .. } => "x11-req",
            ChannelRequest::Env { .. } => "env",
            ChannelRequest::Shell => "shell",
            ChannelRequest::Exec { .. } => "exec",
            ChannelRequest::Subsystem { .. } => "subsystem",
            ChannelRequest::WindowChange { .. } => "window-change",
            ChannelRequest::XonXoff { .. } => "xon-xoff",
            ChannelRequest::Signal { .. } => "signal",
            ChannelRequest::ExitStatus { .. } => "exit-status",
            ChannelRequest::ExitSignal { .. } => "exit-signal",
            ChannelRequest::AuthAgentReq => "auth-agent-req@openssh.com",
            ChannelRequest::KeepAlive => "keepalive@openssh.com",
            ChannelRequest::Unknown { name } => name,
        }
    }

    /// `shell`, `exec` and `subsystem` start the data-bearing part of a session.
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChannelRequest::Shell | ChannelRequest::Exec { .. } | ChannelRequest::Subsystem { .. }
        )
    }
}
