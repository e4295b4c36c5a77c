use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info, trace, warn};
use tokio::sync::mpsc::{unbounded_channel, Receiver, Sender, UnboundedReceiver};
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::{Config, Handler};
use crate::auth::{self, AuthAttempt, Credentials, Decision, MethodKind, MethodSet, SignedBlob};
use crate::channels::{Channel, ChannelCommand, ChannelMsg, ChannelRef};
use crate::decision::Resolution;
use crate::global::GlobalRequestResponse;
use crate::keys::{SshKeyVerifier, Verifier};
use crate::message::{
    AuthRequestMethod, ChannelRequest, ChannelType, GlobalRequest, Message, TcpChannelInfo,
};
use crate::negotiation::Names;
use crate::session::{ChannelKind, CommonSession, ConnectionEvent};
use crate::transport::Transport;
use crate::{
    future_or_pending, ChannelId, ChannelOpenDecision, ChannelOpenFailure, Disconnect,
    GlobalDecision, RequestDecision, SessionRequest, Sig,
};

const USERAUTH: &str = "ssh-userauth";
const CONNECTION: &str = "ssh-connection";

#[derive(Debug)]
#[doc(hidden)]
pub enum Msg {
    /// Data from a [`Handle`], for which no window credit was taken yet.
    Data {
        channel: ChannelId,
        ext: Option<u32>,
        data: Bytes,
    },
    ChannelOpen {
        channel_type: ChannelType,
        sink: ChannelRef,
    },
    GlobalRequest {
        request: GlobalRequest,
        response: GlobalRequestResponse,
    },
    Rekey {
        done: oneshot::Sender<Result<(), crate::Error>>,
    },
    Disconnect {
        reason: Disconnect,
        description: String,
        language_tag: String,
    },
    Channel(ChannelId, ChannelCommand),
}

impl From<(ChannelId, ChannelCommand)> for Msg {
    fn from((id, cmd): (ChannelId, ChannelCommand)) -> Self {
        Msg::Channel(id, cmd)
    }
}

#[derive(Clone, Debug)]
/// Handle to a session, used to send messages to a client outside of
/// the request/response cycle.
pub struct Handle {
    pub(crate) sender: Sender<Msg>,
}

impl Handle {
    async fn send_msg(&self, msg: Msg) -> Result<(), crate::Error> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| crate::Error::SendError)
    }

    /// Send data to the session referenced by this handler. The data
    /// is sent as the client's window allows.
    pub async fn data(&self, id: ChannelId, data: Bytes) -> Result<(), Bytes> {
        self.sender
            .send(Msg::Data {
                channel: id,
                ext: None,
                data,
            })
            .await
            .map_err(|e| match e.0 {
                Msg::Data { data, .. } => data,
                _ => Bytes::new(),
            })
    }

    /// Send data to the session referenced by this handler.
    pub async fn extended_data(&self, id: ChannelId, ext: u32, data: Bytes) -> Result<(), Bytes> {
        self.sender
            .send(Msg::Data {
                channel: id,
                ext: Some(ext),
                data,
            })
            .await
            .map_err(|e| match e.0 {
                Msg::Data { data, .. } => data,
                _ => Bytes::new(),
            })
    }

    /// Send EOF to the session referenced by this handler.
    pub async fn eof(&self, id: ChannelId) -> Result<(), ()> {
        self.sender
            .send(Msg::Channel(id, ChannelCommand::Eof))
            .await
            .map_err(|_| ())
    }

    /// Close a channel.
    pub async fn close(&self, id: ChannelId) -> Result<(), ()> {
        self.sender
            .send(Msg::Channel(id, ChannelCommand::Close))
            .await
            .map_err(|_| ())
    }

    /// Inform the client of the exit status of a process.
    pub async fn exit_status_request(&self, id: ChannelId, exit_status: u32) -> Result<(), ()> {
        self.sender
            .send(Msg::Channel(
                id,
                ChannelCommand::Request {
                    request: ChannelRequest::ExitStatus { exit_status },
                    reply: None,
                },
            ))
            .await
            .map_err(|_| ())
    }

    /// Inform the client that a process exited because of a signal.
    pub async fn exit_signal_request(
        &self,
        id: ChannelId,
        signal_name: Sig,
        core_dumped: bool,
        error_message: String,
        lang_tag: String,
    ) -> Result<(), ()> {
        self.sender
            .send(Msg::Channel(
                id,
                ChannelCommand::Request {
                    request: ChannelRequest::ExitSignal {
                        signal_name,
                        core_dumped,
                        error_message,
                        lang_tag,
                    },
                    reply: None,
                },
            ))
            .await
            .map_err(|_| ())
    }

    async fn open_channel(&self, channel_type: ChannelType) -> Result<Channel<Msg>, crate::Error> {
        let (sender, mut receiver) = unbounded_channel();
        let sink = ChannelRef::new(sender);
        let window = sink.window.clone();
        self.send_msg(Msg::ChannelOpen { channel_type, sink }).await?;
        loop {
            match receiver.recv().await {
                Some(ChannelMsg::Open {
                    id,
                    max_packet_size,
                    ..
                }) => {
                    return Ok(Channel::new(
                        id,
                        self.sender.clone(),
                        receiver,
                        max_packet_size,
                        window,
                    ))
                }
                Some(ChannelMsg::OpenFailure(reason)) => {
                    return Err(crate::Error::ChannelOpenFailure(reason))
                }
                None => return Err(crate::Error::NoResponse),
                Some(msg) => debug!("msg = {msg:?}"),
            }
        }
    }

    /// Opens a channel for a connection that arrived on a port the
    /// client asked to forward. The client refuses it unless it made
    /// that `tcpip-forward` request.
    pub async fn channel_open_forwarded_tcpip<A: Into<String>, B: Into<String>>(
        &self,
        connected_address: A,
        connected_port: u32,
        originator_address: B,
        originator_port: u32,
    ) -> Result<Channel<Msg>, crate::Error> {
        self.open_channel(ChannelType::ForwardedTcpIp(TcpChannelInfo {
            host_to_connect: connected_address.into(),
            port_to_connect: connected_port,
            originator_address: originator_address.into(),
            originator_port,
        }))
        .await
    }

    pub async fn channel_open_x11<A: Into<String>>(
        &self,
        originator_address: A,
        originator_port: u32,
    ) -> Result<Channel<Msg>, crate::Error> {
        self.open_channel(ChannelType::X11 {
            originator_address: originator_address.into(),
            originator_port,
        })
        .await
    }

    /// Opens an `auth-agent@openssh.com` channel to the client's agent.
    pub async fn channel_open_agent(&self) -> Result<Channel<Msg>, crate::Error> {
        self.open_channel(ChannelType::AgentForward).await
    }

    /// Sends a `keepalive@openssh.com` request and waits for the reply.
    pub async fn send_ping(&self) -> Result<(), crate::Error> {
        let (reply, receiver) = oneshot::channel();
        self.send_msg(Msg::GlobalRequest {
            request: GlobalRequest::KeepAlive,
            response: GlobalRequestResponse::Ping(reply),
        })
        .await?;
        receiver.await.unwrap_or(Err(crate::Error::NoResponse))
    }

    /// Starts a key re-exchange and waits until the new keys are in use.
    pub async fn rekey(&self) -> Result<(), crate::Error> {
        let (done, receiver) = oneshot::channel();
        self.send_msg(Msg::Rekey { done }).await?;
        receiver.await.unwrap_or(Err(crate::Error::NoResponse))
    }

    /// Allows a server to disconnect a client session
    pub async fn disconnect(
        &self,
        reason: Disconnect,
        description: String,
        language_tag: String,
    ) -> Result<(), crate::Error> {
        self.send_msg(Msg::Disconnect {
            reason,
            description,
            language_tag,
        })
        .await
    }
}

#[derive(Debug)]
struct AuthState {
    authenticated: bool,
    /// Methods the client may still try.
    methods: MethodSet,
    rejections: usize,
    next_attempt: u64,
    /// The attempt the handler is deciding.
    pending: Option<(u64, AuthAttempt)>,
    /// Attempts that arrived while another one was pending.
    waiting: VecDeque<AuthAttempt>,
    /// Failure replies held back by `auth_rejection_time`.
    delayed: VecDeque<(Instant, Message)>,
    /// User and service of a keyboard-interactive exchange waiting for responses.
    info_request: Option<(String, String)>,
}

impl AuthState {
    fn new(methods: MethodSet) -> Self {
        AuthState {
            authenticated: false,
            methods,
            rejections: 0,
            next_attempt: 0,
            pending: None,
            waiting: VecDeque::new(),
            delayed: VecDeque::new(),
            info_request: None,
        }
    }

    fn busy(&self) -> bool {
        self.pending.is_some() || !self.delayed.is_empty()
    }
}

/// A connected server session. This type is unique to a client.
#[derive(Debug)]
pub struct Session {
    common: CommonSession,
    config: Arc<Config>,
    sender: Handle,
    receiver: Receiver<Msg>,
    resolutions: UnboundedReceiver<Resolution>,
    auth: AuthState,
}

impl Session {
    pub(super) fn new(
        common: CommonSession,
        config: Arc<Config>,
        sender: Handle,
        receiver: Receiver<Msg>,
        resolutions: UnboundedReceiver<Resolution>,
    ) -> Self {
        let auth = AuthState::new(config.methods.clone());
        Session {
            common,
            config,
            sender,
            receiver,
            resolutions,
            auth,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get a handle to this session.
    pub fn handle(&self) -> Handle {
        self.sender.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.authenticated
    }

    /// Identifier of the connection, from the initial key exchange.
    pub fn session_id(&self) -> &[u8] {
        &self.common.session_id
    }

    /// The algorithms negotiated by the last key exchange.
    pub fn names(&self) -> &Names {
        &self.common.names
    }

    /// Send data to a channel. On session channels, `extended` can be
    /// used to encode standard error by passing `Some(1)`, and stdout
    /// by passing `None`.
    ///
    /// Data is queued until the client's window allows sending it.
    pub fn data(&mut self, channel: ChannelId, data: Bytes) {
        self.common.data(channel, None, data, false)
    }

    pub fn extended_data(&mut self, channel: ChannelId, ext: u32, data: Bytes) {
        self.common.data(channel, Some(ext), data, false)
    }

    /// Send EOF to a channel, once its queued data is sent.
    pub fn eof(&mut self, channel: ChannelId) {
        self.common.eof(channel)
    }

    pub fn close(&mut self, channel: ChannelId) {
        self.common.close(channel)
    }

    /// Inform the client of the exit status of a process.
    pub fn exit_status_request(&mut self, channel: ChannelId, exit_status: u32) {
        self.common
            .request(channel, ChannelRequest::ExitStatus { exit_status }, None)
    }

    /// Inform the client that a process exited because of a signal.
    pub fn exit_signal_request(
        &mut self,
        channel: ChannelId,
        signal_name: Sig,
        core_dumped: bool,
        error_message: String,
        lang_tag: String,
    ) {
        self.common.request(
            channel,
            ChannelRequest::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                lang_tag,
            },
            None,
        )
    }

    /// Hands a request to the [`Channel`] it was made on. If the
    /// channel is gone, the request is rejected.
    pub fn deliver_request(
        &mut self,
        channel: ChannelId,
        request: SessionRequest,
        decision: RequestDecision,
    ) {
        match self.common.channels.get(&channel) {
            Some(c) => {
                c.sink.send(ChannelMsg::Request { request, decision });
            }
            None => debug!("request for closed channel {channel}"),
        }
    }

    /// The variables set by `env` on a session channel so far.
    pub fn channel_env(&self, channel: ChannelId) -> Vec<(String, String)> {
        self.common.channel_env(channel)
    }

    /// Starts a key re-exchange.
    pub fn request_rekey(&mut self) {
        self.common.initiate_rekey(None)
    }

    pub fn disconnect(&mut self, reason: Disconnect, description: &str, language_tag: &str) {
        self.common.disconnect(reason, description, language_tag)
    }

    pub(super) async fn run<H: Handler, T: Transport>(
        mut self,
        mut transport: T,
        mut handler: H,
    ) -> Result<(), H::Error> {
        let result = self.run_loop(&mut transport, &mut handler).await;
        let error = result.as_ref().err().map(|e| format!("{e:?}"));
        self.common.finish(&mut transport, error).await;
        result
    }

    async fn run_loop<H: Handler, T: Transport>(
        &mut self,
        transport: &mut T,
        handler: &mut H,
    ) -> Result<(), H::Error> {
        #[allow(clippy::panic)] // false positive in select! macro
        while !self.common.disconnected {
            let rekey_deadline = self.common.rekey_deadline();
            let inactivity_deadline = self.common.inactivity_deadline();
            let auth_deadline = self.auth.delayed.front().map(|(at, _)| *at);
            tokio::select! {
                biased;
                Some(resolution) = self.resolutions.recv() => {
                    match resolution {
                        Resolution::Auth { attempt, decision } => {
                            self.auth_decided(attempt, decision, handler).await?
                        }
                        resolution => self.common.resolve(resolution),
                    }
                }
                msg = transport.recv() => {
                    match msg? {
                        Some(msg) => self.process(msg, transport, handler).await?,
                        None => {
                            debug!("transport closed by the client");
                            break
                        }
                    }
                }
                Some(msg) = self.receiver.recv(), if !self.common.is_rekeying() => {
                    self.handle_msg(msg);
                    // eagerly take all outgoing messages so writes are batched
                    while !self.common.is_rekeying() {
                        match self.receiver.try_recv() {
                            Ok(next) => self.handle_msg(next),
                            Err(_) => break
                        }
                    }
                }
                _ = future_or_pending(auth_deadline, tokio::time::sleep_until) => {
                    self.release_failures();
                    self.next_attempt(handler).await?;
                }
                _ = future_or_pending(rekey_deadline, tokio::time::sleep_until) => {
                    debug!("rekey time limit reached");
                    self.common.initiate_rekey(None);
                }
                _ = future_or_pending(inactivity_deadline, tokio::time::sleep_until) => {
                    info!("inactivity timeout");
                    return Err(crate::Error::InactivityTimeout.into());
                }
            }
            if self.common.needs_rekey() {
                debug!("rekey byte limit reached");
                self.common.initiate_rekey(None);
            }
            self.common.flush(transport).await?;
        }
        debug!("disconnected");
        Ok(())
    }

    fn handle_msg(&mut self, msg: Msg) {
        match msg {
            Msg::Data { channel, ext, data } => self.common.data(channel, ext, data, false),
            Msg::ChannelOpen { channel_type, sink } => {
                if self.auth.authenticated {
                    self.common.open_channel(channel_type, sink);
                } else {
                    debug!("not opening {} before authentication", channel_type.name());
                    sink.send(ChannelMsg::OpenFailure(
                        ChannelOpenFailure::AdministrativelyProhibited,
                    ));
                }
            }
            Msg::GlobalRequest { request, response } => {
                self.common.global_request(request, response)
            }
            Msg::Rekey { done } => self.common.initiate_rekey(Some(done)),
            Msg::Disconnect {
                reason,
                description,
                language_tag,
            } => self
                .common
                .disconnect(reason, &description, &language_tag),
            Msg::Channel(id, cmd) => match cmd {
                ChannelCommand::Data { data, ext } => self.common.data(id, ext, data, true),
                ChannelCommand::Eof => self.common.eof(id),
                ChannelCommand::Close => self.common.close(id),
                ChannelCommand::Request { request, reply } => {
                    self.common.request(id, request, reply)
                }
            },
        }
    }

    async fn process<H: Handler, T: Transport>(
        &mut self,
        msg: Message,
        transport: &mut T,
        handler: &mut H,
    ) -> Result<(), H::Error> {
        trace!("server received {msg:?}");
        self.common.received(&msg);
        match msg {
            Message::Disconnect {
                reason,
                description,
                ..
            } => {
                info!("client disconnected: {reason:?} {description:?}");
                self.common.disconnected = true;
            }
            Message::Ignore | Message::Debug { .. } | Message::Unimplemented { .. } => {}
            Message::KexInit | Message::NewKeys => {
                if self.common.kex_message(&msg)? {
                    transport.new_keys()?;
                }
            }
            Message::ServiceRequest { name } => {
                if name == USERAUTH {
                    self.common.send(Message::ServiceAccept { name });
                    if let Some(ref banner) = self.config.auth_banner {
                        self.common.send(Message::UserauthBanner {
                            message: banner.clone(),
                            language_tag: String::new(),
                        });
                    }
                } else {
                    debug!("unknown service {name:?}");
                    self.common
                        .disconnect(Disconnect::ServiceNotAvailable, "unknown service", "");
                }
            }
            Message::UserauthRequest {
                user,
                service,
                method,
            } => {
                if self.auth.authenticated {
                    debug!("authentication request after success, ignored");
                    return Ok(());
                }
                let attempt = self.attempt(user, service, method)?;
                self.auth.info_request = None;
                self.auth.waiting.push_back(attempt);
                self.next_attempt(handler).await?
            }
            Message::UserauthInfoResponse { responses } => {
                match self.auth.info_request.take() {
                    Some((user, service)) => {
                        self.auth.waiting.push_back(AuthAttempt {
                            user,
                            service,
                            credentials: Credentials::KeyboardInteractiveResponse { responses },
                        });
                        self.next_attempt(handler).await?
                    }
                    None => warn!("unsolicited keyboard-interactive response"),
                }
            }
            Message::ChannelOpen {
                sender_channel,
                initial_window_size,
                maximum_packet_size,
                channel_type,
            } => {
                if self.auth.authenticated {
                    self.client_channel_open(
                        sender_channel,
                        initial_window_size,
                        maximum_packet_size,
                        channel_type,
                        handler,
                    )
                    .await?
                } else {
                    self.common
                        .refuse_open(sender_channel, ChannelOpenFailure::AdministrativelyProhibited)
                }
            }
            Message::GlobalRequest {
                want_reply,
                request,
            } => {
                let slot = self.common.push_global_request(want_reply, request.clone());
                match request {
                    _ if !self.auth.authenticated => {
                        debug!("global request before authentication");
                        self.common.resolve_global_request(slot, Err(()))
                    }
                    GlobalRequest::KeepAlive => self.common.resolve_global_request(slot, Ok(None)),
                    GlobalRequest::TcpIpForward { .. } | GlobalRequest::CancelTcpIpForward { .. } => {
                        let decision = GlobalDecision::new(slot, self.common.resolutions.clone());
                        handler.global_request(request, decision, self).await?
                    }
                    GlobalRequest::Unknown { ref name } => {
                        debug!("unknown global request {name}");
                        self.common.resolve_global_request(slot, Err(()))
                    }
                }
            }
            msg if !self.auth.authenticated => {
                warn!("message {} before authentication", msg.number());
                return Err(crate::Error::NotAuthenticated.into());
            }
            Message::ChannelData {
                recipient_channel,
                data,
            } => {
                let id = ChannelId(recipient_channel);
                if self.common.inbound_data(id, None, &data) {
                    handler.data(id, &data, self).await?;
                    let target = handler.adjust_window(id, self.config.window_size);
                    self.common.adjust_local_window(id, target);
                }
            }
            Message::ChannelExtendedData {
                recipient_channel,
                data_type,
                data,
            } => {
                let id = ChannelId(recipient_channel);
                if self.common.inbound_data(id, Some(data_type), &data) {
                    handler.extended_data(id, data_type, &data, self).await?;
                    let target = handler.adjust_window(id, self.config.window_size);
                    self.common.adjust_local_window(id, target);
                }
            }
            Message::ChannelEof { recipient_channel } => {
                let id = ChannelId(recipient_channel);
                self.common.inbound_eof(id);
                handler.channel_eof(id, self).await?;
            }
            Message::ChannelClose { recipient_channel } => {
                let id = ChannelId(recipient_channel);
                if self.common.inbound_close(id) {
                    handler.channel_close(id, self).await?;
                }
            }
            Message::ChannelRequest {
                recipient_channel,
                want_reply,
                request,
            } => {
                let id = ChannelId(recipient_channel);
                if let Some((request, decision)) =
                    self.common.inbound_request(id, want_reply, request)
                {
                    handler.session_request(id, request, decision, self).await?
                }
            }
            msg => {
                if let Some(msg) = self.common.connection_message(msg)? {
                    warn!("unexpected message {} from the client", msg.number());
                    return Err(crate::Error::UnexpectedMessage(msg.number()).into());
                }
            }
        }
        Ok(())
    }

    async fn client_channel_open<H: Handler>(
        &mut self,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
        channel_type: ChannelType,
        handler: &mut H,
    ) -> Result<(), H::Error> {
        match channel_type {
            ChannelType::Session | ChannelType::DirectTcpip(_) => {}
            ChannelType::Unknown { ref typ } => {
                debug!("unknown channel type {typ}");
                self.common
                    .refuse_open(sender_channel, ChannelOpenFailure::UnknownChannelType);
                return Ok(());
            }
            _ => {
                debug!("refusing {} channel from the client", channel_type.name());
                self.common
                    .refuse_open(sender_channel, ChannelOpenFailure::AdministrativelyProhibited);
                return Ok(());
            }
        }
        let Some(kind) = ChannelKind::from_type(&channel_type) else {
            return Ok(());
        };
        let (sender, receiver) = unbounded_channel();
        let sink = ChannelRef::new(sender);
        let window = sink.window.clone();
        let id = self.common.register_inbound(
            sender_channel,
            initial_window_size,
            maximum_packet_size,
            kind,
            sink,
        );
        let channel = Channel::new(
            id,
            self.sender.sender.clone(),
            receiver,
            maximum_packet_size,
            window,
        );
        let decision = ChannelOpenDecision::new(id, self.common.resolutions.clone());
        match channel_type {
            ChannelType::DirectTcpip(info) => {
                handler
                    .channel_open_direct_tcpip(
                        channel,
                        &info.host_to_connect,
                        info.port_to_connect,
                        &info.originator_address,
                        info.originator_port,
                        decision,
                        self,
                    )
                    .await?
            }
            _ => handler.channel_open_session(channel, decision, self).await?,
        }
        Ok(())
    }

    // Authentication.

    /// Builds the attempt presented to the handler, including the exact
    /// blob a signature must cover.
    fn attempt(
        &self,
        user: String,
        service: String,
        method: AuthRequestMethod,
    ) -> Result<AuthAttempt, crate::Error> {
        let credentials = match method {
            AuthRequestMethod::None => Credentials::None,
            AuthRequestMethod::Password { password } => Credentials::Password { password },
            AuthRequestMethod::PublicKey {
                algorithm,
                key,
                signature,
            } => {
                let signature = match signature {
                    Some(signature) => Some(SignedBlob {
                        blob: auth::publickey_signed_data(
                            &self.common.session_id,
                            &user,
                            &service,
                            &algorithm,
                            &key,
                        )?,
                        signature,
                    }),
                    None => None,
                };
                Credentials::PublicKey {
                    algorithm,
                    key,
                    signature,
                }
            }
            AuthRequestMethod::HostBased {
                algorithm,
                key,
                client_host,
                client_user,
                signature,
            } => {
                let blob = auth::hostbased_signed_data(
                    &self.common.session_id,
                    &user,
                    &service,
                    &algorithm,
                    &key,
                    &client_host,
                    &client_user,
                )?;
                Credentials::HostBased {
                    algorithm,
                    key,
                    local_hostname: client_host,
                    local_username: client_user,
                    signature: SignedBlob { blob, signature },
                }
            }
            AuthRequestMethod::KeyboardInteractive { submethods } => {
                Credentials::KeyboardInteractive { submethods }
            }
        };
        Ok(AuthAttempt {
            user,
            service,
            credentials,
        })
    }

    /// Starts the attempts that arrived, one at a time.
    async fn next_attempt<H: Handler>(&mut self, handler: &mut H) -> Result<(), H::Error> {
        while !self.auth.busy() && !self.auth.authenticated && !self.common.disconnected {
            let Some(attempt) = self.auth.waiting.pop_front() else {
                break;
            };
            self.start_attempt(attempt, handler).await?;
        }
        Ok(())
    }

    async fn start_attempt<H: Handler>(
        &mut self,
        attempt: AuthAttempt,
        handler: &mut H,
    ) -> Result<(), H::Error> {
        let kind = attempt.method();
        if attempt.service != CONNECTION {
            debug!("authentication for unknown service {:?}", attempt.service);
            self.reject(&attempt);
            return Ok(());
        }
        if !self.auth.methods.contains(&kind) {
            debug!("{kind:?} is not allowed");
            self.reject(&attempt);
            return Ok(());
        }
        let signed = matches!(
            attempt.credentials,
            Credentials::PublicKey {
                signature: Some(_),
                ..
            } | Credentials::HostBased { .. }
        );
        if signed {
            let verifier: &dyn Verifier = match self.config.verifier {
                Some(ref verifier) => verifier.as_ref(),
                None => &SshKeyVerifier,
            };
            if !attempt.verify_signature(verifier) {
                info!("{kind:?} signature of {} did not verify", attempt.user);
                self.reject(&attempt);
                return Ok(());
            }
        }
        let id = self.auth.next_attempt;
        self.auth.next_attempt += 1;
        debug!("attempt {id}: {kind:?} for {}", attempt.user);
        self.auth.pending = Some((id, attempt.clone()));
        let decision = crate::AuthDecision::new(id, self.common.resolutions.clone());
        handler.auth_attempt(attempt, decision, self).await
    }

    /// Reports a failure. Only `none` is answered right away, the others
    /// after `auth_rejection_time`.
    fn reject(&mut self, attempt: &AuthAttempt) {
        let failure = Message::UserauthFailure {
            remaining_methods: self.auth.methods.clone(),
            partial_success: false,
        };
        if attempt.method() == MethodKind::None {
            self.common.send(failure);
            return;
        }
        self.auth.rejections += 1;
        if self.auth.rejections >= self.config.max_auth_attempts {
            info!(
                "{} rejected authentication attempts for {}, disconnecting",
                self.auth.rejections, attempt.user
            );
            self.common.disconnect(
                Disconnect::NoMoreAuthMethodsAvailable,
                "Too many authentication failures",
                "",
            );
            return;
        }
        self.auth
            .delayed
            .push_back((Instant::now() + self.config.auth_rejection_time, failure));
    }

    fn release_failures(&mut self) {
        let now = Instant::now();
        while self.auth.delayed.front().is_some_and(|(at, _)| *at <= now) {
            if let Some((_, msg)) = self.auth.delayed.pop_front() {
                self.common.send(msg)
            }
        }
    }

    async fn auth_decided<H: Handler>(
        &mut self,
        attempt_id: u64,
        decision: Decision,
        handler: &mut H,
    ) -> Result<(), H::Error> {
        let attempt = match self.auth.pending.take() {
            Some((id, attempt)) if id == attempt_id => attempt,
            pending => {
                debug!("stale decision for attempt {attempt_id}");
                self.auth.pending = pending;
                return Ok(());
            }
        };
        match decision {
            Decision::Accept if attempt.is_query() => {
                if let Credentials::PublicKey { algorithm, key, .. } = attempt.credentials {
                    debug!("key of {} is acceptable", attempt.user);
                    self.common.send(Message::UserauthPkOk { algorithm, key });
                }
            }
            Decision::Accept => {
                info!("{} authenticated with {:?}", attempt.user, attempt.method());
                self.auth.authenticated = true;
                self.auth.waiting.clear();
                self.common.send(Message::UserauthSuccess);
                self.common.emit(ConnectionEvent::Ready);
                handler.auth_succeeded(self).await?;
            }
            Decision::Reject {
                proceed_with_methods,
            } => {
                if let Some(methods) = proceed_with_methods {
                    self.auth.methods = methods;
                }
                self.reject(&attempt);
            }
            Decision::PartialSuccess { remaining_methods } => {
                debug!("partial success for {}", attempt.user);
                self.auth.methods = remaining_methods.clone();
                self.common.send(Message::UserauthFailure {
                    remaining_methods,
                    partial_success: true,
                });
            }
            Decision::InfoRequest {
                name,
                instructions,
                prompts,
            } if attempt.method() == MethodKind::KeyboardInteractive => {
                self.auth.info_request = Some((attempt.user, attempt.service));
                self.common.send(Message::UserauthInfoRequest {
                    name,
                    instructions,
                    prompts,
                });
            }
            Decision::InfoRequest { .. } => {
                warn!("info request for a {:?} attempt", attempt.method());
                self.reject(&attempt);
            }
        }
        self.next_attempt(handler).await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!("drop session")
    }
}
