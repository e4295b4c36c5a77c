use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info, trace, warn};
use ssh_key::PublicKey;
use tokio::sync::mpsc::{channel, unbounded_channel, Receiver, Sender, UnboundedReceiver, UnboundedSender};

use super::{Config, Handler, Msg, Reply};
use crate::auth::{self, Method};
use crate::channels::{Channel, ChannelCommand, ChannelMsg, ChannelRef};
use crate::decision::Resolution;
use crate::keys;
use crate::message::{AuthRequestMethod, ChannelRequest, ChannelType, Message};
use crate::negotiation::Names;
use crate::session::{ChannelKind, CommonSession, ConnectionEvent};
use crate::transport::Transport;
use crate::{future_or_pending, ChannelId, ChannelOpenDecision, ChannelOpenFailure, Disconnect};

const SERVICE: &str = "ssh-connection";

#[derive(Debug, Default)]
struct AuthState {
    service_accepted: bool,
    /// Requested before the server accepted the `ssh-userauth` service.
    deferred: Option<(String, Method)>,
    /// The attempt in flight.
    current: Option<(String, Method)>,
    authenticated: bool,
}

/// Actual client session's state.
///
/// It is in charge of multiplexing and keeping track of various channels
/// that may get opened and closed during the lifetime of an SSH session and
/// allows sending messages to the server.
#[derive(Debug)]
pub struct Session {
    common: CommonSession,
    config: Arc<Config>,
    receiver: Receiver<Msg>,
    sender: UnboundedSender<Reply>,
    resolutions: UnboundedReceiver<Resolution>,
    inbound_channel_sender: Sender<Msg>,
    inbound_channel_receiver: Receiver<Msg>,
    auth: AuthState,
}

impl Session {
    pub(super) fn new(
        common: CommonSession,
        config: Arc<Config>,
        receiver: Receiver<Msg>,
        sender: UnboundedSender<Reply>,
        resolutions: UnboundedReceiver<Resolution>,
    ) -> Self {
        let (inbound_channel_sender, inbound_channel_receiver) =
            channel(config.channel_buffer_size.max(1));
        Session {
            common,
            config,
            receiver,
            sender,
            resolutions,
            inbound_channel_sender,
            inbound_channel_receiver,
            auth: AuthState::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.authenticated
    }

    pub fn names(&self) -> &Names {
        &self.common.names
    }

    /// Sends data on a channel, as far as the server's window allows.
    /// The rest is sent when the window grows.
    pub fn data(&mut self, channel: ChannelId, data: Bytes) {
        self.common.data(channel, None, data, false)
    }

    pub fn extended_data(&mut self, channel: ChannelId, ext: u32, data: Bytes) {
        self.common.data(channel, Some(ext), data, false)
    }

    pub fn eof(&mut self, channel: ChannelId) {
        self.common.eof(channel)
    }

    pub fn close(&mut self, channel: ChannelId) {
        self.common.close(channel)
    }

    pub(super) async fn run<H: Handler, T: Transport>(
        mut self,
        mut transport: T,
        mut handler: H,
    ) -> Result<(), H::Error> {
        self.common.send(Message::ServiceRequest {
            name: "ssh-userauth".to_string(),
        });
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
        self.common.flush(transport).await?;

        #[allow(clippy::panic)] // false positive in select! macro
        while !self.common.disconnected {
            let rekey_deadline = self.common.rekey_deadline();
            let inactivity_deadline = self.common.inactivity_deadline();
            tokio::select! {
                biased;
                Some(resolution) = self.resolutions.recv() => {
                    self.common.resolve(resolution);
                }
                msg = transport.recv() => {
                    match msg? {
                        Some(msg) => self.process(msg, transport, handler).await?,
                        None => {
                            debug!("transport closed by the server");
                            break
                        }
                    }
                }
                msg = self.receiver.recv(), if !self.common.is_rekeying() => {
                    match msg {
                        Some(msg) => self.handle_msg(msg)?,
                        None => {
                            debug!("handle dropped, disconnecting");
                            self.common.disconnect(Disconnect::ByApplication, "", "");
                        }
                    }

                    // eagerly take all outgoing messages so writes are batched
                    while !self.common.is_rekeying() {
                        match self.receiver.try_recv() {
                            Ok(next) => self.handle_msg(next)?,
                            Err(_) => break
                        }
                    }
                }
                Some(msg) = self.inbound_channel_receiver.recv(), if !self.common.is_rekeying() => {
                    self.handle_msg(msg)?;
                    while !self.common.is_rekeying() {
                        match self.inbound_channel_receiver.try_recv() {
                            Ok(next) => self.handle_msg(next)?,
                            Err(_) => break
                        }
                    }
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

    fn handle_msg(&mut self, msg: Msg) -> Result<(), crate::Error> {
        match msg {
            Msg::Authenticate { user, method } => self.authenticate(user, method)?,
            Msg::AuthInfoResponse { responses } => {
                self.common.send(Message::UserauthInfoResponse { responses })
            }
            Msg::Signed { signature } => self.signed(signature)?,
            Msg::ChannelOpen { channel_type, sink } => {
                self.common.open_channel(channel_type, sink);
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
        Ok(())
    }

    fn authenticate(&mut self, user: String, method: Method) -> Result<(), crate::Error> {
        if self.auth.authenticated {
            let _ = self.sender.send(Reply::AuthSuccess);
            return Ok(());
        }
        if !self.auth.service_accepted {
            debug!("authentication deferred until the service is accepted");
            self.auth.deferred = Some((user, method));
            return Ok(());
        }
        self.write_auth_request(user, method)
    }

    fn publickey_request(
        &self,
        user: &str,
        key: &PublicKey,
    ) -> Result<(String, Bytes, Vec<u8>), crate::Error> {
        let algorithm = auth::signing_algorithm(key);
        let blob = keys::public_key_blob(key)?;
        let to_sign =
            auth::publickey_signed_data(&self.common.session_id, user, SERVICE, &algorithm, &blob)?;
        Ok((algorithm, blob, to_sign))
    }

    fn write_auth_request(&mut self, user: String, method: Method) -> Result<(), crate::Error> {
        let request = match method {
            Method::None => AuthRequestMethod::None,
            Method::Password { ref password } => AuthRequestMethod::Password {
                password: password.clone(),
            },
            Method::PublicKey { ref key } => {
                let key = key.public_key();
                AuthRequestMethod::PublicKey {
                    algorithm: auth::signing_algorithm(key),
                    key: keys::public_key_blob(key)?,
                    signature: None,
                }
            }
            Method::FuturePublicKey { ref key } => AuthRequestMethod::PublicKey {
                algorithm: auth::signing_algorithm(key),
                key: keys::public_key_blob(key)?,
                signature: None,
            },
            Method::HostBased {
                ref key,
                ref local_hostname,
                ref local_username,
            } => {
                let public = key.public_key();
                let algorithm = auth::signing_algorithm(public);
                let blob = keys::public_key_blob(public)?;
                let to_sign = auth::hostbased_signed_data(
                    &self.common.session_id,
                    &user,
                    SERVICE,
                    &algorithm,
                    &blob,
                    local_hostname,
                    local_username,
                )?;
                AuthRequestMethod::HostBased {
                    algorithm,
                    key: blob,
                    client_host: local_hostname.clone(),
                    client_user: local_username.clone(),
                    signature: keys::sign(key, &to_sign)?,
                }
            }
            Method::KeyboardInteractive { ref submethods } => {
                AuthRequestMethod::KeyboardInteractive {
                    submethods: submethods.clone(),
                }
            }
        };
        debug!("trying {:?} for {user}", method.kind());
        self.common.send(Message::UserauthRequest {
            user: user.clone(),
            service: SERVICE.to_string(),
            method: request,
        });
        self.auth.current = Some((user, method));
        Ok(())
    }

    /// The server accepts the key we offered: sign the request.
    fn pk_ok(&mut self) -> Result<(), crate::Error> {
        let Some((user, method)) = self.auth.current.take() else {
            warn!("PK_OK without a pending attempt");
            return Ok(());
        };
        match method {
            Method::PublicKey { ref key } => {
                let (algorithm, blob, to_sign) = self.publickey_request(&user, key.public_key())?;
                let signature = keys::sign(key, &to_sign)?;
                self.common.send(Message::UserauthRequest {
                    user: user.clone(),
                    service: SERVICE.to_string(),
                    method: AuthRequestMethod::PublicKey {
                        algorithm,
                        key: blob,
                        signature: Some(signature),
                    },
                });
            }
            Method::FuturePublicKey { ref key } => {
                let (_, _, to_sign) = self.publickey_request(&user, key)?;
                let _ = self.sender.send(Reply::SignRequest {
                    key: key.clone(),
                    data: Bytes::from(to_sign),
                });
            }
            ref method => warn!("PK_OK for a {:?} attempt", method.kind()),
        }
        self.auth.current = Some((user, method));
        Ok(())
    }

    /// A [`Signer`](auth::Signer) produced the signature asked for in `pk_ok`.
    fn signed(&mut self, signature: Bytes) -> Result<(), crate::Error> {
        let Some((user, Method::FuturePublicKey { key })) = &self.auth.current else {
            warn!("signature without a pending public key attempt");
            return Ok(());
        };
        let (algorithm, blob, _) = self.publickey_request(user, key)?;
        let user = user.clone();
        self.common.send(Message::UserauthRequest {
            user,
            service: SERVICE.to_string(),
            method: AuthRequestMethod::PublicKey {
                algorithm,
                key: blob,
                signature: Some(signature),
            },
        });
        Ok(())
    }

    async fn process<H: Handler, T: Transport>(
        &mut self,
        msg: Message,
        transport: &mut T,
        handler: &mut H,
    ) -> Result<(), H::Error> {
        trace!("client received {msg:?}");
        self.common.received(&msg);
        match msg {
            Message::Disconnect {
                reason,
                description,
                ..
            } => {
                info!("server disconnected: {reason:?} {description:?}");
                self.common.disconnected = true;
            }
            Message::Ignore | Message::Debug { .. } | Message::Unimplemented { .. } => {}
            Message::KexInit | Message::NewKeys => {
                if self.common.kex_message(&msg)? {
                    transport.new_keys()?;
                }
            }
            Message::ServiceAccept { name } => {
                debug!("service {name} accepted");
                self.auth.service_accepted = true;
                if let Some((user, method)) = self.auth.deferred.take() {
                    self.write_auth_request(user, method)?;
                }
            }
            Message::UserauthBanner { message, .. } => {
                self.common.emit(ConnectionEvent::Banner(message.clone()));
                handler.auth_banner(&message, self).await?;
            }
            Message::UserauthSuccess => {
                info!("authenticated");
                self.auth.authenticated = true;
                self.auth.current = None;
                self.common.emit(ConnectionEvent::Ready);
                let _ = self.sender.send(Reply::AuthSuccess);
            }
            Message::UserauthFailure {
                remaining_methods,
                partial_success,
            } => {
                debug!("authentication failed, remaining methods: {remaining_methods:?}");
                self.auth.current = None;
                let _ = self.sender.send(Reply::AuthFailure {
                    remaining_methods,
                    partial_success,
                });
            }
            Message::UserauthPkOk { .. } => self.pk_ok()?,
            Message::UserauthInfoRequest {
                name,
                instructions,
                prompts,
            } => {
                let _ = self.sender.send(Reply::AuthInfoRequest {
                    name,
                    instructions,
                    prompts,
                });
            }
            Message::ChannelOpen {
                sender_channel,
                initial_window_size,
                maximum_packet_size,
                channel_type,
            } => {
                self.server_channel_open(
                    sender_channel,
                    initial_window_size,
                    maximum_packet_size,
                    channel_type,
                    handler,
                )
                .await?
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
                match request {
                    ChannelRequest::ExitStatus { exit_status } => {
                        handler.exit_status(id, exit_status, self).await?
                    }
                    ChannelRequest::ExitSignal {
                        ref signal_name,
                        core_dumped,
                        ref error_message,
                        ref lang_tag,
                    } => {
                        handler
                            .exit_signal(
                                id,
                                signal_name.clone(),
                                core_dumped,
                                error_message,
                                lang_tag,
                                self,
                            )
                            .await?
                    }
                    _ => {}
                }
                if let Some((request, decision)) =
                    self.common.inbound_request(id, want_reply, request)
                {
                    if let Some(channel) = self.common.channels.get(&id) {
                        channel.sink.send(ChannelMsg::Request { request, decision });
                    }
                }
            }
            Message::GlobalRequest {
                want_reply,
                request,
            } => {
                // Clients serve no global request; keepalives only need an answer.
                debug!("refusing global request {}", request.name());
                let slot = self.common.push_global_request(want_reply, request);
                self.common.resolve_global_request(slot, Err(()));
            }
            msg => {
                if let Some(msg) = self.common.connection_message(msg)? {
                    warn!("unexpected message {} from the server", msg.number());
                    return Err(crate::Error::UnexpectedMessage(msg.number()).into());
                }
            }
        }
        Ok(())
    }

    async fn server_channel_open<H: Handler>(
        &mut self,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
        channel_type: ChannelType,
        handler: &mut H,
    ) -> Result<(), H::Error> {
        match channel_type {
            ChannelType::ForwardedTcpIp(ref info) => {
                if !self
                    .common
                    .forwards
                    .contains(&info.host_to_connect, info.port_to_connect)
                {
                    debug!(
                        "no forwarding registered for {}:{}",
                        info.host_to_connect, info.port_to_connect
                    );
                    self.common
                        .refuse_open(sender_channel, ChannelOpenFailure::AdministrativelyProhibited);
                    return Ok(());
                }
            }
            ChannelType::X11 { .. } | ChannelType::AgentForward => {}
            ChannelType::Unknown { ref typ } => {
                debug!("unknown channel type {typ}");
                self.common
                    .refuse_open(sender_channel, ChannelOpenFailure::UnknownChannelType);
                return Ok(());
            }
            ChannelType::Session | ChannelType::DirectTcpip(_) => {
                debug!("refusing {} channel from the server", channel_type.name());
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
            self.inbound_channel_sender.clone(),
            receiver,
            maximum_packet_size,
            window,
        );
        match channel_type {
            ChannelType::ForwardedTcpIp(info) => {
                self.common.resolve_open(id, Ok(()));
                handler
                    .server_channel_open_forwarded_tcpip(
                        channel,
                        &info.host_to_connect,
                        info.port_to_connect,
                        &info.originator_address,
                        info.originator_port,
                        self,
                    )
                    .await?
            }
            ChannelType::X11 {
                originator_address,
                originator_port,
            } => {
                let decision = ChannelOpenDecision::new(id, self.common.resolutions.clone());
                handler
                    .server_channel_open_x11(
                        channel,
                        &originator_address,
                        originator_port,
                        decision,
                        self,
                    )
                    .await?
            }
            _ => {
                let decision = ChannelOpenDecision::new(id, self.common.resolutions.clone());
                handler
                    .server_channel_open_agent_forward(channel, decision, self)
                    .await?
            }
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!("drop session")
    }
}

