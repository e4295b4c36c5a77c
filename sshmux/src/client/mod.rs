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
//

//! # Implementing clients
//!
//! A client connection is driven by a task spawned by [`connect_stream`].
//! The returned [`Handle`] is used from the application to authenticate,
//! open channels and send connection-wide requests, while the
//! [`Handler`] is called by the connection task when the server sends
//! something unsolicited.
//!
//! ```no_run
//! use std::sync::Arc;
//! use sshmux::client;
//! use sshmux::transport::MemoryTransport;
//!
//! struct Client {}
//!
//! impl client::Handler for Client {
//!     type Error = sshmux::Error;
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), sshmux::Error> {
//!     let (transport, _server_end) = MemoryTransport::pair();
//!     let config = Arc::new(client::Config::default());
//!     let mut handle = client::connect_stream(config, transport, Client {}).await?;
//!     if handle.authenticate_password("user", "password").await?.success() {
//!         let mut channel = handle
//!             .exec("uname -a", &client::SessionOptions::default())
//!             .await?;
//!         while let Some(msg) = channel.wait().await {
//!             println!("{:?}", msg)
//!         }
//!     }
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use log::{debug, error, info};
use ssh_key::{PrivateKey, PublicKey};
use tokio::sync::mpsc::{channel, unbounded_channel, Sender, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::auth::{self, AuthResult, Method, MethodSet};
use crate::channels::{wait_reply, Channel, ChannelCommand, ChannelMsg, ChannelRef};
use crate::global::GlobalRequestResponse;
use crate::keys::{self, FingerprintHash};
use crate::message::{ChannelRequest, ChannelType, GlobalRequest, Message, Prompt, TcpChannelInfo};
use crate::session::{ChannelSettings, CommonSession, ConnectionEvent};
use crate::transport::{HandshakeParams, Transport};
use crate::{negotiation, ChannelId, ChannelOpenDecision, Disconnect, Limits, Sig};

mod session;
pub use session::Session;

/// Messages from a [`Handle`] or a [`Channel`] to the connection task.
#[derive(Debug)]
#[doc(hidden)]
pub enum Msg {
    Authenticate {
        user: String,
        method: Method,
    },
    AuthInfoResponse {
        responses: Vec<String>,
    },
    Signed {
        signature: Bytes,
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

/// Authentication progress, reported by the connection task.
#[derive(Debug)]
enum Reply {
    AuthSuccess,
    AuthFailure {
        remaining_methods: MethodSet,
        partial_success: bool,
    },
    SignRequest {
        key: PublicKey,
        data: Bytes,
    },
    AuthInfoRequest {
        name: String,
        instructions: String,
        prompts: Vec<Prompt>,
    },
}

#[derive(Debug)]
pub enum KeyboardInteractiveAuthResponse {
    Success,
    Failure {
        remaining_methods: MethodSet,
        partial_success: bool,
    },
    InfoRequest {
        name: String,
        instructions: String,
        prompts: Vec<Prompt>,
    },
}

/// Terminal requested before `exec` or `shell`.
#[derive(Debug, Clone)]
pub struct PtyOptions {
    pub term: String,
    pub col_width: u32,
    pub row_height: u32,
    pub pix_width: u32,
    pub pix_height: u32,
    pub terminal_modes: Vec<(u8, u32)>,
}

impl Default for PtyOptions {
    fn default() -> Self {
        PtyOptions {
            term: "vt100".to_string(),
            col_width: 80,
            row_height: 24,
            pix_width: 0,
            pix_height: 0,
            terminal_modes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct X11Options {
    pub single_connection: bool,
    pub auth_protocol: String,
    pub auth_cookie: String,
    pub screen_number: u32,
}

/// Requests sent on a session channel before `exec` or `shell`, in this
/// order: `env`, `pty-req`, `x11-req`, `auth-agent-req@openssh.com`.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Sent without asking for a reply, servers commonly refuse them.
    pub env: Vec<(String, String)>,
    pub pty: Option<PtyOptions>,
    pub x11: Option<X11Options>,
    pub agent_forward: bool,
}

/// Handle to a session, used to send messages to a client outside of
/// the request/response cycle.
pub struct Handle<H: Handler> {
    sender: Sender<Msg>,
    receiver: UnboundedReceiver<Reply>,
    join: JoinHandle<Result<(), H::Error>>,
    events: Option<UnboundedReceiver<ConnectionEvent>>,
}

impl<H: Handler> std::fmt::Debug for Handle<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl<H: Handler> Drop for Handle<H> {
    fn drop(&mut self) {
        debug!("drop handle")
    }
}

impl<H: Handler> Handle<H> {
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Connection events of this session. Only the first call returns
    /// the receiver.
    pub fn take_events(&mut self) -> Option<UnboundedReceiver<ConnectionEvent>> {
        self.events.take()
    }

    async fn send_msg(&self, msg: Msg) -> Result<(), crate::Error> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| crate::Error::SendError)
    }

    async fn start_auth(&mut self, user: String, method: Method) -> Result<AuthResult, crate::Error> {
        self.send_msg(Msg::Authenticate { user, method }).await?;
        self.wait_recv_reply().await
    }

    async fn wait_recv_reply(&mut self) -> Result<AuthResult, crate::Error> {
        loop {
            match self.receiver.recv().await {
                Some(Reply::AuthSuccess) => return Ok(AuthResult::Success),
                Some(Reply::AuthFailure {
                    remaining_methods,
                    partial_success,
                }) => {
                    return Ok(AuthResult::Failure {
                        remaining_methods,
                        partial_success,
                    })
                }
                None => return Err(crate::Error::Disconnect),
                Some(reply) => debug!("unexpected authentication reply {reply:?}"),
            }
        }
    }

    /// Perform no authentication. This is useful for testing, but should not be
    /// used in most other circumstances.
    pub async fn authenticate_none<U: Into<String>>(
        &mut self,
        user: U,
    ) -> Result<AuthResult, crate::Error> {
        self.start_auth(user.into(), Method::None).await
    }

    /// Perform password-based SSH authentication.
    pub async fn authenticate_password<U: Into<String>, P: Into<String>>(
        &mut self,
        user: U,
        password: P,
    ) -> Result<AuthResult, crate::Error> {
        self.start_auth(
            user.into(),
            Method::Password {
                password: password.into(),
            },
        )
        .await
    }

    /// Perform public key-based SSH authentication. The key is first
    /// offered without a signature, and only signed once the server
    /// accepted it.
    pub async fn authenticate_publickey<U: Into<String>>(
        &mut self,
        user: U,
        key: Arc<PrivateKey>,
    ) -> Result<AuthResult, crate::Error> {
        self.start_auth(user.into(), Method::PublicKey { key }).await
    }

    /// Authenticate using a custom method that implements the
    /// [`Signer`][auth::Signer] trait, such as an SSH agent.
    pub async fn authenticate_publickey_with<U: Into<String>, S: auth::Signer>(
        &mut self,
        user: U,
        key: PublicKey,
        signer: &mut S,
    ) -> Result<AuthResult, S::Error> {
        let user = user.into();
        self.sender
            .send(Msg::Authenticate {
                user,
                method: Method::FuturePublicKey { key },
            })
            .await
            .map_err(|_| crate::SendError {})?;
        loop {
            match self.receiver.recv().await {
                Some(Reply::AuthSuccess) => return Ok(AuthResult::Success),
                Some(Reply::AuthFailure {
                    remaining_methods,
                    partial_success,
                }) => {
                    return Ok(AuthResult::Failure {
                        remaining_methods,
                        partial_success,
                    })
                }
                Some(Reply::SignRequest { key, data }) => {
                    let signature = signer.auth_publickey_sign(&key, data).await?;
                    self.sender
                        .send(Msg::Signed { signature })
                        .await
                        .map_err(|_| crate::SendError {})?;
                }
                None => return Err(crate::SendError {}.into()),
                Some(reply) => debug!("unexpected authentication reply {reply:?}"),
            }
        }
    }

    /// Host-based authentication: `key` is the client host's key.
    pub async fn authenticate_hostbased<U: Into<String>>(
        &mut self,
        user: U,
        key: Arc<PrivateKey>,
        local_hostname: &str,
        local_username: &str,
    ) -> Result<AuthResult, crate::Error> {
        self.start_auth(
            user.into(),
            Method::HostBased {
                key,
                local_hostname: local_hostname.to_string(),
                local_username: local_username.to_string(),
            },
        )
        .await
    }

    /// Initiate Keyboard-Interactive based SSH authentication.
    ///
    /// * `submethods` - Hints to the server the preferred methods to be used for authentication
    pub async fn authenticate_keyboard_interactive_start<U: Into<String>, S: Into<Option<String>>>(
        &mut self,
        user: U,
        submethods: S,
    ) -> Result<KeyboardInteractiveAuthResponse, crate::Error> {
        self.send_msg(Msg::Authenticate {
            user: user.into(),
            method: Method::KeyboardInteractive {
                submethods: submethods.into().unwrap_or_default(),
            },
        })
        .await?;
        self.wait_recv_keyboard_interactive_reply().await
    }

    /// Respond to AuthInfoRequests from the server. A server can send any number of these Requests
    /// including empty requests. You may have to call this function multple times in order to
    /// complete Keyboard-Interactive based SSH authentication.
    ///
    /// * `responses` - The responses to each prompt. The number of responses must match the number
    ///   of prompts. If a prompt has an empty string, then the response should be an empty string.
    pub async fn authenticate_keyboard_interactive_respond(
        &mut self,
        responses: Vec<String>,
    ) -> Result<KeyboardInteractiveAuthResponse, crate::Error> {
        self.send_msg(Msg::AuthInfoResponse { responses }).await?;
        self.wait_recv_keyboard_interactive_reply().await
    }

    async fn wait_recv_keyboard_interactive_reply(
        &mut self,
    ) -> Result<KeyboardInteractiveAuthResponse, crate::Error> {
        loop {
            match self.receiver.recv().await {
                Some(Reply::AuthSuccess) => return Ok(KeyboardInteractiveAuthResponse::Success),
                Some(Reply::AuthFailure {
                    remaining_methods,
                    partial_success,
                }) => {
                    return Ok(KeyboardInteractiveAuthResponse::Failure {
                        remaining_methods,
                        partial_success,
                    })
                }
                Some(Reply::AuthInfoRequest {
                    name,
                    instructions,
                    prompts,
                }) => {
                    return Ok(KeyboardInteractiveAuthResponse::InfoRequest {
                        name,
                        instructions,
                        prompts,
                    })
                }
                None => return Err(crate::Error::Disconnect),
                Some(reply) => debug!("unexpected authentication reply {reply:?}"),
            }
        }
    }

    /// Tries `methods` in order until one succeeds. A partial success
    /// moves on to the next method, and methods the server no longer
    /// lists are skipped. Keyboard-interactive prompts are answered
    /// with empty strings. Fails with [`Error::AuthFailed`](crate::Error::AuthFailed)
    /// once every method was tried.
    pub async fn authenticate(&mut self, user: &str, methods: &[Method]) -> Result<(), crate::Error> {
        let mut remaining: Option<MethodSet> = None;
        for method in methods {
            let kind = method.kind();
            if let Some(ref remaining) = remaining {
                if !remaining.contains(&kind) {
                    debug!("skipping {kind:?}, not offered by the server");
                    continue;
                }
            }
            let result = match method {
                Method::FuturePublicKey { .. } => {
                    debug!("skipping a public key without a signer");
                    continue;
                }
                Method::KeyboardInteractive { submethods } => {
                    let mut response = self
                        .authenticate_keyboard_interactive_start(user, Some(submethods.clone()))
                        .await?;
                    loop {
                        match response {
                            KeyboardInteractiveAuthResponse::Success => break AuthResult::Success,
                            KeyboardInteractiveAuthResponse::Failure {
                                remaining_methods,
                                partial_success,
                            } => {
                                break AuthResult::Failure {
                                    remaining_methods,
                                    partial_success,
                                }
                            }
                            KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                                let responses = vec![String::new(); prompts.len()];
                                response = self
                                    .authenticate_keyboard_interactive_respond(responses)
                                    .await?;
                            }
                        }
                    }
                }
                method => self.start_auth(user.to_string(), method.clone()).await?,
            };
            match result {
                AuthResult::Success => {
                    info!("authenticated as {user} with {kind:?}");
                    return Ok(());
                }
                AuthResult::Failure {
                    remaining_methods,
                    partial_success,
                } => {
                    debug!("{kind:?} failed (partial success: {partial_success})");
                    remaining = Some(remaining_methods);
                }
            }
        }
        Err(crate::Error::AuthFailed)
    }

    /// Open a channel and wait for the server's answer.
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

    /// Request a session channel (the most basic type of
    /// channel).
    pub async fn channel_open_session(&self) -> Result<Channel<Msg>, crate::Error> {
        self.open_channel(ChannelType::Session).await
    }

    /// Request an X11 channel, on which the X11 protocol may be tunneled.
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

    /// Open a TCP/IP forwarding channel. This is usually done when a
    /// connection comes to a locally forwarded TCP/IP port. See
    /// [RFC4254](https://tools.ietf.org/html/rfc4254#section-7). The
    /// TCP/IP packets can then be tunneled through the channel using
    /// `.data()`. A server that cannot reach the target refuses the
    /// channel with [`ChannelOpenFailure::ConnectFailed`](crate::ChannelOpenFailure::ConnectFailed).
    pub async fn channel_open_direct_tcpip<A: Into<String>, B: Into<String>>(
        &self,
        host_to_connect: A,
        port_to_connect: u32,
        originator_address: B,
        originator_port: u32,
    ) -> Result<Channel<Msg>, crate::Error> {
        self.open_channel(ChannelType::DirectTcpip(TcpChannelInfo {
            host_to_connect: host_to_connect.into(),
            port_to_connect,
            originator_address: originator_address.into(),
            originator_port,
        }))
        .await
    }

    /// Sends the option requests of a session channel without waiting
    /// for their replies.
    async fn queue_options(
        &self,
        channel: &Channel<Msg>,
        options: &SessionOptions,
    ) -> Result<Vec<oneshot::Receiver<Result<(), crate::Error>>>, crate::Error> {
        let mut replies = Vec::new();
        for (variable_name, variable_value) in &options.env {
            channel
                .queue_request(
                    false,
                    ChannelRequest::Env {
                        variable_name: variable_name.clone(),
                        variable_value: variable_value.clone(),
                    },
                )
                .await?;
        }
        if let Some(ref pty) = options.pty {
            replies.extend(
                channel
                    .queue_request(
                        true,
                        ChannelRequest::PtyReq {
                            term: pty.term.clone(),
                            col_width: pty.col_width,
                            row_height: pty.row_height,
                            pix_width: pty.pix_width,
                            pix_height: pty.pix_height,
                            terminal_modes: pty.terminal_modes.clone(),
                        },
                    )
                    .await?,
            );
        }
        if let Some(ref x11) = options.x11 {
            replies.extend(
                channel
                    .queue_request(
                        true,
                        ChannelRequest::X11Req {
                            single_connection: x11.single_connection,
                            x11_authentication_protocol: x11.auth_protocol.clone(),
                            x11_authentication_cookie: x11.auth_cookie.clone(),
                            x11_screen_number: x11.screen_number,
                        },
                    )
                    .await?,
            );
        }
        if options.agent_forward {
            replies.extend(
                channel
                    .queue_request(true, ChannelRequest::AuthAgentReq)
                    .await?,
            );
        }
        Ok(replies)
    }

    /// Opens a session channel, sends `options` then `terminal`, and waits
    /// for all the replies. The requests are pipelined.
    async fn start_session(
        &self,
        options: &SessionOptions,
        terminal: ChannelRequest,
    ) -> Result<Channel<Msg>, crate::Error> {
        let channel = self.channel_open_session().await?;
        let mut replies = self.queue_options(&channel, options).await?;
        replies.extend(channel.queue_request(true, terminal).await?);
        for reply in replies {
            wait_reply(reply).await?;
        }
        Ok(channel)
    }

    /// Runs `command` on a new session channel. The channel is returned
    /// once the server accepted every request.
    pub async fn exec<A: Into<Vec<u8>>>(
        &self,
        command: A,
        options: &SessionOptions,
    ) -> Result<Channel<Msg>, crate::Error> {
        self.start_session(
            options,
            ChannelRequest::Exec {
                command: command.into(),
            },
        )
        .await
    }

    /// Starts a shell on a new session channel.
    pub async fn shell(&self, options: &SessionOptions) -> Result<Channel<Msg>, crate::Error> {
        self.start_session(options, ChannelRequest::Shell).await
    }

    /// Starts subsystem `name` on a new session channel.
    pub async fn subsystem<A: Into<String>>(&self, name: A) -> Result<Channel<Msg>, crate::Error> {
        self.start_session(
            &SessionOptions::default(),
            ChannelRequest::Subsystem { name: name.into() },
        )
        .await
    }

    /// Starts subsystem `name`, sends `hello` and waits for the first
    /// bytes of the subsystem. Fails with
    /// [`Error::SubsystemAborted`](crate::Error::SubsystemAborted) if the
    /// subsystem exits or closes the channel first.
    pub async fn subsystem_handshake<A: Into<String>>(
        &self,
        name: A,
        hello: &[u8],
    ) -> Result<(Channel<Msg>, Bytes), crate::Error> {
        let mut channel = self.channel_open_session().await?;
        let reply = channel
            .queue_request(true, ChannelRequest::Subsystem { name: name.into() })
            .await?;
        if let Some(reply) = reply {
            match wait_reply(reply).await {
                Ok(()) => {}
                Err(crate::Error::ChannelClosed) => {
                    let mut exit_status = None;
                    while let Ok(msg) = channel.receiver.try_recv() {
                        if let ChannelMsg::ExitStatus { exit_status: s } = msg {
                            exit_status = Some(s)
                        }
                    }
                    return Err(crate::Error::SubsystemAborted { exit_status });
                }
                Err(e) => return Err(e),
            }
        }
        if !hello.is_empty() {
            match channel.data(hello).await {
                Ok(()) | Err(crate::Error::ChannelClosed) => {}
                Err(e) => return Err(e),
            }
        }
        let mut exit_status = None;
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => return Ok((channel, data)),
                Some(ChannelMsg::ExitStatus { exit_status: s }) => exit_status = Some(s),
                Some(ChannelMsg::Close) | None => {
                    return Err(crate::Error::SubsystemAborted { exit_status })
                }
                Some(msg) => debug!("waiting for the subsystem: {msg:?}"),
            }
        }
    }

    /// Starts the `sftp` subsystem. `init` is the client's first SFTP
    /// packet; the server's first packet is returned with the channel.
    pub async fn sftp(&self, init: &[u8]) -> Result<(Channel<Msg>, Bytes), crate::Error> {
        self.subsystem_handshake("sftp", init).await
    }

    async fn global_request<T>(
        &self,
        request: GlobalRequest,
        response: GlobalRequestResponse,
        receiver: oneshot::Receiver<Result<T, crate::Error>>,
    ) -> Result<T, crate::Error> {
        self.send_msg(Msg::GlobalRequest { request, response })
            .await?;
        receiver.await.unwrap_or(Err(crate::Error::NoResponse))
    }

    /// Requests the server to listen on `address:port` and forward
    /// connections back. Returns the port the server bound, which
    /// matters when `port` is 0.
    pub async fn tcpip_forward<A: Into<String>>(
        &self,
        address: A,
        port: u32,
    ) -> Result<u32, crate::Error> {
        let address = address.into();
        let (reply, receiver) = oneshot::channel();
        self.global_request(
            GlobalRequest::TcpIpForward {
                address: address.clone(),
                port,
            },
            GlobalRequestResponse::TcpIpForward {
                address,
                port,
                reply,
            },
            receiver,
        )
        .await
    }

    pub async fn cancel_tcpip_forward<A: Into<String>>(
        &self,
        address: A,
        port: u32,
    ) -> Result<(), crate::Error> {
        let address = address.into();
        let (reply, receiver) = oneshot::channel();
        self.global_request(
            GlobalRequest::CancelTcpIpForward {
                address: address.clone(),
                port,
            },
            GlobalRequestResponse::CancelTcpIpForward {
                address,
                port,
                reply,
            },
            receiver,
        )
        .await
    }

    /// Sends a `keepalive@openssh.com` request and waits for the reply.
    pub async fn send_ping(&self) -> Result<(), crate::Error> {
        let (reply, receiver) = oneshot::channel();
        self.global_request(
            GlobalRequest::KeepAlive,
            GlobalRequestResponse::Ping(reply),
            receiver,
        )
        .await
    }

    /// Starts a key re-exchange and waits until the new keys are in use.
    /// Requests made meanwhile are sent afterwards.
    pub async fn rekey(&self) -> Result<(), crate::Error> {
        let (done, receiver) = oneshot::channel();
        self.send_msg(Msg::Rekey { done }).await?;
        receiver.await.unwrap_or(Err(crate::Error::NoResponse))
    }

    /// Sends a disconnect message.
    pub async fn disconnect(
        &self,
        reason: Disconnect,
        description: &str,
        language_tag: &str,
    ) -> Result<(), crate::Error> {
        self.send_msg(Msg::Disconnect {
            reason,
            description: description.into(),
            language_tag: language_tag.into(),
        })
        .await
    }

    /// Closes the connection. Every channel gets EOF and close, and
    /// every pending request fails with
    /// [`Error::NoResponse`](crate::Error::NoResponse).
    pub async fn end(&self) -> Result<(), crate::Error> {
        if self.is_closed() {
            return Ok(());
        }
        match self.disconnect(Disconnect::ByApplication, "", "").await {
            Err(crate::Error::SendError) => Ok(()),
            r => r,
        }
    }
}

impl<H: Handler> Future for Handle<H> {
    type Output = Result<(), H::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        match Future::poll(Pin::new(&mut self.join), cx) {
            Poll::Ready(r) => Poll::Ready(match r {
                Ok(Ok(x)) => Ok(x),
                Err(e) => Err(crate::Error::from(e).into()),
                Ok(Err(e)) => Err(e),
            }),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Runs the client side of `transport`: the initial key exchange, the
/// host key check, then the connection task. Returns a [`Handle`] to
/// the connection, on which authentication is the next step.
pub async fn connect_stream<H, T>(
    config: Arc<Config>,
    transport: T,
    handler: H,
) -> Result<Handle<H>, H::Error>
where
    H: Handler + Send + 'static,
    T: Transport,
{
    let (events, events_receiver) = unbounded_channel();
    let mut handle = connect_with_events(config, transport, handler, events).await?;
    handle.events = Some(events_receiver);
    Ok(handle)
}

async fn connect_with_events<H, T>(
    config: Arc<Config>,
    mut transport: T,
    mut handler: H,
    events: UnboundedSender<ConnectionEvent>,
) -> Result<Handle<H>, H::Error>
where
    H: Handler + Send + 'static,
    T: Transport,
{
    if config.maximum_packet_size > 65535 {
        error!(
            "Maximum packet size ({:?}) should not larger than a TCP packet (65535)",
            config.maximum_packet_size
        );
    }
    let fail = |e: &dyn std::fmt::Debug| {
        let _ = events.send(ConnectionEvent::Error(format!("{e:?}")));
        let _ = events.send(ConnectionEvent::Close);
    };
    let handshake = match transport
        .handshake(HandshakeParams::Client {
            preferred: config.preferred.key.to_vec(),
        })
        .await
    {
        Ok(handshake) => handshake,
        Err(e) => {
            fail(&e);
            return Err(e.into());
        }
    };
    let fingerprint = keys::host_key_fingerprint(&handshake.host_key, config.host_hash)?;
    debug!("server host key fingerprint: {fingerprint}");
    match handler
        .check_server_key(&handshake.host_key, &fingerprint)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            info!("server host key rejected");
            let _ = transport
                .send(Message::Disconnect {
                    reason: Disconnect::HostKeyNotVerifiable,
                    description: "Host key not verifiable".to_string(),
                    language_tag: String::new(),
                })
                .await;
            let _ = transport.close().await;
            fail(&crate::Error::UnknownKey);
            return Err(crate::Error::UnknownKey.into());
        }
        Err(e) => {
            let _ = transport.close().await;
            fail(&e);
            return Err(e);
        }
    }

    let (handle_sender, session_receiver) = channel(config.channel_buffer_size);
    let (session_sender, handle_receiver) = unbounded_channel();
    let (resolutions, resolutions_receiver) = unbounded_channel();
    let common = CommonSession::new(
        ChannelSettings {
            window_size: config.window_size,
            maximum_packet_size: config.maximum_packet_size,
            limits: config.limits.clone(),
            inactivity_timeout: config.inactivity_timeout,
        },
        &handshake,
        resolutions,
        events,
    );
    let session = Session::new(
        common,
        config,
        session_receiver,
        session_sender,
        resolutions_receiver,
    );
    let join = tokio::spawn(session.run(transport, handler));

    Ok(Handle {
        sender: handle_sender,
        receiver: handle_receiver,
        join,
        events: None,
    })
}

/// A client that authenticates with its configured credentials, and
/// replaces its session when connected again.
pub struct Client<H: Handler> {
    config: Arc<Config>,
    events: UnboundedSender<ConnectionEvent>,
    events_receiver: Option<UnboundedReceiver<ConnectionEvent>>,
    handle: Option<Handle<H>>,
}

impl<H: Handler> std::fmt::Debug for Client<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("handle", &self.handle)
            .finish()
    }
}

impl<H: Handler + Send + 'static> Client<H> {
    pub fn new(config: Arc<Config>) -> Self {
        let (events, events_receiver) = unbounded_channel();
        Client {
            config,
            events,
            events_receiver: Some(events_receiver),
            handle: None,
        }
    }

    /// Events of every session of this client, in order. Only the first
    /// call returns the receiver.
    pub fn events(&mut self) -> Option<UnboundedReceiver<ConnectionEvent>> {
        self.events_receiver.take()
    }

    /// Connects over `transport` and authenticates with
    /// [`Config::user`] and [`Config::methods`]. A session that is still
    /// running is ended first, and its `Close` event is emitted before
    /// the new session's `Ready`.
    pub async fn connect<T: Transport>(&mut self, transport: T, handler: H) -> Result<(), H::Error> {
        if let Some(previous) = self.handle.take() {
            debug!("already connected, ending the previous session");
            previous.end().await?;
            if let Err(e) = previous.await {
                debug!("previous session ended with {e:?}");
            }
        }
        let mut handle =
            connect_with_events(self.config.clone(), transport, handler, self.events.clone())
                .await?;
        if let Err(e) = handle
            .authenticate(&self.config.user, &self.config.methods)
            .await
        {
            handle.end().await?;
            if let Err(e) = (&mut handle).await {
                debug!("session ended with {e:?}");
            }
            return Err(e.into());
        }
        self.handle = Some(handle);
        Ok(())
    }

    /// The current session. Fails with
    /// [`Error::NotConnected`](crate::Error::NotConnected) before
    /// [`Client::connect`] or once the session ended.
    pub fn handle(&self) -> Result<&Handle<H>, crate::Error> {
        match self.handle {
            Some(ref handle) if !handle.is_closed() => Ok(handle),
            _ => Err(crate::Error::NotConnected),
        }
    }

    pub fn handle_mut(&mut self) -> Result<&mut Handle<H>, crate::Error> {
        match self.handle {
            Some(ref mut handle) if !handle.is_closed() => Ok(handle),
            _ => Err(crate::Error::NotConnected),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.handle().is_ok()
    }

    /// Ends the current session and waits for it to close.
    pub async fn end(&mut self) -> Result<(), H::Error> {
        match self.handle.take() {
            Some(handle) => {
                handle.end().await?;
                handle.await
            }
            None => Ok(()),
        }
    }
}

/// The configuration of clients.
#[derive(Debug)]
pub struct Config {
    /// The bytes and time limits before key re-exchange.
    pub limits: Limits,
    /// The initial size of a channel (used for flow control).
    pub window_size: u32,
    /// The maximal size of a single packet.
    pub maximum_packet_size: u32,
    /// Buffer size for each channel (a number of unprocessed messages to store before propagating backpressure to the TCP stream)
    pub channel_buffer_size: usize,
    /// Lists of preferred algorithms.
    pub preferred: negotiation::Preferred,
    /// Time after which the connection is garbage-collected.
    pub inactivity_timeout: Option<std::time::Duration>,
    /// Digest of the host key passed to [`Handler::check_server_key`].
    pub host_hash: FingerprintHash,
    /// User name used by [`Client::connect`].
    pub user: String,
    /// Credentials tried by [`Client::connect`], in order.
    pub methods: Vec<Method>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            limits: Limits::default(),
            window_size: 2097152,
            maximum_packet_size: 32768,
            channel_buffer_size: 100,
            preferred: Default::default(),
            inactivity_timeout: None,
            host_hash: FingerprintHash::default(),
            user: String::new(),
            methods: vec![Method::None],
        }
    }
}

/// A client handler. Note that messages can be received from the
/// server at any time during a session.
///
/// You must at the very least implement the `check_server_key` fn if
/// you want host keys checked: the default implementation accepts all
/// keys.
///
/// Note: this is an async trait. The trait functions return `impl Future`,
/// and you can simply define them as `async fn` instead.
#[cfg_attr(feature = "async-trait", async_trait::async_trait)]
pub trait Handler: Sized + Send {
    type Error: From<crate::Error> + Send + core::fmt::Debug;

    /// Called when the server sends us an authentication banner. This
    /// is usually meant to be shown to the user, see
    /// [RFC4252](https://tools.ietf.org/html/rfc4252#section-5.4) for
    /// more details.
    #[allow(unused_variables)]
    fn auth_banner(
        &mut self,
        banner: &str,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Called to check the server's public key, before any credential
    /// is sent. `fingerprint` is the lowercase hex digest of the key
    /// blob, with [`Config::host_hash`]. Returning `false` aborts the
    /// connection with [`Error::UnknownKey`](crate::Error::UnknownKey).
    #[allow(unused_variables)]
    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
        fingerprint: &str,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        async { Ok(true) }
    }

    /// Called when the server opens a channel for a connection to a
    /// port we asked it to forward with [`Handle::tcpip_forward`].
    /// Connections to ports we never registered are refused without
    /// calling this.
    #[allow(unused_variables)]
    fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Called when the server opens an X11 channel. The default
    /// implementation refuses it.
    #[allow(unused_variables)]
    fn server_channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        originator_address: &str,
        originator_port: u32,
        decision: ChannelOpenDecision,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Called when the server opens an agent forwarding channel. The
    /// default implementation refuses it.
    #[allow(unused_variables)]
    fn server_channel_open_agent_forward(
        &mut self,
        channel: Channel<Msg>,
        decision: ChannelOpenDecision,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Called when the server sends us data. The `extended_code`
    /// parameter is a stream identifier, `None` is usually the
    /// standard output, and `Some(1)` is the standard error. See
    /// [RFC4254](https://tools.ietf.org/html/rfc4254#section-5.2).
    #[allow(unused_variables)]
    fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Called when the server sends us data on a numbered stream.
    #[allow(unused_variables)]
    fn extended_data(
        &mut self,
        channel: ChannelId,
        ext: u32,
        data: &[u8],
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Called when the server sent EOF to a channel.
    #[allow(unused_variables)]
    fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Called when the channel is closed.
    #[allow(unused_variables)]
    fn channel_close(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// The remote process has exited, with the given exit status.
    #[allow(unused_variables)]
    fn exit_status(
        &mut self,
        channel: ChannelId,
        exit_status: u32,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// The remote process exited upon receiving a signal.
    #[allow(unused_variables)]
    fn exit_signal(
        &mut self,
        channel: ChannelId,
        signal_name: Sig,
        core_dumped: bool,
        error_message: &str,
        lang_tag: &str,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Called when we consumed data, to decide the window granted back
    /// to the server. `window` is [`Config::window_size`].
    #[allow(unused_variables)]
    fn adjust_window(&mut self, channel: ChannelId, window: u32) -> u32 {
        window
    }
}
