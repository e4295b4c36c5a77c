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

//! # Writing servers
//!
//! There are two ways of accepting connections:
//! * implement the [Server](server::Server) trait and let [run_on](server::run_on)
//!   handle a stream of incoming transports
//! * accept transports yourself and pass them to [run_stream](server::run_stream)
//!
//! In both cases, you'll first need to implement the [Handler](server::Handler) trait -
//! this is where you'll handle various events. Authentication attempts,
//! channel opens and channel requests come with decision tokens, which
//! can be kept and resolved later: the connection keeps running
//! meanwhile, and replies still reach the client in order.
//!
//! Here is an example server, which accepts every password and echoes
//! back what it receives on session channels:
//!
//! ```no_run
//! use std::sync::Arc;
//! use sshmux::auth::{AuthAttempt, Credentials};
//! use sshmux::server::{self, Msg, Session};
//! use sshmux::transport::MemoryTransport;
//! use sshmux::{AuthDecision, Channel, ChannelId, ChannelOpenDecision};
//!
//! #[derive(Clone)]
//! struct Echo;
//!
//! impl server::Server for Echo {
//!     type Handler = Self;
//!     fn new_client(&mut self) -> Self {
//!         self.clone()
//!     }
//! }
//!
//! impl server::Handler for Echo {
//!     type Error = sshmux::Error;
//!
//!     async fn auth_attempt(
//!         &mut self,
//!         attempt: AuthAttempt,
//!         decision: AuthDecision,
//!         _: &mut Session,
//!     ) -> Result<(), Self::Error> {
//!         if let Credentials::Password { .. } = attempt.credentials {
//!             decision.accept()
//!         }
//!         Ok(())
//!     }
//!
//!     async fn channel_open_session(
//!         &mut self,
//!         _: Channel<Msg>,
//!         decision: ChannelOpenDecision,
//!         _: &mut Session,
//!     ) -> Result<(), Self::Error> {
//!         decision.accept();
//!         Ok(())
//!     }
//!
//!     async fn data(
//!         &mut self,
//!         channel: ChannelId,
//!         data: &[u8],
//!         session: &mut Session,
//!     ) -> Result<(), Self::Error> {
//!         session.data(channel, bytes::Bytes::copy_from_slice(data));
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut config = server::Config::default();
//!     config.keys.push(
//!         ssh_key::PrivateKey::random(&mut rand_core::OsRng, ssh_key::Algorithm::Ed25519)
//!             .unwrap(),
//!     );
//!     let (_client_end, server_end) = MemoryTransport::pair();
//!     let incoming = futures::stream::iter(vec![server_end]);
//!     server::run_on(Arc::new(config), incoming, Echo).await.unwrap();
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use log::{debug, error, info};
use ssh_key::PrivateKey;
use tokio::sync::mpsc::{channel, unbounded_channel};
use tokio::task::JoinHandle;

use crate::auth::{AuthAttempt, MethodSet};
use crate::keys::Verifier;
use crate::message::GlobalRequest;
use crate::session::{ChannelSettings, CommonSession, ConnectionEvent};
use crate::transport::{Handshake, HandshakeParams, Transport};
use crate::{
    AuthDecision, Channel, ChannelId, ChannelOpenDecision, GlobalDecision, Limits,
    RequestDecision, SessionRequest,
};

mod session;
pub use self::session::*;

/// Configuration of a server.
#[derive(Debug)]
pub struct Config {
    /// Authentication methods proposed to the client.
    pub methods: MethodSet,
    /// The authentication banner, usually a warning message shown to the client.
    pub auth_banner: Option<String>,
    /// Maximal number of rejected authentication attempts (`none`
    /// excluded) before the connection is closed.
    pub max_auth_attempts: usize,
    /// Delay before an authentication failure is reported. Other
    /// messages keep being processed meanwhile.
    pub auth_rejection_time: std::time::Duration,
    /// The server's keys. The first key in the client's preference order will be chosen.
    pub keys: Vec<PrivateKey>,
    /// Signature checks of `publickey` and `hostbased` attempts. The
    /// `ssh-key` verifier is used when unset.
    pub verifier: Option<Arc<dyn Verifier>>,
    /// The initial size of a channel (used for flow control).
    pub window_size: u32,
    /// The maximal size of a single packet.
    pub maximum_packet_size: u32,
    /// Buffer size of each channel and of the session's mailbox.
    pub channel_buffer_size: usize,
    /// Time after which an idle connection is closed.
    pub inactivity_timeout: Option<std::time::Duration>,
    /// Time allowed for the initial key exchange.
    pub handshake_timeout: Option<std::time::Duration>,
    /// The bytes and time limits before key re-exchange.
    pub limits: Limits,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            methods: MethodSet::all(),
            auth_banner: None,
            max_auth_attempts: 10,
            auth_rejection_time: std::time::Duration::from_secs(1),
            keys: Vec::new(),
            verifier: None,
            window_size: 2097152,
            maximum_packet_size: 32768,
            channel_buffer_size: 100,
            inactivity_timeout: Some(std::time::Duration::from_secs(600)),
            handshake_timeout: Some(std::time::Duration::from_secs(30)),
            limits: Limits::default(),
        }
    }
}

/// Server handler. Each client will have their own handler.
///
/// Note: this is an async trait. The trait functions return `impl Future`,
/// and you can simply write `async fn` in an impl.
#[cfg_attr(feature = "async-trait", async_trait::async_trait)]
pub trait Handler: Sized {
    type Error: From<crate::Error> + Send + core::fmt::Debug;

    /// An authentication attempt, once its signature (if any) checked
    /// out. Dropping `decision` rejects the attempt.
    ///
    /// Accepting a [query](AuthAttempt::is_query) tells the client the
    /// key is acceptable, without authenticating it.
    #[allow(unused_variables)]
    fn auth_attempt(
        &mut self,
        attempt: AuthAttempt,
        decision: AuthDecision,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Called when authentication succeeds for a session.
    #[allow(unused_variables)]
    fn auth_succeeded(
        &mut self,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Called when a new session channel is requested by the client.
    /// Dropping `decision` refuses the channel.
    #[allow(unused_variables)]
    fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        decision: ChannelOpenDecision,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Called when a new TCP/IP is created.
    /// A target that cannot be reached is refused with
    /// [`ChannelOpenFailure::ConnectFailed`](crate::ChannelOpenFailure::ConnectFailed).
    #[allow(unused_variables, clippy::too_many_arguments)]
    fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        decision: ChannelOpenDecision,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// A sub-request on a session channel (`pty-req`, `env`, `exec`...).
    ///
    /// The default implementation hands it to the [`Channel`] with
    /// [`Session::deliver_request`], where it arrives as
    /// [`ChannelMsg::Request`](crate::ChannelMsg::Request).
    #[allow(unused_variables)]
    fn session_request(
        &mut self,
        channel: ChannelId,
        request: SessionRequest,
        decision: RequestDecision,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        session.deliver_request(channel, request, decision);
        async { Ok(()) }
    }

    /// A `tcpip-forward` or `cancel-tcpip-forward` request. Dropping
    /// `decision` rejects it.
    #[allow(unused_variables)]
    fn global_request(
        &mut self,
        request: GlobalRequest,
        decision: GlobalDecision,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Called when a data packet is received. Replies can be sent
    /// with [`Session::data`].
    #[allow(unused_variables)]
    fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Called when an extended data packet is received. Code 1 means
    /// that this packet comes from stderr, other codes are not
    /// defined (see
    /// [RFC4254](https://tools.ietf.org/html/rfc4254#section-5.2)).
    #[allow(unused_variables)]
    fn extended_data(
        &mut self,
        channel: ChannelId,
        code: u32,
        data: &[u8],
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Called when the client sends EOF to a channel.
    #[allow(unused_variables)]
    fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Called when the client closes a channel.
    #[allow(unused_variables)]
    fn channel_close(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// The window granted back to the client once data was consumed.
    #[allow(unused_variables)]
    fn adjust_window(&mut self, channel: ChannelId, window: u32) -> u32 {
        window
    }
}

/// Trait used to create new handlers when clients connect.
pub trait Server {
    /// The type of handlers.
    type Handler: Handler + Send + 'static;
    /// Called when a new client connects.
    fn new_client(&mut self) -> Self::Handler;
    /// Called when an active connection fails.
    #[allow(unused_variables)]
    fn handle_session_error(&mut self, error: <Self::Handler as Handler>::Error) {}
}

/// Runs a server on every transport yielded by `incoming`, each one in
/// its own task. Returns once `incoming` is exhausted and every
/// connection has ended.
pub async fn run_on<S, T, I>(config: Arc<Config>, incoming: I, mut server: S) -> Result<(), crate::Error>
where
    S: Server + Send,
    T: Transport,
    I: Stream<Item = T> + Send,
    <S::Handler as Handler>::Error: Send + 'static,
{
    check_config(&config)?;
    let mut incoming = std::pin::pin!(incoming);
    let (error_tx, mut error_rx) = unbounded_channel();

    #[allow(clippy::panic)] // false positive in select! macro
    loop {
        tokio::select! {
            transport = incoming.next() => {
                let Some(transport) = transport else {
                    debug!("no more incoming transports");
                    break
                };
                let config = config.clone();
                let handler = server.new_client();
                let error_tx = error_tx.clone();
                tokio::spawn(async move {
                    let result = match run_stream(config, transport, handler).await {
                        Ok(session) => session.await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        debug!("connection closed with error: {e:?}");
                        let _ = error_tx.send(e);
                    }
                });
            }
            Some(error) = error_rx.recv() => {
                server.handle_session_error(error);
            }
        }
    }
    drop(error_tx);
    while let Some(error) = error_rx.recv().await {
        server.handle_session_error(error);
    }
    Ok(())
}

fn check_config(config: &Config) -> Result<(), crate::Error> {
    if config.keys.is_empty() {
        return Err(crate::Error::InvalidConfig("no host key".into()));
    }
    if config.maximum_packet_size > 65535 {
        error!(
            "Maximum packet size ({:?}) should not larger than a TCP packet (65535)",
            config.maximum_packet_size
        );
    }
    Ok(())
}

/// An active server session returned by [run_stream].
///
/// Implements [Future] and needs to be awaited to allow the session to run.
pub struct RunningSession<H: Handler> {
    handle: Handle,
    events: Option<tokio::sync::mpsc::UnboundedReceiver<ConnectionEvent>>,
    join: JoinHandle<Result<(), H::Error>>,
}

impl<H: Handler> std::fmt::Debug for RunningSession<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningSession")
            .field("handle", &self.handle)
            .finish()
    }
}

impl<H: Handler> RunningSession<H> {
    /// Returns a new handle for the session.
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Connection events of this session. Only the first call returns
    /// the receiver.
    pub fn take_events(
        &mut self,
    ) -> Option<tokio::sync::mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events.take()
    }
}

impl<H: Handler> Future for RunningSession<H> {
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

async fn handshake<T: Transport>(config: &Config, transport: &mut T) -> Result<Handshake, crate::Error> {
    check_config(config)?;
    let params = HandshakeParams::Server {
        host_keys: config.keys.iter().map(|k| k.public_key().clone()).collect(),
    };
    match config.handshake_timeout {
        Some(t) => tokio::time::timeout(t, transport.handshake(params)).await?,
        None => transport.handshake(params).await,
    }
}

/// Run a single connection to completion.
pub async fn run_stream<H, T>(
    config: Arc<Config>,
    mut transport: T,
    handler: H,
) -> Result<RunningSession<H>, H::Error>
where
    H: Handler + Send + 'static,
    T: Transport,
{
    let handshake = match handshake(&config, &mut transport).await {
        Ok(handshake) => handshake,
        Err(e) => {
            debug!("handshake failed: {e:?}");
            let _ = transport.close().await;
            return Err(e.into());
        }
    };
    info!("handshake done, host key {}", handshake.names.key.as_str());

    let (sender, receiver) = channel(config.channel_buffer_size.max(1));
    let (resolutions, resolutions_receiver) = unbounded_channel();
    let (events, events_receiver) = unbounded_channel();
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
    let handle = Handle { sender };
    let session = Session::new(common, config, handle.clone(), receiver, resolutions_receiver);
    let join = tokio::spawn(session.run(transport, handler));

    debug!("session is running");
    Ok(RunningSession {
        handle,
        events: Some(events_receiver),
        join,
    })
}
