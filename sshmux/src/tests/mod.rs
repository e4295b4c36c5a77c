#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)] // Allow unwraps, expects and panics in the test suite

mod auth;
mod global;
mod lifecycle;

use std::sync::Arc;
use std::time::Duration;

use rand_core::OsRng;
use ssh_key::{Algorithm, PrivateKey};

use crate::message::{AuthRequestMethod, Message};
use crate::transport::{HandshakeParams, MemoryTransport, Transport};
use crate::{client, server};

fn server_config() -> server::Config {
    let mut config = server::Config::default();
    config
        .keys
        .push(PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap());
    config.auth_rejection_time = Duration::from_millis(1);
    config.inactivity_timeout = None;
    config
}

/// Runs a server over one end of a [`MemoryTransport`] pair and
/// connects a client to the other end.
async fn connect<CH, SH>(
    client_config: client::Config,
    server_config: server::Config,
    client_handler: CH,
    server_handler: SH,
) -> (client::Handle<CH>, server::RunningSession<SH>)
where
    CH: client::Handler + Send + 'static,
    SH: server::Handler + Send + 'static,
{
    let _ = env_logger::try_init();
    let (client_end, server_end) = MemoryTransport::pair();
    let server = tokio::spawn(server::run_stream(
        Arc::new(server_config),
        server_end,
        server_handler,
    ));
    let client = client::connect_stream(Arc::new(client_config), client_end, client_handler)
        .await
        .unwrap();
    let server = server.await.unwrap().unwrap();
    (client, server)
}

/// A client side driven by hand, for observing what the server puts on
/// the wire.
struct ScriptedClient {
    transport: MemoryTransport,
}

impl ScriptedClient {
    async fn connect<SH>(config: server::Config, handler: SH) -> (Self, server::RunningSession<SH>)
    where
        SH: server::Handler + Send + 'static,
    {
        let _ = env_logger::try_init();
        let (mut client_end, server_end) = MemoryTransport::pair();
        let server = tokio::spawn(server::run_stream(Arc::new(config), server_end, handler));
        client_end
            .handshake(HandshakeParams::Client {
                preferred: vec![Algorithm::Ed25519],
            })
            .await
            .unwrap();
        let server = server.await.unwrap().unwrap();
        (
            ScriptedClient {
                transport: client_end,
            },
            server,
        )
    }

    async fn send(&mut self, msg: Message) {
        self.transport.send(msg).await.unwrap()
    }

    async fn recv(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(5), self.transport.recv())
            .await
            .expect("timed out waiting for the server")
            .unwrap()
            .expect("transport closed")
    }

    /// Nothing arrives within `delay`.
    async fn assert_silent(&mut self, delay: Duration) {
        if let Ok(msg) = tokio::time::timeout(delay, self.transport.recv()).await {
            panic!("unexpected {msg:?}")
        }
    }

    async fn authenticate(&mut self, method: AuthRequestMethod) -> Message {
        self.send(Message::ServiceRequest {
            name: "ssh-userauth".to_string(),
        })
        .await;
        assert!(matches!(self.recv().await, Message::ServiceAccept { .. }));
        self.send(Message::UserauthRequest {
            user: "alice".to_string(),
            service: "ssh-connection".to_string(),
            method,
        })
        .await;
        self.recv().await
    }
}

/// A server side driven by hand, for observing what the client engine
/// puts on the wire.
struct ScriptedServer {
    transport: MemoryTransport,
}

impl ScriptedServer {
    /// Connects a client and lets it authenticate with `none`.
    async fn connect<CH>(config: client::Config, handler: CH) -> (Self, client::Handle<CH>)
    where
        CH: client::Handler + Send + 'static,
    {
        let _ = env_logger::try_init();
        let (client_end, mut server_end) = MemoryTransport::pair();
        let client = tokio::spawn(client::connect_stream(Arc::new(config), client_end, handler));
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        server_end
            .handshake(HandshakeParams::Server {
                host_keys: vec![key.public_key().clone()],
            })
            .await
            .unwrap();
        let mut client = client.await.unwrap().unwrap();
        let mut server = ScriptedServer {
            transport: server_end,
        };
        assert!(matches!(server.recv().await, Message::ServiceRequest { .. }));
        server
            .send(Message::ServiceAccept {
                name: "ssh-userauth".to_string(),
            })
            .await;
        let (result, _) = tokio::join!(client.authenticate_none("alice"), async {
            assert!(matches!(server.recv().await, Message::UserauthRequest { .. }));
            server.send(Message::UserauthSuccess).await;
        });
        assert!(result.unwrap().success());
        (server, client)
    }

    async fn send(&mut self, msg: Message) {
        self.transport.send(msg).await.unwrap()
    }

    async fn recv(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(5), self.transport.recv())
            .await
            .expect("timed out waiting for the client")
            .unwrap()
            .expect("transport closed")
    }

    async fn assert_silent(&mut self, delay: Duration) {
        if let Ok(msg) = tokio::time::timeout(delay, self.transport.recv()).await {
            panic!("unexpected {msg:?}")
        }
    }

    /// Confirms the next channel the client opens, with the given
    /// window. Returns the client's channel number.
    async fn confirm_open(&mut self, sender_channel: u32, window: u32) -> u32 {
        match self.recv().await {
            Message::ChannelOpen {
                sender_channel: client_channel,
                ..
            } => {
                self.send(Message::ChannelOpenConfirmation {
                    recipient_channel: client_channel,
                    sender_channel,
                    initial_window_size: window,
                    maximum_packet_size: 32768,
                })
                .await;
                client_channel
            }
            msg => panic!("expected a channel open, got {msg:?}"),
        }
    }
}
