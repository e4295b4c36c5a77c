//! The boundary between the connection layer and the SSH transport.
//!
//! A [`Transport`] owns everything below the connection protocol: the
//! binary packet format, encryption, compression and the cryptographic
//! part of key exchanges. It hands decoded [`Message`]s to the engine
//! and sends the ones the engine produces.
//!
//! [`MemoryTransport`] connects a client and a server inside one process.

use std::future::Future;

use bytes::Bytes;
use log::{debug, trace};
use rand::RngCore;
use ssh_key::{Algorithm, PublicKey};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::message::Message;
use crate::negotiation::{self, Names};
use crate::Error;

/// What each side brings to the initial key exchange.
#[derive(Debug, Clone)]
pub enum HandshakeParams {
    Client {
        /// Host key algorithms, most preferred first.
        preferred: Vec<Algorithm>,
    },
    Server {
        host_keys: Vec<PublicKey>,
    },
}

/// Result of the initial key exchange.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub session_id: Bytes,
    /// The server's host key.
    pub host_key: PublicKey,
    pub names: Names,
}

/// An established, encrypted SSH transport.
#[cfg_attr(feature = "async-trait", async_trait::async_trait)]
pub trait Transport: Send + 'static {
    /// Runs the initial key exchange.
    fn handshake(
        &mut self,
        params: HandshakeParams,
    ) -> impl Future<Output = Result<Handshake, Error>> + Send;

    /// Queues one message for sending.
    fn send(&mut self, msg: Message) -> impl Future<Output = Result<(), Error>> + Send;

    /// Next message from the peer, `None` once the peer is gone.
    ///
    /// Must be cancel safe: the engine polls it in a `select!`.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Message>, Error>> + Send;

    /// Both `NEWKEYS` were exchanged: switch to the keys of the last
    /// key exchange.
    fn new_keys(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Closes the transport. Further sends fail.
    fn close(&mut self) -> impl Future<Output = Result<(), Error>> + Send;
}

#[derive(Debug)]
enum Frame {
    ClientHello { preferred: Vec<Algorithm> },
    ServerHello { handshake: Handshake },
    Packet(Message),
}

/// An in-process [`Transport`]: one end of a pair created by [`MemoryTransport::pair`].
///
/// Messages cross unchanged; key exchanges only bump a counter.
#[derive(Debug)]
pub struct MemoryTransport {
    sender: Option<UnboundedSender<Frame>>,
    receiver: UnboundedReceiver<Frame>,
    key_epoch: u64,
    sent: u64,
}

impl MemoryTransport {
    /// Two connected ends.
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (a_tx, a_rx) = unbounded_channel();
        let (b_tx, b_rx) = unbounded_channel();
        (
            MemoryTransport::new(Some(a_tx), b_rx),
            MemoryTransport::new(Some(b_tx), a_rx),
        )
    }

    /// A transport whose peer never existed.
    pub fn detached() -> MemoryTransport {
        let (_, receiver) = unbounded_channel();
        MemoryTransport::new(None, receiver)
    }

    fn new(sender: Option<UnboundedSender<Frame>>, receiver: UnboundedReceiver<Frame>) -> Self {
        MemoryTransport {
            sender,
            receiver,
            key_epoch: 0,
            sent: 0,
        }
    }

    /// Number of completed key exchanges after the initial one.
    pub fn key_epoch(&self) -> u64 {
        self.key_epoch
    }

    /// Number of messages sent so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    fn send_frame(&mut self, frame: Frame) -> Result<(), Error> {
        match self.sender {
            Some(ref sender) => sender.send(frame).map_err(|_| Error::HUP),
            None => Err(Error::HUP),
        }
    }

    async fn recv_frame(&mut self) -> Result<Frame, Error> {
        self.receiver.recv().await.ok_or(Error::HUP)
    }
}

#[cfg_attr(feature = "async-trait", async_trait::async_trait)]
impl Transport for MemoryTransport {
    #[allow(clippy::manual_async_fn)]
    fn handshake(
        &mut self,
        params: HandshakeParams,
    ) -> impl Future<Output = Result<Handshake, Error>> + Send {
        async move {
            match params {
                HandshakeParams::Client { preferred } => {
                    self.send_frame(Frame::ClientHello { preferred })?;
                    match self.recv_frame().await? {
                        Frame::ServerHello { handshake } => Ok(handshake),
                        frame => {
                            debug!("unexpected frame during handshake: {frame:?}");
                            Err(Error::Kex)
                        }
                    }
                }
                HandshakeParams::Server { host_keys } => {
                    let preferred = match self.recv_frame().await? {
                        Frame::ClientHello { preferred } => preferred,
                        frame => {
                            debug!("unexpected frame during handshake: {frame:?}");
                            return Err(Error::Kex);
                        }
                    };
                    let (key, host_key) = negotiation::select_host_key(&preferred, &host_keys)?;
                    let mut session_id = [0; 32];
                    rand::thread_rng().fill_bytes(&mut session_id);
                    let handshake = Handshake {
                        session_id: Bytes::copy_from_slice(&session_id),
                        host_key,
                        names: Names {
                            kex: "none".to_string(),
                            key,
                            cipher: "none".to_string(),
                            mac: "none".to_string(),
                            compression: "none".to_string(),
                        },
                    };
                    self.send_frame(Frame::ServerHello {
                        handshake: handshake.clone(),
                    })?;
                    Ok(handshake)
                }
            }
        }
    }

    #[allow(clippy::manual_async_fn)]
    fn send(&mut self, msg: Message) -> impl Future<Output = Result<(), Error>> + Send {
        async move {
            trace!("memory transport: sending {msg:?}");
            self.send_frame(Frame::Packet(msg))?;
            self.sent += 1;
            Ok(())
        }
    }

    #[allow(clippy::manual_async_fn)]
    fn recv(&mut self) -> impl Future<Output = Result<Option<Message>, Error>> + Send {
        async move {
            match self.receiver.recv().await {
                Some(Frame::Packet(msg)) => Ok(Some(msg)),
                Some(frame) => {
                    debug!("unexpected frame after handshake: {frame:?}");
                    Err(Error::Inconsistent)
                }
                None => Ok(None),
            }
        }
    }

    fn new_keys(&mut self) -> Result<(), Error> {
        self.key_epoch += 1;
        Ok(())
    }

    #[allow(clippy::manual_async_fn)]
    fn close(&mut self) -> impl Future<Output = Result<(), Error>> + Send {
        async move {
            self.sender = None;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;
    use ssh_key::PrivateKey;

    use super::*;

    #[tokio::test]
    async fn pair_handshake_agrees() {
        let (mut client, mut server) = MemoryTransport::pair();
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let host_keys = vec![key.public_key().clone()];
        let server = tokio::spawn(async move {
            let hs = server
                .handshake(HandshakeParams::Server { host_keys })
                .await
                .unwrap();
            (server, hs)
        });
        let hs = client
            .handshake(HandshakeParams::Client {
                preferred: vec![Algorithm::Ed25519],
            })
            .await
            .unwrap();
        let (mut server, server_hs) = server.await.unwrap();
        assert_eq!(hs.session_id, server_hs.session_id);
        assert_eq!(hs.session_id.len(), 32);
        assert_eq!(&hs.host_key, key.public_key());

        client.send(Message::Ignore).await.unwrap();
        assert!(matches!(server.recv().await, Ok(Some(Message::Ignore))));
        client.close().await.unwrap();
        assert!(client.send(Message::Ignore).await.is_err());
        assert!(matches!(server.recv().await, Ok(None)));
    }

    #[tokio::test]
    async fn detached_fails_cleanly() {
        let mut transport = MemoryTransport::detached();
        let r = transport
            .handshake(HandshakeParams::Client {
                preferred: vec![Algorithm::Ed25519],
            })
            .await;
        assert!(matches!(r, Err(Error::HUP)));
        assert!(matches!(transport.recv().await, Ok(None)));
    }
}
