use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use rand_core::OsRng;
use sshmux::auth::AuthAttempt;
use sshmux::server::{self, Msg, Session};
use sshmux::transport::MemoryTransport;
use sshmux::*;
use ssh_key::PrivateKey;
use tokio::sync::Mutex;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .init();

    let mut config = server::Config {
        inactivity_timeout: Some(std::time::Duration::from_secs(3600)),
        auth_rejection_time: std::time::Duration::from_secs(3),
        ..Default::default()
    };
    config
        .keys
        .push(PrivateKey::random(&mut OsRng, ssh_key::Algorithm::Ed25519)?);
    let config = Arc::new(config);
    let sh = Server {
        clients: Arc::new(Mutex::new(HashMap::new())),
        id: 0,
    };

    let (alice_end, alice_server) = MemoryTransport::pair();
    let (bob_end, bob_server) = MemoryTransport::pair();
    let incoming = futures::stream::iter(vec![alice_server, bob_server]);
    let server = tokio::spawn(server::run_on(config, incoming, sh));

    let alice = join("alice", alice_end).await?;
    let bob = join("bob", bob_end).await?;
    let mut bob_channel = bob.channel_open_session().await?;
    let alice_channel = alice.channel_open_session().await?;

    alice_channel.data(&b"hello everyone"[..]).await?;
    while let Some(msg) = bob_channel.wait().await {
        if let ChannelMsg::Data { data } = msg {
            print!("bob received: {}", String::from_utf8_lossy(&data));
            break;
        }
    }

    alice.end().await?;
    bob.end().await?;
    alice.await?;
    bob.await?;
    server.await??;
    Ok(())
}

struct Client;

impl client::Handler for Client {
    type Error = sshmux::Error;
}

async fn join(name: &str, transport: MemoryTransport) -> anyhow::Result<client::Handle<Client>> {
    let mut session =
        client::connect_stream(Arc::new(client::Config::default()), transport, Client).await?;
    let auth = session.authenticate_password(name, "chat").await?;
    if !auth.success() {
        anyhow::bail!("{name} was not let in");
    }
    Ok(session)
}

#[derive(Clone)]
struct Server {
    clients: Arc<Mutex<HashMap<(usize, ChannelId), server::Handle>>>,
    id: usize,
}

impl Server {
    async fn post(&mut self, data: Bytes) {
        let mut clients = self.clients.lock().await;
        for ((id, channel), ref mut s) in clients.iter_mut() {
            if *id != self.id {
                let _ = s.data(*channel, data.clone()).await;
            }
        }
    }
}

impl server::Server for Server {
    type Handler = Self;
    fn new_client(&mut self) -> Self {
        let s = self.clone();
        self.id += 1;
        s
    }
}

impl server::Handler for Server {
    type Error = sshmux::Error;

    async fn auth_attempt(
        &mut self,
        attempt: AuthAttempt,
        decision: AuthDecision,
        _: &mut Session,
    ) -> Result<(), Self::Error> {
        if attempt.method() == MethodKind::Password {
            decision.accept();
        }
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        decision: ChannelOpenDecision,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        {
            let mut clients = self.clients.lock().await;
            clients.insert((self.id, channel.id()), session.handle());
        }
        decision.accept();
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let data = Bytes::from(format!("Got data: {}\r\n", String::from_utf8_lossy(data)));
        self.post(data.clone()).await;
        session.data(channel, data);
        Ok(())
    }
}
