use std::sync::Arc;

use rand::RngCore;
use rand_core::OsRng;
use sshmux::server::{self, Msg, Session};
use sshmux::transport::MemoryTransport;
use sshmux::{auth::AuthAttempt, client, AuthDecision, Channel, ChannelMsg, ChannelOpenDecision};
use ssh_key::PrivateKey;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const WINDOW_SIZE: u32 = 8 * 2048;
pub const PACKET_SIZE: u32 = 4096;

#[tokio::test]
async fn test_echo_through_small_windows() -> Result<(), anyhow::Error> {
    let _ = env_logger::try_init();

    let data = data();
    let (client_end, server_end) = MemoryTransport::pair();

    let mut server_config = server::Config {
        window_size: WINDOW_SIZE,
        maximum_packet_size: PACKET_SIZE,
        inactivity_timeout: None,
        ..Default::default()
    };
    server_config
        .keys
        .push(PrivateKey::random(&mut OsRng, ssh_key::Algorithm::Ed25519)?);
    let server = tokio::spawn(server::run_stream(
        Arc::new(server_config),
        server_end,
        Echo,
    ));

    let client_config = client::Config {
        window_size: WINDOW_SIZE,
        maximum_packet_size: PACKET_SIZE,
        ..Default::default()
    };
    let mut session = client::connect_stream(Arc::new(client_config), client_end, Client).await?;
    let _server = server.await??;
    assert!(session.authenticate_password("user", "password").await?.success());

    let mut channel = session.channel_open_session().await?;
    let mut writer = channel.make_writer();
    let write = async {
        writer.write_all(&data).await?;
        writer.shutdown().await?;
        Ok::<_, std::io::Error>(())
    };
    let mut echoed = Vec::new();
    let mut reader = channel.make_reader();
    let read = reader.read_to_end(&mut echoed);
    let (written, read) = tokio::join!(write, read);
    written?;
    read?;

    assert_eq!(echoed.len(), data.len());
    assert!(echoed == data, "echoed data differs");
    session.end().await?;
    session.await?;
    Ok(())
}

fn data() -> Vec<u8> {
    let mut data = vec![0u8; 2 * 1024 * 1024];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

struct Client;

impl client::Handler for Client {
    type Error = sshmux::Error;
}

struct Echo;

impl server::Handler for Echo {
    type Error = sshmux::Error;

    async fn auth_attempt(
        &mut self,
        _: AuthAttempt,
        decision: AuthDecision,
        _: &mut Session,
    ) -> Result<(), Self::Error> {
        decision.accept();
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        mut channel: Channel<Msg>,
        decision: ChannelOpenDecision,
        _: &mut Session,
    ) -> Result<(), Self::Error> {
        decision.accept();
        tokio::spawn(async move {
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { data } => {
                        if channel.data(&data[..]).await.is_err() {
                            break;
                        }
                    }
                    ChannelMsg::Eof => {
                        let _ = channel.eof().await;
                        let _ = channel.close().await;
                    }
                    ChannelMsg::Close => break,
                    _ => {}
                }
            }
        });
        Ok(())
    }
}
