use std::sync::Arc;

use rand_core::OsRng;
use sshmux::auth::{AuthAttempt, Credentials, Method};
use sshmux::server::{self, Session};
use sshmux::transport::MemoryTransport;
use sshmux::{client, AuthDecision, ConnectionEvent};
use ssh_key::PrivateKey;

struct Client;

impl client::Handler for Client {
    type Error = sshmux::Error;
}

struct Passwords;

impl server::Handler for Passwords {
    type Error = sshmux::Error;

    async fn auth_attempt(
        &mut self,
        attempt: AuthAttempt,
        decision: AuthDecision,
        _: &mut Session,
    ) -> Result<(), Self::Error> {
        match attempt.credentials {
            Credentials::Password { ref password } if password == "correct horse" => {
                decision.accept()
            }
            _ => decision.reject(),
        }
        Ok(())
    }
}

fn serve() -> MemoryTransport {
    let (client_end, server_end) = MemoryTransport::pair();
    let mut config = server::Config {
        auth_rejection_time: std::time::Duration::from_millis(1),
        ..Default::default()
    };
    config
        .keys
        .push(PrivateKey::random(&mut OsRng, ssh_key::Algorithm::Ed25519).unwrap());
    tokio::spawn(async move {
        let session = server::run_stream(Arc::new(config), server_end, Passwords).await?;
        session.await
    });
    client_end
}

fn config(password: &str) -> client::Config {
    client::Config {
        user: "user".to_string(),
        methods: vec![
            Method::None,
            Method::Password {
                password: password.to_string(),
            },
        ],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_connect_twice() -> Result<(), anyhow::Error> {
    let _ = env_logger::try_init();

    let mut client = client::Client::new(Arc::new(config("correct horse")));
    let mut events = client.events().unwrap();
    assert!(client.events().is_none());
    assert!(matches!(
        client.handle(),
        Err(sshmux::Error::NotConnected)
    ));

    client.connect(serve(), Client).await?;
    assert!(client.is_connected());
    client.handle()?.send_ping().await?;

    client.connect(serve(), Client).await?;
    client.handle()?.send_ping().await?;

    assert_eq!(events.recv().await, Some(ConnectionEvent::Ready));
    assert_eq!(events.recv().await, Some(ConnectionEvent::Close));
    assert_eq!(events.recv().await, Some(ConnectionEvent::Ready));

    client.end().await?;
    assert_eq!(events.recv().await, Some(ConnectionEvent::Close));
    assert!(matches!(
        client.handle(),
        Err(sshmux::Error::NotConnected)
    ));
    Ok(())
}

#[tokio::test]
async fn test_connect_with_wrong_password() -> Result<(), anyhow::Error> {
    let _ = env_logger::try_init();

    let mut client = client::Client::new(Arc::new(config("wrong")));
    let mut events = client.events().unwrap();
    let result = client.connect(serve(), Client).await;
    assert!(matches!(result, Err(sshmux::Error::AuthFailed)));
    assert!(!client.is_connected());
    assert_eq!(events.recv().await, Some(ConnectionEvent::Close));
    Ok(())
}
