use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand_core::OsRng;
use ssh_key::{Algorithm, EcdsaCurve, PrivateKey, PublicKey};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use super::{connect, server_config, ScriptedClient};
use crate::auth::{self, AuthAttempt, Credentials, Method, MethodKind};
use crate::client::{self, KeyboardInteractiveAuthResponse};
use crate::keys::{self, FingerprintHash, SshKeyVerifier};
use crate::message::{AuthRequestMethod, ChannelType, Message, Prompt};
use crate::server::{self, Session};
use crate::{AuthDecision, AuthResult, ChannelOpenFailure, ConnectionEvent, Disconnect};

struct Client;

impl client::Handler for Client {
    type Error = crate::Error;
}

/// Accepts one key, one password and one keyboard-interactive answer.
struct Policy {
    key: PublicKey,
    password: String,
    attempts: UnboundedSender<(AuthAttempt, Vec<u8>)>,
}

impl Policy {
    fn new(key: &PublicKey) -> (Self, UnboundedReceiver<(AuthAttempt, Vec<u8>)>) {
        let (attempts, receiver) = unbounded_channel();
        (
            Policy {
                key: key.clone(),
                password: "hunter2".to_string(),
                attempts,
            },
            receiver,
        )
    }
}

impl server::Handler for Policy {
    type Error = crate::Error;

    async fn auth_attempt(
        &mut self,
        attempt: AuthAttempt,
        decision: AuthDecision,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = self
            .attempts
            .send((attempt.clone(), session.session_id().to_vec()));
        let accept = match attempt.credentials {
            Credentials::None => false,
            Credentials::Password { ref password } => *password == self.password,
            Credentials::PublicKey { .. } | Credentials::HostBased { .. } => {
                attempt.public_key().as_ref() == Some(&self.key)
            }
            Credentials::KeyboardInteractive { .. } => {
                decision.info_request(
                    "Second factor".to_string(),
                    String::new(),
                    vec![Prompt {
                        prompt: "Code: ".to_string(),
                        echo: false,
                    }],
                );
                return Ok(());
            }
            Credentials::KeyboardInteractiveResponse { ref responses } => {
                responses == &["42".to_string()]
            }
        };
        if accept {
            decision.accept()
        } else {
            decision.reject()
        }
        Ok(())
    }
}

fn random_key() -> PrivateKey {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
}

#[tokio::test]
async fn publickey_query_then_signature() {
    for (algorithm, name) in [
        (Algorithm::Ed25519, "ssh-ed25519"),
        (
            Algorithm::Ecdsa {
                curve: EcdsaCurve::NistP256,
            },
            "ecdsa-sha2-nistp256",
        ),
        (Algorithm::Rsa { hash: None }, "rsa-sha2-512"),
    ] {
        let key = Arc::new(PrivateKey::random(&mut OsRng, algorithm).unwrap());
        let (policy, mut attempts) = Policy::new(key.public_key());
        let (mut client, _server) =
            connect(client::Config::default(), server_config(), Client, policy).await;

        let result = client.authenticate_publickey("alice", key.clone()).await.unwrap();
        assert!(result.success(), "{name} was refused");

        let (query, _) = attempts.recv().await.unwrap();
        assert!(query.is_query());
        assert_eq!(query.method(), MethodKind::PublicKey);
        assert_eq!(query.user, "alice");
        match query.credentials {
            Credentials::PublicKey { ref algorithm, .. } => assert_eq!(algorithm, name),
            ref c => panic!("unexpected credentials {c:?}"),
        }

        let (signed, session_id) = attempts.recv().await.unwrap();
        assert!(!signed.is_query());
        assert!(signed.verify_signature(&SshKeyVerifier));
        let Credentials::PublicKey {
            algorithm,
            key: blob,
            signature: Some(signature),
        } = signed.credentials
        else {
            panic!("no signature")
        };
        let expected =
            auth::publickey_signed_data(&session_id, "alice", "ssh-connection", &algorithm, &blob)
                .unwrap();
        assert_eq!(signature.blob, expected);
    }
}

#[tokio::test]
async fn unknown_key_is_refused_before_signing() {
    let (policy, mut attempts) = Policy::new(random_key().public_key());
    let (mut client, _server) =
        connect(client::Config::default(), server_config(), Client, policy).await;

    let result = client
        .authenticate_publickey("alice", Arc::new(random_key()))
        .await
        .unwrap();
    assert!(!result.success());
    let (query, _) = attempts.recv().await.unwrap();
    assert!(query.is_query());
    // The client never signs a key the server did not accept.
    assert!(attempts.try_recv().is_err());
}

#[tokio::test]
async fn accepted_query_does_not_authenticate() {
    let key = random_key();
    let (policy, _attempts) = Policy::new(key.public_key());
    let (mut client, _server) = ScriptedClient::connect(server_config(), policy).await;

    let reply = client
        .authenticate(AuthRequestMethod::PublicKey {
            algorithm: "ssh-ed25519".to_string(),
            key: keys::public_key_blob(key.public_key()).unwrap(),
            signature: None,
        })
        .await;
    assert!(matches!(reply, Message::UserauthPkOk { .. }));

    client
        .send(Message::ChannelOpen {
            sender_channel: 0,
            initial_window_size: 1024,
            maximum_packet_size: 1024,
            channel_type: ChannelType::Session,
        })
        .await;
    match client.recv().await {
        Message::ChannelOpenFailure { reason, .. } => {
            assert_eq!(reason, ChannelOpenFailure::AdministrativelyProhibited)
        }
        msg => panic!("unexpected {msg:?}"),
    }
}

#[tokio::test]
async fn hostbased_exposes_client_host() {
    let host_key = Arc::new(random_key());
    let (policy, mut attempts) = Policy::new(host_key.public_key());
    let (mut client, _server) =
        connect(client::Config::default(), server_config(), Client, policy).await;

    let result = client
        .authenticate_hostbased("alice", host_key, "workstation.example.org", "alice")
        .await
        .unwrap();
    assert!(result.success());
    let (attempt, _) = attempts.recv().await.unwrap();
    assert_eq!(attempt.method(), MethodKind::HostBased);
    match attempt.credentials {
        Credentials::HostBased {
            ref local_hostname,
            ref local_username,
            ..
        } => {
            assert_eq!(local_hostname, "workstation.example.org");
            assert_eq!(local_username, "alice");
        }
        ref c => panic!("unexpected credentials {c:?}"),
    }
}

#[tokio::test]
async fn hostbased_bad_signature_never_reaches_policy() {
    let host_key = random_key();
    let (policy, mut attempts) = Policy::new(host_key.public_key());
    let (mut client, _server) = ScriptedClient::connect(server_config(), policy).await;

    let blob = keys::public_key_blob(host_key.public_key()).unwrap();
    // Signed over the wrong session identifier.
    let to_sign = auth::hostbased_signed_data(
        b"another session",
        "alice",
        "ssh-connection",
        "ssh-ed25519",
        &blob,
        "workstation",
        "alice",
    )
    .unwrap();
    let reply = client
        .authenticate(AuthRequestMethod::HostBased {
            algorithm: "ssh-ed25519".to_string(),
            key: blob,
            client_host: "workstation".to_string(),
            client_user: "alice".to_string(),
            signature: keys::sign(&host_key, &to_sign).unwrap(),
        })
        .await;
    match reply {
        Message::UserauthFailure {
            partial_success, ..
        } => assert!(!partial_success),
        msg => panic!("unexpected {msg:?}"),
    }
    assert!(attempts.try_recv().is_err());
}

#[tokio::test]
async fn password_then_keyboard_interactive() {
    let (policy, _attempts) = Policy::new(random_key().public_key());
    let (mut client, _server) =
        connect(client::Config::default(), server_config(), Client, policy).await;

    let result = client.authenticate_password("alice", "wrong").await.unwrap();
    assert!(!result.success());

    let response = client
        .authenticate_keyboard_interactive_start("alice", None)
        .await
        .unwrap();
    let KeyboardInteractiveAuthResponse::InfoRequest { name, prompts, .. } = response else {
        panic!("expected an info request, got {response:?}")
    };
    assert_eq!(name, "Second factor");
    assert_eq!(prompts.len(), 1);
    let response = client
        .authenticate_keyboard_interactive_respond(vec!["42".to_string()])
        .await
        .unwrap();
    assert!(matches!(response, KeyboardInteractiveAuthResponse::Success));
}

#[tokio::test]
async fn method_order_skips_failures() {
    let (policy, _attempts) = Policy::new(random_key().public_key());
    let (mut client, _server) =
        connect(client::Config::default(), server_config(), Client, policy).await;

    let methods = [
        Method::None,
        Method::PublicKey {
            key: Arc::new(random_key()),
        },
        Method::Password {
            password: "hunter2".to_string(),
        },
    ];
    client.authenticate("alice", &methods).await.unwrap();
}

#[tokio::test]
async fn too_many_failures_disconnect() {
    let (policy, _attempts) = Policy::new(random_key().public_key());
    let mut config = server_config();
    config.max_auth_attempts = 3;
    let (mut client, _server) = connect(client::Config::default(), config, Client, policy).await;

    for _ in 0..2 {
        let result = client.authenticate_password("alice", "wrong").await.unwrap();
        assert!(!result.success());
    }
    let result = client.authenticate_password("alice", "wrong").await;
    assert!(matches!(result, Err(crate::Error::Disconnect)));
    assert!(client.await.is_ok());
}

#[tokio::test]
async fn none_does_not_count_against_the_limit() {
    let (policy, _attempts) = Policy::new(random_key().public_key());
    let mut config = server_config();
    config.max_auth_attempts = 1;
    let (mut client, _server) = connect(client::Config::default(), config, Client, policy).await;

    for _ in 0..3 {
        let result = client.authenticate_none("alice").await.unwrap();
        let AuthResult::Failure {
            remaining_methods, ..
        } = result
        else {
            panic!("none was accepted")
        };
        assert!(remaining_methods.contains(&MethodKind::Password));
    }
    assert!(client
        .authenticate_password("alice", "hunter2")
        .await
        .unwrap()
        .success());
}

#[tokio::test]
async fn failures_are_delayed() {
    let (policy, _attempts) = Policy::new(random_key().public_key());
    let mut config = server_config();
    config.auth_rejection_time = Duration::from_millis(300);
    let (mut client, _server) = connect(client::Config::default(), config, Client, policy).await;

    let start = tokio::time::Instant::now();
    let result = client.authenticate_password("alice", "wrong").await.unwrap();
    assert!(!result.success());
    assert!(start.elapsed() >= Duration::from_millis(300));
}

struct Pinned {
    fingerprints: UnboundedSender<String>,
}

impl client::Handler for Pinned {
    type Error = crate::Error;

    async fn check_server_key(
        &mut self,
        _: &PublicKey,
        fingerprint: &str,
    ) -> Result<bool, Self::Error> {
        let _ = self.fingerprints.send(fingerprint.to_string());
        Ok(false)
    }
}

#[tokio::test]
async fn rejected_host_key_aborts_before_credentials() {
    let _ = env_logger::try_init();
    let config = server_config();
    let host_key = config.keys[0].public_key().clone();
    let (policy, mut attempts) = Policy::new(random_key().public_key());
    let (client_end, server_end) = crate::transport::MemoryTransport::pair();
    let server = tokio::spawn(server::run_stream(Arc::new(config), server_end, policy));

    let (fingerprints, mut received) = unbounded_channel();
    let client_config = client::Config {
        host_hash: FingerprintHash::Md5,
        ..Default::default()
    };
    let result =
        client::connect_stream(Arc::new(client_config), client_end, Pinned { fingerprints }).await;
    assert!(matches!(result, Err(crate::Error::UnknownKey)));

    let fingerprint = received.recv().await.unwrap();
    assert_eq!(fingerprint.len(), 32);
    assert_eq!(
        fingerprint,
        keys::host_key_fingerprint(&host_key, FingerprintHash::Md5).unwrap()
    );

    let session = server.await.unwrap().unwrap();
    assert!(session.await.is_ok());
    assert!(attempts.try_recv().is_err());
}

struct BannerClient {
    banners: UnboundedSender<String>,
}

impl client::Handler for BannerClient {
    type Error = crate::Error;

    async fn auth_banner(
        &mut self,
        banner: &str,
        _: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let _ = self.banners.send(banner.to_string());
        Ok(())
    }
}

#[tokio::test]
async fn banner_is_delivered_verbatim() {
    let (policy, _attempts) = Policy::new(random_key().public_key());
    let mut config = server_config();
    config.auth_banner = Some("Authorized use only.\r\n".to_string());
    let (banners, mut received) = unbounded_channel();
    let (mut client, _server) =
        connect(client::Config::default(), config, BannerClient { banners }, policy).await;
    let mut events = client.take_events().unwrap();

    assert!(client
        .authenticate_password("alice", "hunter2")
        .await
        .unwrap()
        .success());
    assert_eq!(received.recv().await.unwrap(), "Authorized use only.\r\n");
    match events.recv().await.unwrap() {
        ConnectionEvent::Banner(banner) => assert_eq!(banner, "Authorized use only.\r\n"),
        e => panic!("unexpected {e:?}"),
    }
    assert!(matches!(events.recv().await, Some(ConnectionEvent::Ready)));

    client
        .disconnect(Disconnect::ByApplication, "", "")
        .await
        .unwrap();
    assert!(matches!(events.recv().await, Some(ConnectionEvent::Close)));
}

/// Asks for a signature the way an agent would.
struct AgentSigner {
    key: PrivateKey,
    requests: usize,
}

impl auth::Signer for AgentSigner {
    type Error = crate::Error;

    async fn auth_publickey_sign(
        &mut self,
        key: &PublicKey,
        to_sign: Bytes,
    ) -> Result<Bytes, Self::Error> {
        assert_eq!(key, self.key.public_key());
        self.requests += 1;
        keys::sign(&self.key, &to_sign)
    }
}

#[tokio::test]
async fn publickey_signed_by_signer() {
    let key = random_key();
    let (policy, _attempts) = Policy::new(key.public_key());
    let (mut client, _server) =
        connect(client::Config::default(), server_config(), Client, policy).await;

    let public = key.public_key().clone();
    let mut signer = AgentSigner { key, requests: 0 };
    let result = client
        .authenticate_publickey_with("alice", public, &mut signer)
        .await
        .unwrap();
    assert!(result.success());
    assert_eq!(signer.requests, 1);
}
