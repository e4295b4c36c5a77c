use std::time::Duration;

use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

use super::{connect, server_config, ScriptedClient};
use crate::auth::AuthAttempt;
use crate::client;
use crate::message::{AuthRequestMethod, GlobalRequest, Message};
use crate::server::{self, Session};
use crate::{AuthDecision, GlobalDecision};

/// Lets the test decide every global request.
struct Forwarder {
    decisions: UnboundedSender<(GlobalRequest, GlobalDecision)>,
}

impl server::Handler for Forwarder {
    type Error = crate::Error;

    async fn auth_attempt(
        &mut self,
        attempt: AuthAttempt,
        decision: AuthDecision,
        _: &mut Session,
    ) -> Result<(), Self::Error> {
        if attempt.method() == crate::MethodKind::Password {
            decision.accept()
        }
        Ok(())
    }

    async fn global_request(
        &mut self,
        request: GlobalRequest,
        decision: GlobalDecision,
        _: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = self.decisions.send((request, decision));
        Ok(())
    }
}

fn forward(port: u32, want_reply: bool) -> Message {
    Message::GlobalRequest {
        want_reply,
        request: GlobalRequest::TcpIpForward {
            address: "0.0.0.0".to_string(),
            port,
        },
    }
}

async fn authenticated() -> (
    ScriptedClient,
    server::RunningSession<Forwarder>,
    tokio::sync::mpsc::UnboundedReceiver<(GlobalRequest, GlobalDecision)>,
) {
    let (decisions, receiver) = unbounded_channel();
    let (mut client, server) =
        ScriptedClient::connect(server_config(), Forwarder { decisions }).await;
    let reply = client
        .authenticate(AuthRequestMethod::Password {
            password: "secret".to_string(),
        })
        .await;
    assert!(matches!(reply, Message::UserauthSuccess));
    (client, server, receiver)
}

#[tokio::test]
async fn replies_follow_request_order() {
    let (mut client, _server, mut decisions) = authenticated().await;
    client.send(forward(1000, true)).await;
    client.send(forward(2000, true)).await;

    let (first, a) = decisions.recv().await.unwrap();
    let (second, b) = decisions.recv().await.unwrap();
    assert!(matches!(first, GlobalRequest::TcpIpForward { port: 1000, .. }));
    assert!(matches!(second, GlobalRequest::TcpIpForward { port: 2000, .. }));

    b.accept(None);
    client.assert_silent(Duration::from_millis(100)).await;
    a.reject();
    assert!(matches!(client.recv().await, Message::RequestFailure));
    assert!(matches!(
        client.recv().await,
        Message::RequestSuccess { bound_port: None }
    ));
}

#[tokio::test]
async fn keepalive_waits_behind_pending_request() {
    let (mut client, _server, mut decisions) = authenticated().await;
    client.send(forward(1000, true)).await;
    client
        .send(Message::GlobalRequest {
            want_reply: true,
            request: GlobalRequest::KeepAlive,
        })
        .await;
    let (_, decision) = decisions.recv().await.unwrap();
    client.assert_silent(Duration::from_millis(100)).await;

    decision.accept(None);
    assert!(matches!(
        client.recv().await,
        Message::RequestSuccess { bound_port: None }
    ));
    assert!(matches!(
        client.recv().await,
        Message::RequestSuccess { .. }
    ));
}

#[tokio::test]
async fn bound_port_only_for_port_zero() {
    let (mut client, _server, mut decisions) = authenticated().await;
    client.send(forward(0, true)).await;
    client.send(forward(8022, true)).await;
    let (_, any_port) = decisions.recv().await.unwrap();
    let (_, fixed_port) = decisions.recv().await.unwrap();
    any_port.accept(Some(40123));
    fixed_port.accept(Some(8022));
    assert!(matches!(
        client.recv().await,
        Message::RequestSuccess {
            bound_port: Some(40123)
        }
    ));
    assert!(matches!(
        client.recv().await,
        Message::RequestSuccess { bound_port: None }
    ));
}

#[tokio::test]
async fn dropped_decision_rejects() {
    let (mut client, _server, mut decisions) = authenticated().await;
    client.send(forward(1000, true)).await;
    drop(decisions.recv().await.unwrap());
    assert!(matches!(client.recv().await, Message::RequestFailure));
}

#[tokio::test]
async fn no_reply_unless_asked() {
    let (mut client, _server, mut decisions) = authenticated().await;
    client.send(forward(1000, false)).await;
    client
        .send(Message::GlobalRequest {
            want_reply: true,
            request: GlobalRequest::Unknown {
                name: "no-more-sessions@openssh.com".to_string(),
            },
        })
        .await;
    let (_, decision) = decisions.recv().await.unwrap();
    decision.accept(None);
    // Only the unknown request gets an answer.
    assert!(matches!(client.recv().await, Message::RequestFailure));
    client.assert_silent(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn rejected_before_authentication() {
    let (decisions, mut received) = unbounded_channel();
    let (mut client, _server) =
        ScriptedClient::connect(server_config(), Forwarder { decisions }).await;
    client.send(forward(1000, true)).await;
    assert!(matches!(client.recv().await, Message::RequestFailure));
    assert!(received.try_recv().is_err());
}

struct Client;

impl client::Handler for Client {
    type Error = crate::Error;
}

#[tokio::test]
async fn ping_both_ways() {
    let (decisions, _received) = unbounded_channel();
    let (mut client, server) = connect(
        client::Config::default(),
        server_config(),
        Client,
        Forwarder { decisions },
    )
    .await;
    assert!(client
        .authenticate_password("alice", "secret")
        .await
        .unwrap()
        .success());

    client.send_ping().await.unwrap();
    server.handle().send_ping().await.unwrap();
}

#[tokio::test]
async fn pending_forward_fails_on_disconnect() {
    let (decisions, mut received) = unbounded_channel();
    let (mut client, server) = connect(
        client::Config::default(),
        server_config(),
        Client,
        Forwarder { decisions },
    )
    .await;
    assert!(client
        .authenticate_password("alice", "secret")
        .await
        .unwrap()
        .success());

    let (result, _) = tokio::join!(client.tcpip_forward("0.0.0.0", 2222), async {
        let held = received.recv().await.unwrap();
        server
            .handle()
            .disconnect(
                crate::Disconnect::ByApplication,
                "going away".to_string(),
                String::new(),
            )
            .await
            .unwrap();
        held
    });
    assert!(matches!(result, Err(crate::Error::NoResponse)));
}
