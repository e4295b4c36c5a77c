use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use super::{connect, server_config};
use crate::auth::AuthAttempt;
use crate::client::{self, SessionOptions};
use crate::server::{self, Session};
use crate::transport::MemoryTransport;
use crate::{
    AuthDecision, Channel, ChannelId, ChannelMsg, ChannelOpenDecision, ConnectionEvent, Names,
    RequestDecision, SessionRequest,
};

/// Accepts every user and channel, and lets the test decide the
/// session requests.
struct Held {
    channels: Vec<Channel<server::Msg>>,
    requests: UnboundedSender<(ChannelId, SessionRequest, RequestDecision)>,
}

impl Held {
    fn new() -> (
        Self,
        UnboundedReceiver<(ChannelId, SessionRequest, RequestDecision)>,
    ) {
        let (requests, receiver) = unbounded_channel();
        (
            Held {
                channels: Vec::new(),
                requests,
            },
            receiver,
        )
    }
}

impl server::Handler for Held {
    type Error = crate::Error;

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
        channel: Channel<server::Msg>,
        decision: ChannelOpenDecision,
        _: &mut Session,
    ) -> Result<(), Self::Error> {
        decision.accept();
        self.channels.push(channel);
        Ok(())
    }

    async fn session_request(
        &mut self,
        channel: ChannelId,
        request: SessionRequest,
        decision: RequestDecision,
        _: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = self.requests.send((channel, request, decision));
        Ok(())
    }
}

struct Client;

impl client::Handler for Client {
    type Error = crate::Error;
}

async fn authenticated(
    client_config: client::Config,
) -> (
    client::Handle<Client>,
    server::RunningSession<Held>,
    UnboundedReceiver<(ChannelId, SessionRequest, RequestDecision)>,
) {
    let (handler, requests) = Held::new();
    let (mut client, server) = connect(client_config, server_config(), Client, handler).await;
    assert!(client.authenticate_none("alice").await.unwrap().success());
    (client, server, requests)
}

#[tokio::test]
async fn end_fails_pending_requests() {
    let (client, server, mut requests) = authenticated(client::Config::default()).await;
    let options = SessionOptions::default();
    let (exec, shell, sftp, held) = tokio::join!(
        client.exec("make", &options),
        client.shell(&options),
        client.sftp(b"init"),
        async {
            let mut held = Vec::new();
            while held.len() < 3 {
                held.push(requests.recv().await.unwrap());
            }
            client.end().await.unwrap();
            held
        }
    );
    assert!(matches!(exec, Err(crate::Error::NoResponse)));
    assert!(matches!(shell, Err(crate::Error::NoResponse)));
    assert!(matches!(sftp, Err(crate::Error::NoResponse)));
    drop(held);
    assert!(server.await.is_ok());
}

/// Writes `output` on the server side of `id`, then ends the command.
async fn complete(handle: &server::Handle, id: ChannelId, output: &str) {
    handle
        .data(id, Bytes::copy_from_slice(output.as_bytes()))
        .await
        .unwrap();
    handle.exit_status_request(id, 0).await.unwrap();
    handle.eof(id).await.unwrap();
    handle.close(id).await.unwrap();
}

async fn output(mut channel: Channel<client::Msg>) -> (String, Option<u32>) {
    let mut out = Vec::new();
    let mut status = None;
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => out.extend_from_slice(&data),
            ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
            _ => {}
        }
    }
    (String::from_utf8(out).unwrap(), status)
}

#[tokio::test]
async fn pipelined_execs_across_rekey() {
    let (client, server, mut requests) = authenticated(client::Config::default()).await;
    let handle = server.handle();
    let options = SessionOptions::default();

    let server_side = async {
        let mut pending = Vec::new();
        while pending.len() < 3 {
            pending.push(Some(requests.recv().await.unwrap()));
        }
        // Out of order: last, first, middle.
        for index in [2, 0, 1] {
            let (id, request, decision) = pending[index].take().unwrap();
            let SessionRequest::Exec { command, .. } = request else {
                panic!("unexpected {request:?}")
            };
            decision.accept();
            let command = String::from_utf8(command).unwrap();
            complete(&handle, id, &format!("ran {command}")).await;
        }
    };
    let (one, rekeyed, two, three, ()) = tokio::join!(
        client.exec("one", &options),
        client.rekey(),
        client.exec("two", &options),
        client.exec("three", &options),
        server_side
    );
    rekeyed.unwrap();

    for (channel, command) in [(one, "one"), (two, "two"), (three, "three")] {
        let (out, status) = output(channel.unwrap()).await;
        assert_eq!(out, format!("ran {command}"));
        assert_eq!(status, Some(0));
    }
}

#[tokio::test]
async fn rejected_exec_is_denied() {
    let (client, _server, mut requests) = authenticated(client::Config::default()).await;
    let options = SessionOptions::default();
    let (result, ()) = tokio::join!(client.exec("rm -rf /", &options), async {
        let (_, _, decision) = requests.recv().await.unwrap();
        decision.reject();
    });
    assert!(matches!(result, Err(crate::Error::RequestDenied)));
}

#[tokio::test]
async fn detached_transport_hangs_up() {
    let _ = env_logger::try_init();
    let result = client::connect_stream(
        Arc::new(client::Config::default()),
        MemoryTransport::detached(),
        Client,
    )
    .await;
    assert!(matches!(result, Err(crate::Error::HUP)));
}

#[tokio::test]
async fn server_without_host_keys() {
    let _ = env_logger::try_init();
    let (handler, _requests) = Held::new();
    let (_client_end, server_end) = MemoryTransport::pair();
    let result = server::run_stream(
        Arc::new(server::Config::default()),
        server_end,
        handler,
    )
    .await;
    assert!(matches!(result, Err(crate::Error::InvalidConfig(_))));
}

#[tokio::test]
async fn inactivity_closes_the_connection() {
    let config = client::Config {
        inactivity_timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    let (handler, _requests) = Held::new();
    let (mut client, server) = connect(config, server_config(), Client, handler).await;
    let mut events = client.take_events().unwrap();
    assert!(client.authenticate_none("alice").await.unwrap().success());

    assert_eq!(events.recv().await, Some(ConnectionEvent::Ready));
    match events.recv().await {
        Some(ConnectionEvent::Error(e)) => assert!(e.contains("InactivityTimeout")),
        e => panic!("unexpected {e:?}"),
    }
    assert_eq!(events.recv().await, Some(ConnectionEvent::Close));
    assert_eq!(events.recv().await, None);
    assert!(matches!(client.await, Err(crate::Error::InactivityTimeout)));
    assert!(server.await.is_ok());
}

#[tokio::test]
async fn server_events_follow_the_session() {
    let (handler, _requests) = Held::new();
    let (mut client, mut server) =
        connect(client::Config::default(), server_config(), Client, handler).await;
    let mut events = server.take_events().unwrap();
    assert!(client.authenticate_none("alice").await.unwrap().success());
    assert_eq!(events.recv().await, Some(ConnectionEvent::Ready));

    client.end().await.unwrap();
    assert_eq!(events.recv().await, Some(ConnectionEvent::Close));
    assert!(server.await.is_ok());
    assert!(client.await.is_ok());
}

/// Can move between tasks but not be shared.
#[derive(Debug)]
struct LocalError(RefCell<String>);

impl From<crate::Error> for LocalError {
    fn from(e: crate::Error) -> Self {
        LocalError(RefCell::new(e.to_string()))
    }
}

/// Reports the negotiated algorithms when the client authenticates.
struct Negotiated {
    names: UnboundedSender<Names>,
}

impl server::Handler for Negotiated {
    type Error = LocalError;

    async fn auth_attempt(
        &mut self,
        _: AuthAttempt,
        decision: AuthDecision,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = self.names.send(session.names().clone());
        decision.accept();
        Ok(())
    }
}

struct LocalClient;

impl client::Handler for LocalClient {
    type Error = LocalError;
}

#[tokio::test]
async fn handlers_with_unshared_errors() {
    let (names, mut received) = unbounded_channel();
    let (mut client, server) = connect(
        client::Config::default(),
        server_config(),
        LocalClient,
        Negotiated { names },
    )
    .await;
    assert!(client.authenticate_none("alice").await.unwrap().success());
    let names = received.recv().await.unwrap();
    assert_eq!(names.key, ssh_key::Algorithm::Ed25519);

    client.end().await.unwrap();
    assert!(client.await.is_ok());
    assert!(server.await.is_ok());
}
