//! Two Sessions talking over a real TCP connection.

use std::{
    sync::Arc,
    time::Duration,
};

use futures_util::future::join_all;
use hotwire::{
    DispatchTableBuilder,
    HandlerError,
    Payload,
    ProtocolDescription,
    Registry,
    SerializationFormat,
    ServiceHandler,
    Session,
    SessionConfig,
    SessionError,
};
use rstest::{fixture, rstest};
use serde::{Deserialize, Serialize};
use tokio::{
    net::{TcpListener, TcpStream},
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AddOne {
    x: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Incremented {
    value: i64,
}

impl Payload for AddOne {
    const NAME: &'static str = "AddOne";
}

impl Payload for Incremented {
    const NAME: &'static str = "Incremented";
}

struct Adder;

impl ServiceHandler for Adder {
    fn register(self: Arc<Self>, table: &mut DispatchTableBuilder) {
        table.operation("add_one", |request: AddOne| async move {
            // larger inputs answer later, so replies overtake each other
            if request.x >= 40 {
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
            Ok::<_, HandlerError>(Incremented { value: request.x + 1 })
        });
    }
}

#[fixture]
fn registry() -> Arc<Registry> {
    Arc::new(Registry::build(
        &ProtocolDescription::new().operation::<AddOne, Incremented>("add_one"),
    ))
}

/// Accept one connection and serve it with [`Adder`]; return the client end.
async fn connected_pair(registry: Arc<Registry>, format: SerializationFormat) -> (Session, Session) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let config = SessionConfig::default().with_serializer(format);

    let accept = tokio::spawn({
        let registry = Arc::clone(&registry);
        async move {
            let (socket, peer) = listener.accept().await.expect("accept");
            Session::builder(registry)
                .config(config)
                .peer(peer.to_string())
                .handler(Arc::new(Adder))
                .spawn(socket)
        }
    });
    let socket = TcpStream::connect(addr).await.expect("connect");
    let client = Session::builder(registry)
        .config(config)
        .peer(addr.to_string())
        .spawn(socket);
    let server = accept.await.expect("join");
    (client, server)
}

#[rstest]
#[case::json(SerializationFormat::Json)]
#[case::compressed(SerializationFormat::CompressedJson)]
#[case::binary(SerializationFormat::Binary)]
#[tokio::test]
async fn adds_one_over_tcp(registry: Arc<Registry>, #[case] format: SerializationFormat) {
    let (client, _server) = connected_pair(registry, format).await;
    let reply: Incremented = timeout(WAIT, client.send_request(AddOne { x: 41 }))
        .await
        .expect("in time")
        .expect("reply");
    assert_eq!(reply, Incremented { value: 42 });
}

#[rstest]
#[tokio::test]
async fn a_later_request_can_resolve_first(registry: Arc<Registry>) {
    let (client, _server) = connected_pair(registry, SerializationFormat::Json).await;
    let slow = client.send_request::<AddOne, Incremented>(AddOne { x: 41 });
    let fast = client.send_request::<AddOne, Incremented>(AddOne { x: 1 });
    let (slow_reply, fast_reply) = timeout(WAIT, async { tokio::join!(slow, fast) })
        .await
        .expect("in time");
    assert_eq!(slow_reply.expect("slow reply"), Incremented { value: 42 });
    assert_eq!(fast_reply.expect("fast reply"), Incremented { value: 2 });
}

#[rstest]
#[tokio::test]
async fn concurrent_callers_get_their_own_answers(registry: Arc<Registry>) {
    let (client, _server) = connected_pair(registry, SerializationFormat::Json).await;
    let calls = (0..64_i64).map(|x| {
        let client = client.clone();
        async move { (x, client.send_request::<AddOne, Incremented>(AddOne { x }).await) }
    });
    let results = timeout(WAIT, join_all(calls)).await.expect("in time");
    for (x, reply) in results {
        assert_eq!(reply.expect("reply").value, x + 1);
    }
    assert_eq!(client.pending_requests(), 0);
}

#[rstest]
#[tokio::test]
async fn closing_the_server_fails_later_calls(registry: Arc<Registry>) {
    let (client, server) = connected_pair(registry, SerializationFormat::Json).await;
    server.shutdown();
    timeout(WAIT, client.closed()).await.expect("client saw the disconnect");
    let err = client
        .send_request::<AddOne, Incremented>(AddOne { x: 1 })
        .await
        .expect_err("finished session");
    assert!(matches!(err, SessionError::Terminated));
}
