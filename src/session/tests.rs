//! Session behaviour against a scripted raw peer and against another Session.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures_util::{future::join_all, stream};
use rstest::{fixture, rstest};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::{
    io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf, duplex, split},
    sync::broadcast,
    time::timeout,
};

use super::*;
use crate::{
    dispatch::{DispatchTableBuilder, HandlerError},
    frame::{FrameHeader, encode_frame},
    protocol::ProtocolDescription,
};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Add {
    x: i32,
}
impl Payload for Add {
    const NAME: &'static str = "Add";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Sum {
    value: i32,
}
impl Payload for Sum {
    const NAME: &'static str = "Sum";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Fail;
impl Payload for Fail {
    const NAME: &'static str = "Fail";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Explode;
impl Payload for Explode {
    const NAME: &'static str = "Explode";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Ping;
impl Payload for Ping {
    const NAME: &'static str = "Ping";
}

fn protocol() -> ProtocolDescription {
    ProtocolDescription::new()
        .operation::<Add, Sum>("add")
        .operation::<Fail, Sum>("fail")
        .operation::<Explode, Sum>("explode")
        .operation::<Ping, ()>("ping")
}

#[fixture]
fn registry() -> Arc<Registry> {
    Arc::new(Registry::build(&protocol()))
}

#[expect(clippy::unused_async, reason = "handlers are async functions")]
async fn explode(_: Explode) -> Result<Sum, HandlerError> { panic!("handler exploded") }

struct Calculator;

impl ServiceHandler for Calculator {
    fn register(self: Arc<Self>, table: &mut DispatchTableBuilder) {
        table
            .operation("add", |req: Add| async move {
                Ok::<_, HandlerError>(Sum { value: req.x + 1 })
            })
            .operation("fail", |_: Fail| async move {
                Err::<Sum, HandlerError>("refused".into())
            })
            .operation("explode", explode);
    }
}

/// The far end of a duplex stream, driven frame by frame.
struct RawPeer {
    frames: FrameReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    registry: Arc<Registry>,
}

impl RawPeer {
    fn new(io: DuplexStream, registry: Arc<Registry>) -> Self {
        let (read, writer) = split(io);
        Self {
            frames: FrameReader::new(read),
            writer,
            registry,
        }
    }

    async fn read_envelope<T: DeserializeOwned>(&mut self) -> (FrameHeader, T) {
        let frame = timeout(WAIT, self.frames.read_frame())
            .await
            .expect("frame in time")
            .expect("frame");
        let payload = frame.payload.expect("payload");
        let envelope = SerializationFormat::Json
            .deserialize(&payload)
            .expect("envelope");
        (frame.header, envelope)
    }

    async fn write_raw(&mut self, kind: MessageKind, type_id: i32, payload: &[u8]) {
        let bytes = encode_frame(kind, type_id, payload).expect("encode");
        self.writer.write_all(&bytes).await.expect("write");
    }

    async fn respond<T: Payload>(&mut self, request_identifier: &str, payload: T) {
        let type_id = self.registry.id_of::<T>().expect("registered");
        let envelope = SerializationFormat::Json
            .serialize(&Response::success(request_identifier, payload))
            .expect("serialize");
        self.write_raw(MessageKind::Response, type_id, &envelope).await;
    }

    async fn request<T: Payload>(&mut self, request_identifier: &str, payload: T) {
        let type_id = self.registry.id_of::<T>().expect("registered");
        let envelope = SerializationFormat::Json
            .serialize(&Request::new(request_identifier, payload))
            .expect("serialize");
        self.write_raw(MessageKind::Request, type_id, &envelope).await;
    }
}

fn session_with_raw_peer(registry: &Arc<Registry>) -> (Session, RawPeer) {
    let (local, remote) = duplex(64 * 1024);
    let session = Session::builder(Arc::clone(registry))
        .handler(Arc::new(Calculator))
        .peer("raw")
        .spawn(local);
    (session, RawPeer::new(remote, Arc::clone(registry)))
}

async fn next_outcome(events: &mut broadcast::Receiver<ReceiveEvent>) -> ReceiveOutcome {
    timeout(WAIT, events.recv())
        .await
        .expect("event in time")
        .expect("event")
        .outcome
}

#[rstest]
#[tokio::test]
async fn reordered_responses_reach_their_callers(registry: Arc<Registry>) {
    let (session, mut peer) = session_with_raw_peer(&registry);

    let callers = (0..100).map(|x| {
        let session = session.clone();
        tokio::spawn(async move { session.send_request::<Add, Sum>(Add { x }).await })
    });
    let callers: Vec<_> = callers.collect();

    let mut received = Vec::new();
    for _ in 0..100 {
        let (_, request): (_, Request<Add>) = peer.read_envelope().await;
        received.push(request);
    }
    for request in received.iter().rev() {
        peer.respond(&request.request_identifier, Sum {
            value: request.payload.x * 10,
        })
        .await;
    }

    for (x, caller) in (0..100).zip(join_all(callers).await) {
        let sum = caller.expect("join").expect("response");
        assert_eq!(sum, Sum { value: x * 10 });
    }
    assert_eq!(session.pending_requests(), 0);
}

#[rstest]
#[tokio::test]
async fn wayward_response_does_not_stop_the_loop(registry: Arc<Registry>) {
    let (session, mut peer) = session_with_raw_peer(&registry);
    let mut events = session.subscribe();

    let caller = tokio::spawn({
        let session = session.clone();
        async move { session.send_request::<Add, Sum>(Add { x: 1 }).await }
    });
    let (_, request): (_, Request<Add>) = peer.read_envelope().await;

    peer.respond("nobody-asked", Sum { value: -1 }).await;
    peer.respond(&request.request_identifier, Sum { value: 2 }).await;

    assert_eq!(next_outcome(&mut events).await, ReceiveOutcome::WaywardMessage);
    assert_eq!(next_outcome(&mut events).await, ReceiveOutcome::Success);
    let sum = caller.await.expect("join").expect("response");
    assert_eq!(sum, Sum { value: 2 });
}

#[rstest]
#[tokio::test]
async fn unknown_type_id_keeps_the_stream_aligned(registry: Arc<Registry>) {
    let (session, mut peer) = session_with_raw_peer(&registry);
    let mut events = session.subscribe();

    let bogus = SerializationFormat::Json
        .serialize(&Response::success("bogus", 99))
        .expect("serialize");
    peer.write_raw(MessageKind::Response, 999, &bogus).await;
    peer.request("after", Add { x: 4 }).await;

    assert_eq!(
        next_outcome(&mut events).await,
        ReceiveOutcome::ProtocolNotRecognised
    );
    assert_eq!(next_outcome(&mut events).await, ReceiveOutcome::Success);
    let (header, response): (_, Response<Sum>) = peer.read_envelope().await;
    assert_eq!(Some(header.type_id), registry.id_of::<Sum>());
    assert_eq!(response.request_identifier, "after");
    assert_eq!(response.payload, Some(Sum { value: 5 }));
}

#[rstest]
#[tokio::test]
async fn unknown_request_type_is_answered(registry: Arc<Registry>) {
    let (_session, mut peer) = session_with_raw_peer(&registry);

    let envelope = SerializationFormat::Json
        .serialize(&Request::new("mystery", 1))
        .expect("serialize");
    peer.write_raw(MessageKind::Request, 77, &envelope).await;

    let (header, response): (_, Response<()>) = peer.read_envelope().await;
    assert_eq!(header.type_id, 77);
    assert_eq!(response.outcome, ResponseOutcome::ProtocolNotRecognised);
    assert_eq!(response.request_identifier, "mystery");
}

#[rstest]
#[tokio::test]
async fn bad_kind_and_oversized_frames_are_skipped(registry: Arc<Registry>) {
    let (local, remote) = duplex(64 * 1024);
    let session = Session::builder(Arc::clone(&registry))
        .handler(Arc::new(Calculator))
        .config(SessionConfig::default().with_max_payload(128))
        .spawn(local);
    let mut peer = RawPeer::new(remote, Arc::clone(&registry));
    let mut events = session.subscribe();
    let add_id = registry.id_of::<Add>().expect("add id");

    peer.write_raw(MessageKind::Unset, add_id, b"{\"requestIdentifier\":\"x\"}")
        .await;
    peer.write_raw(MessageKind::Request, add_id, &[b' '; 512]).await;
    peer.request("fine", Add { x: 0 }).await;

    for _ in 0..2 {
        assert_eq!(
            next_outcome(&mut events).await,
            ReceiveOutcome::ProtocolNotRecognised
        );
    }
    assert_eq!(next_outcome(&mut events).await, ReceiveOutcome::Success);
    let (_, response): (_, Response<Sum>) = peer.read_envelope().await;
    assert_eq!(response.payload, Some(Sum { value: 1 }));
}

#[rstest]
#[tokio::test]
async fn disconnect_fails_every_pending_request(registry: Arc<Registry>) {
    let (session, mut peer) = session_with_raw_peer(&registry);

    let callers: Vec<_> = (0..3)
        .map(|x| {
            let session = session.clone();
            tokio::spawn(async move { session.send_request::<Add, Sum>(Add { x }).await })
        })
        .collect();
    for _ in 0..3 {
        let (_, _request): (_, Request<Add>) = peer.read_envelope().await;
    }
    assert_eq!(session.pending_requests(), 3);
    drop(peer);

    for caller in timeout(WAIT, join_all(callers)).await.expect("callers resolve") {
        let err = caller.expect("join").expect_err("disconnect");
        assert!(matches!(err, SessionError::Disconnected), "got {err:?}");
    }
    timeout(WAIT, session.closed()).await.expect("closed");
    assert!(session.is_finished());
    let late = session.send_request::<Add, Sum>(Add { x: 9 }).await;
    assert!(matches!(late, Err(SessionError::Terminated)));
}

#[rstest]
#[tokio::test]
async fn unhandled_request_is_reported(registry: Arc<Registry>) {
    let (session, mut peer) = session_with_raw_peer(&registry);
    let mut events = session.subscribe();
    peer.request("lonely", Ping).await;

    assert_eq!(next_outcome(&mut events).await, ReceiveOutcome::RequestNotHandled);
    let (header, response): (_, Response<()>) = peer.read_envelope().await;
    assert_eq!(Some(header.type_id), registry.id_of::<Ping>());
    assert_eq!(response.outcome, ResponseOutcome::RequestNotHandled);
    assert_eq!(response.error.as_deref(), Some("no handler for Ping"));
}

#[rstest]
#[tokio::test]
async fn handler_failures_become_error_responses(registry: Arc<Registry>) {
    let (_session, mut peer) = session_with_raw_peer(&registry);

    peer.request("fails", Fail).await;
    let (_, failed): (_, Response<Sum>) = peer.read_envelope().await;
    assert_eq!(failed.outcome, ResponseOutcome::Error);
    assert_eq!(failed.error.as_deref(), Some("refused"));

    peer.request("panics", Explode).await;
    let (_, panicked): (_, Response<Sum>) = peer.read_envelope().await;
    assert_eq!(panicked.outcome, ResponseOutcome::Error);
    assert_eq!(panicked.payload, None);

    peer.request("still-alive", Add { x: 2 }).await;
    let (_, alive): (_, Response<Sum>) = peer.read_envelope().await;
    assert_eq!(alive.payload, Some(Sum { value: 3 }));
}

fn session_pair(registry: &Arc<Registry>) -> (Session, Session) {
    let (left, right) = duplex(64 * 1024);
    let host = Session::builder(Arc::clone(registry))
        .handler(Arc::new(Calculator))
        .peer("host")
        .spawn(left);
    let target = Session::builder(Arc::clone(registry))
        .handler(Arc::new(Calculator))
        .peer("target")
        .spawn(right);
    (host, target)
}

#[rstest]
#[case::json(SerializationFormat::Json)]
#[case::compressed(SerializationFormat::CompressedJson)]
#[case::binary(SerializationFormat::Binary)]
#[tokio::test]
async fn both_peers_can_call_each_other(registry: Arc<Registry>, #[case] format: SerializationFormat) {
    let (left, right) = duplex(64 * 1024);
    let config = SessionConfig::default().with_serializer(format);
    let host = Session::builder(Arc::clone(&registry))
        .handler(Arc::new(Calculator))
        .config(config)
        .spawn(left);
    let target = Session::builder(Arc::clone(&registry))
        .handler(Arc::new(Calculator))
        .config(config)
        .spawn(right);

    let (from_host, from_target) = tokio::join!(
        host.send_request::<Add, Sum>(Add { x: 41 }),
        target.send_request::<Add, Sum>(Add { x: 1 }),
    );
    assert_eq!(from_host.expect("host call"), Sum { value: 42 });
    assert_eq!(from_target.expect("target call"), Sum { value: 2 });
}

#[rstest]
#[tokio::test]
async fn remote_failures_surface_to_the_caller(registry: Arc<Registry>) {
    let (host, _target) = session_pair(&registry);

    let err = host
        .send_request::<Fail, Sum>(Fail)
        .await
        .expect_err("remote error");
    assert!(matches!(
        err,
        SessionError::Remote {
            outcome: ResponseOutcome::Error,
            detail: Some(ref detail),
        } if detail == "refused"
    ));

    let unhandled = host
        .send_request::<Ping, ()>(Ping)
        .await
        .expect_err("not handled");
    assert!(matches!(
        unhandled,
        SessionError::Remote {
            outcome: ResponseOutcome::RequestNotHandled,
            ..
        }
    ));
}

#[rstest]
#[tokio::test]
async fn unregistered_payloads_are_refused_before_writing(registry: Arc<Registry>) {
    #[derive(Debug, Serialize, Deserialize)]
    struct Stranger;
    impl Payload for Stranger {
        const NAME: &'static str = "Stranger";
    }

    let (host, _target) = session_pair(&registry);
    let err = host
        .send_request::<Stranger, Sum>(Stranger)
        .await
        .expect_err("unregistered");
    assert!(matches!(err, SessionError::UnregisteredType("Stranger")));
    assert_eq!(host.pending_requests(), 0);
}

#[rstest]
#[tokio::test]
async fn local_shutdown_ends_both_sides(registry: Arc<Registry>) {
    let disconnected = Arc::new(AtomicBool::new(false));
    let (left, right) = duplex(1024);
    let host = Session::builder(Arc::clone(&registry))
        .on_disconnect({
            let disconnected = Arc::clone(&disconnected);
            move || async move { disconnected.store(true, Ordering::SeqCst) }
        })
        .spawn(left);
    let target = Session::builder(Arc::clone(&registry))
        .handler(Arc::new(Calculator))
        .spawn(right);
    let mut events = host.subscribe();

    host.shutdown();
    assert_eq!(next_outcome(&mut events).await, ReceiveOutcome::Disconnect);
    timeout(WAIT, host.closed()).await.expect("host closed");
    timeout(WAIT, target.closed()).await.expect("target closed");
    timeout(WAIT, async {
        while !disconnected.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("callback ran");
    assert!(matches!(
        target.send_request::<Add, Sum>(Add { x: 1 }).await,
        Err(SessionError::Terminated)
    ));
}

#[rstest]
#[tokio::test]
async fn streamed_requests_keep_item_order(registry: Arc<Registry>) {
    let (host, _target) = session_pair(&registry);
    let sums: Vec<Sum> = host
        .stream_requests(stream::iter((0..20).map(|x| Add { x })))
        .await
        .expect("stream");
    let values: Vec<i32> = sums.into_iter().map(|s| s.value).collect();
    assert_eq!(values, (1..=20).collect::<Vec<_>>());
}

#[rstest]
#[tokio::test]
async fn send_response_answers_a_raw_request(registry: Arc<Registry>) {
    let (session, mut peer) = session_with_raw_peer(&registry);
    let head = EnvelopeHead {
        request_identifier: "manual".to_owned(),
    };
    session
        .send_response(&head, Sum { value: 7 })
        .await
        .expect("send response");

    let (header, response): (_, Response<Sum>) = peer.read_envelope().await;
    assert_eq!(Some(header.type_id), registry.id_of::<Sum>());
    assert_eq!(response.request_identifier, "manual");
    assert_eq!(response.payload, Some(Sum { value: 7 }));
}
