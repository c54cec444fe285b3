//! Reconnecting over TCP to a peer that comes and goes.

use std::{sync::Arc, time::Duration};

use hotwire::{
    ChannelState,
    DispatchTableBuilder,
    HandlerError,
    Payload,
    ProtocolDescription,
    ReconnectConfig,
    Reconnector,
    Registry,
    ServiceHandler,
    Session,
    TcpConnector,
};
use rstest::{fixture, rstest};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, time::timeout};

const WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ping;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Pong {
    generation: u32,
}

impl Payload for Ping {
    const NAME: &'static str = "Ping";
}

impl Payload for Pong {
    const NAME: &'static str = "Pong";
}

struct Ponger {
    generation: u32,
}

impl ServiceHandler for Ponger {
    fn register(self: Arc<Self>, table: &mut DispatchTableBuilder) {
        table.operation("ping", move |_: Ping| {
            let generation = self.generation;
            async move { Ok::<_, HandlerError>(Pong { generation }) }
        });
    }
}

#[fixture]
fn registry() -> Arc<Registry> {
    Arc::new(Registry::build(
        &ProtocolDescription::new().operation::<Ping, Pong>("ping"),
    ))
}

/// Serve exactly one connection on `listener`, then return its Session.
async fn serve_once(listener: &TcpListener, registry: Arc<Registry>, generation: u32) -> Session {
    let (socket, _) = listener.accept().await.expect("accept");
    Session::builder(registry)
        .handler(Arc::new(Ponger { generation }))
        .spawn(socket)
}

#[rstest]
#[tokio::test]
async fn survives_a_restarted_peer(registry: Arc<Registry>) {
    // reserve a port, then release it so the first attempts are refused
    let addr = {
        let probe = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        probe.local_addr().expect("addr")
    };
    let config = ReconnectConfig::default()
        .with_backoff(Duration::from_millis(20))
        .with_connect_timeout(Duration::from_millis(500));
    let channel = Reconnector::builder(TcpConnector::new(addr.to_string()), Arc::clone(&registry))
        .config(config)
        .build();
    let mut states = channel.subscribe();

    let waiting = tokio::spawn({
        let channel = channel.clone();
        async move { channel.wait_for_connection().await }
    });
    // let at least one attempt fail
    loop {
        let state = timeout(WAIT, states.recv()).await.expect("state").expect("open");
        if state == ChannelState::TransientFailure {
            break;
        }
    }

    let listener = TcpListener::bind(addr).await.expect("rebind");
    let first_server = serve_once(&listener, Arc::clone(&registry), 1).await;
    let first = timeout(WAIT, waiting).await.expect("connected").expect("join");
    let pong: Pong = first.send_request(Ping).await.expect("pong");
    assert_eq!(pong, Pong { generation: 1 });

    first_server.shutdown();
    assert_eq!(
        timeout(WAIT, channel.wait_for_terminal_state()).await.expect("terminal"),
        ChannelState::Shutdown
    );

    let (second, _second_server) = tokio::join!(
        channel.wait_for_connection(),
        serve_once(&listener, Arc::clone(&registry), 2)
    );
    let pong: Pong = second.send_request(Ping).await.expect("pong");
    assert_eq!(pong, Pong { generation: 2 });
    assert_eq!(channel.current_state(), ChannelState::Ready);
}
