use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use sy_core::config::Config;
use sy_daemon::daemon::{run_maintenance, Daemon, DaemonIntervals};
use sy_daemon::shutdown::ShutdownSignal;
use tokio_tungstenite::tungstenite::Message;

fn quiet_config() -> Config {
    let mut config = Config::default();
    config.agents.clear();
    config.executor.enabled = false;
    config
}

/// Start a daemon on an ephemeral port; returns its address.
async fn start(config: Config) -> (String, Arc<Daemon>, tokio::task::JoinHandle<anyhow::Result<()>>) {
    let daemon = Arc::new(Daemon::new(config).unwrap());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind to ephemeral port");
    let addr = listener.local_addr().unwrap();
    let runner = daemon.clone();
    let handle = tokio::spawn(async move { runner.run_with_listener(listener).await });
    (addr.to_string(), daemon, handle)
}

#[tokio::test]
async fn serves_health_and_stops_on_shutdown() {
    let (addr, daemon, handle) = start(quiet_config()).await;

    let body: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 0);
    assert!(body["agents"].as_array().unwrap().is_empty());

    daemon.shutdown();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("daemon did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn websocket_clients_can_open_sessions() {
    let (addr, daemon, handle) = start(quiet_config()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();

    ws.send(Message::Text(
        r#"{"kind":"control","payload":{"action":"open","title":"daemon"}}"#.into(),
    ))
    .await
    .unwrap();

    let mut types = Vec::new();
    while types.len() < 3 {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Text(text) = msg {
            let frame: Value = serde_json::from_str(text.as_str()).unwrap();
            types.push(frame["type"].as_str().unwrap().to_string());
        }
    }
    assert_eq!(types, vec!["hello", "attached", "replay"]);
    assert_eq!(daemon.gateway().registry().list()[0].title, "daemon");

    // Shutdown must not hang on the open socket.
    daemon.shutdown();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("daemon did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn maintenance_reaps_detached_sessions() {
    let daemon = Daemon::new(quiet_config()).unwrap();
    let gateway = daemon.gateway().clone();
    let sid = gateway.registry().create(None);

    let shutdown = ShutdownSignal::new();
    let intervals = DaemonIntervals {
        reap_every: Duration::from_secs(10),
        detached_grace: Duration::from_secs(30),
        sweep_every: Duration::from_secs(10),
        liveness_grace: Duration::from_secs(90),
    };
    let loop_handle = tokio::spawn(run_maintenance(gateway.clone(), intervals, shutdown.clone()));

    tokio::time::sleep(Duration::from_secs(25)).await;
    assert!(gateway.registry().get(sid).is_ok());

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(gateway.registry().get(sid).is_err());

    shutdown.trigger();
    loop_handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn maintenance_drops_silent_connections() {
    let daemon = Daemon::new(quiet_config()).unwrap();
    let gateway = daemon.gateway().clone();
    let (conn, _rx) = gateway.connect();

    let shutdown = ShutdownSignal::new();
    let intervals = DaemonIntervals {
        reap_every: Duration::from_secs(60),
        detached_grace: Duration::from_secs(1800),
        sweep_every: Duration::from_secs(5),
        liveness_grace: Duration::from_secs(20),
    };
    let loop_handle = tokio::spawn(run_maintenance(gateway.clone(), intervals, shutdown.clone()));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(conn.is_closed());
    assert_eq!(gateway.connection_count(), 0);

    shutdown.trigger();
    loop_handle.await.unwrap();
}
