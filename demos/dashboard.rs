//! Stream a simulated analysis to every websocket client on 127.0.0.1:8000.
//!
//! `RUST_LOG=upbeat=debug cargo run --example dashboard`, then connect with any
//! websocket client, e.g. `websocat ws://127.0.0.1:8000/ws`.
//!
//! Set `UPBEAT_CONFIG` to a json config file and `STATUS_API` to a status
//! service base url to use them instead of the defaults.

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use upbeat::{
    api::StatusClient,
    fallback::{
        AnalysisSnapshot, AnalysisStatus, ResultItem, StatusError, StatusProvider, StatusReport,
    },
    transport::WebsocketTransport,
    Config, ConnectionManager, DisconnectReason, FallbackManager,
};

/// Status backend answering "running" for everything
#[derive(Debug)]
struct AlwaysRunning;

#[async_trait::async_trait]
impl StatusProvider for AlwaysRunning {
    async fn get_status(&self, _analysis_id: &str) -> Result<StatusReport, StatusError> {
        Ok(StatusReport {
            status: AnalysisStatus::Running,
            progress: Some(50.0),
            result: None,
        })
    }
}

fn snapshot(analysis_id: &str) -> AnalysisSnapshot {
    AnalysisSnapshot {
        analysis_id: analysis_id.to_string(),
        subject: Some("Acme Corp".to_string()),
        competitors: vec!["Globex".to_string(), "Initech".to_string(), "Umbrella".to_string()],
        results: vec![
            ResultItem {
                title: "Self serve tier".to_string(),
                description: "No competitor offers a low touch entry plan".to_string(),
                score: Some(0.82),
            },
            ResultItem {
                title: "EU data residency".to_string(),
                description: "Two competitors lost deals over hosting location".to_string(),
                score: Some(0.67),
            },
        ],
    }
}

async fn serve(
    manager: ConnectionManager,
    fallback: FallbackManager,
    socket: tokio::net::TcpStream,
    session_id: String,
) {
    let peer = socket
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    let (transport, mut incoming) = WebsocketTransport::new(socket);

    if let Err(err) = manager
        .connect(transport, session_id.clone(), json!({ "peer": peer }))
        .await
    {
        log::warn!("{}", err);
        fallback.activate_fallback(&err.to_string(), None).await;
        if let Some(notice) = fallback.get_user_feedback_message().await {
            log::info!("Notice for {}: {}", session_id, notice);
        }
        return;
    }

    let reader = {
        let manager = manager.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move {
            while let Some(frame) = incoming.next_frame().await {
                match frame {
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(message) => {
                        manager.record_received(&session_id, message.len()).await;
                    }
                }
            }
            manager
                .disconnect(&session_id, DisconnectReason::ClientInitiated)
                .await;
        })
    };

    let analysis_id = format!("analysis-{}", session_id);
    let mut events = Box::pin(fallback.simulate_streaming_events(snapshot(&analysis_id)));
    while let Some(event) = events.next().await {
        if !manager.send(&session_id, event).await && !manager.is_connected(&session_id).await {
            break;
        }
    }

    let _ = reader.await;

    if let Some(metrics) = manager.metrics(&session_id).await {
        log::info!(
            "Session {} done, {} events / {} bytes sent",
            session_id,
            metrics.messages_sent,
            metrics.bytes_sent
        );
    }
}

#[tokio::main]
async fn main() {
    pretty_env_logger::init();

    let config = match std::env::var("UPBEAT_CONFIG") {
        Ok(path) => Config::from_json_file(&path).await.unwrap_or_else(|err| {
            println!("Invalid config {}: {}", path, err);
            std::process::exit(1);
        }),
        Err(_) => Config::default(),
    };

    let status: Arc<dyn StatusProvider> = match std::env::var("STATUS_API") {
        Ok(base) => Arc::new(StatusClient::new(&base).unwrap()),
        Err(_) => Arc::new(AlwaysRunning),
    };

    let manager = ConnectionManager::new(config.streaming);
    let fallback = FallbackManager::new(config.fallback, status);
    manager.start_housekeeping().await;

    let listener = TcpListener::bind("127.0.0.1:8000").await.unwrap();
    log::info!("Listening on ws://127.0.0.1:8000");

    let mut next_id = 0u64;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, _) = accepted.unwrap();
                next_id += 1;
                tokio::spawn(serve(
                    manager.clone(),
                    fallback.clone(),
                    socket,
                    format!("session-{}", next_id),
                ));
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let report = manager.shutdown().await;
    log::info!(
        "Shutdown, {} connections closed, {} close errors",
        report.disconnected,
        report.errors.len()
    );
}
