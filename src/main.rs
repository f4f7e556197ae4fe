//! Skyrocket Server Binary
//!
//! Wires the round server to in-process ledger and history stores and
//! runs it until interrupted. Production deployments replace the
//! memory stores with platform-backed implementations of the same
//! traits.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use skyrocket::game::round::RoundConfig;
use skyrocket::ledger::{MemoryHistory, MemoryLedger};
use skyrocket::network::server::{GameServer, ServerConfig};
use skyrocket::VERSION;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env();
    let round = RoundConfig::from_env();

    info!("Skyrocket Server v{}", VERSION);
    info!(
        countdown_secs = round.countdown_secs,
        flight_tick_ms = round.flight_tick.as_millis() as u64,
        crash_pause_ms = round.crash_pause.as_millis() as u64,
        min_bet = round.min_bet,
        "round configuration"
    );

    // Demo deployment: in-process stores. Real deployments implement
    // BalanceLedger / RoundHistorySink against the platform's datastore.
    let ledger = Arc::new(MemoryLedger::new());
    let history = Arc::new(MemoryHistory::new());

    let health_addr = config.health_addr;
    let server = Arc::new(GameServer::new(config, round, ledger, history));

    tokio::spawn(run_health_listener(server.clone(), health_addr));

    let run_server = server.clone();
    let server_handle = tokio::spawn(async move { run_server.run().await });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("interrupt received, shutting down");
    server.shutdown();

    server_handle
        .await
        .context("server task panicked")?
        .context("server exited with error")?;

    Ok(())
}

/// Answer liveness and readiness probes with a minimal HTTP listener.
///
/// `/healthz` says the process is up; `/readyz` reports the current
/// round and connection count once the room is serving.
async fn run_health_listener(server: Arc<GameServer>, addr: SocketAddr) {
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("health listener failed to bind {}: {}", addr, e);
            return;
        }
    };
    info!("health listener on {}", addr);

    loop {
        let (mut stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("health accept error: {}", e);
                continue;
            }
        };

        let server = server.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let n = match stream.read(&mut buf).await {
                Ok(n) => n,
                Err(_) => return,
            };
            let request = String::from_utf8_lossy(&buf[..n]);
            let path = request
                .lines()
                .next()
                .and_then(|line| line.split_whitespace().nth(1))
                .unwrap_or("/");

            let response = match path {
                "/healthz" => http_response("200 OK", "ok\n"),
                "/readyz" => {
                    let status = server.room_status().await;
                    let body = serde_json::json!({
                        "roundId": status.round_id,
                        "phase": status.phase.as_str(),
                        "sessions": status.sessions,
                        "bets": status.bets,
                        "connections": server.connection_count().await,
                    });
                    http_response("200 OK", &format!("{}\n", body))
                }
                _ => http_response("404 Not Found", "not found\n"),
            };

            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}

fn http_response(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    )
}
