use anyhow::{bail, Context, Result};
use std::fs;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use workerd_types::{client, BackendAddress};

use crate::SharedBackend;

const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Admits one endpoint and answers its calls until the peer stops sending.
/// The endpoint stays in the registry afterwards, marked closed.
pub async fn serve_endpoint<R, W>(backend: SharedBackend, reader: R, writer: W)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let endpoint = {
        let mut registry = backend.registry();
        let writer_task = tokio::spawn(write_replies(writer, outbound_rx));
        registry.on_connect(outbound, Some(writer_task))
    };

    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                debug!("endpoint {endpoint} read failed: {err}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = backend.handle_line(&line);
        backend.deliver(endpoint, &response);
    }

    backend.registry().mark_closed(endpoint);
}

async fn write_replies<W>(mut writer: W, mut outbound: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(payload) = outbound.recv().await {
        let written = async {
            writer.write_all(payload.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = written {
            debug!("dropping replies for endpoint with failed writer: {err}");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Binds the backend socket, replacing a stale socket file left by a dead
/// daemon but refusing to steal one from a live daemon.
pub async fn bind_backend_socket(address: &BackendAddress) -> Result<UnixListener> {
    let socket_path = address.socket_path();
    if let Some(parent) = socket_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create socket directory: {}", parent.display()))?;
    }

    match UnixListener::bind(&socket_path) {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
            if backend_is_reachable(address).await {
                bail!(
                    "failed to bind socket: {} (another workerd instance is already running)",
                    socket_path.display()
                );
            }
            if socket_path.exists() {
                fs::remove_file(&socket_path).with_context(|| {
                    format!("failed to remove stale socket: {}", socket_path.display())
                })?;
            }
            UnixListener::bind(&socket_path)
                .with_context(|| format!("failed to bind socket: {}", socket_path.display()))
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to bind socket: {}", socket_path.display()))
        }
    }
}

async fn backend_is_reachable(address: &BackendAddress) -> bool {
    let Ok(client) = client::connect(address, Duration::from_millis(500)).await else {
        return false;
    };
    client.ping().await.map(|ping| ping.pong).unwrap_or(false)
}

/// Accepts endpoints until a signal arrives or a client calls `shutdown`.
pub async fn run(
    listener: UnixListener,
    backend: SharedBackend,
    sweep_interval: Duration,
) -> Result<()> {
    let mut shutdown = backend.subscribe_shutdown();
    let mut interrupt = signal(SignalKind::interrupt()).context("failed to watch SIGINT")?;
    let mut terminate = signal(SignalKind::terminate()).context("failed to watch SIGTERM")?;
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
    sweep.tick().await;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let (reader, writer) = stream.into_split();
                    backend.attach(reader, writer);
                }
                Err(err) => {
                    warn!("accept error: {err}");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
            _ = sweep.tick() => {
                let removed = backend.sweep_endpoints();
                if removed > 0 {
                    debug!("swept {removed} closed endpoints ({} left)", backend.endpoint_count());
                }
            }
            _ = shutdown.changed() => {
                info!("shutdown requested by client");
                break;
            }
            _ = interrupt.recv() => {
                info!("received SIGINT, initiating graceful shutdown");
                break;
            }
            _ = terminate.recv() => {
                info!("received SIGTERM, initiating graceful shutdown");
                break;
            }
        }
    }

    backend.close_endpoints(SHUTDOWN_GRACE).await;
    Ok(())
}
