use anyhow::{anyhow, bail, Context, Result};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    BackendAddress, Call, PingResult, Port, PortMetadata, PortState, Response, RpcError,
    StatsResult, METHOD_ECHO, METHOD_LIST_PORTS, METHOD_PING, METHOD_REGISTER_PORT,
    METHOD_SET_PORT_STATE, METHOD_SHUTDOWN, METHOD_STATS, METHOD_UNREGISTER_PORT,
};

type PendingReply = oneshot::Sender<Result<Value, RpcError>>;

#[derive(Default)]
struct PendingCalls {
    calls: HashMap<u64, PendingReply>,
    closed: bool,
}

impl PendingCalls {
    fn fail_all(&mut self) {
        self.closed = true;
        for (_, reply) in self.calls.drain() {
            let _ = reply.send(Err(RpcError::ConnectionClosed));
        }
    }
}

fn lock(pending: &Mutex<PendingCalls>) -> MutexGuard<'_, PendingCalls> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Caller side of one endpoint. Any number of calls may be in flight at
/// once; each is matched to its reply by correlation id only.
pub struct RpcClient {
    outbound: mpsc::UnboundedSender<String>,
    pending: Arc<Mutex<PendingCalls>>,
    next_id: AtomicU64,
    call_timeout: Duration,
    reader_task: JoinHandle<()>,
}

impl RpcClient {
    pub fn new<R, W>(reader: R, writer: W, call_timeout: Duration) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending = Arc::new(Mutex::new(PendingCalls::default()));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_calls(writer, outbound_rx, pending.clone()));
        let reader_task = tokio::spawn(read_replies(reader, pending.clone()));
        Self {
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            call_timeout,
            reader_task,
        }
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.pending).closed
    }

    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = serde_json::to_string(&Call {
            id,
            method: method.to_string(),
            args,
        })
        .map_err(|err| RpcError::bad_request(format!("failed to encode {method} call: {err}")))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.closed {
                return Err(RpcError::ConnectionClosed);
            }
            pending.calls.insert(id, reply_tx);
        }

        if self.outbound.send(payload).is_err() {
            self.forget(id);
            return Err(RpcError::ConnectionClosed);
        }

        match tokio::time::timeout(self.call_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::ConnectionClosed),
            Err(_) => {
                self.forget(id);
                warn!("{method} call {id} timed out after {:?}", self.call_timeout);
                Err(RpcError::Timeout(self.call_timeout))
            }
        }
    }

    pub async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<T, RpcError> {
        let value = self.call(method, args).await?;
        serde_json::from_value(value)
            .map_err(|err| RpcError::Decode(format!("unexpected {method} result: {err}")))
    }

    pub async fn echo(&self, message: &str) -> Result<String, RpcError> {
        self.call_as(METHOD_ECHO, vec![json!(message)]).await
    }

    pub async fn register_port(&self, port: &Port) -> Result<(), RpcError> {
        let mut args = vec![json!(port.id), json!(port.state)];
        if let Some(metadata) = &port.metadata {
            args.push(json!(metadata));
        }
        self.call(METHOD_REGISTER_PORT, args).await.map(|_| ())
    }

    /// Returns `true` when the backend did not know the port and added it.
    pub async fn set_port_state(&self, id: &str, state: PortState) -> Result<bool, RpcError> {
        self.call_as(METHOD_SET_PORT_STATE, vec![json!(id), json!(state)])
            .await
    }

    pub async fn list_ports(&self) -> Result<Vec<Port>, RpcError> {
        self.call_as(METHOD_LIST_PORTS, Vec::new()).await
    }

    pub async fn unregister_port(&self, id: &str) -> Result<bool, RpcError> {
        self.call_as(METHOD_UNREGISTER_PORT, vec![json!(id)]).await
    }

    pub async fn ping(&self) -> Result<PingResult, RpcError> {
        self.call_as(METHOD_PING, Vec::new()).await
    }

    pub async fn stats(&self) -> Result<StatsResult, RpcError> {
        self.call_as(METHOD_STATS, Vec::new()).await
    }

    pub async fn shutdown(&self) -> Result<(), RpcError> {
        self.call(METHOD_SHUTDOWN, Vec::new()).await.map(|_| ())
    }

    fn forget(&self, id: u64) {
        lock(&self.pending).calls.remove(&id);
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn write_calls<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<String>,
    pending: Arc<Mutex<PendingCalls>>,
) where
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
            debug!("endpoint write failed: {err}");
            lock(&pending).fail_all();
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_replies<R>(reader: R, pending: Arc<Mutex<PendingCalls>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                debug!("endpoint read failed: {err}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response: Response = match serde_json::from_str(&line) {
            Ok(response) => response,
            Err(err) => {
                warn!("dropping unparseable reply: {err}");
                continue;
            }
        };

        let reply = lock(&pending).calls.remove(&response.id);
        match reply {
            Some(reply) => {
                let _ = reply.send(response.into_result());
            }
            None => warn!(
                "dropping reply with unknown correlation id {}",
                response.id
            ),
        }
    }
    lock(&pending).fail_all();
}

pub async fn connect(address: &BackendAddress, call_timeout: Duration) -> Result<RpcClient> {
    let socket_path = address.socket_path();
    let stream = UnixStream::connect(&socket_path)
        .await
        .with_context(|| format!("failed to connect to socket {}", socket_path.display()))?;
    let (reader, writer) = stream.into_split();
    Ok(RpcClient::new(reader, writer, call_timeout))
}

pub struct AutostartClient {
    pub client: RpcClient,
    pub daemon_was_started: bool,
}

/// Connects to the backend, starting it first when nothing is listening.
pub async fn connect_with_autostart(
    address: &BackendAddress,
    call_timeout: Duration,
    autostart: bool,
) -> Result<AutostartClient> {
    match connect(address, call_timeout).await {
        Ok(client) => Ok(AutostartClient {
            client,
            daemon_was_started: false,
        }),
        Err(_) if autostart => {
            eprintln!("backend unavailable, starting workerd...");
            start_daemon(address)?;
            wait_for_ping(address, Duration::from_secs(3)).await?;
            let client = connect(address, call_timeout).await?;
            Ok(AutostartClient {
                client,
                daemon_was_started: true,
            })
        }
        Err(err) => Err(err),
    }
}

const PING_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Pings the backend until it answers or `timeout` runs out.
pub async fn wait_for_ping(address: &BackendAddress, timeout: Duration) -> Result<PingResult> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match ping_once(address).await {
            Ok(ping) => return Ok(ping),
            Err(err) if tokio::time::Instant::now() >= deadline => {
                return Err(err.context(format!(
                    "backend at {address} did not answer ping within {timeout:?}"
                )));
            }
            Err(_) => tokio::time::sleep(PING_RETRY_DELAY).await,
        }
    }
}

async fn ping_once(address: &BackendAddress) -> Result<PingResult> {
    let client = connect(address, Duration::from_millis(500)).await?;
    let ping = client.ping().await.context("ping failed")?;
    if !ping.pong {
        bail!("backend answered ping without pong");
    }
    Ok(ping)
}

/// A way to start the backend: a program plus the arguments that go before
/// `--socket <path>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonLauncher {
    pub program: PathBuf,
    pub leading_args: Vec<&'static str>,
}

impl DaemonLauncher {
    fn direct(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }
}

/// Launchers in the order they are tried: `workerd` on PATH, a build next to
/// the current executable, then `cargo run` from a checkout.
pub fn daemon_launchers() -> Vec<DaemonLauncher> {
    let mut launchers = vec![DaemonLauncher::direct(workerd_binary_name())];
    launchers.extend(detect_local_workerd_binary().map(DaemonLauncher::direct));
    launchers.push(DaemonLauncher {
        program: PathBuf::from("cargo"),
        leading_args: vec!["run", "-q", "-p", "workerd", "--"],
    });
    launchers
}

/// Spawns a detached backend for `address` with the first launcher that
/// starts. Does not wait for it to answer; see [`wait_for_ping`].
pub fn start_daemon(address: &BackendAddress) -> Result<()> {
    let socket_path = address.socket_path();
    let mut last_error = None;

    for launcher in daemon_launchers() {
        let spawned = Command::new(&launcher.program)
            .args(&launcher.leading_args)
            .arg("--socket")
            .arg(&socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            Ok(_) => {
                debug!("started backend for {address} with {}", launcher.program.display());
                return Ok(());
            }
            Err(err) => {
                debug!("could not run {}: {err}", launcher.program.display());
                last_error = Some(
                    anyhow::Error::new(err)
                        .context(format!("failed to spawn {}", launcher.program.display())),
                );
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow!("no way to start workerd")))
}

/// A `workerd` binary in the current executable's directory or the one above
/// it, as laid out by a cargo target directory.
pub fn detect_local_workerd_binary() -> Option<PathBuf> {
    let current_exe = std::env::current_exe().ok()?;
    current_exe
        .ancestors()
        .skip(1)
        .take(2)
        .map(|dir| dir.join(workerd_binary_name()))
        .find(|candidate| candidate.is_file())
}

pub const fn workerd_binary_name() -> &'static str {
    if cfg!(windows) {
        "workerd.exe"
    } else {
        "workerd"
    }
}
