use serde_json::{json, Value};
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use workerd_types::client::{self, RpcClient};
use workerd_types::{
    has_off_ports, BackendAddress, Port, PortState, RpcError, METHOD_ECHO, METHOD_SHUTDOWN,
};

const CALL_TIMEOUT: Duration = Duration::from_secs(5);

struct DaemonHarness {
    child: Child,
    root_dir: PathBuf,
    address: BackendAddress,
}

impl DaemonHarness {
    async fn start(label: &str) -> Self {
        let root_dir = unique_temp_dir(label);
        fs::create_dir_all(&root_dir).expect("failed to create harness directory");
        let address = BackendAddress::new(&root_dir, "workerd-it");

        let child = Command::new(env!("CARGO_BIN_EXE_workerd"))
            .arg("--socket")
            .arg(address.socket_path())
            .env("WORKERD_LOG", "warn")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn workerd binary");

        let harness = Self {
            child,
            root_dir,
            address,
        };
        client::wait_for_ping(&harness.address, Duration::from_secs(5))
            .await
            .expect("timed out waiting for daemon to respond to ping");
        harness
    }

    async fn connect(&self) -> RpcClient {
        client::connect(&self.address, CALL_TIMEOUT)
            .await
            .expect("failed to connect to daemon")
    }

    fn socket_path(&self) -> PathBuf {
        self.address.socket_path()
    }

    fn wait_for_exit(&mut self) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while std::time::Instant::now() < deadline {
            match self.child.try_wait() {
                Ok(Some(_)) => return true,
                Ok(None) => thread::sleep(Duration::from_millis(50)),
                Err(_) => return false,
            }
        }
        false
    }
}

impl Drop for DaemonHarness {
    fn drop(&mut self) {
        let _ = raw_request(&self.socket_path(), &json!({"id": 1, "method": METHOD_SHUTDOWN}));
        if !self.wait_for_exit() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
        let _ = fs::remove_dir_all(&self.root_dir);
    }
}

#[tokio::test]
async fn echo_counter_is_shared_between_connections() {
    let harness = DaemonHarness::start("shared-counter").await;
    let first = harness.connect().await;
    let second = harness.connect().await;

    assert_eq!(first.echo("A").await.unwrap(), "WORKER #1: A");
    assert_eq!(second.echo("B").await.unwrap(), "WORKER #2: B");
    assert_eq!(first.echo("C").await.unwrap(), "WORKER #3: C");

    let stats = second.stats().await.unwrap();
    assert_eq!(stats.calls, 3);
    assert!(stats.endpoints >= 2);
}

#[tokio::test]
async fn wire_messages_use_the_documented_shapes() {
    let harness = DaemonHarness::start("wire-shapes").await;
    let socket_path = harness.socket_path();

    let ok = raw_request(
        &socket_path,
        &json!({"id": 41, "method": METHOD_ECHO, "args": ["hi"]}),
    )
    .unwrap();
    assert_eq!(ok, json!({"id": 41, "ok": true, "value": "WORKER #1: hi"}));

    let unknown = raw_request(&socket_path, &json!({"id": 42, "method": "teleport"})).unwrap();
    assert_eq!(unknown["id"], json!(42));
    assert_eq!(unknown["ok"], json!(false));
    assert_eq!(unknown["error"]["kind"], json!("bad-request"));
    assert_eq!(unknown["error"]["message"], json!("unknown method: teleport"));

    let garbage = raw_line(&socket_path, "this is not json").unwrap();
    assert_eq!(garbage["id"], json!(0));
    assert_eq!(garbage["error"]["kind"], json!("bad-request"));
}

#[tokio::test]
async fn port_states_reach_a_polling_dashboard() {
    let harness = DaemonHarness::start("port-states").await;
    let port_a = harness.connect().await;
    let port_b = harness.connect().await;
    let dashboard = harness.connect().await;

    assert!(dashboard.list_ports().await.unwrap().is_empty());

    port_a
        .register_port(&Port::new("port-a", PortState::On))
        .await
        .unwrap();
    port_b
        .register_port(&Port::new("port-b", PortState::On))
        .await
        .unwrap();
    assert!(!has_off_ports(&dashboard.list_ports().await.unwrap()));

    assert!(!port_b.set_port_state("port-b", PortState::Off).await.unwrap());
    let ports = dashboard.list_ports().await.unwrap();
    assert_eq!(
        ports.iter().map(|port| port.id.as_str()).collect::<Vec<_>>(),
        ["port-a", "port-b"]
    );
    assert!(has_off_ports(&ports));

    port_b.set_port_state("port-b", PortState::On).await.unwrap();
    assert!(!has_off_ports(&dashboard.list_ports().await.unwrap()));

    assert!(port_a.unregister_port("port-a").await.unwrap());
    assert_eq!(dashboard.list_ports().await.unwrap().len(), 1);
}

#[tokio::test]
async fn calls_fail_with_connection_closed_after_backend_exits() {
    let mut harness = DaemonHarness::start("backend-exit").await;
    let survivor = harness.connect().await;
    assert!(survivor.ping().await.unwrap().pong);

    let stopper = harness.connect().await;
    stopper.shutdown().await.unwrap();
    assert!(harness.wait_for_exit(), "daemon did not exit after shutdown");
    assert!(!harness.socket_path().exists());

    let err = survivor.echo("anyone there?").await.unwrap_err();
    assert_eq!(err, RpcError::ConnectionClosed);
}

#[tokio::test]
async fn second_daemon_refuses_a_live_socket() {
    let harness = DaemonHarness::start("second-daemon").await;
    let status = Command::new(env!("CARGO_BIN_EXE_workerd"))
        .arg("--socket")
        .arg(harness.socket_path())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .expect("failed to run second workerd");
    assert!(!status.success());

    let client = harness.connect().await;
    assert!(client.ping().await.unwrap().pong);
}

fn raw_request(socket_path: &Path, call: &Value) -> Result<Value, String> {
    let line =
        serde_json::to_string(call).map_err(|err| format!("failed to serialize call: {err}"))?;
    raw_line(socket_path, &line)
}

fn raw_line(socket_path: &Path, line: &str) -> Result<Value, String> {
    let stream = UnixStream::connect(socket_path)
        .map_err(|err| format!("failed to connect to {}: {err}", socket_path.display()))?;
    stream
        .set_read_timeout(Some(CALL_TIMEOUT))
        .map_err(|err| format!("failed to set read timeout: {err}"))?;
    let mut writer = BufWriter::new(
        stream
            .try_clone()
            .map_err(|err| format!("failed to clone socket stream: {err}"))?,
    );
    let mut reader = BufReader::new(stream);

    writer
        .write_all(line.as_bytes())
        .and_then(|()| writer.write_all(b"\n"))
        .and_then(|()| writer.flush())
        .map_err(|err| format!("failed to write call: {err}"))?;

    let mut reply = String::new();
    reader
        .read_line(&mut reply)
        .map_err(|err| format!("failed to read daemon reply: {err}"))?;
    if reply.trim().is_empty() {
        return Err("daemon returned empty reply".to_string());
    }

    serde_json::from_str(&reply).map_err(|err| format!("failed to parse daemon reply JSON: {err}"))
}

fn unique_temp_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock drift before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("workerd-it-{label}-{nanos}"))
}
