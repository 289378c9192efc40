//! Shared backend for port clients and the dashboard.
//!
//! One [`SharedBackend`] owns the worker state and the connection registry.
//! Endpoints attach over a Unix socket ([`server`]) or in-process
//! ([`connect_in_process`]); either way every inbound call is handled one at
//! a time against the same state, and its reply goes back to the endpoint it
//! came from.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::io::{duplex, split, AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use workerd_types::client::RpcClient;
use workerd_types::{BackendAddress, Call, Response, RpcError};

pub mod registry;
pub mod server;
pub mod worker;

use registry::{ConnectionRegistry, EndpointId};
use worker::{handle_call, WorkerState};

const IN_PROCESS_BUFFER_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct SharedBackend {
    inner: Arc<BackendInner>,
}

struct BackendInner {
    worker: Mutex<WorkerState>,
    registry: Mutex<ConnectionRegistry>,
    shutdown: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SharedBackend {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(BackendInner {
                worker: Mutex::new(WorkerState::default()),
                registry: Mutex::new(ConnectionRegistry::default()),
                shutdown,
            }),
        }
    }

    /// Serves one endpoint until its reader closes. See [`server::serve_endpoint`].
    pub fn attach<R, W>(&self, reader: R, writer: W) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        tokio::spawn(server::serve_endpoint(self.clone(), reader, writer))
    }

    /// Opens an endpoint backed by an in-memory pipe instead of a socket.
    pub fn connect_in_process(&self, call_timeout: Duration) -> RpcClient {
        let (client_side, backend_side) = duplex(IN_PROCESS_BUFFER_BYTES);
        let (backend_read, backend_write) = split(backend_side);
        self.attach(backend_read, backend_write);
        let (client_read, client_write) = split(client_side);
        RpcClient::new(client_read, client_write, call_timeout)
    }

    /// Decodes and dispatches one inbound line.
    pub fn handle_line(&self, line: &str) -> Response {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => {
                warn!("rejecting unparseable call: {err}");
                return Response::err(0, &RpcError::bad_request(format!("invalid call JSON: {err}")));
            }
        };
        let id = value.get("id").and_then(Value::as_u64).unwrap_or(0);
        match serde_json::from_value::<Call>(value) {
            Ok(call) => self.dispatch(&call),
            Err(err) => {
                warn!("rejecting malformed call {id}: {err}");
                Response::err(id, &RpcError::bad_request(format!("invalid call shape: {err}")))
            }
        }
    }

    pub fn dispatch(&self, call: &Call) -> Response {
        let endpoints = lock(&self.inner.registry).len();
        let (response, should_shutdown) = {
            let mut worker = lock(&self.inner.worker);
            handle_call(call, &mut worker, endpoints)
        };
        if should_shutdown {
            info!("shutdown requested over call {}", call.id);
            self.inner.shutdown.send_replace(true);
        }
        response
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    pub(crate) fn registry(&self) -> MutexGuard<'_, ConnectionRegistry> {
        lock(&self.inner.registry)
    }

    pub fn deliver(&self, endpoint: EndpointId, response: &Response) -> bool {
        self.registry().deliver(endpoint, response)
    }

    pub fn sweep_endpoints(&self) -> usize {
        self.registry().sweep()
    }

    pub fn endpoint_count(&self) -> usize {
        self.registry().len()
    }

    pub fn open_endpoint_count(&self) -> usize {
        self.registry().open_count()
    }

    /// Closes all endpoints and waits up to `grace` for queued replies.
    pub async fn close_endpoints(&self, grace: Duration) {
        let writers = self.registry().close_all();
        let flush = async {
            for writer in writers {
                let _ = writer.await;
            }
        };
        if tokio::time::timeout(grace, flush).await.is_err() {
            warn!("endpoint writers did not flush within {grace:?}");
        }
    }
}

impl Default for SharedBackend {
    fn default() -> Self {
        Self::new()
    }
}

static SHARED_BACKENDS: OnceLock<Mutex<HashMap<BackendAddress, SharedBackend>>> = OnceLock::new();

/// The backend for `address` in this process, created on first lookup and
/// kept for the life of the process.
pub fn shared_backend(address: &BackendAddress) -> SharedBackend {
    let backends = SHARED_BACKENDS.get_or_init(|| Mutex::new(HashMap::new()));
    lock(backends)
        .entry(address.clone())
        .or_insert_with(|| {
            info!("starting shared backend {address}");
            SharedBackend::new()
        })
        .clone()
}

pub fn connect_in_process(address: &BackendAddress, call_timeout: Duration) -> RpcClient {
    shared_backend(address).connect_in_process(call_timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::collections::BTreeSet;
    use workerd_types::{Port, PortState};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn unique_address(label: &str) -> BackendAddress {
        BackendAddress::new("/in-process", format!("{label}-{}", uuid::Uuid::new_v4()))
    }

    fn counter(reply: &str) -> u64 {
        reply
            .strip_prefix("WORKER #")
            .and_then(|rest| rest.split(':').next())
            .and_then(|n| n.parse().ok())
            .unwrap_or_else(|| panic!("unexpected echo reply: {reply}"))
    }

    #[tokio::test]
    async fn counter_is_shared_across_endpoints() {
        let address = unique_address("shared-counter");
        let first = connect_in_process(&address, TIMEOUT);
        let second = connect_in_process(&address, TIMEOUT);

        assert_eq!(first.echo("A").await.unwrap(), "WORKER #1: A");
        assert_eq!(second.echo("B").await.unwrap(), "WORKER #2: B");
    }

    #[tokio::test]
    async fn sequential_echoes_on_one_endpoint_step_by_one() {
        let client = connect_in_process(&unique_address("sequential"), TIMEOUT);
        let x = counter(&client.echo("x").await.unwrap());
        let y = counter(&client.echo("y").await.unwrap());
        assert_eq!(y, x + 1);
    }

    #[tokio::test]
    async fn interleaved_echoes_hand_out_every_counter_once() {
        let address = unique_address("interleaved");
        let clients: Vec<RpcClient> = (0..4)
            .map(|_| connect_in_process(&address, TIMEOUT))
            .collect();

        let mut calls = Vec::new();
        for round in 0..5 {
            for (index, client) in clients.iter().enumerate() {
                calls.push(async move { client.echo(&format!("c{index}-r{round}")).await });
            }
        }
        let replies = join_all(calls).await;

        let counters: BTreeSet<u64> = replies
            .iter()
            .map(|reply| counter(reply.as_ref().unwrap()))
            .collect();
        assert_eq!(counters, (1..=20).collect::<BTreeSet<u64>>());
    }

    #[tokio::test]
    async fn concurrent_calls_on_two_endpoints_resolve_separately() {
        let address = unique_address("two-endpoints");
        let a = connect_in_process(&address, TIMEOUT);
        let b = connect_in_process(&address, TIMEOUT);

        let (reply_a, reply_b) = tokio::join!(a.echo("from a"), b.echo("from b"));
        assert!(reply_a.unwrap().ends_with(": from a"));
        assert!(reply_b.unwrap().ends_with(": from b"));
    }

    #[tokio::test]
    async fn same_address_yields_same_backend() {
        let address = unique_address("same");
        let first = shared_backend(&address);
        let second = shared_backend(&address);
        assert!(Arc::ptr_eq(&first.inner, &second.inner));

        let other = shared_backend(&unique_address("other"));
        assert!(!Arc::ptr_eq(&first.inner, &other.inner));
    }

    #[tokio::test]
    async fn port_states_are_visible_to_every_endpoint() {
        let address = unique_address("ports");
        let port = connect_in_process(&address, TIMEOUT);
        let dashboard = connect_in_process(&address, TIMEOUT);

        port.register_port(&Port::new("p1", PortState::On)).await.unwrap();
        port.set_port_state("p1", PortState::Off).await.unwrap();

        let ports = dashboard.list_ports().await.unwrap();
        assert_eq!(ports, vec![Port::new("p1", PortState::Off)]);
        assert!(workerd_types::has_off_ports(&ports));
    }

    #[tokio::test]
    async fn bad_request_keeps_the_endpoint_usable() {
        let client = connect_in_process(&unique_address("bad-request"), TIMEOUT);
        let err = client.call("nope", Vec::new()).await.unwrap_err();
        assert_eq!(err.kind(), "bad-request");
        assert_eq!(client.echo("still here").await.unwrap(), "WORKER #1: still here");
    }

    #[tokio::test]
    async fn garbage_lines_get_bad_request_with_id_zero() {
        let backend = SharedBackend::new();
        let response = backend.handle_line("{not json");
        assert_eq!(response.id, 0);
        assert_eq!(response.into_result().unwrap_err().kind(), "bad-request");

        let response = backend.handle_line(r#"{"id": 12, "method": 5}"#);
        assert_eq!(response.id, 12);
        assert!(!response.ok);
    }

    #[tokio::test]
    async fn shutdown_call_notifies_subscribers() {
        let backend = SharedBackend::new();
        let mut shutdown = backend.subscribe_shutdown();
        let client = backend.connect_in_process(TIMEOUT);
        client.shutdown().await.unwrap();
        shutdown.changed().await.unwrap();
        assert!(*shutdown.borrow());
    }

    #[tokio::test]
    async fn dropped_clients_leave_closed_entries_until_swept() {
        let backend = SharedBackend::new();
        let client = backend.connect_in_process(TIMEOUT);
        client.ping().await.unwrap();
        assert_eq!(backend.endpoint_count(), 1);

        drop(client);
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        while backend.open_endpoint_count() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "endpoint never closed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(backend.endpoint_count(), 1);
        assert_eq!(backend.sweep_endpoints(), 1);
        assert_eq!(backend.endpoint_count(), 0);
    }
}
