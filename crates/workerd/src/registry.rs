use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use workerd_types::Response;

pub type EndpointId = u64;

struct Endpoint {
    /// `None` once the endpoint is known to be closed.
    outbound: Option<mpsc::UnboundedSender<String>>,
    writer_task: Option<JoinHandle<()>>,
    connected_at: Instant,
}

impl Endpoint {
    fn is_open(&self) -> bool {
        self.outbound
            .as_ref()
            .is_some_and(|outbound| !outbound.is_closed())
    }
}

/// Every endpoint that ever attached. Entries are not removed when a peer
/// goes away, only marked closed; `sweep` drops closed ones.
#[derive(Default)]
pub struct ConnectionRegistry {
    next_id: EndpointId,
    endpoints: HashMap<EndpointId, Endpoint>,
}

impl ConnectionRegistry {
    pub fn on_connect(
        &mut self,
        outbound: mpsc::UnboundedSender<String>,
        writer_task: Option<JoinHandle<()>>,
    ) -> EndpointId {
        self.next_id += 1;
        let id = self.next_id;
        self.endpoints.insert(
            id,
            Endpoint {
                outbound: Some(outbound),
                writer_task,
                connected_at: Instant::now(),
            },
        );
        debug!("endpoint {id} connected ({} registered)", self.endpoints.len());
        id
    }

    /// Queues a reply for one endpoint only. Replies to a closed or unknown
    /// endpoint are dropped.
    pub fn deliver(&mut self, endpoint: EndpointId, response: &Response) -> bool {
        let Some(entry) = self.endpoints.get_mut(&endpoint) else {
            debug!("dropping reply {} for unknown endpoint {endpoint}", response.id);
            return false;
        };
        let Some(outbound) = entry.outbound.as_ref() else {
            debug!("dropping reply {} for closed endpoint {endpoint}", response.id);
            return false;
        };
        let payload = match serde_json::to_string(response) {
            Ok(payload) => payload,
            Err(err) => {
                debug!("dropping unencodable reply {}: {err}", response.id);
                return false;
            }
        };
        if outbound.send(payload).is_err() {
            debug!("endpoint {endpoint} writer is gone, dropping reply {}", response.id);
            entry.outbound = None;
            return false;
        }
        true
    }

    pub fn mark_closed(&mut self, endpoint: EndpointId) {
        if let Some(entry) = self.endpoints.get_mut(&endpoint) {
            entry.outbound = None;
            debug!(
                "endpoint {endpoint} closed after {:?}",
                entry.connected_at.elapsed()
            );
        }
    }

    pub fn is_open(&self, endpoint: EndpointId) -> bool {
        self.endpoints.get(&endpoint).is_some_and(Endpoint::is_open)
    }

    /// Drops closed entries and returns how many were removed.
    pub fn sweep(&mut self) -> usize {
        let before = self.endpoints.len();
        self.endpoints.retain(|_, endpoint| endpoint.is_open());
        before - self.endpoints.len()
    }

    /// Closes every endpoint and hands back the writer tasks so the caller
    /// can let queued replies flush.
    pub fn close_all(&mut self) -> Vec<JoinHandle<()>> {
        self.endpoints
            .values_mut()
            .filter_map(|endpoint| {
                endpoint.outbound = None;
                endpoint.writer_task.take()
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn open_count(&self) -> usize {
        self.endpoints.values().filter(|endpoint| endpoint.is_open()).count()
    }
}
