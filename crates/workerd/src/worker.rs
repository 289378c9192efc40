use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use workerd_types::{
    Call, Port, PortMetadata, PortState, Response, RpcError, StatsResult, METHOD_ECHO,
    METHOD_LIST_PORTS, METHOD_PING, METHOD_REGISTER_PORT, METHOD_SET_PORT_STATE, METHOD_SHUTDOWN,
    METHOD_STATS, METHOD_UNREGISTER_PORT,
};

/// Process-wide backend state. Every endpoint shares one instance.
#[derive(Debug, Default)]
pub struct WorkerState {
    echo_count: u64,
    /// Registration order, which is also the order `listPorts` returns.
    ports: Vec<Port>,
}

impl WorkerState {
    pub fn echo(&mut self, message: &str) -> String {
        self.echo_count += 1;
        debug!("worker received: {message}");
        format!("WORKER #{}: {message}", self.echo_count)
    }

    pub fn calls(&self) -> u64 {
        self.echo_count
    }

    /// Adds the port, or refreshes state and metadata of a known id in place.
    pub fn register_port(&mut self, port: Port) {
        match self.ports.iter_mut().find(|known| known.id == port.id) {
            Some(known) => {
                known.state = port.state;
                known.metadata = port.metadata;
            }
            None => {
                info!("registered port {} ({})", port.id, port.state);
                self.ports.push(port);
            }
        }
    }

    /// Returns true when the id was unknown and got registered implicitly.
    pub fn set_port_state(&mut self, id: &str, state: PortState) -> bool {
        match self.ports.iter_mut().find(|known| known.id == id) {
            Some(known) => {
                known.state = state;
                false
            }
            None => {
                info!("port {id} set {state} before registering, adding it");
                self.ports.push(Port::new(id, state));
                true
            }
        }
    }

    pub fn unregister_port(&mut self, id: &str) -> bool {
        let before = self.ports.len();
        self.ports.retain(|known| known.id != id);
        before != self.ports.len()
    }

    pub fn list_ports(&self) -> Vec<Port> {
        self.ports.clone()
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }
}

/// Runs one call against the worker. The flag asks the daemon to stop.
pub fn handle_call(call: &Call, state: &mut WorkerState, endpoints: usize) -> (Response, bool) {
    let result = match call.method.as_str() {
        METHOD_PING => expect_arity(call, 0, 0).map(|()| {
            json!({
                "pong": true,
                "daemon": "workerd",
                "version": env!("CARGO_PKG_VERSION")
            })
        }),
        METHOD_SHUTDOWN => {
            return match expect_arity(call, 0, 0) {
                Ok(()) => (Response::ok(call.id, json!({"stopping": true})), true),
                Err(err) => (reject(call, err), false),
            };
        }
        METHOD_STATS => expect_arity(call, 0, 0).and_then(|()| {
            encode(StatsResult {
                calls: state.calls(),
                ports: state.port_count(),
                endpoints,
            })
        }),
        METHOD_ECHO => expect_arity(call, 1, 1)
            .and_then(|()| arg::<String>(call, 0, "message"))
            .map(|message| json!(state.echo(&message))),
        METHOD_REGISTER_PORT => expect_arity(call, 2, 3)
            .and_then(|()| {
                Ok(Port {
                    id: port_id_arg(call)?,
                    state: arg::<PortState>(call, 1, "state")?,
                    metadata: optional_arg::<PortMetadata>(call, 2, "metadata")?,
                })
            })
            .map(|port| {
                state.register_port(port);
                Value::Null
            }),
        METHOD_SET_PORT_STATE => expect_arity(call, 2, 2)
            .and_then(|()| Ok((port_id_arg(call)?, arg::<PortState>(call, 1, "state")?)))
            .map(|(id, port_state)| json!(state.set_port_state(&id, port_state))),
        METHOD_LIST_PORTS => {
            expect_arity(call, 0, 0).and_then(|()| encode(state.list_ports()))
        }
        METHOD_UNREGISTER_PORT => expect_arity(call, 1, 1)
            .and_then(|()| port_id_arg(call))
            .map(|id| json!(state.unregister_port(&id))),
        method => Err(RpcError::bad_request(format!("unknown method: {method}"))),
    };

    match result {
        Ok(value) => (Response::ok(call.id, value), false),
        Err(err) => (reject(call, err), false),
    }
}

fn reject(call: &Call, err: RpcError) -> Response {
    warn!("rejecting {} call {}: {err}", call.method, call.id);
    Response::err(call.id, &err)
}

fn encode<T: Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value)
        .map_err(|err| RpcError::Remote {
            kind: "internal".to_string(),
            message: format!("failed to encode result: {err}"),
        })
}

fn expect_arity(call: &Call, min: usize, max: usize) -> Result<(), RpcError> {
    let count = call.args.len();
    if (min..=max).contains(&count) {
        return Ok(());
    }
    let expected = if min == max {
        min.to_string()
    } else {
        format!("{min}..={max}")
    };
    Err(RpcError::bad_request(format!(
        "{} expects {expected} args, got {count}",
        call.method
    )))
}

fn arg<T: DeserializeOwned>(call: &Call, index: usize, name: &str) -> Result<T, RpcError> {
    let raw = call
        .args
        .get(index)
        .ok_or_else(|| RpcError::bad_request(format!("missing arg {name}")))?;
    serde_json::from_value(raw.clone())
        .map_err(|err| RpcError::bad_request(format!("invalid arg {name}: {err}")))
}

fn optional_arg<T: DeserializeOwned>(
    call: &Call,
    index: usize,
    name: &str,
) -> Result<Option<T>, RpcError> {
    match call.args.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => arg(call, index, name).map(Some),
    }
}

fn port_id_arg(call: &Call) -> Result<String, RpcError> {
    let id: String = arg(call, 0, "id")?;
    if id.trim().is_empty() {
        return Err(RpcError::bad_request("port id must not be empty"));
    }
    Ok(id)
}
