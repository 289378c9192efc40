use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub mod client;

pub const METHOD_PING: &str = "ping";
pub const METHOD_SHUTDOWN: &str = "shutdown";
pub const METHOD_STATS: &str = "stats";
pub const METHOD_ECHO: &str = "echo";
pub const METHOD_REGISTER_PORT: &str = "registerPort";
pub const METHOD_SET_PORT_STATE: &str = "setPortState";
pub const METHOD_LIST_PORTS: &str = "listPorts";
pub const METHOD_UNREGISTER_PORT: &str = "unregisterPort";

pub const DEFAULT_BACKEND_NAME: &str = "shared-worker-network-rpc";
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

pub const ERROR_KIND_CONNECTION_CLOSED: &str = "connection-closed";
pub const ERROR_KIND_BAD_REQUEST: &str = "bad-request";
pub const ERROR_KIND_TIMEOUT: &str = "timeout";
pub const ERROR_KIND_BAD_RESPONSE: &str = "bad-response";

/// One outbound call. `args` is positional, like a function call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn ok(id: u64, value: Value) -> Self {
        Self {
            id,
            ok: true,
            value: Some(value),
            error: None,
        }
    }

    pub fn err(id: u64, error: &RpcError) -> Self {
        Self {
            id,
            ok: false,
            value: None,
            error: Some(error.to_body()),
        }
    }

    pub fn into_result(self) -> Result<Value, RpcError> {
        if self.ok {
            return Ok(self.value.unwrap_or(Value::Null));
        }
        match self.error {
            Some(body) => Err(RpcError::from_body(body)),
            None => Err(RpcError::Decode(format!(
                "error reply {} carried no error body",
                self.id
            ))),
        }
    }
}

/// Failure of a single call, as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("malformed reply: {0}")]
    Decode(String),
    #[error("{kind}: {message}")]
    Remote { kind: String, message: String },
}

impl RpcError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::ConnectionClosed => ERROR_KIND_CONNECTION_CLOSED,
            Self::BadRequest(_) => ERROR_KIND_BAD_REQUEST,
            Self::Timeout(_) => ERROR_KIND_TIMEOUT,
            Self::Decode(_) => ERROR_KIND_BAD_RESPONSE,
            Self::Remote { kind, .. } => kind.as_str(),
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        let message = match self {
            Self::BadRequest(message) | Self::Decode(message) => message.clone(),
            Self::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };
        ErrorBody {
            kind: self.kind().to_string(),
            message,
        }
    }

    pub fn from_body(body: ErrorBody) -> Self {
        match body.kind.as_str() {
            ERROR_KIND_CONNECTION_CLOSED => Self::ConnectionClosed,
            ERROR_KIND_BAD_REQUEST => Self::BadRequest(body.message),
            ERROR_KIND_BAD_RESPONSE => Self::Decode(body.message),
            _ => Self::Remote {
                kind: body.kind,
                message: body.message,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    #[default]
    On,
    Off,
}

impl PortState {
    pub const fn toggled(self) -> Self {
        match self {
            Self::On => Self::Off,
            Self::Off => Self::On,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Unix milliseconds at port creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub id: String,
    #[serde(default)]
    pub state: PortState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PortMetadata>,
}

impl Port {
    pub fn new(id: impl Into<String>, state: PortState) -> Self {
        Self {
            id: id.into(),
            state,
            metadata: None,
        }
    }

    pub fn short_id(&self) -> &str {
        self.id.get(..8).unwrap_or(&self.id)
    }
}

/// True iff at least one port is off. Vacuously false for no ports.
pub fn has_off_ports(ports: &[Port]) -> bool {
    ports.iter().any(|port| port.state == PortState::Off)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResult {
    pub pong: bool,
    pub daemon: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsResult {
    pub calls: u64,
    pub ports: usize,
    pub endpoints: usize,
}

/// Where a shared backend lives: a runtime directory plus a logical name.
/// Every context using the same pair attaches to the same backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendAddress {
    pub locator: PathBuf,
    pub name: String,
}

impl BackendAddress {
    pub fn new(locator: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            name: name.into(),
        }
    }

    pub fn from_socket_path(socket_path: &Path) -> Self {
        let locator = socket_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = socket_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| DEFAULT_BACKEND_NAME.to_string());
        let name = file_name
            .strip_suffix(".sock")
            .map(str::to_string)
            .unwrap_or(file_name);
        Self { locator, name }
    }

    pub fn socket_path(&self) -> PathBuf {
        self.locator.join(format!("{}.sock", self.name))
    }

    /// Resolves the address from optional CLI overrides. An explicit socket
    /// path wins over locator/name.
    pub fn resolve(
        socket: Option<&Path>,
        runtime_dir: Option<PathBuf>,
        name: Option<String>,
    ) -> Self {
        if let Some(socket) = socket {
            return Self::from_socket_path(socket);
        }
        Self::new(
            runtime_dir.unwrap_or_else(default_runtime_dir),
            name.unwrap_or_else(|| DEFAULT_BACKEND_NAME.to_string()),
        )
    }
}

impl Default for BackendAddress {
    fn default() -> Self {
        Self::new(default_runtime_dir(), DEFAULT_BACKEND_NAME)
    }
}

impl fmt::Display for BackendAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_path().display())
    }
}

pub fn default_runtime_dir() -> PathBuf {
    if let Ok(runtime_dir) = env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir);
    }

    if let Some(data_dir) = dirs::data_local_dir() {
        return data_dir.join("workerd");
    }

    PathBuf::from(".workerd")
}

/// Per-call timeout from `WORKERD_CALL_TIMEOUT_MS`, if set and valid.
pub fn call_timeout_from_env() -> Option<Duration> {
    let raw = env::var("WORKERD_CALL_TIMEOUT_MS").ok()?;
    raw.trim().parse::<u64>().ok().map(Duration::from_millis)
}

pub fn resolve_call_timeout(flag_ms: Option<u64>) -> Duration {
    flag_ms
        .map(Duration::from_millis)
        .or_else(call_timeout_from_env)
        .unwrap_or(DEFAULT_CALL_TIMEOUT)
}
