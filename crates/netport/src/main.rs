use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use std::io::Write as _;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};
use uuid::Uuid;
use workerd_types::client::{self, RpcClient};
use workerd_types::{
    resolve_call_timeout, BackendAddress, Port, PortMetadata, PortState, RpcError,
};

#[derive(Debug, Parser)]
#[command(name = "netport", version, about = "Port client for the shared worker backend")]
struct Cli {
    #[arg(long)]
    socket: Option<PathBuf>,
    #[arg(long)]
    runtime_dir: Option<PathBuf>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    call_timeout_ms: Option<u64>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Args)]
struct AutostartArgs {
    #[arg(long = "autostart", default_value_t = true, action = ArgAction::Set)]
    autostart: bool,
    #[arg(long = "no-autostart")]
    no_autostart: bool,
}

impl AutostartArgs {
    fn resolve(&self) -> bool {
        self.autostart && !self.no_autostart
    }
}

impl Default for AutostartArgs {
    fn default() -> Self {
        Self {
            autostart: true,
            no_autostart: false,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Open an interactive port with an on/off toggle (the default).
    Run {
        /// Start in the off state.
        #[arg(long, default_value_t = false)]
        off: bool,
        #[command(flatten)]
        autostart: AutostartArgs,
    },
    /// Call echo once and print the reply.
    Echo {
        message: String,
        #[command(flatten)]
        autostart: AutostartArgs,
    },
    /// List ports known to the backend.
    List {
        #[command(flatten)]
        autostart: AutostartArgs,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Ping backend health.
    Ping {
        #[command(flatten)]
        autostart: AutostartArgs,
    },
    /// Manage the backend process.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DaemonCommand {
    Start,
    Stop,
    Status,
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let address = BackendAddress::resolve(cli.socket.as_deref(), cli.runtime_dir, cli.name);
    let call_timeout = resolve_call_timeout(cli.call_timeout_ms);
    let command = cli.command.unwrap_or(Commands::Run {
        off: false,
        autostart: AutostartArgs::default(),
    });

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async move {
        match command {
            Commands::Run { off, autostart } => {
                let initial = if off { PortState::Off } else { PortState::On };
                cmd_run(&address, call_timeout, initial, autostart.resolve()).await
            }
            Commands::Echo { message, autostart } => {
                cmd_echo(&address, call_timeout, &message, autostart.resolve()).await
            }
            Commands::List { autostart, json } => {
                cmd_list(&address, call_timeout, autostart.resolve(), json).await
            }
            Commands::Ping { autostart } => {
                cmd_ping(&address, call_timeout, autostart.resolve()).await
            }
            Commands::Daemon { command } => match command {
                DaemonCommand::Start => cmd_start(&address).await,
                DaemonCommand::Stop => cmd_stop(&address, call_timeout).await,
                DaemonCommand::Status => cmd_daemon_status(&address, call_timeout).await,
            },
        }
    })
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            std::env::var("NETPORT_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or_else(|_| "warn".to_string()),
        )
        .try_init();
}

async fn connect(
    address: &BackendAddress,
    call_timeout: Duration,
    autostart: bool,
) -> Result<RpcClient> {
    let connected = client::connect_with_autostart(address, call_timeout, autostart).await?;
    if connected.daemon_was_started {
        debug!("started backend at {address}");
    }
    Ok(connected.client)
}

/// One port: a stable id, a local on/off flag and the last echo reply.
///
/// The connection is opened lazily and reopened when the backend goes away;
/// each new connection registers the port again with its current state.
struct PortSession {
    address: BackendAddress,
    call_timeout: Duration,
    autostart: bool,
    client: Option<RpcClient>,
    port: Port,
    echo_output: String,
    last_error: Option<String>,
}

impl PortSession {
    fn new(
        address: BackendAddress,
        call_timeout: Duration,
        autostart: bool,
        initial: PortState,
    ) -> Self {
        let url = format!("unix://{address}");
        Self {
            address,
            call_timeout,
            autostart,
            client: None,
            port: Port {
                id: Uuid::new_v4().to_string(),
                state: initial,
                metadata: Some(PortMetadata {
                    url: Some(url),
                    timestamp: Some(unix_millis()),
                }),
            },
            echo_output: String::new(),
            last_error: None,
        }
    }

    /// Returns `true` when a new connection was opened, in which case the
    /// port has just been registered on it.
    async fn ensure_connected(&mut self) -> Result<bool, String> {
        if self.client.as_ref().is_some_and(|client| !client.is_closed()) {
            return Ok(false);
        }
        self.client = None;
        let client = connect(&self.address, self.call_timeout, self.autostart)
            .await
            .map_err(|err| format!("{err:#}"))?;
        client
            .register_port(&self.port)
            .await
            .map_err(|err| err.to_string())?;
        debug!("port {} registered at {}", self.port.id, self.address);
        self.client = Some(client);
        Ok(true)
    }

    async fn register(&mut self) -> Result<(), String> {
        let result = self.register_on_live_connection().await;
        self.record(&result);
        result
    }

    async fn register_on_live_connection(&mut self) -> Result<(), String> {
        if self.ensure_connected().await? {
            return Ok(());
        }
        let Some(client) = self.client.as_ref() else {
            return Err(RpcError::ConnectionClosed.to_string());
        };
        client
            .register_port(&self.port)
            .await
            .map_err(|err| err.to_string())
    }

    /// Flips the local flag immediately, then reports it to the backend. A
    /// failed report keeps the local flip.
    async fn toggle(&mut self) -> PortState {
        self.port.state = self.port.state.toggled();
        let result = self.report_state().await;
        self.record(&result);
        self.port.state
    }

    /// Sends the local state, reconnecting once if the connection turns out
    /// to be closed.
    async fn report_state(&mut self) -> Result<(), String> {
        if self.ensure_connected().await? {
            return Ok(());
        }
        let Some(client) = self.client.as_ref() else {
            return Err(RpcError::ConnectionClosed.to_string());
        };
        let result = client.set_port_state(&self.port.id, self.port.state).await;
        match result {
            Ok(added) => {
                if added {
                    debug!("backend had no record of port {}", self.port.id);
                }
                Ok(())
            }
            Err(RpcError::ConnectionClosed) => {
                self.client = None;
                self.ensure_connected().await.map(|_| ())
            }
            Err(err) => Err(err.to_string()),
        }
    }

    async fn echo_test(&mut self, message: &str) {
        let result = match self.ensure_connected().await {
            Ok(_) => match self.client.as_ref() {
                Some(client) => client.echo(message).await.map_err(|err| err.to_string()),
                None => Err(RpcError::ConnectionClosed.to_string()),
            },
            Err(err) => Err(err),
        };
        match result {
            Ok(reply) => {
                self.echo_output = reply;
                self.last_error = None;
            }
            Err(err) => {
                self.echo_output = format!("error: {err}");
                self.last_error = Some(err);
            }
        }
    }

    fn clear_echo(&mut self) {
        self.echo_output.clear();
    }

    async fn close(self) {
        let Some(client) = self.client.filter(|client| !client.is_closed()) else {
            return;
        };
        if let Err(err) = client.unregister_port(&self.port.id).await {
            warn!("failed to unregister port {}: {err}", self.port.id);
        }
    }

    fn record<T>(&mut self, result: &Result<T, String>) {
        self.last_error = result.as_ref().err().cloned();
    }

    fn status_line(&self) -> String {
        let mut line = format!(
            "port {} | status: {}",
            self.port.short_id(),
            self.port.state.as_str().to_uppercase()
        );
        if !self.echo_output.is_empty() {
            line.push_str(&format!(" | echo: {}", self.echo_output));
        }
        if let Some(err) = &self.last_error {
            line.push_str(&format!(" | error: {err}"));
        }
        line
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionCommand {
    Toggle,
    Echo(String),
    Clear,
    Status,
    Help,
    Quit,
}

fn parse_command(line: &str) -> Result<SessionCommand, String> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    match word {
        "t" | "toggle" => Ok(SessionCommand::Toggle),
        "e" | "echo" => {
            if rest.is_empty() {
                Err("echo needs a message".to_string())
            } else {
                Ok(SessionCommand::Echo(rest.to_string()))
            }
        }
        "c" | "clear" => Ok(SessionCommand::Clear),
        "s" | "status" | "" => Ok(SessionCommand::Status),
        "?" | "h" | "help" => Ok(SessionCommand::Help),
        "q" | "quit" | "exit" => Ok(SessionCommand::Quit),
        other => Err(format!("unknown command: {other} (try ?)")),
    }
}

const SESSION_HELP: &str = "\
Commands:

  t, toggle        Flip this port on/off
  e, echo <msg>    Send an echo test to the backend
  c, clear         Clear the echo output
  s, status        Show port status
  ?, help          Show this help
  q, quit          Unregister and exit";

async fn cmd_run(
    address: &BackendAddress,
    call_timeout: Duration,
    initial: PortState,
    autostart: bool,
) -> Result<()> {
    let mut session = PortSession::new(address.clone(), call_timeout, autostart, initial);
    if let Err(err) = session.register().await {
        bail!("failed to register port: {err}");
    }

    println!("Port Interface");
    println!("ID: {}", session.port.id);
    println!("URL: unix://{address}");
    println!("{SESSION_HELP}");
    println!("{}", session.status_line());
    prompt();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        match parse_command(&line) {
            Ok(SessionCommand::Toggle) => {
                session.toggle().await;
            }
            Ok(SessionCommand::Echo(message)) => session.echo_test(&message).await,
            Ok(SessionCommand::Clear) => session.clear_echo(),
            Ok(SessionCommand::Status) => {}
            Ok(SessionCommand::Help) => println!("{SESSION_HELP}"),
            Ok(SessionCommand::Quit) => break,
            Err(message) => println!("{message}"),
        }
        println!("{}", session.status_line());
        prompt();
    }

    session.close().await;
    Ok(())
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

async fn cmd_echo(
    address: &BackendAddress,
    call_timeout: Duration,
    message: &str,
    autostart: bool,
) -> Result<()> {
    let client = connect(address, call_timeout, autostart).await?;
    let reply = client.echo(message).await.context("echo failed")?;
    println!("{reply}");
    Ok(())
}

async fn cmd_list(
    address: &BackendAddress,
    call_timeout: Duration,
    autostart: bool,
    json: bool,
) -> Result<()> {
    let client = connect(address, call_timeout, autostart).await?;
    let ports = client.list_ports().await.context("listPorts failed")?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&ports).context("failed to encode ports")?
        );
        return Ok(());
    }
    print!("{}", format_port_table(&ports));
    Ok(())
}

fn format_port_table(ports: &[Port]) -> String {
    if ports.is_empty() {
        return "no ports registered\n".to_string();
    }
    let mut out = format!("{:<38} {:<5} URL\n", "ID", "STATE");
    for port in ports {
        let url = port
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.url.as_deref())
            .unwrap_or("-");
        out.push_str(&format!("{:<38} {:<5} {url}\n", port.id, port.state.as_str()));
    }
    out
}

async fn cmd_ping(address: &BackendAddress, call_timeout: Duration, autostart: bool) -> Result<()> {
    let client = connect(address, call_timeout, autostart).await?;
    let ping = client.ping().await.context("ping failed")?;
    println!("{} {} ({address})", ping.daemon, ping.version);
    Ok(())
}

async fn cmd_start(address: &BackendAddress) -> Result<()> {
    client::start_daemon(address)?;
    client::wait_for_ping(address, Duration::from_secs(3)).await?;
    println!("workerd started ({address})");
    Ok(())
}

async fn cmd_stop(address: &BackendAddress, call_timeout: Duration) -> Result<()> {
    let client = client::connect(address, call_timeout)
        .await
        .with_context(|| format!("failed to stop backend at {address}"))?;
    client.shutdown().await.context("backend refused shutdown")?;
    println!("workerd stopping");
    Ok(())
}

async fn cmd_daemon_status(address: &BackendAddress, call_timeout: Duration) -> Result<()> {
    let running = match client::connect(address, call_timeout).await {
        Ok(client) => client.ping().await.is_ok(),
        Err(_) => false,
    };
    if running {
        println!("running ({address})");
    } else {
        println!("stopped ({address})");
    }
    Ok(())
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
