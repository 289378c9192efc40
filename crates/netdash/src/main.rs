use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser};
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::layout::{Constraint, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::widgets::{Block, Borders, Cell, Clear, Paragraph, Row, Table, TableState};
use ratatui::{backend::CrosstermBackend, Terminal};
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::runtime::Runtime;
use tracing::{debug, warn};
use workerd_types::client::{self, RpcClient};
use workerd_types::{
    has_off_ports, resolve_call_timeout, BackendAddress, Port, PortState, RpcError,
};

const DEFAULT_LAUNCHER: &str = "x-terminal-emulator -e";
const REFRESH_FAILED: &str = "refresh failed";
const AUTOSTART_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "netdash", version, about = "Terminal dashboard for ports on the shared worker")]
struct Cli {
    #[arg(long)]
    socket: Option<PathBuf>,
    #[arg(long)]
    runtime_dir: Option<PathBuf>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    call_timeout_ms: Option<u64>,
    #[arg(long = "autostart", default_value_t = true, action = ArgAction::Set)]
    autostart: bool,
    #[arg(long = "no-autostart")]
    no_autostart: bool,
    #[arg(long, default_value_t = 1000)]
    refresh_ms: u64,
    /// Command that opens a new terminal for a port, e.g. "alacritty -e".
    #[arg(long)]
    launcher: Option<String>,
}

#[derive(Debug, Default)]
struct App {
    ports: Vec<Port>,
    selected: usize,
    status_message: String,
    show_help: bool,
}

impl App {
    fn has_off_ports(&self) -> bool {
        has_off_ports(&self.ports)
    }

    fn set_ports(&mut self, ports: Vec<Port>) {
        self.ports = ports;
        if self.ports.is_empty() {
            self.selected = 0;
            return;
        }
        if self.selected >= self.ports.len() {
            self.selected = self.ports.len() - 1;
        }
    }

    /// Keeps the last known ports when a refresh fails. A later successful
    /// refresh clears the failure; other notices stay.
    fn apply_refresh(&mut self, result: Result<Vec<Port>>) {
        match result {
            Ok(ports) => {
                if self.status_message.starts_with(REFRESH_FAILED) {
                    self.status_message.clear();
                }
                self.set_ports(ports);
            }
            Err(err) => self.status_message = format!("{REFRESH_FAILED}: {err:#}"),
        }
    }

    fn off_count(&self) -> usize {
        self.ports
            .iter()
            .filter(|port| port.state == PortState::Off)
            .count()
    }

    fn select_next(&mut self) {
        if self.ports.is_empty() {
            self.selected = 0;
            return;
        }
        self.selected = (self.selected + 1) % self.ports.len();
    }

    fn select_previous(&mut self) {
        if self.ports.is_empty() {
            self.selected = 0;
            return;
        }
        if self.selected == 0 {
            self.selected = self.ports.len() - 1;
        } else {
            self.selected -= 1;
        }
    }
}

/// Dashboard side of the backend. Reconnects lazily after the backend goes
/// away, so a restarted backend is picked up on the next poll. A failed
/// autostart is not retried until [`AUTOSTART_BACKOFF`] has passed.
struct Dashboard {
    address: BackendAddress,
    call_timeout: Duration,
    autostart: bool,
    autostart_blocked_until: Option<Instant>,
    client: Option<RpcClient>,
}

impl Dashboard {
    fn new(address: BackendAddress, call_timeout: Duration, autostart: bool) -> Self {
        Self {
            address,
            call_timeout,
            autostart,
            autostart_blocked_until: None,
            client: None,
        }
    }

    fn autostart_allowed(&self, now: Instant) -> bool {
        self.autostart
            && self
                .autostart_blocked_until
                .map_or(true, |blocked_until| now >= blocked_until)
    }

    fn back_off_autostart(&mut self, now: Instant) {
        self.autostart_blocked_until = Some(now + AUTOSTART_BACKOFF);
    }

    async fn list_ports(&mut self) -> Result<Vec<Port>> {
        if self.client.as_ref().map_or(true, RpcClient::is_closed) {
            let now = Instant::now();
            let autostart = self.autostart_allowed(now);
            let connected =
                match client::connect_with_autostart(&self.address, self.call_timeout, autostart)
                    .await
                {
                    Ok(connected) => connected,
                    Err(err) => {
                        if autostart {
                            warn!(
                                "backend autostart failed, next attempt in {AUTOSTART_BACKOFF:?}: {err:#}"
                            );
                            self.back_off_autostart(now);
                        }
                        return Err(err);
                    }
                };
            self.autostart_blocked_until = None;
            if connected.daemon_was_started {
                debug!("started backend at {}", self.address);
            }
            self.client = Some(connected.client);
        }
        let Some(client) = self.client.as_ref() else {
            return Err(anyhow!("no backend connection"));
        };

        match client.list_ports().await {
            Ok(ports) => Ok(ports),
            Err(err) => {
                if err == RpcError::ConnectionClosed {
                    self.client = None;
                }
                Err(err).context("listPorts failed")
            }
        }
    }
}

struct TerminalGuard;

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = execute!(stdout, LeaveAlternateScreen);
    }
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let address = BackendAddress::resolve(cli.socket.as_deref(), cli.runtime_dir, cli.name);
    let launcher = cli
        .launcher
        .or_else(|| std::env::var("NETDASH_LAUNCHER").ok())
        .unwrap_or_else(|| DEFAULT_LAUNCHER.to_string());
    let refresh_interval = refresh_interval(cli.refresh_ms);
    let dashboard = Dashboard::new(
        address,
        poll_timeout(resolve_call_timeout(cli.call_timeout_ms), refresh_interval),
        resolve_autostart(cli.autostart, cli.no_autostart),
    );
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    run_tui(&runtime, dashboard, &launcher, refresh_interval)
}

fn refresh_interval(refresh_ms: u64) -> Duration {
    Duration::from_millis(refresh_ms.max(200))
}

/// Polls run inside the render loop, so a hung backend may hold the UI for at
/// most one refresh interval.
fn poll_timeout(call_timeout: Duration, refresh_interval: Duration) -> Duration {
    call_timeout.min(refresh_interval)
}

/// The terminal belongs to the UI, so logs go to stderr only when asked for.
fn init_logging() {
    let Ok(filter) = std::env::var("NETDASH_LOG").or_else(|_| std::env::var("RUST_LOG")) else {
        return;
    };
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}

const fn resolve_autostart(autostart: bool, no_autostart: bool) -> bool {
    autostart && !no_autostart
}

fn run_tui(
    runtime: &Runtime,
    mut dashboard: Dashboard,
    launcher: &str,
    refresh_interval: Duration,
) -> Result<()> {
    let mut app = App::default();
    app.apply_refresh(runtime.block_on(dashboard.list_ports()));

    enable_raw_mode().context("failed to enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).context("failed to enter alternate screen")?;
    let _guard = TerminalGuard;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("failed to initialize terminal backend")?;
    let mut last_refresh = Instant::now();

    loop {
        terminal
            .draw(|frame| draw_ui(frame, &app, dashboard.address.to_string().as_str()))
            .context("failed to render tui frame")?;

        if event::poll(Duration::from_millis(100)).context("failed to poll terminal events")? {
            let event = event::read().context("failed to read terminal event")?;
            if let Event::Key(key) = event {
                if key.kind == KeyEventKind::Press {
                    match handle_key(key, &mut app) {
                        KeyAction::Quit => break,
                        KeyAction::Refresh => {
                            app.status_message.clear();
                            app.apply_refresh(runtime.block_on(dashboard.list_ports()));
                            last_refresh = Instant::now();
                        }
                        KeyAction::LaunchPort => {
                            app.status_message = match launch_port(launcher, &dashboard.address) {
                                Ok(()) => "launched a new port".to_string(),
                                Err(err) => {
                                    warn!("port launch failed: {err:#}");
                                    format!("Unable to launch port: {err:#}")
                                }
                            };
                        }
                        KeyAction::None => {}
                    }
                }
            }
        }

        if last_refresh.elapsed() >= refresh_interval {
            app.apply_refresh(runtime.block_on(dashboard.list_ports()));
            last_refresh = Instant::now();
        }
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyAction {
    None,
    Quit,
    Refresh,
    LaunchPort,
}

fn handle_key(key: crossterm::event::KeyEvent, app: &mut App) -> KeyAction {
    match key.code {
        KeyCode::Char('q') => KeyAction::Quit,
        KeyCode::Char('c')
            if key
                .modifiers
                .contains(crossterm::event::KeyModifiers::CONTROL) =>
        {
            KeyAction::Quit
        }
        KeyCode::Char('?') => {
            app.show_help = !app.show_help;
            KeyAction::None
        }
        KeyCode::Esc if app.show_help => {
            app.show_help = false;
            KeyAction::None
        }
        KeyCode::Char('j') | KeyCode::Down => {
            app.select_next();
            KeyAction::None
        }
        KeyCode::Char('k') | KeyCode::Up => {
            app.select_previous();
            KeyAction::None
        }
        KeyCode::Char('g') => {
            app.selected = 0;
            KeyAction::None
        }
        KeyCode::Char('G') => {
            app.selected = app.ports.len().saturating_sub(1);
            KeyAction::None
        }
        KeyCode::Char('r') => KeyAction::Refresh,
        KeyCode::Char('l') => KeyAction::LaunchPort,
        _ => KeyAction::None,
    }
}

/// Opens a new port in its own terminal. Any failure to start the launcher
/// is returned so it can be shown to the user.
fn launch_port(launcher: &str, address: &BackendAddress) -> Result<()> {
    let mut words = launcher.split_whitespace();
    let program = words
        .next()
        .ok_or_else(|| anyhow!("no port launcher configured"))?;
    Command::new(program)
        .args(words)
        .arg(netport_binary())
        .arg("--socket")
        .arg(address.socket_path())
        .arg("run")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("failed to spawn launcher `{program}`"))?;
    Ok(())
}

fn netport_binary() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("netport")))
        .filter(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from("netport"))
}

fn draw_ui(frame: &mut ratatui::Frame<'_>, app: &App, address: &str) {
    let alert_height = if app.has_off_ports() { 3 } else { 0 };
    let chunks = Layout::vertical([
        Constraint::Length(1),
        Constraint::Length(alert_height),
        Constraint::Min(6),
        Constraint::Length(1),
    ])
    .split(frame.area());

    let header = Paragraph::new(format!(
        "Shared Worker Network Dashboard | Connected Ports: {} | l launch | r refresh | ? help | q quit",
        app.ports.len()
    ))
    .style(Style::default().add_modifier(Modifier::BOLD));
    frame.render_widget(header, chunks[0]);

    if app.has_off_ports() {
        let alert = Paragraph::new(format!(
            "ALERT: {} of {} ports are OFF",
            app.off_count(),
            app.ports.len()
        ))
        .style(
            Style::default()
                .fg(Color::White)
                .bg(Color::Red)
                .add_modifier(Modifier::BOLD),
        )
        .block(Block::default().borders(Borders::ALL));
        frame.render_widget(alert, chunks[1]);
    }

    let table_block = Block::default().title("Ports").borders(Borders::ALL);
    if app.ports.is_empty() {
        let empty = Paragraph::new("No ports connected. Press l to launch one.").block(table_block);
        frame.render_widget(empty, chunks[2]);
    } else {
        let now = unix_millis();
        let rows = app.ports.iter().map(|port| {
            let state_color = match port.state {
                PortState::On => Color::Green,
                PortState::Off => Color::Red,
            };
            let metadata = port.metadata.as_ref();
            Row::new([
                Cell::from(port.short_id().to_string()),
                Cell::from(port.state.as_str().to_uppercase()),
                Cell::from(
                    metadata
                        .and_then(|metadata| metadata.timestamp)
                        .map(|created| format_age(now, created))
                        .unwrap_or_else(|| "-".to_string()),
                ),
                Cell::from(
                    metadata
                        .and_then(|metadata| metadata.url.clone())
                        .unwrap_or_else(|| "-".to_string()),
                ),
            ])
            .style(Style::default().fg(state_color))
        });
        let table = Table::new(
            rows,
            [
                Constraint::Length(10),
                Constraint::Length(6),
                Constraint::Length(6),
                Constraint::Min(20),
            ],
        )
        .header(
            Row::new(["id", "state", "age", "url"])
                .style(Style::default().add_modifier(Modifier::BOLD)),
        )
        .block(table_block)
        .row_highlight_style(Style::default().add_modifier(Modifier::REVERSED));
        let mut state = TableState::default().with_selected(Some(app.selected));
        frame.render_stateful_widget(table, chunks[2], &mut state);
    }

    let status_line = if app.status_message.is_empty() {
        format!("{} ports | {} off | {address}", app.ports.len(), app.off_count())
    } else {
        format!("{} | {} ports", app.status_message, app.ports.len())
    };
    frame.render_widget(Paragraph::new(status_line), chunks[3]);

    if app.show_help {
        let overlay = centered_rect(60, 60, frame.area());
        frame.render_widget(Clear, overlay);
        let help_text = "\
Keybindings:

  j / k        Navigate down / up
  g / G        Jump to first / last
  l            Launch a new port
  r            Refresh now
  ?            Toggle this help overlay
  Ctrl+C / q   Quit";
        let help_paragraph = Paragraph::new(help_text)
            .block(Block::default().title("Help").borders(Borders::ALL))
            .style(Style::default().fg(Color::White));
        frame.render_widget(help_paragraph, overlay);
    }
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::vertical([
        Constraint::Percentage((100 - percent_y) / 2),
        Constraint::Percentage(percent_y),
        Constraint::Percentage((100 - percent_y) / 2),
    ])
    .split(r);
    Layout::horizontal([
        Constraint::Percentage((100 - percent_x) / 2),
        Constraint::Percentage(percent_x),
        Constraint::Percentage((100 - percent_x) / 2),
    ])
    .split(popup_layout[1])[1]
}

fn format_age(now_ms: u64, created_ms: u64) -> String {
    let seconds = now_ms.saturating_sub(created_ms) / 1000;
    match seconds {
        0..=59 => format!("{seconds}s"),
        60..=3599 => format!("{}m", seconds / 60),
        _ => format!("{}h", seconds / 3600),
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::{KeyEvent, KeyModifiers};
    use ratatui::backend::TestBackend;
    use workerd::SharedBackend;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn dashboard_over(backend: &SharedBackend) -> Dashboard {
        let mut dashboard = Dashboard::new(
            BackendAddress::new("/in-process", "netdash-test"),
            TIMEOUT,
            false,
        );
        dashboard.client = Some(backend.connect_in_process(TIMEOUT));
        dashboard
    }

    fn render(app: &App) -> String {
        let mut terminal = Terminal::new(TestBackend::new(100, 20)).unwrap();
        terminal
            .draw(|frame| draw_ui(frame, app, "/tmp/test.sock"))
            .unwrap();
        terminal
            .backend()
            .buffer()
            .content()
            .iter()
            .map(|cell| cell.symbol())
            .collect()
    }

    #[test]
    fn alert_follows_off_ports() {
        let mut app = App::default();
        assert!(!app.has_off_ports());

        app.set_ports(vec![Port::new("a", PortState::On), Port::new("b", PortState::On)]);
        assert!(!app.has_off_ports());

        app.set_ports(vec![Port::new("a", PortState::On), Port::new("b", PortState::Off)]);
        assert!(app.has_off_ports());
        assert_eq!(app.off_count(), 1);

        app.set_ports(vec![Port::new("a", PortState::On), Port::new("b", PortState::On)]);
        assert!(!app.has_off_ports());
    }

    #[test]
    fn failed_refresh_keeps_last_known_ports() {
        let mut app = App::default();
        app.apply_refresh(Ok(vec![Port::new("a", PortState::Off)]));
        app.apply_refresh(Err(anyhow!("connection closed")));
        assert_eq!(app.ports.len(), 1);
        assert!(app.status_message.contains("refresh failed: connection closed"));

        app.apply_refresh(Ok(vec![Port::new("a", PortState::On)]));
        assert!(app.status_message.is_empty());
        assert!(!app.has_off_ports());
    }

    #[test]
    fn successful_refresh_keeps_launch_notices() {
        let mut app = App::default();
        app.status_message = "Unable to launch port: no port launcher configured".to_string();
        app.apply_refresh(Ok(Vec::new()));
        assert!(app.status_message.starts_with("Unable to launch port"));
    }

    #[test]
    fn failed_autostart_is_not_retried_until_backoff_passes() {
        let mut dashboard = Dashboard::new(
            BackendAddress::new("/in-process", "netdash-backoff"),
            TIMEOUT,
            true,
        );
        let now = Instant::now();
        assert!(dashboard.autostart_allowed(now));

        dashboard.back_off_autostart(now);
        assert!(!dashboard.autostart_allowed(now + Duration::from_secs(1)));
        assert!(dashboard.autostart_allowed(now + AUTOSTART_BACKOFF));

        let disabled = Dashboard::new(
            BackendAddress::new("/in-process", "netdash-backoff"),
            TIMEOUT,
            false,
        );
        assert!(!disabled.autostart_allowed(now));
    }

    #[test]
    fn polls_never_outlast_the_refresh_interval() {
        assert_eq!(refresh_interval(50), Duration::from_millis(200));
        assert_eq!(
            poll_timeout(Duration::from_secs(5), refresh_interval(1000)),
            Duration::from_secs(1)
        );
        assert_eq!(
            poll_timeout(Duration::from_millis(300), refresh_interval(1000)),
            Duration::from_millis(300)
        );
    }

    #[test]
    fn selection_is_clamped_when_ports_disappear() {
        let mut app = App::default();
        app.set_ports(vec![
            Port::new("a", PortState::On),
            Port::new("b", PortState::On),
            Port::new("c", PortState::On),
        ]);
        assert_eq!(handle_key(key(KeyCode::Char('G')), &mut app), KeyAction::None);
        assert_eq!(app.selected, 2);

        app.set_ports(vec![Port::new("a", PortState::On)]);
        assert_eq!(app.selected, 0);
        app.set_ports(Vec::new());
        assert_eq!(app.selected, 0);
    }

    #[test]
    fn keys_map_to_actions() {
        let mut app = App::default();
        assert_eq!(handle_key(key(KeyCode::Char('q')), &mut app), KeyAction::Quit);
        assert_eq!(handle_key(key(KeyCode::Char('r')), &mut app), KeyAction::Refresh);
        assert_eq!(handle_key(key(KeyCode::Char('l')), &mut app), KeyAction::LaunchPort);
        assert_eq!(
            handle_key(
                KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL),
                &mut app
            ),
            KeyAction::Quit
        );
        handle_key(key(KeyCode::Char('?')), &mut app);
        assert!(app.show_help);
        handle_key(key(KeyCode::Esc), &mut app);
        assert!(!app.show_help);
    }

    #[test]
    fn launch_failure_is_reported() {
        let address = BackendAddress::new("/tmp", "netdash-launch");
        let err = launch_port("/definitely/not/a/terminal -e", &address).unwrap_err();
        assert!(format!("{err:#}").contains("failed to spawn launcher"));
        assert!(launch_port("   ", &address).is_err());
    }

    #[test]
    fn cli_defaults_and_autostart_flags() {
        let default_cli = Cli::try_parse_from(["netdash"]).unwrap();
        assert!(resolve_autostart(default_cli.autostart, default_cli.no_autostart));
        assert_eq!(default_cli.refresh_ms, 1000);
        assert!(default_cli.launcher.is_none());

        let no_autostart_cli = Cli::try_parse_from(["netdash", "--no-autostart"]).unwrap();
        assert!(!resolve_autostart(
            no_autostart_cli.autostart,
            no_autostart_cli.no_autostart
        ));

        let launcher_cli =
            Cli::try_parse_from(["netdash", "--launcher", "alacritty -e"]).unwrap();
        assert_eq!(launcher_cli.launcher.as_deref(), Some("alacritty -e"));
    }

    #[test]
    fn age_uses_coarse_units() {
        assert_eq!(format_age(10_000, 4_000), "6s");
        assert_eq!(format_age(200_000, 0), "3m");
        assert_eq!(format_age(7_300_000, 0), "2h");
        assert_eq!(format_age(0, 5_000), "0s");
    }

    #[test]
    fn alert_banner_renders_only_with_off_ports() {
        let mut app = App::default();
        app.set_ports(vec![Port::new("aaaaaaaa-1", PortState::On)]);
        let screen = render(&app);
        assert!(screen.contains("Connected Ports: 1"));
        assert!(!screen.contains("ALERT"));

        app.set_ports(vec![Port::new("aaaaaaaa-1", PortState::Off)]);
        assert!(render(&app).contains("ALERT: 1 of 1 ports are OFF"));
    }

    #[tokio::test]
    async fn polling_picks_up_port_changes() {
        let backend = SharedBackend::new();
        let port = backend.connect_in_process(TIMEOUT);
        let mut dashboard = dashboard_over(&backend);
        let mut app = App::default();

        app.apply_refresh(dashboard.list_ports().await);
        assert!(app.ports.is_empty());
        assert!(!app.has_off_ports());

        port.register_port(&Port::new("p1", PortState::On)).await.unwrap();
        port.set_port_state("p1", PortState::Off).await.unwrap();
        app.apply_refresh(dashboard.list_ports().await);
        assert!(app.has_off_ports());

        port.set_port_state("p1", PortState::On).await.unwrap();
        app.apply_refresh(dashboard.list_ports().await);
        assert!(!app.has_off_ports());
    }

    #[tokio::test]
    async fn unreachable_backend_is_reported_not_fatal() {
        let mut dashboard = Dashboard::new(
            BackendAddress::new(std::env::temp_dir(), "netdash-no-backend"),
            Duration::from_millis(200),
            false,
        );
        let mut app = App::default();
        app.apply_refresh(dashboard.list_ports().await);
        assert!(app.status_message.starts_with("refresh failed"));
        assert!(dashboard.client.is_none());
    }
}
