// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use varia::daemon::{Aria2Client, DaemonClient, DEFAULT_RPC_URL};
use varia::download::{SessionContext, SessionKey, SessionSnapshot, SessionStore, Supervisor};
use varia::error::{DaemonError, ErrorBuilder};
use varia::rate_limit::{LimitUnit, RateLimitController};
use varia::{logging, Settings, Throughput};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How often the progress display is redrawn
const REFRESH_INTERVAL: Duration = Duration::from_millis(500);

// ANSI color codes for terminal output
mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const RED: &str = "\x1b[31m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
}

use colors::*;

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// Usage error - invalid command line arguments
    pub const USAGE: i32 = 64;
    /// Service unavailable - the aria2 daemon is not reachable
    pub const SERVICE_UNAVAILABLE: i32 = 69;
}

use exit_codes::*;

/// Spinner helpers for consistent progress indicators
mod spinner {
    use indicatif::{ProgressBar, ProgressStyle};
    use std::time::Duration;

    /// Create a spinner with consistent styling
    pub fn create(message: &str) -> ProgressBar {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            spinner.set_style(style);
        }
        spinner.set_message(message.to_string());
        spinner.enable_steady_tick(Duration::from_millis(80));
        spinner
    }

    /// Finish spinner with success message
    pub fn finish_success(spinner: &ProgressBar, message: &str) {
        spinner.finish_and_clear();
        println!("\x1b[32m[OK]\x1b[0m {}", message);
    }

    /// Clear spinner silently
    pub fn clear(spinner: &ProgressBar) {
        spinner.finish_and_clear();
    }
}

/// Varia - download supervisor for aria2.
#[derive(Parser)]
#[command(name = "varia")]
#[command(version = VERSION)]
#[command(about = "Download supervisor for the aria2 daemon.")]
#[command(long_about = "Varia - download supervisor for the aria2 daemon\n\n\
    Download files:      varia run https://example.com/file.iso\n\
    Resume unfinished:   varia run\n\
    Limit speed:         varia limit 500 --unit MB\n\
    Check status:        varia status\n\
    Cancel everything:   varia cancel-all\n\n\
    Needs aria2c running with --enable-rpc.")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// aria2 JSON-RPC endpoint
    #[arg(long, global = true, env = "VARIA_RPC_URL", default_value = DEFAULT_RPC_URL)]
    rpc_url: String,

    /// aria2 RPC secret (the daemon's --rpc-secret)
    #[arg(long, global = true, env = "VARIA_RPC_SECRET", hide_env_values = true)]
    rpc_secret: Option<String>,

    /// Directory downloads are written to
    #[arg(long, global = true, env = "VARIA_DOWNLOAD_DIR")]
    download_dir: Option<PathBuf>,

    /// Directory holding varia.conf
    #[arg(long, global = true, env = "VARIA_APP_DIR")]
    app_dir: Option<PathBuf>,

    /// Timeout for each daemon call, in seconds
    #[arg(long, global = true, default_value_t = 5)]
    timeout: u64,

    /// Quiet mode: only errors are logged
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    /// Verbose mode: detailed output for debugging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Download URLs and resume unfinished downloads, showing live progress
    ///
    /// While running, type a command and press Enter:
    ///   p        pause or resume everything
    ///   p N      pause or resume download N
    ///   c N      cancel download N and delete its partial file
    ///   c        cancel everything
    ///   a URL    add another download
    ///   q        pause everything and quit
    Run {
        /// URLs to download
        urls: Vec<String>,
    },

    /// Set the global download speed limit (0 = unlimited)
    ///
    /// Examples:
    ///   varia limit 500 --unit MB
    ///   varia limit 0
    Limit {
        /// Whole number, empty or 0 for unlimited
        value: String,
        /// KB, MB or GB
        #[arg(short, long, default_value = "MB")]
        unit: LimitUnit,
    },

    /// Show daemon, speed limit and unfinished download status
    Status,

    /// Cancel every unfinished download and delete partial files
    CancelAll,
}

impl Cli {
    fn settings(&self) -> Settings {
        let defaults = Settings::default();
        Settings {
            rpc_url: self.rpc_url.clone(),
            rpc_secret: self.rpc_secret.clone(),
            download_dir: self.download_dir.clone().unwrap_or(defaults.download_dir),
            app_dir: self.app_dir.clone().unwrap_or(defaults.app_dir),
            call_timeout: Duration::from_secs(self.timeout.max(1)),
            poll_interval: defaults.poll_interval,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.verbose, cli.quiet) {
        eprintln!("{YELLOW}[!]{RESET} {}", e);
    }

    let settings = cli.settings();
    match cli.command {
        Commands::Run { urls } => run_downloads(&settings, urls).await,
        Commands::Limit { value, unit } => set_limit(&settings, &value, unit).await,
        Commands::Status => show_status(&settings).await,
        Commands::CancelAll => cancel_all(&settings).await,
    }
}

fn build_client(settings: &Settings) -> Result<Aria2Client> {
    let client = Aria2Client::with_timeout(&settings.rpc_url, settings.call_timeout)?;
    Ok(match &settings.rpc_secret {
        Some(secret) => client.with_secret(secret),
        None => client,
    })
}

fn daemon_unreachable(settings: &Settings, err: &DaemonError) -> String {
    ErrorBuilder::new(format!("Cannot reach the aria2 daemon at {}", settings.rpc_url))
        .cause(err.to_string())
        .cause("aria2c is not running, or was started without --enable-rpc")
        .cause("aria2c listens on a different port, or expects a different --rpc-secret")
        .fix("Start it: aria2c --enable-rpc --rpc-listen-port=6801")
        .fix("Point varia at it with --rpc-url or VARIA_RPC_URL")
        .build()
}

/// Build the client and make sure the daemon answers before going further.
async fn connect(settings: &Settings) -> Result<Arc<dyn DaemonClient>> {
    let client = build_client(settings)?;

    let spinner = spinner::create("Connecting to aria2...");
    match client.version().await {
        Ok(version) => {
            spinner::clear(&spinner);
            info!(version = %version, endpoint = %client.endpoint(), "connected to aria2");
            Ok(Arc::new(client))
        }
        Err(e) => {
            spinner::clear(&spinner);
            eprintln!("{RED}{}{RESET}", daemon_unreachable(settings, &e));
            std::process::exit(SERVICE_UNAVAILABLE);
        }
    }
}

fn build_supervisor(settings: &Settings, daemon: Arc<dyn DaemonClient>) -> Result<Supervisor> {
    fs::create_dir_all(&settings.download_dir).with_context(|| {
        format!("Failed to create download directory: {:?}", settings.download_dir)
    })?;

    Ok(Supervisor::new(SessionContext {
        daemon,
        store: SessionStore::new(&settings.download_dir),
        download_dir: settings.download_dir.clone(),
        poll_interval: settings.poll_interval,
    }))
}

async fn run_downloads(settings: &Settings, urls: Vec<String>) -> Result<()> {
    let daemon = connect(settings).await?;

    let limits = RateLimitController::new(daemon.clone(), settings.config_store());
    if let Some(limit) = limits.restore().await? {
        println!("{DIM}Speed limit {}/s restored{RESET}", limit);
    }

    let supervisor = build_supervisor(settings, daemon)?;
    supervisor.start();

    let recovered = supervisor.recover_sessions()?;
    if recovered > 0 {
        println!("{GREEN}[OK]{RESET} Resuming {} unfinished download(s)", recovered);
    }
    for url in urls {
        supervisor.add_download(url);
    }

    if supervisor.is_empty() {
        println!("Nothing to download. Try: varia run <URL>");
        return Ok(());
    }

    println!("{DIM}Commands: p [N] pause/resume, c [N] cancel, a URL add, q quit{RESET}");
    let mut view = ProgressView::new();
    let aggregate = supervisor.subscribe_aggregate();
    let mut commands = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            line = commands.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if handle_command(&supervisor, &limits, line.trim()).await == Flow::Quit {
                        break;
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "stopped reading commands");
                    stdin_open = false;
                }
            },
            _ = tokio::time::sleep(REFRESH_INTERVAL) => {}
        }

        let snapshots = supervisor.snapshots();
        view.render(&snapshots, *aggregate.borrow());
        if snapshots.iter().all(|(_, s)| s.state.is_terminal()) {
            break;
        }
    }

    view.finish();
    print_summary(&supervisor.snapshots());
    supervisor.shutdown().await;
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

/// One line typed while downloads run.
#[derive(Debug, PartialEq)]
enum Command {
    Nothing,
    ToggleAll,
    Toggle(SessionKey),
    StopAll,
    Stop(SessionKey),
    Add(String),
    Limit { value: String, unit: LimitUnit },
    Quit,
}

/// Parse a command line. The error is the warning to show the user.
///
/// A key that does not parse is an error, never a bulk action.
fn parse_command(line: &str) -> Result<Command, String> {
    let (command, arg) = match line.split_once(char::is_whitespace) {
        Some((command, arg)) => (command, Some(arg.trim()).filter(|a| !a.is_empty())),
        None => (line, None),
    };
    let key = |usage: &str| -> Result<Option<SessionKey>, String> {
        match arg {
            None => Ok(None),
            Some(a) => a
                .trim_start_matches('#')
                .parse()
                .map(|n| Some(SessionKey(n)))
                .map_err(|_| format!("Not a download number: {} (usage: {})", a, usage)),
        }
    };

    match command {
        "" => Ok(Command::Nothing),
        "p" | "pause" => Ok(key("p [N]")?.map_or(Command::ToggleAll, Command::Toggle)),
        "c" | "cancel" => Ok(key("c [N]")?.map_or(Command::StopAll, Command::Stop)),
        "a" | "add" => arg
            .map(|url| Command::Add(url.to_string()))
            .ok_or_else(|| "Usage: a URL".to_string()),
        "limit" => {
            let mut parts = arg.unwrap_or_default().split_whitespace();
            let value = parts.next().unwrap_or_default().to_string();
            let unit = parts
                .next()
                .unwrap_or("MB")
                .parse::<LimitUnit>()
                .map_err(|e| e.to_string())?;
            Ok(Command::Limit { value, unit })
        }
        "q" | "quit" => Ok(Command::Quit),
        _ => Err(format!("Unknown command: {}", line)),
    }
}

async fn handle_command(supervisor: &Supervisor, limits: &RateLimitController, line: &str) -> Flow {
    let command = match parse_command(line) {
        Ok(command) => command,
        Err(warning) => {
            println!("{YELLOW}[!]{RESET} {}", warning);
            return Flow::Continue;
        }
    };

    match command {
        Command::Nothing => {}
        Command::ToggleAll => supervisor.toggle_all().await,
        Command::Toggle(key) => {
            if !supervisor.toggle(key).await {
                println!("{YELLOW}[!]{RESET} No download {}", key);
            }
        }
        Command::StopAll => {
            supervisor.stop_all().await;
        }
        Command::Stop(key) => {
            if !supervisor.stop(key).await {
                println!("{YELLOW}[!]{RESET} No download {}", key);
            }
        }
        Command::Add(url) => {
            supervisor.add_download(url);
        }
        Command::Limit { value, unit } => match limits.apply(&value, unit).await {
            Ok(outcome) if outcome.daemon_applied => {
                println!("{GREEN}[OK]{RESET} Speed limit set to {}", outcome.limit)
            }
            Ok(outcome) => println!(
                "{YELLOW}[!]{RESET} Saved {} but the daemon did not accept it",
                outcome.limit
            ),
            Err(e) => println!("{YELLOW}[!]{RESET} {}", e),
        },
        Command::Quit => return Flow::Quit,
    }
    Flow::Continue
}

/// Live progress bars, one per session plus a total line.
struct ProgressView {
    multi: MultiProgress,
    total: ProgressBar,
    bars: HashMap<SessionKey, ProgressBar>,
    style: ProgressStyle,
}

impl ProgressView {
    fn new() -> Self {
        let multi = MultiProgress::with_draw_target(ProgressDrawTarget::stdout());
        let total = multi.add(ProgressBar::new_spinner());
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
            total.set_style(style);
        }

        let style = ProgressStyle::default_bar()
            .template("  {prefix:>4} [{bar:30.cyan/blue}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░");

        Self {
            multi,
            total,
            bars: HashMap::new(),
            style,
        }
    }

    fn render(&mut self, snapshots: &[(SessionKey, SessionSnapshot)], total: Throughput) {
        self.total.set_message(format!("{BOLD}Total: {}{RESET}", total));
        self.total.tick();

        self.bars.retain(|key, bar| {
            let live = snapshots.iter().any(|(k, _)| k == key);
            if !live {
                bar.finish_and_clear();
            }
            live
        });

        for (key, snapshot) in snapshots {
            let bar = self.bars.entry(*key).or_insert_with(|| {
                let bar = self.multi.add(ProgressBar::new(100));
                bar.set_style(self.style.clone());
                bar.set_prefix(key.to_string());
                bar
            });
            bar.set_position(snapshot.percent());
            bar.set_message(format!("{}  {}", snapshot.name, snapshot.status_line()));
        }
    }

    fn finish(&self) {
        for bar in self.bars.values() {
            bar.abandon();
        }
        self.total.finish_and_clear();
    }
}

fn print_summary(snapshots: &[(SessionKey, SessionSnapshot)]) {
    let done = snapshots.iter().filter(|(_, s)| s.state.is_terminal()).count();
    let pending = snapshots.len() - done;
    if pending > 0 {
        println!("{DIM}{} download(s) paused; run `varia run` to resume{RESET}", pending);
    }
}

async fn set_limit(settings: &Settings, value: &str, unit: LimitUnit) -> Result<()> {
    let daemon: Arc<dyn DaemonClient> = Arc::new(build_client(settings)?);
    let limits = RateLimitController::new(daemon, settings.config_store());

    match limits.apply(value, unit).await {
        Ok(outcome) if outcome.daemon_applied => {
            println!("{GREEN}[OK]{RESET} Speed limit set to {}", outcome.limit);
        }
        Ok(outcome) => {
            println!(
                "{YELLOW}[!]{RESET} Saved {}; the daemon is not reachable, it will be applied on the next run",
                outcome.limit
            );
        }
        Err(e) => {
            eprintln!("{RED}[X]{RESET} {}", e);
            std::process::exit(USAGE);
        }
    }
    Ok(())
}

async fn show_status(settings: &Settings) -> Result<()> {
    let client = build_client(settings)?;
    match client.version().await {
        Ok(version) => println!("{GREEN}[OK]{RESET} aria2 {} at {}", version, settings.rpc_url),
        Err(e) => println!("{RED}[X]{RESET} aria2 not reachable at {}: {}", settings.rpc_url, e),
    }

    let limit = settings.config_store().load()?.download_speed_limit;
    let limit = if limit.starts_with('0') { "unlimited".to_string() } else { format!("{}/s", limit) };
    println!("     Speed limit:  {}", limit);
    println!("     Downloads:    {}", settings.download_dir.display());

    let unfinished = SessionStore::new(&settings.download_dir).scan()?;
    println!("     Unfinished:   {}", unfinished.len());
    Ok(())
}

async fn cancel_all(settings: &Settings) -> Result<()> {
    let daemon = connect(settings).await?;
    let supervisor = build_supervisor(settings, daemon)?;

    let spinner = spinner::create("Cancelling downloads...");
    supervisor.recover_sessions()?;
    let count = supervisor.stop_all().await;
    spinner::finish_success(&spinner, &format!("Cancelled {} download(s)", count));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_commands_without_argument() {
        assert_eq!(parse_command("p"), Ok(Command::ToggleAll));
        assert_eq!(parse_command("cancel"), Ok(Command::StopAll));
        assert_eq!(parse_command("c   "), Ok(Command::StopAll));
        assert_eq!(parse_command(""), Ok(Command::Nothing));
        assert_eq!(parse_command("q"), Ok(Command::Quit));
    }

    #[test]
    fn test_commands_with_key() {
        assert_eq!(parse_command("p 2"), Ok(Command::Toggle(SessionKey(2))));
        assert_eq!(parse_command("c #3"), Ok(Command::Stop(SessionKey(3))));
    }

    #[test]
    fn test_bad_key_is_not_a_bulk_action() {
        for line in ["c abc", "c 1x", "cancel -1", "p abc", "pause #"] {
            let warning = parse_command(line).unwrap_err();
            assert!(warning.starts_with("Not a download number"), "{}: {}", line, warning);
        }
    }

    #[test]
    fn test_add_needs_url() {
        assert_eq!(
            parse_command("a http://example.com/f.iso"),
            Ok(Command::Add("http://example.com/f.iso".into()))
        );
        assert_eq!(parse_command("a"), Err("Usage: a URL".to_string()));
    }

    #[test]
    fn test_limit_units() {
        assert_eq!(
            parse_command("limit 500"),
            Ok(Command::Limit { value: "500".into(), unit: LimitUnit::Megabytes })
        );
        assert_eq!(
            parse_command("limit 2 gb"),
            Ok(Command::Limit { value: "2".into(), unit: LimitUnit::Gigabytes })
        );

        let warning = parse_command("limit 5 TB").unwrap_err();
        assert!(warning.contains("unknown speed limit unit"), "{}", warning);
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(parse_command("x 1"), Err("Unknown command: x 1".to_string()));
    }
}
