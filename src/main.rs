//! Purpose: `cqrpc` CLI entry point: engine benchmarks and connection-state watching.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: Logging goes to stderr through `tracing`; `RUST_LOG` overrides `info`.
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

mod bench;

use bench::{BenchArgs, BenchFormat, BenchMode, run_bench};
use cqrpc::api::{
    AsyncClient, AsyncServer, CallImmediately, EngineConfig, Error, ErrorKind, Network,
    to_exit_code,
};
use cqrpc::notice::{notice_json, state_notice};

#[derive(Parser, Debug)]
#[command(
    name = "cqrpc",
    version,
    about = "Completion-queue RPC dispatch engine tools",
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Issue concurrent unary calls against an echo server and report timing.
    Bench(BenchCommand),
    /// Print a client's connection-state transitions as JSON notices.
    Watch(WatchCommand),
}

#[derive(Args, Debug)]
struct BenchCommand {
    /// Number of concurrent unary calls.
    #[arg(long, default_value_t = 1000)]
    calls: u64,
    #[arg(long, value_enum, default_value_t = ModeArg::InProcess)]
    mode: ModeArg,
    /// Address used in network mode.
    #[arg(long, default_value = "mem:bench")]
    address: String,
    #[arg(long, value_enum, default_value_t = FormatArg::Json)]
    format: FormatArg,
    /// Engine configuration as a JSON object.
    #[arg(long)]
    config: Option<String>,
}

#[derive(Args, Debug)]
struct WatchCommand {
    #[arg(long)]
    address: String,
    /// Bind a server on the address after this many milliseconds.
    #[arg(long)]
    serve_after_ms: Option<u64>,
    /// Total time to watch before shutting down.
    #[arg(long, default_value_t = 2000)]
    duration_ms: u64,
    /// Engine configuration as a JSON object.
    #[arg(long)]
    config: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum ModeArg {
    InProcess,
    Network,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum FormatArg {
    Json,
    Table,
    Both,
}

fn main() {
    let exit_code = match run() {
        Ok(code) => code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<i32, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(exit_code);
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage).with_message(clap_error_summary(&err)));
            }
        },
    };

    init_tracing();
    match cli.command {
        Command::Bench(cmd) => {
            let args = BenchArgs {
                calls: cmd.calls,
                mode: match cmd.mode {
                    ModeArg::InProcess => BenchMode::InProcess,
                    ModeArg::Network => BenchMode::Network,
                },
                address: cmd.address,
                format: match cmd.format {
                    FormatArg::Json => BenchFormat::Json,
                    FormatArg::Table => BenchFormat::Table,
                    FormatArg::Both => BenchFormat::Both,
                },
                config: parse_config(cmd.config.as_deref())?,
            };
            run_bench(args, env!("CARGO_PKG_VERSION"))?;
        }
        Command::Watch(cmd) => run_watch(cmd)?,
    }
    Ok(0)
}

fn run_watch(cmd: WatchCommand) -> Result<(), Error> {
    let config = parse_config(cmd.config.as_deref())?;
    if cmd.address.is_empty() {
        return Err(Error::new(ErrorKind::Usage).with_message("--address must not be empty"));
    }
    let network = Network::new();
    let client = AsyncClient::connect_with(&network, &cmd.address, config.clone());

    let seq = Arc::new(AtomicU64::new(0));
    let target = cmd.address.clone();
    client.on_state_change(
        move |state| {
            let seq = seq.fetch_add(1, Ordering::Relaxed);
            let value = notice_json(&state_notice("watch", &target, state, seq));
            let mut stdout = io::stdout().lock();
            let _ = writeln!(stdout, "{value}");
            let _ = stdout.flush();
        },
        CallImmediately::Yes,
    );
    let client_pump = client.spawn_pump()?;

    let total = Duration::from_millis(cmd.duration_ms);
    let mut server = None;
    if let Some(delay_ms) = cmd.serve_after_ms {
        let delay = Duration::from_millis(delay_ms).min(total);
        thread::sleep(delay);
        let bound = AsyncServer::bind_with(&network, &cmd.address, config)?;
        let pump = bound.spawn_pump()?;
        server = Some((bound, pump));
        thread::sleep(total.saturating_sub(delay));
    } else {
        thread::sleep(total);
    }

    client.shutdown();
    join_pump(client_pump, "client")?;
    if let Some((bound, pump)) = server {
        bound.shutdown();
        join_pump(pump, "server")?;
    }
    Ok(())
}

fn join_pump(pump: thread::JoinHandle<()>, engine: &str) -> Result<(), Error> {
    pump.join().map_err(|_| {
        Error::new(ErrorKind::Internal).with_message(format!("{engine} pump panicked"))
    })
}

fn parse_config(input: Option<&str>) -> Result<EngineConfig, Error> {
    match input {
        Some(json) => EngineConfig::from_json_str(json),
        None => Ok(EngineConfig::default()),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn clap_error_summary(err: &clap::Error) -> String {
    let rendered = err.to_string();
    rendered
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.trim_start_matches("error: ").to_string())
        .unwrap_or_else(|| "invalid arguments".to_string())
}

fn emit_error(err: &Error) {
    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::Transport => "transport failure".to_string(),
        ErrorKind::Closed => "engine is shut down".to_string(),
        ErrorKind::Unimplemented => "method not implemented".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(method) = err.method() {
        inner.insert("method".to_string(), json!(method));
    }
    if let Some(call) = err.call() {
        inner.insert("call".to_string(), json!(call.get()));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}
