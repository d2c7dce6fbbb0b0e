// Benchmark harness for cqrpc.
//
// Purpose:
// - Drive N concurrent unary calls through a client engine against an echo server.
// - Emit machine-readable JSON to stdout and a human-readable table to stderr.
//
// Design notes:
// - Network mode uses a private `Network` so runs never collide with other bindings.

use std::io::{self, Write};
use std::sync::mpsc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::{Value, json};

use cqrpc::api::{
    AsyncClient, AsyncServer, ClientCallbacks, EngineConfig, Error, ErrorKind, Method, Network,
    ServerCallbacks, Status, StatusCode,
};

const ECHO: Method<String, String> = Method::unary("/cqrpc.bench.Echo/Say");
const RESULT_TIMEOUT: Duration = Duration::from_secs(30);
const PREALLOCATED_CALLS: u64 = 1 << 20;

#[derive(Clone, Debug)]
pub struct BenchArgs {
    pub calls: u64,
    pub mode: BenchMode,
    pub address: String,
    pub format: BenchFormat,
    pub config: EngineConfig,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BenchMode {
    InProcess,
    Network,
}

impl BenchMode {
    fn as_str(self) -> &'static str {
        match self {
            BenchMode::InProcess => "in-process",
            BenchMode::Network => "network",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BenchFormat {
    Json,
    Table,
    Both,
}

enum CallResult {
    Status(StatusCode, Duration),
    Failed,
}

pub fn run_bench(args: BenchArgs, program_version: &str) -> Result<(), Error> {
    let start = SystemTime::now();
    let network = Network::new();
    let server_address = match args.mode {
        BenchMode::InProcess => "",
        BenchMode::Network => args.address.as_str(),
    };
    let server = AsyncServer::bind_with(&network, server_address, args.config.clone())?;
    server.unary_rpc(
        ECHO,
        ServerCallbacks::new().on_connect(|request: &String, writer| {
            writer.finish(request.clone(), Status::ok());
        }),
    )?;
    let server_pump = server.spawn_pump()?;

    let client = match args.mode {
        BenchMode::InProcess => AsyncClient::in_process_with(&server, args.config.clone()),
        BenchMode::Network => {
            AsyncClient::connect_with(&network, &args.address, args.config.clone())
        }
    };
    let client_pump = client.spawn_pump()?;

    let (tx, rx) = mpsc::channel();
    let began = Instant::now();
    for index in 0..args.calls {
        let issued = Instant::now();
        let on_status = tx.clone();
        let on_error = tx.clone();
        client.unary_rpc(
            ECHO,
            format!("bench-{index}"),
            ClientCallbacks::new()
                .on_status(move |status| {
                    let _ = on_status.send(CallResult::Status(status.code(), issued.elapsed()));
                })
                .on_error(move |_| {
                    let _ = on_error.send(CallResult::Failed);
                }),
        )?;
    }
    drop(tx);

    let mut ok = 0u64;
    let mut non_ok = 0u64;
    let mut failed = 0u64;
    let mut latencies = Vec::with_capacity(latency_capacity(args.calls));
    for _ in 0..args.calls {
        match rx.recv_timeout(RESULT_TIMEOUT) {
            Ok(CallResult::Status(code, latency)) => {
                if code == StatusCode::Ok {
                    ok += 1;
                } else {
                    non_ok += 1;
                }
                latencies.push(latency.as_secs_f64() * 1000.0);
            }
            Ok(CallResult::Failed) => failed += 1,
            Err(err) => {
                client.shutdown();
                server.shutdown();
                return Err(Error::new(ErrorKind::Transport)
                    .with_message("timed out waiting for bench calls")
                    .with_source(err));
            }
        }
    }
    let elapsed = began.elapsed();

    client.shutdown();
    server.shutdown();
    join_pump(client_pump, "client")?;
    join_pump(server_pump, "server")?;

    latencies.sort_by(|a, b| a.total_cmp(b));
    let secs = elapsed.as_secs_f64().max(1e-9);
    let output = json!({
        "name": "cqrpc",
        "version": program_version,
        "ts": rfc3339_now(start),
        "system": system_json(),
        "params": {
            "calls": args.calls,
            "mode": args.mode.as_str(),
            "address": server_address,
            "debug_build": cfg!(debug_assertions),
        },
        "results": {
            "completed": ok + non_ok + failed,
            "ok": ok,
            "non_ok": non_ok,
            "errors": failed,
            "duration_ms": secs * 1000.0,
            "calls_per_sec": args.calls as f64 / secs,
            "latency_ms": latency_summary(&latencies),
        },
    });

    emit_bench_output(output, args.format)
}

fn join_pump(pump: std::thread::JoinHandle<()>, engine: &str) -> Result<(), Error> {
    pump.join().map_err(|_| {
        Error::new(ErrorKind::Internal).with_message(format!("{engine} pump panicked"))
    })
}

fn emit_bench_output(value: Value, format: BenchFormat) -> Result<(), Error> {
    match format {
        BenchFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string()));
            Ok(())
        }
        BenchFormat::Table => emit_table(&value),
        BenchFormat::Both => {
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string()));
            emit_table(&value)
        }
    }
}

fn emit_table(value: &Value) -> Result<(), Error> {
    let write_failed = |err: io::Error| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to write bench table")
            .with_source(err)
    };
    let results = value
        .get("results")
        .ok_or_else(|| Error::new(ErrorKind::Internal).with_message("bench results missing"))?;
    let mode = value
        .pointer("/params/mode")
        .and_then(|v| v.as_str())
        .unwrap_or("?");
    let field = |name: &str| results.get(name).and_then(|v| v.as_f64()).unwrap_or(f64::NAN);
    let latency = |name: &str| {
        results
            .get("latency_ms")
            .and_then(|v| v.get(name))
            .and_then(|v| v.as_f64())
            .unwrap_or(f64::NAN)
    };

    let mut stderr = io::stderr().lock();
    writeln!(stderr, "cqrpc bench (table)").map_err(write_failed)?;
    writeln!(
        stderr,
        "{:>10}  {:>9}  {:>6}  {:>6}  {:>6}  {:>12}  {:>8}  {:>8}",
        "mode", "completed", "ok", "non_ok", "errors", "calls/sec", "p50 ms", "p95 ms"
    )
    .map_err(write_failed)?;
    writeln!(
        stderr,
        "{:>10}  {:>9}  {:>6}  {:>6}  {:>6}  {:>12.1}  {:>8.3}  {:>8.3}",
        mode,
        field("completed"),
        field("ok"),
        field("non_ok"),
        field("errors"),
        field("calls_per_sec"),
        latency("p50"),
        latency("p95"),
    )
    .map_err(write_failed)?;
    Ok(())
}

fn latency_summary(sorted_ms: &[f64]) -> Value {
    if sorted_ms.is_empty() {
        return json!({});
    }
    json!({
        "min": sorted_ms.first().copied().unwrap_or(0.0),
        "p50": quantile(sorted_ms, 0.50),
        "p95": quantile(sorted_ms, 0.95),
        "max": sorted_ms.last().copied().unwrap_or(0.0),
    })
}

fn latency_capacity(calls: u64) -> usize {
    usize::try_from(calls.min(PREALLOCATED_CALLS)).unwrap_or(0)
}

fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let clamped = q.clamp(0.0, 1.0);
    let idx = ((sorted.len() - 1) as f64 * clamped).round() as usize;
    sorted.get(idx).copied().unwrap_or(0.0)
}

fn system_json() -> Value {
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    json!({
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "cpus": cpus,
    })
}

fn rfc3339_now(ts: SystemTime) -> String {
    let dur = ts.duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = dur.as_secs() as i64;
    let nsec = dur.subsec_nanos();
    let tm = time::OffsetDateTime::from_unix_timestamp(secs).unwrap_or(time::OffsetDateTime::UNIX_EPOCH);
    let tm = tm.replace_nanosecond(nsec).unwrap_or(tm);
    tm.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
