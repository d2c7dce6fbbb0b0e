// Client-stream calls: ordered writes, half-close, cancellation, and shutdown.
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use cqrpc::api::{
    AsyncClient, AsyncServer, ClientCallbacks, EngineConfig, ErrorKind, Method, Network,
    ServerCallbacks, Status, StatusCode, UnaryWriter,
};

const UPLOAD: Method<u32, u32> = Method::client_stream("/test.Stats/Sum");
const WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, PartialEq)]
enum Event {
    Response(u32),
    Status(StatusCode),
    Error(ErrorKind),
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn recorded(tx: &mpsc::Sender<Event>) -> ClientCallbacks<u32> {
    let on_response = tx.clone();
    let on_status = tx.clone();
    let on_error = tx.clone();
    ClientCallbacks::new()
        .on_response(move |sum| on_response.send(Event::Response(sum)).expect("send"))
        .on_status(move |status| on_status.send(Event::Status(status.code())).expect("send"))
        .on_error(move |err| on_error.send(Event::Error(err.kind())).expect("send"))
}

struct Harness {
    server: AsyncServer,
    server_pump: thread::JoinHandle<()>,
    client: AsyncClient,
    client_pump: thread::JoinHandle<()>,
    seen: mpsc::Receiver<Vec<u32>>,
}

impl Harness {
    fn start(address: &str) -> Self {
        let network = Network::new();
        let server =
            AsyncServer::bind_with(&network, address, EngineConfig::default()).expect("bind");
        let (seen_tx, seen) = mpsc::channel();
        server
            .client_stream_rpc(
                UPLOAD,
                ServerCallbacks::new().on_connect(move |requests: &[u32], writer: UnaryWriter<u32>| {
                    seen_tx.send(requests.to_vec()).expect("send requests");
                    writer.finish(requests.iter().sum(), Status::ok());
                }),
            )
            .expect("register");
        let server_pump = server.spawn_pump().expect("server pump");
        let client = AsyncClient::connect_with(&network, address, EngineConfig::default());
        let client_pump = client.spawn_pump().expect("client pump");
        Self {
            server,
            server_pump,
            client,
            client_pump,
            seen,
        }
    }

    fn stop(self) {
        self.client.shutdown();
        self.server.shutdown();
        self.client_pump.join().expect("client join");
        self.server_pump.join().expect("server join");
        assert_eq!(self.client.pending_calls(), 0);
        assert_eq!(self.server.active_calls(), 0);
    }
}

#[test]
fn streamed_writes_arrive_in_order_before_the_reply() {
    let harness = Harness::start("mem:sum");
    let (tx, rx) = mpsc::channel();
    let writer = harness
        .client
        .client_stream_rpc(UPLOAD, recorded(&tx))
        .expect("open");
    for value in 1..=4 {
        assert!(writer.write(value));
    }
    assert!(writer.finish());
    assert!(!writer.write(5), "write after finish is refused");
    assert!(!writer.finish(), "finish is accepted once");

    assert_eq!(harness.seen.recv_timeout(WAIT).expect("requests"), vec![1, 2, 3, 4]);
    assert_eq!(rx.recv_timeout(WAIT).expect("response"), Event::Response(10));
    assert_eq!(rx.recv_timeout(WAIT).expect("status"), Event::Status(StatusCode::Ok));
    wait_until("client registry to drain", || harness.client.pending_calls() == 0);
    assert!(!writer.write(6), "writer is inert after the call ends");

    harness.stop();
    drop(tx);
    assert!(rx.try_recv().is_err());
}

#[test]
fn finish_without_writes_sends_an_empty_stream() {
    let harness = Harness::start("mem:empty");
    let (tx, rx) = mpsc::channel();
    let writer = harness
        .client
        .client_stream_rpc(UPLOAD, recorded(&tx))
        .expect("open");
    assert!(writer.finish());
    assert_eq!(harness.seen.recv_timeout(WAIT).expect("requests"), Vec::<u32>::new());
    assert_eq!(rx.recv_timeout(WAIT).expect("response"), Event::Response(0));
    harness.stop();
}

#[test]
fn cancel_reports_one_error_and_never_reaches_the_server() {
    let harness = Harness::start("mem:abort");
    let (tx, rx) = mpsc::channel();
    let writer = harness
        .client
        .client_stream_rpc(UPLOAD, recorded(&tx))
        .expect("open");
    assert!(writer.write(1));
    assert!(writer.cancel());
    assert!(!writer.cancel());
    assert!(!writer.write(2));

    assert_eq!(rx.recv_timeout(WAIT).expect("error"), Event::Error(ErrorKind::Transport));
    wait_until("client registry to drain", || harness.client.pending_calls() == 0);
    assert!(harness.seen.try_recv().is_err());

    harness.stop();
    drop(tx);
    assert!(rx.try_recv().is_err());
}

#[test]
fn unhandled_stream_method_is_unimplemented() {
    let network = Network::new();
    let server =
        AsyncServer::bind_with(&network, "mem:nostream", EngineConfig::default()).expect("bind");
    server
        .client_stream_rpc(UPLOAD, ServerCallbacks::new())
        .expect("register");
    let server_pump = server.spawn_pump().expect("server pump");
    let client = AsyncClient::connect_with(&network, "mem:nostream", EngineConfig::default());
    let client_pump = client.spawn_pump().expect("client pump");

    let (tx, rx) = mpsc::channel();
    let writer = client.client_stream_rpc(UPLOAD, recorded(&tx)).expect("open");
    assert!(writer.write(3));
    assert!(writer.finish());
    assert_eq!(rx.recv_timeout(WAIT).expect("response"), Event::Response(0));
    assert_eq!(
        rx.recv_timeout(WAIT).expect("status"),
        Event::Status(StatusCode::Unimplemented)
    );

    client.shutdown();
    server.shutdown();
    client_pump.join().expect("client join");
    server_pump.join().expect("server join");
}

#[test]
fn stream_to_missing_server_finishes_unavailable() {
    let client = AsyncClient::connect_with(&Network::new(), "mem:nobody", EngineConfig::default());
    let client_pump = client.spawn_pump().expect("client pump");
    let (tx, rx) = mpsc::channel();
    let writer = client.client_stream_rpc(UPLOAD, recorded(&tx)).expect("open");
    assert!(writer.write(1));
    assert!(writer.finish());
    assert_eq!(rx.recv_timeout(WAIT).expect("response"), Event::Response(0));
    assert_eq!(
        rx.recv_timeout(WAIT).expect("status"),
        Event::Status(StatusCode::Unavailable)
    );
    client.shutdown();
    client_pump.join().expect("client join");
}

#[test]
fn shutdown_drains_open_streams() {
    let harness = Harness::start("mem:drain");
    let (tx, rx) = mpsc::channel();
    let writers: Vec<_> = (0..3)
        .map(|_| {
            harness
                .client
                .client_stream_rpc(UPLOAD, recorded(&tx))
                .expect("open")
        })
        .collect();
    assert!(writers[0].write(9));

    let client = harness.client.clone();
    harness.stop();
    drop(tx);
    let events: Vec<_> = rx.iter().collect();
    assert!(events.len() <= writers.len());
    assert!(events.iter().all(|event| *event == Event::Error(ErrorKind::Transport)));
    for writer in &writers {
        assert!(!writer.write(1));
    }
    let err = client
        .client_stream_rpc(UPLOAD, ClientCallbacks::new())
        .expect_err("closed");
    assert_eq!(err.kind(), ErrorKind::Closed);
}
