// Unary call lifecycle through real client and server pumps.
use std::collections::HashMap;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use cqrpc::api::{
    AsyncClient, AsyncServer, ClientCallbacks, EngineConfig, ErrorKind, Method, Network,
    ServerCallbacks, Status, StatusCode, UnaryWriter,
};

const ECHO: Method<String, String> = Method::unary("/test.Echo/Say");
const WAIT: Duration = Duration::from_secs(10);

#[derive(Debug)]
enum Event {
    Response(u64, String),
    Status(u64, StatusCode),
    Error(u64, ErrorKind),
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn echo_server(network: &Network, address: &str) -> (AsyncServer, thread::JoinHandle<()>) {
    let server = AsyncServer::bind_with(network, address, EngineConfig::default()).expect("bind");
    server
        .unary_rpc(
            ECHO,
            ServerCallbacks::new().on_connect(|request: &String, writer| {
                writer.finish(format!("echo:{request}"), Status::ok());
            }),
        )
        .expect("register");
    let pump = server.spawn_pump().expect("server pump");
    (server, pump)
}

fn tracked(index: u64, tx: &mpsc::Sender<Event>) -> ClientCallbacks<String> {
    let on_response = tx.clone();
    let on_status = tx.clone();
    let on_error = tx.clone();
    ClientCallbacks::new()
        .on_response(move |resp| on_response.send(Event::Response(index, resp)).expect("send"))
        .on_status(move |status| on_status.send(Event::Status(index, status.code())).expect("send"))
        .on_error(move |err| on_error.send(Event::Error(index, err.kind())).expect("send"))
}

#[test]
fn every_call_gets_exactly_one_terminal_callback() {
    let network = Network::new();
    let (server, server_pump) = echo_server(&network, "mem:echo");
    let client = AsyncClient::connect_with(&network, "mem:echo", EngineConfig::default());
    let client_pump = client.spawn_pump().expect("client pump");

    let calls = 200u64;
    let (tx, rx) = mpsc::channel();
    for index in 0..calls {
        client
            .unary_rpc(ECHO, format!("m{index}"), tracked(index, &tx))
            .expect("start");
    }
    drop(tx);

    let mut statuses: HashMap<u64, StatusCode> = HashMap::new();
    let mut responses: HashMap<u64, String> = HashMap::new();
    while statuses.len() < calls as usize {
        match rx.recv_timeout(WAIT).expect("event") {
            Event::Response(index, resp) => {
                assert!(!statuses.contains_key(&index), "response after status");
                assert!(responses.insert(index, resp).is_none(), "duplicate response");
            }
            Event::Status(index, code) => {
                assert!(statuses.insert(index, code).is_none(), "duplicate status");
            }
            Event::Error(index, kind) => panic!("call {index} failed with {kind:?}"),
        }
    }
    for index in 0..calls {
        assert_eq!(statuses.get(&index), Some(&StatusCode::Ok));
        assert_eq!(responses.get(&index).map(String::as_str), Some(format!("echo:m{index}").as_str()));
    }

    wait_until("client registry to drain", || client.pending_calls() == 0);
    client.shutdown();
    client_pump.join().expect("client join");
    server.shutdown();
    server_pump.join().expect("server join");
    assert!(rx.try_recv().is_err(), "no callbacks after the terminal one");
}

#[test]
fn held_calls_fill_and_drain_both_registries() {
    let network = Network::new();
    let server =
        AsyncServer::bind_with(&network, "mem:hold", EngineConfig::default()).expect("bind");
    let (writer_tx, writer_rx) = mpsc::channel::<UnaryWriter<String>>();
    server
        .unary_rpc(
            ECHO,
            ServerCallbacks::new().on_connect(move |_: &String, writer| {
                writer_tx.send(writer).expect("send writer");
            }),
        )
        .expect("register");
    let server_pump = server.spawn_pump().expect("server pump");
    let client = AsyncClient::connect_with(&network, "mem:hold", EngineConfig::default());
    let client_pump = client.spawn_pump().expect("client pump");

    let (tx, rx) = mpsc::channel();
    for index in 0..2 {
        client
            .unary_rpc(ECHO, format!("h{index}"), tracked(index, &tx))
            .expect("start");
    }
    let writers: Vec<_> = (0..2)
        .map(|_| writer_rx.recv_timeout(WAIT).expect("writer"))
        .collect();
    assert_eq!(client.pending_calls(), 2);
    assert_eq!(server.active_calls(), 2);

    for writer in &writers {
        assert!(writer.finish("held".to_string(), Status::ok()));
        assert!(!writer.finish("again".to_string(), Status::ok()));
    }
    let mut done = 0;
    while done < 2 {
        if let Event::Status(_, code) = rx.recv_timeout(WAIT).expect("event") {
            assert_eq!(code, StatusCode::Ok);
            done += 1;
        }
    }
    wait_until("client registry to drain", || client.pending_calls() == 0);
    wait_until("server registry to drain", || server.active_calls() == 0);

    client.shutdown();
    server.shutdown();
    client_pump.join().expect("client join");
    server_pump.join().expect("server join");
}

#[test]
fn calls_after_shutdown_are_refused_without_callbacks() {
    let network = Network::new();
    let (server, server_pump) = echo_server(&network, "mem:late");
    let client = AsyncClient::connect_with(&network, "mem:late", EngineConfig::default());
    let client_pump = client.spawn_pump().expect("client pump");

    client.shutdown();
    let (tx, rx) = mpsc::channel();
    let err = client
        .unary_rpc(ECHO, "late".to_string(), tracked(0, &tx))
        .expect_err("closed");
    assert_eq!(err.kind(), ErrorKind::Closed);
    client_pump.join().expect("client join");
    drop(tx);
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert_eq!(client.pending_calls(), 0);

    server.shutdown();
    server_pump.join().expect("server join");
}

#[test]
fn cancelled_call_reports_error_once() {
    let network = Network::new();
    let server =
        AsyncServer::bind_with(&network, "mem:cancel", EngineConfig::default()).expect("bind");
    let (writer_tx, writer_rx) = mpsc::channel::<UnaryWriter<String>>();
    server
        .unary_rpc(
            ECHO,
            ServerCallbacks::new().on_connect(move |_: &String, writer| {
                writer_tx.send(writer).expect("send writer");
            }),
        )
        .expect("register");
    let server_pump = server.spawn_pump().expect("server pump");
    let client = AsyncClient::connect_with(&network, "mem:cancel", EngineConfig::default());
    let client_pump = client.spawn_pump().expect("client pump");

    let (tx, rx) = mpsc::channel();
    let handle = client
        .unary_rpc(ECHO, "slow".to_string(), tracked(7, &tx))
        .expect("start");
    let writer = writer_rx.recv_timeout(WAIT).expect("writer");
    assert!(handle.cancel());
    assert!(!handle.cancel());

    match rx.recv_timeout(WAIT).expect("event") {
        Event::Error(7, ErrorKind::Transport) => {}
        other => panic!("expected transport error, got {other:?}"),
    }
    writer.finish("too late".to_string(), Status::ok());
    wait_until("client registry to drain", || client.pending_calls() == 0);
    wait_until("server registry to drain", || server.active_calls() == 0);

    client.shutdown();
    server.shutdown();
    client_pump.join().expect("client join");
    server_pump.join().expect("server join");
    drop(tx);
    assert!(rx.try_recv().is_err(), "cancelled call fired more than once");
}

#[test]
fn cancel_and_shutdown_leave_the_call_registered_until_the_pump_runs() {
    let network = Network::new();
    let server =
        AsyncServer::bind_with(&network, "mem:idle", EngineConfig::default()).expect("bind");
    server
        .unary_rpc(ECHO, ServerCallbacks::new())
        .expect("register");
    let client = AsyncClient::connect_with(&network, "mem:idle", EngineConfig::default());

    let (tx, rx) = mpsc::channel();
    let handle = client
        .unary_rpc(ECHO, "parked".to_string(), tracked(3, &tx))
        .expect("start");
    assert!(handle.cancel());
    assert_eq!(client.pending_calls(), 1);
    client.shutdown();
    assert_eq!(client.pending_calls(), 1);
    assert!(rx.try_recv().is_err(), "no callback before the pump runs");

    client.run();
    assert_eq!(client.pending_calls(), 0);
    drop(tx);
    let events: Vec<_> = rx.iter().collect();
    assert!(matches!(events.as_slice(), [Event::Error(3, ErrorKind::Transport)]));

    server.shutdown();
    server.run();
}

#[test]
fn callbacks_can_issue_follow_up_calls() {
    let network = Network::new();
    let (server, server_pump) = echo_server(&network, "mem:chain");
    let client = AsyncClient::connect_with(&network, "mem:chain", EngineConfig::default());
    let client_pump = client.spawn_pump().expect("client pump");

    let (tx, rx) = mpsc::channel();
    let chained = client.clone();
    client
        .unary_rpc(
            ECHO,
            "first".to_string(),
            ClientCallbacks::new().on_response(move |first: String| {
                chained
                    .unary_rpc(
                        ECHO,
                        first,
                        ClientCallbacks::new().on_response(move |second| {
                            tx.send(second).expect("send");
                        }),
                    )
                    .expect("follow-up");
            }),
        )
        .expect("start");
    assert_eq!(rx.recv_timeout(WAIT).expect("second"), "echo:echo:first");

    client.shutdown();
    server.shutdown();
    client_pump.join().expect("client join");
    server_pump.join().expect("server join");
}

#[test]
fn shutdown_cancels_in_flight_calls() {
    let network = Network::new();
    let server =
        AsyncServer::bind_with(&network, "mem:stuck", EngineConfig::default()).expect("bind");
    let (writer_tx, writer_rx) = mpsc::channel::<UnaryWriter<String>>();
    server
        .unary_rpc(
            ECHO,
            ServerCallbacks::new().on_connect(move |_: &String, writer| {
                writer_tx.send(writer).expect("send writer");
            }),
        )
        .expect("register");
    let server_pump = server.spawn_pump().expect("server pump");
    let client = AsyncClient::connect_with(&network, "mem:stuck", EngineConfig::default());
    let client_pump = client.spawn_pump().expect("client pump");

    let (tx, rx) = mpsc::channel();
    for index in 0..5 {
        client
            .unary_rpc(ECHO, format!("s{index}"), tracked(index, &tx))
            .expect("start");
    }
    let writers: Vec<_> = (0..5)
        .map(|_| writer_rx.recv_timeout(WAIT).expect("writer"))
        .collect();

    client.shutdown();
    client_pump.join().expect("client join");
    assert_eq!(client.pending_calls(), 0);
    drop(tx);
    let errors: Vec<_> = rx.iter().collect();
    assert_eq!(errors.len(), 5);
    assert!(errors
        .iter()
        .all(|event| matches!(event, Event::Error(_, ErrorKind::Transport))));

    for writer in &writers {
        writer.finish("ignored".to_string(), Status::ok());
    }
    server.shutdown();
    server_pump.join().expect("server join");
    assert_eq!(server.active_calls(), 0);
}
