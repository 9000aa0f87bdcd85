use modemgate::config::{BbsEntry, Protocol};
use modemgate::connector::{connect, connect_telnet, open_rlogin, rlogin_handshake, ConnectOptions};
use modemgate::error::GatewayError;
use modemgate::stream::{DuplexStream, ReadOutcome, RemoteStream};
use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

mod common;
use common::scripted_modem;

fn opts() -> ConnectOptions {
    ConnectOptions {
        timeout: Duration::from_secs(2),
        ..ConnectOptions::default()
    }
}

fn local_entry(listener: &TcpListener, protocol: Protocol) -> BbsEntry {
    let port = listener.local_addr().unwrap().port();
    BbsEntry::new("Loopback", "127.0.0.1", port, protocol)
}

/// rlogin server: reads the four-field handshake, answers with `ack`, then greets.
fn rlogin_server(listener: TcpListener, ack: u8) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut got = Vec::new();
        let mut buf = [0u8; 128];
        while got.iter().filter(|b| **b == 0).count() < 4 {
            let n = sock.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            got.extend_from_slice(&buf[..n]);
        }
        sock.write_all(&[ack]).unwrap();
        sock.write_all(b"Welcome").unwrap();
        thread::sleep(Duration::from_millis(200));
        got
    })
}

fn read_until(stream: &mut dyn DuplexStream, needle: &[u8]) -> Vec<u8> {
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut got = Vec::new();
    let mut buf = [0u8; 64];
    while Instant::now() < deadline && !got.windows(needle.len()).any(|w| w == needle) {
        match stream.read(&mut buf).unwrap() {
            ReadOutcome::Data(n) => got.extend_from_slice(&buf[..n]),
            ReadOutcome::WouldBlock => thread::sleep(Duration::from_millis(5)),
            ReadOutcome::Closed => break,
        }
    }
    got
}

#[test]
fn rlogin_sends_exact_handshake_and_reads_one_ack() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let entry = local_entry(&listener, Protocol::Rlogin);
    let server = rlogin_server(listener, 0);

    let mut stream = open_rlogin(&entry, "alice", Duration::from_secs(2)).unwrap();
    // The acknowledgement byte is consumed; the greeting is not.
    assert_eq!(read_until(&mut stream, b"Welcome"), b"Welcome");
    assert_eq!(server.join().unwrap(), b"\0alice\0alice\0ansi/9600\0");
    assert_eq!(rlogin_handshake("alice"), b"\0alice\0alice\0ansi/9600\0");
}

#[test]
fn rlogin_tolerates_nonzero_ack() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let entry = local_entry(&listener, Protocol::Rlogin);
    let server = rlogin_server(listener, b'X');

    let mut stream = open_rlogin(&entry, "bob", Duration::from_secs(2)).unwrap();
    assert_eq!(read_until(&mut stream, b"Welcome"), b"Welcome");
    server.join().unwrap();
}

#[test]
fn rlogin_prompts_caller_for_username() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let entry = local_entry(&listener, Protocol::Rlogin);
    let server = rlogin_server(listener, 0);
    let (mut modem, mut caller, _) = scripted_modem();

    caller.send(b"carol\r");
    let stream = connect(&entry, &mut modem, &opts());
    assert!(matches!(stream, Some(RemoteStream::Rlogin(_))));
    assert!(caller.expect("Username: carol", Duration::from_secs(1)));
    assert_eq!(server.join().unwrap(), b"\0carol\0carol\0ansi/9600\0");
}

#[test]
fn rlogin_without_username_returns_to_menu() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let entry = local_entry(&listener, Protocol::Rlogin);
    let (mut modem, mut caller, _) = scripted_modem();

    caller.send(b"\r");
    assert!(connect(&entry, &mut modem, &opts()).is_none());
    assert!(caller.expect("Username required.", Duration::from_secs(1)));
}

#[test]
fn telnet_connects_and_carries_bytes() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let entry = local_entry(&listener, Protocol::Telnet);
    let server = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        sock.write_all(b"Hello caller").unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; 3];
        sock.read_exact(&mut buf).unwrap();
        buf
    });

    let mut stream = connect_telnet(&entry, &opts()).unwrap();
    assert_eq!(stream.protocol_name(), "telnet");
    stream.set_blocking(false).unwrap();
    assert_eq!(read_until(&mut stream, b"caller"), b"Hello caller");
    stream.write_all(b"hi!").unwrap();
    assert_eq!(&server.join().unwrap(), b"hi!");
    stream.close();
    assert!(stream.is_closed());
}

#[test]
fn telnet_to_closed_port_fails_within_timeout() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let entry = BbsEntry::new("Gone", "127.0.0.1", port, Protocol::Telnet);
    let start = Instant::now();
    assert!(connect_telnet(&entry, &opts()).is_none());
    assert!(start.elapsed() < Duration::from_secs(3));
}

#[test]
fn unreachable_host_reports_connection_failure() {
    let entry = BbsEntry::new("Nowhere", "no-such-host.invalid", 23, Protocol::Rlogin);
    let err = open_rlogin(&entry, "alice", Duration::from_millis(500)).unwrap_err();
    assert!(matches!(err, GatewayError::ConnectionFailed { .. }));
}

#[test]
fn ssh_failure_offers_retry_or_menu() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let entry = local_entry(&listener, Protocol::Ssh);
    let server = thread::spawn(move || {
        // Not an SSH server: send a bogus banner and hang up.
        let (mut sock, _) = listener.accept().unwrap();
        let _ = sock.write_all(b"HTTP/1.0 400 Bad Request\r\n\r\n");
        drop(sock);
    });
    let (mut modem, mut caller, _) = scripted_modem();

    caller.send(b"bob\rsecret\rm");
    assert!(connect(&entry, &mut modem, &opts()).is_none());
    server.join().unwrap();
    let shown = caller.drain(Duration::from_millis(100));
    assert!(shown.contains("SSH connection to 127.0.0.1:"));
    assert!(shown.contains("Password: ******"), "password is masked: {shown}");
    assert!(!shown.contains("secret"));
    assert!(shown.contains("(R)etry or (M)enu? "));
}

#[test]
fn peer_drop_after_accept_reads_as_closed() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let entry = local_entry(&listener, Protocol::Telnet);
    let server = thread::spawn(move || drop(listener.accept().unwrap()));
    let mut stream = connect_telnet(&entry, &opts()).unwrap();
    server.join().unwrap();
    stream.set_blocking(true).unwrap();
    let mut buf = [0u8; 8];
    let mut outcome = stream.read(&mut buf).unwrap();
    while outcome == ReadOutcome::WouldBlock {
        outcome = stream.read(&mut buf).unwrap();
    }
    assert_eq!(outcome, ReadOutcome::Closed);
}
