#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use redlite::server::{Server, ServerOptions};
use redlite::tokenizer::{tokenize_bytes, Decoded};

pub fn spawn_master() -> SocketAddr {
    spawn_server(None)
}

pub fn spawn_replica(master: SocketAddr) -> SocketAddr {
    spawn_server(Some(("127.0.0.1".to_string(), master.port())))
}

/// Boots a server on an ephemeral port on a background thread.
pub fn spawn_server(replicaof: Option<(String, u16)>) -> SocketAddr {
    let server = Server::bind(ServerOptions { port: 0, replicaof }).unwrap();
    let addr = server.local_addr().unwrap();
    thread::spawn(move || server.run());
    addr
}

/// A raw RESP client. Replies are asserted byte-for-byte where the expected
/// wire form is fixed, or read frame-wise where it is not.
pub struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Client {
    pub fn connect(addr: SocketAddr) -> Client {
        Client::from_stream(TcpStream::connect(addr).unwrap())
    }

    pub fn from_stream(stream: TcpStream) -> Client {
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        Client {
            stream,
            buf: Vec::new(),
        }
    }

    pub fn send(&mut self, parts: &[&str]) {
        let mut wire = format!("*{}\r\n", parts.len()).into_bytes();
        for part in parts {
            wire.extend_from_slice(format!("${}\r\n", part.len()).as_bytes());
            wire.extend_from_slice(part.as_bytes());
            wire.extend_from_slice(b"\r\n");
        }
        self.stream.write_all(&wire).unwrap();
    }

    pub fn send_raw(&mut self, wire: &[u8]) {
        self.stream.write_all(wire).unwrap();
    }

    fn fill(&mut self) {
        let mut chunk = [0u8; 1024];
        let read = self.stream.read(&mut chunk).unwrap();
        assert!(read > 0, "connection closed while waiting for a reply");
        self.buf.extend_from_slice(&chunk[..read]);
    }

    /// Reads exactly `expected.len()` bytes and compares.
    pub fn expect(&mut self, expected: &[u8]) {
        while self.buf.len() < expected.len() {
            self.fill();
        }
        let got: Vec<u8> = self.buf.drain(..expected.len()).collect();
        assert_eq!(
            got,
            expected,
            "reply mismatch: got {:?}, wanted {:?}",
            String::from_utf8_lossy(&got),
            String::from_utf8_lossy(expected)
        );
    }

    pub fn roundtrip(&mut self, parts: &[&str], expected: &[u8]) {
        self.send(parts);
        self.expect(expected);
    }

    /// Reads one complete RESP frame and returns its raw bytes.
    pub fn read_frame(&mut self) -> Vec<u8> {
        loop {
            let consumed = match tokenize_bytes(&self.buf) {
                Ok(Decoded::Complete(_, rest)) => Some(self.buf.len() - rest.len()),
                _ => None,
            };
            if let Some(consumed) = consumed {
                return self.buf.drain(..consumed).collect();
            }
            self.fill();
        }
    }

    /// Reads the raw RDB frame a master sends after `+FULLRESYNC` (a bulk
    /// length prefix with no trailing CRLF) and returns the payload length.
    pub fn read_rdb_frame(&mut self) -> usize {
        loop {
            let decoded = match redlite::tokenizer::tokenize_rdb(&self.buf) {
                Ok(Some((payload, rest))) => Some((payload.len(), self.buf.len() - rest.len())),
                _ => None,
            };
            if let Some((len, consumed)) = decoded {
                self.buf.drain(..consumed);
                return len;
            }
            self.fill();
        }
    }
}

/// Polls `probe` until it yields `Some` or the deadline passes.
pub fn poll_until<T>(timeout: Duration, mut probe: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = probe() {
            return value;
        }
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(20));
    }
}
