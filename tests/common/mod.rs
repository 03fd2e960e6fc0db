#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use tinyredis::master::{self, MasterServer};
use tinyredis::net::Binding;
use tinyredis::redis::RedisServer;
use tinyredis::replica;
use tinyredis::resp::{self, RESP};

fn bind_free_port() -> (u16, TcpListener) {
    let port = portpicker::pick_unused_port().expect("no free port");
    let listener = TcpListener::bind(Binding::local(port).to_string()).expect("bind test server");
    (port, listener)
}

/// Spin up a master on a free port; the accept loop runs for the rest of the
/// test process.
pub fn start_master() -> u16 {
    let (port, listener) = bind_free_port();
    let redis = RedisServer::new(Binding::local(port), true);
    let master = MasterServer::new(redis);
    thread::spawn(move || master::serve(listener, master));
    port
}

/// Spin up a replica of `leader_port` on a free port.
pub fn start_replica(leader_port: u16) -> u16 {
    let (port, listener) = bind_free_port();
    let redis = RedisServer::new(Binding::local(port), false);
    replica::start_replication(redis.clone(), Binding::local(leader_port))
        .expect("start replication thread");
    thread::spawn(move || replica::serve(listener, redis));
    port
}

/// Raw TCP test client; replies are decoded with the crate's own codec.
pub struct TestClient {
    stream: TcpStream,
    buffer: Vec<u8>,
}

impl TestClient {
    pub fn connect(port: u16) -> Self {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match TcpStream::connect(("127.0.0.1", port)) {
                Ok(stream) => return TestClient { stream, buffer: Vec::new() },
                Err(err) => {
                    if Instant::now() > deadline {
                        panic!("could not connect to test server: {}", err);
                    }
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }

    pub fn send(&mut self, parts: &[&str]) {
        let bytes = resp::encode_to_vec(&RESP::command(parts));
        self.send_raw(&bytes);
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("send");
        self.stream.flush().expect("flush");
    }

    pub fn recv(&mut self) -> RESP {
        loop {
            if let Some((consumed, message)) = resp::decode(&self.buffer).expect("valid reply") {
                self.buffer.drain(..consumed);
                return message;
            }
            self.fill();
        }
    }

    /// The CRLF-less snapshot blob sent after FULLRESYNC.
    pub fn recv_snapshot(&mut self) -> Vec<u8> {
        loop {
            if let Some(pos) = self.buffer.windows(2).position(|w| w == b"\r\n") {
                assert_eq!(self.buffer[0], b'$', "snapshot must be a bulk header");
                let len: usize = std::str::from_utf8(&self.buffer[1..pos])
                    .expect("ASCII length")
                    .parse()
                    .expect("numeric length");
                if self.buffer.len() >= pos + 2 + len {
                    let blob = self.buffer[pos + 2..pos + 2 + len].to_vec();
                    self.buffer.drain(..pos + 2 + len);
                    return blob;
                }
            }
            self.fill();
        }
    }

    fn fill(&mut self) {
        let mut chunk = [0u8; 4096];
        let read = self.stream.read(&mut chunk).expect("recv");
        assert!(read > 0, "server closed the connection");
        self.buffer.extend_from_slice(&chunk[..read]);
    }

    pub fn roundtrip(&mut self, parts: &[&str]) -> RESP {
        self.send(parts);
        self.recv()
    }
}

/// Poll `check` until it returns true or the timeout elapses.
pub fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(20));
    }
}
