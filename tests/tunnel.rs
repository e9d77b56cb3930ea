//! End-to-end tests: clients talk to an echo server through a split/join
//! pair running on loopback.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use imux::{Acceptor, ConnectionPool, ManyToOne, PoolConfig, ShutdownHandle, one_to_many};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Echo server standing in for the destination. Every connection is echoed
/// until the peer shuts down its write half.
fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = stream.shutdown(Shutdown::Write);
            });
        }
    });
    addr
}

struct Tunnel {
    entry: SocketAddr,
    pool: ConnectionPool,
    egress: ManyToOne,
    stops: Vec<ShutdownHandle>,
}

impl Tunnel {
    /// Starts join in front of `destination` and split in front of join.
    fn start(destination: SocketAddr, links: usize, config: PoolConfig) -> Tunnel {
        let egress = ManyToOne::new(destination, config.clone()).unwrap();
        let join = Acceptor::bind("127.0.0.1:0").unwrap();
        let join_addr = join.local_addr().unwrap();
        let mut stops = vec![join.shutdown_handle()];
        {
            let egress = egress.clone();
            thread::spawn(move || egress.serve(&join));
        }

        let pool = ConnectionPool::connect(join_addr, links, config).unwrap();
        let split = Acceptor::bind("127.0.0.1:0").unwrap();
        let entry = split.local_addr().unwrap();
        stops.push(split.shutdown_handle());
        {
            let pool = pool.clone();
            thread::spawn(move || one_to_many(&split, &pool));
        }

        Tunnel {
            entry,
            pool,
            egress,
            stops,
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.entry).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        stream
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        for stop in &self.stops {
            let _ = stop.shutdown();
        }
        self.pool.shutdown();
        self.egress.shutdown();
    }
}

fn random_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|_| -> u8 { random_number::random!() }).collect()
}

/// Writes `payload` from one thread while reading the echo on this one.
fn echo_through(stream: TcpStream, payload: Vec<u8>) -> Vec<u8> {
    let mut writer = stream.try_clone().unwrap();
    let expected = payload.len();
    let sending = thread::spawn(move || writer.write_all(&payload));

    let mut reader = stream;
    let mut echoed = vec![0u8; expected];
    reader.read_exact(&mut echoed).unwrap();
    sending.join().unwrap().unwrap();
    echoed
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// A stream far larger than one chunk comes back intact over four links.
#[test]
fn echo_survives_fan_out() {
    let tunnel = Tunnel::start(
        echo_server(),
        4,
        PoolConfig::default().with_chunk_size(512),
    );
    let payload = random_bytes(256 * 1024);
    let echoed = echo_through(tunnel.connect(), payload.clone());
    assert_eq!(echoed, payload);
}

/// Several clients at once each get their own bytes back.
#[test]
fn concurrent_sockets_stay_separate() {
    let tunnel = Tunnel::start(
        echo_server(),
        3,
        PoolConfig::default().with_chunk_size(1000),
    );
    let clients: Vec<_> = (0..8)
        .map(|_| {
            let stream = tunnel.connect();
            thread::spawn(move || {
                let payload = random_bytes(50_000);
                let echoed = echo_through(stream, payload.clone());
                echoed == payload
            })
        })
        .collect();
    for client in clients {
        assert!(client.join().unwrap());
    }
}

/// Aborting one client leaves another one running undisturbed.
#[test]
fn failing_socket_is_isolated() {
    let tunnel = Tunnel::start(echo_server(), 2, PoolConfig::default());

    let mut survivor = tunnel.connect();
    survivor.write_all(b"before").unwrap();
    let mut buf = [0u8; 6];
    survivor.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"before");

    let victim = tunnel.connect();
    (&victim).write_all(b"doomed").unwrap();
    victim.shutdown(Shutdown::Both).unwrap();
    drop(victim);

    survivor.write_all(b"after").unwrap();
    let mut buf = [0u8; 5];
    survivor.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"after");
}

/// Closing the client closes the destination connection and retires both
/// the reverse route and the write queue.
#[test]
fn close_propagates_and_cleans_up() {
    let tunnel = Tunnel::start(echo_server(), 2, PoolConfig::default());

    let mut client = tunnel.connect();
    client.write_all(b"ping").unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    // The route goes away once the client's stream ended, racing the echo.
    // Either way the tunnel must close the client instead of leaving it
    // hanging until the read timeout.
    let mut echoed = Vec::new();
    if let Err(e) = client.read_to_end(&mut echoed) {
        panic!("client was not closed by the tunnel: {e}");
    }
    assert!(b"ping".starts_with(&echoed));

    wait_until("route removal", || tunnel.pool.route_count() == 0);
    wait_until("write queue retirement", || tunnel.egress.registry().is_empty());
}
