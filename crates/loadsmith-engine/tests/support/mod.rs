#![allow(dead_code)]

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use loadsmith_common::Config;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Requests seen by a test server, with the last request body.
#[derive(Default)]
pub struct Seen {
    pub requests: AtomicUsize,
    pub last_body: Mutex<Option<(String, Vec<u8>)>>,
}

impl Seen {
    pub fn count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

/// HTTP server answering every request with `status` after `delay`.
pub async fn spawn_http_server(status: u16, delay: Duration) -> (SocketAddr, Arc<Seen>) {
    let seen = Arc::new(Seen::default());
    let svc_seen = Arc::clone(&seen);
    let make_svc = make_service_fn(move |_conn| {
        let seen = Arc::clone(&svc_seen);
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.requests.fetch_add(1, Ordering::SeqCst);
                    let content_type = req
                        .headers()
                        .get(hyper::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    let body = hyper::body::to_bytes(req.into_body())
                        .await
                        .map(|b| b.to_vec())
                        .unwrap_or_default();
                    if !body.is_empty() {
                        *seen.last_body.lock().unwrap() = Some((content_type, body));
                    }
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let mut resp = Response::new(Body::from("ok"));
                    *resp.status_mut() = StatusCode::from_u16(status).unwrap();
                    Ok::<_, Infallible>(resp)
                }
            }))
        }
    });
    let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make_svc);
    let addr = server.local_addr();
    tokio::spawn(server);
    (addr, seen)
}

/// An address nothing listens on.
pub async fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Answers exactly one HTTP request, then stops listening.
pub async fn spawn_one_shot_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        drop(listener);
        let mut buf = vec![0u8; 4096];
        let mut read = 0;
        while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
            match socket.read(&mut buf[read..]).await {
                Ok(0) | Err(_) => return,
                Ok(n) => read += n,
            }
        }
        let _ = socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
            .await;
        let _ = socket.shutdown().await;
    });
    addr
}

/// Accepts and keeps every connection without reading from it.
pub struct HoldingServer {
    pub addr: SocketAddr,
    pub accepted: Arc<AtomicUsize>,
    pub streams: Arc<Mutex<Vec<TcpStream>>>,
}

impl HoldingServer {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let streams = Arc::new(Mutex::new(Vec::new()));
        let (acc, held) = (Arc::clone(&accepted), Arc::clone(&streams));
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                acc.fetch_add(1, Ordering::SeqCst);
                held.lock().unwrap().push(socket);
            }
        });
        Self {
            addr,
            accepted,
            streams,
        }
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Closes every held connection from the server side.
    pub fn drop_all(&self) -> usize {
        let mut streams = self.streams.lock().unwrap();
        let n = streams.len();
        streams.clear();
        n
    }
}

/// Config with every delay shrunk so sessions finish in test time.
pub fn fast_config(addr: SocketAddr) -> Config {
    let mut config = Config::default();
    config.target.address = format!("http://{}", addr);
    config.session.workers = 2;
    config.session.duration_secs = Some(1);
    config.session.requests_per_worker = None;
    config.session.slice_pause_ms = (0, 5);
    config.session.drain_timeout_secs = 5;
    config.pool.target_size = 5;
    config.pool.connect_timeout_ms = 300;
    config.pool.fragment_interval_ms = (10, 20);
    config.pool.hold_window_secs = 1;
    config.pool.replenish_delay_ms = (0, 5);
    config.flood.read_timeout_ms = 1000;
    config.flood.write_timeout_ms = 1000;
    config.flood.read_delay_ms = (0, 2);
    config.flood.write_delay_ms = (0, 2);
    config
}

pub fn only(config: &mut Config, http: f64, post: f64, hold: f64, hybrid: f64) {
    config.weights.http_flood = http;
    config.weights.post_flood = post;
    config.weights.connection_hold = hold;
    config.weights.hybrid = hybrid;
}
