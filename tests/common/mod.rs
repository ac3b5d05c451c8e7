//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    body::Bytes,
    http::{HeaderMap, StatusCode},
    routing::any,
    Router,
};
use forward_proxy::config::ProxyConfig;
use forward_proxy::net::listener::Listener;
use forward_proxy::{HttpServer, Shutdown};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;

/// A running proxy on an ephemeral port.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub task: JoinHandle<Result<(), std::io::Error>>,
}

impl TestProxy {
    /// reqwest client that sends every http:// request through this proxy.
    pub fn client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .proxy(reqwest::Proxy::http(format!("http://{}", self.addr)).unwrap())
            .pool_max_idle_per_host(0)
            .build()
            .unwrap()
    }
}

pub async fn start_proxy(config: ProxyConfig) -> TestProxy {
    let inner = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = inner.local_addr().unwrap();
    let listener = Listener::new(inner, config.listener.max_connections);

    let shutdown = Shutdown::new();
    let server = HttpServer::new(config);
    let task = tokio::spawn(server.run(listener, shutdown.subscribe()));

    TestProxy {
        addr,
        shutdown,
        task,
    }
}

/// Start an origin server with a handful of inspection endpoints.
///
/// - `/echo-body`: responds with the request body
/// - `/headers`: `x-dup` values joined by `|`, newline, `x-empty` value or `<missing>`
/// - `/teapot`: 418 with an `x-upstream` header
/// - `/big`: 256 KiB of patterned bytes
pub async fn start_origin() -> SocketAddr {
    let app = Router::new()
        .route("/echo-body", any(|body: Bytes| async move { body }))
        .route(
            "/headers",
            any(|headers: HeaderMap| async move {
                let dups: Vec<&str> = headers
                    .get_all("x-dup")
                    .iter()
                    .map(|v| v.to_str().unwrap())
                    .collect();
                let empty = headers
                    .get("x-empty")
                    .map(|v| v.to_str().unwrap().to_string())
                    .unwrap_or_else(|| "<missing>".to_string());
                format!("{}\n{}", dups.join("|"), empty)
            }),
        )
        .route(
            "/teapot",
            any(|| async { (StatusCode::IM_A_TEAPOT, [("x-upstream", "yes")], "short and stout") }),
        )
        .route("/big", any(|| async { patterned(256 * 1024) }));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// Deterministic bytes covering every byte value.
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

/// Raw TCP server that echoes everything back until EOF.
pub async fn start_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = socket.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

/// Raw TCP server that stays silent until the client half-closes, then
/// reports how many bytes it got and closes.
pub async fn start_tcp_collector() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut received = Vec::new();
                if socket.read_to_end(&mut received).await.is_ok() {
                    let reply = format!("got {} bytes", received.len());
                    let _ = socket.write_all(reply.as_bytes()).await;
                }
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

/// An address nothing is listening on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// A listener nobody accepts from, its backlog filled so that new
/// handshakes stall. Dropping it frees the port.
pub struct StalledListener {
    pub addr: SocketAddr,
    _listener: TcpListener,
    _fillers: Vec<TcpStream>,
}

pub async fn stalled_listener() -> StalledListener {
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let listener = socket.listen(0).unwrap();
    let addr = listener.local_addr().unwrap();

    let mut fillers = Vec::new();
    while let Ok(Ok(stream)) =
        tokio::time::timeout(Duration::from_millis(200), TcpStream::connect(addr)).await
    {
        fillers.push(stream);
        assert!(fillers.len() < 64, "backlog never filled");
    }

    StalledListener {
        addr,
        _listener: listener,
        _fillers: fillers,
    }
}

/// Minimal HTTP/1.1 response reader that never reads past the message,
/// so the same stream can carry tunneled bytes or a follow-up request.
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

async fn read_line(stream: &mut TcpStream) -> String {
    let mut line = Vec::new();
    loop {
        let byte = stream.read_u8().await.expect("connection closed mid-line");
        line.push(byte);
        if line.ends_with(b"\r\n") {
            line.truncate(line.len() - 2);
            return String::from_utf8(line).unwrap();
        }
    }
}

/// Read a response head and, unless `head_only`, its body.
pub async fn read_response(stream: &mut TcpStream, head_only: bool) -> RawResponse {
    let status_line = read_line(stream).await;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or_else(|| panic!("bad status line {status_line:?}"));

    let mut headers = Vec::new();
    loop {
        let line = read_line(stream).await;
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').unwrap();
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let mut response = RawResponse {
        status,
        headers,
        body: Vec::new(),
    };
    if head_only {
        return response;
    }

    if let Some(len) = response.header("content-length") {
        let mut body = vec![0u8; len.parse().unwrap()];
        stream.read_exact(&mut body).await.unwrap();
        response.body = body;
    } else if response
        .header("transfer-encoding")
        .is_some_and(|te| te.eq_ignore_ascii_case("chunked"))
    {
        loop {
            let size_line = read_line(stream).await;
            let size = usize::from_str_radix(size_line.split(';').next().unwrap().trim(), 16).unwrap();
            if size == 0 {
                // trailers end with an empty line
                while !read_line(stream).await.is_empty() {}
                break;
            }
            let mut chunk = vec![0u8; size];
            stream.read_exact(&mut chunk).await.unwrap();
            response.body.extend_from_slice(&chunk);
            assert!(read_line(stream).await.is_empty());
        }
    }
    response
}

/// Send a CONNECT for `target` and read the proxy's answer.
pub async fn send_connect(stream: &mut TcpStream, target: &str) -> RawResponse {
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let head = read_response(stream, true).await;
    if head.status == 200 {
        // Nothing but tunnel bytes follow a successful CONNECT.
        return head;
    }
    // Error responses carry a normal body.
    let mut response = head;
    if let Some(len) = response.header("content-length") {
        let mut body = vec![0u8; len.parse().unwrap()];
        stream.read_exact(&mut body).await.unwrap();
        response.body = body;
    }
    response
}

/// Open a CONNECT tunnel through `proxy` to `target`.
pub async fn open_tunnel(proxy: SocketAddr, target: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let response = send_connect(&mut stream, &target.to_string()).await;
    assert_eq!(response.status, 200, "CONNECT refused");
    stream
}

pub async fn with_deadline<F: std::future::Future>(secs: u64, f: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(secs), f)
        .await
        .expect("operation timed out")
}
