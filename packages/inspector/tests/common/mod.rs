use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use inspector::config::{CaptureSettings, ServerSettings};
use inspector::{CaptureServer, RequestIdGenerator, RequestStore};

pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

// Choose a free port by binding then dropping
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

pub fn server_settings() -> ServerSettings {
    ServerSettings {
        workers: 2,
        shutdown_grace_secs: 1,
        ..ServerSettings::default()
    }
}

/// Start a capture server on a free port feeding `store`
pub fn start_server(store: &Arc<RequestStore>, capture: CaptureSettings) -> (CaptureServer, u16) {
    let server = CaptureServer::new(
        server_settings(),
        capture,
        Arc::new(RequestIdGenerator::new()),
    );
    let port = server
        .start(free_port(), store.clone())
        .expect("capture server starts");
    (server, port)
}

/// Write raw bytes and read until the server closes the connection
pub async fn send_raw(port: u16, request: &[u8]) -> anyhow::Result<String> {
    let exchange = async {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
        stream.write_all(request).await?;
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        anyhow::Ok(String::from_utf8_lossy(&response).into_owned())
    };

    timeout(IO_TIMEOUT, exchange)
        .await
        .map_err(|_| anyhow::anyhow!("timeout talking to capture server"))?
}

/// Build a `Connection: close` request with the given extra header lines and body
pub fn http_request(method: &str, target: &str, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut head = format!("{method} {target} HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n");
    for (name, value) in headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));

    let mut request = head.into_bytes();
    request.extend_from_slice(body);
    request
}

pub fn status_line(response: &str) -> &str {
    response.lines().next().unwrap_or_default()
}
