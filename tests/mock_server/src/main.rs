//! Mock backend for llamactl-core's integration tests.
//!
//! Stands in for llama-server/mlx_lm.server/vllm: reads `--port` off its own
//! argv (the way `assemble_command_line` always injects it), answers every
//! request with 200 OK, and echoes the request line in the body so proxy
//! tests can confirm what reached the backend.
//!
//! Environment variables:
//! - STARTUP_DELAY_MS: sleep before binding (default 0), to exercise the
//!   readiness-timeout path.
//! - FAIL_IMMEDIATELY: if set, exit(1) right away, to exercise auto-restart.

use std::env;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    if env::var("FAIL_IMMEDIATELY").is_ok() {
        eprintln!("mock-backend: FAIL_IMMEDIATELY set, exiting");
        std::process::exit(1);
    }

    let port = port_from_args().expect("--port argument required");

    let startup_delay: u64 = env::var("STARTUP_DELAY_MS")
        .unwrap_or_else(|_| "0".to_string())
        .parse()
        .unwrap_or(0);
    if startup_delay > 0 {
        eprintln!("mock-backend: sleeping {startup_delay}ms before listening");
        tokio::time::sleep(Duration::from_millis(startup_delay)).await;
    }

    let listener = TcpListener::bind(format!("127.0.0.1:{port}"))
        .await
        .expect("failed to bind mock backend port");
    eprintln!("mock-backend: listening on {port}");

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(handle_connection(stream));
            }
            Err(e) => eprintln!("mock-backend: accept error: {e}"),
        }
    }
}

fn port_from_args() -> Option<u16> {
    let args: Vec<String> = env::args().collect();
    args.iter()
        .position(|a| a == "--port")
        .and_then(|i| args.get(i + 1))
        .and_then(|v| v.parse().ok())
}

async fn handle_connection(mut stream: tokio::net::TcpStream) {
    let mut buf = Vec::new();
    let mut temp = [0u8; 1024];
    loop {
        let n = match stream.read(&mut temp).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&temp[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > 8192 {
            return;
        }
    }

    let request_str = String::from_utf8_lossy(&buf);
    let request_line = request_str.lines().next().unwrap_or("GET /").to_string();

    let body = format!("{{\"echo\":\"{}\"}}", request_line.replace('"', "'"));
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}
