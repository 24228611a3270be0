//! Throwaway HTTP/1.1 server for transport and credential tests.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// Scripted response for one accepted connection.
pub(crate) enum Reply {
    Full {
        status: u16,
        content_type: &'static str,
        body: String,
    },
    /// Chunked transfer encoding, one HTTP chunk per entry with a short pause between them.
    Chunked { status: u16, chunks: Vec<Vec<u8>> },
    /// Chunked body that drops the connection before the terminating chunk.
    Truncated { chunks: Vec<Vec<u8>> },
}

impl Reply {
    pub(crate) fn json(status: u16, body: &str) -> Self {
        Self::Full {
            status,
            content_type: "application/json",
            body: body.to_string(),
        }
    }

    pub(crate) fn text(status: u16, body: &str) -> Self {
        Self::Full {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.to_string(),
        }
    }

    pub(crate) fn chunked(chunks: &[&str]) -> Self {
        Self::Chunked {
            status: 200,
            chunks: chunks.iter().map(|c| c.as_bytes().to_vec()).collect(),
        }
    }
}

pub(crate) struct ScriptedServer {
    pub url: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl ScriptedServer {
    /// Serves one reply per connection, in order, then stops accepting.
    pub(crate) async fn start(replies: Vec<Reply>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = requests.clone();
        tokio::spawn(async move {
            for reply in replies {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let request = read_request(&mut socket).await;
                recorded.lock().await.push(request);
                write_reply(&mut socket, reply).await;
            }
        });
        Self {
            url: format!("http://{addr}"),
            requests,
        }
    }

    /// Raw requests received so far (request line, headers and body).
    pub(crate) async fn requests(&self) -> Vec<String> {
        self.requests.lock().await.clone()
    }
}

async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0_u8; 1024];
    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return String::from_utf8_lossy(&buf).into_owned(),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
    let content_length = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn write_reply(socket: &mut TcpStream, reply: Reply) {
    match reply {
        Reply::Full {
            status,
            content_type,
            body,
        } => {
            let response = format!(
                "HTTP/1.1 {status} X\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
        }
        Reply::Chunked { status, chunks } => {
            write_chunks(socket, status, &chunks).await;
            let _ = socket.write_all(b"0\r\n\r\n").await;
        }
        Reply::Truncated { chunks } => {
            write_chunks(socket, 200, &chunks).await;
        }
    }
    let _ = socket.flush().await;
    let _ = socket.shutdown().await;
}

async fn write_chunks(socket: &mut TcpStream, status: u16, chunks: &[Vec<u8>]) {
    let head = format!(
        "HTTP/1.1 {status} X\r\ncontent-type: text/plain; charset=utf-8\r\ntransfer-encoding: chunked\r\nconnection: close\r\n\r\n"
    );
    let _ = socket.write_all(head.as_bytes()).await;
    for chunk in chunks {
        let mut frame = format!("{:x}\r\n", chunk.len()).into_bytes();
        frame.extend_from_slice(chunk);
        frame.extend_from_slice(b"\r\n");
        let _ = socket.write_all(&frame).await;
        let _ = socket.flush().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
