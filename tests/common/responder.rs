//! One-shot HTTP responder shared by the client wire tests.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Request captured by the responder.
pub struct Captured {
    /// Request line and headers.
    pub head: String,
    /// Request body.
    pub body: String,
}

/// Serves one canned response and returns the request it received.
pub async fn respond_once(status: &'static str, body: &'static str) -> (String, JoinHandle<Captured>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let endpoint = format!("http://{}", listener.local_addr().expect("addr"));
    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut raw = Vec::new();
        let mut chunk = [0_u8; 1024];
        let (head, request_body) = loop {
            let read = stream.read(&mut chunk).await.expect("read");
            raw.extend_from_slice(&chunk[..read]);
            let text = String::from_utf8_lossy(&raw).into_owned();
            if let Some((request_head, received)) = text.split_once("\r\n\r\n") {
                let expected = request_head
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if received.len() >= expected || read == 0 {
                    break (request_head.to_owned(), received.to_owned());
                }
            }
            if read == 0 {
                break (text, String::new());
            }
        };
        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream
            .write_all(response.as_bytes())
            .await
            .expect("write response");
        stream.shutdown().await.ok();
        Captured {
            head,
            body: request_body,
        }
    });
    (endpoint, handle)
}
