//! Shared test helpers: a scripted mock HTTP server capturing requests.
#![allow(dead_code)]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use flate2::read::GzDecoder;
use rstest::fixture;
use serde_json::Value;

/// One scripted response the mock server plays back.
#[derive(Clone)]
pub struct MockResponse {
    pub status: u16,
    pub body: String,
}

impl MockResponse {
    pub fn ok() -> Self {
        Self {
            status: 200,
            body: r#"{"status": 1}"#.to_owned(),
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: String::new(),
        }
    }

    pub fn json(body: Value) -> Self {
        Self {
            status: 200,
            body: body.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Request body as text, transparently gunzipped when compressed.
    pub fn text(&self) -> String {
        if self.header("content-encoding") == Some("gzip") {
            let mut decoder = GzDecoder::new(self.body.as_slice());
            let mut text = String::new();
            decoder.read_to_string(&mut text).expect("valid gzip body");
            text
        } else {
            String::from_utf8_lossy(&self.body).to_string()
        }
    }

    pub fn json(&self) -> Value {
        serde_json::from_str(&self.text()).expect("json body")
    }

    /// Records of a `/batch/` envelope.
    pub fn batch(&self) -> Vec<Value> {
        self.json()["batch"]
            .as_array()
            .expect("batch array")
            .clone()
    }
}

#[fixture]
pub fn tcp_listener() -> TcpListener {
    TcpListener::bind(("127.0.0.1", 0)).expect("bind ephemeral listener")
}

/// Spawn a mock server that answers with the scripted responses in order,
/// capturing each request. The server stops once the script is exhausted.
pub fn spawn_scripted_server(
    listener: TcpListener,
    responses: Vec<MockResponse>,
) -> (SocketAddr, mpsc::Receiver<CapturedRequest>) {
    let addr = listener.local_addr().expect("listener has address");
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        for response in responses {
            let Ok((mut stream, _)) = listener.accept() else {
                break;
            };
            let captured = read_http_request(&mut stream);
            let _ = stream.write_all(http_reply(&response).as_bytes());
            let _ = tx.send(captured);
        }
    });

    (addr, rx)
}

/// Spawn a mock server that answers every request whose path starts with a
/// route's prefix, in route order, until the test drops the receiver. Useful
/// when background uploads interleave unpredictably with foreground calls.
pub fn spawn_router_server(
    listener: TcpListener,
    routes: Vec<(&str, MockResponse)>,
) -> (SocketAddr, mpsc::Receiver<CapturedRequest>) {
    let addr = listener.local_addr().expect("listener has address");
    let (tx, rx) = mpsc::channel();
    let routes: Vec<(String, MockResponse)> = routes
        .into_iter()
        .map(|(prefix, response)| (prefix.to_owned(), response))
        .collect();

    thread::spawn(move || {
        loop {
            let Ok((mut stream, _)) = listener.accept() else {
                break;
            };
            let captured = read_http_request(&mut stream);
            let response = routes
                .iter()
                .find(|(prefix, _)| captured.path.starts_with(prefix.as_str()))
                .map(|(_, response)| response.clone())
                .unwrap_or_else(|| MockResponse::status(404));
            let _ = stream.write_all(http_reply(&response).as_bytes());
            if tx.send(captured).is_err() {
                break;
            }
        }
    });

    (addr, rx)
}

fn http_reply(response: &MockResponse) -> String {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        response.status,
        status_text(response.status),
        response.body.len(),
        response.body,
    )
}

fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn read_http_request(stream: &mut TcpStream) -> CapturedRequest {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));

    let mut request_line = String::new();
    reader
        .read_line(&mut request_line)
        .expect("read request line");
    let mut parts = request_line.trim().split(' ');
    let method = parts.next().unwrap_or("").to_owned();
    let path = parts.next().unwrap_or("").to_owned();

    let (headers, content_length) = read_headers(&mut reader);
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body).expect("read body");
    }

    CapturedRequest {
        method,
        path,
        headers,
        body,
    }
}

fn read_headers(reader: &mut BufReader<TcpStream>) -> (Vec<(String, String)>, usize) {
    let mut headers = Vec::new();
    let mut content_length = 0usize;

    loop {
        let mut line = String::new();
        reader.read_line(&mut line).expect("read header");
        if line.trim().is_empty() {
            break;
        }
        let Some((key, value)) = line.trim().split_once(':') else {
            continue;
        };
        let key = key.trim().to_lowercase();
        let value = value.trim().to_owned();
        if key == "content-length" {
            content_length = value.parse().unwrap_or(0);
        }
        headers.push((key, value));
    }

    (headers, content_length)
}
