//! Throwaway HTTP server that replays scripted responses.
//!
//! Requests are answered in arrival order from a queue of [`Reply`] values;
//! once the queue is empty every request gets a 500. Each request body is
//! recorded so tests can assert on what the client actually sent.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use memchr::memmem;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub enum Reply {
    /// NDJSON body sent with chunked transfer encoding, one HTTP chunk per
    /// entry, pausing `delay` between chunks.
    Chunks { chunks: Vec<String>, delay: Duration },
    /// NDJSON body whose first chunks are sent and then repeats `tail`
    /// forever, `delay` apart, until the client hangs up.
    Endless {
        head: Vec<String>,
        tail: String,
        delay: Duration,
    },
    /// Plain response with a fixed status and body.
    Status { status: u16, body: String },
}

impl Reply {
    /// One line per chunk, each terminated by `\n`.
    pub fn ndjson(lines: &[Value]) -> Self {
        Reply::Chunks {
            chunks: lines.iter().map(|line| format!("{line}\n")).collect(),
            delay: Duration::ZERO,
        }
    }

    pub fn json(value: Value) -> Self {
        Reply::Status {
            status: 200,
            body: value.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub body: Value,
}

pub struct ScriptedServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    chunks_sent: Arc<Mutex<usize>>,
    task: JoinHandle<()>,
}

impl ScriptedServer {
    pub async fn start(replies: Vec<Reply>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test server");
        let addr = listener.local_addr().expect("local addr");
        let replies = Arc::new(Mutex::new(VecDeque::from(replies)));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let chunks_sent = Arc::new(Mutex::new(0));

        let task = {
            let requests = requests.clone();
            let chunks_sent = chunks_sent.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let replies = replies.clone();
                    let requests = requests.clone();
                    let chunks_sent = chunks_sent.clone();
                    tokio::spawn(async move {
                        serve(stream, replies, requests, chunks_sent).await;
                    });
                }
            })
        };

        Self {
            addr,
            requests,
            chunks_sent,
            task,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Bodies of every request sent to `path`, in arrival order.
    pub fn bodies_for(&self, path: &str) -> Vec<Value> {
        self.requests
            .lock()
            .iter()
            .filter(|request| request.path == path)
            .map(|request| request.body.clone())
            .collect()
    }

    /// Body chunks written so far across all streaming replies.
    pub fn chunks_sent(&self) -> usize {
        *self.chunks_sent.lock()
    }
}

impl Drop for ScriptedServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    mut stream: TcpStream,
    replies: Arc<Mutex<VecDeque<Reply>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    chunks_sent: Arc<Mutex<usize>>,
) {
    let Some(request) = read_request(&mut stream).await else {
        return;
    };
    requests.lock().push(request);

    let reply = replies.lock().pop_front().unwrap_or(Reply::Status {
        status: 500,
        body: "no scripted reply left".to_string(),
    });

    match reply {
        Reply::Status { status, body } => {
            let head = format!(
                "HTTP/1.1 {status} Scripted\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(head.as_bytes()).await;
            let _ = stream.write_all(body.as_bytes()).await;
        }
        Reply::Chunks { chunks, delay } => {
            if write_stream_head(&mut stream).await.is_err() {
                return;
            }
            for chunk in chunks {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if write_chunk(&mut stream, &chunk, &chunks_sent).await.is_err() {
                    return;
                }
            }
            let _ = stream.write_all(b"0\r\n\r\n").await;
        }
        Reply::Endless { head, tail, delay } => {
            if write_stream_head(&mut stream).await.is_err() {
                return;
            }
            for chunk in head {
                if write_chunk(&mut stream, &chunk, &chunks_sent).await.is_err() {
                    return;
                }
            }
            loop {
                tokio::time::sleep(delay).await;
                if write_chunk(&mut stream, &tail, &chunks_sent).await.is_err() {
                    return;
                }
            }
        }
    }
    let _ = stream.shutdown().await;
}

async fn write_stream_head(stream: &mut TcpStream) -> std::io::Result<()> {
    stream
        .write_all(
            b"HTTP/1.1 200 OK\r\nContent-Type: application/x-ndjson\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
        )
        .await
}

async fn write_chunk(
    stream: &mut TcpStream,
    chunk: &str,
    chunks_sent: &Mutex<usize>,
) -> std::io::Result<()> {
    let framed = format!("{:x}\r\n{chunk}\r\n", chunk.len());
    stream.write_all(framed.as_bytes()).await?;
    stream.flush().await?;
    *chunks_sent.lock() += 1;
    Ok(())
}

async fn read_request(stream: &mut TcpStream) -> Option<RecordedRequest> {
    let mut buffer = Vec::new();
    let mut scratch = [0u8; 4096];

    let header_end = loop {
        if let Some(index) = memmem::find(&buffer, b"\r\n\r\n") {
            break index + 4;
        }
        let read = stream.read(&mut scratch).await.ok()?;
        if read == 0 {
            return None;
        }
        buffer.extend_from_slice(&scratch[..read]);
    };

    let head = String::from_utf8_lossy(&buffer[..header_end]).into_owned();
    let mut lines = head.lines();
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buffer.len() < header_end + content_length {
        let read = stream.read(&mut scratch).await.ok()?;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&scratch[..read]);
    }

    let end = buffer.len().min(header_end + content_length);
    let body = serde_json::from_slice(&buffer[header_end..end]).unwrap_or(Value::Null);
    Some(RecordedRequest { method, path, body })
}
