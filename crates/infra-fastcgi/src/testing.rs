// In-process FastCGI responder for tests

use crate::protocol::{self, RecordType};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// A request as the fake responder saw it
#[derive(Debug, Clone, Default)]
pub struct FakeRequest {
    pub params: HashMap<String, String>,
    pub stdin: Bytes,
}

/// What the fake responder answers
#[derive(Debug, Clone)]
pub struct FakeResponse {
    pub stdout: Bytes,
    pub stderr: Bytes,
    pub delay: Duration,
}

impl FakeResponse {
    /// CGI output with the given `Status:` header
    pub fn status(code: u16) -> Self {
        Self::raw(format!(
            "Status: {}\r\nContent-Type: text/plain\r\n\r\nstatus {}",
            code, code
        ))
    }

    pub fn raw(stdout: impl Into<Bytes>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: Bytes::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_stderr(mut self, stderr: impl Into<Bytes>) -> Self {
        self.stderr = stderr.into();
        self
    }

    /// Wait before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type Responder = Arc<dyn Fn(&FakeRequest) -> FakeResponse + Send + Sync>;
type Requests = Arc<Mutex<Vec<FakeRequest>>>;

/// FastCGI responder on an ephemeral TCP port (or a unix socket)
pub struct FakeFastCgiServer {
    address: String,
    requests: Requests,
    task: JoinHandle<()>,
}

impl FakeFastCgiServer {
    /// Listen on 127.0.0.1 with a random port
    pub async fn start<F>(responder: F) -> io::Result<Self>
    where
        F: Fn(&FakeRequest) -> FakeResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr: SocketAddr = listener.local_addr()?;
        let requests: Requests = Arc::default();
        let responder: Responder = Arc::new(responder);

        let task = {
            let requests = Arc::clone(&requests);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve(stream, Arc::clone(&responder), Arc::clone(&requests)));
                }
            })
        };

        Ok(Self {
            address: addr.to_string(),
            requests,
            task,
        })
    }

    /// Listen on a unix socket at `path` (removed first if present)
    #[cfg(unix)]
    pub async fn start_unix<F>(path: impl AsRef<std::path::Path>, responder: F) -> io::Result<Self>
    where
        F: Fn(&FakeRequest) -> FakeResponse + Send + Sync + 'static,
    {
        let path = path.as_ref();
        let _ = std::fs::remove_file(path);
        let listener = tokio::net::UnixListener::bind(path)?;
        let requests: Requests = Arc::default();
        let responder: Responder = Arc::new(responder);

        let task = {
            let requests = Arc::clone(&requests);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve(stream, Arc::clone(&responder), Arc::clone(&requests)));
                }
            })
        };

        Ok(Self {
            address: path.to_string_lossy().into_owned(),
            requests,
            task,
        })
    }

    /// host:port (or socket path) to put in a FastCgiConfig
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn requests(&self) -> Vec<FakeRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for FakeFastCgiServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve<S>(mut stream: S, responder: Responder, requests: Requests)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut params = BytesMut::new();
    let mut stdin = BytesMut::new();
    loop {
        match protocol::read_record(&mut stream).await {
            Ok(Some(record)) => match record.kind {
                RecordType::Params => params.extend_from_slice(&record.content),
                RecordType::Stdin if record.content.is_empty() => break,
                RecordType::Stdin => stdin.extend_from_slice(&record.content),
                _ => {}
            },
            _ => return,
        }
    }

    let Ok(pairs) = protocol::decode_params(&params) else {
        return;
    };
    let request = FakeRequest {
        params: pairs.into_iter().collect(),
        stdin: stdin.freeze(),
    };
    let response = responder(&request);
    requests
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(request);

    if !response.delay.is_zero() {
        tokio::time::sleep(response.delay).await;
    }

    let mut out = BytesMut::new();
    protocol::write_stream(&mut out, RecordType::Stdout, protocol::REQUEST_ID, &response.stdout);
    if !response.stderr.is_empty() {
        protocol::write_stream(&mut out, RecordType::Stderr, protocol::REQUEST_ID, &response.stderr);
    }
    protocol::write_end_request(&mut out, protocol::REQUEST_ID, 0, 0);
    let _ = stream.write_all(&out).await;
    let _ = stream.shutdown().await;
}
