// FastCGI Processor
// One connection per invocation, responder role, no keep-alive

use crate::config::{FastCgiConfig, Network};
use crate::protocol::{self, ProtocolError, RecordType, REQUEST_ID};
use crate::response::CgiResponse;
use amqp_bridge_core::port::{Env, InvocationContext, Processor, ProcessorError, ProcessorOutcome};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error};

const MAX_LOGGED_BODY: usize = 512;

#[derive(Error, Debug)]
pub enum FastCgiError {
    #[error("Cannot connect to FastCGI backend {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("FastCGI I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("FastCGI protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Invalid CGI response: {0}")]
    Response(String),
}

/// Processor forwarding payloads to a FastCGI responder
#[derive(Debug, Clone)]
pub struct FastCgiProcessor {
    config: FastCgiConfig,
}

impl FastCgiProcessor {
    pub fn new(config: FastCgiConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FastCgiConfig {
        &self.config
    }

    /// Request environment: caller env plus the CGI variables the responder needs
    fn request_env(&self, mut env: Env, content_length: usize) -> Env {
        env.entry("REQUEST_METHOD".to_string())
            .or_insert_with(|| "POST".to_string());
        env.entry("REQUEST_URI".to_string())
            .or_insert_with(|| "/".to_string());
        env.insert("CONTENT_LENGTH".to_string(), content_length.to_string());
        env.insert(
            "SCRIPT_FILENAME".to_string(),
            self.config.script_filename.clone(),
        );
        env
    }

    async fn call(&self, env: &Env, payload: &[u8]) -> Result<CgiResponse, FastCgiError> {
        let address = &self.config.address;
        match self.config.network {
            Network::Tcp => {
                let stream = TcpStream::connect(address)
                    .await
                    .map_err(|source| FastCgiError::Connect {
                        address: address.clone(),
                        source,
                    })?;
                stream.set_nodelay(true)?;
                round_trip(stream, env, payload).await
            }
            #[cfg(unix)]
            Network::Unix => {
                let stream = tokio::net::UnixStream::connect(address)
                    .await
                    .map_err(|source| FastCgiError::Connect {
                        address: address.clone(),
                        source,
                    })?;
                round_trip(stream, env, payload).await
            }
            #[cfg(not(unix))]
            Network::Unix => Err(FastCgiError::Connect {
                address: address.clone(),
                source: io::Error::new(
                    io::ErrorKind::Unsupported,
                    "unix sockets are not available on this platform",
                ),
            }),
        }
    }
}

#[async_trait]
impl Processor for FastCgiProcessor {
    async fn process(&self, ctx: &InvocationContext, env: Env, payload: Bytes) -> ProcessorOutcome {
        let env = self.request_env(env, payload.len());

        let result = tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                return Err(ProcessorError::Internal("FastCGI request cancelled".to_string()));
            }
            result = self.call(&env, &payload) => result,
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                error!(queue = %ctx.queue(), address = %self.config.address, error = %e, "FastCGI request failed");
                return Err(ProcessorError::Internal(e.to_string()));
            }
        };

        debug!(
            queue = %ctx.queue(),
            status = response.status,
            content_type = response.content_type().unwrap_or(""),
            body = %truncate(&response.body),
            stderr = %String::from_utf8_lossy(&response.stderr),
            "FastCGI response"
        );

        outcome_for_status(response.status)
    }
}

/// Map a CGI status code to the processor outcome
pub fn outcome_for_status(status: u16) -> ProcessorOutcome {
    match status / 100 {
        0 => Err(ProcessorError::UnknownStatus(format!("status {}", status))),
        2 => Ok(()),
        3 | 4 => Err(ProcessorError::ProcessingError(format!("status {}", status))),
        _ => Err(ProcessorError::ProcessingFailed(format!("status {}", status))),
    }
}

/// Send one request over `stream` and collect the response
pub async fn round_trip<S>(mut stream: S, env: &Env, payload: &[u8]) -> Result<CgiResponse, FastCgiError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let params = protocol::encode_params(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    let mut request = BytesMut::with_capacity(64 + params.len() + payload.len());
    protocol::write_begin_request(&mut request, REQUEST_ID, false);
    protocol::write_stream(&mut request, RecordType::Params, REQUEST_ID, &params);
    protocol::write_stream(&mut request, RecordType::Stdin, REQUEST_ID, payload);
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut stdout = BytesMut::new();
    let mut stderr = BytesMut::new();
    loop {
        let record = protocol::read_record(&mut stream).await?.ok_or_else(|| {
            ProtocolError::Malformed("connection closed before END_REQUEST".to_string())
        })?;
        if record.request_id != REQUEST_ID {
            continue;
        }
        match record.kind {
            RecordType::Stdout => stdout.extend_from_slice(&record.content),
            RecordType::Stderr => stderr.extend_from_slice(&record.content),
            RecordType::EndRequest => break,
            _ => {}
        }
    }

    let mut response = CgiResponse::parse(&stdout).map_err(FastCgiError::Response)?;
    response.stderr = stderr.freeze();
    Ok(response)
}

fn truncate(body: &[u8]) -> String {
    if body.len() <= MAX_LOGGED_BODY {
        return String::from_utf8_lossy(body).into_owned();
    }
    format!(
        "{}... ({} bytes)",
        String::from_utf8_lossy(&body[..MAX_LOGGED_BODY]),
        body.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn env(pairs: &[(&str, &str)]) -> Env {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(outcome_for_status(200), Ok(()));
        assert_eq!(outcome_for_status(204), Ok(()));
        assert!(matches!(outcome_for_status(0), Err(ProcessorError::UnknownStatus(_))));
        assert!(matches!(outcome_for_status(99), Err(ProcessorError::UnknownStatus(_))));
        assert!(matches!(outcome_for_status(302), Err(ProcessorError::ProcessingError(_))));
        assert!(matches!(outcome_for_status(404), Err(ProcessorError::ProcessingError(_))));
        assert!(matches!(outcome_for_status(500), Err(ProcessorError::ProcessingFailed(_))));
        assert!(matches!(outcome_for_status(102), Err(ProcessorError::ProcessingFailed(_))));
    }

    #[test]
    fn test_request_env_defaults() {
        let processor = FastCgiProcessor::new(FastCgiConfig::tcp("127.0.0.1:9000", "/app/worker.php"));

        let built = processor.request_env(env(&[("REQUEST_URI", "/jobs")]), 42);

        assert_eq!(built["REQUEST_METHOD"], "POST");
        assert_eq!(built["REQUEST_URI"], "/jobs");
        assert_eq!(built["CONTENT_LENGTH"], "42");
        assert_eq!(built["SCRIPT_FILENAME"], "/app/worker.php");
    }

    #[test]
    fn test_request_env_overrides_caller_length_and_script() {
        let processor = FastCgiProcessor::new(FastCgiConfig::default());

        let built = processor.request_env(
            env(&[("CONTENT_LENGTH", "999"), ("SCRIPT_FILENAME", "evil.php"), ("REQUEST_METHOD", "PUT")]),
            3,
        );

        assert_eq!(built["CONTENT_LENGTH"], "3");
        assert_eq!(built["SCRIPT_FILENAME"], "index.php");
        assert_eq!(built["REQUEST_METHOD"], "PUT");
    }

    #[tokio::test]
    async fn test_round_trip_over_duplex() {
        let (client, mut server) = duplex(1 << 20);

        let responder = tokio::spawn(async move {
            let mut stdin = BytesMut::new();
            loop {
                let record = protocol::read_record(&mut server).await.unwrap().unwrap();
                if record.kind == RecordType::Stdin {
                    if record.content.is_empty() {
                        break;
                    }
                    stdin.extend_from_slice(&record.content);
                }
            }
            let mut out = BytesMut::new();
            protocol::write_stream(&mut out, RecordType::Stdout, REQUEST_ID, b"Status: 201 Created\r\n\r\ndone");
            protocol::write_stream(&mut out, RecordType::Stderr, REQUEST_ID, b"warning");
            protocol::write_end_request(&mut out, REQUEST_ID, 0, 0);
            server.write_all(&out).await.unwrap();
            stdin.freeze()
        });

        let response = round_trip(client, &env(&[("A", "1")]), b"payload").await.unwrap();

        assert_eq!(response.status, 201);
        assert_eq!(&response.body[..], b"done");
        assert_eq!(&response.stderr[..], b"warning");
        assert_eq!(&responder.await.unwrap()[..], b"payload");
    }

    #[tokio::test]
    async fn test_round_trip_fails_on_early_close() {
        let (client, server) = duplex(1 << 20);
        drop(server);

        let result = round_trip(client, &Env::new(), b"x").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_context_is_internal() {
        let processor = FastCgiProcessor::new(FastCgiConfig::default());
        let ctx = InvocationContext::new("jobs", std::time::Duration::from_secs(5));
        ctx.cancel();

        let outcome = processor.process(&ctx, Env::new(), Bytes::new()).await;
        assert!(matches!(outcome, Err(ProcessorError::Internal(_))));
    }

    #[test]
    fn test_truncate_long_body() {
        let body = vec![b'a'; 600];
        let logged = truncate(&body);
        assert!(logged.starts_with(&"a".repeat(512)));
        assert!(logged.ends_with("(600 bytes)"));
        assert_eq!(truncate(b"short"), "short");
    }
}
