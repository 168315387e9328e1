//! The HTTP timing probe: issues one instrumented attempt per call.
//!
//! Each attempt replays an immutable request template through the worker's
//! persistent connection, recording wall-clock stamps at every transport
//! phase boundary: DNS resolution, TCP connect, request written (TLS setup
//! included), first response byte, body drained.

mod connect;
mod http1;
mod http2;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method};
use thiserror::Error;
use tokio::time::{timeout, Instant};
use url::Url;

use crate::report::AttemptRecord;
use crate::runner::AttemptDriver;

const MAX_REDIRECTS: usize = 10;

/// Immutable description of the request each attempt replays.
///
/// Default headers (Content-Type, User-Agent tag, Accept-Encoding, basic
/// auth) are folded into `headers` when the template is built; the template
/// itself is never mutated by an attempt.
#[derive(Clone, Debug)]
pub struct RequestTemplate {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Host header override.
    pub host: Option<String>,
}

/// Transport-level knobs shared by every attempt.
#[derive(Clone, Debug, Default)]
pub struct ClientOptions {
    /// End-to-end budget per attempt; `None` is unlimited.
    pub timeout: Option<Duration>,
    pub disable_compression: bool,
    pub disable_keepalive: bool,
    pub disable_redirects: bool,
    pub http2: bool,
    pub proxy: Option<Url>,
}

/// Classified transport failures; the display string keys the error
/// distribution, so variants render the same way for the same failure.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("dns lookup failed: {0}")]
    Dns(std::io::Error),
    #[error("no address found for {0}")]
    NoAddress(String),
    #[error("connect failed: {0}")]
    Connect(std::io::Error),
    #[error("tls handshake failed: {0}")]
    Tls(String),
    #[error("proxy refused tunnel: status {0}")]
    ProxyTunnel(u16),
    #[error("request timeout")]
    Timeout,
    #[error("malformed response: {0}")]
    MalformedResponse(&'static str),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http2 error: {0}")]
    Http2(String),
    #[error("too many redirects")]
    TooManyRedirects,
    #[error("unsupported url: {0}")]
    UnsupportedUrl(String),
}

/// Wall-clock phase durations for one attempt. Redirect hops overwrite the
/// stamps, so the recorded phases describe the final hop.
#[derive(Debug, Default)]
pub(crate) struct PhaseTrace {
    pub dns: Duration,
    pub conn: Duration,
    pub req: Duration,
    pub delay: Duration,
    pub res: Duration,
}

/// What one request/response exchange produced.
pub(crate) struct HopOutcome {
    pub status: u16,
    pub body_bytes: i64,
    pub location: Option<String>,
}

/// Per-worker connection state; reused across attempts while keep-alive
/// allows it.
#[derive(Default)]
pub struct WorkerConnection {
    h1: Option<http1::H1Conn>,
    h2: Option<http2::H2Session>,
}

struct AttemptOutcome {
    duration: Duration,
    trace: PhaseTrace,
    status: u16,
    content_length: i64,
}

/// The production driver: replays the template over HTTP/1.1 or HTTP/2.
#[derive(Clone)]
pub struct HttpDriver {
    template: Arc<RequestTemplate>,
    options: Arc<ClientOptions>,
}

impl HttpDriver {
    pub fn new(template: RequestTemplate, options: ClientOptions) -> Self {
        Self { template: Arc::new(template), options: Arc::new(options) }
    }

    async fn execute(&self, conn: &mut WorkerConnection) -> Result<AttemptOutcome, ProbeError> {
        let started = Instant::now();
        let mut trace = PhaseTrace::default();
        let mut method = self.template.method.clone();
        let mut url = self.template.url.clone();
        let mut body = self.template.body.clone();

        let mut hops = 0;
        let (status, content_length) = loop {
            let hop = self.exchange(conn, &method, &url, &body, &mut trace).await?;
            if !is_redirect(hop.status) || self.options.disable_redirects {
                break (hop.status, hop.body_bytes);
            }
            hops += 1;
            if hops > MAX_REDIRECTS {
                return Err(ProbeError::TooManyRedirects);
            }
            let location = hop
                .location
                .ok_or(ProbeError::MalformedResponse("redirect without location"))?;
            url = url
                .join(&location)
                .map_err(|_| ProbeError::MalformedResponse("invalid redirect location"))?;
            if matches!(hop.status, 301 | 302 | 303) {
                method = Method::GET;
                body = Bytes::new();
            }
        };

        Ok(AttemptOutcome { duration: started.elapsed(), trace, status, content_length })
    }

    async fn exchange(
        &self,
        conn: &mut WorkerConnection,
        method: &Method,
        url: &Url,
        body: &Bytes,
        trace: &mut PhaseTrace,
    ) -> Result<HopOutcome, ProbeError> {
        let host = self.template.host.as_deref();
        if self.options.http2 {
            http2::exchange(&mut conn.h2, &self.options, method, url, &self.template.headers, host, body, trace)
                .await
        } else {
            http1::exchange(&mut conn.h1, &self.options, method, url, &self.template.headers, host, body, trace)
                .await
        }
    }
}

#[async_trait]
impl AttemptDriver for HttpDriver {
    type WorkerState = WorkerConnection;

    async fn setup(&self) -> Result<WorkerConnection> {
        Ok(WorkerConnection::default())
    }

    async fn attempt(&self, state: &mut WorkerConnection, offset: Duration) -> AttemptRecord {
        let outcome = match self.options.timeout {
            Some(limit) => match timeout(limit, self.execute(state)).await {
                Ok(result) => result,
                Err(_) => Err(ProbeError::Timeout),
            },
            None => self.execute(state).await,
        };

        match outcome {
            Ok(outcome) => AttemptRecord {
                duration: outcome.duration,
                conn_duration: outcome.trace.conn,
                dns_duration: outcome.trace.dns,
                req_duration: outcome.trace.req,
                delay_duration: outcome.trace.delay,
                res_duration: outcome.trace.res,
                status_code: outcome.status,
                content_length: outcome.content_length,
                offset,
                error: None,
            },
            Err(err) => {
                // The connection may be mid-exchange; never reuse it.
                state.h1 = None;
                state.h2 = None;
                AttemptRecord::failed(offset, err)
            }
        }
    }
}

fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

/// Keep-alive identity of a connection: scheme, authority and proxy.
pub(crate) fn conn_key(url: &Url, options: &ClientOptions) -> String {
    format!(
        "{}://{}:{}|{}",
        url.scheme(),
        url.host_str().unwrap_or_default(),
        url.port_or_known_default().unwrap_or(80),
        options.proxy.as_ref().map(Url::as_str).unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal loopback origin: answers every request on a connection with
    /// the same canned bytes.
    async fn spawn_origin(response: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {
                                if socket.write_all(response).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    fn driver_for(addr: SocketAddr, options: ClientOptions) -> HttpDriver {
        let template = RequestTemplate {
            method: Method::GET,
            url: format!("http://{addr}/").parse().unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            host: None,
        };
        HttpDriver::new(template, options)
    }

    #[tokio::test]
    async fn success_records_status_body_and_phases() {
        let addr = spawn_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello").await;
        let driver = driver_for(addr, ClientOptions::default());
        let mut conn = WorkerConnection::default();

        let record = driver.attempt(&mut conn, Duration::from_millis(1)).await;
        assert_eq!(record.error, None);
        assert_eq!(record.status_code, 200);
        assert_eq!(record.content_length, 5);
        assert_eq!(record.offset, Duration::from_millis(1));
        // IP literal target: no DNS lookup.
        assert_eq!(record.dns_duration, Duration::ZERO);
        assert!(record.conn_duration > Duration::ZERO);
        assert!(record.duration >= record.delay_duration + record.res_duration);
    }

    #[tokio::test]
    async fn keepalive_reuses_the_connection() {
        let addr = spawn_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;
        let driver = driver_for(addr, ClientOptions::default());
        let mut conn = WorkerConnection::default();

        let first = driver.attempt(&mut conn, Duration::ZERO).await;
        let second = driver.attempt(&mut conn, Duration::ZERO).await;
        assert_eq!(first.error, None);
        assert_eq!(second.error, None);
        assert!(first.conn_duration > Duration::ZERO);
        assert_eq!(second.conn_duration, Duration::ZERO);
    }

    #[tokio::test]
    async fn disabled_keepalive_reconnects_every_attempt() {
        let addr = spawn_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;
        let options = ClientOptions { disable_keepalive: true, ..ClientOptions::default() };
        let driver = driver_for(addr, options);
        let mut conn = WorkerConnection::default();

        let first = driver.attempt(&mut conn, Duration::ZERO).await;
        let second = driver.attempt(&mut conn, Duration::ZERO).await;
        assert_eq!(second.error, None);
        assert!(first.conn_duration > Duration::ZERO);
        assert!(second.conn_duration > Duration::ZERO);
    }

    #[tokio::test]
    async fn chunked_bodies_are_counted_dechunked() {
        let addr = spawn_origin(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
        )
        .await;
        let driver = driver_for(addr, ClientOptions::default());
        let mut conn = WorkerConnection::default();

        let record = driver.attempt(&mut conn, Duration::ZERO).await;
        assert_eq!(record.error, None);
        assert_eq!(record.content_length, 9);
    }

    #[tokio::test]
    async fn connection_refused_is_a_classified_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let driver = driver_for(addr, ClientOptions::default());
        let mut conn = WorkerConnection::default();
        let record = driver.attempt(&mut conn, Duration::from_millis(3)).await;

        let error = record.error.expect("refused connection must error");
        assert!(error.starts_with("connect failed:"), "unexpected error: {error}");
        assert_eq!(record.status_code, 0);
        assert_eq!(record.duration, Duration::ZERO);
        assert_eq!(record.offset, Duration::from_millis(3));
    }

    #[tokio::test]
    async fn timeout_is_reported_as_an_error() {
        // Accepts connections but never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let options = ClientOptions {
            timeout: Some(Duration::from_millis(100)),
            ..ClientOptions::default()
        };
        let driver = driver_for(addr, options);
        let mut conn = WorkerConnection::default();
        let record = driver.attempt(&mut conn, Duration::ZERO).await;
        assert_eq!(record.error.as_deref(), Some("request timeout"));
    }

    #[tokio::test]
    async fn redirects_are_followed_to_the_final_status() {
        let target = spawn_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\ndone").await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let redirect = format!(
                    "HTTP/1.1 302 Found\r\nLocation: http://{target}/\r\nContent-Length: 0\r\n\r\n"
                );
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    if socket.read(&mut buf).await.is_ok() {
                        let _ = socket.write_all(redirect.as_bytes()).await;
                    }
                });
            }
        });

        let driver = driver_for(addr, ClientOptions::default());
        let mut conn = WorkerConnection::default();
        let record = driver.attempt(&mut conn, Duration::ZERO).await;
        assert_eq!(record.error, None);
        assert_eq!(record.status_code, 200);
        assert_eq!(record.content_length, 4);

        let options = ClientOptions { disable_redirects: true, ..ClientOptions::default() };
        let driver = driver_for(addr, options);
        let mut conn = WorkerConnection::default();
        let record = driver.attempt(&mut conn, Duration::ZERO).await;
        assert_eq!(record.status_code, 302);
    }

    #[tokio::test]
    async fn head_responses_have_no_body() {
        let addr = spawn_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n").await;
        let template = RequestTemplate {
            method: Method::HEAD,
            url: format!("http://{addr}/").parse().unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            host: None,
        };
        let driver = HttpDriver::new(template, ClientOptions::default());
        let mut conn = WorkerConnection::default();
        let record = driver.attempt(&mut conn, Duration::ZERO).await;
        assert_eq!(record.error, None);
        assert_eq!(record.status_code, 200);
        assert_eq!(record.content_length, 0);
    }
}
