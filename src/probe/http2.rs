//! HTTP/2 attempts over a pre-timed connection.
//!
//! The probe still dials and times DNS/TCP/TLS itself (ALPN `h2`), then
//! hands the stream to hyper's connection-level client. The request-written
//! stamp is taken at request hand-off: the multiplexed framing layer does
//! not expose flush completion.

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http2::SendRequest;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::time::Instant;
use url::Url;

use super::connect;
use super::http1::origin_form;
use super::{conn_key, ClientOptions, HopOutcome, PhaseTrace, ProbeError};

/// A live HTTP/2 connection; requests multiplex over it until it dies.
pub(crate) struct H2Session {
    sender: SendRequest<Full<Bytes>>,
    key: String,
}

pub(crate) async fn exchange(
    slot: &mut Option<H2Session>,
    options: &ClientOptions,
    method: &Method,
    url: &Url,
    headers: &HeaderMap,
    host: Option<&str>,
    body: &Bytes,
    trace: &mut PhaseTrace,
) -> Result<HopOutcome, ProbeError> {
    let key = conn_key(url, options);
    let hop_start = Instant::now();

    let (mut session, baseline) = match slot.take() {
        Some(existing)
            if existing.key == key
                && !options.disable_keepalive
                && !existing.sender.is_closed() =>
        {
            (existing, hop_start)
        }
        stale => {
            drop(stale);
            let dialed = connect::dial(url, options, true).await?;
            trace.dns = dialed.dns;
            trace.conn = dialed.connect;
            let (sender, connection) =
                hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(dialed.stream))
                    .await
                    .map_err(|e| ProbeError::Http2(e.to_string()))?;
            tokio::spawn(async move {
                let _ = connection.await;
            });
            (H2Session { sender, key }, dialed.tcp_done)
        }
    };

    let uri = request_uri(url, host)?;
    let mut builder = Request::builder().method(method.clone()).uri(uri);
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    let request = builder
        .body(Full::new(body.clone()))
        .map_err(|_| ProbeError::Http2("invalid request".to_string()))?;

    let response_future = session.sender.send_request(request);
    let written = Instant::now();
    trace.req = written - baseline;

    let response = response_future
        .await
        .map_err(|e| ProbeError::Http2(e.to_string()))?;
    let first_byte = Instant::now();
    trace.delay = first_byte - written;

    let status = response.status().as_u16();
    let location = response
        .headers()
        .get(http::header::LOCATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let mut body_stream = response.into_body();
    let mut body_bytes: i64 = 0;
    while let Some(frame) = body_stream.frame().await {
        let frame = frame.map_err(|e| ProbeError::Http2(e.to_string()))?;
        if let Some(data) = frame.data_ref() {
            body_bytes += data.len() as i64;
        }
    }
    trace.res = first_byte.elapsed();

    if !options.disable_keepalive {
        *slot = Some(session);
    }

    Ok(HopOutcome { status, body_bytes, location })
}

/// The URI carries the `:scheme`/`:authority` pseudo headers, so a Host
/// override is applied there rather than as a header field.
fn request_uri(url: &Url, host: Option<&str>) -> Result<Uri, ProbeError> {
    let text = match host {
        Some(authority) => format!("{}://{}{}", url.scheme(), authority, origin_form(url)),
        None => url.as_str().to_string(),
    };
    text.parse()
        .map_err(|_| ProbeError::UnsupportedUrl(url.to_string()))
}
