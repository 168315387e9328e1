//! Hand-driven HTTP/1.1 exchange over the timed connection.
//!
//! Writing the request bytes and parsing the response off the socket is what
//! makes the request-written and first-byte stamps exact; a pooled client
//! would hide both.

use bytes::{Buf, BytesMut};
use http::{HeaderMap, Method};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use url::Url;

use super::connect::{self, MaybeTls};
use super::{conn_key, ClientOptions, HopOutcome, PhaseTrace, ProbeError};

const MAX_HEAD_BYTES: usize = 64 * 1024;

/// A keep-alive connection, keyed by origin and proxy.
pub(crate) struct H1Conn {
    stream: MaybeTls,
    key: String,
}

pub(crate) async fn exchange(
    slot: &mut Option<H1Conn>,
    options: &ClientOptions,
    method: &Method,
    url: &Url,
    headers: &HeaderMap,
    host: Option<&str>,
    body: &[u8],
    trace: &mut PhaseTrace,
) -> Result<HopOutcome, ProbeError> {
    let key = conn_key(url, options);
    let hop_start = Instant::now();

    // Reused connections skip DNS and connect entirely; the request phase is
    // then measured from the hop start.
    let (mut conn, baseline) = match slot.take() {
        Some(existing) if existing.key == key && !options.disable_keepalive => (existing, hop_start),
        stale => {
            drop(stale);
            let dialed = connect::dial(url, options, false).await?;
            trace.dns = dialed.dns;
            trace.conn = dialed.connect;
            (H1Conn { stream: dialed.stream, key }, dialed.tcp_done)
        }
    };

    let head = serialize_head(method, url, headers, host, body.len(), options);
    conn.stream.write_all(&head).await?;
    if !body.is_empty() {
        conn.stream.write_all(body).await?;
    }
    conn.stream.flush().await?;
    let written = Instant::now();
    trace.req = written - baseline;

    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut first_byte: Option<Instant> = None;
    let head_end = loop {
        if let Some(end) = find_head_end(&buf) {
            break end;
        }
        let n = conn.stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(ProbeError::MalformedResponse("connection closed before response head"));
        }
        first_byte.get_or_insert_with(Instant::now);
        if buf.len() > MAX_HEAD_BYTES {
            return Err(ProbeError::MalformedResponse("response head too large"));
        }
    };
    let first_byte = first_byte.unwrap_or(written);
    trace.delay = first_byte - written;

    let parsed = parse_head(&buf[..head_end])?;
    buf.advance(head_end + 4);

    let no_body = *method == Method::HEAD || matches!(parsed.status, 100..=199 | 204 | 304);
    let mut reusable = !options.disable_keepalive && !parsed.connection_close && !parsed.http10;
    let body_bytes: i64 = if no_body {
        0
    } else if parsed.chunked {
        read_chunked(&mut conn.stream, &mut buf).await? as i64
    } else if let Some(length) = parsed.content_length {
        skip_exact(&mut conn.stream, &mut buf, length).await?;
        length as i64
    } else {
        // Close-delimited body: the connection dies with it.
        reusable = false;
        read_to_eof(&mut conn.stream, &mut buf).await? as i64
    };
    let done = Instant::now();
    trace.res = done - first_byte;

    if reusable && buf.is_empty() {
        *slot = Some(conn);
    }

    Ok(HopOutcome { status: parsed.status, body_bytes, location: parsed.location })
}

pub(crate) fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Origin-form request target (path plus query).
pub(crate) fn origin_form(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

fn request_target(url: &Url, options: &ClientOptions) -> String {
    // Plaintext requests through a proxy use the absolute form.
    if options.proxy.is_some() && url.scheme() == "http" {
        url.to_string()
    } else {
        origin_form(url)
    }
}

fn host_value(url: &Url, host: Option<&str>) -> String {
    if let Some(host) = host {
        return host.to_string();
    }
    let name = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{name}:{port}"),
        None => name.to_string(),
    }
}

fn serialize_head(
    method: &Method,
    url: &Url,
    headers: &HeaderMap,
    host: Option<&str>,
    body_len: usize,
    options: &ClientOptions,
) -> Vec<u8> {
    let mut head = String::with_capacity(256);
    head.push_str(&format!("{} {} HTTP/1.1\r\n", method, request_target(url, options)));
    head.push_str(&format!("Host: {}\r\n", host_value(url, host)));
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            head.push_str(&format!("{}: {}\r\n", name.as_str(), value));
        }
    }
    if body_len > 0 {
        head.push_str(&format!("Content-Length: {body_len}\r\n"));
    }
    if options.disable_keepalive {
        head.push_str("Connection: close\r\n");
    }
    head.push_str("\r\n");
    head.into_bytes()
}

struct ParsedHead {
    status: u16,
    http10: bool,
    content_length: Option<u64>,
    chunked: bool,
    connection_close: bool,
    location: Option<String>,
}

fn parse_head(head: &[u8]) -> Result<ParsedHead, ProbeError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| ProbeError::MalformedResponse("non-utf8 response head"))?;
    let mut lines = text.split("\r\n");
    let status_line = lines
        .next()
        .ok_or(ProbeError::MalformedResponse("empty response head"))?;

    let mut parts = status_line.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or(ProbeError::MalformedResponse("missing http version"))?;
    let status = parts
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or(ProbeError::MalformedResponse("invalid status code"))?;

    let mut parsed = ParsedHead {
        status,
        http10: version.eq_ignore_ascii_case("HTTP/1.0"),
        content_length: None,
        chunked: false,
        connection_close: false,
        location: None,
    };

    for line in lines {
        let Some((name, value)) = line.split_once(':') else { continue };
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            parsed.content_length = value.parse().ok();
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            parsed.chunked = value.to_ascii_lowercase().contains("chunked");
        } else if name.eq_ignore_ascii_case("connection") {
            parsed.connection_close = value.eq_ignore_ascii_case("close");
        } else if name.eq_ignore_ascii_case("location") {
            parsed.location = Some(value.to_string());
        }
    }
    Ok(parsed)
}

/// Consume exactly `n` body bytes, using buffered leftovers first.
async fn skip_exact<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
    n: u64,
) -> Result<(), ProbeError> {
    let mut remaining = n;
    loop {
        let take = (buf.len() as u64).min(remaining) as usize;
        buf.advance(take);
        remaining -= take as u64;
        if remaining == 0 {
            return Ok(());
        }
        let read = stream.read_buf(buf).await?;
        if read == 0 {
            return Err(ProbeError::MalformedResponse("connection closed mid body"));
        }
    }
}

async fn read_to_eof<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<u64, ProbeError> {
    let mut total = buf.len() as u64;
    buf.clear();
    loop {
        let read = stream.read_buf(buf).await?;
        if read == 0 {
            return Ok(total);
        }
        total += read as u64;
        buf.clear();
    }
}

async fn read_line<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<String, ProbeError> {
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = String::from_utf8_lossy(&buf[..pos]).into_owned();
            buf.advance(pos + 2);
            return Ok(line);
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(ProbeError::MalformedResponse("chunk header too long"));
        }
        let read = stream.read_buf(buf).await?;
        if read == 0 {
            return Err(ProbeError::MalformedResponse("connection closed mid chunk"));
        }
    }
}

/// Drain a chunked body, returning the number of data bytes.
async fn read_chunked<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<u64, ProbeError> {
    let mut total = 0u64;
    loop {
        let line = read_line(stream, buf).await?;
        let size_text = line.split(';').next().unwrap_or_default().trim();
        let size = u64::from_str_radix(size_text, 16)
            .map_err(|_| ProbeError::MalformedResponse("invalid chunk size"))?;
        if size == 0 {
            loop {
                let trailer = read_line(stream, buf).await?;
                if trailer.is_empty() {
                    return Ok(total);
                }
            }
        }
        // Chunk data plus its trailing CRLF.
        skip_exact(stream, buf, size + 2).await?;
        total += size;
    }
}
