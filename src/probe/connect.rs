//! Timed connection establishment: DNS, TCP, proxy tunnel, TLS.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::BytesMut;
use native_tls::TlsConnector as NativeTlsConnector;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::Instant;
use tokio_native_tls::{TlsConnector, TlsStream};
use tokio_util::either::Either;
use url::Url;

use super::http1::find_head_end;
use super::{ClientOptions, ProbeError};

pub(crate) type MaybeTls = Either<TcpStream, TlsStream<TcpStream>>;

pub(crate) struct Dialed {
    pub stream: MaybeTls,
    pub dns: Duration,
    pub connect: Duration,
    /// Stamp taken when the TCP connection was established; the request
    /// phase is measured from here, so proxy tunnelling and TLS setup count
    /// toward it.
    pub tcp_done: Instant,
}

/// Establish a connection to the URL's origin, through the proxy when one is
/// configured, timing each phase along the way.
pub(crate) async fn dial(url: &Url, options: &ClientOptions, alpn_h2: bool) -> Result<Dialed, ProbeError> {
    let https = match url.scheme() {
        "https" => true,
        "http" => false,
        _ => return Err(ProbeError::UnsupportedUrl(url.to_string())),
    };
    let target_host = url
        .host_str()
        .ok_or_else(|| ProbeError::UnsupportedUrl(url.to_string()))?;
    let target_port = url.port_or_known_default().unwrap_or(80);

    // With a proxy the TCP connection goes to the proxy instead of the
    // origin; HTTPS targets are tunnelled with CONNECT before the handshake.
    let (dial_host, dial_port) = match &options.proxy {
        Some(proxy) => (
            proxy
                .host_str()
                .ok_or_else(|| ProbeError::UnsupportedUrl(proxy.to_string()))?,
            proxy.port_or_known_default().unwrap_or(8080),
        ),
        None => (target_host, target_port),
    };

    let (addr, dns) = resolve(dial_host, dial_port).await?;

    let connect_started = Instant::now();
    let stream = TcpStream::connect(addr).await.map_err(ProbeError::Connect)?;
    stream.set_nodelay(true).ok();
    let tcp_done = Instant::now();
    let connect = tcp_done - connect_started;

    let mut stream = stream;
    if https && options.proxy.is_some() {
        tunnel(&mut stream, target_host, target_port).await?;
    }

    let stream = if https {
        let connector = tls_connector(alpn_h2)?;
        let tls = connector
            .connect(target_host, stream)
            .await
            .map_err(|e| ProbeError::Tls(e.to_string()))?;
        Either::Right(tls)
    } else {
        Either::Left(stream)
    };

    Ok(Dialed { stream, dns, connect, tcp_done })
}

/// Certificate verification is disabled: load targets are routinely fronted
/// by self-signed or mismatched certificates.
fn tls_connector(alpn_h2: bool) -> Result<TlsConnector, ProbeError> {
    let mut builder = NativeTlsConnector::builder();
    builder.danger_accept_invalid_certs(true);
    builder.danger_accept_invalid_hostnames(true);
    if alpn_h2 {
        builder.request_alpns(&["h2"]);
    }
    let connector = builder.build().map_err(|e| ProbeError::Tls(e.to_string()))?;
    Ok(TlsConnector::from(connector))
}

async fn resolve(host: &str, port: u16) -> Result<(SocketAddr, Duration), ProbeError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok((SocketAddr::new(ip, port), Duration::ZERO));
    }
    let started = Instant::now();
    let mut addrs = lookup_host((host, port)).await.map_err(ProbeError::Dns)?;
    let addr = addrs
        .next()
        .ok_or_else(|| ProbeError::NoAddress(host.to_string()))?;
    Ok((addr, started.elapsed()))
}

async fn tunnel(stream: &mut TcpStream, host: &str, port: u16) -> Result<(), ProbeError> {
    let connect = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    stream.write_all(connect.as_bytes()).await?;

    let mut buf = BytesMut::with_capacity(1024);
    loop {
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(ProbeError::MalformedResponse("proxy closed during CONNECT"));
        }
        if find_head_end(&buf).is_some() {
            let status = connect_status(&buf)?;
            if !(200..300).contains(&status) {
                return Err(ProbeError::ProxyTunnel(status));
            }
            return Ok(());
        }
        if buf.len() > 16 * 1024 {
            return Err(ProbeError::MalformedResponse("oversized CONNECT response"));
        }
    }
}

fn connect_status(head: &[u8]) -> Result<u16, ProbeError> {
    let line = head.split(|&b| b == b'\r').next().unwrap_or_default();
    let text = std::str::from_utf8(line)
        .map_err(|_| ProbeError::MalformedResponse("non-utf8 CONNECT status line"))?;
    text.split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or(ProbeError::MalformedResponse("invalid CONNECT status line"))
}
