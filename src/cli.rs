//! Command-line surface shared by both roles of the binary.
//!
//! `--mode client` fans out to a fleet of load servers and merges their
//! reports; `--mode server` listens for `/run` and drives the configured
//! workload against the target URL. Flag validation happens here — invalid
//! configurations never reach the load engine.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use http::header::{HeaderName, HeaderValue, ACCEPT, ACCEPT_ENCODING, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use http::{HeaderMap, Method};
use url::Url;

use crate::output::OutputFormat;
use crate::probe::{ClientOptions, RequestTemplate};
use crate::runner::Work;

/// Tool tag appended to every request's User-Agent.
pub const USER_AGENT_TAG: &str = concat!("volley/", env!("CARGO_PKG_VERSION"));

#[derive(Parser, Clone, Debug)]
#[command(name = "volley", version, about = "Distributed HTTP load generator")]
pub struct Opts {
    /// Role of this process.
    #[arg(long, value_enum)]
    pub mode: Mode,

    /// Comma-separated load server addresses as host:port (client mode).
    #[arg(long = "client-targets", value_delimiter = ',')]
    pub client_targets: Vec<String>,

    /// Listen port (server mode).
    #[arg(long = "server-port", default_value_t = 8081)]
    pub server_port: u16,

    /// Number of requests to run.
    #[arg(short = 'n', default_value_t = 200)]
    pub requests: u64,

    /// Number of workers to run concurrently.
    ///
    /// The total number of requests cannot be smaller than the concurrency
    /// level.
    #[arg(short = 'c', default_value_t = 50)]
    pub concurrency: u32,

    /// Rate limit in queries per second per worker; 0 disables pacing.
    #[arg(short = 'q', default_value_t = 0.0)]
    pub qps: f64,

    /// Timeout for each request in seconds; 0 means no timeout.
    #[arg(short = 't', default_value_t = 20)]
    pub timeout: u64,

    /// Duration to send requests for; when set, `-n` is ignored.
    ///
    /// Examples: -z 10s, -z 3m.
    #[arg(short = 'z')]
    pub duration: Option<humantime::Duration>,

    /// HTTP method.
    #[arg(short = 'm', default_value = "GET")]
    pub method: String,

    /// Custom HTTP header; repeat the flag for more.
    ///
    /// Example: -H "Accept: text/html" -H "Content-Type: application/xml".
    #[arg(short = 'H', value_name = "HEADER")]
    pub headers: Vec<String>,

    /// HTTP Accept header.
    #[arg(short = 'A')]
    pub accept: Option<String>,

    /// Content-Type header.
    #[arg(short = 'T', default_value = "text/html")]
    pub content_type: String,

    /// User-Agent; the tool tag is appended.
    #[arg(short = 'U')]
    pub user_agent: Option<String>,

    /// Basic authentication as username:password.
    #[arg(short = 'a')]
    pub auth: Option<String>,

    /// HTTP Host header override.
    #[arg(long)]
    pub host: Option<String>,

    /// HTTP request body.
    #[arg(short = 'd')]
    pub body: Option<String>,

    /// HTTP request body from a file.
    #[arg(short = 'D', value_name = "FILE")]
    pub body_file: Option<PathBuf>,

    /// HTTP proxy address as host:port.
    #[arg(short = 'x')]
    pub proxy: Option<String>,

    /// Issue requests over HTTP/2.
    #[arg(long)]
    pub h2: bool,

    /// Disable compression.
    #[arg(long)]
    pub disable_compression: bool,

    /// Disable keep-alive: no TCP connection reuse between requests.
    #[arg(long)]
    pub disable_keepalive: bool,

    /// Disable following HTTP redirects.
    #[arg(long)]
    pub disable_redirects: bool,

    /// Number of runtime worker threads; defaults to the core count.
    #[arg(long)]
    pub cpus: Option<usize>,

    /// Output format for the merged report.
    #[arg(short = 'o', value_enum, default_value = "summary")]
    pub output: OutputFormat,

    /// Target URL (server mode).
    pub url: Option<String>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum Mode {
    Client,
    Server,
}

/// Validated run plan for one process.
#[derive(Debug, Clone)]
pub enum Command {
    Client { targets: Vec<String>, output: OutputFormat },
    Server { port: u16, work: Work },
}

/// Validate the flags and build the run plan.
pub fn build(opts: &Opts) -> Result<Command> {
    match opts.mode {
        Mode::Client => {
            let targets: Vec<String> = opts
                .client_targets
                .iter()
                .map(|target| target.trim().to_string())
                .filter(|target| !target.is_empty())
                .collect();
            if targets.is_empty() {
                bail!("please specify the load servers with --client-targets");
            }
            Ok(Command::Client { targets, output: opts.output })
        }
        Mode::Server => Ok(Command::Server { port: opts.server_port, work: build_work(opts)? }),
    }
}

fn build_work(opts: &Opts) -> Result<Work> {
    if opts.concurrency == 0 {
        bail!("-c cannot be smaller than 1");
    }
    let duration: Option<Duration> = opts.duration.map(Into::into).filter(|d: &Duration| !d.is_zero());
    if duration.is_none() {
        if opts.requests == 0 {
            bail!("-n cannot be smaller than 1");
        }
        if opts.requests < opts.concurrency as u64 {
            bail!("-n cannot be less than -c");
        }
    }

    let url: Url = opts
        .url
        .as_deref()
        .ok_or_else(|| anyhow!("please specify the target url"))?
        .parse()
        .context("invalid target url")?;
    let method: Method = opts
        .method
        .to_uppercase()
        .parse()
        .map_err(|_| anyhow!("invalid method: {}", opts.method))?;

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_str(&opts.content_type)?);
    for raw in &opts.headers {
        let (name, value) = parse_header(raw)?;
        headers.insert(name, value);
    }
    if let Some(accept) = &opts.accept {
        headers.insert(ACCEPT, HeaderValue::from_str(accept)?);
    }

    // The tool tag is appended to whatever User-Agent the flags provided.
    let user_agent = match (&opts.user_agent, headers.get(USER_AGENT)) {
        (Some(prefix), _) => format!("{prefix} {USER_AGENT_TAG}"),
        (None, Some(existing)) => {
            format!("{} {USER_AGENT_TAG}", existing.to_str().unwrap_or_default())
        }
        (None, None) => USER_AGENT_TAG.to_string(),
    };
    headers.insert(USER_AGENT, HeaderValue::from_str(&user_agent)?);

    if let Some(auth) = &opts.auth {
        let (username, password) = parse_auth(auth)?;
        let token = BASE64.encode(format!("{username}:{password}"));
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Basic {token}"))?);
    }
    if !opts.disable_compression {
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
    }

    let body = match (&opts.body_file, &opts.body) {
        (Some(path), _) => Bytes::from(
            std::fs::read(path)
                .with_context(|| format!("cannot read body file {}", path.display()))?,
        ),
        (None, Some(inline)) => Bytes::from(inline.clone().into_bytes()),
        (None, None) => Bytes::new(),
    };

    let proxy = opts.proxy.as_deref().map(parse_proxy).transpose()?;

    Ok(Work {
        template: RequestTemplate { method, url, headers, body, host: opts.host.clone() },
        client: ClientOptions {
            timeout: (opts.timeout > 0).then(|| Duration::from_secs(opts.timeout)),
            disable_compression: opts.disable_compression,
            disable_keepalive: opts.disable_keepalive,
            disable_redirects: opts.disable_redirects,
            http2: opts.h2,
            proxy,
        },
        n: opts.requests,
        concurrency: opts.concurrency,
        qps: opts.qps,
        duration,
        output: opts.output,
    })
}

/// `Name: value`; the name is limited to word characters and dashes, the
/// value may not be empty after leading whitespace.
fn parse_header(raw: &str) -> Result<(HeaderName, HeaderValue)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("invalid header: {raw}"))?;
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        bail!("invalid header name: {raw}");
    }
    let value = value.trim_start();
    if value.is_empty() {
        bail!("invalid header value: {raw}");
    }
    Ok((name.parse()?, HeaderValue::from_str(value)?))
}

/// `username:password`; the username may contain colons. The split is
/// greedy: the longest username whose remainder is still a valid password,
/// one non-whitespace character followed by at least one more.
fn parse_auth(raw: &str) -> Result<(String, String)> {
    for (idx, _) in raw.char_indices().rev().filter(|&(_, c)| c == ':') {
        let (username, password) = (&raw[..idx], &raw[idx + 1..]);
        if username.is_empty() {
            continue;
        }
        let mut chars = password.chars();
        if matches!(chars.next(), Some(first) if !first.is_whitespace()) && chars.next().is_some() {
            return Ok((username.to_string(), password.to_string()));
        }
    }
    bail!("invalid auth: expected username:password")
}

fn parse_proxy(raw: &str) -> Result<Url> {
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };
    candidate.parse().context("invalid proxy address")
}
