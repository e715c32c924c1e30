use std::io::Read;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::provider::{MeasurementProvider, ProgressSink, ProviderError, ServerDescriptor};
use crate::config::{DEFAULT_SERVERS, DOWNLOAD_BYTES, LATENCY_SAMPLES, UPLOAD_BYTES};
use crate::error::SpeedwatchError;

const READ_CHUNK: usize = 64 * 1024;
const UPLOAD_CHUNKS: u64 = 8;

/// An HTTP endpoint exposing `/__down?bytes=N` and `/__up`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpEndpoint {
    pub name: String,
    pub base_url: String,
    host: String,
}

impl HttpEndpoint {
    pub fn new(name: &str, url: &str) -> Result<Self, SpeedwatchError> {
        let invalid = |why: &str| {
            SpeedwatchError::InvalidArgument(format!("invalid server {name}={url}: {why}"))
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(invalid("empty name"));
        }
        let parsed = reqwest::Url::parse(url.trim()).map_err(|e| invalid(&e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid("scheme must be http or https"));
        }
        if parsed.query().is_some() || parsed.fragment().is_some() {
            return Err(invalid("query and fragment are not allowed"));
        }
        let host = match parsed.host_str() {
            Some(h) if !h.is_empty() => h,
            _ => return Err(invalid("missing host")),
        };
        let host = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        Ok(HttpEndpoint {
            name: name.to_string(),
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            host,
        })
    }

    /// Parse `name=url`.
    pub fn parse(arg: &str) -> Result<Self, SpeedwatchError> {
        let (name, url) = arg
            .split_once('=')
            .ok_or_else(|| SpeedwatchError::InvalidArgument(format!("expected name=url, got {arg}")))?;
        Self::new(name, url)
    }

    fn descriptor(&self) -> ServerDescriptor {
        ServerDescriptor {
            name: self.name.clone(),
            host: self.host.clone(),
            url: self.base_url.clone(),
        }
    }
}

/// Times plain HTTP transfers against a list of endpoints.
pub struct HttpProvider {
    endpoints: Vec<HttpEndpoint>,
    client: reqwest::blocking::Client,
    download_bytes: u64,
    upload_bytes: u64,
}

impl HttpProvider {
    pub fn new(endpoints: Vec<HttpEndpoint>, request_timeout: Duration) -> Result<Self, SpeedwatchError> {
        if endpoints.is_empty() {
            return Err(SpeedwatchError::InvalidArgument(
                "at least one measurement server is required".into(),
            ));
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("speedwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SpeedwatchError::InvalidArgument(format!("HTTP client: {e}")))?;
        Ok(Self {
            endpoints,
            client,
            download_bytes: DOWNLOAD_BYTES,
            upload_bytes: UPLOAD_BYTES,
        })
    }

    pub fn with_default_servers(request_timeout: Duration) -> Result<Self, SpeedwatchError> {
        let endpoints = DEFAULT_SERVERS
            .iter()
            .map(|(name, url)| HttpEndpoint::new(name, url))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(endpoints, request_timeout)
    }

    fn ping_url(base: &str) -> String {
        format!("{}/__down?bytes=0", base)
    }

    fn round_trip(&self, url: &str, timeout: Option<Duration>) -> Result<Duration, ProviderError> {
        let mut request = self.client.get(url);
        if let Some(t) = timeout {
            request = request.timeout(t);
        }
        let started = Instant::now();
        let response = request.send().map_err(map_reqwest)?;
        let elapsed = started.elapsed();
        response.error_for_status().map_err(map_reqwest)?;
        Ok(elapsed)
    }
}

impl MeasurementProvider for HttpProvider {
    fn check_connectivity(&self, timeout: Duration) -> bool {
        self.endpoints.iter().any(|e| {
            match self.client.head(&e.base_url).timeout(timeout).send() {
                Ok(_) => true,
                Err(err) => {
                    debug!("Connectivity check against {} failed: {}", e.base_url, err);
                    false
                }
            }
        })
    }

    fn select_server(&self) -> Result<ServerDescriptor, ProviderError> {
        let mut best: Option<(Duration, &HttpEndpoint)> = None;
        for endpoint in &self.endpoints {
            match self.round_trip(&Self::ping_url(&endpoint.base_url), None) {
                Ok(rtt) if best.map_or(true, |(b, _)| rtt < b) => best = Some((rtt, endpoint)),
                Ok(_) => {}
                Err(e) => warn!("Server {} unavailable: {}", endpoint.name, e),
            }
        }
        best.map(|(_, e)| e.descriptor())
            .ok_or(ProviderError::NoMatchedServers)
    }

    fn measure_latency(&self, server: &ServerDescriptor) -> Result<f64, ProviderError> {
        let url = Self::ping_url(&server.url);
        let mut total = Duration::ZERO;
        for _ in 0..LATENCY_SAMPLES {
            total += self.round_trip(&url, None)?;
        }
        Ok(total.as_secs_f64() * 1000.0 / LATENCY_SAMPLES as f64)
    }

    fn measure_download(&self, server: &ServerDescriptor, sink: &ProgressSink) -> Result<f64, ProviderError> {
        let url = format!("{}/__down?bytes={}", server.url, self.download_bytes);
        let started = Instant::now();
        let mut response = self
            .client
            .get(&url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(map_reqwest)?;
        let expected = response.content_length().unwrap_or(self.download_bytes);

        let mut buf = vec![0u8; READ_CHUNK];
        let mut received: u64 = 0;
        loop {
            if sink.is_cancelled() {
                return Err(ProviderError::Interrupted);
            }
            let n = response.read(&mut buf).map_err(map_io)?;
            if n == 0 {
                break;
            }
            received += n as u64;
            sink.report(Some(received as f64 / expected.max(1) as f64));
        }

        throughput(received, started.elapsed())
    }

    fn measure_upload(&self, server: &ServerDescriptor, sink: &ProgressSink) -> Result<f64, ProviderError> {
        let url = format!("{}/__up", server.url);
        let chunk = vec![0u8; (self.upload_bytes / UPLOAD_CHUNKS) as usize];
        let started = Instant::now();
        let mut sent: u64 = 0;
        for i in 0..UPLOAD_CHUNKS {
            if sink.is_cancelled() {
                return Err(ProviderError::Interrupted);
            }
            self.client
                .post(&url)
                .body(chunk.clone())
                .send()
                .and_then(|r| r.error_for_status())
                .map_err(map_reqwest)?;
            sent += chunk.len() as u64;
            sink.report(Some((i + 1) as f64 / UPLOAD_CHUNKS as f64));
        }

        throughput(sent, started.elapsed())
    }
}

fn throughput(bytes: u64, elapsed: Duration) -> Result<f64, ProviderError> {
    let secs = elapsed.as_secs_f64();
    if bytes == 0 || secs <= 0.0 {
        return Err(ProviderError::Other("no data transferred".into()));
    }
    Ok(bytes as f64 * 8.0 / secs)
}

fn map_reqwest(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(e.to_string())
    } else if e.is_connect() || e.is_request() {
        ProviderError::Connectivity(e.to_string())
    } else if let Some(status) = e.status() {
        ProviderError::ConfigRetrieval(format!("server answered {}", status))
    } else {
        ProviderError::Other(e.to_string())
    }
}

fn map_io(e: std::io::Error) -> ProviderError {
    match e.kind() {
        std::io::ErrorKind::TimedOut => ProviderError::Timeout(e.to_string()),
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::UnexpectedEof => ProviderError::Connectivity(e.to_string()),
        _ => ProviderError::Other(e.to_string()),
    }
}
