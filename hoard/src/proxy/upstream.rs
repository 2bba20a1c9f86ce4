//! The HTTP client side of a target: fetching from the configured origins.

use super::Error;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_USER_AGENT: &str = "curl/8.10.0";

/// Response headers that are carried over from the origin. Everything else is
/// dropped; in particular hop-by-hop and encoding negotiation headers must not
/// leak through the cache.
const FORWARDED_HEADERS: [&str; 5] = [
    "Content-Type",
    "Content-Length",
    "Last-Modified",
    "Content-Range",
    "Accept-Ranges",
];

/// Per-target HTTP transport settings.
#[derive(Debug, Clone, Default)]
pub struct Transport {
    /// Proxy URL for all origin traffic.
    pub proxy: Option<String>,
    /// User-Agent presented to origins.
    pub user_agent: Option<String>,
    /// Connect timeout; requests themselves may stream for as long as they
    /// need.
    pub connect_timeout: Option<Duration>,
    /// Headers added to every origin request.
    pub headers: Vec<(String, String)>,
}

/// Blocking HTTP client with the target's transport settings baked in.
///
/// The reqwest client is built on first use: requests always run on blocking
/// threads, while targets are bound from async startup code where a blocking
/// client must not live.
pub struct UpstreamClient {
    connect_timeout: Duration,
    proxy: Option<reqwest::Proxy>,
    user_agent: String,
    headers: Vec<(String, String)>,
    client: std::sync::OnceLock<reqwest::blocking::Client>,
}

/// An accepted origin response: status, the forwarded header subset, and the
/// still-streaming body.
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: reqwest::blocking::Response,
}

impl UpstreamClient {
    pub fn new(transport: &Transport) -> Result<Self, Error> {
        let proxy = match &transport.proxy {
            Some(url) => Some(reqwest::Proxy::all(url)?),
            None => None,
        };
        Ok(UpstreamClient {
            connect_timeout: transport.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            proxy,
            user_agent: transport
                .user_agent
                .clone()
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_owned()),
            headers: transport.headers.clone(),
            client: std::sync::OnceLock::new(),
        })
    }

    fn client(&self) -> Result<&reqwest::blocking::Client, Error> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let mut builder = reqwest::blocking::Client::builder()
            .connect_timeout(self.connect_timeout)
            // Large artifacts may stream for a long time; only connecting is
            // bounded.
            .timeout(None);
        if let Some(proxy) = &self.proxy {
            builder = builder.proxy(proxy.clone());
        }
        let built = builder.build()?;
        Ok(self.client.get_or_init(|| built))
    }

    /// Issues a GET against `url`, forwarding the caller's request headers.
    ///
    /// Without `error_accept` only 2xx responses are returned; anything else
    /// is an [Error::UpstreamStatus]. With it, the response is handed back
    /// whatever its status, which is what the transparent and Range bypass
    /// paths want.
    pub fn open(
        &self,
        url: &str,
        error_accept: bool,
        request_headers: &[(String, String)],
    ) -> Result<UpstreamResponse, Error> {
        let mut request = self
            .client()?
            .get(url)
            .header(reqwest::header::USER_AGENT, self.user_agent.as_str());
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        for (key, value) in request_headers {
            request = request.header(key.as_str(), value.as_str());
        }
        let response = request.send()?;
        let status = response.status();
        if !error_accept && !status.is_success() {
            return Err(Error::UpstreamStatus {
                url: url.to_owned(),
                status: status.as_u16(),
            });
        }

        let mut headers = BTreeMap::new();
        for name in FORWARDED_HEADERS {
            if let Some(value) = response.headers().get(name).and_then(|v| v.to_str().ok()) {
                headers.insert(name.to_owned(), value.to_owned());
            }
        }
        debug!(url = %url, status = status.as_u16(), "origin responded");
        Ok(UpstreamResponse {
            status: status.as_u16(),
            headers,
            body: response,
        })
    }
}
