//! HTTP fetcher with failure classification.
//!
//! [`HttpFetcher`] implements the [`Fetcher`] capability over `reqwest`. It does
//! not retry on its own: every failure is classified as transient or permanent
//! and the task executor decides what to do with it.
//!
//! Requests to one host are spaced at least `rate_limit_ms` apart by a keyed
//! `governor` limiter; different hosts do not wait on each other.

use std::net::IpAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use regex::Regex;
use reqwest::{Client, RequestBuilder, StatusCode};
use tracing::{debug, warn};
use url::Url;

use adaptcrawl_shared::{AdaptError, Credentials, FetchConfig, FetchOptions, Fetcher, RawPage, Result};

// ---------------------------------------------------------------------------
// HttpFetcher
// ---------------------------------------------------------------------------

/// `reqwest`-backed fetcher with SSRF protection and an optional rendering service.
pub struct HttpFetcher {
    config: FetchConfig,
    client: Client,
    limiter: Option<Arc<DefaultKeyedRateLimiter<String>>>,
}

impl HttpFetcher {
    /// Create a new fetcher with the given configuration.
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AdaptError::config(format!("failed to build HTTP client: {e}")))?;

        let limiter = Quota::with_period(Duration::from_millis(config.rate_limit_ms))
            .map(|quota| Arc::new(RateLimiter::keyed(quota)));

        Ok(Self {
            config,
            client,
            limiter,
        })
    }

    async fn get(&self, url: &Url, options: &FetchOptions) -> Result<RawPage> {
        debug!(%url, "fetching page");
        let request = with_credentials(self.client.get(url.as_str()), options.credentials.as_ref());
        let (status, body) = self.send(url, request).await?;
        Ok(RawPage {
            url: url.to_string(),
            status,
            body,
            rendered: false,
            fetched_at: Utc::now(),
        })
    }

    /// The rendering service fetches the target itself, so credentials go in
    /// the payload rather than on the request to the service.
    async fn render(&self, endpoint: &str, url: &Url, options: &FetchOptions) -> Result<RawPage> {
        debug!(%url, endpoint, "fetching rendered page");
        let payload = render_payload(url, options.credentials.as_ref());
        let request = self.client.post(endpoint).json(&payload);
        let (status, body) = self.send(url, request).await?;
        Ok(RawPage {
            url: url.to_string(),
            status,
            body,
            rendered: true,
            fetched_at: Utc::now(),
        })
    }

    async fn send(&self, url: &Url, request: RequestBuilder) -> Result<(u16, String)> {
        let response = request
            .send()
            .await
            .map_err(|e| classify_transport(url, &e, self.config.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(url, status));
        }

        let body = response
            .text()
            .await
            .map_err(|e| AdaptError::transient(url.as_str(), format!("body read failed: {e}")))?;
        Ok((status.as_u16(), body))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<RawPage> {
        let parsed = Url::parse(url)
            .map_err(|e| AdaptError::permanent(url, None, format!("invalid url: {e}")))?;

        if !self.config.allow_private_hosts && is_ssrf_target(&parsed) {
            warn!(%url, "SSRF protection: blocked");
            return Err(AdaptError::permanent(url, None, "blocked private or non-http target"));
        }

        if let Some(limiter) = &self.limiter {
            limiter.until_key_ready(&host_key(&parsed)).await;
        }

        match (options.render, self.config.render_endpoint.as_deref()) {
            (true, Some(endpoint)) => self.render(endpoint, &parsed, options).await,
            (true, None) => {
                debug!(%url, "no render endpoint configured, using raw document");
                self.get(&parsed, options).await
            }
            (false, _) => self.get(&parsed, options).await,
        }
    }
}

/// `{"url"}` plus the target's auth: bearer tokens as an extra header, basic
/// credentials as an `authenticate` pair.
fn render_payload(url: &Url, credentials: Option<&Credentials>) -> serde_json::Value {
    let mut payload = serde_json::json!({ "url": url.as_str() });
    match credentials {
        Some(Credentials::Bearer(token)) => {
            payload["headers"] = serde_json::json!({ "Authorization": format!("Bearer {token}") });
        }
        Some(Credentials::Basic { username, password }) => {
            payload["authenticate"] =
                serde_json::json!({ "username": username, "password": password });
        }
        None => {}
    }
    payload
}

/// Rate limiter key: host plus explicit or default port.
fn host_key(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default().to_lowercase();
    match url.port_or_known_default() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    }
}

fn with_credentials(request: RequestBuilder, credentials: Option<&Credentials>) -> RequestBuilder {
    match credentials {
        Some(Credentials::Bearer(token)) => request.bearer_auth(token),
        Some(Credentials::Basic { username, password }) => {
            request.basic_auth(username, Some(password))
        }
        None => request,
    }
}

// ---------------------------------------------------------------------------
// Failure classification
// ---------------------------------------------------------------------------

/// Map a non-success status to a fetch error.
///
/// Request timeouts, rate limiting, and server errors are transient;
/// everything else (404, 403, 410, ...) is permanent.
pub fn classify_status(url: &Url, status: StatusCode) -> AdaptError {
    let transient = status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error();
    if transient {
        AdaptError::transient(url.as_str(), format!("HTTP {status}"))
    } else {
        AdaptError::permanent(url.as_str(), Some(status.as_u16()), format!("HTTP {status}"))
    }
}

fn classify_transport(url: &Url, err: &reqwest::Error, timeout_secs: u64) -> AdaptError {
    if err.is_timeout() {
        AdaptError::timeout(format!("fetch {url}"), Duration::from_secs(timeout_secs))
    } else if err.is_builder() || err.is_redirect() {
        AdaptError::permanent(url.as_str(), None, err.to_string())
    } else {
        AdaptError::transient(url.as_str(), err.to_string())
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
pub fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (carrier-grade NAT)
                || (o[0] == 100 && (o[1] & 0xC0) == 64)
                || (o[0] == 192 && o[1] == 0 && o[2] == 0)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

// ---------------------------------------------------------------------------
// URL helpers
// ---------------------------------------------------------------------------

static ID_SEGMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+|[0-9a-fA-F]{8,}|[0-9a-fA-F]{8}-[0-9a-fA-F-]{27})$").expect("valid regex")
});

/// Derive a page fingerprint: host plus path, with id-like segments collapsed.
///
/// `https://news.example.com/list/2024/?page=3` → `news.example.com/list/*`
pub fn fingerprint_for(url: &Url) -> String {
    let host = url.host_str().unwrap_or("").to_lowercase();
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();

    let mut fp = host;
    for seg in segments {
        fp.push('/');
        if ID_SEGMENT_RE.is_match(seg) {
            fp.push('*');
        } else {
            fp.push_str(&seg.to_lowercase());
        }
    }
    fp
}
