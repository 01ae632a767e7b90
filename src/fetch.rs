use crate::config::Defaults;
use crate::identity::Identity;
use crate::store::SessionRecord;
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::timeout;

/// Result of one completed HTTP exchange, however it was performed.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub status: u16,
    pub body: String,
    pub latency_ms: u64,
    pub final_url: String,
}

/// Network-level failures. These reach the classifier only after the
/// fetcher's own low-level retry has given up.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Request timeout")]
    Timeout,

    #[error("Connection reset by peer")]
    ConnectionReset,

    #[error("Connection refused - server not accepting connections")]
    ConnectionRefused,

    #[error("DNS resolution failed")]
    Dns,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Failed to read response body: {0}")]
    Body(String),

    #[error("Content too large: {0} bytes (max: {1} bytes)")]
    ContentTooLarge(usize, usize),

    #[error("Network error: {0}")]
    Network(String),
}

impl TransportError {
    /// Transient errors worth one more low-level attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Timeout | TransportError::ConnectionReset => true,
            TransportError::Network(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("timeout") || msg.contains("broken pipe") || msg.contains("temporary")
            }
            _ => false,
        }
    }
}

/// Pluggable fetch capability. The controller does not know whether this is
/// a plain HTTP client or full browser automation; it only needs the result
/// contract and in-place session state updates.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        identity: &Identity,
        session: &mut SessionRecord,
    ) -> Result<FetchResult, TransportError>;
}

/// Downstream handoff for successful fetches. Content extraction happens
/// entirely behind this boundary; the return value reports whether the page
/// contained new content, which drives window learning.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn submit(&self, target: &str, result: &FetchResult) -> bool;
}

/// Default reqwest-based fetcher.
///
/// One client is built lazily per identity (user-agent and proxy are
/// client-level settings); session cookies ride along as a Cookie header and
/// Set-Cookie responses are folded back into the session snapshot.
pub struct HttpFetcher {
    clients: DashMap<usize, reqwest::Client>,
    timeout_duration: Duration,
    max_body_size: usize,
}

impl HttpFetcher {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            clients: DashMap::new(),
            timeout_duration: Duration::from_secs(timeout_secs),
            max_body_size: Defaults::MAX_BODY_SIZE,
        }
    }

    fn client_for(&self, identity: &Identity) -> Result<reqwest::Client, TransportError> {
        if let Some(client) = self.clients.get(&identity.id) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .user_agent(&identity.user_agent)
            .timeout(self.timeout_duration)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::limited(5));

        if let Some(proxy_url) = &identity.proxy {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| TransportError::Network(format!("Bad proxy {}: {}", proxy_url, e)))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| TransportError::Network(format!("Client build failed: {}", e)))?;
        self.clients.insert(identity.id, client.clone());
        Ok(client)
    }

    async fn fetch_once(
        &self,
        url: &str,
        identity: &Identity,
        session: &mut SessionRecord,
    ) -> Result<FetchResult, TransportError> {
        let client = self.client_for(identity)?;
        let started = Instant::now();

        let mut request = client.get(url);
        for (name, value) in &identity.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request = request.header("Accept-Language", format!("{},en;q=0.5", identity.locale));

        if !session.cookies.is_empty() {
            let cookie_header = session
                .cookies
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect::<Vec<_>>()
                .join("; ");
            request = request.header("Cookie", cookie_header);
        }

        let response = timeout(self.timeout_duration, request.send())
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(classify_reqwest_error)?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();

        // Fold Set-Cookie headers back into the session snapshot.
        for value in response.headers().get_all("set-cookie") {
            if let Ok(raw) = value.to_str() {
                if let Some((name, value)) = parse_set_cookie(raw) {
                    upsert_cookie(session, name, value);
                }
            }
        }

        if let Some(length) = response.content_length() {
            if length as usize > self.max_body_size {
                return Err(TransportError::ContentTooLarge(
                    length as usize,
                    self.max_body_size,
                ));
            }
        }

        let body = timeout(self.timeout_duration, response.text())
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Body(e.to_string()))?;

        if body.len() > self.max_body_size {
            return Err(TransportError::ContentTooLarge(
                body.len(),
                self.max_body_size,
            ));
        }

        Ok(FetchResult {
            status,
            body,
            latency_ms: started.elapsed().as_millis() as u64,
            final_url,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    /// Fetch with low-level retry of transient errors, so transport failures
    /// that reach the classifier are already post-retry.
    async fn fetch(
        &self,
        url: &str,
        identity: &Identity,
        session: &mut SessionRecord,
    ) -> Result<FetchResult, TransportError> {
        const MAX_RETRIES: u32 = 2;
        let mut last_error = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
            }

            match self.fetch_once(url, identity, session).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or(TransportError::Network("Max retries exceeded".to_string())))
    }
}

/// Map reqwest errors onto the transport taxonomy.
fn classify_reqwest_error(error: reqwest::Error) -> TransportError {
    let message = error.to_string().to_lowercase();

    if message.contains("connection refused") {
        return TransportError::ConnectionRefused;
    }
    if message.contains("connection reset") {
        return TransportError::ConnectionReset;
    }
    if message.contains("dns") || message.contains("name resolution") {
        return TransportError::Dns;
    }
    if message.contains("ssl") || message.contains("tls") || message.contains("certificate") {
        return TransportError::Tls(error.to_string());
    }
    if error.is_timeout() {
        return TransportError::Timeout;
    }
    TransportError::Network(error.to_string())
}

fn parse_set_cookie(raw: &str) -> Option<(String, String)> {
    let first = raw.split(';').next()?;
    let (name, value) = first.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

fn upsert_cookie(session: &mut SessionRecord, name: String, value: String) {
    if let Some(entry) = session.cookies.iter_mut().find(|(n, _)| *n == name) {
        entry.1 = value;
    } else {
        session.cookies.push((name, value));
    }
}
