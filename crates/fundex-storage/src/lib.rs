//! HTTP session + relational persistence for fundex.

mod pg;
mod store;

use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub use pg::PgFundStore;
pub use sqlx::postgres::PgConnectOptions;
pub use store::{FundStore, MemoryFundStore, Persist, StoreError, WrittenBatch};

pub const CRATE_NAME: &str = "fundex-storage";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/73.0.3683.75 Safari/537.36";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    /// Upper bound of the uniform random delay taken after each request.
    pub max_pacing: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_pacing: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not valid JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed response from {url}: {reason}")]
    Envelope { url: String, reason: String },
}

impl FetchError {
    /// Transport-level failures, as opposed to a body that could not be decoded.
    pub fn is_network(&self) -> bool {
        matches!(self, FetchError::Request { .. } | FetchError::HttpStatus { .. })
    }

    pub fn envelope(url: &str, reason: impl Into<String>) -> Self {
        FetchError::Envelope {
            url: url.to_string(),
            reason: reason.into(),
        }
    }
}

/// One browser-like session shared by every request of a run.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    max_pacing: Duration,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(config.user_agent)
            .cookie_store(true)
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            max_pacing: config.max_pacing,
        })
    }

    pub async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        debug!(url, "GET");
        let resp = self.client.get(url).send().await;
        read_text(url, resp).await
    }

    /// Form POST; the form encoding overrides the session's JSON content type.
    pub async fn post_form_text(
        &self,
        url: &str,
        form: &[(&str, String)],
    ) -> Result<String, FetchError> {
        debug!(url, "POST");
        let resp = self.client.post(url).form(form).send().await;
        read_text(url, resp).await
    }

    pub async fn get_json(&self, url: &str) -> Result<JsonValue, FetchError> {
        let text = self.get_text(url).await?;
        decode_json(url, &text)
    }

    pub async fn post_form_json(
        &self,
        url: &str,
        form: &[(&str, String)],
    ) -> Result<JsonValue, FetchError> {
        let text = self.post_form_text(url, form).await?;
        decode_json(url, &text)
    }

    pub fn pacing_delay(&self) -> Duration {
        let max_micros = self.max_pacing.as_micros() as u64;
        if max_micros == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(rand::thread_rng().gen_range(0..max_micros))
    }

    /// Sleep a random sub-`max_pacing` interval to stay under the source's abuse thresholds.
    pub async fn pace(&self) {
        let delay = self.pacing_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

async fn read_text(
    url: &str,
    resp: Result<reqwest::Response, reqwest::Error>,
) -> Result<String, FetchError> {
    let resp = resp.map_err(|source| FetchError::Request {
        url: url.to_string(),
        source,
    })?;
    let status = resp.status();
    if !status.is_success() {
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: resp.url().to_string(),
        });
    }
    resp.text().await.map_err(|source| FetchError::Request {
        url: url.to_string(),
        source,
    })
}

pub fn decode_json(url: &str, text: &str) -> Result<JsonValue, FetchError> {
    serde_json::from_str(text).map_err(|source| FetchError::Decode {
        url: url.to_string(),
        source,
    })
}

/// Cut a fixed number of bytes off both ends of a script-wrapped JSON body.
pub fn strip_envelope<'a>(
    url: &str,
    text: &'a str,
    leading: usize,
    trailing: usize,
) -> Result<&'a str, FetchError> {
    let end = text
        .len()
        .checked_sub(trailing)
        .filter(|end| *end >= leading)
        .ok_or_else(|| FetchError::envelope(url, format!("body of {} bytes too short", text.len())))?;
    text.get(leading..end)
        .ok_or_else(|| FetchError::envelope(url, "envelope offsets split a character"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn quiet_fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            max_pacing: Duration::ZERO,
            ..Default::default()
        })
        .expect("fetcher")
    }

    #[test]
    fn strip_envelope_cuts_fixed_offsets() {
        let body = "var r = [[\"000001\"]];";
        assert_eq!(
            strip_envelope("u", body, 8, 1).expect("strip"),
            "[[\"000001\"]]"
        );
    }

    #[test]
    fn strip_envelope_rejects_short_bodies() {
        let err = strip_envelope("u", "short", 8, 1).unwrap_err();
        assert!(matches!(err, FetchError::Envelope { .. }));
        assert!(!err.is_network());
    }

    #[test]
    fn pacing_stays_below_bound() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            max_pacing: Duration::from_millis(5),
            ..Default::default()
        })
        .expect("fetcher");
        for _ in 0..100 {
            assert!(fetcher.pacing_delay() < Duration::from_millis(5));
        }
        assert_eq!(quiet_fetcher().pacing_delay(), Duration::ZERO);
    }

    #[tokio::test]
    async fn session_sends_identity_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/probe"))
            .and(header_exists("user-agent"))
            .and(header("content-type", "application/json; charset=utf-8"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"ok":true}"#))
            .expect(1)
            .mount(&server)
            .await;

        let value = quiet_fetcher()
            .get_json(&format!("{}/probe", server.uri()))
            .await
            .expect("json");
        assert_eq!(value["ok"], JsonValue::Bool(true));
    }

    #[tokio::test]
    async fn form_posts_use_urlencoded_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rank"))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .and(body_string_contains("page=2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"list":[]}"#))
            .expect(1)
            .mount(&server)
            .await;

        let value = quiet_fetcher()
            .post_form_json(
                &format!("{}/rank", server.uri()),
                &[("page", "2".to_string())],
            )
            .await
            .expect("json");
        assert!(value["list"].as_array().expect("list").is_empty());
    }

    #[tokio::test]
    async fn non_json_body_is_a_decode_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>blocked</html>"))
            .mount(&server)
            .await;

        let err = quiet_fetcher()
            .get_json(&format!("{}/x", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Decode { .. }));
    }

    #[tokio::test]
    async fn error_status_is_a_network_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = quiet_fetcher()
            .get_text(&format!("{}/x", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
        assert!(err.is_network());
    }
}
