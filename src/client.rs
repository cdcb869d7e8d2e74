use crate::error::{HarnessError, RequestError};
use crate::metrics::RequestResult;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Method;
use std::ops::RangeInclusive;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-request knobs. Defaults: no headers, no body, the client's timeout,
/// and any status in 200..=399 counts as success.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout: Option<Duration>,
    pub expected_statuses: Option<RangeInclusive<u16>>,
}

impl RequestOptions {
    fn is_expected(&self, status: u16) -> bool {
        match &self.expected_statuses {
            Some(range) => range.contains(&status),
            None => (200..=399).contains(&status),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub duration: Duration,
    pub body: String,
}

/// Shared HTTP handle. Clones share one connection pool.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Result<Self, HarnessError> {
        let inner = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("loadramp/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(HarnessError::Client)?;

        Ok(Self { inner, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Performs one exchange and returns both the result to record and the caller-facing outcome.
    pub(crate) async fn execute(
        &self,
        method: Method,
        url: &str,
        options: &RequestOptions,
    ) -> (RequestResult, Result<Response, RequestError>) {
        let timeout = options.timeout.unwrap_or(self.timeout);
        let timestamp = SystemTime::now();
        let start = Instant::now();

        let outcome = self.exchange(method.clone(), url, options, timeout).await;
        let duration = start.elapsed();

        let (status, failed, error) = match &outcome {
            Ok((status, _)) => (*status, !options.is_expected(*status), None),
            Err((status, err)) => (*status, true, Some(err.to_string())),
        };

        if let Some(err) = &error {
            debug!("{} {} failed after {:?}: {}", method, url, duration, err);
        }

        let result = RequestResult {
            method,
            url: url.to_string(),
            status,
            duration,
            timestamp,
            failed,
            error,
        };

        let outcome = outcome
            .map(|(status, body)| Response {
                status,
                duration,
                body,
            })
            .map_err(|(_, err)| err);

        (result, outcome)
    }

    async fn exchange(
        &self,
        method: Method,
        url: &str,
        options: &RequestOptions,
        timeout: Duration,
    ) -> Result<(u16, String), (u16, RequestError)> {
        let mut request = self.inner.request(method, url).timeout(timeout);

        for (name, value) in &options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| (0, RequestError::Build(e.to_string())))?;
            let value =
                HeaderValue::from_str(value).map_err(|e| (0, RequestError::Build(e.to_string())))?;
            request = request.header(name, value);
        }

        if let Some(body) = &options.body {
            request = request.body(body.clone());
        }

        let response = request
            .send()
            .await
            .map_err(|e| (0, RequestError::from_reqwest(e, timeout)))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| (status, RequestError::from_reqwest(e, timeout)))?;

        Ok((status, body))
    }
}
