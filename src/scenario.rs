use crate::client::{HttpClient, RequestOptions, Response};
use crate::error::RequestError;
use crate::metrics::{MetricsSink, RequestResult};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use reqwest::Method;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Unit of work a virtual user repeats once per iteration.
pub trait Scenario: Send + Sync {
    fn iterate<'a>(&'a self, ctx: &'a mut VuContext) -> BoxFuture<'a, ()>;
}

/// Everything a scenario may touch during one iteration: an HTTP handle whose
/// results are recorded automatically, and a sink for checks and extra samples.
#[derive(Debug)]
pub struct VuContext {
    id: usize,
    iteration: u64,
    client: HttpClient,
    sink: MetricsSink,
}

impl VuContext {
    pub fn new(id: usize, client: HttpClient, sink: MetricsSink) -> Self {
        Self {
            id,
            iteration: 0,
            client,
            sink,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Zero-based iteration number of this VU.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub(crate) fn set_iteration(&mut self, iteration: u64) {
        self.iteration = iteration;
    }

    pub(crate) fn sink(&self) -> &MetricsSink {
        &self.sink
    }

    pub async fn get(&self, url: &str) -> Result<Response, RequestError> {
        self.request(Method::GET, url, &RequestOptions::default())
            .await
    }

    pub async fn post(&self, url: &str, body: impl Into<String>) -> Result<Response, RequestError> {
        let options = RequestOptions {
            body: Some(body.into()),
            ..Default::default()
        };
        self.request(Method::POST, url, &options).await
    }

    pub async fn request(
        &self,
        method: Method,
        url: &str,
        options: &RequestOptions,
    ) -> Result<Response, RequestError> {
        let in_flight = InFlightRequest::start(&self.sink, &method, url);
        let (result, outcome) = self.client.execute(method, url, options).await;
        in_flight.complete();
        self.sink.request(result);
        outcome
    }

    /// Tallies a named assertion and hands the verdict back.
    pub fn check(&self, name: &str, passed: bool) -> bool {
        self.sink.check(name, passed);
        passed
    }

    /// Records a result produced outside the built-in client.
    pub fn record(&self, result: RequestResult) {
        self.sink.request(result);
    }
}

/// A request whose future is dropped before the response arrives (the VU was aborted)
/// is still recorded, as a failed result lasting at least as long as it ran.
struct InFlightRequest {
    sink: MetricsSink,
    method: Method,
    url: String,
    started: Instant,
    completed: bool,
}

impl InFlightRequest {
    fn start(sink: &MetricsSink, method: &Method, url: &str) -> Self {
        Self {
            sink: sink.clone(),
            method: method.clone(),
            url: url.to_string(),
            started: Instant::now(),
            completed: false,
        }
    }

    fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for InFlightRequest {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let mut result = RequestResult::new(
            self.method.clone(),
            std::mem::take(&mut self.url),
            0,
            self.started.elapsed(),
        );
        result.error = Some("request interrupted before completion".to_string());
        self.sink.request(result);
    }
}

// =============================================================================
// Config-driven scenario
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckCondition {
    Status(u16),
    MaxDuration(Duration),
    BodyContains(String),
}

impl CheckCondition {
    /// A request that never produced a response fails every check.
    pub fn holds(&self, outcome: &Result<Response, RequestError>) -> bool {
        let Ok(response) = outcome else {
            return false;
        };
        match self {
            CheckCondition::Status(expected) => response.status == *expected,
            CheckCondition::MaxDuration(limit) => response.duration < *limit,
            CheckCondition::BodyContains(needle) => response.body.contains(needle.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub name: String,
    pub condition: CheckCondition,
}

#[derive(Debug, Clone)]
pub struct RequestStep {
    pub method: Method,
    pub url: String,
    pub options: RequestOptions,
    pub checks: Vec<Check>,
}

/// Issues its steps in order, running the checks attached to each.
#[derive(Debug, Clone)]
pub struct HttpScenario {
    steps: Vec<RequestStep>,
}

impl HttpScenario {
    pub fn new(steps: Vec<RequestStep>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[RequestStep] {
        &self.steps
    }
}

impl Scenario for HttpScenario {
    fn iterate<'a>(&'a self, ctx: &'a mut VuContext) -> BoxFuture<'a, ()> {
        async move {
            for step in &self.steps {
                let outcome = ctx.request(step.method.clone(), &step.url, &step.options).await;
                if let Err(e) = &outcome {
                    debug!("VU {} {} {}: {}", ctx.id(), step.method, step.url, e);
                }
                for check in &step.checks {
                    ctx.check(&check.name, check.condition.holds(&outcome));
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DEFAULT_REQUEST_TIMEOUT;
    use crate::metrics::{self, CheckTally, LiveCounters};
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn response(status: u16, ms: u64, body: &str) -> Result<Response, RequestError> {
        Ok(Response {
            status,
            duration: Duration::from_millis(ms),
            body: body.to_string(),
        })
    }

    #[test]
    fn check_conditions() {
        let ok = response(200, 120, r#"[{"id":1}]"#);
        assert!(CheckCondition::Status(200).holds(&ok));
        assert!(!CheckCondition::Status(201).holds(&ok));
        assert!(CheckCondition::MaxDuration(Duration::from_millis(500)).holds(&ok));
        assert!(!CheckCondition::MaxDuration(Duration::from_millis(120)).holds(&ok));
        assert!(CheckCondition::BodyContains("\"id\"".into()).holds(&ok));

        let failed = Err(RequestError::Connect("refused".into()));
        assert!(!CheckCondition::Status(200).holds(&failed));
        assert!(!CheckCondition::MaxDuration(Duration::from_secs(60)).holds(&failed));
    }

    #[tokio::test]
    async fn http_scenario_records_requests_and_checks() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/posts/v1/slow"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let status_ok = Check {
            name: "status is 200".to_string(),
            condition: CheckCondition::Status(200),
        };
        let fast = Check {
            name: "response time < 500ms".to_string(),
            condition: CheckCondition::MaxDuration(Duration::from_millis(500)),
        };
        let scenario = HttpScenario::new(vec![
            RequestStep {
                method: Method::GET,
                url: format!("{}/api/posts/v1/slow", server.uri()),
                options: RequestOptions::default(),
                checks: vec![status_ok.clone(), fast],
            },
            RequestStep {
                method: Method::GET,
                url: format!("{}/missing", server.uri()),
                options: RequestOptions::default(),
                checks: vec![status_ok],
            },
        ]);

        let (sink, aggregator) = metrics::channel(Arc::new(LiveCounters::default())).unwrap();
        let collector = aggregator.spawn();
        let client = HttpClient::new(DEFAULT_REQUEST_TIMEOUT).unwrap();
        let mut ctx = VuContext::new(0, client, sink);

        scenario.iterate(&mut ctx).await;
        scenario.iterate(&mut ctx).await;
        drop(ctx);

        let summary = collector
            .await
            .unwrap()
            .into_summary(Duration::from_secs(1), 1);

        assert_eq!(summary.http_reqs, 4);
        assert_eq!(summary.failed_requests, 2);
        assert_eq!(
            summary.checks["status is 200"],
            CheckTally {
                passes: 2,
                fails: 2
            }
        );
        assert_eq!(summary.checks["response time < 500ms"].passes, 2);
    }

    #[tokio::test]
    async fn interrupted_request_is_recorded_as_failed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let (sink, aggregator) = metrics::channel(Arc::new(LiveCounters::default())).unwrap();
        let collector = aggregator.spawn();
        let client = HttpClient::new(DEFAULT_REQUEST_TIMEOUT).unwrap();
        let ctx = VuContext::new(0, client, sink);

        let url = format!("{}/api/posts/v1/slow", server.uri());
        let cut_off = tokio::time::timeout(Duration::from_millis(200), ctx.get(&url)).await;
        assert!(cut_off.is_err());
        drop(ctx);

        let summary = collector
            .await
            .unwrap()
            .into_summary(Duration::from_secs(1), 1);

        assert_eq!(summary.http_reqs, 1);
        assert_eq!(summary.failed_requests, 1);
        assert!(summary.req_duration.min_ms() >= 190.0);
    }
}
