use crate::error::ConfigError;
use crate::metrics::{
    Summary, CHECKS, HTTP_REQS, HTTP_REQ_DURATION, HTTP_REQ_FAILED, ITERATIONS,
    ITERATION_DURATION, VUS_MAX,
};
use std::fmt;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Distribution of durations, in milliseconds.
    Trend,
    /// Fraction of non-zero samples.
    Rate,
    Counter,
    Gauge,
}

impl MetricKind {
    pub fn of(metric: &str) -> Option<Self> {
        match metric {
            HTTP_REQ_DURATION | ITERATION_DURATION => Some(MetricKind::Trend),
            HTTP_REQ_FAILED | CHECKS => Some(MetricKind::Rate),
            HTTP_REQS | ITERATIONS => Some(MetricKind::Counter),
            VUS_MAX => Some(MetricKind::Gauge),
            _ => None,
        }
    }

    fn accepts(self, aggregation: Aggregation) -> bool {
        use Aggregation::*;
        match self {
            MetricKind::Trend => matches!(aggregation, Avg | Min | Max | Med | Percentile(_)),
            MetricKind::Rate => matches!(aggregation, Rate),
            MetricKind::Counter => matches!(aggregation, Count | Rate),
            MetricKind::Gauge => matches!(aggregation, Value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    Avg,
    Min,
    Max,
    Med,
    /// `p(95)` or `p95`; value in `0.0..=100.0`.
    Percentile(f64),
    Count,
    Rate,
    Value,
}

impl Aggregation {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "avg" => return Some(Aggregation::Avg),
            "min" => return Some(Aggregation::Min),
            "max" => return Some(Aggregation::Max),
            "med" => return Some(Aggregation::Med),
            "count" => return Some(Aggregation::Count),
            "rate" => return Some(Aggregation::Rate),
            "value" => return Some(Aggregation::Value),
            _ => {}
        }

        let rest = token.strip_prefix('p')?;
        let number = rest
            .strip_prefix('(')
            .and_then(|r| r.strip_suffix(')'))
            .unwrap_or(rest);
        let percentile: f64 = number.parse().ok()?;
        (0.0..=100.0)
            .contains(&percentile)
            .then_some(Aggregation::Percentile(percentile))
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Avg => write!(f, "avg"),
            Aggregation::Min => write!(f, "min"),
            Aggregation::Max => write!(f, "max"),
            Aggregation::Med => write!(f, "med"),
            Aggregation::Percentile(p) => write!(f, "p({})", p),
            Aggregation::Count => write!(f, "count"),
            Aggregation::Rate => write!(f, "rate"),
            Aggregation::Value => write!(f, "value"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Operator {
    // Two-character operators first so `<=` is not read as `<`.
    const TOKENS: [(&'static str, Operator); 6] = [
        ("<=", Operator::Le),
        (">=", Operator::Ge),
        ("==", Operator::Eq),
        ("!=", Operator::Ne),
        ("<", Operator::Lt),
        (">", Operator::Gt),
    ];

    fn symbol(self) -> &'static str {
        Self::TOKENS
            .iter()
            .find(|(_, op)| *op == self)
            .map(|(symbol, _)| *symbol)
            .unwrap_or("?")
    }

    fn compare(self, actual: f64, bound: f64) -> bool {
        match self {
            Operator::Lt => actual < bound,
            Operator::Le => actual <= bound,
            Operator::Gt => actual > bound,
            Operator::Ge => actual >= bound,
            Operator::Eq => (actual - bound).abs() < f64::EPSILON,
            Operator::Ne => (actual - bound).abs() >= f64::EPSILON,
        }
    }
}

/// Pass/fail predicate over one aggregated metric, e.g. `http_req_duration: p(95)<500`.
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub metric: String,
    pub aggregation: Aggregation,
    pub operator: Operator,
    pub bound: f64,
    pub source: String,
}

impl Threshold {
    pub fn parse(metric: &str, expr: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::Threshold {
            metric: metric.to_string(),
            expr: expr.to_string(),
            reason: reason.to_string(),
        };

        let kind = MetricKind::of(metric).ok_or_else(|| invalid("unknown metric"))?;

        let compact: String = expr.chars().filter(|c| !c.is_whitespace()).collect();
        let position = compact
            .find(|c: char| matches!(c, '<' | '>' | '=' | '!'))
            .ok_or_else(|| invalid("missing comparison operator"))?;
        let (left, right) = compact.split_at(position);

        let (symbol, operator) = Operator::TOKENS
            .iter()
            .find(|(symbol, _)| right.starts_with(symbol))
            .copied()
            .ok_or_else(|| invalid("unknown comparison operator"))?;

        let aggregation = Aggregation::parse(left)
            .ok_or_else(|| invalid("unknown aggregation, expected avg/min/max/med/p(N)/count/rate/value"))?;
        if !kind.accepts(aggregation) {
            return Err(invalid(&format!(
                "aggregation '{}' does not apply to this metric",
                aggregation
            )));
        }

        let bound: f64 = right[symbol.len()..]
            .parse()
            .map_err(|_| invalid("bound is not a number"))?;
        if !bound.is_finite() {
            return Err(invalid("bound must be finite"));
        }

        Ok(Self {
            metric: metric.to_string(),
            aggregation,
            operator,
            bound,
            source: expr.trim().to_string(),
        })
    }

    /// Current value of the aggregated metric this threshold watches.
    pub fn actual(&self, summary: &Summary) -> f64 {
        let trend = match self.metric.as_str() {
            HTTP_REQ_DURATION => Some(&summary.req_duration),
            ITERATION_DURATION => Some(&summary.iteration_duration),
            _ => None,
        };

        if let Some(trend) = trend {
            return match self.aggregation {
                Aggregation::Avg => trend.avg_ms(),
                Aggregation::Min => trend.min_ms(),
                Aggregation::Max => trend.max_ms(),
                Aggregation::Med => trend.med_ms(),
                Aggregation::Percentile(p) => trend.percentile_ms(p),
                _ => 0.0,
            };
        }

        match (self.metric.as_str(), self.aggregation) {
            (HTTP_REQ_FAILED, _) => summary.failed_rate(),
            (CHECKS, _) => summary.checks_total().rate(),
            (HTTP_REQS, Aggregation::Rate) => summary.per_second(summary.http_reqs),
            (HTTP_REQS, _) => summary.http_reqs as f64,
            (ITERATIONS, Aggregation::Rate) => summary.per_second(summary.iterations),
            (ITERATIONS, _) => summary.iterations as f64,
            (VUS_MAX, _) => summary.vus_max as f64,
            _ => 0.0,
        }
    }

    /// Whether the metric collected anything a verdict can rest on. Counters and
    /// gauges always have a value; a trend or rate without samples does not.
    pub fn has_data(&self, summary: &Summary) -> bool {
        match self.metric.as_str() {
            HTTP_REQ_DURATION => summary.req_duration.count() > 0,
            ITERATION_DURATION => summary.iteration_duration.count() > 0,
            HTTP_REQ_FAILED => summary.http_reqs > 0,
            CHECKS => summary.checks_total().total() > 0,
            _ => true,
        }
    }

    /// A threshold over a metric with no data fails.
    pub fn evaluate(&self, summary: &Summary) -> ThresholdOutcome {
        let actual = self.actual(summary);
        let no_data = !self.has_data(summary);
        if no_data {
            warn!("Threshold '{}' has no data", self);
        }
        ThresholdOutcome {
            threshold: self.clone(),
            actual,
            passed: !no_data && self.operator.compare(actual, self.bound),
            no_data,
        }
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}{}{}",
            self.metric,
            self.aggregation,
            self.operator.symbol(),
            self.bound
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdOutcome {
    pub threshold: Threshold,
    pub actual: f64,
    pub passed: bool,
    pub no_data: bool,
}

pub fn evaluate_all(thresholds: &[Threshold], summary: &Summary) -> Vec<ThresholdOutcome> {
    thresholds.iter().map(|t| t.evaluate(summary)).collect()
}
