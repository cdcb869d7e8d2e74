use crate::harness::RunOutcome;
use crate::metrics::{
    Summary, Trend, HTTP_REQS, HTTP_REQ_DURATION, HTTP_REQ_FAILED, ITERATIONS,
    ITERATION_DURATION, VUS_MAX,
};
use tracing::info;

const LABEL_WIDTH: usize = 22;

/// End-of-run report, one line per entry.
pub fn summary_lines(outcome: &RunOutcome) -> Vec<String> {
    let summary = &outcome.summary;
    let mut lines = vec![
        "╔════════════════════════════════════════════════════════════╗".to_string(),
        "║                     LOAD TEST SUMMARY                      ║".to_string(),
        "╚════════════════════════════════════════════════════════════╝".to_string(),
        String::new(),
    ];

    if !summary.checks.is_empty() {
        lines.push("Checks:".to_string());
        for (name, tally) in &summary.checks {
            let mark = if tally.fails == 0 { "✓" } else { "✗" };
            lines.push(format!(
                "  {} {}: {:.2}% ({}/{})",
                mark,
                name,
                tally.rate() * 100.0,
                tally.passes,
                tally.total()
            ));
        }
        lines.push(String::new());
    }

    lines.push("Metrics:".to_string());
    lines.push(metric_line(HTTP_REQ_DURATION, &trend_stats(&summary.req_duration)));
    lines.push(metric_line(
        HTTP_REQ_FAILED,
        &format!(
            "{:.2}% ({}/{})",
            summary.failed_rate() * 100.0,
            summary.failed_requests,
            summary.http_reqs
        ),
    ));
    lines.push(metric_line(HTTP_REQS, &counter_stats(summary, summary.http_reqs)));
    lines.push(metric_line(
        ITERATION_DURATION,
        &trend_stats(&summary.iteration_duration),
    ));
    lines.push(metric_line(ITERATIONS, &counter_stats(summary, summary.iterations)));
    if summary.interrupted_iterations > 0 {
        lines.push(metric_line(
            "interrupted_iterations",
            &summary.interrupted_iterations.to_string(),
        ));
    }
    lines.push(metric_line(VUS_MAX, &summary.vus_max.to_string()));
    lines.push(String::new());

    if !outcome.thresholds.is_empty() {
        lines.push("Thresholds:".to_string());
        for t in &outcome.thresholds {
            let mark = if t.passed { "✓" } else { "✗" };
            let actual = if t.no_data {
                "no data".to_string()
            } else {
                format!("actual: {:.2}", t.actual)
            };
            lines.push(format!(
                "  {} {}: {} ({})",
                mark, t.threshold.metric, t.threshold.source, actual
            ));
        }
        lines.push(String::new());
    }

    lines.push(format!(
        "Verdict: {} after {:.1}s",
        if outcome.passed() { "PASS" } else { "FAIL" },
        summary.elapsed.as_secs_f64()
    ));
    lines.push("═══════════════════════════════════════════════════════════".to_string());
    lines
}

pub fn print_summary(outcome: &RunOutcome) {
    for line in summary_lines(outcome) {
        info!("{}", line);
    }
}

fn metric_line(name: &str, value: &str) -> String {
    format!("  {:.<width$}: {}", name, value, width = LABEL_WIDTH)
}

fn trend_stats(trend: &Trend) -> String {
    if trend.count() == 0 {
        return "no data".to_string();
    }
    format!(
        "avg={:.2}ms min={:.2}ms med={:.2}ms max={:.2}ms p(90)={:.2}ms p(95)={:.2}ms p(99)={:.2}ms",
        trend.avg_ms(),
        trend.min_ms(),
        trend.med_ms(),
        trend.max_ms(),
        trend.percentile_ms(90.0),
        trend.percentile_ms(95.0),
        trend.percentile_ms(99.0),
    )
}

fn counter_stats(summary: &Summary, count: u64) -> String {
    format!("{} ({:.2}/s)", count, summary.per_second(count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CheckTally;
    use crate::threshold::Threshold;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn outcome(p95_bound: &str) -> RunOutcome {
        let mut req_duration = Trend::new().unwrap();
        for _ in 0..100 {
            req_duration.record(Duration::from_millis(50));
        }
        let mut checks = BTreeMap::new();
        checks.insert(
            "status is 200".to_string(),
            CheckTally {
                passes: 100,
                fails: 0,
            },
        );
        let summary = Summary {
            req_duration,
            iteration_duration: Trend::new().unwrap(),
            http_reqs: 100,
            failed_requests: 0,
            iterations: 100,
            interrupted_iterations: 0,
            checks,
            vus_max: 10,
            elapsed: Duration::from_secs(40),
        };
        let threshold = Threshold::parse("http_req_duration", p95_bound).unwrap();
        RunOutcome {
            thresholds: vec![threshold.evaluate(&summary)],
            summary,
        }
    }

    #[test]
    fn passing_report() {
        let lines = summary_lines(&outcome("p(95)<500"));

        assert!(lines.iter().any(|l| l == "  ✓ status is 200: 100.00% (100/100)"));
        assert!(lines.iter().any(|l| l.starts_with("  http_reqs.............: 100 (2.50/s)")));
        assert!(lines.iter().any(|l| l.contains("iteration_duration") && l.ends_with("no data")));
        assert!(lines.iter().any(|l| l.starts_with("  ✓ http_req_duration: p(95)<500")));
        assert!(lines.iter().any(|l| l.starts_with("Verdict: PASS")));
    }

    #[test]
    fn failing_report() {
        let lines = summary_lines(&outcome("p(95)<20"));

        assert!(lines.iter().any(|l| l.starts_with("  ✗ http_req_duration: p(95)<20")));
        assert!(lines.iter().any(|l| l.starts_with("Verdict: FAIL")));
    }

    #[test]
    fn threshold_without_data_is_reported() {
        let mut outcome = outcome("p(95)<500");
        let empty = Threshold::parse("iteration_duration", "avg<2000").unwrap();
        outcome.thresholds.push(empty.evaluate(&outcome.summary));
        outcome.summary.interrupted_iterations = 3;

        let lines = summary_lines(&outcome);
        assert!(lines
            .iter()
            .any(|l| l == "  ✗ iteration_duration: avg<2000 (no data)"));
        assert!(lines.iter().any(|l| l.contains("interrupted_iterations") && l.ends_with(": 3")));
        assert!(lines.iter().any(|l| l.starts_with("Verdict: FAIL")));
    }
}
