//! Trace analysis: finds bottlenecks in recorded execution traces.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::config::MetaConfig;
use super::types::{BottleneckKind, BottleneckReport, Severity, TargetMetric};
use crate::decomposition::NodeId;
use crate::router::Role;
use crate::trace::{ReasonCode, TraceEvent, TraceRecord};

/// What one run contributed.
#[derive(Debug, Default)]
struct RunSummary {
    query: Option<String>,
    final_node: Option<NodeId>,
    answers: BTreeMap<NodeId, String>,
    tripped: bool,
}

/// Per-role samples across runs.
#[derive(Debug, Default)]
struct RoleSamples {
    latencies_ms: Vec<f64>,
    utilization: Vec<f64>,
    runs: Vec<String>,
}

/// Levenshtein distance over chars.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Edit distance divided by the longer length; 0 for two empty strings.
pub fn normalized_edit_distance(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 0.0;
    }
    levenshtein(a, b) as f64 / longest as f64
}

/// Mean pairwise normalized edit distance; 0 with fewer than two answers.
pub fn answer_variance(answers: &[String]) -> f64 {
    let mut total = 0.0;
    let mut pairs = 0usize;
    for (i, a) in answers.iter().enumerate() {
        for b in &answers[i + 1..] {
            total += normalized_edit_distance(a, b);
            pairs += 1;
        }
    }
    if pairs == 0 {
        0.0
    } else {
        total / pairs as f64
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Analyze a batch of trace records, most severe finding first.
pub fn analyze_traces(traces: &[TraceRecord], config: &MetaConfig) -> Vec<BottleneckReport> {
    let mut runs: BTreeMap<&str, RunSummary> = BTreeMap::new();
    let mut roles: BTreeMap<Role, RoleSamples> = BTreeMap::new();

    for record in traces {
        let run = runs.entry(record.run_id.as_str()).or_default();
        if let Some(node) = record.node {
            run.final_node = Some(run.final_node.map_or(node, |n| n.max(node)));
        }
        match record.event {
            TraceEvent::QueryStarted => run.query = record.detail.clone(),
            TraceEvent::BreakerTripped => run.tripped = true,
            TraceEvent::QueryFinished if record.reason == Some(ReasonCode::CircuitBreakerTrip) => {
                run.tripped = true
            }
            TraceEvent::RoleCompleted => {
                if let (Some(role), Some(ms)) = (record.role, record.duration_ms) {
                    let samples = roles.entry(role).or_default();
                    samples.latencies_ms.push(ms as f64);
                    samples.runs.push(record.run_id.clone());
                }
                if let (Some(Role::Rewriter), Some(node), Some(output)) =
                    (record.role, record.node, &record.role_output)
                {
                    run.answers.insert(node, output.text.clone());
                }
            }
            TraceEvent::RoleRouted => {
                if let (Some(role), Some(alloc)) = (record.role, &record.allocation) {
                    if alloc.budget_tokens > 0 {
                        roles
                            .entry(role)
                            .or_default()
                            .utilization
                            .push(alloc.total_selected_tokens as f64 / alloc.budget_tokens as f64);
                    }
                }
            }
            _ => {}
        }
    }

    let mut reports = Vec::new();

    for (role, samples) in &roles {
        let evidence: Vec<String> = samples
            .runs
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if samples.latencies_ms.len() >= config.min_samples {
            let observed = mean(&samples.latencies_ms);
            if observed > config.latency_threshold_ms {
                reports.push(BottleneckReport {
                    kind: BottleneckKind::SlowRole { role: *role },
                    severity: Severity::from_ratio(observed / config.latency_threshold_ms),
                    metric: TargetMetric::Latency,
                    observed,
                    threshold: config.latency_threshold_ms,
                    sample_count: samples.latencies_ms.len(),
                    evidence: evidence.clone(),
                    dominant_reason: None,
                });
            }
        }

        if samples.utilization.len() >= config.min_samples {
            let observed = mean(&samples.utilization);
            if observed >= config.token_utilization_threshold {
                reports.push(BottleneckReport {
                    kind: BottleneckKind::TokenHeavy { role: *role },
                    severity: Severity::from_ratio(observed / config.token_utilization_threshold),
                    metric: TargetMetric::TokenUsage,
                    observed,
                    threshold: config.token_utilization_threshold,
                    sample_count: samples.utilization.len(),
                    evidence,
                    dominant_reason: None,
                });
            }
        }
    }

    // Final answers grouped by query text.
    let mut by_query: BTreeMap<&str, (Vec<String>, Vec<String>)> = BTreeMap::new();
    for (run_id, run) in &runs {
        let answer = run.final_node.and_then(|n| run.answers.get(&n));
        if let (Some(query), Some(answer)) = (run.query.as_deref(), answer) {
            let entry = by_query.entry(query).or_default();
            entry.0.push(answer.clone());
            entry.1.push(run_id.to_string());
        }
    }
    let repeated: Vec<&(Vec<String>, Vec<String>)> =
        by_query.values().filter(|(answers, _)| answers.len() >= 2).collect();
    let sample_count: usize = repeated.iter().map(|(a, _)| a.len()).sum();
    if sample_count >= config.min_samples {
        let observed = mean(&repeated.iter().map(|(a, _)| answer_variance(a)).collect::<Vec<_>>());
        if observed > config.variance_threshold {
            reports.push(BottleneckReport {
                kind: BottleneckKind::AnswerVariance,
                severity: Severity::from_ratio(observed / config.variance_threshold.max(f64::EPSILON)),
                metric: TargetMetric::Variance,
                observed,
                threshold: config.variance_threshold,
                sample_count,
                evidence: repeated.iter().flat_map(|(_, r)| r.iter().cloned()).collect(),
                dominant_reason: None,
            });
        }
    }

    if runs.len() >= config.min_samples {
        let tripped: Vec<String> = runs
            .iter()
            .filter(|(_, r)| r.tripped)
            .map(|(id, _)| id.to_string())
            .collect();
        let observed = tripped.len() as f64 / runs.len() as f64;
        if observed > config.breaker_trip_rate {
            reports.push(BottleneckReport {
                kind: BottleneckKind::BreakerTrips,
                severity: Severity::from_ratio(observed / config.breaker_trip_rate.max(f64::EPSILON)),
                metric: TargetMetric::Latency,
                observed,
                threshold: config.breaker_trip_rate,
                sample_count: runs.len(),
                evidence: tripped,
                dominant_reason: Some(ReasonCode::CircuitBreakerTrip),
            });
        }
    }

    reports.sort_by(|a, b| b.severity.cmp(&a.severity));
    debug!(
        runs = runs.len(),
        records = traces.len(),
        findings = reports.len(),
        "Trace analysis complete"
    );
    reports
}
