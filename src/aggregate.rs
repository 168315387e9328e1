//! Merging per-server measurement sets into the fleet-wide report.

use crate::report::{Bucket, LatencyDistribution, Report, ServerReport};

/// Target percentiles for the latency distribution.
const PERCENTILES: [u8; 7] = [10, 25, 50, 75, 90, 95, 99];
const BUCKET_COUNT: usize = 10;

/// Merge `K` server reports.
///
/// Average fields and the request rate are arithmetic means over the fleet;
/// arrays concatenate; latency arrays are sorted in place for the min/max,
/// percentile and histogram passes. Server-side errors are folded into the
/// error distribution rather than discarding the report.
pub fn merge(reports: &[ServerReport]) -> Report {
    let mut report = Report::default();
    if reports.is_empty() {
        return report;
    }

    let k = reports.len() as f64;
    let mean = |field: fn(&ServerReport) -> f64| reports.iter().map(field).sum::<f64>() / k;
    report.avg_total = mean(|r| r.avg_total);
    report.avg_conn = mean(|r| r.avg_conn);
    report.avg_dns = mean(|r| r.avg_dns);
    report.avg_req = mean(|r| r.avg_req);
    report.avg_res = mean(|r| r.avg_res);
    report.avg_delay = mean(|r| r.avg_delay);
    report.rps = mean(|r| r.rps);
    report.size_total = reports.iter().map(|r| r.content_length).sum();
    report.total = reports
        .iter()
        .map(|r| r.total_duration)
        .max()
        .unwrap_or_default();

    for server in reports {
        report.lats.extend_from_slice(&server.lats);
        report.conn_lats.extend_from_slice(&server.conn_lats);
        report.dns_lats.extend_from_slice(&server.dns_lats);
        report.req_lats.extend_from_slice(&server.req_lats);
        report.res_lats.extend_from_slice(&server.res_lats);
        report.delay_lats.extend_from_slice(&server.delay_lats);
        report.offsets.extend_from_slice(&server.offsets);
        report.status_codes.extend_from_slice(&server.status_codes);
        for (error, count) in &server.errors {
            *report.error_dist.entry(error.clone()).or_default() += count;
        }
    }
    report.num_res = report.lats.len() as u64 + report.error_dist.values().sum::<u64>();

    for &code in &report.status_codes {
        *report.status_code_dist.entry(code).or_default() += 1;
    }

    if report.lats.is_empty() {
        return report;
    }

    report.lats.sort_unstable_by(f64::total_cmp);
    report.fastest = report.lats[0];
    report.slowest = report.lats[report.lats.len() - 1];

    (report.conn_min, report.conn_max) = sorted_bounds(&mut report.conn_lats);
    (report.dns_min, report.dns_max) = sorted_bounds(&mut report.dns_lats);
    (report.req_min, report.req_max) = sorted_bounds(&mut report.req_lats);
    (report.res_min, report.res_max) = sorted_bounds(&mut report.res_lats);
    (report.delay_min, report.delay_max) = sorted_bounds(&mut report.delay_lats);

    report.latency_distribution = latency_distribution(&report.lats);
    report.histogram = histogram(&report.lats, report.fastest, report.slowest);

    report
}

fn sorted_bounds(values: &mut [f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    values.sort_unstable_by(f64::total_cmp);
    (values[0], values[values.len() - 1])
}

/// Walk the sorted latencies once against the fixed percentile list; the
/// first index whose rank reaches a target supplies its latency.
/// Non-positive picks are omitted.
fn latency_distribution(sorted: &[f64]) -> Vec<LatencyDistribution> {
    let mut picks = [0.0f64; PERCENTILES.len()];
    let mut target = 0;
    for (i, &latency) in sorted.iter().enumerate() {
        if target >= PERCENTILES.len() {
            break;
        }
        let rank = i * 100 / sorted.len();
        if rank >= PERCENTILES[target] as usize {
            picks[target] = latency;
            target += 1;
        }
    }
    PERCENTILES
        .iter()
        .zip(picks)
        .filter(|&(_, latency)| latency > 0.0)
        .map(|(&percentage, latency)| LatencyDistribution { percentage, latency })
        .collect()
}

/// Ten equal-width buckets over `[fastest, slowest]` plus the closing mark
/// at `slowest`; each latency lands in the first bucket whose mark it does
/// not exceed.
fn histogram(sorted: &[f64], fastest: f64, slowest: f64) -> Vec<Bucket> {
    let width = (slowest - fastest) / BUCKET_COUNT as f64;
    let mut marks = [0.0f64; BUCKET_COUNT + 1];
    for (i, mark) in marks.iter_mut().enumerate().take(BUCKET_COUNT) {
        *mark = fastest + width * i as f64;
    }
    marks[BUCKET_COUNT] = slowest;

    let mut counts = [0u64; BUCKET_COUNT + 1];
    let mut bucket = 0;
    let mut i = 0;
    while i < sorted.len() {
        if sorted[i] <= marks[bucket] {
            counts[bucket] += 1;
            i += 1;
        } else if bucket < BUCKET_COUNT {
            bucket += 1;
        } else {
            break;
        }
    }

    marks
        .iter()
        .zip(counts)
        .map(|(&mark, count)| Bucket {
            mark,
            count,
            frequency: count as f64 / sorted.len() as f64,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn server(lats: &[f64], total_secs: u64) -> ServerReport {
        let n = lats.len();
        ServerReport {
            total_duration: Duration::from_secs(total_secs),
            avg_total: lats.iter().sum::<f64>() / n.max(1) as f64,
            rps: n as f64 / total_secs.max(1) as f64,
            content_length: (n * 100) as i64,
            lats: lats.to_vec(),
            conn_lats: vec![0.01; n],
            dns_lats: vec![0.001; n],
            req_lats: vec![0.002; n],
            res_lats: vec![0.02; n],
            delay_lats: vec![0.05; n],
            offsets: (0..n).map(|i| i as f64 * 0.1).collect(),
            status_codes: vec![200; n],
            ..ServerReport::default()
        }
    }

    #[test]
    fn merges_two_servers_with_the_documented_histogram() {
        let merged = merge(&[server(&[0.1, 0.2], 1), server(&[0.3, 0.4], 1)]);

        assert_eq!(merged.fastest, 0.1);
        assert_eq!(merged.slowest, 0.4);
        assert_eq!(merged.lats, vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(merged.histogram.len(), 11);
        assert!((merged.histogram[0].mark - 0.1).abs() < 1e-9);
        assert!((merged.histogram[10].mark - 0.4).abs() < 1e-9);
        assert_eq!(merged.histogram.iter().map(|b| b.count).sum::<u64>(), 4);
        // Marks are strictly monotone when slowest > fastest.
        assert!(merged.histogram.windows(2).all(|w| w[0].mark < w[1].mark));
        let freq: f64 = merged.histogram.iter().map(|b| b.frequency).sum();
        assert!((freq - 1.0).abs() < 1e-9);
    }

    #[test]
    fn single_report_merge_is_an_identity() {
        let single = server(&[0.1, 0.2, 0.3], 2);
        let merged = merge(std::slice::from_ref(&single));

        assert_eq!(merged.lats, single.lats);
        assert_eq!(merged.offsets, single.offsets);
        assert_eq!(merged.total, single.total_duration);
        assert_eq!(merged.status_code_dist[&200], 3);
        assert_eq!(merged.num_res, 3);
        assert!((merged.rps - single.rps).abs() < 1e-9);
    }

    #[test]
    fn identical_reports_average_to_themselves() {
        let one = server(&[0.1, 0.3], 4);
        let merged = merge(&[one.clone(), one.clone(), one.clone()]);

        assert!((merged.avg_total - one.avg_total).abs() < 1e-9);
        assert!((merged.rps - one.rps).abs() < 1e-9);
        assert_eq!(merged.size_total, 3 * one.content_length);
        assert_eq!(merged.total, one.total_duration);
        assert_eq!(merged.lats.len(), 6);
    }

    #[test]
    fn rps_is_the_mean_of_server_rates() {
        let mut fast = server(&[0.1], 1);
        fast.rps = 20.0;
        let mut slow = server(&[0.2], 1);
        slow.rps = 10.0;
        assert!((merge(&[fast, slow]).rps - 15.0).abs() < 1e-9);
    }

    #[test]
    fn phase_bounds_are_ordered() {
        let mut a = server(&[0.1, 0.2], 1);
        a.conn_lats = vec![0.05, 0.01];
        let mut b = server(&[0.3], 1);
        b.conn_lats = vec![0.03];
        let merged = merge(&[a, b]);

        assert_eq!(merged.conn_min, 0.01);
        assert_eq!(merged.conn_max, 0.05);
        assert!(merged.conn_min <= merged.conn_max);
        assert!(merged.dns_min <= merged.dns_max);
        assert!(merged.req_min <= merged.req_max);
        assert!(merged.res_min <= merged.res_max);
        assert!(merged.delay_min <= merged.delay_max);
    }

    #[test]
    fn percentiles_are_non_decreasing_and_positive() {
        let lats: Vec<f64> = (1..=100).map(|i| i as f64 / 100.0).collect();
        let merged = merge(&[server(&lats, 10)]);

        let dist = &merged.latency_distribution;
        assert!(!dist.is_empty());
        assert!(dist.windows(2).all(|w| w[0].latency <= w[1].latency));
        assert!(dist.windows(2).all(|w| w[0].percentage < w[1].percentage));
        assert!(dist.iter().all(|entry| entry.latency > 0.0));
        // With 100 evenly spaced samples the walk lands on the targets.
        let p50 = dist.iter().find(|e| e.percentage == 50).unwrap();
        assert!((p50.latency - 0.51).abs() < 1e-9);
    }

    #[test]
    fn server_errors_are_attached_not_fatal() {
        let healthy = server(&[0.1, 0.2], 1);
        let mut broken = ServerReport::default();
        broken
            .errors
            .insert("connect failed: refused".to_string(), 5);

        let merged = merge(&[healthy, broken]);
        assert_eq!(merged.lats.len(), 2);
        assert_eq!(merged.error_dist["connect failed: refused"], 5);
        assert_eq!(merged.num_res, 7);
        assert!(merged.fastest > 0.0);
    }

    #[test]
    fn all_error_fleet_yields_empty_stats_with_errors() {
        let mut broken = ServerReport::default();
        broken.errors.insert("request timeout".to_string(), 3);
        let merged = merge(&[broken]);

        assert!(merged.lats.is_empty());
        assert!(merged.histogram.is_empty());
        assert_eq!(merged.error_dist["request timeout"], 3);
    }

    #[test]
    fn empty_input_yields_an_empty_report() {
        let merged = merge(&[]);
        assert_eq!(merged.num_res, 0);
        assert!(merged.lats.is_empty());
        assert!(merged.histogram.is_empty());
    }

    #[test]
    fn degenerate_histogram_when_all_latencies_equal() {
        let merged = merge(&[server(&[0.2, 0.2, 0.2], 1)]);
        assert_eq!(merged.histogram.len(), 11);
        assert_eq!(merged.histogram[0].count, 3);
        assert_eq!(merged.histogram.iter().map(|b| b.count).sum::<u64>(), 3);
    }

    #[test]
    fn zero_latencies_are_omitted_from_the_distribution() {
        let merged = merge(&[server(&[0.0, 0.0, 0.5], 1)]);
        assert!(merged.latency_distribution.iter().all(|e| e.latency > 0.0));
    }
}
