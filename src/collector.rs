//! Single-consumer collection of attempt records into a server report.
//!
//! Exactly one collector task runs per engine; it owns every running sum and
//! array, so no locking is involved. Workers are never back-pressured beyond
//! the result channel's capacity: successes past the record cap still update
//! the sums but are dropped from the arrays.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc::Receiver;

use crate::report::{AttemptRecord, ServerReport, MAX_RECORDED};

/// Drains the result channel until every worker is gone.
pub struct RecordCollector {
    rx: Receiver<AttemptRecord>,
    tally: Tally,
    limit: usize,
}

impl RecordCollector {
    /// `expected` is a capacity hint, typically the attempt budget.
    pub fn new(rx: Receiver<AttemptRecord>, expected: usize) -> Self {
        Self {
            rx,
            tally: Tally::with_capacity(expected.min(MAX_RECORDED)),
            limit: MAX_RECORDED,
        }
    }

    #[cfg(test)]
    fn with_limit(rx: Receiver<AttemptRecord>, expected: usize, limit: usize) -> Self {
        Self { rx, tally: Tally::with_capacity(expected.min(limit)), limit }
    }

    /// Consume records until the channel closes, then hand back the tally.
    pub async fn run(mut self) -> Tally {
        while let Some(record) = self.rx.recv().await {
            self.tally.absorb(record, self.limit);
        }
        self.tally
    }
}

/// Running sums and capped parallel arrays for one engine run.
#[derive(Debug, Default)]
pub struct Tally {
    num_ok: u64,
    sum_total: f64,
    sum_conn: f64,
    sum_dns: f64,
    sum_req: f64,
    sum_res: f64,
    sum_delay: f64,
    size_total: i64,
    lats: Vec<f64>,
    conn_lats: Vec<f64>,
    dns_lats: Vec<f64>,
    req_lats: Vec<f64>,
    res_lats: Vec<f64>,
    delay_lats: Vec<f64>,
    offsets: Vec<f64>,
    status_codes: Vec<u16>,
    errors: HashMap<String, u64>,
}

impl Tally {
    fn with_capacity(cap: usize) -> Self {
        Tally {
            lats: Vec::with_capacity(cap),
            conn_lats: Vec::with_capacity(cap),
            dns_lats: Vec::with_capacity(cap),
            req_lats: Vec::with_capacity(cap),
            res_lats: Vec::with_capacity(cap),
            delay_lats: Vec::with_capacity(cap),
            offsets: Vec::with_capacity(cap),
            status_codes: Vec::with_capacity(cap),
            ..Tally::default()
        }
    }

    fn absorb(&mut self, record: AttemptRecord, limit: usize) {
        if let Some(error) = record.error {
            *self.errors.entry(error).or_default() += 1;
            return;
        }

        self.num_ok += 1;
        self.sum_total += record.duration.as_secs_f64();
        self.sum_conn += record.conn_duration.as_secs_f64();
        self.sum_dns += record.dns_duration.as_secs_f64();
        self.sum_req += record.req_duration.as_secs_f64();
        self.sum_res += record.res_duration.as_secs_f64();
        self.sum_delay += record.delay_duration.as_secs_f64();

        if self.lats.len() < limit {
            self.lats.push(record.duration.as_secs_f64());
            self.conn_lats.push(record.conn_duration.as_secs_f64());
            self.dns_lats.push(record.dns_duration.as_secs_f64());
            self.req_lats.push(record.req_duration.as_secs_f64());
            self.res_lats.push(record.res_duration.as_secs_f64());
            self.delay_lats.push(record.delay_duration.as_secs_f64());
            self.offsets.push(record.offset.as_secs_f64());
            self.status_codes.push(record.status_code);
        }
        if record.content_length > 0 {
            self.size_total += record.content_length;
        }
    }

    /// Finalise the per-server report once the channel has been drained.
    pub fn finalize(self, total: Duration) -> ServerReport {
        let count = self.num_ok as f64;
        let secs = total.as_secs_f64();
        let mean = |sum: f64| if self.num_ok > 0 { sum / count } else { 0.0 };

        let fastest = if self.lats.is_empty() {
            0.0
        } else {
            self.lats.iter().copied().fold(f64::INFINITY, f64::min)
        };
        let slowest = self.lats.iter().copied().fold(0.0, f64::max);

        ServerReport {
            total_duration: total,
            avg_total: mean(self.sum_total),
            average: mean(self.sum_total),
            fastest,
            slowest,
            rps: if secs > 0.0 { count / secs } else { 0.0 },
            content_length: self.size_total,
            avg_conn: mean(self.sum_conn),
            avg_dns: mean(self.sum_dns),
            avg_req: mean(self.sum_req),
            avg_res: mean(self.sum_res),
            avg_delay: mean(self.sum_delay),
            lats: self.lats,
            conn_lats: self.conn_lats,
            dns_lats: self.dns_lats,
            req_lats: self.req_lats,
            res_lats: self.res_lats,
            delay_lats: self.delay_lats,
            offsets: self.offsets,
            status_codes: self.status_codes,
            errors: self.errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn success(millis: u64, status: u16, bytes: i64, offset_ms: u64) -> AttemptRecord {
        AttemptRecord {
            duration: Duration::from_millis(millis),
            conn_duration: Duration::from_millis(1),
            dns_duration: Duration::from_millis(2),
            req_duration: Duration::from_millis(3),
            delay_duration: Duration::from_millis(millis.saturating_sub(10)),
            res_duration: Duration::from_millis(4),
            status_code: status,
            content_length: bytes,
            offset: Duration::from_millis(offset_ms),
            error: None,
        }
    }

    #[tokio::test]
    async fn collects_successes_and_errors() {
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(RecordCollector::new(rx, 8).run());

        tx.send(success(100, 200, 64, 0)).await.unwrap();
        tx.send(success(300, 200, 64, 50)).await.unwrap();
        tx.send(AttemptRecord::failed(Duration::from_millis(60), "connect failed: refused"))
            .await
            .unwrap();
        tx.send(AttemptRecord::failed(Duration::from_millis(70), "connect failed: refused"))
            .await
            .unwrap();
        drop(tx);

        let report = handle.await.unwrap().finalize(Duration::from_secs(2));

        assert_eq!(report.lats.len(), 2);
        assert_eq!(report.errors["connect failed: refused"], 2);
        assert!((report.avg_total - 0.2).abs() < 1e-9);
        assert!((report.rps - 1.0).abs() < 1e-9);
        assert_eq!(report.content_length, 128);
        assert!((report.fastest - 0.1).abs() < 1e-9);
        assert!((report.slowest - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn parallel_arrays_stay_in_step() {
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(RecordCollector::new(rx, 8).run());

        for i in 0..5u64 {
            tx.send(success(10 + i, 200, 8, i * 10)).await.unwrap();
        }
        tx.send(AttemptRecord::failed(Duration::ZERO, "request timeout")).await.unwrap();
        drop(tx);

        let report = handle.await.unwrap().finalize(Duration::from_secs(1));
        let n = report.lats.len();
        assert_eq!(n, 5);
        assert_eq!(report.conn_lats.len(), n);
        assert_eq!(report.dns_lats.len(), n);
        assert_eq!(report.req_lats.len(), n);
        assert_eq!(report.res_lats.len(), n);
        assert_eq!(report.delay_lats.len(), n);
        assert_eq!(report.offsets.len(), n);
        assert_eq!(report.status_codes.len(), n);
        assert_eq!(n as u64 + report.errors.values().sum::<u64>(), 6);
    }

    #[tokio::test]
    async fn record_cap_drops_arrays_but_keeps_sums() {
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(RecordCollector::with_limit(rx, 2, 2).run());

        tx.send(success(100, 200, 10, 0)).await.unwrap();
        tx.send(success(200, 200, 10, 1)).await.unwrap();
        tx.send(success(600, 200, 10, 2)).await.unwrap();
        drop(tx);

        let report = handle.await.unwrap().finalize(Duration::from_secs(3));
        assert_eq!(report.lats.len(), 2);
        assert_eq!(report.status_codes.len(), 2);
        // The third success is dropped from the arrays, not from the mean.
        assert!((report.avg_total - 0.3).abs() < 1e-9);
        assert!((report.rps - 1.0).abs() < 1e-9);
        assert_eq!(report.content_length, 30);
    }

    #[tokio::test]
    async fn negative_content_length_is_not_summed() {
        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(RecordCollector::new(rx, 4).run());

        let mut unknown = success(50, 200, -1, 0);
        unknown.content_length = -1;
        tx.send(unknown).await.unwrap();
        tx.send(success(50, 200, 7, 1)).await.unwrap();
        drop(tx);

        let report = handle.await.unwrap().finalize(Duration::from_secs(1));
        assert_eq!(report.content_length, 7);
    }

    #[tokio::test]
    async fn empty_run_finalizes_to_zeroes() {
        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(RecordCollector::new(rx, 0).run());
        drop(tx);

        let report = handle.await.unwrap().finalize(Duration::from_secs(1));
        assert_eq!(report.lats.len(), 0);
        assert_eq!(report.avg_total, 0.0);
        assert_eq!(report.rps, 0.0);
    }
}
