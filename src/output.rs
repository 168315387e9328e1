//! Rendering of the merged report: a human-readable summary and a
//! per-request CSV dump.

use std::cmp::Reverse;
use std::io::Write;

use clap::ValueEnum;
use crossterm::style::{StyledContent, Stylize};
use itertools::Itertools;

use crate::report::Report;
use crate::util::IntoAdjustedByte;

const BAR_CHAR: &str = "■";
const BAR_WIDTH: usize = 40;

/// Output selector for the coordinator (`-o`).
#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable summary.
    Summary,
    /// Per-request metrics in comma-separated values format.
    Csv,
}

pub trait ReportPrinter {
    fn print(&self, w: &mut dyn Write, report: &Report) -> anyhow::Result<()>;
}

pub fn printer(format: OutputFormat) -> Box<dyn ReportPrinter> {
    match format {
        OutputFormat::Summary => Box::new(SummaryPrinter),
        OutputFormat::Csv => Box::new(CsvPrinter),
    }
}

pub struct SummaryPrinter;

impl ReportPrinter for SummaryPrinter {
    fn print(&self, w: &mut dyn Write, report: &Report) -> anyhow::Result<()> {
        if report.lats.is_empty() {
            writeln!(w, "No responses collected.")?;
            print_errors(w, report)?;
            return Ok(());
        }

        print_summary(w, report)?;
        writeln!(w)?;
        print_histogram(w, report)?;
        writeln!(w)?;
        print_latencies(w, report)?;
        writeln!(w)?;
        print_details(w, report)?;
        writeln!(w)?;
        print_status(w, report)?;
        print_errors(w, report)?;
        Ok(())
    }
}

pub struct CsvPrinter;

impl ReportPrinter for CsvPrinter {
    fn print(&self, w: &mut dyn Write, report: &Report) -> anyhow::Result<()> {
        writeln!(
            w,
            "response-time,DNS+dialup,DNS,Request-write,Response-delay,Response-read,status-code,offset"
        )?;
        for i in 0..report.lats.len() {
            writeln!(
                w,
                "{:.4},{:.4},{:.4},{:.4},{:.4},{:.4},{},{:.4}",
                report.lats[i],
                report.conn_lats[i],
                report.dns_lats[i],
                report.req_lats[i],
                report.delay_lats[i],
                report.res_lats[i],
                report.status_codes[i],
                report.offsets[i],
            )?;
        }
        Ok(())
    }
}

#[rustfmt::skip]
fn print_summary(w: &mut dyn Write, report: &Report) -> anyhow::Result<()> {
    writeln!(w, "{}", "Summary:".h1())?;
    writeln!(w, "  Total:\t{:.4} secs", report.total.as_secs_f64())?;
    writeln!(w, "  Slowest:\t{:.4} secs", report.slowest)?;
    writeln!(w, "  Fastest:\t{:.4} secs", report.fastest)?;
    writeln!(w, "  Average:\t{:.4} secs", report.avg_total)?;
    writeln!(w, "  Requests/sec:\t{:.4}", report.rps)?;
    if report.size_total > 0 {
        writeln!(w)?;
        writeln!(w, "  Total data:\t{:.2}", (report.size_total as u64).adjusted())?;
        writeln!(w, "  Size/request:\t{} bytes", report.size_total / report.lats.len() as i64)?;
    }
    Ok(())
}

fn print_histogram(w: &mut dyn Write, report: &Report) -> anyhow::Result<()> {
    writeln!(w, "{}", "Response time histogram:".h1())?;
    let max_count = report.histogram.iter().map(|b| b.count).max().unwrap_or(0);
    if max_count == 0 {
        return Ok(());
    }
    let count_width = max_count.to_string().len();
    for bucket in &report.histogram {
        let bar = BAR_WIDTH * bucket.count as usize / max_count as usize;
        writeln!(
            w,
            "  {:.3} [{:>count_width$}]\t|{}",
            bucket.mark,
            bucket.count,
            BAR_CHAR.repeat(bar),
        )?;
    }
    Ok(())
}

fn print_latencies(w: &mut dyn Write, report: &Report) -> anyhow::Result<()> {
    writeln!(w, "{}", "Latency distribution:".h1())?;
    for entry in &report.latency_distribution {
        writeln!(w, "  {}% in {:.4} secs", entry.percentage, entry.latency)?;
    }
    Ok(())
}

#[rustfmt::skip]
fn print_details(w: &mut dyn Write, report: &Report) -> anyhow::Result<()> {
    writeln!(w, "{}", "Details (average, fastest, slowest):".h1())?;
    writeln!(w, "  DNS+dialup:\t{:.4} secs, {:.4} secs, {:.4} secs", report.avg_conn, report.conn_min, report.conn_max)?;
    writeln!(w, "  DNS-lookup:\t{:.4} secs, {:.4} secs, {:.4} secs", report.avg_dns, report.dns_min, report.dns_max)?;
    writeln!(w, "  req write:\t{:.4} secs, {:.4} secs, {:.4} secs", report.avg_req, report.req_min, report.req_max)?;
    writeln!(w, "  resp wait:\t{:.4} secs, {:.4} secs, {:.4} secs", report.avg_delay, report.delay_min, report.delay_max)?;
    writeln!(w, "  resp read:\t{:.4} secs, {:.4} secs, {:.4} secs", report.avg_res, report.res_min, report.res_max)?;
    Ok(())
}

fn print_status(w: &mut dyn Write, report: &Report) -> anyhow::Result<()> {
    writeln!(w, "{}", "Status code distribution:".h1())?;
    let by_count = report
        .status_code_dist
        .iter()
        .sorted_unstable_by_key(|(_, &count)| Reverse(count))
        .collect_vec();
    for (code, count) in by_count {
        writeln!(w, "  [{code}]\t{count} responses")?;
    }
    Ok(())
}

fn print_errors(w: &mut dyn Write, report: &Report) -> anyhow::Result<()> {
    if report.error_dist.is_empty() {
        return Ok(());
    }
    writeln!(w)?;
    writeln!(w, "{}", "Error distribution:".h1())?;
    let by_count = report
        .error_dist
        .iter()
        .sorted_unstable_by_key(|(_, &count)| Reverse(count))
        .collect_vec();
    for (error, count) in by_count {
        writeln!(w, "{}", format!("  [{count}]\t{error}").red())?;
    }
    Ok(())
}

trait SectionStyle {
    fn h1(&self) -> StyledContent<&str>;
}

impl<T: AsRef<str>> SectionStyle for T {
    fn h1(&self) -> StyledContent<&str> {
        self.as_ref().bold()
    }
}
