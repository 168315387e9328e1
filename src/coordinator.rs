//! Client mode: fan out to the load servers, fan in their reports and
//! print the merged result.

use std::io::Write;

use anyhow::Result;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::aggregate;
use crate::output::{self, OutputFormat};
use crate::report::{Report, ServerReport};

pub async fn run(targets: Vec<String>, format: OutputFormat) -> Result<()> {
    let report = collect(targets).await;
    let mut stdout = std::io::stdout().lock();
    output::printer(format).print(&mut stdout, &report)?;
    stdout.flush()?;
    Ok(())
}

/// Trigger a run on every server and merge whatever comes back.
///
/// Unreachable servers, non-2xx answers and malformed bodies are logged and
/// excluded; the merge covers the remaining reports. Each call blocks for as
/// long as the slowest server takes to finish its workload.
pub async fn collect(targets: Vec<String>) -> Report {
    let client = reqwest::Client::new();
    let mut set: JoinSet<(String, reqwest::Result<ServerReport>)> = JoinSet::new();
    for target in targets {
        let client = client.clone();
        set.spawn(async move {
            let result = fetch(&client, &target).await;
            (target, result)
        });
    }

    let mut reports = Vec::new();
    while let Some(joined) = set.join_next().await {
        let Ok((target, result)) = joined else { continue };
        match result {
            Ok(report) => {
                info!(
                    %target,
                    results = report.lats.len(),
                    errors = report.errors.values().sum::<u64>(),
                    "collected server report"
                );
                reports.push(report);
            }
            Err(err) => error!(%target, %err, "failed to collect server report"),
        }
    }

    let merged = aggregate::merge(&reports);
    for (error, &count) in &merged.error_dist {
        error!(count, "server-side error: {error}");
    }
    merged
}

async fn fetch(client: &reqwest::Client, target: &str) -> reqwest::Result<ServerReport> {
    client
        .get(format!("http://{target}/run"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await
}
