//! Usage commands

use anyhow::Result;
use tabled::Tabled;

use crate::client::{ApiClient, UsageSnapshot};
use crate::output::{
    color_utilization, format_percent, print_json, print_table, print_warning, OutputFormat,
};

/// Row for the usage table
#[derive(Tabled)]
struct UsageRow {
    #[tabled(rename = "Core")]
    core_id: String,
    #[tabled(rename = "Latest")]
    latest: String,
    #[tabled(rename = "Window")]
    window: String,
    #[tabled(rename = "Stale")]
    stale: String,
}

/// Show per-core utilization
pub async fn show_usage(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let usage: UsageSnapshot = client.get(&["usage"]).await?;

    match format {
        OutputFormat::Json => print_json(&usage)?,
        OutputFormat::Table => {
            let rows: Vec<UsageRow> = usage
                .cores
                .iter()
                .map(|(id, core)| UsageRow {
                    core_id: id.clone(),
                    latest: core
                        .latest
                        .as_ref()
                        .map(|s| color_utilization(s.utilization))
                        .unwrap_or_else(|| "-".to_string()),
                    window: core
                        .window
                        .iter()
                        .map(|v| format_percent(*v))
                        .collect::<Vec<_>>()
                        .join(" "),
                    stale: if core.stale { "✓".to_string() } else { String::new() },
                })
                .collect();

            print_table(&rows);
            if usage.cycle == 0 {
                println!("\nSampled on demand at {}", usage.collected_at);
            } else {
                println!("\nCycle {} at {}", usage.cycle, usage.collected_at);
            }
            for failure in &usage.failed_hosts {
                print_warning(&format!("Host {} not sampled: {}", failure.host, failure.reason));
            }
        }
    }

    Ok(())
}
