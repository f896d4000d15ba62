//! Core state commands

use anyhow::Result;
use reqwest::StatusCode;
use tabled::Tabled;

use crate::client::{ApiClient, ApiError, CoreStatus, FleetStatus, StatusResponse, SwitchResponse};
use crate::output::{
    color_state, print_info, print_json, print_success, print_table, print_warning, OutputFormat,
};

/// Row for the core state table
#[derive(Tabled)]
struct CoreRow {
    #[tabled(rename = "Core")]
    core_id: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Last Failure")]
    last_failure: String,
}

/// Start the controller's monitoring loop
pub async fn begin(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let status = client.post_empty(&["begin"]).await?;

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({ "status": status.as_u16() }))?,
        OutputFormat::Table => print_success("Monitoring requested"),
    }

    Ok(())
}

/// Show fleet status, or one core's status
pub async fn status(client: &ApiClient, core: Option<String>, format: OutputFormat) -> Result<()> {
    let response: StatusResponse = match &core {
        Some(id) => {
            client
                .get_with_query(&["status"], &[("core", id.as_str())])
                .await?
        }
        None => client.get(&["status"]).await?,
    };

    match format {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => match response {
            StatusResponse::Core(core) => print_core(&core),
            StatusResponse::Fleet(fleet) => print_fleet(&fleet),
        },
    }

    Ok(())
}

fn print_core(core: &CoreStatus) {
    println!("Core:  {}", core.core_id);
    println!("State: {}", color_state(&core.state));
    println!("Awake: {}", if core.is_awake { "yes" } else { "no" });
}

fn print_fleet(fleet: &FleetStatus) {
    let rows: Vec<CoreRow> = fleet
        .cores
        .iter()
        .map(|(id, state)| CoreRow {
            core_id: id.clone(),
            state: color_state(state),
            last_failure: fleet
                .failures
                .get(id)
                .map(|f| format!("{} ({})", f.reason, f.target))
                .unwrap_or_default(),
        })
        .collect();

    print_table(&rows);

    let asleep = fleet.cores.values().filter(|s| *s == "asleep").count();
    println!("\nTotal: {} cores, {} asleep", fleet.cores.len(), asleep);
    if fleet.monitoring {
        print_info("Monitoring is running");
    } else {
        print_warning("Monitoring is not running; use `gcctl begin`");
    }
}

/// List sleeping cores
pub async fn sleeping(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let ids: Vec<String> = client.get(&["sleeping"]).await?;

    match format {
        OutputFormat::Json => print_json(&ids)?,
        OutputFormat::Table => {
            if ids.is_empty() {
                print_info("No cores are asleep");
                return Ok(());
            }
            for id in &ids {
                println!("{}", id);
            }
            println!("\nTotal: {} sleeping", ids.len());
        }
    }

    Ok(())
}

/// Toggle a core
pub async fn switch(client: &ApiClient, core_id: &str, format: OutputFormat) -> Result<()> {
    let response: SwitchResponse = match client.post(&["switch", core_id]).await {
        Ok(response) => response,
        Err(err) => return Err(explain_switch_error(core_id, err)),
    };

    match format {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => {
            let state = if response.is_awake { "awake" } else { "asleep" };
            print_success(&format!("Core {} is now {}", core_id, color_state(state)));
        }
    }

    Ok(())
}

fn explain_switch_error(core_id: &str, err: anyhow::Error) -> anyhow::Error {
    let Some(api_error) = err.downcast_ref::<ApiError>() else {
        return err;
    };
    match api_error.status {
        StatusCode::NOT_FOUND => anyhow::anyhow!("Core {} is not configured", core_id),
        StatusCode::CONFLICT => {
            anyhow::anyhow!("Core {} is a stable core and cannot be switched", core_id)
        }
        StatusCode::BAD_REQUEST => {
            anyhow::anyhow!("Invalid core id '{}', expected <host>:<index>", core_id)
        }
        _ => err,
    }
}
