use chrono::Utc;

use crate::commands::common::{
    format_relative_time, format_sync_timestamp, open_service, GlobalArgs,
};
use crate::error::CliError;

pub async fn run_sync(as_json: bool, args: &GlobalArgs) -> Result<(), CliError> {
    let service = open_service(args).await?;
    let report = service.sync_now().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{report}");
    }
    Ok(())
}

pub async fn run_status(as_json: bool, args: &GlobalArgs) -> Result<(), CliError> {
    let service = open_service(args).await?;
    let status = service.status().await?;
    let next_attempt_at = service.next_attempt_at().await?;

    if as_json {
        let document = serde_json::json!({
            "device_id": service.device_id().to_string(),
            "online": service.network_state().online,
            "status": status,
            "next_attempt_at": next_attempt_at,
        });
        println!("{}", serde_json::to_string_pretty(&document)?);
        return Ok(());
    }

    println!("device:     {}", service.device_id());
    println!(
        "network:    {}",
        if service.network_state().online {
            "online"
        } else {
            "offline"
        }
    );
    println!("pending:    {}", status.pending);
    println!("failed:     {}", status.failed);
    println!("conflicts:  {}", status.conflicts);
    println!(
        "last sync:  {}",
        status
            .last_sync_at
            .map_or_else(|| "never".to_string(), format_sync_timestamp)
    );
    if let Some(at) = next_attempt_at {
        let now_ms = Utc::now().timestamp_millis();
        if at > now_ms {
            println!("next retry: {}", format_relative_time(at, now_ms));
        }
    }
    Ok(())
}

pub async fn run_retry(args: &GlobalArgs) -> Result<(), CliError> {
    let service = open_service(args).await?;
    let revived = service.retry_failed().await?;
    println!("{revived} item(s) queued for retry");
    Ok(())
}

pub async fn run_wipe(confirmed: bool, args: &GlobalArgs) -> Result<(), CliError> {
    if !confirmed {
        return Err(CliError::WipeNotConfirmed);
    }
    let service = open_service(args).await?;
    let device = service.wipe_local_data().await?;
    println!("{}", device.device_id);
    Ok(())
}
