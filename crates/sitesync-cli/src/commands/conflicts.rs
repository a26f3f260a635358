use sitesync_core::models::ConflictId;
use sitesync_core::{ConflictStatus, ResolutionStrategy};

use crate::commands::common::{
    conflict_to_item, format_conflict_lines, open_service, parse_payload, ConflictItem,
    GlobalArgs,
};
use crate::error::CliError;

pub async fn run_conflicts(all: bool, as_json: bool, args: &GlobalArgs) -> Result<(), CliError> {
    let service = open_service(args).await?;
    let filter = (!all).then_some(ConflictStatus::Pending);
    let conflicts = service.list_conflicts(filter).await?;

    if as_json {
        let json_items = conflicts
            .iter()
            .map(conflict_to_item)
            .collect::<Vec<ConflictItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_resolve(
    id: &str,
    strategy: ResolutionStrategy,
    merged: Option<&str>,
    args: &GlobalArgs,
) -> Result<(), CliError> {
    let conflict_id = parse_conflict_id(id)?;
    let merged = merged.map(parse_payload).transpose()?;
    let service = open_service(args).await?;

    service.resolve_conflict(conflict_id, strategy, merged).await?;
    println!("{conflict_id}");
    Ok(())
}

pub async fn run_dismiss(id: &str, args: &GlobalArgs) -> Result<(), CliError> {
    let conflict_id = parse_conflict_id(id)?;
    let service = open_service(args).await?;

    service.dismiss_conflict(conflict_id).await?;
    println!("{conflict_id}");
    Ok(())
}

pub fn parse_conflict_id(id: &str) -> Result<ConflictId, CliError> {
    id.trim()
        .parse::<ConflictId>()
        .map_err(|_| CliError::InvalidConflictId(id.trim().to_string()))
}
