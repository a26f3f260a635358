use std::path::Path;

use crate::commands::common::{
    format_record_lines, format_relative_time, format_sync_timestamp, guess_mime_type,
    open_service, record_to_list_item, resolve_payload, resolve_record, GlobalArgs,
    RecordListItem,
};
use crate::error::CliError;

pub async fn run_create(payload: Option<&str>, args: &GlobalArgs) -> Result<(), CliError> {
    let payload = resolve_payload(payload)?;
    let service = open_service(args).await?;
    let record = service.create(payload).await?;

    println!("{}", record.local_id);
    Ok(())
}

pub async fn run_update(id: &str, payload: Option<&str>, args: &GlobalArgs) -> Result<(), CliError> {
    let payload = resolve_payload(payload)?;
    let service = open_service(args).await?;
    let record = resolve_record(id, &service).await?;

    if record.payload == payload {
        println!("{}", record.local_id);
        return Ok(());
    }

    let updated = service.update(record.local_id, payload).await?;
    println!("{}", updated.local_id);
    Ok(())
}

pub async fn run_delete(id: &str, args: &GlobalArgs) -> Result<(), CliError> {
    let service = open_service(args).await?;
    let record = resolve_record(id, &service).await?;

    service.delete(record.local_id).await?;
    println!("{}", record.local_id);
    Ok(())
}

pub async fn run_attach(
    id: &str,
    file: &Path,
    mime: Option<&str>,
    args: &GlobalArgs,
) -> Result<(), CliError> {
    let blob = std::fs::read(file)?;
    let mime_type = mime.unwrap_or_else(|| guess_mime_type(file));
    let service = open_service(args).await?;
    let record = resolve_record(id, &service).await?;

    let attachment_id = service.attach(record.local_id, blob, mime_type).await?;
    println!("{attachment_id}");
    Ok(())
}

pub async fn run_show(id: &str, as_json: bool, args: &GlobalArgs) -> Result<(), CliError> {
    let service = open_service(args).await?;
    let record = resolve_record(id, &service).await?;
    let attachments = service.list_attachments(record.local_id).await?;

    if as_json {
        let document = serde_json::json!({
            "record": record,
            "attachments": attachments
                .iter()
                .map(|attachment| serde_json::json!({
                    "id": attachment.id,
                    "mime_type": attachment.mime_type,
                    "size_bytes": attachment.size_bytes,
                    "uploaded": attachment.uploaded,
                    "remote_id": attachment.remote_id,
                }))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&document)?);
        return Ok(());
    }

    let now_ms = chrono::Utc::now().timestamp_millis();
    println!("id:         {}", record.local_id);
    println!(
        "remote id:  {}",
        record.remote_id.as_deref().unwrap_or("(not synced)")
    );
    println!("status:     {}", record.sync_status);
    println!("device:     {}", record.owner_device_id);
    println!("created:    {}", format_sync_timestamp(record.created_at));
    println!(
        "updated:    {} ({})",
        format_sync_timestamp(record.updated_at),
        format_relative_time(record.updated_at, now_ms)
    );
    if record.retry_count > 0 {
        println!("retries:    {}", record.retry_count);
    }
    println!("payload:    {}", serde_json::to_string_pretty(&record.payload)?);
    for attachment in &attachments {
        println!(
            "attachment: {}  {}  {} bytes  {}",
            attachment.id,
            attachment.mime_type,
            attachment.size_bytes,
            if attachment.uploaded { "uploaded" } else { "local" }
        );
    }
    Ok(())
}

pub async fn run_list(
    limit: usize,
    offset: usize,
    as_json: bool,
    args: &GlobalArgs,
) -> Result<(), CliError> {
    let service = open_service(args).await?;
    let records = service.list_records(limit, offset).await?;

    if as_json {
        let json_items = records
            .iter()
            .map(record_to_list_item)
            .collect::<Vec<RecordListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
    } else {
        for line in format_record_lines(&records) {
            println!("{line}");
        }
    }

    Ok(())
}
