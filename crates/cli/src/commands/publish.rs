// Publish command - inject a row change (server must be in dev mode)

use crate::client::Client;
use crate::output::OutputFormat;
use anyhow::{Context, Result};
use depot_core::{ChangeKind, ChangeNotification, Topic};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PublishResponse {
    delivered: usize,
}

pub fn parse_kind(raw: &str) -> Result<ChangeKind> {
    match raw.to_ascii_lowercase().as_str() {
        "insert" => Ok(ChangeKind::Insert),
        "update" => Ok(ChangeKind::Update),
        "delete" => Ok(ChangeKind::Delete),
        other => anyhow::bail!("unknown change type '{}'", other),
    }
}

fn parse_row(label: &str, raw: Option<&str>) -> Result<Option<Value>> {
    raw.map(|raw| {
        let value: Value =
            serde_json::from_str(raw).with_context(|| format!("--{} is not valid JSON", label))?;
        anyhow::ensure!(value.is_object(), "--{} must be a JSON object", label);
        Ok(value)
    })
    .transpose()
}

/// Build the notification sent to the server
pub fn build_notification(
    table: &str,
    kind: &str,
    record: Option<&str>,
    old_record: Option<&str>,
) -> Result<ChangeNotification> {
    Topic::table(table).with_context(|| format!("invalid table '{}'", table))?;
    let kind = parse_kind(kind)?;
    let record = parse_row("record", record)?;
    let old_record = parse_row("old-record", old_record)?;

    match kind {
        ChangeKind::Insert | ChangeKind::Update if record.is_none() => {
            anyhow::bail!("--record is required for {:?}", kind)
        }
        ChangeKind::Delete if old_record.is_none() => {
            anyhow::bail!("--old-record is required for Delete")
        }
        _ => {}
    }

    Ok(ChangeNotification {
        table: table.to_string(),
        kind,
        record,
        old_record,
    })
}

pub async fn run(
    client: &Client,
    output: OutputFormat,
    quiet: bool,
    table: &str,
    kind: &str,
    record: Option<&str>,
    old_record: Option<&str>,
) -> Result<()> {
    let notification = build_notification(table, kind, record, old_record)?;

    let response: PublishResponse = client
        .post(&format!("/v1/changes/{}", table), &notification)
        .await?;

    if output.is_text() {
        if !quiet {
            println!(
                "Published {:?} on '{}' to {} stream(s)",
                notification.kind, table, response.delivered
            );
        }
    } else {
        output.print_value(&response)?;
    }

    Ok(())
}
