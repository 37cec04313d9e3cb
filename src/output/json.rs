use anyhow::Result;

use crate::output::StatusSummary;

pub fn format_status(summary: &StatusSummary) -> Result<String> {
    Ok(serde_json::to_string_pretty(summary)?)
}
