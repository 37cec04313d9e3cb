pub mod json;
pub mod table;

use anyhow::Result;
use serde::Serialize;

use crate::state::FolderStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Table
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSummary {
    pub total_messages: u64,
    pub total_size: u64,
    pub total_skipped: u64,
    pub total_failed: u64,
    pub folders: Vec<FolderStats>,
}

pub fn format_status(format: OutputFormat, summary: &StatusSummary) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_status(summary)),
        OutputFormat::Json => json::format_status(summary),
    }
}
