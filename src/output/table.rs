use crate::output::StatusSummary;

const FOLDER_WIDTH: usize = 36;
const NUM_WIDTH: usize = 9;
const SIZE_WIDTH: usize = 12;

pub fn format_status(summary: &StatusSummary) -> String {
    let mut out = String::new();
    out.push_str("Migration Status\n");
    out.push_str("================\n");
    out.push_str(&format!("Messages: {}\n", summary.total_messages));
    out.push_str(&format!("Size:     {}\n", human_size(summary.total_size)));
    out.push_str(&format!("Skipped:  {}\n", summary.total_skipped));
    out.push_str(&format!("Failed:   {}\n", summary.total_failed));
    out.push('\n');

    if summary.folders.is_empty() {
        out.push_str("No folder activity recorded.\n");
        return out;
    }

    out.push_str(&format!(
        "{:<folder$}  {:>num$}  {:>size$}  {:>num$}  {:>num$}  {}\n",
        "Folder",
        "Count",
        "Size",
        "Skipped",
        "Failed",
        "Done",
        folder = FOLDER_WIDTH,
        num = NUM_WIDTH,
        size = SIZE_WIDTH,
    ));
    out.push_str(&format!(
        "{}  {}  {}  {}  {}  {}\n",
        "-".repeat(FOLDER_WIDTH),
        "-".repeat(NUM_WIDTH),
        "-".repeat(SIZE_WIDTH),
        "-".repeat(NUM_WIDTH),
        "-".repeat(NUM_WIDTH),
        "----",
    ));

    for folder in &summary.folders {
        out.push_str(&format!(
            "{:<folder$}  {:>num$}  {:>size$}  {:>num$}  {:>num$}  {}\n",
            truncate(&folder.path, FOLDER_WIDTH),
            folder.count,
            human_size(folder.size),
            folder.skipped,
            folder.failed,
            if folder.processed { "yes" } else { "no" },
            folder = FOLDER_WIDTH,
            num = NUM_WIDTH,
            size = SIZE_WIDTH,
        ));
    }

    out
}

pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn truncate(value: &str, width: usize) -> String {
    if value.chars().count() <= width {
        return value.to_string();
    }
    let kept: String = value.chars().take(width.saturating_sub(1)).collect();
    format!("{kept}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::FolderStats;

    #[test]
    fn human_size_scales_units() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.0 KiB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.0 MiB");
    }

    #[test]
    fn status_without_folders_mentions_it() {
        let rendered = format_status(&StatusSummary::default());
        assert!(rendered.contains("No folder activity recorded."));
    }

    #[test]
    fn status_lists_folder_rows() {
        let summary = StatusSummary {
            total_messages: 3,
            total_size: 6144,
            total_skipped: 1,
            total_failed: 0,
            folders: vec![FolderStats {
                path: "Inbox".to_string(),
                count: 3,
                size: 6144,
                skipped: 1,
                failed: 0,
                processed: true,
            }],
        };
        let rendered = format_status(&summary);
        assert!(rendered.contains("Messages: 3"));
        assert!(rendered.contains("Inbox"));
        assert!(rendered.contains("6.0 KiB"));
        assert!(rendered.contains("yes"));
    }
}
