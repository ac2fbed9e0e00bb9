//! Formatted output helpers for CLI commands.

use std::fmt::Write;

use nestbox_runtime::container::ContainerRecord;

const COMMAND_WIDTH: usize = 30;

/// Renders the `ps` table, one row per record, with a trailing newline.
#[must_use]
pub fn container_table(records: &[ContainerRecord]) -> String {
    let mut out = format!(
        "{:<14}{:<10}{:<8}{:<12}{:<21}{}\n",
        "CONTAINER ID", "STATUS", "PID", "IP", "CREATED", "COMMAND"
    );
    for r in records {
        let ip = r.container_ip.map_or_else(|| "-".to_string(), |ip| ip.to_string());
        let _ = writeln!(
            out,
            "{:<14}{:<10}{:<8}{:<12}{:<21}{}",
            r.id.short(),
            r.status,
            r.pid,
            ip,
            r.created_at.format("%Y-%m-%d %H:%M:%S"),
            truncate(&r.command_line(), COMMAND_WIDTH),
        );
    }
    out
}

/// Cuts `s` to at most `max` characters, marking the cut with `...`.
#[must_use]
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}
