//! Formatted output helpers for CLI commands.
//!
//! State documents go to stdout as JSON; listings are either JSON or a
//! fixed-width table.

use std::io::Write;

use ocibox_runtime::instance::Instance;
use serde::Serialize;

/// Writes `value` to stdout as pretty-printed JSON.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let mut out = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}

/// Writes pre-rendered text to stdout.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn print_text(text: &str) -> anyhow::Result<()> {
    let mut out = std::io::stdout().lock();
    out.write_all(text.as_bytes())?;
    Ok(())
}

/// One row of the `list` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Container ID.
    pub id: String,
    /// Container PID, `-` when unknown.
    pub pid: String,
    /// Lifecycle status.
    pub status: String,
    /// Bundle directory.
    pub bundle: String,
    /// Creation time.
    pub created: String,
    /// Owning user.
    pub owner: String,
}

impl Row {
    /// Builds a row from an instance record. Records whose configuration
    /// cannot be decoded show `unknown` as their status.
    #[must_use]
    pub fn from_instance(instance: &Instance) -> Self {
        let state = instance.state().ok();
        Self {
            id: instance.id.clone(),
            pid: instance.pid.map_or_else(|| "-".to_string(), |p| p.to_string()),
            status: state
                .as_ref()
                .map_or_else(|| "unknown".to_string(), |s| s.status.to_string()),
            bundle: instance.image.display().to_string(),
            created: state
                .and_then(|s| s.created_at)
                .map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string()),
            owner: instance.user.clone(),
        }
    }
}

/// Renders rows as a left-aligned table with a header line.
#[must_use]
pub fn render_table(rows: &[Row]) -> String {
    const HEADER: [&str; 6] = ["ID", "PID", "STATUS", "BUNDLE", "CREATED", "OWNER"];

    let cells: Vec<[&str; 6]> = rows
        .iter()
        .map(|r| [&*r.id, &*r.pid, &*r.status, &*r.bundle, &*r.created, &*r.owner])
        .collect();
    let mut widths = HEADER.map(str::len);
    for row in &cells {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.len());
        }
    }

    let mut out = String::new();
    for row in std::iter::once(&HEADER).chain(&cells) {
        let line: Vec<String> = row
            .iter()
            .zip(widths)
            .map(|(cell, w)| format!("{cell:<w$}"))
            .collect();
        out.push_str(line.join("  ").trim_end());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, status: &str) -> Row {
        Row {
            id: id.into(),
            pid: "42".into(),
            status: status.into(),
            bundle: "/srv/bundle".into(),
            created: "2026-01-01T00:00:00Z".into(),
            owner: "root".into(),
        }
    }

    #[test]
    fn table_has_header_and_aligned_columns() {
        let table = render_table(&[row("web-1", "running"), row("database", "stopped")]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("ID        PID  STATUS"));
        assert!(lines[1].starts_with("web-1     42   running"));
        assert!(lines[2].starts_with("database  42   stopped"));
        let status_col = lines[0].find("STATUS").expect("header");
        assert_eq!(lines[2].find("stopped"), Some(status_col));
    }

    #[test]
    fn empty_table_is_header_only() {
        assert_eq!(render_table(&[]), "ID  PID  STATUS  BUNDLE  CREATED  OWNER\n");
    }
}
