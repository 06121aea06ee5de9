//! Publish reporting: progress lines, secondary-failure warnings and broken
//! link findings.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Category of a failure that did not abort the enclosing operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WarningKind {
    /// Copying properties to the published resource failed
    PropertyCopy,
    /// Writing or removing the exported copy failed
    Export,
    /// A user or group name could not be resolved for a backup row
    NameResolution,
    /// A single link edge could not be stored
    LinkTarget,
    /// A folder marked for deletion still has live children online
    FolderNotEmpty,
}

impl std::fmt::Display for WarningKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WarningKind::PropertyCopy => "property-copy",
            WarningKind::Export => "export",
            WarningKind::NameResolution => "name-resolution",
            WarningKind::LinkTarget => "link-target",
            WarningKind::FolderNotEmpty => "folder-not-empty",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub path: String,
    pub kind: WarningKind,
    pub message: String,
}

impl Warning {
    pub fn new(path: impl Into<String>, kind: WarningKind, message: impl std::fmt::Display) -> Self {
        Self { path: path.into(), kind, message: message.to_string() }
    }
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.path, self.message)
    }
}

/// Links of one resource whose targets will not resolve after a publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokenLink {
    /// The referencing resource
    pub resource_path: String,
    pub targets: Vec<String>,
}

impl std::fmt::Display for BrokenLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.resource_path, self.targets.join(", "))
    }
}

/// Receives one line per processed resource and per broken link
pub trait ReportSink: Send + Sync {
    fn print(&self, line: &str);
}

/// Collects report lines in memory
#[derive(Default)]
pub struct MemoryReport {
    lines: Mutex<Vec<String>>,
}

impl MemoryReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl ReportSink for MemoryReport {
    fn print(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }
}

/// Forwards report lines to `tracing` at info level
pub struct TracingReport;

impl ReportSink for TracingReport {
    fn print(&self, line: &str) {
        tracing::info!(target: "dcms::report", "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_report_keeps_order() {
        let report = MemoryReport::new();
        report.print("publish folder /site/");
        report.print("publish file /site/index.html");
        assert_eq!(report.lines(), vec!["publish folder /site/", "publish file /site/index.html"]);
    }

    #[test]
    fn test_display_formats() {
        let w = Warning::new("/a.html", WarningKind::PropertyCopy, "no definition Title");
        assert_eq!(w.to_string(), "[property-copy] /a.html: no definition Title");
        let b = BrokenLink { resource_path: "/a.html".into(), targets: vec!["/x/y".into(), "/z".into()] };
        assert_eq!(b.to_string(), "/a.html -> /x/y, /z");
    }
}
