//! Rendered summaries for batches and re-verification runs.

use crate::model::Status;
use chrono::{DateTime, Utc};
use std::fmt::Write;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct ReportRow {
    pub label: String,
    pub status: Status,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct ReportSection {
    pub heading: String,
    pub rows: Vec<ReportRow>,
}

#[derive(Debug, Clone)]
pub struct Report {
    pub title: String,
    pub environment: String,
    pub generated_at: DateTime<Utc>,
    pub sections: Vec<ReportSection>,
}

impl Report {
    pub fn new(title: impl Into<String>, environment: &str) -> Self {
        Self {
            title: title.into(),
            environment: environment.to_string(),
            generated_at: Utc::now(),
            sections: Vec::new(),
        }
    }

    pub fn section(&mut self, heading: impl Into<String>) -> &mut ReportSection {
        self.sections.push(ReportSection {
            heading: heading.into(),
            rows: Vec::new(),
        });
        let last = self.sections.len() - 1;
        &mut self.sections[last]
    }

    /// Worst status of any row.
    pub fn status(&self) -> Status {
        Status::worst_of(self.sections.iter().flat_map(|s| s.rows.iter().map(|r| r.status)))
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for row in self.sections.iter().flat_map(|s| &s.rows) {
            match row.status {
                Status::Pass => counts.0 += 1,
                Status::Warning => counts.1 += 1,
                Status::Fail => counts.2 += 1,
            }
        }
        counts
    }

    pub fn to_text(&self) -> String {
        let (pass, warn, fail) = self.counts();
        let mut out = String::new();
        let _ = writeln!(out, "{} [{}]", self.title, self.environment);
        let _ = writeln!(out, "Generated: {}", self.generated_at.format("%Y-%m-%d %H:%M:%S UTC"));
        let _ = writeln!(out, "Overall: {} ({pass} passed, {warn} warnings, {fail} failed)", self.status());
        for section in &self.sections {
            let _ = writeln!(out);
            let _ = writeln!(out, "== {} ==", section.heading);
            if section.rows.is_empty() {
                let _ = writeln!(out, "  (nothing to report)");
            }
            for row in &section.rows {
                let _ = writeln!(out, "  [{:<7}] {} - {}", row.status.as_str(), row.label, row.detail);
            }
        }
        out
    }

    pub fn to_html(&self) -> String {
        let (pass, warn, fail) = self.counts();
        let mut out = String::new();
        let _ = writeln!(out, "<!DOCTYPE html>");
        let _ = writeln!(out, "<html><head><meta charset=\"utf-8\"><title>{}</title>", escape(&self.title));
        let _ = writeln!(
            out,
            "<style>body{{font-family:sans-serif}}table{{border-collapse:collapse}}td,th{{border:1px solid #ccc;padding:4px 8px}}.PASS{{color:#1a7f37}}.WARNING{{color:#9a6700}}.FAIL{{color:#cf222e}}</style>"
        );
        let _ = writeln!(out, "</head><body>");
        let _ = writeln!(out, "<h1>{} &mdash; {}</h1>", escape(&self.title), escape(&self.environment));
        let _ = writeln!(
            out,
            "<p>Generated {}. Overall <strong class=\"{status}\">{status}</strong>: {pass} passed, {warn} warnings, {fail} failed.</p>",
            self.generated_at.format("%Y-%m-%d %H:%M:%S UTC"),
            status = self.status(),
        );
        for section in &self.sections {
            let _ = writeln!(out, "<h2>{}</h2>", escape(&section.heading));
            let _ = writeln!(out, "<table><tr><th>Status</th><th>Item</th><th>Detail</th></tr>");
            for row in &section.rows {
                let _ = writeln!(
                    out,
                    "<tr><td class=\"{s}\">{s}</td><td>{}</td><td>{}</td></tr>",
                    escape(&row.label),
                    escape(&row.detail),
                    s = row.status,
                );
            }
            let _ = writeln!(out, "</table>");
        }
        let _ = writeln!(out, "</body></html>");
        out
    }

    pub fn write_html(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_html())
    }
}

impl ReportSection {
    pub fn row(&mut self, label: impl Into<String>, status: Status, detail: impl Into<String>) {
        self.rows.push(ReportRow {
            label: label.into(),
            status,
            detail: detail.into(),
        });
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Report {
        let mut report = Report::new("Backup verification", "prod");
        let section = report.section("relational-db");
        section.row("db-01", Status::Pass, "structural ok");
        section.row("db-02", Status::Warning, "no decryption key");
        report.section("files").row("web-01", Status::Pass, "1204 entries");
        report
    }

    #[test]
    fn test_status_and_counts() {
        let report = sample();
        assert_eq!(report.status(), Status::Warning);
        assert_eq!(report.counts(), (2, 1, 0));
    }

    #[test]
    fn test_text_rendering() {
        let text = sample().to_text();
        assert!(text.starts_with("Backup verification [prod]"));
        assert!(text.contains("Overall: WARNING (2 passed, 1 warnings, 0 failed)"));
        assert!(text.contains("== files =="));
        assert!(text.contains("[WARNING] db-02 - no decryption key"));
    }

    #[test]
    fn test_html_escapes_content() {
        let mut report = Report::new("<script>", "prod");
        report.section("s").row("a&b", Status::Fail, "x < y");
        let html = report.to_html();
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("a&amp;b"));
        assert!(html.contains("x &lt; y"));
        assert!(html.contains("class=\"FAIL\""));
        assert!(!html.contains("<script>"));
    }

    #[test]
    fn test_write_html_creates_parent() -> std::io::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("reports/verify.html");
        sample().write_html(&path)?;
        assert!(std::fs::read_to_string(&path)?.contains("<table>"));
        Ok(())
    }
}
