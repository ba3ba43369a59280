//! Coverage aggregation.
//!
//! Folds the per-item outcomes and a before/after pair of coverage reports
//! into one [`CoverageSummary`]. Reports are opaque files; the only structure
//! read from them is the Cobertura root `line-rate` / `branch-rate`, when
//! present. An unreadable report degrades the delta section, never the run.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::domain::{TestAssociation, WorkOutcome};

const MAX_DETAIL_CHARS: usize = 200;

/// What was read from one coverage report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSnapshot {
    pub path: PathBuf,
    /// SHA-256 of the file content, hex.
    pub digest: String,
    pub line_rate: Option<f64>,
    pub branch_rate: Option<f64>,
}

/// Comparison of the before and after reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CoverageDelta {
    Available {
        before: ReportSnapshot,
        after: ReportSnapshot,
    },
    Unavailable {
        reason: String,
    },
}

impl CoverageDelta {
    pub fn is_available(&self) -> bool {
        matches!(self, CoverageDelta::Available { .. })
    }
}

/// A failed work item, as shown in the summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub association: TestAssociation,
    pub exit_code: i32,
    /// First non-blank stderr line, truncated.
    pub detail: String,
}

/// Outcome counts plus coverage delta for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<FailureEntry>,
    pub delta: CoverageDelta,
    /// Resolution warnings carried into the report.
    pub warnings: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

impl CoverageSummary {
    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    /// Render the summary as a Markdown PR comment headed by `prefix`.
    pub fn render_markdown(&self, prefix: &str) -> String {
        let mut md = format!("{prefix}\n\n");

        if self.total == 0 {
            md.push_str(
                "No related tests were found for the files changed in this pull request.\n",
            );
        } else {
            md.push_str(&format!(
                "**{}** work item(s) attempted: **{}** succeeded, **{}** failed.\n",
                self.total, self.succeeded, self.failed
            ));
        }

        if !self.failures.is_empty() {
            md.push_str("\n### Failed items\n\n");
            for failure in &self.failures {
                md.push_str(&format!(
                    "- `{}` with `{}` (exit {})",
                    failure.association.source_file.display(),
                    failure.association.test_file.display(),
                    failure.exit_code
                ));
                if !failure.detail.is_empty() {
                    md.push_str(&format!(": {}", failure.detail));
                }
                md.push('\n');
            }
        }

        md.push_str("\n### Coverage delta\n\n");
        match &self.delta {
            CoverageDelta::Available { before, after } => {
                let rows = [
                    ("Line rate", before.line_rate, after.line_rate),
                    ("Branch rate", before.branch_rate, after.branch_rate),
                ];
                if rows.iter().any(|(_, b, a)| b.is_some() || a.is_some()) {
                    md.push_str("| Metric | Before | After | Change |\n");
                    md.push_str("|---|---|---|---|\n");
                    for (label, b, a) in rows {
                        md.push_str(&format!(
                            "| {label} | {} | {} | {} |\n",
                            format_rate(b),
                            format_rate(a),
                            format_change(b, a)
                        ));
                    }
                    md.push('\n');
                } else {
                    md.push_str("Coverage rates unavailable in these reports.\n\n");
                }
                if before.digest == after.digest {
                    md.push_str("Coverage report unchanged.\n");
                } else {
                    md.push_str("Coverage report changed.\n");
                }
            }
            CoverageDelta::Unavailable { reason } => {
                md.push_str(&format!("_Coverage delta unavailable: {reason}_\n"));
            }
        }

        if !self.warnings.is_empty() {
            md.push_str("\n<details><summary>Resolution warnings</summary>\n\n");
            for warning in &self.warnings {
                md.push_str(&format!("- {warning}\n"));
            }
            md.push_str("\n</details>\n");
        }

        md
    }
}

/// Build the run summary from both reports and every outcome.
pub async fn aggregate(before: &Path, after: &Path, outcomes: &[WorkOutcome]) -> CoverageSummary {
    let delta = match (read_snapshot(before).await, read_snapshot(after).await) {
        (Ok(before), Ok(after)) => CoverageDelta::Available { before, after },
        (Err(reason), _) | (_, Err(reason)) => {
            warn!(%reason, "coverage delta unavailable");
            CoverageDelta::Unavailable { reason }
        }
    };
    summarize(outcomes, delta)
}

/// Fold the outcomes into a summary carrying an already-computed delta.
pub fn summarize(outcomes: &[WorkOutcome], delta: CoverageDelta) -> CoverageSummary {
    let failures: Vec<FailureEntry> = outcomes
        .iter()
        .filter(|o| !o.succeeded())
        .map(|o| FailureEntry {
            association: o.association.clone(),
            exit_code: o.exit_code,
            detail: first_line(&o.stderr),
        })
        .collect();

    CoverageSummary {
        total: outcomes.len(),
        succeeded: outcomes.len() - failures.len(),
        failed: failures.len(),
        failures,
        delta,
        warnings: Vec::new(),
        generated_at: Utc::now(),
    }
}

/// Read a report and extract what we can from it.
pub async fn read_snapshot(path: &Path) -> std::result::Result<ReportSnapshot, String> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;

    let digest = hex::encode(Sha256::digest(&bytes));
    let text = String::from_utf8_lossy(&bytes);
    let (line_rate, branch_rate) = root_rates(&text);
    debug!(path = %path.display(), ?line_rate, ?branch_rate, "read coverage report");

    Ok(ReportSnapshot {
        path: path.to_path_buf(),
        digest,
        line_rate,
        branch_rate,
    })
}

fn root_rates(text: &str) -> (Option<f64>, Option<f64>) {
    static ROOT: OnceLock<Regex> = OnceLock::new();
    static LINE: OnceLock<Regex> = OnceLock::new();
    static BRANCH: OnceLock<Regex> = OnceLock::new();

    let root = ROOT.get_or_init(|| Regex::new(r"<coverage\b[^>]*>").expect("valid regex"));
    let Some(tag) = root.find(text) else {
        return (None, None);
    };
    let tag = tag.as_str();

    let attr = |re: &OnceLock<Regex>, name: &str| {
        let re = re.get_or_init(|| {
            Regex::new(&format!(r#"\b{name}="([0-9]*\.?[0-9]+)""#)).expect("valid regex")
        });
        re.captures(tag)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
    };

    (attr(&LINE, "line-rate"), attr(&BRANCH, "branch-rate"))
}

fn first_line(stderr: &str) -> String {
    let line = stderr
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    if line.chars().count() > MAX_DETAIL_CHARS {
        let truncated: String = line.chars().take(MAX_DETAIL_CHARS).collect();
        format!("{truncated}...")
    } else {
        line.to_string()
    }
}

fn format_rate(rate: Option<f64>) -> String {
    rate.map(|r| format!("{:.2}%", r * 100.0))
        .unwrap_or_else(|| "n/a".to_string())
}

fn format_change(before: Option<f64>, after: Option<f64>) -> String {
    match (before, after) {
        (Some(b), Some(a)) => format!("{:+.2} pp", (a - b) * 100.0),
        _ => "n/a".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const BEFORE: &str = r#"<?xml version="1.0" ?>
<coverage lines-valid="100" line-rate="0.8" branch-rate="0.5" version="1.9">
  <packages/>
</coverage>"#;

    const AFTER: &str = r#"<?xml version="1.0" ?>
<coverage line-rate="0.85" branch-rate="0.5" version="1.9">
  <packages/>
</coverage>"#;

    fn outcome(src: &str, code: i32, stderr: &str) -> WorkOutcome {
        WorkOutcome::from_exit(
            TestAssociation::new(src, format!("{src}.test")),
            code,
            String::new(),
            stderr.to_string(),
        )
    }

    #[test]
    fn test_root_rates_parsed() {
        assert_eq!(root_rates(BEFORE), (Some(0.8), Some(0.5)));
        assert_eq!(root_rates("<report/>"), (None, None));
    }

    #[test]
    fn test_first_line_skips_blanks_and_truncates() {
        assert_eq!(first_line("\n  \nassertion failed\nmore"), "assertion failed");
        let long = "x".repeat(500);
        assert_eq!(first_line(&long).chars().count(), MAX_DETAIL_CHARS + 3);
    }

    #[tokio::test]
    async fn test_aggregate_counts_and_delta() {
        let dir = tempfile::tempdir().unwrap();
        let before = dir.path().join("before.xml");
        let after = dir.path().join("after.xml");
        fs::write(&before, BEFORE).unwrap();
        fs::write(&after, AFTER).unwrap();

        let outcomes = vec![
            outcome("a.ts", 0, ""),
            outcome("b.ts", 1, "assertion failed"),
            outcome("c.ts", 0, ""),
        ];
        let summary = aggregate(&before, &after, &outcomes).await;

        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].association.source_file, PathBuf::from("b.ts"));
        assert_eq!(summary.failures[0].detail, "assertion failed");
        assert!(summary.delta.is_available());

        let md = summary.render_markdown("## Coverage");
        assert!(md.starts_with("## Coverage\n"));
        assert!(md.contains("**3** work item(s) attempted"));
        assert!(md.contains("`b.ts` with `b.ts.test` (exit 1): assertion failed"));
        assert!(md.contains("| Line rate | 80.00% | 85.00% | +5.00 pp |"));
        assert!(md.contains("Coverage report changed."));
    }

    #[tokio::test]
    async fn test_unreadable_report_degrades_delta_only() {
        let dir = tempfile::tempdir().unwrap();
        let after = dir.path().join("after.xml");
        fs::write(&after, AFTER).unwrap();

        let outcomes = vec![outcome("a.ts", 0, "")];
        let summary = aggregate(&dir.path().join("missing.xml"), &after, &outcomes).await;

        assert_eq!(summary.total, 1);
        assert_eq!(summary.succeeded, 1);
        match &summary.delta {
            CoverageDelta::Unavailable { reason } => assert!(reason.contains("missing.xml")),
            other => panic!("expected unavailable delta, got {other:?}"),
        }
        assert!(summary
            .render_markdown("## Coverage")
            .contains("_Coverage delta unavailable: cannot read"));
    }

    #[tokio::test]
    async fn test_reports_without_rates_still_compare_content() {
        let dir = tempfile::tempdir().unwrap();
        let before = dir.path().join("before.txt");
        let after = dir.path().join("after.txt");
        fs::write(&before, "Statements: 10/20").unwrap();
        fs::write(&after, "Statements: 10/20").unwrap();

        let summary = aggregate(&before, &after, &[]).await;
        let md = summary.render_markdown("## Coverage");
        assert!(md.contains("No related tests were found"));
        assert!(md.contains("Coverage rates unavailable"));
        assert!(md.contains("Coverage report unchanged."));
    }

    #[test]
    fn test_summarize_keeps_supplied_delta() {
        let outcomes = vec![outcome("a.ts", 0, ""), outcome("b.ts", 2, "gave up")];
        let summary = summarize(
            &outcomes,
            CoverageDelta::Unavailable {
                reason: "reports are kept per work item".to_string(),
            },
        );

        assert_eq!(summary.total, 2);
        assert_eq!(summary.failed, 1);
        assert!(summary
            .render_markdown("## Coverage")
            .contains("_Coverage delta unavailable: reports are kept per work item_"));
    }

    #[tokio::test]
    async fn test_warnings_rendered() {
        let dir = tempfile::tempdir().unwrap();
        let summary = aggregate(&dir.path().join("a"), &dir.path().join("b"), &[])
            .await
            .with_warnings(vec!["cannot list src".to_string()]);
        assert!(summary
            .render_markdown("## Coverage")
            .contains("- cannot list src"));
    }
}
