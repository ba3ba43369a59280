//! Work items: one coverage-agent invocation for one association.

use std::path::PathBuf;

use prcov_core::{AgentSettings, TestAssociation};
use serde::{Deserialize, Serialize};

pub const FLAG_SOURCE_FILE: &str = "--source-file-path";
pub const FLAG_TEST_FILE: &str = "--test-file-path";
pub const FLAG_REPORT_PATH: &str = "--code-coverage-report-path";
pub const FLAG_TEST_COMMAND: &str = "--test-command";
pub const FLAG_COVERAGE_TYPE: &str = "--coverage-type";
pub const FLAG_DESIRED_COVERAGE: &str = "--desired-coverage";
pub const FLAG_MAX_ITERATIONS: &str = "--max-iterations";

/// Everything the agent needs for one association.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub association: TestAssociation,

    /// Report the agent reads and writes; shared or per-item per settings.
    pub report_path: PathBuf,

    pub test_command: String,

    pub coverage_kind: String,

    pub desired_coverage: u8,

    pub max_iterations: u32,

    pub extra_args: Vec<String>,
}

impl WorkItem {
    pub fn new(association: TestAssociation, settings: &AgentSettings) -> Self {
        let report_path = settings.report_path_for(&association);
        let test_command = settings.test_command_for(&report_path);
        Self {
            association,
            report_path,
            test_command,
            coverage_kind: settings.coverage_kind.clone(),
            desired_coverage: settings.desired_coverage,
            max_iterations: settings.max_iterations,
            extra_args: settings.extra_args(),
        }
    }

    /// Agent argv, one entry per value. Paths and the test command are never
    /// interpolated into a shell string.
    pub fn agent_args(&self) -> Vec<String> {
        let mut args = vec![
            FLAG_SOURCE_FILE.to_string(),
            self.association.source_file.to_string_lossy().into_owned(),
            FLAG_TEST_FILE.to_string(),
            self.association.test_file.to_string_lossy().into_owned(),
            FLAG_REPORT_PATH.to_string(),
            self.report_path.to_string_lossy().into_owned(),
            FLAG_TEST_COMMAND.to_string(),
            self.test_command.clone(),
            FLAG_COVERAGE_TYPE.to_string(),
            self.coverage_kind.clone(),
            FLAG_DESIRED_COVERAGE.to_string(),
            self.desired_coverage.to_string(),
            FLAG_MAX_ITERATIONS.to_string(),
            self.max_iterations.to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prcov_core::{Inputs, ReportScope, RunConfig};

    fn settings() -> AgentSettings {
        RunConfig::from_inputs(Inputs {
            github_token: Some("t".to_string()),
            agent_api_key: Some("k".to_string()),
            additional_agent_args: Some("--model gpt-4o".to_string()),
            ..Inputs::default()
        })
        .unwrap()
        .agent
    }

    #[test]
    fn test_agent_args_order() {
        let item = WorkItem::new(
            TestAssociation::new("src/foo.ts", "src/foo.test.ts"),
            &settings(),
        );
        assert_eq!(
            item.agent_args(),
            vec![
                "--source-file-path",
                "src/foo.ts",
                "--test-file-path",
                "src/foo.test.ts",
                "--code-coverage-report-path",
                "./coverage/cobertura-coverage.xml",
                "--test-command",
                "npx jest --coverage",
                "--coverage-type",
                "cobertura",
                "--desired-coverage",
                "100",
                "--max-iterations",
                "2",
                "--model",
                "gpt-4o",
            ]
        );
    }

    #[test]
    fn test_hostile_paths_stay_single_arguments() {
        let item = WorkItem::new(
            TestAssociation::new("src/$(rm -rf ~).ts", "src/a b\".test.ts"),
            &settings(),
        );
        let args = item.agent_args();
        assert_eq!(args[1], "src/$(rm -rf ~).ts");
        assert_eq!(args[3], "src/a b\".test.ts");
    }

    #[test]
    fn test_per_item_scope_rewrites_report_and_command() {
        let mut settings = settings();
        settings.report_scope = ReportScope::PerItem;
        settings.test_command = "jest --coverage --out {coverage_path}".to_string();

        let item = WorkItem::new(TestAssociation::new("src/foo.ts", "src/foo.test.ts"), &settings);
        assert_ne!(item.report_path, settings.coverage_path);
        assert!(item
            .test_command
            .ends_with(&*item.report_path.to_string_lossy()));
    }
}
