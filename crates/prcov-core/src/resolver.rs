//! Test resolution: map a changed source file to the tests that exercise it.
//!
//! Three interchangeable strategies share one contract, `source -> candidates`:
//!
//! - [`ResolverStrategy::Sibling`] scans the source's own directory for files
//!   named after the source that carry a test marker (`foo.test.ts`).
//! - [`ResolverStrategy::TestDirectory`] walks `__tests__` / `tests`
//!   directories next to the source (and up to `ascend` ancestors) for files
//!   named after the source.
//! - [`ResolverStrategy::RunnerDelegation`] asks the project's test runner for
//!   related tests and reads one path per stdout line.
//!
//! Resolution never fails. Filesystem and subprocess errors become warnings on
//! the returned [`Resolution`] and contribute no candidates.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures::future::join_all;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::domain::{file_stem, ChangedFile, TestAssociation};

/// Directory names searched by [`ResolverStrategy::TestDirectory`].
pub const TEST_DIR_NAMES: [&str; 2] = ["__tests__", "tests"];

/// Substrings that mark a file name as a test, matched case-insensitively.
pub const TEST_MARKERS: [&str; 2] = ["test", "spec"];

pub const DEFAULT_ASCEND_LEVELS: usize = 1;

/// A test resolution strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverStrategy {
    /// Same-directory files whose stem contains the source stem and a test marker.
    Sibling,
    /// Files under recognised test directories whose stem contains the source stem.
    TestDirectory {
        /// Ancestors of the source directory also inspected.
        ascend: usize,
    },
    /// External "related tests" query; the absolute source path is appended.
    RunnerDelegation { command: Vec<String> },
}

impl ResolverStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            ResolverStrategy::Sibling => "sibling",
            ResolverStrategy::TestDirectory { .. } => "test-dir",
            ResolverStrategy::RunnerDelegation { .. } => "runner",
        }
    }
}

/// Candidates for one source file plus anything that went wrong finding them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub candidates: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

impl Resolution {
    fn push_unique(&mut self, seen: &mut HashSet<PathBuf>, candidate: PathBuf) {
        if seen.insert(candidate.clone()) {
            self.candidates.push(candidate);
        }
    }
}

/// Associations for a whole change set.
#[derive(Debug, Clone, Default)]
pub struct ResolutionReport {
    /// Unique by (source, test), in first-seen order.
    pub associations: Vec<TestAssociation>,
    pub warnings: Vec<String>,
    /// Changed files skipped because they are tests themselves.
    pub skipped_tests: usize,
}

/// Whether `path` names a test: its stem contains a [`TEST_MARKERS`] entry,
/// ignoring case (`foo.test.ts`, `test_foo.py`, `FooTest.java`, `barTests.ts`).
pub fn is_test_file(path: &Path) -> bool {
    let stem = file_stem(path).to_ascii_lowercase();
    TEST_MARKERS.iter().any(|marker| stem.contains(marker))
}

/// Resolves changed files to test files relative to a workspace root.
///
/// Holds no mutable state; one resolver can serve any number of concurrent
/// `resolve` calls.
#[derive(Debug, Clone)]
pub struct TestResolver {
    root: PathBuf,
    strategies: Vec<ResolverStrategy>,
}

impl TestResolver {
    pub fn new(root: impl Into<PathBuf>, strategies: Vec<ResolverStrategy>) -> Self {
        Self {
            root: root.into(),
            strategies,
        }
    }

    /// Candidate tests for `source`, combined across strategies in order.
    pub async fn resolve(&self, source: &Path) -> Resolution {
        let mut resolution = Resolution::default();

        if is_test_file(source) {
            debug!(source = %source.display(), "source is a test file; not resolving");
            return resolution;
        }
        if file_stem(source).is_empty() {
            return resolution;
        }

        let mut seen = HashSet::new();
        for strategy in &self.strategies {
            let found = match strategy {
                ResolverStrategy::Sibling => self.sibling_candidates(source, &mut resolution).await,
                ResolverStrategy::TestDirectory { ascend } => {
                    self.test_dir_candidates(source, *ascend, &mut resolution)
                        .await
                }
                ResolverStrategy::RunnerDelegation { command } => {
                    self.runner_candidates(source, command, &mut resolution)
                        .await
                }
            };
            debug!(
                source = %source.display(),
                strategy = strategy.name(),
                found = found.len(),
                "strategy finished"
            );
            for candidate in found {
                resolution.push_unique(&mut seen, candidate);
            }
        }

        resolution
    }

    /// Resolve every changed file concurrently and pair the results.
    pub async fn resolve_all(&self, changed: &[ChangedFile]) -> ResolutionReport {
        let resolutions = join_all(changed.iter().map(|file| async move {
            let resolution = self.resolve(&file.path).await;
            (file, resolution)
        }))
        .await;

        let mut report = ResolutionReport::default();
        let mut seen = HashSet::new();
        for (file, resolution) in resolutions {
            if is_test_file(&file.path) {
                report.skipped_tests += 1;
            }
            info!(
                source = %file.path.display(),
                tests = resolution.candidates.len(),
                "resolved related tests"
            );
            for test in resolution.candidates {
                let association = TestAssociation::new(file.path.clone(), test);
                if seen.insert(association.clone()) {
                    report.associations.push(association);
                }
            }
            report.warnings.extend(resolution.warnings);
        }
        report
    }

    async fn sibling_candidates(&self, source: &Path, resolution: &mut Resolution) -> Vec<PathBuf> {
        let dir = source.parent().unwrap_or_else(|| Path::new(""));
        let source_stem = file_stem(source);
        let source_name = source.file_name();

        let entries = match list_files(&self.root.join(dir)).await {
            Ok(entries) => entries,
            Err(e) => {
                record_warning(
                    resolution,
                    format!("cannot list {} for {}: {e}", dir.display(), source.display()),
                );
                return Vec::new();
            }
        };

        let mut found: Vec<PathBuf> = entries
            .into_iter()
            .filter(|name| Some(name.as_os_str()) != source_name)
            .filter(|name| {
                let path = Path::new(name);
                file_stem(path).contains(&source_stem) && is_test_file(path)
            })
            .map(|name| dir.join(name))
            .collect();
        found.sort();
        found
    }

    async fn test_dir_candidates(
        &self,
        source: &Path,
        ascend: usize,
        resolution: &mut Resolution,
    ) -> Vec<PathBuf> {
        let source_stem = file_stem(source);
        let start = source.parent().unwrap_or_else(|| Path::new(""));

        let mut found = Vec::new();
        for base in start.ancestors().take(ascend + 1) {
            for name in TEST_DIR_NAMES {
                let test_dir = base.join(name);
                let mut matches = self
                    .walk_matching(&test_dir, &source_stem, source, resolution)
                    .await;
                matches.sort();
                found.extend(matches);
            }
        }
        found
    }

    /// Recursively collect files under `dir` whose stem contains `stem`.
    async fn walk_matching(
        &self,
        dir: &Path,
        stem: &str,
        source: &Path,
        resolution: &mut Resolution,
    ) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let mut pending = vec![dir.to_path_buf()];

        while let Some(current) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(self.root.join(&current)).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    record_warning(
                        resolution,
                        format!("cannot read {}: {e}", current.display()),
                    );
                    continue;
                }
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        record_warning(
                            resolution,
                            format!("cannot read {}: {e}", current.display()),
                        );
                        break;
                    }
                };
                let file_type = match entry.file_type().await {
                    Ok(ft) => ft,
                    Err(_) => continue,
                };
                let relative = current.join(entry.file_name());
                if file_type.is_dir() {
                    pending.push(relative);
                } else if file_type.is_file()
                    && relative != source
                    && file_stem(&relative).contains(stem)
                {
                    found.push(relative);
                }
            }
        }
        found
    }

    async fn runner_candidates(
        &self,
        source: &Path,
        command: &[String],
        resolution: &mut Resolution,
    ) -> Vec<PathBuf> {
        let Some((program, args)) = command.split_first() else {
            record_warning(resolution, "related-tests command is empty".to_string());
            return Vec::new();
        };

        let abs_root = tokio::fs::canonicalize(&self.root)
            .await
            .unwrap_or_else(|_| self.root.clone());
        let abs_source = abs_root.join(source);

        let output = Command::new(program)
            .args(args)
            .arg(&abs_source)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                record_warning(
                    resolution,
                    format!("failed to run {program} for {}: {e}", source.display()),
                );
                return Vec::new();
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            record_warning(
                resolution,
                format!(
                    "failed to find related tests for {}: {program} exited with {}: {}",
                    source.display(),
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            );
            return Vec::new();
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_runner_output(&stdout, &abs_root)
    }
}

/// One path per non-blank line, first occurrence wins. Absolute paths under
/// `abs_root` are made relative to it.
fn parse_runner_output(stdout: &str, abs_root: &Path) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let path = Path::new(line);
            path.strip_prefix(abs_root)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| path.to_path_buf())
        })
        .filter(|path| seen.insert(path.clone()))
        .collect()
}

async fn list_files(dir: &Path) -> io::Result<Vec<std::ffi::OsString>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            names.push(entry.file_name());
        }
    }
    Ok(names)
}

fn record_warning(resolution: &mut Resolution, message: String) {
    warn!("{message}");
    resolution.warnings.push(message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "").unwrap();
    }

    #[test]
    fn test_marker_detection() {
        assert!(is_test_file(Path::new("src/foo.test.ts")));
        assert!(is_test_file(Path::new("src/foo.spec.js")));
        assert!(is_test_file(Path::new("pkg/test_foo.py")));
        assert!(is_test_file(Path::new("pkg/foo_test.go")));
        assert!(is_test_file(Path::new("src/FooTest.java")));
        assert!(is_test_file(Path::new("src/barTests.ts")));
        assert!(is_test_file(Path::new("src/FooSpec.scala")));
        assert!(!is_test_file(Path::new("src/foo.ts")));
    }

    #[tokio::test]
    async fn test_sibling_finds_marked_neighbour() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "src/foo.ts");
        touch(dir.path(), "src/foo.test.ts");
        touch(dir.path(), "src/bar.test.ts");
        touch(dir.path(), "src/foo.helpers.ts");

        let resolver = TestResolver::new(dir.path(), vec![ResolverStrategy::Sibling]);
        let resolution = resolver.resolve(Path::new("src/foo.ts")).await;

        assert_eq!(resolution.candidates, vec![PathBuf::from("src/foo.test.ts")]);
        assert!(resolution.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_sibling_matches_camel_case_markers() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "src/Foo.java");
        touch(dir.path(), "src/FooTest.java");
        touch(dir.path(), "src/bar.ts");
        touch(dir.path(), "src/barTests.ts");

        let resolver = TestResolver::new(dir.path(), vec![ResolverStrategy::Sibling]);
        assert_eq!(
            resolver.resolve(Path::new("src/Foo.java")).await.candidates,
            vec![PathBuf::from("src/FooTest.java")]
        );
        assert_eq!(
            resolver.resolve(Path::new("src/bar.ts")).await.candidates,
            vec![PathBuf::from("src/barTests.ts")]
        );
        assert!(resolver
            .resolve(Path::new("src/FooTest.java"))
            .await
            .candidates
            .is_empty());
    }

    #[tokio::test]
    async fn test_sibling_skips_directories() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "src/foo.ts");
        fs::create_dir_all(dir.path().join("src/foo.test.d")).unwrap();

        let resolver = TestResolver::new(dir.path(), vec![ResolverStrategy::Sibling]);
        let resolution = resolver.resolve(Path::new("src/foo.ts")).await;
        assert!(resolution.candidates.is_empty());
    }

    #[tokio::test]
    async fn test_test_file_resolves_to_nothing() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "src/foo.test.ts");
        touch(dir.path(), "src/foo.test.snapshot.ts");

        let resolver = TestResolver::new(
            dir.path(),
            vec![
                ResolverStrategy::Sibling,
                ResolverStrategy::TestDirectory { ascend: 1 },
            ],
        );
        let resolution = resolver.resolve(Path::new("src/foo.test.ts")).await;
        assert_eq!(resolution, Resolution::default());
    }

    #[tokio::test]
    async fn test_missing_directory_is_a_warning_not_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = TestResolver::new(dir.path(), vec![ResolverStrategy::Sibling]);
        let resolution = resolver.resolve(Path::new("gone/foo.ts")).await;

        assert!(resolution.candidates.is_empty());
        assert_eq!(resolution.warnings.len(), 1);
        assert!(resolution.warnings[0].contains("gone"));
    }

    #[tokio::test]
    async fn test_test_dir_search_descends() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "src/foo.ts");
        touch(dir.path(), "src/__tests__/foo.test.ts");
        touch(dir.path(), "src/__tests__/unit/foo.more.ts");
        touch(dir.path(), "src/__tests__/bar.test.ts");

        let resolver = TestResolver::new(
            dir.path(),
            vec![ResolverStrategy::TestDirectory { ascend: 0 }],
        );
        let resolution = resolver.resolve(Path::new("src/foo.ts")).await;

        let mut found = resolution.candidates.clone();
        found.sort();
        assert_eq!(
            found,
            vec![
                PathBuf::from("src/__tests__/foo.test.ts"),
                PathBuf::from("src/__tests__/unit/foo.more.ts"),
            ]
        );
        assert!(resolution.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_test_dir_search_ascends() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "src/lib/foo.ts");
        touch(dir.path(), "src/tests/foo_test.ts");

        let shallow = TestResolver::new(
            dir.path(),
            vec![ResolverStrategy::TestDirectory { ascend: 0 }],
        );
        assert!(shallow
            .resolve(Path::new("src/lib/foo.ts"))
            .await
            .candidates
            .is_empty());

        let deep = TestResolver::new(
            dir.path(),
            vec![ResolverStrategy::TestDirectory { ascend: 1 }],
        );
        assert_eq!(
            deep.resolve(Path::new("src/lib/foo.ts")).await.candidates,
            vec![PathBuf::from("src/tests/foo_test.ts")]
        );
    }

    #[tokio::test]
    async fn test_no_test_dirs_yields_empty_without_warnings() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "src/foo.ts");
        touch(dir.path(), "src/other/foo.test.ts");

        let resolver = TestResolver::new(
            dir.path(),
            vec![ResolverStrategy::TestDirectory { ascend: 3 }],
        );
        let resolution = resolver.resolve(Path::new("src/foo.ts")).await;
        assert!(resolution.candidates.is_empty());
        assert!(resolution.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_runner_output_parsed_and_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "printf 'src/a.test.ts\\n\\n  src/b.test.ts\\nsrc/a.test.ts\\n'".to_string(),
        ];
        let resolver = TestResolver::new(
            dir.path(),
            vec![ResolverStrategy::RunnerDelegation { command }],
        );
        let resolution = resolver.resolve(Path::new("src/a.ts")).await;

        assert_eq!(
            resolution.candidates,
            vec![PathBuf::from("src/a.test.ts"), PathBuf::from("src/b.test.ts")]
        );
    }

    #[tokio::test]
    async fn test_runner_receives_absolute_source_path() {
        let dir = tempfile::tempdir().unwrap();
        // The appended source path becomes $0 of the script.
        let command = vec!["sh".to_string(), "-c".to_string(), "echo \"$0\"".to_string()];
        let resolver = TestResolver::new(
            dir.path(),
            vec![ResolverStrategy::RunnerDelegation { command }],
        );
        let resolution = resolver.resolve(Path::new("src/a.ts")).await;
        assert_eq!(resolution.candidates, vec![PathBuf::from("src/a.ts")]);
    }

    #[tokio::test]
    async fn test_runner_failure_becomes_warning() {
        let dir = tempfile::tempdir().unwrap();
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo boom >&2; exit 3".to_string(),
        ];
        let resolver = TestResolver::new(
            dir.path(),
            vec![ResolverStrategy::RunnerDelegation { command }],
        );
        let resolution = resolver.resolve(Path::new("src/a.ts")).await;

        assert!(resolution.candidates.is_empty());
        assert_eq!(resolution.warnings.len(), 1);
        assert!(resolution.warnings[0].contains("boom"));
    }

    #[tokio::test]
    async fn test_runner_missing_binary_becomes_warning() {
        let dir = tempfile::tempdir().unwrap();
        let command = vec!["prcov-no-such-test-runner".to_string()];
        let resolver = TestResolver::new(
            dir.path(),
            vec![ResolverStrategy::RunnerDelegation { command }],
        );
        let resolution = resolver.resolve(Path::new("src/a.ts")).await;
        assert!(resolution.candidates.is_empty());
        assert!(resolution.warnings[0].contains("prcov-no-such-test-runner"));
    }

    #[tokio::test]
    async fn test_strategies_combine_without_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "src/foo.ts");
        touch(dir.path(), "src/foo.test.ts");
        touch(dir.path(), "src/tests/foo.spec.ts");
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo src/foo.test.ts".to_string(),
        ];

        let resolver = TestResolver::new(
            dir.path(),
            vec![
                ResolverStrategy::Sibling,
                ResolverStrategy::TestDirectory { ascend: 0 },
                ResolverStrategy::RunnerDelegation { command },
            ],
        );
        let resolution = resolver.resolve(Path::new("src/foo.ts")).await;
        assert_eq!(
            resolution.candidates,
            vec![
                PathBuf::from("src/foo.test.ts"),
                PathBuf::from("src/tests/foo.spec.ts"),
            ]
        );
    }

    #[tokio::test]
    async fn test_resolution_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "src/foo.ts");
        touch(dir.path(), "src/foo.test.ts");
        touch(dir.path(), "src/foo.spec.ts");
        touch(dir.path(), "src/__tests__/foo.test.ts");

        let resolver = TestResolver::new(
            dir.path(),
            vec![
                ResolverStrategy::Sibling,
                ResolverStrategy::TestDirectory { ascend: 1 },
            ],
        );
        let first = resolver.resolve(Path::new("src/foo.ts")).await;
        let second = resolver.resolve(Path::new("src/foo.ts")).await;
        assert_eq!(first, second);
        assert_eq!(first.candidates.len(), 3);
    }

    #[tokio::test]
    async fn test_resolve_all_pairs_and_counts_skipped_tests() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "src/foo.ts");
        touch(dir.path(), "src/foo.test.ts");
        touch(dir.path(), "src/bar.ts");

        let resolver = TestResolver::new(dir.path(), vec![ResolverStrategy::Sibling]);
        let changed = vec![
            ChangedFile::new("src/foo.ts"),
            ChangedFile::new("src/foo.test.ts"),
            ChangedFile::new("src/bar.ts"),
        ];
        let report = resolver.resolve_all(&changed).await;

        assert_eq!(
            report.associations,
            vec![TestAssociation::new("src/foo.ts", "src/foo.test.ts")]
        );
        assert_eq!(report.skipped_tests, 1);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_parse_runner_output_strips_root() {
        let root = Path::new("/work/repo");
        let parsed = parse_runner_output("/work/repo/src/a.test.ts\n/elsewhere/b.test.ts\n", root);
        assert_eq!(
            parsed,
            vec![
                PathBuf::from("src/a.test.ts"),
                PathBuf::from("/elsewhere/b.test.ts"),
            ]
        );
    }
}
