use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ignore::WalkBuilder;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{Tool, ToolError};

const TOOL_NAME: &str = "GlobTool";

/// The walk stops after this many matches.
const MAX_RESULTS: usize = 200;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FindFilesParams {
    name_pattern: Option<String>,
    file_type: Option<String>,
    max_depth: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Any,
    File,
    Directory,
}

impl EntryKind {
    fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("f") => EntryKind::File,
            Some("d") => EntryKind::Directory,
            _ => EntryKind::Any,
        }
    }
}

/// Finds files and directories under a root by case-insensitive name match,
/// honouring `.gitignore` and friends.
pub struct FindFilesTool {
    root: PathBuf,
}

impl FindFilesTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Tool for FindFilesTool {
    fn name(&self) -> &str {
        TOOL_NAME
    }

    fn description(&self) -> &str {
        "GlobTool finds files based on pattern matching."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "namePattern": {
                    "type": "string",
                    "description": "name of the file or directory"
                },
                "fileType": {
                    "type": ["string", "null"],
                    "description": "search for files (f), directories (d), or both (null)."
                },
                "maxDepth": {
                    "type": "integer",
                    "minimum": 0,
                    "description": "how many directory levels below the root to search"
                }
            }
        })
    }

    fn action(&self) -> &str {
        "Using file search tool..."
    }

    async fn invoke(
        &self,
        arguments: Value,
        cancel: CancellationToken,
    ) -> Result<Vec<String>, ToolError> {
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled(TOOL_NAME.to_string()));
        }
        let params: FindFilesParams =
            serde_json::from_value(arguments).map_err(|err| ToolError::InvalidArguments {
                tool: TOOL_NAME.to_string(),
                message: err.to_string(),
            })?;

        let root = self.root.clone();
        tokio::task::spawn_blocking(move || find_files(&root, &params, &cancel))
            .await
            .map_err(|err| ToolError::Execution {
                tool: TOOL_NAME.to_string(),
                message: err.to_string(),
            })?
    }
}

fn find_files(
    root: &Path,
    params: &FindFilesParams,
    cancel: &CancellationToken,
) -> Result<Vec<String>, ToolError> {
    if !root.exists() {
        return Err(ToolError::Execution {
            tool: TOOL_NAME.to_string(),
            message: format!("path '{}' does not exist", root.display()),
        });
    }

    let pattern = params
        .name_pattern
        .as_deref()
        .map(str::trim)
        .filter(|pattern| !pattern.is_empty())
        .map(str::to_lowercase);
    let kind = EntryKind::parse(params.file_type.as_deref());

    let mut builder = WalkBuilder::new(root);
    builder
        .standard_filters(true)
        .max_depth(params.max_depth)
        .sort_by_file_name(|a, b| a.cmp(b));

    let mut results = Vec::new();
    for entry in builder.build() {
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled(TOOL_NAME.to_string()));
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "Skipping unreadable entry during file search");
                continue;
            }
        };
        if entry.depth() == 0 {
            continue;
        }

        let is_dir = entry.file_type().is_some_and(|file_type| file_type.is_dir());
        let keep_kind = match kind {
            EntryKind::Any => true,
            EntryKind::File => !is_dir,
            EntryKind::Directory => is_dir,
        };
        if !keep_kind {
            continue;
        }

        if let Some(pattern) = &pattern {
            let name = entry.file_name().to_string_lossy().to_lowercase();
            if !name.contains(pattern.as_str()) {
                continue;
            }
        }

        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        results.push(relative.to_string_lossy().into_owned());
        if results.len() == MAX_RESULTS {
            warn!(limit = MAX_RESULTS, "File search truncated");
            break;
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fixture() -> TempDir {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let root = temp_dir.path();
        fs::create_dir_all(root.join("docs/guides")).expect("mkdir");
        fs::write(root.join("README.md"), "readme").expect("write");
        fs::write(root.join("docs/Readme-extra.txt"), "more").expect("write");
        fs::write(root.join("docs/guides/setup.md"), "setup").expect("write");
        temp_dir
    }

    async fn run(tool: &FindFilesTool, arguments: Value) -> Vec<String> {
        tool.invoke(arguments, CancellationToken::new())
            .await
            .expect("search succeeds")
    }

    #[tokio::test]
    async fn name_match_is_case_insensitive_and_relative() {
        let dir = fixture();
        let tool = FindFilesTool::new(dir.path());
        let found = run(&tool, json!({"namePattern": "readme"})).await;
        let expected_nested = Path::new("docs").join("Readme-extra.txt");
        assert_eq!(
            found,
            vec![
                "README.md".to_string(),
                expected_nested.to_string_lossy().into_owned()
            ]
        );
    }

    #[tokio::test]
    async fn file_type_filters_directories() {
        let dir = fixture();
        let tool = FindFilesTool::new(dir.path());
        let dirs = run(&tool, json!({"fileType": "d"})).await;
        let expected_guides = Path::new("docs").join("guides");
        assert_eq!(
            dirs,
            vec![
                "docs".to_string(),
                expected_guides.to_string_lossy().into_owned()
            ]
        );
    }

    #[tokio::test]
    async fn max_depth_limits_the_walk() {
        let dir = fixture();
        let tool = FindFilesTool::new(dir.path());
        let shallow = run(&tool, json!({"fileType": "f", "maxDepth": 1})).await;
        assert_eq!(shallow, vec!["README.md".to_string()]);
    }

    #[tokio::test]
    async fn missing_root_is_an_error() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let tool = FindFilesTool::new(dir.path().join("absent"));
        let err = tool
            .invoke(json!({}), CancellationToken::new())
            .await
            .expect_err("missing root");
        assert!(matches!(err, ToolError::Execution { .. }));
    }
}
