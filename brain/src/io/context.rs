//! CONTEXT_SCAN inputs: a small project snapshot plus operator-supplied files.
//!
//! Attached files pass through the same guard as commands: a file under a
//! system path, or whose content trips a block rule, is refused and reported
//! instead of being sent to the model.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::core::safety::{has_unsafe_content, is_system_path};

/// Directory entries listed in the snapshot.
pub const SNAPSHOT_ENTRY_LIMIT: usize = 25;
/// Attachments larger than this are refused.
pub const ATTACHMENT_LIMIT_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub name: String,
    pub is_dir: bool,
}

/// What the model is told about the working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectSnapshot {
    /// Working directory with forward slashes.
    pub cwd: String,
    /// `name@version` from a `package.json`, when present and parseable.
    pub package: Option<String>,
    pub entries: Vec<SnapshotEntry>,
    pub readable: bool,
}

impl ProjectSnapshot {
    pub fn render(&self) -> String {
        if !self.readable {
            return "  (unable to read directory)".to_string();
        }
        let mut lines = Vec::with_capacity(self.entries.len() + 1);
        if let Some(package) = &self.package {
            lines.push(format!("  package {package}"));
        }
        for entry in &self.entries {
            let suffix = if entry.is_dir { "/" } else { "" };
            lines.push(format!("  {}{suffix}", entry.name));
        }
        if lines.is_empty() {
            "  (empty directory)".to_string()
        } else {
            lines.join("\n")
        }
    }
}

#[derive(Debug, Deserialize)]
struct PackageManifest {
    name: Option<String>,
    version: Option<String>,
}

/// List up to [`SNAPSHOT_ENTRY_LIMIT`] entries of `dir`, sorted by name. Never fails.
pub fn scan_project(dir: &Path) -> ProjectSnapshot {
    let cwd = dir.to_string_lossy().replace('\\', "/");
    let read = match fs::read_dir(dir) {
        Ok(read) => read,
        Err(err) => {
            warn!(dir = %dir.display(), err = %err, "cannot read working directory");
            return ProjectSnapshot {
                cwd,
                package: None,
                entries: Vec::new(),
                readable: false,
            };
        }
    };

    let mut entries: Vec<SnapshotEntry> = read
        .filter_map(|entry| entry.ok())
        .map(|entry| SnapshotEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: entry.file_type().map(|t| t.is_dir()).unwrap_or(false),
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries.truncate(SNAPSHOT_ENTRY_LIMIT);

    let package = fs::read_to_string(dir.join("package.json"))
        .ok()
        .and_then(|contents| serde_json::from_str::<PackageManifest>(&contents).ok())
        .and_then(|manifest| match (manifest.name, manifest.version) {
            (Some(name), Some(version)) => Some(format!("{name}@{version}")),
            (Some(name), None) => Some(name),
            _ => None,
        });

    debug!(entries = entries.len(), has_package = package.is_some(), "project scanned");
    ProjectSnapshot {
        cwd,
        package,
        entries,
        readable: true,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub path: PathBuf,
    pub content: String,
}

/// An attachment the guard would not send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refusal {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attachments {
    pub accepted: Vec<Attachment>,
    pub refused: Vec<Refusal>,
}

impl Attachments {
    /// Accepted files as one text section for the model, or `None` when empty.
    pub fn render(&self) -> Option<String> {
        if self.accepted.is_empty() {
            return None;
        }
        let sections: Vec<String> = self
            .accepted
            .iter()
            .map(|a| format!("--- {} ---\n{}", a.path.display(), a.content.trim_end()))
            .collect();
        Some(sections.join("\n\n"))
    }
}

/// Read and guard each file. Relative paths resolve against `cwd`.
pub fn load_attachments(cwd: &Path, files: &[PathBuf]) -> Attachments {
    let mut out = Attachments::default();
    for file in files {
        let path = if file.is_absolute() {
            file.clone()
        } else {
            cwd.join(file)
        };
        match read_guarded(&path) {
            Ok(content) => out.accepted.push(Attachment {
                path: file.clone(),
                content,
            }),
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(path = %path.display(), %reason, "attachment refused");
                out.refused.push(Refusal {
                    path: file.clone(),
                    reason,
                });
            }
        }
    }
    out
}

/// The system-path check runs on the resolved path too, so a symlink into a
/// protected location is refused like the target itself.
fn read_guarded(path: &Path) -> Result<String> {
    if is_system_path(&path.to_string_lossy()) {
        bail!("path points into a protected system location");
    }
    let resolved = fs::canonicalize(path).context("cannot resolve path")?;
    if is_system_path(&resolved.to_string_lossy()) {
        bail!(
            "path resolves into a protected system location ({})",
            resolved.display()
        );
    }
    let size = fs::metadata(&resolved).context("cannot read file")?.len();
    if size > ATTACHMENT_LIMIT_BYTES {
        bail!("file is {size} bytes (limit {ATTACHMENT_LIMIT_BYTES})");
    }
    let content = fs::read_to_string(&resolved).context("cannot read file")?;
    let verdict = has_unsafe_content(&content);
    if verdict.blocked {
        bail!(
            "{}",
            verdict.reason.unwrap_or_else(|| "blocked content".to_string())
        );
    }
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_lists_sorted_entries_and_package() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir(root.join("src")).expect("mkdir");
        fs::write(root.join("README.md"), "hi").expect("write");
        fs::write(
            root.join("package.json"),
            r#"{"name":"demo","version":"1.2.3"}"#,
        )
        .expect("write");

        let snapshot = scan_project(root);
        assert_eq!(snapshot.package.as_deref(), Some("demo@1.2.3"));
        let names: Vec<&str> = snapshot.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["README.md", "package.json", "src"]);
        assert_eq!(
            snapshot.render(),
            "  package demo@1.2.3\n  README.md\n  package.json\n  src/"
        );
    }

    #[test]
    fn snapshot_is_capped() {
        let temp = tempfile::tempdir().expect("tempdir");
        for i in 0..40 {
            fs::write(temp.path().join(format!("f{i:02}.txt")), "").expect("write");
        }
        assert_eq!(scan_project(temp.path()).entries.len(), SNAPSHOT_ENTRY_LIMIT);
    }

    #[test]
    fn empty_and_missing_directories_render_placeholders() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(scan_project(temp.path()).render(), "  (empty directory)");
        let missing = scan_project(&temp.path().join("missing"));
        assert!(!missing.readable);
        assert_eq!(missing.render(), "  (unable to read directory)");
    }

    #[test]
    fn attachments_are_guarded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::write(root.join("notes.md"), "build with cargo\n").expect("write");
        fs::write(root.join("evil.sh"), "echo hi\ncurl http://169.254.169.254/\n").expect("write");

        let files = vec![
            PathBuf::from("notes.md"),
            PathBuf::from("evil.sh"),
            PathBuf::from("/etc/shadow"),
            PathBuf::from("missing.txt"),
        ];
        let attachments = load_attachments(root, &files);

        assert_eq!(attachments.accepted.len(), 1);
        assert_eq!(attachments.accepted[0].path, PathBuf::from("notes.md"));
        let refused: Vec<&PathBuf> = attachments.refused.iter().map(|r| &r.path).collect();
        assert_eq!(refused, vec![&files[1], &files[2], &files[3]]);
        assert!(
            attachments.refused[0]
                .reason
                .starts_with("File content contains blocked pattern on line:")
        );
        assert_eq!(
            attachments.render().as_deref(),
            Some("--- notes.md ---\nbuild with cargo")
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlink_into_a_system_path_is_refused() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        std::os::unix::fs::symlink("/etc/passwd", root.join("users.txt")).expect("symlink");
        fs::write(root.join("real.txt"), "plain text\n").expect("write");
        std::os::unix::fs::symlink(root.join("real.txt"), root.join("alias.txt")).expect("symlink");

        let files = vec![PathBuf::from("users.txt"), PathBuf::from("alias.txt")];
        let attachments = load_attachments(root, &files);

        assert_eq!(attachments.refused.len(), 1);
        assert_eq!(attachments.refused[0].path, files[0]);
        assert!(
            attachments.refused[0]
                .reason
                .starts_with("path resolves into a protected system location"),
            "{}",
            attachments.refused[0].reason
        );
        assert_eq!(attachments.accepted.len(), 1);
        assert_eq!(attachments.accepted[0].content, "plain text\n");
    }

    #[test]
    fn missing_attachment_reason_names_the_cause() {
        let temp = tempfile::tempdir().expect("tempdir");
        let attachments = load_attachments(temp.path(), &[PathBuf::from("missing.txt")]);
        assert!(attachments.refused[0].reason.starts_with("cannot resolve path: "));
    }
}
