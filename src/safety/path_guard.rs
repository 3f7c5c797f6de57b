//! Workspace containment for file-tool paths.
//!
//! A user may only touch paths inside their own workspace directory
//! (`<root>/<user_id>`). The workspace root itself and the cross-user
//! `<root>/_shared` directory are refused even when they would otherwise be
//! reachable.

use std::path::{Component, Path, PathBuf};

use serde::Serialize;

/// Name of the cross-user directory under the workspace root.
pub const SHARED_DIR: &str = "_shared";

/// Outcome of a containment check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PathCheck {
    /// Safe; carries the resolved path.
    Allowed { resolved: PathBuf },
    Denied { reason: String },
}

impl PathCheck {
    fn denied(reason: &str) -> Self {
        Self::Denied {
            reason: reason.to_string(),
        }
    }

    pub fn is_safe(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Allowed { .. } => None,
            Self::Denied { reason } => Some(reason),
        }
    }
}

fn push_component(out: &mut PathBuf, component: &Component<'_>) {
    match component {
        Component::ParentDir => {
            out.pop();
        }
        Component::CurDir => {}
        other => out.push(other.as_os_str()),
    }
}

/// Resolve symlinks and `..` the way `realpath` does, tolerating a missing
/// tail: the longest existing prefix is canonicalized and the remainder is
/// applied lexically.
pub fn resolve(path: &Path) -> PathBuf {
    if let Ok(real) = path.canonicalize() {
        return real;
    }

    let components: Vec<Component<'_>> = path.components().collect();
    for split in (1..components.len()).rev() {
        let prefix: PathBuf = components[..split].iter().collect();
        if let Ok(mut real) = prefix.canonicalize() {
            for component in &components[split..] {
                push_component(&mut real, component);
            }
            return real;
        }
    }

    let mut out = PathBuf::new();
    for component in &components {
        push_component(&mut out, component);
    }
    out
}

/// Containment checker rooted at the global workspace directory.
#[derive(Debug, Clone)]
pub struct PathGuard {
    workspace_root: PathBuf,
}

impl PathGuard {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// A user's own workspace directory.
    pub fn user_workspace(&self, user_id: &str) -> PathBuf {
        self.workspace_root.join(user_id)
    }

    /// Make `input` absolute against `cwd`.
    ///
    /// An absolute `<root>/<file>` from a user whose cwd is `<root>/<id>` is
    /// taken to mean `<root>/<id>/<file>`. Paths that already name a
    /// numeric user directory are left alone.
    pub fn normalize(&self, input: &str, cwd: &Path) -> PathBuf {
        let input_path = Path::new(input);
        if !input_path.is_absolute() {
            return cwd.join(input_path);
        }

        let Some(user_id) = cwd
            .strip_prefix(&self.workspace_root)
            .ok()
            .and_then(|rest| rest.to_str())
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
        else {
            return input_path.to_path_buf();
        };

        let Ok(rest) = input_path.strip_prefix(&self.workspace_root) else {
            return input_path.to_path_buf();
        };
        let mut parts = rest.components();
        let Some(Component::Normal(first)) = parts.next() else {
            return input_path.to_path_buf();
        };
        let first = first.to_string_lossy();
        let names_user_dir = first == user_id
            || (parts.next().is_some() && first.bytes().all(|b| b.is_ascii_digit()));
        if names_user_dir {
            return input_path.to_path_buf();
        }

        let fixed = cwd.join(rest);
        tracing::info!(
            input,
            fixed = %fixed.display(),
            "Rewrote path into user workspace"
        );
        fixed
    }

    /// Check that `path` stays inside `cwd` and away from the protected
    /// directories.
    pub fn check(&self, path: &Path, cwd: &Path) -> PathCheck {
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            cwd.join(path)
        };
        let resolved = resolve(&joined);
        let resolved_cwd = resolve(cwd);
        let root = resolve(&self.workspace_root);

        if !resolved.starts_with(&resolved_cwd) || !resolved.starts_with(&root) {
            return PathCheck::denied("Path outside workspace");
        }
        if resolved == root {
            return PathCheck::denied("Cannot access workspace root");
        }
        if resolved.starts_with(root.join(SHARED_DIR)) {
            return PathCheck::denied("Cannot access shared folder");
        }
        PathCheck::Allowed { resolved }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn fixture() -> (tempfile::TempDir, PathGuard, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir_all(root.join("123")).unwrap();
        std::fs::create_dir_all(root.join("456")).unwrap();
        std::fs::create_dir_all(root.join(SHARED_DIR)).unwrap();
        std::fs::write(root.join("123/notes.txt"), "hi").unwrap();
        let guard = PathGuard::new(&root);
        let cwd = root.join("123");
        (dir, guard, cwd)
    }

    #[test]
    fn test_normalize_relative() {
        let guard = PathGuard::new("/workspace");
        assert_eq!(
            guard.normalize("src/main.py", Path::new("/workspace/123")),
            PathBuf::from("/workspace/123/src/main.py")
        );
    }

    #[test]
    fn test_normalize_fixes_missing_user_id() {
        let guard = PathGuard::new("/workspace");
        let cwd = Path::new("/workspace/123");
        assert_eq!(
            guard.normalize("/workspace/file.txt", cwd),
            PathBuf::from("/workspace/123/file.txt")
        );
        assert_eq!(
            guard.normalize("/workspace/123/file.txt", cwd),
            PathBuf::from("/workspace/123/file.txt")
        );
        // Another user's directory is not rewritten; the check rejects it.
        assert_eq!(
            guard.normalize("/workspace/456/file.txt", cwd),
            PathBuf::from("/workspace/456/file.txt")
        );
        assert_eq!(guard.normalize("/etc/passwd", cwd), PathBuf::from("/etc/passwd"));
    }

    #[test]
    fn test_inside_workspace_is_allowed() {
        let (_dir, guard, cwd) = fixture();
        let check = guard.check(Path::new("notes.txt"), &cwd);
        assert!(check.is_safe());
        // Missing files are still checked by their would-be location.
        assert!(guard.check(Path::new("new/dir/file.txt"), &cwd).is_safe());
    }

    #[test]
    fn test_escape_is_denied() {
        let (_dir, guard, cwd) = fixture();
        let check = guard.check(Path::new("../456/secret.txt"), &cwd);
        assert_eq!(check.reason(), Some("Path outside workspace"));
        let check = guard.check(Path::new("/etc/passwd"), &cwd);
        assert_eq!(check.reason(), Some("Path outside workspace"));
        let check = guard.check(Path::new("does/not/../../../exist"), &cwd);
        assert_eq!(check.reason(), Some("Path outside workspace"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_is_denied() {
        let (_dir, guard, cwd) = fixture();
        std::os::unix::fs::symlink(guard.workspace_root().join("456"), cwd.join("link")).unwrap();
        let check = guard.check(Path::new("link/file.txt"), &cwd);
        assert_eq!(check.reason(), Some("Path outside workspace"));
    }

    #[test]
    fn test_root_and_shared_are_denied() {
        let (_dir, guard, _) = fixture();
        let root = guard.workspace_root().to_path_buf();

        let check = guard.check(&root, &root);
        assert_eq!(check.reason(), Some("Cannot access workspace root"));

        let check = guard.check(&root.join("_shared/doc.md"), &root);
        assert_eq!(check.reason(), Some("Cannot access shared folder"));
    }
}
