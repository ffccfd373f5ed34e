use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use supercli_core::tool::Error as ToolError;

/// The directory the file and shell tools are confined to.
#[derive(Clone, Debug)]
pub struct Workspace {
    root: Arc<PathBuf>,
}

impl Workspace {
    /// Creates a workspace rooted at `root`, which must be an existing
    /// directory.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().canonicalize()?;
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("{} is not a directory", root.display()),
            ));
        }
        Ok(Self {
            root: Arc::new(root),
        })
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a path given by the model against the root.
    ///
    /// Relative paths are taken from the root. `..` components and symbolic
    /// links are resolved before checking, so neither can be used to leave
    /// the root.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, ToolError> {
        let path = path.trim();
        if path.is_empty() {
            return Err(ToolError::invalid_input()
                .with_reason("`path` must not be empty"));
        }
        let normalized = normalize(&self.root.join(path));
        let resolved = canonicalize_existing_prefix(&normalized);
        if !resolved.starts_with(self.root.as_path()) {
            return Err(ToolError::permission_denied().with_reason(format!(
                "`{path}` is outside the working directory {}",
                self.root.display()
            )));
        }
        Ok(resolved)
    }
}

/// Removes `.` and `..` components without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalizes the longest existing ancestor of `path` and appends the
/// remaining components. Paths that do not exist yet (e.g. a file about to
/// be written) still get their links resolved this way.
fn canonicalize_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut rest = vec![];
    loop {
        if let Ok(mut canonical) = existing.canonicalize() {
            for part in rest.iter().rev() {
                canonical.push(part);
            }
            return canonical;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_owned());
                existing = parent;
            }
            _ => return path.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use supercli_core::tool::ErrorKind;

    use super::*;

    #[test]
    fn test_resolve_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        let workspace = Workspace::new(dir.path()).unwrap();
        let root = workspace.root().to_owned();

        assert_eq!(workspace.resolve("src").unwrap(), root.join("src"));
        assert_eq!(
            workspace.resolve("./src/../src/new.rs").unwrap(),
            root.join("src/new.rs")
        );
        assert_eq!(workspace.resolve(".").unwrap(), root);
        let absolute = root.join("src").display().to_string();
        assert_eq!(workspace.resolve(&absolute).unwrap(), root.join("src"));
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(dir.path()).unwrap();

        for path in ["..", "../etc/passwd", "/etc/passwd", "a/../../b"] {
            let err = workspace.resolve(path).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::PermissionDenied, "{path}");
        }
        assert_eq!(
            workspace.resolve("  ").unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_rejects_symlink_escape() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(outside.path(), link).unwrap();
        let workspace = Workspace::new(dir.path()).unwrap();

        let err = workspace.resolve("link/secret.txt").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }
}
