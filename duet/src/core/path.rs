//! Lexical path normalization used to harden paths read back from state.

use std::path::{Component, Path, PathBuf};

/// Join `path` onto `base` when relative and fold `.`/`..` components.
///
/// Purely lexical: symlinks are not consulted and `..` never climbs above the
/// filesystem root.
pub fn normalize_lexically(path: &Path, base: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => normalized.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if normalized.parent().is_some() {
                    normalized.pop();
                }
            }
            Component::Normal(part) => normalized.push(part),
        }
    }
    normalized
}

/// True when `candidate` equals or lies below one of `roots`.
pub fn is_within_any(candidate: &Path, roots: &[PathBuf]) -> bool {
    roots.iter().any(|root| candidate.starts_with(root))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_join_the_base() {
        let path = normalize_lexically(Path::new("runs/./a/../b"), Path::new("/work"));
        assert_eq!(path, PathBuf::from("/work/runs/b"));
    }

    #[test]
    fn parent_components_cannot_escape_the_root() {
        let path = normalize_lexically(Path::new("/../../etc/passwd"), Path::new("/work"));
        assert_eq!(path, PathBuf::from("/etc/passwd"));
    }

    #[test]
    fn traversal_out_of_a_root_is_detected() {
        let roots = vec![PathBuf::from("/work")];
        let inside = normalize_lexically(Path::new("task.md"), Path::new("/work"));
        let outside = normalize_lexically(Path::new("../secrets/task.md"), Path::new("/work"));
        assert!(is_within_any(&inside, &roots));
        assert!(!is_within_any(&outside, &roots));
    }

    /// `starts_with` compares whole components, not string prefixes.
    #[test]
    fn sibling_prefixes_are_not_inside() {
        let roots = vec![PathBuf::from("/work")];
        assert!(!is_within_any(Path::new("/workshop/x"), &roots));
    }
}
