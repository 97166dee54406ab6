//! Working-directory resolution constrained to allowed roots.

use crate::error::MachineError;
use std::path::{Component, Path, PathBuf};

use super::Machine;

/// Lexically normalize `path` (collapse `.`, `..` and duplicate separators).
pub fn normalize_path(path: &str) -> String {
    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() && !path.starts_with('/') {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    let rendered = out.to_string_lossy().to_string();
    if !rendered.is_empty() {
        rendered
    } else if path.starts_with('/') {
        "/".into()
    } else {
        ".".into()
    }
}

/// Join `new_path` onto `current_workdir`.
///
/// `~` paths are treated as absolute and left unexpanded so the machine
/// that owns the home directory expands them.
fn join_candidate(current_workdir: &str, new_path: &str) -> String {
    if new_path.starts_with('~') || new_path.starts_with('/') {
        normalize_path(new_path)
    } else {
        normalize_path(&format!("{current_workdir}/{new_path}"))
    }
}

/// Component-wise containment check (`/srv/app2` is not inside `/srv/app`).
pub fn is_within(child: &str, root: &str) -> bool {
    Path::new(child).starts_with(Path::new(root))
}

/// Resolve a `cd` request on `machine`, rejecting targets outside `allowed_roots`.
pub async fn resolve_cd(
    machine: &dyn Machine,
    current_workdir: &str,
    new_path: &str,
    allowed_roots: &[String],
) -> Result<String, MachineError> {
    let candidate = join_candidate(current_workdir, new_path);
    let resolved = machine.realpath(&candidate).await?;
    let mut roots = Vec::with_capacity(allowed_roots.len());
    for root in allowed_roots {
        roots.push(machine.realpath(root).await?);
    }
    if roots.iter().any(|root| is_within(&resolved, root)) {
        Ok(resolved)
    } else {
        let listed = if roots.is_empty() {
            "(none)".to_string()
        } else {
            roots.join(", ")
        };
        Err(MachineError::CdNotAllowed(format!(
            "{resolved} is outside allowed_roots ({listed})"
        )))
    }
}
