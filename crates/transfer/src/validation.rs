use std::path::{Component, Path};

use crate::TransferError;

/// Validates a logical entry name taken from an archive or a destination
/// mapping, so that extracting it cannot escape the destination directory.
///
/// Rejects:
/// - Empty names
/// - Absolute names (`/etc/passwd`, `C:\...`)
/// - Parent directory traversal (`..`)
/// - Backslashes and NUL bytes, which mean different things per platform
pub fn validate_entry_name(name: &str) -> Result<(), TransferError> {
    if name.is_empty() {
        return Err(TransferError::InvalidPath("empty entry name".into()));
    }
    if name.contains('\\') || name.contains('\0') {
        return Err(TransferError::InvalidPath(format!(
            "illegal character in entry name: {name:?}"
        )));
    }

    let path = Path::new(name);
    if path.is_absolute() {
        return Err(TransferError::InvalidPath(format!(
            "absolute entry name not allowed: {name}"
        )));
    }

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {name}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute entry name not allowed: {name}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}
