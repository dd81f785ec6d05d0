use std::path::{Component, Path};

use crate::TransferError;

/// Validates a local file name derived from remote input.
///
/// The name must be a single normal path component: no separators, no
/// `.`/`..`, no drive prefix and not empty.
pub fn validate_file_name(name: &str) -> Result<(), TransferError> {
    if name.is_empty() {
        return Err(TransferError::InvalidFileName("empty name".into()));
    }
    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(TransferError::InvalidFileName(format!(
            "separator not allowed: {name}"
        )));
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(TransferError::InvalidFileName(format!(
            "not a plain file name: {name}"
        ))),
    }
}
