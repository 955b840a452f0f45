//! Input checks run before a file reaches the automation host.

use crate::config::ValidationConfig;
use crate::error::ValidationFailure;
use crate::host::HostKind;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Windows sharing / lock violation codes.
const ERROR_SHARING_VIOLATION: i32 = 32;
const ERROR_LOCK_VIOLATION: i32 = 33;

/// Decides whether an input may be converted.
///
/// Richer file-security checks live in a collaborator that implements this
/// trait; the pool only needs the verdict.
pub trait InputValidator: Send + Sync {
    fn validate(&self, path: &Path) -> Result<(), ValidationFailure>;
}

/// Existence, format, size and lock checks.
#[derive(Debug, Clone)]
pub struct BasicValidator {
    max_input_bytes: u64,
}

impl BasicValidator {
    pub fn new(config: &ValidationConfig) -> Self {
        Self {
            max_input_bytes: config.max_input_bytes,
        }
    }

    /// Office writes `~$name.docx` beside a file it has open for editing.
    /// The owner file replaces the first two characters of long names.
    fn owner_lock_exists(path: &Path) -> bool {
        let (Some(dir), Some(name)) = (path.parent(), path.file_name().and_then(|n| n.to_str()))
        else {
            return false;
        };
        let mut candidates = vec![format!("~${}", name)];
        if name.chars().count() > 6 {
            let tail: String = name.chars().skip(2).collect();
            candidates.push(format!("~${}", tail));
        }
        candidates.iter().any(|c| dir.join(c).is_file())
    }

    fn classify_open_error(path: &Path, e: io::Error) -> ValidationFailure {
        match e.raw_os_error() {
            Some(ERROR_SHARING_VIOLATION) | Some(ERROR_LOCK_VIOLATION) => {
                ValidationFailure::Locked(path.to_path_buf())
            }
            _ if e.kind() == io::ErrorKind::NotFound => {
                ValidationFailure::NotFound(path.to_path_buf())
            }
            _ => ValidationFailure::Unreadable {
                path: path.to_path_buf(),
                message: e.to_string(),
            },
        }
    }
}

impl Default for BasicValidator {
    fn default() -> Self {
        Self::new(&ValidationConfig::default())
    }
}

impl InputValidator for BasicValidator {
    fn validate(&self, path: &Path) -> Result<(), ValidationFailure> {
        if !path.exists() {
            return Err(ValidationFailure::NotFound(path.to_path_buf()));
        }

        if HostKind::for_path(path).is_none() {
            let extension = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_string();
            return Err(ValidationFailure::Unsupported {
                path: path.to_path_buf(),
                extension,
            });
        }

        let metadata = std::fs::metadata(path).map_err(|e| Self::classify_open_error(path, e))?;
        if !metadata.is_file() {
            return Err(ValidationFailure::Unreadable {
                path: path.to_path_buf(),
                message: "not a regular file".to_string(),
            });
        }
        if metadata.len() == 0 {
            return Err(ValidationFailure::Empty(path.to_path_buf()));
        }
        if metadata.len() > self.max_input_bytes {
            return Err(ValidationFailure::TooLarge {
                path: path.to_path_buf(),
                size: metadata.len(),
                limit: self.max_input_bytes,
            });
        }

        if Self::owner_lock_exists(path) {
            return Err(ValidationFailure::Locked(path.to_path_buf()));
        }

        // Opening and reading a byte surfaces sharing violations.
        let mut file = File::open(path).map_err(|e| Self::classify_open_error(path, e))?;
        let mut probe = [0u8; 1];
        file.read(&mut probe)
            .map_err(|e| Self::classify_open_error(path, e))?;

        Ok(())
    }
}
