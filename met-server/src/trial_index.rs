//! The externally maintained trial-index file (spec §6): a single text
//! file holding the current trial index as a decimal integer, read fresh
//! at the moment the router synthesizes `mstart` (spec §4.1 step 4).

use std::path::{Path, PathBuf};

use met_proto::MetError;

pub struct TrialIndexFile {
    path: PathBuf,
}

impl TrialIndexFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        TrialIndexFile { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current value. Any parse failure is an internal error: the
    /// file's shape is a contract with the out-of-scope session-management
    /// tooling that maintains it, not user input.
    pub fn read(&self) -> Result<u16, MetError> {
        let text = std::fs::read_to_string(&self.path).map_err(|_| MetError::Syser)?;
        text.trim().parse::<u16>().map_err(|_| MetError::Intrn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_current_decimal_value() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "42\n").unwrap();
        let idx = TrialIndexFile::new(file.path());
        assert_eq!(idx.read().unwrap(), 42);
    }

    #[test]
    fn non_decimal_contents_is_internal_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not-a-number").unwrap();
        let idx = TrialIndexFile::new(file.path());
        assert_eq!(idx.read().unwrap_err(), MetError::Intrn);
    }
}
