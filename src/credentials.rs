//! Gateway credentials kept in a TOML secrets file.
//!
//! ```toml
//! username = "someone@example.com"
//! password = "hunter2"
//! ```
//!
//! The password never shows up in `Debug` output or in logs.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use veil::Redact;

use crate::error::{Error, Result};

#[derive(Clone, PartialEq, Eq, Hash, Deserialize, Serialize, Redact)]
pub struct Credentials {
    pub username: String,

    #[redact]
    pub password: String,
}

impl Credentials {
    /// Secrets files are tiny; anything larger is not one.
    const MAX_FILE_SIZE: u64 = 1024;

    /// Name of the secrets file in the configuration directory.
    const FILE_NAME: &'static str = "credentials.toml";

    /// Platform specific location of the secrets file, if there is a
    /// configuration directory.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(env!("CARGO_PKG_NAME")).join(Self::FILE_NAME))
    }

    /// Loads credentials from `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is larger than 1 KiB,
    /// is not valid TOML, or has an empty username or password.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Prevent out-of-memory condition: secrets files should be small.
        let file_size = fs::metadata(path)?.len();
        if file_size > Self::MAX_FILE_SIZE {
            return Err(Error::out_of_range(format!(
                "{} is too large ({file_size} bytes)",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)?;
        contents.parse()
    }
}

impl std::str::FromStr for Credentials {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let credentials: Self = toml::from_str(s)?;

        if credentials.username.is_empty() {
            return Err(Error::invalid_argument("username is empty"));
        }
        if credentials.password.is_empty() {
            return Err(Error::invalid_argument("password is empty"));
        }

        Ok(credentials)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn password_is_redacted() {
        let credentials: Credentials = "username = \"someone\"\npassword = \"hunter2\""
            .parse()
            .unwrap();

        assert_eq!(credentials.username, "someone");
        let debug = format!("{credentials:?}");
        assert!(debug.contains("someone"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn missing_password_is_rejected() {
        let err = "username = \"someone\"".parse::<Credentials>().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        let err = "username = \"someone\"\npassword = \"\""
            .parse::<Credentials>()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn oversized_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "username = \"{}\"", "x".repeat(2048)).unwrap();
        writeln!(file, "password = \"hunter2\"").unwrap();

        let err = Credentials::from_file(file.path()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::OutOfRange);
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = Credentials::from_file(dir.path().join("credentials.toml")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
