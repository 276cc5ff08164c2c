use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::outcome::Failure;
use crate::service::{Service, VerifyError};

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Compiles a pattern from the configuration, naming the service on failure.
pub fn compile(service: &Service, pattern: &str) -> Result<Regex, VerifyError> {
    Regex::new(pattern).map_err(|e| VerifyError::Regex {
        service: service.name.clone(),
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Run-time counterpart of [compile]; the pattern was already validated.
pub fn regex(pattern: &str) -> Result<Regex, Failure> {
    Regex::new(pattern).map_err(|e| Failure::new("error compiling regex", e.to_string()))
}

/// Single-quotes a value for `sh`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Output matches either exactly after trimming, or by regex search.
pub fn output_matches(actual: &str, expected: &str, use_regex: bool) -> Result<bool, Failure> {
    if use_regex {
        Ok(regex(expected)?.is_match(actual))
    } else {
        Ok(actual.trim() == expected.trim())
    }
}

/// A file fetched from the target and compared against a hash or a pattern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RemoteFile {
    pub name: String,
    /// Hex SHA-256 of the expected content.
    pub hash: String,
    pub regex: String,
}

impl RemoteFile {
    pub fn validate(&self, service: &Service) -> Result<(), VerifyError> {
        if self.name.is_empty() {
            return Err(service.invalid("file without a name"));
        }
        if !self.hash.is_empty() && !self.regex.is_empty() {
            return Err(service.invalid(format!(
                "file {} cannot have both a hash and a regex",
                self.name
            )));
        }
        if !self.regex.is_empty() {
            compile(service, &self.regex)?;
        }
        Ok(())
    }

    pub fn compare(&self, content: &[u8]) -> Result<String, Failure> {
        if !self.hash.is_empty() {
            let actual = sha256_hex(content);
            if !actual.eq_ignore_ascii_case(&self.hash) {
                return Err(Failure::new(
                    "file hash did not match",
                    format!("{} hashed to {}, expected {}", self.name, actual, self.hash),
                ));
            }
            return Ok(format!("{} matched the expected hash", self.name));
        }
        if !self.regex.is_empty() {
            let text = String::from_utf8_lossy(content);
            if !regex(&self.regex)?.is_match(&text) {
                return Err(Failure::new(
                    "couldn't find regex in file",
                    format!("couldn't find regex {:?} in {}", self.regex, self.name),
                ));
            }
            return Ok(format!("{} matched {}", self.name, self.regex));
        }
        Ok(format!("retrieved {} ({} bytes)", self.name, content.len()))
    }
}
