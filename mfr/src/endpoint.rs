//! The storage endpoint contract
//!
//! A storage endpoint is one of the two storage systems taking part in a replication: the `local`
//! one attached to this cluster and the `remote` one it replicates to. The scheduler only relies
//! on the operations of [`StorageEndpoint`], so tests can substitute fakes.

use std::sync::LazyLock;

static ERROR_CODE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(".*[eE]rr[^0-9]*([0-9]+)").unwrap());

/// Which side of the replication pair an endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    Local,
    Remote,
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            EndpointKind::Local => write!(f, "local"),
            EndpointKind::Remote => write!(f, "remote"),
        }
    }
}

pub const ERR_NOT_FOUND: u32 = 5004;
pub const ERR_NO_STREAMS: u32 = 5005;
pub const ERR_BAD_HOSTNAME: u32 = 5028;
pub const ERR_BAD_CREDENTIALS: u32 = 5075;

/// Explanation for the vendor error codes we know about.
#[must_use]
pub fn describe_code(code: &u32) -> &'static str {
    match *code {
        ERR_NOT_FOUND => ": Backup object not found on DD system.",
        ERR_NO_STREAMS => ": Not enough I/O streams available for file transfer.",
        ERR_BAD_HOSTNAME => ": Failed to connect to DD System, check hostname/IP address.",
        ERR_BAD_CREDENTIALS => {
            ": Failed to connect to DD System, check DD Boost username/password."
        }
        _ => "",
    }
}

/// Extracts the vendor error code from the first line that carries one.
pub fn parse_error_code<S: AsRef<str>>(lines: &[S]) -> Option<u32> {
    lines.iter().find_map(|line| {
        ERROR_CODE
            .captures(line.as_ref())
            .and_then(|caps| caps[1].parse().ok())
    })
}

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("DD Boost error {code}{}", describe_code(.code))]
    Vendor { code: u32 },
    #[error("DD Boost: unknown error running '{command}'")]
    Unknown { command: String, output: String },
    #[error("failed to execute '{command}': {reason}")]
    Exec { command: String, reason: String },
    #[error("unexpected output from '{command}', no match for '{expected}'")]
    UnexpectedOutput { command: String, expected: String },
    #[error("{0}")]
    Config(String),
}

impl EndpointError {
    /// Builds the error for a helper run that exited non-zero.
    pub fn from_output<S: AsRef<str>>(command: &str, lines: &[S]) -> Self {
        match parse_error_code(lines) {
            Some(code) => EndpointError::Vendor { code },
            None => EndpointError::Unknown {
                command: command.to_string(),
                output: lines
                    .iter()
                    .map(AsRef::as_ref)
                    .collect::<Vec<_>>()
                    .join("\n"),
            },
        }
    }

    #[must_use]
    pub fn code(&self) -> Option<u32> {
        match self {
            EndpointError::Vendor { code } => Some(*code),
            _ => None,
        }
    }
}

/// Operations a storage endpoint offers to the tools.
///
/// The stream ceilings are fetched at most once per endpoint object and cached, the in-use count
/// is re-queried on every call because other applications share the endpoint.
#[async_trait::async_trait]
pub trait StorageEndpoint: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> EndpointKind;

    fn hostname(&self) -> &str;

    /// Root directory holding the date directories of backups.
    fn backup_dir(&self) -> &str;

    fn storage_unit(&self) -> &str;

    /// Lines of the listing, or `None` when `path` does not exist.
    async fn list_dir(&self, path: &str) -> Result<Option<Vec<String>>, EndpointError>;

    /// Deleting a file that does not exist succeeds.
    async fn delete_file(&self, path: &str) -> Result<(), EndpointError>;

    /// Maximum number of streams this endpoint can use to send files.
    async fn outbound_ceiling(&self) -> Result<usize, EndpointError>;

    /// Maximum number of streams this endpoint can use to receive files.
    async fn inbound_ceiling(&self) -> Result<usize, EndpointError>;

    /// Streams currently used for file replication by anyone.
    async fn in_use_streams(&self) -> Result<usize, EndpointError>;

    async fn probe_reachable(&self) -> Result<bool, EndpointError>;

    /// Checks the configured credentials, creating the storage unit if needed. Idempotent.
    async fn verify_credentials(&self) -> Result<(), EndpointError>;

    /// `kind(hostname)`, as used in messages.
    fn name(&self) -> String {
        format!("{}({})", self.kind(), self.hostname())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        let lines = [
            "connecting...",
            "Error: ddp_open failed, err: 5004 (no such file)",
            "err 5075",
        ];
        assert_eq!(parse_error_code(&lines), Some(5004));
        assert_eq!(parse_error_code(&["ERR 12"]), None);
        assert_eq!(parse_error_code(&["Err=42"]), Some(42));
        assert_eq!(parse_error_code::<&str>(&[]), None);
    }

    #[test]
    fn known_codes_are_explained() {
        let error = EndpointError::from_output("helper --ls", &["err 5005"]);
        assert_eq!(error.code(), Some(ERR_NO_STREAMS));
        assert_eq!(
            error.to_string(),
            "DD Boost error 5005: Not enough I/O streams available for file transfer."
        );
        let error = EndpointError::from_output("helper --ls", &["err 1234"]);
        assert_eq!(error.to_string(), "DD Boost error 1234");
        let error = EndpointError::from_output("helper --ls", &["segfault"]);
        assert!(matches!(error, EndpointError::Unknown { .. }));
    }
}
