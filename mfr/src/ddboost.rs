//! Storage endpoint backed by the DD Boost command line helper
//!
//! Every operation runs the helper program on this host. Operations on the remote endpoint are
//! the same helper invocations with `--remote` appended. The helper prints `key: value` lines for
//! configuration and stream counts, and an error line carrying a numeric vendor code on failure.

use std::sync::LazyLock;

use tracing::instrument;

use crate::endpoint::{EndpointError, EndpointKind, StorageEndpoint, ERR_NOT_FOUND};

pub const LOCAL_CONFIG_FILE: &str = "DDBOOST_CONFIG";
pub const REMOTE_CONFIG_FILE: &str = "DDBOOST_MFR_CONFIG";

const HOSTNAME_KEY: &str = "Data Domain Hostname";
const BACKUP_DIR_KEY: &str = "Default Backup Directory";
const STORAGE_UNIT_KEY: &str = "Data Domain Storage Unit";
const OUTBOUND_KEY: &str = "Replication Source Streams";
const INBOUND_KEY: &str = "Replication Destination Streams";
const IN_USE_KEY: &str = "Used Filecopy Streams";

pub const PING_COUNT: usize = 5;

static PACKET_LOSS: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new("packets transmitted.*received[^0-9]*([0-9]+)% packet loss").unwrap()
});

/// Default helper location: `$GPHOME/bin/gpddboost`, or `gpddboost` on the `PATH`.
#[must_use]
pub fn default_helper() -> std::path::PathBuf {
    match std::env::var_os("GPHOME") {
        Some(home) => std::path::Path::new(&home).join("bin").join("gpddboost"),
        None => std::path::PathBuf::from("gpddboost"),
    }
}

/// Quotes an argument for `bash -c` unless it only has characters that need no quoting.
#[must_use]
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Value of the first `key: value` line for `key`.
fn find_value<'a>(lines: &'a [String], key: &str) -> Option<&'a str> {
    lines.iter().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        if k.trim() != key {
            return None;
        }
        let v = v.trim();
        (!v.is_empty()).then_some(v)
    })
}

/// Packet loss percentage in `ping` output. Unrecognized output counts as total loss.
#[must_use]
pub fn packet_loss(output: &str) -> u32 {
    output
        .lines()
        .find_map(|line| PACKET_LOSS.captures(line)?[1].parse().ok())
        .unwrap_or_else(|| {
            tracing::error!("unexpected ping output, assuming 100% packet loss");
            100
        })
}

/// The command probing reachability of `host`.
#[must_use]
pub fn ping_command(host: &str) -> remote::Command {
    remote::Command::new(
        format!("ping {host}"),
        format!("ping -c {PING_COUNT} {}", shell_quote(host)),
        remote::Target::Local,
    )
}

#[derive(Debug)]
pub struct DdBoost {
    kind: EndpointKind,
    helper: std::path::PathBuf,
    hostname: String,
    backup_dir: String,
    storage_unit: String,
    outbound: tokio::sync::OnceCell<usize>,
    inbound: tokio::sync::OnceCell<usize>,
}

/// Where the helper program is and where its configuration lives.
#[derive(Debug, Clone)]
pub struct HelperConfig {
    pub helper: std::path::PathBuf,
    /// Directory holding the helper's configuration files, normally `$HOME`.
    pub config_home: std::path::PathBuf,
}

impl HelperConfig {
    pub fn from_env(helper: Option<std::path::PathBuf>) -> Result<Self, EndpointError> {
        let config_home = std::env::var_os("HOME")
            .map(std::path::PathBuf::from)
            .ok_or_else(|| EndpointError::Config("HOME is not set".to_string()))?;
        Ok(Self {
            helper: helper.unwrap_or_else(default_helper),
            config_home,
        })
    }
}

struct HelperOutput {
    command: String,
    rc: i32,
    lines: Vec<String>,
}

impl HelperOutput {
    fn check(self) -> Result<Vec<String>, EndpointError> {
        if self.rc != 0 {
            return Err(EndpointError::from_output(&self.command, &self.lines));
        }
        Ok(self.lines)
    }
}

async fn run_helper(
    helper: &std::path::Path,
    kind: EndpointKind,
    args: &[&str],
) -> Result<HelperOutput, EndpointError> {
    let mut command = std::iter::once(shell_quote(&helper.to_string_lossy()))
        .chain(args.iter().map(|arg| shell_quote(arg)))
        .collect::<Vec<_>>()
        .join(" ");
    if kind == EndpointKind::Remote {
        command.push_str(" --remote");
    }
    let mut cmd =
        remote::Command::new("DD Boost on master", command.clone(), remote::Target::Local);
    let result = cmd.run().await;
    if !result.completed {
        tracing::error!("failed to execute {}: {}", &command, result.stderr.trim());
        return Err(EndpointError::Exec {
            command,
            reason: result.stderr.trim().to_string(),
        });
    }
    if result.rc != 0 {
        // the caller decides whether the code printed by the helper is fatal
        tracing::info!("{} returned {}: {}", &command, result.rc, result.stderr.trim());
    }
    let lines = result
        .stdout
        .lines()
        .chain(result.stderr.lines())
        .map(str::to_string)
        .collect();
    Ok(HelperOutput {
        command,
        rc: result.rc,
        lines,
    })
}

impl DdBoost {
    /// Reads the endpoint configuration through the helper. `storage_unit` overrides the
    /// configured one.
    #[instrument(skip(config))]
    pub async fn connect(
        kind: EndpointKind,
        config: &HelperConfig,
        storage_unit: Option<String>,
    ) -> Result<Self, EndpointError> {
        check_config_exists(kind, &config.config_home).await?;
        let lines = run_helper(&config.helper, kind, &["--show-config"])
            .await?
            .check()?;
        let hostname = find_value(&lines, HOSTNAME_KEY)
            .ok_or_else(|| {
                EndpointError::Config("failed to obtain Data Domain configuration".to_string())
            })?
            .to_string();
        let mut backup_dir = find_value(&lines, BACKUP_DIR_KEY).map(str::to_string);
        let mut default_unit = find_value(&lines, STORAGE_UNIT_KEY).map(str::to_string);
        if kind == EndpointKind::Remote && (backup_dir.is_none() || default_unit.is_none()) {
            // the remote configuration may lack these, the local one always has them
            let local = run_helper(&config.helper, EndpointKind::Local, &["--show-config"])
                .await?
                .check()?;
            backup_dir =
                backup_dir.or_else(|| find_value(&local, BACKUP_DIR_KEY).map(str::to_string));
            default_unit = default_unit
                .or_else(|| find_value(&local, STORAGE_UNIT_KEY).map(str::to_string));
        }
        let backup_dir = backup_dir.ok_or_else(|| {
            EndpointError::Config(
                "failed to obtain backup directory from Data Domain configuration".to_string(),
            )
        })?;
        let storage_unit = storage_unit.or(default_unit).ok_or_else(|| {
            EndpointError::Config(
                "failed to obtain storage unit from Data Domain configuration".to_string(),
            )
        })?;
        tracing::info!(
            "{}({}): backup dir {}, storage unit {}",
            kind,
            &hostname,
            &backup_dir,
            &storage_unit
        );
        Ok(Self {
            kind,
            helper: config.helper.clone(),
            hostname,
            backup_dir,
            storage_unit,
            outbound: Default::default(),
            inbound: Default::default(),
        })
    }

    async fn run(&self, args: &[&str]) -> Result<HelperOutput, EndpointError> {
        run_helper(&self.helper, self.kind, args).await
    }

    async fn stream_count(&self, key: &str) -> Result<usize, EndpointError> {
        let output = self.run(&["--get_stream_counts"]).await?;
        let command = output.command.clone();
        let lines = output.check()?;
        find_value(&lines, key)
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| EndpointError::UnexpectedOutput {
                command,
                expected: key.to_string(),
            })
    }
}

async fn check_config_exists(
    kind: EndpointKind,
    config_home: &std::path::Path,
) -> Result<(), EndpointError> {
    let mut required = vec![(EndpointKind::Local, LOCAL_CONFIG_FILE)];
    if kind == EndpointKind::Remote {
        required.push((EndpointKind::Remote, REMOTE_CONFIG_FILE));
    }
    for (which, file) in required {
        let path = config_home.join(file);
        tracing::debug!("checking config exists: {:?}", &path);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let which = if which == EndpointKind::Local {
                "Local"
            } else {
                "Remote"
            };
            return Err(EndpointError::Config(format!(
                "{which} Data Domain configuration not found"
            )));
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl StorageEndpoint for DdBoost {
    fn kind(&self) -> EndpointKind {
        self.kind
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn backup_dir(&self) -> &str {
        &self.backup_dir
    }

    fn storage_unit(&self) -> &str {
        &self.storage_unit
    }

    async fn list_dir(&self, path: &str) -> Result<Option<Vec<String>>, EndpointError> {
        let unit = format!("--ddboost-storage-unit={}", self.storage_unit);
        match self.run(&["--ls", path, &unit]).await?.check() {
            Ok(lines) => Ok(Some(lines)),
            Err(error) if error.code() == Some(ERR_NOT_FOUND) => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn delete_file(&self, path: &str) -> Result<(), EndpointError> {
        let unit = format!("--ddboost-storage-unit={}", self.storage_unit);
        match self.run(&["--del-file", path, &unit]).await?.check() {
            Err(error) if error.code() != Some(ERR_NOT_FOUND) => Err(error),
            _ => Ok(()),
        }
    }

    async fn outbound_ceiling(&self) -> Result<usize, EndpointError> {
        self.outbound
            .get_or_try_init(|| self.stream_count(OUTBOUND_KEY))
            .await
            .copied()
    }

    async fn inbound_ceiling(&self) -> Result<usize, EndpointError> {
        self.inbound
            .get_or_try_init(|| self.stream_count(INBOUND_KEY))
            .await
            .copied()
    }

    async fn in_use_streams(&self) -> Result<usize, EndpointError> {
        self.stream_count(IN_USE_KEY).await
    }

    async fn probe_reachable(&self) -> Result<bool, EndpointError> {
        let mut cmd = ping_command(&self.hostname);
        let result = cmd.run().await;
        let loss = packet_loss(&format!("{}{}", result.stdout, result.stderr));
        tracing::debug!("{}: {}% packet loss", self.name(), loss);
        Ok(loss == 0)
    }

    async fn verify_credentials(&self) -> Result<(), EndpointError> {
        self.run(&["--verify", "--ddboost-storage-unit", &self.storage_unit])
            .await?
            .check()
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("/opt/gp/bin/gpddboost"), "/opt/gp/bin/gpddboost");
        assert_eq!(shell_quote("--ddboost-storage-unit=GPDB"), "--ddboost-storage-unit=GPDB");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn config_values() {
        let lines: Vec<String> = [
            "Data Domain Hostname:dd1.example.com",
            "Data Domain Boost Username:gpadmin",
            "Default Backup Directory: /backup/db",
            "Replication Source Streams : 60",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(find_value(&lines, HOSTNAME_KEY), Some("dd1.example.com"));
        assert_eq!(find_value(&lines, BACKUP_DIR_KEY), Some("/backup/db"));
        assert_eq!(find_value(&lines, OUTBOUND_KEY), Some("60"));
        assert_eq!(find_value(&lines, STORAGE_UNIT_KEY), None);
    }

    #[test]
    fn ping_loss() {
        let ok = "PING dd1 (10.0.0.1) 56(84) bytes of data.\n\
            --- dd1 ping statistics ---\n\
            5 packets transmitted, 5 received, 0% packet loss, time 4005ms\n";
        assert_eq!(packet_loss(ok), 0);
        let lossy = "5 packets transmitted, 3 received, 40% packet loss, time 4005ms";
        assert_eq!(packet_loss(lossy), 40);
        let errors = "5 packets transmitted, 0 received, +5 errors, 100% packet loss, time 4005ms";
        assert_eq!(packet_loss(errors), 100);
        assert_eq!(packet_loss("ping: unknown host dd1"), 100);
    }
}
