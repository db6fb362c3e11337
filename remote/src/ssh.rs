//! Wrapping of command lines for execution over ssh

/// How many times a rejected ssh handshake is retried.
pub const MAX_RETRY: usize = 10;

pub const RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(500);

const TRANSIENT_HANDSHAKE_FAILURES: [&str; 2] = [
    "ssh_exchange_identification: Connection closed by remote host",
    "kex_exchange_identification: Connection closed by remote host",
];

/// True when the remote sshd dropped the connection during identification, usually because
/// too many unauthenticated connections were pending. Nothing else is worth retrying.
#[must_use]
pub fn is_transient_handshake_failure(stderr: &str) -> bool {
    TRANSIENT_HANDSHAKE_FAILURES
        .iter()
        .any(|prefix| stderr.starts_with(prefix))
}

/// Escapes a command line so it survives one level of double quoting in the local shell.
#[must_use]
pub fn escape(cmd: &str) -> String {
    let mut escaped = String::with_capacity(cmd.len());
    for c in cmd.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Prepends environment bindings to a command line.
#[must_use]
pub fn with_env_prefix(env: &[(String, String)], cmd: &str) -> String {
    if env.is_empty() {
        return cmd.to_string();
    }
    let exports = env
        .iter()
        .map(|(key, value)| format!("export {key}=\"{value}\""))
        .collect::<Vec<_>>()
        .join(" && ");
    format!("{exports} && {cmd}")
}

/// Builds the local command line that runs `cmd` on `host`.
#[must_use]
pub fn wrap(host: &str, cmd: &str) -> String {
    format!(
        "ssh -o 'StrictHostKeyChecking no' -o 'ServerAliveInterval 60' {host} \"{}\"",
        escape(cmd)
    )
}
