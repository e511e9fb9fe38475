use std::net::TcpStream;
use std::process::Stdio;
use std::time::Duration as StdDuration;

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// One VM shell endpoint. `user` is normally the low-privilege application
/// account; first-boot detection swaps in the platform account instead.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub ip: String,
    pub port: i32,
    pub user: String,
}

impl SshTarget {
    pub fn new(ip: &str, port: i32, user: &str) -> Self {
        Self {
            ip: clean_ip(ip).to_string(),
            port,
            user: user.to_string(),
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.ip)
    }
}

/// Registry stores INET values that may carry a prefix length.
pub fn clean_ip(ip: &str) -> &str {
    ip.split('/').next().unwrap_or(ip).trim()
}

pub fn ssh_key_path() -> String {
    std::env::var("FLEET_SSH_KEY_FILE").unwrap_or_else(|_| "/app/.ssh/fleet-key".to_string())
}

fn base_command(target: &SshTarget, connect_timeout_secs: u32) -> Command {
    let mut cmd = Command::new("ssh");
    cmd.arg("-i")
        .arg(ssh_key_path())
        .arg("-o")
        .arg("StrictHostKeyChecking=no")
        .arg("-o")
        .arg("UserKnownHostsFile=/dev/null")
        .arg("-o")
        .arg(format!("ConnectTimeout={connect_timeout_secs}"))
        .arg("-p")
        .arg(target.port.to_string())
        .arg(target.destination());
    cmd
}

/// Run a bash script on the target over piped stdin, bounded by `timeout`.
pub async fn run_script(
    target: &SshTarget,
    script: &str,
    timeout: StdDuration,
) -> anyhow::Result<std::process::Output> {
    let mut child = base_command(target, 10)
        .arg("bash -s")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("ssh spawn failed")?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(script.as_bytes())
            .await
            .context("ssh stdin write failed")?;
    }

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(out) => out.context("ssh wait failed"),
        Err(_) => anyhow::bail!("ssh script timed out after {}s", timeout.as_secs()),
    }
}

/// Run a single remote command (no stdin), capturing raw stdout bytes.
/// Used for streaming archives back without a second copy on the VM.
pub async fn run_command(
    target: &SshTarget,
    command: &str,
    timeout: StdDuration,
) -> anyhow::Result<std::process::Output> {
    let child = base_command(target, 10)
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("ssh spawn failed")?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(out) => out.context("ssh wait failed"),
        Err(_) => anyhow::bail!("ssh command timed out after {}s", timeout.as_secs()),
    }
}

/// TCP reachability probe against the shell port.
pub async fn check_port(ip: &str, port: i32) -> bool {
    let addr = format!("{}:{}", clean_ip(ip), port);
    tokio::task::spawn_blocking(move || {
        let socket_addr = match addr.parse() {
            Ok(a) => a,
            Err(_) => return false,
        };
        TcpStream::connect_timeout(&socket_addr, StdDuration::from_secs(3)).is_ok()
    })
    .await
    .unwrap_or(false)
}

pub fn tail_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    // Keep last max_chars characters (best effort for UTF-8).
    s.chars()
        .rev()
        .take(max_chars)
        .collect::<String>()
        .chars()
        .rev()
        .collect()
}

/// Scripts emit progress as "::phase::<name>" lines.
pub fn extract_phases(stdout: &str) -> Vec<String> {
    let mut phases = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("::phase::") {
            let name = rest.trim();
            if !name.is_empty() {
                phases.push(name.to_string());
            }
        }
    }
    phases
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_ip_strips_prefix_length() {
        assert_eq!(clean_ip("203.0.113.9/32"), "203.0.113.9");
        assert_eq!(clean_ip(" 203.0.113.9 "), "203.0.113.9");
    }

    #[test]
    fn tail_keeps_last_chars() {
        assert_eq!(tail_str("abcdef", 3), "def");
        assert_eq!(tail_str("ab", 3), "ab");
    }

    #[test]
    fn phases_parse_in_order() {
        let out = "noise\n::phase::stop_runtime\nmore\n::phase::onboard\n::phase:: \n";
        assert_eq!(extract_phases(out), vec!["stop_runtime", "onboard"]);
    }
}
