use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use tracing::debug;

use crate::credentials::SecretBackend;
use crate::error::{Error, Result};

const SERVICE: &str = "snapvault";
const ACCOUNT: &str = "repository-passphrase";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeychainTool {
    /// macOS `security` generic passwords.
    Security,
    /// libsecret `secret-tool` (GNOME keyring, KWallet via the Secret Service API).
    SecretTool,
}

impl KeychainTool {
    fn binary(self) -> &'static str {
        match self {
            Self::Security => "security",
            Self::SecretTool => "secret-tool",
        }
    }

    fn for_platform() -> Self {
        if cfg!(target_os = "macos") {
            Self::Security
        } else {
            Self::SecretTool
        }
    }
}

/// Passphrase held by the OS keychain, driven through its CLI.
#[derive(Debug, Clone)]
pub struct KeychainStore {
    tool: KeychainTool,
    service: String,
    account: String,
}

impl Default for KeychainStore {
    fn default() -> Self {
        Self::new(KeychainTool::for_platform(), SERVICE, ACCOUNT)
    }
}

impl KeychainStore {
    pub fn new(tool: KeychainTool, service: &str, account: &str) -> Self {
        Self {
            tool,
            service: service.to_string(),
            account: account.to_string(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(self.tool.binary());
        cmd.stdin(Stdio::null());
        cmd
    }

    fn lookup_cmd(&self) -> Command {
        let mut cmd = self.command();
        match self.tool {
            KeychainTool::Security => {
                cmd.arg("find-generic-password")
                    .arg("-s")
                    .arg(&self.service)
                    .arg("-a")
                    .arg(&self.account)
                    .arg("-w");
            }
            KeychainTool::SecretTool => {
                cmd.arg("lookup")
                    .arg("service")
                    .arg(&self.service)
                    .arg("account")
                    .arg(&self.account);
            }
        }
        cmd
    }

    fn delete_cmd(&self) -> Command {
        let mut cmd = self.command();
        match self.tool {
            KeychainTool::Security => {
                cmd.arg("delete-generic-password")
                    .arg("-s")
                    .arg(&self.service)
                    .arg("-a")
                    .arg(&self.account);
            }
            KeychainTool::SecretTool => {
                cmd.arg("clear")
                    .arg("service")
                    .arg(&self.service)
                    .arg("account")
                    .arg(&self.account);
            }
        }
        cmd
    }

    /// The secret travels on stdin, never in argv. `security -i` reads one
    /// command per line and takes the password hex-encoded via `-X`.
    fn store_cmd(&self, secret: &str) -> (Command, Vec<u8>) {
        let mut cmd = Command::new(self.tool.binary());
        match self.tool {
            KeychainTool::Security => {
                cmd.arg("-i");
                // -U updates an existing item in place.
                let line = format!(
                    "add-generic-password -U -s \"{}\" -a \"{}\" -X {}\n",
                    self.service,
                    self.account,
                    hex::encode(secret.as_bytes())
                );
                (cmd, line.into_bytes())
            }
            KeychainTool::SecretTool => {
                cmd.arg("store")
                    .arg("--label=snapvault repository passphrase")
                    .arg("service")
                    .arg(&self.service)
                    .arg("account")
                    .arg(&self.account);
                (cmd, secret.as_bytes().to_vec())
            }
        }
    }
}

impl SecretBackend for KeychainStore {
    fn name(&self) -> &'static str {
        "keychain"
    }

    fn is_available(&self) -> bool {
        find_in_path(self.tool.binary()).is_some()
    }

    fn get(&self) -> Option<String> {
        let out = run_command_output(&mut self.lookup_cmd()).ok()?;
        if !out.status.success() {
            debug!(tool = self.tool.binary(), "keychain lookup found nothing");
            return None;
        }
        let v = String::from_utf8_lossy(&out.stdout)
            .trim_end_matches(['\n', '\r'])
            .to_string();
        if v.trim().is_empty() { None } else { Some(v) }
    }

    fn set(&self, secret: &str) -> Result<()> {
        let (mut cmd, input) = self.store_cmd(secret);
        let out = run_with_stdin(&mut cmd, &input)?;
        if !out.status.success() {
            return Err(Error::msg(format!(
                "keychain store failed: {}",
                command_summary(&out)
            )));
        }
        // `security -i` exits 0 even when the command it read failed.
        if self.get().as_deref() != Some(secret) {
            return Err(Error::msg(format!(
                "keychain store failed: {}",
                command_summary(&out)
            )));
        }
        Ok(())
    }

    fn delete(&self) -> Result<bool> {
        let out = run_command_output(&mut self.delete_cmd())?;
        Ok(out.status.success())
    }
}

fn run_command_output(cmd: &mut Command) -> Result<Output> {
    cmd.output()
        .map_err(|e| Error::msg(format!("failed to run command {:?}: {e}", cmd.get_program())))
}

fn run_with_stdin(cmd: &mut Command, input: &[u8]) -> Result<Output> {
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::msg(format!("failed to run command {:?}: {e}", cmd.get_program())))?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input)?;
    }
    child
        .wait_with_output()
        .map_err(|e| Error::msg(format!("command {:?} failed: {e}", cmd.get_program())))
}

fn command_summary(out: &Output) -> String {
    let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
    if !stderr.is_empty() {
        return stderr;
    }
    format!("status {}", out.status)
}

pub(crate) fn find_in_path(binary: &str) -> Option<PathBuf> {
    if binary.contains('/') {
        let p = Path::new(binary);
        return p.is_file().then(|| p.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_args_per_tool() {
        let k = KeychainStore::new(KeychainTool::SecretTool, "svc", "acct");
        let cmd = k.lookup_cmd();
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(cmd.get_program(), "secret-tool");
        assert_eq!(args, ["lookup", "service", "svc", "account", "acct"]);

        let k = KeychainStore::new(KeychainTool::Security, "svc", "acct");
        let cmd = k.delete_cmd();
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(cmd.get_program(), "security");
        assert_eq!(args, ["delete-generic-password", "-s", "svc", "-a", "acct"]);
    }

    #[test]
    fn store_keeps_secret_out_of_argv() {
        let secret = "correct horse battery";
        for tool in [KeychainTool::Security, KeychainTool::SecretTool] {
            let (cmd, input) = KeychainStore::new(tool, "svc", "acct").store_cmd(secret);
            for arg in cmd.get_args() {
                assert!(!arg.to_string_lossy().contains("horse"), "{tool:?}: {arg:?}");
            }
            let input = String::from_utf8(input).unwrap();
            match tool {
                KeychainTool::Security => {
                    let args: Vec<_> =
                        cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
                    assert_eq!(args, ["-i"]);
                    assert_eq!(
                        input,
                        format!(
                            "add-generic-password -U -s \"svc\" -a \"acct\" -X {}\n",
                            hex::encode(secret)
                        )
                    );
                }
                KeychainTool::SecretTool => assert_eq!(input, secret),
            }
        }
    }

    #[cfg(unix)]
    #[test]
    fn find_in_path_accepts_explicit_paths() {
        assert!(find_in_path("/bin/sh").is_some());
        assert!(find_in_path("/definitely/not/here").is_none());
        assert!(find_in_path("snapvault-no-such-binary-xyz").is_none());
    }
}
