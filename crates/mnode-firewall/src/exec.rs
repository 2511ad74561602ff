//! Rule Executor
//!
//! The only boundary between the firewall engines and the OS packet
//! filter. Every rule change ends up as one invocation of an external
//! tool (`iptables`, `ipset`) with an argument list.
//!
//! Anything implementing [`RuleExecutor`] can be injected, including a
//! plain closure, so the engines can be exercised without root or the
//! tools installed.

use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Default location of the iptables binary
pub const IPTABLES_PATH: &str = "/sbin/iptables";

/// Default location of the ipset binary
pub const IPSET_PATH: &str = "/sbin/ipset";

/// Failure of a single packet filter invocation
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {}: {output}", exit_code(.code))]
    Failed {
        command: String,
        code: Option<i32>,
        output: String,
    },
}

fn exit_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| format!("status {c}"))
}

/// Runs the packet filter tool with the given arguments and returns its
/// stdout split into lines.
pub trait RuleExecutor: Send + Sync {
    fn exec(&self, args: &[String]) -> Result<Vec<String>, ExecError>;
}

impl<F> RuleExecutor for F
where
    F: Fn(&[String]) -> Result<Vec<String>, ExecError> + Send + Sync,
{
    fn exec(&self, args: &[String]) -> Result<Vec<String>, ExecError> {
        self(args)
    }
}

/// Executor backed by a real process, optionally prefixed with `sudo`
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    tool: PathBuf,
    sudo: bool,
}

impl CommandExecutor {
    /// Create an executor for an arbitrary tool
    pub fn new(tool: impl Into<PathBuf>, sudo: bool) -> Self {
        Self {
            tool: tool.into(),
            sudo,
        }
    }

    /// `sudo /sbin/iptables`
    pub fn iptables() -> Self {
        Self::new(IPTABLES_PATH, true)
    }

    /// `sudo /sbin/ipset`
    pub fn ipset() -> Self {
        Self::new(IPSET_PATH, true)
    }

    /// Path of the wrapped tool
    pub fn tool(&self) -> &Path {
        &self.tool
    }

    fn command(&self) -> Command {
        if self.sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg(&self.tool);
            cmd
        } else {
            Command::new(&self.tool)
        }
    }

    fn describe(&self, args: &[String]) -> String {
        let prefix = if self.sudo { "sudo " } else { "" };
        format!("{}{} {}", prefix, self.tool.display(), args.join(" "))
    }
}

impl RuleExecutor for CommandExecutor {
    fn exec(&self, args: &[String]) -> Result<Vec<String>, ExecError> {
        let command = self.describe(args);
        debug!(cmd = %command, "executing");

        let output = self
            .command()
            .args(args)
            .output()
            .map_err(|source| ExecError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            let combined = combined.trim().to_string();
            debug!(cmd = %command, output = %combined, "command failed");
            return Err(ExecError::Failed {
                command,
                code: output.status.code(),
                output: combined,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_owned)
            .collect())
    }
}

/// Owned argument list from string slices
pub(crate) fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}
