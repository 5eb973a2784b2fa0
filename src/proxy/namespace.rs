//! Network-namespace allocation.
//!
//! Wraps the privileged `tunnel-ns` helper, which creates N network
//! namespaces, prints their names on stdout (whitespace-separated), closes
//! stdout, and then holds the namespaces open until its stdin reaches EOF.

use std::process::Stdio;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum NamespaceError {
    #[error("failed to run tunnel-ns: {0}")]
    Spawn(std::io::Error),
    #[error("tunnel-ns pipe error: {0}")]
    Pipe(#[from] std::io::Error),
    #[error("tunnel-ns exited prematurely (status {status:?})")]
    Premature { status: Option<i32> },
}

/// Holds N namespaces alive for the lifetime of the manager.
pub struct NamespaceManager {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    namespaces: Vec<String>,
}

impl NamespaceManager {
    /// Create `count` namespaces named with `prefix` and wait for them to be
    /// ready.
    pub async fn start(prefix: &str, count: usize) -> Result<Self, NamespaceError> {
        let mut child = Command::new("tunnel-ns")
            .arg(prefix)
            .arg(count.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(NamespaceError::Spawn)?;

        let stdin = child.stdin.take().expect("piped stdin");
        let mut stdout = child.stdout.take().expect("piped stdout");

        // tunnel-ns closes stdout once every namespace exists.
        let mut output = String::new();
        stdout.read_to_string(&mut output).await?;

        let namespaces: Vec<String> = output.split_whitespace().map(str::to_string).collect();
        if namespaces.len() != count {
            let status = child.try_wait().ok().flatten().and_then(|s| s.code());
            let _ = child.kill().await;
            return Err(NamespaceError::Premature { status });
        }
        debug!(?namespaces, "namespaces ready");

        Ok(Self {
            child: Some(child),
            stdin: Some(stdin),
            namespaces,
        })
    }

    pub fn namespaces(&self) -> &[String] {
        &self.namespaces
    }

    /// Release the namespaces: EOF on the helper's stdin, then reap it.
    pub async fn stop(&mut self) {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            match child.wait().await {
                Ok(status) if !status.success() => {
                    warn!(%status, "tunnel-ns exited abnormally");
                }
                Err(e) => warn!(error = %e, "failed to reap tunnel-ns"),
                _ => {}
            }
        }
        self.namespaces.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_helper_is_spawn_error() {
        // `tunnel-ns` will not be installed on a build machine.
        let result = NamespaceManager::start("testns", 2).await;
        if let Err(e) = result {
            assert!(matches!(
                e,
                NamespaceError::Spawn(_) | NamespaceError::Premature { .. }
            ));
        }
    }
}
