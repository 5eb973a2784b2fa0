//! Proxy-set management for the live-capture mode.
//!
//! Each vantage point is realized by a proxy manager: a stub for `direct`,
//! a supervised OpenVPN tunnel for `ovpn`. Managers run inside network
//! namespaces, restart on crash with exponential backoff, and surface
//! online/offline transitions to the capture dispatcher as events.

pub mod config;
pub mod namespace;

use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use self::config::{parse_proxy_config, ProxyConfigError, ProxyMethod, ProxySpec};
pub use self::namespace::{NamespaceError, NamespaceManager};

use crate::retry::Backoff;

/// Helper invoked to bring up one OpenVPN tunnel inside a namespace:
/// `openvpn-ns <namespace> <config> [extra args…]`. It prints `READY` on
/// stdout once the tunnel routes traffic.
const OPENVPN_HELPER: &str = "openvpn-ns";

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("proxy quit during startup")]
    DiedDuringStartup,
    #[error(transparent)]
    Namespace(#[from] NamespaceError),
}

/// Online/offline transitions, tagged with the vantage-point label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
    Online(String),
    Offline(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Down,
    Starting,
    Up,
    Stopping,
    Closed,
}

/// One supervised vantage point.
#[async_trait]
pub trait ProxyManager: Send {
    fn label(&self) -> &str;
    fn state(&self) -> ProxyState;

    /// Rewrite a worker command so its traffic uses this proxy.
    fn adjust_command(&self, cmd: Vec<String>) -> Vec<String>;

    /// Bring the proxy up inside `namespace` and wait for readiness.
    async fn start(&mut self, namespace: &str) -> Result<(), ProxyError>;

    /// Signal the proxy to stop. Calling it again escalates.
    fn stop(&mut self);

    /// Wait until the proxy has terminated.
    async fn wait(&mut self);
}

/// Stub manager letting traffic emanate directly from this machine.
pub struct DirectProxy {
    label: String,
    state: ProxyState,
    stopped: std::sync::Arc<tokio::sync::Notify>,
}

impl DirectProxy {
    pub fn new(label: String) -> Self {
        Self {
            label,
            state: ProxyState::Down,
            stopped: std::sync::Arc::new(tokio::sync::Notify::new()),
        }
    }
}

#[async_trait]
impl ProxyManager for DirectProxy {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> ProxyState {
        self.state
    }

    fn adjust_command(&self, cmd: Vec<String>) -> Vec<String> {
        cmd
    }

    async fn start(&mut self, _namespace: &str) -> Result<(), ProxyError> {
        info!(label = self.label, "direct: online");
        self.state = ProxyState::Up;
        Ok(())
    }

    fn stop(&mut self) {
        if self.state == ProxyState::Up {
            info!(label = self.label, "direct: offline");
        }
        self.state = ProxyState::Closed;
        // notify_one stores a permit, so a stop() before wait() still wakes
        // the waiter.
        self.stopped.notify_one();
    }

    async fn wait(&mut self) {
        // Nothing runs; "termination" is the stop() call itself.
        while self.state == ProxyState::Up {
            self.stopped.notified().await;
        }
    }
}

/// OpenVPN tunnel supervisor. Configs rotate round-robin across restarts so
/// a dead endpoint doesn't wedge the vantage point.
pub struct OpenvpnProxy {
    label: String,
    spec: ProxyMethod,
    namespace: Option<String>,
    child: Option<Child>,
    state: ProxyState,
    stop_requested: bool,
}

impl OpenvpnProxy {
    pub fn new(label: String, spec: ProxyMethod) -> Self {
        debug_assert!(matches!(spec, ProxyMethod::Openvpn { .. }));
        Self {
            label,
            spec,
            namespace: None,
            child: None,
            state: ProxyState::Down,
            stop_requested: false,
        }
    }

    fn next_config(&mut self) -> (std::path::PathBuf, Vec<String>) {
        match &mut self.spec {
            ProxyMethod::Openvpn {
                configs,
                extra_args,
            } => {
                let cfg = configs.pop_front().expect("non-empty by construction");
                configs.push_back(cfg.clone());
                (cfg, extra_args.clone())
            }
            ProxyMethod::Direct => unreachable!("constructed with Openvpn"),
        }
    }
}

#[async_trait]
impl ProxyManager for OpenvpnProxy {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> ProxyState {
        self.state
    }

    fn adjust_command(&self, mut cmd: Vec<String>) -> Vec<String> {
        let ns = self
            .namespace
            .clone()
            .unwrap_or_default();
        // Workers run under `ip netns exec <ns>` so their sockets live in
        // the tunnel's namespace.
        let mut adjusted = vec![
            "ip".to_string(),
            "netns".to_string(),
            "exec".to_string(),
            ns,
        ];
        adjusted.append(&mut cmd);
        adjusted
    }

    async fn start(&mut self, namespace: &str) -> Result<(), ProxyError> {
        self.state = ProxyState::Starting;
        self.stop_requested = false;
        self.namespace = Some(namespace.to_string());
        let (cfg, extra_args) = self.next_config();

        let mut child = Command::new(OPENVPN_HELPER)
            .arg(namespace)
            .arg(&cfg)
            .args(&extra_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProxyError::Spawn {
                command: OPENVPN_HELPER.to_string(),
                source,
            })?;

        // Forward the tunnel's stderr under our label.
        if let Some(stderr) = child.stderr.take() {
            let label = self.label.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(label, "{}", line);
                }
            });
        }

        let stdout = child.stdout.take().expect("piped stdout");
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim() == "READY" => break,
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => {
                    self.state = ProxyState::Down;
                    let _ = child.kill().await;
                    return Err(ProxyError::DiedDuringStartup);
                }
            }
        }

        info!(label = self.label, config = %cfg.display(), "ovpn: online");
        self.child = Some(child);
        self.state = ProxyState::Up;
        Ok(())
    }

    fn stop(&mut self) {
        self.stop_requested = true;
        match self.child.as_mut() {
            Some(child) => {
                if self.state == ProxyState::Stopping {
                    // Second request: stop being polite.
                    let _ = child.start_kill();
                } else {
                    self.state = ProxyState::Stopping;
                    // EOF on stdin asks the helper to shut the tunnel down.
                    drop(child.stdin.take());
                }
            }
            None => self.state = ProxyState::Closed,
        }
    }

    async fn wait(&mut self) {
        if let Some(mut child) = self.child.take() {
            match child.wait().await {
                // Tunnels crash all the time; it's routine.
                Ok(status) if !status.success() => {
                    warn!(label = self.label, %status, "ovpn: exited abnormally")
                }
                Err(e) => warn!(label = self.label, error = %e, "ovpn: reap failed"),
                _ => {}
            }
        }
        info!(label = self.label, "ovpn: offline");
        self.state = if self.stop_requested || self.state == ProxyState::Stopping {
            ProxyState::Closed
        } else {
            ProxyState::Down
        };
    }
}

/// Build the manager for one parsed spec.
pub fn manager_for(spec: &ProxySpec) -> Box<dyn ProxyManager> {
    match &spec.method {
        ProxyMethod::Direct => Box::new(DirectProxy::new(spec.label.clone())),
        ProxyMethod::Openvpn { .. } => Box::new(OpenvpnProxy::new(
            spec.label.clone(),
            spec.method.clone(),
        )),
    }
}

/// Supervise one proxy forever: start, announce online, wait for it to die,
/// announce offline, back off, restart. Ends when the event channel closes
/// (the dispatcher is gone) or the manager reaches `Closed`.
pub async fn supervise(
    mut manager: Box<dyn ProxyManager>,
    namespace: String,
    events: mpsc::Sender<ProxyEvent>,
) {
    let mut backoff = Backoff::new();
    loop {
        match manager.start(&namespace).await {
            Ok(()) => {
                if events
                    .send(ProxyEvent::Online(manager.label().to_string()))
                    .await
                    .is_err()
                {
                    manager.stop();
                    manager.wait().await;
                    return;
                }
                manager.wait().await;
                if events
                    .send(ProxyEvent::Offline(manager.label().to_string()))
                    .await
                    .is_err()
                {
                    return;
                }
                // A healthy run earns a fresh backoff schedule.
                backoff = Backoff::new();
            }
            Err(e) => {
                warn!(label = manager.label(), error = %e, "proxy failed to start");
            }
        }
        if manager.state() == ProxyState::Closed || events.is_closed() {
            return;
        }
        backoff.sleep().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn direct_proxy_lifecycle() {
        let mut p = DirectProxy::new("us".to_string());
        assert_eq!(p.state(), ProxyState::Down);
        p.start("ns0").await.unwrap();
        assert_eq!(p.state(), ProxyState::Up);
        p.stop();
        assert_eq!(p.state(), ProxyState::Closed);
        p.wait().await;
    }

    #[test]
    fn direct_proxy_leaves_commands_alone() {
        let p = DirectProxy::new("us".to_string());
        let cmd = vec!["capture-worker".to_string(), "--url".to_string()];
        assert_eq!(p.adjust_command(cmd.clone()), cmd);
    }

    #[test]
    fn ovpn_adjusts_command_into_namespace() {
        let spec = ProxyMethod::Openvpn {
            configs: vec![std::path::PathBuf::from("x.ovpn")].into(),
            extra_args: vec![],
        };
        let mut p = OpenvpnProxy::new("de".to_string(), spec);
        p.namespace = Some("cap0".to_string());
        let cmd = p.adjust_command(vec!["worker".to_string()]);
        assert_eq!(cmd, vec!["ip", "netns", "exec", "cap0", "worker"]);
    }

    #[test]
    fn ovpn_rotates_configs() {
        let spec = ProxyMethod::Openvpn {
            configs: vec![
                std::path::PathBuf::from("a.ovpn"),
                std::path::PathBuf::from("b.ovpn"),
            ]
            .into(),
            extra_args: vec![],
        };
        let mut p = OpenvpnProxy::new("de".to_string(), spec);
        let (first, _) = p.next_config();
        let (second, _) = p.next_config();
        let (third, _) = p.next_config();
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[tokio::test]
    async fn supervision_emits_online() {
        let (tx, mut rx) = mpsc::channel(8);
        let p = Box::new(DirectProxy::new("us".to_string()));
        let handle = tokio::spawn(supervise(p, "ns0".to_string(), tx));

        assert_eq!(rx.recv().await, Some(ProxyEvent::Online("us".to_string())));
        // The direct proxy stays up until the dispatcher tears supervision
        // down.
        handle.abort();
    }
}
