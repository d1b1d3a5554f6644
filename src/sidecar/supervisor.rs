//! Sidecar process supervision.
//!
//! Restarts the sidecar on exit, at most `max_restarts` times within the
//! sliding window. Exceeding the limit disables auto-restart and latches a
//! critical status the orchestrator surfaces through health checks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Executable to spawn.
    pub program: String,
    pub args: Vec<String>,
    pub max_restarts: u32,
    pub restart_window: Duration,
    /// Fixed delay between restart attempts.
    pub restart_delay: Duration,
}

impl SupervisorConfig {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            max_restarts: 5,
            restart_window: Duration::from_secs(60),
            restart_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorStatus {
    Stopped,
    Running,
    /// Restart budget exhausted; auto-restart disabled.
    Critical,
}

struct SupervisorState {
    child: Option<Child>,
    exits: VecDeque<Instant>,
}

pub struct SidecarSupervisor {
    config: SupervisorConfig,
    state: Mutex<SupervisorState>,
    running: AtomicBool,
    critical: AtomicBool,
}

impl SidecarSupervisor {
    pub fn new(config: SupervisorConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(SupervisorState {
                child: None,
                exits: VecDeque::new(),
            }),
            running: AtomicBool::new(false),
            critical: AtomicBool::new(false),
        })
    }

    /// Spawn the sidecar and the monitor task.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let child = self.spawn_child()?;
        {
            let mut state = self.state.lock();
            state.child = Some(child);
        }
        self.running.store(true, Ordering::SeqCst);

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            supervisor.monitor_loop().await;
        });
        info!(program = %self.config.program, "sidecar_started");
        Ok(())
    }

    fn spawn_child(&self) -> Result<Child> {
        Command::new(&self.config.program)
            .args(&self.config.args)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn sidecar {}", self.config.program))
    }

    async fn monitor_loop(self: Arc<Self>) {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return;
            }

            let child = { self.state.lock().child.take() };
            let Some(mut child) = child else { return };

            let exit = child.wait().await;
            if !self.running.load(Ordering::SeqCst) {
                return; // Stopped deliberately.
            }

            match &exit {
                Ok(status) => warn!(code = status.code(), "sidecar_exited"),
                Err(e) => warn!(error = %e, "sidecar_wait_failed"),
            }

            // Sliding-window restart accounting.
            let now = Instant::now();
            let exceeded = {
                let mut state = self.state.lock();
                state.exits.push_back(now);
                while let Some(front) = state.exits.front() {
                    if now.duration_since(*front) > self.config.restart_window {
                        state.exits.pop_front();
                    } else {
                        break;
                    }
                }
                state.exits.len() as u32 > self.config.max_restarts
            };

            if exceeded {
                self.critical.store(true, Ordering::SeqCst);
                self.running.store(false, Ordering::SeqCst);
                error!(
                    max_restarts = self.config.max_restarts,
                    window_secs = self.config.restart_window.as_secs(),
                    "sidecar restart budget exhausted; auto-restart disabled"
                );
                return;
            }

            tokio::time::sleep(self.config.restart_delay).await;
            match self.spawn_child() {
                Ok(child) => {
                    self.state.lock().child = Some(child);
                    info!("sidecar_respawned");
                }
                Err(e) => {
                    error!(error = %e, "sidecar respawn failed");
                    self.critical.store(true, Ordering::SeqCst);
                    self.running.store(false, Ordering::SeqCst);
                    return;
                }
            }
        }
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let child = { self.state.lock().child.take() };
        if let Some(mut child) = child {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
        info!("sidecar_stopped");
    }

    pub fn status(&self) -> SupervisorStatus {
        if self.critical.load(Ordering::SeqCst) {
            SupervisorStatus::Critical
        } else if self.running.load(Ordering::SeqCst) {
            SupervisorStatus::Running
        } else {
            SupervisorStatus::Stopped
        }
    }

    pub fn is_critical(&self) -> bool {
        self.critical.load(Ordering::SeqCst)
    }

    pub fn restarts_in_window(&self) -> usize {
        self.state.lock().exits.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn restart_budget_latches_critical() {
        // A program that exits immediately burns through the budget.
        let mut config = SupervisorConfig::new("/bin/true", vec![]);
        config.max_restarts = 2;
        config.restart_delay = Duration::from_millis(10);
        let supervisor = SidecarSupervisor::new(config);
        supervisor.start().unwrap();

        for _ in 0..200 {
            if supervisor.is_critical() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(supervisor.is_critical());
        assert_eq!(supervisor.status(), SupervisorStatus::Critical);
    }

    #[tokio::test]
    async fn stop_is_clean() {
        let config = SupervisorConfig::new("/bin/sleep", vec!["60".to_string()]);
        let supervisor = SidecarSupervisor::new(config);
        supervisor.start().unwrap();
        assert_eq!(supervisor.status(), SupervisorStatus::Running);

        supervisor.stop().await;
        assert_eq!(supervisor.status(), SupervisorStatus::Stopped);
        assert!(!supervisor.is_critical());
    }
}
