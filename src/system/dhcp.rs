//! DHCP client restart detection.
//!
//! When the OS DHCP client restarts it may rewrite routes the agent depends on.
//! The monitor remembers the client's PIDs and, once any of them is gone, looks
//! the client up again and asks the owner to reapply its routes.

use std::time::Duration;

use crate::error::{GuestNetError, Result};
use crate::schedule::Schedule;
use crate::system::process::ProcessLiveness;
use crate::system::shell::{command_line, CommandRunner};

pub const DEFAULT_DHCP_CLIENT: &str = "dhclient";

const PIDOF: &str = "pidof";
/// `pidof` exit status when no process matched.
const PIDOF_NOT_FOUND: i32 = 1;

/// Last failure reported by the PID lookup; only used to avoid repeating logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailureKind {
    #[default]
    None,
    NotRunning,
    CommandError,
}

/// Mutable state owned by one [`DhcpRestartMonitor`].
#[derive(Debug, Clone)]
pub struct MonitorState {
    /// Empty until the first successful lookup, then the sorted PID set last
    /// reported as running. Always replaced wholesale.
    pub tracked_pids: Vec<u32>,
    pub last_failure: FailureKind,
    schedule: Schedule,
}

impl MonitorState {
    fn new(period: Duration) -> Self {
        Self {
            tracked_pids: Vec::new(),
            last_failure: FailureKind::None,
            schedule: Schedule::new(period),
        }
    }

    pub fn period(&self) -> Duration {
        self.schedule.period()
    }

    /// Record a failure; returns true when it differs from the previous one and
    /// should therefore be logged.
    fn note_failure(&mut self, kind: FailureKind) -> bool {
        let changed = self.last_failure != kind;
        self.last_failure = kind;
        changed
    }
}

/// Route reconfiguration hook supplied by the owning agent.
pub type RestartHook = Box<dyn FnMut() + Send>;

/// Watches the DHCP client and fires a hook when it has been restarted.
pub struct DhcpRestartMonitor<R, P> {
    runner: R,
    liveness: P,
    client_name: String,
    state: MonitorState,
    on_restart: RestartHook,
}

impl<R: CommandRunner, P: ProcessLiveness> DhcpRestartMonitor<R, P> {
    pub fn new(
        runner: R,
        liveness: P,
        client_name: impl Into<String>,
        on_restart: impl FnMut() + Send + 'static,
    ) -> Self {
        Self {
            runner,
            liveness,
            client_name: client_name.into(),
            state: MonitorState::new(Duration::from_secs(30)),
            on_restart: Box::new(on_restart),
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.state.schedule.set_period(period);
        self
    }

    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut MonitorState {
        &mut self.state
    }

    /// Check the tracked PIDs and handle a restart (or first run).
    ///
    /// Returns true when the restart hook was invoked.
    pub async fn poll(&mut self) -> bool {
        let liveness = &self.liveness;
        let restarted = self.state.tracked_pids.is_empty()
            || self.state.tracked_pids.iter().any(|&pid| !liveness.is_alive(pid));

        if !restarted {
            return false;
        }

        if !self.state.tracked_pids.is_empty() {
            tracing::info!(
                "Detected a restart of the DHCP client (previous PIDs: {:?})",
                self.state.tracked_pids
            );
        }

        self.state.tracked_pids = self.list_dhcp_client_pids().await;
        if self.state.tracked_pids.is_empty() {
            return false;
        }

        tracing::info!(
            "DHCP client PIDs: {:?}; reconfiguring routes",
            self.state.tracked_pids
        );
        (self.on_restart)();
        true
    }

    /// Poll if the period has elapsed since the last run.
    pub async fn run(&mut self) -> Option<bool> {
        if !self.state.schedule.is_due() {
            return None;
        }
        self.state.schedule.mark_run();
        Some(self.poll().await)
    }

    /// Look up the PIDs of the DHCP client, ascending. Never fails: a missing
    /// client or a broken lookup yields an empty list and a (deduplicated) log.
    pub async fn list_dhcp_client_pids(&mut self) -> Vec<u32> {
        match self.lookup().await {
            Ok(pids) => {
                self.state.last_failure = FailureKind::None;
                pids
            }
            Err(Lookup::NotRunning) => {
                if self.state.note_failure(FailureKind::NotRunning) {
                    tracing::warn!("Dhcp client is not running.");
                }
                Vec::new()
            }
            Err(Lookup::Failed(e)) => {
                if self.state.note_failure(FailureKind::CommandError) {
                    tracing::error!("Failed to get the PID of the DHCP client: {}", e);
                }
                Vec::new()
            }
        }
    }

    async fn lookup(&self) -> std::result::Result<Vec<u32>, Lookup> {
        let args = vec![self.client_name.clone()];
        let output = self
            .runner
            .run(PIDOF, &args)
            .await
            .map_err(Lookup::Failed)?;

        match output.exit_code {
            Some(0) => parse_pids(&output.stdout).map_err(Lookup::Failed),
            Some(PIDOF_NOT_FOUND) => Err(Lookup::NotRunning),
            _ => Err(Lookup::Failed(
                output.into_error(command_line(PIDOF, &args)),
            )),
        }
    }
}

enum Lookup {
    NotRunning,
    Failed(GuestNetError),
}

/// Parse whitespace-separated PIDs, sorted numerically.
pub fn parse_pids(output: &str) -> Result<Vec<u32>> {
    let mut pids = output
        .split_whitespace()
        .map(|token| {
            token
                .parse::<u32>()
                .map_err(|_| GuestNetError::ParseError(format!("invalid PID '{}'", token)))
        })
        .collect::<Result<Vec<u32>>>()?;
    pids.sort_unstable();
    pids.dedup();
    Ok(pids)
}
