//! Firewall policy protecting the wireserver (platform metadata) endpoint.
//!
//! The policy is three ordered rules in the `OUTPUT` chain of the iptables
//! `security` table:
//!
//! 1. accept DNS to the endpoint
//! 2. accept traffic to the endpoint owned by root (the agent itself)
//! 3. drop new connections to the endpoint from anyone else
//!
//! Order matters for first-match semantics and an existence check cannot tell
//! whether a rule sits in the right position, so when any rule is missing the
//! whole triple is appended again.
//!
//! Older agents installed a tcp `INVALID,NEW -j ACCEPT` rule in the same chain;
//! it shadows the drop rule and is deleted whenever it shows up.

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::error::{GuestNetError, Result};
use crate::schedule::Schedule;
use crate::system::shell::{command_line, CommandRunner};

/// Default wireserver address.
pub const WIRESERVER_ADDRESS: Ipv4Addr = Ipv4Addr::new(168, 63, 129, 16);

const TABLE: &str = "security";
const CHAIN: &str = "OUTPUT";
const DNS_PORT: u16 = 53;
const ROOT_UID: u32 = 0;
/// Upper bound on deletions per rule, in case `-D` keeps reporting success
/// without the rule going away.
const MAX_DELETES_PER_RULE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    /// No protocol match.
    Any,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
            Protocol::Any => f.write_str("all"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Accept,
    Drop,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Accept => f.write_str("ACCEPT"),
            Action::Drop => f.write_str("DROP"),
        }
    }
}

/// Declarative match + action for one rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    /// Short label used in logs.
    pub name: &'static str,
    pub protocol: Protocol,
    pub destination: Ipv4Addr,
    pub destination_port: Option<u16>,
    /// Match only packets created by this uid.
    pub owner_uid: Option<u32>,
    /// Match only conntrack states INVALID and NEW.
    pub new_connections_only: bool,
    pub action: Action,
}

impl FirewallRule {
    /// Backend-agnostic iptables match arguments (everything after the chain).
    pub fn match_args(&self) -> Vec<String> {
        let mut args = vec!["-d".to_string(), self.destination.to_string()];

        if self.protocol != Protocol::Any {
            args.extend(["-p".to_string(), self.protocol.to_string()]);
        }
        if let Some(port) = self.destination_port {
            args.extend(["--destination-port".to_string(), port.to_string()]);
        }
        if let Some(uid) = self.owner_uid {
            args.extend([
                "-m".to_string(),
                "owner".to_string(),
                "--uid-owner".to_string(),
                uid.to_string(),
            ]);
        }
        if self.new_connections_only {
            args.extend([
                "-m".to_string(),
                "conntrack".to_string(),
                "--ctstate".to_string(),
                "INVALID,NEW".to_string(),
            ]);
        }

        args.extend(["-j".to_string(), self.action.to_string()]);
        args
    }
}

/// The canonical ordered triple for `destination`.
pub fn canonical_rules(destination: Ipv4Addr) -> [FirewallRule; 3] {
    [
        FirewallRule {
            name: "accept_dns",
            protocol: Protocol::Udp,
            destination,
            destination_port: Some(DNS_PORT),
            owner_uid: None,
            new_connections_only: false,
            action: Action::Accept,
        },
        FirewallRule {
            name: "accept",
            protocol: Protocol::Any,
            destination,
            destination_port: None,
            owner_uid: Some(ROOT_UID),
            new_connections_only: false,
            action: Action::Accept,
        },
        FirewallRule {
            name: "drop",
            protocol: Protocol::Any,
            destination,
            destination_port: None,
            owner_uid: None,
            new_connections_only: true,
            action: Action::Drop,
        },
    ]
}

/// Rule left behind by older agents; accepting new connections defeats the drop rule.
pub fn legacy_rule(destination: Ipv4Addr) -> FirewallRule {
    FirewallRule {
        name: "legacy",
        protocol: Protocol::Tcp,
        destination,
        destination_port: None,
        owner_uid: None,
        new_connections_only: true,
        action: Action::Accept,
    }
}

/// Packet filter operations the reconciler needs.
#[allow(async_fn_in_trait)]
pub trait FirewallBackend {
    /// Non-mutating existence check for an exact rule.
    async fn rule_exists(&self, rule: &FirewallRule) -> Result<bool>;

    /// Append `rule` to the tail of the chain.
    async fn append_rule(&self, rule: &FirewallRule) -> Result<()>;

    /// Delete one copy of `rule`.
    async fn delete_rule(&self, rule: &FirewallRule) -> Result<()>;
}

impl<B: FirewallBackend + ?Sized> FirewallBackend for &B {
    async fn rule_exists(&self, rule: &FirewallRule) -> Result<bool> {
        (**self).rule_exists(rule).await
    }

    async fn append_rule(&self, rule: &FirewallRule) -> Result<()> {
        (**self).append_rule(rule).await
    }

    async fn delete_rule(&self, rule: &FirewallRule) -> Result<()> {
        (**self).delete_rule(rule).await
    }
}

/// iptables backend (`security` table, `OUTPUT` chain).
pub struct Iptables<R> {
    runner: R,
    command: String,
}

impl<R: CommandRunner> Iptables<R> {
    pub fn new(runner: R) -> Self {
        Self::with_command(runner, "iptables")
    }

    /// Use a specific binary, e.g. `iptables-legacy` or a full path.
    pub fn with_command(runner: R, command: impl Into<String>) -> Self {
        Self {
            runner,
            command: command.into(),
        }
    }

    fn args(operation: &str, rule: &FirewallRule) -> Vec<String> {
        let mut args = vec![
            "-w".to_string(),
            "-t".to_string(),
            TABLE.to_string(),
            operation.to_string(),
            CHAIN.to_string(),
        ];
        args.extend(rule.match_args());
        args
    }

    /// Run a mutating command (`-A`/`-D`) that must succeed.
    async fn modify(&self, operation: &str, rule: &FirewallRule) -> Result<()> {
        let args = Self::args(operation, rule);
        let output = self.runner.run(&self.command, &args).await?;

        if output.success() {
            return Ok(());
        }
        Err(output.into_error(command_line(&self.command, &args)))
    }
}

impl<R: CommandRunner> FirewallBackend for Iptables<R> {
    async fn rule_exists(&self, rule: &FirewallRule) -> Result<bool> {
        let args = Self::args("-C", rule);
        let output = self.runner.run(&self.command, &args).await?;

        // -C exits 1 when the rule does not exist.
        match output.exit_code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(output.into_error(command_line(&self.command, &args))),
        }
    }

    async fn append_rule(&self, rule: &FirewallRule) -> Result<()> {
        self.modify("-A", rule).await
    }

    async fn delete_rule(&self, rule: &FirewallRule) -> Result<()> {
        self.modify("-D", rule).await
    }
}

/// What a reconcile pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// All three rules were present; nothing was changed.
    InPlace,
    /// At least one rule was missing (named here) and the triple was re-appended.
    Restored { missing: Vec<&'static str> },
}

/// Verifies and re-asserts the canonical firewall policy.
pub struct FirewallReconciler<B> {
    backend: B,
    rules: [FirewallRule; 3],
    legacy: FirewallRule,
    purge_stale: bool,
    schedule: Schedule,
}

impl<B: FirewallBackend> FirewallReconciler<B> {
    pub fn new(backend: B, destination: Ipv4Addr) -> Self {
        Self {
            backend,
            rules: canonical_rules(destination),
            legacy: legacy_rule(destination),
            purge_stale: false,
            schedule: Schedule::new(Duration::from_secs(30)),
        }
    }

    /// Delete existing copies of the rules before re-appending them.
    pub fn with_purge_stale(mut self, purge_stale: bool) -> Self {
        self.purge_stale = purge_stale;
        self
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.schedule.set_period(period);
        self
    }

    pub fn rules(&self) -> &[FirewallRule; 3] {
        &self.rules
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Delete any legacy rule, then check each canonical rule; if any is missing,
    /// append the full triple in order.
    pub async fn reconcile(&mut self) -> Result<ReconcileOutcome> {
        let legacy = self.delete_all(&self.legacy).await?;
        if legacy > 0 {
            tracing::info!("Removed {} legacy firewall rule(s)", legacy);
        }

        let mut missing = Vec::new();
        for rule in &self.rules {
            if !self.backend.rule_exists(rule).await? {
                missing.push(rule.name);
            }
        }

        if missing.is_empty() {
            tracing::debug!("Firewall rules for {} are in place", self.rules[0].destination);
            return Ok(ReconcileOutcome::InPlace);
        }

        tracing::warn!(
            "Missing firewall rules for {}: {}",
            self.rules[0].destination,
            missing.join(", ")
        );

        if self.purge_stale {
            let removed = self.remove().await?;
            if removed > 0 {
                tracing::info!("Removed {} stale firewall rule(s)", removed);
            }
        }

        for rule in &self.rules {
            self.backend.append_rule(rule).await?;
        }

        tracing::info!("Firewall rules for {} restored", self.rules[0].destination);
        Ok(ReconcileOutcome::Restored { missing })
    }

    /// Delete every copy of the canonical and legacy rules. Returns the number deleted.
    pub async fn remove(&mut self) -> Result<usize> {
        let mut removed = self.delete_all(&self.legacy).await?;
        for rule in &self.rules {
            removed += self.delete_all(rule).await?;
        }
        Ok(removed)
    }

    /// Delete `rule` until the existence check fails, returning the count removed.
    async fn delete_all(&self, rule: &FirewallRule) -> Result<usize> {
        let mut removed = 0;
        while self.backend.rule_exists(rule).await? {
            if removed == MAX_DELETES_PER_RULE {
                tracing::warn!(
                    "Firewall rule {} still present after {} deletions",
                    rule.name,
                    removed
                );
                break;
            }
            self.backend.delete_rule(rule).await?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Reconcile if the period has elapsed since the last run.
    pub async fn run(&mut self) -> Result<Option<ReconcileOutcome>> {
        if !self.schedule.is_due() {
            return Ok(None);
        }
        self.schedule.mark_run();
        self.reconcile().await.map(Some)
    }
}
