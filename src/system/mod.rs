//! OS-facing modules: command execution, interfaces, processes, routing table,
//! firewall and DHCP client monitoring.

pub mod dhcp;
pub mod firewall;
pub mod interfaces;
pub mod process;
pub mod route;
pub mod shell;

pub use dhcp::{DhcpRestartMonitor, FailureKind, MonitorState};
pub use firewall::{
    canonical_rules, legacy_rule, FirewallBackend, FirewallReconciler, FirewallRule, Iptables,
    ReconcileOutcome,
};
pub use interfaces::{InterfaceInfo, InterfaceQuery, SystemInterfaces};
pub use process::{ProcessLiveness, SystemProcesses};
pub use route::{IpRoute, RouteConfigurator, RouteEntry, RouteModel};
pub use shell::{CommandOutput, CommandRunner, SystemRunner};
