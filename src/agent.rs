//! The agent loop body: owns the route model, the firewall reconciler and the
//! DHCP restart monitor, and drives them from one periodic tick.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::Result;
use crate::system::{
    CommandRunner, DhcpRestartMonitor, FirewallBackend, FirewallReconciler, InterfaceInfo,
    InterfaceQuery, IpRoute, Iptables, ProcessLiveness, ReconcileOutcome, RouteConfigurator,
    RouteModel, SystemInterfaces, SystemProcesses, SystemRunner,
};

/// What one tick did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// The DHCP client was (re)discovered.
    pub dhcp_restarted: bool,
    /// Primary interface re-resolved after a DHCP restart.
    pub primary_interface: Option<String>,
    /// The wireserver route was reinstalled through the primary interface.
    pub routes_reapplied: bool,
    /// Result of the firewall check, when it was due.
    pub firewall: Option<ReconcileOutcome>,
}

pub struct Agent<Q, C, B, R, P> {
    routes: RouteModel<Q>,
    route_config: C,
    wireserver: Ipv4Addr,
    firewall: FirewallReconciler<B>,
    firewall_enabled: bool,
    dhcp: Option<DhcpRestartMonitor<R, P>>,
    /// Set by the DHCP restart hook, consumed by the next tick.
    routes_dirty: Arc<AtomicBool>,
}

/// Agent wired to the live system.
pub type SystemAgent = Agent<
    SystemInterfaces,
    IpRoute<SystemRunner>,
    Iptables<SystemRunner>,
    SystemRunner,
    SystemProcesses,
>;

impl SystemAgent {
    pub fn from_config(config: &Config) -> Self {
        let runner = SystemRunner::with_timeout(config.command_timeout());

        let routes = RouteModel::new(config.route_table_path.clone(), SystemInterfaces);
        let firewall = FirewallReconciler::new(
            Iptables::with_command(runner.clone(), config.iptables_command.clone()),
            config.wireserver_address,
        )
        .with_purge_stale(config.firewall_purge_stale)
        .with_period(config.firewall_period());

        let agent = Agent::new(
            routes,
            IpRoute::new(runner.clone()),
            config.wireserver_address,
            firewall,
            config.firewall_enabled,
        );
        if config.dhcp_monitor_enabled {
            agent.with_dhcp_monitor(
                runner,
                SystemProcesses,
                config.dhcp_client_name.clone(),
                config.dhcp_poll_period(),
            )
        } else {
            agent
        }
    }
}

impl<Q, C, B, R, P> Agent<Q, C, B, R, P>
where
    Q: InterfaceQuery,
    C: RouteConfigurator,
    B: FirewallBackend,
    R: CommandRunner,
    P: ProcessLiveness,
{
    pub fn new(
        routes: RouteModel<Q>,
        route_config: C,
        wireserver: Ipv4Addr,
        firewall: FirewallReconciler<B>,
        firewall_enabled: bool,
    ) -> Self {
        Self {
            routes,
            route_config,
            wireserver,
            firewall,
            firewall_enabled,
            dhcp: None,
            routes_dirty: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_dhcp_monitor(
        mut self,
        runner: R,
        liveness: P,
        client_name: String,
        period: Duration,
    ) -> Self {
        let dirty = self.routes_dirty.clone();
        let monitor = DhcpRestartMonitor::new(runner, liveness, client_name, move || {
            dirty.store(true, Ordering::SeqCst);
        })
        .with_period(period);
        self.dhcp = Some(monitor);
        self
    }

    pub fn routes(&self) -> &RouteModel<Q> {
        &self.routes
    }

    /// One-time work before the loop starts: report the interface the agent will
    /// use, and strip the firewall policy if it has been disabled.
    ///
    /// Fails only if the routing table cannot be read.
    pub async fn startup(&mut self) -> Result<Option<InterfaceInfo>> {
        let usable = self.routes.first_usable_interface().await?;
        match &usable {
            Some(info) => tracing::info!(
                "Using interface {} with address {}",
                info.name,
                info.ipv4_address
            ),
            None => tracing::warn!("No usable network interface found"),
        }

        if !self.firewall_enabled {
            match self.firewall.remove().await {
                Ok(0) => {}
                Ok(n) => tracing::info!("Firewall disabled; removed {} rule(s)", n),
                Err(e) => tracing::warn!("Unable to remove firewall rules: {}", e),
            }
        }

        Ok(usable)
    }

    /// Run whatever is due. Failures are logged; the loop keeps going.
    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();

        if let Some(monitor) = self.dhcp.as_mut() {
            monitor.run().await;
        }

        if self.routes_dirty.swap(false, Ordering::SeqCst) {
            report.dhcp_restarted = true;
            self.reapply_routes(&mut report).await;
        }

        if self.firewall_enabled {
            match self.firewall.run().await {
                Ok(outcome) => report.firewall = outcome,
                Err(e) => tracing::error!("Unable to enforce the firewall policy: {}", e),
            }
        }

        report
    }

    /// Reinstall the wireserver route through the current primary default route.
    async fn reapply_routes(&self, report: &mut TickReport) {
        let primary = match self.routes.primary_route().await {
            Ok(Some(primary)) => primary,
            Ok(None) => return,
            Err(e) => {
                tracing::error!("Unable to read the routing table: {}", e);
                return;
            }
        };
        report.primary_interface = Some(primary.interface.clone());

        match self.route_config.configure_routes(self.wireserver, &primary).await {
            Ok(()) => report.routes_reapplied = true,
            Err(e) => tracing::error!("Unable to reconfigure routes: {}", e),
        }
    }
}
