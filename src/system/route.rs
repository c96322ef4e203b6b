//! Kernel routing table parsing and primary interface resolution.
//!
//! The table comes from `/proc/net/route`:
//!
//! ```text
//! Iface   Destination  Gateway   Flags  RefCnt  Use  Metric  Mask      MTU  Window  IRTT
//! eth0    00000000     C1BB910A  0003   0       0    0       00000000  0    0       0
//! ```
//!
//! Addresses are 8 hex digits holding the address in host (little-endian) byte order,
//! so `C1BB910A` is `10.145.187.193`.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::Result;
use crate::system::interfaces::{InterfaceInfo, InterfaceQuery};
use crate::system::shell::{command_line, CommandRunner};

pub const ROUTE_TABLE_PATH: &str = "/proc/net/route";

/// Route is usable.
pub const RTF_UP: u32 = 0x0001;
/// Destination is reached through a gateway.
pub const RTF_GATEWAY: u32 = 0x0002;

/// Iface, Destination, Gateway, Flags, RefCnt, Use, Metric, Mask, MTU, Window, IRTT.
const FIELD_COUNT: usize = 11;

/// One row of the routing table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteEntry {
    pub interface: String,
    pub destination: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub flags: u32,
    pub metric: u32,
    pub mask: Ipv4Addr,
}

impl RouteEntry {
    /// Parse a single table row. Returns `None` for the header and for any row
    /// that is short, long, or carries a non-numeric field.
    fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != FIELD_COUNT {
            return None;
        }

        Some(Self {
            interface: fields[0].to_string(),
            destination: parse_address(fields[1])?,
            gateway: parse_address(fields[2])?,
            flags: u32::from_str_radix(fields[3], 16).ok()?,
            metric: fields[6].parse().ok()?,
            mask: parse_address(fields[7])?,
        })
    }

    /// Destination 0.0.0.0, i.e. the default route.
    pub fn is_default(&self) -> bool {
        self.destination.is_unspecified()
    }

    pub fn is_up(&self) -> bool {
        self.flags & RTF_UP != 0
    }

    pub fn is_gateway(&self) -> bool {
        self.flags & RTF_GATEWAY != 0
    }
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Iface: {}\tDestination: {}\tGateway: {}\tFlags: {:#06x}\tMetric: {}\tMask: {}",
            self.interface, self.destination, self.gateway, self.flags, self.metric, self.mask
        )
    }
}

/// Convert a kernel hex address (least significant byte first) into an [`Ipv4Addr`].
pub fn parse_address(hex: &str) -> Option<Ipv4Addr> {
    if hex.is_empty() || hex.len() > 8 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let value = u32::from_str_radix(hex, 16).ok()?;
    Some(Ipv4Addr::from(value.to_le_bytes()))
}

/// Read the raw routing table text.
pub async fn read_table(path: impl AsRef<Path>) -> Result<String> {
    Ok(tokio::fs::read_to_string(path).await?)
}

/// Lazily parse a raw table into entries, preserving row order.
/// The header and malformed rows are skipped.
pub fn parse_table(raw: &str) -> impl Iterator<Item = RouteEntry> + '_ {
    raw.lines().filter_map(RouteEntry::parse)
}

/// Resolve the default route the primary interface is chosen from.
///
/// Candidates are default routes that are both UP and GATEWAY on a non-loopback
/// interface. The lowest metric wins; on a tie the row that comes first in the
/// table wins.
pub fn primary_route<Q: InterfaceQuery>(raw: &str, interfaces: &Q) -> Option<RouteEntry> {
    parse_table(raw)
        .filter(|route| route.is_default() && route.is_up() && route.is_gateway())
        .filter(|route| !interfaces.is_loopback(&route.interface))
        // min_by_key keeps the first of several equal minimums.
        .min_by_key(|route| route.metric)
}

/// Name of the interface carrying the [`primary_route`].
pub fn primary_interface<Q: InterfaceQuery>(raw: &str, interfaces: &Q) -> Option<String> {
    primary_route(raw, interfaces).map(|route| route.interface)
}

pub fn is_primary_interface<Q: InterfaceQuery>(name: &str, raw: &str, interfaces: &Q) -> bool {
    primary_interface(raw, interfaces).is_some_and(|primary| primary == name)
}

/// Pick the interface (and its address) the agent should use.
///
/// Prefers the primary interface; falls back to the first non-loopback interface
/// with an IPv4 address. `None` when there is no such interface.
pub fn first_usable_interface<Q: InterfaceQuery>(
    raw: &str,
    interfaces: &Q,
) -> Option<InterfaceInfo> {
    let bound = match interfaces.list_interfaces() {
        Ok(bound) => bound,
        Err(e) => {
            tracing::warn!("Unable to enumerate network interfaces: {}", e);
            return None;
        }
    };

    if let Some(primary) = primary_interface(raw, interfaces) {
        if let Some(info) = bound.iter().find(|info| info.name == primary) {
            return Some(info.clone());
        }
        tracing::debug!("Primary interface {} has no IPv4 address bound", primary);
    }

    bound
        .into_iter()
        .find(|info| !interfaces.is_loopback(&info.name))
}

/// Routing decisions backed by a live routing table file.
pub struct RouteModel<Q> {
    table_path: PathBuf,
    interfaces: Q,
}

impl<Q: InterfaceQuery> RouteModel<Q> {
    pub fn new(table_path: impl Into<PathBuf>, interfaces: Q) -> Self {
        Self {
            table_path: table_path.into(),
            interfaces,
        }
    }

    pub fn table_path(&self) -> &Path {
        &self.table_path
    }

    pub async fn read_table(&self) -> Result<String> {
        read_table(&self.table_path).await
    }

    /// Resolve the primary default route from a fresh table snapshot.
    pub async fn primary_route(&self) -> Result<Option<RouteEntry>> {
        let raw = self.read_table().await?;
        let primary = primary_route(&raw, &self.interfaces);

        match &primary {
            Some(route) => tracing::info!("Primary interface is [{}]", route.interface),
            None => {
                tracing::warn!(
                    "Could not determine primary interface, please ensure {} is correct",
                    self.table_path.display()
                );
                dump_table(&raw);
            }
        }

        Ok(primary)
    }

    pub async fn primary_interface(&self) -> Result<Option<String>> {
        Ok(self.primary_route().await?.map(|route| route.interface))
    }

    pub async fn is_primary_interface(&self, name: &str) -> Result<bool> {
        let raw = self.read_table().await?;
        Ok(is_primary_interface(name, &raw, &self.interfaces))
    }

    pub async fn first_usable_interface(&self) -> Result<Option<InterfaceInfo>> {
        let raw = self.read_table().await?;
        Ok(first_usable_interface(&raw, &self.interfaces))
    }
}

/// Installs the host route the agent uses to reach the wireserver.
#[allow(async_fn_in_trait)]
pub trait RouteConfigurator {
    /// Route `destination` through the gateway and interface of `primary`.
    async fn configure_routes(&self, destination: Ipv4Addr, primary: &RouteEntry) -> Result<()>;
}

impl<C: RouteConfigurator + ?Sized> RouteConfigurator for &C {
    async fn configure_routes(&self, destination: Ipv4Addr, primary: &RouteEntry) -> Result<()> {
        (**self).configure_routes(destination, primary).await
    }
}

/// `ip route replace <destination>/32 via <gateway> dev <interface>`.
pub struct IpRoute<R> {
    runner: R,
}

impl<R: CommandRunner> IpRoute<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    fn args(destination: Ipv4Addr, primary: &RouteEntry) -> Vec<String> {
        vec![
            "route".to_string(),
            "replace".to_string(),
            format!("{}/32", destination),
            "via".to_string(),
            primary.gateway.to_string(),
            "dev".to_string(),
            primary.interface.clone(),
        ]
    }
}

impl<R: CommandRunner> RouteConfigurator for IpRoute<R> {
    async fn configure_routes(&self, destination: Ipv4Addr, primary: &RouteEntry) -> Result<()> {
        let args = Self::args(destination, primary);
        let output = self.runner.run("ip", &args).await?;
        if !output.success() {
            return Err(output.into_error(command_line("ip", &args)));
        }
        tracing::info!(
            "Route to {} set via {} dev {}",
            destination,
            primary.gateway,
            primary.interface
        );
        Ok(())
    }
}

fn dump_table(raw: &str) {
    let entries: Vec<RouteEntry> = parse_table(raw).collect();
    if entries.is_empty() {
        tracing::debug!("Routing table has no usable entries");
        return;
    }
    match serde_json::to_string(&entries) {
        Ok(json) => tracing::debug!(routes = %json, "Dumping the routing table"),
        Err(e) => tracing::debug!("Unable to serialize routing table: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::shell::CommandOutput;

    /// Only `lo` is loopback; bound addresses are given up front.
    struct FakeInterfaces {
        bound: Vec<InterfaceInfo>,
    }

    impl FakeInterfaces {
        fn new(bound: &[(&str, &str)]) -> Self {
            Self {
                bound: bound
                    .iter()
                    .map(|(name, ip)| InterfaceInfo {
                        name: name.to_string(),
                        ipv4_address: ip.parse().unwrap(),
                    })
                    .collect(),
            }
        }
    }

    impl InterfaceQuery for FakeInterfaces {
        fn list_interfaces(&self) -> Result<Vec<InterfaceInfo>> {
            Ok(self.bound.clone())
        }

        fn is_loopback(&self, name: &str) -> bool {
            name == "lo"
        }
    }

    const HEADER: &str =
        "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT   \n";

    fn table(rows: &[&str]) -> String {
        let mut raw = HEADER.to_string();
        for row in rows {
            raw.push_str(row);
            raw.push('\n');
        }
        raw
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("C1BB910A"), Some(Ipv4Addr::new(10, 145, 187, 193)));
        assert_eq!(parse_address("00000000"), Some(Ipv4Addr::UNSPECIFIED));
        assert_eq!(parse_address("C0FFFFFF"), Some(Ipv4Addr::new(255, 255, 255, 192)));
        assert_eq!(parse_address("10813FA8"), Some(Ipv4Addr::new(168, 63, 129, 16)));
        assert_eq!(parse_address("Gateway"), None);
        assert_eq!(parse_address("+0000000"), None);
        assert_eq!(parse_address("100000000"), None);
    }

    #[test]
    fn test_empty_and_header_only_tables() {
        assert_eq!(parse_table("").count(), 0);
        assert_eq!(parse_table(HEADER).count(), 0);
    }

    #[test]
    fn test_short_rows_are_skipped() {
        let raw = "Iface\tDestination\tGateway \tFlags\t\tUse\tMetric\t\neth0\t00000000\t00000000\t0001\t\t0\t0\n";
        assert_eq!(parse_table(raw).count(), 0);
    }

    #[test]
    fn test_non_numeric_rows_are_skipped() {
        let raw = table(&[
            "eth0\t0000000G\tC1BB910A\t0003\t0\t0\t0\t00000000\t0\t0\t0",
            "eth0\t00000000\tC1BB910A\t0003\t0\t0\tlow\t00000000\t0\t0\t0",
            "eth0\t00000000\tC1BB910A\t0003\t0\t0\t7\t00000000\t0\t0\t0",
        ]);
        let routes: Vec<_> = parse_table(&raw).collect();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].metric, 7);
    }

    #[test]
    fn test_valid_routes() {
        let raw = table(&[
            "eth0\t00000000\tC1BB910A\t0003\t0\t0\t0\t00000000\t0\t0\t0    ",
            "eth0\tC0BB910A\t00000000\t0001\t0\t0\t0\tC0FFFFFF\t0\t0\t0    ",
            "eth0\t10813FA8\tC1BB910A\t000F\t0\t0\t0\tFFFFFFFF\t0\t0\t0    ",
            "eth0\tFEA9FEA9\tC1BB910A\t0007\t0\t0\t0\tFFFFFFFF\t0\t0\t0    ",
            "docker0\t002BA8C0\t00000000\t0001\t0\t0\t10\t00FFFFFF\t0\t0\t0    ",
        ]);
        assert_eq!(raw.lines().count(), 6);

        let routes: Vec<_> = parse_table(&raw).collect();
        assert_eq!(routes.len(), 5);
        assert_eq!(routes[0].gateway, Ipv4Addr::new(10, 145, 187, 193));
        assert!(routes[0].is_default());
        assert_eq!(routes[1].gateway, Ipv4Addr::UNSPECIFIED);
        assert_eq!(routes[1].mask, Ipv4Addr::new(255, 255, 255, 192));
        assert_eq!(routes[2].destination, Ipv4Addr::new(168, 63, 129, 16));
        assert_eq!(routes[1].flags, 1);
        assert_eq!(routes[2].flags, 15);
        assert_eq!(routes[3].flags, 7);
        assert_eq!(routes[3].metric, 0);
        assert_eq!(routes[4].metric, 10);
        assert_eq!(routes[0].interface, "eth0");
        assert_eq!(routes[4].interface, "docker0");
        assert!(!routes[4].is_gateway());
    }

    #[test]
    fn test_display_route() {
        let raw = table(&["eth0\t00000000\tC1BB910A\t0003\t0\t0\t5\t00000000\t0\t0\t0"]);
        let route = parse_table(&raw).next().unwrap();
        assert_eq!(
            route.to_string(),
            "Iface: eth0\tDestination: 0.0.0.0\tGateway: 10.145.187.193\tFlags: 0x0003\tMetric: 5\tMask: 0.0.0.0"
        );
    }

    #[test]
    fn test_loopback_is_never_primary() {
        let raw = "\
        Iface	Destination	Gateway 	Flags	RefCnt	Use	Metric	Mask		MTU	Window	IRTT \n\
        eth0	00000000	01345B0A	0003	0	    0	5	00000000	0	0	0   \n\
        eth0	00345B0A	00000000	0001	0	    0	5	00000000	0	0	0   \n\
        lo	    00000000	01345B0A	0003	0	    0	1	00FCFFFF	0	0	0   \n";
        let ifaces = FakeInterfaces::new(&[]);
        assert!(!is_primary_interface("lo", raw, &ifaces));
        assert!(is_primary_interface("eth0", raw, &ifaces));
    }

    #[test]
    fn test_bonded_interface_is_primary() {
        let raw = table(&[
            "bond0\t00000000\t0100000A\t0003\t0\t0\t0\t00000000\t0\t0\t0",
            "bond0\t0000000A\t00000000\t0001\t0\t0\t0\t00000000\t0\t0\t0",
            "eth0\t0000000A\t00000000\t0001\t0\t0\t0\t00000000\t0\t0\t0",
            "bond0\t10813FA8\t0100000A\t0007\t0\t0\t0\t00000000\t0\t0\t0",
            "bond0\tFEA9FEA9\t0100000A\t0007\t0\t0\t0\t00000000\t0\t0\t0",
        ]);
        let ifaces = FakeInterfaces::new(&[]);
        assert!(!is_primary_interface("eth0", &raw, &ifaces));
        assert!(is_primary_interface("bond0", &raw, &ifaces));
    }

    #[test]
    fn test_lowest_metric_wins() {
        let raw = table(&[
            "high\t00000000\t01345B0A\t0003\t0\t0\t5\t00000000\t0\t0\t0",
            "low1\t00000000\t01345B0A\t0003\t0\t0\t1\t00FCFFFF\t0\t0\t0",
        ]);
        let ifaces = FakeInterfaces::new(&[]);
        assert!(is_primary_interface("low1", &raw, &ifaces));
        assert!(!is_primary_interface("high", &raw, &ifaces));
    }

    #[test]
    fn test_metric_tie_goes_to_first_row() {
        let raw = table(&[
            "first\t00000000\t01345B0A\t0003\t0\t0\t1\t00000000\t0\t0\t0",
            "secnd\t00000000\t01345B0A\t0003\t0\t0\t1\t00FCFFFF\t0\t0\t0",
        ]);
        let ifaces = FakeInterfaces::new(&[]);
        assert!(is_primary_interface("first", &raw, &ifaces));
        assert!(!is_primary_interface("secnd", &raw, &ifaces));

        let swapped = table(&[
            "secnd\t00000000\t01345B0A\t0003\t0\t0\t1\t00FCFFFF\t0\t0\t0",
            "first\t00000000\t01345B0A\t0003\t0\t0\t1\t00000000\t0\t0\t0",
        ]);
        assert!(is_primary_interface("secnd", &swapped, &ifaces));
    }

    #[test]
    fn test_gateway_flag_required() {
        let raw = table(&[
            "nflg\t00000000\t01345B0A\t0001\t0\t0\t1\t00000000\t0\t0\t0",
            "flgs\t00000000\t01345B0A\t0003\t0\t0\t1\t00FCFFFF\t0\t0\t0",
        ]);
        let ifaces = FakeInterfaces::new(&[]);
        assert!(is_primary_interface("flgs", &raw, &ifaces));
        assert!(!is_primary_interface("nflg", &raw, &ifaces));
    }

    #[test]
    fn test_no_candidate() {
        let raw = table(&[
            "ndst\t00000001\t01345B0A\t0003\t0\t0\t1\t00000000\t0\t0\t0",
            "nflg\t00000000\t01345B0A\t0001\t0\t0\t1\t00FCFFFF\t0\t0\t0",
        ]);
        let ifaces = FakeInterfaces::new(&[]);
        assert_eq!(primary_interface(&raw, &ifaces), None);
        assert!(!is_primary_interface("ndst", &raw, &ifaces));
        assert!(!is_primary_interface("nflg", &raw, &ifaces));
        assert!(!is_primary_interface("invalid", &raw, &ifaces));
    }

    #[test]
    fn test_first_usable_prefers_primary() {
        let raw = table(&["eth1\t00000000\t01345B0A\t0003\t0\t0\t0\t00000000\t0\t0\t0"]);
        let ifaces = FakeInterfaces::new(&[("eth0", "10.0.0.1"), ("eth1", "10.0.1.1")]);
        let info = first_usable_interface(&raw, &ifaces).unwrap();
        assert_eq!(info.name, "eth1");
        assert_eq!(info.ipv4_address, Ipv4Addr::new(10, 0, 1, 1));
    }

    #[test]
    fn test_first_usable_falls_back_when_primary_unbound() {
        let raw = table(&["bogus0\t00000000\t01345B0A\t0003\t0\t0\t0\t00000000\t0\t0\t0"]);
        let ifaces = FakeInterfaces::new(&[("lo", "127.0.0.1"), ("eth0", "10.0.0.1")]);
        let info = first_usable_interface(&raw, &ifaces).unwrap();
        assert_eq!(info.name, "eth0");
        assert_eq!(info.ipv4_address, Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn test_first_usable_without_primary() {
        let ifaces = FakeInterfaces::new(&[("eth0", "10.0.0.1")]);
        let info = first_usable_interface(HEADER, &ifaces).unwrap();
        assert_eq!(info.name, "eth0");
    }

    #[test]
    fn test_first_usable_all_loopback() {
        let ifaces = FakeInterfaces::new(&[("lo", "127.0.0.1")]);
        assert_eq!(first_usable_interface(HEADER, &ifaces), None);
        assert_eq!(first_usable_interface("", &FakeInterfaces::new(&[])), None);
    }

    #[tokio::test]
    async fn test_route_model_reads_table_file() {
        let path = std::env::temp_dir().join(format!("guestnet-route-{}", std::process::id()));
        std::fs::write(
            &path,
            table(&[
                "eth0\t00000000\t01345B0A\t0003\t0\t0\t5\t00000000\t0\t0\t0",
                "lo\t00000000\t01345B0A\t0003\t0\t0\t1\t00000000\t0\t0\t0",
            ]),
        )
        .unwrap();

        let model = RouteModel::new(&path, FakeInterfaces::new(&[("eth0", "10.0.0.4")]));
        assert_eq!(model.primary_interface().await.unwrap(), Some("eth0".to_string()));
        assert!(model.is_primary_interface("eth0").await.unwrap());
        assert!(!model.is_primary_interface("lo").await.unwrap());
        assert_eq!(
            model.first_usable_interface().await.unwrap().unwrap().ipv4_address,
            Ipv4Addr::new(10, 0, 0, 4)
        );

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_route_model_missing_table_is_io_error() {
        let model = RouteModel::new("/nonexistent/guestnet/route", FakeInterfaces::new(&[]));
        let err = model.primary_interface().await.unwrap_err();
        assert!(matches!(err, crate::error::GuestNetError::Io(_)));
    }

    #[test]
    fn test_primary_route_keeps_gateway() {
        let raw = table(&[
            "eth1	00000000	0100000A	0003	0	0	9	00000000	0	0	0",
            "eth0	00000000	01345B0A	0003	0	0	2	00000000	0	0	0",
        ]);
        let route = primary_route(&raw, &FakeInterfaces::new(&[])).unwrap();
        assert_eq!(route.interface, "eth0");
        assert_eq!(route.gateway, Ipv4Addr::new(10, 91, 52, 1));
    }

    /// Records `ip` invocations and answers with a fixed exit code.
    struct RecordingRunner {
        calls: std::cell::RefCell<Vec<(String, Vec<String>)>>,
        exit_code: i32,
    }

    impl CommandRunner for RecordingRunner {
        async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
            self.calls.borrow_mut().push((program.to_string(), args.to_vec()));
            Ok(CommandOutput {
                exit_code: Some(self.exit_code),
                stdout: String::new(),
                stderr: if self.exit_code == 0 {
                    String::new()
                } else {
                    "RTNETLINK answers: Operation not permitted".into()
                },
            })
        }
    }

    #[tokio::test]
    async fn test_ip_route_replaces_host_route() {
        let raw = table(&["eth0	00000000	01345B0A	0003	0	0	0	00000000	0	0	0"]);
        let primary = primary_route(&raw, &FakeInterfaces::new(&[])).unwrap();
        let runner = RecordingRunner {
            calls: Default::default(),
            exit_code: 0,
        };

        IpRoute::new(&runner)
            .configure_routes(Ipv4Addr::new(168, 63, 129, 16), &primary)
            .await
            .unwrap();

        let calls = runner.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "ip");
        assert_eq!(
            calls[0].1.join(" "),
            "route replace 168.63.129.16/32 via 10.91.52.1 dev eth0"
        );
    }

    #[tokio::test]
    async fn test_ip_route_failure_is_command_error() {
        let raw = table(&["eth0	00000000	01345B0A	0003	0	0	0	00000000	0	0	0"]);
        let primary = primary_route(&raw, &FakeInterfaces::new(&[])).unwrap();
        let runner = RecordingRunner {
            calls: Default::default(),
            exit_code: 2,
        };

        let err = IpRoute::new(&runner)
            .configure_routes(Ipv4Addr::new(168, 63, 129, 16), &primary)
            .await
            .unwrap_err();
        match err {
            crate::error::GuestNetError::CommandError { exit_code, stderr, .. } => {
                assert_eq!(exit_code, Some(2));
                assert!(stderr.contains("Operation not permitted"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
