//! Network interface enumeration and loopback detection.

use std::ffi::CStr;
use std::net::Ipv4Addr;

use crate::error::Result;

/// An interface with its bound IPv4 address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub ipv4_address: Ipv4Addr,
}

/// Read-only view of the host's interfaces.
pub trait InterfaceQuery {
    /// Interfaces that have an IPv4 address, in kernel enumeration order.
    /// An interface appears at most once (with its first address).
    fn list_interfaces(&self) -> Result<Vec<InterfaceInfo>>;

    fn is_loopback(&self, name: &str) -> bool;
}

impl<Q: InterfaceQuery + ?Sized> InterfaceQuery for &Q {
    fn list_interfaces(&self) -> Result<Vec<InterfaceInfo>> {
        (**self).list_interfaces()
    }

    fn is_loopback(&self, name: &str) -> bool {
        (**self).is_loopback(name)
    }
}

/// Queries the live system via `getifaddrs(3)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

impl SystemInterfaces {
    /// Walk the `getifaddrs` list, yielding `(name, flags, ipv4)` for every entry.
    fn walk() -> Result<Vec<(String, u32, Option<Ipv4Addr>)>> {
        let mut out = Vec::new();
        let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();

        // SAFETY: getifaddrs fills `ifap` with a linked list that stays valid until
        // freeifaddrs; every node is only read while the list is alive.
        unsafe {
            if libc::getifaddrs(&mut ifap) != 0 {
                return Err(std::io::Error::last_os_error().into());
            }

            let mut cur = ifap;
            while !cur.is_null() {
                let ifa = &*cur;
                let name = CStr::from_ptr(ifa.ifa_name).to_string_lossy().into_owned();

                let mut ipv4 = None;
                let addr = ifa.ifa_addr;
                if !addr.is_null() && i32::from((*addr).sa_family) == libc::AF_INET {
                    let sa = std::ptr::read_unaligned(addr.cast::<libc::sockaddr_in>());
                    ipv4 = Some(Ipv4Addr::from(sa.sin_addr.s_addr.to_ne_bytes()));
                }

                out.push((name, ifa.ifa_flags, ipv4));
                cur = ifa.ifa_next;
            }

            libc::freeifaddrs(ifap);
        }

        Ok(out)
    }
}

impl InterfaceQuery for SystemInterfaces {
    fn list_interfaces(&self) -> Result<Vec<InterfaceInfo>> {
        let mut interfaces: Vec<InterfaceInfo> = Vec::new();

        for (name, _, ipv4) in Self::walk()? {
            let Some(ipv4_address) = ipv4 else {
                continue;
            };
            if interfaces.iter().any(|iface| iface.name == name) {
                continue;
            }
            interfaces.push(InterfaceInfo { name, ipv4_address });
        }

        Ok(interfaces)
    }

    fn is_loopback(&self, name: &str) -> bool {
        match Self::walk() {
            Ok(entries) => entries
                .iter()
                .any(|(iface, flags, _)| iface == name && flags & libc::IFF_LOOPBACK as u32 != 0),
            Err(e) => {
                tracing::warn!("Unable to query flags of interface {}: {}", name, e);
                false
            }
        }
    }
}
