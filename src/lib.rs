//! guestnet - network reconciliation core for a guest VM agent.
//!
//! Decides which interface carries the default route, keeps the firewall policy
//! that protects the wireserver endpoint in place, and notices when the OS DHCP
//! client restarts so routes can be reapplied.

pub mod agent;
pub mod config;
pub mod error;
pub mod schedule;
pub mod system;

pub use agent::{Agent, SystemAgent, TickReport};
pub use config::Config;
pub use error::{GuestNetError, Result};
