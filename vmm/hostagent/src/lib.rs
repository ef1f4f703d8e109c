//! Meridian host agent.
//!
//! One `meridian-vm` process runs per started machine. It owns the
//! hypervisor through a backend [`Driver`](mdn_backend::Driver), keeps the
//! machine's port forwards alive and answers the daemon on the machine's
//! `sandbox.sock`.

pub mod agent;
pub mod server;

pub use agent::HostAgent;
