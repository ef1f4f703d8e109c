//! The meridian daemon: owns the machine records, drives every machine
//! through its lifecycle and serves the management API on a unix socket.

pub mod allocate;
pub mod error;
pub mod health;
pub mod hypervisor;
pub mod manager;
pub mod pull;
pub mod routes;
pub mod sandbox;
pub mod serve;
pub mod state;
pub mod store;
pub mod task;

pub use error::VmError;
pub use manager::VmMgr;
