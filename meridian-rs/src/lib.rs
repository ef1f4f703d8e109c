//! Meridian Base Crate
//!
//! This crate contains shared type definitions and helper functions used
//! across the other Meridian components: the declarative machine spec, the
//! persisted machine and image records, the on-disk layout of a machine
//! directory, the sandbox control API and the configuration loader. It does
//! not contain any actual component / service implementations.

pub mod api;
pub mod config;
pub mod image;
pub mod machine;
pub mod spec;
pub mod util;
