//! Command-line entry points for the runtime (SPEC_FULL.md §2): a device
//! manager process, a reachability probe, and a status listing over a set
//! of named components.

pub mod commands;
pub mod echo;

pub use commands::Cli;
