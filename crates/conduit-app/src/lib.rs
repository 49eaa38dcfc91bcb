//! Process-wide application context (SPEC_FULL.md §4.H): the one place a
//! process's bus handle, shutdown signal, and set of live connectors live.

mod context;

pub use context::ApplicationContext;
