//! CLI subcommand implementations

pub mod crd;
pub mod explain;
pub mod get;
