//! CLI command implementations.

pub mod run;

pub use run::{cmd_plan, cmd_run};
