pub mod cmd;
pub mod config;
pub mod errors;
pub mod executor;
pub mod phase;
pub mod pipeline;
pub mod report;
pub mod tracker;
pub mod ui;
