//! CLI commands

pub mod keys;
pub mod run;
pub mod status;
