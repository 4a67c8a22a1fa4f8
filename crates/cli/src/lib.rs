//! uiverify CLI
//!
//! Command-line front end for running and validating scenario files.

pub mod commands;
pub mod output;
