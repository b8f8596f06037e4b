//! MeshLink CLI library
//!
//! Configuration loading, the loopback demo and the command handlers behind
//! the `meshlink` binary.

pub mod cli;
pub mod commands;
pub mod config;
pub mod demo;
pub mod error;

pub use cli::{Cli, Commands, PacketArgs};
pub use config::{CliConfig, DemoConfig};
pub use demo::{run_demo, DemoReport};
pub use error::{CliError, Result};
