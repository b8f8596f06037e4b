//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};
use meshlink_core::MessageType;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a full handshake between two in-memory nodes
    Demo {
        /// Number of handshakes to run back to back
        #[arg(short, long)]
        rounds: Option<u32>,
    },
    /// Frame a packet and print the envelope as hex
    Encode {
        #[command(subcommand)]
        packet: PacketArgs,
    },
    /// Decode a hex envelope
    Decode {
        /// Message type the envelope must carry
        #[arg(short = 't', long = "type", value_parser = parse_message_type)]
        expected: MessageType,
        /// Envelope bytes in hex
        hex: String,
    },
    /// Print the effective configuration as TOML
    Config,
    /// Scan for nearby MeshLink advertisements
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value_t = 5)]
        seconds: u64,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum PacketArgs {
    /// Luid announcement
    Luid {
        /// Luid to announce; random when omitted
        #[arg(short, long)]
        luid: Option<String>,
    },
    /// Capability advertisement
    Advertise {
        /// Capability bits this node provides
        #[arg(short, long, value_delimiter = ',', default_value = "0")]
        provides: Vec<u32>,
    },
    /// Hash declaration
    DeclareHashes {
        /// 32-byte hashes in hex
        hashes: Vec<String>,
    },
    /// Acknowledgement
    Ack {
        #[arg(short, long)]
        message: Option<String>,
        #[arg(short, long, default_value_t = 0)]
        status: i32,
    },
}

fn parse_message_type(value: &str) -> Result<MessageType, String> {
    value.parse::<MessageType>().map_err(|e| e.to_string())
}
