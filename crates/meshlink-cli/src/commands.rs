//! Command handlers for the MeshLink CLI

use std::time::Duration;

use meshlink_ble::{BtleplugRadio, ConnectionStateMachine, OperationQueue, Schedulers};
use meshlink_core::protocol::{AckPacket, AdvertisePacket, DeclareHashesPacket, LuidPacket};
use meshlink_core::{EnvelopeCodec, Luid, MessageType, Payload};
use tracing::{info, warn};

use crate::cli::{Cli, Commands, PacketArgs};
use crate::config::CliConfig;
use crate::demo::run_demo;
use crate::error::{CliError, Result};

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, mut config: CliConfig) -> Result<()> {
        match cli.command {
            Commands::Demo { rounds } => {
                if let Some(rounds) = rounds {
                    config.demo.rounds = rounds;
                    config.validate()?;
                }
                Self::handle_demo_command(&config).await
            }
            Commands::Encode { packet } => {
                let envelope = encode_packet(&config, packet)?;
                println!("{}", envelope);
                Ok(())
            }
            Commands::Decode { expected, hex } => {
                let payload = decode_envelope(&config, &hex, expected)?;
                println!("{:#?}", payload);
                Ok(())
            }
            Commands::Config => {
                print!("{}", config.to_toml()?);
                Ok(())
            }
            Commands::Scan { seconds } => {
                Self::handle_scan_command(&config, Duration::from_secs(seconds)).await
            }
        }
    }

    async fn handle_demo_command(config: &CliConfig) -> Result<()> {
        info!(
            "Running {} loopback handshake(s) with {} byte fragments",
            config.demo.rounds, config.mesh.fragment_size
        );
        for report in run_demo(config).await? {
            println!(
                "round {}: {} <-> {} ({} writes)",
                report.round, report.initiator, report.responder, report.writes
            );
            println!(
                "  {} learned: provides {:?}, {} identities, {} hashes, leader={}",
                report.initiator,
                report.initiator_learned.provides,
                report.initiator_learned.identities.len(),
                report.initiator_learned.hashes.len(),
                report.initiator_learned.leader
            );
            println!(
                "  {} learned: provides {:?}, {} identities, {} hashes, leader={}",
                report.responder,
                report.responder_learned.provides,
                report.responder_learned.identities.len(),
                report.responder_learned.hashes.len(),
                report.responder_learned.leader
            );
        }
        Ok(())
    }

    async fn handle_scan_command(config: &CliConfig, duration: Duration) -> Result<()> {
        let radio = BtleplugRadio::first_adapter().await?;
        let schedulers = Schedulers::current()?;
        let queue = OperationQueue::start(&schedulers, &config.mesh);
        let machine = ConnectionStateMachine::new(
            std::sync::Arc::new(radio.clone()),
            queue,
            schedulers,
            config.mesh.clone(),
        );

        info!("Scanning for {:?}", duration);
        let found = radio.scan(duration).await?;
        if found.is_empty() {
            warn!("No MeshLink advertisements seen");
        }
        for advert in &found {
            let luid = advert
                .luid()
                .map_or_else(|| "-".to_string(), |luid| luid.to_string());
            let rssi = advert
                .rssi
                .map_or_else(|| "?".to_string(), |rssi| rssi.to_string());
            println!(
                "{:?}  luid={}  rssi={}  connect={}",
                advert.device,
                luid,
                rssi,
                machine.should_connect(advert)
            );
        }
        machine.queue().shutdown();
        Ok(())
    }
}

/// Build the payload described on the command line
pub fn build_payload(packet: PacketArgs) -> Result<Payload> {
    let payload = match packet {
        PacketArgs::Luid { luid } => {
            let luid = match luid {
                Some(text) => text.parse::<Luid>()?,
                None => Luid::random(),
            };
            Payload::Luid(LuidPacket {
                luid,
                hashed: None,
                protocol_version: meshlink_ble::PROTOCOL_VERSION,
            })
        }
        PacketArgs::Advertise { provides } => Payload::Advertise(AdvertisePacket { provides }),
        PacketArgs::DeclareHashes { hashes } => Payload::DeclareHashes(DeclareHashesPacket {
            optout: false,
            hashes: hashes
                .iter()
                .map(hex::decode)
                .collect::<std::result::Result<_, _>>()?,
        }),
        PacketArgs::Ack { message, status } => Payload::Ack(AckPacket {
            success: status == 0,
            message,
            status,
        }),
    };
    Ok(payload)
}

/// Frame `packet` and render the envelope as hex
pub fn encode_packet(config: &CliConfig, packet: PacketArgs) -> Result<String> {
    let payload = build_payload(packet)?;
    let codec = EnvelopeCodec::new(config.mesh.limits);
    let envelope = codec.try_encode(&payload).map_err(|e| {
        CliError::InvalidInput(format!("cannot encode {}: {}", payload.message_type(), e))
    })?;
    Ok(hex::encode(envelope.as_bytes()))
}

/// Parse a hex envelope that must carry `expected`
pub fn decode_envelope(config: &CliConfig, text: &str, expected: MessageType) -> Result<Payload> {
    let bytes = hex::decode(text.trim())?;
    let codec = EnvelopeCodec::new(config.mesh.limits);
    Ok(codec.decode_slice(&bytes, expected)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlink_core::MeshError;

    #[test]
    fn test_encoded_hex_decodes_back() {
        let config = CliConfig::default();
        let hex = encode_packet(
            &config,
            PacketArgs::Advertise {
                provides: vec![1, 8],
            },
        )
        .unwrap();
        let payload = decode_envelope(&config, &hex, MessageType::Advertise).unwrap();
        assert_eq!(
            payload,
            Payload::Advertise(AdvertisePacket {
                provides: vec![1, 8]
            })
        );
    }

    #[test]
    fn test_decode_reports_type_mismatch() {
        let config = CliConfig::default();
        let hex = encode_packet(&config, PacketArgs::Luid { luid: None }).unwrap();
        let result = decode_envelope(&config, &hex, MessageType::Ack);
        assert!(matches!(result, Err(CliError::Mesh(MeshError::Framing(_)))));
    }

    #[test]
    fn test_invalid_inputs_are_rejected() {
        let config = CliConfig::default();
        assert!(matches!(
            build_payload(PacketArgs::Luid {
                luid: Some("not-a-luid".into())
            }),
            Err(CliError::Mesh(_))
        ));
        assert!(matches!(
            build_payload(PacketArgs::DeclareHashes {
                hashes: vec!["zz".into()]
            }),
            Err(CliError::HexDecoding(_))
        ));
        assert!(encode_packet(&config, PacketArgs::Advertise { provides: vec![] }).is_err());
        assert!(decode_envelope(&config, "0011", MessageType::Ack).is_err());
    }
}
