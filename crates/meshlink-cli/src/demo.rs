//! Loopback demo: two in-memory nodes discover each other and handshake
//!
//! Everything except the radio is the production path: luid advertisements,
//! the operation queue, the connection state machine, the envelope codec and
//! the profile exchange.

use std::sync::Arc;

use meshlink_ble::{
    ConnectionStateMachine, LocalProfile, LuidRotation, MemoryDevice, MemoryNetwork, MemoryRadio,
    OperationQueue, PeerProfile, ProfileExchange, RadioCommand, Schedulers,
};
use meshlink_core::protocol::IdentityPacket;
use meshlink_core::{Luid, MeshConfig};
use tracing::info;

use crate::config::CliConfig;
use crate::error::{CliError, Result};

/// What one handshake round produced
#[derive(Debug, Clone)]
pub struct DemoReport {
    pub round: u32,
    pub initiator: Luid,
    pub responder: Luid,
    /// Profile the initiator learned about the responder
    pub initiator_learned: PeerProfile,
    /// Profile the responder learned about the initiator
    pub responder_learned: PeerProfile,
    /// Radio writes issued by the initiator
    pub writes: usize,
}

struct DemoNode {
    radio: MemoryRadio,
    rotation: LuidRotation,
    machine: Arc<ConnectionStateMachine<MemoryRadio>>,
    name: String,
}

impl DemoNode {
    fn new(network: &MemoryNetwork, name: &str, config: &MeshConfig) -> Result<Self> {
        let radio = network.radio(name);
        let schedulers = Schedulers::current()?;
        let queue = OperationQueue::start(&schedulers, config);
        let machine = Arc::new(ConnectionStateMachine::new(
            Arc::new(radio.clone()),
            queue,
            schedulers,
            config.clone(),
        ));
        let rotation = LuidRotation::new();
        radio.advertise(rotation.service_data());
        Ok(Self {
            radio,
            rotation,
            machine,
            name: name.to_string(),
        })
    }

    fn profile(&self, provides: &[u32]) -> LocalProfile {
        LocalProfile::new(self.rotation.current())
            .with_provides(provides.to_vec())
            .with_identity(demo_identity(&self.name))
    }

    /// Luid advertised by `device`, as seen by this node's scanner
    fn luid_of(&self, device: &MemoryDevice) -> Result<Luid> {
        self.radio
            .scan()
            .into_iter()
            .find(|advert| advert.device == *device)
            .and_then(|advert| advert.luid())
            .ok_or_else(|| CliError::InvalidInput(format!("no luid advertised by {}", device)))
    }

    fn rotate(&self) {
        self.rotation.rotate();
        self.radio.advertise(self.rotation.service_data());
    }
}

fn demo_identity(name: &str) -> IdentityPacket {
    IdentityPacket {
        name: name.to_string(),
        public_key: vec![0xA5; 32],
        signature: vec![0x5A; 64],
        end: false,
    }
}

/// Run `config.demo.rounds` handshakes between two fresh nodes
pub async fn run_demo(config: &CliConfig) -> Result<Vec<DemoReport>> {
    let network = MemoryNetwork::new();
    let initiator = DemoNode::new(&network, &config.demo.initiator_name, &config.mesh)?;
    let responder = Arc::new(DemoNode::new(
        &network,
        &config.demo.responder_name,
        &config.mesh,
    )?);

    let mut reports = Vec::new();
    for round in 1..=config.demo.rounds {
        let target = initiator
            .radio
            .scan()
            .into_iter()
            .find(|advert| initiator.machine.should_connect(advert))
            .ok_or_else(|| CliError::InvalidInput("no peer to connect to".into()))?;
        let responder_luid = target
            .luid()
            .ok_or_else(|| CliError::InvalidInput("advertisement without luid".into()))?;
        info!("Round {}: connecting to {}", round, responder_luid);
        initiator.radio.clear_commands();

        let answering = {
            let responder = responder.clone();
            let provides = config.demo.provides.clone();
            tokio::spawn(async move {
                let device = responder
                    .radio
                    .accept()
                    .await
                    .ok_or_else(|| CliError::InvalidInput("network closed".into()))?;
                let peer_luid = responder.luid_of(&device)?;
                let mut handler = ProfileExchange::new(responder.profile(&provides));
                let outcome = responder
                    .machine
                    .run_transaction(&device, peer_luid, true, &mut handler)
                    .await?;
                responder
                    .machine
                    .update_disconnected(peer_luid, "demo round complete")
                    .await;
                Ok::<_, CliError>(outcome.into_item())
            })
        };

        let mut handler = ProfileExchange::new(initiator.profile(&config.demo.provides));
        let learned = initiator
            .machine
            .run_transaction(&target.device, responder_luid, false, &mut handler)
            .await?
            .into_item();
        let answered = answering
            .await
            .map_err(|e| CliError::InvalidInput(format!("responder task failed: {}", e)))??;

        let (Some(initiator_learned), Some(responder_learned)) = (learned, answered) else {
            return Err(CliError::InvalidInput("handshake ended without a profile".into()));
        };
        let writes = initiator
            .radio
            .commands()
            .iter()
            .filter(|c| matches!(c, RadioCommand::Write { .. }))
            .count();
        initiator
            .machine
            .update_disconnected(responder_luid, "demo round complete")
            .await;

        reports.push(DemoReport {
            round,
            initiator: initiator.rotation.current(),
            responder: responder_luid,
            initiator_learned,
            responder_learned,
            writes,
        });
        initiator.rotate();
        responder.rotate();
    }

    initiator.machine.queue().shutdown();
    responder.machine.queue().shutdown();
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_demo_rounds_complete() {
        let mut config = CliConfig::default();
        config.demo.rounds = 2;
        config.demo.provides = vec![3];

        let reports = run_demo(&config).await.unwrap();
        assert_eq!(reports.len(), 2);
        for report in &reports {
            assert_eq!(report.initiator_learned.luid, Some(report.responder));
            assert_eq!(report.responder_learned.luid, Some(report.initiator));
            assert_eq!(report.initiator_learned.provides, vec![3]);
            assert_eq!(report.initiator_learned.identities[0].name, "bravo");
            assert_eq!(report.responder_learned.identities[0].name, "alpha");
            assert_ne!(
                report.initiator_learned.leader,
                report.responder_learned.leader
            );
            assert!(report.writes > 0);
        }
        assert_ne!(reports[0].responder, reports[1].responder);
    }
}
