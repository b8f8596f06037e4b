//! Symmetric profile exchange handshake
//!
//! Both ends run the same handler: at each stage they send their own packet
//! and then read the peer's. Stages whose collaborators live outside this
//! crate (link upgrade, bulk block transfer) are passed through.

use async_trait::async_trait;
use meshlink_core::errors::TransactionError;
use meshlink_core::protocol::{
    AdvertisePacket, DeclareHashesPacket, ElectLeaderPacket, IdentityPacket, LuidPacket,
    MessageType, Payload,
};
use meshlink_core::{HandshakeStage, Luid, MeshResult, TransactionResult};
use tracing::debug;

use crate::radio::Radio;
use crate::session::{PeerSession, TransactionHandler};

/// Protocol version carried in the luid packet
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on identities accepted from one peer
const MAX_IDENTITIES: usize = 64;

// ----------------------------------------------------------------------------
// Profiles
// ----------------------------------------------------------------------------

/// What this node tells peers about itself
#[derive(Debug, Clone)]
pub struct LocalProfile {
    pub luid: Luid,
    pub provides: Vec<u32>,
    pub identities: Vec<IdentityPacket>,
    pub hashes: Vec<Vec<u8>>,
}

impl LocalProfile {
    pub fn new(luid: Luid) -> Self {
        Self {
            luid,
            provides: vec![0],
            identities: Vec::new(),
            hashes: Vec::new(),
        }
    }

    pub fn with_provides(mut self, provides: Vec<u32>) -> Self {
        self.provides = provides;
        self
    }

    pub fn with_identity(mut self, identity: IdentityPacket) -> Self {
        self.identities.push(identity);
        self
    }

    pub fn with_hashes(mut self, hashes: Vec<Vec<u8>>) -> Self {
        self.hashes = hashes;
        self
    }

    fn provides_mask(&self) -> u32 {
        self.provides.iter().fold(0, |mask, p| mask | p)
    }
}

/// What was learned about the peer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerProfile {
    pub luid: Option<Luid>,
    pub protocol_version: u32,
    pub provides: Vec<u32>,
    pub identities: Vec<IdentityPacket>,
    pub hashes: Vec<Vec<u8>>,
    /// Whether the local node won the leader election
    pub leader: bool,
}

// ----------------------------------------------------------------------------
// Handler
// ----------------------------------------------------------------------------

/// Handshake handler exchanging [`LocalProfile`]s
#[derive(Debug)]
pub struct ProfileExchange {
    local: LocalProfile,
    learned: PeerProfile,
    salt: Vec<u8>,
    peer_tiebreaker: Option<Luid>,
}

impl ProfileExchange {
    pub fn new(local: LocalProfile) -> Self {
        let salt = Luid::random().as_bytes().to_vec();
        Self {
            local,
            learned: PeerProfile::default(),
            salt,
            peer_tiebreaker: None,
        }
    }

    pub fn learned(&self) -> &PeerProfile {
        &self.learned
    }

    fn election(&self, reveal: bool) -> Payload {
        Payload::ElectLeader(ElectLeaderPacket {
            salt: self.salt.clone(),
            provides: self.local.provides_mask(),
            tiebreaker: self.local.luid,
            reveal,
        })
    }

    async fn run_stage<R: Radio>(
        &mut self,
        session: &mut PeerSession<R>,
        stage: HandshakeStage,
    ) -> MeshResult<TransactionResult<PeerProfile>> {
        let next = match stage {
            HandshakeStage::Luid => {
                let ours = Payload::Luid(LuidPacket {
                    luid: self.local.luid,
                    hashed: None,
                    protocol_version: PROTOCOL_VERSION,
                });
                if let Payload::Luid(theirs) = session.exchange(&ours, MessageType::Luid).await? {
                    self.learned.luid = Some(theirs.luid);
                    self.learned.protocol_version = theirs.protocol_version;
                }
                HandshakeStage::Advertise
            }
            HandshakeStage::Advertise => {
                let ours = Payload::Advertise(AdvertisePacket {
                    provides: self.local.provides.clone(),
                });
                if let Payload::Advertise(theirs) =
                    session.exchange(&ours, MessageType::Advertise).await?
                {
                    self.learned.provides = theirs.provides;
                }
                HandshakeStage::ElectionHashed
            }
            HandshakeStage::ElectionHashed => {
                let ours = self.election(false);
                if let Payload::ElectLeader(theirs) =
                    session.exchange(&ours, MessageType::ElectLeader).await?
                {
                    self.peer_tiebreaker = Some(theirs.tiebreaker);
                }
                HandshakeStage::ElectionReveal
            }
            HandshakeStage::ElectionReveal => {
                let ours = self.election(true);
                if let Payload::ElectLeader(theirs) =
                    session.exchange(&ours, MessageType::ElectLeader).await?
                {
                    if self.peer_tiebreaker != Some(theirs.tiebreaker) || !theirs.reveal {
                        return Err(TransactionError::Handler {
                            reason: "peer changed its election entry".into(),
                        }
                        .into());
                    }
                    self.learned.leader = self.local.luid > theirs.tiebreaker;
                }
                HandshakeStage::Upgrade
            }
            HandshakeStage::Upgrade | HandshakeStage::BlockData => {
                debug!("No collaborator for {}, passing through", stage);
                HandshakeStage::Identity
            }
            HandshakeStage::Identity => {
                for identity in &self.local.identities {
                    session.send(&Payload::Identity(identity.clone())).await?;
                }
                session.send(&Payload::Identity(end_of_identities())).await?;
                loop {
                    match session.receive(MessageType::Identity).await? {
                        Payload::Identity(identity) if identity.end => break,
                        Payload::Identity(identity) => {
                            if self.learned.identities.len() >= MAX_IDENTITIES {
                                return Err(TransactionError::Handler {
                                    reason: "too many identities".into(),
                                }
                                .into());
                            }
                            self.learned.identities.push(identity);
                        }
                        _ => {}
                    }
                }
                HandshakeStage::DeclareHashes
            }
            HandshakeStage::DeclareHashes => {
                let ours = Payload::DeclareHashes(DeclareHashesPacket {
                    optout: false,
                    hashes: self.local.hashes.clone(),
                });
                if let Payload::DeclareHashes(theirs) =
                    session.exchange(&ours, MessageType::DeclareHashes).await?
                {
                    self.learned.hashes = theirs.hashes;
                }
                return Ok(TransactionResult::of_item(self.learned.clone())
                    .with_stage(HandshakeStage::Exit));
            }
            HandshakeStage::Exit => HandshakeStage::Exit,
        };
        Ok(TransactionResult::of_stage(next))
    }
}

fn end_of_identities() -> IdentityPacket {
    IdentityPacket {
        name: String::new(),
        public_key: Vec::new(),
        signature: Vec::new(),
        end: true,
    }
}

#[async_trait]
impl<R: Radio> TransactionHandler<R> for ProfileExchange {
    type Item = PeerProfile;

    async fn step(
        &mut self,
        session: &mut PeerSession<R>,
        stage: HandshakeStage,
    ) -> TransactionResult<PeerProfile> {
        self.run_stage(session, stage)
            .await
            .unwrap_or_else(TransactionResult::of_error)
    }
}
