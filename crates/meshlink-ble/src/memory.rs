//! In-memory radio
//!
//! A [`MemoryNetwork`] connects any number of [`MemoryRadio`]s. Links are
//! pairs of unbounded mailboxes, one per direction. Every radio call is
//! recorded so tests can assert on command order, and faults can be injected
//! per radio.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::channel::mpsc as chunks;
use futures::stream::BoxStream;
use futures::StreamExt;
use meshlink_core::errors::TransportError;
use meshlink_core::MeshResult;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::discovery::Advertisement;
use crate::error::BleError;
use crate::radio::{fragment_size_for_mtu, Radio};

/// Default ATT MTU: 20-byte writes until a larger MTU is granted
pub const DEFAULT_MEMORY_MTU: usize = 23;

// ----------------------------------------------------------------------------
// Handles
// ----------------------------------------------------------------------------

/// Address of a node on a memory network
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryDevice(String);

impl MemoryDevice {
    pub fn new<T: Into<String>>(name: T) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemoryDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One end of a memory link
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryLink {
    id: u64,
    local: MemoryDevice,
    remote: MemoryDevice,
}

impl MemoryLink {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local(&self) -> &MemoryDevice {
        &self.local
    }

    pub fn remote(&self) -> &MemoryDevice {
        &self.remote
    }
}

/// A recorded radio call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCommand {
    Connect { device: MemoryDevice, reverse: bool },
    Disconnect { link: u64 },
    Write { link: u64, len: usize },
    Subscribe { link: u64 },
    RequestMtu { link: u64, mtu: usize },
    ResetLinkParameters,
    StartServer,
    StopServer,
}

// ----------------------------------------------------------------------------
// Network
// ----------------------------------------------------------------------------

struct Mailbox {
    sender: chunks::UnboundedSender<Vec<u8>>,
    receiver: Option<chunks::UnboundedReceiver<Vec<u8>>>,
}

struct NodeState {
    service_data: HashMap<Uuid, Vec<u8>>,
    incoming: mpsc::UnboundedSender<MemoryDevice>,
}

#[derive(Default)]
struct NetworkInner {
    next_link: AtomicU64,
    nodes: DashMap<MemoryDevice, NodeState>,
    // Inbound chunks for (link, receiving device)
    mailboxes: DashMap<(u64, MemoryDevice), Mailbox>,
    // Links awaiting adoption, keyed by (acceptor, initiator)
    pending: DashMap<(MemoryDevice, MemoryDevice), u64>,
}

/// Shared medium for memory radios
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a radio named `name`
    pub fn radio(&self, name: &str) -> MemoryRadio {
        let device = MemoryDevice::new(name);
        let (incoming, accepted) = mpsc::unbounded_channel();
        self.inner.nodes.insert(
            device.clone(),
            NodeState {
                service_data: HashMap::new(),
                incoming,
            },
        );
        MemoryRadio {
            inner: Arc::new(RadioInner {
                device,
                network: self.clone(),
                max_mtu: AtomicUsize::new(DEFAULT_MEMORY_MTU),
                faults: Mutex::new(Faults::default()),
                commands: Mutex::new(Vec::new()),
                accepted: tokio::sync::Mutex::new(accepted),
            }),
        }
    }

    fn open_mailbox(&self, link: u64, device: MemoryDevice) {
        let (sender, receiver) = chunks::unbounded();
        self.inner.mailboxes.insert(
            (link, device),
            Mailbox {
                sender,
                receiver: Some(receiver),
            },
        );
    }

    fn close_link(&self, link: &MemoryLink) {
        self.inner.mailboxes.remove(&(link.id, link.local.clone()));
        self.inner.mailboxes.remove(&(link.id, link.remote.clone()));
        self.inner.pending.retain(|_, id| *id != link.id);
    }

    /// Number of open mailboxes on the network
    pub fn open_mailboxes(&self) -> usize {
        self.inner.mailboxes.len()
    }
}

impl fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("nodes", &self.inner.nodes.len())
            .field("mailboxes", &self.inner.mailboxes.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Radio
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Faults {
    deny_permission: bool,
    failing_connects: usize,
    write_delay: Option<Duration>,
}

struct RadioInner {
    device: MemoryDevice,
    network: MemoryNetwork,
    max_mtu: AtomicUsize,
    faults: Mutex<Faults>,
    commands: Mutex<Vec<RadioCommand>>,
    accepted: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryDevice>>,
}

/// Deterministic loopback radio
#[derive(Clone)]
pub struct MemoryRadio {
    inner: Arc<RadioInner>,
}

impl MemoryRadio {
    /// Two radios on a fresh network, named `a` and `b`
    pub fn pair() -> (MemoryRadio, MemoryRadio) {
        let network = MemoryNetwork::new();
        (network.radio("a"), network.radio("b"))
    }

    pub fn device(&self) -> MemoryDevice {
        self.inner.device.clone()
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.inner.network
    }

    /// Largest MTU this radio grants
    pub fn set_max_mtu(&self, mtu: usize) {
        self.inner.max_mtu.store(mtu, Ordering::SeqCst);
    }

    pub fn deny_permission(&self, deny: bool) {
        self.faults().deny_permission = deny;
    }

    /// Make the next `count` outbound connects fail
    pub fn fail_next_connects(&self, count: usize) {
        self.faults().failing_connects = count;
    }

    pub fn set_write_delay(&self, delay: Option<Duration>) {
        self.faults().write_delay = delay;
    }

    /// Every call made so far, in order
    pub fn commands(&self) -> Vec<RadioCommand> {
        self.command_log().clone()
    }

    pub fn clear_commands(&self) {
        self.command_log().clear();
    }

    /// Publish service data to scanners on the network
    pub fn advertise(&self, (uuid, data): (Uuid, Vec<u8>)) {
        if let Some(mut node) = self.inner.network.inner.nodes.get_mut(&self.inner.device) {
            node.service_data.insert(uuid, data);
        }
    }

    /// Advertisements of every other node on the network
    pub fn scan(&self) -> Vec<Advertisement<MemoryDevice>> {
        self.inner
            .network
            .inner
            .nodes
            .iter()
            .filter(|node| *node.key() != self.inner.device && !node.service_data.is_empty())
            .map(|node| Advertisement {
                device: node.key().clone(),
                service_data: node.service_data.clone(),
                rssi: Some(-40),
            })
            .collect()
    }

    /// Wait for a peer to connect to this radio
    pub async fn accept(&self) -> Option<MemoryDevice> {
        self.inner.accepted.lock().await.recv().await
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.inner.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn command_log(&self) -> MutexGuard<'_, Vec<RadioCommand>> {
        self.inner
            .commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, command: RadioCommand) {
        trace!("{} radio: {:?}", self.inner.device, command);
        self.command_log().push(command);
    }

    fn check_permission(&self) -> MeshResult<()> {
        if self.faults().deny_permission {
            return Err(TransportError::PermissionDenied.into());
        }
        Ok(())
    }
}

impl fmt::Debug for MemoryRadio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRadio")
            .field("device", &self.inner.device)
            .finish()
    }
}

#[async_trait]
impl Radio for MemoryRadio {
    type Device = MemoryDevice;
    type Link = MemoryLink;

    async fn connect(&self, device: &MemoryDevice, reverse: bool) -> MeshResult<MemoryLink> {
        self.record(RadioCommand::Connect {
            device: device.clone(),
            reverse,
        });
        self.check_permission()?;
        {
            let mut faults = self.faults();
            if faults.failing_connects > 0 {
                faults.failing_connects -= 1;
                return Err(BleError::Refused(format!("connection to {} refused", device)).into());
            }
        }

        let network = &self.inner.network;
        let local = self.device();
        if reverse {
            let (_, id) = network
                .inner
                .pending
                .remove(&(local.clone(), device.clone()))
                .ok_or_else(|| BleError::Refused(format!("no inbound link from {}", device)))?;
            return Ok(MemoryLink {
                id,
                local,
                remote: device.clone(),
            });
        }

        if *device == local {
            return Err(BleError::Refused("cannot connect to self".into()).into());
        }
        let Some(node) = network.inner.nodes.get(device) else {
            return Err(BleError::UnknownDevice {
                device: device.to_string(),
            }
            .into());
        };

        let id = network.inner.next_link.fetch_add(1, Ordering::SeqCst);
        network.open_mailbox(id, local.clone());
        network.open_mailbox(id, device.clone());
        network
            .inner
            .pending
            .insert((device.clone(), local.clone()), id);
        let _ = node.incoming.send(local.clone());

        Ok(MemoryLink {
            id,
            local,
            remote: device.clone(),
        })
    }

    async fn disconnect(&self, link: &MemoryLink) -> MeshResult<()> {
        self.record(RadioCommand::Disconnect { link: link.id });
        self.inner.network.close_link(link);
        Ok(())
    }

    async fn write(&self, link: &MemoryLink, chunk: &[u8]) -> MeshResult<()> {
        self.record(RadioCommand::Write {
            link: link.id,
            len: chunk.len(),
        });
        self.check_permission()?;
        let delay = self.faults().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let limit = fragment_size_for_mtu(self.inner.max_mtu.load(Ordering::SeqCst));
        if chunk.len() > limit {
            return Err(BleError::WriteFailed(format!(
                "{} byte write exceeds {} byte payload",
                chunk.len(),
                limit
            ))
            .into());
        }

        let mailbox = self
            .inner
            .network
            .inner
            .mailboxes
            .get(&(link.id, link.remote.clone()))
            .ok_or_else(|| BleError::LinkClosed {
                link: link.id.to_string(),
            })?;
        mailbox
            .sender
            .unbounded_send(chunk.to_vec())
            .map_err(|_| BleError::LinkClosed {
                link: link.id.to_string(),
            })?;
        Ok(())
    }

    async fn subscribe(&self, link: &MemoryLink) -> MeshResult<BoxStream<'static, Vec<u8>>> {
        self.record(RadioCommand::Subscribe { link: link.id });
        let receiver = self
            .inner
            .network
            .inner
            .mailboxes
            .get_mut(&(link.id, link.local.clone()))
            .and_then(|mut mailbox| mailbox.receiver.take())
            .ok_or_else(|| {
                BleError::SubscriptionFailed(format!("link {} has no inbound stream", link.id))
            })?;
        Ok(receiver.boxed())
    }

    async fn request_mtu(&self, link: &MemoryLink, mtu: usize) -> MeshResult<usize> {
        self.record(RadioCommand::RequestMtu { link: link.id, mtu });
        Ok(mtu.min(self.inner.max_mtu.load(Ordering::SeqCst)))
    }

    async fn reset_link_parameters(&self) -> MeshResult<()> {
        self.record(RadioCommand::ResetLinkParameters);
        Ok(())
    }

    async fn start_server(&self) -> MeshResult<()> {
        self.record(RadioCommand::StartServer);
        self.check_permission()
    }

    async fn stop_server(&self) -> MeshResult<()> {
        self.record(RadioCommand::StopServer);
        Ok(())
    }
}
