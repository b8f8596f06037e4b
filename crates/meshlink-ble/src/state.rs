//! Connection state machine
//!
//! Owns the lifecycle of every peer, addressed by luid. Three concurrent
//! structures carry all shared state: the transaction lock set, the active
//! set and the connection cache. Lock conflicts are reported as `false`,
//! never as errors.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use meshlink_core::errors::{TransactionError, TransportError};
use meshlink_core::{
    HandshakeStage, Luid, MeshConfig, MeshResult, Priority, Stage, TransactionResult,
};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::discovery::Advertisement;
use crate::events::{EventHub, LinkEvent};
use crate::named_mutex::{NamedGuard, NamedMutex};
use crate::peer::PeerLink;
use crate::queue::{operation, OperationQueue};
use crate::radio::{fragment_size_for_mtu, Radio, Schedulers};
use crate::session::{Inbound, PeerSession, TransactionHandler};

fn connect_lock_name(luid: Luid) -> String {
    format!("connect:{}", luid)
}

fn link_lock_name(luid: Luid) -> String {
    format!("link:{}", luid)
}

// ----------------------------------------------------------------------------
// Transaction Outcome
// ----------------------------------------------------------------------------

/// Result of [`ConnectionStateMachine::run_transaction`]
#[derive(Debug)]
pub enum TransactionOutcome<T> {
    /// Another transaction already holds the peer; retry later
    Busy,
    Completed {
        item: Option<T>,
        stage: Option<HandshakeStage>,
    },
}

impl<T> TransactionOutcome<T> {
    pub fn is_busy(&self) -> bool {
        matches!(self, TransactionOutcome::Busy)
    }

    pub fn into_item(self) -> Option<T> {
        match self {
            TransactionOutcome::Busy => None,
            TransactionOutcome::Completed { item, .. } => item,
        }
    }
}

// ----------------------------------------------------------------------------
// Pending Link
// ----------------------------------------------------------------------------

/// A connected link not yet in the cache. Dropped before `cached()` runs,
/// it queues a disconnect so no radio link outlives its connect attempt.
struct PendingLink<R: Radio> {
    radio: Arc<R>,
    queue: OperationQueue,
    scheduler: Handle,
    luid: Luid,
    link: R::Link,
    armed: bool,
}

impl<R: Radio> PendingLink<R> {
    fn new(machine: &ConnectionStateMachine<R>, luid: Luid, link: R::Link) -> Self {
        Self {
            radio: machine.radio.clone(),
            queue: machine.queue.clone(),
            scheduler: machine.schedulers.io.clone(),
            luid,
            link,
            armed: true,
        }
    }

    fn cached(mut self) {
        self.armed = false;
    }
}

impl<R: Radio> Drop for PendingLink<R> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        debug!("Abandoning uncached link to {}", self.luid);
        let radio = self.radio.clone();
        let link = self.link.clone();
        let handle = self.queue.submit(
            operation("disconnect", move |_ctx| async move {
                radio.disconnect(&link).await
            })
            .with_priority(Priority::High),
        );
        let luid = self.luid;
        self.scheduler.spawn(async move {
            if let Err(e) = handle.result().await {
                warn!("Disconnecting abandoned link to {} failed: {}", luid, e);
            }
        });
    }
}

// ----------------------------------------------------------------------------
// Connection State Machine
// ----------------------------------------------------------------------------

pub struct ConnectionStateMachine<R: Radio> {
    radio: Arc<R>,
    queue: OperationQueue,
    schedulers: Schedulers,
    config: MeshConfig,
    locked: DashSet<Luid>,
    active: DashSet<Luid>,
    connections: DashMap<Luid, PeerLink<R::Link>>,
    leases: DashMap<Luid, NamedGuard>,
    mutex: NamedMutex,
    transactions: AtomicUsize,
    server_running: AtomicBool,
    events: EventHub<LinkEvent>,
}

impl<R: Radio> ConnectionStateMachine<R> {
    pub fn new(
        radio: Arc<R>,
        queue: OperationQueue,
        schedulers: Schedulers,
        config: MeshConfig,
    ) -> Self {
        let events = EventHub::new(config.event_capacity);
        Self {
            radio,
            queue,
            schedulers,
            config,
            locked: DashSet::new(),
            active: DashSet::new(),
            connections: DashMap::new(),
            leases: DashMap::new(),
            mutex: NamedMutex::new(),
            transactions: AtomicUsize::new(0),
            server_running: AtomicBool::new(false),
            events,
        }
    }

    pub fn radio(&self) -> &Arc<R> {
        &self.radio
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Whether an advertisement is worth connecting to: its luid decodes and
    /// is not already active
    pub fn should_connect<D>(&self, advertisement: &Advertisement<D>) -> bool {
        match advertisement.luid() {
            Some(luid) if self.active.contains(&luid) => {
                trace!("Suppressing duplicate connect to active peer {}", luid);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    // ------------------------------------------------------------------------
    // Transaction Locks
    // ------------------------------------------------------------------------

    /// Mark `luid` locked; false if another transaction already holds it
    pub fn transaction_lock_acquire(&self, luid: Luid) -> bool {
        let acquired = self.locked.insert(luid);
        if !acquired {
            debug!("Transaction lock for {} is held, backing off", luid);
        }
        acquired
    }

    /// Clear the lock on `luid`. Always succeeds.
    pub fn transaction_unlock(&self, luid: Luid) -> bool {
        self.locked.remove(&luid);
        true
    }

    pub fn is_locked(&self, luid: Luid) -> bool {
        self.locked.contains(&luid)
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    /// Connect to `luid`, or return the cached link if already connected.
    ///
    /// Concurrent callers for the same luid queue up on a per-luid lock, so
    /// only one connect ever reaches the radio.
    pub async fn establish_connection_cached(
        &self,
        device: &R::Device,
        luid: Luid,
        reverse: bool,
    ) -> MeshResult<PeerLink<R::Link>> {
        if let Some(peer) = self.peer_link(luid) {
            trace!("Reusing cached link to {}", luid);
            return Ok(peer);
        }

        let _connecting = self.mutex.lock(connect_lock_name(luid)).await;
        if let Some(peer) = self.peer_link(luid) {
            return Ok(peer);
        }

        let radio = self.radio.clone();
        let target = device.clone();
        let connected = self
            .queue
            .submit(
                operation("connect", move |_ctx| async move {
                    radio.connect(&target, reverse).await
                })
                .with_priority(Priority::High),
            )
            .result()
            .await;
        let link = match connected {
            Ok(link) => link,
            Err(e) => {
                warn!("Connecting to {} failed: {}", luid, e);
                self.update_gone(luid, &e);
                return Err(e);
            }
        };

        // Disconnects the link if this future is dropped or fails before caching
        let pending = PendingLink::new(self, luid, link.clone());
        let inbound = match self.subscribe_inbound(&link, luid).await {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("Subscribing to {} failed: {}", luid, e);
                self.update_gone(luid, &e);
                return Err(e);
            }
        };
        let fragment_size = self.negotiate_fragment_size(&link, luid).await;
        let lease = self.mutex.lock(link_lock_name(luid)).await;
        let peer = PeerLink::with_inbound(
            luid,
            link,
            fragment_size,
            self.config.event_capacity,
            inbound,
        );
        self.leases.insert(luid, lease);
        self.connections.insert(luid, peer.clone());
        pending.cached();
        self.update_active(luid);

        let event = LinkEvent::Connected {
            luid,
            fragment_size,
        };
        peer.publish(event.clone());
        self.events.publish(event);
        info!(
            "Connected to {} ({} byte fragments{})",
            luid,
            fragment_size,
            if reverse { ", reverse" } else { "" }
        );
        Ok(peer)
    }

    async fn subscribe_inbound(&self, link: &R::Link, luid: Luid) -> MeshResult<Inbound> {
        let radio = self.radio.clone();
        let link = link.clone();
        let stream = self
            .queue
            .submit(operation("subscribe", move |_ctx| async move {
                radio.subscribe(&link).await
            }))
            .result()
            .await?;
        Ok(Inbound::spawn(
            stream,
            luid,
            self.config.reassembly_capacity,
            &self.schedulers.server,
        ))
    }

    async fn negotiate_fragment_size(&self, link: &R::Link, luid: Luid) -> usize {
        let radio = self.radio.clone();
        let link = link.clone();
        let requested = self.config.requested_mtu;
        let granted = self
            .queue
            .submit(operation("request_mtu", move |_ctx| async move {
                radio.request_mtu(&link, requested).await
            }))
            .result()
            .await;

        match granted {
            Ok(mtu) => fragment_size_for_mtu(mtu),
            Err(e) => {
                warn!(
                    "MTU negotiation with {} failed, using {} byte fragments: {}",
                    luid, self.config.fragment_size, e
                );
                self.config.fragment_size
            }
        }
    }

    /// Add `luid` to the active set; false if it was already there
    pub fn update_active(&self, luid: Luid) -> bool {
        self.active.insert(luid)
    }

    /// Remove `luid` from the active set; false if it was not there
    pub fn update_gone(&self, luid: Luid, reason: impl fmt::Display) -> bool {
        let removed = self.active.remove(&luid).is_some();
        if removed {
            let reason = reason.to_string();
            debug!("Peer {} gone: {}", luid, reason);
            self.events.publish(LinkEvent::Gone { luid, reason });
        }
        removed
    }

    pub fn is_active(&self, luid: Luid) -> bool {
        self.active.contains(&luid)
    }

    /// Tear down everything held for `luid`.
    ///
    /// Order: drop from the cache, disconnect the link, mark gone, release
    /// the link lease, reset link parameters if nothing is left connected,
    /// and only then release the transaction lock. The luid stays active
    /// until the disconnect resolves.
    pub async fn update_disconnected(&self, luid: Luid, reason: impl Into<String>) {
        let reason: String = reason.into();
        let peer = self.connections.remove(&luid).map(|(_, peer)| peer);

        if let Some(peer) = &peer {
            peer.close_inbound();
            let radio = self.radio.clone();
            let link = peer.link().clone();
            let disconnected = self
                .queue
                .submit(
                    operation("disconnect", move |_ctx| async move {
                        radio.disconnect(&link).await
                    })
                    .with_priority(Priority::High),
                )
                .result()
                .await;
            if let Err(e) = disconnected {
                warn!("Disconnecting from {} failed: {}", luid, e);
            }
            peer.publish(LinkEvent::Disconnected {
                luid,
                reason: reason.clone(),
            });
            peer.reset_events();
        }
        self.update_gone(luid, &reason);

        self.leases.remove(&luid);

        if self.connections.is_empty() {
            let radio = self.radio.clone();
            let reset = self
                .queue
                .submit(operation("reset_link_parameters", move |_ctx| async move {
                    radio.reset_link_parameters().await
                }))
                .result()
                .await;
            if let Err(e) = reset {
                warn!("Resetting link parameters failed: {}", e);
            }
        }

        if peer.is_some() {
            info!("Disconnected from {}: {}", luid, reason);
            self.events.publish(LinkEvent::Disconnected { luid, reason });
        }
        self.transaction_unlock(luid);
    }

    /// Tear down every cached link
    pub async fn disconnect_all(&self, reason: &str) {
        for luid in self.connected() {
            self.update_disconnected(luid, reason).await;
        }
    }

    /// Luids with a cached link
    pub fn connected(&self) -> Vec<Luid> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    pub fn peer_link(&self, luid: Luid) -> Option<PeerLink<R::Link>> {
        self.connections.get(&luid).map(|peer| peer.clone())
    }

    /// Framed I/O over the cached link to `luid`
    pub async fn open_session(&self, luid: Luid) -> MeshResult<PeerSession<R>> {
        let peer = self
            .peer_link(luid)
            .ok_or(TransportError::NotConnected { luid })?;
        PeerSession::open(self.radio.clone(), self.queue.clone(), peer, &self.config).await
    }

    /// Whether the connection-scoped lease for `luid` is held
    pub fn holds_lease(&self, luid: Luid) -> bool {
        self.mutex.is_locked(&link_lock_name(luid))
    }

    // ------------------------------------------------------------------------
    // Transaction Counter
    // ------------------------------------------------------------------------

    pub fn start_transaction(&self) -> usize {
        self.transactions.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrement the running count, never below zero
    pub fn stop_transaction(&self) -> usize {
        let previous = self
            .transactions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or_else(|n| n);
        previous.saturating_sub(1)
    }

    pub fn transactions(&self) -> usize {
        self.transactions.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        self.transactions() > 0
    }

    // ------------------------------------------------------------------------
    // Server Role
    // ------------------------------------------------------------------------

    /// Bring the server role up; Ok(false) if it was already running
    pub async fn start_server(&self) -> MeshResult<bool> {
        if self
            .server_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Server role already running");
            return Ok(false);
        }

        let radio = self.radio.clone();
        let started = self
            .queue
            .submit(operation("start_server", move |_ctx| async move {
                radio.start_server().await
            }))
            .result()
            .await;
        if let Err(e) = started {
            self.server_running.store(false, Ordering::Release);
            warn!("Starting server role failed: {}", e);
            return Err(e);
        }

        info!("Server role started");
        self.events.publish(LinkEvent::ServerStarted);
        Ok(true)
    }

    /// Take the server role down; Ok(false) if it was not running
    pub async fn stop_server(&self) -> MeshResult<bool> {
        if self
            .server_running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }

        let radio = self.radio.clone();
        let stopped = self
            .queue
            .submit(operation("stop_server", move |_ctx| async move {
                radio.stop_server().await
            }))
            .result()
            .await;
        if let Err(e) = stopped {
            self.server_running.store(true, Ordering::Release);
            warn!("Stopping server role failed: {}", e);
            return Err(e);
        }

        info!("Server role stopped");
        self.events.publish(LinkEvent::ServerStopped);
        Ok(true)
    }

    pub fn is_server_running(&self) -> bool {
        self.server_running.load(Ordering::Acquire)
    }

    pub fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    // ------------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------------

    /// Run a full handshake with `luid`.
    ///
    /// Returns `Busy` when another transaction holds the peer. On failure the
    /// link is torn down. The lock and the running count are always released.
    pub async fn run_transaction<H>(
        &self,
        device: &R::Device,
        luid: Luid,
        reverse: bool,
        handler: &mut H,
    ) -> MeshResult<TransactionOutcome<H::Item>>
    where
        H: TransactionHandler<R>,
    {
        if !self.transaction_lock_acquire(luid) {
            return Ok(TransactionOutcome::Busy);
        }
        let running = self.start_transaction();
        debug!("Transaction with {} started ({} running)", luid, running);
        self.events.publish(LinkEvent::TransactionStarted { luid });

        let limit = self.config.transaction_timeout;
        let result = match tokio::time::timeout(limit, self.drive(device, luid, reverse, handler))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(TransactionError::Timeout {
                luid,
                duration_ms: limit.as_millis() as u64,
            }
            .into()),
        };

        if let Err(e) = &result {
            warn!("Transaction with {} failed: {}", luid, e);
            self.update_disconnected(luid, e.to_string()).await;
        }
        self.transaction_unlock(luid);
        self.stop_transaction();

        let event = LinkEvent::TransactionFinished {
            luid,
            success: result.is_ok(),
        };
        if let Some(peer) = self.peer_link(luid) {
            peer.publish(event.clone());
        }
        self.events.publish(event);

        result.map(|(item, stage)| TransactionOutcome::Completed { item, stage })
    }

    async fn drive<H>(
        &self,
        device: &R::Device,
        luid: Luid,
        reverse: bool,
        handler: &mut H,
    ) -> MeshResult<(Option<H::Item>, Option<HandshakeStage>)>
    where
        H: TransactionHandler<R>,
    {
        let peer = self
            .establish_connection_cached(device, luid, reverse)
            .await?;
        peer.publish(LinkEvent::TransactionStarted { luid });
        let mut session = self.open_session(luid).await?;

        let mut accumulated = TransactionResult::of_stage(HandshakeStage::INITIAL);
        while let Some(&stage) = accumulated.stage() {
            if stage.is_terminal() {
                break;
            }
            trace!("Transaction with {} entering {}", luid, stage);
            let step = handler.step(&mut session, stage).await;
            accumulated = accumulated.advance(step);
            if accumulated.is_err() {
                break;
            }
            if accumulated.stage().is_none() {
                accumulated = accumulated.with_stage(stage);
            }
        }

        drop(session);
        accumulated.into_result()
    }
}

impl<R: Radio> fmt::Debug for ConnectionStateMachine<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("connections", &self.connections.len())
            .field("active", &self.active.len())
            .field("locked", &self.locked.len())
            .field("transactions", &self.transactions())
            .field("server_running", &self.is_server_running())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
