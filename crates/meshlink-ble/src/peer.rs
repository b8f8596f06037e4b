//! Established peer links

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use meshlink_core::protocol::ChunkReader;
use meshlink_core::Luid;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;

use crate::events::{LinkEvent, ReplayHub, ReplaySubscription};
use crate::session::Inbound;

// ----------------------------------------------------------------------------
// Peer Link
// ----------------------------------------------------------------------------

struct PeerLinkInner<L> {
    luid: Luid,
    link: L,
    established_at: Instant,
    fragment_size: usize,
    events: ReplayHub<LinkEvent>,
    inbound: Option<Inbound>,
}

/// A luid mapped to an established radio link.
///
/// Owned by the connection state machine; clones share the same link and
/// event history.
pub struct PeerLink<L> {
    inner: Arc<PeerLinkInner<L>>,
}

impl<L> PeerLink<L> {
    /// A link without an inbound subscription; it can send but not receive
    pub fn new(luid: Luid, link: L, fragment_size: usize, event_capacity: usize) -> Self {
        Self::build(luid, link, fragment_size, event_capacity, None)
    }

    /// A link whose inbound chunks are pumped by `inbound`
    pub fn with_inbound(
        luid: Luid,
        link: L,
        fragment_size: usize,
        event_capacity: usize,
        inbound: Inbound,
    ) -> Self {
        Self::build(luid, link, fragment_size, event_capacity, Some(inbound))
    }

    fn build(
        luid: Luid,
        link: L,
        fragment_size: usize,
        event_capacity: usize,
        inbound: Option<Inbound>,
    ) -> Self {
        Self {
            inner: Arc::new(PeerLinkInner {
                luid,
                link,
                established_at: Instant::now(),
                fragment_size,
                events: ReplayHub::new(event_capacity),
                inbound,
            }),
        }
    }

    pub fn luid(&self) -> Luid {
        self.inner.luid
    }

    /// The radio's handle for this link
    pub fn link(&self) -> &L {
        &self.inner.link
    }

    pub fn established_at(&self) -> Instant {
        self.inner.established_at
    }

    pub fn age(&self) -> Duration {
        self.inner.established_at.elapsed()
    }

    /// Negotiated payload bytes per write
    pub fn fragment_size(&self) -> usize {
        self.inner.fragment_size
    }

    /// Every event on this link since it was established, then live events
    pub fn events(&self) -> ReplaySubscription<LinkEvent> {
        self.inner.events.subscribe()
    }

    /// Exclusive use of the inbound reader; None if the link never subscribed
    pub(crate) async fn inbound_reader(&self) -> Option<OwnedMutexGuard<ChunkReader>> {
        match &self.inner.inbound {
            Some(inbound) => Some(inbound.reader().await),
            None => None,
        }
    }

    pub(crate) fn close_inbound(&self) {
        if let Some(inbound) = &self.inner.inbound {
            inbound.close();
        }
    }

    pub(crate) fn publish(&self, event: LinkEvent) {
        self.inner.events.publish(event);
    }

    pub(crate) fn reset_events(&self) {
        self.inner.events.reset();
    }

    /// Whether two handles refer to the same established link
    pub fn same_link(&self, other: &PeerLink<L>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<L> Clone for PeerLink<L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<L: fmt::Debug> fmt::Debug for PeerLink<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("luid", &self.inner.luid)
            .field("link", &self.inner.link)
            .field("fragment_size", &self.inner.fragment_size)
            .field("inbound", &self.inner.inbound)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clones_share_history() {
        let luid = Luid::random();
        let link = PeerLink::new(luid, "handle", 20, 8);
        let copy = link.clone();
        link.publish(LinkEvent::Connected {
            luid,
            fragment_size: 20,
        });

        assert!(link.same_link(&copy));
        let mut events = copy.events();
        assert!(matches!(events.recv().await, Some(LinkEvent::Connected { .. })));
        assert_eq!(copy.link(), &"handle");
        assert_eq!(copy.fragment_size(), 20);
    }

    #[tokio::test]
    async fn test_inbound_reader_is_lent_one_at_a_time() {
        let (sender, receiver) = futures::channel::mpsc::unbounded::<Vec<u8>>();
        let inbound = Inbound::spawn(
            Box::pin(receiver),
            Luid::random(),
            64,
            &tokio::runtime::Handle::current(),
        );
        let link = PeerLink::with_inbound(Luid::random(), "handle", 20, 8, inbound);
        sender.unbounded_send(vec![1, 2, 3]).unwrap();

        let first = link.inbound_reader().await.unwrap();
        let copy = link.clone();
        let waiting = tokio::spawn(async move { copy.inbound_reader().await.is_some() });
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());
        drop(first);
        assert!(waiting.await.unwrap());

        assert!(PeerLink::new(Luid::random(), "bare", 20, 8)
            .inbound_reader()
            .await
            .is_none());
    }

    #[test]
    fn test_distinct_links_differ() {
        let luid = Luid::random();
        let a = PeerLink::new(luid, 1u8, 20, 8);
        let b = PeerLink::new(luid, 1u8, 20, 8);
        assert!(!a.same_link(&b));
    }
}
