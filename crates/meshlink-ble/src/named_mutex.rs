//! Async mutex keyed by name
//!
//! A name is locked while its entry exists in the map. Waiters register a
//! one-shot sender under the entry; releasing wakes exactly the waiters
//! registered at that moment, and they race to re-acquire.

use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::trace;

type Waiters = Vec<oneshot::Sender<()>>;

/// Mutex over an open-ended set of names
#[derive(Clone, Default)]
pub struct NamedMutex {
    held: Arc<DashMap<String, Waiters>>,
}

impl NamedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock `name`, waiting for the current holder to release it
    pub async fn lock(&self, name: impl Into<String>) -> NamedGuard {
        let name = name.into();
        loop {
            let released = match self.held.entry(name.clone()) {
                Entry::Vacant(vacant) => {
                    vacant.insert(Vec::new());
                    trace!("Locked {}", name);
                    return self.guard(name);
                }
                Entry::Occupied(mut occupied) => {
                    let (tx, rx) = oneshot::channel();
                    occupied.get_mut().push(tx);
                    rx
                }
            };
            // Either a release or a dropped sender means the holder is gone
            let _ = released.await;
        }
    }

    /// Lock `name` only if it is free
    pub fn try_lock(&self, name: impl Into<String>) -> Option<NamedGuard> {
        let name = name.into();
        match self.held.entry(name.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(Vec::new());
                Some(self.guard(name))
            }
            Entry::Occupied(_) => None,
        }
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.held.contains_key(name)
    }

    /// Number of names currently held
    pub fn held(&self) -> usize {
        self.held.len()
    }

    fn guard(&self, name: String) -> NamedGuard {
        NamedGuard {
            held: self.held.clone(),
            name,
        }
    }
}

impl fmt::Debug for NamedMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedMutex")
            .field("held", &self.held.len())
            .finish()
    }
}

/// Holds a name until dropped
pub struct NamedGuard {
    held: Arc<DashMap<String, Waiters>>,
    name: String,
}

impl NamedGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NamedGuard {
    fn drop(&mut self) {
        if let Some((_, waiters)) = self.held.remove(&self.name) {
            trace!("Unlocked {}, waking {} waiters", self.name, waiters.len());
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
    }
}

impl fmt::Debug for NamedGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NamedGuard").field(&self.name).finish()
    }
}
