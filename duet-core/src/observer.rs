//! Change subscriptions for the collaborative stores.
//!
//! Every store mutation is tagged with a [`ChangeOrigin`] so subscribers can
//! tell their own writes apart from remote ones and never re-apply an echo.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::{Deserialize, Serialize};

/// Where a store mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOrigin {
    /// Produced by this client (widget edit or local API call).
    Local,
    /// Received from a peer or from the relay during sync.
    Remote,
}

impl std::fmt::Display for ChangeOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeOrigin::Local => write!(f, "local"),
            ChangeOrigin::Remote => write!(f, "remote"),
        }
    }
}

/// Handle returned by [`ObserverRegistry::subscribe`].
pub type SubscriptionId = u64;

type Callback<E> = Box<dyn Fn(&E)>;

/// Single-threaded registry of change callbacks.
///
/// A panicking callback is isolated: the remaining callbacks still run and
/// the owning store stays usable.
pub struct ObserverRegistry<E> {
    callbacks: BTreeMap<SubscriptionId, Callback<E>>,
    next_id: SubscriptionId,
}

impl<E> ObserverRegistry<E> {
    pub fn new() -> Self {
        Self {
            callbacks: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn subscribe(&mut self, callback: impl Fn(&E) + 'static) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;
        self.callbacks.insert(id, Box::new(callback));
        id
    }

    /// Returns `true` if the subscription existed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.callbacks.remove(&id).is_some()
    }

    /// Invoke every callback in subscription order.
    pub fn emit(&self, event: &E) {
        for (id, callback) in &self.callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                log::warn!("Observer {id} panicked; continuing with remaining observers");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl<E> Default for ObserverRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for ObserverRegistry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("subscribers", &self.callbacks.len())
            .finish()
    }
}
