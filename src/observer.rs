//! Observer Registry
//!
//! Observers receive a snapshot of the map as `Add` commands when they are
//! registered, followed by every live mutation until they unsubscribe.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::command::Command;
use crate::error::Result;

/// Receiver of replicated commands
pub trait Observer<K, V>: Send + Sync {
    /// Handle one command. Errors are logged and do not affect other
    /// observers; errors for which [`crate::Error::detaches_observer`] holds
    /// also deregister this observer.
    fn observe(&self, command: &Command<K, V>) -> Result<()>;

    /// Whether the observer can still accept commands. Registering an
    /// observer that is not open fails with `InvalidArgument`.
    fn is_open(&self) -> bool {
        true
    }

    /// Number of commands the observer can take without blocking or
    /// failing, if bounded. Registration fails with `ObserverLagging` when
    /// the snapshot would not fit.
    fn free_capacity(&self) -> Option<usize> {
        None
    }
}

impl<K, V, F> Observer<K, V> for F
where
    F: Fn(&Command<K, V>) -> Result<()> + Send + Sync,
{
    fn observe(&self, command: &Command<K, V>) -> Result<()> {
        self(command)
    }
}

/// Identifier assigned to each registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(pub(crate) u64);

impl std::fmt::Display for ObserverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "observer-{}", self.0)
    }
}

/// Name of a remote peer.
///
/// Commands applied on behalf of a peer are not delivered back to observers
/// registered for that same peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for PeerId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Removes a registration from its owning map
pub(crate) trait Detach: Send + Sync {
    fn detach(&self, id: ObserverId);
}

/// Handle returned by `replicate`.
///
/// Dropping the handle does not unsubscribe; call [`Subscription::unsubscribe`].
pub struct Subscription {
    id: ObserverId,
    active: Arc<AtomicBool>,
    owner: Weak<dyn Detach>,
}

impl Subscription {
    pub(crate) fn new(id: ObserverId, active: Arc<AtomicBool>, owner: Weak<dyn Detach>) -> Self {
        Self { id, active, owner }
    }

    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// False once unsubscribed, or once the map deregistered the observer
    /// after a closed/lagging/panicking delivery.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop delivery to this observer. Calling it again is a no-op.
    ///
    /// No delivery starts after this returns, and the map releases the
    /// observer once any delivery already running on another thread ends.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(owner) = self.owner.upgrade() {
            owner.detach(self.id);
        }
        tracing::debug!("Unsubscribed {}", self.id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// A registered observer
pub(crate) struct Registration<K, V> {
    id: ObserverId,
    peer: Option<PeerId>,
    active: Arc<AtomicBool>,
    observer: Box<dyn Observer<K, V>>,
}

impl<K, V> Registration<K, V> {
    pub(crate) fn new(
        id: ObserverId,
        peer: Option<PeerId>,
        active: Arc<AtomicBool>,
        observer: Box<dyn Observer<K, V>>,
    ) -> Self {
        Self { id, peer, active, observer }
    }

    pub(crate) fn id(&self) -> ObserverId {
        self.id
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Whether a live command from `origin` should reach this observer
    pub(crate) fn wants(&self, origin: Option<&PeerId>) -> bool {
        self.is_active() && (origin.is_none() || self.peer.as_ref() != origin)
    }

    /// Deliver one command. Panics are caught. Returns false if the
    /// observer was deregistered by this delivery.
    pub(crate) fn deliver(&self, command: &Command<K, V>) -> bool {
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.observer.observe(command))) {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!("{} panicked, deregistering", self.id);
                self.deactivate();
                return false;
            }
        };

        match outcome {
            Ok(()) => true,
            Err(e) if e.detaches_observer() => {
                tracing::warn!("{} deregistered: {}", self.id, e);
                self.deactivate();
                false
            }
            Err(e) => {
                tracing::warn!("{} failed to handle {} command: {}", self.id, command.kind(), e);
                true
            }
        }
    }

    /// Deliver the registration snapshot. Returns false if the observer
    /// unsubscribed or was deregistered part way through.
    pub(crate) fn replay(&self, snapshot: &[Command<K, V>]) -> bool {
        for command in snapshot {
            if !self.is_active() {
                return false;
            }
            if !self.deliver(command) {
                tracing::warn!("{} detached during snapshot replay", self.id);
                return false;
            }
        }
        self.is_active()
    }
}

/// Set of live registrations.
///
/// The registry lock is only held to add, remove or list registrations,
/// never while an observer runs.
pub(crate) struct Registry<K, V> {
    entries: Vec<Arc<Registration<K, V>>>,
}

impl<K, V> Registry<K, V> {
    pub(crate) fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.iter().filter(|r| r.is_active()).count()
    }

    /// Add a registration unless it was unsubscribed in the meantime
    pub(crate) fn insert(&mut self, registration: Arc<Registration<K, V>>) {
        if registration.is_active() {
            tracing::debug!("Registered {}", registration.id);
            self.entries.push(registration);
        }
    }

    pub(crate) fn remove(&mut self, id: ObserverId) {
        self.entries.retain(|r| r.id != id);
    }

    /// Active registrations for one delivery round
    pub(crate) fn targets(&mut self) -> Vec<Arc<Registration<K, V>>> {
        self.entries.retain(|r| r.is_active());
        self.entries.clone()
    }
}
