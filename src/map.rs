//! Replicated Map
//!
//! The authoritative local state table plus the mutation API, the command
//! applier and the replication registry. Every mutation, whether made
//! locally or applied from a peer, runs through the same code path and
//! produces exactly one observer event per affected key.
//!
//! Mutations and registrations take the table lock only long enough to
//! update the table and append to a per-map dispatch queue. Observers are
//! called after the lock is released, by whichever caller found the queue
//! idle; that caller drains the queue in order before returning. Because a
//! registration's snapshot is queued in the same critical section that
//! reads it, a new observer sees every key either in its snapshot or as a
//! live event, never both and never neither. No lock is held while an
//! observer runs, so observers may freely call into this or any other map.

use std::borrow::Borrow;
use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;

use crate::command::Command;
use crate::config::MapConfig;
use crate::error::{Error, Result};
use crate::observer::{Detach, Observer, ObserverId, PeerId, Registration, Registry, Subscription};

/// Work queued for observers
enum Dispatch<K, V> {
    /// Replay a snapshot to a new registration, then make it live
    Attach {
        registration: Arc<Registration<K, V>>,
        snapshot: Vec<Command<K, V>>,
    },
    /// Deliver a live command
    Broadcast {
        command: Command<K, V>,
        origin: Option<PeerId>,
    },
}

/// State guarded by the table lock
struct Inner<K, V> {
    /// Keys in the order they were last set
    table: IndexMap<K, V>,
    pending: VecDeque<Dispatch<K, V>>,
    /// Set while some caller is draining `pending`
    dispatching: bool,
}

impl<K, V> Inner<K, V> {
    /// Queue work; returns true if the caller must run the dispatcher
    fn enqueue(&mut self, item: Dispatch<K, V>) -> bool {
        self.pending.push_back(item);
        !std::mem::replace(&mut self.dispatching, true)
    }
}

pub(crate) struct Shared<K, V> {
    inner: Mutex<Inner<K, V>>,
    registry: Mutex<Registry<K, V>>,
    config: MapConfig,
    next_observer_id: AtomicU64,
}

impl<K, V> Shared<K, V> {
    /// Drain the dispatch queue. Runs without the table lock held.
    fn dispatch(&self) {
        loop {
            let item = {
                let mut inner = self.inner.lock();
                match inner.pending.pop_front() {
                    Some(item) => item,
                    None => {
                        inner.dispatching = false;
                        return;
                    }
                }
            };

            match item {
                Dispatch::Attach { registration, snapshot } => {
                    if registration.replay(&snapshot) {
                        self.registry.lock().insert(registration);
                    }
                }
                Dispatch::Broadcast { command, origin } => {
                    let targets = self.registry.lock().targets();
                    for registration in &targets {
                        if registration.wants(origin.as_ref()) && !registration.deliver(&command) {
                            self.registry.lock().remove(registration.id());
                        }
                    }
                }
            }
        }
    }
}

impl<K, V> Detach for Shared<K, V>
where
    K: Send + Sync,
    V: Send + Sync,
{
    fn detach(&self, id: ObserverId) {
        self.registry.lock().remove(id);
    }
}

/// In-memory key/value map whose mutations are replicated to observers.
///
/// Cloning the map clones a handle; all clones share the same state.
pub struct ReplicatedMap<K, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K, V> Clone for ReplicatedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, V> ReplicatedMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty map with the default configuration
    pub fn new() -> Self {
        Self::build(std::iter::empty(), MapConfig::default())
    }

    /// Create an empty map. Fails if the configuration does not validate.
    pub fn with_config(config: MapConfig) -> Result<Self> {
        Self::from_entries_with_config(std::iter::empty(), config)
    }

    /// Create a map seeded from `entries` without firing any events.
    /// Later duplicates overwrite earlier ones.
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
    {
        Self::build(entries, MapConfig::default())
    }

    pub fn from_entries_with_config<I>(entries: I, config: MapConfig) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        config.validate()?;
        Ok(Self::build(entries, config))
    }

    fn build<I>(entries: I, config: MapConfig) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let mut table = IndexMap::new();
        for (key, value) in entries {
            table.shift_remove(&key);
            table.insert(key, value);
        }

        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    table,
                    pending: VecDeque::new(),
                    dispatching: false,
                }),
                registry: Mutex::new(Registry::new()),
                config,
                next_observer_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &MapConfig {
        &self.shared.config
    }

    // ========== Reads ==========

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shared.inner.lock().table.get(key).cloned()
    }

    pub fn has<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shared.inner.lock().table.contains_key(key)
    }

    /// Keys in table order
    pub fn keys(&self) -> Vec<K> {
        self.shared.inner.lock().table.keys().cloned().collect()
    }

    /// Values, positionally aligned with [`keys`](Self::keys)
    pub fn values(&self) -> Vec<V> {
        self.shared.inner.lock().table.values().cloned().collect()
    }

    pub fn entries(&self) -> Vec<(K, V)> {
        self.shared
            .inner
            .lock()
            .table
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shared.inner.lock().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every entry in table order while holding the table lock.
    /// `f` must not call back into this map.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V),
    {
        let inner = self.shared.inner.lock();
        for (key, value) in &inner.table {
            f(key, value);
        }
    }

    // ========== Mutations ==========

    /// Insert or overwrite `key`, returning the previous value.
    ///
    /// Fires a single `Add`; an overwrite is never reported as a removal.
    pub fn set(&self, key: K, value: V) -> Option<V> {
        self.set_from(None, key, value)
    }

    /// Remove `key`, returning its value. Absent keys are a silent no-op.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.remove_from(None, key)
    }

    /// Alias of [`remove`](Self::remove)
    pub fn delete<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.remove(key)
    }

    /// Remove every key, firing one `Remove` per key in table order.
    /// Returns the number of keys removed.
    pub fn clear(&self) -> usize {
        self.clear_from(None)
    }

    fn set_from(&self, origin: Option<&PeerId>, key: K, value: V) -> Option<V> {
        let (previous, run) = {
            let mut inner = self.shared.inner.lock();

            // Re-inserting moves the key to the end of the table
            let previous = inner.table.shift_remove(&key);
            inner.table.insert(key.clone(), value.clone());

            let run = inner.enqueue(Dispatch::Broadcast {
                command: Command::Add { key, value },
                origin: origin.cloned(),
            });
            (previous, run)
        };

        if run {
            self.shared.dispatch();
        }
        previous
    }

    fn remove_from<Q>(&self, origin: Option<&PeerId>, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let (previous, run) = {
            let mut inner = self.shared.inner.lock();

            let (key, previous) = inner.table.shift_remove_entry(key)?;
            let run = inner.enqueue(Dispatch::Broadcast {
                command: Command::Remove {
                    key,
                    previous: Some(previous.clone()),
                },
                origin: origin.cloned(),
            });
            (previous, run)
        };

        if run {
            self.shared.dispatch();
        }
        Some(previous)
    }

    fn clear_from(&self, origin: Option<&PeerId>) -> usize {
        let (count, run) = {
            let mut inner = self.shared.inner.lock();

            let removed: Vec<(K, V)> = inner.table.drain(..).collect();
            let count = removed.len();
            let mut run = false;
            for (key, value) in removed {
                run |= inner.enqueue(Dispatch::Broadcast {
                    command: Command::Remove {
                        key,
                        previous: Some(value),
                    },
                    origin: origin.cloned(),
                });
            }
            (count, run)
        };

        if run {
            self.shared.dispatch();
        }
        count
    }

    // ========== Command applier ==========

    /// Apply a command through the mutation API, as if it were a local call
    pub fn apply(&self, command: Command<K, V>) {
        self.apply_inner(None, command);
    }

    /// Apply a command received from `origin`. Observers registered for
    /// that same peer with [`replicate_to`](Self::replicate_to) do not see
    /// the resulting events.
    pub fn apply_from(&self, origin: &PeerId, command: Command<K, V>) {
        self.apply_inner(Some(origin), command);
    }

    /// The applier as a free-standing function value
    pub fn applier(&self) -> impl Fn(Command<K, V>) + Send + Sync + 'static {
        let map = self.clone();
        move |command| map.apply(command)
    }

    fn apply_inner(&self, origin: Option<&PeerId>, command: Command<K, V>) {
        tracing::trace!(
            "Applying {} command from {}",
            command.kind(),
            origin.map(PeerId::as_str).unwrap_or("local")
        );

        match command {
            Command::Add { key, value } => {
                self.set_from(origin, key, value);
            }
            Command::Remove { key, .. } => {
                self.remove_from(origin, &key);
            }
            Command::Clear => {
                self.clear_from(origin);
            }
        }
    }

    // ========== Replication ==========

    /// Register an observer. It first receives every current entry as an
    /// `Add`, in table order, then every live mutation until unsubscribed.
    ///
    /// Delivery happens before this returns unless a delivery round is
    /// already running for this map, in which case that round delivers the
    /// snapshot in turn.
    ///
    /// Fails with `InvalidArgument` if the observer is already closed, and
    /// with `ObserverLagging` if a bounded observer cannot hold the snapshot.
    pub fn replicate<O>(&self, observer: O) -> Result<Subscription>
    where
        O: Observer<K, V> + 'static,
    {
        let (subscription, ()) = self.register_with(None, |_| (Box::new(observer), ()))?;
        Ok(subscription)
    }

    /// Register an observer that forwards to `peer`. Commands applied via
    /// [`apply_from`](Self::apply_from) with the same peer are not echoed to it.
    pub fn replicate_to<O>(&self, peer: impl Into<PeerId>, observer: O) -> Result<Subscription>
    where
        O: Observer<K, V> + 'static,
    {
        let (subscription, ()) = self.register_with(Some(peer.into()), |_| (Box::new(observer), ()))?;
        Ok(subscription)
    }

    /// Number of currently registered observers
    pub fn observer_count(&self) -> usize {
        self.shared.registry.lock().len()
    }

    /// Register the observer built by `make`, which is given the snapshot
    /// length and may return an extra value to the caller.
    pub(crate) fn register_with<T, F>(&self, peer: Option<PeerId>, make: F) -> Result<(Subscription, T)>
    where
        F: FnOnce(usize) -> (Box<dyn Observer<K, V>>, T),
    {
        let id = ObserverId(self.shared.next_observer_id.fetch_add(1, Ordering::Relaxed));
        let active = Arc::new(AtomicBool::new(true));

        let (extra, run) = {
            let mut inner = self.shared.inner.lock();
            let (observer, extra) = make(inner.table.len());

            if !observer.is_open() {
                return Err(Error::InvalidArgument("observer is closed".into()));
            }
            if let Some(free) = observer.free_capacity() {
                if free < inner.table.len() {
                    return Err(Error::ObserverLagging { capacity: free });
                }
            }

            let snapshot = inner
                .table
                .iter()
                .map(|(key, value)| Command::Add {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect();
            let registration = Arc::new(Registration::new(id, peer, Arc::clone(&active), observer));
            let run = inner.enqueue(Dispatch::Attach { registration, snapshot });
            (extra, run)
        };

        if run {
            self.shared.dispatch();
        }

        let owner: Weak<dyn Detach> = Arc::downgrade(&self.shared) as Weak<dyn Detach>;
        Ok((Subscription::new(id, active, owner), extra))
    }
}

impl<K, V> ReplicatedMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + DeserializeOwned + 'static,
    V: Clone + Send + Sync + DeserializeOwned + 'static,
{
    /// Apply a command in positional `(type, key[, value])` form.
    ///
    /// Unknown tags are ignored. Missing or undecodable arguments fail with
    /// `InvalidArgument` and leave the map untouched.
    pub fn cmd(&self, tag: &str, args: Vec<serde_json::Value>) -> Result<()> {
        match Command::from_positional(tag, args)? {
            Some(command) => self.apply(command),
            None => tracing::debug!("Ignoring unknown command tag: {}", tag),
        }
        Ok(())
    }
}

impl<K, V> Default for ReplicatedMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> FromIterator<(K, V)> for ReplicatedMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from_entries(iter)
    }
}

impl<K, V> std::fmt::Debug for ReplicatedMap<K, V>
where
    K: std::fmt::Debug,
    V: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_map().entries(inner.table.iter()).finish()
    }
}
