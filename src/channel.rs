//! Channel Observers
//!
//! Decouples observers from the mutation path. Commands are pushed into a
//! bounded tokio queue with `try_send`, so a slow consumer can never stall a
//! mutation: once its queue is full it is deregistered instead.

use std::hash::Hash;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::command::Command;
use crate::error::{Error, Result};
use crate::map::ReplicatedMap;
use crate::observer::{Observer, PeerId, Subscription};

/// Observer forwarding commands into a bounded channel
pub struct ChannelObserver<K, V> {
    sender: mpsc::Sender<Command<K, V>>,
}

impl<K, V> ChannelObserver<K, V> {
    pub fn new(sender: mpsc::Sender<Command<K, V>>) -> Self {
        Self { sender }
    }

    /// Create an observer together with the receiving end of its queue.
    /// A capacity of zero is raised to one.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Command<K, V>>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self::new(sender), receiver)
    }
}

impl<K, V> Observer<K, V> for ChannelObserver<K, V>
where
    K: Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn observe(&self, command: &Command<K, V>) -> Result<()> {
        self.sender.try_send(command.clone()).map_err(|e| match e {
            TrySendError::Full(_) => Error::ObserverLagging {
                capacity: self.sender.max_capacity(),
            },
            TrySendError::Closed(_) => Error::ObserverClosed,
        })
    }

    fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    fn free_capacity(&self) -> Option<usize> {
        Some(self.sender.capacity())
    }
}

impl<K, V> ReplicatedMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Register a channel observer and return its receiver.
    ///
    /// The queue is sized while the table is locked, so it always holds the
    /// snapshot plus `observers.queue_capacity` live commands.
    pub fn replicate_channel(&self) -> Result<(Subscription, mpsc::Receiver<Command<K, V>>)> {
        self.register_channel(None)
    }

    /// Like [`replicate_channel`](Self::replicate_channel), registered for `peer`
    pub fn replicate_channel_to(
        &self,
        peer: impl Into<PeerId>,
    ) -> Result<(Subscription, mpsc::Receiver<Command<K, V>>)> {
        self.register_channel(Some(peer.into()))
    }

    fn register_channel(
        &self,
        peer: Option<PeerId>,
    ) -> Result<(Subscription, mpsc::Receiver<Command<K, V>>)> {
        let slack = self.config().observers.queue_capacity;
        self.register_with(peer, |snapshot_len| {
            let (observer, receiver) = ChannelObserver::channel(snapshot_len + slack);
            (Box::new(observer) as Box<dyn Observer<K, V>>, receiver)
        })
    }
}

/// Apply every command from `receiver` to `target` until the channel closes.
///
/// With an `origin`, commands are applied on behalf of that peer. Returns
/// the number of commands applied.
pub async fn relay<K, V>(
    mut receiver: mpsc::Receiver<Command<K, V>>,
    target: ReplicatedMap<K, V>,
    origin: Option<PeerId>,
) -> usize
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let mut applied = 0;

    while let Some(command) = receiver.recv().await {
        match &origin {
            Some(peer) => target.apply_from(peer, command),
            None => target.apply(command),
        }
        applied += 1;
    }

    tracing::debug!("Relay finished after {} commands", applied);
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfig;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::sync::mpsc::error::TryRecvError;

    fn map_of(entries: &[(&str, i64)]) -> ReplicatedMap<String, i64> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[tokio::test]
    async fn test_channel_receives_snapshot_then_live() {
        let map = map_of(&[("existing", 1)]);
        let (_sub, mut rx) = map.replicate_channel().unwrap();

        map.set("new".into(), 2);

        assert_eq!(rx.recv().await, Some(Command::add("existing".to_string(), 1)));
        assert_eq!(rx.recv().await, Some(Command::add("new".to_string(), 2)));
    }

    #[tokio::test]
    async fn test_relay_replicates_commands() {
        let sender = map_of(&[("existing", 1)]);
        let receiver = ReplicatedMap::<String, i64>::new();

        let (sub, rx) = sender.replicate_channel().unwrap();
        let task = tokio::spawn(relay(rx, receiver.clone(), None));

        sender.set("x".into(), 1);
        sender.delete("x");
        sender.set("new".into(), 2);

        // Unsubscribing drops the observer and with it the sender half
        sub.unsubscribe();
        let applied = task.await.unwrap();

        assert_eq!(applied, 4);
        assert!(!receiver.has("x"));
        assert_eq!(receiver.entries(), sender.entries());
    }

    #[tokio::test]
    async fn test_relay_with_origin_does_not_echo() {
        let east = ReplicatedMap::<String, i64>::new();
        let west = ReplicatedMap::<String, i64>::new();

        let (east_sub, east_rx) = east.replicate_channel_to("west").unwrap();
        let (west_sub, mut west_rx) = west.replicate_channel_to("east").unwrap();
        let task = tokio::spawn(relay(east_rx, west.clone(), Some(PeerId::from("east"))));

        east.set("a".into(), 1);
        east_sub.unsubscribe();
        task.await.unwrap();

        assert_eq!(west.get("a"), Some(1));
        west_sub.unsubscribe();
        assert_eq!(west_rx.recv().await, None);
    }

    #[test]
    fn test_full_queue_detaches_observer() {
        let toml = "[observers]\nqueue_capacity = 2\n";
        let map = ReplicatedMap::<String, i64>::with_config(MapConfig::from_str(toml).unwrap()).unwrap();
        let (sub, _rx) = map.replicate_channel().unwrap();

        map.set("a".into(), 1);
        map.set("b".into(), 2);
        assert!(sub.is_active());

        map.set("c".into(), 3);
        assert!(!sub.is_active());
        assert_eq!(map.observer_count(), 0);
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_dropped_receiver_detaches_observer() {
        let map = ReplicatedMap::<String, i64>::new();
        let (sub, rx) = map.replicate_channel().unwrap();
        drop(rx);

        map.set("a".into(), 1);
        assert!(!sub.is_active());
    }

    #[test]
    fn test_closed_observer_is_rejected() {
        let map = ReplicatedMap::<String, i64>::new();
        let (observer, rx) = ChannelObserver::channel(4);
        drop(rx);

        let err = map.replicate(observer).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(map.observer_count(), 0);
    }

    #[test]
    fn test_unsubscribe_during_delivery_closes_channel() {
        let map = ReplicatedMap::<String, i64>::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::default();

        let pending = slot.clone();
        map.replicate(move |_: &Command<String, i64>| -> Result<()> {
            if let Some(sub) = pending.lock().take() {
                sub.unsubscribe();
            }
            Ok(())
        })
        .unwrap();
        let (sub, mut rx) = map.replicate_channel().unwrap();
        *slot.lock() = Some(sub);

        map.set("a".into(), 1);

        assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));
        assert_eq!(map.observer_count(), 1);
    }

    #[test]
    fn test_snapshot_larger_than_queue_is_rejected() {
        let map = map_of(&[("a", 1), ("b", 2)]);
        let (observer, _rx) = ChannelObserver::channel(1);

        let err = map.replicate(observer).unwrap_err();
        assert!(matches!(err, Error::ObserverLagging { capacity: 1 }));
        assert_eq!(map.observer_count(), 0);
    }

    #[test]
    fn test_channel_sized_for_snapshot() {
        let entries: Vec<(String, i64)> = (0..100).map(|i| (format!("k{}", i), i)).collect();
        let toml = "[observers]\nqueue_capacity = 1\n";
        let config = MapConfig::from_str(toml).unwrap();
        let map = ReplicatedMap::from_entries_with_config(entries, config).unwrap();

        let (sub, mut rx) = map.replicate_channel().unwrap();
        assert!(sub.is_active());

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 100);
    }

    #[test]
    fn test_zero_capacity_channel_is_usable() {
        let map = ReplicatedMap::<String, i64>::new();
        let (observer, mut rx) = ChannelObserver::channel(0);
        map.replicate(observer).unwrap();

        map.set("a".into(), 1);
        assert_eq!(rx.try_recv(), Ok(Command::add("a".to_string(), 1)));
    }
}
