//! ReplIMap - Replicated In-Memory Map
//!
//! A local key/value store that stays in sync with other instances by
//! exchanging mutation commands over whatever transport the caller chooses.
//! The map never touches the network itself.
//!
//! # Replication model
//!
//! Every mutation (`set`, `remove`, `clear`) updates the local table and is
//! broadcast to registered observers as a [`Command`]. A new observer first
//! receives the whole table as a sequence of `Add` commands, then the live
//! stream. Commands received from a peer are fed to the applier
//! ([`ReplicatedMap::apply`] / [`ReplicatedMap::cmd`]), which runs them
//! through the same mutation path, so they are relayed to this map's own
//! observers as well. Concurrent peers resolve conflicts by last-applied-wins.
//!
//! # Example
//!
//! ```
//! use replimap::prelude::*;
//!
//! let sender: ReplicatedMap<String, i64> = ReplicatedMap::new();
//! let receiver: ReplicatedMap<String, i64> = ReplicatedMap::new();
//!
//! let apply = receiver.applier();
//! let subscription = sender
//!     .replicate(move |command: &Command<String, i64>| -> Result<()> {
//!         apply(command.clone());
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! sender.set("a".to_string(), 1);
//! assert_eq!(receiver.get("a"), Some(1));
//!
//! subscription.unsubscribe();
//! ```

pub mod channel;
pub mod command;
pub mod config;
pub mod error;
pub mod logging;
pub mod map;
pub mod observer;
pub mod protocol;

pub use command::{Command, CommandKind};
pub use config::MapConfig;
pub use error::{Error, Result};
pub use map::ReplicatedMap;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::channel::{relay, ChannelObserver};
    pub use crate::command::{Command, CommandKind};
    pub use crate::config::MapConfig;
    pub use crate::error::{Error, Result};
    pub use crate::map::ReplicatedMap;
    pub use crate::observer::{Observer, ObserverId, PeerId, Subscription};
}
