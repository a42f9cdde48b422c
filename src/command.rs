//! Replication Commands
//!
//! A command describes exactly one state mutation. Locally applied mutations
//! are broadcast to observers as commands, and commands received from a peer
//! are fed back through the same mutation path.
//!
//! On the wire a command is a positional tuple `(type, key[, value])`. The
//! canonical vocabulary is `add`/`remove`/`clear`; the older `set`/`delete`
//! tags are accepted as aliases when parsing.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tag identifying the kind of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    /// Upsert a key
    Add,
    /// Delete a key
    Remove,
    /// Delete every key
    Clear,
}

impl CommandKind {
    /// Resolve a wire tag, including legacy aliases. Unknown tags yield `None`.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "add" | "set" => Some(CommandKind::Add),
            "remove" | "delete" => Some(CommandKind::Remove),
            "clear" => Some(CommandKind::Clear),
            _ => None,
        }
    }

    /// Canonical wire tag
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Add => "add",
            CommandKind::Remove => "remove",
            CommandKind::Clear => "clear",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single replicated mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command<K, V> {
    /// Insert or overwrite `key`
    Add { key: K, value: V },
    /// Delete `key`. Locally emitted removals carry the value that was removed.
    Remove { key: K, previous: Option<V> },
    /// Delete every key. Observers never see this; it is expanded into removals.
    Clear,
}

impl<K, V> Command<K, V> {
    /// Shorthand for an `Add` command
    pub fn add(key: K, value: V) -> Self {
        Command::Add { key, value }
    }

    /// Shorthand for a `Remove` command without a prior value
    pub fn remove(key: K) -> Self {
        Command::Remove { key, previous: None }
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Add { .. } => CommandKind::Add,
            Command::Remove { .. } => CommandKind::Remove,
            Command::Clear => CommandKind::Clear,
        }
    }

    pub fn key(&self) -> Option<&K> {
        match self {
            Command::Add { key, .. } | Command::Remove { key, .. } => Some(key),
            Command::Clear => None,
        }
    }

    /// The value carried by the command: the new value of an `Add`, or the
    /// removed value of a `Remove`.
    pub fn value(&self) -> Option<&V> {
        match self {
            Command::Add { value, .. } => Some(value),
            Command::Remove { previous, .. } => previous.as_ref(),
            Command::Clear => None,
        }
    }
}

impl<K, V> Command<K, V>
where
    K: DeserializeOwned,
    V: DeserializeOwned,
{
    /// Parse the positional `(type, key[, value])` form.
    ///
    /// Returns `Ok(None)` for tags this version does not understand, so a
    /// newer peer cannot break an older one. Missing or undecodable
    /// arguments fail with [`Error::InvalidArgument`]. Surplus arguments are
    /// ignored.
    pub fn from_positional(tag: &str, args: Vec<serde_json::Value>) -> Result<Option<Self>> {
        let Some(kind) = CommandKind::from_tag(tag) else {
            return Ok(None);
        };

        let mut args = args.into_iter();
        let command = match kind {
            CommandKind::Add => Command::Add {
                key: decode_arg(kind, "key", args.next())?,
                value: decode_arg(kind, "value", args.next())?,
            },
            CommandKind::Remove => Command::Remove {
                key: decode_arg(kind, "key", args.next())?,
                previous: None,
            },
            CommandKind::Clear => Command::Clear,
        };

        Ok(Some(command))
    }
}

impl<K, V> Command<K, V>
where
    K: Serialize,
    V: Serialize,
{
    /// Render the positional `(type, key[, value])` form using the canonical vocabulary
    pub fn to_positional(&self) -> Result<(&'static str, Vec<serde_json::Value>)> {
        let args = match self {
            Command::Add { key, value } => {
                vec![serde_json::to_value(key)?, serde_json::to_value(value)?]
            }
            Command::Remove { key, .. } => vec![serde_json::to_value(key)?],
            Command::Clear => Vec::new(),
        };

        Ok((self.kind().as_str(), args))
    }
}

fn decode_arg<T: DeserializeOwned>(
    kind: CommandKind,
    name: &str,
    arg: Option<serde_json::Value>,
) -> Result<T> {
    let arg = arg.ok_or_else(|| {
        Error::InvalidArgument(format!("{} command is missing its {}", kind, name))
    })?;

    serde_json::from_value(arg).map_err(|e| {
        Error::InvalidArgument(format!("{} command has an invalid {}: {}", kind, name, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    type Cmd = Command<String, i64>;

    #[test]
    fn test_legacy_aliases() {
        assert_eq!(CommandKind::from_tag("set"), Some(CommandKind::Add));
        assert_eq!(CommandKind::from_tag("add"), Some(CommandKind::Add));
        assert_eq!(CommandKind::from_tag("delete"), Some(CommandKind::Remove));
        assert_eq!(CommandKind::from_tag("remove"), Some(CommandKind::Remove));
        assert_eq!(CommandKind::from_tag("clear"), Some(CommandKind::Clear));
        assert_eq!(CommandKind::from_tag("merge"), None);
    }

    #[test]
    fn test_parse_positional() {
        let add = Cmd::from_positional("set", vec![json!("j"), json!(7)]).unwrap();
        assert_eq!(add, Some(Command::add("j".to_string(), 7)));

        let remove = Cmd::from_positional("delete", vec![json!("j")]).unwrap();
        assert_eq!(remove, Some(Command::remove("j".to_string())));

        let clear = Cmd::from_positional("clear", vec![]).unwrap();
        assert_eq!(clear, Some(Command::Clear));
    }

    #[test]
    fn test_unknown_tag_is_ignored() {
        let parsed = Cmd::from_positional("increment", vec![json!("j"), json!(1)]).unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn test_malformed_arguments() {
        let missing = Cmd::from_positional("add", vec![json!("j")]);
        assert!(matches!(missing, Err(Error::InvalidArgument(_))));

        let wrong_type = Cmd::from_positional("add", vec![json!("j"), json!("seven")]);
        assert!(matches!(wrong_type, Err(Error::InvalidArgument(_))));

        let no_key = Cmd::from_positional("remove", vec![]);
        assert!(matches!(no_key, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_to_positional_uses_canonical_tags() {
        let (tag, args) = Cmd::add("a".into(), 1).to_positional().unwrap();
        assert_eq!(tag, "add");
        assert_eq!(args, vec![json!("a"), json!(1)]);

        let removed = Command::Remove { key: "a".to_string(), previous: Some(1i64) };
        let (tag, args) = removed.to_positional().unwrap();
        assert_eq!(tag, "remove");
        assert_eq!(args, vec![json!("a")]);
    }

    #[test]
    fn test_accessors() {
        let removed: Cmd = Command::Remove { key: "k".into(), previous: Some(3) };
        assert_eq!(removed.kind(), CommandKind::Remove);
        assert_eq!(removed.key().map(String::as_str), Some("k"));
        assert_eq!(removed.value(), Some(&3));
        assert_eq!(Cmd::Clear.key(), None);
    }
}
