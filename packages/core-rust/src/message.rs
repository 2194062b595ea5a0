//! Manager-protocol message: a shared, internally synchronized field map.
//!
//! Every frame on the wire (action, response, event) is a flat set of
//! `Key: Value` lines, so a single [`Message`] type covers all three.
//! Cloning a `Message` shares the underlying map; [`Message::copy`] detaches
//! an independent one for handoff across task boundaries.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Serialize, Serializer};

use crate::codec::serialize;
use crate::ids::ActionIdGenerator;

/// Field carrying the action name on outbound frames.
pub const KEY_ACTION: &str = "Action";
/// Field correlating a response with the action that caused it.
pub const KEY_ACTION_ID: &str = "ActionID";
/// Field naming an unsolicited event.
pub const KEY_EVENT: &str = "Event";
/// Field carrying the server's verdict on an action.
pub const KEY_RESPONSE: &str = "Response";
/// Free-form server explanation accompanying a `Response`.
pub const KEY_MESSAGE: &str = "Message";
/// Login username field.
pub const KEY_USERNAME: &str = "Username";
/// Login secret field.
pub const KEY_SECRET: &str = "Secret";

/// Action that authenticates the session.
pub const ACTION_LOGIN: &str = "Login";
/// Action sent as a keepalive during idle periods.
pub const ACTION_PING: &str = "Ping";
/// `Response` value reported on success.
pub const RESPONSE_SUCCESS: &str = "Success";

/// Ordered field storage. `BTreeMap` keeps serialization deterministic.
pub type Fields = BTreeMap<String, String>;

/// All messages received for one outstanding action, in arrival order.
pub type ActionResponse = Vec<Message>;

/// A single protocol frame.
#[derive(Clone, Default)]
pub struct Message {
    fields: Arc<RwLock<Fields>>,
}

impl Message {
    /// Creates an empty message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a message owning the given fields.
    #[must_use]
    pub fn from_fields(fields: Fields) -> Self {
        Self {
            fields: Arc::new(RwLock::new(fields)),
        }
    }

    /// Creates an action message with the `Action` field set.
    #[must_use]
    pub fn action(name: impl Into<String>) -> Self {
        let msg = Self::new();
        msg.set(KEY_ACTION, name);
        msg
    }

    /// Builder-style setter, handy when assembling outbound actions.
    #[must_use]
    pub fn with(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.write().insert(key.into(), value.into());
    }

    /// Replaces the whole field map.
    pub fn set_fields(&self, fields: Fields) {
        *self.fields.write() = fields;
    }

    /// Returns the value for `key`, or `None` when the field is absent.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.fields.read().get(key).cloned()
    }

    /// Returns the value for `key`, or an empty string when absent.
    #[must_use]
    pub fn get_or_empty(&self, key: &str) -> String {
        self.get(key).unwrap_or_default()
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.fields.read().contains_key(key)
    }

    /// Snapshot of all fields.
    #[must_use]
    pub fn fields(&self) -> Fields {
        self.fields.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.read().is_empty()
    }

    /// The `Action` field, empty when absent.
    #[must_use]
    pub fn action_name(&self) -> String {
        self.get_or_empty(KEY_ACTION)
    }

    /// The `Event` field, empty when absent.
    #[must_use]
    pub fn event_name(&self) -> String {
        self.get_or_empty(KEY_EVENT)
    }

    /// Returns the `ActionID`, assigning one from `ids` on first read.
    ///
    /// The check and the assignment happen under one write lock, so racing
    /// first reads observe the same identifier and later reads never change it.
    pub fn action_id(&self, ids: &dyn ActionIdGenerator) -> String {
        if let Some(id) = self.existing_action_id() {
            return id;
        }
        let mut fields = self.fields.write();
        match fields.get(KEY_ACTION_ID) {
            Some(id) if !id.is_empty() => id.clone(),
            _ => {
                let id = ids.generate();
                fields.insert(KEY_ACTION_ID.to_string(), id.clone());
                id
            }
        }
    }

    /// The `ActionID` if one is already present and non-empty.
    #[must_use]
    pub fn existing_action_id(&self) -> Option<String> {
        self.fields
            .read()
            .get(KEY_ACTION_ID)
            .filter(|id| !id.is_empty())
            .cloned()
    }

    /// Deep copy: the returned message does not alias this one.
    #[must_use]
    pub fn copy(&self) -> Self {
        Self::from_fields(self.fields())
    }

    /// Wire representation of this message.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        serialize(&self.fields.read())
    }
}

impl From<Fields> for Message {
    fn from(fields: Fields) -> Self {
        Self::from_fields(fields)
    }
}

impl<K, V> FromIterator<(K, V)> for Message
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from_fields(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.fields, &other.fields) || *self.fields.read() == *other.fields.read()
    }
}

impl Eq for Message {}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.fields.read().iter()).finish()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.fields.read().serialize(serializer)
    }
}
