//! Message and command definitions
//!
//! `Message` is what flows from publishers through the router to subscribers.
//! Its payload is already-serialized JSON kept as raw bytes: the router never
//! looks inside it, and the wire form embeds it verbatim:
//!
//! ```json
//! {"topic": "chat", "payload": {"text": "hi"}}
//! ```
//!
//! `Command` is what a consumer connection sends us:
//!
//! ```json
//! {"cmd": "join", "args": ["chat", "news"]}
//! ```
//!
//! `args` stays raw until the handler knows which shape it expects.

use bytes::Bytes;
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::ser::{self, SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// A published message. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    topic: String,
    payload: Bytes,
}

impl Message {
    /// Create a message from a topic and an already-serialized JSON payload.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Create a message whose payload is `payload` encoded as JSON.
    pub fn json<T: Serialize + ?Sized>(
        topic: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_vec(payload)?;
        Ok(Self::new(topic, payload))
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let text = std::str::from_utf8(&self.payload).map_err(ser::Error::custom)?;
        let payload: &RawValue = serde_json::from_str(text).map_err(ser::Error::custom)?;

        let mut state = serializer.serialize_struct("Message", 2)?;
        state.serialize_field("topic", &self.topic)?;
        state.serialize_field("payload", payload)?;
        state.end()
    }
}

#[derive(Deserialize)]
struct WireMessage {
    topic: String,
    payload: Box<RawValue>,
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireMessage::deserialize(deserializer)?;
        Ok(Self::new(
            wire.topic,
            Bytes::copy_from_slice(wire.payload.get().as_bytes()),
        ))
    }
}

/// A control message received from a consumer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    args: Bytes,
}

impl Command {
    pub fn new(name: impl Into<String>, args: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            args: args.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw JSON arguments. Empty when the command carried no `args`.
    pub fn args(&self) -> &Bytes {
        &self.args
    }

    /// Decode the arguments into `T`. Missing arguments are an error.
    pub fn unmarshal<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.args)
    }
}

#[derive(Deserialize)]
struct WireCommand {
    cmd: String,
    #[serde(default)]
    args: Option<Box<RawValue>>,
}

impl<'de> Deserialize<'de> for Command {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireCommand::deserialize(deserializer)?;
        if wire.cmd.is_empty() {
            return Err(de::Error::custom("command name must not be empty"));
        }
        let args = wire
            .args
            .map(|raw| Bytes::copy_from_slice(raw.get().as_bytes()))
            .unwrap_or_default();
        Ok(Self::new(wire.cmd, args))
    }
}
