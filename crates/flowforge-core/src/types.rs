use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Represents a packet of data flowing through the engine
///
/// A thin wrapper around a JSON value used for trigger payloads, step
/// inputs and outputs, and resume payloads.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DataPacket {
    /// The inner JSON value
    pub value: serde_json::Value,
}

impl DataPacket {
    /// Create a new data packet from a JSON value
    #[inline]
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }

    /// Create a null data packet
    #[inline]
    pub fn null() -> Self {
        Self {
            value: serde_json::Value::Null,
        }
    }

    /// Create an empty object data packet
    #[inline]
    pub fn empty_object() -> Self {
        Self {
            value: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// Get the inner JSON value
    #[inline]
    pub fn as_value(&self) -> &serde_json::Value {
        &self.value
    }

    /// Take ownership of the inner JSON value
    #[inline]
    pub fn into_value(self) -> serde_json::Value {
        self.value
    }

    /// Check if the data packet is null
    #[inline]
    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }

    /// Try to convert the data packet to a specific type
    pub fn to<T>(&self) -> Result<T, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_value(self.value.clone())
    }

    /// Create a data packet from a serializable value
    pub fn from<T>(value: &T) -> Result<Self, serde_json::Error>
    where
        T: Serialize,
    {
        Ok(Self::new(serde_json::to_value(value)?))
    }

    /// Merge the top-level keys of `other` into this packet.
    ///
    /// Both packets are coerced to objects; keys from `other` win. Non-object
    /// payloads are stored under a `"body"` key so nothing is lost.
    pub fn merge(&mut self, other: &DataPacket) {
        if !self.value.is_object() {
            self.value = serde_json::Value::Object(serde_json::Map::new());
        }
        let Some(target) = self.value.as_object_mut() else {
            return;
        };

        match other.value.as_object() {
            Some(map) => {
                for (key, value) in map {
                    target.insert(key.clone(), value.clone());
                }
            }
            None => {
                target.insert("body".to_string(), other.value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_objects() {
        let mut context = DataPacket::new(json!({"a": 1, "b": 2}));
        context.merge(&DataPacket::new(json!({"b": 3, "c": 4})));
        assert_eq!(context.as_value(), &json!({"a": 1, "b": 3, "c": 4}));
    }

    #[test]
    fn test_merge_non_object_payload() {
        let mut context = DataPacket::empty_object();
        context.merge(&DataPacket::new(json!("raw body")));
        assert_eq!(context.as_value(), &json!({"body": "raw body"}));
    }

    #[test]
    fn test_merge_into_null_context() {
        let mut context = DataPacket::null();
        context.merge(&DataPacket::new(json!({"foo": 1})));
        assert_eq!(context.as_value(), &json!({"foo": 1}));
    }

    #[test]
    fn test_roundtrip_typed() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Payload {
            foo: u32,
        }

        let packet = DataPacket::from(&Payload { foo: 7 }).unwrap();
        let back: Payload = packet.to().unwrap();
        assert_eq!(back, Payload { foo: 7 });
    }
}
