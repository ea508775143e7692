//! Value serializers.
//!
//! Three formats are offered, selectable by name through [`SerializerKind`]:
//!
//! | Name | Format | Crate |
//! |------|--------|-------|
//! | `json` | JSON text | `serde_json` |
//! | `msgpack` | MessagePack, structs as maps | `rmp-serde` |
//! | `bincode` | compact binary object encoding | `bincode` |

use crate::{CodecError, CodecResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Turns values into bytes and back.
pub trait Serializer: Send + Sync {
    /// Registry name of this serializer.
    fn name(&self) -> &'static str;

    /// Serialize a value.
    fn dumps<T: Serialize + ?Sized>(&self, value: &T) -> CodecResult<Vec<u8>>;

    /// Deserialize a value.
    fn loads<T: DeserializeOwned>(&self, bytes: &[u8]) -> CodecResult<T>;
}

/// JSON serializer.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn dumps<T: Serialize + ?Sized>(&self, value: &T) -> CodecResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| CodecError::Serialization(e.to_string()))
    }

    fn loads<T: DeserializeOwned>(&self, bytes: &[u8]) -> CodecResult<T> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Deserialization(e.to_string()))
    }
}

/// MessagePack serializer. Structs are written with field names so the
/// payload stays readable by other MessagePack consumers.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackSerializer;

impl Serializer for MsgPackSerializer {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn dumps<T: Serialize + ?Sized>(&self, value: &T) -> CodecResult<Vec<u8>> {
        rmp_serde::to_vec_named(value).map_err(|e| CodecError::Serialization(e.to_string()))
    }

    fn loads<T: DeserializeOwned>(&self, bytes: &[u8]) -> CodecResult<T> {
        rmp_serde::from_slice(bytes).map_err(|e| CodecError::Deserialization(e.to_string()))
    }
}

/// Bincode serializer. Not self-describing: values must be read back with
/// the type they were written with.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeSerializer;

impl Serializer for BincodeSerializer {
    fn name(&self) -> &'static str {
        "bincode"
    }

    fn dumps<T: Serialize + ?Sized>(&self, value: &T) -> CodecResult<Vec<u8>> {
        bincode::serialize(value).map_err(|e| CodecError::Serialization(e.to_string()))
    }

    fn loads<T: DeserializeOwned>(&self, bytes: &[u8]) -> CodecResult<T> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Deserialization(e.to_string()))
    }
}

/// Serializer registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializerKind {
    /// JSON (default)
    #[default]
    Json,
    /// MessagePack
    MsgPack,
    /// Bincode
    Bincode,
}

impl SerializerKind {
    /// All registered serializers.
    pub const ALL: [SerializerKind; 3] = [Self::Json, Self::MsgPack, Self::Bincode];
}

impl Serializer for SerializerKind {
    fn name(&self) -> &'static str {
        match self {
            Self::Json => JsonSerializer.name(),
            Self::MsgPack => MsgPackSerializer.name(),
            Self::Bincode => BincodeSerializer.name(),
        }
    }

    fn dumps<T: Serialize + ?Sized>(&self, value: &T) -> CodecResult<Vec<u8>> {
        match self {
            Self::Json => JsonSerializer.dumps(value),
            Self::MsgPack => MsgPackSerializer.dumps(value),
            Self::Bincode => BincodeSerializer.dumps(value),
        }
    }

    fn loads<T: DeserializeOwned>(&self, bytes: &[u8]) -> CodecResult<T> {
        match self {
            Self::Json => JsonSerializer.loads(bytes),
            Self::MsgPack => MsgPackSerializer.loads(bytes),
            Self::Bincode => BincodeSerializer.loads(bytes),
        }
    }
}

impl FromStr for SerializerKind {
    type Err = CodecError;

    /// Accepts short names (`json`) as well as dotted class paths such as
    /// `django_valkey.serializers.msgpack.MSGPackSerializer`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = crate::registry_name(s, "serializer");
        match name.as_str() {
            "json" | "msgspecjson" => Ok(Self::Json),
            "msgpack" | "msgspecmsgpack" => Ok(Self::MsgPack),
            "bincode" | "pickle" => Ok(Self::Bincode),
            _ => Err(CodecError::Unsupported(format!("serializer '{}'", s))),
        }
    }
}

impl fmt::Display for SerializerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for SerializerKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for SerializerKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        tags: Vec<String>,
        score: Option<f64>,
    }

    #[test]
    fn test_every_serializer_round_trips_a_struct() {
        let profile = Profile {
            name: "ada".to_string(),
            tags: vec!["admin".to_string()],
            score: Some(9.5),
        };

        for kind in SerializerKind::ALL {
            let bytes = kind.dumps(&profile).unwrap();
            let back: Profile = kind.loads(&bytes).unwrap();
            assert_eq!(back, profile, "{kind}");
        }
    }

    #[test]
    fn test_msgpack_writes_field_names() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), 1u8);
        let bytes = MsgPackSerializer.dumps(&map).unwrap();
        let value: BTreeMap<String, u8> = MsgPackSerializer.loads(&bytes).unwrap();
        assert_eq!(value, map);

        let profile = Profile {
            name: "x".to_string(),
            tags: vec![],
            score: None,
        };
        let bytes = MsgPackSerializer.dumps(&profile).unwrap();
        assert!(bytes.windows(4).any(|w| w == b"name"));
    }

    #[test]
    fn test_json_rejects_garbage() {
        let result: CodecResult<Profile> = JsonSerializer.loads(b"{not json");
        assert!(matches!(result, Err(CodecError::Deserialization(_))));
    }

    #[test]
    fn test_parse_names_and_class_paths() {
        assert_eq!("json".parse::<SerializerKind>().unwrap(), SerializerKind::Json);
        assert_eq!(
            "django_valkey.serializers.msgpack.MSGPackSerializer"
                .parse::<SerializerKind>()
                .unwrap(),
            SerializerKind::MsgPack
        );
        assert_eq!(
            "django_valkey.serializers.pickle.PickleSerializer"
                .parse::<SerializerKind>()
                .unwrap(),
            SerializerKind::Bincode
        );
        assert!("yaml".parse::<SerializerKind>().is_err());
    }

    #[test]
    fn test_serde_uses_registry_names() {
        let kind: SerializerKind = serde_json::from_str("\"msgpack\"").unwrap();
        assert_eq!(kind, SerializerKind::MsgPack);
        assert_eq!(serde_json::to_string(&SerializerKind::Bincode).unwrap(), "\"bincode\"");
    }
}
