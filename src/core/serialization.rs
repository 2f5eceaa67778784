//! # Payload Formats
//!
//! Decoded packet payloads deserialize into a [`DataCollection`]. Which format a
//! payload uses is a deployment choice ([`DataType`]), not something the packet
//! header records, so client and server must agree on it out of band.
//!
//! ## Formats
//! - **Zero**: the crate's own compact type-tagged format (see [`crate::core::zero`])
//! - **MsgPack**: MessagePack maps, for clients that already speak it
//!
//! ## Usage
//! ```rust
//! use netcore::core::serialization::{DataCollection, DataType};
//! use netcore::core::zero::ZeroMap;
//!
//! let mut map = ZeroMap::new();
//! map.insert("cmd", "move");
//! let bytes = DataCollection::from(map).to_bytes().unwrap();
//! let back = DataCollection::from_bytes(DataType::Zero, &bytes).unwrap();
//! assert!(matches!(back, DataCollection::ZeroMap(_)));
//! ```

use crate::core::zero::{ZeroArray, ZeroMap, ZeroType, MAX_NESTING_DEPTH};
use crate::error::{NetworkError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Payload format shared by every session of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataType {
    #[default]
    Zero,
    MsgPack,
}

impl DataType {
    pub fn name(self) -> &'static str {
        match self {
            DataType::Zero => "Zero",
            DataType::MsgPack => "MessagePack",
        }
    }
}

/// One deserialized message.
#[derive(Debug, Clone, PartialEq)]
pub enum DataCollection {
    ZeroMap(ZeroMap),
    ZeroArray(ZeroArray),
    MsgPack(rmpv::Value),
}

impl DataCollection {
    pub fn data_type(&self) -> DataType {
        match self {
            DataCollection::ZeroMap(_) | DataCollection::ZeroArray(_) => DataType::Zero,
            DataCollection::MsgPack(_) => DataType::MsgPack,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            DataCollection::ZeroMap(map) => map.to_binary(),
            DataCollection::ZeroArray(array) => array.to_binary(),
            DataCollection::MsgPack(value) => {
                let mut out = Vec::new();
                rmpv::encode::write_value(&mut out, value)
                    .map_err(|e| NetworkError::SerializeError(e.to_string()))?;
                Ok(out)
            }
        }
    }

    pub fn from_bytes(data_type: DataType, binary: &[u8]) -> Result<Self> {
        match data_type {
            DataType::Zero => {
                let tag = binary.first().copied().ok_or_else(|| {
                    NetworkError::DeserializeError("empty zero payload".to_string())
                })?;
                match ZeroType::from_byte(tag) {
                    Some(ZeroType::ZeroMap) => Ok(DataCollection::ZeroMap(ZeroMap::from_binary(binary)?)),
                    Some(ZeroType::ZeroArray) => {
                        Ok(DataCollection::ZeroArray(ZeroArray::from_binary(binary)?))
                    }
                    _ => Err(NetworkError::DeserializeError(format!(
                        "unsupported zero collection tag {tag}"
                    ))),
                }
            }
            DataType::MsgPack => {
                let mut cursor = binary;
                let value = rmpv::decode::read_value_with_max_depth(&mut cursor, MAX_NESTING_DEPTH)
                    .map_err(|e| NetworkError::DeserializeError(e.to_string()))?;
                if !value.is_map() {
                    return Err(NetworkError::DeserializeError(
                        "MessagePack payload must be a map".to_string(),
                    ));
                }
                Ok(DataCollection::MsgPack(value))
            }
        }
    }

    /// Encode any serde value as a MessagePack map collection.
    pub fn msgpack_from<T: Serialize>(value: &T) -> Result<Self> {
        let bytes =
            rmp_serde::to_vec_named(value).map_err(|e| NetworkError::SerializeError(e.to_string()))?;
        Self::from_bytes(DataType::MsgPack, &bytes)
    }

    /// Decode a MessagePack collection into a typed value.
    pub fn msgpack_into<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            DataCollection::MsgPack(_) => {
                let bytes = self.to_bytes()?;
                rmp_serde::from_slice(&bytes)
                    .map_err(|e| NetworkError::DeserializeError(e.to_string()))
            }
            _ => Err(NetworkError::DeserializeError(
                "collection is not MessagePack".to_string(),
            )),
        }
    }
}

impl From<ZeroMap> for DataCollection {
    fn from(map: ZeroMap) -> Self {
        DataCollection::ZeroMap(map)
    }
}

impl From<ZeroArray> for DataCollection {
    fn from(array: ZeroArray) -> Self {
        DataCollection::ZeroArray(array)
    }
}
