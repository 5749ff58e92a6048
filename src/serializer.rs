//! Payload serialization seam.
//!
//! The engine never touches payload bytes except through a [`Serializer`].
//! Values cross the seam as a `serde_json::Value` tree; the serializer
//! decides the byte format.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, StoreError};

/// Converts payload values to and from stored bytes.
pub trait Serializer: Send + Sync {
    /// Format name, for diagnostics.
    fn name(&self) -> &str;

    fn encode(&self, value: &serde_json::Value) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value>;
}

/// Encode any serde value through a serializer.
pub fn to_bytes<T: Serialize + ?Sized>(serializer: &dyn Serializer, value: &T) -> Result<Vec<u8>> {
    let tree = serde_json::to_value(value)?;
    serializer.encode(&tree)
}

/// Decode stored bytes into a typed value through a serializer.
pub fn from_bytes<T: DeserializeOwned>(serializer: &dyn Serializer, bytes: &[u8]) -> Result<T> {
    let tree = serializer.decode(bytes)?;
    serde_json::from_value(tree).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Compact JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &str {
        "json"
    }

    fn encode(&self, value: &serde_json::Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
