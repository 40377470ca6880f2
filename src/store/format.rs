use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;

/// Serialization used for persisted artifacts
pub trait ArtifactFormat: Send + Sync {
    /// File extension without the dot
    fn extension(&self) -> &'static str;

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, StoreError>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, StoreError>;
}

/// Pretty-printed JSON; floats round-trip exactly
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormat;

impl ArtifactFormat for JsonFormat {
    fn extension(&self) -> &'static str {
        "json"
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec_pretty(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, StoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
