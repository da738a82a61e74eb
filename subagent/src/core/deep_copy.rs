//! Structural deep copy through serde.
//!
//! Values round-trip through [`serde_json::Value`], so the copy shares no
//! reference-counted internals with its source. `serde_json::Value` is an
//! owned tree and cannot express cycles.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::EngineError;

pub fn deep_copy<T>(value: &T) -> Result<T, EngineError>
where
    T: Serialize + DeserializeOwned,
{
    let tree = serde_json::to_value(value)
        .map_err(|err| EngineError::Configuration(format!("value is not copyable: {err}")))?;
    serde_json::from_value(tree)
        .map_err(|err| EngineError::Configuration(format!("value is not copyable: {err}")))
}
