use rmp_serde::{decode::Error as DecodeError, encode::Error as EncodeError};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::state::WorkflowState;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to project snapshot to JSON value: {0}")]
    JsonSerialize(#[source] serde_json::Error),
    #[error("failed to encode snapshot as messagepack: {0}")]
    MessagePackEncode(#[source] EncodeError),
    #[error("failed to decode messagepack snapshot: {0}")]
    MessagePackDecode(#[source] DecodeError),
    #[error("decoded snapshot does not match the expected shape: {0}")]
    JsonDeserialize(#[source] serde_json::Error),
}

/// Encodes a workflow snapshot with sorted keys so identical states produce
/// identical bytes.
pub fn encode_snapshot(state: &WorkflowState) -> Result<Vec<u8>, CodecError> {
    encode_canonical(state)
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<WorkflowState, CodecError> {
    decode_canonical(bytes)
}

pub fn encode_canonical<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_value(value).map_err(CodecError::JsonSerialize)?;
    rmp_serde::to_vec_named(&sort_keys(json)).map_err(CodecError::MessagePackEncode)
}

pub fn decode_canonical<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let decoded: Value = rmp_serde::from_slice(bytes).map_err(CodecError::MessagePackDecode)?;
    serde_json::from_value(decoded).map_err(CodecError::JsonDeserialize)
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(obj) => {
            let mut entries: Vec<(String, Value)> = obj.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let sorted: Map<String, Value> = entries
                .into_iter()
                .map(|(key, item)| (key, sort_keys(item)))
                .collect();
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        primitive => primitive,
    }
}
