use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("unable to serialise message")]
    Encode(#[source] serde_json::Error),
    #[error("unable to parse message {preview:?}")]
    Decode {
        preview: String,
        #[source]
        source: serde_json::Error,
    },
}

pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(msg).map_err(CodecError::Encode)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(bytes).map_err(|source| CodecError::Decode {
        preview: preview(bytes),
        source,
    })
}

/// First few characters of a payload, for log messages.
pub fn preview(bytes: &[u8]) -> String {
    const MAX_CHARS: usize = 120;
    match std::str::from_utf8(bytes) {
        Ok(text) => text.chars().take(MAX_CHARS).collect(),
        Err(_) => "<< not UTF-8 >>".to_string(),
    }
}
