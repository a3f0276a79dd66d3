//! The msgpack-encoded body carried inside a [`crate::wire::WireMessage`].

use crate::error::LxmfError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub timestamp: f64,
    pub content: Vec<u8>,
    pub title: Vec<u8>,
    pub fields: Option<serde_json::Value>,
}

impl Payload {
    pub fn new(timestamp: f64, content: Vec<u8>, title: Vec<u8>, fields: Option<serde_json::Value>) -> Self {
        Self { timestamp, content, title, fields }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, LxmfError> {
        let list = (self.timestamp, &self.title, &self.content, &self.fields);
        rmp_serde::to_vec(&list).map_err(|e| LxmfError::Encode(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, LxmfError> {
        let (timestamp, title, content, fields): (f64, Vec<u8>, Vec<u8>, Option<serde_json::Value>) =
            rmp_serde::from_slice(bytes).map_err(|e| LxmfError::Decode(e.to_string()))?;
        Ok(Self { timestamp, content, title, fields })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_msgpack() {
        let payload = Payload::new(1700000000.5, b"hello".to_vec(), b"title".to_vec(), None);
        let packed = payload.to_msgpack().unwrap();
        assert_eq!(Payload::from_msgpack(&packed).unwrap(), payload);
    }

    #[test]
    fn empty_content_round_trips() {
        let payload = Payload::new(0.0, Vec::new(), Vec::new(), None);
        let packed = payload.to_msgpack().unwrap();
        assert_eq!(Payload::from_msgpack(&packed).unwrap(), payload);
    }
}
