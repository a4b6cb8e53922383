//! Value encodings for typed sessions.

use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Serialize};

use crate::prelude::*;

pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec<Vec<u8>> for RawCodec {
    fn encode(&self, value: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Codec;

impl Codec<String> for Utf8Codec {
    fn encode(&self, value: &String) -> Result<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<String> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::FailedDeserialization(format!("invalid utf-8: {}", e)))
    }
}

#[derive(Debug)]
pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> Codec<T> for JsonCodec<T> {
    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use proptest::prelude::*;
    use test_strategy::proptest;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Entry {
        name: String,
        count: u32,
    }

    #[proptest(fork = false)]
    fn test_utf8_roundtrip(value: String) {
        let bytes = Utf8Codec.encode(&value)?;
        prop_assert_eq!(Utf8Codec.decode(&bytes)?, value);
    }

    #[test]
    fn test_utf8_rejects_invalid_bytes() {
        assert!(matches!(
            Utf8Codec.decode(&[0xff, 0xfe]),
            Err(Error::FailedDeserialization(_))
        ));
    }

    #[test]
    fn test_json_entries() {
        let codec = JsonCodec::<Entry>::new();
        let entry = Entry {
            name: "a".into(),
            count: 2,
        };

        let bytes = codec.encode(&entry).unwrap();
        assert_eq!(bytes, br#"{"name":"a","count":2}"#);
        assert_eq!(codec.decode(&bytes).unwrap(), entry);
        assert!(codec.decode(b"{").is_err());
    }

    #[test]
    fn test_raw_is_identity() {
        assert_eq!(RawCodec.decode(b"abc").unwrap(), b"abc".to_vec());
    }
}
