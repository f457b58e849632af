//! Canonical storage encoding for chain entities.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CoreError, Result};

/// Canonical byte encoding used for storage values and size accounting.
///
/// Blanket-implemented for every serde type; the encoding is bincode with
/// its default (little-endian, fixed-int) configuration.
pub trait Codec: Sized {
    fn encode(&self) -> Result<Vec<u8>>;
    fn decode(buf: &[u8]) -> Result<Self>;
}

impl<T> Codec for T
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| CoreError::Serialization(e.to_string().into()))
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        bincode::deserialize(buf).map_err(|e| CoreError::Serialization(e.to_string().into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OutPoint, TxOut};

    #[test]
    fn round_trip_outpoint() {
        let outpoint = OutPoint::new([9u8; 32], 4);
        let encoded = outpoint.encode().unwrap();
        assert_eq!(OutPoint::decode(&encoded).unwrap(), outpoint);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(TxOut::decode(&[0xff]).is_err());
    }
}
