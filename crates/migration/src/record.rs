use std::fmt;

use ethereum_types::H256;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

use crate::{
    error::RecordDecodeError,
    schema::{DecodedKey, HASH_LENGTH, LedgerRecordKind, NUMBER_LENGTH},
};

/// One decoded store entry, independent of the key schema it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerRecord {
    pub kind: LedgerRecordKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    /// Block hash for block-family records, content hash for trie nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_hash: Option<H256>,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
}

impl LedgerRecord {
    /// Builds a record from a decoded key and its stored value.
    ///
    /// Canonical-hash entries take their hash from the value and hash-index
    /// entries take their number from the value, so both sides of the mapping
    /// travel with the record.
    pub fn from_entry(decoded: DecodedKey, value: Vec<u8>) -> Self {
        let mut block_number = decoded.block_number;
        let mut block_hash = decoded.hash;
        match decoded.kind {
            LedgerRecordKind::CanonicalHash if value.len() == HASH_LENGTH => {
                block_hash = Some(H256::from_slice(&value));
            }
            LedgerRecordKind::HeaderHashIndex => {
                if let Ok(raw) = <[u8; NUMBER_LENGTH]>::try_from(value.as_slice()) {
                    block_number = Some(u64::from_be_bytes(raw));
                }
            }
            _ => {}
        }
        Self {
            kind: decoded.kind,
            block_number,
            block_hash,
            payload: value,
        }
    }

    /// Checks the shape invariants a record must satisfy after deserialization.
    pub fn validate(&self) -> Result<(), RecordDecodeError> {
        if self.kind == LedgerRecordKind::Unclassified {
            return Err(RecordDecodeError::Unclassified);
        }
        if self.kind.is_number_keyed() && self.block_number.is_none() {
            return Err(RecordDecodeError::MissingBlockNumber { kind: self.kind });
        }
        if self.kind.is_trie_node() {
            if self.block_number.is_some() {
                return Err(RecordDecodeError::UnexpectedBlockNumber { kind: self.kind });
            }
            if self.block_hash.is_none() {
                return Err(RecordDecodeError::MissingHash { kind: self.kind });
            }
        }
        if self.kind == LedgerRecordKind::HeaderHashIndex && self.block_hash.is_none() {
            return Err(RecordDecodeError::MissingHash { kind: self.kind });
        }
        if self.kind == LedgerRecordKind::CanonicalHash && self.block_number.is_none() {
            return Err(RecordDecodeError::MissingBlockNumber { kind: self.kind });
        }
        Ok(())
    }

    /// Hash of the block this record belongs to.
    ///
    /// Headers stored without their hash in the key are identified by the
    /// Keccak-256 of their RLP payload.
    pub fn header_hash(&self) -> Option<H256> {
        match (self.kind, self.block_hash) {
            (_, Some(hash)) => Some(hash),
            (LedgerRecordKind::Header, None) => Some(keccak256(&self.payload)),
            _ => None,
        }
    }
}

impl fmt::Display for LedgerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(number) = self.block_number {
            write!(f, " #{number}")?;
        }
        if let Some(hash) = self.block_hash {
            write!(f, " {hash:#x}")?;
        }
        Ok(())
    }
}

pub fn keccak256(data: &[u8]) -> H256 {
    H256::from_slice(&Keccak256::digest(data))
}

/// `0x`-prefixed hex encoding for raw byte payloads.
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<T, S>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]>,
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes.as_ref())))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let digits = encoded.strip_prefix("0x").unwrap_or(&encoded);
        hex::decode(digits).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{KeyCodec, SchemaVersion};

    #[test]
    fn canonical_entry_takes_hash_from_value() {
        let codec = KeyCodec::new(SchemaVersion::Rawdb);
        let key = codec
            .encode(LedgerRecordKind::CanonicalHash, Some(3), None)
            .unwrap();
        let hash = H256::repeat_byte(0x11);

        let record = LedgerRecord::from_entry(codec.decode(&key), hash.as_bytes().to_vec());
        assert_eq!(record.block_number, Some(3));
        assert_eq!(record.block_hash, Some(hash));
        record.validate().unwrap();
    }

    #[test]
    fn hash_index_entry_takes_number_from_value() {
        let codec = KeyCodec::new(SchemaVersion::Rawdb);
        let hash = H256::repeat_byte(0x22);
        let key = codec
            .encode(LedgerRecordKind::HeaderHashIndex, None, Some(hash))
            .unwrap();

        let record = LedgerRecord::from_entry(codec.decode(&key), 77u64.to_be_bytes().to_vec());
        assert_eq!(record.block_number, Some(77));
        assert_eq!(record.block_hash, Some(hash));
    }

    #[test]
    fn serializes_payload_as_prefixed_hex() {
        let record = LedgerRecord {
            kind: LedgerRecordKind::Body,
            block_number: Some(1),
            block_hash: Some(H256::zero()),
            payload: vec![0xc0, 0x01],
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "body");
        assert_eq!(json["blockNumber"], 1);
        assert_eq!(json["payload"], "0xc001");

        let decoded: LedgerRecord = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn validation_rejects_number_keyed_record_without_number() {
        let record = LedgerRecord {
            kind: LedgerRecordKind::Receipts,
            block_number: None,
            block_hash: None,
            payload: Vec::new(),
        };
        assert!(matches!(
            record.validate(),
            Err(RecordDecodeError::MissingBlockNumber { .. })
        ));
    }

    #[test]
    fn header_without_key_hash_is_identified_by_keccak() {
        let record = LedgerRecord {
            kind: LedgerRecordKind::Header,
            block_number: Some(0),
            block_hash: None,
            payload: vec![0xc0],
        };
        assert_eq!(record.header_hash(), Some(keccak256(&[0xc0])));
    }
}
