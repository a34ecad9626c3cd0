//! Key schema tables.
//!
//! Each schema version is one table of `(tag byte, record kind, key layout)`
//! entries. Decoding and encoding read the same table, so a new store layout
//! is a new table, not new key-building code.
//!
//! ## `rawdb` layout (go-ethereum `core/rawdb/schema.go`)
//!
//! | Data              | Key format                           |
//! |-------------------|--------------------------------------|
//! | Block header      | `"h" + num(8 BE) + hash(32)`         |
//! | Canonical hash    | `"h" + num(8 BE) + "n"`              |
//! | Total difficulty  | `"h" + num(8 BE) + hash(32) + "t"`   |
//! | Block number      | `"H" + hash(32)`                     |
//! | Block body        | `"b" + num(8 BE) + hash(32)`         |
//! | Block receipts    | `"r" + num(8 BE) + hash(32)`         |
//! | Account trie node | `"s" + hash(32)`                     |
//! | Storage trie node | `"S" + hash(32)`                     |
//! | Head markers      | `"LastBlock"`, `"LastHeader"`, `"LastFast"` |
//!
//! The `namespaced` layout prefixes every key with a 32-byte chain namespace.
//! The `bucketed` layout also has the namespace but uses numeric buckets
//! (`0` header, `1` body, `2` receipts, `3` total difficulty, `4` canonical
//! hash by number, `5` number by hash) in place of letter tags.

use std::{fmt, str::FromStr};

use ethereum_types::H256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const NUMBER_LENGTH: usize = 8;
pub const HASH_LENGTH: usize = 32;
pub const NAMESPACE_LENGTH: usize = 32;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum LedgerRecordKind {
    Header,
    CanonicalHash,
    HeaderHashIndex,
    Body,
    Receipts,
    TotalDifficulty,
    AccountTrieNode,
    StorageTrieNode,
    Unclassified,
}

impl LedgerRecordKind {
    pub const ALL: [LedgerRecordKind; 9] = [
        LedgerRecordKind::Header,
        LedgerRecordKind::CanonicalHash,
        LedgerRecordKind::HeaderHashIndex,
        LedgerRecordKind::Body,
        LedgerRecordKind::Receipts,
        LedgerRecordKind::TotalDifficulty,
        LedgerRecordKind::AccountTrieNode,
        LedgerRecordKind::StorageTrieNode,
        LedgerRecordKind::Unclassified,
    ];

    pub fn name(self) -> &'static str {
        match self {
            LedgerRecordKind::Header => "header",
            LedgerRecordKind::CanonicalHash => "canonicalHash",
            LedgerRecordKind::HeaderHashIndex => "headerHashIndex",
            LedgerRecordKind::Body => "body",
            LedgerRecordKind::Receipts => "receipts",
            LedgerRecordKind::TotalDifficulty => "totalDifficulty",
            LedgerRecordKind::AccountTrieNode => "accountTrieNode",
            LedgerRecordKind::StorageTrieNode => "storageTrieNode",
            LedgerRecordKind::Unclassified => "unclassified",
        }
    }

    /// Kinds whose key always carries an 8-byte block number.
    pub fn is_number_keyed(self) -> bool {
        matches!(
            self,
            LedgerRecordKind::Header
                | LedgerRecordKind::Body
                | LedgerRecordKind::Receipts
                | LedgerRecordKind::TotalDifficulty
        )
    }

    pub fn is_trie_node(self) -> bool {
        matches!(
            self,
            LedgerRecordKind::AccountTrieNode | LedgerRecordKind::StorageTrieNode
        )
    }

    /// Line discriminator used by the transport codec.
    pub fn transport_type(self) -> Option<&'static str> {
        match self {
            LedgerRecordKind::Unclassified => None,
            kind if kind.is_trie_node() => Some("state"),
            _ => Some("block"),
        }
    }
}

impl fmt::Display for LedgerRecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shape of the key bytes that follow the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLayout {
    /// `num(8 BE)`
    Number,
    /// `num(8 BE) + trailer`
    NumberSuffix(u8),
    /// `num(8 BE) + hash(32)`
    NumberHash,
    /// `num(8 BE) + hash(32) + trailer`
    NumberHashSuffix(u8),
    /// `hash(32)`
    Hash,
}

impl KeyLayout {
    pub const fn len(self) -> usize {
        match self {
            KeyLayout::Number => NUMBER_LENGTH,
            KeyLayout::NumberSuffix(_) => NUMBER_LENGTH + 1,
            KeyLayout::NumberHash => NUMBER_LENGTH + HASH_LENGTH,
            KeyLayout::NumberHashSuffix(_) => NUMBER_LENGTH + HASH_LENGTH + 1,
            KeyLayout::Hash => HASH_LENGTH,
        }
    }

    fn parse(self, suffix: &[u8]) -> Option<(Option<u64>, Option<H256>)> {
        if suffix.len() != self.len() {
            return None;
        }
        match self {
            KeyLayout::Number => Some((Some(read_number(suffix)?), None)),
            KeyLayout::NumberSuffix(trailer) => {
                (suffix.last() == Some(&trailer)).then_some(())?;
                Some((Some(read_number(suffix)?), None))
            }
            KeyLayout::NumberHash => Some((
                Some(read_number(suffix)?),
                Some(read_hash(suffix.get(NUMBER_LENGTH..)?)?),
            )),
            KeyLayout::NumberHashSuffix(trailer) => {
                (suffix.last() == Some(&trailer)).then_some(())?;
                Some((
                    Some(read_number(suffix)?),
                    Some(read_hash(suffix.get(NUMBER_LENGTH..)?)?),
                ))
            }
            KeyLayout::Hash => Some((None, Some(read_hash(suffix)?))),
        }
    }

    fn write(
        self,
        kind: LedgerRecordKind,
        number: Option<u64>,
        hash: Option<H256>,
        out: &mut Vec<u8>,
    ) -> Result<(), EncodeError> {
        let need_number = || number.ok_or(EncodeError::MissingNumber { kind });
        let need_hash = || hash.ok_or(EncodeError::MissingHash { kind });
        match self {
            KeyLayout::Number => out.extend_from_slice(&need_number()?.to_be_bytes()),
            KeyLayout::NumberSuffix(trailer) => {
                out.extend_from_slice(&need_number()?.to_be_bytes());
                out.push(trailer);
            }
            KeyLayout::NumberHash => {
                out.extend_from_slice(&need_number()?.to_be_bytes());
                out.extend_from_slice(need_hash()?.as_bytes());
            }
            KeyLayout::NumberHashSuffix(trailer) => {
                out.extend_from_slice(&need_number()?.to_be_bytes());
                out.extend_from_slice(need_hash()?.as_bytes());
                out.push(trailer);
            }
            KeyLayout::Hash => out.extend_from_slice(need_hash()?.as_bytes()),
        }
        Ok(())
    }
}

fn read_number(bytes: &[u8]) -> Option<u64> {
    let raw: [u8; NUMBER_LENGTH] = bytes.get(..NUMBER_LENGTH)?.try_into().ok()?;
    Some(u64::from_be_bytes(raw))
}

fn read_hash(bytes: &[u8]) -> Option<H256> {
    bytes.get(..HASH_LENGTH).map(H256::from_slice)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagEntry {
    pub tag: u8,
    pub kind: LedgerRecordKind,
    pub layout: KeyLayout,
}

const fn entry(tag: u8, kind: LedgerRecordKind, layout: KeyLayout) -> TagEntry {
    TagEntry { tag, kind, layout }
}

// The first entry of a kind is the one used for encoding.
static RAWDB_ENTRIES: [TagEntry; 8] = [
    entry(b'h', LedgerRecordKind::Header, KeyLayout::NumberHash),
    entry(b'h', LedgerRecordKind::CanonicalHash, KeyLayout::NumberSuffix(b'n')),
    entry(b'h', LedgerRecordKind::TotalDifficulty, KeyLayout::NumberHashSuffix(b't')),
    entry(b'H', LedgerRecordKind::HeaderHashIndex, KeyLayout::Hash),
    entry(b'b', LedgerRecordKind::Body, KeyLayout::NumberHash),
    entry(b'r', LedgerRecordKind::Receipts, KeyLayout::NumberHash),
    entry(b's', LedgerRecordKind::AccountTrieNode, KeyLayout::Hash),
    entry(b'S', LedgerRecordKind::StorageTrieNode, KeyLayout::Hash),
];

static BUCKETED_ENTRIES: [TagEntry; 12] = [
    entry(0, LedgerRecordKind::Header, KeyLayout::NumberHash),
    entry(0, LedgerRecordKind::Header, KeyLayout::Number),
    entry(1, LedgerRecordKind::Body, KeyLayout::NumberHash),
    entry(1, LedgerRecordKind::Body, KeyLayout::Number),
    entry(2, LedgerRecordKind::Receipts, KeyLayout::NumberHash),
    entry(2, LedgerRecordKind::Receipts, KeyLayout::Number),
    entry(3, LedgerRecordKind::TotalDifficulty, KeyLayout::NumberHash),
    entry(3, LedgerRecordKind::TotalDifficulty, KeyLayout::Number),
    entry(4, LedgerRecordKind::CanonicalHash, KeyLayout::Number),
    entry(5, LedgerRecordKind::HeaderHashIndex, KeyLayout::Hash),
    entry(b's', LedgerRecordKind::AccountTrieNode, KeyLayout::Hash),
    entry(b'S', LedgerRecordKind::StorageTrieNode, KeyLayout::Hash),
];

#[derive(Debug)]
pub struct KeySchema {
    pub version: SchemaVersion,
    pub namespace_len: usize,
    pub entries: &'static [TagEntry],
}

static RAWDB: KeySchema = KeySchema {
    version: SchemaVersion::Rawdb,
    namespace_len: 0,
    entries: &RAWDB_ENTRIES,
};

static NAMESPACED: KeySchema = KeySchema {
    version: SchemaVersion::Namespaced,
    namespace_len: NAMESPACE_LENGTH,
    entries: &RAWDB_ENTRIES,
};

static BUCKETED: KeySchema = KeySchema {
    version: SchemaVersion::Bucketed,
    namespace_len: NAMESPACE_LENGTH,
    entries: &BUCKETED_ENTRIES,
};

impl KeySchema {
    /// Shortest key that can hold a namespace, a tag and a block number.
    pub fn min_key_len(&self) -> usize {
        self.namespace_len + 1 + NUMBER_LENGTH
    }

    pub fn entry_for_kind(&self, kind: LedgerRecordKind) -> Option<&'static TagEntry> {
        self.entries.iter().find(|entry| entry.kind == kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaVersion {
    #[default]
    Rawdb,
    Namespaced,
    Bucketed,
}

impl SchemaVersion {
    pub fn schema(self) -> &'static KeySchema {
        match self {
            SchemaVersion::Rawdb => &RAWDB,
            SchemaVersion::Namespaced => &NAMESPACED,
            SchemaVersion::Bucketed => &BUCKETED,
        }
    }

    pub fn is_namespaced(self) -> bool {
        self.schema().namespace_len > 0
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaVersion::Rawdb => write!(f, "rawdb"),
            SchemaVersion::Namespaced => write!(f, "namespaced"),
            SchemaVersion::Bucketed => write!(f, "bucketed"),
        }
    }
}

#[derive(Debug, Error)]
#[error("Unknown key schema `{0}` (expected rawdb, namespaced or bucketed)")]
pub struct UnknownSchema(pub String);

impl FromStr for SchemaVersion {
    type Err = UnknownSchema;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rawdb" | "geth" => Ok(SchemaVersion::Rawdb),
            "namespaced" => Ok(SchemaVersion::Namespaced),
            "bucketed" => Ok(SchemaVersion::Bucketed),
            other => Err(UnknownSchema(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnclassifiedReason {
    TooShort,
    UnknownTag,
    LayoutMismatch,
}

/// Result of running a raw key through a schema table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedKey {
    pub kind: LedgerRecordKind,
    pub namespace: Option<H256>,
    pub block_number: Option<u64>,
    pub hash: Option<H256>,
    pub unclassified: Option<UnclassifiedReason>,
}

impl DecodedKey {
    fn unclassified(namespace: Option<H256>, reason: UnclassifiedReason) -> Self {
        Self {
            kind: LedgerRecordKind::Unclassified,
            namespace,
            block_number: None,
            hash: None,
            unclassified: Some(reason),
        }
    }
}

/// Destination head pointers, all holding the raw 32-byte head hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadMarker {
    /// Last fully processed block.
    LastBlock,
    /// Last known header.
    LastHeader,
    /// Last fast-synced block.
    LastFast,
}

impl HeadMarker {
    pub const ALL: [HeadMarker; 3] = [
        HeadMarker::LastBlock,
        HeadMarker::LastHeader,
        HeadMarker::LastFast,
    ];

    pub fn key_name(self) -> &'static [u8] {
        match self {
            HeadMarker::LastBlock => b"LastBlock",
            HeadMarker::LastHeader => b"LastHeader",
            HeadMarker::LastFast => b"LastFast",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("{0} records have no key layout in the {1} schema")]
    NoLayout(LedgerRecordKind, SchemaVersion),
    #[error("{kind} key needs a block number")]
    MissingNumber { kind: LedgerRecordKind },
    #[error("{kind} key needs a hash")]
    MissingHash { kind: LedgerRecordKind },
    #[error("The {0} schema needs a namespace to build keys")]
    MissingNamespace(SchemaVersion),
}

/// A schema version bound to an optional chain namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyCodec {
    version: SchemaVersion,
    namespace: Option<H256>,
}

impl KeyCodec {
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            namespace: None,
        }
    }

    pub fn with_namespace(mut self, namespace: Option<H256>) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    pub fn namespace(&self) -> Option<H256> {
        self.namespace
    }

    /// Classifies a raw key. Never fails: anything the table cannot place is
    /// returned as [`LedgerRecordKind::Unclassified`] with the reason.
    pub fn decode(&self, key: &[u8]) -> DecodedKey {
        let schema = self.version.schema();
        if key.len() < schema.min_key_len() {
            return DecodedKey::unclassified(None, UnclassifiedReason::TooShort);
        }

        let (namespace, rest) = key.split_at(schema.namespace_len);
        let namespace = (schema.namespace_len > 0).then(|| H256::from_slice(namespace));
        let Some((&tag, suffix)) = rest.split_first() else {
            return DecodedKey::unclassified(namespace, UnclassifiedReason::TooShort);
        };

        let mut known_tag = false;
        for entry in schema.entries.iter().filter(|entry| entry.tag == tag) {
            known_tag = true;
            if let Some((block_number, hash)) = entry.layout.parse(suffix) {
                return DecodedKey {
                    kind: entry.kind,
                    namespace,
                    block_number,
                    hash,
                    unclassified: None,
                };
            }
        }

        let reason = if known_tag {
            UnclassifiedReason::LayoutMismatch
        } else {
            UnclassifiedReason::UnknownTag
        };
        DecodedKey::unclassified(namespace, reason)
    }

    /// Builds the key for `kind` in this schema.
    pub fn encode(
        &self,
        kind: LedgerRecordKind,
        number: Option<u64>,
        hash: Option<H256>,
    ) -> Result<Vec<u8>, EncodeError> {
        let entry = self
            .version
            .schema()
            .entry_for_kind(kind)
            .ok_or(EncodeError::NoLayout(kind, self.version))?;
        let mut key = self.key_prefix()?;
        key.reserve(1 + entry.layout.len());
        key.push(entry.tag);
        entry.layout.write(kind, number, hash, &mut key)?;
        Ok(key)
    }

    /// Namespace and tag shared by every key of `kind`.
    pub fn kind_prefix(&self, kind: LedgerRecordKind) -> Result<Vec<u8>, EncodeError> {
        let entry = self
            .version
            .schema()
            .entry_for_kind(kind)
            .ok_or(EncodeError::NoLayout(kind, self.version))?;
        let mut prefix = self.key_prefix()?;
        prefix.push(entry.tag);
        Ok(prefix)
    }

    pub fn head_marker_key(&self, marker: HeadMarker) -> Vec<u8> {
        let mut key = match self.namespace {
            Some(namespace) if self.version.is_namespaced() => namespace.as_bytes().to_vec(),
            _ => Vec::new(),
        };
        key.extend_from_slice(marker.key_name());
        key
    }

    fn key_prefix(&self) -> Result<Vec<u8>, EncodeError> {
        if !self.version.is_namespaced() {
            return Ok(Vec::new());
        }
        self.namespace
            .map(|namespace| namespace.as_bytes().to_vec())
            .ok_or(EncodeError::MissingNamespace(self.version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    const HASH: H256 = H256(hex!(
        "88e96d4537bea4d9c05d12549907b32561d3bf31f45aae734cdc119f13406cb6"
    ));
    const NAMESPACE: H256 = H256([0xab; 32]);

    fn rawdb_key(tag: u8, number: u64, tail: &[u8]) -> Vec<u8> {
        let mut key = vec![tag];
        key.extend_from_slice(&number.to_be_bytes());
        key.extend_from_slice(tail);
        key
    }

    #[test]
    fn decodes_header_number_and_hash() {
        let codec = KeyCodec::new(SchemaVersion::Rawdb);
        let decoded = codec.decode(&rawdb_key(b'h', 1234, HASH.as_bytes()));
        assert_eq!(decoded.kind, LedgerRecordKind::Header);
        assert_eq!(decoded.block_number, Some(1234));
        assert_eq!(decoded.hash, Some(HASH));
        assert_eq!(decoded.unclassified, None);
    }

    #[test]
    fn shared_tag_is_resolved_by_suffix_shape() {
        let codec = KeyCodec::new(SchemaVersion::Rawdb);

        let canonical = codec.decode(&rawdb_key(b'h', 7, b"n"));
        assert_eq!(canonical.kind, LedgerRecordKind::CanonicalHash);
        assert_eq!(canonical.block_number, Some(7));

        let mut td_tail = HASH.as_bytes().to_vec();
        td_tail.push(b't');
        let td = codec.decode(&rawdb_key(b'h', 7, &td_tail));
        assert_eq!(td.kind, LedgerRecordKind::TotalDifficulty);
        assert_eq!(td.hash, Some(HASH));
    }

    #[test]
    fn trie_nodes_carry_hash_only() {
        let codec = KeyCodec::new(SchemaVersion::Rawdb);
        let mut key = vec![b'S'];
        key.extend_from_slice(HASH.as_bytes());

        let decoded = codec.decode(&key);
        assert_eq!(decoded.kind, LedgerRecordKind::StorageTrieNode);
        assert_eq!(decoded.block_number, None);
        assert_eq!(decoded.hash, Some(HASH));
    }

    #[test]
    fn namespaced_keys_strip_and_report_namespace() {
        let codec = KeyCodec::new(SchemaVersion::Namespaced);
        let mut key = NAMESPACE.as_bytes().to_vec();
        key.extend_from_slice(&rawdb_key(b'b', 99, HASH.as_bytes()));

        let decoded = codec.decode(&key);
        assert_eq!(decoded.kind, LedgerRecordKind::Body);
        assert_eq!(decoded.namespace, Some(NAMESPACE));
        assert_eq!(decoded.block_number, Some(99));
    }

    #[test]
    fn bucketed_keys_use_numeric_tags() {
        let codec = KeyCodec::new(SchemaVersion::Bucketed);
        let mut key = NAMESPACE.as_bytes().to_vec();
        key.extend_from_slice(&rawdb_key(2, 5, &[]));

        let decoded = codec.decode(&key);
        assert_eq!(decoded.kind, LedgerRecordKind::Receipts);
        assert_eq!(decoded.block_number, Some(5));
        assert_eq!(decoded.hash, None);
    }

    #[test]
    fn short_and_unknown_keys_are_unclassified() {
        let codec = KeyCodec::new(SchemaVersion::Rawdb);

        let short = codec.decode(b"h\x00\x01");
        assert_eq!(short.kind, LedgerRecordKind::Unclassified);
        assert_eq!(short.unclassified, Some(UnclassifiedReason::TooShort));

        let marker = codec.decode(b"LastBlock");
        assert_eq!(marker.unclassified, Some(UnclassifiedReason::UnknownTag));

        let truncated = codec.decode(&rawdb_key(b'b', 1, &HASH.as_bytes()[..16]));
        assert_eq!(truncated.kind, LedgerRecordKind::Unclassified);
        assert_eq!(truncated.unclassified, Some(UnclassifiedReason::LayoutMismatch));
    }

    #[test]
    fn canonical_hash_key_format() {
        let codec = KeyCodec::new(SchemaVersion::Rawdb);
        let key = codec
            .encode(LedgerRecordKind::CanonicalHash, Some(1), None)
            .unwrap();
        assert_eq!(key, b"h\x00\x00\x00\x00\x00\x00\x00\x01n");
    }

    #[test]
    fn header_number_key_format() {
        let codec = KeyCodec::new(SchemaVersion::Rawdb);
        let key = codec
            .encode(LedgerRecordKind::HeaderHashIndex, None, Some(HASH))
            .unwrap();
        assert_eq!(key[0], b'H');
        assert_eq!(&key[1..], HASH.as_bytes());
    }

    #[test]
    fn encoded_keys_decode_to_same_fields() {
        let codec = KeyCodec::new(SchemaVersion::Namespaced).with_namespace(Some(NAMESPACE));
        let key = codec
            .encode(LedgerRecordKind::Receipts, Some(42), Some(HASH))
            .unwrap();
        let decoded = codec.decode(&key);
        assert_eq!(decoded.kind, LedgerRecordKind::Receipts);
        assert_eq!(decoded.block_number, Some(42));
        assert_eq!(decoded.hash, Some(HASH));
    }

    #[test]
    fn encoding_reports_missing_fields() {
        let rawdb = KeyCodec::new(SchemaVersion::Rawdb);
        assert_eq!(
            rawdb.encode(LedgerRecordKind::Body, Some(1), None),
            Err(EncodeError::MissingHash {
                kind: LedgerRecordKind::Body
            })
        );

        let namespaced = KeyCodec::new(SchemaVersion::Namespaced);
        assert_eq!(
            namespaced.encode(LedgerRecordKind::Body, Some(1), Some(HASH)),
            Err(EncodeError::MissingNamespace(SchemaVersion::Namespaced))
        );

        let bucketed = KeyCodec::new(SchemaVersion::Bucketed).with_namespace(Some(NAMESPACE));
        assert_eq!(
            bucketed.encode(LedgerRecordKind::HeaderHashIndex, None, None),
            Err(EncodeError::MissingHash {
                kind: LedgerRecordKind::HeaderHashIndex
            })
        );
        assert!(matches!(
            bucketed.encode(LedgerRecordKind::Unclassified, Some(1), None),
            Err(EncodeError::NoLayout(..))
        ));
    }

    #[test]
    fn bucketed_schema_indexes_the_canonical_chain() {
        let codec = KeyCodec::new(SchemaVersion::Bucketed).with_namespace(Some(NAMESPACE));

        let canonical = codec
            .encode(LedgerRecordKind::CanonicalHash, Some(7), None)
            .unwrap();
        assert_eq!(&canonical[..32], NAMESPACE.as_bytes());
        assert_eq!(canonical[32], 4);
        let decoded = codec.decode(&canonical);
        assert_eq!(decoded.kind, LedgerRecordKind::CanonicalHash);
        assert_eq!(decoded.block_number, Some(7));

        let index = codec
            .encode(LedgerRecordKind::HeaderHashIndex, None, Some(HASH))
            .unwrap();
        assert_eq!(index[32], 5);
        let decoded = codec.decode(&index);
        assert_eq!(decoded.kind, LedgerRecordKind::HeaderHashIndex);
        assert_eq!(decoded.hash, Some(HASH));
    }

    #[test]
    fn head_markers_follow_namespace() {
        let rawdb = KeyCodec::new(SchemaVersion::Rawdb);
        assert_eq!(rawdb.head_marker_key(HeadMarker::LastFast), b"LastFast");

        let namespaced = KeyCodec::new(SchemaVersion::Namespaced).with_namespace(Some(NAMESPACE));
        let key = namespaced.head_marker_key(HeadMarker::LastBlock);
        assert_eq!(&key[..32], NAMESPACE.as_bytes());
        assert_eq!(&key[32..], b"LastBlock");
    }
}
