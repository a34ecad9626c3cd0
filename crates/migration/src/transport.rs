//! Portable transport stream.
//!
//! Newline-delimited JSON, optionally gzip-compressed. The first line is the
//! [`ExportMetadata`] object (it has no `type` field); every later line is
//!
//! ```text
//! {"type": "block" | "state", "data": { ... }}
//! ```
//!
//! A `block` line carries either a serialized [`LedgerRecord`] (recognized by
//! its `kind` field) or a raw block object as returned by
//! `eth_getBlockByNumber`. A `state` line carries a trie-node record.
//! Lines with any other `type` are skipped and counted.

use std::{
    fs::File,
    io::{self, BufRead, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use ethereum_types::H256;
use flate2::{Compression as GzLevel, read::MultiGzDecoder, write::GzEncoder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    error::{MigrationError, RecordDecodeError},
    record::LedgerRecord,
    rpc::{parse_h256, parse_u64},
};

pub const FORMAT_VERSION: &str = "1.0.0";
/// Longest line the reader accepts. Longer lines are skipped as malformed.
pub const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportMetadata {
    #[serde(rename = "version")]
    pub format_version: String,
    /// RFC 3339, UTC.
    #[serde(rename = "exportTime")]
    pub export_timestamp: String,
    #[serde(rename = "source")]
    pub source_descriptor: String,
    #[serde(rename = "startBlock")]
    pub start_block: u64,
    #[serde(rename = "endBlock", default)]
    pub end_block: Option<u64>,
}

impl ExportMetadata {
    pub fn new(source: impl Into<String>, start_block: u64, end_block: Option<u64>) -> Self {
        Self {
            format_version: FORMAT_VERSION.to_string(),
            export_timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            source_descriptor: source.into(),
            start_block,
            end_block,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

impl Compression {
    /// Gzip when the path ends in `.gz`. Content is never sniffed.
    pub fn from_path_hint(path: &Path) -> Self {
        match path.extension() {
            Some(ext) if ext == "gz" => Compression::Gzip,
            _ => Compression::None,
        }
    }
}

/// Block object as served by `eth_getBlockByNumber`.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcBlock {
    pub number: u64,
    pub hash: Option<H256>,
    pub body: Value,
}

impl RpcBlock {
    pub fn from_value(body: Value) -> Result<Self, RecordDecodeError> {
        let number = body
            .get("number")
            .ok_or(RecordDecodeError::InvalidRpcBlock { field: "number" })
            .and_then(|value| {
                parse_u64(value, "block")
                    .map_err(|_| RecordDecodeError::InvalidRpcBlock { field: "number" })
            })?;
        let hash = match body.get("hash") {
            None | Some(Value::Null) => None,
            Some(value) => Some(
                parse_h256(value, "block")
                    .map_err(|_| RecordDecodeError::InvalidRpcBlock { field: "hash" })?,
            ),
        };
        Ok(Self { number, hash, body })
    }

    /// Signed transactions carried in the block as raw hex.
    pub fn raw_transactions(&self) -> Vec<&str> {
        self.body
            .get("transactions")
            .and_then(Value::as_array)
            .map(|txs| {
                txs.iter()
                    .filter_map(|tx| tx.get("raw").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// One decoded data line.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEntry {
    Record(LedgerRecord),
    RpcBlock(RpcBlock),
}

impl TransportEntry {
    pub fn block_number(&self) -> Option<u64> {
        match self {
            TransportEntry::Record(record) => record.block_number,
            TransportEntry::RpcBlock(block) => Some(block.number),
        }
    }

    pub fn block_hash(&self) -> Option<H256> {
        match self {
            TransportEntry::Record(record) => record.block_hash,
            TransportEntry::RpcBlock(block) => block.hash,
        }
    }

    pub fn is_state(&self) -> bool {
        matches!(self, TransportEntry::Record(record) if record.kind.is_trie_node())
    }

    fn line_type(&self) -> &'static str {
        if self.is_state() { "state" } else { "block" }
    }
}

#[derive(Serialize)]
struct LineOut<'a, T: Serialize> {
    #[serde(rename = "type")]
    line_type: &'a str,
    data: &'a T,
}

enum Sink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Plain(w) => w.write(buf),
            Sink::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Plain(w) => w.flush(),
            Sink::Gzip(w) => w.flush(),
        }
    }
}

pub struct TransportWriter {
    sink: Sink,
    path: PathBuf,
    lines: u64,
}

impl TransportWriter {
    pub fn create(path: &Path, compression: Compression) -> Result<Self, MigrationError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| MigrationError::TransportIo {
                path: path.to_path_buf(),
                source,
            })?;
        }
        let file = File::create(path).map_err(|source| MigrationError::TransportIo {
            path: path.to_path_buf(),
            source,
        })?;
        let buffered = BufWriter::new(file);
        let sink = match compression {
            Compression::None => Sink::Plain(buffered),
            Compression::Gzip => Sink::Gzip(GzEncoder::new(buffered, GzLevel::default())),
        };
        debug!(path = %path.display(), ?compression, "Created transport file");
        Ok(Self {
            sink,
            path: path.to_path_buf(),
            lines: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lines_written(&self) -> u64 {
        self.lines
    }

    pub fn write_metadata(&mut self, metadata: &ExportMetadata) -> io::Result<()> {
        self.write_line(metadata)
    }

    pub fn write_entry(&mut self, entry: &TransportEntry) -> io::Result<()> {
        let line_type = entry.line_type();
        match entry {
            TransportEntry::Record(record) => self.write_line(&LineOut {
                line_type,
                data: record,
            }),
            TransportEntry::RpcBlock(block) => self.write_line(&LineOut {
                line_type,
                data: &block.body,
            }),
        }
    }

    fn write_line<T: Serialize>(&mut self, value: &T) -> io::Result<()> {
        serde_json::to_writer(&mut self.sink, value)?;
        self.sink.write_all(b"\n")?;
        self.lines += 1;
        Ok(())
    }

    /// Flushes buffers and writes the gzip trailer. Returns the line count.
    pub fn finish(self) -> Result<u64, MigrationError> {
        let path = self.path;
        let io_err = |source| MigrationError::TransportIo {
            path: path.clone(),
            source,
        };
        match self.sink {
            Sink::Plain(mut w) => w.flush().map_err(io_err)?,
            Sink::Gzip(w) => w.finish().and_then(|mut inner| inner.flush()).map_err(io_err)?,
        }
        Ok(self.lines)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub lines: u64,
    pub entries: u64,
    pub decode_errors: u64,
    pub ignored: u64,
}

pub struct TransportReader {
    reader: Box<dyn BufRead + Send>,
    path: PathBuf,
    metadata: Option<ExportMetadata>,
    pending: Option<Vec<u8>>,
    stats: TransportStats,
}

impl TransportReader {
    /// Opens a transport file, decompressing when the path ends in `.gz`.
    pub fn open(path: &Path) -> Result<Self, MigrationError> {
        let file = File::open(path).map_err(|source| MigrationError::TransportIo {
            path: path.to_path_buf(),
            source,
        })?;
        let reader: Box<dyn BufRead + Send> = match Compression::from_path_hint(path) {
            Compression::None => Box::new(BufReader::new(file)),
            Compression::Gzip => Box::new(BufReader::new(MultiGzDecoder::new(BufReader::new(file)))),
        };
        Self::with_reader(reader, path)
    }

    /// Reads an uncompressed stream from any source.
    pub fn new(reader: impl Read + Send + 'static) -> Result<Self, MigrationError> {
        Self::with_reader(Box::new(BufReader::new(reader)), Path::new("<stream>"))
    }

    fn with_reader(reader: Box<dyn BufRead + Send>, path: &Path) -> Result<Self, MigrationError> {
        let mut this = Self {
            reader,
            path: path.to_path_buf(),
            metadata: None,
            pending: None,
            stats: TransportStats::default(),
        };
        this.read_metadata()?;
        Ok(this)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Header line, `None` when the stream starts directly with data lines.
    pub fn metadata(&self) -> Option<&ExportMetadata> {
        self.metadata.as_ref()
    }

    pub fn stats(&self) -> TransportStats {
        self.stats
    }

    fn read_metadata(&mut self) -> Result<(), MigrationError> {
        while let Some(line) = self.read_line()? {
            let line = match line {
                Ok(line) if line.iter().all(u8::is_ascii_whitespace) => continue,
                Ok(line) => line,
                Err(error) => {
                    warn!(%error, "Skipping malformed first transport line");
                    self.stats.decode_errors += 1;
                    break;
                }
            };
            match serde_json::from_slice::<Value>(&line) {
                Ok(value) if value.is_object() && value.get("type").is_none() => {
                    match serde_json::from_value::<ExportMetadata>(value) {
                        Ok(metadata) => {
                            debug!(
                                source = %metadata.source_descriptor,
                                version = %metadata.format_version,
                                "Read transport metadata"
                            );
                            self.metadata = Some(metadata);
                        }
                        Err(error) => {
                            warn!(%error, "Transport metadata line is malformed");
                            self.stats.decode_errors += 1;
                        }
                    }
                }
                _ => self.pending = Some(line),
            }
            break;
        }
        Ok(())
    }

    /// Reads the next raw line. The inner `Err` marks an overlong line,
    /// which has already been consumed up to its newline.
    fn read_line(&mut self) -> Result<Option<Result<Vec<u8>, RecordDecodeError>>, MigrationError> {
        let mut buf = Vec::new();
        let read = (&mut self.reader)
            .take(MAX_LINE_BYTES as u64 + 1)
            .read_until(b'\n', &mut buf)
            .map_err(transport_io(&self.path))?;
        if read == 0 {
            return Ok(None);
        }
        self.stats.lines += 1;

        if buf.last() == Some(&b'\n') {
            buf.pop();
        } else if buf.len() > MAX_LINE_BYTES {
            self.skip_rest_of_line()?;
            return Ok(Some(Err(RecordDecodeError::LineTooLong {
                limit: MAX_LINE_BYTES,
            })));
        }
        if buf.len() > MAX_LINE_BYTES {
            return Ok(Some(Err(RecordDecodeError::LineTooLong {
                limit: MAX_LINE_BYTES,
            })));
        }
        Ok(Some(Ok(buf)))
    }

    fn skip_rest_of_line(&mut self) -> Result<(), MigrationError> {
        loop {
            let available = self.reader.fill_buf().map_err(transport_io(&self.path))?;
            if available.is_empty() {
                return Ok(());
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    self.reader.consume(pos + 1);
                    return Ok(());
                }
                None => {
                    let len = available.len();
                    self.reader.consume(len);
                }
            }
        }
    }

    /// Next decodable entry. Malformed lines are counted and skipped; only
    /// stream I/O failures are returned as errors.
    pub fn next_entry(&mut self) -> Result<Option<TransportEntry>, MigrationError> {
        loop {
            let line = match self.pending.take() {
                Some(line) => Ok(line),
                None => match self.read_line()? {
                    Some(line) => line,
                    None => return Ok(None),
                },
            };
            let decoded = line.and_then(|line| {
                if line.iter().all(u8::is_ascii_whitespace) {
                    return Ok(None);
                }
                decode_line(&line)
            });
            match decoded {
                Ok(Some(Decoded::Entry(entry))) => {
                    self.stats.entries += 1;
                    return Ok(Some(entry));
                }
                Ok(Some(Decoded::Ignored(line_type))) => {
                    debug!(line = self.stats.lines, %line_type, "Ignoring transport line of unknown type");
                    self.stats.ignored += 1;
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(line = self.stats.lines, %error, "Skipping malformed transport line");
                    self.stats.decode_errors += 1;
                }
            }
        }
    }
}

impl Iterator for TransportReader {
    type Item = Result<TransportEntry, MigrationError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

fn transport_io(path: &Path) -> impl Fn(io::Error) -> MigrationError + '_ {
    move |source| MigrationError::TransportIo {
        path: path.to_path_buf(),
        source,
    }
}

enum Decoded {
    Entry(TransportEntry),
    Ignored(String),
}

fn decode_line(line: &[u8]) -> Result<Option<Decoded>, RecordDecodeError> {
    let mut value: Value = serde_json::from_slice(line)?;
    let line_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(RecordDecodeError::MissingType)?
        .to_string();
    let data = value.get_mut("data").map(Value::take).unwrap_or(Value::Null);

    let entry = match line_type.as_str() {
        "block" if data.get("kind").is_some() => TransportEntry::Record(decode_record(data)?),
        "block" => TransportEntry::RpcBlock(RpcBlock::from_value(data)?),
        "state" => TransportEntry::Record(decode_record(data)?),
        _ => return Ok(Some(Decoded::Ignored(line_type))),
    };
    Ok(Some(Decoded::Entry(entry)))
}

fn decode_record(data: Value) -> Result<LedgerRecord, RecordDecodeError> {
    let record: LedgerRecord = serde_json::from_value(data)?;
    record.validate()?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::LedgerRecordKind;
    use serde_json::json;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn body_record(number: u64) -> TransportEntry {
        TransportEntry::Record(LedgerRecord {
            kind: LedgerRecordKind::Body,
            block_number: Some(number),
            block_hash: Some(H256::from_low_u64_be(number)),
            payload: vec![0xc0],
        })
    }

    fn collect(reader: &mut TransportReader) -> Vec<TransportEntry> {
        reader.by_ref().map(|entry| entry.unwrap()).collect()
    }

    #[test]
    fn compression_follows_path_suffix() {
        assert_eq!(
            Compression::from_path_hint(Path::new("chain.jsonl.gz")),
            Compression::Gzip
        );
        assert_eq!(
            Compression::from_path_hint(Path::new("chain.jsonl")),
            Compression::None
        );
        assert_eq!(
            Compression::from_path_hint(Path::new("chain.gzip")),
            Compression::None
        );
    }

    #[test]
    fn gzip_file_is_read_back_with_metadata() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("out/chain.jsonl.gz");

        let mut writer = TransportWriter::create(&path, Compression::Gzip).unwrap();
        writer
            .write_metadata(&ExportMetadata::new("store:/data/chaindata", 0, Some(2)))
            .unwrap();
        for n in 0..3 {
            writer.write_entry(&body_record(n)).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), 4);

        let mut reader = TransportReader::open(&path).unwrap();
        let metadata = reader.metadata().unwrap().clone();
        assert_eq!(metadata.format_version, FORMAT_VERSION);
        assert_eq!(metadata.end_block, Some(2));
        assert!(chrono::DateTime::parse_from_rfc3339(&metadata.export_timestamp).is_ok());
        assert_eq!(collect(&mut reader), vec![body_record(0), body_record(1), body_record(2)]);
    }

    #[test]
    fn metadata_uses_wire_field_names() {
        let json = serde_json::to_value(ExportMetadata::new("rpc:http://node", 5, Some(9))).unwrap();
        assert_eq!(json["version"], "1.0.0");
        assert_eq!(json["source"], "rpc:http://node");
        assert_eq!(json["startBlock"], 5);
        assert_eq!(json["endBlock"], 9);
        assert!(json.get("type").is_none());
    }

    #[test]
    fn malformed_lines_are_counted_and_skipped() {
        let mut input = String::from("{\"version\":\"1.0.0\",\"exportTime\":\"2024-01-01T00:00:00Z\",\"source\":\"x\",\"startBlock\":0}\n");
        input.push_str(&serde_json::to_string(&json!({"type": "block", "data": {"kind": "body", "blockNumber": 1, "payload": "0xc0"}})).unwrap());
        input.push('\n');
        input.push_str("{not json\n");
        // Number-keyed record without a block number.
        input.push_str("{\"type\":\"block\",\"data\":{\"kind\":\"header\",\"payload\":\"0x00\"}}\n");
        input.push_str("{\"type\":\"block\",\"data\":{\"kind\":\"body\",\"blockNumber\":2,\"payload\":\"0xzz\"}}\n");
        input.push_str("{\"type\":\"receipt-log\",\"data\":{}}\n");
        input.push('\n');
        input.push_str("{\"type\":\"state\",\"data\":{\"kind\":\"accountTrieNode\",\"blockHash\":\"0x0000000000000000000000000000000000000000000000000000000000000001\",\"payload\":\"0x01\"}}\n");

        let mut reader = TransportReader::new(Cursor::new(input.into_bytes())).unwrap();
        let entries = collect(&mut reader);
        assert_eq!(entries.len(), 2);
        assert!(entries[1].is_state());

        let stats = reader.stats();
        assert_eq!(stats.decode_errors, 3);
        assert_eq!(stats.ignored, 1);
        assert_eq!(stats.entries, 2);
    }

    #[test]
    fn stream_without_metadata_starts_with_data() {
        let line = json!({"type": "block", "data": {"number": "0x10", "hash": null, "transactions": []}});
        let mut reader =
            TransportReader::new(Cursor::new(format!("{line}\n").into_bytes())).unwrap();
        assert!(reader.metadata().is_none());

        let entries = collect(&mut reader);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].block_number(), Some(16));
    }

    #[test]
    fn overlong_line_is_a_decode_error() {
        let mut input = vec![b' '; MAX_LINE_BYTES + 10];
        input.push(b'\n');
        input.extend_from_slice(
            format!(
                "{}\n",
                json!({"type": "block", "data": {"kind": "body", "blockNumber": 7, "payload": "0x"}})
            )
            .as_bytes(),
        );
        let mut reader = TransportReader::new(Cursor::new(input)).unwrap();
        let entries = collect(&mut reader);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].block_number(), Some(7));
        assert_eq!(reader.stats().decode_errors, 1);
    }

    #[test]
    fn rpc_block_exposes_raw_transactions() {
        let block = RpcBlock::from_value(json!({
            "number": "0x2a",
            "hash": format!("0x{}", "ab".repeat(32)),
            "transactions": [{"raw": "0x02f8"}, {"hash": "0x01"}]
        }))
        .unwrap();
        assert_eq!(block.number, 42);
        assert_eq!(block.hash, Some(H256::repeat_byte(0xab)));
        assert_eq!(block.raw_transactions(), vec!["0x02f8"]);

        assert!(matches!(
            RpcBlock::from_value(json!({"hash": null})),
            Err(RecordDecodeError::InvalidRpcBlock { field: "number" })
        ));
    }
}
