//! Delimited source loading and JSON snapshot persistence for tabsync.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use csv::StringRecord;
use encoding_rs::Encoding;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use sha2::{Digest, Sha256};
use tabsync_core::Record;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tabsync-storage";

/// Column order of a headerless source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLayout {
    /// `id, name, description`
    IdNameDescription,
    /// `name, id`; rows carry no description.
    NameId,
}

impl SourceLayout {
    pub fn field_count(self) -> usize {
        match self {
            SourceLayout::IdNameDescription => 3,
            SourceLayout::NameId => 2,
        }
    }

    fn id_index(self) -> usize {
        match self {
            SourceLayout::IdNameDescription => 0,
            SourceLayout::NameId => 1,
        }
    }

    fn name_index(self) -> usize {
        match self {
            SourceLayout::IdNameDescription => 1,
            SourceLayout::NameId => 0,
        }
    }

    fn description_index(self) -> Option<usize> {
        match self {
            SourceLayout::IdNameDescription => Some(2),
            SourceLayout::NameId => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub path: PathBuf,
    /// WHATWG encoding label, e.g. `utf-8` or `cp1251`.
    pub encoding: String,
    pub delimiter: u8,
    pub layout: SourceLayout,
}

impl SourceSpec {
    pub fn new(
        path: impl Into<PathBuf>,
        encoding: impl Into<String>,
        delimiter: u8,
        layout: SourceLayout,
    ) -> Self {
        Self {
            path: path.into(),
            encoding: encoding.into(),
            delimiter,
            layout,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown text encoding label `{0}`")]
    UnknownEncoding(String),
    #[error("{} is not valid {encoding} text", path.display())]
    Encoding { path: PathBuf, encoding: &'static str },
    #[error("{}:{line}: expected {expected} fields, found {found}", path.display())]
    FieldCount {
        path: PathBuf,
        line: u64,
        expected: usize,
        found: usize,
    },
    #[error("{}:{line}: empty `id` cell", path.display())]
    MissingId { path: PathBuf, line: u64 },
    #[error("parsing {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Read one headerless delimited file into records, all cells kept as raw text.
pub async fn load_source(spec: &SourceSpec) -> Result<Vec<Record>, ReadError> {
    let encoding = Encoding::for_label(spec.encoding.as_bytes())
        .ok_or_else(|| ReadError::UnknownEncoding(spec.encoding.clone()))?;
    let bytes = fs::read(&spec.path).await.map_err(|source| ReadError::Io {
        path: spec.path.clone(),
        source,
    })?;
    let text = decode_strict(encoding, &bytes).ok_or_else(|| ReadError::Encoding {
        path: spec.path.clone(),
        encoding: encoding.name(),
    })?;

    let records = parse_delimited(spec, &text)?;
    info!(
        path = %spec.path.display(),
        encoding = encoding.name(),
        rows = records.len(),
        "loaded source file"
    );
    Ok(records)
}

fn decode_strict<'a>(encoding: &'static Encoding, bytes: &'a [u8]) -> Option<Cow<'a, str>> {
    let body = match Encoding::for_bom(bytes) {
        Some((bom_encoding, bom_len)) if bom_encoding == encoding => &bytes[bom_len..],
        _ => bytes,
    };
    encoding.decode_without_bom_handling_and_without_replacement(body)
}

fn parse_delimited(spec: &SourceSpec, text: &str) -> Result<Vec<Record>, ReadError> {
    let layout = spec.layout;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(spec.delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|source| ReadError::Csv {
            path: spec.path.clone(),
            source,
        })?;
        let line = row.position().map(|p| p.line()).unwrap_or_default();

        if row.len() != layout.field_count() {
            return Err(ReadError::FieldCount {
                path: spec.path.clone(),
                line,
                expected: layout.field_count(),
                found: row.len(),
            });
        }

        let id = cell(&row, layout.id_index()).ok_or_else(|| ReadError::MissingId {
            path: spec.path.clone(),
            line,
        })?;

        records.push(Record {
            id: id.to_string(),
            // An empty name is still a row; it loads as empty text.
            name: row.get(layout.name_index()).unwrap_or_default().to_string(),
            description: layout
                .description_index()
                .and_then(|index| cell(&row, index))
                .map(str::to_string),
        });
    }

    debug!(path = %spec.path.display(), rows = records.len(), "parsed delimited rows");
    Ok(records)
}

/// Empty cells are treated as missing values.
fn cell(row: &StringRecord, index: usize) -> Option<&str> {
    row.get(index).filter(|value| !value.is_empty())
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("serializing snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("reading snapshot {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing snapshot {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotReceipt {
    pub path: PathBuf,
    pub rows: usize,
    pub bytes: usize,
    pub sha256: String,
}

/// JSON array-of-objects snapshot of the merged table at a fixed path.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Pretty JSON with a four-space indent; non-ASCII text is written as-is.
    pub fn encode(rows: &[Record]) -> Result<Vec<u8>, WriteError> {
        let mut buf = Vec::new();
        let mut serializer =
            serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"    "));
        rows.serialize(&mut serializer)?;
        Ok(buf)
    }

    /// Replace the snapshot through a temp file and rename in the same directory.
    ///
    /// The parent directory must already exist.
    pub async fn write(&self, rows: &[Record]) -> Result<SnapshotReceipt, WriteError> {
        let bytes = Self::encode(rows)?;
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        if let Err(err) = write_new_file(&temp_path, &bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        if let Err(source) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(WriteError::Io {
                action: "renaming snapshot into place at",
                path: self.path.clone(),
                source,
            });
        }

        let receipt = SnapshotReceipt {
            path: self.path.clone(),
            rows: rows.len(),
            bytes: bytes.len(),
            sha256: Self::sha256_hex(&bytes),
        };
        info!(
            path = %receipt.path.display(),
            rows = receipt.rows,
            bytes = receipt.bytes,
            sha256 = %receipt.sha256,
            "wrote snapshot"
        );
        Ok(receipt)
    }

    /// Load the snapshot back, every field as text.
    pub async fn read(&self) -> Result<Vec<Record>, ParseError> {
        let bytes = fs::read(&self.path).await.map_err(|source| ParseError::Io {
            path: self.path.clone(),
            source,
        })?;
        let rows: Vec<Record> =
            serde_json::from_slice(&bytes).map_err(|source| ParseError::Json {
                path: self.path.clone(),
                source,
            })?;
        info!(path = %self.path.display(), rows = rows.len(), "read snapshot");
        Ok(rows)
    }
}

async fn write_new_file(path: &Path, bytes: &[u8]) -> Result<(), WriteError> {
    let io_err = |action: &'static str| {
        let path = path.to_path_buf();
        move |source: std::io::Error| WriteError::Io {
            action,
            path,
            source,
        }
    };

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
        .map_err(io_err("opening temp snapshot"))?;
    file.write_all(bytes)
        .await
        .map_err(io_err("writing temp snapshot"))?;
    file.flush()
        .await
        .map_err(io_err("flushing temp snapshot"))?;
    Ok(())
}
