//! Artifact value model: an ordered collection of named blobs plus a
//! description record, with "fetched" (blob bytes resident) and "unfetched"
//! (metadata only, materializable from disk) states.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{CacheServerError, CacheServerResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRecord {
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Description {
    pub adding_chain: String,
    pub receiving_chain: String,
}

impl Description {
    /// Append `server_id` to the adding chain. Straight append, no dedup --
    /// the source never deduplicates repeated hops either.
    pub fn append_adding(&mut self, server_id: &str) {
        append_chain(&mut self.adding_chain, server_id);
    }

    pub fn append_receiving(&mut self, server_id: &str) {
        append_chain(&mut self.receiving_chain, server_id);
    }
}

fn append_chain(chain: &mut String, server_id: &str) {
    if chain.is_empty() {
        chain.push_str(server_id);
    } else {
        chain.push(',');
        chain.push_str(server_id);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ValueMetadata {
    blob_names: Vec<String>,
    description: Description,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireValue {
    blob_names: Vec<String>,
    blob_data: Vec<Vec<u8>>,
    description: Description,
}

#[derive(Debug, Clone)]
enum ValueBody {
    Fetched(Vec<BlobRecord>),
    Unfetched,
}

/// A cached artifact: named blobs plus a description, either fully resident
/// ("fetched") or known only by size and blob names ("unfetched").
#[derive(Debug, Clone)]
pub struct CachedItemValue {
    metadata: ValueMetadata,
    body: ValueBody,
    size: u64,
}

impl CachedItemValue {
    pub fn new(blobs: Vec<BlobRecord>, description: Description) -> CacheServerResult<Self> {
        let metadata = ValueMetadata {
            blob_names: blobs.iter().map(|b| b.name.clone()).collect(),
            description,
        };
        let wire = WireValue {
            blob_names: metadata.blob_names.clone(),
            blob_data: blobs.iter().map(|b| b.data.clone()).collect(),
            description: metadata.description.clone(),
        };
        let size = bincode::serialize(&wire)?.len() as u64;
        Ok(Self {
            metadata,
            body: ValueBody::Fetched(blobs),
            size,
        })
    }

    /// Construct an unfetched value from snapshot metadata: blob names and
    /// description are known, but blob bytes are not yet read from disk.
    pub fn new_unfetched(blob_names: Vec<String>, description: Description, size: u64) -> Self {
        Self {
            metadata: ValueMetadata {
                blob_names,
                description,
            },
            body: ValueBody::Unfetched,
            size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.blob_names.is_empty()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_fetched(&self) -> bool {
        matches!(self.body, ValueBody::Fetched(_))
    }

    pub fn blob_names(&self) -> &[String] {
        &self.metadata.blob_names
    }

    pub fn description(&self) -> &Description {
        &self.metadata.description
    }

    pub fn description_mut(&mut self) -> &mut Description {
        &mut self.metadata.description
    }

    pub fn blobs(&self) -> Option<&[BlobRecord]> {
        match &self.body {
            ValueBody::Fetched(blobs) => Some(blobs),
            ValueBody::Unfetched => None,
        }
    }

    /// Serialize the full wire/disk representation: blob names, blob bytes,
    /// and the description. Requires the value to be fetched.
    pub fn serialize_wire(&self) -> CacheServerResult<Vec<u8>> {
        let blobs = match &self.body {
            ValueBody::Fetched(blobs) => blobs,
            ValueBody::Unfetched => {
                return Err(CacheServerError::Protocol(
                    "cannot serialize an unfetched value".into(),
                ))
            }
        };
        let wire = WireValue {
            blob_names: self.metadata.blob_names.clone(),
            blob_data: blobs.iter().map(|b| b.data.clone()).collect(),
            description: self.metadata.description.clone(),
        };
        Ok(bincode::serialize(&wire)?)
    }

    pub fn deserialize_wire(bytes: &[u8]) -> CacheServerResult<Self> {
        let wire: WireValue = bincode::deserialize(bytes)?;
        if wire.blob_names.len() != wire.blob_data.len() {
            return Err(CacheServerError::Protocol(
                "blob name/data count mismatch".into(),
            ));
        }
        let blobs: Vec<BlobRecord> = wire
            .blob_names
            .iter()
            .cloned()
            .zip(wire.blob_data.into_iter())
            .map(|(name, data)| BlobRecord { name, data })
            .collect();
        let size = bytes.len() as u64;
        Ok(Self {
            metadata: ValueMetadata {
                blob_names: wire.blob_names,
                description: wire.description,
            },
            body: ValueBody::Fetched(blobs),
            size,
        })
    }

    /// Write every blob to its own file inside `dir`, creating it if needed.
    pub fn write_blobs_to(&self, dir: &Path) -> CacheServerResult<()> {
        let blobs = match &self.body {
            ValueBody::Fetched(blobs) => blobs,
            ValueBody::Unfetched => {
                return Err(CacheServerError::Protocol(
                    "cannot write an unfetched value to disk".into(),
                ))
            }
        };
        std::fs::create_dir_all(dir)?;
        for blob in blobs {
            std::fs::write(dir.join(&blob.name), &blob.data)?;
        }
        Ok(())
    }

    /// Read blob bytes from `dir` back into memory, moving this value from
    /// "unfetched" to "fetched".
    pub fn materialize_from(&mut self, dir: &Path) -> std::io::Result<()> {
        let mut blobs = Vec::with_capacity(self.metadata.blob_names.len());
        for name in &self.metadata.blob_names {
            let data = std::fs::read(dir.join(name))?;
            blobs.push(BlobRecord {
                name: name.clone(),
                data,
            });
        }
        self.body = ValueBody::Fetched(blobs);
        Ok(())
    }

    /// Drop resident blob bytes, reverting to the "unfetched" state. Size and
    /// blob names are preserved.
    pub fn unfetch(&mut self) {
        self.body = ValueBody::Unfetched;
    }
}
