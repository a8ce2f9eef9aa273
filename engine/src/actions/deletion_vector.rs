//! Deletion vectors: per-file soft-delete bitmaps.
//!
//! The serialized form is a 64-bit roaring treemap (little-endian `u64`
//! bucket count followed by `(u32 high key, 32-bit roaring bitmap)` pairs),
//! which is exactly the on-disk layout `RoaringTreemap` serializes. Vectors
//! are stored inline in the descriptor (Z85 text) or in sidecar files named
//! by UUID at the table root.

use roaring::RoaringTreemap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DeltaResult, Error};
use crate::storage::StorageBackend;

/// Recognized sidecar header magic. Files may prefix the bitmap with
/// `[magic u32][size u32][checksum u32]`, all little-endian; the store skips
/// it when present and trusts the descriptor's `sizeInBytes` either way.
const DV_HEADER_MAGIC: u32 = 1_681_511_377;
const DV_HEADER_LEN: usize = 12;

/// Where the serialized bitmap lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageType {
    /// Sidecar file named by the UUID in `pathOrInlineDv` (Z85-encoded)
    #[serde(rename = "u")]
    Uuid,
    /// Bitmap bytes Z85-encoded directly into `pathOrInlineDv`
    #[serde(rename = "i")]
    Inline,
    /// `pathOrInlineDv` is an absolute path
    #[serde(rename = "p")]
    Path,
}

/// Descriptor attached to an `add` action, naming the rows deleted from that
/// file. Effective rows of the file are `all_rows \ bitmap`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionVectorDescriptor {
    pub storage_type: StorageType,
    pub path_or_inline_dv: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i32>,
    pub size_in_bytes: i32,
    pub cardinality: i64,
}

impl DeletionVectorDescriptor {
    pub(crate) fn validate(&self) -> DeltaResult<()> {
        if self.path_or_inline_dv.is_empty() {
            return Err(Error::invalid_deletion_vector("pathOrInlineDv is empty"));
        }
        if self.size_in_bytes < 0 {
            return Err(Error::invalid_deletion_vector("sizeInBytes is negative"));
        }
        if self.cardinality < 0 {
            return Err(Error::invalid_deletion_vector("cardinality is negative"));
        }
        if matches!(self.offset, Some(offset) if offset < 0) {
            return Err(Error::invalid_deletion_vector("offset is negative"));
        }
        if self.storage_type == StorageType::Uuid {
            decode_uuid(&self.path_or_inline_dv)?;
        }
        Ok(())
    }

    /// The table-root-relative (or absolute, for `p`) path of the sidecar
    /// file, if the bitmap is not inline.
    pub fn sidecar_path(&self) -> DeltaResult<Option<String>> {
        match self.storage_type {
            StorageType::Inline => Ok(None),
            StorageType::Path => Ok(Some(self.path_or_inline_dv.clone())),
            StorageType::Uuid => {
                let uuid = decode_uuid(&self.path_or_inline_dv)?;
                Ok(Some(format!("deletion_vector_{uuid}.bin")))
            }
        }
    }

    /// Read, verify, and parse the bitmap this descriptor names.
    pub async fn load(&self, storage: &dyn StorageBackend) -> DeltaResult<RoaringTreemap> {
        let payload = match self.storage_type {
            StorageType::Inline => z85::decode(&self.path_or_inline_dv).map_err(|e| {
                Error::invalid_deletion_vector(format!("inline payload is not Z85: {e}"))
            })?,
            _ => {
                let path = self.sidecar_path()?.ok_or_else(|| {
                    Error::invalid_deletion_vector("descriptor names no sidecar file")
                })?;
                let bytes = storage.read(&path).await?;
                strip_header(&bytes).to_vec()
            }
        };
        let expected = self.size_in_bytes as usize;
        let payload = payload.get(offset_of(self.offset)..).ok_or_else(|| {
            Error::storage("deletion vector offset is beyond the file", false)
        })?;
        if payload.len() < expected {
            return Err(Error::storage(
                format!(
                    "deletion vector payload is {} bytes, descriptor says {expected}",
                    payload.len()
                ),
                false,
            ));
        }
        let bitmap = RoaringTreemap::deserialize_from(&payload[..expected])
            .map_err(|e| Error::invalid_deletion_vector(format!("bitmap parse failed: {e}")))?;
        if bitmap.len() != self.cardinality as u64 {
            return Err(Error::invalid_deletion_vector(format!(
                "descriptor cardinality {} does not match bitmap cardinality {}",
                self.cardinality,
                bitmap.len()
            )));
        }
        Ok(bitmap)
    }
}

fn offset_of(offset: Option<i32>) -> usize {
    offset.unwrap_or(0).max(0) as usize
}

fn strip_header(bytes: &[u8]) -> &[u8] {
    if bytes.len() >= DV_HEADER_LEN {
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic == DV_HEADER_MAGIC {
            return &bytes[DV_HEADER_LEN..];
        }
    }
    bytes
}

/// Encode a UUID as 20 characters of Z85.
pub fn encode_uuid(uuid: &Uuid) -> String {
    z85::encode(uuid.as_bytes())
}

/// Decode 20 characters of Z85 into a UUID, rendered canonically on display.
pub fn decode_uuid(encoded: &str) -> DeltaResult<Uuid> {
    let bytes = z85::decode(encoded)
        .map_err(|e| Error::invalid_deletion_vector(format!("not valid Z85: {e}")))?;
    Uuid::from_slice(&bytes)
        .map_err(|_| Error::invalid_deletion_vector("Z85 payload is not 16 bytes"))
}

fn serialize_bitmap(bitmap: &RoaringTreemap) -> DeltaResult<Vec<u8>> {
    let mut bytes = Vec::with_capacity(bitmap.serialized_size());
    bitmap
        .serialize_into(&mut bytes)
        .map_err(|e| Error::invalid_deletion_vector(format!("bitmap serialize failed: {e}")))?;
    Ok(bytes)
}

/// Build an inline descriptor for a bitmap.
pub fn inline_descriptor(bitmap: &RoaringTreemap) -> DeltaResult<DeletionVectorDescriptor> {
    let bytes = serialize_bitmap(bitmap)?;
    Ok(DeletionVectorDescriptor {
        storage_type: StorageType::Inline,
        size_in_bytes: bytes.len() as i32,
        path_or_inline_dv: z85_pad_encode(&bytes),
        offset: None,
        cardinality: bitmap.len() as i64,
    })
}

// Z85 requires input length to be a multiple of 4; the treemap layout already
// is (8-byte count, 4-byte keys, bitmap containers are 4-aligned), so this is
// an invariant check rather than padding.
fn z85_pad_encode(bytes: &[u8]) -> String {
    debug_assert!(bytes.len() % 4 == 0);
    z85::encode(bytes)
}

/// Persist a bitmap as a sidecar file under the table root and return the
/// descriptor plus the path written (for failure cleanup).
pub async fn write_deletion_vector(
    storage: &dyn StorageBackend,
    bitmap: &RoaringTreemap,
) -> DeltaResult<(DeletionVectorDescriptor, String)> {
    let bytes = serialize_bitmap(bitmap)?;
    let uuid = Uuid::new_v4();
    let path = format!("deletion_vector_{uuid}.bin");
    storage.write(&path, bytes.clone().into()).await?;
    let descriptor = DeletionVectorDescriptor {
        storage_type: StorageType::Uuid,
        path_or_inline_dv: encode_uuid(&uuid),
        offset: None,
        size_in_bytes: bytes.len() as i32,
        cardinality: bitmap.len() as i64,
    };
    Ok((descriptor, path))
}

/// Union `new_deletes` into the bitmap named by `existing` (or an empty one)
/// and return the merged treemap.
pub async fn merge_deletes(
    storage: &dyn StorageBackend,
    existing: Option<&DeletionVectorDescriptor>,
    new_deletes: impl IntoIterator<Item = u64>,
) -> DeltaResult<RoaringTreemap> {
    let mut bitmap = match existing {
        Some(descriptor) => descriptor.load(storage).await?,
        None => RoaringTreemap::new(),
    };
    for row in new_deletes {
        bitmap.insert(row);
    }
    Ok(bitmap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory_backend;

    fn bitmap_of(rows: &[u64]) -> RoaringTreemap {
        rows.iter().copied().collect()
    }

    #[test]
    fn uuid_z85_round_trip() {
        let uuid = Uuid::new_v4();
        let encoded = encode_uuid(&uuid);
        assert_eq!(encoded.len(), 20);
        assert_eq!(decode_uuid(&encoded).unwrap(), uuid);
        assert!(decode_uuid("not z85!").is_err());
    }

    #[tokio::test]
    async fn inline_round_trip() {
        let bitmap = bitmap_of(&[0, 5, 49, 1 << 40]);
        let descriptor = inline_descriptor(&bitmap).unwrap();
        assert_eq!(descriptor.cardinality, 4);
        let storage = memory_backend();
        let loaded = descriptor.load(storage.as_ref()).await.unwrap();
        assert_eq!(loaded, bitmap);
    }

    #[tokio::test]
    async fn sidecar_round_trip_and_cardinality_check() {
        let storage = memory_backend();
        let bitmap = bitmap_of(&[1, 2, 3]);
        let (descriptor, path) = write_deletion_vector(storage.as_ref(), &bitmap)
            .await
            .unwrap();
        assert!(path.starts_with("deletion_vector_"));
        assert_eq!(descriptor.sidecar_path().unwrap().as_deref(), Some(path.as_str()));
        let loaded = descriptor.load(storage.as_ref()).await.unwrap();
        assert_eq!(loaded.len(), descriptor.cardinality as u64);

        // corrupt cardinality is detected
        let mut tampered = descriptor.clone();
        tampered.cardinality = 7;
        assert!(matches!(
            tampered.load(storage.as_ref()).await,
            Err(Error::InvalidDeletionVector(_))
        ));
    }

    #[tokio::test]
    async fn header_is_tolerated() {
        let storage = memory_backend();
        let bitmap = bitmap_of(&[9, 10]);
        let payload = serialize_bitmap(&bitmap).unwrap();
        let mut framed = DV_HEADER_MAGIC.to_le_bytes().to_vec();
        framed.extend((payload.len() as u32).to_le_bytes());
        framed.extend(0u32.to_le_bytes());
        framed.extend(&payload);
        storage.write("deletion_vector_framed.bin", framed.into()).await.unwrap();

        let descriptor = DeletionVectorDescriptor {
            storage_type: StorageType::Path,
            path_or_inline_dv: "deletion_vector_framed.bin".to_string(),
            offset: None,
            size_in_bytes: payload.len() as i32,
            cardinality: 2,
        };
        let loaded = descriptor.load(storage.as_ref()).await.unwrap();
        assert_eq!(loaded, bitmap);
    }

    #[tokio::test]
    async fn merge_unions_rows() {
        let storage = memory_backend();
        let (descriptor, _) = write_deletion_vector(storage.as_ref(), &bitmap_of(&[1]))
            .await
            .unwrap();
        let merged = merge_deletes(storage.as_ref(), Some(&descriptor), [2, 3])
            .await
            .unwrap();
        assert_eq!(merged, bitmap_of(&[1, 2, 3]));
        let fresh = merge_deletes(storage.as_ref(), None, [49]).await.unwrap();
        assert_eq!(fresh, bitmap_of(&[49]));
    }
}
