//! Byte-level codecs shared by storage cell names and messaging payloads. All
//! integers are big-endian and strings are `u16`-length-prefixed UTF-8.

use crate::membership::Endpoint;
use crate::messaging::VERSION_12;
use crate::storage::{CellName, ColumnFamily, DeletionTime, Modification, Mutation};
use std::io::{self, Read, Write};
use thiserror::Error;

const END_OF_COMPONENT: u8 = 0x00;

const MODIFICATION_WRITE: u8 = 0;
const MODIFICATION_TOMBSTONE: u8 = 1;
const MODIFICATION_RANGE: u8 = 2;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("unexpected end of payload")]
    Truncated,
    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,
    #[error("{what} of {len} bytes exceeds the u16 length prefix")]
    TooLong { what: &'static str, len: usize },
    #[error("unknown modification tag {0:#x}")]
    UnknownModification(u8),
    #[error("{what} requires protocol version {required}, peer speaks {version}")]
    UnsupportedForVersion {
        what: &'static str,
        required: i32,
        version: i32,
    },
    #[error("address of {0} bytes is neither IPv4 nor IPv6")]
    BadEndpoint(usize),
    #[error("negative {0} count")]
    NegativeCount(&'static str),
}

/// Encodes a composite cell name: per component a `u16` length, the bytes and
/// an end-of-component byte.
pub fn encode_composite(name: &CellName) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    for component in name.components() {
        write_short_bytes(&mut buf, component.as_bytes(), "composite component")?;
        buf.write_all(&[END_OF_COMPONENT])?;
    }
    Ok(buf)
}

pub fn decode_composite(mut bytes: &[u8]) -> Result<CellName, CodecError> {
    let mut components = Vec::new();
    while !bytes.is_empty() {
        let raw = read_short_bytes(&mut bytes)?;
        let component = String::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)?;
        let mut eoc = [0u8; 1];
        read_exact(&mut bytes, &mut eoc)?;
        components.push(component);
    }
    Ok(CellName::new(components))
}

pub fn encode_mutation(mutation: &Mutation, version: i32) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    write_mutation(&mut buf, mutation, version)?;
    Ok(buf)
}

pub fn decode_mutation(mut bytes: &[u8], version: i32) -> Result<Mutation, CodecError> {
    read_mutation(&mut bytes, version)
}

/// DEFINITIONS_UPDATE payload: an `i32` count followed by the mutations.
pub fn encode_definitions(mutations: &[Mutation], version: i32) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    buf.write_all(&(mutations.len() as i32).to_be_bytes())?;
    for mutation in mutations {
        write_mutation(&mut buf, mutation, version)?;
    }
    Ok(buf)
}

pub fn decode_definitions(mut bytes: &[u8], version: i32) -> Result<Vec<Mutation>, CodecError> {
    let count = read_count(&mut bytes, "definition")?;
    let mut mutations = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        mutations.push(read_mutation(&mut bytes, version)?);
    }
    Ok(mutations)
}

/// `forward-to` parameter: an `i32` count, then per entry a compact address
/// (`u8` length + raw bytes) and the request id the relay must reuse.
pub fn encode_forward_to(entries: &[(Endpoint, String)]) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    buf.write_all(&(entries.len() as i32).to_be_bytes())?;
    for (endpoint, id) in entries {
        let octets = endpoint.octets();
        buf.write_all(&[octets.len() as u8])?;
        buf.write_all(&octets)?;
        write_string(&mut buf, id)?;
    }
    Ok(buf)
}

pub fn decode_forward_to(mut bytes: &[u8]) -> Result<Vec<(Endpoint, String)>, CodecError> {
    let count = read_count(&mut bytes, "forward-to")?;
    let mut entries = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let mut len = [0u8; 1];
        read_exact(&mut bytes, &mut len)?;
        let mut octets = vec![0u8; len[0] as usize];
        read_exact(&mut bytes, &mut octets)?;
        let endpoint = endpoint_from_bytes(&octets)?;
        entries.push((endpoint, read_string(&mut bytes)?));
    }
    Ok(entries)
}

/// `forward-from` parameter: the raw address bytes of the coordinator.
pub fn endpoint_bytes(endpoint: &Endpoint) -> Vec<u8> {
    endpoint.octets()
}

pub fn endpoint_from_bytes(bytes: &[u8]) -> Result<Endpoint, CodecError> {
    Endpoint::from_octets(bytes).ok_or(CodecError::BadEndpoint(bytes.len()))
}

fn write_mutation(buf: &mut Vec<u8>, mutation: &Mutation, version: i32) -> Result<(), CodecError> {
    write_string(buf, mutation.keyspace())?;
    write_short_bytes(buf, mutation.key(), "partition key")?;
    let families: Vec<&ColumnFamily> = mutation.families().collect();
    buf.write_all(&(families.len() as i32).to_be_bytes())?;
    for family in families {
        write_string(buf, family.table())?;
        buf.write_all(&(family.modifications().len() as i32).to_be_bytes())?;
        for modification in family.modifications() {
            write_modification(buf, modification, version)?;
        }
    }
    Ok(())
}

fn write_modification(
    buf: &mut Vec<u8>,
    modification: &Modification,
    version: i32,
) -> Result<(), CodecError> {
    match modification {
        Modification::Write {
            name,
            value,
            timestamp,
        } => {
            buf.write_all(&[MODIFICATION_WRITE])?;
            write_short_bytes(buf, &encode_composite(name)?, "cell name")?;
            buf.write_all(&timestamp.to_be_bytes())?;
            buf.write_all(&(value.len() as i32).to_be_bytes())?;
            buf.write_all(value)?;
        }
        Modification::Tombstone { name, deletion } => {
            buf.write_all(&[MODIFICATION_TOMBSTONE])?;
            write_short_bytes(buf, &encode_composite(name)?, "cell name")?;
            write_deletion(buf, deletion)?;
        }
        Modification::RangeDelete { prefix, deletion } => {
            if !prefix.is_empty() && version < VERSION_12 {
                return Err(CodecError::UnsupportedForVersion {
                    what: "range tombstone",
                    required: VERSION_12,
                    version,
                });
            }
            buf.write_all(&[MODIFICATION_RANGE])?;
            write_short_bytes(buf, &encode_composite(prefix)?, "range prefix")?;
            write_deletion(buf, deletion)?;
        }
    }
    Ok(())
}

fn write_deletion(buf: &mut Vec<u8>, deletion: &DeletionTime) -> Result<(), CodecError> {
    buf.write_all(&deletion.marked_for_delete_at.to_be_bytes())?;
    buf.write_all(&deletion.local_deletion_time.to_be_bytes())?;
    Ok(())
}

fn read_mutation(bytes: &mut &[u8], version: i32) -> Result<Mutation, CodecError> {
    let keyspace = read_string(bytes)?;
    let key = read_short_bytes(bytes)?;
    let mut mutation = Mutation::new(keyspace, key);
    let tables = read_count(bytes, "table")?;
    for _ in 0..tables {
        let table = read_string(bytes)?;
        let modifications = read_count(bytes, "modification")?;
        let family = mutation.add_or_get(&table);
        for _ in 0..modifications {
            family.push(read_modification(bytes, version)?);
        }
    }
    Ok(mutation)
}

fn read_modification(bytes: &mut &[u8], version: i32) -> Result<Modification, CodecError> {
    let mut tag = [0u8; 1];
    read_exact(bytes, &mut tag)?;
    let name = decode_composite(&read_short_bytes(bytes)?)?;
    Ok(match tag[0] {
        MODIFICATION_WRITE => {
            let timestamp = read_i64(bytes)?;
            let len = read_count(bytes, "value byte")?;
            if bytes.len() < len {
                return Err(CodecError::Truncated);
            }
            let (head, tail) = bytes.split_at(len);
            *bytes = tail;
            Modification::Write {
                name,
                value: head.to_vec(),
                timestamp,
            }
        }
        MODIFICATION_TOMBSTONE => Modification::Tombstone {
            name,
            deletion: read_deletion(bytes)?,
        },
        MODIFICATION_RANGE => {
            if !name.is_empty() && version < VERSION_12 {
                return Err(CodecError::UnsupportedForVersion {
                    what: "range tombstone",
                    required: VERSION_12,
                    version,
                });
            }
            Modification::RangeDelete {
                prefix: name,
                deletion: read_deletion(bytes)?,
            }
        }
        other => return Err(CodecError::UnknownModification(other)),
    })
}

fn read_deletion(bytes: &mut &[u8]) -> Result<DeletionTime, CodecError> {
    let marked_for_delete_at = read_i64(bytes)?;
    let mut ldt = [0u8; 4];
    read_exact(bytes, &mut ldt)?;
    Ok(DeletionTime::new(marked_for_delete_at, i32::from_be_bytes(ldt)))
}

fn write_string(buf: &mut Vec<u8>, value: &str) -> Result<(), CodecError> {
    write_short_bytes(buf, value.as_bytes(), "string")
}

fn write_short_bytes(buf: &mut Vec<u8>, value: &[u8], what: &'static str) -> Result<(), CodecError> {
    if value.len() > u16::MAX as usize {
        return Err(CodecError::TooLong {
            what,
            len: value.len(),
        });
    }
    buf.write_all(&(value.len() as u16).to_be_bytes())?;
    buf.write_all(value)?;
    Ok(())
}

fn read_string(bytes: &mut &[u8]) -> Result<String, CodecError> {
    String::from_utf8(read_short_bytes(bytes)?).map_err(|_| CodecError::InvalidUtf8)
}

fn read_short_bytes(bytes: &mut &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut len = [0u8; 2];
    read_exact(bytes, &mut len)?;
    let len = u16::from_be_bytes(len) as usize;
    if bytes.len() < len {
        return Err(CodecError::Truncated);
    }
    let (head, tail) = bytes.split_at(len);
    *bytes = tail;
    Ok(head.to_vec())
}

fn read_count(bytes: &mut &[u8], what: &'static str) -> Result<usize, CodecError> {
    let mut raw = [0u8; 4];
    read_exact(bytes, &mut raw)?;
    let count = i32::from_be_bytes(raw);
    if count < 0 {
        return Err(CodecError::NegativeCount(what));
    }
    Ok(count as usize)
}

fn read_i64(bytes: &mut &[u8]) -> Result<i64, CodecError> {
    let mut raw = [0u8; 8];
    read_exact(bytes, &mut raw)?;
    Ok(i64::from_be_bytes(raw))
}

fn read_exact(bytes: &mut &[u8], out: &mut [u8]) -> Result<(), CodecError> {
    bytes.read_exact(out).map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof => CodecError::Truncated,
        _ => CodecError::Io(err),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{CURRENT_VERSION, VERSION_11};

    #[test]
    fn composite_layout_is_length_bytes_eoc() {
        let encoded = encode_composite(&CellName::new(["ab", ""])).unwrap();
        assert_eq!(encoded, vec![0, 2, b'a', b'b', 0, 0, 0, 0]);
        assert_eq!(
            decode_composite(&encoded).unwrap(),
            CellName::new(["ab", ""])
        );
        assert!(encode_composite(&CellName::empty()).unwrap().is_empty());
    }

    #[test]
    fn mutation_survives_the_wire_with_every_modification_kind() {
        let mut mutation = Mutation::new("system_metadata", "ks.t");
        let family = mutation.add_or_get("log");
        family.add_column(CellName::new(["1", "alice", "a_ks", "value"]), "v", 42);
        family.add_tombstone(CellName::new(["1", "alice", "a_ks", ""]), DeletionTime::new(43, 7));
        family.delete_range(CellName::new(["2"]), DeletionTime::new(44, 8));
        let encoded = encode_mutation(&mutation, CURRENT_VERSION).unwrap();
        assert_eq!(decode_mutation(&encoded, CURRENT_VERSION).unwrap(), mutation);
    }

    #[test]
    fn range_tombstones_need_version_12() {
        let mut mutation = Mutation::new("system", "ks");
        mutation
            .add_or_get("schema_columnfamilies")
            .delete_range(CellName::new(["t"]), DeletionTime::new(1, 1));
        let err = encode_mutation(&mutation, VERSION_11).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedForVersion { .. }));

        let mut partition = Mutation::new("system", "ks");
        partition
            .add_or_get("schema_keyspaces")
            .delete_partition(DeletionTime::new(1, 1));
        assert!(encode_mutation(&partition, VERSION_11).is_ok());
    }

    #[test]
    fn forward_to_encodes_compact_addresses() {
        let entries = vec![
            (Endpoint::v4(10, 0, 0, 3), "17".to_string()),
            (Endpoint::v4(10, 0, 0, 4), "18".to_string()),
        ];
        let encoded = encode_forward_to(&entries).unwrap();
        assert_eq!(&encoded[..5], &[0, 0, 0, 2, 4]);
        assert_eq!(decode_forward_to(&encoded).unwrap(), entries);
    }

    #[test]
    fn truncated_payloads_are_rejected() {
        let mut mutation = Mutation::new("ks", "k");
        mutation
            .add_or_get("t")
            .add_column(CellName::new(["c"]), "value", 1);
        let encoded = encode_mutation(&mutation, CURRENT_VERSION).unwrap();
        let err = decode_mutation(&encoded[..encoded.len() - 2], CURRENT_VERSION).unwrap_err();
        assert!(matches!(err, CodecError::Truncated));
        assert!(matches!(
            endpoint_from_bytes(&[1, 2]),
            Err(CodecError::BadEndpoint(2))
        ));
    }
}
