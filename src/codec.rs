//! Payload Codec
//!
//! Framed binary encoding for values stored in coordination nodes.
//!
//! ```text
//! offset 0   u8      format version
//! offset 1   u8      flags (bit 0: body is LZ4 compressed, size prepended)
//! offset 2   u32 LE  CRC32 of the stored body
//! offset 6   ...     body (bincode)
//! ```
//!
//! Enable and sync replication states are not framed: they are stored as a
//! single byte.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::peer::{PeerConfig, PeerEnableState, QueuePosition, SyncReplicationState};

/// Current payload format version
pub const FORMAT_VERSION: u8 = 1;

/// Flag: body is LZ4 compressed
pub const FLAG_LZ4: u8 = 0b0000_0001;

/// Header size in bytes
pub const HEADER_SIZE: usize = 6;

/// Bodies above this size are compressed
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Payload decoding errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("payload truncated: {len} bytes, need at least {min}")]
    Truncated { len: usize, min: usize },

    #[error("unknown payload format version {0}")]
    UnknownVersion(u8),

    #[error("unknown payload flags {0:#04x}")]
    UnknownFlags(u8),

    #[error("payload checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("payload decompression failed: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),

    #[error("payload body malformed: {0}")]
    Malformed(#[from] bincode::Error),

    #[error("invalid {kind} state: expected 1 byte, got {bytes:?}")]
    InvalidState { kind: &'static str, bytes: Vec<u8> },
}

/// Encode any serializable record into a framed payload
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, CodecError> {
    let serialized = bincode::serialize(value)?;

    let (flags, body) = if serialized.len() > COMPRESSION_THRESHOLD {
        (FLAG_LZ4, lz4_flex::compress_prepend_size(&serialized))
    } else {
        (0, serialized)
    };

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
    buf.put_u8(FORMAT_VERSION);
    buf.put_u8(flags);
    buf.put_u32_le(crc32fast::hash(&body));
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Decode a framed payload
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    if bytes.len() < HEADER_SIZE {
        return Err(CodecError::Truncated {
            len: bytes.len(),
            min: HEADER_SIZE,
        });
    }

    let version = bytes[0];
    if version != FORMAT_VERSION {
        return Err(CodecError::UnknownVersion(version));
    }

    let flags = bytes[1];
    if flags & !FLAG_LZ4 != 0 {
        return Err(CodecError::UnknownFlags(flags));
    }

    let stored = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
    let body = &bytes[HEADER_SIZE..];
    let computed = crc32fast::hash(body);
    if stored != computed {
        return Err(CodecError::ChecksumMismatch { stored, computed });
    }

    if flags & FLAG_LZ4 != 0 {
        let decompressed = lz4_flex::decompress_size_prepended(body)?;
        Ok(bincode::deserialize(&decompressed)?)
    } else {
        Ok(bincode::deserialize(body)?)
    }
}

/// Encode a peer config
pub fn encode_config(config: &PeerConfig) -> Result<Bytes, CodecError> {
    encode(config)
}

/// Decode a peer config
pub fn decode_config(bytes: &[u8]) -> Result<PeerConfig, CodecError> {
    decode(bytes)
}

pub fn encode_queue_position(position: &QueuePosition) -> Result<Bytes, CodecError> {
    encode(position)
}

pub fn decode_queue_position(bytes: &[u8]) -> Result<QueuePosition, CodecError> {
    decode(bytes)
}

pub fn encode_enable_state(state: PeerEnableState) -> Bytes {
    Bytes::copy_from_slice(&[state.to_byte()])
}

pub fn decode_enable_state(bytes: &[u8]) -> Result<PeerEnableState, CodecError> {
    match bytes {
        [b] => PeerEnableState::from_byte(*b),
        _ => None,
    }
    .ok_or_else(|| CodecError::InvalidState {
        kind: "peer",
        bytes: bytes.to_vec(),
    })
}

pub fn encode_sync_state(state: SyncReplicationState) -> Bytes {
    Bytes::copy_from_slice(&[state.to_byte()])
}

pub fn decode_sync_state(bytes: &[u8]) -> Result<SyncReplicationState, CodecError> {
    match bytes {
        [b] => SyncReplicationState::from_byte(*b),
        _ => None,
    }
    .ok_or_else(|| CodecError::InvalidState {
        kind: "sync replication",
        bytes: bytes.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> PeerConfig {
        PeerConfig::new("zk1,zk2,zk3:2181:/hbase")
            .replicate_all_except(
                vec!["audit".to_string()],
                vec![("default:users".to_string(), vec!["secret".to_string()])],
            )
            .with_bandwidth(10 * 1024 * 1024)
            .with_serial(true)
            .with_remote_wal_dir("hdfs://backup/remoteWALs")
            .with_configuration("hbase.replication.source.ratio", "0.5")
    }

    #[test]
    fn test_config_roundtrip() {
        let config = sample_config();
        let bytes = encode_config(&config).unwrap();
        assert_eq!(bytes[0], FORMAT_VERSION);
        assert_eq!(bytes[1] & FLAG_LZ4, 0);
        assert_eq!(decode_config(&bytes).unwrap(), config);
    }

    #[test]
    fn test_large_config_is_compressed() {
        let mut config = sample_config();
        for i in 0..200 {
            config
                .configuration
                .insert(format!("endpoint.option.{}", i), "x".repeat(32));
        }
        config.peer_data.insert(b"blob".to_vec(), vec![7u8; 4096]);

        let bytes = encode_config(&config).unwrap();
        assert_eq!(bytes[1] & FLAG_LZ4, FLAG_LZ4);
        assert_eq!(decode_config(&bytes).unwrap(), config);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut bytes = encode_config(&sample_config()).unwrap().to_vec();
        bytes[0] = 2;
        assert!(matches!(
            decode_config(&bytes),
            Err(CodecError::UnknownVersion(2))
        ));
    }

    #[test]
    fn test_corruption_detected() {
        let mut bytes = encode_config(&sample_config()).unwrap().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(
            decode_config(&bytes),
            Err(CodecError::ChecksumMismatch { .. })
        ));

        assert!(matches!(
            decode_config(&[FORMAT_VERSION, 0]),
            Err(CodecError::Truncated { len: 2, .. })
        ));

        let mut bytes = encode_config(&sample_config()).unwrap().to_vec();
        bytes[1] = 0x80;
        assert!(matches!(
            decode_config(&bytes),
            Err(CodecError::UnknownFlags(0x80))
        ));
    }

    #[test]
    fn test_state_bytes() {
        assert_eq!(
            decode_enable_state(&encode_enable_state(PeerEnableState::Disabled)).unwrap(),
            PeerEnableState::Disabled
        );
        assert!(decode_enable_state(&[]).is_err());
        assert!(decode_enable_state(&[1, 1]).is_err());
        assert!(decode_sync_state(&[9]).is_err());
        assert_eq!(
            decode_sync_state(&encode_sync_state(SyncReplicationState::Standby)).unwrap(),
            SyncReplicationState::Standby
        );
    }

    #[test]
    fn test_queue_position_roundtrip() {
        let position = QueuePosition::new("rs1%2C16020%2C1700000000000.1700000012345", 8_192);
        let bytes = encode_queue_position(&position).unwrap();
        assert_eq!(decode_queue_position(&bytes).unwrap(), position);
    }
}
