//! Snapshot wire format.
//!
//! A snapshot is a 2-byte little-endian length followed by exactly that many
//! bytes of a JSON object mapping keys to values:
//!
//! ```text
//! +---------+---------------------------+
//! | len: u16 LE | JSON {"key":"value",..} |
//! +---------+---------------------------+
//! ```
//!
//! The 16-bit length caps a snapshot at 65,535 payload bytes. Larger states are
//! rejected when the snapshot is encoded; they are never truncated.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use thiserror::Error;

/// Largest payload the length prefix can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

const PREFIX_LEN: usize = 2;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot payload is {len} bytes, limit is {max}", max = MAX_PAYLOAD_LEN)]
    Capacity { len: usize },
    #[error("failed to serialize snapshot payload: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to write snapshot: {0}")]
    Write(#[source] io::Error),
    #[error("snapshot truncated: {0}")]
    Truncated(#[source] io::Error),
    #[error("failed to read snapshot: {0}")]
    Read(#[source] io::Error),
    #[error("snapshot carries bytes past its declared {declared}-byte payload")]
    TrailingBytes { declared: usize },
    #[error("failed to decode snapshot payload: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Frames an already-serialized payload with its length prefix.
pub fn frame(payload: &[u8]) -> Result<Vec<u8>, SnapshotError> {
    let len = u16::try_from(payload.len()).map_err(|_| SnapshotError::Capacity {
        len: payload.len(),
    })?;
    let mut buf = Vec::with_capacity(PREFIX_LEN + payload.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Serializes a key-value mapping into a complete snapshot frame.
pub fn encode(contents: &BTreeMap<String, String>) -> Result<Vec<u8>, SnapshotError> {
    let payload = serde_json::to_vec(contents).map_err(SnapshotError::Encode)?;
    frame(&payload)
}

/// Writes a snapshot of `contents` to `writer`.
///
/// Prefix and payload are assembled first and written with a single
/// `write_all`, so a failure anywhere leaves the caller with an error and no
/// partially-valid snapshot to mistake for a good one.
pub fn write_to<W: Write + ?Sized>(
    writer: &mut W,
    contents: &BTreeMap<String, String>,
) -> Result<(), SnapshotError> {
    let buf = encode(contents)?;
    writer.write_all(&buf).map_err(SnapshotError::Write)?;
    writer.flush().map_err(SnapshotError::Write)
}

/// Reads one snapshot frame and returns its payload bytes.
///
/// The reader must hold exactly one frame: short reads and trailing bytes
/// are both errors.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>, SnapshotError> {
    let mut prefix = [0u8; PREFIX_LEN];
    reader.read_exact(&mut prefix).map_err(classify_read)?;
    let declared = u16::from_le_bytes(prefix) as usize;

    let mut payload = vec![0u8; declared];
    reader.read_exact(&mut payload).map_err(classify_read)?;

    let mut extra = [0u8; 1];
    loop {
        match reader.read(&mut extra) {
            Ok(0) => break,
            Ok(_) => return Err(SnapshotError::TrailingBytes { declared }),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(SnapshotError::Read(err)),
        }
    }
    Ok(payload)
}

/// Reads and decodes a full snapshot.
pub fn read_from<R: Read + ?Sized>(
    reader: &mut R,
) -> Result<BTreeMap<String, String>, SnapshotError> {
    let payload = read_frame(reader)?;
    serde_json::from_slice(&payload).map_err(SnapshotError::Decode)
}

fn classify_read(err: io::Error) -> SnapshotError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        SnapshotError::Truncated(err)
    } else {
        SnapshotError::Read(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Builds a single-entry map whose JSON form is exactly `len` bytes.
    fn map_with_payload_len(len: usize) -> BTreeMap<String, String> {
        // {"k":"<value>"} is 8 bytes of framing around the value.
        let mut map = BTreeMap::new();
        map.insert("k".to_string(), "v".repeat(len - 8));
        map
    }

    #[test]
    fn roundtrip_preserves_contents() {
        let mut map = BTreeMap::new();
        map.insert("alpha".to_string(), "1".to_string());
        map.insert("beta".to_string(), "with \"quotes\" and ünïcode".to_string());

        let bytes = encode(&map).unwrap();
        let restored = read_from(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(restored, map);
    }

    #[test]
    fn prefix_is_little_endian_payload_length() {
        let map = map_with_payload_len(300);
        let bytes = encode(&map).unwrap();
        assert_eq!(&bytes[..2], &300u16.to_le_bytes());
        assert_eq!(bytes.len(), 302);
    }

    #[test]
    fn payload_at_limit_is_accepted() {
        let map = map_with_payload_len(MAX_PAYLOAD_LEN);
        let bytes = encode(&map).unwrap();
        assert_eq!(bytes.len(), MAX_PAYLOAD_LEN + 2);
        assert_eq!(read_from(&mut Cursor::new(bytes)).unwrap(), map);
    }

    #[test]
    fn payload_over_limit_is_rejected_at_encode_time() {
        let map = map_with_payload_len(MAX_PAYLOAD_LEN + 1);
        let err = encode(&map).unwrap_err();
        assert!(matches!(err, SnapshotError::Capacity { len } if len == MAX_PAYLOAD_LEN + 1));

        let mut sink = Vec::new();
        assert!(write_to(&mut sink, &map).is_err());
        assert!(sink.is_empty(), "nothing may be written for an oversized snapshot");
    }

    #[test]
    fn truncated_prefix_and_payload_are_rejected() {
        assert!(matches!(
            read_frame(&mut Cursor::new(vec![5u8])),
            Err(SnapshotError::Truncated(_))
        ));

        let mut short = 10u16.to_le_bytes().to_vec();
        short.extend_from_slice(b"{}");
        assert!(matches!(
            read_frame(&mut Cursor::new(short)),
            Err(SnapshotError::Truncated(_))
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = encode(&BTreeMap::new()).unwrap();
        bytes.push(b'!');
        assert!(matches!(
            read_frame(&mut Cursor::new(bytes)),
            Err(SnapshotError::TrailingBytes { declared: 2 })
        ));
    }

    #[test]
    fn undecodable_payload_is_rejected() {
        let bytes = frame(b"[1,2,3]").unwrap();
        assert!(matches!(
            read_from(&mut Cursor::new(bytes)),
            Err(SnapshotError::Decode(_))
        ));
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_failure_fails_the_snapshot() {
        let err = write_to(&mut FailingWriter, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, SnapshotError::Write(_)));
    }
}
