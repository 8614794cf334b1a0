//! Fixed-endian framing primitives over a duplex byte stream.
//!
//! Every primitive is big-endian, matching the wire's `i32` length prefixes.
//! Readers/writers are free functions over `AsyncRead`/`AsyncWrite` rather
//! than methods on a connection type, mirroring how the protocol helpers in
//! the teacher's message layer are written.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::db::record::{RecordVersion, Rid};
use crate::errors::{DispatchError, Error};

/// Negative string/byte-array length means "null" on the wire.
const NULL_LENGTH: i32 = -1;

pub async fn read_byte<S>(stream: &mut S) -> Result<u8, Error>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 1];
    stream.read_exact(&mut buf).await?;
    Ok(buf[0])
}

pub async fn read_short<S>(stream: &mut S) -> Result<i16, Error>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;
    Ok(i16::from_be_bytes(buf))
}

pub async fn read_int<S>(stream: &mut S) -> Result<i32, Error>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;
    Ok(i32::from_be_bytes(buf))
}

pub async fn read_long<S>(stream: &mut S) -> Result<i64, Error>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8];
    stream.read_exact(&mut buf).await?;
    Ok(i64::from_be_bytes(buf))
}

/// Length-prefixed byte array. A negative length yields `None`.
pub async fn read_bytes<S>(stream: &mut S) -> Result<Option<Vec<u8>>, Error>
where
    S: AsyncRead + Unpin,
{
    let len = read_int(stream).await?;
    if len == NULL_LENGTH {
        return Ok(None);
    }
    if len < 0 {
        return Err(DispatchError::MalformedBody(format!("negative byte-array length {len}")).into());
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Length-prefixed UTF-8 string. A negative length yields `None`.
pub async fn read_string<S>(stream: &mut S) -> Result<Option<String>, Error>
where
    S: AsyncRead + Unpin,
{
    match read_bytes(stream).await? {
        None => Ok(None),
        Some(bytes) => String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| DispatchError::MalformedBody(format!("invalid utf-8 string: {e}")).into()),
    }
}

/// `(i16 clusterId, i64 clusterPosition)`. `clusterPosition` is a fixed 8
/// bytes, matching the `i64` representation chosen in `db::record::Rid`.
pub async fn read_rid<S>(stream: &mut S) -> Result<Rid, Error>
where
    S: AsyncRead + Unpin,
{
    let cluster_id = read_short(stream).await?;
    let cluster_position = read_long(stream).await?;
    Ok(Rid::new(cluster_id, cluster_position))
}

/// A version field: `-1` (untracked) and values `<= -2` encode tombstone
/// markers as `-(version+2)`; this mirrors the sentinel ranges used by
/// every version-sensitive opcode.
pub async fn read_version<S>(stream: &mut S) -> Result<RecordVersion, Error>
where
    S: AsyncRead + Unpin,
{
    let raw = read_int(stream).await?;
    Ok(decode_version(raw))
}

pub fn decode_version(raw: i32) -> RecordVersion {
    match raw {
        -1 => RecordVersion::Untracked,
        v if v < -1 => RecordVersion::Tombstone((-(v + 2)) as u64),
        v => RecordVersion::Tracked(v as u64),
    }
}

pub fn encode_version(version: RecordVersion) -> i32 {
    match version {
        RecordVersion::Untracked => -1,
        RecordVersion::Tracked(v) => v as i32,
        RecordVersion::Tombstone(v) => -(v as i32) - 2,
    }
}

pub async fn write_byte<S>(stream: &mut S, value: u8) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&[value]).await?;
    Ok(())
}

pub async fn write_short<S>(stream: &mut S, value: i16) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&value.to_be_bytes()).await?;
    Ok(())
}

pub async fn write_int<S>(stream: &mut S, value: i32) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&value.to_be_bytes()).await?;
    Ok(())
}

pub async fn write_long<S>(stream: &mut S, value: i64) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&value.to_be_bytes()).await?;
    Ok(())
}

pub async fn write_bytes<S>(stream: &mut S, value: Option<&[u8]>) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    match value {
        None => write_int(stream, NULL_LENGTH).await,
        Some(bytes) => {
            write_int(stream, bytes.len() as i32).await?;
            stream.write_all(bytes).await?;
            Ok(())
        }
    }
}

pub async fn write_string<S>(stream: &mut S, value: Option<&str>) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    write_bytes(stream, value.map(|s| s.as_bytes())).await
}

pub async fn write_rid<S>(stream: &mut S, rid: Rid) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    write_short(stream, rid.cluster_id).await?;
    write_long(stream, rid.cluster_position).await?;
    Ok(())
}

pub async fn write_version<S>(stream: &mut S, version: RecordVersion) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    write_int(stream, encode_version(version)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_round_trips() {
        for version in [
            RecordVersion::Untracked,
            RecordVersion::Tracked(0),
            RecordVersion::Tracked(42),
            RecordVersion::Tombstone(0),
            RecordVersion::Tombstone(7),
        ] {
            assert_eq!(decode_version(encode_version(version)), version);
        }
    }

    #[tokio::test]
    async fn string_round_trips_through_a_cursor() {
        let mut buf = Vec::new();
        write_string(&mut buf, Some("hello")).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let read = read_string(&mut cursor).await.unwrap();
        assert_eq!(read.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn null_string_round_trips_as_none() {
        let mut buf = Vec::new();
        write_string(&mut buf, None).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let read = read_string(&mut cursor).await.unwrap();
        assert_eq!(read, None);
    }

    #[tokio::test]
    async fn rid_round_trips() {
        let mut buf = Vec::new();
        let rid = Rid::new(9, 123456789);
        write_rid(&mut buf, rid).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let read = read_rid(&mut cursor).await.unwrap();
        assert_eq!(read, rid);
    }

    #[tokio::test]
    async fn negative_byte_array_length_below_null_sentinel_is_malformed() {
        let mut buf = Vec::new();
        write_int(&mut buf, -5).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_bytes(&mut cursor).await.unwrap_err();
        assert!(matches!(err, Error::Dispatch(DispatchError::MalformedBody(_))));
    }
}
