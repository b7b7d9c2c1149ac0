//! Detector frames and the binary frame sub-protocol.
//!
//! During a direct-transfer exposure the server pushes each image on the command
//! connection as a 12-byte little-endian header `(byte_length, rows, columns)`
//! followed by `byte_length` bytes of 32-bit little-endian pixels. The client answers
//! every frame, and every "no frame" marker, with a single `\n`.
//!
//! In file-transfer mode the same pixel layout is written by the server to
//! `burst_<burst>_image_<n>.bin` files, read by [`read_frame_file`].

use crate::error::FrameError;
use crate::protocol::Connection;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite};

/// Size of the binary frame header.
pub const FRAME_HEADER_LEN: usize = 12;

/// First byte of a text result; seen in place of a header when no frame follows.
pub const RESULT_MARKER: u8 = b'*';

/// Largest frame payload accepted from the server (256 MiB).
pub const MAX_FRAME_LEN: u32 = 256 << 20;

const ACK: &[u8] = b"\n";

/// Pixel width delivered to the frame sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum PixelDepth {
    /// 16-bit pixels, narrowed from the 32-bit wire values.
    #[default]
    Bits16,
    /// Wire values as received.
    Bits32,
}

impl TryFrom<u32> for PixelDepth {
    type Error = String;

    fn try_from(bits: u32) -> Result<Self, Self::Error> {
        PixelDepth::from_bits(bits)
            .ok_or_else(|| format!("unsupported pixel depth {bits}, expected 16 or 32"))
    }
}

impl From<PixelDepth> for u32 {
    fn from(depth: PixelDepth) -> Self {
        depth.bits()
    }
}

impl PixelDepth {
    /// 16 or 32.
    pub fn bits(self) -> u32 {
        match self {
            PixelDepth::Bits16 => 16,
            PixelDepth::Bits32 => 32,
        }
    }

    /// 16 or 32; anything else is `None`.
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            16 => Some(PixelDepth::Bits16),
            32 => Some(PixelDepth::Bits32),
            _ => None,
        }
    }
}

/// Decoded binary frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length; 0 means no frame.
    pub byte_length: u32,
    /// Image height.
    pub rows: u32,
    /// Image width.
    pub columns: u32,
}

impl FrameHeader {
    /// Decode three little-endian `u32` words.
    pub fn from_le_bytes(raw: &[u8; FRAME_HEADER_LEN]) -> Self {
        let word = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Self {
            byte_length: word(0),
            rows: word(4),
            columns: word(8),
        }
    }

    /// Encode as sent on the wire.
    pub fn to_le_bytes(self) -> [u8; FRAME_HEADER_LEN] {
        let mut raw = [0u8; FRAME_HEADER_LEN];
        raw[0..4].copy_from_slice(&self.byte_length.to_le_bytes());
        raw[4..8].copy_from_slice(&self.rows.to_le_bytes());
        raw[8..12].copy_from_slice(&self.columns.to_le_bytes());
        raw
    }

    fn pixel_count(&self) -> u64 {
        u64::from(self.rows) * u64::from(self.columns)
    }

    /// Reject headers whose payload length disagrees with the image size or exceeds
    /// [`MAX_FRAME_LEN`].
    pub fn validate(&self) -> Result<(), FrameError> {
        if u64::from(self.byte_length) != self.pixel_count() * 4 {
            return Err(FrameError::SizeMismatch {
                byte_length: self.byte_length,
                rows: self.rows,
                columns: self.columns,
            });
        }
        if self.byte_length > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge {
                byte_length: self.byte_length,
                limit: MAX_FRAME_LEN,
            });
        }
        Ok(())
    }
}

/// Metadata published with every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameDescriptor {
    /// Index of the frame within its exposure, starting at 0.
    pub sequence_number: u64,
    /// Columns.
    pub width: u32,
    /// Rows.
    pub height: u32,
    /// 16 or 32.
    pub bit_depth: u32,
}

/// Pixel storage in the requested width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PixelData {
    /// Narrowed to the low 16 bits.
    U16(Vec<u16>),
    /// Full wire values.
    U32(Vec<u32>),
}

impl PixelData {
    /// Number of pixels.
    pub fn len(&self) -> usize {
        match self {
            PixelData::U16(v) => v.len(),
            PixelData::U32(v) => v.len(),
        }
    }

    /// True when there are no pixels.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pixel value at `index`, widened to `u32`.
    pub fn get(&self, index: usize) -> Option<u32> {
        match self {
            PixelData::U16(v) => v.get(index).map(|&p| u32::from(p)),
            PixelData::U32(v) => v.get(index).copied(),
        }
    }
}

/// A complete detector image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sequence number and geometry.
    pub descriptor: FrameDescriptor,
    /// Row-major pixel values.
    pub pixels: PixelData,
}

impl Frame {
    /// Pixel at (x, y), row-major.
    pub fn get(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.descriptor.width || y >= self.descriptor.height {
            return None;
        }
        let index = y as usize * self.descriptor.width as usize + x as usize;
        self.pixels.get(index)
    }
}

/// Keep the low 16 bits of a wire pixel.
#[inline]
pub fn narrow(value: u32) -> u16 {
    (value & 0xFFFF) as u16
}

/// Decode little-endian 32-bit pixels into the requested width.
///
/// Trailing bytes that do not form a whole pixel are ignored.
pub fn decode_pixels(raw: &[u8], depth: PixelDepth) -> PixelData {
    let wire = raw
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]));
    match depth {
        PixelDepth::Bits16 => PixelData::U16(wire.map(narrow).collect()),
        PixelDepth::Bits32 => PixelData::U32(wire.collect()),
    }
}

async fn acknowledge<S>(conn: &mut Connection<S>) -> Result<(), FrameError>
where
    S: AsyncWrite + Unpin,
{
    conn.write_all(ACK).await.map_err(FrameError::AckFailed)
}

/// Receive one frame from the connection.
///
/// Returns [`FrameError::NoFrame`] when the server signals the end of the exposure,
/// either with a zero-length header or by sending a text result where a header was
/// expected. In the latter case the result is left unread for the completion-code read.
/// Exactly one acknowledgement is written per call that gets past the header.
///
/// The header is validated before any payload is read or buffered; an invalid header
/// is acknowledged and fails with its payload left unread.
pub async fn pull_frame<S>(
    conn: &mut Connection<S>,
    depth: PixelDepth,
    sequence_number: u64,
) -> Result<Frame, FrameError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut raw = [0u8; FRAME_HEADER_LEN];
    conn.read_exact_into(&mut raw[..1])
        .await
        .map_err(FrameError::HeaderReadFailed)?;

    // Byte lengths are multiples of 4, so a real header never starts with `*`.
    if raw[0] == RESULT_MARKER {
        conn.unread(&raw[..1]);
        acknowledge(conn).await?;
        tracing::debug!("Result marker in place of frame header");
        return Err(FrameError::NoFrame);
    }

    conn.read_exact_into(&mut raw[1..])
        .await
        .map_err(FrameError::HeaderReadFailed)?;
    let header = FrameHeader::from_le_bytes(&raw);

    if header.byte_length == 0 {
        acknowledge(conn).await?;
        tracing::debug!(rows = header.rows, columns = header.columns, "Empty frame header");
        return Err(FrameError::NoFrame);
    }

    if let Err(e) = header.validate() {
        acknowledge(conn).await?;
        return Err(e);
    }

    let mut payload = vec![0u8; header.byte_length as usize];
    conn.read_exact_into(&mut payload)
        .await
        .map_err(FrameError::PayloadReadFailed)?;
    acknowledge(conn).await?;

    let frame = build_frame(header, &payload, depth, sequence_number);
    tracing::trace!(
        sequence_number,
        rows = header.rows,
        columns = header.columns,
        "Frame received"
    );
    Ok(frame)
}

fn build_frame(
    header: FrameHeader,
    payload: &[u8],
    depth: PixelDepth,
    sequence_number: u64,
) -> Frame {
    Frame {
        descriptor: FrameDescriptor {
            sequence_number,
            width: header.columns,
            height: header.rows,
            bit_depth: depth.bits(),
        },
        pixels: decode_pixels(payload, depth),
    }
}

/// Path of the file the server writes for frame `index` of `burst`.
pub fn frame_file_path(dir: &Path, burst: u64, index: u64) -> PathBuf {
    dir.join(format!("burst_{burst}_image_{index}.bin"))
}

/// True when `name` is a frame file of `burst`.
pub fn is_burst_file(name: &str, burst: u64) -> bool {
    name.strip_prefix("burst_")
        .and_then(|rest| rest.split_once('_'))
        .is_some_and(|(number, _)| number == burst.to_string())
}

/// Decode a frame file of `rows` x `columns` 32-bit pixels.
///
/// Returns `Ok(None)` when the file is still shorter than a full image.
pub async fn read_frame_file(
    path: &Path,
    rows: u32,
    columns: u32,
    depth: PixelDepth,
    sequence_number: u64,
) -> Result<Option<Frame>, FrameError> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|source| FrameError::FileReadFailed {
            path: path.display().to_string(),
            source,
        })?;

    let expected = u64::from(rows) * u64::from(columns) * 4;
    if (raw.len() as u64) < expected {
        return Ok(None);
    }

    let header = FrameHeader {
        byte_length: expected as u32,
        rows,
        columns,
    };
    Ok(Some(build_frame(
        header,
        &raw[..expected as usize],
        depth,
        sequence_number,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn wire_frame(rows: u32, columns: u32, pixels: &[u32]) -> Vec<u8> {
        let header = FrameHeader {
            byte_length: (pixels.len() * 4) as u32,
            rows,
            columns,
        };
        let mut out = header.to_le_bytes().to_vec();
        for p in pixels {
            out.extend_from_slice(&p.to_le_bytes());
        }
        out
    }

    #[test]
    fn narrowing_keeps_low_bits() {
        for value in [0u32, 1, 0xFFFF, 0x1_0000, 0x1_2345, u32::MAX] {
            assert_eq!(u32::from(narrow(value)), value & 0xFFFF);
        }
    }

    #[tokio::test]
    async fn empty_header_is_no_frame_with_one_ack() {
        let (mut server, client) = tokio::io::duplex(256);
        let mut conn = Connection::new(client);

        let header = FrameHeader {
            byte_length: 0,
            rows: 120,
            columns: 80,
        };
        server.write_all(&header.to_le_bytes()).await.unwrap();

        let err = pull_frame(&mut conn, PixelDepth::Bits16, 0)
            .await
            .unwrap_err();
        assert!(err.is_no_frame());

        drop(conn);
        let mut acks = Vec::new();
        server.read_to_end(&mut acks).await.unwrap();
        assert_eq!(acks, b"\n");
    }

    #[tokio::test]
    async fn result_marker_is_left_for_the_caller() {
        let (mut server, client) = tokio::io::duplex(256);
        let mut conn = Connection::new(client);
        server.write_all(b"*0\n").await.unwrap();

        let err = pull_frame(&mut conn, PixelDepth::Bits32, 4)
            .await
            .unwrap_err();
        assert!(err.is_no_frame());
        assert_eq!(conn.read_line(16).await.unwrap(), b"*0");
    }

    #[tokio::test]
    async fn frame_is_decoded_and_acknowledged() {
        let (mut server, client) = tokio::io::duplex(1024);
        let mut conn = Connection::new(client);
        server
            .write_all(&wire_frame(2, 3, &[1, 2, 3, 0x1_0004, 5, 0xABCD_0006]))
            .await
            .unwrap();

        let frame = pull_frame(&mut conn, PixelDepth::Bits16, 7).await.unwrap();
        assert_eq!(frame.descriptor.sequence_number, 7);
        assert_eq!(frame.descriptor.width, 3);
        assert_eq!(frame.descriptor.height, 2);
        assert_eq!(frame.descriptor.bit_depth, 16);
        assert_eq!(frame.pixels, PixelData::U16(vec![1, 2, 3, 4, 5, 6]));
        assert_eq!(frame.get(2, 1), Some(6));

        assert_eq!(server.read_u8().await.unwrap(), b'\n');
    }

    #[tokio::test]
    async fn size_mismatch_is_still_acknowledged() {
        let (mut server, client) = tokio::io::duplex(1024);
        let mut conn = Connection::new(client);
        server.write_all(&wire_frame(4, 4, &[1, 2, 3])).await.unwrap();

        let err = pull_frame(&mut conn, PixelDepth::Bits32, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::SizeMismatch { rows: 4, .. }));
        assert_eq!(server.read_u8().await.unwrap(), b'\n');
    }

    #[tokio::test]
    async fn oversized_length_fails_without_reading_payload() {
        let (mut server, client) = tokio::io::duplex(256);
        let mut conn = Connection::new(client);
        let header = FrameHeader {
            byte_length: 0xFFFF_FFFC,
            rows: 1,
            columns: 1,
        };
        // No payload follows; reading one would block forever.
        server.write_all(&header.to_le_bytes()).await.unwrap();

        let err = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            pull_frame(&mut conn, PixelDepth::Bits32, 0),
        )
        .await
        .expect("payload read was attempted")
        .unwrap_err();
        assert!(matches!(
            err,
            FrameError::SizeMismatch {
                byte_length: 0xFFFF_FFFC,
                ..
            }
        ));

        drop(conn);
        let mut acks = Vec::new();
        server.read_to_end(&mut acks).await.unwrap();
        assert_eq!(acks, b"\n");
    }

    #[test]
    fn consistent_header_over_limit_is_rejected() {
        let header = FrameHeader {
            byte_length: 1 << 30,
            rows: 1 << 14,
            columns: 1 << 14,
        };
        assert!(matches!(
            header.validate(),
            Err(FrameError::TooLarge { limit: MAX_FRAME_LEN, .. })
        ));

        let header = FrameHeader {
            byte_length: 24,
            rows: 2,
            columns: 3,
        };
        assert!(header.validate().is_ok());
    }

    #[tokio::test]
    async fn frame_files_wait_for_full_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = frame_file_path(dir.path(), 3, 0);
        assert!(path.ends_with("burst_3_image_0.bin"));

        tokio::fs::write(&path, [1u8, 0, 0, 0]).await.unwrap();
        let partial = read_frame_file(&path, 1, 2, PixelDepth::Bits32, 0)
            .await
            .unwrap();
        assert!(partial.is_none());

        tokio::fs::write(&path, [1u8, 0, 0, 0, 2, 0, 1, 0]).await.unwrap();
        let frame = read_frame_file(&path, 1, 2, PixelDepth::Bits32, 0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.pixels, PixelData::U32(vec![1, 0x1_0002]));
    }

    #[test]
    fn burst_file_names() {
        assert!(is_burst_file("burst_12_image_0.bin", 12));
        assert!(!is_burst_file("burst_1_image_0.bin", 12));
        assert!(!is_burst_file("calibration.cfg", 12));
    }
}
