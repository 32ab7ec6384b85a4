//! FLV framing
//!
//! The transcoder reads a plain FLV byte stream: a file header followed by
//! tags, each tag trailed by its total size.
//!
//! ```text
//! +============+==================+==============+==================+
//! | FLV Header | PrevTagSize0 (0) | Tag 1        | PrevTagSize1 ... |
//! | (9 bytes)  | (4 bytes)        | (11+N bytes) | (4 bytes)        |
//! +============+==================+==============+==================+
//! ```
//!
//! Tag header (big-endian):
//! ```text
//! +--------+-------------+-----------+-------------+---------+
//! | Type(1)| DataSize(3) | TS(3+1)   | StreamID(3) | Data(N) |
//! +--------+-------------+-----------+-------------+---------+
//! ```
//! The fourth timestamp byte carries bits 24-31. StreamID is always zero.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::MuxError;

/// FLV file header plus PreviousTagSize0
pub const FLV_HEADER: [u8; 13] = [
    b'F', b'L', b'V', // signature
    0x01, // version
    0x05, // audio + video present
    0x00, 0x00, 0x00, 0x09, // header size
    0x00, 0x00, 0x00, 0x00, // PreviousTagSize0
];

/// Tag header size, also the constant part of PreviousTagSize
pub const TAG_HEADER_SIZE: usize = 11;

/// Size of the trailer following each tag
pub const TAG_TRAILER_SIZE: usize = 4;

/// Largest payload the 24-bit DataSize field can describe
pub const MAX_TAG_DATA_SIZE: usize = 0x00FF_FFFF;

/// FLV tag type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlvTagType {
    Audio,
    Video,
    Script,
}

impl FlvTagType {
    /// Tag type byte
    pub fn code(&self) -> u8 {
        match self {
            FlvTagType::Audio => 8,
            FlvTagType::Video => 9,
            FlvTagType::Script => 18,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            8 => Some(FlvTagType::Audio),
            9 => Some(FlvTagType::Video),
            18 => Some(FlvTagType::Script),
            _ => None,
        }
    }
}

impl std::fmt::Display for FlvTagType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlvTagType::Audio => write!(f, "audio"),
            FlvTagType::Video => write!(f, "video"),
            FlvTagType::Script => write!(f, "script"),
        }
    }
}

/// One media frame as delivered by the ingest side, and as written to the
/// transcoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlvTag {
    /// Tag type
    pub tag_type: FlvTagType,
    /// Timestamp in milliseconds
    pub timestamp: u32,
    /// Raw tag data (including codec headers)
    pub data: Bytes,
}

impl FlvTag {
    pub fn new(tag_type: FlvTagType, timestamp: u32, data: Bytes) -> Self {
        Self {
            tag_type,
            timestamp,
            data,
        }
    }

    /// Create a new video tag
    pub fn video(timestamp: u32, data: Bytes) -> Self {
        Self::new(FlvTagType::Video, timestamp, data)
    }

    /// Create a new audio tag
    pub fn audio(timestamp: u32, data: Bytes) -> Self {
        Self::new(FlvTagType::Audio, timestamp, data)
    }

    /// Create a script data tag (onMetaData and friends)
    pub fn script(timestamp: u32, data: Bytes) -> Self {
        Self::new(FlvTagType::Script, timestamp, data)
    }

    /// Get the size of the tag data
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Size on the wire: header, data and trailer
    pub fn encoded_len(&self) -> usize {
        TAG_HEADER_SIZE + self.data.len() + TAG_TRAILER_SIZE
    }

    /// Append the encoded tag, including its trailer, to `buf`
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), MuxError> {
        encode_tag(buf, self.tag_type, self.timestamp, &self.data)
    }

    /// Decode one tag and its trailer from the front of `buf`
    pub fn decode(buf: &mut Bytes) -> Result<Self, MuxError> {
        ensure_len(buf, TAG_HEADER_SIZE)?;

        let code = buf[0];
        let tag_type = FlvTagType::from_code(code).ok_or(MuxError::UnknownTagType(code))?;
        let data_size = read_u24(&buf[1..4]) as usize;
        ensure_len(buf, TAG_HEADER_SIZE + data_size + TAG_TRAILER_SIZE)?;

        let timestamp = read_u24(&buf[4..7]) | ((buf[7] as u32) << 24);
        buf.advance(TAG_HEADER_SIZE);

        let data = buf.split_to(data_size);
        let trailer = buf.get_u32();
        let expected = (TAG_HEADER_SIZE + data_size) as u32;
        if trailer != expected {
            return Err(MuxError::TrailerMismatch {
                expected,
                actual: trailer,
            });
        }

        Ok(Self {
            tag_type,
            timestamp,
            data,
        })
    }
}

/// Append one encoded tag to `buf`
///
/// Payloads larger than [`MAX_TAG_DATA_SIZE`] are rejected; nothing is
/// written in that case.
pub fn encode_tag(
    buf: &mut BytesMut,
    tag_type: FlvTagType,
    timestamp: u32,
    data: &[u8],
) -> Result<(), MuxError> {
    if data.len() > MAX_TAG_DATA_SIZE {
        return Err(MuxError::PayloadTooLarge(data.len()));
    }
    let data_size = data.len() as u32;

    buf.reserve(TAG_HEADER_SIZE + data.len() + TAG_TRAILER_SIZE);

    buf.put_u8(tag_type.code());
    put_u24(buf, data_size);

    // Lower 24 bits, then the extension byte
    put_u24(buf, timestamp & 0x00FF_FFFF);
    buf.put_u8((timestamp >> 24) as u8);

    // Stream ID
    put_u24(buf, 0);

    buf.put_slice(data);
    buf.put_u32(TAG_HEADER_SIZE as u32 + data_size);

    Ok(())
}

/// Validate and strip the file header (with PreviousTagSize0)
pub fn decode_header(buf: &mut Bytes) -> Result<(), MuxError> {
    ensure_len(buf, FLV_HEADER.len())?;

    if &buf[0..3] != b"FLV" {
        return Err(MuxError::InvalidHeader);
    }
    let header_size = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
    ensure_len(buf, header_size + TAG_TRAILER_SIZE)?;

    buf.advance(header_size);
    let prev = buf.get_u32();
    if prev != 0 {
        return Err(MuxError::TrailerMismatch {
            expected: 0,
            actual: prev,
        });
    }

    Ok(())
}

fn ensure_len(buf: &Bytes, needed: usize) -> Result<(), MuxError> {
    if buf.len() < needed {
        return Err(MuxError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

fn put_u24(buf: &mut BytesMut, value: u32) {
    buf.put_u8((value >> 16) as u8);
    buf.put_u8((value >> 8) as u8);
    buf.put_u8(value as u8);
}

fn read_u24(b: &[u8]) -> u32 {
    ((b[0] as u32) << 16) | ((b[1] as u32) << 8) | (b[2] as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_type_codes() {
        assert_eq!(FlvTagType::Audio.code(), 8);
        assert_eq!(FlvTagType::Video.code(), 9);
        assert_eq!(FlvTagType::Script.code(), 18);

        assert_eq!(FlvTagType::from_code(8), Some(FlvTagType::Audio));
        assert_eq!(FlvTagType::from_code(9), Some(FlvTagType::Video));
        assert_eq!(FlvTagType::from_code(18), Some(FlvTagType::Script));
        assert_eq!(FlvTagType::from_code(0), None);
        assert_eq!(FlvTagType::from_code(10), None);
    }

    #[test]
    fn test_encode_layout() {
        let tag = FlvTag::video(0x0102_0304, Bytes::from_static(&[0x17, 0x01, 0xAA]));
        let mut buf = BytesMut::new();
        tag.encode(&mut buf).unwrap();

        assert_eq!(
            &buf[..],
            &[
                0x09, // video
                0x00, 0x00, 0x03, // data size
                0x02, 0x03, 0x04, // timestamp low 24 bits
                0x01, // timestamp extension
                0x00, 0x00, 0x00, // stream id
                0x17, 0x01, 0xAA, // payload
                0x00, 0x00, 0x00, 0x0E, // 11 + 3
            ]
        );
        assert_eq!(buf.len(), tag.encoded_len());
    }

    #[test]
    fn test_empty_payload() {
        let mut buf = BytesMut::new();
        encode_tag(&mut buf, FlvTagType::Script, 0, &[]).unwrap();

        assert_eq!(buf.len(), 15);
        assert_eq!(&buf[11..], &[0, 0, 0, 11]);
    }

    #[test]
    fn test_max_payload_accepted() {
        let data = vec![0u8; MAX_TAG_DATA_SIZE];
        let mut buf = BytesMut::new();
        encode_tag(&mut buf, FlvTagType::Video, 0, &data).unwrap();

        assert_eq!(&buf[1..4], &[0xFF, 0xFF, 0xFF]);
        assert_eq!(buf.len(), 11 + MAX_TAG_DATA_SIZE + 4);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let data = vec![0u8; MAX_TAG_DATA_SIZE + 1];
        let mut buf = BytesMut::new();
        let result = encode_tag(&mut buf, FlvTagType::Video, 0, &data);

        assert!(matches!(result, Err(MuxError::PayloadTooLarge(n)) if n == MAX_TAG_DATA_SIZE + 1));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_video_tag() {
        let payload = Bytes::from(vec![0x27u8; 100]);
        let tag = FlvTag::video(12345, payload.clone());
        let mut buf = BytesMut::new();
        tag.encode(&mut buf).unwrap();

        // Trailer sits right after the payload
        let trailer = u32::from_be_bytes(buf[111..115].try_into().unwrap());
        assert_eq!(trailer, 11 + 100);

        let mut bytes = buf.freeze();
        let decoded = FlvTag::decode(&mut bytes).unwrap();
        assert_eq!(decoded.tag_type, FlvTagType::Video);
        assert_eq!(decoded.timestamp, 12345);
        assert_eq!(decoded.data, payload);
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_extended_timestamp() {
        let mut buf = BytesMut::new();
        encode_tag(&mut buf, FlvTagType::Audio, u32::MAX, &[0xAF]).unwrap();
        assert_eq!(&buf[4..8], &[0xFF, 0xFF, 0xFF, 0xFF]);

        let decoded = FlvTag::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded.timestamp, u32::MAX);
    }

    #[test]
    fn test_decode_truncated() {
        let mut buf = BytesMut::new();
        encode_tag(&mut buf, FlvTagType::Audio, 0, &[1, 2, 3]).unwrap();
        let mut short = buf.freeze().slice(..12);

        assert!(matches!(
            FlvTag::decode(&mut short),
            Err(MuxError::Truncated { needed: 18, .. })
        ));
    }

    #[test]
    fn test_decode_bad_trailer() {
        let mut buf = BytesMut::new();
        encode_tag(&mut buf, FlvTagType::Audio, 0, &[1]).unwrap();
        let last = buf.len() - 1;
        buf[last] = 0;

        assert!(matches!(
            FlvTag::decode(&mut buf.freeze()),
            Err(MuxError::TrailerMismatch { expected: 12, actual: 0 })
        ));
    }

    #[test]
    fn test_decode_unknown_type() {
        let mut bytes = Bytes::from_static(&[0x07, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 11]);
        assert!(matches!(
            FlvTag::decode(&mut bytes),
            Err(MuxError::UnknownTagType(7))
        ));
    }

    #[test]
    fn test_header() {
        let mut bytes = Bytes::from_static(&FLV_HEADER);
        decode_header(&mut bytes).unwrap();
        assert!(bytes.is_empty());

        let mut bad = Bytes::from_static(b"FLX\x01\x05\x00\x00\x00\x09\x00\x00\x00\x00");
        assert!(matches!(decode_header(&mut bad), Err(MuxError::InvalidHeader)));
    }
}
