// Packed backend object reference, as stored next to each file record.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::{Buf, BufMut, Bytes, BytesMut};

const REFERENCE_VERSION: u8 = 1;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LocationError {
    #[error("reference is not valid base64")]
    Encoding,
    #[error("unsupported reference version {0}")]
    Version(u8),
    #[error("unknown object kind {0}")]
    Kind(u8),
    #[error("reference truncated")]
    Truncated,
    #[error("thumbnail size is not utf-8")]
    ThumbSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Document,
    Photo,
}

impl ObjectKind {
    fn tag(self) -> u8 {
        match self {
            Self::Document => 0,
            Self::Photo => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, LocationError> {
        match tag {
            0 => Ok(Self::Document),
            1 => Ok(Self::Photo),
            other => Err(LocationError::Kind(other)),
        }
    }
}

/// Where an object lives on its shard, in the form the fetch call needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocation {
    pub kind: ObjectKind,
    pub media_id: u64,
    pub access_hash: u64,
    pub file_reference: Bytes,
    pub thumb_size: String,
}

impl ObjectLocation {
    /// Decode a stored reference. The access hash travels separately in the record.
    pub fn decode(reference: &str, access_hash: u64) -> Result<Self, LocationError> {
        let raw = URL_SAFE_NO_PAD
            .decode(reference.trim())
            .map_err(|_| LocationError::Encoding)?;
        let mut buf = Bytes::from(raw);

        if buf.remaining() < 2 {
            return Err(LocationError::Truncated);
        }
        let version = buf.get_u8();
        if version != REFERENCE_VERSION {
            return Err(LocationError::Version(version));
        }
        let kind = ObjectKind::from_tag(buf.get_u8())?;

        if buf.remaining() < 10 {
            return Err(LocationError::Truncated);
        }
        let media_id = buf.get_u64();
        let ref_len = buf.get_u16() as usize;
        if buf.remaining() < ref_len + 1 {
            return Err(LocationError::Truncated);
        }
        let file_reference = buf.split_to(ref_len);

        let thumb_len = buf.get_u8() as usize;
        if buf.remaining() < thumb_len {
            return Err(LocationError::Truncated);
        }
        let thumb_size = String::from_utf8(buf.split_to(thumb_len).to_vec())
            .map_err(|_| LocationError::ThumbSize)?;

        Ok(Self {
            kind,
            media_id,
            access_hash,
            file_reference,
            thumb_size,
        })
    }

    /// Encode into the stored form (without the access hash).
    pub fn encode(&self) -> String {
        let mut buf = BytesMut::with_capacity(13 + self.file_reference.len() + self.thumb_size.len());
        buf.put_u8(REFERENCE_VERSION);
        buf.put_u8(self.kind.tag());
        buf.put_u64(self.media_id);
        buf.put_u16(self.file_reference.len() as u16);
        buf.put_slice(&self.file_reference);
        buf.put_u8(self.thumb_size.len() as u8);
        buf.put_slice(self.thumb_size.as_bytes());
        URL_SAFE_NO_PAD.encode(&buf)
    }

    /// Stable text form used as a path segment by remote transports.
    pub fn path_segment(&self) -> String {
        format!("{}.{}.{}", self.encode(), self.access_hash, self.kind.tag())
    }
}
