// Public file handles: keyed one-way digests of backend object ids, and the links built from them.

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Length of a handle in hex characters (12 digest bytes).
pub const HANDLE_LEN: usize = 24;

/// Opaque URL-safe identifier of a published file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileHandle(String);

impl FileHandle {
    /// Accept a handle from a URL. Only the exact shape we issue is valid.
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = raw.len() == HANDLE_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives handles from backend object ids with a secret key.
#[derive(Clone)]
pub struct HandleSigner {
    secret: String,
}

impl HandleSigner {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.to_string(),
        }
    }

    pub fn derive(&self, backend_object_id: i64) -> FileHandle {
        let mut mac = match <HmacSha256 as Mac>::new_from_slice(self.secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => unreachable!("hmac accepts keys of any length"),
        };
        mac.update(format!("{}:{}", backend_object_id, self.secret).as_bytes());
        let digest = hex::encode(mac.finalize().into_bytes());
        FileHandle(digest[..HANDLE_LEN].to_string())
    }

    pub fn verify(&self, handle: &FileHandle, backend_object_id: i64) -> bool {
        self.derive(backend_object_id) == *handle
    }
}

/// Renders the public stream and download URLs for a handle.
#[derive(Debug, Clone)]
pub struct LinkBuilder {
    base_url: String,
}

impl LinkBuilder {
    pub fn new(base_url: &str) -> Self {
        let base = if base_url.trim().is_empty() {
            "http://localhost:8080"
        } else {
            base_url.trim()
        };
        Self {
            base_url: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn stream_url(&self, handle: &FileHandle) -> String {
        format!("{}/stream/{}", self.base_url, handle)
    }

    pub fn download_url(&self, handle: &FileHandle) -> String {
        format!("{}/dl/{}", self.base_url, handle)
    }
}
