//! Deterministic document identifiers.
//!
//! Both backends key documents by the same id so that fusion can pair hits
//! by string equality: a URL-safe Base64 encoding of the SHA-256 of the
//! absolute file path. Vector chunk ids extend the document id with a
//! `::chunk_N` suffix.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use std::path::Path;

const CHUNK_SEPARATOR: &str = "::chunk_";

/// Stable id for a file, derived from its absolute path.
pub fn document_id(path: &Path) -> String {
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Id for the `index`-th chunk of a document.
pub fn chunk_id(doc_id: &str, index: u32) -> String {
    format!("{doc_id}{CHUNK_SEPARATOR}{index}")
}

/// Strip a chunk suffix, returning the base document id. Plain document ids
/// pass through unchanged.
pub fn base_document_id(id: &str) -> &str {
    match id.find(CHUNK_SEPARATOR) {
        Some(pos) => &id[..pos],
        None => id,
    }
}

/// SHA-256 of raw content bytes, hex-encoded. Used for dedup detection in
/// the metadata store.
pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn document_id_is_deterministic() {
        let path = PathBuf::from("/home/user/project/src/main.rs");
        assert_eq!(document_id(&path), document_id(&path));
        assert_ne!(
            document_id(&path),
            document_id(&PathBuf::from("/home/user/project/src/lib.rs"))
        );
    }

    #[test]
    fn document_id_is_url_safe() {
        let id = document_id(&PathBuf::from("/tmp/some file with spaces.md"));
        assert!(id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn chunk_id_round_trips() {
        let doc = document_id(&PathBuf::from("/a/b.py"));
        let chunk = chunk_id(&doc, 7);
        assert_eq!(base_document_id(&chunk), doc);
        assert_eq!(base_document_id(&doc), doc);
    }

    #[test]
    fn content_hash_is_stable_sha256() {
        assert_eq!(
            content_hash(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
