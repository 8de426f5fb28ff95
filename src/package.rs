//! Signed package (`.ppk`) codec.
//!
//! A package is a 128-byte header followed by an inner zip archive. The
//! header carries an Ed25519 public key and a signature over the inner
//! content. Nothing touches the filesystem until the signature verifies.
//!
//! Header layout (little-endian):
//!
//! | Offset | Size | Field                 |
//! |--------|------|-----------------------|
//! | 0      | 4    | magic `PPK\0`         |
//! | 4      | 1    | version (1)           |
//! | 5      | 1    | flags                 |
//! | 6      | 1    | signature algo (1)    |
//! | 7      | 1    | reserved              |
//! | 8      | 8    | content length (u64)  |
//! | 16     | 32   | Ed25519 public key    |
//! | 48     | 64   | Ed25519 signature     |
//! | 112    | 16   | reserved              |

use std::io::Read;
use std::path::{Component, Path};

use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::constants::{
    MAX_PACKAGE_CONTENT, PPK_ALGO_ED25519, PPK_HEADER_SIZE, PPK_MAGIC, PPK_VERSION,
};
use crate::error::{Error, Result};

/// Parsed package header.
#[derive(Debug, Clone)]
pub struct PpkHeader {
    pub version: u8,
    pub flags: u8,
    pub sign_algo: u8,
    pub content_len: u64,
    pub public_key: [u8; 32],
    pub signature: [u8; 64],
}

impl PpkHeader {
    /// Reads and validates exactly 128 header bytes from `reader`.
    pub fn parse(reader: &mut impl Read) -> Result<Self> {
        let mut buf = [0u8; PPK_HEADER_SIZE];
        reader
            .read_exact(&mut buf)
            .map_err(|e| Error::InvalidFormat(format!("short header: {e}")))?;

        if &buf[0..4] != PPK_MAGIC {
            return Err(Error::InvalidFormat("bad magic".to_string()));
        }

        let version = buf[4];
        if version != PPK_VERSION {
            return Err(Error::InvalidFormat(format!(
                "unsupported version: {version}"
            )));
        }

        let sign_algo = buf[6];
        if sign_algo != PPK_ALGO_ED25519 {
            return Err(Error::InvalidFormat(format!(
                "unsupported signature algorithm: {sign_algo}"
            )));
        }

        let content_len = u64::from_le_bytes(buf[8..16].try_into().expect("8-byte slice"));
        if content_len > MAX_PACKAGE_CONTENT {
            return Err(Error::InvalidFormat(format!(
                "content length {content_len} exceeds limit"
            )));
        }

        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&buf[16..48]);
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&buf[48..112]);

        Ok(Self {
            version,
            flags: buf[5],
            sign_algo,
            content_len,
            public_key,
            signature,
        })
    }

    /// Verifies the signature over `content`.
    ///
    /// With `expected_key` set, the embedded key must match byte-for-byte
    /// before the signature is checked (pin enforcement). Without it the
    /// check covers integrity only; trust is established separately.
    pub fn verify(&self, content: &[u8], expected_key: Option<&[u8; 32]>) -> Result<()> {
        if let Some(expected) = expected_key {
            if expected != &self.public_key {
                return Err(Error::KeyMismatch {
                    owner: String::new(),
                    pinned: hex::encode(expected),
                    offered: hex::encode(self.public_key),
                });
            }
        }

        let key = VerifyingKey::from_bytes(&self.public_key)
            .map_err(|e| Error::InvalidFormat(format!("bad public key: {e}")))?;
        let sig = Signature::from_bytes(&self.signature);
        key.verify(content, &sig).map_err(|_| Error::BadSignature {
            path: Default::default(),
        })
    }

    /// Hex fingerprint of the embedded public key, for logs.
    pub fn key_fingerprint(&self) -> String {
        hex::encode(self.public_key)
    }
}

/// Reads a full package: header, then exactly `content_len` content bytes.
pub fn read_package(reader: &mut impl Read) -> Result<(PpkHeader, Vec<u8>)> {
    let header = PpkHeader::parse(reader)?;
    let mut content = vec![0u8; header.content_len as usize];
    reader
        .read_exact(&mut content)
        .map_err(|e| Error::InvalidFormat(format!("short content: {e}")))?;
    Ok((header, content))
}

/// Encodes a header + content into package bytes. Test and tooling aid;
/// the host itself only consumes packages.
pub fn encode_package(header: &PpkHeader, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PPK_HEADER_SIZE + content.len());
    out.extend_from_slice(PPK_MAGIC);
    out.push(header.version);
    out.push(header.flags);
    out.push(header.sign_algo);
    out.push(0);
    out.extend_from_slice(&(content.len() as u64).to_le_bytes());
    out.extend_from_slice(&header.public_key);
    out.extend_from_slice(&header.signature);
    out.extend_from_slice(&[0u8; 16]);
    out.extend_from_slice(content);
    out
}

/// Extracts a zip archive into `dest`, refusing entries that would land
/// outside it. A single offending entry aborts the whole extraction.
pub fn extract_zip(bytes: &[u8], dest: &Path) -> Result<()> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let raw_name = entry.name().to_string();

        let rel = entry
            .enclosed_name()
            .map(|p| p.to_owned())
            .ok_or_else(|| Error::UnsafePath {
                path: raw_name.clone(),
            })?;
        // enclosed_name rejects absolute paths and `..`; keep the invariant
        // explicit against any remaining normalisation surprises.
        if rel
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(Error::UnsafePath { path: raw_name });
        }

        let out_path = dest.join(&rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&out_path)?;
        std::io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn signed_package(content: &[u8]) -> (SigningKey, Vec<u8>) {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let sig = signing.sign(content);
        let header = PpkHeader {
            version: PPK_VERSION,
            flags: 0,
            sign_algo: PPK_ALGO_ED25519,
            content_len: content.len() as u64,
            public_key: signing.verifying_key().to_bytes(),
            signature: sig.to_bytes(),
        };
        (signing.clone(), encode_package(&header, content))
    }

    #[test]
    fn parse_round_trips_header_fields() {
        let (signing, bytes) = signed_package(b"hello pots");
        let (header, content) = read_package(&mut bytes.as_slice()).unwrap();
        assert_eq!(header.version, PPK_VERSION);
        assert_eq!(header.content_len, 10);
        assert_eq!(header.public_key, signing.verifying_key().to_bytes());
        assert_eq!(content, b"hello pots");
    }

    #[test]
    fn verify_accepts_matching_key_and_signature() {
        let (signing, bytes) = signed_package(b"payload");
        let (header, content) = read_package(&mut bytes.as_slice()).unwrap();
        header.verify(&content, None).unwrap();
        header
            .verify(&content, Some(&signing.verifying_key().to_bytes()))
            .unwrap();
    }

    #[test]
    fn verify_rejects_pinned_key_mismatch() {
        let (_, bytes) = signed_package(b"payload");
        let (header, content) = read_package(&mut bytes.as_slice()).unwrap();
        let other = [9u8; 32];
        assert!(matches!(
            header.verify(&content, Some(&other)),
            Err(Error::KeyMismatch { .. })
        ));
    }

    #[test]
    fn verify_rejects_tampered_content() {
        let (_, bytes) = signed_package(b"payload");
        let (header, mut content) = read_package(&mut bytes.as_slice()).unwrap();
        content[0] ^= 0xff;
        assert!(matches!(
            header.verify(&content, None),
            Err(Error::BadSignature { .. })
        ));
    }

    #[test]
    fn zero_length_content_verifies_if_signed_empty() {
        let (_, bytes) = signed_package(b"");
        let (header, content) = read_package(&mut bytes.as_slice()).unwrap();
        assert_eq!(header.content_len, 0);
        header.verify(&content, None).unwrap();
    }

    #[test]
    fn parse_rejects_bad_magic() {
        let (_, mut bytes) = signed_package(b"x");
        bytes[0] = b'Q';
        assert!(matches!(
            PpkHeader::parse(&mut bytes.as_slice()),
            Err(Error::InvalidFormat(_))
        ));
    }

    #[test]
    fn parse_rejects_unknown_algorithm() {
        let (_, mut bytes) = signed_package(b"x");
        bytes[6] = 0x02;
        assert!(PpkHeader::parse(&mut bytes.as_slice()).is_err());
    }

    fn zip_with_entry(name: &str, data: &[u8]) -> Vec<u8> {
        use std::io::Write;
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut w = zip::ZipWriter::new(&mut cursor);
            w.start_file(name, zip::write::FileOptions::default())
                .unwrap();
            w.write_all(data).unwrap();
            w.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn extract_writes_entries_under_dest() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = zip_with_entry("acme/hello/pot.yml", b"type: static\n");
        extract_zip(&bytes, dir.path()).unwrap();
        let written = std::fs::read(dir.path().join("acme/hello/pot.yml")).unwrap();
        assert_eq!(written, b"type: static\n");
    }

    #[test]
    fn extract_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = zip_with_entry("../escape.txt", b"nope");
        assert!(matches!(
            extract_zip(&bytes, dir.path()),
            Err(Error::UnsafePath { .. })
        ));
        assert!(!dir.path().parent().unwrap().join("escape.txt").exists());
    }
}
