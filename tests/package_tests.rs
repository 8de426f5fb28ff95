//! Integration tests for the signed-package codec.

use ed25519_dalek::{Signer, SigningKey};
use potstack::package::{encode_package, extract_zip, read_package, PpkHeader};
use potstack::Error;
use std::io::Write;

// =============================================================================
// Test Helpers
// =============================================================================

fn make_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

fn make_package(key: &SigningKey, content: &[u8]) -> Vec<u8> {
    let sig = key.sign(content);
    let header = PpkHeader {
        version: 1,
        flags: 0,
        sign_algo: 1,
        content_len: content.len() as u64,
        public_key: key.verifying_key().to_bytes(),
        signature: sig.to_bytes(),
    };
    encode_package(&header, content)
}

fn inner_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut w = zip::ZipWriter::new(&mut cursor);
        for (name, data) in entries {
            w.start_file(*name, zip::write::FileOptions::default())
                .unwrap();
            w.write_all(data).unwrap();
        }
        w.finish().unwrap();
    }
    cursor.into_inner()
}

// =============================================================================
// Round Trips
// =============================================================================

#[test]
fn pack_parse_verify_accepts_valid_package() {
    let key = make_key(1);
    let bytes = make_package(&key, b"content");

    let (header, content) = read_package(&mut bytes.as_slice()).unwrap();
    assert_eq!(content, b"content");
    header.verify(&content, None).unwrap();
    header
        .verify(&content, Some(&key.verifying_key().to_bytes()))
        .unwrap();
}

#[test]
fn verify_rejects_wrong_expected_key() {
    let key = make_key(1);
    let other = make_key(2);
    let bytes = make_package(&key, b"content");

    let (header, content) = read_package(&mut bytes.as_slice()).unwrap();
    let err = header
        .verify(&content, Some(&other.verifying_key().to_bytes()))
        .unwrap_err();
    assert!(matches!(err, Error::KeyMismatch { .. }));
}

#[test]
fn verify_rejects_signature_from_other_key() {
    let key = make_key(1);
    let other = make_key(2);

    // Header claims `other`'s key but carries `key`'s signature.
    let content = b"content".to_vec();
    let sig = key.sign(&content);
    let header = PpkHeader {
        version: 1,
        flags: 0,
        sign_algo: 1,
        content_len: content.len() as u64,
        public_key: other.verifying_key().to_bytes(),
        signature: sig.to_bytes(),
    };
    let bytes = encode_package(&header, &content);

    let (parsed, content) = read_package(&mut bytes.as_slice()).unwrap();
    assert!(parsed.verify(&content, None).is_err());
}

#[test]
fn zero_length_package_round_trips() {
    let key = make_key(3);
    let empty_zip = inner_zip(&[]);
    let bytes = make_package(&key, &empty_zip);

    let (header, content) = read_package(&mut bytes.as_slice()).unwrap();
    header.verify(&content, None).unwrap();

    let dir = tempfile::tempdir().unwrap();
    extract_zip(&content, dir.path()).unwrap();
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

// =============================================================================
// Header Validation
// =============================================================================

#[test]
fn truncated_header_is_invalid_format() {
    let key = make_key(4);
    let bytes = make_package(&key, b"x");
    let err = PpkHeader::parse(&mut &bytes[..64]).unwrap_err();
    assert!(matches!(err, Error::InvalidFormat(_)));
}

#[test]
fn truncated_content_is_invalid_format() {
    let key = make_key(4);
    let bytes = make_package(&key, b"twelve bytes");
    // Header promises 12 content bytes, give it 4.
    let short = &bytes[..128 + 4];
    assert!(read_package(&mut &short[..]).is_err());
}

#[test]
fn oversized_content_length_is_rejected_before_allocation() {
    let key = make_key(5);
    let mut bytes = make_package(&key, b"x");
    bytes[8..16].copy_from_slice(&u64::MAX.to_le_bytes());
    assert!(PpkHeader::parse(&mut bytes.as_slice()).is_err());
}

// =============================================================================
// Extraction Safety
// =============================================================================

#[test]
fn extraction_aborts_whole_archive_on_traversal() {
    let dir = tempfile::tempdir().unwrap();
    let bytes = inner_zip(&[
        ("ok.txt", b"fine".as_slice()),
        ("../../evil.txt", b"nope".as_slice()),
    ]);
    assert!(matches!(
        extract_zip(&bytes, dir.path()),
        Err(Error::UnsafePath { .. })
    ));
}

#[test]
fn extraction_preserves_nested_layout() {
    let dir = tempfile::tempdir().unwrap();
    let bytes = inner_zip(&[
        ("acme/hello/pot.yml", b"type: static\n".as_slice()),
        ("acme/hello/public/index.html", b"<p>hi</p>".as_slice()),
    ]);
    extract_zip(&bytes, dir.path()).unwrap();
    assert!(dir.path().join("acme/hello/pot.yml").exists());
    assert_eq!(
        std::fs::read(dir.path().join("acme/hello/public/index.html")).unwrap(),
        b"<p>hi</p>"
    );
}
