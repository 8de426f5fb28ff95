//! Integration tests for certificate handling: parsing, renewal-window
//! logic, archival, and hot loading into the in-memory slot.

use std::path::Path;

use potstack::https::{parse_cert_file, CertManager, HttpsState};

// =============================================================================
// Test Helpers
// =============================================================================

/// Writes a self-signed cert + key pair for `domain` valid through `year`.
fn write_cert_pair(dir: &Path, domain: &str, to_year: i32) {
    let mut params = rcgen::CertificateParams::new(vec![domain.to_string()]);
    params.not_before = rcgen::date_time_ymd(2024, 1, 1);
    params.not_after = rcgen::date_time_ymd(to_year, 1, 1);
    let cert = rcgen::Certificate::from_params(params).unwrap();

    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("cert.pem"), cert.serialize_pem().unwrap()).unwrap();
    std::fs::write(dir.join("key.pem"), cert.serialize_private_key_pem()).unwrap();
}

fn manager(dir: &Path, https_yaml: &str) -> CertManager {
    let config_path = dir.join("https.yaml");
    std::fs::write(&config_path, https_yaml).unwrap();
    let state = HttpsState::init(&config_path).unwrap();
    let certs_dir = dir.join("certs");
    CertManager::new(
        &certs_dir,
        &certs_dir.join("cert.pem"),
        &certs_dir.join("key.pem"),
        state,
    )
}

// =============================================================================
// Parsing
// =============================================================================

#[test]
fn parse_extracts_domain_and_validity() {
    let dir = tempfile::tempdir().unwrap();
    write_cert_pair(&dir.path().join("certs"), "pots.example.com", 2040);

    let facts = parse_cert_file(&dir.path().join("certs/cert.pem")).unwrap();
    assert!(facts.covers("pots.example.com"));
    assert!(!facts.covers("other.example.com"));
    assert!(!facts.expired());
    assert!(facts.remaining_days() > 365);
}

#[test]
fn parse_rejects_garbage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cert.pem");
    std::fs::write(&path, "not a certificate").unwrap();
    assert!(parse_cert_file(&path).is_err());
}

// =============================================================================
// Renewal Decisions
// =============================================================================

#[test]
fn far_future_cert_does_not_need_renewal() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(
        dir.path(),
        "mode: https\nacme:\n  domain: pots.example.com\n  renew_before_days: 30\n",
    );
    write_cert_pair(&dir.path().join("certs"), "pots.example.com", 2040);
    assert!(!mgr.needs_renewal());
}

#[test]
fn missing_cert_needs_renewal() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(
        dir.path(),
        "mode: https\nacme:\n  domain: pots.example.com\n",
    );
    assert!(mgr.needs_renewal());
}

#[test]
fn expired_cert_needs_renewal() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(
        dir.path(),
        "mode: https\nacme:\n  domain: pots.example.com\n",
    );
    write_cert_pair(&dir.path().join("certs"), "pots.example.com", 2025);
    assert!(mgr.needs_renewal());
}

#[test]
fn acme_disabled_never_renews() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(
        dir.path(),
        "mode: https\nacme:\n  enabled: false\n  domain: pots.example.com\n",
    );
    assert!(!mgr.needs_renewal());
}

// =============================================================================
// Loading & Archival
// =============================================================================

#[test]
fn load_current_accepts_generated_pair() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path(), "mode: https\n");
    write_cert_pair(&dir.path().join("certs"), "pots.example.com", 2040);
    mgr.load_current().unwrap();
}

#[test]
fn load_current_without_files_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path(), "mode: https\n");
    assert!(mgr.load_current().is_err());
}

#[test]
fn archive_copies_pair_into_timestamped_dir() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path(), "mode: https\n");
    write_cert_pair(&dir.path().join("certs"), "pots.example.com", 2040);

    let archive = mgr.archive_current().unwrap().expect("archive path");
    let archive = std::path::PathBuf::from(archive);
    assert!(archive.join("cert.pem").exists());
    assert!(archive.join("key.pem").exists());
    assert!(archive.starts_with(dir.path().join("certs/archive")));
}

#[test]
fn archive_with_no_cert_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path(), "mode: https\n");
    assert!(mgr.archive_current().unwrap().is_none());
}

#[test]
fn cert_info_reports_renewal_state() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(
        dir.path(),
        "mode: https\nacme:\n  domain: pots.example.com\n  renew_before_days: 30\n",
    );
    write_cert_pair(&dir.path().join("certs"), "pots.example.com", 2040);

    let info = mgr.cert_info().unwrap();
    assert_eq!(info["needs_renewal"], false);
    assert!(info["domain"]
        .as_array()
        .unwrap()
        .iter()
        .any(|d| d == "pots.example.com"));
    assert!(info["remaining_days"].as_i64().unwrap() > 365);
}

// =============================================================================
// Setup
// =============================================================================

#[tokio::test]
async fn http_mode_yields_no_tls_config() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path(), "mode: http\n");
    assert!(mgr.setup().await.unwrap().is_none());
}

#[tokio::test]
async fn https_with_existing_cert_builds_tls_config() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(
        dir.path(),
        "mode: https\nacme:\n  domain: pots.example.com\n  renew_before_days: 30\n",
    );
    write_cert_pair(&dir.path().join("certs"), "pots.example.com", 2040);

    let tls = mgr.setup().await.unwrap();
    assert!(tls.is_some());
}

#[tokio::test]
async fn https_without_cert_and_without_acme_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(
        dir.path(),
        "mode: https\nacme:\n  enabled: false\n",
    );
    assert!(mgr.setup().await.is_err());
}
