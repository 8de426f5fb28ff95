//! # potstack
//!
//! Host for a fleet of user-defined sandboxes ("pots") alongside a local
//! Git service on a single machine. Each pot is a content-addressed unit
//! (source tree plus a declarative manifest) delivered as a signed
//! package, stored as a bare Git repository, and exposed to the network
//! through a dynamic HTTP router.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           potstack                               │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  HTTP Façade: business :61080 │ admin :61081 │ internal :61082   │
//! │        │                                                         │
//! │        ▼                                                         │
//! │  Dynamic Router ── longest-prefix ──► static tree (git HEAD)     │
//! │        │                          └─► reverse proxy :port        │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  Loader ── verify + pin ──► Repo Materialiser ──► bare repos     │
//! │  Keeper ── reconcile ────► spawn children (kill-on-parent-death) │
//! │  Cert Manager ── ACME ───► hot-swapped TLS                       │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Deployment flow: a signed package enters through the [`loader`],
//! which verifies its Ed25519 signature, applies trust-on-first-use key
//! pinning per owner, and pushes the content into bare repositories via
//! [`repo`]. The [`keeper`] reconciles declared state to running child
//! processes and nudges the [`router`] over the internal control
//! endpoint; inbound requests then dispatch to the new backend.
//!
//! # Security Model
//!
//! - **Signature before filesystem**: no package content is written
//!   until its Ed25519 signature verifies ([`package`]).
//! - **Key pinning**: the first key seen for an owner is recorded; every
//!   later package for that owner must present the same key.
//! - **Path traversal protection**: archive extraction and static file
//!   serving reject paths escaping their roots.
//! - **Parent-death reaping**: sandbox children are killed by the OS when
//!   the host dies, not by host cleanup code ([`keeper`]).

mod constants;
mod error;

pub mod config;
pub mod docker;
pub mod githttp;
pub mod https;
pub mod keeper;
pub mod loader;
pub mod package;
pub mod pot;
pub mod repo;
pub mod router;
pub mod server;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};

pub use constants::{DEFAULT_ADMIN_PORT, DEFAULT_HTTP_PORT, INTERNAL_PORT, SYSTEM_OWNER};
