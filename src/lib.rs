//! proxyfleet - orchestration of a fleet of per-device reverse proxies
//!
//! Each managed port forwards to one backend device. The orchestrator keeps
//! three things in step:
//! - the JSON config document of desired entries
//! - the live listener registry
//! - the asset database mirror (best effort)
//!
//! A small HTTP(S) management server exposes the operations.

pub mod allocator;
pub mod api;
pub mod certificate;
pub mod config;
pub mod config_store;
pub mod directory;
pub mod entry;
pub mod error;
pub mod health;
pub mod lenient;
pub mod orchestrator;
pub mod outcome;
pub mod registry;
pub mod transport;

pub use allocator::{PortAllocator, PortDecision};
pub use api::ManagementServer;
pub use certificate::CertificateManager;
pub use config::FleetSettings;
pub use config_store::ConfigStore;
pub use directory::{
    AssetDirectory, AssetRecord, DisabledDirectory, HttpAssetDirectory, SqliteAssetDirectory,
};
pub use entry::{ProxyDocument, ProxyEntry, ServerIdentity};
pub use error::{FleetError, FleetResult};
pub use orchestrator::{BatchMode, ProxyOrchestrator};
pub use outcome::{
    Envelope, ItemResult, MirrorStatus, Mirrored, PortOutcome, ReconcileReport,
    ReconciliationSource,
};
pub use registry::ProxyRegistry;
pub use transport::Transport;
