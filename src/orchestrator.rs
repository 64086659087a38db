//! Fleet orchestration
//!
//! Coordinates the config document, the port allocator, the live listener
//! registry and the asset database. One async mutex owning the registry
//! serializes every `snapshot -> decide port -> persist -> bind` sequence.
//! Batches take it once per item, and asset database calls only happen
//! after it is released.

use crate::allocator::{PortAllocator, PortDecision};
use crate::config::{is_supported_device_type, FleetSettings};
use crate::config_store::ConfigStore;
use crate::directory::{
    delete_statement, disable_statement, upsert_statement, AssetDirectory, AssetRecord, MirrorRow,
    ASSETS_DEVICE_QUERY, PROXY_ASSETS_QUERY,
};
use crate::entry::{ProxyDocument, ProxyEntry};
use crate::error::{FleetError, FleetResult};
use crate::health::HealthProbe;
use crate::outcome::{
    ItemResult, MirrorStatus, Mirrored, PortOutcome, ReconcileReport, ReconciliationSource,
};
use crate::registry::ProxyRegistry;
use crate::transport::Transport;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use url::Url;

/// How a batch create treats existing state for each item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// Replace each item: stop its listener, drop its config entry and
    /// database row, create it again, then mirror the batch.
    Normal,
    /// Rebuild from a source that was just read: only stop same-port
    /// listeners, never touch the database.
    Reconcile,
}

/// Outcome of the locked part of a create.
struct Created {
    item: ItemResult,
    /// Entry persisted by this call, if any.
    persisted: Option<ProxyEntry>,
}

pub struct ProxyOrchestrator {
    settings: FleetSettings,
    store: ConfigStore,
    allocator: PortAllocator,
    directory: Arc<dyn AssetDirectory>,
    registry: Mutex<ProxyRegistry>,
    health: HealthProbe,
    last_source: parking_lot::Mutex<Option<ReconciliationSource>>,
}

impl ProxyOrchestrator {
    pub fn new(
        settings: FleetSettings,
        store: ConfigStore,
        directory: Arc<dyn AssetDirectory>,
        transport: Arc<Transport>,
    ) -> Result<Self> {
        let allocator = PortAllocator::new(settings.management_port, settings.usable_port_start);
        let registry = ProxyRegistry::new(transport, settings.listen_host);
        let health = HealthProbe::new(settings.health_check_path.clone())?;

        Ok(Self {
            settings,
            store,
            allocator,
            directory,
            registry: Mutex::new(registry),
            health,
            last_source: parking_lot::Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &FleetSettings {
        &self.settings
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Create one proxy from an already validated entry, then mirror it.
    pub async fn create(&self, entry: ProxyEntry) -> FleetResult<Mirrored<ItemResult>> {
        let created = {
            let mut registry = self.registry.lock().await;
            self.create_locked(&mut registry, entry).await?
        };

        let mirror = match created.persisted.as_ref() {
            Some(entry) => self.mirror(upsert_statement(&mirror_rows([entry]))).await,
            None => MirrorStatus::Skipped,
        };
        Ok(Mirrored::new(created.item, mirror))
    }

    /// Single create from loose parameters. The proxy port is derived from
    /// the device code unless one is given.
    pub async fn create_one(&self, record: &AssetRecord) -> FleetResult<Mirrored<ItemResult>> {
        match self.resolve_entry(record) {
            Ok(entry) => self.create(entry).await,
            Err(e) => Ok(Mirrored::new(invalid_item(record, &e), MirrorStatus::Skipped)),
        }
    }

    /// Create every record independently. Only a config persistence failure
    /// aborts the batch.
    pub async fn create_many(
        &self,
        records: &[AssetRecord],
        mode: BatchMode,
    ) -> FleetResult<Mirrored<Vec<ItemResult>>> {
        let mut results = Vec::with_capacity(records.len());
        let mut persisted = Vec::new();

        for record in records {
            let entry = match self.resolve_entry(record) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping proxy item: {}", e);
                    results.push(invalid_item(record, &e));
                    continue;
                }
            };
            let port = entry.proxy_port;

            let created = {
                let mut registry = self.registry.lock().await;
                registry.stop(port).await;
                if mode == BatchMode::Normal {
                    self.store.remove_by_port(port)?;
                }
                self.create_locked(&mut registry, entry).await?
            };

            if mode == BatchMode::Normal {
                if let Err(e) = self.directory.execute(&[delete_statement(port)]).await {
                    debug!("Asset row delete for port {} skipped: {}", port, e);
                }
            }

            persisted.extend(created.persisted);
            results.push(created.item);
        }

        let mirror = match mode {
            BatchMode::Normal => self.mirror(upsert_statement(&mirror_rows(&persisted))).await,
            BatchMode::Reconcile => MirrorStatus::Skipped,
        };
        Ok(Mirrored::new(results, mirror))
    }

    /// Stop the listener and drop the config entry. Absent ports succeed.
    pub async fn delete(&self, port: u16) -> FleetResult<PortOutcome> {
        let (stopped, removed) = {
            let mut registry = self.registry.lock().await;
            let stopped = registry.stop(port).await;
            (stopped, self.store.remove_by_port(port)?)
        };

        let message = if stopped || removed > 0 {
            info!("Deleted proxy on port {}", port);
            "Deleted"
        } else {
            "Not found"
        };

        Ok(PortOutcome {
            port,
            result: true,
            message: message.to_string(),
            mirror: self.mirror(Some(delete_statement(port))).await,
        })
    }

    /// Soft-disable a live proxy: the entry stays with its flag cleared.
    /// Ports without a live listener fail with [`FleetError::NotInUse`]
    /// and the config document is left alone.
    pub async fn close(&self, port: u16) -> FleetResult<PortOutcome> {
        {
            let mut registry = self.registry.lock().await;
            if !registry.contains(port) {
                return Err(FleetError::NotInUse(port));
            }
            self.store.disable_by_port(port)?;
            registry.stop(port).await;
        }
        info!("Closed proxy on port {}", port);

        Ok(PortOutcome {
            port,
            result: true,
            message: "Closed".to_string(),
            mirror: self.mirror(Some(disable_statement(port))).await,
        })
    }

    pub async fn delete_many(&self, records: &[AssetRecord]) -> FleetResult<Vec<PortOutcome>> {
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            let outcome = match record.proxy_port {
                Some(port) => self.delete(port).await,
                None => Err(FleetError::Validation("proxy_port".to_string())),
            };
            outcomes.push(fold_outcome(record, outcome)?);
        }
        Ok(outcomes)
    }

    pub async fn close_many(&self, records: &[AssetRecord]) -> FleetResult<Vec<PortOutcome>> {
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            let outcome = match record.proxy_port {
                Some(port) => self.close(port).await,
                None => Err(FleetError::Validation("proxy_port".to_string())),
            };
            outcomes.push(fold_outcome(record, outcome)?);
        }
        Ok(outcomes)
    }

    /// Boot-time rebuild. The asset database is authoritative when it
    /// answers; otherwise the config document is replayed.
    pub async fn startup_reconcile(&self) -> FleetResult<ReconcileReport> {
        let (source, results) = match self.directory.query(PROXY_ASSETS_QUERY).await {
            Ok(rows) => {
                info!("Rebuilding {} proxies from the asset database", rows.len());
                {
                    let _registry = self.registry.lock().await;
                    self.store.clear_all()?;
                }
                let records: Vec<AssetRecord> = rows.iter().map(AssetRecord::from_value).collect();
                let batch = self.create_many(&records, BatchMode::Reconcile).await?;
                (ReconciliationSource::Database, batch.value)
            }
            Err(e) => {
                warn!("Asset database unavailable, falling back to config file: {}", e);
                (ReconciliationSource::ConfigFile, self.replay_config().await?)
            }
        };

        *self.last_source.lock() = Some(source);
        Ok(ReconcileReport { source, results })
    }

    /// Import every device of the asset inventory, replacing the config
    /// document. Fails as a whole when the inventory cannot be read.
    pub async fn create_all_from_assets(&self) -> FleetResult<Mirrored<Vec<ItemResult>>> {
        let rows = self.directory.query(ASSETS_DEVICE_QUERY).await?;
        info!("Creating proxies for {} assets", rows.len());

        {
            let mut registry = self.registry.lock().await;
            registry.stop_all().await;
            self.store.clear_all()?;
        }

        let records: Vec<AssetRecord> = rows.iter().map(AssetRecord::from_value).collect();
        self.create_many(&records, BatchMode::Normal).await
    }

    /// Stop everything and recreate from the config document in file order.
    /// Never touches the asset database.
    pub async fn create_from_config(&self) -> FleetResult<Vec<ItemResult>> {
        let stopped = self.registry.lock().await.stop_all().await;
        debug!("Stopped {} listeners before rebuild", stopped);
        self.replay_config().await
    }

    /// Add a config entry without starting a listener.
    pub async fn config_add(
        &self,
        url: &str,
        port: u16,
        device_type: &str,
    ) -> FleetResult<ProxyEntry> {
        if url.trim().is_empty() {
            return Err(FleetError::Validation("url".to_string()));
        }
        if !is_supported_device_type(device_type) {
            return Err(FleetError::Validation(format!("unsupported device type {}", device_type)));
        }

        let _registry = self.registry.lock().await;
        let entries = self.store.load()?;

        match self.allocator.check(&entries, port, url) {
            PortDecision::Reserved => return Err(FleetError::ReservedPort(port)),
            PortDecision::Conflict { .. } => {
                let existing = entries
                    .iter()
                    .find(|e| e.proxy_port == port)
                    .map(|e| e.url.clone())
                    .unwrap_or_default();
                return Err(FleetError::PortConflict { port, existing });
            }
            PortDecision::ExactMatch | PortDecision::Available => {}
        }

        let mut entry = ProxyEntry::new(url, port);
        entry.device_type = device_type.to_ascii_lowercase();
        entry.ip = host_of(url);
        self.store.upsert_entry(entry.clone())?;
        Ok(entry)
    }

    /// Remove config entries matching all three fields. Returns how many went.
    pub async fn config_delete(
        &self,
        url: &str,
        port: u16,
        device_type: &str,
    ) -> FleetResult<usize> {
        let _registry = self.registry.lock().await;
        self.store.remove_matching(url, port, device_type)
    }

    pub async fn config_clear(&self) -> FleetResult<()> {
        let _registry = self.registry.lock().await;
        self.store.clear_all()
    }

    pub async fn list_all(&self) -> FleetResult<Vec<ProxyEntry>> {
        let _registry = self.registry.lock().await;
        self.store.load()
    }

    pub async fn config_document(&self) -> FleetResult<ProxyDocument> {
        let _registry = self.registry.lock().await;
        self.store.document()
    }

    /// Reachability of a backend. Runs without the orchestration lock.
    pub async fn health_check(&self, url: &str) -> bool {
        self.health.check(url).await
    }

    /// Stop every live listener. Returns how many were running.
    pub async fn shutdown(&self) -> usize {
        let stopped = self.registry.lock().await.stop_all().await;
        info!("Stopped {} proxy listeners", stopped);
        stopped
    }

    pub async fn live_ports(&self) -> Vec<u16> {
        self.registry.lock().await.ports()
    }

    pub fn last_source(&self) -> Option<ReconciliationSource> {
        *self.last_source.lock()
    }

    /// Recreate each config entry in file order, one lock per entry.
    async fn replay_config(&self) -> FleetResult<Vec<ItemResult>> {
        let entries = self.store.load()?;
        let mut results = Vec::with_capacity(entries.len());

        for entry in entries {
            let mut registry = self.registry.lock().await;
            registry.stop(entry.proxy_port).await;
            results.push(self.create_locked(&mut registry, entry).await?.item);
        }
        Ok(results)
    }

    /// Decide the port, bind and persist. Caller holds the registry lock.
    async fn create_locked(
        &self,
        registry: &mut ProxyRegistry,
        mut entry: ProxyEntry,
    ) -> FleetResult<Created> {
        let entries = self.store.load()?;
        let requested = entry.proxy_port;
        let mut item = ItemResult::pending(requested, &entry.url, &entry.device_code);

        match self.allocator.check(&entries, requested, &entry.url) {
            PortDecision::Reserved => {
                warn!("Port {} requested for {} is the management port", requested, entry.url);
                let reason = FleetError::ReservedPort(requested).to_string();
                return Ok(Created::unpersisted(item.fail(reason)));
            }
            PortDecision::ExactMatch if registry.target(requested) == Some(entry.url.as_str()) => {
                debug!("Proxy {} on port {} already running", entry.url, requested);
                return Ok(Created::unpersisted(item.succeed("Already Created")));
            }
            PortDecision::ExactMatch | PortDecision::Available => {}
            PortDecision::Conflict {
                recommended: Some(port),
            } => {
                info!(
                    "Port {} is taken, using recommended port {} for {}",
                    requested, port, entry.url
                );
                entry.proxy_port = port;
                item.port = port;
                item.recommend_port = Some(port);
            }
            PortDecision::Conflict { recommended: None } => {
                let existing = entries
                    .iter()
                    .find(|e| e.proxy_port == requested)
                    .map(|e| e.url.clone())
                    .unwrap_or_default();
                let err = FleetError::PortConflict {
                    port: requested,
                    existing,
                };
                error!("{}", err);
                return Ok(Created::unpersisted(item.fail(err.to_string())));
            }
        }

        let port = entry.proxy_port;
        let listening = if entry.use_flag {
            if let Err(e) = registry.start(port, &entry.url).await {
                return Ok(Created::unpersisted(item.fail(e.to_string())));
            }
            true
        } else {
            registry.stop(port).await;
            false
        };

        if let Err(e) = self.store.upsert_entry(entry.clone()) {
            if listening {
                registry.stop(port).await;
            }
            if e.is_store_failure() {
                return Err(e);
            }
            return Ok(Created::unpersisted(item.fail(e.to_string())));
        }

        let message = if listening { "Success" } else { "Registered (disabled)" };
        Ok(Created {
            item: item.succeed(message),
            persisted: Some(entry),
        })
    }

    /// Validate a loose record into a config entry.
    fn resolve_entry(&self, record: &AssetRecord) -> FleetResult<ProxyEntry> {
        let url = record.target_url();

        let mut missing = Vec::new();
        if record.device_name.is_none() {
            missing.push("deviceName");
        }
        if url.is_none() {
            missing.push(if record.ip.is_none() { "ip" } else { "port" });
        }
        if record.device_code.is_none() {
            missing.push("deviceCode");
        }
        if !missing.is_empty() {
            return Err(FleetError::Validation(missing.join(", ")));
        }

        let device_type = record.device_type.clone().unwrap_or_else(|| "default".to_string());
        if !is_supported_device_type(&device_type) {
            return Err(FleetError::Validation(format!("unsupported device type {}", device_type)));
        }

        let (Some(url), Some(device_name), Some(device_code)) =
            (url, record.device_name.clone(), record.device_code.clone())
        else {
            return Err(FleetError::Validation("deviceName, url, deviceCode".to_string()));
        };

        if Url::parse(&url).is_err() {
            return Err(FleetError::Validation(format!("invalid url {}", url)));
        }

        let proxy_port = record
            .proxy_port
            .or_else(|| self.settings.device_port(&device_code))
            .ok_or_else(|| {
                FleetError::Validation(format!("deviceCode {} is not a port offset", device_code))
            })?;

        Ok(ProxyEntry {
            ip: record.ip.clone().or_else(|| host_of(&url)),
            url,
            proxy_port,
            device_name,
            device_type: device_type.to_ascii_lowercase(),
            device_code,
            use_flag: record.use_flag.unwrap_or(true),
            description: record.description.clone().unwrap_or_default(),
        })
    }

    /// Best-effort write to the asset database.
    async fn mirror(&self, statement: Option<String>) -> MirrorStatus {
        let Some(statement) = statement else {
            return MirrorStatus::Skipped;
        };

        match self.directory.execute(&[statement]).await {
            Ok(()) => MirrorStatus::Synced,
            Err(e) => {
                warn!("Asset database mirror failed: {}", e);
                MirrorStatus::Failed { reason: e.to_string() }
            }
        }
    }
}

impl Created {
    fn unpersisted(item: ItemResult) -> Self {
        Self { item, persisted: None }
    }
}

fn mirror_rows<'a>(entries: impl IntoIterator<Item = &'a ProxyEntry>) -> Vec<MirrorRow> {
    entries.into_iter().filter_map(MirrorRow::from_entry).collect()
}

fn host_of(url: &str) -> Option<String> {
    Url::parse(url).ok()?.host_str().map(str::to_string)
}

fn invalid_item(record: &AssetRecord, err: &FleetError) -> ItemResult {
    ItemResult::pending(
        record.proxy_port.unwrap_or(0),
        record.target_url().unwrap_or_default(),
        record.device_code.clone().unwrap_or_default(),
    )
    .fail(err.to_string())
}

/// Turn a per-port error into a failed outcome. Store failures propagate.
fn fold_outcome(
    record: &AssetRecord,
    outcome: FleetResult<PortOutcome>,
) -> FleetResult<PortOutcome> {
    match outcome {
        Ok(outcome) => Ok(outcome),
        Err(e) if e.is_store_failure() => Err(e),
        Err(e) => Ok(PortOutcome {
            port: record.proxy_port.unwrap_or(0),
            result: false,
            message: e.to_string(),
            mirror: MirrorStatus::Skipped,
        }),
    }
}
