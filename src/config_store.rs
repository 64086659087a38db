//! Durable JSON document of desired proxy entries
//!
//! Every mutation is a read-modify-write of the full document, written to a
//! temp file and renamed into place.

use crate::entry::{ProxyDocument, ProxyEntry};
use crate::error::{FleetError, FleetResult};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// File-backed store for [`ProxyDocument`]
pub struct ConfigStore {
    path: PathBuf,
    management_port: u16,
    lock: Mutex<()>,
}

impl ConfigStore {
    pub fn new<P: AsRef<Path>>(path: P, management_port: u16) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            management_port,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole document, initializing it when the file is absent or
    /// empty.
    pub fn document(&self) -> FleetResult<ProxyDocument> {
        let _guard = self.lock.lock();
        self.read_or_init()
    }

    /// Current entry list
    pub fn load(&self) -> FleetResult<Vec<ProxyEntry>> {
        Ok(self.document()?.entries)
    }

    /// Overwrite the entry list.
    pub fn replace(&self, entries: Vec<ProxyEntry>) -> FleetResult<()> {
        self.modify(|current| {
            *current = entries;
            Ok(())
        })
    }

    /// Add an entry. An entry for the same port and url is replaced in place;
    /// the same port with another url is a conflict.
    pub fn upsert_entry(&self, entry: ProxyEntry) -> FleetResult<()> {
        self.modify(|entries| {
            if let Some(existing) = entries
                .iter()
                .find(|e| e.proxy_port == entry.proxy_port && e.url != entry.url)
            {
                return Err(FleetError::PortConflict {
                    port: entry.proxy_port,
                    existing: existing.url.clone(),
                });
            }

            match entries
                .iter_mut()
                .find(|e| e.proxy_port == entry.proxy_port && e.url == entry.url)
            {
                Some(slot) => *slot = entry,
                None => entries.push(entry),
            }
            Ok(())
        })
    }

    /// Remove every entry on `port`. Returns how many were removed.
    pub fn remove_by_port(&self, port: u16) -> FleetResult<usize> {
        self.modify(|entries| Ok(retain_counting(entries, |e| e.proxy_port != port)))
    }

    /// Keep only entries whose port is in `keep`.
    pub fn remove_all_except_ports(&self, keep: &HashSet<u16>) -> FleetResult<usize> {
        self.modify(|entries| Ok(retain_counting(entries, |e| keep.contains(&e.proxy_port))))
    }

    /// Remove entries matching url, port and device type.
    pub fn remove_matching(&self, url: &str, port: u16, device_type: &str) -> FleetResult<usize> {
        self.modify(|entries| {
            Ok(retain_counting(entries, |e| {
                !(e.url == url
                    && e.proxy_port == port
                    && e.device_type.eq_ignore_ascii_case(device_type))
            }))
        })
    }

    /// Mark entries on `port` unused. Returns how many were touched.
    pub fn disable_by_port(&self, port: u16) -> FleetResult<usize> {
        self.modify(|entries| {
            let mut touched = 0;
            for entry in entries.iter_mut().filter(|e| e.proxy_port == port) {
                entry.use_flag = false;
                touched += 1;
            }
            Ok(touched)
        })
    }

    pub fn clear_all(&self) -> FleetResult<()> {
        self.modify(|entries| {
            entries.clear();
            Ok(())
        })
    }

    fn modify<R>(&self, f: impl FnOnce(&mut Vec<ProxyEntry>) -> FleetResult<R>) -> FleetResult<R> {
        let _guard = self.lock.lock();
        let mut doc = self.read_or_init()?;
        let result = f(&mut doc.entries)?;
        self.write(&doc)?;
        Ok(result)
    }

    fn read_or_init(&self) -> FleetResult<ProxyDocument> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(FleetError::persistence(&self.path, e)),
        };

        if content.trim().is_empty() {
            info!("Proxy config missing at {}, creating a new one", self.path.display());
            let doc = ProxyDocument::empty(self.management_port);
            self.write(&doc)?;
            return Ok(doc);
        }

        serde_json::from_str(&content).map_err(|e| FleetError::persistence(&self.path, e))
    }

    fn write(&self, doc: &ProxyDocument) -> FleetResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| FleetError::persistence(&self.path, e))?;
        }

        let json =
            serde_json::to_string_pretty(doc).map_err(|e| FleetError::persistence(&self.path, e))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "proxy_config.json".to_string());
        let tmp = self.path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

        fs::write(&tmp, json).map_err(|e| FleetError::persistence(&self.path, e))?;
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(FleetError::persistence(&self.path, e));
        }

        debug!("Saved {} proxy entries to {}", doc.entries.len(), self.path.display());
        Ok(())
    }
}

fn retain_counting(entries: &mut Vec<ProxyEntry>, keep: impl Fn(&ProxyEntry) -> bool) -> usize {
    let before = entries.len();
    entries.retain(|e| keep(e));
    before - entries.len()
}
