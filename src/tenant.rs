use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::catalog::SlotCatalog;
use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;

/// One engine per organization, keyed by the database name a client
/// connects with. Each organization has its own WAL and compactor; all of
/// them share the slot grid.
pub struct OrgManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    catalog: Arc<SlotCatalog>,
    compact_threshold: u64,
}

/// The WAL file stem of an organization. Only names that are already safe
/// stems are accepted, so two names never share a log.
fn file_stem(org: &str) -> io::Result<&str> {
    if org.len() > MAX_ORG_NAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "organization name too long",
        ));
    }
    if org.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "empty organization name",
        ));
    }
    if !org
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("organization name {org:?} may only contain letters, digits, '_' and '-'"),
        ));
    }
    Ok(org)
}

impl OrgManager {
    pub fn new(data_dir: PathBuf, catalog: Arc<SlotCatalog>, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            catalog,
            compact_threshold,
        }
    }

    /// Get or lazily open the engine for `org`. Engines are keyed by their
    /// WAL file stem.
    pub fn get_or_create(&self, org: &str) -> io::Result<Arc<Engine>> {
        let stem = file_stem(org)?;
        if let Some(engine) = self.engines.get(stem) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_ORGS {
            return Err(io::Error::other("too many organizations"));
        }

        // Two first connections may race here; the entry API keeps one.
        let entry = self.engines.entry(stem.to_string());
        if let Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{stem}.wal"));
        let engine = Arc::new(Engine::new(
            wal_path,
            self.catalog.clone(),
            Arc::new(NotifyHub::new()),
        )?);
        tokio::spawn(compactor::run_compactor(engine.clone(), self.compact_threshold));

        entry.insert(engine.clone());
        metrics::gauge!(crate::observability::ORGS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!(org, "organization opened");
        Ok(engine)
    }
}
