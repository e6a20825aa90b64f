//! redb-backed image of the store.
//!
//! The whole image is rewritten in one write transaction, so a crash
//! leaves either the previous image or the new one.

use std::path::Path;

use redb::{Database, ReadTransaction, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::slots::SlotId;
use crate::tables::*;
use crate::types::{Balancer, Context, Domain, Host, Node, SessionRecord};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

#[derive(Serialize, Deserialize)]
struct StoredSlot<T> {
    generation: u64,
    record: T,
}

/// `(slot id, generation, record)` rows of every table.
#[derive(Debug, Default)]
pub(crate) struct Image {
    pub nodes: Vec<(SlotId, u64, Node)>,
    pub hosts: Vec<(SlotId, u64, Host)>,
    pub contexts: Vec<(SlotId, u64, Context)>,
    pub balancers: Vec<(SlotId, u64, Balancer)>,
    pub domains: Vec<(SlotId, u64, Domain)>,
    pub sessions: Vec<(SlotId, u64, SessionRecord)>,
    pub version: u64,
}

pub(crate) struct Persistence {
    db: Database,
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence").finish_non_exhaustive()
    }
}

impl Persistence {
    /// Open (or create) the image file.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let persistence = Self { db };
        persistence.ensure_tables()?;
        debug!(?path, "store image opened");
        Ok(persistence)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for def in [NODES, HOSTS, CONTEXTS, BALANCERS, DOMAINS, SESSIONS] {
            txn.open_table(def).map_err(map_err!(Table))?;
        }
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn save(&self, image: &Image) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        write_table(&txn, NODES, &image.nodes)?;
        write_table(&txn, HOSTS, &image.hosts)?;
        write_table(&txn, CONTEXTS, &image.contexts)?;
        write_table(&txn, BALANCERS, &image.balancers)?;
        write_table(&txn, DOMAINS, &image.domains)?;
        write_table(&txn, SESSIONS, &image.sessions)?;
        {
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            meta.insert(VERSION_KEY, image.version)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            nodes = image.nodes.len(),
            contexts = image.contexts.len(),
            version = image.version,
            "store image saved"
        );
        Ok(())
    }

    pub fn load(&self) -> StateResult<Image> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let version = {
            let meta = txn.open_table(META).map_err(map_err!(Table))?;
            meta.get(VERSION_KEY)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0)
        };
        Ok(Image {
            nodes: read_table(&txn, NODES)?,
            hosts: read_table(&txn, HOSTS)?,
            contexts: read_table(&txn, CONTEXTS)?,
            balancers: read_table(&txn, BALANCERS)?,
            domains: read_table(&txn, DOMAINS)?,
            sessions: read_table(&txn, SESSIONS)?,
            version,
        })
    }
}

fn write_table<T: Serialize>(
    txn: &WriteTransaction,
    def: SlotTableDef,
    rows: &[(SlotId, u64, T)],
) -> StateResult<()> {
    txn.delete_table(def).map_err(map_err!(Table))?;
    let mut table = txn.open_table(def).map_err(map_err!(Table))?;
    for (id, generation, record) in rows {
        let value = serde_json::to_vec(&StoredSlot {
            generation: *generation,
            record,
        })
        .map_err(map_err!(Serialize))?;
        table
            .insert(*id, value.as_slice())
            .map_err(map_err!(Write))?;
    }
    Ok(())
}

fn read_table<T: DeserializeOwned>(
    txn: &ReadTransaction,
    def: SlotTableDef,
) -> StateResult<Vec<(SlotId, u64, T)>> {
    let table = txn.open_table(def).map_err(map_err!(Table))?;
    let mut rows = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        let slot: StoredSlot<T> =
            serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        rows.push((key.value(), slot.generation, slot.record));
    }
    Ok(rows)
}
