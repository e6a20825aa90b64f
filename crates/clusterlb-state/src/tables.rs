//! redb table definitions for the persisted store image.
//!
//! One table per entity, keyed by slot id. Values are JSON-serialized
//! `{generation, record}` pairs so slot ids and handles survive a
//! restart unchanged.

use redb::TableDefinition;

pub(crate) type SlotTableDef = TableDefinition<'static, u32, &'static [u8]>;

pub(crate) const NODES: SlotTableDef = TableDefinition::new("nodes");
pub(crate) const HOSTS: SlotTableDef = TableDefinition::new("hosts");
pub(crate) const CONTEXTS: SlotTableDef = TableDefinition::new("contexts");
pub(crate) const BALANCERS: SlotTableDef = TableDefinition::new("balancers");
pub(crate) const DOMAINS: SlotTableDef = TableDefinition::new("domains");
pub(crate) const SESSIONS: SlotTableDef = TableDefinition::new("sessions");

/// Scalar store state (`version`).
pub(crate) const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub(crate) const VERSION_KEY: &str = "version";
