use log::info;
use scopeprobe_common::ScopeId;

use crate::error::ProbeError;
use crate::table::{FixedTable, TableError, UpdateMode};

/// Default-deny set of monitored scopes.
///
/// Hooks only ever call [`AllowList::is_monitored`]; population belongs to
/// the collaborator.
#[derive(Debug)]
pub struct AllowList {
    table: FixedTable<u32, u8>,
}

impl AllowList {
    pub fn new(name: &'static str, capacity: usize) -> Result<Self, ProbeError> {
        Ok(Self {
            table: FixedTable::new(name, capacity)?,
        })
    }

    pub fn allow(&self, scope: ScopeId) -> Result<(), TableError> {
        self.table.insert(scope, &1, UpdateMode::Any)?;
        info!("{}: monitoring scope {}", self.table.name(), scope);
        Ok(())
    }

    pub fn revoke(&self, scope: ScopeId) -> Result<(), TableError> {
        self.table.remove(scope)?;
        info!("{}: stopped monitoring scope {}", self.table.name(), scope);
        Ok(())
    }

    #[inline]
    pub fn is_monitored(&self, scope: ScopeId) -> bool {
        self.table.contains_key(scope)
    }

    pub fn scopes(&self) -> Vec<ScopeId> {
        self.table.iter().map(|(scope, _)| scope).collect()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }
}
