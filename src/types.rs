//! Registry of allocation types announced by the host runtime.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Runtime-assigned type identifier.  `0` marks an allocation of unknown type.
pub type TypeId = u32;

pub const UNKNOWN_TYPE: TypeId = 0;

/// Byte offset within an object -> field name.
pub type FieldMap = BTreeMap<usize, String>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeInfo {
    pub name: String,
    pub fields: Option<FieldMap>,
}

impl TypeInfo {
    pub fn new(name: impl Into<String>, fields: Option<FieldMap>) -> Self {
        TypeInfo {
            name: name.into(),
            fields,
        }
    }

    /// Name of the field stored at `offset`, or a positional placeholder
    /// when no field metadata is known.
    pub fn field_label(&self, offset: usize) -> String {
        field_label(self.fields.as_ref(), offset)
    }
}

pub(crate) fn field_label(fields: Option<&FieldMap>, offset: usize) -> String {
    fields
        .and_then(|fields| fields.get(&offset))
        .cloned()
        .unwrap_or_else(|| format!("field at offset {}", offset))
}

/// Append-only type table plus live object counts per type.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    infos: FxHashMap<TypeId, TypeInfo>,
    counts: FxHashMap<TypeId, usize>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `type_id` if it is not known yet.  Existing entries are kept,
    /// except that field metadata is filled in if it was missing before.
    pub fn register(&mut self, type_id: TypeId, name: &str, fields: Option<&FieldMap>) {
        if type_id == UNKNOWN_TYPE {
            return;
        }
        match self.infos.get_mut(&type_id) {
            Some(info) => {
                if info.fields.is_none() {
                    info.fields = fields.cloned();
                }
            }
            None => {
                self.infos
                    .insert(type_id, TypeInfo::new(name, fields.cloned()));
            }
        }
    }

    pub fn get(&self, type_id: TypeId) -> Option<&TypeInfo> {
        self.infos.get(&type_id)
    }

    pub fn name(&self, type_id: TypeId) -> &str {
        self.infos
            .get(&type_id)
            .map(|info| info.name.as_str())
            .unwrap_or("<unknown>")
    }

    pub fn field_label(&self, type_id: TypeId, offset: usize) -> String {
        field_label(
            self.infos.get(&type_id).and_then(|info| info.fields.as_ref()),
            offset,
        )
    }

    pub(crate) fn increment(&mut self, type_id: TypeId) {
        if type_id != UNKNOWN_TYPE {
            *self.counts.entry(type_id).or_insert(0) += 1;
        }
    }

    pub(crate) fn decrement(&mut self, type_id: TypeId) {
        if let Some(count) = self.counts.get_mut(&type_id) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn live_count(&self, type_id: TypeId) -> usize {
        self.counts.get(&type_id).copied().unwrap_or(0)
    }

    /// Types with at least one live object, in ascending id order.
    pub fn live_types(&self) -> Vec<(TypeId, usize)> {
        let mut live: Vec<_> = self
            .counts
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(id, count)| (*id, *count))
            .collect();
        live.sort_unstable();
        live
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}
