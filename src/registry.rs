use std::collections::HashMap;
use std::fmt;

/// Stable identity of one `(entity type, on-fn name)` pair, assigned on
/// first sight whether that comes from a host query or a script load.
/// Never invalidated: scripts may come and go without the id moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OnFnId(pub(crate) u64);

impl fmt::Display for OnFnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "on_fn#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct OnFnEntry {
    pub entity_type: String,
    pub on_fn_name: String,
    pub id: OnFnId,
}

#[derive(Debug, Default)]
pub(crate) struct OnFnRegistry {
    entries: Vec<OnFnEntry>,
    lookup: HashMap<String, OnFnId>,
}

impl OnFnRegistry {
    pub(crate) fn get_or_insert(&mut self, entity_type: &str, on_fn_name: &str) -> OnFnId {
        let key = format!("{entity_type}::{on_fn_name}");
        if let Some(id) = self.lookup.get(&key) {
            return *id;
        }
        let id = OnFnId(self.entries.len() as u64);
        self.entries.push(OnFnEntry {
            entity_type: entity_type.to_string(),
            on_fn_name: on_fn_name.to_string(),
            id,
        });
        self.lookup.insert(key, id);
        id
    }

    pub(crate) fn entry(&self, id: OnFnId) -> Option<&OnFnEntry> {
        self.entries.get(id.0 as usize)
    }

    pub(crate) fn entries(&self) -> &[OnFnEntry] {
        &self.entries
    }
}
