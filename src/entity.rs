use std::collections::HashMap;
use std::fmt;

use crate::mods::FileId;
use crate::value::Value;

/// Handle to one live entity. Minted at creation, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub(crate) u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

/// A live instance of a script file: the file it runs, the id the host
/// knows it by, and its member values.
#[derive(Debug)]
pub(crate) struct Entity {
    pub file: FileId,
    pub host_id: u64,
    pub members: Vec<Value>,
}

#[derive(Debug, Default)]
pub(crate) struct EntityTable {
    entities: HashMap<EntityId, Entity>,
    next: u64,
}

impl EntityTable {
    pub(crate) fn insert(&mut self, file: FileId, host_id: u64, members: Vec<Value>) -> EntityId {
        let id = EntityId(self.next);
        self.next += 1;
        self.entities.insert(id, Entity { file, host_id, members });
        id
    }

    pub(crate) fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: EntityId) -> bool {
        self.entities.remove(&id).is_some()
    }

    /// Entities running the given file, in stable id order.
    pub(crate) fn referencing(&self, file: FileId) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self
            .entities
            .iter()
            .filter(|(_, e)| e.file == file)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }
}
