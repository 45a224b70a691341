//! In-memory frame databases.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use super::{Frame, FrameBackend, FrameStore, LockOwner, Relation, SEM_FACET, VALUE_FACET};
use crate::protocol::ErrorCode;

/// One database held entirely in memory.
///
/// `committed` plays the role of backing storage. While a transaction is
/// open every write lands in `cache` instead (a `None` entry records a
/// deletion); commit folds the cache into `committed`, rollback throws it
/// away.
#[derive(Debug, Clone, Default)]
pub struct MemoryFrameStore {
    name: String,
    committed: BTreeMap<String, Frame>,
    cache: Option<BTreeMap<String, Option<Frame>>>,
    locks: HashMap<String, LockOwner>,
    indexes: BTreeSet<String>,
}

impl MemoryFrameStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Build a store pre-populated with `frames`.
    pub fn with_frames(name: impl Into<String>, frames: impl IntoIterator<Item = Frame>) -> Self {
        let mut store = Self::new(name);
        for frame in frames {
            store.committed.insert(frame.name().to_string(), frame);
        }
        store
    }

    fn current(&self, name: &str) -> Option<&Frame> {
        if let Some(entry) = self.cache.as_ref().and_then(|c| c.get(name)) {
            return entry.as_ref();
        }
        self.committed.get(name)
    }

    fn require(&self, name: &str) -> Result<&Frame, ErrorCode> {
        self.current(name).ok_or(ErrorCode::NoSuchFrame)
    }

    fn write(&mut self, name: &str, frame: Option<Frame>) {
        match (&mut self.cache, frame) {
            (Some(cache), frame) => {
                cache.insert(name.to_string(), frame);
            }
            (None, Some(frame)) => {
                self.committed.insert(name.to_string(), frame);
            }
            (None, None) => {
                self.committed.remove(name);
            }
        }
    }

    fn modify<F>(&mut self, name: &str, change: F) -> Result<(), ErrorCode>
    where
        F: FnOnce(&mut Frame),
    {
        let mut frame = self.require(name)?.clone();
        change(&mut frame);
        self.write(name, Some(frame));
        Ok(())
    }

    /// Depth-first walk over `relation` links starting at (and including)
    /// `start`. Each frame is visited at most once.
    fn walk(&self, relation: Relation, start: &str) -> Vec<&Frame> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut stack = vec![start];
        while let Some(name) = stack.pop() {
            if !seen.insert(name) {
                continue;
            }
            let Some(frame) = self.current(name) else {
                continue;
            };
            order.push(frame);
            if let Some(links) = frame.fillers(relation.slot_name(), VALUE_FACET) {
                stack.extend(links.iter().rev().map(String::as_str));
            }
        }
        order
    }
}

impl FrameStore for MemoryFrameStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn frame_names(&self) -> Vec<String> {
        let mut names: BTreeSet<&str> = self.committed.keys().map(String::as_str).collect();
        if let Some(cache) = &self.cache {
            for (name, frame) in cache {
                if frame.is_some() {
                    names.insert(name);
                } else {
                    names.remove(name.as_str());
                }
            }
        }
        names.into_iter().map(str::to_string).collect()
    }

    fn get_frame(&self, name: &str) -> Option<Frame> {
        self.current(name).cloned()
    }

    fn committed_frame(&self, name: &str) -> Option<Frame> {
        self.committed.get(name).cloned()
    }

    fn create_frame(&mut self, name: &str) -> Result<(), ErrorCode> {
        if name.is_empty() {
            return Err(ErrorCode::InvalidParameters);
        }
        if self.current(name).is_some() {
            return Err(ErrorCode::FrameExists);
        }
        self.write(name, Some(Frame::new(name)));
        Ok(())
    }

    fn delete_frame(&mut self, name: &str) -> Result<(), ErrorCode> {
        self.require(name)?;
        self.write(name, None);
        self.locks.remove(name);
        Ok(())
    }

    fn update_frame(&mut self, frame: Frame) -> Result<(), ErrorCode> {
        let name = frame.name().to_string();
        self.require(&name)?;
        self.write(&name, Some(frame));
        Ok(())
    }

    fn revert_frame(&mut self, name: &str) -> Result<Frame, ErrorCode> {
        if let Some(cache) = &mut self.cache {
            cache.remove(name);
        }
        self.committed_frame(name).ok_or(ErrorCode::NoSuchFrame)
    }

    fn get_fillers(&self, frame: &str, slot: &str, facet: &str) -> Result<Vec<String>, ErrorCode> {
        self.require(frame)?
            .fillers(slot, facet)
            .map(<[String]>::to_vec)
            .ok_or(ErrorCode::NoSuchSlot)
    }

    fn add_filler(
        &mut self,
        frame: &str,
        slot: &str,
        facet: &str,
        filler: &str,
    ) -> Result<(), ErrorCode> {
        self.modify(frame, |f| {
            f.add_filler(slot, facet, filler);
        })
    }

    fn erase_filler(
        &mut self,
        frame: &str,
        slot: &str,
        facet: &str,
        filler: &str,
    ) -> Result<(), ErrorCode> {
        self.modify(frame, |f| {
            f.erase_filler(slot, facet, filler);
        })
    }

    fn lock_frame(&mut self, name: &str, owner: LockOwner) -> Result<(), ErrorCode> {
        self.require(name)?;
        match self.locks.get(name) {
            Some(&holder) if holder != owner => Err(ErrorCode::AlreadyLocked),
            _ => {
                self.locks.insert(name.to_string(), owner);
                Ok(())
            }
        }
    }

    fn unlock_frame(&mut self, name: &str, owner: LockOwner) -> Result<(), ErrorCode> {
        match self.locks.get(name) {
            Some(&holder) if holder == owner => {
                self.locks.remove(name);
                Ok(())
            }
            _ => Err(ErrorCode::NotLocked),
        }
    }

    fn lock_owner(&self, name: &str) -> Option<LockOwner> {
        self.locks.get(name).copied()
    }

    fn release_locks(&mut self, owner: LockOwner) -> Vec<String> {
        let mut released: Vec<String> = self
            .locks
            .iter()
            .filter(|(_, &holder)| holder == owner)
            .map(|(name, _)| name.clone())
            .collect();
        released.sort();
        for name in &released {
            self.locks.remove(name);
        }
        released
    }

    fn inherits(&self, relation: Relation, frame: &str, ancestor: &str) -> Result<bool, ErrorCode> {
        self.require(frame)?;
        Ok(self
            .walk(relation, frame)
            .iter()
            .any(|f| f.name() == ancestor))
    }

    fn inherit_fillers(
        &self,
        relation: Relation,
        frame: &str,
        slot: &str,
        facet: &str,
    ) -> Result<Vec<String>, ErrorCode> {
        self.require(frame)?;
        let mut seen = HashSet::new();
        let mut fillers = Vec::new();
        for f in self.walk(relation, frame) {
            for filler in f.fillers(slot, facet).unwrap_or_default() {
                if seen.insert(filler.as_str()) {
                    fillers.push(filler.clone());
                }
            }
        }
        Ok(fillers)
    }

    fn inheritable_facets(&self, frame: &str, slot: &str) -> Result<Vec<String>, ErrorCode> {
        self.require(frame)?;
        let mut seen = HashSet::new();
        let mut facets = Vec::new();
        for f in self.walk(Relation::IsA, frame) {
            for name in f.facet_names(slot) {
                if seen.insert(name) {
                    facets.push(name.to_string());
                }
            }
        }
        Ok(facets)
    }

    fn check_restrictions(&self, frame: &str, slot: &str, filler: &str) -> Result<bool, ErrorCode> {
        let restrictions = self.inherit_fillers(Relation::IsA, frame, slot, SEM_FACET)?;
        if restrictions.is_empty() {
            return Ok(true);
        }
        if self.current(filler).is_none() {
            return Ok(false);
        }
        let types: HashSet<&str> = self
            .walk(Relation::IsA, filler)
            .into_iter()
            .map(Frame::name)
            .collect();
        Ok(restrictions.iter().any(|r| types.contains(r.as_str())))
    }

    fn create_index(&mut self, slot: &str) -> Result<(), ErrorCode> {
        if slot.is_empty() {
            return Err(ErrorCode::InvalidParameters);
        }
        self.indexes.insert(slot.to_string());
        Ok(())
    }

    fn index_names(&self) -> Vec<String> {
        self.indexes.iter().cloned().collect()
    }

    fn frames_with_slot(&self, slot: Option<&str>) -> Vec<String> {
        self.frame_names()
            .into_iter()
            .filter(|name| match slot {
                None => true,
                Some(slot) => self.current(name).is_some_and(|f| f.slot(slot).is_some()),
            })
            .collect()
    }

    fn retrieve(&self, slot: &str, facet: &str, filler: &str) -> Vec<String> {
        self.frame_names()
            .into_iter()
            .filter(|name| {
                self.current(name)
                    .and_then(|f| f.fillers(slot, facet))
                    .is_some_and(|fillers| fillers.iter().any(|f| f == filler))
            })
            .collect()
    }

    fn begin_transaction(&mut self) -> Result<(), ErrorCode> {
        if self.cache.is_some() {
            return Err(ErrorCode::TransactionPending);
        }
        self.cache = Some(BTreeMap::new());
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.cache.is_some()
    }

    fn commit(&mut self) -> Result<(), ErrorCode> {
        let cache = self.cache.take().ok_or(ErrorCode::NoSuchTransaction)?;
        for (name, frame) in cache {
            match frame {
                Some(frame) => {
                    self.committed.insert(name, frame);
                }
                None => {
                    self.committed.remove(&name);
                }
            }
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), ErrorCode> {
        self.cache
            .take()
            .map(|_| ())
            .ok_or(ErrorCode::NoSuchTransaction)
    }
}

/// Databases kept in memory, keyed by name.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    databases: BTreeMap<String, MemoryFrameStore>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a database.
    pub fn with_database(mut self, name: &str, frames: impl IntoIterator<Item = Frame>) -> Self {
        self.databases
            .insert(name.to_string(), MemoryFrameStore::with_frames(name, frames));
        self
    }
}

impl FrameBackend for MemoryBackend {
    fn list(&self) -> Vec<String> {
        self.databases.keys().cloned().collect()
    }

    fn open(&mut self, name: &str) -> Result<Box<dyn FrameStore>, ErrorCode> {
        self.databases
            .get(name)
            .cloned()
            .map(|store| Box::new(store) as Box<dyn FrameStore>)
            .ok_or(ErrorCode::NoSuchDatabase)
    }

    fn create(&mut self, name: &str) -> Result<Box<dyn FrameStore>, ErrorCode> {
        if name.is_empty() {
            return Err(ErrorCode::InvalidParameters);
        }
        if self.databases.contains_key(name) {
            return Err(ErrorCode::DatabaseExists);
        }
        let store = MemoryFrameStore::new(name);
        self.databases.insert(name.to_string(), store.clone());
        Ok(Box::new(store))
    }
}
