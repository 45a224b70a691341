//! Frame-model collaborator.
//!
//! The protocol core only ever talks to frame data through
//! [`FrameStore`] (one database) and [`FrameBackend`] (the set of
//! databases). [`MemoryBackend`] is the in-process implementation used by
//! the server binary and the tests.

mod frame;
mod memory;

pub use frame::{Facet, Frame, Slot};
pub use memory::{MemoryBackend, MemoryFrameStore};

use crate::protocol::ErrorCode;

/// Opaque token identifying who holds a frame lock.
pub type LockOwner = u64;

/// Facet that carries ordinary values, including inheritance links.
pub const VALUE_FACET: &str = "VALUE";

/// Facet that carries type restrictions.
pub const SEM_FACET: &str = "SEM";

/// The two built-in inheritance relations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relation {
    IsA,
    PartOf,
}

impl Relation {
    pub fn from_wire(byte: u8) -> Result<Self, ErrorCode> {
        match byte {
            0 => Ok(Relation::IsA),
            1 => Ok(Relation::PartOf),
            _ => Err(ErrorCode::UnknownInheritanceType),
        }
    }

    pub fn as_wire(self) -> u8 {
        match self {
            Relation::IsA => 0,
            Relation::PartOf => 1,
        }
    }

    /// Slot whose `VALUE` fillers are the links for this relation.
    pub fn slot_name(self) -> &'static str {
        match self {
            Relation::IsA => "IS-A",
            Relation::PartOf => "PART-OF",
        }
    }
}

/// One database of frames.
///
/// Every operation reports failures with the specific protocol status the
/// server forwards to the client.
pub trait FrameStore: Send {
    fn name(&self) -> &str;

    /// Names of all frames currently visible, sorted.
    fn frame_names(&self) -> Vec<String>;

    /// Current version of a frame, including uncommitted changes.
    fn get_frame(&self, name: &str) -> Option<Frame>;

    /// Version of a frame in backing storage, ignoring uncommitted changes.
    fn committed_frame(&self, name: &str) -> Option<Frame>;

    fn create_frame(&mut self, name: &str) -> Result<(), ErrorCode>;
    fn delete_frame(&mut self, name: &str) -> Result<(), ErrorCode>;

    /// Replace an existing frame wholesale.
    fn update_frame(&mut self, frame: Frame) -> Result<(), ErrorCode>;

    /// Drop uncommitted changes to one frame and return the committed version.
    fn revert_frame(&mut self, name: &str) -> Result<Frame, ErrorCode>;

    fn get_fillers(&self, frame: &str, slot: &str, facet: &str) -> Result<Vec<String>, ErrorCode>;
    fn add_filler(&mut self, frame: &str, slot: &str, facet: &str, filler: &str)
        -> Result<(), ErrorCode>;
    fn erase_filler(&mut self, frame: &str, slot: &str, facet: &str, filler: &str)
        -> Result<(), ErrorCode>;

    /// Lock a frame for `owner`. Relocking by the same owner succeeds.
    fn lock_frame(&mut self, name: &str, owner: LockOwner) -> Result<(), ErrorCode>;
    fn unlock_frame(&mut self, name: &str, owner: LockOwner) -> Result<(), ErrorCode>;
    fn lock_owner(&self, name: &str) -> Option<LockOwner>;

    fn is_locked(&self, name: &str) -> bool {
        self.lock_owner(name).is_some()
    }

    /// Drop every lock held by `owner`, returning the frames released.
    fn release_locks(&mut self, owner: LockOwner) -> Vec<String>;

    /// True if `ancestor` is `frame` or reachable from it via `relation`.
    fn inherits(&self, relation: Relation, frame: &str, ancestor: &str) -> Result<bool, ErrorCode>;

    fn is_a(&self, frame: &str, ancestor: &str) -> Result<bool, ErrorCode> {
        self.inherits(Relation::IsA, frame, ancestor)
    }

    fn part_of(&self, frame: &str, ancestor: &str) -> Result<bool, ErrorCode> {
        self.inherits(Relation::PartOf, frame, ancestor)
    }

    /// Own fillers followed by inherited ones, depth first, without repeats.
    fn inherit_fillers(
        &self,
        relation: Relation,
        frame: &str,
        slot: &str,
        facet: &str,
    ) -> Result<Vec<String>, ErrorCode>;

    /// Facet names available on `slot` through IS-A inheritance.
    fn inheritable_facets(&self, frame: &str, slot: &str) -> Result<Vec<String>, ErrorCode>;

    /// Whether `filler` satisfies the `SEM` restrictions on `slot`.
    fn check_restrictions(&self, frame: &str, slot: &str, filler: &str) -> Result<bool, ErrorCode>;

    fn create_index(&mut self, slot: &str) -> Result<(), ErrorCode>;
    fn index_names(&self) -> Vec<String>;

    /// Frames that have `slot`, or every frame when `slot` is `None`.
    fn frames_with_slot(&self, slot: Option<&str>) -> Vec<String>;

    /// Frames whose `slot`/`facet` contains `filler`.
    fn retrieve(&self, slot: &str, facet: &str, filler: &str) -> Vec<String>;

    fn begin_transaction(&mut self) -> Result<(), ErrorCode>;
    fn in_transaction(&self) -> bool;
    fn commit(&mut self) -> Result<(), ErrorCode>;
    fn rollback(&mut self) -> Result<(), ErrorCode>;
}

/// The set of databases a server can serve.
pub trait FrameBackend: Send {
    /// Names of the known databases.
    fn list(&self) -> Vec<String>;

    fn open(&mut self, name: &str) -> Result<Box<dyn FrameStore>, ErrorCode>;

    fn create(&mut self, name: &str) -> Result<Box<dyn FrameStore>, ErrorCode>;
}
