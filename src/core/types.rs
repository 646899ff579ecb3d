use super::{DbError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Session identifier, unique within one engine.
pub type SessionId = u32;

/// The three logical datastores.
///
/// Startup survives restarts, running holds the applied configuration for
/// modules with at least one enabled subtree, candidate is a per-session
/// scratch copy derived from running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Datastore {
    Startup = 0,
    Running = 1,
    Candidate = 2,
}

impl Datastore {
    /// Suffix of the on-disk data file (`<repo>/data/<module>.<suffix>`).
    pub fn file_suffix(&self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Running => "running",
            Self::Candidate => "candidate",
        }
    }

    /// The datastore a commit from `self` actually persists into.
    /// Candidate commits land in running; the others persist in place.
    pub fn persistent_target(&self) -> Datastore {
        match self {
            Self::Candidate => Self::Running,
            other => *other,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::Startup),
            1 => Ok(Self::Running),
            2 => Ok(Self::Candidate),
            other => Err(DbError::InvalidArg(format!("unknown datastore tag {}", other))),
        }
    }
}

impl fmt::Display for Datastore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_suffix())
    }
}

/// Flags accepted by the edit primitives (bitmask in the wire contract,
/// plain fields here).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditFlags {
    /// Require all ancestors to exist already; never auto-create them.
    pub non_recursive: bool,
    /// set: the node must not exist yet. delete: the node must exist.
    pub strict: bool,
}

impl EditFlags {
    pub const STRICT: EditFlags = EditFlags {
        non_recursive: false,
        strict: true,
    };
    pub const NON_RECURSIVE: EditFlags = EditFlags {
        non_recursive: true,
        strict: false,
    };
}

/// Target position of a move on a user-ordered list or leaf-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovePosition {
    Before = 0,
    After = 1,
    First = 2,
    Last = 3,
}

/// Change operation as reported to subscribers iterating a commit's diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOper {
    Created,
    Modified,
    Deleted,
    Moved,
}

/// Session request-processing state machine.
///
/// Transitions happen only under the session's own mutex; the operational
/// data broker and its timeout are both just messages that drive it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Processing,
    WaitingForProviderData,
    DataLoaded,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datastore_tags_round_trip() {
        for tag in 0..=2u8 {
            let ds = Datastore::from_tag(tag).unwrap();
            assert_eq!(ds as u8, tag);
        }
        assert!(Datastore::from_tag(3).is_err());
    }

    #[test]
    fn candidate_persists_to_running() {
        assert_eq!(Datastore::Candidate.persistent_target(), Datastore::Running);
        assert_eq!(Datastore::Startup.persistent_target(), Datastore::Startup);
    }
}
