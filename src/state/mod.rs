// ============================================================================
// Managed Instance Lifecycle States
// ============================================================================
//
// Every managed instance is in exactly one `PcState`. States are plain
// constants shared by all instances; the per-instance data lives in the
// state manager. Lifecycle events are resolved by the pure `transition`
// function in `table.rs`, which returns the next state and the side effects
// the owning context must perform, in order.
//
// ============================================================================

mod table;

pub use table::{initialize_effects, transition};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PcState {
    /// Not managed.
    Transient,
    /// Transient, transactional, unchanged.
    TClean,
    /// Transient, transactional, changed in this transaction.
    TDirty,
    /// Persisted in this transaction.
    PNew,
    /// Persisted by reachability only; discarded unless made nonprovisional.
    PNewProvisional,
    /// New and deleted before any flush.
    PNewDeleted,
    /// New, flushed, then deleted; the delete is not flushed yet.
    PNewFlushedDeleted,
    /// New, flushed, deleted, and the delete flushed.
    PNewFlushedDeletedFlushed,
    PClean,
    PDirty,
    PDeleted,
    PDeletedFlushed,
    /// Persistent with no field data loaded.
    Hollow,
    PNonTrans,
    /// Persisted outside a transaction; enlisted at the next begin.
    PNonTransNew,
    /// Changed outside a transaction; enlisted at the next begin.
    PNonTransDirty,
    /// Deleted outside a transaction; enlisted at the next begin.
    PNonTransDeleted,
    /// Embedded value copied out of its owner; never tracked.
    ECopy,
    EClean,
    EDirty,
    EDeleted,
    ENonTrans,
}

impl PcState {
    pub const ALL: [PcState; 22] = [
        PcState::Transient,
        PcState::TClean,
        PcState::TDirty,
        PcState::PNew,
        PcState::PNewProvisional,
        PcState::PNewDeleted,
        PcState::PNewFlushedDeleted,
        PcState::PNewFlushedDeletedFlushed,
        PcState::PClean,
        PcState::PDirty,
        PcState::PDeleted,
        PcState::PDeletedFlushed,
        PcState::Hollow,
        PcState::PNonTrans,
        PcState::PNonTransNew,
        PcState::PNonTransDirty,
        PcState::PNonTransDeleted,
        PcState::ECopy,
        PcState::EClean,
        PcState::EDirty,
        PcState::EDeleted,
        PcState::ENonTrans,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PcState::Transient => "TRANSIENT",
            PcState::TClean => "TCLEAN",
            PcState::TDirty => "TDIRTY",
            PcState::PNew => "PNEW",
            PcState::PNewProvisional => "PNEWPROVISIONAL",
            PcState::PNewDeleted => "PNEWDELETED",
            PcState::PNewFlushedDeleted => "PNEWFLUSHEDDELETED",
            PcState::PNewFlushedDeletedFlushed => "PNEWFLUSHEDDELETEDFLUSHED",
            PcState::PClean => "PCLEAN",
            PcState::PDirty => "PDIRTY",
            PcState::PDeleted => "PDELETED",
            PcState::PDeletedFlushed => "PDELETEDFLUSHED",
            PcState::Hollow => "HOLLOW",
            PcState::PNonTrans => "PNONTRANS",
            PcState::PNonTransNew => "PNONTRANSNEW",
            PcState::PNonTransDirty => "PNONTRANSDIRTY",
            PcState::PNonTransDeleted => "PNONTRANSDELETED",
            PcState::ECopy => "ECOPY",
            PcState::EClean => "ECLEAN",
            PcState::EDirty => "EDIRTY",
            PcState::EDeleted => "EDELETED",
            PcState::ENonTrans => "ENONTRANS",
        }
    }

    pub fn from_name(name: &str) -> Option<PcState> {
        let upper = name.to_ascii_uppercase();
        PcState::ALL.iter().copied().find(|s| s.name() == upper)
    }

    pub fn is_transactional(&self) -> bool {
        matches!(
            self,
            PcState::TClean
                | PcState::TDirty
                | PcState::PNew
                | PcState::PNewProvisional
                | PcState::PNewDeleted
                | PcState::PNewFlushedDeleted
                | PcState::PNewFlushedDeletedFlushed
                | PcState::PClean
                | PcState::PDirty
                | PcState::PDeleted
                | PcState::PDeletedFlushed
                | PcState::EClean
                | PcState::EDirty
                | PcState::EDeleted
        )
    }

    pub fn is_pending_transactional(&self) -> bool {
        matches!(
            self,
            PcState::PNonTransNew | PcState::PNonTransDirty | PcState::PNonTransDeleted
        )
    }

    pub fn is_persistent(&self) -> bool {
        !matches!(
            self,
            PcState::Transient | PcState::TClean | PcState::TDirty | PcState::ECopy
        )
    }

    pub fn is_new(&self) -> bool {
        matches!(
            self,
            PcState::PNew
                | PcState::PNewProvisional
                | PcState::PNewDeleted
                | PcState::PNewFlushedDeleted
                | PcState::PNewFlushedDeletedFlushed
                | PcState::PNonTransNew
        )
    }

    pub fn is_deleted(&self) -> bool {
        matches!(
            self,
            PcState::PNewDeleted
                | PcState::PNewFlushedDeleted
                | PcState::PNewFlushedDeletedFlushed
                | PcState::PDeleted
                | PcState::PDeletedFlushed
                | PcState::PNonTransDeleted
                | PcState::EDeleted
        )
    }

    pub fn is_dirty(&self) -> bool {
        matches!(
            self,
            PcState::TDirty
                | PcState::PNew
                | PcState::PNewProvisional
                | PcState::PNewDeleted
                | PcState::PNewFlushedDeleted
                | PcState::PNewFlushedDeletedFlushed
                | PcState::PDirty
                | PcState::PDeleted
                | PcState::PDeletedFlushed
                | PcState::PNonTransNew
                | PcState::PNonTransDirty
                | PcState::PNonTransDeleted
                | PcState::EDirty
                | PcState::EDeleted
        )
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, PcState::PNewProvisional)
    }

    pub fn is_embedded(&self) -> bool {
        matches!(
            self,
            PcState::ECopy
                | PcState::EClean
                | PcState::EDirty
                | PcState::EDeleted
                | PcState::ENonTrans
        )
    }

    /// Whether commit must re-verify the optimistic version of an instance in
    /// this state. A new instance needs a check only when it was written again
    /// after having been flushed.
    pub fn is_version_check_required(&self, flags: &TransitionFlags) -> bool {
        match self {
            PcState::PNew => flags.flushed_dirty,
            PcState::PDirty => !flags.flushed || flags.flushed_dirty,
            PcState::PDeleted => !flags.flushed,
            _ => false,
        }
    }
}

impl fmt::Display for PcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Lifecycle events a state can receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Event {
    Persist,
    Delete,
    Commit,
    CommitRetain,
    Rollback,
    RollbackRestore,
    Transactional,
    Nontransactional,
    Release,
    Evict,
    BeforeRead,
    BeforeOptimisticRead,
    BeforeNontransactionalRead,
    /// `mutate` is set for in-place changes of a mutable value, which must
    /// not clear the field being mutated.
    BeforeWrite { mutate: bool },
    BeforeOptimisticWrite { mutate: bool },
    BeforeNontransactionalWrite { mutate: bool },
    Flush,
    BeforeFlush { logical: bool },
    Nonprovisional { logical: bool },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Persist => "persist",
            Event::Delete => "delete",
            Event::Commit => "commit",
            Event::CommitRetain => "commitRetain",
            Event::Rollback => "rollback",
            Event::RollbackRestore => "rollbackRestore",
            Event::Transactional => "transactional",
            Event::Nontransactional => "nontransactional",
            Event::Release => "release",
            Event::Evict => "evict",
            Event::BeforeRead => "beforeRead",
            Event::BeforeOptimisticRead => "beforeOptimisticRead",
            Event::BeforeNontransactionalRead => "beforeNontransactionalRead",
            Event::BeforeWrite { .. } => "beforeWrite",
            Event::BeforeOptimisticWrite { .. } => "beforeOptimisticWrite",
            Event::BeforeNontransactionalWrite { .. } => "beforeNontransactionalWrite",
            Event::Flush => "flush",
            Event::BeforeFlush { .. } => "beforeFlush",
            Event::Nonprovisional { .. } => "nonprovisional",
        }
    }

    /// Parse an event name; `flag` feeds `mutate` or `logical` where the
    /// event carries one.
    pub fn from_name(name: &str, flag: bool) -> Option<Event> {
        let event = match name {
            "persist" => Event::Persist,
            "delete" => Event::Delete,
            "commit" => Event::Commit,
            "commitRetain" => Event::CommitRetain,
            "rollback" => Event::Rollback,
            "rollbackRestore" => Event::RollbackRestore,
            "transactional" => Event::Transactional,
            "nontransactional" => Event::Nontransactional,
            "release" => Event::Release,
            "evict" => Event::Evict,
            "beforeRead" => Event::BeforeRead,
            "beforeOptimisticRead" => Event::BeforeOptimisticRead,
            "beforeNontransactionalRead" => Event::BeforeNontransactionalRead,
            "beforeWrite" => Event::BeforeWrite { mutate: flag },
            "beforeOptimisticWrite" => Event::BeforeOptimisticWrite { mutate: flag },
            "beforeNontransactionalWrite" => Event::BeforeNontransactionalWrite { mutate: flag },
            "flush" => Event::Flush,
            "beforeFlush" => Event::BeforeFlush { logical: flag },
            "nonprovisional" => Event::Nonprovisional { logical: flag },
            _ => return None,
        };
        Some(event)
    }

    /// One representative of every event, flag-carrying events in both forms.
    pub fn samples() -> Vec<Event> {
        vec![
            Event::Persist,
            Event::Delete,
            Event::Commit,
            Event::CommitRetain,
            Event::Rollback,
            Event::RollbackRestore,
            Event::Transactional,
            Event::Nontransactional,
            Event::Release,
            Event::Evict,
            Event::BeforeRead,
            Event::BeforeOptimisticRead,
            Event::BeforeNontransactionalRead,
            Event::BeforeWrite { mutate: false },
            Event::BeforeWrite { mutate: true },
            Event::BeforeOptimisticWrite { mutate: false },
            Event::BeforeOptimisticWrite { mutate: true },
            Event::BeforeNontransactionalWrite { mutate: false },
            Event::BeforeNontransactionalWrite { mutate: true },
            Event::Flush,
            Event::BeforeFlush { logical: false },
            Event::BeforeFlush { logical: true },
            Event::Nonprovisional { logical: false },
            Event::Nonprovisional { logical: true },
        ]
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Context flags a transition may depend on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransitionFlags {
    /// The instance has been flushed in the current transaction.
    pub flushed: bool,
    /// The instance was written again after its last flush.
    pub flushed_dirty: bool,
    /// At least one field is dirty.
    pub has_dirty_fields: bool,
    /// Auto-clear policy is `All`.
    pub auto_clear_all: bool,
    /// A transaction is active in the owning context.
    pub active: bool,
}

/// Side effect the owning context performs after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Effect {
    /// Start recording original field values for rollback.
    SaveFields,
    /// Put saved field values back.
    RestoreFields,
    ClearSavedFields,
    /// Unload every non-key field so it is reloaded on next access.
    ClearFields,
    /// Turn on change tracking for mutable field values.
    ProxyFields,
    UnproxyFields,
    PreDelete,
    PreFlush { logical: bool },
    /// Register the instance as dirty with the transaction.
    SetDirty,
    /// Forget earlier flushes so the instance is inserted again.
    EraseFlush,
    /// Stop managing the instance.
    Unmanage,
}

impl Effect {
    /// Effects that notify lifecycle listeners and may veto the transition.
    pub fn notifies_listeners(&self) -> bool {
        matches!(self, Effect::PreDelete | Effect::PreFlush { .. })
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::SaveFields => write!(f, "saveFields"),
            Effect::RestoreFields => write!(f, "restoreFields"),
            Effect::ClearSavedFields => write!(f, "clearSavedFields"),
            Effect::ClearFields => write!(f, "clearFields"),
            Effect::ProxyFields => write!(f, "proxyFields"),
            Effect::UnproxyFields => write!(f, "unproxyFields"),
            Effect::PreDelete => write!(f, "preDelete"),
            Effect::PreFlush { logical } => write!(f, "preFlush(logical={})", logical),
            Effect::SetDirty => write!(f, "setDirty"),
            Effect::EraseFlush => write!(f, "eraseFlush"),
            Effect::Unmanage => write!(f, "unmanage"),
        }
    }
}

/// Outcome of a legal transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub next: PcState,
    pub effects: Vec<Effect>,
}

impl Transition {
    pub fn changes_state(&self, from: PcState) -> bool {
        self.next != from
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Illegal state transition: cannot {event} an instance in state {state} ({reason})")]
    IllegalTransition {
        event: Event,
        state: PcState,
        reason: &'static str,
    },
}

impl StateError {
    pub fn event(&self) -> Event {
        match self {
            StateError::IllegalTransition { event, .. } => *event,
        }
    }

    pub fn state(&self) -> PcState {
        match self {
            StateError::IllegalTransition { state, .. } => *state,
        }
    }
}
