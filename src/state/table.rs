// ============================================================================
// Transition Table
// ============================================================================
//
// One function per state, each matching every event without a wildcard so a
// new event cannot be silently ignored by any state.
//
// ============================================================================

use super::{Effect, Event, PcState, StateError, Transition, TransitionFlags};

type Step = std::result::Result<(PcState, Vec<Effect>), &'static str>;

/// Resolve `event` against `state`.
///
/// Entering a different state appends that state's initialization effects
/// after the event's own effects.
pub fn transition(
    state: PcState,
    event: Event,
    flags: TransitionFlags,
) -> Result<Transition, StateError> {
    let step = match state {
        PcState::Transient => transient(state, event),
        PcState::TClean => tclean(state, event),
        PcState::TDirty => tdirty(state, event),
        PcState::PNew => pnew(state, event, &flags),
        PcState::PNewProvisional => pnew_provisional(state, event),
        PcState::PNewDeleted => pnew_deleted(state, event),
        PcState::PNewFlushedDeleted => pnew_flushed_deleted(state, event),
        PcState::PNewFlushedDeletedFlushed => pnew_flushed_deleted_flushed(state, event),
        PcState::PClean => pclean(state, event),
        PcState::PDirty => pdirty(state, event),
        PcState::PDeleted => pdeleted(state, event, &flags),
        PcState::PDeletedFlushed => pdeleted_flushed(state, event),
        PcState::Hollow => hollow(state, event, &flags),
        PcState::PNonTrans => pnontrans(state, event, &flags),
        PcState::PNonTransNew => pnontrans_new(state, event),
        PcState::PNonTransDirty => pnontrans_dirty(state, event, &flags),
        PcState::PNonTransDeleted => pnontrans_deleted(state, event, &flags),
        PcState::ECopy => ecopy(state, event),
        PcState::EClean => eclean(state, event),
        PcState::EDirty => edirty(state, event),
        PcState::EDeleted => edeleted(state, event),
        PcState::ENonTrans => enontrans(state, event),
    };

    match step {
        Ok((next, mut effects)) => {
            if next != state {
                effects.extend_from_slice(initialize_effects(next));
            }
            Ok(Transition { next, effects })
        }
        Err(reason) => Err(StateError::IllegalTransition {
            event,
            state,
            reason,
        }),
    }
}

/// Effects performed on entering `state`.
pub fn initialize_effects(state: PcState) -> &'static [Effect] {
    match state {
        PcState::Transient => &[
            Effect::UnproxyFields,
            Effect::ClearSavedFields,
            Effect::Unmanage,
        ],
        PcState::TClean => &[],
        PcState::TDirty => &[Effect::SaveFields, Effect::SetDirty],
        PcState::PNew | PcState::PNewProvisional => &[Effect::SaveFields, Effect::ProxyFields],
        PcState::PClean => &[Effect::SaveFields],
        PcState::PDirty => &[Effect::SaveFields, Effect::SetDirty],
        PcState::Hollow => &[Effect::ClearFields, Effect::ClearSavedFields],
        PcState::PNonTrans => &[Effect::ClearSavedFields],
        PcState::PNonTransNew | PcState::PNonTransDirty => &[Effect::SaveFields, Effect::SetDirty],
        PcState::EClean => &[Effect::SaveFields],
        PcState::EDirty => &[Effect::SaveFields, Effect::SetDirty],
        PcState::ENonTrans => &[Effect::ClearSavedFields],
        PcState::PNewDeleted
        | PcState::PNewFlushedDeleted
        | PcState::PNewFlushedDeletedFlushed
        | PcState::PDeleted
        | PcState::PDeletedFlushed
        | PcState::PNonTransDeleted
        | PcState::ECopy
        | PcState::EDeleted => &[],
    }
}

fn go(next: PcState) -> Step {
    Ok((next, Vec::new()))
}

fn go_with(next: PcState, effects: &[Effect]) -> Step {
    Ok((next, effects.to_vec()))
}

fn transient(s: PcState, event: Event) -> Step {
    match event {
        Event::Persist => go(PcState::PNew),
        Event::Delete => Err("instance is not managed"),
        Event::Transactional => go(PcState::TClean),
        Event::Commit
        | Event::CommitRetain
        | Event::Rollback
        | Event::RollbackRestore
        | Event::Nontransactional
        | Event::Release
        | Event::Evict
        | Event::BeforeRead
        | Event::BeforeOptimisticRead
        | Event::BeforeNontransactionalRead
        | Event::BeforeWrite { .. }
        | Event::BeforeOptimisticWrite { .. }
        | Event::BeforeNontransactionalWrite { .. }
        | Event::Flush
        | Event::BeforeFlush { .. }
        | Event::Nonprovisional { .. } => go(s),
    }
}

fn tclean(s: PcState, event: Event) -> Step {
    match event {
        Event::Persist => go(PcState::PNew),
        Event::Delete => Err("instance is transient"),
        Event::Nontransactional | Event::Release => go(PcState::Transient),
        Event::BeforeWrite { .. } | Event::BeforeOptimisticWrite { .. } => go(PcState::TDirty),
        Event::Commit
        | Event::CommitRetain
        | Event::Rollback
        | Event::RollbackRestore
        | Event::Transactional
        | Event::Evict
        | Event::BeforeRead
        | Event::BeforeOptimisticRead
        | Event::BeforeNontransactionalRead
        | Event::BeforeNontransactionalWrite { .. }
        | Event::Flush
        | Event::BeforeFlush { .. }
        | Event::Nonprovisional { .. } => go(s),
    }
}

fn tdirty(s: PcState, event: Event) -> Step {
    match event {
        Event::Persist => go(PcState::PNew),
        Event::Delete => Err("instance is transient"),
        Event::Commit | Event::CommitRetain | Event::Rollback => go(PcState::TClean),
        Event::RollbackRestore => go_with(PcState::TClean, &[Effect::RestoreFields]),
        Event::Nontransactional | Event::Release => Err("instance is dirty"),
        Event::Transactional
        | Event::Evict
        | Event::BeforeRead
        | Event::BeforeOptimisticRead
        | Event::BeforeNontransactionalRead
        | Event::BeforeWrite { .. }
        | Event::BeforeOptimisticWrite { .. }
        | Event::BeforeNontransactionalWrite { .. }
        | Event::Flush
        | Event::BeforeFlush { .. }
        | Event::Nonprovisional { .. } => go(s),
    }
}

fn pnew(s: PcState, event: Event, flags: &TransitionFlags) -> Step {
    match event {
        Event::Delete => {
            let next = if flags.flushed {
                PcState::PNewFlushedDeleted
            } else {
                PcState::PNewDeleted
            };
            go_with(next, &[Effect::PreDelete])
        }
        Event::Commit => go(PcState::Hollow),
        Event::CommitRetain => go(PcState::PNonTrans),
        Event::Rollback => go(PcState::Transient),
        Event::RollbackRestore => go_with(PcState::Transient, &[Effect::RestoreFields]),
        Event::Nontransactional | Event::Release => Err("instance is new"),
        Event::BeforeFlush { logical } => go_with(s, &[Effect::PreFlush { logical }]),
        Event::Persist
        | Event::Transactional
        | Event::Evict
        | Event::BeforeRead
        | Event::BeforeOptimisticRead
        | Event::BeforeNontransactionalRead
        | Event::BeforeWrite { .. }
        | Event::BeforeOptimisticWrite { .. }
        | Event::BeforeNontransactionalWrite { .. }
        | Event::Flush
        | Event::Nonprovisional { .. } => go(s),
    }
}

fn pnew_provisional(s: PcState, event: Event) -> Step {
    match event {
        Event::Persist => go(PcState::PNew),
        Event::Nonprovisional { logical } => {
            go_with(PcState::PNew, &[Effect::PreFlush { logical }])
        }
        Event::Delete => go_with(PcState::Transient, &[Effect::PreDelete]),
        Event::Commit | Event::CommitRetain | Event::Rollback | Event::Release => {
            go(PcState::Transient)
        }
        Event::RollbackRestore => go_with(PcState::Transient, &[Effect::RestoreFields]),
        Event::Nontransactional => Err("instance is new"),
        Event::Transactional
        | Event::Evict
        | Event::BeforeRead
        | Event::BeforeOptimisticRead
        | Event::BeforeNontransactionalRead
        | Event::BeforeWrite { .. }
        | Event::BeforeOptimisticWrite { .. }
        | Event::BeforeNontransactionalWrite { .. }
        | Event::Flush
        | Event::BeforeFlush { .. } => go(s),
    }
}

/// Shared by the three new-and-deleted states; `flush_to` is where a flush
/// leads and `persist_effects` what re-persisting must undo.
fn new_deleted(s: PcState, event: Event, flush_to: PcState, persist_effects: &[Effect]) -> Step {
    match event {
        Event::Persist => go_with(PcState::PNew, persist_effects),
        Event::Commit | Event::CommitRetain | Event::Rollback => go(PcState::Transient),
        Event::RollbackRestore => go_with(PcState::Transient, &[Effect::RestoreFields]),
        Event::Nontransactional | Event::Release => Err("instance is deleted"),
        Event::BeforeWrite { .. }
        | Event::BeforeOptimisticWrite { .. }
        | Event::BeforeNontransactionalWrite { .. } => Err("instance is deleted"),
        Event::Flush => go(flush_to),
        Event::Delete
        | Event::Transactional
        | Event::Evict
        | Event::BeforeRead
        | Event::BeforeOptimisticRead
        | Event::BeforeNontransactionalRead
        | Event::BeforeFlush { .. }
        | Event::Nonprovisional { .. } => go(s),
    }
}

fn pnew_deleted(s: PcState, event: Event) -> Step {
    new_deleted(s, event, s, &[])
}

fn pnew_flushed_deleted(s: PcState, event: Event) -> Step {
    new_deleted(s, event, PcState::PNewFlushedDeletedFlushed, &[])
}

fn pnew_flushed_deleted_flushed(s: PcState, event: Event) -> Step {
    new_deleted(s, event, s, &[Effect::EraseFlush])
}

fn pclean(s: PcState, event: Event) -> Step {
    match event {
        Event::Delete => go_with(PcState::PDeleted, &[Effect::PreDelete]),
        Event::Commit | Event::Rollback | Event::Evict => go(PcState::Hollow),
        Event::CommitRetain | Event::RollbackRestore | Event::Nontransactional => {
            go(PcState::PNonTrans)
        }
        Event::Release => go(PcState::Transient),
        Event::BeforeWrite { .. }
        | Event::BeforeOptimisticWrite { .. }
        | Event::BeforeNontransactionalWrite { .. } => go(PcState::PDirty),
        Event::Persist
        | Event::Transactional
        | Event::BeforeRead
        | Event::BeforeOptimisticRead
        | Event::BeforeNontransactionalRead
        | Event::Flush
        | Event::BeforeFlush { .. }
        | Event::Nonprovisional { .. } => go(s),
    }
}

fn pdirty(s: PcState, event: Event) -> Step {
    match event {
        Event::Delete => go_with(PcState::PDeleted, &[Effect::PreDelete]),
        Event::Commit | Event::Rollback => go(PcState::Hollow),
        Event::CommitRetain => go(PcState::PNonTrans),
        Event::RollbackRestore => go_with(PcState::PNonTrans, &[Effect::RestoreFields]),
        Event::Nontransactional | Event::Release => Err("instance is dirty"),
        Event::BeforeFlush { logical } => go_with(s, &[Effect::PreFlush { logical }]),
        Event::Persist
        | Event::Transactional
        | Event::Evict
        | Event::BeforeRead
        | Event::BeforeOptimisticRead
        | Event::BeforeNontransactionalRead
        | Event::BeforeWrite { .. }
        | Event::BeforeOptimisticWrite { .. }
        | Event::BeforeNontransactionalWrite { .. }
        | Event::Flush
        | Event::Nonprovisional { .. } => go(s),
    }
}

fn deleted(s: PcState, event: Event, persist: Step, flush_to: PcState) -> Step {
    match event {
        Event::Persist => persist,
        Event::Commit | Event::CommitRetain => go(PcState::Transient),
        Event::Rollback => go(PcState::Hollow),
        Event::RollbackRestore => go_with(PcState::PNonTrans, &[Effect::RestoreFields]),
        Event::Nontransactional | Event::Release => Err("instance is deleted"),
        Event::BeforeWrite { .. }
        | Event::BeforeOptimisticWrite { .. }
        | Event::BeforeNontransactionalWrite { .. } => Err("instance is deleted"),
        Event::Flush => go(flush_to),
        Event::Delete
        | Event::Transactional
        | Event::Evict
        | Event::BeforeRead
        | Event::BeforeOptimisticRead
        | Event::BeforeNontransactionalRead
        | Event::BeforeFlush { .. }
        | Event::Nonprovisional { .. } => go(s),
    }
}

fn pdeleted(s: PcState, event: Event, flags: &TransitionFlags) -> Step {
    let persist = if flags.has_dirty_fields {
        go(PcState::PDirty)
    } else {
        go(PcState::PClean)
    };
    deleted(s, event, persist, PcState::PDeletedFlushed)
}

fn pdeleted_flushed(s: PcState, event: Event) -> Step {
    deleted(s, event, Err("delete has already been flushed"), s)
}

fn hollow(s: PcState, event: Event, flags: &TransitionFlags) -> Step {
    match event {
        Event::Delete => {
            let next = if flags.active {
                PcState::PDeleted
            } else {
                PcState::PNonTransDeleted
            };
            go_with(next, &[Effect::PreDelete])
        }
        Event::Transactional | Event::BeforeRead => go(PcState::PClean),
        Event::BeforeOptimisticRead | Event::BeforeNontransactionalRead => {
            go(PcState::PNonTrans)
        }
        Event::BeforeWrite { .. } | Event::BeforeOptimisticWrite { .. } => go(PcState::PDirty),
        Event::BeforeNontransactionalWrite { .. } => go(PcState::PNonTransDirty),
        Event::Release => go(PcState::Transient),
        Event::Persist
        | Event::Commit
        | Event::CommitRetain
        | Event::Rollback
        | Event::RollbackRestore
        | Event::Nontransactional
        | Event::Evict
        | Event::Flush
        | Event::BeforeFlush { .. }
        | Event::Nonprovisional { .. } => go(s),
    }
}

fn pnontrans(s: PcState, event: Event, flags: &TransitionFlags) -> Step {
    match event {
        Event::Delete => {
            let next = if flags.active {
                PcState::PDeleted
            } else {
                PcState::PNonTransDeleted
            };
            go_with(next, &[Effect::PreDelete])
        }
        Event::Transactional => go(PcState::PClean),
        Event::BeforeRead => go_with(PcState::PClean, &[Effect::ClearFields]),
        Event::BeforeOptimisticRead => {
            if flags.auto_clear_all {
                go_with(PcState::PClean, &[Effect::ClearFields])
            } else {
                go(s)
            }
        }
        Event::BeforeWrite { mutate } => {
            if mutate {
                go(PcState::PDirty)
            } else {
                go_with(PcState::PDirty, &[Effect::ClearFields])
            }
        }
        Event::BeforeOptimisticWrite { mutate } => {
            if flags.auto_clear_all && !mutate {
                go_with(PcState::PDirty, &[Effect::ClearFields])
            } else {
                go(PcState::PDirty)
            }
        }
        Event::BeforeNontransactionalWrite { .. } => go(PcState::PNonTransDirty),
        Event::Release => go(PcState::Transient),
        Event::Evict => go(PcState::Hollow),
        Event::Persist
        | Event::Commit
        | Event::CommitRetain
        | Event::Rollback
        | Event::RollbackRestore
        | Event::Nontransactional
        | Event::BeforeNontransactionalRead
        | Event::Flush
        | Event::BeforeFlush { .. }
        | Event::Nonprovisional { .. } => go(s),
    }
}

fn pnontrans_new(s: PcState, event: Event) -> Step {
    match event {
        Event::Delete => go_with(PcState::Transient, &[Effect::PreDelete]),
        Event::Commit | Event::CommitRetain => go(PcState::PNonTrans),
        Event::Rollback => go(PcState::Transient),
        Event::RollbackRestore => go_with(PcState::Transient, &[Effect::RestoreFields]),
        Event::Transactional => go(PcState::PNew),
        Event::Release => Err("instance is new"),
        Event::BeforeFlush { logical } => go_with(s, &[Effect::PreFlush { logical }]),
        Event::Persist
        | Event::Nontransactional
        | Event::Evict
        | Event::BeforeRead
        | Event::BeforeOptimisticRead
        | Event::BeforeNontransactionalRead
        | Event::BeforeWrite { .. }
        | Event::BeforeOptimisticWrite { .. }
        | Event::BeforeNontransactionalWrite { .. }
        | Event::Flush
        | Event::Nonprovisional { .. } => go(s),
    }
}

fn pnontrans_dirty(s: PcState, event: Event, flags: &TransitionFlags) -> Step {
    match event {
        Event::Delete => {
            let next = if flags.active {
                PcState::PDeleted
            } else {
                PcState::PNonTransDeleted
            };
            go_with(next, &[Effect::PreDelete])
        }
        Event::Commit | Event::CommitRetain => go(PcState::PNonTrans),
        Event::Rollback => go(PcState::Hollow),
        Event::RollbackRestore => go_with(PcState::PNonTrans, &[Effect::RestoreFields]),
        Event::Transactional => go(PcState::PDirty),
        Event::Release => Err("instance is dirty"),
        Event::Persist
        | Event::Nontransactional
        | Event::Evict
        | Event::BeforeRead
        | Event::BeforeOptimisticRead
        | Event::BeforeNontransactionalRead
        | Event::BeforeWrite { .. }
        | Event::BeforeOptimisticWrite { .. }
        | Event::BeforeNontransactionalWrite { .. }
        | Event::Flush
        | Event::BeforeFlush { .. }
        | Event::Nonprovisional { .. } => go(s),
    }
}

fn pnontrans_deleted(s: PcState, event: Event, flags: &TransitionFlags) -> Step {
    match event {
        Event::Persist => {
            if flags.has_dirty_fields {
                go(PcState::PNonTransDirty)
            } else {
                go(PcState::PNonTrans)
            }
        }
        Event::Commit | Event::CommitRetain => go(PcState::Transient),
        Event::Rollback => go(PcState::Hollow),
        Event::RollbackRestore => go_with(PcState::PNonTrans, &[Effect::RestoreFields]),
        Event::Transactional => go(PcState::PDeleted),
        Event::Release => Err("instance is deleted"),
        Event::BeforeWrite { .. }
        | Event::BeforeOptimisticWrite { .. }
        | Event::BeforeNontransactionalWrite { .. } => Err("instance is deleted"),
        Event::Delete
        | Event::Nontransactional
        | Event::Evict
        | Event::BeforeRead
        | Event::BeforeOptimisticRead
        | Event::BeforeNontransactionalRead
        | Event::Flush
        | Event::BeforeFlush { .. }
        | Event::Nonprovisional { .. } => go(s),
    }
}

fn ecopy(s: PcState, event: Event) -> Step {
    match event {
        Event::Persist | Event::Delete | Event::Transactional => {
            Err("instance is an embedded copy")
        }
        Event::Release => go(PcState::Transient),
        Event::Commit
        | Event::CommitRetain
        | Event::Rollback
        | Event::RollbackRestore
        | Event::Nontransactional
        | Event::Evict
        | Event::BeforeRead
        | Event::BeforeOptimisticRead
        | Event::BeforeNontransactionalRead
        | Event::BeforeWrite { .. }
        | Event::BeforeOptimisticWrite { .. }
        | Event::BeforeNontransactionalWrite { .. }
        | Event::Flush
        | Event::BeforeFlush { .. }
        | Event::Nonprovisional { .. } => go(s),
    }
}

fn eclean(s: PcState, event: Event) -> Step {
    match event {
        Event::Delete => go_with(PcState::EDeleted, &[Effect::PreDelete]),
        Event::Commit
        | Event::CommitRetain
        | Event::Rollback
        | Event::RollbackRestore
        | Event::Nontransactional => go(PcState::ENonTrans),
        Event::Release => go(PcState::Transient),
        Event::BeforeWrite { .. }
        | Event::BeforeOptimisticWrite { .. }
        | Event::BeforeNontransactionalWrite { .. } => go(PcState::EDirty),
        Event::Persist
        | Event::Transactional
        | Event::Evict
        | Event::BeforeRead
        | Event::BeforeOptimisticRead
        | Event::BeforeNontransactionalRead
        | Event::Flush
        | Event::BeforeFlush { .. }
        | Event::Nonprovisional { .. } => go(s),
    }
}

fn edirty(s: PcState, event: Event) -> Step {
    match event {
        Event::Delete => go_with(PcState::EDeleted, &[Effect::PreDelete]),
        Event::Commit | Event::CommitRetain | Event::Rollback => go(PcState::ENonTrans),
        Event::RollbackRestore => go_with(PcState::ENonTrans, &[Effect::RestoreFields]),
        Event::Nontransactional | Event::Release => Err("instance is dirty"),
        Event::BeforeFlush { logical } => go_with(s, &[Effect::PreFlush { logical }]),
        Event::Persist
        | Event::Transactional
        | Event::Evict
        | Event::BeforeRead
        | Event::BeforeOptimisticRead
        | Event::BeforeNontransactionalRead
        | Event::BeforeWrite { .. }
        | Event::BeforeOptimisticWrite { .. }
        | Event::BeforeNontransactionalWrite { .. }
        | Event::Flush
        | Event::Nonprovisional { .. } => go(s),
    }
}

fn edeleted(s: PcState, event: Event) -> Step {
    match event {
        Event::Persist => go(PcState::EDirty),
        Event::Commit | Event::CommitRetain => go(PcState::Transient),
        Event::Rollback => go(PcState::ENonTrans),
        Event::RollbackRestore => go_with(PcState::ENonTrans, &[Effect::RestoreFields]),
        Event::Nontransactional | Event::Release => Err("instance is deleted"),
        Event::BeforeWrite { .. }
        | Event::BeforeOptimisticWrite { .. }
        | Event::BeforeNontransactionalWrite { .. } => Err("instance is deleted"),
        Event::Delete
        | Event::Transactional
        | Event::Evict
        | Event::BeforeRead
        | Event::BeforeOptimisticRead
        | Event::BeforeNontransactionalRead
        | Event::Flush
        | Event::BeforeFlush { .. }
        | Event::Nonprovisional { .. } => go(s),
    }
}

fn enontrans(s: PcState, event: Event) -> Step {
    match event {
        Event::Delete => go_with(PcState::EDeleted, &[Effect::PreDelete]),
        Event::Transactional => go(PcState::EClean),
        Event::Release => go(PcState::Transient),
        Event::BeforeWrite { .. } | Event::BeforeOptimisticWrite { .. } => go(PcState::EDirty),
        Event::Persist
        | Event::Commit
        | Event::CommitRetain
        | Event::Rollback
        | Event::RollbackRestore
        | Event::Nontransactional
        | Event::Evict
        | Event::BeforeRead
        | Event::BeforeOptimisticRead
        | Event::BeforeNontransactionalRead
        | Event::BeforeNontransactionalWrite { .. }
        | Event::Flush
        | Event::BeforeFlush { .. }
        | Event::Nonprovisional { .. } => go(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags() -> TransitionFlags {
        TransitionFlags {
            active: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_transient_persist_enters_pnew_with_save_and_proxy() {
        let t = transition(PcState::Transient, Event::Persist, flags()).unwrap();
        assert_eq!(t.next, PcState::PNew);
        assert_eq!(t.effects, vec![Effect::SaveFields, Effect::ProxyFields]);
    }

    #[test]
    fn test_pnew_delete_depends_on_flush() {
        let t = transition(PcState::PNew, Event::Delete, flags()).unwrap();
        assert_eq!(t.next, PcState::PNewDeleted);
        assert_eq!(t.effects, vec![Effect::PreDelete]);

        let flushed = TransitionFlags {
            flushed: true,
            ..flags()
        };
        let t = transition(PcState::PNew, Event::Delete, flushed).unwrap();
        assert_eq!(t.next, PcState::PNewFlushedDeleted);
    }

    #[test]
    fn test_pnew_rollback_restore_unmanages_last() {
        let t = transition(PcState::PNew, Event::RollbackRestore, flags()).unwrap();
        assert_eq!(t.next, PcState::Transient);
        assert_eq!(t.effects.first(), Some(&Effect::RestoreFields));
        assert_eq!(t.effects.last(), Some(&Effect::Unmanage));
    }

    #[test]
    fn test_nontrans_write_clears_unless_mutating() {
        let t = transition(PcState::PNonTrans, Event::BeforeWrite { mutate: false }, flags())
            .unwrap();
        assert_eq!(t.next, PcState::PDirty);
        assert_eq!(t.effects[0], Effect::ClearFields);

        let t = transition(PcState::PNonTrans, Event::BeforeWrite { mutate: true }, flags())
            .unwrap();
        assert_eq!(t.next, PcState::PDirty);
        assert!(!t.effects.contains(&Effect::ClearFields));
    }

    #[test]
    fn test_optimistic_read_honors_auto_clear() {
        let t = transition(PcState::PNonTrans, Event::BeforeOptimisticRead, flags()).unwrap();
        assert_eq!(t.next, PcState::PNonTrans);
        assert!(t.effects.is_empty());

        let all = TransitionFlags {
            auto_clear_all: true,
            ..flags()
        };
        let t = transition(PcState::PNonTrans, Event::BeforeOptimisticRead, all).unwrap();
        assert_eq!(t.next, PcState::PClean);
        assert_eq!(t.effects[0], Effect::ClearFields);
    }

    #[test]
    fn test_deleted_rejects_writes() {
        let err = transition(PcState::PDeleted, Event::BeforeWrite { mutate: false }, flags())
            .unwrap_err();
        assert_eq!(err.state(), PcState::PDeleted);
        assert!(err.to_string().contains("deleted"));
    }

    #[test]
    fn test_refreshing_deleted_instance_restores_persistence() {
        let t = transition(PcState::PDeleted, Event::Persist, flags()).unwrap();
        assert_eq!(t.next, PcState::PClean);
        let dirty = TransitionFlags {
            has_dirty_fields: true,
            ..flags()
        };
        let t = transition(PcState::PDeleted, Event::Persist, dirty).unwrap();
        assert_eq!(t.next, PcState::PDirty);
    }

    #[test]
    fn test_repersist_after_flushed_delete_erases_flush() {
        let t = transition(PcState::PNewFlushedDeletedFlushed, Event::Persist, flags()).unwrap();
        assert_eq!(t.next, PcState::PNew);
        assert_eq!(t.effects[0], Effect::EraseFlush);
    }

    #[test]
    fn test_provisional_nonprovisional_preflushes() {
        let t = transition(
            PcState::PNewProvisional,
            Event::Nonprovisional { logical: true },
            flags(),
        )
        .unwrap();
        assert_eq!(t.next, PcState::PNew);
        assert_eq!(t.effects[0], Effect::PreFlush { logical: true });
    }

    #[test]
    fn test_delete_outside_transaction_is_pending() {
        let inactive = TransitionFlags::default();
        let t = transition(PcState::PNonTrans, Event::Delete, inactive).unwrap();
        assert_eq!(t.next, PcState::PNonTransDeleted);
        let t = transition(PcState::PNonTransDeleted, Event::Transactional, inactive).unwrap();
        assert_eq!(t.next, PcState::PDeleted);
    }

    #[test]
    fn test_embedded_copy_cannot_be_persisted() {
        assert!(transition(PcState::ECopy, Event::Persist, flags()).is_err());
        assert!(transition(PcState::ECopy, Event::Delete, flags()).is_err());
        assert_eq!(
            transition(PcState::ECopy, Event::Release, flags()).unwrap().next,
            PcState::Transient
        );
    }

    #[test]
    fn test_staying_put_adds_no_initialize_effects() {
        let t = transition(PcState::PClean, Event::BeforeRead, flags()).unwrap();
        assert_eq!(t.next, PcState::PClean);
        assert!(t.effects.is_empty());
    }
}
