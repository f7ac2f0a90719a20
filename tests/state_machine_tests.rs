use proptest::prelude::*;
use rustmemodb_orm::state::{self, initialize_effects};
use rustmemodb_orm::{Effect, Event, PcState, TransitionFlags};

fn active() -> TransitionFlags {
    TransitionFlags {
        active: true,
        ..Default::default()
    }
}

fn flags_strategy() -> impl Strategy<Value = TransitionFlags> {
    (any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>()).prop_map(
        |(flushed, flushed_dirty, has_dirty_fields, auto_clear_all, active)| TransitionFlags {
            flushed,
            flushed_dirty,
            has_dirty_fields,
            auto_clear_all,
            active,
        },
    )
}

proptest! {
    #[test]
    fn test_transition_is_deterministic(
        from in prop::sample::select(PcState::ALL.to_vec()),
        event in prop::sample::select(Event::samples()),
        flags in flags_strategy(),
    ) {
        let first = state::transition(from, event, flags);
        let second = state::transition(from, event, flags);
        match (first, second) {
            (Ok(a), Ok(b)) => {
                prop_assert_eq!(a.next, b.next);
                prop_assert_eq!(a.effects, b.effects);
            }
            (Err(a), Err(b)) => prop_assert_eq!(a.to_string(), b.to_string()),
            _ => prop_assert!(false, "outcome changed between calls"),
        }
    }

    #[test]
    fn test_state_change_ends_with_initialize_effects(
        from in prop::sample::select(PcState::ALL.to_vec()),
        event in prop::sample::select(Event::samples()),
        flags in flags_strategy(),
    ) {
        if let Ok(t) = state::transition(from, event, flags) {
            let init = initialize_effects(t.next);
            if t.next != from {
                prop_assert!(t.effects.ends_with(init));
            }
        }
    }

    #[test]
    fn test_errors_name_the_event_and_state(
        from in prop::sample::select(PcState::ALL.to_vec()),
        event in prop::sample::select(Event::samples()),
        flags in flags_strategy(),
    ) {
        if let Err(err) = state::transition(from, event, flags) {
            prop_assert_eq!(err.state(), from);
            prop_assert_eq!(err.event(), event);
        }
    }
}

#[test]
fn test_every_state_round_trips_its_name() {
    for s in PcState::ALL {
        assert_eq!(PcState::from_name(s.name()), Some(s));
    }
}

#[test]
fn test_new_instance_lifecycle_through_flushed_delete() {
    let t = state::transition(PcState::Transient, Event::Persist, active()).unwrap();
    assert_eq!(t.next, PcState::PNew);

    let flushed = TransitionFlags {
        flushed: true,
        ..active()
    };
    let t = state::transition(PcState::PNew, Event::Delete, flushed).unwrap();
    assert_eq!(t.next, PcState::PNewFlushedDeleted);
    let t = state::transition(PcState::PNewFlushedDeleted, Event::Flush, flushed).unwrap();
    assert_eq!(t.next, PcState::PNewFlushedDeletedFlushed);
    let t = state::transition(PcState::PNewFlushedDeletedFlushed, Event::Commit, flushed).unwrap();
    assert_eq!(t.next, PcState::Transient);
    assert_eq!(t.effects.last(), Some(&Effect::Unmanage));
}

#[test]
fn test_commit_retain_versus_commit() {
    let t = state::transition(PcState::PDirty, Event::CommitRetain, active()).unwrap();
    assert_eq!(t.next, PcState::PNonTrans);
    assert_eq!(t.effects, vec![Effect::ClearSavedFields]);

    let t = state::transition(PcState::PDirty, Event::Commit, active()).unwrap();
    assert_eq!(t.next, PcState::Hollow);
    assert!(t.effects.contains(&Effect::ClearFields));
}

#[test]
fn test_dirty_instances_cannot_be_released() {
    for from in [PcState::PDirty, PcState::PNonTransDirty, PcState::TDirty] {
        assert!(state::transition(from, Event::Release, active()).is_err());
    }
}

#[test]
fn test_version_check_rules() {
    let flushed = TransitionFlags {
        flushed: true,
        ..active()
    };
    let flushed_dirty = TransitionFlags {
        flushed_dirty: true,
        ..flushed
    };
    assert!(!PcState::PNew.is_version_check_required(&active()));
    assert!(PcState::PNew.is_version_check_required(&flushed_dirty));
    assert!(PcState::PDirty.is_version_check_required(&active()));
    assert!(!PcState::PDirty.is_version_check_required(&flushed));
    assert!(PcState::PDeleted.is_version_check_required(&active()));
    assert!(!PcState::PClean.is_version_check_required(&active()));
}
