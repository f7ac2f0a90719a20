use crate::core::InstanceId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

#[derive(Debug, Default)]
pub(crate) struct ExtentState {
    closed: AtomicBool,
}

/// Open extents, held weakly so dropped iterators need no explicit close.
#[derive(Debug, Default)]
pub(crate) struct ExtentRegistry {
    open: Mutex<Vec<Weak<ExtentState>>>,
}

impl ExtentRegistry {
    pub(crate) fn register(&self) -> Arc<ExtentState> {
        let state = Arc::new(ExtentState::default());
        let mut open = self.open.lock();
        open.retain(|w| w.strong_count() > 0);
        open.push(Arc::downgrade(&state));
        state
    }

    /// Force-close every live iterator. Returns how many were closed.
    pub(crate) fn close_all(&self) -> usize {
        let mut open = self.open.lock();
        let mut closed = 0;
        for state in open.drain(..).filter_map(|w| w.upgrade()) {
            if !state.closed.swap(true, Ordering::AcqRel) {
                closed += 1;
            }
        }
        closed
    }

    pub(crate) fn open_count(&self) -> usize {
        self.open
            .lock()
            .iter()
            .filter_map(|w| w.upgrade())
            .filter(|s| !s.closed.load(Ordering::Acquire))
            .count()
    }
}

/// Iterator over the managed instances of one class, captured when the
/// extent was opened.
#[derive(Debug)]
pub struct ExtentIterator {
    ids: std::vec::IntoIter<InstanceId>,
    state: Arc<ExtentState>,
}

impl ExtentIterator {
    pub(crate) fn new(ids: Vec<InstanceId>, state: Arc<ExtentState>) -> Self {
        Self {
            ids: ids.into_iter(),
            state,
        }
    }

    pub fn close(&self) {
        self.state.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }
}

impl Iterator for ExtentIterator {
    type Item = InstanceId;

    fn next(&mut self) -> Option<InstanceId> {
        if self.is_closed() {
            return None;
        }
        self.ids.next()
    }
}
