use crate::learner::Kind;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;

/// concurrent dirty-flag table: many writers (learners flagging state
/// worth persisting), one reader (the periodic saver).
#[derive(Debug, Clone, Default)]
pub struct Dirty(Arc<Mutex<BTreeSet<Kind>>>);

impl Dirty {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn mark(&self, kind: Kind) {
        self.0.lock().expect("dirty table lock").insert(kind);
    }
    pub fn contains(&self, kind: Kind) -> bool {
        self.0.lock().expect("dirty table lock").contains(&kind)
    }
    pub fn is_clean(&self) -> bool {
        self.0.lock().expect("dirty table lock").is_empty()
    }
    /// drain every flagged kind. callers re-mark whatever fails to save.
    pub fn take(&self) -> BTreeSet<Kind> {
        std::mem::take(&mut *self.0.lock().expect("dirty table lock"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_take_leaves_clean() {
        let dirty = Dirty::new();
        assert!(dirty.is_clean());
        dirty.mark(Kind::QTable);
        dirty.mark(Kind::Dqn);
        dirty.mark(Kind::QTable);
        assert!(dirty.contains(Kind::QTable));
        let taken = dirty.take();
        assert!(taken.len() == 2);
        assert!(dirty.is_clean());
    }

    #[test]
    fn take_on_clean_is_empty() {
        let dirty = Dirty::new();
        assert!(dirty.take().is_empty());
    }
}
