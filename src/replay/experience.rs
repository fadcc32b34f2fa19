use crate::Priority;
use crate::Reward;
use crate::chess::Position;
use crate::selfplay::Step;

/// a replay entry: one trajectory step plus its sampling priority and,
/// for n-step learners, the accumulated return and the position the
/// bootstrap continues from.
#[derive(Debug, Clone, PartialEq)]
pub struct Experience {
    pub step: Step,
    pub priority: Priority,
    pub nstep_return: Option<Reward>,
    pub nstep_count: usize,
    pub anchor: Option<Position>,
}

impl Experience {
    pub fn new(step: Step, priority: Priority) -> Self {
        Self {
            step,
            priority,
            nstep_return: None,
            nstep_count: 0,
            anchor: None,
        }
    }
    pub fn nstep(
        step: Step,
        priority: Priority,
        ret: Reward,
        count: usize,
        anchor: Option<Position>,
    ) -> Self {
        Self {
            step,
            priority,
            nstep_return: Some(ret),
            nstep_count: count,
            anchor,
        }
    }
}
