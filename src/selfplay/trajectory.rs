use crate::Reward;
use crate::chess::Move;
use crate::chess::Position;
use crate::chess::Rules;
use crate::chess::Side;

/// one transition of an episode.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub before: Position,
    pub m: Move,
    pub reward: Reward,
    pub after: Position,
    pub terminal: bool,
}

impl Step {
    /// the required semantic: `after` is reachable by making `m` from
    /// `before`. stores discard incoherent entries.
    pub fn coherent(&self) -> bool {
        self.before.at(self.m.from).is_some() && Rules::apply(&self.before, self.m) == self.after
    }
}

/// how a finished game ended, from nobody's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Win(Side),
    Draw,
}

/// ordered transitions of one self-play episode. a trajectory whose last
/// step is not terminal was cut short by the stop token or the ply cap.
#[derive(Debug, Clone, Default)]
pub struct Trajectory {
    steps: Vec<Step>,
}

impl Trajectory {
    pub fn push(&mut self, step: Step) {
        self.steps.push(step);
    }
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }
    pub fn len(&self) -> usize {
        self.steps.len()
    }
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
    pub fn finished(&self) -> bool {
        self.steps.last().is_some_and(|s| s.terminal)
    }
    /// total shaped + terminal reward, for running averages
    pub fn reward(&self) -> Reward {
        self.steps.iter().map(|s| s.reward).sum()
    }
    /// discounted return from each step onward, newest math first done
    /// backward in one pass
    pub fn returns(&self, gamma: f32) -> Vec<Reward> {
        let mut returns = vec![0.; self.steps.len()];
        let mut acc = 0.;
        for (i, step) in self.steps.iter().enumerate().rev() {
            acc = step.reward + gamma * acc;
            returns[i] = acc;
        }
        returns
    }
}

impl FromIterator<Step> for Trajectory {
    fn from_iter<I: IntoIterator<Item = Step>>(iter: I) -> Self {
        Self {
            steps: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chess::Position;

    #[test]
    fn steps_built_by_the_rules_are_coherent() {
        let before = Position::default();
        let m = "e2e4".parse().expect("parse");
        let after = Rules::apply(&before, m);
        let step = Step {
            before,
            m,
            reward: 0.,
            after,
            terminal: false,
        };
        assert!(step.coherent());
    }

    #[test]
    fn tampered_steps_are_incoherent() {
        let before = Position::default();
        let step = Step {
            before,
            m: "e2e4".parse().expect("parse"),
            reward: 0.,
            after: before, // did not move
            terminal: false,
        };
        assert!(!step.coherent());
    }

    #[test]
    fn returns_discount_backward() {
        let before = Position::default();
        let m = "e2e4".parse().expect("parse");
        let after = Rules::apply(&before, m);
        let mut trajectory = Trajectory::default();
        for reward in [0., 0., 1.] {
            trajectory.push(Step {
                before,
                m,
                reward,
                after,
                terminal: false,
            });
        }
        let returns = trajectory.returns(0.5);
        assert!((returns[2] - 1.).abs() < 1e-6);
        assert!((returns[1] - 0.5).abs() < 1e-6);
        assert!((returns[0] - 0.25).abs() < 1e-6);
    }
}
