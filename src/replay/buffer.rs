use super::experience::Experience;
use crate::PRIORITY_FLOOR;
use crate::Priority;
use crate::Weight;
use std::collections::VecDeque;

/// a prioritized sample: experiences, their importance weights
/// normalized by the largest, and the buffer indices for priority
/// updates after the learning step.
#[derive(Debug, Clone, Default)]
pub struct Sample {
    pub experiences: Vec<Experience>,
    pub weights: Vec<Weight>,
    pub indices: Vec<usize>,
}

/// bounded single-owner experience store with proportional prioritized
/// sampling. eviction is strictly FIFO by insertion, whatever the
/// priorities say; sampling is where priority matters.
#[derive(Debug)]
pub struct Buffer {
    entries: VecDeque<Experience>,
    capacity: usize,
    alpha: f32,
    beta: f32,
}

impl Buffer {
    pub fn new(capacity: usize, alpha: f32, beta: f32) -> Self {
        assert!(capacity > 0);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            alpha,
            beta,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    pub fn capacity(&self) -> usize {
        self.capacity
    }
    /// annealed externally over the course of training
    pub fn set_beta(&mut self, beta: f32) {
        self.beta = beta;
    }

    /// O(1): push, evicting the oldest entry at capacity. incoherent
    /// experiences are discarded outright.
    pub fn store(&mut self, experience: Experience) {
        if !experience.step.coherent() {
            log::warn!("discarding incoherent experience");
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        let mut experience = experience;
        experience.priority = experience.priority.max(PRIORITY_FLOOR);
        self.entries.push_back(experience);
    }

    /// draw k with replacement, p_i proportional to priority_i^alpha.
    /// an empty buffer yields an empty sample.
    pub fn sample(&self, k: usize, rng: &mut impl rand::Rng) -> Sample {
        use rand::distr::Distribution;
        use rand::distr::weighted::WeightedIndex;
        if self.entries.is_empty() || k == 0 {
            return Sample::default();
        }
        let scaled = self
            .entries
            .iter()
            .map(|e| e.priority.powf(self.alpha).max(PRIORITY_FLOOR))
            .collect::<Vec<_>>();
        let total = scaled.iter().sum::<f32>();
        let distribution = WeightedIndex::new(&scaled).expect("positive priorities");
        let n = self.entries.len() as f32;
        let indices = (0..k)
            .map(|_| distribution.sample(rng))
            .collect::<Vec<_>>();
        let mut weights = indices
            .iter()
            .map(|i| (n * scaled[*i] / total).powf(-self.beta))
            .collect::<Vec<_>>();
        let max = weights.iter().copied().fold(f32::MIN, f32::max).max(1e-12);
        for w in weights.iter_mut() {
            *w /= max;
        }
        Sample {
            experiences: indices.iter().map(|i| self.entries[*i].clone()).collect(),
            weights,
            indices,
        }
    }

    /// set a fresh priority, clamped to the floor
    pub fn update(&mut self, index: usize, priority: Priority) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.priority = priority.max(PRIORITY_FLOOR);
        }
    }

    /// snapshot view for persistence
    pub fn iter_all(&self) -> impl Iterator<Item = &Experience> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chess::Position;
    use crate::chess::Rules;
    use crate::selfplay::Step;
    use rand::SeedableRng;

    fn experience(priority: f32) -> Experience {
        let before = Position::default();
        let m = "e2e4".parse().expect("parse");
        Experience::new(
            Step {
                before,
                m,
                reward: 0.,
                after: Rules::apply(&before, m),
                terminal: false,
            },
            priority,
        )
    }

    #[test]
    fn size_never_exceeds_capacity() {
        let mut buffer = Buffer::new(8, 0.6, 0.4);
        for i in 0..100 {
            buffer.store(experience(i as f32));
            assert!(buffer.len() <= 8);
            assert!(buffer.iter_all().count() == buffer.len());
        }
    }

    #[test]
    fn eviction_is_fifo_regardless_of_priority() {
        let mut buffer = Buffer::new(3, 1., 0.);
        for priority in [100., 1., 50., 2.] {
            buffer.store(experience(priority));
        }
        // the 100-priority entry was oldest and is gone
        let priorities = buffer.iter_all().map(|e| e.priority).collect::<Vec<_>>();
        assert!(priorities == vec![1., 50., 2.]);
    }

    #[test]
    fn empty_buffer_samples_empty() {
        let buffer = Buffer::new(8, 1., 0.);
        let ref mut rng = rand::rngs::SmallRng::seed_from_u64(0);
        let sample = buffer.sample(10, rng);
        assert!(sample.experiences.is_empty());
        assert!(sample.weights.is_empty());
        assert!(sample.indices.is_empty());
    }

    #[test]
    fn incoherent_experiences_are_discarded() {
        let mut buffer = Buffer::new(8, 1., 0.);
        let before = Position::default();
        let step = Step {
            before,
            m: "e2e4".parse().expect("parse"),
            reward: 0.,
            after: before,
            terminal: false,
        };
        buffer.store(Experience::new(step, 1.));
        assert!(buffer.is_empty());
    }

    #[test]
    fn update_clamps_to_the_floor() {
        let mut buffer = Buffer::new(8, 1., 0.);
        buffer.store(experience(1.));
        buffer.update(0, -3.);
        assert!(buffer.iter_all().next().expect("entry").priority == crate::PRIORITY_FLOOR);
    }

    #[test]
    fn draw_frequencies_track_priorities() {
        let mut buffer = Buffer::new(8, 1., 0.);
        for priority in [1., 2., 3., 4., 5.] {
            buffer.store(experience(priority));
        }
        let ref mut rng = rand::rngs::SmallRng::seed_from_u64(42);
        let mut counts = [0usize; 5];
        for _ in 0..10 {
            let sample = buffer.sample(1_000, rng);
            for index in sample.indices {
                counts[index] += 1;
            }
        }
        for (index, count) in counts.iter().enumerate() {
            let expected = (index + 1) as f32 / 15.;
            let observed = *count as f32 / 10_000.;
            assert!(
                (observed - expected).abs() < 0.02,
                "index {} drew {} expected {}",
                index,
                observed,
                expected
            );
        }
    }

    #[test]
    fn importance_weights_are_normalized() {
        let mut buffer = Buffer::new(8, 1., 0.5);
        for priority in [1., 2., 4., 8.] {
            buffer.store(experience(priority));
        }
        let ref mut rng = rand::rngs::SmallRng::seed_from_u64(7);
        let sample = buffer.sample(64, rng);
        assert!(sample.weights.iter().all(|w| *w > 0. && *w <= 1. + 1e-6));
        assert!(sample.weights.iter().any(|w| (*w - 1.).abs() < 1e-6));
    }
}
