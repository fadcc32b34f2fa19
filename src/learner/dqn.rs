use super::Kind;
use super::Learner;
use super::Metrics;
use super::Progress;
use super::Session;
use super::model::Network;
use super::model::softmax;
use crate::chess::Codec;
use crate::chess::Move;
use crate::chess::Position;
use crate::chess::Rules;
use crate::replay::Buffer;
use crate::replay::Experience;
use crate::selfplay::Outcome;
use crate::selfplay::Rollout;
use crate::selfplay::Trajectory;
use byteorder::BE;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::io::Read;
use std::io::Write;

/// 51-atom categorical support over the terminal reward range
const ATOMS: usize = 51;
const V_MIN: f32 = -1.;
const V_MAX: f32 = 1.;
const N_STEP: usize = 3;
const GAMMA: f32 = 0.99;
const BATCH: usize = 32;
const TARGET_SYNC: usize = 64;
const LEARNING_RATE: f32 = 0.002;
const ALPHA: f32 = 0.6;
const BETA_START: f32 = 0.4;
const EPSILON_START: f32 = 0.25;
const EPSILON_FLOOR: f32 = 0.05;

/// distributional dueling DQN over afterstates: 51-atom categorical
/// value, 3-step returns, double targets, prioritized replay. the
/// dueling head split is fixed at construction.
pub struct Dqn {
    main: Network,
    target: Network,
    buffer: Buffer,
    progress: Progress,
    updates: usize,
    rng: SmallRng,
}

impl Dqn {
    pub fn new(capacity: usize) -> Self {
        let mut rng = SmallRng::seed_from_u64(rand::rng().random());
        let main = Network::new(&[64, 128, ATOMS * 2], &mut rng);
        let target = main.clone();
        Self {
            main,
            target,
            buffer: Buffer::new(capacity, ALPHA, BETA_START),
            progress: Progress::default(),
            updates: 0,
            rng,
        }
    }

    fn support(j: usize) -> f32 {
        V_MIN + j as f32 * (V_MAX - V_MIN) / (ATOMS - 1) as f32
    }

    /// dueling combine: value atoms plus centered advantage atoms,
    /// softmaxed into a distribution over the support
    fn distribution(net: &Network, position: &Position) -> Vec<f32> {
        let out = net.forward(&Codec::flat(position));
        let (value, advantage) = out.split_at(ATOMS);
        let mean = advantage.iter().sum::<f32>() / ATOMS as f32;
        let logits = value
            .iter()
            .zip(advantage.iter())
            .map(|(v, a)| v + a - mean)
            .collect::<Vec<_>>();
        softmax(&logits)
    }

    fn expectation(dist: &[f32]) -> f32 {
        dist.iter()
            .enumerate()
            .map(|(j, p)| p * Self::support(j))
            .sum()
    }

    /// expected return of an afterstate, for the side that just moved
    fn value(net: &Network, position: &Position) -> f32 {
        Self::expectation(&Self::distribution(net, position))
    }

    fn epsilon(&self) -> f32 {
        (EPSILON_START * 0.999f32.powi(self.progress.episodes as i32)).max(EPSILON_FLOOR)
    }

    fn greedy(&self, position: &Position, legal: &[Move]) -> Option<Move> {
        legal.iter().copied().max_by(|a, b| {
            let va = Self::value(&self.main, &Rules::apply(position, *a));
            let vb = Self::value(&self.main, &Rules::apply(position, *b));
            va.partial_cmp(&vb).unwrap_or(std::cmp::Ordering::Equal)
        })
    }

    /// fold a finished trajectory into 3-step prioritized experiences.
    /// rewards two plies apart share the mover's frame; the one between
    /// is the opponent's and flips sign.
    fn remember(&mut self, trajectory: &Trajectory) {
        let steps = trajectory.steps();
        for (i, step) in steps.iter().enumerate() {
            let mut ret = 0.;
            let mut count = 0;
            let mut terminal = false;
            for k in 0..N_STEP {
                let Some(ahead) = steps.get(i + k) else {
                    break;
                };
                let sign = if k % 2 == 0 { 1. } else { -1. };
                ret += GAMMA.powi(k as i32) * sign * ahead.reward;
                count += 1;
                if ahead.terminal {
                    terminal = true;
                    break;
                }
            }
            let anchor = match terminal {
                true => None,
                false => steps.get(i + count - 1).map(|s| s.after),
            };
            // new experiences enter at the buffer's current maximum
            // priority so each gets replayed at least plausibly soon
            let priority = 1.;
            self.buffer
                .store(Experience::nstep(step.clone(), priority, ret, count, anchor));
        }
    }

    /// one prioritized batch: categorical projection of the 3-step
    /// double-DQN target, cross-entropy gradient weighted by the
    /// importance weights, priorities refreshed from the TD error
    fn replay(&mut self) {
        let sample = self.buffer.sample(BATCH, &mut self.rng);
        if sample.experiences.is_empty() {
            return;
        }
        for ((experience, weight), index) in sample
            .experiences
            .iter()
            .zip(sample.weights.iter())
            .zip(sample.indices.iter())
        {
            let afterstate = experience.step.after;
            let ret = experience.nstep_return.unwrap_or(experience.step.reward);
            let count = experience.nstep_count.max(1);
            let target = match &experience.anchor {
                None => Self::project_scalar(ret),
                Some(anchor) => {
                    let discount = GAMMA.powi(count as i32);
                    Self::project(ret, discount, &self.bootstrap(anchor))
                }
            };
            let predicted = Self::distribution(&self.main, &afterstate);
            let error = (Self::expectation(&target) - Self::expectation(&predicted)).abs();
            self.buffer.update(*index, error);
            self.gradient(&afterstate, &predicted, &target, *weight);
            self.updates += 1;
            if self.updates % TARGET_SYNC == 0 {
                self.target.copy_from(&self.main);
            }
        }
    }

    /// double DQN at the anchor: the opponent to move picks their best
    /// continuation under the main net, the target net scores it, and
    /// the distribution flips into our frame
    fn bootstrap(&self, anchor: &Position) -> Vec<f32> {
        let legal = Rules::legal_moves(anchor, anchor.turn());
        let best = legal
            .iter()
            .map(|m| Rules::apply(anchor, *m))
            .max_by(|a, b| {
                Self::value(&self.main, a)
                    .partial_cmp(&Self::value(&self.main, b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        match best {
            // no continuation: the anchor scores as a dead draw
            None => Self::project_scalar(0.),
            Some(continuation) => {
                let mut dist = Self::distribution(&self.target, &continuation);
                // the opponent's gain mirrors onto our symmetric support
                dist.reverse();
                dist
            }
        }
    }

    /// shrink-and-shift a source distribution onto the fixed support
    fn project(ret: f32, discount: f32, source: &[f32]) -> Vec<f32> {
        let delta = (V_MAX - V_MIN) / (ATOMS - 1) as f32;
        let mut target = vec![0.; ATOMS];
        for (j, p) in source.iter().enumerate() {
            let g = (ret + discount * Self::support(j)).clamp(V_MIN, V_MAX);
            let b = (g - V_MIN) / delta;
            let l = b.floor() as usize;
            let u = b.ceil() as usize;
            if l == u {
                target[l] += p;
            } else {
                target[l] += p * (u as f32 - b);
                target[u] += p * (b - l as f32);
            }
        }
        target
    }

    fn project_scalar(ret: f32) -> Vec<f32> {
        let mut source = vec![0.; ATOMS];
        source[0] = 1.;
        // a delta at zero scaled by nothing: shift the whole mass
        Self::project(ret, 0., &source)
    }

    /// cross-entropy gradient through the dueling combine
    fn gradient(&mut self, afterstate: &Position, predicted: &[f32], target: &[f32], weight: f32) {
        let input = Codec::flat(afterstate);
        let mut grad = vec![0.; ATOMS * 2];
        for j in 0..ATOMS {
            let g = (predicted[j] - target[j]) * weight * LEARNING_RATE;
            // value stream takes the atom gradient; the advantage
            // stream takes it centered, mirroring the forward combine
            grad[j] = g;
            grad[ATOMS + j] = g;
        }
        let mean = grad[ATOMS..].iter().sum::<f32>() / ATOMS as f32;
        for a in grad[ATOMS..].iter_mut() {
            *a -= mean;
        }
        self.main.backward(&input, &grad, 1.);
    }

    /// beta anneals toward full importance correction
    fn anneal(&mut self) {
        let beta = BETA_START + (1. - BETA_START) * (self.progress.episodes as f32 / 10_000.);
        self.buffer.set_beta(beta.min(1.));
    }
}

impl Rollout for Dqn {
    fn act(&mut self, position: &Position, legal: &[Move]) -> Move {
        self.choose(position, legal, true).unwrap_or(legal[0])
    }
}

impl Learner for Dqn {
    fn kind(&self) -> Kind {
        Kind::Dqn
    }

    fn choose(&mut self, position: &Position, legal: &[Move], training: bool) -> Option<Move> {
        use rand::seq::IndexedRandom;
        if legal.is_empty() {
            return None;
        }
        if training && self.rng.random::<f32>() < self.epsilon() {
            return legal.choose(&mut self.rng).copied();
        }
        self.greedy(position, legal)
    }

    fn train(&mut self, session: &Session) {
        let target = self.progress.episodes + session.budget;
        log::debug!("dqn training toward episode {}", target);
        while self.progress.episodes < target && !session.stop.stopped() {
            let trajectory = session
                .driver
                .run_episode(self, session.max_plies, &session.stop);
            if trajectory.is_empty() {
                continue;
            }
            self.remember(&trajectory);
            if !session.stop.stopped() {
                self.replay();
            }
            self.progress.absorb(&trajectory);
            self.anneal();
            session.dirty.mark(Kind::Dqn);
        }
    }

    fn absorb(&mut self, trajectory: &Trajectory, _: Outcome) {
        self.remember(trajectory);
        self.progress.absorb(trajectory);
    }

    fn save(&self, file: &str, w: &mut dyn Write) -> std::io::Result<()> {
        match file {
            "dqn_main.zip" => {
                self.progress.write(w)?;
                w.write_u64::<BE>(self.updates as u64)?;
                self.main.save(w)
            }
            "dqn_target.zip" => self.target.save(w),
            "dqn_experiences.dat" => {
                w.write_u64::<BE>(self.buffer.len() as u64)?;
                for experience in self.buffer.iter_all() {
                    write_experience(w, experience)?;
                }
                Ok(())
            }
            _ => Err(super::unknown_file(self.kind(), file)),
        }
    }

    fn load(&mut self, file: &str, r: &mut dyn Read) -> std::io::Result<()> {
        match file {
            "dqn_main.zip" => {
                self.progress = Progress::read(r)?;
                self.updates = r.read_u64::<BE>()? as usize;
                self.main = Network::load(r)?;
                Ok(())
            }
            "dqn_target.zip" => {
                self.target = Network::load(r)?;
                Ok(())
            }
            "dqn_experiences.dat" => {
                let count = r.read_u64::<BE>()?;
                for _ in 0..count {
                    let experience = read_experience(r)?;
                    self.buffer.store(experience);
                }
                Ok(())
            }
            _ => Err(super::unknown_file(self.kind(), file)),
        }
    }

    fn metrics(&self) -> Metrics {
        let mut metrics = self.progress.metrics();
        metrics.set("buffer", self.buffer.len() as f64);
        metrics.set("updates", self.updates as f64);
        metrics.set("epsilon", self.epsilon() as f64);
        metrics
    }
}

fn write_string(w: &mut dyn Write, s: &str) -> std::io::Result<()> {
    w.write_u16::<BE>(s.len() as u16)?;
    w.write_all(s.as_bytes())
}

fn read_string(r: &mut dyn Read) -> std::io::Result<String> {
    let len = r.read_u16::<BE>()? as usize;
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn write_position(w: &mut dyn Write, position: &Position) -> std::io::Result<()> {
    write_string(w, &position.to_fen())
}

fn read_position(r: &mut dyn Read) -> std::io::Result<Position> {
    Position::from_fen(&read_string(r)?)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn write_experience(w: &mut dyn Write, experience: &Experience) -> std::io::Result<()> {
    write_position(w, &experience.step.before)?;
    write_string(w, &experience.step.m.to_string())?;
    w.write_f32::<BE>(experience.step.reward)?;
    write_position(w, &experience.step.after)?;
    w.write_u8(experience.step.terminal as u8)?;
    w.write_f32::<BE>(experience.priority)?;
    w.write_f32::<BE>(experience.nstep_return.unwrap_or(0.))?;
    w.write_u16::<BE>(experience.nstep_count as u16)?;
    match &experience.anchor {
        None => w.write_u8(0),
        Some(anchor) => {
            w.write_u8(1)?;
            write_position(w, anchor)
        }
    }
}

fn read_experience(r: &mut dyn Read) -> std::io::Result<Experience> {
    let before = read_position(r)?;
    let m = read_string(r)?
        .parse()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad move"))?;
    let reward = r.read_f32::<BE>()?;
    let after = read_position(r)?;
    let terminal = r.read_u8()? != 0;
    let priority = r.read_f32::<BE>()?;
    let ret = r.read_f32::<BE>()?;
    let count = r.read_u16::<BE>()? as usize;
    let anchor = match r.read_u8()? {
        0 => None,
        _ => Some(read_position(r)?),
    };
    Ok(Experience {
        step: crate::selfplay::Step {
            before,
            m,
            reward,
            after,
            terminal,
        },
        priority,
        nstep_return: Some(ret),
        nstep_count: count,
        anchor,
    })
}
