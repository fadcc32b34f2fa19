use super::Kind;
use super::Learner;
use super::Metrics;
use super::Progress;
use super::Session;
use super::model::Network;
use super::model::softmax;
use crate::GAE_GAMMA;
use crate::GAE_LAMBDA;
use crate::chess::Codec;
use crate::chess::Move;
use crate::chess::Position;
use crate::chess::Rules;
use crate::chess::Space;
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
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

const ACTOR_LR: f32 = 0.003;
const CRITIC_LR: f32 = 0.01;
const N_STEPS: usize = 5;
const ENTROPY_START: f32 = 0.01;
const ENTROPY_FLOOR: f32 = 0.001;

/// the shared parameter blobs every local worker syncs against,
/// guarded by one mutex
struct Globals {
    actor: Network,
    critic: Network,
}

/// asynchronous advantage actor-critic: N local workers play episodes,
/// compute GAE(0.95, 0.99) advantages, update local parameters in
/// chunks of 2n frames, and exchange with the globals under the lock
/// every `sync` gradient steps.
pub struct A3c {
    globals: Arc<Mutex<Globals>>,
    workers: usize,
    sync: usize,
    episodes_shared: Arc<AtomicU64>,
    steps_shared: Arc<AtomicU64>,
    reward_shared: Arc<Mutex<f64>>,
    progress: Progress,
    rng: SmallRng,
}

impl A3c {
    pub fn new(workers: usize, sync: usize) -> Self {
        let mut rng = SmallRng::seed_from_u64(rand::rng().random());
        let globals = Globals {
            actor: Network::new(&[64, 64, Space::Simple.size() as usize], &mut rng),
            critic: Network::new(&[64, 64, 1], &mut rng),
        };
        Self {
            globals: Arc::new(Mutex::new(globals)),
            workers: workers.max(2),
            sync: sync.max(1),
            episodes_shared: Arc::new(AtomicU64::new(0)),
            steps_shared: Arc::new(AtomicU64::new(0)),
            reward_shared: Arc::new(Mutex::new(0.)),
            progress: Progress::default(),
            rng,
        }
    }

    fn entropy_coefficient(episodes: u64) -> f32 {
        (ENTROPY_START * 0.9995f32.powi(episodes as i32)).max(ENTROPY_FLOOR)
    }

    /// fold the shared worker counters into the owned progress
    fn settle(&mut self) {
        self.progress.episodes += self.episodes_shared.swap(0, Ordering::SeqCst);
        self.progress.steps += self.steps_shared.swap(0, Ordering::SeqCst);
        self.progress.reward_sum +=
            std::mem::take(&mut *self.reward_shared.lock().expect("reward lock"));
    }

    fn greedy(globals: &Arc<Mutex<Globals>>, position: &Position, legal: &[Move]) -> Option<Move> {
        let actor = &globals.lock().expect("globals lock").actor;
        let logits = actor.forward(&Codec::flat(position));
        legal.iter().copied().max_by(|a, b| {
            let la = logits[Codec::encode(Space::Simple, a) as usize];
            let lb = logits[Codec::encode(Space::Simple, b) as usize];
            la.partial_cmp(&lb).unwrap_or(std::cmp::Ordering::Equal)
        })
    }
}

/// one worker's local view: its own parameter copies and rng
struct Local {
    actor: Network,
    critic: Network,
    rng: SmallRng,
    gradient_steps: usize,
}

impl Local {
    fn of(globals: &Arc<Mutex<Globals>>, seed: u64) -> Self {
        let guard = globals.lock().expect("globals lock");
        Self {
            actor: guard.actor.clone(),
            critic: guard.critic.clone(),
            rng: SmallRng::seed_from_u64(seed),
            gradient_steps: 0,
        }
    }

    /// value of a position for its side to move
    fn mover_value(&self, position: &Position) -> f32 {
        self.critic.forward(&Codec::flat(position))[0] * position.turn().sign()
    }

    /// generalized advantage estimation over an alternating-mover
    /// trajectory: the successor's advantage lives in the opponent's
    /// frame, so the recursion flips its sign
    fn advantages(&self, trajectory: &Trajectory) -> Vec<f32> {
        let steps = trajectory.steps();
        let mut advantages = vec![0.; steps.len()];
        let mut following = 0.;
        for (i, step) in steps.iter().enumerate().rev() {
            let bootstrap = match step.terminal {
                true => 0.,
                false => -self.mover_value(&step.after),
            };
            let delta = step.reward + GAE_GAMMA * bootstrap - self.mover_value(&step.before);
            following = delta + GAE_GAMMA * GAE_LAMBDA * -following;
            advantages[i] = following;
        }
        advantages
    }

    /// actor-critic update over one chunk of frames
    fn update(&mut self, trajectory: &Trajectory, advantages: &[f32], entropy: f32) {
        for (step, advantage) in trajectory.steps().iter().zip(advantages.iter()) {
            let legal = Rules::legal_moves(&step.before, step.before.turn());
            if legal.is_empty() {
                continue;
            }
            let input = Codec::flat(&step.before);
            let logits = self.actor.forward(&input);
            let picked = legal
                .iter()
                .map(|m| logits[Codec::encode(Space::Simple, m) as usize])
                .collect::<Vec<_>>();
            let probs = softmax(&picked);
            let mut grad = vec![0.; self.actor.outputs()];
            for (m, p) in legal.iter().zip(probs.iter()) {
                let y = if *m == step.m { 1. } else { 0. };
                // policy gradient plus an entropy bonus that melts away
                let push = (p - y) * advantage;
                let spread = p * (p.ln() + 1.) * entropy;
                grad[Codec::encode(Space::Simple, m) as usize] = (push + spread) * ACTOR_LR;
            }
            self.actor.backward(&input, &grad, 1.);
            let value = self.critic.forward(&input)[0];
            let target = (self.mover_value(&step.before) + advantage) * step.before.turn().sign();
            self.critic
                .backward(&input, &[2. * (value - target)], CRITIC_LR);
            self.gradient_steps += 1;
        }
    }

    /// push local progress into the globals and pull the consensus back
    fn exchange(&mut self, globals: &Arc<Mutex<Globals>>) {
        let mut guard = globals.lock().expect("globals lock");
        guard.actor.blend(&self.actor, 0.5);
        guard.critic.blend(&self.critic, 0.5);
        self.actor.copy_from(&guard.actor);
        self.critic.copy_from(&guard.critic);
    }
}

impl Rollout for Local {
    fn act(&mut self, position: &Position, legal: &[Move]) -> Move {
        use rand::distr::Distribution;
        use rand::distr::weighted::WeightedIndex;
        let logits = self.actor.forward(&Codec::flat(position));
        let picked = legal
            .iter()
            .map(|m| logits[Codec::encode(Space::Simple, m) as usize])
            .collect::<Vec<_>>();
        let probs = softmax(&picked);
        match WeightedIndex::new(&probs) {
            Err(_) => legal[0],
            Ok(distribution) => legal[distribution.sample(&mut self.rng)],
        }
    }
}

impl Rollout for A3c {
    fn act(&mut self, position: &Position, legal: &[Move]) -> Move {
        Self::greedy(&self.globals, position, legal).unwrap_or(legal[0])
    }
}

impl Learner for A3c {
    fn kind(&self) -> Kind {
        Kind::A3c
    }

    fn choose(&mut self, position: &Position, legal: &[Move], training: bool) -> Option<Move> {
        use rand::seq::IndexedRandom;
        if legal.is_empty() {
            return None;
        }
        if training && self.rng.random::<f32>() < 0.05 {
            return legal.choose(&mut self.rng).copied();
        }
        Self::greedy(&self.globals, position, legal)
    }

    /// spinning the worker pool up is not free; amortize it
    fn stride(&self) -> u64 {
        32
    }

    /// fan out the internal worker pool and block until the budget or
    /// the stop token; the coordinator sees one well-behaved learner
    fn train(&mut self, session: &Session) {
        let target = self.progress.episodes + session.budget;
        log::debug!(
            "a3c training toward episode {} with {} workers",
            target,
            self.workers
        );
        let base = self.progress.episodes;
        std::thread::scope(|scope| {
            for worker in 0..self.workers {
                let globals = self.globals.clone();
                let episodes = self.episodes_shared.clone();
                let steps = self.steps_shared.clone();
                let rewards = self.reward_shared.clone();
                let session = session.clone();
                let sync = self.sync;
                let seed = self.rng.random::<u64>() ^ worker as u64;
                scope.spawn(move || {
                    let mut local = Local::of(&globals, seed);
                    let mut since_exchange = 0usize;
                    while !session.stop.stopped()
                        && base + episodes.load(Ordering::SeqCst) < target
                    {
                        let trajectory =
                            session
                                .driver
                                .run_episode(&mut local, session.max_plies, &session.stop);
                        if trajectory.is_empty() {
                            continue;
                        }
                        let done = base + episodes.fetch_add(1, Ordering::SeqCst);
                        steps.fetch_add(trajectory.len() as u64, Ordering::SeqCst);
                        *rewards.lock().expect("reward lock") += trajectory.reward() as f64;
                        let entropy = A3c::entropy_coefficient(done);
                        let advantages = local.advantages(&trajectory);
                        // n-step updates arrive in chunks of 2n frames
                        let chunk = N_STEPS * 2;
                        let steps_before = local.gradient_steps;
                        for start in (0..trajectory.len()).step_by(chunk) {
                            if session.stop.stopped() {
                                break;
                            }
                            let end = (start + chunk).min(trajectory.len());
                            let slice = trajectory.steps()[start..end]
                                .iter()
                                .cloned()
                                .collect::<Trajectory>();
                            local.update(&slice, &advantages[start..end], entropy);
                        }
                        since_exchange += local.gradient_steps - steps_before;
                        if since_exchange >= sync {
                            local.exchange(&globals);
                            since_exchange = 0;
                        }
                        session.dirty.mark(Kind::A3c);
                    }
                    // leave nothing stranded in the local copies
                    local.exchange(&globals);
                });
            }
        });
        self.settle();
        log::debug!("a3c workers joined at episode {}", self.progress.episodes);
    }

    fn save(&self, file: &str, w: &mut dyn Write) -> std::io::Result<()> {
        let guard = self.globals.lock().expect("globals lock");
        match file {
            "a3c_actor.zip" => guard.actor.save(w),
            "a3c_critic.zip" => guard.critic.save(w),
            "a3c_state.dat" => {
                self.progress.write(w)?;
                w.write_u32::<BE>(self.workers as u32)?;
                w.write_u32::<BE>(self.sync as u32)?;
                Ok(())
            }
            _ => Err(super::unknown_file(self.kind(), file)),
        }
    }

    fn load(&mut self, file: &str, r: &mut dyn Read) -> std::io::Result<()> {
        match file {
            "a3c_actor.zip" => {
                self.globals.lock().expect("globals lock").actor = Network::load(r)?;
                Ok(())
            }
            "a3c_critic.zip" => {
                self.globals.lock().expect("globals lock").critic = Network::load(r)?;
                Ok(())
            }
            "a3c_state.dat" => {
                self.progress = Progress::read(r)?;
                let _workers = r.read_u32::<BE>()?;
                let _sync = r.read_u32::<BE>()?;
                Ok(())
            }
            _ => Err(super::unknown_file(self.kind(), file)),
        }
    }

    fn metrics(&self) -> Metrics {
        let mut metrics = self.progress.metrics();
        metrics.set("workers", self.workers as f64);
        metrics.set(
            "entropy",
            Self::entropy_coefficient(self.progress.episodes) as f64,
        );
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::StopToken;
    use crate::save::Dirty;
    use crate::selfplay::Driver;

    fn session(budget: u64) -> Session {
        let mut session = Session::new(
            budget,
            StopToken::new(),
            Arc::new(Driver::new()),
            Dirty::new(),
        );
        session.max_plies = 8;
        session
    }

    #[test]
    fn workers_share_one_budget() {
        let mut learner = A3c::new(2, 4);
        learner.train(&session(4));
        // racing workers may start one last episode each; never fewer
        let episodes = learner.metrics().episodes();
        assert!(episodes >= 4);
        assert!(episodes <= 4 + 2);
    }

    #[test]
    fn stop_token_halts_all_workers() {
        let mut learner = A3c::new(3, 4);
        let session = session(1_000_000);
        session.stop.stop();
        learner.train(&session);
        assert!(learner.metrics().episodes() == 0);
    }

    #[test]
    fn advantages_flip_frames_backward() {
        let learner = A3c::new(2, 4);
        let local = Local::of(&learner.globals, 7);
        let driver = Driver::new();
        let stop = StopToken::new();
        let mut actor = Local::of(&learner.globals, 8);
        let trajectory = driver.run_episode(&mut actor, 6, &stop);
        let advantages = local.advantages(&trajectory);
        assert!(advantages.len() == trajectory.len());
    }

    #[test]
    fn is_load_inverse_save_across_all_files() {
        let mut learner = A3c::new(2, 4);
        learner.train(&session(1));
        let mut restored = A3c::new(2, 4);
        for file in Kind::A3c.files() {
            let mut buffer = Vec::new();
            learner.save(file, &mut buffer).expect("save");
            restored.load(file, &mut buffer.as_slice()).expect("load");
        }
        let a = learner.globals.lock().expect("lock");
        let b = restored.globals.lock().expect("lock");
        assert!(a.actor == b.actor);
        assert!(a.critic == b.critic);
        assert!(restored.progress == learner.progress);
    }
}
