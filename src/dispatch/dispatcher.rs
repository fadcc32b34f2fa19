use crate::chess::Move;
use crate::chess::Position;
use crate::chess::Rules;
use crate::learner::Kind;
use crate::learner::SharedLearner;
use crate::tactics::Arbiter;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

struct Request {
    seq: u64,
    position: Position,
    legal: Vec<Move>,
}

struct Response {
    seq: u64,
    m: Option<Move>,
}

/// a persistent single-threaded executor for one learner, reused
/// across turns. sequence numbers keep late answers from leaking into
/// later turns.
struct Lane {
    requests: crossbeam_channel::Sender<Request>,
    responses: crossbeam_channel::Receiver<Response>,
    degraded: Arc<AtomicBool>,
    seq: AtomicU64,
    timeout: Duration,
    _worker: std::thread::JoinHandle<()>,
}

impl Lane {
    fn of(kind: Kind, learner: SharedLearner, timeout: Duration) -> Self {
        let (request_tx, request_rx) = crossbeam_channel::bounded::<Request>(2);
        let (response_tx, response_rx) = crossbeam_channel::bounded::<Response>(4);
        let worker = std::thread::Builder::new()
            .name(format!("{}-dispatch", kind))
            .spawn(move || {
                for request in request_rx {
                    let m = learner
                        .lock()
                        .expect("learner lock")
                        .choose(&request.position, &request.legal, false);
                    let _ = response_tx.send(Response {
                        seq: request.seq,
                        m,
                    });
                }
            })
            .expect("spawn dispatch lane");
        Self {
            requests: request_tx,
            responses: response_rx,
            degraded: Arc::new(AtomicBool::new(false)),
            seq: AtomicU64::new(0),
            timeout,
            _worker: worker,
        }
    }
}

/// the per-turn entry point for live games: consults the arbiter,
/// submits to the learner's lane under a timeout, and always produces
/// a move when one exists. never mutates learner state.
pub struct Dispatcher {
    lanes: BTreeMap<Kind, Lane>,
}

impl Dispatcher {
    pub fn new(
        learners: BTreeMap<Kind, SharedLearner>,
        timeout: Duration,
        overrides: &BTreeMap<Kind, Duration>,
    ) -> Self {
        Self {
            lanes: learners
                .into_iter()
                .map(|(kind, learner)| {
                    let timeout = overrides.get(&kind).copied().unwrap_or(timeout);
                    (kind, Lane::of(kind, learner, timeout))
                })
                .collect(),
        }
    }

    pub fn degraded(&self, kind: Kind) -> bool {
        self.lanes
            .get(&kind)
            .is_some_and(|lane| lane.degraded.load(Ordering::SeqCst))
    }

    /// produce the move for one live turn. None only when the position
    /// has no legal moves at all.
    pub fn dispatch(&self, kind: Kind, position: &Position) -> Option<Move> {
        let side = position.turn();
        let legal = Rules::legal_moves(position, side);
        if legal.is_empty() {
            return None;
        }
        let defense = Arbiter::best_defense(position, &legal, side);
        if let Some(defense) = &defense {
            if defense.is_critical() {
                // mate defense pins the move; the learner is not asked
                log::info!("{} move pinned by arbiter: {}", kind, defense.m);
                return Some(defense.m);
            }
        }
        let proposed = self.consult(kind, position, &legal);
        match proposed {
            Some(m) => Some(m),
            None => {
                let fallback = defense
                    .map(|d| d.m)
                    .or_else(|| Rules::ordered(position, &legal).first().copied());
                log::warn!(
                    "{} failed to move; falling back to {}",
                    kind,
                    fallback.map(|m| m.to_string()).unwrap_or_default()
                );
                fallback
            }
        }
    }

    /// ask the lane, draining stale answers, within the lane's timeout
    fn consult(&self, kind: Kind, position: &Position, legal: &[Move]) -> Option<Move> {
        let Some(lane) = self.lanes.get(&kind) else {
            log::warn!("no dispatch lane for {}", kind);
            return None;
        };
        let seq = lane.seq.fetch_add(1, Ordering::SeqCst);
        let request = Request {
            seq,
            position: *position,
            legal: legal.to_vec(),
        };
        if lane.requests.try_send(request).is_err() {
            // the lane is still digesting an abandoned turn
            lane.degraded.store(true, Ordering::SeqCst);
            return None;
        }
        let deadline = Instant::now() + lane.timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                lane.degraded.store(true, Ordering::SeqCst);
                return None;
            }
            match lane.responses.recv_timeout(deadline - now) {
                Err(_) => {
                    lane.degraded.store(true, Ordering::SeqCst);
                    return None;
                }
                Ok(response) if response.seq != seq => continue,
                Ok(response) => match response.m {
                    Some(m) if legal.contains(&m) => {
                        lane.degraded.store(false, Ordering::SeqCst);
                        return Some(m);
                    }
                    proposed => {
                        log::warn!("{} proposed invalid move {:?}", kind, proposed);
                        lane.degraded.store(true, Ordering::SeqCst);
                        return None;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learner::Learner;
    use crate::learner::Metrics;
    use crate::learner::Session;
    use crate::selfplay::Rollout;
    use std::sync::Mutex;

    /// answers instantly with the first legal move
    struct Prompt;
    impl Rollout for Prompt {
        fn act(&mut self, _: &Position, legal: &[Move]) -> Move {
            legal[0]
        }
    }
    impl Learner for Prompt {
        fn kind(&self) -> Kind {
            Kind::Value
        }
        fn choose(&mut self, _: &Position, legal: &[Move], _: bool) -> Option<Move> {
            legal.first().copied()
        }
        fn train(&mut self, _: &Session) {}
        fn save(&self, _: &str, _: &mut dyn std::io::Write) -> std::io::Result<()> {
            Ok(())
        }
        fn load(&mut self, _: &str, _: &mut dyn std::io::Read) -> std::io::Result<()> {
            Ok(())
        }
        fn metrics(&self) -> Metrics {
            Metrics::default()
        }
    }

    /// never answers at all
    struct Glacier;
    impl Rollout for Glacier {
        fn act(&mut self, _: &Position, legal: &[Move]) -> Move {
            legal[0]
        }
    }
    impl Learner for Glacier {
        fn kind(&self) -> Kind {
            Kind::QTable
        }
        fn choose(&mut self, _: &Position, _: &[Move], _: bool) -> Option<Move> {
            std::thread::sleep(Duration::from_secs(3600));
            None
        }
        fn train(&mut self, _: &Session) {}
        fn save(&self, _: &str, _: &mut dyn std::io::Write) -> std::io::Result<()> {
            Ok(())
        }
        fn load(&mut self, _: &str, _: &mut dyn std::io::Read) -> std::io::Result<()> {
            Ok(())
        }
        fn metrics(&self) -> Metrics {
            Metrics::default()
        }
    }

    fn dispatcher(kind: Kind, learner: Box<dyn Learner>, timeout: Duration) -> Dispatcher {
        let mut learners: BTreeMap<Kind, SharedLearner> = BTreeMap::new();
        learners.insert(kind, Arc::new(Mutex::new(learner)));
        Dispatcher::new(learners, timeout, &BTreeMap::new())
    }

    #[test]
    fn healthy_learner_moves_promptly() {
        let dispatcher = dispatcher(Kind::Value, Box::new(Prompt), Duration::from_secs(5));
        let position = Position::default();
        let m = dispatcher.dispatch(Kind::Value, &position).expect("a move");
        let legal = Rules::legal_moves(&position, position.turn());
        assert!(legal.contains(&m));
        assert!(!dispatcher.degraded(Kind::Value));
    }

    #[test]
    fn blocked_learner_falls_back_within_the_bound() {
        let dispatcher = dispatcher(Kind::QTable, Box::new(Glacier), Duration::from_secs(1));
        let position = Position::default();
        let begun = Instant::now();
        let m = dispatcher.dispatch(Kind::QTable, &position).expect("fallback");
        assert!(begun.elapsed() <= Duration::from_secs(2));
        let legal = Rules::legal_moves(&position, position.turn());
        assert!(legal.contains(&m));
        assert!(dispatcher.degraded(Kind::QTable));
        // the process stays responsive for the next move too
        let again = Instant::now();
        let m = dispatcher.dispatch(Kind::QTable, &position).expect("fallback");
        assert!(again.elapsed() <= Duration::from_secs(2));
        assert!(legal.contains(&m));
    }

    #[test]
    fn arbiter_pins_the_mate_defense() {
        // scholar's mate threat: the dispatcher must return Nf6 without
        // consulting the learner at all
        let position = Position::from_fen(
            "r1bqkbnr/pppp1ppp/2n5/4p3/2B1P3/5Q2/PPPP1PPP/RNB1K1NR b KQkq - 3 3",
        )
        .expect("parse");
        let dispatcher = dispatcher(Kind::QTable, Box::new(Glacier), Duration::from_secs(1));
        let begun = Instant::now();
        let m = dispatcher.dispatch(Kind::QTable, &position).expect("a move");
        assert!(m == "g8f6".parse().expect("parse"));
        // pinned moves never wait out the learner timeout
        assert!(begun.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn terminal_positions_yield_no_move() {
        let mated = Position::from_fen(
            "r1bqkb1r/pppp1Qpp/2n2n2/4p3/2B1P3/8/PPPP1PPP/RNB1K1NR b KQkq - 0 4",
        )
        .expect("parse");
        let dispatcher = dispatcher(Kind::Value, Box::new(Prompt), Duration::from_secs(1));
        assert!(dispatcher.dispatch(Kind::Value, &mated).is_none());
    }
}
