pub mod chess;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod learner;
pub mod quality;
pub mod replay;
pub mod save;
pub mod selfplay;
pub mod tactics;

/// dimensional analysis types
type Reward = f32;
type Priority = f32;
type Weight = f32;

// session timing parameters
const PERIODIC_SAVE_MINUTES: u64 = 30;
const MOVE_TIMEOUT_SECONDS: u64 = 30;
const STOP_TIMEOUT_SECONDS: u64 = 5;
const FINAL_SAVE_TIMEOUT_SECONDS: u64 = 30;

// self-play parameters
const MAX_PLIES: usize = 512;
const BOOK_MIN_PLIES: usize = 1;
const BOOK_MAX_PLIES: usize = 15;

// replay parameters
const REPLAY_CAPACITY: usize = 10_000;
const REPLAY_CAPACITY_MIN: usize = 1_024;
const PRIORITY_FLOOR: Priority = 1e-6;

// checkpoint parameters
const SAVE_QUEUE_DEPTH: usize = 64;
const SAVE_RETRIES: usize = 3;
const SAVE_BACKOFF_MILLIS: u64 = 100;

// a3c parameters
const A3C_SYNC_FREQUENCY: usize = 50;
const GAE_LAMBDA: f32 = 0.95;
const GAE_GAMMA: f32 = 0.99;

/// trait for random generation, mainly (strictly?) for testing
pub trait Arbitrary {
    fn random() -> Self;
}

/// initialize logging to terminal and a timestamped file under logs/
pub fn init(level: log::LevelFilter) {
    std::fs::create_dir_all("logs").expect("create logs directory");
    let config = simplelog::ConfigBuilder::new()
        .set_location_level(log::LevelFilter::Off)
        .set_target_level(log::LevelFilter::Off)
        .set_thread_level(log::LevelFilter::Off)
        .build();
    let time = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("time moves slow")
        .as_secs();
    let file = simplelog::WriteLogger::new(
        log::LevelFilter::Debug,
        config.clone(),
        std::fs::File::create(format!("logs/{}.log", time)).expect("create log file"),
    );
    let term = simplelog::TermLogger::new(
        level,
        config.clone(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );
    simplelog::CombinedLogger::init(vec![term, file]).expect("initialize logger");
}

/// seconds since the unix epoch, for corrupt-file quarantine names
pub(crate) fn epoch() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("time moves slow")
        .as_secs()
}
