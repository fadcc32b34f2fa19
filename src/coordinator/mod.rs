pub mod coordinator;
pub mod stop;

pub use coordinator::Coordinator;
pub use stop::StopToken;
