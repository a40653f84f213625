//! Call-session orchestration: the state machine, the audio queue, the
//! player that feeds jobs into the call and the engine that owns them all.

pub mod engine;
pub mod player;
pub mod queue;
pub mod state;
pub mod status;

pub use engine::{CallEngine, EngineHandle};
pub use queue::AudioJob;
pub use status::StatusSnapshot;
