//! Game core: players, input, match flow, simulation and state sync

pub mod arena;
pub mod bot;
pub mod combat;
pub mod flow;
pub mod input;
pub mod physics;
pub mod registry;
pub mod room;
pub mod scheduler;
pub mod session;
pub mod sim;
pub mod smoother;
pub mod snapshot;
pub mod sync;

pub use arena::ArenaSimulation;
pub use flow::{FlowError, FlowEvent, MatchFlow, MatchPhase, MatchState};
pub use input::{ControllerState, InputResolver, PlayerInput, WireInput};
pub use registry::{ConnectionState, Control, PlayerRecord, PlayerRegistry, RegistryError};
pub use room::{RoomHandle, RoomRegistry};
pub use session::{GameSession, SessionError, SessionEvent};
pub use sim::{KillCredit, SimulationStep};
pub use smoother::DisplaySmoother;
pub use snapshot::StateSnapshot;

/// Stable identity of a simulated player. Humans reuse their peer id; bots
/// get `bot-N`.
pub type PlayerId = String;
