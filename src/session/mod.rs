//! Connection lifecycle: state, the pure state machine, and the task that drives it

mod driver;
mod handle;
mod machine;
mod state;

pub use driver::{DriverSettings, OwnedLink};
pub(crate) use driver::{LinkCore, LinkDriver};
pub use handle::{LinkExit, LinkHandle, LinkMessage, SpawnedLink};
pub use machine::{ConnectionStateMachine, Effect, LinkEvent, Termination};
pub use state::{ConnectionId, ConnectionSnapshot, ConnectionState, ConnectionStatus, TransitionReason};
