pub mod arena;
pub mod max_amount;
pub mod parameters;
#[allow(clippy::module_inception)]
pub mod round;
pub mod severity;
pub mod state;

pub use arena::Arena;
pub use max_amount::MaxSuggestedAmountProvider;
pub use parameters::RoundParameters;
pub use round::{Alice, Bob, EndRoundState, Phase, Round, RoundState, RoundStateDelta};
pub use severity::{Disruption, Punishment, SeverityConfig, SeverityPolicy};
pub use state::{CoinjoinState, ConstructionState, SigningState, StateDelta, StateError, StateEvent, StatePhase};
