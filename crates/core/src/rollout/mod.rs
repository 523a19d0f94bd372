pub mod clock;
pub mod deployer;
pub mod machine;
pub mod orchestrator;
pub mod store;

pub use clock::{ManualClock, RolloutClock, SystemClock};
pub use deployer::{
    DeployRequest, DeployedVariant, DeployerCall, DeploymentError, DeploymentErrorKind,
    InMemoryRuleDeployer, RuleDeployer,
};
pub use machine::{RolloutEvent, RolloutMachine, RolloutTransitionError, TransitionOutcome};
pub use orchestrator::{RolloutOrchestrator, RolloutServices};
pub use store::{InMemoryRolloutStore, RuleProposalStore, StoreError};
