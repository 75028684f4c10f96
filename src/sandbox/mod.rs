//! Sandbox lifecycle: isolated agent execution and patch scoring.

pub mod exchange;
pub mod executor;
pub mod scorer;

pub use exchange::{AgentOutput, AgentResult, AgentStatus, SandboxInput};
pub use executor::Sandbox;
pub use scorer::{ScoredOutcome, Scorer};
