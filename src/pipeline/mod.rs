//! Discovery pipeline.
//!
//! A run takes a frontier problem statement through nine ordered stages,
//! each backed by one or more completion calls:
//!
//! 1. **Target Selection**: pick one concrete target
//! 2. **Hypothesis Generation**: mechanistically distinct approaches
//! 3. **Step Decomposition**: atomic steps with context-free questions
//! 4. **Physics Validation**: one oracle call per step
//! 5. **Chain Assembly**: consistency check, VALID / FIXABLE / BROKEN
//! 6. **Engineering Proposals**: for every chain that is not BROKEN
//! 7. **Requirement Challenges**: iterative, each challenge physics-checked
//! 8. **Synthesis**: ranked solutions across all approaches
//! 9. **Final Write-up**: thesis for the top solutions
//!
//! # Components
//!
//! - [`DiscoveryPipeline`]: the state machine
//! - [`RunController`]: single-run control surface with published snapshots
//! - [`CheckpointStore`]: per-stage persistence of the [`RunState`]
//! - [`ProgressObserver`]: fire-and-forget progress and log notifications
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use discovery_forge::llm::LmStudioClient;
//! use discovery_forge::pipeline::{DiscoveryPipeline, PipelineConfig};
//!
//! let config = PipelineConfig::from_env()?;
//! let client = LmStudioClient::new(&config.api_base, &config.api_key, config.retry.clone())?;
//! let pipeline = DiscoveryPipeline::new(Arc::new(client), config);
//!
//! let outcome = pipeline.run("Synthesize metallic hydrogen at ambient pressure").await;
//! println!("{} after {}", outcome.status, outcome.state.last_completed_label());
//! ```

pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod events;
pub mod orchestrator;
pub mod report;
pub mod types;

pub use checkpoint::{CheckpointDocument, CheckpointStore, LATEST_CHECKPOINT};
pub use config::{
    PipelineConfig, StageConfigs, StageOverride, MAX_CHALLENGE_ITERATIONS, MAX_HYPOTHESES,
};
pub use controller::{RunController, RunSnapshot, ServiceStatus, LOG_TAIL_LIMIT};
pub use events::{ChannelObserver, ObserverSet, PipelineEvent, ProgressObserver, TracingObserver};
pub use orchestrator::{DiscoveryPipeline, RunOutcome, FIRST_ITERATION_CONTEXT};
pub use report::{render_summary, render_thesis, write_reports, ReportPaths};
pub use types::{
    AtomicStep, ChainAssembly, ChainStatus, ChallengeIteration, ChallengeRun,
    EngineeringProposal, FinalWriteUp, Hypothesis, HypothesisOutcome, HypothesisSet, RunState,
    RunStatus, Stage, Synthesis, SynthesizedSolution, TargetSelection, ValidatedChallenge,
    Validation, NO_PHYSICS_QUESTION, PROGRESS_TOTAL,
};
