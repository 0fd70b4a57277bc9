//! The discovery state machine.
//!
//! [`DiscoveryPipeline`] drives nine ordered stages against a
//! [`CompletionProvider`]:
//!
//! 1. Target selection
//! 2. Hypothesis generation
//! 3. Step decomposition, per hypothesis
//! 4. Physics validation, per atomic step
//! 5. Chain assembly, per hypothesis
//! 6. Engineering proposals for every chain that is not BROKEN
//! 7. Requirement challenges, a fixed number of iterations per proposal
//! 8. Synthesis
//! 9. Final write-up
//!
//! Stages 3-5 run as one loop over hypotheses. A stage result is stored in the
//! [`RunState`] only after the stage finishes, and a checkpoint is saved after
//! every stage. A missing response from a single-call stage or an observed
//! stop request ends the run early. Either way the run finishes through the
//! same save routine, as does a panic anywhere inside the stages.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use super::checkpoint::CheckpointStore;
use super::config::PipelineConfig;
use super::events::{ObserverSet, ProgressObserver};
use super::report::{write_reports, ReportPaths};
use super::types::*;
use crate::error::PipelineError;
use crate::llm::CompletionProvider;
use crate::prompts::AgentRole;
use crate::utils::{parse_model_output, truncate_chars};

/// Context handed to the first challenge iteration.
pub const FIRST_ITERATION_CONTEXT: &str = "None yet, this is the first iteration.";

/// Outcome of one completion call as seen by a stage.
enum Reply {
    Text(String),
    NoResponse,
    Cancelled,
}

impl Reply {
    /// For calls whose absence ends the run.
    fn required(self, stage: Stage) -> Result<String, Halt> {
        match self {
            Reply::Text(text) => Ok(text),
            Reply::NoResponse => Err(Halt::NoResponse(stage)),
            Reply::Cancelled => Err(Halt::Cancelled),
        }
    }

    /// For per-item calls: a missing response is recorded, a stop is not.
    fn optional(self) -> Result<Option<String>, Halt> {
        match self {
            Reply::Text(text) => Ok(Some(text)),
            Reply::NoResponse => Ok(None),
            Reply::Cancelled => Err(Halt::Cancelled),
        }
    }
}

/// Why the stage sequence ended early.
#[derive(Debug)]
enum Halt {
    Cancelled,
    NoResponse(Stage),
}

/// Result of a finished run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub state: RunState,
    /// Why the run stopped early, if it did.
    pub reason: Option<String>,
    pub reports: ReportPaths,
}

/// Runs discovery pipelines against a completion provider.
pub struct DiscoveryPipeline {
    provider: Arc<dyn CompletionProvider>,
    config: PipelineConfig,
    store: CheckpointStore,
    observer: Arc<dyn ProgressObserver>,
    cancel: CancellationToken,
}

impl DiscoveryPipeline {
    /// Creates a pipeline that reports to `tracing`.
    pub fn new(provider: Arc<dyn CompletionProvider>, config: PipelineConfig) -> Self {
        Self {
            store: CheckpointStore::new(config.results_dir.clone()),
            provider,
            config,
            observer: Arc::new(ObserverSet::tracing()),
            cancel: CancellationToken::new(),
        }
    }

    /// Replaces the progress observer.
    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Uses an externally owned stop token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops the run cooperatively when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn checkpoint_store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Runs every stage for a new problem.
    pub async fn run(&self, problem: &str) -> RunOutcome {
        self.resume(RunState::new(problem)).await
    }

    /// Runs from an existing state; stages whose results are present are
    /// skipped.
    pub async fn resume(&self, mut state: RunState) -> RunOutcome {
        tracing::info!(
            run_id = %state.run_id,
            resumed_after = state.last_completed_label(),
            "Starting discovery run"
        );
        self.log(format!("Starting discovery run {}", state.run_id));

        let result = AssertUnwindSafe(self.run_stages(&mut state))
            .catch_unwind()
            .await;

        let (status, reason) = match result {
            Ok(Ok(())) => (RunStatus::Completed, None),
            Ok(Err(Halt::Cancelled)) => (
                RunStatus::Stopped,
                Some(format!(
                    "Stop requested after {}",
                    state.last_completed_label()
                )),
            ),
            Ok(Err(Halt::NoResponse(stage))) => (
                RunStatus::Failed,
                Some(format!("{} produced no response", stage)),
            ),
            Err(payload) => {
                let fault = PipelineError::Panicked(panic_payload_to_string(&payload));
                tracing::error!(run_id = %state.run_id, error = %fault, "Discovery run aborted");
                (RunStatus::Failed, Some(fault.to_string()))
            }
        };

        match &reason {
            Some(reason) => self.log(format!("Run ended early: {}", reason)),
            None => self.log("Discovery pipeline complete".to_string()),
        }

        self.progress(f64::from(PROGRESS_TOTAL), "Saving results");
        self.store.save_logged(&state).await;
        let reports = write_reports(&self.config.results_dir, &state).await;

        tracing::info!(run_id = %state.run_id, %status, "Discovery run finished");
        self.observer.on_finished(status);

        RunOutcome {
            status,
            state,
            reason,
            reports,
        }
    }

    async fn run_stages(&self, state: &mut RunState) -> Result<(), Halt> {
        let target = match state.target.clone() {
            Some(target) => target,
            None => {
                let target = self.select_target(&state.problem).await?;
                state.target = Some(target.clone());
                self.finish_stage(state, Stage::TargetSelection).await;
                target
            }
        };

        let hypotheses = match state.hypotheses.clone() {
            Some(hypotheses) => hypotheses,
            None => {
                let hypotheses = self.generate_hypotheses(&target).await?;
                state.hypotheses = Some(hypotheses.clone());
                self.finish_stage(state, Stage::HypothesisGeneration).await;
                hypotheses
            }
        };

        if state.approach_results.is_none() {
            let results = self.process_hypotheses(&hypotheses).await?;
            state.approach_results = Some(results);
            self.finish_stage(state, Stage::ChainAssembly).await;
        }

        if state.engineering.is_none() {
            let proposals = self.propose_engineering(state).await?;
            state.engineering = Some(proposals);
            self.finish_stage(state, Stage::EngineeringProposal).await;
        }

        if state.challenges.is_none() {
            let runs = self.challenge_requirements(state).await?;
            state.challenges = Some(runs);
            self.finish_stage(state, Stage::RequirementChallenge).await;
        }

        let synthesis = match state.synthesis.clone() {
            Some(synthesis) => synthesis,
            None => {
                let synthesis = self.synthesize(state, &target).await?;
                state.synthesis = Some(synthesis.clone());
                self.finish_stage(state, Stage::Synthesis).await;
                synthesis
            }
        };

        if state.final_writeup.is_none() {
            let writeup = self.write_up(&state.problem, &synthesis).await?;
            state.final_writeup = Some(writeup);
            self.finish_stage(state, Stage::FinalWriteUp).await;
        }

        Ok(())
    }

    // ------------------------------------------------------------------------
    // Stages
    // ------------------------------------------------------------------------

    async fn select_target(&self, problem: &str) -> Result<TargetSelection, Halt> {
        self.ensure_active()?;
        self.progress(1.0, "Stage 1: Selecting specific target...");

        let raw = self
            .call(AgentRole::Orchestrator, &[("problem_description", problem)])
            .await
            .required(Stage::TargetSelection)?;

        let target = TargetSelection::from_response(&raw);
        self.log(format!("Selected target: {}", target.target_label()));
        Ok(target)
    }

    async fn generate_hypotheses(&self, target: &TargetSelection) -> Result<HypothesisSet, Halt> {
        self.ensure_active()?;
        self.progress(2.0, "Stage 2: Generating hypotheses...");

        let num = self.config.num_hypotheses.to_string();
        let raw = self
            .call(
                AgentRole::HypothesisGenerator,
                &[
                    ("num_hypotheses", num.as_str()),
                    ("task_description", target.task_description.as_str()),
                    ("target_properties", target.target_properties_text()),
                    ("known_constraints", target.known_constraints_text()),
                ],
            )
            .await
            .required(Stage::HypothesisGeneration)?;

        let hypotheses = HypothesisSet::from_response(&raw);
        self.log(format!("Generated {} hypotheses", hypotheses.len()));
        Ok(hypotheses)
    }

    /// Stages 3-5. A hypothesis whose decomposition produced nothing is
    /// recorded as failed and its siblings still run.
    async fn process_hypotheses(
        &self,
        hypotheses: &HypothesisSet,
    ) -> Result<Vec<HypothesisOutcome>, Halt> {
        let count = hypotheses.len();
        let mut results = Vec::with_capacity(count);

        for hypothesis in &hypotheses.items {
            self.ensure_active()?;
            let offset = hypothesis.index as f64 * 3.0 / count as f64;

            self.progress(
                3.0 + offset,
                &format!(
                    "Stage 3: Decomposing approach {}/{}: {}",
                    hypothesis.index + 1,
                    count,
                    hypothesis.name
                ),
            );
            let description = hypothesis.description_text();
            let conditions = hypothesis.conditions_text();
            let reply = self
                .call(
                    AgentRole::StepDecomposer,
                    &[
                        ("approach_name", hypothesis.name.as_str()),
                        ("core_mechanism", hypothesis.core_mechanism_text()),
                        ("description", description.as_str()),
                        ("conditions", conditions.as_str()),
                        ("physics_basis", hypothesis.physics_basis_text()),
                    ],
                )
                .await
                .optional()?;

            let Some(raw_steps) = reply else {
                tracing::warn!(hypothesis = %hypothesis.name, "Step decomposition produced no response");
                self.log(format!("Decomposer failed for {}", hypothesis.name));
                results.push(HypothesisOutcome::DecomposerFailed {
                    hypothesis: hypothesis.clone(),
                });
                continue;
            };

            let steps = AtomicStep::list_from_response(&raw_steps);
            self.log(format!(
                "Decomposed {} into {} atomic steps",
                hypothesis.name,
                steps.len()
            ));

            self.progress(
                4.0 + offset,
                &format!(
                    "Stage 4: Validating {} steps for {}",
                    steps.len(),
                    hypothesis.name
                ),
            );
            let validations = self.validate_steps(&steps).await?;

            self.progress(
                5.0 + offset,
                &format!("Stage 5: Assembling chain for {}", hypothesis.name),
            );
            let digest = steps_with_validations(&steps, &validations);
            let reply = self
                .call(
                    AgentRole::ChainAssembler,
                    &[
                        ("approach_name", hypothesis.name.as_str()),
                        ("steps_with_validations", digest.as_str()),
                    ],
                )
                .await
                .optional()?;

            let chain = ChainAssembly::from_response(reply);
            self.log(format!("Chain status for {}: {}", hypothesis.name, chain.status));

            results.push(HypothesisOutcome::ChainAssembled {
                hypothesis: hypothesis.clone(),
                steps,
                validations,
                chain,
            });
        }

        Ok(results)
    }

    async fn validate_steps(&self, steps: &[AtomicStep]) -> Result<Vec<Validation>, Halt> {
        let mut validations = Vec::with_capacity(steps.len());

        for (i, step) in steps.iter().enumerate() {
            let answer = self
                .call(AgentRole::PhysicsOracle, &[("question", step.question.as_str())])
                .await
                .optional()?;

            let validation = Validation::new(
                step.question.clone(),
                answer,
                self.config.assume_feasible_when_unparsed,
            );
            self.log(format!(
                "  Step {}: {}",
                i + 1,
                if validation.physically_possible {
                    "POSSIBLE"
                } else {
                    "IMPOSSIBLE"
                }
            ));
            validations.push(validation);
        }

        Ok(validations)
    }

    async fn propose_engineering(&self, state: &RunState) -> Result<Vec<EngineeringProposal>, Halt> {
        self.ensure_active()?;
        self.progress(6.0, "Stage 6: Generating engineering proposals...");

        let candidates: Vec<(Hypothesis, ChainAssembly)> = state
            .engineering_candidates()
            .map(|(h, c)| (h.clone(), c.clone()))
            .collect();
        let total = state.approach_results.as_ref().map_or(0, Vec::len);
        self.log(format!(
            "{} of {} approaches proceed to engineering",
            candidates.len(),
            total
        ));

        let mut proposals = Vec::with_capacity(candidates.len());
        for (hypothesis, chain) in &candidates {
            let pathway = chain.pathway_text();
            let conditions = chain.conditions_text();
            let reply = self
                .call(
                    AgentRole::EngineeringProposer,
                    &[
                        ("assembled_pathway", pathway.as_str()),
                        ("overall_conditions", conditions.as_str()),
                    ],
                )
                .await
                .optional()?;

            let proposal = EngineeringProposal::new(hypothesis, reply);
            if proposal.has_content() {
                self.log(format!("Engineering proposal ready for {}", hypothesis.name));
            } else {
                self.log(format!("No engineering proposal for {}", hypothesis.name));
            }
            proposals.push(proposal);
        }

        Ok(proposals)
    }

    async fn challenge_requirements(&self, state: &RunState) -> Result<Vec<ChallengeRun>, Halt> {
        self.ensure_active()?;
        self.progress(7.0, "Stage 7: Challenging requirements...");

        let mut runs = Vec::new();
        for proposal in state.engineering.iter().flatten() {
            if !proposal.has_content() {
                continue;
            }
            let pathway = state
                .approach_results
                .iter()
                .flatten()
                .find(|o| o.hypothesis().index == proposal.hypothesis_index)
                .and_then(HypothesisOutcome::chain)
                .map(ChainAssembly::pathway_text)
                .unwrap_or_default();

            runs.push(self.challenge_proposal(proposal, &pathway).await?);
        }

        Ok(runs)
    }

    /// Iterations feed each other through a growing context string.
    async fn challenge_proposal(
        &self,
        proposal: &EngineeringProposal,
        pathway: &str,
    ) -> Result<ChallengeRun, Halt> {
        let max_iterations = self.config.challenge_iterations;
        let max_text = max_iterations.to_string();
        let mut context = FIRST_ITERATION_CONTEXT.to_string();
        let mut iterations = Vec::with_capacity(max_iterations);

        for iteration in 1..=max_iterations {
            self.ensure_active()?;
            self.log(format!(
                "Challenge iteration {}/{} for {}",
                iteration, max_iterations, proposal.approach_name
            ));

            let iteration_text = iteration.to_string();
            let raw = self
                .call(
                    AgentRole::RequirementChallenger,
                    &[
                        ("iteration", iteration_text.as_str()),
                        ("max_iterations", max_text.as_str()),
                        ("engineering_proposal", proposal.proposal_text()),
                        ("assembled_pathway", pathway),
                        ("previous_challenges", context.as_str()),
                    ],
                )
                .await
                .optional()?;

            let Some(raw) = raw else {
                tracing::warn!(
                    approach = %proposal.approach_name,
                    iteration,
                    "Requirement challenger produced no response"
                );
                iterations.push(ChallengeIteration {
                    iteration,
                    raw_challenges: None,
                    parsed: None,
                    validated: Vec::new(),
                });
                continue;
            };

            let parsed = parse_model_output(&raw);
            let challenges = challenges_from_parsed(Some(&parsed));
            let mut validated = Vec::with_capacity(challenges.len());
            for challenge in challenges {
                let checked = match challenge_physics_question(&challenge) {
                    Some(question) => {
                        let answer = self
                            .call(AgentRole::PhysicsOracle, &[("question", question.as_str())])
                            .await
                            .optional()?;
                        ValidatedChallenge::checked(challenge, question, answer)
                    }
                    None => ValidatedChallenge::without_question(challenge),
                };
                validated.push(checked);
            }
            self.log(format!("  {} challenges validated", validated.len()));

            let record = ChallengeIteration {
                iteration,
                raw_challenges: Some(raw),
                parsed: Some(parsed),
                validated,
            };
            context.push_str(&record.context_digest());
            iterations.push(record);
        }

        Ok(ChallengeRun {
            hypothesis_index: proposal.hypothesis_index,
            approach_name: proposal.approach_name.clone(),
            iterations,
        })
    }

    async fn synthesize(&self, state: &RunState, target: &TargetSelection) -> Result<Synthesis, Halt> {
        self.ensure_active()?;
        self.progress(8.0, "Stage 8: Synthesizing results...");

        let approaches = approaches_digest(state);
        let challenges = challenges_digest(state);
        let raw = self
            .call(
                AgentRole::Overseer,
                &[
                    ("original_task", target.task_description.as_str()),
                    ("all_approaches_summary", approaches.as_str()),
                    ("all_challenges_summary", challenges.as_str()),
                ],
            )
            .await
            .required(Stage::Synthesis)?;

        let synthesis = Synthesis::from_response(&raw);
        self.log(format!("Synthesized {} solutions", synthesis.solutions.len()));
        Ok(synthesis)
    }

    async fn write_up(&self, problem: &str, synthesis: &Synthesis) -> Result<FinalWriteUp, Halt> {
        self.ensure_active()?;
        self.progress(9.0, "Stage 9: Writing discovery thesis...");

        let top = synthesis.top_proposals_text(self.config.num_final_proposals);
        let raw = self
            .call(
                AgentRole::FinalEvaluator,
                &[("top_proposals", top.as_str()), ("original_problem", problem)],
            )
            .await
            .required(Stage::FinalWriteUp)?;

        self.log("Discovery thesis written".to_string());
        Ok(FinalWriteUp { raw_response: raw })
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Issues one completion call for `role`.
    ///
    /// Empty text and client errors become [`Reply::NoResponse`]. A stop
    /// request observed before or after the call wins over any text.
    async fn call(&self, role: AgentRole, vars: &[(&str, &str)]) -> Reply {
        if self.cancel.is_cancelled() {
            return Reply::Cancelled;
        }

        let stage = self.config.stages.get(role);
        let request = stage.request(vars);
        tracing::debug!(role = %role, model = %request.model, "Calling {}", stage.name);

        let observer = &self.observer;
        let stage_name = stage.name.as_str();
        let on_fragment = move |fragment: &str| observer.on_fragment(stage_name, fragment);
        let result = self
            .provider
            .complete_streaming(&request, &self.cancel, &on_fragment)
            .await;
        if self.cancel.is_cancelled() {
            return Reply::Cancelled;
        }

        match result {
            Ok(text) if !text.trim().is_empty() => Reply::Text(text),
            Ok(_) => {
                tracing::warn!(role = %role, "Completion returned empty text");
                Reply::NoResponse
            }
            Err(e) if e.is_cancelled() => Reply::Cancelled,
            Err(e) => {
                tracing::warn!(role = %role, error = %e, "Completion failed");
                self.log(format!("{} produced no response: {}", stage.name, e));
                Reply::NoResponse
            }
        }
    }

    fn ensure_active(&self) -> Result<(), Halt> {
        if self.cancel.is_cancelled() {
            Err(Halt::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn finish_stage(&self, state: &mut RunState, stage: Stage) {
        state.advance(stage);
        tracing::info!(run_id = %state.run_id, stage = %stage, "Stage complete");
        self.store.save_logged(state).await;
    }

    fn progress(&self, current: f64, message: &str) {
        self.observer.on_progress(current, PROGRESS_TOTAL, message);
    }

    fn log(&self, message: String) {
        self.observer.on_log(&message);
    }
}

fn panic_payload_to_string(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Chain-assembly input: every step with its physics answer.
fn steps_with_validations(steps: &[AtomicStep], validations: &[Validation]) -> String {
    let mut out = String::new();
    for (step, validation) in steps.iter().zip(validations) {
        let original = step
            .original_step
            .clone()
            .unwrap_or_else(|| step.record.to_string());
        out.push_str(&format!(
            "\n--- Step ---\nOriginal: {}\nPhysics Question: {}\nPhysics Answer: {}\nPhysically Possible: {}\n",
            original,
            validation.question,
            truncate_chars(validation.answer_text(), 500),
            validation.physically_possible
        ));
    }
    out
}

/// Overseer input describing every hypothesis and its validation results.
fn approaches_digest(state: &RunState) -> String {
    let mut out = String::new();
    for outcome in state.approach_results.iter().flatten() {
        let hypothesis = outcome.hypothesis();
        out.push_str(&format!(
            "\nAPPROACH {}: {}\nMechanism: {}\nDescription: {}\nChain Status: {}\n",
            hypothesis.index + 1,
            hypothesis.name,
            hypothesis.core_mechanism_text(),
            hypothesis.description_text(),
            outcome.status_label()
        ));
        for validation in outcome.validations() {
            out.push_str(&format!(
                "  Step: {} → {}\n",
                truncate_chars(&validation.question, 100),
                if validation.physically_possible { "✅" } else { "❌" }
            ));
        }
        if let Some(chain) = outcome.chain() {
            out.push_str(&format!("Assembled Pathway: {}\n", chain.pathway_text()));
        }
        if let Some(proposal) = state
            .engineering_for(hypothesis.index)
            .filter(|p| p.has_content())
        {
            out.push_str(&format!(
                "Engineering Proposal: {}\n",
                truncate_chars(proposal.proposal_text(), 500)
            ));
        }
    }
    out
}

/// Overseer input describing every challenge iteration.
fn challenges_digest(state: &RunState) -> String {
    let mut out = String::new();
    for run in state.challenges.iter().flatten() {
        out.push_str(&format!("\n{}:\n", run.approach_name));
        for iteration in &run.iterations {
            out.push_str(&format!("  Iteration {}:\n", iteration.iteration));
            for vc in &iteration.validated {
                out.push_str(&format!(
                    "    Q: {}\n    Physics: {}\n",
                    vc.challenge_question(),
                    truncate_chars(vc.validation_text(), 200)
                ));
            }
        }
    }
    out
}
