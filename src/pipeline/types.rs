//! Data model of a discovery run.
//!
//! Every stage result is a typed record built from a model response. Fields
//! the model may omit are optional, and each record keeps the raw response
//! together with its [`ParsedOutput`] so nothing the model said is lost when
//! the structure is not what was asked for.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::utils::json_extraction::{parse_model_output, value_text, ParsedOutput};
use crate::utils::truncate_chars;

/// Marker recorded for a challenge that carries no physics question.
pub const NO_PHYSICS_QUESTION: &str = "No physics question provided";

/// Total used for progress reporting; the last unit is the final save.
pub const PROGRESS_TOTAL: u32 = 10;

// ============================================================================
// Stages
// ============================================================================

/// The ordered stages of a discovery run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Narrow the problem down to one target.
    TargetSelection,
    /// Propose mechanistically distinct approaches.
    HypothesisGeneration,
    /// Break each approach into atomic steps.
    StepDecomposition,
    /// Check every atomic step from first principles.
    PhysicsValidation,
    /// Assemble validated steps into a pathway.
    ChainAssembly,
    /// Propose machinery for surviving pathways.
    EngineeringProposal,
    /// Iteratively challenge each proposal's requirements.
    RequirementChallenge,
    /// Rank and combine everything.
    Synthesis,
    /// Write the thesis for the top solutions.
    FinalWriteUp,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 9] = [
        Stage::TargetSelection,
        Stage::HypothesisGeneration,
        Stage::StepDecomposition,
        Stage::PhysicsValidation,
        Stage::ChainAssembly,
        Stage::EngineeringProposal,
        Stage::RequirementChallenge,
        Stage::Synthesis,
        Stage::FinalWriteUp,
    ];

    /// One-based position in the pipeline.
    pub fn number(&self) -> u32 {
        *self as u32 + 1
    }

    /// Returns the display name for this stage.
    pub fn display_name(&self) -> &'static str {
        match self {
            Stage::TargetSelection => "Target Selection",
            Stage::HypothesisGeneration => "Hypothesis Generation",
            Stage::StepDecomposition => "Step Decomposition",
            Stage::PhysicsValidation => "Physics Validation",
            Stage::ChainAssembly => "Chain Assembly",
            Stage::EngineeringProposal => "Engineering Proposals",
            Stage::RequirementChallenge => "Requirement Challenges",
            Stage::Synthesis => "Synthesis",
            Stage::FinalWriteUp => "Final Write-up",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Stage {}: {}", self.number(), self.display_name())
    }
}

/// Lifecycle of a run as seen by the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// No run has been started.
    Idle,
    /// A run is executing.
    Running,
    /// All stages finished.
    Completed,
    /// A stop request ended the run early.
    Stopped,
    /// A stage produced no response or an internal fault occurred.
    Failed,
}

impl RunStatus {
    /// Returns true for the three end states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Stopped | RunStatus::Failed
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Idle => write!(f, "idle"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Stopped => write!(f, "stopped"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

// ============================================================================
// Field helpers
// ============================================================================

fn object_text(obj: Option<&Map<String, Value>>, key: &str) -> Option<String> {
    obj.and_then(|o| o.get(key)).and_then(value_text)
}

/// Renders a JSON array (or a lone value) as a list of strings.
fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(value_text).collect(),
        Some(other) => value_text(other).into_iter().collect(),
        None => Vec::new(),
    }
}

/// Probes an object for the first array-valued container field.
fn probe_list(value: &Value, containers: &[&str]) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items.clone()),
        Value::Object(obj) => {
            for key in containers {
                if let Some(Value::Array(items)) = obj.get(*key) {
                    return Some(items.clone());
                }
            }
            Some(vec![value.clone()])
        }
        _ => None,
    }
}

/// Normalises a response into a list of records.
///
/// Arrays are used as-is, objects are probed for `containers` and otherwise
/// wrapped, and anything unstructured becomes `[{"raw": text}]`.
pub fn records_from_response(parsed: &ParsedOutput, raw: &str, containers: &[&str]) -> Vec<Value> {
    parsed
        .value()
        .and_then(|v| probe_list(v, containers))
        .unwrap_or_else(|| vec![serde_json::json!({ "raw": raw })])
}

fn compact_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
}

fn pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

// ============================================================================
// Stage 1: target selection
// ============================================================================

/// The concrete target chosen for a problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSelection {
    pub raw_response: String,
    pub parsed: ParsedOutput,
    pub selected_target: Option<String>,
    pub target_properties: Option<String>,
    /// Falls back to the raw response when the field is absent.
    pub task_description: String,
    pub why_selected: Option<String>,
    pub known_constraints: Option<String>,
}

impl TargetSelection {
    pub fn from_response(raw: &str) -> Self {
        let parsed = parse_model_output(raw);
        let obj = parsed.as_object();

        Self {
            selected_target: object_text(obj, "selected_target"),
            target_properties: object_text(obj, "target_properties"),
            task_description: object_text(obj, "task_description").unwrap_or_else(|| raw.to_string()),
            why_selected: object_text(obj, "why_selected"),
            known_constraints: object_text(obj, "known_constraints"),
            raw_response: raw.to_string(),
            parsed,
        }
    }

    pub fn target_label(&self) -> &str {
        self.selected_target.as_deref().unwrap_or("Unknown")
    }

    pub fn target_properties_text(&self) -> &str {
        self.target_properties.as_deref().unwrap_or("Not specified")
    }

    pub fn known_constraints_text(&self) -> &str {
        self.known_constraints.as_deref().unwrap_or("None specified")
    }
}

// ============================================================================
// Stage 2: hypotheses
// ============================================================================

/// One proposed approach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    /// Zero-based position in generation order.
    pub index: usize,
    /// Display name: `name`, then `approach_id`, then `Approach {n}`.
    pub name: String,
    pub core_mechanism: Option<String>,
    pub description: Option<String>,
    pub conditions: Value,
    pub physics_basis: Option<String>,
    /// The record as the model emitted it.
    pub source: Value,
}

impl Hypothesis {
    pub fn from_record(index: usize, record: Value) -> Self {
        let obj = record.as_object();
        let name = object_text(obj, "name")
            .or_else(|| object_text(obj, "approach_id"))
            .unwrap_or_else(|| format!("Approach {}", index + 1));

        Self {
            index,
            name,
            core_mechanism: object_text(obj, "core_mechanism"),
            description: object_text(obj, "description"),
            conditions: obj
                .and_then(|o| o.get("conditions"))
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new())),
            physics_basis: object_text(obj, "physics_basis"),
            source: record,
        }
    }

    pub fn core_mechanism_text(&self) -> &str {
        self.core_mechanism.as_deref().unwrap_or("Not specified")
    }

    pub fn physics_basis_text(&self) -> &str {
        self.physics_basis.as_deref().unwrap_or("Not specified")
    }

    /// The description, or the whole record when there is none.
    pub fn description_text(&self) -> String {
        self.description
            .clone()
            .unwrap_or_else(|| compact_json(&self.source))
    }

    pub fn conditions_text(&self) -> String {
        pretty_json(&self.conditions)
    }
}

/// The hypothesis list produced by stage 2.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypothesisSet {
    pub raw_response: String,
    pub items: Vec<Hypothesis>,
}

impl HypothesisSet {
    pub fn from_response(raw: &str) -> Self {
        let parsed = parse_model_output(raw);
        let items = records_from_response(&parsed, raw, &["approaches", "hypotheses"])
            .into_iter()
            .enumerate()
            .map(|(i, record)| Hypothesis::from_record(i, record))
            .collect();

        Self {
            raw_response: raw.to_string(),
            items,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// ============================================================================
// Stages 3-5: per-hypothesis records
// ============================================================================

/// One atomic physical step with its context-free question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicStep {
    pub step_number: Option<u64>,
    pub original_step: Option<String>,
    pub physical_process: Option<String>,
    /// `standalone_question`, then `physics_question`, then `raw`, then the
    /// serialised record.
    pub question: String,
    pub expected_output_type: Option<String>,
    pub dependencies: Option<Value>,
    pub record: Value,
}

impl AtomicStep {
    pub fn from_record(record: Value) -> Self {
        let obj = record.as_object();
        let question = object_text(obj, "standalone_question")
            .or_else(|| object_text(obj, "physics_question"))
            .or_else(|| object_text(obj, "raw"))
            .unwrap_or_else(|| compact_json(&record));

        Self {
            step_number: obj.and_then(|o| o.get("step_number")).and_then(Value::as_u64),
            original_step: object_text(obj, "original_step"),
            physical_process: object_text(obj, "physical_process"),
            question,
            expected_output_type: object_text(obj, "expected_output_type"),
            dependencies: obj.and_then(|o| o.get("dependencies")).cloned(),
            record,
        }
    }

    /// Decodes a decomposition response into steps.
    pub fn list_from_response(raw: &str) -> Vec<AtomicStep> {
        let parsed = parse_model_output(raw);
        records_from_response(&parsed, raw, &["steps"])
            .into_iter()
            .map(AtomicStep::from_record)
            .collect()
    }
}

/// The oracle's verdict on one atomic step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    pub question: String,
    /// `None` when the oracle produced no response.
    pub raw_answer: Option<String>,
    pub parsed_answer: Option<ParsedOutput>,
    pub physically_possible: bool,
}

impl Validation {
    /// Builds a validation; `assume_feasible` applies when the answer carries
    /// no usable `physically_possible` flag.
    pub fn new(question: String, raw_answer: Option<String>, assume_feasible: bool) -> Self {
        let parsed_answer = raw_answer.as_deref().map(parse_model_output);
        let physically_possible = parsed_answer
            .as_ref()
            .and_then(|p| p.get("physically_possible"))
            .and_then(feasibility_flag)
            .unwrap_or(assume_feasible);

        Self {
            question,
            raw_answer,
            parsed_answer,
            physically_possible,
        }
    }

    pub fn answer_text(&self) -> &str {
        self.raw_answer.as_deref().unwrap_or("No response")
    }
}

/// Reads a feasibility flag that may be a bool or a yes/no string.
fn feasibility_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "possible" => Some(true),
            "false" | "no" | "impossible" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Classification of an assembled chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChainStatus {
    Valid,
    Fixable,
    Broken,
    Unknown,
}

impl ChainStatus {
    /// Case-insensitive; anything unrecognised is `Unknown`.
    pub fn parse(text: &str) -> Self {
        match text.trim().to_uppercase().as_str() {
            "VALID" => ChainStatus::Valid,
            "FIXABLE" => ChainStatus::Fixable,
            "BROKEN" => ChainStatus::Broken,
            _ => ChainStatus::Unknown,
        }
    }

    /// Whether a chain with this status goes on to the engineering stage.
    pub fn proceeds_to_engineering(&self) -> bool {
        !matches!(self, ChainStatus::Broken)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChainStatus::Valid => "VALID",
            ChainStatus::Fixable => "FIXABLE",
            ChainStatus::Broken => "BROKEN",
            ChainStatus::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consistency check across one hypothesis's validated steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainAssembly {
    pub status: ChainStatus,
    pub raw_response: Option<String>,
    pub parsed: Option<ParsedOutput>,
    pub assembled_pathway: Option<String>,
    pub step_connections: Vec<Value>,
    pub gaps: Vec<String>,
    pub contradictions: Vec<String>,
    pub overall_conditions: Value,
}

impl ChainAssembly {
    /// Builds the record; a missing response yields status `UNKNOWN`.
    pub fn from_response(raw: Option<String>) -> Self {
        let parsed = raw.as_deref().map(parse_model_output);
        let obj = parsed.as_ref().and_then(ParsedOutput::as_object);

        let status = object_text(obj, "chain_status")
            .map(|s| ChainStatus::parse(&s))
            .unwrap_or(ChainStatus::Unknown);

        Self {
            status,
            assembled_pathway: object_text(obj, "assembled_pathway"),
            step_connections: obj
                .and_then(|o| o.get("step_connections"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            gaps: string_list(obj.and_then(|o| o.get("gaps"))),
            contradictions: string_list(obj.and_then(|o| o.get("contradictions"))),
            overall_conditions: obj
                .and_then(|o| o.get("overall_conditions"))
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new())),
            raw_response: raw,
            parsed,
        }
    }

    /// The pathway, or whatever the assembler said instead.
    pub fn pathway_text(&self) -> String {
        if let Some(pathway) = &self.assembled_pathway {
            return pathway.clone();
        }
        match &self.parsed {
            Some(ParsedOutput::Unparsed { raw_text }) => raw_text.clone(),
            Some(parsed) => compact_json(&parsed.to_value()),
            None => "No assembled pathway available".to_string(),
        }
    }

    pub fn conditions_text(&self) -> String {
        pretty_json(&self.overall_conditions)
    }
}

/// Result of the per-hypothesis sub-pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HypothesisOutcome {
    /// The decomposition call produced nothing; no later stage ran.
    DecomposerFailed { hypothesis: Hypothesis },
    /// Steps were validated and assembled into a chain.
    ChainAssembled {
        hypothesis: Hypothesis,
        steps: Vec<AtomicStep>,
        validations: Vec<Validation>,
        chain: ChainAssembly,
    },
}

impl HypothesisOutcome {
    pub fn hypothesis(&self) -> &Hypothesis {
        match self {
            HypothesisOutcome::DecomposerFailed { hypothesis }
            | HypothesisOutcome::ChainAssembled { hypothesis, .. } => hypothesis,
        }
    }

    pub fn chain(&self) -> Option<&ChainAssembly> {
        match self {
            HypothesisOutcome::ChainAssembled { chain, .. } => Some(chain),
            HypothesisOutcome::DecomposerFailed { .. } => None,
        }
    }

    pub fn validations(&self) -> &[Validation] {
        match self {
            HypothesisOutcome::ChainAssembled { validations, .. } => validations,
            HypothesisOutcome::DecomposerFailed { .. } => &[],
        }
    }

    /// Status label: the chain status, or `decomposer_failed`.
    pub fn status_label(&self) -> &'static str {
        match self.chain() {
            Some(chain) => chain.status.as_str(),
            None => "decomposer_failed",
        }
    }

    /// The chain, when this hypothesis proceeds to engineering.
    pub fn engineering_candidate(&self) -> Option<&ChainAssembly> {
        self.chain().filter(|c| c.status.proceeds_to_engineering())
    }

    /// `(possible, total)` over the validated steps.
    pub fn validated_ratio(&self) -> (usize, usize) {
        let validations = self.validations();
        let possible = validations.iter().filter(|v| v.physically_possible).count();
        (possible, validations.len())
    }
}

// ============================================================================
// Stages 6-7: engineering and challenges
// ============================================================================

/// Engineering proposal for one surviving hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineeringProposal {
    pub hypothesis_index: usize,
    pub approach_name: String,
    /// `None` when the proposer produced no response.
    pub raw_proposal: Option<String>,
    pub parsed: Option<ParsedOutput>,
}

impl EngineeringProposal {
    pub fn new(hypothesis: &Hypothesis, raw_proposal: Option<String>) -> Self {
        Self {
            hypothesis_index: hypothesis.index,
            approach_name: hypothesis.name.clone(),
            parsed: raw_proposal.as_deref().map(parse_model_output),
            raw_proposal,
        }
    }

    pub fn has_content(&self) -> bool {
        self.raw_proposal
            .as_deref()
            .is_some_and(|text| !text.trim().is_empty())
    }

    pub fn proposal_text(&self) -> &str {
        self.raw_proposal.as_deref().unwrap_or("No proposal")
    }

    /// Number of entries in `engineering_proposals`, if structured.
    pub fn proposal_count(&self) -> usize {
        self.parsed
            .as_ref()
            .and_then(|p| p.get("engineering_proposals"))
            .and_then(Value::as_array)
            .map_or(0, Vec::len)
    }
}

/// One challenge and its physics check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedChallenge {
    pub challenge: Value,
    pub physics_question: Option<String>,
    /// The oracle's answer, [`NO_PHYSICS_QUESTION`] when there was nothing to
    /// check, or `None` when the oracle produced no response.
    pub physics_validation: Option<String>,
    pub physics_parsed: Option<ParsedOutput>,
}

impl ValidatedChallenge {
    pub fn without_question(challenge: Value) -> Self {
        Self {
            challenge,
            physics_question: None,
            physics_validation: Some(NO_PHYSICS_QUESTION.to_string()),
            physics_parsed: None,
        }
    }

    pub fn checked(challenge: Value, question: String, answer: Option<String>) -> Self {
        Self {
            challenge,
            physics_question: Some(question),
            physics_parsed: answer.as_deref().map(parse_model_output),
            physics_validation: answer,
        }
    }

    pub fn challenge_question(&self) -> String {
        self.challenge
            .get("challenge_question")
            .and_then(value_text)
            .unwrap_or_else(|| "?".to_string())
    }

    pub fn validation_text(&self) -> &str {
        self.physics_validation.as_deref().unwrap_or("No response")
    }
}

/// Reads `physics_question_to_validate` from a challenge record.
pub fn challenge_physics_question(challenge: &Value) -> Option<String> {
    challenge
        .get("physics_question_to_validate")
        .and_then(value_text)
        .filter(|q| !q.trim().is_empty())
}

/// Decodes the challenge list of a challenger response.
pub fn challenges_from_parsed(parsed: Option<&ParsedOutput>) -> Vec<Value> {
    let Some(value) = parsed.and_then(ParsedOutput::value) else {
        return Vec::new();
    };
    match value {
        Value::Object(obj) => obj
            .get("challenges")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        Value::Array(items) => items.clone(),
        _ => Vec::new(),
    }
}

/// One round of the challenge loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeIteration {
    /// One-based.
    pub iteration: usize,
    pub raw_challenges: Option<String>,
    pub parsed: Option<ParsedOutput>,
    pub validated: Vec<ValidatedChallenge>,
}

impl ChallengeIteration {
    /// Context appended for the next iteration: the raw challenges and the
    /// first 300 characters of every validation.
    pub fn context_digest(&self) -> String {
        let mut out = format!(
            "\n\nIteration {} challenges:\n{}\n",
            self.iteration,
            self.raw_challenges.as_deref().unwrap_or("None")
        );
        out.push_str("Physics validations:\n");
        for vc in &self.validated {
            out.push_str(&format!(
                "\nChallenge: {}\nPhysics validation: {}\n",
                vc.challenge_question(),
                truncate_chars(vc.validation_text(), 300)
            ));
        }
        out
    }
}

/// All challenge iterations for one engineering proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeRun {
    pub hypothesis_index: usize,
    pub approach_name: String,
    pub iterations: Vec<ChallengeIteration>,
}

// ============================================================================
// Stages 8-9: synthesis and write-up
// ============================================================================

/// One ranked solution from the overseer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesizedSolution {
    pub rank: Option<String>,
    pub name: Option<String>,
    pub combined_from: Vec<String>,
    pub complete_pathway: Option<String>,
    pub physics_confidence: Option<String>,
    pub engineering_feasibility: Option<String>,
    pub key_innovation: Option<String>,
    pub remaining_unknowns: Vec<String>,
    pub estimated_difficulty: Option<String>,
}

impl SynthesizedSolution {
    pub fn from_record(record: &Value) -> Self {
        let obj = record.as_object();
        Self {
            rank: object_text(obj, "rank"),
            name: object_text(obj, "name"),
            combined_from: string_list(obj.and_then(|o| o.get("combined_from"))),
            complete_pathway: object_text(obj, "complete_pathway"),
            physics_confidence: object_text(obj, "physics_confidence"),
            engineering_feasibility: object_text(obj, "engineering_feasibility"),
            key_innovation: object_text(obj, "key_innovation"),
            remaining_unknowns: string_list(obj.and_then(|o| o.get("remaining_unknowns"))),
            estimated_difficulty: object_text(obj, "estimated_difficulty"),
        }
    }

    pub fn rank_text(&self) -> &str {
        self.rank.as_deref().unwrap_or("?")
    }

    pub fn name_text(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }
}

/// The overseer's synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synthesis {
    pub raw_response: String,
    pub parsed: ParsedOutput,
    pub solutions: Vec<SynthesizedSolution>,
    pub cross_cutting_insights: Option<String>,
    pub unexpected_findings: Option<String>,
}

impl Synthesis {
    pub fn from_response(raw: &str) -> Self {
        let parsed = parse_model_output(raw);
        let obj = parsed.as_object();
        let solutions = obj
            .and_then(|o| o.get("synthesis"))
            .and_then(Value::as_array)
            .map(|items| items.iter().map(SynthesizedSolution::from_record).collect())
            .unwrap_or_default();

        Self {
            solutions,
            cross_cutting_insights: object_text(obj, "cross_cutting_insights"),
            unexpected_findings: object_text(obj, "unexpected_findings"),
            raw_response: raw.to_string(),
            parsed,
        }
    }

    /// Digest of the top `limit` solutions for the final write-up, or the raw
    /// synthesis text when no ranked list was recovered.
    pub fn top_proposals_text(&self, limit: usize) -> String {
        if self.solutions.is_empty() {
            return self.raw_response.clone();
        }

        let mut out = String::new();
        for s in self.solutions.iter().take(limit) {
            out.push_str(&format!("\n{}\n", "-".repeat(40)));
            out.push_str(&format!("Rank: {}\n", s.rank_text()));
            out.push_str(&format!("Name: {}\n", s.name_text()));
            out.push_str(&format!(
                "Pathway: {}\n",
                s.complete_pathway.as_deref().unwrap_or("Unknown")
            ));
            out.push_str(&format!(
                "Physics Confidence: {}\n",
                s.physics_confidence.as_deref().unwrap_or("?")
            ));
            out.push_str(&format!(
                "Engineering: {}\n",
                s.engineering_feasibility.as_deref().unwrap_or("?")
            ));
            out.push_str(&format!(
                "Innovation: {}\n",
                s.key_innovation.as_deref().unwrap_or("?")
            ));
        }
        out
    }
}

/// The terminal write-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalWriteUp {
    pub raw_response: String,
}

// ============================================================================
// Run state
// ============================================================================

/// Everything a run has accumulated.
///
/// Owned by the orchestrator task. A stage's result is stored only once the
/// stage has finished, so every snapshot is aligned to a stage boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub problem: String,
    pub started_at: DateTime<Utc>,
    pub target: Option<TargetSelection>,
    pub hypotheses: Option<HypothesisSet>,
    pub approach_results: Option<Vec<HypothesisOutcome>>,
    pub engineering: Option<Vec<EngineeringProposal>>,
    pub challenges: Option<Vec<ChallengeRun>>,
    pub synthesis: Option<Synthesis>,
    pub final_writeup: Option<FinalWriteUp>,
    pub last_completed: Option<Stage>,
}

/// Millisecond stamp of the most recently issued run id.
static LAST_RUN_MILLIS: AtomicI64 = AtomicI64::new(0);

/// Issues a `YYYYMMDD_HHMMSS_mmm` run id that is unique within the process.
///
/// Ids issued in the same millisecond are pushed forward one millisecond at a
/// time, so run files never collide and ids still sort by start time.
fn next_run_id() -> String {
    let now = Local::now();
    let now_millis = now.timestamp_millis();
    let issued = match LAST_RUN_MILLIS.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
        Some(now_millis.max(last + 1))
    }) {
        Ok(last) | Err(last) => now_millis.max(last + 1),
    };
    let stamp = Local.timestamp_millis_opt(issued).single().unwrap_or(now);
    stamp.format("%Y%m%d_%H%M%S_%3f").to_string()
}

impl RunState {
    /// Fresh state with a timestamp-derived run id.
    pub fn new(problem: impl Into<String>) -> Self {
        Self::with_run_id(next_run_id(), problem)
    }

    pub fn with_run_id(run_id: impl Into<String>, problem: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            problem: problem.into(),
            started_at: Utc::now(),
            target: None,
            hypotheses: None,
            approach_results: None,
            engineering: None,
            challenges: None,
            synthesis: None,
            final_writeup: None,
            last_completed: None,
        }
    }

    /// Moves the completion marker forward; never rewinds it.
    pub fn advance(&mut self, stage: Stage) {
        if self.last_completed.map_or(true, |done| stage > done) {
            self.last_completed = Some(stage);
        }
    }

    /// Label of the last completed stage, as written to checkpoints.
    pub fn last_completed_label(&self) -> &'static str {
        self.last_completed
            .map(|s| s.display_name())
            .unwrap_or("Not started")
    }

    /// Outcomes of hypotheses whose chain proceeds to engineering.
    pub fn engineering_candidates(&self) -> impl Iterator<Item = (&Hypothesis, &ChainAssembly)> {
        self.approach_results
            .iter()
            .flatten()
            .filter_map(|o| o.engineering_candidate().map(|c| (o.hypothesis(), c)))
    }

    /// Engineering proposal of a hypothesis, if one was made.
    pub fn engineering_for(&self, hypothesis_index: usize) -> Option<&EngineeringProposal> {
        self.engineering
            .iter()
            .flatten()
            .find(|p| p.hypothesis_index == hypothesis_index)
    }

    /// Challenge run of a hypothesis, if one was made.
    pub fn challenges_for(&self, hypothesis_index: usize) -> Option<&ChallengeRun> {
        self.challenges
            .iter()
            .flatten()
            .find(|c| c.hypothesis_index == hypothesis_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stage_order_and_labels() {
        assert!(Stage::TargetSelection < Stage::FinalWriteUp);
        assert_eq!(Stage::ChainAssembly.number(), 5);
        assert_eq!(Stage::FinalWriteUp.number(), 9);
        assert_eq!(Stage::Synthesis.to_string(), "Stage 8: Synthesis");
        for pair in Stage::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_target_selection_fields() {
        let target =
            TargetSelection::from_response(r#"{"selected_target":"A","task_description":"B"}"#);
        assert_eq!(target.target_label(), "A");
        assert_eq!(target.task_description, "B");
        assert_eq!(target.target_properties_text(), "Not specified");
        assert_eq!(target.known_constraints_text(), "None specified");
    }

    #[test]
    fn test_target_selection_falls_back_to_raw() {
        let raw = "Let's look at room-temperature superconductors.";
        let target = TargetSelection::from_response(raw);
        assert_eq!(target.task_description, raw);
        assert_eq!(target.target_label(), "Unknown");
    }

    #[test]
    fn test_hypotheses_from_array() {
        let set = HypothesisSet::from_response(
            r#"[{"name":"Shock synthesis","core_mechanism":"compression"},{"approach_id":7}]"#,
        );
        assert_eq!(set.len(), 2);
        assert_eq!(set.items[0].name, "Shock synthesis");
        assert_eq!(set.items[0].core_mechanism_text(), "compression");
        assert_eq!(set.items[1].name, "7");
        assert_eq!(set.items[1].index, 1);
    }

    #[test]
    fn test_hypotheses_container_probing() {
        let set = HypothesisSet::from_response(r#"{"approaches":[{"name":"a"},{"name":"b"}]}"#);
        assert_eq!(set.len(), 2);

        let set = HypothesisSet::from_response(r#"{"hypotheses":[{"name":"c"}]}"#);
        assert_eq!(set.items[0].name, "c");

        let set = HypothesisSet::from_response(r#"{"name":"single"}"#);
        assert_eq!(set.len(), 1);
        assert_eq!(set.items[0].name, "single");
    }

    #[test]
    fn test_hypotheses_unstructured_fallback() {
        let raw = "Approach one: squeeze it hard.";
        let set = HypothesisSet::from_response(raw);
        assert_eq!(set.len(), 1);
        assert_eq!(set.items[0].name, "Approach 1");
        assert_eq!(set.items[0].source, json!({"raw": raw}));
    }

    #[test]
    fn test_step_question_fallbacks() {
        let steps = AtomicStep::list_from_response(
            r#"{"steps":[
                {"step_number":1,"standalone_question":"Q1"},
                {"physics_question":"Q2"},
                {"raw":"Q3"},
                {"original_step":"heat"}
            ]}"#,
        );
        assert_eq!(steps.len(), 4);
        assert_eq!(steps[0].question, "Q1");
        assert_eq!(steps[0].step_number, Some(1));
        assert_eq!(steps[1].question, "Q2");
        assert_eq!(steps[2].question, "Q3");
        assert_eq!(steps[3].question, r#"{"original_step":"heat"}"#);
    }

    #[test]
    fn test_validation_feasibility() {
        let v = Validation::new(
            "q".into(),
            Some(r#"{"physically_possible": false}"#.into()),
            true,
        );
        assert!(!v.physically_possible);

        let v = Validation::new("q".into(), Some("It depends on the phase diagram.".into()), true);
        assert!(v.physically_possible);

        let v = Validation::new("q".into(), None, true);
        assert!(v.physically_possible);
        assert_eq!(v.answer_text(), "No response");

        let v = Validation::new("q".into(), Some("prose only".into()), false);
        assert!(!v.physically_possible);

        let v = Validation::new(
            "q".into(),
            Some(r#"{"physically_possible": "No"}"#.into()),
            true,
        );
        assert!(!v.physically_possible);
    }

    #[test]
    fn test_chain_status_parse() {
        assert_eq!(ChainStatus::parse("VALID"), ChainStatus::Valid);
        assert_eq!(ChainStatus::parse(" fixable "), ChainStatus::Fixable);
        assert_eq!(ChainStatus::parse("Broken"), ChainStatus::Broken);
        assert_eq!(ChainStatus::parse("VALID/FIXABLE"), ChainStatus::Unknown);
        assert!(ChainStatus::Unknown.proceeds_to_engineering());
        assert!(!ChainStatus::Broken.proceeds_to_engineering());
    }

    #[test]
    fn test_chain_assembly_from_response() {
        let chain = ChainAssembly::from_response(Some(
            r#"{"chain_status":"FIXABLE","assembled_pathway":"heat then quench",
                "gaps":["cooling"],"contradictions":[],
                "overall_conditions":{"temperature_range":"300-5000 K"}}"#
                .to_string(),
        ));
        assert_eq!(chain.status, ChainStatus::Fixable);
        assert_eq!(chain.pathway_text(), "heat then quench");
        assert_eq!(chain.gaps, vec!["cooling".to_string()]);
        assert!(chain.conditions_text().contains("300-5000 K"));

        let missing = ChainAssembly::from_response(None);
        assert_eq!(missing.status, ChainStatus::Unknown);
        assert_eq!(missing.pathway_text(), "No assembled pathway available");

        let prose = ChainAssembly::from_response(Some("looks fine".to_string()));
        assert_eq!(prose.status, ChainStatus::Unknown);
        assert_eq!(prose.pathway_text(), "looks fine");
    }

    #[test]
    fn test_outcome_serializes_status_tag() {
        let hypothesis = Hypothesis::from_record(0, json!({"name": "a"}));
        let outcome = HypothesisOutcome::DecomposerFailed { hypothesis };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["status"], "decomposer_failed");
        assert_eq!(outcome.status_label(), "decomposer_failed");
        assert!(outcome.engineering_candidate().is_none());

        let back: HypothesisOutcome = serde_json::from_value(value).unwrap();
        assert_eq!(back, outcome);
    }

    #[test]
    fn test_challenges_from_parsed() {
        let parsed = parse_model_output(
            r#"{"challenges":[{"challenge_question":"Smaller?","physics_question_to_validate":"Q"},{"challenge_question":"Cheaper?"}]}"#,
        );
        let challenges = challenges_from_parsed(Some(&parsed));
        assert_eq!(challenges.len(), 2);
        assert_eq!(challenge_physics_question(&challenges[0]).as_deref(), Some("Q"));
        assert_eq!(challenge_physics_question(&challenges[1]), None);

        assert!(challenges_from_parsed(None).is_empty());
        assert!(challenges_from_parsed(Some(&parse_model_output("no list"))).is_empty());
    }

    #[test]
    fn test_context_digest_truncates_validations() {
        let iteration = ChallengeIteration {
            iteration: 1,
            raw_challenges: Some("C".to_string()),
            parsed: None,
            validated: vec![
                ValidatedChallenge::checked(
                    json!({"challenge_question": "Smaller?"}),
                    "Q".to_string(),
                    Some("x".repeat(400)),
                ),
                ValidatedChallenge::without_question(json!({})),
            ],
        };
        let digest = iteration.context_digest();
        assert!(digest.contains("Iteration 1 challenges:\nC"));
        assert!(digest.contains(&"x".repeat(300)));
        assert!(!digest.contains(&"x".repeat(301)));
        assert!(digest.contains("Challenge: ?"));
        assert!(digest.contains(NO_PHYSICS_QUESTION));
    }

    #[test]
    fn test_synthesis_top_proposals() {
        let synthesis = Synthesis::from_response(
            r#"{"synthesis":[{"rank":1,"name":"Best"},{"rank":2,"name":"Second"}]}"#,
        );
        assert_eq!(synthesis.solutions.len(), 2);
        assert_eq!(synthesis.solutions[0].rank_text(), "1");
        let text = synthesis.top_proposals_text(1);
        assert!(text.contains("Name: Best"));
        assert!(!text.contains("Second"));

        let prose = Synthesis::from_response("Combine A and B.");
        assert_eq!(prose.top_proposals_text(3), "Combine A and B.");
    }

    #[test]
    fn test_run_state_advance_is_monotonic() {
        let mut state = RunState::with_run_id("r1", "problem");
        assert_eq!(state.last_completed_label(), "Not started");

        state.advance(Stage::HypothesisGeneration);
        state.advance(Stage::TargetSelection);
        assert_eq!(state.last_completed, Some(Stage::HypothesisGeneration));

        state.advance(Stage::ChainAssembly);
        assert_eq!(state.last_completed_label(), "Chain Assembly");
    }

    #[test]
    fn test_run_id_format() {
        let state = RunState::new("p");
        assert_eq!(state.run_id.len(), 19);
        assert_eq!(state.run_id.as_bytes()[8], b'_');
        assert_eq!(state.run_id.as_bytes()[15], b'_');
    }

    #[test]
    fn test_run_ids_started_together_are_distinct() {
        let ids: Vec<String> = (0..50).map(|_| RunState::new("p").run_id).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
    }
}
