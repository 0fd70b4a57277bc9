//! Terminal artifacts of a run.
//!
//! Written once when a run ends, whatever the outcome:
//!
//! - `discovery_{run_id}.json`: the full run state
//! - `summary_{run_id}.md`: a human-readable summary
//! - `discoveries/thesis_{run_id}.md`: the final write-up, only when the last
//!   stage produced one
//!
//! Each file is written independently; one failing does not prevent the
//! others.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::Utc;

use super::checkpoint::write_atomic;
use super::types::RunState;
use crate::error::CheckpointError;
use crate::utils::truncate_chars;

/// Paths of the artifacts that were written successfully.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportPaths {
    pub discovery: Option<PathBuf>,
    pub summary: Option<PathBuf>,
    pub thesis: Option<PathBuf>,
}

/// Writes every terminal artifact for `state` under `results_dir`.
pub async fn write_reports(results_dir: &Path, state: &RunState) -> ReportPaths {
    let mut paths = ReportPaths::default();
    let run_id = state.run_id.clone();

    let discovery_path = results_dir.join(format!("discovery_{}.json", run_id));
    paths.discovery = match serde_json::to_vec_pretty(state) {
        Ok(bytes) => write_logged(discovery_path, bytes, &run_id).await,
        Err(e) => {
            tracing::warn!(run_id = %run_id, error = %e, "Failed to serialise run state");
            None
        }
    };

    let summary_path = results_dir.join(format!("summary_{}.md", run_id));
    paths.summary = write_logged(summary_path, render_summary(state).into_bytes(), &run_id).await;

    if let Some(thesis) = render_thesis(state) {
        let thesis_path = results_dir
            .join("discoveries")
            .join(format!("thesis_{}.md", run_id));
        paths.thesis = write_logged(thesis_path, thesis.into_bytes(), &run_id).await;
    }

    paths
}

async fn write_logged(path: PathBuf, bytes: Vec<u8>, run_id: &str) -> Option<PathBuf> {
    let target = path.clone();
    let result = tokio::task::spawn_blocking(move || write_atomic(&target, &bytes))
        .await
        .map_err(|e| CheckpointError::Join(e.to_string()))
        .and_then(|r| r);

    match result {
        Ok(()) => {
            tracing::info!(run_id, path = %path.display(), "Wrote artifact");
            Some(path)
        }
        Err(e) => {
            tracing::warn!(run_id, path = %path.display(), error = %e, "Failed to write artifact");
            None
        }
    }
}

/// Renders the thesis document, if the final stage produced text.
pub fn render_thesis(state: &RunState) -> Option<String> {
    let writeup = state.final_writeup.as_ref()?;
    if writeup.raw_response.trim().is_empty() {
        return None;
    }

    Some(format!(
        "# Discovery Thesis\n\nGenerated: {}\n\n## Frontier Problem\n{}\n\n## Discovery\n{}\n",
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
        state.problem,
        writeup.raw_response
    ))
}

fn one_line(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let cut = truncate_chars(&collapsed, max_chars);
    if cut.len() < collapsed.len() {
        format!("{}...", cut)
    } else {
        collapsed
    }
}

/// Renders the markdown run summary.
pub fn render_summary(state: &RunState) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# Discovery Pipeline Results\n");
    let _ = writeln!(out, "**Timestamp**: {}", state.run_id);
    let _ = writeln!(out, "**Last Completed Stage**: {}\n", state.last_completed_label());
    let _ = writeln!(out, "## Frontier Problem\n{}\n", state.problem);

    if let Some(target) = &state.target {
        let _ = writeln!(out, "## Selected Target\n**{}**\n", target.target_label());
        let _ = writeln!(out, "{}\n", target.task_description);
    }

    if let Some(hypotheses) = &state.hypotheses {
        let _ = writeln!(out, "## Hypotheses Generated: {}\n", hypotheses.len());
        for h in &hypotheses.items {
            let _ = writeln!(out, "### {}. {}", h.index + 1, h.name);
            let _ = writeln!(out, "- **Mechanism**: {}", h.core_mechanism_text());
            let _ = writeln!(out, "- **Physics Basis**: {}\n", h.physics_basis_text());
        }
    }

    if let Some(results) = &state.approach_results {
        let _ = writeln!(out, "## Approach Validation Results\n");
        for outcome in results {
            let hypothesis = outcome.hypothesis();
            let (possible, total) = outcome.validated_ratio();
            let _ = writeln!(out, "### {}", hypothesis.name);
            let _ = writeln!(out, "- **Chain Status**: {}", outcome.status_label());
            let _ = writeln!(out, "- **Physics Steps Validated**: {}/{}", possible, total);

            if let Some(chain) = outcome.chain() {
                if !chain.gaps.is_empty() {
                    let _ = writeln!(out, "- **Gaps**: {}", chain.gaps.join("; "));
                }
                if !chain.contradictions.is_empty() {
                    let _ = writeln!(out, "- **Contradictions**: {}", chain.contradictions.join("; "));
                }
            }

            if let Some(proposal) = state
                .engineering_for(hypothesis.index)
                .filter(|p| p.has_content())
            {
                let _ = writeln!(
                    out,
                    "- **Engineering Proposal**: {}",
                    one_line(proposal.proposal_text(), 300)
                );
            }
            if let Some(run) = state.challenges_for(hypothesis.index) {
                let challenges: usize = run.iterations.iter().map(|i| i.validated.len()).sum();
                let _ = writeln!(
                    out,
                    "- **Requirement Challenges**: {} iterations, {} challenges",
                    run.iterations.len(),
                    challenges
                );
            }
            out.push('\n');
        }
    }

    if let Some(synthesis) = &state.synthesis {
        let _ = writeln!(out, "## Top Synthesized Solutions\n");
        if synthesis.solutions.is_empty() {
            let _ = writeln!(out, "{}\n", synthesis.raw_response);
        }
        for s in &synthesis.solutions {
            let _ = writeln!(out, "### Rank {}: {}", s.rank_text(), s.name_text());
            let _ = writeln!(
                out,
                "- **Physics Confidence**: {}",
                s.physics_confidence.as_deref().unwrap_or("?")
            );
            let _ = writeln!(
                out,
                "- **Key Innovation**: {}",
                s.key_innovation.as_deref().unwrap_or("?")
            );
            let _ = writeln!(
                out,
                "- **Pathway**: {}\n",
                one_line(s.complete_pathway.as_deref().unwrap_or("?"), 500)
            );
        }
    }

    if let Some(writeup) = &state.final_writeup {
        let _ = writeln!(out, "## Discovery Thesis\n\n{}", writeup.raw_response);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn state_with_results() -> RunState {
        let mut state = RunState::with_run_id("r1", "Make X");
        state.target = Some(TargetSelection::from_response(
            r#"{"selected_target":"A","task_description":"B"}"#,
        ));
        state.hypotheses = Some(HypothesisSet::from_response(
            r#"[{"name":"First","core_mechanism":"heat"},{"name":"Second"}]"#,
        ));
        let items = state.hypotheses.clone().unwrap().items;

        state.approach_results = Some(vec![
            HypothesisOutcome::ChainAssembled {
                hypothesis: items[0].clone(),
                steps: vec![AtomicStep::from_record(json!({"standalone_question": "Q"}))],
                validations: vec![Validation::new("Q".into(), Some("{}".into()), true)],
                chain: ChainAssembly::from_response(Some(r#"{"chain_status":"FIXABLE"}"#.into())),
            },
            HypothesisOutcome::DecomposerFailed {
                hypothesis: items[1].clone(),
            },
        ]);
        state.engineering = Some(vec![EngineeringProposal::new(
            &items[0],
            Some("Build a\nvery large press".into()),
        )]);
        state
    }

    #[test]
    fn test_summary_sections() {
        let summary = render_summary(&state_with_results());
        assert!(summary.contains("## Frontier Problem\nMake X"));
        assert!(summary.contains("## Selected Target\n**A**"));
        assert!(summary.contains("## Hypotheses Generated: 2"));
        assert!(summary.contains("### 1. First\n- **Mechanism**: heat"));
        assert!(summary.contains("- **Chain Status**: FIXABLE"));
        assert!(summary.contains("- **Physics Steps Validated**: 1/1"));
        assert!(summary.contains("- **Chain Status**: decomposer_failed"));
        assert!(summary.contains("- **Engineering Proposal**: Build a very large press"));
        assert_eq!(summary.matches("- **Engineering Proposal**").count(), 1);
        assert!(!summary.contains("## Discovery Thesis"));
    }

    #[test]
    fn test_thesis_only_with_writeup() {
        let mut state = state_with_results();
        assert!(render_thesis(&state).is_none());

        state.final_writeup = Some(FinalWriteUp {
            raw_response: "ABSTRACT ...".into(),
        });
        let thesis = render_thesis(&state).unwrap();
        assert!(thesis.starts_with("# Discovery Thesis"));
        assert!(thesis.contains("## Frontier Problem\nMake X"));
        assert!(thesis.contains("## Discovery\nABSTRACT ..."));
    }

    #[test]
    fn test_one_line_truncates() {
        assert_eq!(one_line("a\n b", 10), "a b");
        assert_eq!(one_line("abcdef", 3), "abc...");
    }

    #[tokio::test]
    async fn test_write_reports() {
        let dir = TempDir::new().unwrap();
        let mut state = state_with_results();

        let paths = write_reports(dir.path(), &state).await;
        assert!(paths.discovery.unwrap().ends_with("discovery_r1.json"));
        assert!(paths.summary.unwrap().ends_with("summary_r1.md"));
        assert!(paths.thesis.is_none());

        state.final_writeup = Some(FinalWriteUp {
            raw_response: "thesis".into(),
        });
        let paths = write_reports(dir.path(), &state).await;
        let thesis = paths.thesis.unwrap();
        assert_eq!(thesis, dir.path().join("discoveries").join("thesis_r1.md"));

        let json = std::fs::read_to_string(dir.path().join("discovery_r1.json")).unwrap();
        let back: RunState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
