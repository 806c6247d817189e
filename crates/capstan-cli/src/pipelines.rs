//! The two reference pipelines shipped with the binary.
//!
//! `document` is a straight-line enrichment chain; `requirements` adds two
//! human review gates with revise loops back to the mapping step. Both keep
//! the language model behind the `CompletionClient` seam so the same graphs
//! run against local Ollama, a hosted endpoint, or a scripted stand-in.

use std::sync::Arc;

use capstan_docs::StructuredDoc;
use capstan_graph::{step_fn, Graph, GraphBuilder, Next};
use capstan_llm::{CompletionClient, CompletionRequest};
use capstan_types::{Result, State, StateUpdate, WorkflowError};
use serde_json::json;

fn step_failure(step: &str, cause: impl Into<String>) -> WorkflowError {
    WorkflowError::StepFailure {
        step: step.to_string(),
        cause: cause.into(),
    }
}

/// Route a gate by the folded-in verdict. Revisions loop back through the
/// `rework` branch; rejection aborts the run.
fn verdict_route(state: &State) -> String {
    match state.get_str("verdict") {
        Some("approve") => "continue".to_string(),
        Some("reject") => "abort".to_string(),
        _ => "rework".to_string(),
    }
}

// ---------------------------------------------------------------------------
// document: load -> parse -> extract -> analyze -> seed -> merge
// ---------------------------------------------------------------------------

pub fn document_pipeline(client: Arc<dyn CompletionClient>) -> Result<Graph> {
    let analyze_client = client;

    GraphBuilder::new()
        .add_step(
            "load",
            step_fn(|state: State| async move {
                let raw = state
                    .get_str("raw")
                    .filter(|r| !r.trim().is_empty())
                    .ok_or_else(|| step_failure("load", "input document is empty"))?;
                Ok(StateUpdate::new()
                    .set("loaded", json!(true))
                    .set("chars", json!(raw.len())))
            }),
        )
        .add_step(
            "parse",
            step_fn(|state: State| async move {
                let raw = state.get_str("raw").unwrap_or("");
                let doc = capstan_docs::parse(raw)?;
                Ok(StateUpdate::new()
                    .set("title", json!(doc.title().unwrap_or("Untitled")))
                    .set("section_count", json!(doc.section_count()))
                    .set("doc", serde_json::to_value(&doc)?))
            }),
        )
        .add_step(
            "extract",
            step_fn(|state: State| async move {
                let doc: StructuredDoc = match state.get("doc") {
                    Some(value) => serde_json::from_value(value.clone())?,
                    None => return Err(step_failure("extract", "no parsed document in state")),
                };
                let headings: Vec<String> = doc
                    .sections
                    .iter()
                    .map(|s| s.title.clone())
                    .collect();
                let lead = doc
                    .sections
                    .first()
                    .map(|s| s.text())
                    .unwrap_or_default();
                Ok(StateUpdate::new()
                    .set("headings", json!(headings))
                    .set("lead", json!(lead)))
            }),
        )
        .add_step(
            "analyze",
            step_fn(move |state: State| {
                let client = analyze_client.clone();
                async move {
                    let title = state.get_str("title").unwrap_or("Untitled");
                    let lead = state.get_str("lead").unwrap_or("");
                    let prompt = format!(
                        "Document: {title}\n\nOpening section:\n{lead}\n\n\
                         Summarize the document's purpose and flag anything unclear."
                    );
                    let analysis = client
                        .complete(
                            CompletionRequest::new(prompt)
                                .with_system("You review technical documents. Be concise."),
                        )
                        .await?;
                    Ok(StateUpdate::new().set("analysis", json!(analysis)))
                }
            }),
        )
        .add_step(
            "seed",
            step_fn(|state: State| async move {
                let words = state
                    .get_str("raw")
                    .map(|r| r.split_whitespace().count())
                    .unwrap_or(0);
                Ok(StateUpdate::new().set(
                    "metadata",
                    json!({
                        "word_count": words,
                        "sections": state.get_u64("section_count").unwrap_or(0),
                    }),
                ))
            }),
        )
        .add_step(
            "merge",
            step_fn(|state: State| async move {
                let title = state.get_str("title").unwrap_or("Untitled");
                let analysis = state.get_str("analysis").unwrap_or("(no analysis)");
                let report = format!("# {title}\n\n## Analysis\n\n{analysis}\n");
                Ok(StateUpdate::new().set("report", json!(report)))
            }),
        )
        .set_entry("load")
        .add_edge("load", "parse")
        .add_edge("parse", "extract")
        .add_edge("extract", "analyze")
        .add_edge("analyze", "seed")
        .add_edge("seed", "merge")
        .add_edge_to_end("merge")
        .compile()
}

// ---------------------------------------------------------------------------
// requirements: analyze -> map -> review -> transform -> validate
//               -> approve -> generate
// ---------------------------------------------------------------------------

pub fn requirements_pipeline(client: Arc<dyn CompletionClient>) -> Result<Graph> {
    let map_client = client.clone();
    let transform_client = client;

    GraphBuilder::new()
        .add_step(
            "analyze",
            step_fn(|state: State| async move {
                let raw = state.get_str("raw").unwrap_or("");
                let requirements: Vec<String> = raw
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(String::from)
                    .collect();
                if requirements.is_empty() {
                    return Err(step_failure("analyze", "no requirements found in input"));
                }
                Ok(StateUpdate::new()
                    .set("requirements", json!(requirements))
                    .set("requirement_count", json!(requirements.len())))
            }),
        )
        .add_step(
            "map",
            step_fn(move |state: State| {
                let client = map_client.clone();
                async move {
                    let requirements = state
                        .get("requirements")
                        .cloned()
                        .unwrap_or_else(|| json!([]));
                    let mut prompt = format!(
                        "Requirements:\n{requirements}\n\n\
                         Propose a mapping from each requirement to a concrete \
                         system capability, one line per requirement."
                    );
                    if let Some(feedback) = state.get_str("feedback") {
                        prompt.push_str(&format!("\n\nReviewer feedback to address:\n{feedback}"));
                    }
                    let mapping = client
                        .complete(CompletionRequest::new(prompt).with_system(
                            "You are a requirements analyst. Answer with the mapping only.",
                        ))
                        .await?;
                    Ok(StateUpdate::new().set("mapping", json!(mapping)))
                }
            }),
        )
        .add_gate("review", "Review the proposed requirement mapping")
        .add_step(
            "transform",
            step_fn(move |state: State| {
                let client = transform_client.clone();
                async move {
                    let mapping = state.get_str("mapping").unwrap_or("");
                    let prompt = format!(
                        "Mapping:\n{mapping}\n\n\
                         Rewrite the mapped capabilities as testable acceptance \
                         criteria in markdown, one `##` section per capability."
                    );
                    let transformed = client
                        .complete(CompletionRequest::new(prompt).with_system(
                            "You write acceptance criteria. Output markdown only.",
                        ))
                        .await?;
                    Ok(StateUpdate::new().set("transformed", json!(transformed)))
                }
            }),
        )
        .add_step(
            "validate",
            step_fn(|state: State| async move {
                let transformed = state.get_str("transformed").unwrap_or("");
                let doc = capstan_docs::parse(transformed)?;
                if doc.section_count() == 0 {
                    return Err(step_failure(
                        "validate",
                        "transformed output has no sections",
                    ));
                }
                Ok(StateUpdate::new().set("validated", json!(true)))
            }),
        )
        .add_gate("approve", "Approve the final transformed requirements")
        .add_step(
            "generate",
            step_fn(|state: State| async move {
                let transformed = state.get_str("transformed").unwrap_or("");
                let count = state.get_u64("requirement_count").unwrap_or(0);
                let final_doc = format!(
                    "# Transformed Requirements\n\n{transformed}\n\n\
                     _{count} requirements processed._\n"
                );
                Ok(StateUpdate::new().set("final_doc", json!(final_doc)))
            }),
        )
        .set_entry("analyze")
        .add_edge("analyze", "map")
        .add_edge("map", "review")
        .add_conditional(
            "review",
            verdict_route,
            vec![
                ("continue", Next::step("transform")),
                ("rework", Next::step("map")),
                ("abort", Next::End),
            ],
        )
        .add_edge("transform", "validate")
        .add_edge("validate", "approve")
        .add_conditional(
            "approve",
            verdict_route,
            vec![
                ("continue", Next::step("generate")),
                ("rework", Next::step("map")),
                ("abort", Next::End),
            ],
        )
        .add_edge_to_end("generate")
        .compile()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
