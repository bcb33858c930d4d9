//! Graph validation: reject definitions that cannot execute correctly.
//!
//! Validation runs before any queue or supervisor is allocated. It returns
//! a [`ValidationReport`] of errors and warnings; errors block
//! [`WorkflowEngine::start`](crate::engine::WorkflowEngine::start).

use rustc_hash::{FxHashMap, FxHashSet};
use miette::Diagnostic;
use thiserror::Error;

use crate::condition::CompiledCondition;
use crate::definition::{EdgeDefinition, WorkflowDefinition, parse_iso8601_duration};
use crate::types::{EdgeKind, RuntimeKind};

/// One finding from graph validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationIssue {
    #[error("duplicate node id `{node_id}`")]
    DuplicateNodeId { node_id: String },

    #[error("edge references missing node `{node_id}`")]
    MissingEndpoint { node_id: String },

    #[error("entry point `{node_id}` does not exist")]
    MissingEntryPoint { node_id: String },

    #[error("graph has no entry point (every node has incoming edges)")]
    NoEntryPoint,

    #[error("cycle detected through node `{node_id}`")]
    Cycle { node_id: String },

    #[error("node `{node_id}` is unreachable from any entry point")]
    Unreachable { node_id: String },

    #[error("invalid condition on edge {edge_source} -> {target}: {detail}")]
    BadCondition {
        edge_source: String,
        target: String,
        detail: String,
    },

    #[error("invalid visibility timeout `{value}` on edge {edge_source} -> {target}")]
    BadVisibilityTimeout {
        edge_source: String,
        target: String,
        value: String,
    },

    #[error("{node_id}: {detail}")]
    NodeConfig { node_id: String, detail: String },
}

/// Aggregate validation outcome. Errors block execution; warnings do not
/// (unless the strict flag promoted them).
#[derive(Debug, Default, Clone)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Error wrapper used by the engine when a report carries errors.
#[derive(Debug, Error, Diagnostic)]
#[error("workflow `{workflow_id}` failed validation: {summary}")]
#[diagnostic(
    code(loomflow::validation::rejected),
    help("Inspect the report's individual issues; the graph never started.")
)]
pub struct GraphRejected {
    pub workflow_id: String,
    pub report: ValidationReport,
    summary: String,
}

impl GraphRejected {
    pub fn new(workflow_id: impl Into<String>, report: ValidationReport) -> Self {
        let summary = report
            .errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        Self {
            workflow_id: workflow_id.into(),
            report,
            summary,
        }
    }
}

/// Validate a workflow definition.
///
/// `strict` promotes reachability warnings to errors.
pub fn validate_definition(definition: &WorkflowDefinition, strict: bool) -> ValidationReport {
    let mut report = ValidationReport::default();

    check_structure(definition, &mut report);
    // Endpoint errors make the remaining passes meaningless.
    if !report.errors.is_empty() {
        return report;
    }

    check_cycles(definition, &mut report);
    check_reachability(definition, strict, &mut report);
    for node in &definition.nodes {
        check_node_config(definition, node, &mut report);
    }
    for edge in &definition.connections {
        check_edge(edge, &mut report);
    }
    report
}

fn check_structure(definition: &WorkflowDefinition, report: &mut ValidationReport) {
    let mut seen = FxHashSet::default();
    for node in &definition.nodes {
        if !seen.insert(node.node_id.as_str()) {
            report.errors.push(ValidationIssue::DuplicateNodeId {
                node_id: node.node_id.clone(),
            });
        }
    }

    for edge in &definition.connections {
        for endpoint in [&edge.source_node_id, &edge.target_node_id] {
            if definition.node(endpoint).is_none() {
                report.errors.push(ValidationIssue::MissingEndpoint {
                    node_id: endpoint.clone(),
                });
            }
        }
    }

    if let Some(entry) = &definition.entry_point_node_id {
        if definition.node(entry).is_none() {
            report.errors.push(ValidationIssue::MissingEntryPoint {
                node_id: entry.clone(),
            });
        }
    } else if !definition.nodes.is_empty() && definition.entry_points().is_empty() {
        report.errors.push(ValidationIssue::NoEntryPoint);
    }
}

/// DFS with an explicit recursion stack. Iteration-check feedback edges are
/// exempt: a while-loop body is allowed to revisit its loop node.
fn check_cycles(definition: &WorkflowDefinition, report: &mut ValidationReport) {
    let mut adjacency: FxHashMap<&str, Vec<&str>> = FxHashMap::default();
    for edge in &definition.connections {
        if edge.kind == EdgeKind::IterationCheck {
            continue;
        }
        adjacency
            .entry(edge.source_node_id.as_str())
            .or_default()
            .push(edge.target_node_id.as_str());
    }

    let mut visited = FxHashSet::default();
    let mut on_stack = FxHashSet::default();
    let mut flagged = FxHashSet::default();

    fn dfs<'a>(
        node: &'a str,
        adjacency: &FxHashMap<&'a str, Vec<&'a str>>,
        visited: &mut FxHashSet<&'a str>,
        on_stack: &mut FxHashSet<&'a str>,
        flagged: &mut FxHashSet<&'a str>,
    ) {
        visited.insert(node);
        on_stack.insert(node);
        for next in adjacency.get(node).into_iter().flatten() {
            if on_stack.contains(next) {
                flagged.insert(*next);
            } else if !visited.contains(next) {
                dfs(next, adjacency, visited, on_stack, flagged);
            }
        }
        on_stack.remove(node);
    }

    for node in &definition.nodes {
        if !visited.contains(node.node_id.as_str()) {
            dfs(
                node.node_id.as_str(),
                &adjacency,
                &mut visited,
                &mut on_stack,
                &mut flagged,
            );
        }
    }

    let mut flagged: Vec<_> = flagged.into_iter().collect();
    flagged.sort_unstable();
    for node_id in flagged {
        report.errors.push(ValidationIssue::Cycle {
            node_id: node_id.to_string(),
        });
    }
}

fn check_reachability(
    definition: &WorkflowDefinition,
    strict: bool,
    report: &mut ValidationReport,
) {
    let mut reachable = FxHashSet::default();
    let mut frontier: Vec<&str> = definition
        .entry_points()
        .iter()
        .map(|n| n.node_id.as_str())
        .collect();
    while let Some(node) = frontier.pop() {
        if !reachable.insert(node) {
            continue;
        }
        for edge in definition.outgoing_edges(node) {
            frontier.push(edge.target_node_id.as_str());
        }
    }

    for node in &definition.nodes {
        if !reachable.contains(node.node_id.as_str()) {
            let issue = ValidationIssue::Unreachable {
                node_id: node.node_id.clone(),
            };
            if strict {
                report.errors.push(issue);
            } else {
                report.warnings.push(issue);
            }
        }
    }
}

fn check_node_config(
    definition: &WorkflowDefinition,
    node: &crate::definition::NodeDefinition,
    report: &mut ValidationReport,
) {
    let mut error = |detail: String| {
        report.errors.push(ValidationIssue::NodeConfig {
            node_id: node.node_id.clone(),
            detail,
        });
    };

    match node.runtime_type {
        RuntimeKind::Branch => {
            let outgoing: FxHashSet<EdgeKind> = definition
                .outgoing_edges(&node.node_id)
                .map(|e| e.kind)
                .collect();
            if !(outgoing.contains(&EdgeKind::TrueBranch)
                && outgoing.contains(&EdgeKind::FalseBranch))
            {
                error("branch node needs both a true-branch and a false-branch edge".into());
            }
            match node.config_str("Condition") {
                None => error("branch node is missing the Condition option".into()),
                Some(cond) => {
                    if let Err(e) = CompiledCondition::compile(cond) {
                        error(format!("branch condition does not parse: {e}"));
                    }
                }
            }
        }
        RuntimeKind::Switch => {
            if node.config_str("Expression").is_none() {
                error("switch node is missing the Expression option".into());
            }
            let cases = node
                .config_value("Cases")
                .and_then(|v| v.as_object())
                .map(|o| o.len())
                .unwrap_or(0);
            if cases == 0 {
                error("switch node needs at least one entry in Cases".into());
            }
        }
        RuntimeKind::LoopForeach => {
            if node.config_str("CollectionExpression").is_none() {
                error("foreach node is missing the CollectionExpression option".into());
            }
            if !definition
                .outgoing_edges(&node.node_id)
                .any(|e| e.kind == EdgeKind::LoopBody)
            {
                error("foreach node has no loop-body edge".into());
            }
        }
        RuntimeKind::LoopWhile => {
            match node.config_str("Condition") {
                None => error("while node is missing the Condition option".into()),
                Some(cond) => {
                    if let Err(e) = CompiledCondition::compile(cond) {
                        error(format!("while condition does not parse: {e}"));
                    }
                }
            }
            if !definition
                .outgoing_edges(&node.node_id)
                .any(|e| e.kind == EdgeKind::LoopBody)
            {
                error("while node has no loop-body edge".into());
            }
        }
        RuntimeKind::Subflow => {
            let has_path = node.config_str("WorkflowFilePath").is_some();
            let has_inline = node.config_value("WorkflowDefinition").is_some();
            if !has_path && !has_inline {
                error(
                    "subflow node needs WorkflowFilePath or an inline WorkflowDefinition".into(),
                );
            }
        }
        RuntimeKind::Container => {
            let children = node
                .config_value("ChildNodes")
                .and_then(|v| v.as_array())
                .map(|a| a.len())
                .unwrap_or(0);
            if children == 0 {
                error("container node has no ChildNodes".into());
            }
        }
        RuntimeKind::Timer => {
            if node.config_str("Schedule").is_none() {
                error("timer node is missing the Schedule option".into());
            }
        }
        RuntimeKind::InlineScript => {
            if node.script_content.is_none() {
                error("inline-script node has no scriptContent".into());
            }
        }
        RuntimeKind::ScriptFile => {
            if node.script_path.is_none() {
                error("script-file node has no scriptPath".into());
            }
        }
        RuntimeKind::CompiledNative => {
            if node.assembly_reference.is_none() {
                error("compiled-native node has no assemblyReference".into());
            }
        }
        RuntimeKind::Noop => {}
    }
}

fn check_edge(edge: &EdgeDefinition, report: &mut ValidationReport) {
    if let Some(condition) = &edge.condition {
        if let Err(e) = CompiledCondition::compile(condition) {
            report.errors.push(ValidationIssue::BadCondition {
                edge_source: edge.source_node_id.clone(),
                target: edge.target_node_id.clone(),
                detail: e.to_string(),
            });
        }
    }
    if let Some(raw) = &edge.visibility_timeout {
        if parse_iso8601_duration(raw).is_none() {
            report.errors.push(ValidationIssue::BadVisibilityTimeout {
                edge_source: edge.source_node_id.clone(),
                target: edge.target_node_id.clone(),
                value: raw.clone(),
            });
        }
    }
}
