use crate::{Diagnostic, Graph, OutcomeClass, Severity, ValidationError};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

pub trait LintRule {
    fn name(&self) -> &str;
    fn apply(&self, graph: &Graph) -> Vec<Diagnostic>;
}

pub fn validate(graph: &Graph, extra_rules: &[&dyn LintRule]) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    diagnostics.extend(rule_start_node(graph));
    diagnostics.extend(rule_edge_endpoints_exist(graph));
    diagnostics.extend(rule_outcome_value(graph));
    diagnostics.extend(rule_single_remediation_edge(graph));
    diagnostics.extend(rule_role_present(graph));
    diagnostics.extend(rule_reachability(graph));
    diagnostics.extend(rule_pass_edges_acyclic(graph));
    diagnostics.extend(rule_attribute_types(graph));
    diagnostics.extend(rule_dead_end_retry(graph));

    for rule in extra_rules {
        diagnostics.extend(rule.apply(graph));
    }

    diagnostics
}

pub fn validate_or_raise(
    graph: &Graph,
    extra_rules: &[&dyn LintRule],
) -> Result<Vec<Diagnostic>, ValidationError> {
    let diagnostics = validate(graph, extra_rules);
    if diagnostics.iter().any(Diagnostic::is_error) {
        return Err(ValidationError::new(diagnostics));
    }
    Ok(diagnostics)
}

fn rule_start_node(graph: &Graph) -> Vec<Diagnostic> {
    let starts = graph.start_candidates();
    if starts.len() == 1 {
        return Vec::new();
    }
    let names: Vec<&str> = starts.iter().map(|node| node.id.as_str()).collect();
    vec![
        Diagnostic::error(
            "start_node",
            format!(
                "template must have exactly one start stage (no incoming edges); found {}",
                starts.len()
            ),
        )
        .with_hint(if names.is_empty() {
            "every stage has an incoming edge".to_string()
        } else {
            format!("candidates: {}", names.join(", "))
        }),
    ]
}

fn rule_edge_endpoints_exist(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for edge in &graph.edges {
        for endpoint in [&edge.from, &edge.to] {
            if !graph.nodes.contains_key(endpoint) {
                diagnostics.push(
                    Diagnostic::error(
                        "edge_endpoint_exists",
                        format!("edge references unknown stage '{endpoint}'"),
                    )
                    .with_edge(edge.from.clone(), edge.to.clone()),
                );
            }
        }
    }
    diagnostics
}

fn rule_outcome_value(graph: &Graph) -> Vec<Diagnostic> {
    graph
        .edges
        .iter()
        .filter(|edge| OutcomeClass::parse(edge.outcome_label()).is_none())
        .map(|edge| {
            Diagnostic::error(
                "outcome_value",
                format!("unknown edge outcome '{}'", edge.outcome_label()),
            )
            .with_edge(edge.from.clone(), edge.to.clone())
            .with_hint("expected one of: pass, fail, needs_input")
        })
        .collect()
}

fn rule_single_remediation_edge(graph: &Graph) -> Vec<Diagnostic> {
    let mut counts: BTreeMap<(&str, OutcomeClass), usize> = BTreeMap::new();
    for edge in &graph.edges {
        if let Some(class) = OutcomeClass::parse(edge.outcome_label()) {
            if class != OutcomeClass::Pass {
                *counts.entry((edge.from.as_str(), class)).or_default() += 1;
            }
        }
    }

    counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|((stage, class), count)| {
            Diagnostic::error(
                "single_remediation_edge",
                format!("stage has {count} '{}' edges; at most one is allowed", class.as_str()),
            )
            .with_stage(stage)
        })
        .collect()
}

fn rule_role_present(graph: &Graph) -> Vec<Diagnostic> {
    graph
        .nodes
        .values()
        .filter(|node| {
            node.attrs
                .get_str("role")
                .map(str::trim)
                .is_none_or(str::is_empty)
        })
        .map(|node| {
            Diagnostic::error("role_present", "stage has no 'role' attribute")
                .with_stage(node.id.clone())
        })
        .collect()
}

fn rule_reachability(graph: &Graph) -> Vec<Diagnostic> {
    let starts = graph.start_candidates();
    let [start] = starts.as_slice() else {
        return Vec::new();
    };

    let mut visited = BTreeSet::new();
    let mut queue = VecDeque::new();
    visited.insert(start.id.clone());
    queue.push_back(start.id.clone());

    while let Some(node_id) = queue.pop_front() {
        for edge in graph.outgoing_edges(&node_id) {
            if visited.insert(edge.to.clone()) {
                queue.push_back(edge.to.clone());
            }
        }
    }

    graph
        .nodes
        .values()
        .filter(|node| !visited.contains(&node.id))
        .map(|node| {
            Diagnostic::error("reachability", "stage is unreachable from start")
                .with_stage(node.id.clone())
        })
        .collect()
}

fn rule_pass_edges_acyclic(graph: &Graph) -> Vec<Diagnostic> {
    // Kahn's algorithm over pass edges only; leftovers sit on a cycle.
    let mut in_degree: BTreeMap<&str, usize> =
        graph.nodes.keys().map(|id| (id.as_str(), 0)).collect();
    let pass_edges: Vec<_> = graph
        .edges
        .iter()
        .filter(|edge| edge.outcome_label() == OutcomeClass::Pass.as_str())
        .filter(|edge| graph.nodes.contains_key(&edge.from) && graph.nodes.contains_key(&edge.to))
        .collect();
    for edge in &pass_edges {
        *in_degree.entry(edge.to.as_str()).or_default() += 1;
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    while let Some(node_id) = queue.pop_front() {
        for edge in pass_edges.iter().filter(|edge| edge.from == node_id) {
            if let Some(degree) = in_degree.get_mut(edge.to.as_str()) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(edge.to.as_str());
                }
            }
        }
    }

    let cyclic: Vec<&str> = in_degree
        .into_iter()
        .filter(|(_, degree)| *degree > 0)
        .map(|(id, _)| id)
        .collect();
    if cyclic.is_empty() {
        return Vec::new();
    }
    vec![
        Diagnostic::error(
            "pass_edges_acyclic",
            format!("pass edges form a cycle through: {}", cyclic.join(", ")),
        )
        .with_hint("route back-edges through an outcome=\"fail\" edge so they are bounded"),
    ]
}

fn rule_attribute_types(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for node in graph.nodes.values() {
        if let Some(value) = node.attrs.get("max_refinements") {
            if !value.as_i64().is_some_and(|v| v >= 0) {
                diagnostics.push(
                    Diagnostic::error(
                        "attribute_types",
                        format!(
                            "max_refinements must be a non-negative integer, got '{}'",
                            value.to_string_value()
                        ),
                    )
                    .with_stage(node.id.clone()),
                );
            }
        }
        if let Some(value) = node.attrs.get("timeout") {
            if value.as_duration().is_none() {
                diagnostics.push(
                    Diagnostic::error(
                        "attribute_types",
                        format!(
                            "timeout must be a quoted duration, got '{}'",
                            value.to_string_value()
                        ),
                    )
                    .with_stage(node.id.clone())
                    .with_hint("e.g. timeout=\"90s\""),
                );
            }
        }
    }
    diagnostics
}

fn rule_dead_end_retry(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for node in graph.nodes.values() {
        let has_fail_edge = graph
            .outgoing_edges(&node.id)
            .any(|edge| edge.outcome_label() == OutcomeClass::Fail.as_str());
        if !has_fail_edge && node.attrs.get_i64("max_refinements") == Some(0) {
            diagnostics.push(
                Diagnostic::new(
                    "dead_end_retry",
                    Severity::Warning,
                    "stage has no fail edge and max_refinements=0; any failure ends the run",
                )
                .with_stage(node.id.clone()),
            );
        }
    }
    diagnostics
}
