//! Immutable stage graph compiled from a validated template.

use crate::{Attributes, FactoryError, Graph, LintRule, OutcomeClass, validate_or_raise};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::time::Duration;

/// Role type backing a stage. Custom roles are plain names.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RoleType {
    Architect,
    Planner,
    Developer,
    Tester,
    Validator,
    Critic,
    Custom(String),
}

impl RoleType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Architect => "architect",
            Self::Planner => "planner",
            Self::Developer => "developer",
            Self::Tester => "tester",
            Self::Validator => "validator",
            Self::Critic => "critic",
            Self::Custom(name) => name,
        }
    }

    pub fn core_roles() -> [RoleType; 6] {
        [
            Self::Architect,
            Self::Planner,
            Self::Developer,
            Self::Tester,
            Self::Validator,
            Self::Critic,
        ]
    }
}

impl From<&str> for RoleType {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "architect" => Self::Architect,
            "planner" => Self::Planner,
            "developer" => Self::Developer,
            "tester" => Self::Tester,
            "validator" => Self::Validator,
            "critic" => Self::Critic,
            _ => Self::Custom(value.trim().to_string()),
        }
    }
}

impl From<String> for RoleType {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<RoleType> for String {
    fn from(value: RoleType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for RoleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Successors {
    pub pass: Vec<String>,
    pub fail: Option<String>,
    pub needs_input: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageNode {
    pub name: String,
    pub role: RoleType,
    /// Sources of incoming pass edges; a stage with several is a join.
    pub predecessors: BTreeSet<String>,
    pub successors: Successors,
    pub max_refinements: Option<u32>,
    pub timeout: Option<Duration>,
    pub tools: Vec<String>,
    pub attrs: Attributes,
}

impl StageNode {
    pub fn prompt(&self) -> Option<&str> {
        self.attrs.get_str("prompt")
    }

    pub fn question(&self) -> Option<&str> {
        self.attrs.get_str("question")
    }

    /// Where a failed attempt is routed: the remediation stage, or the stage itself.
    pub fn remediation_target(&self) -> &str {
        self.successors.fail.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageGraph {
    pub id: String,
    pub attrs: Attributes,
    pub start: String,
    pub nodes: BTreeMap<String, StageNode>,
    reach: BTreeMap<String, BTreeSet<String>>,
}

impl StageGraph {
    /// Lints and compiles a template. Lint errors become [`FactoryError::Validation`].
    pub fn compile(graph: &Graph, extra_rules: &[&dyn LintRule]) -> Result<Self, FactoryError> {
        validate_or_raise(graph, extra_rules)?;

        let start = graph
            .start_candidates()
            .first()
            .map(|node| node.id.clone())
            .ok_or_else(|| FactoryError::InvalidGraph("template has no start stage".to_string()))?;

        let mut nodes = BTreeMap::new();
        for node in graph.nodes.values() {
            let role = node
                .attrs
                .get_str("role")
                .map(RoleType::from)
                .ok_or_else(|| {
                    FactoryError::InvalidGraph(format!("stage '{}' has no role", node.id))
                })?;
            let max_refinements = node
                .attrs
                .get_i64("max_refinements")
                .map(|value| u32::try_from(value).unwrap_or(u32::MAX));

            let mut successors = Successors::default();
            for edge in graph.outgoing_edges(&node.id) {
                match OutcomeClass::parse(edge.outcome_label()) {
                    Some(OutcomeClass::Pass) => successors.pass.push(edge.to.clone()),
                    Some(OutcomeClass::Fail) => successors.fail = Some(edge.to.clone()),
                    Some(OutcomeClass::NeedsInput) => {
                        successors.needs_input = Some(edge.to.clone())
                    }
                    None => {}
                }
            }
            successors.pass.sort();
            successors.pass.dedup();

            let predecessors = graph
                .incoming_edges(&node.id)
                .filter(|edge| OutcomeClass::parse(edge.outcome_label()) == Some(OutcomeClass::Pass))
                .map(|edge| edge.from.clone())
                .collect();

            nodes.insert(
                node.id.clone(),
                StageNode {
                    name: node.id.clone(),
                    role,
                    predecessors,
                    successors,
                    max_refinements,
                    timeout: node.attrs.get_duration("timeout"),
                    tools: node.attrs.get_list("tools"),
                    attrs: node.attrs.clone(),
                },
            );
        }

        let reach = nodes
            .keys()
            .map(|name| (name.clone(), forward_reach(&nodes, name)))
            .collect();

        Ok(Self {
            id: graph.id.clone(),
            attrs: graph.attrs.clone(),
            start,
            nodes,
            reach,
        })
    }

    pub fn node(&self, name: &str) -> Option<&StageNode> {
        self.nodes.get(name)
    }

    pub fn roles(&self) -> BTreeSet<&RoleType> {
        self.nodes.values().map(|node| &node.role).collect()
    }

    /// True when `target` is `from` or lies downstream of it along pass or
    /// needs-input edges.
    pub fn reaches(&self, from: &str, target: &str) -> bool {
        from == target
            || self
                .reach
                .get(from)
                .is_some_and(|downstream| downstream.contains(target))
    }
}

fn forward_reach(nodes: &BTreeMap<String, StageNode>, from: &str) -> BTreeSet<String> {
    let mut visited = BTreeSet::new();
    let mut queue = VecDeque::from([from.to_string()]);
    while let Some(current) = queue.pop_front() {
        let Some(node) = nodes.get(&current) else {
            continue;
        };
        let next = node
            .successors
            .pass
            .iter()
            .chain(node.successors.needs_input.iter());
        for successor in next {
            if visited.insert(successor.clone()) {
                queue.push_back(successor.clone());
            }
        }
    }
    visited
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_dot;

    fn compile(source: &str) -> StageGraph {
        let graph = parse_dot(source).expect("graph should parse");
        StageGraph::compile(&graph, &[]).expect("graph should compile")
    }

    #[test]
    fn compile_fan_out_and_join_expected_predecessors_and_successors() {
        let graph = compile(
            r#"
            digraph G {
                t [role="tester"] s [role="validator"] c [role="validator"] j [role="critic"]
                t -> s
                t -> c
                s -> j
                c -> j
            }
            "#,
        );
        assert_eq!(graph.start, "t");
        assert_eq!(graph.nodes["t"].successors.pass, vec!["c", "s"]);
        assert_eq!(
            graph.nodes["j"].predecessors,
            BTreeSet::from(["c".to_string(), "s".to_string()])
        );
        assert!(graph.reaches("t", "j"));
        assert!(!graph.reaches("s", "c"));
    }

    #[test]
    fn compile_fail_edge_expected_remediation_target_not_in_reach() {
        let graph = compile(
            r#"
            digraph G {
                a [role="architect"]
                d [role="developer", max_refinements=4, timeout="2m"]
                t [role="tester"] k [role="critic"]
                a -> d -> t
                t -> k [outcome="fail"]
                k -> d
            }
            "#,
        );
        let tester = &graph.nodes["t"];
        assert_eq!(tester.remediation_target(), "k");
        assert_eq!(graph.nodes["d"].remediation_target(), "d");
        assert_eq!(graph.nodes["d"].max_refinements, Some(4));
        assert_eq!(graph.nodes["d"].timeout, Some(Duration::from_secs(120)));
        assert!(!graph.reaches("t", "k"));
        assert_eq!(
            graph.nodes["d"].predecessors,
            BTreeSet::from(["a".to_string(), "k".to_string()])
        );
    }

    #[test]
    fn compile_invalid_template_expected_validation_error() {
        let graph = parse_dot("digraph G { a }").expect("graph should parse");
        let error = StageGraph::compile(&graph, &[]).expect_err("missing role should fail");
        assert!(matches!(error, FactoryError::Validation(_)));
    }

    #[test]
    fn role_type_custom_name_expected_round_trip_through_string() {
        assert_eq!(RoleType::from("Tester"), RoleType::Tester);
        let custom = RoleType::from("doc_writer");
        assert_eq!(String::from(custom.clone()), "doc_writer");
        assert_eq!(custom, RoleType::Custom("doc_writer".to_string()));
    }
}
