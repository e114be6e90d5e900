use crate::{AttrValue, Attributes, DurationValue, Edge, FactoryError, Graph, Node};
use graphviz_rust::dot_structures::{
    Attribute, Edge as DotEdge, EdgeTy, Graph as DotGraph, GraphAttributes, Id, Node as DotNode,
    NodeId, Stmt, Vertex,
};

#[derive(Clone, Debug, Default)]
struct Scope {
    node_defaults: Attributes,
    edge_defaults: Attributes,
}

/// Parses a DOT digraph into the template IR.
///
/// Durations must be quoted (`timeout="30s"`); bare `30s` is not a valid DOT
/// identifier.
pub fn parse_dot(source: &str) -> Result<Graph, FactoryError> {
    if has_undirected_edge_token(source) {
        return Err(FactoryError::InvalidGraph(
            "undirected edge token '--' is not supported".to_string(),
        ));
    }

    let dot_graph = graphviz_rust::parse(source).map_err(FactoryError::DotParse)?;
    convert_graph(dot_graph)
}

fn convert_graph(graph: DotGraph) -> Result<Graph, FactoryError> {
    let (graph_id, strict, stmts) = match graph {
        DotGraph::DiGraph { id, strict, stmts } => (dot_id_to_string(id)?, strict, stmts),
        DotGraph::Graph { .. } => {
            return Err(FactoryError::InvalidGraph(
                "only 'digraph' templates are supported".to_string(),
            ));
        }
    };
    if strict {
        return Err(FactoryError::InvalidGraph(
            "'strict' graphs are not supported".to_string(),
        ));
    }

    let mut graph = Graph::new(graph_id);
    process_statements(&mut graph, &stmts, &Scope::default(), true)?;
    Ok(graph)
}

fn process_statements(
    graph: &mut Graph,
    stmts: &[Stmt],
    parent_scope: &Scope,
    top_level: bool,
) -> Result<(), FactoryError> {
    let mut scope = parent_scope.clone();

    for stmt in stmts {
        match stmt {
            Stmt::GAttribute(GraphAttributes::Node(attrs)) => {
                scope.node_defaults.merge(&parse_attributes(attrs)?);
            }
            Stmt::GAttribute(GraphAttributes::Edge(attrs)) => {
                scope.edge_defaults.merge(&parse_attributes(attrs)?);
            }
            Stmt::GAttribute(GraphAttributes::Graph(attrs)) => {
                if top_level {
                    graph.attrs.merge(&parse_attributes(attrs)?);
                }
            }
            Stmt::Attribute(attr) => {
                if top_level {
                    let (key, value) = parse_attribute(attr)?;
                    graph.attrs.set(key, value);
                }
            }
            Stmt::Node(node) => process_node_stmt(graph, node, &scope)?,
            Stmt::Edge(edge) => process_edge_stmt(graph, edge, &scope)?,
            Stmt::Subgraph(subgraph) => {
                process_statements(graph, &subgraph.stmts, &scope, false)?;
            }
        }
    }

    Ok(())
}

fn process_node_stmt(graph: &mut Graph, node: &DotNode, scope: &Scope) -> Result<(), FactoryError> {
    let node_id = parse_node_id(&node.id)?;
    let mut attrs = scope.node_defaults.clone();
    attrs.merge(&parse_attributes(&node.attributes)?);

    graph
        .nodes
        .entry(node_id.clone())
        .or_insert_with(|| Node::new(node_id))
        .attrs
        .merge(&attrs);
    Ok(())
}

fn process_edge_stmt(graph: &mut Graph, edge: &DotEdge, scope: &Scope) -> Result<(), FactoryError> {
    let vertices = match &edge.ty {
        EdgeTy::Pair(from, to) => vec![parse_vertex(from)?, parse_vertex(to)?],
        EdgeTy::Chain(chain) => chain
            .iter()
            .map(parse_vertex)
            .collect::<Result<Vec<_>, _>>()?,
    };
    if vertices.len() < 2 {
        return Err(FactoryError::InvalidGraph(
            "edge chain must contain at least two vertices".to_string(),
        ));
    }

    let mut attrs = scope.edge_defaults.clone();
    attrs.merge(&parse_attributes(&edge.attributes)?);

    for pair in vertices.windows(2) {
        for endpoint in pair {
            graph
                .nodes
                .entry(endpoint.clone())
                .or_insert_with(|| Node::new(endpoint.clone()));
        }
        graph.edges.push(Edge {
            from: pair[0].clone(),
            to: pair[1].clone(),
            attrs: attrs.clone(),
        });
    }
    Ok(())
}

fn parse_vertex(vertex: &Vertex) -> Result<String, FactoryError> {
    match vertex {
        Vertex::N(node_id) => parse_node_id(node_id),
        Vertex::S(_) => Err(FactoryError::InvalidGraph(
            "subgraph vertices in edge statements are not supported".to_string(),
        )),
    }
}

fn parse_node_id(node_id: &NodeId) -> Result<String, FactoryError> {
    if node_id.1.is_some() {
        return Err(FactoryError::InvalidGraph(
            "ports in node identifiers are not supported".to_string(),
        ));
    }
    id_to_identifier(&node_id.0)
}

fn parse_attributes(attrs: &[Attribute]) -> Result<Attributes, FactoryError> {
    let mut parsed = Attributes::new();
    for attr in attrs {
        let (key, value) = parse_attribute(attr)?;
        parsed.set(key, value);
    }
    Ok(parsed)
}

fn parse_attribute(attr: &Attribute) -> Result<(String, AttrValue), FactoryError> {
    let key = id_to_string(&attr.0)?;
    if !is_valid_attr_key(&key) {
        return Err(FactoryError::InvalidGraph(format!(
            "invalid attribute key '{key}'"
        )));
    }
    Ok((key, parse_attr_value(&attr.1)?))
}

fn dot_id_to_string(id: Id) -> Result<String, FactoryError> {
    match id {
        Id::Anonymous(value) => Ok(value),
        other => id_to_identifier(&other),
    }
}

fn parse_attr_value(id: &Id) -> Result<AttrValue, FactoryError> {
    match id {
        Id::Html(_) => Err(FactoryError::InvalidGraph(
            "HTML attribute values are not supported".to_string(),
        )),
        Id::Escaped(_) => {
            let value = id_to_string(id)?;
            Ok(parse_duration(&value)
                .map(AttrValue::Duration)
                .unwrap_or(AttrValue::String(value)))
        }
        Id::Plain(raw) => {
            if raw == "true" {
                return Ok(AttrValue::Boolean(true));
            }
            if raw == "false" {
                return Ok(AttrValue::Boolean(false));
            }
            if let Ok(value) = raw.parse::<i64>() {
                return Ok(AttrValue::Integer(value));
            }
            if raw.contains('.') {
                if let Ok(value) = raw.parse::<f64>() {
                    return Ok(AttrValue::Float(value));
                }
            }
            Ok(AttrValue::String(raw.clone()))
        }
        Id::Anonymous(value) => Ok(AttrValue::String(value.clone())),
    }
}

pub(crate) fn parse_duration(raw: &str) -> Option<DurationValue> {
    let raw = raw.trim();
    let units = [("ms", 1), ("s", 1_000), ("m", 60_000), ("h", 3_600_000)];
    let (unit, factor) = units.iter().find(|(unit, _)| raw.ends_with(unit))?;
    let value = raw[..raw.len() - unit.len()].parse::<u64>().ok()?;
    Some(DurationValue {
        raw: raw.to_string(),
        millis: value.saturating_mul(*factor),
    })
}

fn id_to_identifier(id: &Id) -> Result<String, FactoryError> {
    let value = id_to_string(id)?;
    if is_valid_identifier(&value) {
        Ok(value)
    } else {
        Err(FactoryError::InvalidGraph(format!(
            "stage id '{value}' is invalid; expected [A-Za-z_][A-Za-z0-9_]*"
        )))
    }
}

fn id_to_string(id: &Id) -> Result<String, FactoryError> {
    match id {
        Id::Plain(value) | Id::Anonymous(value) => Ok(value.clone()),
        Id::Escaped(value) => {
            let unquoted = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .ok_or_else(|| {
                    FactoryError::InvalidGraph(format!(
                        "escaped string id '{value}' is missing quotes"
                    ))
                })?;
            Ok(unescape_dot_string(unquoted))
        }
        Id::Html(_) => Err(FactoryError::InvalidGraph(
            "HTML labels/IDs are not supported".to_string(),
        )),
    }
}

fn unescape_dot_string(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            output.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => output.push('\n'),
            Some('t') => output.push('\t'),
            Some(other) => output.push(other),
            None => output.push('\\'),
        }
    }
    output
}

fn is_valid_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

fn is_valid_attr_key(value: &str) -> bool {
    !value.is_empty()
        && value.split('.').all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
        })
}

fn has_undirected_edge_token(source: &str) -> bool {
    let mut in_string = false;
    let mut escaped = false;
    let mut previous = '\0';
    for ch in source.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            previous = ch;
            continue;
        }
        if ch == '"' {
            in_string = true;
        } else if ch == '-' && previous == '-' {
            return true;
        }
        previous = ch;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_dot_chain_edges_expected_pairwise_edges_and_nodes() {
        let graph = parse_dot(
            r#"
            digraph G {
                a [role="architect"]
                a -> b -> c
            }
            "#,
        )
        .expect("graph should parse");

        assert_eq!(graph.id, "G");
        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.edges.len(), 2);
        assert_eq!(graph.edges[1].from, "b");
        assert_eq!(graph.edges[1].to, "c");
    }

    #[test]
    fn parse_dot_typed_attributes_expected_integer_duration_and_string() {
        let graph = parse_dot(
            r#"
            digraph G {
                dev [role="developer", max_refinements=2, timeout="45s", tools="compile,lint"]
            }
            "#,
        )
        .expect("graph should parse");
        let node = graph.nodes.get("dev").expect("dev should exist");

        assert_eq!(node.attrs.get_i64("max_refinements"), Some(2));
        assert_eq!(
            node.attrs.get_duration("timeout"),
            Some(std::time::Duration::from_secs(45))
        );
        assert_eq!(node.attrs.get_list("tools"), vec!["compile", "lint"]);
    }

    #[test]
    fn parse_dot_edge_defaults_expected_inherited_by_edges() {
        let graph = parse_dot(
            r#"
            digraph G {
                edge [outcome="fail"]
                a -> b
            }
            "#,
        )
        .expect("graph should parse");
        assert_eq!(graph.edges[0].outcome_label(), "fail");
    }

    #[test]
    fn parse_dot_undirected_graph_expected_error() {
        let error = parse_dot("graph G { a -- b }").expect_err("undirected graph should fail");
        assert!(matches!(error, FactoryError::InvalidGraph(_)));
    }

    #[test]
    fn parse_dot_dash_inside_string_expected_not_treated_as_edge_token() {
        let graph = parse_dot(r#"digraph G { a [prompt="use -- carefully"] }"#)
            .expect("graph should parse");
        assert_eq!(
            graph.nodes["a"].attrs.get_str("prompt"),
            Some("use -- carefully")
        );
    }

    #[test]
    fn parse_duration_units_expected_millis() {
        assert_eq!(parse_duration("250ms").map(|d| d.millis), Some(250));
        assert_eq!(parse_duration("2m").map(|d| d.millis), Some(120_000));
        assert_eq!(parse_duration("soon"), None);
    }
}
