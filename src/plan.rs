//! Query plans
//!
//! A [`QueryPlan`] is the field graph resolved against a model: scalar names become a
//! [`PlanNode::ColumnsOnly`] node, relationship names become [`PlanNode::RelationshipLoad`]
//! nodes (recursing into the target model for nested graphs) and names that only a subtype
//! declares become [`PlanNode::InheritedLoad`] nodes. Names the model does not know are handled
//! per [`UnknownFieldPolicy`].

use crate::config::UnknownFieldPolicy;
use crate::error::SchemaError;
use crate::model::ModelDef;
use crate::shape::FieldGraph;

#[derive(Debug, Clone, PartialEq)]
pub enum PlanNode {
    /// Restrict the model's projection to these scalar names
    ColumnsOnly {
        model: &'static ModelDef,
        columns: Vec<String>,
    },
    /// Eagerly load a relationship; `children` apply to the related model
    RelationshipLoad {
        model: &'static ModelDef,
        relationship: String,
        children: Vec<PlanNode>,
    },
    /// Load a column stored on one of the model's subtypes
    InheritedLoad {
        model: &'static ModelDef,
        subtype: &'static ModelDef,
        field: String,
    },
}

impl PlanNode {
    pub fn model(&self) -> &'static ModelDef {
        match self {
            PlanNode::ColumnsOnly { model, .. }
            | PlanNode::RelationshipLoad { model, .. }
            | PlanNode::InheritedLoad { model, .. } => model,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub model: &'static ModelDef,
    pub nodes: Vec<PlanNode>,
}

impl QueryPlan {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

pub struct PlanBuilder {
    policy: UnknownFieldPolicy,
}

impl Default for PlanBuilder {
    fn default() -> Self {
        Self::new(UnknownFieldPolicy::default())
    }
}

impl PlanBuilder {
    pub fn new(policy: UnknownFieldPolicy) -> Self {
        Self { policy }
    }

    /// Resolve `graph` against `model`
    ///
    /// Node order per level: the columns node first, then flat relationship and inherited
    /// nodes in request order, then nested relationship nodes.
    pub fn build(&self, graph: &FieldGraph, model: &'static ModelDef) -> Result<QueryPlan, SchemaError> {
        Ok(QueryPlan {
            model,
            nodes: self.build_level(graph, model)?,
        })
    }

    fn build_level(
        &self,
        graph: &FieldGraph,
        model: &'static ModelDef,
    ) -> Result<Vec<PlanNode>, SchemaError> {
        let mut columns = Vec::new();
        let mut flat = Vec::new();

        for name in graph.columns() {
            if model.relation(name).is_some() {
                flat.push(PlanNode::RelationshipLoad {
                    model,
                    relationship: name.clone(),
                    children: Vec::new(),
                });
            } else if let Some(column) = model.column(name) {
                if column.is_stored() {
                    columns.push(name.clone());
                } else {
                    log::debug!("skipping `{name}`: computed on {}, not loaded", model.name);
                }
            } else if let Some((subtype, _)) = model.find_in_subtypes(name)? {
                flat.push(PlanNode::InheritedLoad {
                    model,
                    subtype,
                    field: name.clone(),
                });
            } else {
                match self.policy {
                    UnknownFieldPolicy::Skip => log::debug!(
                        "skipping `{name}`: not a column, relationship or subtype field of {}",
                        model.name
                    ),
                    UnknownFieldPolicy::Reject => {
                        return Err(SchemaError::UnknownField {
                            model: model.name.to_string(),
                            field: name.clone(),
                        })
                    }
                }
            }
        }

        let mut nodes = Vec::with_capacity(1 + flat.len() + graph.relationships().len());
        if !columns.is_empty() {
            nodes.push(PlanNode::ColumnsOnly { model, columns });
        }
        nodes.extend(flat);

        for (name, child) in graph.relationships() {
            let relation = model
                .relation(name)
                .ok_or_else(|| SchemaError::RelationshipNotFound {
                    model: model.name.to_string(),
                    relationship: name.clone(),
                })?;
            nodes.push(PlanNode::RelationshipLoad {
                model,
                relationship: name.clone(),
                children: self.build_level(child, relation.target())?,
            });
        }

        Ok(nodes)
    }
}

/// Build a plan with the given policy
pub fn build(
    graph: &FieldGraph,
    model: &'static ModelDef,
    policy: UnknownFieldPolicy,
) -> Result<QueryPlan, SchemaError> {
    PlanBuilder::new(policy).build(graph, model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{match_model, player};

    fn graph(paths: &[&str]) -> FieldGraph {
        let mut graph = FieldGraph::new();
        for path in paths {
            graph.add_path(path).expect("consistent paths");
        }
        graph
    }

    #[test]
    fn test_columns_then_flat_then_nested() {
        let plan = build(
            &graph(&["name", "statistics", "email", "matches.opponent"]),
            player(),
            UnknownFieldPolicy::Skip,
        )
        .expect("plan builds");

        assert_eq!(plan.nodes.len(), 3);
        assert_eq!(
            plan.nodes[0],
            PlanNode::ColumnsOnly {
                model: player(),
                columns: vec!["name".into(), "email".into()],
            }
        );
        assert!(matches!(
            &plan.nodes[1],
            PlanNode::RelationshipLoad { relationship, children, .. }
                if relationship == "statistics" && children.is_empty()
        ));
        match &plan.nodes[2] {
            PlanNode::RelationshipLoad {
                relationship,
                children,
                ..
            } => {
                assert_eq!(relationship, "matches");
                assert_eq!(
                    children,
                    &vec![PlanNode::ColumnsOnly {
                        model: match_model(),
                        columns: vec!["opponent".into()],
                    }]
                );
            }
            other => panic!("unexpected node {other:?}"),
        }
    }

    #[test]
    fn test_inherited_field() {
        let plan = build(&graph(&["clean_sheets"]), player(), UnknownFieldPolicy::Skip)
            .expect("plan builds");
        assert!(matches!(
            &plan.nodes[0],
            PlanNode::InheritedLoad { subtype, field, .. }
                if subtype.table == "goalkeepers" && field == "clean_sheets"
        ));
    }

    #[test]
    fn test_unknown_field_policies() {
        let skipped = build(&graph(&["name", "nickname"]), player(), UnknownFieldPolicy::Skip)
            .expect("unknown names are skipped");
        assert_eq!(skipped.nodes.len(), 1);

        let err = build(&graph(&["nickname"]), player(), UnknownFieldPolicy::Reject).unwrap_err();
        assert_eq!(
            err,
            SchemaError::UnknownField {
                model: "Player".into(),
                field: "nickname".into()
            }
        );
    }

    #[test]
    fn test_computed_fields_are_skipped() {
        let requested = graph(&["name", "full_name"]);
        for policy in [UnknownFieldPolicy::Skip, UnknownFieldPolicy::Reject] {
            let plan = build(&requested, player(), policy).expect("computed fields are tolerated");
            assert_eq!(
                plan.nodes,
                vec![PlanNode::ColumnsOnly {
                    model: player(),
                    columns: vec!["name".into()],
                }]
            );
        }
    }

    #[test]
    fn test_unknown_nested_key_is_an_error() {
        let err = build(&graph(&["coach.name"]), player(), UnknownFieldPolicy::Skip).unwrap_err();
        assert!(matches!(
            err,
            SchemaError::RelationshipNotFound { relationship, .. } if relationship == "coach"
        ));
    }

    #[test]
    fn test_empty_graph_gives_empty_plan() {
        let plan = build(&FieldGraph::new(), player(), UnknownFieldPolicy::Reject).expect("plan");
        assert!(plan.is_empty());
    }
}
