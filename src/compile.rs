//! Plan compilation into loading directives
//!
//! Resolves every plan node against the model's column and relationship descriptors. Scalar
//! names that are not stored columns fail; when a rejected name turns out to be a computed
//! attribute the error says so ([`SchemaError::NotAColumnField`]) instead of the generic
//! [`SchemaError::InvalidColumnReference`].

use crate::error::SchemaError;
use crate::model::{ColumnDef, ModelDef, RelationDef};
use crate::plan::{PlanNode, QueryPlan};

/// How a relationship is fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStrategy {
    /// LEFT JOIN in the parent query
    Joined,
    /// One follow-up query per relationship path, keyed on the parents' identities
    SelectIn,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadingDirective {
    LoadOnly {
        model: &'static ModelDef,
        columns: Vec<&'static ColumnDef>,
    },
    Eager {
        model: &'static ModelDef,
        relation: &'static RelationDef,
        strategy: LoadStrategy,
        children: Vec<LoadingDirective>,
    },
    SubtypeColumn {
        model: &'static ModelDef,
        subtype: &'static ModelDef,
        column: &'static ColumnDef,
    },
}

impl LoadingDirective {
    pub fn model(&self) -> &'static ModelDef {
        match self {
            LoadingDirective::LoadOnly { model, .. }
            | LoadingDirective::Eager { model, .. }
            | LoadingDirective::SubtypeColumn { model, .. } => model,
        }
    }
}

/// To-one relationships are joined; collections are fetched with a keyed follow-up query
pub fn strategy_for(relation: &RelationDef) -> LoadStrategy {
    if relation.is_to_many() {
        LoadStrategy::SelectIn
    } else {
        LoadStrategy::Joined
    }
}

pub fn compile(plan: &QueryPlan) -> Result<Vec<LoadingDirective>, SchemaError> {
    compile_nodes(&plan.nodes)
}

fn compile_nodes(nodes: &[PlanNode]) -> Result<Vec<LoadingDirective>, SchemaError> {
    nodes.iter().map(compile_node).collect()
}

fn compile_node(node: &PlanNode) -> Result<LoadingDirective, SchemaError> {
    match node {
        PlanNode::ColumnsOnly { model, columns } => load_only(model, columns),
        PlanNode::RelationshipLoad {
            model,
            relationship,
            children,
        } => {
            let relation =
                model
                    .relation(relationship)
                    .ok_or_else(|| SchemaError::RelationshipNotFound {
                        model: model.name.to_string(),
                        relationship: relationship.clone(),
                    })?;
            Ok(LoadingDirective::Eager {
                model,
                relation,
                strategy: strategy_for(relation),
                children: compile_nodes(children)?,
            })
        }
        PlanNode::InheritedLoad {
            model,
            subtype,
            field,
        } => {
            let column = subtype
                .column(field)
                .filter(|c| c.is_stored())
                .ok_or_else(|| SchemaError::InvalidColumnReference {
                    model: subtype.name.to_string(),
                    column: field.clone(),
                })?;
            Ok(LoadingDirective::SubtypeColumn {
                model,
                subtype,
                column,
            })
        }
    }
}

fn load_only(
    model: &'static ModelDef,
    columns: &[String],
) -> Result<LoadingDirective, SchemaError> {
    let mut resolved = Vec::with_capacity(columns.len());
    for name in columns {
        match model.column(name) {
            Some(column) if column.is_stored() => resolved.push(column),
            _ => {
                return Err(diagnose(
                    model,
                    columns,
                    SchemaError::InvalidColumnReference {
                        model: model.name.to_string(),
                        column: name.clone(),
                    },
                ))
            }
        }
    }
    Ok(LoadingDirective::LoadOnly {
        model,
        columns: resolved,
    })
}

/// Name the computed attribute behind a rejected projection, if there is one
fn diagnose(model: &ModelDef, columns: &[String], original: SchemaError) -> SchemaError {
    columns
        .iter()
        .find(|name| model.column(name).is_some_and(|c| !c.is_stored()))
        .map(|name| SchemaError::NotAColumnField {
            model: model.name.to_string(),
            field: name.clone(),
        })
        .unwrap_or(original)
}
