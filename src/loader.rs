//! Executing loading directives
//!
//! A [`LoadPlan`] is the per-model view of a directive list: which columns to select, which
//! subtype columns to join in, which to-one relationships ride along as LEFT JOINs and which
//! collections are fetched afterwards. [`fetch`] adds the projection and joins to a filtered
//! base query, decodes the rows into [`Record`]s and then runs one keyed query per collection
//! path (`... WHERE key IN (parent keys)`), so a page of N parents never costs N queries. Parent
//! keys are bound at most [`KEY_BATCH`] to a query.

use sea_query::{Expr, ExprTrait, JoinType, Order, SelectStatement, Value};
use std::collections::{HashMap, HashSet};

use crate::compile::{LoadStrategy, LoadingDirective};
use crate::error::{RepositoryError, SchemaError};
use crate::executor::{Executor, Row};
use crate::model::{ColumnDef, ModelDef, RelationDef, RelationKind};
use crate::record::{Record, Related};
use crate::sql::{build_select, col, eager_alias, iden, join_relation, select_from};
use crate::value::{is_null, key_of};

/// Label of the parent key appended to collection queries
const PARENT_KEY: &str = "__parent_key";

/// Most parent keys bound into one collection query
pub const KEY_BATCH: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct LoadPlan {
    model: &'static ModelDef,
    /// `None` selects every stored column
    columns: Option<Vec<&'static ColumnDef>>,
    subtype_columns: Vec<(&'static ModelDef, &'static ColumnDef)>,
    joined: Vec<(&'static RelationDef, LoadPlan)>,
    select_in: Vec<(&'static RelationDef, LoadPlan)>,
}

impl LoadPlan {
    /// All stored columns, no relationships
    pub fn full(model: &'static ModelDef) -> Self {
        Self {
            model,
            columns: None,
            subtype_columns: Vec::new(),
            joined: Vec::new(),
            select_in: Vec::new(),
        }
    }

    /// Fold compiled directives into a plan rooted at `model`
    pub fn from_directives(
        model: &'static ModelDef,
        directives: &[LoadingDirective],
    ) -> Result<Self, SchemaError> {
        let mut plan = Self::full(model);
        for directive in directives {
            plan.apply(directive)?;
        }
        Ok(plan)
    }

    fn apply(&mut self, directive: &LoadingDirective) -> Result<(), SchemaError> {
        if directive.model() != self.model {
            return Err(SchemaError::ForeignDirective {
                model: self.model.name.to_string(),
                directive_model: directive.model().name.to_string(),
            });
        }
        match directive {
            LoadingDirective::LoadOnly { columns, .. } => {
                let selected = self.columns.get_or_insert_with(Vec::new);
                for column in columns {
                    if !selected.contains(column) {
                        selected.push(*column);
                    }
                }
            }
            LoadingDirective::SubtypeColumn {
                subtype, column, ..
            } => {
                if !self.subtype_columns.contains(&(*subtype, *column)) {
                    self.subtype_columns.push((*subtype, *column));
                }
            }
            LoadingDirective::Eager {
                relation,
                strategy,
                children,
                ..
            } => {
                let child = LoadPlan::from_directives(relation.target(), children)?;
                let slot = match strategy {
                    LoadStrategy::Joined => &mut self.joined,
                    LoadStrategy::SelectIn => &mut self.select_in,
                };
                slot.push((*relation, child));
            }
        }
        Ok(())
    }

    pub fn model(&self) -> &'static ModelDef {
        self.model
    }

    /// Columns selected for this model, identity first
    pub fn selected_columns(&self) -> Vec<&'static ColumnDef> {
        let mut columns: Vec<&'static ColumnDef> = Vec::new();
        if let Some(pk) = self.model.primary_key_column() {
            columns.push(pk);
        }
        let requested: Vec<&'static ColumnDef> = match &self.columns {
            Some(columns) => columns.clone(),
            None => self.model.stored_columns().collect(),
        };
        for column in requested {
            if !columns.contains(&column) {
                columns.push(column);
            }
        }
        // Foreign keys of joined belongs-to relationships are needed to follow them
        for (relation, _) in self.joined.iter().chain(self.select_in.iter()) {
            if let RelationKind::BelongsTo { foreign_key } = relation.kind {
                if let Some(fk) = self.model.column(foreign_key) {
                    if !columns.contains(&fk) {
                        columns.push(fk);
                    }
                }
            }
        }
        columns
    }

    /// Whether any collection is loaded anywhere in the tree
    pub fn loads_collections(&self) -> bool {
        !self.select_in.is_empty() || self.joined.iter().any(|(_, child)| child.loads_collections())
    }

    /// Statements issued for one fetch: the root query plus one per collection path
    pub fn query_count(&self) -> usize {
        1 + self.collection_paths()
    }

    fn collection_paths(&self) -> usize {
        self.joined
            .iter()
            .map(|(_, child)| child.collection_paths())
            .chain(
                self.select_in
                    .iter()
                    .map(|(_, child)| 1 + child.collection_paths()),
            )
            .sum()
    }
}

/// Where each value of a record sits in the select list
#[derive(Debug)]
struct Projection {
    pk_index: usize,
    columns: Vec<(&'static str, usize)>,
    joined: Vec<(&'static RelationDef, Projection)>,
}

fn project(
    select: &mut SelectStatement,
    plan: &LoadPlan,
    alias: &str,
    next: &mut usize,
) -> Projection {
    let mut columns = Vec::new();
    for column in plan.selected_columns() {
        select.expr(col(alias, column.name));
        columns.push((column.name, *next));
        *next += 1;
    }

    let mut subtypes_joined: Vec<&'static str> = Vec::new();
    for (subtype, column) in &plan.subtype_columns {
        let sub_alias = format!("{alias}:{}", subtype.table);
        if !subtypes_joined.contains(&subtype.table) {
            select.join_as(
                JoinType::LeftJoin,
                iden(subtype.table),
                iden(&sub_alias),
                col(&sub_alias, subtype.primary_key).equals((iden(alias), iden(plan.model.primary_key))),
            );
            subtypes_joined.push(subtype.table);
        }
        select.expr(col(&sub_alias, column.name));
        columns.push((column.name, *next));
        *next += 1;
    }

    let mut joined = Vec::new();
    for (relation, child) in &plan.joined {
        let child_alias = eager_alias(alias, relation.name);
        join_relation(select, JoinType::LeftJoin, plan.model, alias, relation, &child_alias);
        joined.push((*relation, project(select, child, &child_alias, next)));
    }

    Projection {
        pk_index: columns.first().map_or(0, |(_, idx)| *idx),
        columns,
        joined,
    }
}

fn decode(projection: &Projection, row: &Row) -> Option<Record> {
    let pk = row.value(projection.pk_index)?;
    if is_null(pk) {
        return None;
    }
    let mut record = Record::new();
    for (name, idx) in &projection.columns {
        if let Some(value) = row.value(*idx) {
            record.set(*name, value.clone());
        }
    }
    for (relation, child) in &projection.joined {
        let related = decode(child, row).map(Box::new);
        record.set_related(relation.name, Related::One(related));
    }
    Some(record)
}

/// Load records selected by `base`
///
/// `base` must select from the plan's model aliased by its table name (see
/// [`crate::sql::select_from`]) and carry no projection of its own; filters, ordering and
/// pagination on it are kept. Rows repeated by filter joins are collapsed by identity.
pub fn fetch<E: Executor + ?Sized>(
    executor: &E,
    plan: &LoadPlan,
    base: SelectStatement,
) -> Result<Vec<Record>, RepositoryError> {
    let mut records: Vec<Record> = run(executor, plan, base, None)?
        .into_iter()
        .map(|(_, record)| record)
        .collect();
    resolve_collections(executor, &mut records, plan)?;
    Ok(records)
}

/// `fetch` that also reads `total` from each row, selected under `label`
///
/// The total comes from the same statement as the records. It is `None` when no row came back.
pub fn fetch_with_total<E: Executor + ?Sized>(
    executor: &E,
    plan: &LoadPlan,
    base: SelectStatement,
    total: Expr,
    label: &str,
) -> Result<(Vec<Record>, Option<u64>), RepositoryError> {
    let (totals, mut records): (Vec<Option<String>>, Vec<Record>) =
        run(executor, plan, base, Some((total, label)))?.into_iter().unzip();
    resolve_collections(executor, &mut records, plan)?;
    let total = totals.into_iter().flatten().find_map(|n| n.parse().ok());
    Ok((records, total))
}

/// Project, execute and decode; with `trailing` each record is paired with that expression's
/// value, and rows where it is null are dropped
fn run<E: Executor + ?Sized>(
    executor: &E,
    plan: &LoadPlan,
    mut select: SelectStatement,
    trailing: Option<(Expr, &str)>,
) -> Result<Vec<(Option<String>, Record)>, RepositoryError> {
    let mut next = 0;
    let projection = project(&mut select, plan, plan.model.table, &mut next);
    let key_index = next;
    let keyed = trailing.is_some();
    if let Some((expr, label)) = trailing {
        select.expr_as(expr, iden(label));
    }

    let (sql, values) = build_select(&select);
    let rows = executor.query(&sql, &values)?;

    let mut seen: HashSet<(Option<String>, String)> = HashSet::new();
    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        let Some(record) = decode(&projection, row) else {
            continue;
        };
        let key = if keyed {
            match row.value(key_index) {
                Some(value) if !is_null(value) => Some(key_of(value)),
                _ => continue,
            }
        } else {
            None
        };
        let identity = record.id(plan.model).map(key_of).unwrap_or_default();
        if !seen.insert((key.clone(), identity)) {
            continue;
        }
        out.push((key, record));
    }
    Ok(out)
}

fn resolve_collections<E: Executor + ?Sized>(
    executor: &E,
    records: &mut [Record],
    plan: &LoadPlan,
) -> Result<(), RepositoryError> {
    if records.is_empty() {
        return Ok(());
    }
    for (relation, child) in &plan.select_in {
        load_collection(executor, records, plan.model, relation, child)?;
    }
    for (relation, child) in &plan.joined {
        if !child.loads_collections() {
            continue;
        }
        let mut taken: Vec<(usize, Record)> = Vec::new();
        for (idx, record) in records.iter_mut().enumerate() {
            if let Some(Related::One(slot)) = record.related_mut(relation.name) {
                if let Some(nested) = slot.take() {
                    taken.push((idx, *nested));
                }
            }
        }
        let (positions, mut nested): (Vec<usize>, Vec<Record>) = taken.into_iter().unzip();
        resolve_collections(executor, &mut nested, child)?;
        for (idx, record) in positions.into_iter().zip(nested) {
            records[idx].set_related(relation.name, Related::One(Some(Box::new(record))));
        }
    }
    Ok(())
}

/// The value on the parent that collection rows are keyed by
fn parent_key<'a>(parent: &'a Record, model: &ModelDef, relation: &RelationDef) -> Option<&'a Value> {
    let column = match relation.kind {
        RelationKind::BelongsTo { foreign_key } => foreign_key,
        _ => model.primary_key,
    };
    parent.get(column).filter(|v| !is_null(v))
}

fn load_collection<E: Executor + ?Sized>(
    executor: &E,
    parents: &mut [Record],
    model: &'static ModelDef,
    relation: &'static RelationDef,
    plan: &LoadPlan,
) -> Result<(), RepositoryError> {
    let mut keys: Vec<Value> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for parent in parents.iter() {
        if let Some(key) = parent_key(parent, model, relation) {
            if seen.insert(key_of(key)) {
                keys.push(key.clone());
            }
        }
    }

    let mut grouped: HashMap<String, Vec<Record>> = HashMap::new();
    for batch in keys.chunks(KEY_BATCH) {
        let target = relation.target();
        let mut select = select_from(target);
        let key_expr = match relation.kind {
            RelationKind::HasMany { foreign_key } | RelationKind::HasOne { foreign_key } => {
                col(target.table, foreign_key)
            }
            RelationKind::BelongsTo { .. } => col(target.table, target.primary_key),
            RelationKind::ManyToMany {
                through,
                source_key,
                target_key,
            } => {
                select.join_as(
                    JoinType::InnerJoin,
                    iden(through),
                    iden(through),
                    col(through, target_key).equals((iden(target.table), iden(target.primary_key))),
                );
                col(through, source_key)
            }
        };
        select
            .and_where(key_expr.clone().is_in(batch.iter().cloned()))
            .order_by((iden(target.table), iden(target.primary_key)), Order::Asc);

        for (key, record) in fetch_with_parent_key(executor, plan, select, key_expr)? {
            grouped.entry(key).or_default().push(record);
        }
    }

    for parent in parents.iter_mut() {
        let children = parent_key(parent, model, relation)
            .map(key_of)
            .and_then(|key| grouped.get(&key).cloned())
            .unwrap_or_default();
        let related = if relation.is_to_many() {
            Related::Many(children)
        } else {
            Related::One(children.into_iter().next().map(Box::new))
        };
        parent.set_related(relation.name, related);
    }
    Ok(())
}

/// Run a collection query whose select list ends with the parent key
fn fetch_with_parent_key<E: Executor + ?Sized>(
    executor: &E,
    plan: &LoadPlan,
    select: SelectStatement,
    key_expr: Expr,
) -> Result<Vec<(String, Record)>, RepositoryError> {
    let (keys, mut records): (Vec<Option<String>>, Vec<Record>) =
        run(executor, plan, select, Some((key_expr, PARENT_KEY)))?.into_iter().unzip();
    resolve_collections(executor, &mut records, plan)?;
    Ok(keys
        .into_iter()
        .zip(records)
        .filter_map(|(key, record)| key.map(|key| (key, record)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::compile;
    use crate::config::UnknownFieldPolicy;
    use crate::plan;
    use crate::schema::{match_model, player, statistic};
    use crate::shape::FieldGraph;
    use crate::testing::MockSession;
    use uuid::Uuid;

    fn plan_for(model: &'static ModelDef, paths: &[&str]) -> LoadPlan {
        let mut graph = FieldGraph::new();
        for path in paths {
            graph.add_path(path).expect("consistent paths");
        }
        let query_plan = plan::build(&graph, model, UnknownFieldPolicy::Skip).expect("plan");
        let directives = compile(&query_plan).expect("compiles");
        LoadPlan::from_directives(model, &directives).expect("load plan")
    }

    #[test]
    fn test_identity_always_selected() {
        let plan = plan_for(player(), &["name"]);
        let names: Vec<_> = plan.selected_columns().iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["id", "name"]);
        assert_eq!(plan.query_count(), 1);

        let full = LoadPlan::full(match_model());
        assert_eq!(full.selected_columns().len(), match_model().stored_columns().count());
    }

    #[test]
    fn test_collections_load_with_one_query_per_path() {
        let plan = plan_for(player(), &["name", "matches.opponent"]);
        assert!(plan.loads_collections());
        assert_eq!(plan.query_count(), 2);

        let (ana, ben) = (Uuid::new_v4(), Uuid::new_v4());
        let (home, away) = (Uuid::new_v4(), Uuid::new_v4());
        let session = MockSession::new();
        session.push_rows(vec![
            Row::from_pairs([("id", Value::from(ana)), ("name", Value::from("Ana"))]),
            Row::from_pairs([("id", Value::from(ben)), ("name", Value::from("Ben"))]),
        ]);
        session.push_rows(vec![
            Row::from_pairs([
                ("id", Value::from(home)),
                ("opponent", Value::from("Rivers")),
                ("__parent_key", Value::from(ana)),
            ]),
            Row::from_pairs([
                ("id", Value::from(away)),
                ("opponent", Value::from("Harbour")),
                ("__parent_key", Value::from(ana)),
            ]),
        ]);

        let records = fetch(&session, &plan, select_from(player())).expect("fetch");
        assert_eq!(records.len(), 2);
        match records[0].related("matches") {
            Some(Related::Many(matches)) => {
                assert_eq!(matches.len(), 2);
                assert_eq!(matches[0].get("opponent"), Some(&Value::from("Rivers")));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(records[1].related("matches"), Some(&Related::Many(vec![])));

        let sql = session.sql();
        assert_eq!(sql.len(), 2);
        assert!(sql[1].contains(r#"INNER JOIN "match_squads" AS "match_squads""#), "{}", sql[1]);
        assert!(sql[1].contains(r#""match_squads"."player_id" IN ($1, $2)"#), "{}", sql[1]);
        assert!(sql[1].contains(r#"AS "__parent_key""#), "{}", sql[1]);
    }

    #[test]
    fn test_joined_to_one_with_missing_target() {
        let plan = plan_for(statistic(), &["goals", "player.name"]);
        assert_eq!(plan.query_count(), 1);

        let (stat, player_id) = (Uuid::new_v4(), Uuid::new_v4());
        let session = MockSession::new();
        // statistics.id, statistics.goals, statistics.player_id, player.id, player.name
        session.push_rows(vec![
            Row::new(
                vec![],
                vec![
                    Value::from(stat),
                    Value::from(2i32),
                    Value::from(player_id),
                    Value::from(player_id),
                    Value::from("Ana"),
                ],
            ),
            Row::new(
                vec![],
                vec![
                    Value::from(Uuid::new_v4()),
                    Value::from(0i32),
                    Value::from(None::<Uuid>),
                    Value::from(None::<Uuid>),
                    Value::from(None::<String>),
                ],
            ),
        ]);

        let records = fetch(&session, &plan, select_from(statistic())).expect("fetch");
        assert_eq!(records.len(), 2);
        match records[0].related("player") {
            Some(Related::One(Some(player))) => {
                assert_eq!(player.get("name"), Some(&Value::from("Ana")))
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(records[1].related("player"), Some(&Related::One(None)));

        let sql = &session.sql()[0];
        assert!(sql.contains(r#"LEFT JOIN "players" AS "statistics.player""#), "{sql}");
    }

    #[test]
    fn test_duplicate_rows_collapse() {
        let plan = LoadPlan::from_directives(
            match_model(),
            &compile(&plan::QueryPlan {
                model: match_model(),
                nodes: vec![plan::PlanNode::ColumnsOnly {
                    model: match_model(),
                    columns: vec!["opponent".into()],
                }],
            })
            .expect("compiles"),
        )
        .expect("load plan");
        let id = Uuid::new_v4();
        let row = Row::from_pairs([("id", Value::from(id)), ("opponent", Value::from("Rivers"))]);
        let session = MockSession::new();
        session.push_rows(vec![row.clone(), row]);

        let records = fetch(&session, &plan, select_from(match_model())).expect("fetch");
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_collection_keys_are_batched() {
        let plan = plan_for(player(), &["name", "matches.opponent"]);
        let parents: Vec<Row> = (0..KEY_BATCH + 1)
            .map(|n| {
                Row::from_pairs([
                    ("id", Value::from(Uuid::new_v4())),
                    ("name", Value::from(format!("Player {n}"))),
                ])
            })
            .collect();
        let session = MockSession::new();
        session.push_rows(parents);

        let records = fetch(&session, &plan, select_from(player())).expect("fetch");
        assert_eq!(records.len(), KEY_BATCH + 1);

        let captured = session.captured();
        assert_eq!(captured.len(), 3);
        assert_eq!(captured[1].values.0.len(), KEY_BATCH);
        assert_eq!(captured[2].values.0.len(), 1);
        assert!(records
            .iter()
            .all(|r| r.related("matches") == Some(&Related::Many(vec![]))));
    }

    #[test]
    fn test_total_is_read_from_the_page_rows() {
        let plan = plan_for(match_model(), &["opponent"]);
        let id = Uuid::new_v4();
        let session = MockSession::new();
        session.push_rows(vec![Row::from_pairs([
            ("id", Value::from(id)),
            ("opponent", Value::from("Rivers")),
            ("__total", Value::from(12i64)),
        ])]);

        let (records, total) = fetch_with_total(
            &session,
            &plan,
            select_from(match_model()),
            Expr::cust("COUNT(*) OVER ()"),
            "__total",
        )
        .expect("fetch");
        assert_eq!(records.len(), 1);
        assert_eq!(total, Some(12));
        assert!(session.sql()[0].contains(r#"COUNT(*) OVER () AS "__total""#));

        let empty = MockSession::new();
        let (records, total) = fetch_with_total(
            &empty,
            &plan,
            select_from(match_model()),
            Expr::cust("COUNT(*) OVER ()"),
            "__total",
        )
        .expect("fetch");
        assert!(records.is_empty());
        assert_eq!(total, None);
    }

    #[test]
    fn test_foreign_directive_rejected() {
        let directives = compile(&plan::QueryPlan {
            model: match_model(),
            nodes: vec![plan::PlanNode::ColumnsOnly {
                model: match_model(),
                columns: vec!["opponent".into()],
            }],
        })
        .expect("compiles");
        assert!(matches!(
            LoadPlan::from_directives(player(), &directives),
            Err(SchemaError::ForeignDirective { .. })
        ));
    }
}
