//! Write operations
//!
//! Every public write runs inside [`Repository::in_write`]: the operation's statements run on
//! the session, then the session commits. On any failure the session is rolled back first and
//! the error is translated afterwards, so a caller never sees a half-applied write.

use chrono::Utc;
use sea_query::{
    Expr, ExprTrait, InsertStatement, OnConflict as ConflictClause, PostgresQueryBuilder, Query, Value,
};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeSet;

use super::{normalize, translate_error, Repository};
use crate::error::{RepositoryError, Result};
use crate::executor::Row;
use crate::filter::FilterSpec;
use crate::loader::{fetch, LoadPlan};
use crate::model::{ColumnDef, ModelDef, RelationDef, RelationKind};
use crate::record::{Record, Related};
use crate::session::Session;
use crate::sql::{col, iden, select_from};
use crate::value::{array_elements, is_null, key_of, to_json};

/// Conflict handling for [`Repository::bulk_create`]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OnConflict {
    /// Conflicts fail the whole batch
    #[default]
    Fail,
    /// Skip conflicting rows; an empty target matches any constraint
    DoNothing { target: Vec<String> },
    /// Overwrite `update` columns of the conflicting rows; an empty `update` overwrites every
    /// inserted column outside the target
    DoUpdate { target: Vec<String>, update: Vec<String> },
}

type ColumnValues = Vec<(&'static ColumnDef, Value)>;

/// A record split by where each part is stored
struct WriteInput {
    columns: ColumnValues,
    subtypes: Vec<(&'static ModelDef, ColumnValues)>,
    relations: Vec<(&'static RelationDef, Related)>,
}

impl WriteInput {
    fn is_flat(&self) -> bool {
        self.subtypes.is_empty() && self.relations.is_empty()
    }
}

/// Columns and link rows ready to insert
struct Prepared {
    columns: ColumnValues,
    subtypes: Vec<(&'static ModelDef, ColumnValues)>,
    links: Vec<(&'static RelationDef, Vec<Record>)>,
}

impl<'s, S: Session + ?Sized> Repository<'s, S> {
    /// Run `op`, then commit; on failure roll back and translate the error
    pub(crate) fn in_write<T>(&self, op: impl FnOnce() -> Result<T>) -> Result<T> {
        match op() {
            Ok(out) => {
                self.session
                    .commit()
                    .map_err(|e| translate_error(self.model, e.into()))?;
                Ok(out)
            }
            Err(err) => {
                if let Err(rollback) = self.session.rollback() {
                    log::warn!("rollback after failed {} write failed: {rollback}", self.model.name);
                }
                Err(translate_error(self.model, err))
            }
        }
    }

    /// Insert one entity with its subtype columns and many-to-many links
    ///
    /// Many-to-many entries are given as identities or records carrying one; each must already
    /// exist, or the write fails with [`RepositoryError::ReferencedEntityMissing`]. Belongs-to
    /// entries set the foreign key.
    pub fn save(&self, record: Record) -> Result<Record> {
        self.in_write(|| self.insert_one(&record))
    }

    /// `save` for several records in one transaction
    pub fn save_many(&self, records: Vec<Record>) -> Result<Vec<Record>> {
        self.in_write(|| records.iter().map(|record| self.insert_one(record)).collect())
    }

    /// Insert flat records in one statement
    ///
    /// Records may only carry the model's own columns. Columns missing from some records are
    /// filled with their defaults. An empty batch is a no-op.
    pub fn bulk_create(&self, records: Vec<Record>, on_conflict: OnConflict) -> Result<Vec<Record>> {
        if records.is_empty() {
            log::warn!("bulk_create called with no {} records", self.model.name);
            return Ok(Vec::new());
        }
        self.in_write(|| {
            let rows = records
                .iter()
                .map(|record| {
                    let input = split(self.model, record)?;
                    if !input.is_flat() {
                        return Err(RepositoryError::InvalidInput(format!(
                            "bulk_create only writes {} columns",
                            self.model.name
                        )));
                    }
                    Ok(input.columns)
                })
                .collect::<Result<Vec<_>>>()?;

            let insert = insert_statement(self.model, &rows, &on_conflict)?;
            let (sql, values) = insert.build(PostgresQueryBuilder);
            let rows = self.session.query(&sql, &values)?;
            log::debug!("bulk_create: {} of {} {} rows written", rows.len(), records.len(), self.model.name);
            Ok(rows.iter().map(|row| record_from_row(self.model, row)).collect())
        })
    }

    /// Insert, or overwrite the entity with the same identity
    ///
    /// Many-to-many entries replace the existing links.
    pub fn upsert(&self, record: Record) -> Result<Record> {
        self.in_write(|| {
            let prepared = self.prepare(&record)?;
            let pk = self.model.primary_key;
            if !prepared.columns.iter().any(|(c, v)| c.name == pk && !is_null(v)) {
                return Err(RepositoryError::InvalidInput(format!(
                    "upsert of {} needs `{pk}`",
                    self.model.name
                )));
            }
            let mut update: Vec<String> = prepared
                .columns
                .iter()
                .filter(|(c, _)| c.name != pk)
                .map(|(c, _)| c.name.to_string())
                .collect();
            if update.is_empty() {
                update.push(pk.to_string());
            }
            let conflict = OnConflict::DoUpdate {
                target: vec![pk.to_string()],
                update,
            };
            let insert = insert_statement(self.model, &[prepared.columns], &conflict)?;
            let mut saved = self.returning_one(insert)?;
            let id = self.identity_of(&saved)?;

            for (subtype, columns) in &prepared.subtypes {
                saved.merge(self.write_subtype(subtype, &id, columns)?);
            }
            for (relation, targets) in prepared.links {
                self.replace_links(relation, &id, &targets)?;
                saved.set_related(relation.name, Related::Many(targets));
            }
            Ok(saved)
        })
    }

    /// Merge `partial` into the stored entity
    ///
    /// Only columns whose value differs are written. Nested records under belongs-to and
    /// has-one relationships are merged into the related entity; many-to-many entries replace
    /// the links. When the model has a tracking column, the time of each change is recorded
    /// there under the field's name.
    pub fn update(&self, id: impl Into<Value>, partial: Record) -> Result<Record> {
        let id = id.into();
        self.in_write(|| {
            let current = self.load_current(self.model, &id)?;
            self.merge_into(self.model, current, &partial)
        })
    }

    /// Set `values` on every entity matching `filter` (all entities when `None`)
    pub fn bulk_update(&self, values: Record, filter: Option<&FilterSpec>) -> Result<u64> {
        self.in_write(|| {
            let input = split(self.model, &values)?;
            if !input.is_flat() || input.columns.is_empty() {
                return Err(RepositoryError::InvalidInput(format!(
                    "bulk_update needs {} columns and nothing else",
                    self.model.name
                )));
            }
            if input.columns.iter().any(|(c, _)| c.name == self.model.primary_key) {
                return Err(RepositoryError::InvalidInput("identity cannot be bulk updated".into()));
            }

            let mut update = Query::update();
            update.table(iden(self.model.table));
            for (column, value) in &input.columns {
                update.value(iden(column.name), value_expr(column, value));
            }
            if let Some(spec) = filter.filter(|spec| !spec.is_empty()) {
                update.and_where(
                    col(self.model.table, self.model.primary_key).in_subquery(self.id_subquery(spec)?),
                );
            }
            let (sql, values) = update.build(PostgresQueryBuilder);
            Ok(self.session.execute(&sql, &values)?)
        })
    }

    /// Delete one entity, returning how many rows went; an absent identity deletes nothing
    pub fn delete(&self, id: impl Into<Value>) -> Result<u64> {
        let id = id.into();
        self.in_write(|| {
            let id = self.normalize_id(self.model, &id)?;
            let deleted = self.delete_where(col(self.model.table, self.model.primary_key).eq(id.clone()))?;
            if deleted == 0 {
                log::debug!("delete: no {} with id {}", self.model.name, key_of(&id));
            }
            Ok(deleted)
        })
    }

    /// Delete the entities with the given identities, returning how many went
    pub fn delete_many<I, V>(&self, ids: I) -> Result<u64>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let ids: Vec<Value> = ids.into_iter().map(Into::into).collect();
        if ids.is_empty() {
            return Ok(0);
        }
        self.in_write(|| {
            let ids = ids
                .iter()
                .map(|id| self.normalize_id(self.model, id))
                .collect::<Result<Vec<_>>>()?;
            self.delete_where(col(self.model.table, self.model.primary_key).is_in(ids))
        })
    }

    /// Delete every entity matching `filter`
    ///
    /// A filter without criteria is rejected rather than emptying the table.
    pub fn delete_by_filter(&self, filter: &FilterSpec) -> Result<u64> {
        if filter.is_empty() {
            return Err(RepositoryError::InvalidInput(format!(
                "refusing to delete every {} without criteria",
                self.model.name
            )));
        }
        self.in_write(|| {
            let ids = self.id_subquery(filter)?;
            self.delete_where(col(self.model.table, self.model.primary_key).in_subquery(ids))
        })
    }

    fn delete_where(&self, condition: Expr) -> Result<u64> {
        let mut delete = Query::delete();
        delete.from_table(iden(self.model.table)).and_where(condition);
        let (sql, values) = delete.build(PostgresQueryBuilder);
        Ok(self.session.execute(&sql, &values)?)
    }

    fn insert_one(&self, record: &Record) -> Result<Record> {
        let prepared = self.prepare(record)?;
        let insert = insert_statement(self.model, &[prepared.columns], &OnConflict::Fail)?;
        let mut saved = self.returning_one(insert)?;
        let id = self.identity_of(&saved)?;

        for (subtype, columns) in &prepared.subtypes {
            saved.merge(self.write_subtype(subtype, &id, columns)?);
        }
        for (relation, targets) in prepared.links {
            self.link(relation, &id, &targets)?;
            saved.set_related(relation.name, Related::Many(targets));
        }
        Ok(saved)
    }

    /// Split a record and resolve its relationship entries
    fn prepare(&self, record: &Record) -> Result<Prepared> {
        let input = split(self.model, record)?;
        let mut columns = input.columns;
        let mut links = Vec::new();
        for (relation, related) in &input.relations {
            match relation.kind {
                RelationKind::BelongsTo { foreign_key } => {
                    let fk = self.foreign_key_column(self.model, foreign_key)?;
                    let id = single_id(relation, related, fk)?;
                    set_column(&mut columns, fk, normalize(fk, &id)?);
                }
                RelationKind::ManyToMany { .. } => {
                    let ids = related_ids(relation, related)?;
                    links.push((*relation, self.resolve_ids(relation, &ids)?));
                }
                RelationKind::HasOne { .. } | RelationKind::HasMany { .. } => {
                    return Err(unwritable(self.model, relation));
                }
            }
        }
        Ok(Prepared {
            columns,
            subtypes: input.subtypes,
            links,
        })
    }

    fn merge_into(&self, model: &'static ModelDef, current: Record, partial: &Record) -> Result<Record> {
        let id = current
            .id(model)
            .cloned()
            .ok_or_else(|| RepositoryError::InvalidInput(format!("{} has no identity", model.name)))?;
        let input = split(model, partial)?;

        let mut changes: ColumnValues = Vec::new();
        let mut changed: Vec<String> = Vec::new();
        for (column, value) in input.columns {
            if column.name == model.primary_key {
                if key_of(&value) != key_of(&id) {
                    return Err(RepositoryError::InvalidInput(format!(
                        "{} identity cannot change",
                        model.name
                    )));
                }
                continue;
            }
            if current.get(column.name).map(to_json) != Some(to_json(&value)) {
                changed.push(column.name.to_string());
                changes.push((column, value));
            }
        }

        let mut merged: Vec<(&'static str, Related)> = Vec::new();
        for (relation, related) in input.relations {
            match (relation.kind, related) {
                (RelationKind::BelongsTo { foreign_key }, Related::One(Some(nested)))
                    if nested.id(relation.target()).is_none() =>
                {
                    let target = relation.target();
                    let fk = current
                        .get(foreign_key)
                        .filter(|v| !is_null(v))
                        .ok_or_else(|| {
                            RepositoryError::InvalidInput(format!(
                                "{} has no {} to update",
                                model.name, relation.name
                            ))
                        })?;
                    let related_current = self.load_current(target, fk)?;
                    let updated = self.merge_into(target, related_current, &nested)?;
                    merged.push((relation.name, Related::One(Some(Box::new(updated)))));
                }
                (RelationKind::BelongsTo { foreign_key }, related) => {
                    let fk = self.foreign_key_column(model, foreign_key)?;
                    let value = normalize(fk, &single_id(relation, &related, fk)?)?;
                    if current.get(foreign_key).map(to_json) != Some(to_json(&value)) {
                        changed.push(foreign_key.to_string());
                        changes.push((fk, value));
                    }
                }
                (RelationKind::HasOne { foreign_key }, Related::One(Some(nested))) => {
                    let target = relation.target();
                    let related_current = self.load_by(target, foreign_key, &id)?.ok_or_else(|| {
                        RepositoryError::InvalidInput(format!(
                            "{} has no {} to update",
                            model.name, relation.name
                        ))
                    })?;
                    let updated = self.merge_into(target, related_current, &nested)?;
                    merged.push((relation.name, Related::One(Some(Box::new(updated)))));
                }
                (RelationKind::ManyToMany { .. }, related) => {
                    let ids = related_ids(relation, &related)?;
                    let targets = self.resolve_ids(relation, &ids)?;
                    self.replace_links(relation, &id, &targets)?;
                    changed.push(relation.name.to_string());
                    merged.push((relation.name, Related::Many(targets)));
                }
                _ => return Err(unwritable(model, relation)),
            }
        }

        let mut subtype_values = Record::new();
        for (subtype, columns) in &input.subtypes {
            changed.extend(columns.iter().map(|(c, _)| c.name.to_string()));
            subtype_values.merge(self.write_subtype(subtype, &id, columns)?);
        }

        if let Some(tracking) = model.tracking_column.and_then(|name| model.column(name)) {
            if !changed.is_empty() && !changes.iter().any(|(c, _)| c.name == tracking.name) {
                let mut stamps = match current.get(tracking.name).map(to_json) {
                    Some(JsonValue::Object(map)) => map,
                    _ => Map::new(),
                };
                let now = Utc::now().to_rfc3339();
                for field in &changed {
                    stamps.insert(field.clone(), JsonValue::String(now.clone()));
                }
                changes.push((tracking, Value::from(JsonValue::Object(stamps))));
            }
        }

        let mut updated = if changes.is_empty() {
            current
        } else {
            let mut update = Query::update();
            update.table(iden(model.table));
            for (column, value) in &changes {
                update.value(iden(column.name), value_expr(column, value));
            }
            update
                .and_where(col(model.table, model.primary_key).eq(id.clone()))
                .returning_all();
            let (sql, values) = update.build(PostgresQueryBuilder);
            let row = self.session.query_one(&sql, &values)?.ok_or_else(|| RepositoryError::NotFound {
                entity: model.name.to_string(),
                id: key_of(&id),
            })?;
            let mut updated = record_from_row(model, &row);
            for (name, related) in current.relations() {
                updated.set_related(name.to_string(), related.clone());
            }
            updated
        };

        updated.merge(subtype_values);
        for (name, related) in merged {
            updated.set_related(name, related);
        }
        log::debug!("updated {} {}: {changed:?}", model.name, key_of(&id));
        Ok(updated)
    }

    fn load_current(&self, model: &'static ModelDef, id: &Value) -> Result<Record> {
        let id = self.normalize_id(model, id)?;
        self.load_by(model, model.primary_key, &id)?
            .ok_or_else(|| RepositoryError::NotFound {
                entity: model.name.to_string(),
                id: key_of(&id),
            })
    }

    fn load_by(&self, model: &'static ModelDef, field: &str, value: &Value) -> Result<Option<Record>> {
        let mut select = select_from(model);
        select.and_where(col(model.table, field).eq(value.clone()));
        Ok(fetch(self.session, &LoadPlan::full(model), select)?.into_iter().next())
    }

    /// Load the targets of a many-to-many entry, failing on any identity that does not exist
    fn resolve_ids(&self, relation: &'static RelationDef, ids: &[Value]) -> Result<Vec<Record>> {
        let target = relation.target();
        let ids = ids
            .iter()
            .map(|id| self.normalize_id(target, id))
            .collect::<Result<Vec<_>>>()?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut select = select_from(target);
        select.and_where(col(target.table, target.primary_key).is_in(ids.iter().cloned()));
        let found = fetch(self.session, &LoadPlan::full(target), select)?;

        let present: BTreeSet<String> = found.iter().filter_map(|r| r.id(target)).map(key_of).collect();
        let missing: BTreeSet<String> = ids.iter().map(key_of).filter(|k| !present.contains(k)).collect();
        if !missing.is_empty() {
            return Err(RepositoryError::ReferencedEntityMissing {
                relationship: relation.name.to_string(),
                missing: missing.into_iter().collect(),
            });
        }
        Ok(found)
    }

    fn link(&self, relation: &RelationDef, id: &Value, targets: &[Record]) -> Result<()> {
        let RelationKind::ManyToMany {
            through,
            source_key,
            target_key,
        } = relation.kind
        else {
            return Err(unwritable(self.model, relation));
        };
        if targets.is_empty() {
            return Ok(());
        }
        let target = relation.target();
        let mut insert = Query::insert();
        insert
            .into_table(iden(through))
            .columns([iden(source_key), iden(target_key)]);
        for record in targets {
            let target_id = self.identity_of_model(target, record)?;
            insert
                .values([Expr::val(id.clone()), Expr::val(target_id)])
                .map_err(|e| RepositoryError::InvalidInput(e.to_string()))?;
        }
        insert.on_conflict(ConflictClause::new().do_nothing().to_owned());
        let (sql, values) = insert.build(PostgresQueryBuilder);
        self.session.execute(&sql, &values)?;
        Ok(())
    }

    fn replace_links(&self, relation: &RelationDef, id: &Value, targets: &[Record]) -> Result<()> {
        let RelationKind::ManyToMany { through, source_key, .. } = relation.kind else {
            return Err(unwritable(self.model, relation));
        };
        let mut delete = Query::delete();
        delete
            .from_table(iden(through))
            .and_where(Expr::col(iden(source_key)).eq(id.clone()));
        let (sql, values) = delete.build(PostgresQueryBuilder);
        self.session.execute(&sql, &values)?;
        self.link(relation, id, targets)
    }

    /// Insert or overwrite the subtype row sharing the entity's identity
    fn write_subtype(&self, subtype: &'static ModelDef, id: &Value, columns: &ColumnValues) -> Result<Record> {
        let pk = subtype
            .primary_key_column()
            .ok_or_else(|| RepositoryError::InvalidInput(format!("{} has no identity", subtype.name)))?;
        let mut row: ColumnValues = vec![(pk, id.clone())];
        row.extend(columns.iter().filter(|(c, _)| c.name != pk.name).cloned());
        let mut update: Vec<String> = columns.iter().map(|(c, _)| c.name.to_string()).collect();
        update.retain(|name| name != pk.name);
        if update.is_empty() {
            update.push(pk.name.to_string());
        }
        let conflict = OnConflict::DoUpdate {
            target: vec![pk.name.to_string()],
            update,
        };
        let insert = insert_statement(subtype, &[row], &conflict)?;
        let (sql, values) = insert.build(PostgresQueryBuilder);
        let row = self.session.query_one(&sql, &values)?.ok_or_else(|| {
            RepositoryError::InvalidInput(format!("{} row was not written", subtype.name))
        })?;
        let mut record = record_from_row(subtype, &row);
        record.remove(pk.name);
        Ok(record)
    }

    fn returning_one(&self, insert: InsertStatement) -> Result<Record> {
        let (sql, values) = insert.build(PostgresQueryBuilder);
        let row = self.session.query_one(&sql, &values)?.ok_or_else(|| {
            RepositoryError::InvalidInput(format!("{} row was not written", self.model.name))
        })?;
        Ok(record_from_row(self.model, &row))
    }

    fn identity_of(&self, record: &Record) -> Result<Value> {
        self.identity_of_model(self.model, record)
    }

    fn identity_of_model(&self, model: &ModelDef, record: &Record) -> Result<Value> {
        record
            .id(model)
            .cloned()
            .ok_or_else(|| RepositoryError::InvalidInput(format!("{} record has no identity", model.name)))
    }

    fn normalize_id(&self, model: &ModelDef, id: &Value) -> Result<Value> {
        let pk = model
            .primary_key_column()
            .ok_or_else(|| RepositoryError::InvalidInput(format!("{} has no identity", model.name)))?;
        normalize(pk, id)
    }

    fn foreign_key_column(&self, model: &ModelDef, foreign_key: &str) -> Result<&'static ColumnDef> {
        model.column(foreign_key).ok_or_else(|| {
            RepositoryError::InvalidInput(format!("{} has no column `{foreign_key}`", model.name))
        })
    }
}

fn unwritable(model: &ModelDef, relation: &RelationDef) -> RepositoryError {
    RepositoryError::InvalidInput(format!(
        "{} cannot be written through {}",
        relation.name, model.name
    ))
}

/// Sort a record's entries into own columns, subtype columns and relationships
fn split(model: &'static ModelDef, record: &Record) -> Result<WriteInput> {
    let mut input = WriteInput {
        columns: Vec::new(),
        subtypes: Vec::new(),
        relations: Vec::new(),
    };
    for (name, value) in record.values() {
        if let Some(column) = model.column(name) {
            if !column.is_stored() {
                return Err(RepositoryError::InvalidInput(format!(
                    "`{name}` is computed and cannot be written"
                )));
            }
            input.columns.push((column, normalize(column, value)?));
        } else if let Some((subtype, column)) = model.find_in_subtypes(name)? {
            let value = normalize(column, value)?;
            match input.subtypes.iter_mut().find(|(s, _)| *s == subtype) {
                Some((_, columns)) => columns.push((column, value)),
                None => input.subtypes.push((subtype, vec![(column, value)])),
            }
        } else {
            return Err(RepositoryError::InvalidInput(format!(
                "unknown field `{name}` for {}",
                model.name
            )));
        }
    }
    for (name, related) in record.relations() {
        let relation = model.relation(name).ok_or_else(|| {
            RepositoryError::InvalidInput(format!("unknown relationship `{name}` for {}", model.name))
        })?;
        input.relations.push((relation, related.clone()));
    }
    Ok(input)
}

fn set_column(columns: &mut ColumnValues, column: &'static ColumnDef, value: Value) {
    match columns.iter_mut().find(|(c, _)| *c == column) {
        Some((_, existing)) => *existing = value,
        None => columns.push((column, value)),
    }
}

/// Identities named by a to-many entry
fn related_ids(relation: &RelationDef, related: &Related) -> Result<Vec<Value>> {
    let target = relation.target();
    match related {
        Related::Ids(ids) => Ok(ids.clone()),
        Related::One(None) => Ok(Vec::new()),
        Related::One(Some(record)) => Ok(vec![identity(relation, target, record)?]),
        Related::Many(records) => records
            .iter()
            .map(|record| identity(relation, target, record))
            .collect(),
    }
}

/// The identity a to-one entry points at; `One(None)` clears it
fn single_id(relation: &RelationDef, related: &Related, fk: &ColumnDef) -> Result<Value> {
    match related {
        Related::Ids(ids) if ids.len() == 1 => Ok(ids[0].clone()),
        Related::One(None) => Ok(fk.ty.null_value()),
        Related::One(Some(record)) => identity(relation, relation.target(), record),
        _ => Err(RepositoryError::InvalidInput(format!(
            "`{}` takes a single identity",
            relation.name
        ))),
    }
}

fn identity(relation: &RelationDef, target: &ModelDef, record: &Record) -> Result<Value> {
    record.id(target).cloned().ok_or_else(|| {
        RepositoryError::InvalidInput(format!(
            "`{}` entries must carry a {} identity",
            relation.name, target.name
        ))
    })
}

/// Parameter expression for a column value; text arrays are sent element-wise
fn value_expr(column: &ColumnDef, value: &Value) -> Expr {
    if !column.ty.is_array() {
        return Expr::val(value.clone());
    }
    if is_null(value) {
        return Expr::cust("NULL");
    }
    let items = array_elements(value);
    if items.is_empty() {
        return Expr::cust("ARRAY[]::text[]");
    }
    let placeholders = vec!["?"; items.len()].join(", ");
    Expr::cust_with_values(format!("ARRAY[{placeholders}]::text[]"), items)
}

/// INSERT ... RETURNING * for one or more rows of `model`
fn insert_statement(model: &ModelDef, rows: &[ColumnValues], on_conflict: &OnConflict) -> Result<InsertStatement> {
    let columns: Vec<&'static ColumnDef> = model
        .stored_columns()
        .filter(|column| rows.iter().any(|row| row.iter().any(|(c, _)| c == column)))
        .collect();

    let mut insert = Query::insert();
    insert.into_table(iden(model.table));
    if columns.is_empty() {
        if rows.len() != 1 {
            return Err(RepositoryError::InvalidInput(format!(
                "{} rows carry no columns",
                model.name
            )));
        }
        insert.or_default_values();
    } else {
        insert.columns(columns.iter().map(|c| iden(c.name)));
        for row in rows {
            let exprs = columns.iter().map(|column| match row.iter().find(|(c, _)| c == column) {
                Some((c, value)) => value_expr(c, value),
                None => Expr::cust("DEFAULT"),
            });
            insert
                .values(exprs)
                .map_err(|e| RepositoryError::InvalidInput(e.to_string()))?;
        }
    }

    match on_conflict {
        OnConflict::Fail => {}
        OnConflict::DoNothing { target } => {
            let mut clause = if target.is_empty() {
                ConflictClause::new()
            } else {
                ConflictClause::columns(conflict_columns(model, target)?)
            };
            clause.do_nothing();
            insert.on_conflict(clause);
        }
        OnConflict::DoUpdate { target, update } => {
            if target.is_empty() {
                return Err(RepositoryError::InvalidInput(
                    "DO UPDATE needs a conflict target".into(),
                ));
            }
            let update = if update.is_empty() {
                columns
                    .iter()
                    .map(|c| c.name.to_string())
                    .filter(|name| !target.contains(name))
                    .collect()
            } else {
                update.clone()
            };
            if update.is_empty() {
                return Err(RepositoryError::InvalidInput(
                    "DO UPDATE needs columns to overwrite".into(),
                ));
            }
            let mut clause = ConflictClause::columns(conflict_columns(model, target)?);
            clause.update_columns(conflict_columns(model, &update)?);
            insert.on_conflict(clause);
        }
    }
    insert.returning_all();
    Ok(insert)
}

fn conflict_columns(model: &ModelDef, names: &[String]) -> Result<Vec<sea_query::DynIden>> {
    names
        .iter()
        .map(|name| match model.column(name) {
            Some(column) if column.is_stored() => Ok(iden(column.name)),
            _ => Err(RepositoryError::InvalidInput(format!(
                "`{name}` is not a {} column",
                model.name
            ))),
        })
        .collect()
}

/// Keep the values of `row` that are columns of `model`
fn record_from_row(model: &ModelDef, row: &Row) -> Record {
    let mut record = Record::new();
    for (idx, label) in row.columns().iter().enumerate() {
        if let (Some(column), Some(value)) = (model.column(label), row.value(idx)) {
            record.set(column.name, value.clone());
        }
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuerySettings;
    use crate::error::DbError;
    use crate::schema::{match_model, player};
    use crate::testing::MockSession;
    use uuid::Uuid;

    fn repo(session: &MockSession) -> Repository<'_, MockSession> {
        Repository::new(session, player(), &QuerySettings::default())
    }

    fn unique_violation(constraint: &str) -> DbError {
        DbError::database(
            crate::error::UNIQUE_VIOLATION,
            format!(r#"duplicate key value violates unique constraint "{constraint}""#),
            Some(constraint),
            Some("Key (email)=(ana@example.com) already exists."),
        )
    }

    /// Every stored player column in declaration order, as both loads and RETURNING * see it
    fn saved_player(id: Uuid) -> Row {
        let (columns, values) = player()
            .stored_columns()
            .map(|column| {
                let value = match column.name {
                    "id" => Value::from(id),
                    "name" => Value::from("Ana"),
                    "email" => Value::from("ana@example.com"),
                    "active" => Value::from(true),
                    "goals" => Value::from(3i32),
                    _ => column.ty.null_value(),
                };
                (column.name.to_string(), value)
            })
            .unzip();
        Row::new(columns, values)
    }

    #[test]
    fn test_save_inserts_and_commits() {
        let session = MockSession::new();
        let id = Uuid::new_v4();
        session.push_rows(vec![saved_player(id)]);

        let saved = repo(&session)
            .save(
                Record::new()
                    .with("name", "Ana")
                    .with("email", "ana@example.com")
                    .with("tags", serde_json::json!(["captain", "left"])),
            )
            .expect("saved");

        assert_eq!(saved.id(player()), Some(&Value::from(id)));
        let sql = &session.sql()[0];
        assert!(sql.starts_with(r#"INSERT INTO "players" ("name", "email", "tags")"#), "{sql}");
        assert!(sql.contains("ARRAY[$3, $4]::text[]"), "{sql}");
        assert!(sql.ends_with("RETURNING *"), "{sql}");
        assert_eq!(session.events().last().map(String::as_str), Some("COMMIT"));
    }

    #[test]
    fn test_save_duplicate_rolls_back_then_translates() {
        let session = MockSession::new();
        session.push_error(unique_violation("players_email_key"));

        let err = repo(&session)
            .save(Record::new().with("name", "Ana").with("email", "ana@example.com"))
            .expect_err("duplicate");
        assert_eq!(
            err,
            RepositoryError::DuplicateEntity {
                entity: "Player".into(),
                field: "email".into()
            }
        );
        assert_eq!((session.rollbacks(), session.commits()), (1, 0));
    }

    #[test]
    fn test_save_rejects_computed_and_unknown_fields() {
        let session = MockSession::new();
        assert!(matches!(
            repo(&session).save(Record::new().with("full_name", "Ana Lima")),
            Err(RepositoryError::InvalidInput(_))
        ));
        assert!(matches!(
            repo(&session).save(Record::new().with("nickname", "Ana")),
            Err(RepositoryError::InvalidInput(_))
        ));
        assert_eq!(session.rollbacks(), 2);
    }

    #[test]
    fn test_save_with_missing_many_to_many_target() {
        let session = MockSession::new();
        let known = Uuid::new_v4();
        let unknown = Uuid::new_v4();
        session.push_rows(vec![Row::from_pairs([("id", Value::from(known))])]);

        let err = repo(&session)
            .save(
                Record::new()
                    .with("name", "Ana")
                    .with_ids("matches", [known, unknown]),
            )
            .expect_err("missing match");
        assert_eq!(
            err,
            RepositoryError::ReferencedEntityMissing {
                relationship: "matches".into(),
                missing: vec![unknown.to_string()],
            }
        );
        assert_eq!(session.sql().len(), 1, "nothing inserted");
        assert_eq!(session.rollbacks(), 1);
    }

    #[test]
    fn test_save_links_many_to_many_targets() {
        let session = MockSession::new();
        let id = Uuid::new_v4();
        let fixture = Uuid::new_v4();
        session
            .push_rows(vec![Row::from_pairs([("id", Value::from(fixture))])])
            .push_rows(vec![saved_player(id)])
            .push_affected(1);

        let saved = repo(&session)
            .save(Record::new().with("name", "Ana").with_ids("matches", [fixture]))
            .expect("saved");

        let sql = session.sql();
        assert!(sql[2].starts_with(r#"INSERT INTO "match_squads" ("player_id", "match_id")"#), "{}", sql[2]);
        assert!(sql[2].contains("ON CONFLICT DO NOTHING"), "{}", sql[2]);
        assert!(matches!(saved.related("matches"), Some(Related::Many(m)) if m.len() == 1));
    }

    #[test]
    fn test_bulk_create_fills_defaults_and_handles_conflicts() {
        let session = MockSession::new();
        session.push_rows(vec![]);

        repo(&session)
            .bulk_create(
                vec![
                    Record::new().with("name", "Ana").with("email", "ana@example.com"),
                    Record::new().with("name", "Ben").with("email", "ben@example.com").with("goals", 2),
                ],
                OnConflict::DoNothing {
                    target: vec!["email".into()],
                },
            )
            .expect("written");

        let sql = &session.sql()[0];
        assert!(sql.contains("DEFAULT"), "{sql}");
        assert!(sql.contains(r#"ON CONFLICT ("email") DO NOTHING"#), "{sql}");
    }

    #[test]
    fn test_bulk_create_empty_and_nested_input() {
        let session = MockSession::new();
        assert!(repo(&session).bulk_create(vec![], OnConflict::Fail).expect("noop").is_empty());
        assert!(session.events().is_empty());

        let nested = Record::new().with("name", "Ana").with_ids("matches", [Uuid::new_v4()]);
        assert!(matches!(
            repo(&session).bulk_create(vec![nested], OnConflict::Fail),
            Err(RepositoryError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_bulk_create_do_update_defaults_to_inserted_columns() {
        let session = MockSession::new();
        repo(&session)
            .bulk_create(
                vec![Record::new().with("email", "ana@example.com").with("name", "Ana")],
                OnConflict::DoUpdate {
                    target: vec!["email".into()],
                    update: vec![],
                },
            )
            .expect("written");
        let sql = &session.sql()[0];
        assert!(
            sql.contains(r#"ON CONFLICT ("email") DO UPDATE SET "name" = "excluded"."name""#),
            "{sql}"
        );
    }

    #[test]
    fn test_upsert_needs_identity() {
        let session = MockSession::new();
        assert!(matches!(
            repo(&session).upsert(Record::new().with("name", "Ana")),
            Err(RepositoryError::InvalidInput(_))
        ));

        let id = Uuid::new_v4();
        session.clear();
        session.push_rows(vec![saved_player(id)]);
        repo(&session)
            .upsert(Record::new().with("id", id).with("name", "Ana"))
            .expect("upserted");
        assert!(session.sql()[0].contains(r#"ON CONFLICT ("id") DO UPDATE SET "name" = "excluded"."name""#));
    }

    #[test]
    fn test_update_writes_changed_fields_and_tracks_them() {
        let session = MockSession::new();
        let id = Uuid::new_v4();
        session
            .push_rows(vec![saved_player(id)])
            .push_rows(vec![saved_player(id)]);

        repo(&session)
            .update(id, Record::new().with("name", "Ana").with("goals", 4))
            .expect("updated");

        let captured = session.captured();
        let update = &captured[1];
        assert!(update.sql.starts_with(r#"UPDATE "players" SET "goals" = $1, "updates_metadata" = $2"#), "{}", update.sql);
        let Value::Json(Some(log)) = &update.values.0[1] else {
            panic!("tracking value is json: {:?}", update.values.0[1]);
        };
        assert!(log.get("goals").is_some());
        assert!(log.get("name").is_none(), "unchanged fields are not tracked");
    }

    #[test]
    fn test_update_without_changes_skips_the_statement() {
        let session = MockSession::new();
        let id = Uuid::new_v4();
        session.push_rows(vec![saved_player(id)]);

        let updated = repo(&session)
            .update(id, Record::new().with("name", "Ana"))
            .expect("updated");
        assert_eq!(updated.get("email"), Some(&Value::from("ana@example.com")));
        assert_eq!(session.sql().len(), 1);
        assert_eq!(session.commits(), 1);
    }

    #[test]
    fn test_update_missing_entity() {
        let session = MockSession::new();
        let err = repo(&session)
            .update(Uuid::new_v4(), Record::new().with("name", "Ana"))
            .expect_err("missing");
        assert!(matches!(err, RepositoryError::NotFound { .. }));
        assert_eq!(session.rollbacks(), 1);
    }

    #[test]
    fn test_update_replaces_many_to_many_links() {
        let session = MockSession::new();
        let id = Uuid::new_v4();
        let fixture = Uuid::new_v4();
        session
            .push_rows(vec![saved_player(id)])
            .push_rows(vec![Row::from_pairs([("id", Value::from(fixture))])])
            .push_affected(2)
            .push_affected(1)
            .push_rows(vec![saved_player(id)]);

        let updated = repo(&session)
            .update(id, Record::new().with_ids("matches", [fixture]))
            .expect("updated");

        let sql = session.sql();
        assert!(sql[2].starts_with(r#"DELETE FROM "match_squads" WHERE "player_id" = $1"#), "{}", sql[2]);
        assert!(sql[3].starts_with(r#"INSERT INTO "match_squads""#), "{}", sql[3]);
        assert!(sql[4].contains(r#""updates_metadata" = $1"#), "{}", sql[4]);
        assert!(matches!(updated.related("matches"), Some(Related::Many(m)) if m.len() == 1));
    }

    #[test]
    fn test_delete_missing_is_a_noop_and_referenced_fails() {
        let session = MockSession::new();
        session.push_affected(0);
        let id = Uuid::new_v4();
        assert_eq!(repo(&session).delete(id).expect("nothing to delete"), 0);
        assert_eq!((session.commits(), session.rollbacks()), (1, 0));

        session.push_error(DbError::database(
            crate::error::FOREIGN_KEY_VIOLATION,
            r#"update or delete on table "players" violates foreign key constraint "statistics_player_id_fkey" on table "statistics""#,
            Some("statistics_player_id_fkey"),
            Some(r#"Key (id)=(1) is still referenced from table "statistics"."#),
        ));
        let err = repo(&session).delete(id).expect_err("referenced");
        assert_eq!(
            err,
            RepositoryError::ReferencedEntity {
                entity: "Player".into(),
                message: "Player is being referenced by another table".into()
            }
        );
        assert_eq!(session.rollbacks(), 1);
    }

    #[test]
    fn test_delete_many_and_by_filter() {
        let session = MockSession::new();
        assert_eq!(repo(&session).delete_many(Vec::<Uuid>::new()).expect("noop"), 0);
        assert!(session.sql().is_empty());

        session.push_affected(2);
        let count = repo(&session)
            .delete_many([Uuid::new_v4(), Uuid::new_v4()])
            .expect("deleted");
        assert_eq!(count, 2);
        assert!(session.sql()[0].contains(r#""players"."id" IN ($1, $2)"#));

        assert!(matches!(
            repo(&session).delete_by_filter(&FilterSpec::new(player())),
            Err(RepositoryError::InvalidInput(_))
        ));

        session.clear();
        session.push_affected(3);
        let spec = FilterSpec::new(player()).with("active", false);
        assert_eq!(repo(&session).delete_by_filter(&spec).expect("deleted"), 3);
        assert!(session.sql()[0].contains(r#"IN (SELECT "players"."id" FROM "players" AS "players""#), "{}", session.sql()[0]);
    }

    #[test]
    fn test_bulk_update_by_filter() {
        let session = MockSession::new();
        session.push_affected(5);
        let spec = FilterSpec::new(player()).nested("matches", FilterSpec::new(match_model()).with("kind", "cup"));
        let count = repo(&session)
            .bulk_update(Record::new().with("active", false), Some(&spec))
            .expect("updated");
        assert_eq!(count, 5);
        let sql = &session.sql()[0];
        assert!(sql.starts_with(r#"UPDATE "players" SET "active" = $1 WHERE "players"."id" IN (SELECT"#), "{sql}");

        assert!(matches!(
            repo(&session).bulk_update(Record::new(), None),
            Err(RepositoryError::InvalidInput(_))
        ));
    }
}
