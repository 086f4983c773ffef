//! Repository over one model
//!
//! A [`Repository`] ties the pieces together for a single model and session: output shapes are
//! extracted into field graphs, planned, compiled and folded into a [`LoadPlan`]; filter specs
//! go through the [`FilterEngine`]; paginated reads pick a [`PaginationStrategy`]. A database
//! fault during a read rolls the session back before it is returned. Writes live in `write.rs`
//! and always finish with a commit, or a rollback followed by error translation.

mod translate;
mod write;

pub use translate::{field_from_constraint, translate, translate_error};
pub use write::OnConflict;

use sea_query::{Expr, ExprTrait, JoinType, Order, Query, SelectStatement, Value};
use serde::de::DeserializeOwned;

use crate::compile::compile;
use crate::config::QuerySettings;
use crate::error::{FilterError, RepositoryError, Result};
use crate::executor::Row;
use crate::filter::{FilterEngine, FilterSpec, SortKey};
use crate::loader::{fetch, fetch_with_total, LoadPlan};
use crate::model::{ColumnDef, ModelDef};
use crate::pagination::{Listing, Page, PageParams, PaginationStrategy};
use crate::plan::PlanBuilder;
use crate::record::Record;
use crate::session::Session;
use crate::shape::{extract, OutputShape, Shaped};
use crate::sql::{build_select, col, iden, select_from};
use crate::value::{coerce, key_of, to_json};

/// Alias of the derived table holding a page of identities
const PRE_FILTER_ALIAS: &str = "__pre_filter_ids";
const DISTINCT_ALIAS: &str = "__distinct_ids";
const TOTAL_ALIAS: &str = "__total";
const COUNT_ALIAS: &str = "count_subquery";

pub struct Repository<'s, S: Session + ?Sized> {
    session: &'s S,
    model: &'static ModelDef,
    settings: QuerySettings,
    filters: FilterEngine,
    strategy: PaginationStrategy,
}

impl<'s, S: Session + ?Sized> Repository<'s, S> {
    pub fn new(session: &'s S, model: &'static ModelDef, settings: &QuerySettings) -> Self {
        Self {
            session,
            model,
            settings: settings.clone(),
            filters: FilterEngine::new(settings),
            strategy: PaginationStrategy::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: PaginationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn model(&self) -> &'static ModelDef {
        self.model
    }

    pub fn session(&self) -> &'s S {
        self.session
    }

    pub fn settings(&self) -> &QuerySettings {
        &self.settings
    }

    pub fn filters(&self) -> &FilterEngine {
        &self.filters
    }

    /// Parse a JSON filter object against this repository's model
    pub fn parse_filter(&self, json: &serde_json::Value) -> Result<FilterSpec> {
        Ok(self.filters.parse(self.model, json)?)
    }

    /// Turn an output shape into a load plan; `None` loads every stored column
    pub fn load_plan(&self, shape: Option<&OutputShape>) -> Result<LoadPlan> {
        let Some(shape) = shape else {
            return Ok(LoadPlan::full(self.model));
        };
        let graph = extract(shape, self.settings.max_shape_depth)?;
        let plan = PlanBuilder::new(self.settings.unknown_field_policy).build(&graph, self.model)?;
        let directives = compile(&plan)?;
        Ok(LoadPlan::from_directives(self.model, &directives)?)
    }

    /// Load one entity by identity
    ///
    /// With `raise_on_missing` an absent entity is [`RepositoryError::NotFound`]; otherwise it
    /// is `Ok(None)`.
    pub fn get(
        &self,
        id: impl Into<Value>,
        raise_on_missing: bool,
        shape: Option<&OutputShape>,
    ) -> Result<Option<Record>> {
        self.get_by(self.model.primary_key, id, raise_on_missing, shape)
    }

    /// Load the first entity whose `field` equals `value`
    pub fn get_by(
        &self,
        field: &str,
        value: impl Into<Value>,
        raise_on_missing: bool,
        shape: Option<&OutputShape>,
    ) -> Result<Option<Record>> {
        let column = self
            .model
            .column(field)
            .filter(|c| c.is_stored())
            .ok_or_else(|| FilterError::UnknownColumn {
                model: self.model.name.to_string(),
                column: field.to_string(),
            })?;
        let value = normalize(column, &value.into())?;
        let plan = self.load_plan(shape)?;

        let mut select = select_from(self.model);
        select.and_where(col(self.model.table, column.name).eq(value.clone()));
        let found = self.in_read(|| fetch(self.session, &plan, select))?.into_iter().next();
        match found {
            None if raise_on_missing => Err(RepositoryError::NotFound {
                entity: self.model.name.to_string(),
                id: key_of(&value),
            }),
            found => Ok(found),
        }
    }

    /// Typed `get`: the shape comes from `T` and the record is decoded into it
    pub fn get_as<T: Shaped + DeserializeOwned>(&self, id: impl Into<Value>) -> Result<Option<T>> {
        self.get(id, false, Some(T::output_shape()))?
            .map(|record| self.decode(&record))
            .transpose()
    }

    /// Every entity matching `filter`, sorted by its ordering then by identity
    pub fn find_all(&self, filter: Option<&FilterSpec>, shape: Option<&OutputShape>) -> Result<Vec<Record>> {
        let plan = self.load_plan(shape)?;
        let mut select = self.filtered(filter)?;
        let keys = self.sort_keys(filter)?;
        self.order(&mut select, self.model.table, &keys);
        self.in_read(|| fetch(self.session, &plan, select))
    }

    pub fn find_all_as<T: Shaped + DeserializeOwned>(&self, filter: Option<&FilterSpec>) -> Result<Vec<T>> {
        self.find_all(filter, Some(T::output_shape()))?
            .iter()
            .map(|record| self.decode(record))
            .collect()
    }

    /// One page of entities matching `filter`, with the total count
    pub fn find_page(
        &self,
        filter: Option<&FilterSpec>,
        shape: Option<&OutputShape>,
        params: PageParams,
    ) -> Result<Page<Record>> {
        let params = params.clamped(&self.settings);
        let plan = self.load_plan(shape)?;
        let strategy = self.resolve_strategy(filter, &plan)?;
        log::debug!(
            "paginating {} with {strategy:?} (limit {}, offset {})",
            self.model.name,
            params.limit,
            params.offset
        );
        self.in_read(|| match strategy {
            PaginationStrategy::PreFilter => self.page_pre_filtered(filter, &plan, params),
            _ => self.page_direct(filter, &plan, params),
        })
    }

    pub fn find_page_as<T: Shaped + DeserializeOwned>(
        &self,
        filter: Option<&FilterSpec>,
        params: PageParams,
    ) -> Result<Page<T>> {
        self.find_page(filter, Some(T::output_shape()), params)?
            .try_map(|record| self.decode(&record))
    }

    /// `find_page` when `page` is given, `find_all` otherwise
    pub fn list(
        &self,
        filter: Option<&FilterSpec>,
        shape: Option<&OutputShape>,
        page: Option<PageParams>,
    ) -> Result<Listing<Record>> {
        match page {
            Some(params) => Ok(Listing::Page(self.find_page(filter, shape, params)?)),
            None => Ok(Listing::Items(self.find_all(filter, shape)?)),
        }
    }

    /// Number of distinct entities matching `filter`
    pub fn count(&self, filter: Option<&FilterSpec>) -> Result<u64> {
        self.in_read(|| self.count_matching(filter, true))
    }

    /// Run a read; on a database fault roll the session back, since the engine refuses further
    /// statements in an aborted transaction
    fn in_read<T>(&self, op: impl FnOnce() -> Result<T>) -> Result<T> {
        op().map_err(|err| {
            if matches!(err, RepositoryError::Database(_)) {
                if let Err(rollback) = self.session.rollback() {
                    log::warn!("rollback after failed {} read failed: {rollback}", self.model.name);
                }
            }
            err
        })
    }

    fn resolve_strategy(&self, filter: Option<&FilterSpec>, plan: &LoadPlan) -> Result<PaginationStrategy> {
        if let Some(spec) = filter {
            self.check_model(spec)?;
        }
        Ok(match self.strategy {
            PaginationStrategy::Auto => {
                let multiplies = filter.is_some_and(|spec| self.filters.joins_collections(spec));
                if multiplies || plan.loads_collections() {
                    PaginationStrategy::PreFilter
                } else {
                    PaginationStrategy::Direct
                }
            }
            fixed => fixed,
        })
    }

    fn page_direct(&self, filter: Option<&FilterSpec>, plan: &LoadPlan, params: PageParams) -> Result<Page<Record>> {
        let total = self.count_matching(filter, false)?;
        let mut select = self.filtered(filter)?;
        let keys = self.sort_keys(filter)?;
        self.order(&mut select, self.model.table, &keys);
        select.limit(params.limit).offset(params.offset);
        let items = fetch(self.session, plan, select)?;
        Ok(Page::new(items, total, params))
    }

    /// Page over distinct identities, then load exactly those entities
    ///
    /// The total is a window count over the unlimited distinct identities, carried on every
    /// page row, so the page and its total are read in one statement. Only a page past the end
    /// needs a separate count.
    fn page_pre_filtered(
        &self,
        filter: Option<&FilterSpec>,
        plan: &LoadPlan,
        params: PageParams,
    ) -> Result<Page<Record>> {
        let table = self.model.table;
        let pk = self.model.primary_key;
        let keys = self.sort_keys(filter)?;

        let mut names = vec![pk];
        for key in &keys {
            if !names.contains(&key.column.name) {
                names.push(key.column.name);
            }
        }

        let mut distinct = self.filtered(filter)?;
        distinct.distinct();
        for name in &names {
            distinct.expr_as(col(table, name), iden(name));
        }

        let mut ids = Query::select();
        for name in &names {
            ids.expr_as(col(DISTINCT_ALIAS, name), iden(name));
        }
        ids.expr_as(Expr::cust("COUNT(*) OVER ()"), iden(TOTAL_ALIAS))
            .from_subquery(distinct.clone(), iden(DISTINCT_ALIAS));
        self.order(&mut ids, DISTINCT_ALIAS, &keys);
        ids.limit(params.limit).offset(params.offset);

        let mut select = select_from(self.model);
        select.join_subquery(
            JoinType::InnerJoin,
            ids,
            iden(PRE_FILTER_ALIAS),
            col(PRE_FILTER_ALIAS, pk).equals((iden(table), iden(pk))),
        );
        self.order(&mut select, table, &keys);
        let (items, total) = fetch_with_total(
            self.session,
            plan,
            select,
            col(PRE_FILTER_ALIAS, TOTAL_ALIAS),
            TOTAL_ALIAS,
        )?;
        let total = match total {
            Some(total) => total,
            None if params.offset == 0 => 0,
            None => self.count_rows(distinct)?,
        };
        Ok(Page::new(items, total, params))
    }

    /// Root select with the filter's joins and predicates, unsorted
    fn filtered(&self, filter: Option<&FilterSpec>) -> Result<SelectStatement> {
        let mut select = select_from(self.model);
        if let Some(spec) = filter {
            self.check_model(spec)?;
            self.filters.apply_filter(&mut select, self.model.table, spec)?;
        }
        Ok(select)
    }

    /// Identities matching `filter`, for use in `IN (...)`
    pub(crate) fn id_subquery(&self, filter: &FilterSpec) -> Result<SelectStatement> {
        let mut ids = self.filtered(Some(filter))?;
        ids.expr(col(self.model.table, self.model.primary_key));
        Ok(ids)
    }

    fn sort_keys(&self, filter: Option<&FilterSpec>) -> Result<Vec<SortKey>> {
        match filter {
            Some(spec) => Ok(self.filters.sort_keys(spec)?),
            None => Ok(Vec::new()),
        }
    }

    /// Apply sort keys, then the identity as a tiebreaker so pages are stable
    fn order(&self, select: &mut SelectStatement, alias: &str, keys: &[SortKey]) {
        for key in keys {
            key.apply(select, alias);
        }
        let pk = self.model.primary_key;
        if !keys.iter().any(|k| k.column.name == pk) {
            select.order_by_expr(col(alias, pk), Order::Asc);
        }
    }

    fn count_matching(&self, filter: Option<&FilterSpec>, distinct: bool) -> Result<u64> {
        let mut ids = self.filtered(filter)?;
        if distinct {
            ids.distinct();
        }
        ids.expr(col(self.model.table, self.model.primary_key));
        self.count_rows(ids)
    }

    fn count_rows(&self, inner: SelectStatement) -> Result<u64> {
        let mut count = Query::select();
        count
            .expr(Expr::cust("COUNT(*)"))
            .from_subquery(inner, iden(COUNT_ALIAS));
        let (sql, values) = build_select(&count);
        let row = self.session.query_one(&sql, &values)?;
        Ok(row.as_ref().map(count_of).unwrap_or(0))
    }

    fn check_model(&self, spec: &FilterSpec) -> Result<()> {
        if spec.model() != self.model {
            return Err(RepositoryError::InvalidInput(format!(
                "filter on {} cannot be applied to {}",
                spec.model().name,
                self.model.name
            )));
        }
        Ok(())
    }

    fn decode<T: DeserializeOwned>(&self, record: &Record) -> Result<T> {
        record.decode().map_err(|e| RepositoryError::Decode {
            entity: self.model.name.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Coerce a caller-supplied value to the column's native type
pub(crate) fn normalize(column: &ColumnDef, value: &Value) -> Result<Value> {
    coerce(&to_json(value), column.ty)
        .map_err(|reason| RepositoryError::InvalidInput(format!("{}: {reason}", column.name)))
}

fn count_of(row: &Row) -> u64 {
    row.value(0)
        .map(to_json)
        .and_then(|json| json.as_u64())
        .unwrap_or(0)
}
