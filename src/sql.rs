//! sea-query helpers shared by the loader, the filter engine and the repository

use sea_query::{DynIden, Expr, ExprTrait, JoinType, PostgresQueryBuilder, SelectStatement, Values};

use crate::model::{ModelDef, RelationDef, RelationKind};

/// Owned identifier for a runtime name
pub fn iden(name: &str) -> DynIden {
    DynIden::from(name.to_string())
}

/// `"alias"."column"`
pub fn col(alias: &str, column: &str) -> Expr {
    Expr::col((iden(alias), iden(column)))
}

/// Quoted `"alias"."column"` for custom SQL fragments
pub fn quoted_col(alias: &str, column: &str) -> String {
    format!("{}.{}", quote(alias), quote(column))
}

pub fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Alias of an eagerly joined relationship below `parent`
pub fn eager_alias(parent: &str, relation: &str) -> String {
    format!("{parent}.{relation}")
}

/// Alias of a relationship joined for filtering below `parent`
pub fn filter_alias(parent: &str, relation: &str) -> String {
    format!("{parent}__{relation}")
}

/// Alias of the association table behind a many-to-many join
pub fn through_alias(alias: &str) -> String {
    format!("{alias}__through")
}

/// Start a SELECT over `model` aliased by its table name
pub fn select_from(model: &ModelDef) -> SelectStatement {
    let mut select = SelectStatement::new();
    select.from_as(iden(model.table), iden(model.table));
    select
}

/// Join `relation` of the row at `parent_alias` as `alias`
///
/// Many-to-many relationships join their association table first.
pub fn join_relation(
    select: &mut SelectStatement,
    join: JoinType,
    parent: &ModelDef,
    parent_alias: &str,
    relation: &RelationDef,
    alias: &str,
) {
    join_relation_to(select, join, parent, parent_alias, relation, alias, None)
}

/// Like [`join_relation`], optionally joining a derived table in place of the target table
///
/// The derived table must expose the target model's columns under their own names.
pub fn join_relation_to(
    select: &mut SelectStatement,
    join: JoinType,
    parent: &ModelDef,
    parent_alias: &str,
    relation: &RelationDef,
    alias: &str,
    derived: Option<&SelectStatement>,
) {
    let target = relation.target();
    let condition = match relation.kind {
        RelationKind::BelongsTo { foreign_key } => {
            col(alias, target.primary_key).equals((iden(parent_alias), iden(foreign_key)))
        }
        RelationKind::HasOne { foreign_key } | RelationKind::HasMany { foreign_key } => {
            col(alias, foreign_key).equals((iden(parent_alias), iden(parent.primary_key)))
        }
        RelationKind::ManyToMany {
            through,
            source_key,
            target_key,
        } => {
            let through_alias = through_alias(alias);
            select.join_as(
                join,
                iden(through),
                iden(&through_alias),
                col(&through_alias, source_key)
                    .equals((iden(parent_alias), iden(parent.primary_key))),
            );
            col(alias, target.primary_key).equals((iden(&through_alias), iden(target_key)))
        }
    };
    match derived {
        Some(subquery) => {
            select.join_subquery(join, subquery.clone(), iden(alias), condition);
        }
        None => {
            select.join_as(join, iden(target.table), iden(alias), condition);
        }
    }
}

/// Render a SELECT for PostgreSQL
pub fn build_select(select: &SelectStatement) -> (String, Values) {
    select.build(PostgresQueryBuilder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{player, statistic};

    #[test]
    fn test_aliases() {
        assert_eq!(eager_alias("players", "statistics"), "players.statistics");
        assert_eq!(filter_alias("players", "matches"), "players__matches");
        assert_eq!(through_alias("players__matches"), "players__matches__through");
        assert_eq!(quoted_col("players", "name"), "\"players\".\"name\"");
    }

    #[test]
    fn test_join_belongs_to() {
        let mut select = select_from(statistic());
        select.column((iden("statistics"), iden("id")));
        let relation = statistic().relation("player").expect("declared");
        join_relation(
            &mut select,
            JoinType::LeftJoin,
            statistic(),
            "statistics",
            relation,
            "statistics.player",
        );
        let (sql, _) = build_select(&select);
        assert!(sql.contains(
            r#"LEFT JOIN "players" AS "statistics.player" ON "statistics.player"."id" = "statistics"."player_id""#
        ), "{sql}");
    }

    #[test]
    fn test_join_many_to_many_goes_through_association() {
        let mut select = select_from(player());
        select.column((iden("players"), iden("id")));
        let relation = player().relation("matches").expect("declared");
        join_relation(
            &mut select,
            JoinType::InnerJoin,
            player(),
            "players",
            relation,
            "players__matches",
        );
        let (sql, _) = build_select(&select);
        assert!(sql.contains(
            r#"INNER JOIN "match_squads" AS "players__matches__through" ON "players__matches__through"."player_id" = "players"."id""#
        ), "{sql}");
        assert!(sql.contains(
            r#"INNER JOIN "matches" AS "players__matches" ON "players__matches"."id" = "players__matches__through"."match_id""#
        ), "{sql}");
    }
}
