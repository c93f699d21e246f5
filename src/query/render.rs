//! Per-action SQL renderers. Identifier quoting is delegated to the driver
//! kind; values travel as named placeholders, never inline.

use crate::driver::{quote_identifier, Kind};
use crate::error::{Error, Result};
use crate::expr::ParamAllocator;
use crate::query::plan::{Action, QueryPlan};
use crate::value::Value;
use indexmap::IndexMap;
use itertools::Itertools;

/// Serialises a plan to `(sql, params)` for the given backend.
pub fn render(plan: &QueryPlan, kind: Kind) -> Result<(String, IndexMap<String, Value>)> {
    match plan.action {
        Action::Select => render_select(plan, kind),
        Action::Insert => render_insert(plan, kind),
        Action::Update => render_update(plan, kind),
        Action::Delete => render_delete(plan, kind),
    }
}

fn render_select(plan: &QueryPlan, kind: Kind) -> Result<(String, IndexMap<String, Value>)> {
    let mut sql = String::from("SELECT ");
    if plan.distinct {
        sql.push_str("DISTINCT ");
    }
    if plan.columns.is_empty() {
        sql.push('*');
    } else {
        let columns = plan
            .columns
            .iter()
            .map(|c| match &c.alias {
                Some(alias) => format!(
                    "{} AS {}",
                    quote_identifier(kind, &c.expr),
                    quote_identifier(kind, alias)
                ),
                None => quote_identifier(kind, &c.expr),
            })
            .join(", ");
        sql.push_str(&columns);
    }

    sql.push_str(" FROM ");
    sql.push_str(&quote_identifier(kind, &plan.table));
    if let Some(alias) = &plan.alias {
        sql.push_str(" AS ");
        sql.push_str(&quote_identifier(kind, alias));
    }

    for join in &plan.joins {
        let on = join
            .on
            .iter()
            .map(|(left, right)| {
                format!(
                    "{} = {}",
                    quote_identifier(kind, left),
                    quote_identifier(kind, right)
                )
            })
            .join(" AND ");
        sql.push_str(&format!(
            " {} {} AS {} ON {}",
            join.kind.as_sql(),
            quote_identifier(kind, &join.table),
            quote_identifier(kind, &join.alias),
            on
        ));
    }

    let mut params = IndexMap::new();
    let mut alloc = ParamAllocator::default();
    append_where(&mut sql, plan, &mut params, &mut alloc);

    if !plan.group_by.is_empty() {
        sql.push_str(" GROUP BY ");
        let group = plan
            .group_by
            .iter()
            .map(|c| quote_identifier(kind, c))
            .join(", ");
        sql.push_str(&group);
    }
    if !plan.order_by.is_empty() {
        sql.push_str(" ORDER BY ");
        let order = plan
            .order_by
            .iter()
            .map(|(c, ascending)| {
                format!(
                    "{} {}",
                    quote_identifier(kind, c),
                    if *ascending { "ASC" } else { "DESC" }
                )
            })
            .join(", ");
        sql.push_str(&order);
    }
    if let Some(limit) = plan.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    if let Some(offset) = plan.offset {
        sql.push_str(&format!(" OFFSET {offset}"));
    }
    Ok((sql, params))
}

fn render_insert(plan: &QueryPlan, kind: Kind) -> Result<(String, IndexMap<String, Value>)> {
    if plan.values.is_empty() {
        return Err(Error::invalid(format!(
            "insert into `{}` with no values",
            plan.table
        )));
    }
    let columns = plan
        .values
        .keys()
        .map(|c| quote_identifier(kind, c))
        .join(", ");
    let placeholders = plan.values.keys().map(|c| format!(":{c}")).join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_identifier(kind, &plan.table),
        columns,
        placeholders
    );
    Ok((sql, plan.values.clone()))
}

fn render_update(plan: &QueryPlan, kind: Kind) -> Result<(String, IndexMap<String, Value>)> {
    if plan.values.is_empty() {
        return Err(Error::invalid(format!(
            "update of `{}` with no values",
            plan.table
        )));
    }
    let assignments = plan
        .values
        .keys()
        .map(|c| format!("{} = :{c}", quote_identifier(kind, c)))
        .join(", ");
    let mut sql = format!(
        "UPDATE {} SET {}",
        quote_identifier(kind, &plan.table),
        assignments
    );
    let mut params = plan.values.clone();
    let mut alloc = ParamAllocator::default();
    for name in plan.values.keys() {
        alloc.reserve(name);
    }
    append_where(&mut sql, plan, &mut params, &mut alloc);
    Ok((sql, params))
}

fn render_delete(plan: &QueryPlan, kind: Kind) -> Result<(String, IndexMap<String, Value>)> {
    let mut sql = format!("DELETE FROM {}", quote_identifier(kind, &plan.table));
    let mut params = IndexMap::new();
    let mut alloc = ParamAllocator::default();
    append_where(&mut sql, plan, &mut params, &mut alloc);
    Ok((sql, params))
}

fn append_where(
    sql: &mut String,
    plan: &QueryPlan,
    params: &mut IndexMap<String, Value>,
    alloc: &mut ParamAllocator,
) {
    if let Some(expr) = &plan.where_clause {
        if !expr.is_empty() {
            let fragment = expr.compile_with(params, alloc);
            sql.push_str(" WHERE ");
            sql.push_str(&fragment);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expression;
    use crate::query::plan::{ColumnRef, Join, JoinKind};

    fn select_users() -> QueryPlan {
        let mut plan = QueryPlan::new(Action::Select, "users");
        plan.alias = Some("user".into());
        for column in ["id", "username", "email", "profile_id"] {
            plan.columns.push(ColumnRef {
                expr: format!("user.{column}"),
                alias: Some(format!("user_{column}")),
            });
        }
        plan
    }

    #[test]
    fn select_with_join_matches_the_wire_shape() {
        let mut plan = select_users();
        for column in ["id", "bio"] {
            plan.columns.push(ColumnRef {
                expr: format!("user__profile.{column}"),
                alias: Some(format!("user__profile_{column}")),
            });
        }
        plan.joins.push(Join {
            kind: JoinKind::Left,
            table: "profiles".into(),
            alias: "user__profile".into(),
            on: vec![("user.profile_id".into(), "user__profile.id".into())],
        });
        plan.where_clause = Some(Expression::and().and_eq_as("user.id", "id", 1));

        let (sql, params) = render(&plan, Kind::Mysql).unwrap();
        assert_eq!(
            sql,
            "SELECT `user`.`id` AS `user_id`, `user`.`username` AS `user_username`, \
             `user`.`email` AS `user_email`, `user`.`profile_id` AS `user_profile_id`, \
             `user__profile`.`id` AS `user__profile_id`, `user__profile`.`bio` AS `user__profile_bio` \
             FROM `users` AS `user` \
             LEFT JOIN `profiles` AS `user__profile` ON `user`.`profile_id` = `user__profile`.`id` \
             WHERE (user.id = :id)"
        );
        assert_eq!(params["id"], Value::Int(1));
    }

    #[test]
    fn select_renders_options() {
        let mut plan = select_users();
        plan.distinct = true;
        plan.order_by = vec![("user.username".into(), true), ("user.id".into(), false)];
        plan.limit = Some(10);
        plan.offset = Some(20);
        let (sql, _) = render(&plan, Kind::Sqlite).unwrap();
        assert!(sql.starts_with("SELECT DISTINCT "));
        assert!(sql.ends_with(
            "ORDER BY \"user\".\"username\" ASC, \"user\".\"id\" DESC LIMIT 10 OFFSET 20"
        ));
    }

    #[test]
    fn insert_renders_columns_and_placeholders() {
        let mut plan = QueryPlan::new(Action::Insert, "users");
        plan.values.insert("username".into(), Value::from("neo"));
        plan.values.insert("email".into(), Value::from("neo@matrix.io"));
        plan.values.insert("profile_id".into(), Value::Int(3));
        let (sql, params) = render(&plan, Kind::Mysql).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO `users` (`username`, `email`, `profile_id`) \
             VALUES (:username, :email, :profile_id)"
        );
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn update_sets_every_value_and_filters_on_pk() {
        let mut plan = QueryPlan::new(Action::Update, "users");
        plan.values.insert("username".into(), Value::from("neo"));
        plan.values.insert("email".into(), Value::from("trinity@zion.com"));
        plan.where_clause = Some(Expression::and().and_eq("id", 1));
        let (sql, params) = render(&plan, Kind::Mysql).unwrap();
        assert_eq!(
            sql,
            "UPDATE `users` SET `username` = :username, `email` = :email WHERE (id = :id)"
        );
        assert_eq!(params["id"], Value::Int(1));
    }

    #[test]
    fn update_where_params_avoid_set_params() {
        let mut plan = QueryPlan::new(Action::Update, "users");
        plan.values.insert("email".into(), Value::from("a@b"));
        plan.where_clause = Some(Expression::and().and_eq("email", "old@b"));
        let (sql, params) = render(&plan, Kind::Mysql).unwrap();
        assert_eq!(
            sql,
            "UPDATE `users` SET `email` = :email WHERE (email = :email_2)"
        );
        assert_eq!(params["email"], Value::from("a@b"));
        assert_eq!(params["email_2"], Value::from("old@b"));
    }

    #[test]
    fn delete_filters_on_pk() {
        let mut plan = QueryPlan::new(Action::Delete, "users");
        plan.where_clause = Some(Expression::and().and_eq("id", 7));
        let (sql, params) = render(&plan, Kind::Mysql).unwrap();
        assert_eq!(sql, "DELETE FROM `users` WHERE (id = :id)");
        assert_eq!(params["id"], Value::Int(7));
    }

    #[test]
    fn count_passes_function_calls_through_quoting() {
        let mut plan = QueryPlan::new(Action::Select, "users");
        plan.alias = Some("user".into());
        plan.columns.push(ColumnRef {
            expr: "COUNT(DISTINCT user.id)".into(),
            alias: Some("count".into()),
        });
        let (sql, _) = render(&plan, Kind::Mysql).unwrap();
        assert_eq!(
            sql,
            "SELECT COUNT(DISTINCT user.id) AS `count` FROM `users` AS `user`"
        );
    }
}
