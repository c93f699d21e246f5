//! Plan builders: descriptor + criteria + options in, structured plan out.

use crate::error::{Error, Result};
use crate::expr::Expression;
use crate::metadata::{EntityDescriptor, Fetch, MetadataRegistry, RelationKind};
use crate::query::plan::{Action, ColumnRef, Join, JoinKind, QueryPlan};
use crate::record::Record;
use crate::value::Value;

/// Search criteria, normalised the same way by every manager operation:
/// a scalar is a primary-key lookup, pairs are AND-ed equalities, an
/// expression passes through.
#[derive(Debug, Clone, Default)]
pub enum Criteria {
    #[default]
    None,
    Id(Value),
    Fields(Vec<(String, Value)>),
    Expr(Expression),
}

impl Criteria {
    pub fn by(
        fields: impl IntoIterator<Item = (impl Into<String>, impl Into<Value>)>,
    ) -> Self {
        Criteria::Fields(
            fields
                .into_iter()
                .map(|(f, v)| (f.into(), v.into()))
                .collect(),
        )
    }
}

impl From<i64> for Criteria {
    fn from(id: i64) -> Self {
        Criteria::Id(Value::Int(id))
    }
}

impl From<&str> for Criteria {
    fn from(id: &str) -> Self {
        Criteria::Id(Value::from(id))
    }
}

impl From<Value> for Criteria {
    fn from(id: Value) -> Self {
        Criteria::Id(id)
    }
}

impl From<Expression> for Criteria {
    fn from(expr: Expression) -> Self {
        Criteria::Expr(expr)
    }
}

/// Query options applied verbatim to the plan.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Relation fields to join eagerly (eager-fetch relations only).
    pub joins: Vec<String>,
    pub order_by: Vec<(String, bool)>,
    pub group_by: Vec<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub distinct: bool,
}

impl Options {
    pub fn joins(fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Options {
            joins: fields.into_iter().map(Into::into).collect(),
            ..Options::default()
        }
    }

    pub fn order_by(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order_by.push((column.into(), ascending));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }
}

/// SELECT of every descriptor column aliased `{alias}_{column}`, plus the
/// columns of each requested eager relation aliased `{alias}__{field}_{column}`.
pub fn select_plan(
    registry: &MetadataRegistry,
    desc: &EntityDescriptor,
    criteria: &Criteria,
    options: &Options,
) -> Result<QueryPlan> {
    let mut plan = QueryPlan::new(Action::Select, desc.table.clone());
    let alias = desc.alias.clone();
    plan.alias = Some(alias.clone());
    for column in desc.columns.values() {
        plan.columns.push(ColumnRef {
            expr: format!("{alias}.{}", column.name),
            alias: Some(format!("{alias}_{}", column.name)),
        });
    }
    add_joins(&mut plan, registry, desc, &options.joins)?;
    plan.where_clause = criteria_expression(desc, criteria, true);
    plan.order_by = options.order_by.clone();
    plan.group_by = options.group_by.clone();
    plan.limit = options.limit;
    plan.offset = options.offset;
    plan.distinct = options.distinct;
    Ok(plan)
}

/// Joins each named relation field, provided its fetch mode is eager. Lazy
/// relations never join; their foreign-key column is already selected.
pub fn add_joins(
    plan: &mut QueryPlan,
    registry: &MetadataRegistry,
    desc: &EntityDescriptor,
    joins: &[String],
) -> Result<()> {
    let alias = desc.alias.clone();
    for field in joins {
        let relation = desc.get_relation(field).ok_or_else(|| {
            Error::invalid(format!(
                "`{}` has no relation field `{field}` to join",
                desc.type_id
            ))
        })?;
        if relation.fetch != Fetch::Eager {
            continue;
        }
        let target = registry.get(&relation.target_type)?;
        let rel_alias = desc.relation_alias(field);
        match relation.kind {
            RelationKind::OneToOne | RelationKind::ManyToOne => {
                if let Some(jc) = &relation.join_column {
                    // Owning side: our FK against the target's key.
                    plan.joins.push(Join {
                        kind: JoinKind::Left,
                        table: target.table.clone(),
                        alias: rel_alias.clone(),
                        on: vec![(
                            format!("{alias}.{}", jc.name),
                            format!("{rel_alias}.{}", jc.referenced_column),
                        )],
                    });
                } else if let Some(mapped_by) = &relation.mapped_by {
                    // Inverse side: the target's FK against our key.
                    let jc = target
                        .get_relation(mapped_by)
                        .and_then(|r| r.join_column.as_ref())
                        .ok_or_else(|| {
                            Error::invalid(format!(
                                "relation `{}.{field}` maps by a non-owning relation",
                                desc.type_id
                            ))
                        })?;
                    plan.joins.push(Join {
                        kind: JoinKind::Left,
                        table: target.table.clone(),
                        alias: rel_alias.clone(),
                        on: vec![(
                            format!("{rel_alias}.{}", jc.name),
                            format!("{alias}.{}", jc.referenced_column),
                        )],
                    });
                }
            }
            RelationKind::OneToMany => {
                let mapped_by = relation.mapped_by.as_deref().unwrap_or_default();
                let owning = target
                    .get_relation(mapped_by)
                    .and_then(|r| r.join_column.as_ref())
                    .ok_or_else(|| {
                        Error::invalid(format!(
                            "relation `{}.{field}` maps by a non-owning relation",
                            desc.type_id
                        ))
                    })?;
                plan.joins.push(Join {
                    kind: JoinKind::Left,
                    table: target.table.clone(),
                    alias: rel_alias.clone(),
                    on: vec![(
                        format!("{rel_alias}.{}", owning.name),
                        format!("{alias}.{}", owning.referenced_column),
                    )],
                });
            }
            RelationKind::ManyToMany => {
                let join_table = relation.join_table.as_ref().ok_or_else(|| {
                    Error::invalid(format!(
                        "relation `{}.{field}` declares no join table",
                        desc.type_id
                    ))
                })?;
                let link_alias = format!("{rel_alias}_link");
                plan.joins.push(Join {
                    kind: JoinKind::Left,
                    table: join_table.name.clone(),
                    alias: link_alias.clone(),
                    on: vec![(
                        format!("{link_alias}.{}", join_table.owner_fk),
                        format!("{alias}.{}", desc.primary_key_column()),
                    )],
                });
                plan.joins.push(Join {
                    kind: JoinKind::Left,
                    table: target.table.clone(),
                    alias: rel_alias.clone(),
                    on: vec![(
                        format!("{rel_alias}.{}", target.primary_key_column()),
                        format!("{link_alias}.{}", join_table.inverse_fk),
                    )],
                });
            }
        }
        for column in target.columns.values() {
            plan.columns.push(ColumnRef {
                expr: format!("{rel_alias}.{}", column.name),
                alias: Some(format!("{rel_alias}_{}", column.name)),
            });
        }
    }
    Ok(())
}

/// Normalises criteria into a WHERE expression. Columns are qualified with
/// the entity alias for SELECTs and left bare for UPDATE/DELETE; either way
/// the placeholder binds the bare column name.
pub fn criteria_expression(
    desc: &EntityDescriptor,
    criteria: &Criteria,
    qualified: bool,
) -> Option<Expression> {
    let qualify = |column: &str| {
        if qualified {
            format!("{}.{column}", desc.alias)
        } else {
            column.to_owned()
        }
    };
    match criteria {
        Criteria::None => None,
        Criteria::Id(id) => {
            let pk = desc.primary_key_column();
            Some(Expression::and().and_eq_as(qualify(pk), pk, id.clone()))
        }
        Criteria::Fields(fields) => {
            let mut expr = Expression::and();
            for (field, value) in fields {
                let column = desc.column_name(field);
                expr = expr.and_eq_as(qualify(column), column, value.clone());
            }
            Some(expr)
        }
        Criteria::Expr(expr) => Some(expr.clone()),
    }
}

pub fn insert_plan(
    registry: &MetadataRegistry,
    desc: &EntityDescriptor,
    record: &Record,
) -> QueryPlan {
    let mut plan = QueryPlan::new(Action::Insert, desc.table.clone());
    plan.values = registry.extract_for_insert(desc, record);
    plan
}

pub fn update_plan(
    registry: &MetadataRegistry,
    desc: &EntityDescriptor,
    record: &Record,
) -> QueryPlan {
    let mut plan = QueryPlan::new(Action::Update, desc.table.clone());
    plan.values = registry.extract(desc, record);
    plan.values.shift_remove(desc.primary_key_column());
    plan.where_clause = Some(Expression::and().and_eq(
        desc.primary_key_column(),
        registry.pk_value(desc, record),
    ));
    plan
}

pub fn delete_plan(
    registry: &MetadataRegistry,
    desc: &EntityDescriptor,
    record: &Record,
) -> QueryPlan {
    let mut plan = QueryPlan::new(Action::Delete, desc.table.clone());
    plan.where_clause = Some(Expression::and().and_eq(
        desc.primary_key_column(),
        registry.pk_value(desc, record),
    ));
    plan
}

/// Expression-driven DELETE; join-table maintenance goes through here.
pub fn delete_where_plan(table: impl Into<String>, expr: Expression) -> QueryPlan {
    let mut plan = QueryPlan::new(Action::Delete, table);
    plan.where_clause = Some(expr);
    plan
}

/// Plain value INSERT; join-table link rows go through here.
pub fn insert_values_plan(
    table: impl Into<String>,
    values: impl IntoIterator<Item = (String, Value)>,
) -> QueryPlan {
    let mut plan = QueryPlan::new(Action::Insert, table);
    plan.values = values.into_iter().collect();
    plan
}

/// `SELECT COUNT(…) AS count`, honouring criteria and optional joins.
pub fn count_plan(
    registry: &MetadataRegistry,
    desc: &EntityDescriptor,
    criteria: &Criteria,
    options: &Options,
) -> Result<QueryPlan> {
    let mut plan = QueryPlan::new(Action::Select, desc.table.clone());
    let alias = desc.alias.clone();
    plan.alias = Some(alias.clone());
    let expr = if options.distinct {
        format!(
            "COUNT(DISTINCT {alias}.{})",
            desc.primary_key_column()
        )
    } else {
        "COUNT(*)".to_owned()
    };
    plan.columns.push(ColumnRef {
        expr,
        alias: Some("count".into()),
    });
    add_joins(&mut plan, registry, desc, &options.joins)?;
    plan.where_clause = criteria_expression(desc, criteria, true);
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Kind;
    use crate::metadata::{Cascade, ColumnDescriptor, JoinColumn, JoinTable};
    use crate::query::render::render;

    fn user_descriptor() -> EntityDescriptor {
        EntityDescriptor::declare("User", "users")
            .alias("user")
            .column("id", ColumnDescriptor::new("id", "int").primary_key().generated())
            .column("username", ColumnDescriptor::new("username", "varchar"))
            .column("email", ColumnDescriptor::new("email", "varchar"))
            .one_to_one(
                "profile",
                "Profile",
                JoinColumn::new("profile_id", "id"),
                Fetch::Eager,
                Cascade::ALL,
            )
            .many_to_many(
                "groups",
                "Group",
                JoinTable::new("users_groups", "user_id", "group_id"),
                Fetch::Eager,
                Cascade::NONE,
            )
    }

    fn profile_descriptor() -> EntityDescriptor {
        EntityDescriptor::declare("Profile", "profiles")
            .alias("profile")
            .column("id", ColumnDescriptor::new("id", "int").primary_key().generated())
            .column("bio", ColumnDescriptor::new("bio", "varchar"))
            .one_to_one_mapped("user", "User", "profile", Fetch::Lazy, Cascade::NONE)
    }

    fn group_descriptor() -> EntityDescriptor {
        EntityDescriptor::declare("Group", "groups")
            .alias("grp")
            .column("id", ColumnDescriptor::new("id", "int").primary_key().generated())
            .column("name", ColumnDescriptor::new("name", "varchar"))
    }

    fn registry() -> MetadataRegistry {
        let registry = MetadataRegistry::new();
        registry.register(user_descriptor);
        registry.register(profile_descriptor);
        registry.register(group_descriptor);
        registry
    }

    #[test]
    fn select_matches_the_documented_wire_shape() {
        let registry = registry();
        let desc = registry.get("User").unwrap();
        let plan = select_plan(
            &registry,
            &desc,
            &Criteria::from(1),
            &Options::joins(["profile"]),
        )
        .unwrap();
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
    fn lazy_relations_do_not_join_but_keep_the_fk_column() {
        let registry = registry();
        let desc = registry.get("User").unwrap();
        let plan = select_plan(&registry, &desc, &Criteria::None, &Options::default()).unwrap();
        assert!(plan.joins.is_empty());
        let (sql, _) = render(&plan, Kind::Mysql).unwrap();
        assert!(sql.contains("`user`.`profile_id` AS `user_profile_id`"));
    }

    #[test]
    fn many_to_many_joins_go_through_the_link_table() {
        let registry = registry();
        let desc = registry.get("User").unwrap();
        let plan = select_plan(
            &registry,
            &desc,
            &Criteria::None,
            &Options::joins(["groups"]),
        )
        .unwrap();
        let (sql, _) = render(&plan, Kind::Mysql).unwrap();
        assert!(sql.contains(
            "LEFT JOIN `users_groups` AS `user__groups_link` \
             ON `user__groups_link`.`user_id` = `user`.`id`"
        ));
        assert!(sql.contains(
            "LEFT JOIN `groups` AS `user__groups` \
             ON `user__groups`.`id` = `user__groups_link`.`group_id`"
        ));
        assert!(sql.contains("`user__groups`.`name` AS `user__groups_name`"));
    }

    #[test]
    fn associative_criteria_become_anded_equalities() {
        let registry = registry();
        let desc = registry.get("User").unwrap();
        let criteria = Criteria::by([("username", "neo"), ("email", "neo@matrix.io")]);
        let plan = select_plan(&registry, &desc, &criteria, &Options::default()).unwrap();
        let (sql, params) = render(&plan, Kind::Mysql).unwrap();
        assert!(sql.ends_with(
            "WHERE (user.username = :username) AND (user.email = :email)"
        ));
        assert_eq!(params["username"], Value::from("neo"));
    }

    #[test]
    fn update_excludes_the_primary_key_from_set() {
        let registry = registry();
        let desc = registry.get("User").unwrap();
        let record = Record::new("User");
        record.set("id", 1).set("username", "neo").set("email", "a@b");
        let plan = update_plan(&registry, &desc, &record);
        let (sql, params) = render(&plan, Kind::Mysql).unwrap();
        assert_eq!(
            sql,
            "UPDATE `users` SET `username` = :username, `email` = :email, \
             `profile_id` = :profile_id WHERE (id = :id)"
        );
        assert_eq!(params["id"], Value::Int(1));
        assert_eq!(params["profile_id"], Value::Null);
    }

    #[test]
    fn count_plans_honour_distinct() {
        let registry = registry();
        let desc = registry.get("User").unwrap();
        let plan = count_plan(
            &registry,
            &desc,
            &Criteria::None,
            &Options::default().distinct(),
        )
        .unwrap();
        let (sql, _) = render(&plan, Kind::Mysql).unwrap();
        assert_eq!(
            sql,
            "SELECT COUNT(DISTINCT user.id) AS `count` FROM `users` AS `user`"
        );
    }

    #[test]
    fn insert_excludes_a_generated_primary_key() {
        let registry = registry();
        let desc = registry.get("User").unwrap();
        let record = Record::new("User");
        record.set("username", "neo").set("email", "neo@matrix.io");
        let plan = insert_plan(&registry, &desc, &record);
        let (sql, _) = render(&plan, Kind::Mysql).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO `users` (`username`, `email`, `profile_id`) \
             VALUES (:username, :email, :profile_id)"
        );
    }
}
