use datamapper::{
    Cascade, ColumnDescriptor, Driver, EntityDescriptor, EntityManager, Error, Expression, Fetch,
    JoinColumn, MetadataRegistry, Options, Record, Value,
};
use std::rc::Rc;
use tempfile::NamedTempFile;

fn node_descriptor() -> EntityDescriptor {
    EntityDescriptor::declare("Node", "nodes")
        .alias("node")
        .column("id", ColumnDescriptor::new("id", "int").primary_key().generated())
        .column("name", ColumnDescriptor::new("name", "varchar").length(64))
        .one_to_one(
            "partner",
            "Node",
            JoinColumn::new("partner_id", "id"),
            Fetch::Lazy,
            Cascade::PERSIST,
        )
}

async fn setup_nodes() -> (EntityManager, NamedTempFile) {
    let _ = env_logger::builder().is_test(true).try_init();
    let file = NamedTempFile::new().unwrap();
    let uri = format!("sqlite://{}?mode=rwc", file.path().to_string_lossy());
    let driver = Driver::connect(&uri, 1).await.unwrap();
    driver
        .execute_raw(
            "CREATE TABLE nodes (id INTEGER PRIMARY KEY AUTOINCREMENT, \
             name VARCHAR(64), partner_id INTEGER)",
        )
        .await
        .unwrap();
    let registry = MetadataRegistry::new();
    registry.register(node_descriptor);
    (EntityManager::new(driver, Rc::new(registry)), file)
}

#[tokio::test]
async fn mutual_references_split_on_the_nullable_fk() {
    let (manager, _db) = setup_nodes().await;

    let a = Record::new("Node");
    a.set("name", "a");
    let b = Record::new("Node");
    b.set("name", "b");
    a.set_related("partner", Some(b.clone()));
    b.set_related("partner", Some(a.clone()));

    manager.persist(&a).unwrap();
    manager.flush().await.unwrap();

    let a_id = a.get_int("id").unwrap();
    let b_id = b.get_int("id").unwrap();

    // Both rows landed and both FKs point at each other, one of them
    // patched after its partner's insert.
    let other_registry = {
        let registry = MetadataRegistry::new();
        registry.register(node_descriptor);
        registry
    };
    let uri = format!("sqlite://{}?mode=rwc", _db.path().to_string_lossy());
    let driver = Driver::connect(&uri, 1).await.unwrap();
    let other = EntityManager::new(driver, Rc::new(other_registry));
    let fresh_a = other.find_by("Node", a_id, Options::default()).await.unwrap().unwrap();
    let fresh_b = other.find_by("Node", b_id, Options::default()).await.unwrap().unwrap();
    let partner_of_a = other.fetch_related(&fresh_a, "partner").await.unwrap().unwrap();
    let partner_of_b = other.fetch_related(&fresh_b, "partner").await.unwrap().unwrap();
    assert_eq!(partner_of_a.get_int("id"), Some(b_id));
    assert_eq!(partner_of_b.get_int("id"), Some(a_id));
}

#[tokio::test]
async fn non_nullable_cycles_are_reported() {
    fn strict_node() -> EntityDescriptor {
        EntityDescriptor::declare("Node", "nodes")
            .alias("node")
            .column("id", ColumnDescriptor::new("id", "int").primary_key().generated())
            .column("name", ColumnDescriptor::new("name", "varchar").length(64))
            .one_to_one(
                "partner",
                "Node",
                JoinColumn::new("partner_id", "id").not_null(),
                Fetch::Lazy,
                Cascade::PERSIST,
            )
    }
    let _ = env_logger::builder().is_test(true).try_init();
    let file = NamedTempFile::new().unwrap();
    let uri = format!("sqlite://{}?mode=rwc", file.path().to_string_lossy());
    let driver = Driver::connect(&uri, 1).await.unwrap();
    driver
        .execute_raw(
            "CREATE TABLE nodes (id INTEGER PRIMARY KEY AUTOINCREMENT, \
             name VARCHAR(64), partner_id INTEGER NOT NULL)",
        )
        .await
        .unwrap();
    let registry = MetadataRegistry::new();
    registry.register(strict_node);
    let manager = EntityManager::new(driver, Rc::new(registry));

    let a = Record::new("Node");
    a.set("name", "a");
    let b = Record::new("Node");
    b.set("name", "b");
    a.set_related("partner", Some(b.clone()));
    b.set_related("partner", Some(a.clone()));

    manager.persist(&a).unwrap();
    let err = manager.flush().await.expect_err("cycle with no nullable edge");
    assert!(matches!(err, Error::CascadeCycle(_)));
}

#[tokio::test]
async fn expression_criteria_pass_through_to_the_where_clause() {
    let (manager, _db) = setup_nodes().await;

    for name in ["alpha", "beta", "gamma"] {
        let node = Record::new("Node");
        node.set("name", name);
        manager.persist(&node).unwrap();
    }
    manager.flush().await.unwrap();

    let matching = manager
        .find_all(
            "Node",
            Expression::and()
                .and_like("node.name", "%a")
                .and_not_in("node.name", ["beta"]),
            Options::default().order_by("node.name", true),
        )
        .await
        .unwrap();
    let names: Vec<Value> = matching.iter().map(|n| n.get("name")).collect();
    assert_eq!(names, vec![Value::from("alpha"), Value::from("gamma")]);
}
