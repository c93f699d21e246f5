#![allow(dead_code)]

use datamapper::{
    Cascade, ColumnDescriptor, Driver, EntityDescriptor, EntityManager, Fetch, JoinColumn,
    JoinTable, MetadataRegistry,
};
use std::rc::Rc;
use tempfile::NamedTempFile;

pub fn user_descriptor() -> EntityDescriptor {
    EntityDescriptor::declare("User", "users")
        .alias("user")
        .column("id", ColumnDescriptor::new("id", "int").primary_key().generated())
        .column("username", ColumnDescriptor::new("username", "varchar").length(255))
        .column("email", ColumnDescriptor::new("email", "varchar").length(255))
        .column(
            "status",
            ColumnDescriptor::new("status", "varchar").length(32).default_value("active"),
        )
        .one_to_one(
            "profile",
            "Profile",
            JoinColumn::new("profile_id", "id"),
            Fetch::Eager,
            Cascade::ALL,
        )
        .one_to_many("posts", "Post", "author", Fetch::Lazy, Cascade::REMOVE)
        .many_to_many(
            "groups",
            "Group",
            JoinTable::new("users_groups", "user_id", "group_id"),
            Fetch::Lazy,
            Cascade::PERSIST,
        )
}

/// Same entity, but posts join eagerly; used by the row-grouping tests.
pub fn user_eager_posts_descriptor() -> EntityDescriptor {
    EntityDescriptor::declare("User", "users")
        .alias("user")
        .column("id", ColumnDescriptor::new("id", "int").primary_key().generated())
        .column("username", ColumnDescriptor::new("username", "varchar").length(255))
        .column("email", ColumnDescriptor::new("email", "varchar").length(255))
        .column(
            "status",
            ColumnDescriptor::new("status", "varchar").length(32).default_value("active"),
        )
        .one_to_one(
            "profile",
            "Profile",
            JoinColumn::new("profile_id", "id"),
            Fetch::Eager,
            Cascade::ALL,
        )
        .one_to_many("posts", "Post", "author", Fetch::Eager, Cascade::REMOVE)
}

pub fn profile_descriptor() -> EntityDescriptor {
    EntityDescriptor::declare("Profile", "profiles")
        .alias("profile")
        .column("id", ColumnDescriptor::new("id", "int").primary_key().generated())
        .column("bio", ColumnDescriptor::new("bio", "varchar").length(255))
        .one_to_one_mapped("user", "User", "profile", Fetch::Lazy, Cascade::NONE)
}

pub fn post_descriptor() -> EntityDescriptor {
    EntityDescriptor::declare("Post", "posts")
        .alias("post")
        .column("id", ColumnDescriptor::new("id", "int").primary_key().generated())
        .column("title", ColumnDescriptor::new("title", "varchar").length(255))
        .many_to_one(
            "author",
            "User",
            JoinColumn::new("author_id", "id").not_null(),
            Fetch::Lazy,
            Cascade::NONE,
        )
}

pub fn group_descriptor() -> EntityDescriptor {
    EntityDescriptor::declare("Group", "groups")
        .alias("grp")
        .column("id", ColumnDescriptor::new("id", "int").primary_key().generated())
        .column("name", ColumnDescriptor::new("name", "varchar").length(255))
}

pub fn base_registry() -> MetadataRegistry {
    let registry = MetadataRegistry::new();
    registry.register(user_descriptor);
    registry.register(profile_descriptor);
    registry.register(post_descriptor);
    registry.register(group_descriptor);
    registry
}

pub fn eager_posts_registry() -> MetadataRegistry {
    let registry = MetadataRegistry::new();
    registry.register(user_eager_posts_descriptor);
    registry.register(profile_descriptor);
    registry.register(post_descriptor);
    registry.register(group_descriptor);
    registry
}

pub async fn create_schema(driver: &Driver) {
    for ddl in [
        "CREATE TABLE profiles (id INTEGER PRIMARY KEY AUTOINCREMENT, bio VARCHAR(255))",
        "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, \
         username VARCHAR(255), email VARCHAR(255), status VARCHAR(32), \
         profile_id INTEGER REFERENCES profiles(id) ON DELETE RESTRICT)",
        "CREATE TABLE posts (id INTEGER PRIMARY KEY AUTOINCREMENT, title VARCHAR(255), \
         author_id INTEGER NOT NULL REFERENCES users(id) ON DELETE RESTRICT)",
        "CREATE TABLE groups (id INTEGER PRIMARY KEY AUTOINCREMENT, name VARCHAR(255))",
        "CREATE TABLE users_groups (user_id INTEGER NOT NULL, group_id INTEGER NOT NULL)",
    ] {
        driver.execute_raw(ddl).await.unwrap();
    }
}

pub fn db_uri(file: &NamedTempFile) -> String {
    format!("sqlite://{}?mode=rwc", file.path().to_string_lossy())
}

/// Fresh database with the standard schema; the temp file guards its
/// lifetime and must stay in scope for the duration of the test.
pub async fn setup(registry: MetadataRegistry) -> (EntityManager, NamedTempFile) {
    let _ = env_logger::builder().is_test(true).try_init();
    let file = NamedTempFile::new().unwrap();
    let driver = Driver::connect(&db_uri(&file), 1).await.unwrap();
    driver.execute_raw("PRAGMA foreign_keys=ON;").await.unwrap();
    create_schema(&driver).await;
    (EntityManager::new(driver, Rc::new(registry)), file)
}

/// A second session over the same database file, with its own identity
/// cache and unit of work.
pub async fn second_manager(file: &NamedTempFile, registry: MetadataRegistry) -> EntityManager {
    let driver = Driver::connect(&db_uri(file), 1).await.unwrap();
    EntityManager::new(driver, Rc::new(registry))
}
