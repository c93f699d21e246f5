mod common;

use common::*;
use datamapper::{Criteria, Options, Record, Value};
use futures::StreamExt;

#[tokio::test]
async fn stream_yields_records_in_order() {
    let (manager, _db) = setup(base_registry()).await;

    for name in ["neo", "morpheus", "trinity", "tank"] {
        let user = Record::new("User");
        user.set("username", name).set("email", format!("{name}@zion.org"));
        manager.persist(&user).unwrap();
    }
    manager.flush().await.unwrap();

    let names: Vec<String> = {
        let mut stream = manager
            .stream_all("User", Options::default().order_by("user.username", true))
            .unwrap();
        let mut names = vec![];
        while let Some(record) = stream.next().await {
            names.push(record.unwrap().get_str("username").unwrap());
        }
        names
    };
    assert_eq!(names, vec!["morpheus", "neo", "tank", "trinity"]);
}

#[tokio::test]
async fn stream_is_single_pass_and_can_stop_early() {
    let (manager, _db) = setup(base_registry()).await;

    for i in 0..10 {
        let user = Record::new("User");
        user.set("username", format!("user{i}"))
            .set("email", format!("user{i}@zion.org"));
        manager.persist(&user).unwrap();
    }
    manager.flush().await.unwrap();

    let mut stream = manager
        .stream_by(
            "User",
            Criteria::None,
            Options::default().order_by("user.id", true),
        )
        .unwrap();
    let first = stream.next().await.unwrap().unwrap();
    let second = stream.next().await.unwrap().unwrap();
    assert_ne!(first.get_int("id"), second.get_int("id"));
    drop(stream);

    // The manager is free again once the stream is closed.
    let count = manager
        .count_by("User", Criteria::None, Options::default())
        .await
        .unwrap();
    assert_eq!(count, 10);
}

#[tokio::test]
async fn stream_groups_joined_rows_on_the_key_boundary() {
    let (manager, _db) = setup(eager_posts_registry()).await;

    for (name, posts) in [("neo", 3), ("morpheus", 1), ("switch", 0)] {
        let user = Record::new("User");
        user.set("username", name).set("email", format!("{name}@zion.org"));
        manager.persist(&user).unwrap();
        manager.flush().await.unwrap();
        for i in 0..posts {
            let post = Record::new("Post");
            post.set("title", format!("{name} #{i}"));
            post.set_related("author", Some(user.clone()));
            manager.persist(&post).unwrap();
        }
        manager.flush().await.unwrap();
    }

    // A fresh session, so everything hydrates from joined rows.
    let other = second_manager(&_db, eager_posts_registry()).await;
    let mut seen = vec![];
    {
        let mut stream = other
            .stream_by(
                "User",
                Criteria::None,
                Options::joins(["posts"]).order_by("user.id", true),
            )
            .unwrap();
        while let Some(record) = stream.next().await {
            let record = record.unwrap();
            seen.push((
                record.get_str("username").unwrap(),
                record.related_many("posts").len(),
            ));
        }
    }
    assert_eq!(
        seen,
        vec![
            ("neo".to_owned(), 3),
            ("morpheus".to_owned(), 1),
            ("switch".to_owned(), 0),
        ]
    );
}

#[tokio::test]
async fn find_by_returns_only_the_first_group() {
    let (manager, _db) = setup(eager_posts_registry()).await;

    for name in ["neo", "morpheus"] {
        let user = Record::new("User");
        user.set("username", name).set("email", format!("{name}@zion.org"));
        manager.persist(&user).unwrap();
        manager.flush().await.unwrap();
        for i in 0..2 {
            let post = Record::new("Post");
            post.set("title", format!("{name} #{i}"));
            post.set_related("author", Some(user.clone()));
            manager.persist(&post).unwrap();
        }
        manager.flush().await.unwrap();
    }

    let other = second_manager(&_db, eager_posts_registry()).await;
    let found = other
        .find_by(
            "User",
            Criteria::None,
            Options::joins(["posts"]).order_by("user.id", true),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.get("username"), Value::from("neo"));
    assert_eq!(found.related_many("posts").len(), 2);
}
