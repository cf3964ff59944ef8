mod common;

use common::*;
use ent::privacy::{from_fn, Always};
use ent::{
    Column, ColumnType, EntConfig, EntError, Id, Row, Rule, Schema, ShardKey, Value, Vc,
    GLOBAL_SHARD,
};
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

/// Insert then load by id returns the inserted fields
#[tokio::test]
async fn test_insert_then_load_round_trip() {
    let fx = forum();
    let alice = create_user(&fx.engine, "alice@example.com").await;
    let topics = fx.engine.ent("topics").unwrap();

    let fields = Row::new()
        .with("slug", "rust-tips")
        .with("creator_id", &alice)
        .with("subject", "Rust tips");
    let id = topics.insert(&vc_of(&alice), fields.clone()).await.unwrap();
    assert_eq!(id.island(), Some(0));

    let topic = topics.load_x(&vc_of(&alice), &id).await.unwrap();
    assert_eq!(topic.id(), &id);
    for (column, value) in fields.iter() {
        assert_eq!(topic.get(column), Some(value), "column {column}");
    }
    assert!(topic.get("created_at").and_then(Value::as_timestamp).is_some());
    assert_eq!(topic.vc(), &vc_of(&alice));
}

/// Creator-only topics: the creator and omniscient VCs may read, others may not
#[tokio::test]
async fn test_creator_scenario() {
    let fx = forum();
    let u1 = create_user(&fx.engine, "u1@example.com").await;
    let u2 = create_user(&fx.engine, "u2@example.com").await;
    let topics = fx.engine.ent("topics").unwrap();

    let id = topics
        .insert(&vc_of(&u1), Row::new().with("slug", "t").with("creator_id", &u1))
        .await
        .unwrap();

    assert!(topics.load(&vc_of(&u1), &id).await.is_ok());

    let err = topics.load(&vc_of(&u2), &id).await.unwrap_err();
    assert!(err.is_authorization());
    let message = err.to_string();
    assert!(message.contains(u2.as_str()), "got: {message}");
    assert!(!message.contains("\"t\""), "row data leaked: {message}");

    let omni_topic = topics.load(&omni(), &id).await.unwrap();
    assert_eq!(omni_topic.row().get_id("creator_id"), Some(&u1));
    assert!(omni_topic.vc().is_omniscient());

    // Inserting on behalf of someone else is denied before anything is written
    let err = topics
        .insert(&vc_of(&u2), Row::new().with("slug", "t2").with("creator_id", &u1))
        .await
        .unwrap_err();
    assert!(err.is_authorization());
    assert_eq!(fx.row_count(0, "topics"), 1);
}

/// The second insert_if_not_exists with the same unique key reports the existing row
#[tokio::test]
async fn test_insert_if_not_exists_twice() {
    let fx = forum();
    let users = fx.engine.ent("users").unwrap();
    let fields = Row::new().with("email", "carol@example.com").with("is_admin", false);

    let first = users.insert_if_not_exists(&omni(), fields.clone()).await.unwrap();
    assert!(first.is_some());
    let second = users.insert_if_not_exists(&omni(), fields.clone()).await.unwrap();
    assert_eq!(second, None);
    assert_eq!(fx.row_count(0, "users"), 1);

    // Plain insert treats the duplicate as a store error
    let err = users.insert(&omni(), fields).await.unwrap_err();
    assert!(matches!(err, EntError::Store { .. }));
}

/// Nullable variants return None for absent rows, strict variants NotFound
#[tokio::test]
async fn test_nullable_and_strict_variants() {
    let fx = forum();
    let alice = create_user(&fx.engine, "alice@example.com").await;
    let users = fx.engine.ent("users").unwrap();
    let vc = vc_of(&alice);

    let missing = Id::compose(0, 999);
    assert!(users.load_nullable(&vc, &missing).await.unwrap().is_none());
    assert!(users.load_x(&vc, &missing).await.unwrap_err().is_not_found());

    let key = Row::new().with("email", "nobody@example.com");
    assert!(users.load_by_nullable(&vc, key.clone()).await.unwrap().is_none());
    let err = users.load_by_x(&vc, key).await.unwrap_err();
    assert!(err.is_not_found());

    let me = users
        .load_by(&vc, Row::new().with("email", "alice@example.com"))
        .await
        .unwrap();
    assert_eq!(me.id(), &alice);

    // Non-unique lookups are rejected
    let err = users
        .load_by_nullable(&vc, Row::new().with("is_admin", false))
        .await
        .unwrap_err();
    assert!(matches!(err, EntError::Validation { .. }));
}

/// Loading a user binds the instance to a VC acting as that user
#[tokio::test]
async fn test_load_infers_principal() {
    let fx = forum();
    let users = fx.engine.ent("users").unwrap();
    let user = users
        .insert_returning(&omni(), Row::new().with("email", "dave@example.com"))
        .await
        .unwrap();

    assert_eq!(user.vc().principal().id(), Some(user.id()));
    assert!(!user.vc().is_omniscient());
    assert_eq!(user.row().get("is_admin"), Some(&Value::Null));

    let again = users.load_x(user.vc(), user.id()).await.unwrap();
    assert_eq!(again.vc(), user.vc());
}

/// insert_returning runs the load rules on the new row
#[tokio::test]
async fn test_insert_returning_checks_load_rules() {
    let fx = forum();
    let alice = create_user(&fx.engine, "alice@example.com").await;
    let users = fx.engine.ent("users").unwrap();

    // Guests may insert users but cannot read them back
    let err = users
        .insert_returning(&Vc::guest(), Row::new().with("email", "eve@example.com"))
        .await
        .unwrap_err();
    assert!(err.is_authorization());

    let topic = fx
        .engine
        .ent("topics")
        .unwrap()
        .insert_returning(&vc_of(&alice), Row::new().with("slug", "a").with("creator_id", &alice))
        .await
        .unwrap();
    assert_eq!(topic.row().get_str("slug"), Some("a"));
}

/// Comments live on their topic's island and are readable through the topic
#[tokio::test]
async fn test_comments_are_colocated_with_topics() {
    let fx = forum();
    let alice = create_user(&fx.engine, "alice@example.com").await;
    let bob = create_user(&fx.engine, "bob@example.com").await;
    let topic = fx
        .engine
        .ent("topics")
        .unwrap()
        .insert(&vc_of(&alice), Row::new().with("slug", "t").with("creator_id", &alice))
        .await
        .unwrap();
    let comments = fx.engine.ent("comments").unwrap();

    let comment = comments
        .insert(
            &vc_of(&alice),
            Row::new()
                .with("topic_id", &topic)
                .with("creator_id", &alice)
                .with("message", "first"),
        )
        .await
        .unwrap();
    assert_eq!(comment.island(), topic.island());
    assert_eq!(fx.row_count(topic.island().unwrap(), "comments"), 1);

    // Require vetoes a comment on behalf of another user
    let err = comments
        .insert(
            &vc_of(&bob),
            Row::new()
                .with("topic_id", &topic)
                .with("creator_id", &alice)
                .with("message", "spoofed"),
        )
        .await
        .unwrap_err();
    assert!(err.is_authorization());

    // Bob is the creator but cannot read the topic
    let err = comments
        .insert(
            &vc_of(&bob),
            Row::new()
                .with("topic_id", &topic)
                .with("creator_id", &bob)
                .with("message", "hi"),
        )
        .await
        .unwrap_err();
    assert!(err.is_authorization());

    assert!(comments.load_x(&vc_of(&alice), &comment).await.is_ok());
    assert!(comments.load_x(&vc_of(&bob), &comment).await.unwrap_err().is_authorization());

    // Missing affinity column
    let err = comments
        .insert(&vc_of(&alice), Row::new().with("creator_id", &alice).with("message", "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, EntError::Validation { .. }));
}

/// Hash routing is deterministic and lookups by a non-affinity key fan out
#[tokio::test]
async fn test_hashed_routing_and_fan_out() {
    let fx = forum();
    let invites = fx.engine.ent("invites").unwrap();
    let cluster = fx.engine.cluster();

    let mut ids = Vec::new();
    for n in 0..12 {
        let org = format!("org-{n}");
        let id = invites
            .insert(&Vc::guest(), Row::new().with("org", org.as_str()).with("code", format!("code-{n}")))
            .await
            .unwrap();
        let expected = cluster.resolve_island(&ShardKey::Values(vec![Value::from(org.as_str())]));
        assert_eq!(id.island(), Some(expected));
        ids.push((n, id));
    }

    for (n, id) in &ids {
        let by_code = invites
            .load_by_x(&Vc::guest(), Row::new().with("code", format!("code-{n}")))
            .await
            .unwrap();
        assert_eq!(by_code.id(), id);

        let by_id = invites.load_x(&Vc::guest(), id).await.unwrap();
        assert_eq!(by_id.row().get_str("org"), Some(format!("org-{n}").as_str()));
    }

    let total: usize = ISLANDS.iter().map(|&no| fx.row_count(no, "invites")).sum();
    assert_eq!(total, 12);

    let used: HashSet<u32> = ids.iter().filter_map(|(_, id)| id.island()).collect();
    assert!(used.len() > 1, "all invites hashed onto {used:?}");
}

/// Unique keys are enforced per island; lookups return the lowest island's match
#[tokio::test]
async fn test_unique_keys_are_scoped_to_an_island() {
    let fx = forum();
    let invites = fx.engine.ent("invites").unwrap();
    let cluster = fx.engine.cluster();
    let island_of = |org: &str| cluster.resolve_island(&ShardKey::Values(vec![Value::from(org)]));

    let home = island_of("acme");
    let (neighbour, elsewhere) = {
        let orgs: Vec<String> = (0..100).map(|n| format!("org-{n}")).collect();
        let same = orgs.iter().find(|org| island_of(org.as_str()) == home).cloned().unwrap();
        let other = orgs.iter().find(|org| island_of(org.as_str()) != home).cloned().unwrap();
        (same, other)
    };

    let first = invites
        .insert(&omni(), Row::new().with("org", "acme").with("code", "shared"))
        .await
        .unwrap();
    let second = invites
        .insert(&omni(), Row::new().with("org", elsewhere.as_str()).with("code", "shared"))
        .await
        .unwrap();
    assert_ne!(first.island(), second.island());

    let err = invites
        .insert(&omni(), Row::new().with("org", neighbour.as_str()).with("code", "shared"))
        .await
        .unwrap_err();
    assert!(matches!(err, EntError::Store { .. }));

    let found = invites
        .load_by_x(&omni(), Row::new().with("code", "shared"))
        .await
        .unwrap();
    assert_eq!(found.id().island(), first.island().min(second.island()));
}

/// Ids without an island of the topology cannot exist for sharded entities
#[tokio::test]
async fn test_unroutable_ids_are_not_found() {
    let fx = forum();
    let invites = fx.engine.ent("invites").unwrap();

    assert!(invites.load_nullable(&Vc::guest(), &Id::new("42")).await.unwrap().is_none());
    assert!(invites
        .load_nullable(&Vc::guest(), &Id::compose(7, 1))
        .await
        .unwrap()
        .is_none());
    assert!(!invites.delete(&omni(), &Id::new("abc")).await.unwrap());
}

/// Update rules must allow both the current and the proposed row
#[tokio::test]
async fn test_update_and_delete() {
    let fx = forum();
    let alice = create_user(&fx.engine, "alice@example.com").await;
    let bob = create_user(&fx.engine, "bob@example.com").await;
    let topics = fx.engine.ent("topics").unwrap();
    let id = topics
        .insert(&vc_of(&alice), Row::new().with("slug", "t").with("creator_id", &alice))
        .await
        .unwrap();

    let updated = topics
        .update(&vc_of(&alice), &id, Row::new().with("subject", "New subject"))
        .await
        .unwrap();
    assert!(updated);
    let topic = topics.load_x(&vc_of(&alice), &id).await.unwrap();
    assert_eq!(topic.row().get_str("subject"), Some("New subject"));
    assert!(topic.get("updated_at").and_then(Value::as_timestamp).is_some());

    // Handing the topic over to someone else fails the check on the new row
    let err = topics
        .update(&vc_of(&alice), &id, Row::new().with("creator_id", &bob))
        .await
        .unwrap_err();
    assert!(err.is_authorization());

    let err = topics
        .update(&vc_of(&bob), &id, Row::new().with("subject", "hijack"))
        .await
        .unwrap_err();
    assert!(err.is_authorization());

    let err = topics
        .update(&vc_of(&alice), &id, Row::new().with("id", Id::compose(0, 5)))
        .await
        .unwrap_err();
    assert!(matches!(err, EntError::Validation { .. }));

    assert!(!topics
        .update(&vc_of(&alice), &Id::compose(0, 999), Row::new().with("subject", "x"))
        .await
        .unwrap());

    assert!(topics.delete(&vc_of(&bob), &id).await.unwrap_err().is_authorization());
    assert!(topics.delete(&vc_of(&alice), &id).await.unwrap());
    assert!(!topics.delete(&vc_of(&alice), &id).await.unwrap());
    assert!(topics.load_nullable(&omni(), &id).await.unwrap().is_none());
}

/// Affinity columns are immutable
#[tokio::test]
async fn test_affinity_columns_cannot_be_updated() {
    let fx = forum();
    let invites = fx.engine.ent("invites").unwrap();
    let id = invites
        .insert(&omni(), Row::new().with("org", "acme").with("code", "c1"))
        .await
        .unwrap();

    let err = invites
        .update(&omni(), &id, Row::new().with("org", "globex"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("org"), "got: {err}");
}

/// Payload validation happens before authorization
#[tokio::test]
async fn test_invalid_payloads() {
    let fx = forum();
    let topics = fx.engine.ent("topics").unwrap();

    let err = topics
        .insert(&omni(), Row::new().with("slug", "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, EntError::Validation { .. }));

    let err = topics
        .insert(
            &omni(),
            Row::new()
                .with("slug", "x")
                .with("creator_id", Id::compose(0, 1))
                .with("created_at", chrono::Utc::now()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EntError::Validation { .. }));

    assert!(matches!(
        fx.engine.ent("posts").unwrap_err(),
        EntError::Config { .. }
    ));
}

/// A down node is a routing error, and routing skips it during the cooldown
#[tokio::test]
async fn test_down_node_is_a_routing_error() {
    let fx = forum();
    let alice = create_user(&fx.engine, "alice@example.com").await;
    let users = fx.engine.ent("users").unwrap();

    fx.take_down("island0-master");
    let err = users.load_x(&vc_of(&alice), &alice).await.unwrap_err();
    assert!(matches!(err, EntError::Routing { island: 0, .. }));
    assert!(err.is_retryable_read());

    // Back up, but still inside the cooldown window
    fx.factory.client("island0-master").unwrap().set_down(false);
    let err = users.load_x(&vc_of(&alice), &alice).await.unwrap_err();
    assert!(matches!(err, EntError::Routing { island: 0, .. }));
}

/// Many concurrent operations against the same and different islands
#[tokio::test]
async fn test_concurrent_operations() {
    let fx = forum();
    let invites = fx.engine.ent("invites").unwrap();

    let inserts = (0..50).map(|n| {
        let invites = invites.clone();
        async move {
            invites
                .insert(
                    &Vc::guest(),
                    Row::new()
                        .with("org", format!("org-{}", n % 5))
                        .with("code", format!("c-{n}")),
                )
                .await
        }
    });
    let ids = futures::future::try_join_all(inserts).await.unwrap();
    assert_eq!(ids.len(), 50);

    let mut unique = ids.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 50);
}

/// Loads whose privacy check never finishes
fn drafts() -> EntConfig {
    let schema = Schema::new(
        "drafts",
        vec![Column::primary_id(), Column::new("title", ColumnType::String)],
        &[],
    )
    .unwrap();
    EntConfig::new(schema, GLOBAL_SHARD)
        .load_rules(vec![Rule::allow_if(from_fn("Stalls", |_engine, _vc, _row| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<bool, EntError>(true)
        }))])
        .insert_rules(vec![Rule::allow_if(Always(true))])
}

async fn completes<T>(operation: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), operation)
        .await
        .expect("operation did not complete")
}

/// With one connection per node, every exit path gives the connection back
/// and nested privacy lookups never wait on their caller
#[tokio::test]
async fn test_connections_are_released_on_every_path() {
    let mut config = cluster_config();
    config.node_down_cooldown_ms = 0;
    for node in config.islands.iter_mut().flat_map(|i| i.nodes.iter_mut()) {
        node.min_connections = 1;
        node.max_connections = 1;
    }
    let fx = setup_with(config, vec![users(), topics(), comments(), invites(), drafts()]);
    let alice = create_user(&fx.engine, "alice@example.com").await;
    let bob = create_user(&fx.engine, "bob@example.com").await;
    let topics = fx.engine.ent("topics").unwrap();
    let comments = fx.engine.ent("comments").unwrap();
    let topic = topics
        .insert(&vc_of(&alice), Row::new().with("slug", "t").with("creator_id", &alice))
        .await
        .unwrap();
    let comment = comments
        .insert(
            &vc_of(&alice),
            Row::new()
                .with("topic_id", &topic)
                .with("creator_id", &alice)
                .with("message", "hi"),
        )
        .await
        .unwrap();

    // Nested topic load on the same node
    let loaded = completes(comments.load_x(&vc_of(&alice), &comment)).await.unwrap();
    assert_eq!(loaded.id(), &comment);

    // Denial
    let err = completes(comments.load_x(&vc_of(&bob), &comment)).await.unwrap_err();
    assert!(err.is_authorization());
    assert!(completes(topics.load_x(&vc_of(&alice), &topic)).await.is_ok());

    // Infrastructure failure
    fx.take_down("island0-master");
    let err = completes(topics.load_x(&vc_of(&alice), &topic)).await.unwrap_err();
    assert!(matches!(err, EntError::Routing { island: 0, .. }));
    fx.factory.client("island0-master").unwrap().set_down(false);
    assert!(completes(topics.load_x(&vc_of(&alice), &topic)).await.is_ok());

    // Cancellation mid-flight
    let drafts = fx.engine.ent("drafts").unwrap();
    let draft = drafts
        .insert(&omni(), Row::new().with("title", "wip"))
        .await
        .unwrap();
    let cancelled =
        tokio::time::timeout(Duration::from_millis(50), drafts.load_x(&vc_of(&alice), &draft)).await;
    assert!(cancelled.is_err());
    assert!(completes(topics.load_x(&vc_of(&alice), &topic)).await.is_ok());

    // Many concurrent nested loads through a single connection
    let alice_vc = vc_of(&alice);
    let loads = (0..20).map(|_| comments.load_x(&alice_vc, &comment));
    let results = completes(futures::future::join_all(loads)).await;
    assert!(results.iter().all(Result::is_ok));
}
