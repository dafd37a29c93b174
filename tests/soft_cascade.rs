#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::{Arc, Mutex};

use anyhow::Result;
use softcascade::{
    Action, Collector, DeleteError, DeletionMethod, DeletionPolicy, Mode, ModelDef, Phase,
    PolicyOverrides, Record, RecordKey, Schema, Signal, SignalBus,
};
#[path = "util.rs"]
mod util;

use DeletionMethod::{HardDelete, Skip, SoftDelete};

fn key(model: &str, pk: i64) -> RecordKey {
    RecordKey::new(model, pk)
}

/// Blog fixture plus a `pin` table that protects individual comments.
async fn pinned_comment_collector() -> Collector {
    let json = util::BLOG_SCHEMA
        .replace(
            r#"{"name": "tag", "table": "tag"}"#,
            r#"{"name": "tag", "table": "tag"}, {"name": "pin", "table": "pin"}"#,
        )
        .replace(
            r#""relations": ["#,
            r#""relations": [{"model": "pin", "column": "comment_id", "target": "comment", "on_delete": "protect"},"#,
        );
    let schema = Schema::from_json(&json).expect("pinned schema");
    let pool = util::blog_pool().await;
    util::exec_all(
        &pool,
        &[
            "CREATE TABLE pin (id INTEGER PRIMARY KEY, comment_id INTEGER NOT NULL REFERENCES comment(id))",
            "INSERT INTO pin (id, comment_id) VALUES (1, 10)",
        ],
    )
    .await;
    Collector::new(pool, Arc::new(schema))
}

fn unsafe_post() -> PolicyOverrides {
    PolicyOverrides::new().set(
        "post",
        DeletionPolicy {
            safe_deletion: false,
            ..DeletionPolicy::default()
        },
    )
}

#[tokio::test]
async fn safe_cascade_leaves_plain_dependents_and_their_children() -> Result<()> {
    let collector = util::blog_collector().await;
    let pool = collector.pool().clone();

    let mut records = vec![Record::new("post", 1)];
    let report = collector.delete(&mut records).await?;

    assert_eq!(report.method(&key("post", 1)), Some(SoftDelete));
    assert_eq!(report.method(&key("comment", 10)), Some(Skip));
    assert_eq!(report.method(&key("comment", 11)), Some(Skip));
    // Capable, but only reachable through the plain comment.
    assert_eq!(report.method(&key("reaction", 100)), Some(Skip));
    assert_eq!(report.method(&key("revision", 50)), Some(Skip));
    assert_eq!(report.method(&key("post", 2)), None);

    assert_eq!(records[0].deleted_at, Some(report.deleted_at));
    assert_eq!(
        util::deleted_at(&pool, "post", 1).await,
        Some(Some(report.deleted_at))
    );
    assert!(util::exists(&pool, "comment", 10).await);
    assert_eq!(util::deleted_at(&pool, "reaction", 100).await, Some(None));
    // Association rows survive a soft deletion by default.
    assert_eq!(
        util::count(&pool, "SELECT COUNT(*) FROM post_tag WHERE post_id = 1").await,
        1
    );
    assert_eq!(report.stats.soft_deleted, 1);
    assert_eq!(report.stats.hard_deleted, 0);
    Ok(())
}

#[tokio::test]
async fn unsafe_policy_removes_plain_dependents() -> Result<()> {
    let collector = util::blog_collector().await;
    let pool = collector.pool().clone();

    let mut records = vec![Record::new("post", 1)];
    let report = collector.delete_with(&mut records, &unsafe_post()).await?;

    assert_eq!(report.method(&key("post", 1)), Some(SoftDelete));
    assert_eq!(report.method(&key("comment", 10)), Some(HardDelete));
    assert_eq!(report.method(&key("reaction", 100)), Some(HardDelete));
    assert_eq!(report.method(&key("revision", 50)), Some(HardDelete));

    assert!(!util::exists(&pool, "comment", 10).await);
    assert!(!util::exists(&pool, "comment", 11).await);
    assert!(!util::exists(&pool, "reaction", 100).await);
    assert!(!util::exists(&pool, "revision", 50).await);
    assert!(util::exists(&pool, "comment", 12).await);
    assert!(util::deleted_at(&pool, "post", 1).await.flatten().is_some());
    assert_eq!(report.stats.hard_deleted, 4);
    Ok(())
}

#[tokio::test]
async fn delete_batches_clears_association_rows_of_soft_deleted_records() -> Result<()> {
    let collector = util::blog_collector().await;
    let pool = collector.pool().clone();
    let overrides = PolicyOverrides::new().set(
        "post",
        DeletionPolicy {
            delete_batches: true,
            ..DeletionPolicy::default()
        },
    );

    let report = collector
        .delete_with(&mut [Record::new("post", 1)], &overrides)
        .await?;

    assert_eq!(report.stats.links_removed, 1);
    assert_eq!(
        util::count(&pool, "SELECT COUNT(*) FROM post_tag WHERE post_id = 1").await,
        0
    );
    assert_eq!(
        util::count(&pool, "SELECT COUNT(*) FROM post_tag WHERE post_id = 2").await,
        1
    );
    Ok(())
}

#[tokio::test]
async fn undelete_does_not_bring_back_removed_dependents() -> Result<()> {
    let collector = util::blog_collector().await;
    let pool = collector.pool().clone();

    let mut records = vec![Record::new("post", 1)];
    collector.delete_with(&mut records, &unsafe_post()).await?;
    assert!(!records[0].is_active());

    let restored = collector.undelete(&mut records).await?;
    assert_eq!(restored, 1);
    assert!(records[0].is_active());
    assert_eq!(util::deleted_at(&pool, "post", 1).await, Some(None));
    assert!(!util::exists(&pool, "comment", 10).await);
    Ok(())
}

#[tokio::test]
async fn cascade_stamps_one_timestamp_across_models() -> Result<()> {
    let collector = util::blog_collector().await;
    let pool = collector.pool().clone();

    let report = collector.delete_keys("author", &[1]).await?;
    let stamp = Some(Some(report.deleted_at));

    assert_eq!(util::deleted_at(&pool, "author", 1).await, stamp);
    assert_eq!(util::deleted_at(&pool, "post", 1).await, stamp);
    assert_eq!(util::deleted_at(&pool, "post", 2).await, stamp);
    assert_eq!(util::deleted_at(&pool, "post", 3).await, Some(None));
    assert_eq!(report.count(SoftDelete), 3);
    assert_eq!(report.count(HardDelete), 0);
    Ok(())
}

#[tokio::test]
async fn cascade_keeps_the_timestamp_of_already_deleted_dependents() -> Result<()> {
    let seen: Arc<Mutex<Vec<RecordKey>>> = Arc::default();
    let mut signals = SignalBus::new();
    let sink = seen.clone();
    signals.connect(Arc::new(move |signal: &Signal| {
        sink.lock().unwrap().push(signal.key.clone());
    }));
    let collector = util::blog_collector().await.with_signals(signals);
    let pool = collector.pool().clone();
    util::exec_all(&pool, &["UPDATE post SET deleted_at = 1000 WHERE id = 2"]).await;

    let report = collector.delete_keys("author", &[1]).await?;

    assert_eq!(util::deleted_at(&pool, "post", 2).await, Some(Some(1000)));
    assert_eq!(
        util::deleted_at(&pool, "post", 1).await,
        Some(Some(report.deleted_at))
    );
    assert_eq!(report.method(&key("post", 2)), None);
    // Nothing below the earlier deletion is visited either.
    assert_eq!(report.method(&key("comment", 12)), None);
    assert_eq!(report.count(SoftDelete), 2);
    assert!(seen.lock().unwrap().iter().all(|k| *k != key("post", 2)));
    Ok(())
}

#[tokio::test]
async fn unsafe_cascade_still_removes_earlier_deletions_below_plain_rows() -> Result<()> {
    let collector = util::blog_collector().await;
    let pool = collector.pool().clone();
    util::exec_all(&pool, &["UPDATE reaction SET deleted_at = 1000 WHERE id = 100"]).await;

    let report = collector
        .delete_with(&mut [Record::new("post", 1)], &unsafe_post())
        .await?;

    assert_eq!(report.method(&key("reaction", 100)), Some(HardDelete));
    assert!(!util::exists(&pool, "reaction", 100).await);
    assert!(!util::exists(&pool, "comment", 10).await);
    Ok(())
}

#[tokio::test]
async fn protection_on_a_skipped_record_does_not_block() -> Result<()> {
    let collector = pinned_comment_collector().await;
    let pool = collector.pool().clone();

    let plan = collector
        .plan(&[key("post", 1)], Mode::Logical, &PolicyOverrides::default())
        .await?;
    assert_eq!(
        plan.outcomes
            .iter()
            .find(|o| o.key == key("comment", 10))
            .map(|o| o.method),
        Some(Skip)
    );
    assert!(plan.protected.is_empty());

    let report = collector.delete_keys("post", &[1]).await?;
    assert_eq!(report.method(&key("comment", 10)), Some(Skip));
    assert!(util::deleted_at(&pool, "post", 1).await.flatten().is_some());
    assert!(util::exists(&pool, "pin", 1).await);
    Ok(())
}

#[tokio::test]
async fn protection_blocks_once_the_record_would_be_removed() -> Result<()> {
    let collector = pinned_comment_collector().await;
    let pool = collector.pool().clone();

    let plan = collector
        .plan(&[key("post", 1)], Mode::Logical, &unsafe_post())
        .await?;
    assert_eq!(plan.protected, vec![key("pin", 1)]);

    let err = collector
        .delete_with(&mut [Record::new("post", 1)], &unsafe_post())
        .await
        .expect_err("pin protects comment 10");
    assert!(matches!(
        err,
        DeleteError::ProtectedReference { ref blocking } if *blocking == vec![key("pin", 1)]
    ));
    assert!(util::exists(&pool, "comment", 10).await);
    assert_eq!(util::deleted_at(&pool, "post", 1).await, Some(None));
    Ok(())
}

#[tokio::test]
async fn stopped_cascade_ignores_protections_further_down() -> Result<()> {
    let collector = pinned_comment_collector().await;
    let overrides = PolicyOverrides::new().set(
        "post",
        DeletionPolicy {
            delete_related: false,
            safe_deletion: false,
            ..DeletionPolicy::default()
        },
    );

    let plan = collector
        .plan(&[key("post", 1)], Mode::Logical, &overrides)
        .await?;
    assert_eq!(plan.outcomes.len(), 1);
    assert!(plan.protected.is_empty());

    let report = collector
        .delete_with(&mut [Record::new("post", 1)], &overrides)
        .await?;
    assert_eq!(report.outcomes.len(), 1);
    assert!(util::exists(collector.pool(), "comment", 10).await);
    Ok(())
}

#[tokio::test]
async fn protected_reference_aborts_before_any_write() -> Result<()> {
    let collector = util::blog_collector().await;
    let pool = collector.pool().clone();

    let err = collector
        .delete_keys("author", &[2])
        .await
        .expect_err("invoice protects author 2");
    match err {
        DeleteError::ProtectedReference { blocking } => {
            assert_eq!(blocking, vec![key("invoice", 1)]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(util::deleted_at(&pool, "author", 2).await, Some(None));
    assert_eq!(util::deleted_at(&pool, "post", 3).await, Some(None));
    Ok(())
}

#[tokio::test]
async fn purge_removes_cascade_and_nulls_optional_references() -> Result<()> {
    let collector = util::blog_collector().await;
    let pool = collector.pool().clone();

    let mut records = vec![Record::new("post", 1)];
    let report = collector.purge(&mut records).await?;

    assert_eq!(report.mode, Mode::Purge);
    assert_eq!(records[0].pk, None);
    assert!(!util::exists(&pool, "post", 1).await);
    assert!(!util::exists(&pool, "comment", 10).await);
    assert!(!util::exists(&pool, "reaction", 100).await);
    assert!(!util::exists(&pool, "revision", 50).await);
    assert_eq!(
        util::count(&pool, "SELECT COUNT(*) FROM post_tag WHERE post_id = 1").await,
        0
    );
    assert_eq!(
        util::count(&pool, "SELECT COUNT(*) FROM bookmark WHERE id = 7 AND post_id IS NULL").await,
        1
    );
    assert_eq!(report.stats.references_cleared, 1);
    assert_eq!(report.stats.links_removed, 1);
    Ok(())
}

#[tokio::test]
async fn failing_statement_rolls_back_the_whole_run() -> Result<()> {
    let collector = util::blog_collector().await;
    let pool = collector.pool().clone();
    util::exec_all(
        &pool,
        &["CREATE TRIGGER pin_comment BEFORE DELETE ON comment BEGIN SELECT RAISE(ABORT, 'comment is pinned'); END"],
    )
    .await;

    let mut records = vec![Record::new("post", 1)];
    let err = collector
        .delete_with(&mut records, &unsafe_post())
        .await
        .expect_err("trigger aborts the comment delete");
    assert!(matches!(err, DeleteError::Transaction(_)), "got {err:?}");

    // reaction rows go before comments, so this proves the rollback.
    assert!(util::exists(&pool, "reaction", 100).await);
    assert!(util::exists(&pool, "revision", 50).await);
    assert_eq!(util::deleted_at(&pool, "post", 1).await, Some(None));
    assert!(records[0].is_active());
    Ok(())
}

#[tokio::test]
async fn signals_wrap_the_statements_and_skip_auto_created_models() -> Result<()> {
    let seen: Arc<Mutex<Vec<(Phase, RecordKey, DeletionMethod)>>> = Arc::default();
    let mut signals = SignalBus::new();
    let sink = seen.clone();
    signals.connect(Arc::new(move |signal: &Signal| {
        sink.lock()
            .unwrap()
            .push((signal.phase, signal.key.clone(), signal.method));
    }));
    let collector = util::blog_collector().await;
    let collector = collector.with_signals(signals);

    collector.delete_keys("post", &[1]).await?;

    let seen = seen.lock().unwrap();
    let pre: Vec<_> = seen.iter().filter(|s| s.0 == Phase::PreDelete).collect();
    let post: Vec<_> = seen.iter().filter(|s| s.0 == Phase::PostDelete).collect();
    // post#1, comment#10, comment#11, reaction#100; revision is auto-created.
    assert_eq!(pre.len(), 4);
    assert_eq!(post.len(), 4);
    assert!(seen[..4].iter().all(|s| s.0 == Phase::PreDelete));
    assert!(seen.iter().all(|s| s.1.model != "revision"));
    assert!(pre
        .iter()
        .any(|s| s.1 == key("comment", 10) && s.2 == Skip));
    assert!(pre
        .iter()
        .any(|s| s.1 == key("post", 1) && s.2 == SoftDelete));
    Ok(())
}

#[tokio::test]
async fn permission_gate_guards_roots_and_mutated_models() -> Result<()> {
    let gate = |action: Action, model: &ModelDef| !(action == Action::Delete && model.name == "comment");
    let collector = util::blog_collector().await.with_gate(Arc::new(gate));
    let pool = collector.pool().clone();

    // Comments are only skipped here, so the gate is not consulted for them.
    collector.delete_keys("post", &[2]).await?;

    let err = collector
        .delete_with(&mut [Record::new("post", 1)], &unsafe_post())
        .await
        .expect_err("comments would be removed");
    assert!(matches!(
        err,
        DeleteError::PermissionDenied { action: Action::Delete, ref model } if model == "comment"
    ));
    assert_eq!(util::deleted_at(&pool, "post", 1).await, Some(None));

    let err = collector
        .delete_keys("comment", &[12])
        .await
        .expect_err("comment roots are refused");
    assert!(matches!(err, DeleteError::PermissionDenied { .. }));
    Ok(())
}

#[tokio::test]
async fn invalid_roots_are_rejected() -> Result<()> {
    let collector = util::blog_collector().await;

    let mut unsaved = Record::new("post", 1);
    unsaved.pk = None;
    let err = collector.delete(&mut [unsaved]).await.unwrap_err();
    assert!(matches!(err, DeleteError::InvalidOperation(_)));

    let err = collector.delete_keys("ghost", &[1]).await.unwrap_err();
    assert!(matches!(err, DeleteError::UnknownModel(name) if name == "ghost"));

    let err = collector
        .undelete(&mut [Record::new("comment", 10)])
        .await
        .unwrap_err();
    assert!(matches!(err, DeleteError::InvalidOperation(_)));
    Ok(())
}

#[tokio::test]
async fn disabled_cascade_touches_only_the_root() -> Result<()> {
    let collector = util::blog_collector().await;
    let overrides = PolicyOverrides::new().set(
        "author",
        DeletionPolicy {
            delete_related: false,
            ..DeletionPolicy::default()
        },
    );

    let report = collector
        .delete_with(&mut [Record::new("author", 1)], &overrides)
        .await?;
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(util::deleted_at(collector.pool(), "post", 1).await, Some(None));
    Ok(())
}

#[tokio::test]
async fn plan_reports_without_writing() -> Result<()> {
    let collector = util::blog_collector().await;
    let pool = collector.pool().clone();

    let plan = collector
        .plan(&[key("post", 1)], Mode::Logical, &unsafe_post())
        .await?;
    assert_eq!(plan.count(HardDelete), 4);
    assert_eq!(plan.count(SoftDelete), 1);
    assert!(plan.protected.is_empty());
    assert!(util::exists(&pool, "comment", 10).await);
    assert_eq!(util::deleted_at(&pool, "post", 1).await, Some(None));

    let plan = collector
        .plan(&[key("author", 2)], Mode::Logical, &PolicyOverrides::default())
        .await?;
    assert_eq!(plan.protected, vec![key("invoice", 1)]);
    Ok(())
}
