use std::sync::Arc;
use std::time::Duration;

use asset_pipeline::contract::{
    MockBucketFinder, MockEventRecorder, MockLoader, MockMetadataExtractor, MockMutator, MockStore,
    MockValidator,
};
use asset_pipeline::engine::EngineResult;
use asset_pipeline::error::AssetError;
use asset_pipeline::loader::LoadedAsset;
use asset_pipeline::model::{
    AssetFile, AssetSpec, AssetStatus, BucketStatus, Message, ObjectMeta, Phase, PublishedRef,
    Reason, ServiceDescriptor, FINALIZER,
};
use asset_pipeline::pipeline::ContentPipeline;
use asset_pipeline::reconciler::{Action, AssetReconciler};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

const RELIST: Duration = Duration::from_secs(300);

/// Collaborators for one reconciler; tests set expectations before `build`.
#[derive(Default)]
struct Harness {
    buckets: MockBucketFinder,
    store: MockStore,
    loader: MockLoader,
    mutator: MockMutator,
    validator: MockValidator,
    metadata: MockMetadataExtractor,
    pipeline_events: MockEventRecorder,
    events: MockEventRecorder,
}

impl Harness {
    fn quiet() -> Self {
        let mut harness = Harness::default();
        harness.events.expect_record().returning(|_, _, _, _| ());
        harness.pipeline_events.expect_record().returning(|_, _, _, _| ());
        harness
    }

    fn build(self) -> AssetReconciler {
        let store = Arc::new(self.store);
        let pipeline = ContentPipeline::new(
            Arc::new(self.loader),
            Arc::new(self.mutator),
            Arc::new(self.validator),
            Arc::new(self.metadata),
            store.clone(),
            Arc::new(self.pipeline_events),
        );
        AssetReconciler::new(
            Arc::new(self.buckets),
            store,
            pipeline,
            Arc::new(self.events),
            RELIST,
        )
    }
}

fn meta(generation: i64) -> ObjectMeta {
    ObjectMeta {
        name: "docs".into(),
        namespace: "default".into(),
        generation,
        resource_version: 1,
        deletion_requested: false,
        finalizers: vec![FINALIZER.to_string()],
    }
}

fn spec() -> AssetSpec {
    let mut spec = AssetSpec::default();
    spec.source.url = "https://example.com/docs.zip".into();
    spec.bucket_ref.name = "public".into();
    spec
}

fn ready_bucket() -> BucketStatus {
    BucketStatus {
        remote_name: "default-public".into(),
        url: "https://cdn.example.com/default-public".into(),
        ready: true,
    }
}

fn status(phase: Phase, reason: Reason, heartbeat: DateTime<Utc>) -> AssetStatus {
    AssetStatus {
        phase: Some(phase),
        reason: Some(reason),
        message: reason.message(None),
        last_heartbeat_time: Some(heartbeat),
        observed_generation: 1,
        published_ref: PublishedRef::default(),
    }
}

fn published() -> PublishedRef {
    PublishedRef {
        base_url: "https://cdn.example.com/default-public/default/docs".into(),
        files: vec![AssetFile {
            name: "a.md".into(),
            metadata: None,
        }],
    }
}

fn loaded(files: &[&str]) -> LoadedAsset {
    let dir = tempdir().unwrap();
    for file in files {
        std::fs::write(dir.path().join(file), "content").unwrap();
    }
    LoadedAsset::new(dir, files.iter().map(|f| f.to_string()).collect())
}

async fn handle(
    reconciler: &AssetReconciler,
    now: DateTime<Utc>,
    meta: &ObjectMeta,
    spec: &AssetSpec,
    status: &AssetStatus,
) -> Option<AssetStatus> {
    reconciler
        .handle(&CancellationToken::new(), now, meta, spec, status)
        .await
        .expect("handle should not error")
}

/// Ready, current generation, heartbeat inside the relist interval: no write.
#[tokio::test]
async fn test_ready_within_relist_is_idempotent() {
    let reconciler = Harness::default().build();
    let now = Utc::now();
    let current = AssetStatus {
        published_ref: published(),
        ..status(Phase::Ready, Reason::Uploaded, now - ChronoDuration::seconds(10))
    };

    assert_eq!(reconciler.next_action(now, &meta(1), &current), Action::Skip);
    assert_eq!(handle(&reconciler, now, &meta(1), &spec(), &current).await, None);
}

#[tokio::test]
async fn test_new_generation_is_scheduled() {
    let mut harness = Harness::default();
    harness
        .events
        .expect_record()
        .withf(|_, _, reason, _| *reason == Reason::Scheduled)
        .times(1)
        .returning(|_, _, _, _| ());
    let reconciler = harness.build();
    let now = Utc::now();

    let next = handle(&reconciler, now, &meta(1), &spec(), &AssetStatus::default())
        .await
        .expect("status");
    assert_eq!(next.phase, Some(Phase::Pending));
    assert_eq!(next.reason, Some(Reason::Scheduled));
    assert_eq!(next.observed_generation, 1);
    assert_eq!(next.last_heartbeat_time, Some(now));
}

#[tokio::test]
async fn test_spec_change_deletes_previous_content_first() {
    let mut harness = Harness::quiet();
    harness
        .buckets
        .expect_find_bucket()
        .returning(|_, _| Ok(Some(ready_bucket())));
    harness
        .store
        .expect_list_objects()
        .withf(|bucket, prefix| bucket == "default-public" && prefix == "default/docs")
        .returning(|_, _| Ok(vec!["default/docs/a.md".into()]));
    harness
        .store
        .expect_delete_objects()
        .times(1)
        .returning(|_, _| Ok(()));
    let reconciler = harness.build();

    let previous = AssetStatus {
        published_ref: published(),
        ..status(Phase::Ready, Reason::Uploaded, Utc::now())
    };
    let next = handle(&reconciler, Utc::now(), &meta(2), &spec(), &previous)
        .await
        .expect("status");
    assert_eq!(next.reason, Some(Reason::Scheduled));
    assert_eq!(next.observed_generation, 2);
}

#[tokio::test]
async fn test_spec_change_cleanup_failure_is_reported() {
    let mut harness = Harness::quiet();
    harness
        .buckets
        .expect_find_bucket()
        .returning(|_, _| Ok(Some(ready_bucket())));
    harness
        .store
        .expect_list_objects()
        .returning(|_, _| Err(AssetError::Store("listing denied".into())));
    let reconciler = harness.build();

    let previous = AssetStatus {
        published_ref: published(),
        ..status(Phase::Ready, Reason::Uploaded, Utc::now())
    };
    let next = handle(&reconciler, Utc::now(), &meta(2), &spec(), &previous)
        .await
        .expect("status");
    assert_eq!(next.phase, Some(Phase::Failed));
    assert_eq!(next.reason, Some(Reason::CleanupError));
    assert!(next.message.contains("listing denied"));
}

#[tokio::test]
async fn test_ready_after_relist_detects_missing_content() {
    let mut harness = Harness::quiet();
    harness
        .buckets
        .expect_find_bucket()
        .returning(|_, _| Ok(Some(ready_bucket())));
    harness
        .store
        .expect_contains_all_objects()
        .withf(|_, prefix, files| prefix == "default/docs" && files == ["a.md".to_string()])
        .returning(|_, _, _| Ok(false));
    let reconciler = harness.build();

    let now = Utc::now();
    let current = AssetStatus {
        published_ref: published(),
        ..status(Phase::Ready, Reason::Uploaded, now - ChronoDuration::seconds(301))
    };
    let next = handle(&reconciler, now, &meta(1), &spec(), &current)
        .await
        .expect("status");
    assert_eq!(next.phase, Some(Phase::Failed));
    assert_eq!(next.reason, Some(Reason::MissingContent));
}

#[tokio::test]
async fn test_ready_after_relist_refreshes_heartbeat() {
    let mut harness = Harness::quiet();
    harness
        .buckets
        .expect_find_bucket()
        .returning(|_, _| Ok(Some(ready_bucket())));
    harness
        .store
        .expect_contains_all_objects()
        .returning(|_, _, _| Ok(true));
    let reconciler = harness.build();

    let now = Utc::now();
    let current = AssetStatus {
        published_ref: published(),
        ..status(Phase::Ready, Reason::Uploaded, now - ChronoDuration::seconds(600))
    };
    let next = handle(&reconciler, now, &meta(1), &spec(), &current)
        .await
        .expect("status");
    assert_eq!(next.phase, Some(Phase::Ready));
    assert_eq!(next.last_heartbeat_time, Some(now));
    assert_eq!(next.published_ref, published());
}

#[tokio::test]
async fn test_verification_error_is_reported() {
    let mut harness = Harness::quiet();
    harness
        .buckets
        .expect_find_bucket()
        .returning(|_, _| Ok(Some(ready_bucket())));
    harness
        .store
        .expect_contains_all_objects()
        .returning(|_, _, _| Err(AssetError::Store("unreachable".into())));
    let reconciler = harness.build();

    let now = Utc::now();
    let current = status(Phase::Ready, Reason::Uploaded, now - ChronoDuration::seconds(600));
    let next = handle(&reconciler, now, &meta(1), &spec(), &current)
        .await
        .expect("status");
    assert_eq!(next.reason, Some(Reason::RemoteContentVerificationError));
}

/// A missing bucket parks the asset until the relist interval has passed.
#[tokio::test]
async fn test_bucket_not_ready_waits_for_relist() {
    let mut harness = Harness::quiet();
    harness
        .buckets
        .expect_find_bucket()
        .times(1)
        .returning(|_, _| Ok(None));
    let reconciler = harness.build();

    let now = Utc::now();
    let scheduled = status(Phase::Pending, Reason::Scheduled, now);
    let parked = handle(&reconciler, now, &meta(1), &spec(), &scheduled)
        .await
        .expect("status");
    assert_eq!(parked.phase, Some(Phase::Pending));
    assert_eq!(parked.reason, Some(Reason::BucketNotReady));

    let later = now + ChronoDuration::seconds(30);
    assert_eq!(handle(&reconciler, later, &meta(1), &spec(), &parked).await, None);
    assert_eq!(
        reconciler.next_action(now + ChronoDuration::seconds(300), &meta(1), &parked),
        Action::Publish
    );
}

#[tokio::test]
async fn test_bucket_lookup_error_fails_asset() {
    let mut harness = Harness::quiet();
    harness
        .buckets
        .expect_find_bucket()
        .returning(|_, _| Err(AssetError::Bucket("api down".into())));
    let reconciler = harness.build();

    let now = Utc::now();
    let next = handle(&reconciler, now, &meta(1), &spec(), &status(Phase::Pending, Reason::Scheduled, now))
        .await
        .expect("status");
    assert_eq!(next.phase, Some(Phase::Failed));
    assert_eq!(next.reason, Some(Reason::BucketError));
}

#[tokio::test]
async fn test_input_failures_are_not_retried() {
    let reconciler = Harness::default().build();
    let now = Utc::now();
    for reason in [Reason::ValidationFailed, Reason::MutationFailed] {
        let failed = status(Phase::Failed, reason, now - ChronoDuration::days(1));
        assert_eq!(reconciler.next_action(now, &meta(1), &failed), Action::Skip);
    }
}

#[tokio::test]
async fn test_retryable_failure_is_retried_after_relist() {
    let reconciler = Harness::default().build();
    let now = Utc::now();
    let failed = status(Phase::Failed, Reason::UploadFailed, now - ChronoDuration::seconds(10));
    assert_eq!(reconciler.next_action(now, &meta(1), &failed), Action::Skip);
    let stale = status(Phase::Failed, Reason::UploadFailed, now - ChronoDuration::seconds(400));
    assert_eq!(reconciler.next_action(now, &meta(1), &stale), Action::Retry);
}

#[tokio::test]
async fn test_pending_publishes_with_metadata() {
    let mut harness = Harness::quiet();
    harness
        .buckets
        .expect_find_bucket()
        .returning(|_, _| Ok(Some(ready_bucket())));
    harness
        .store
        .expect_list_objects()
        .returning(|_, _| Ok(Vec::new()));
    harness
        .loader
        .expect_load()
        .times(1)
        .returning(|_, _, _, _| Ok(loaded(&["a.md", "b.md"])));
    harness.metadata.expect_extract().times(1).returning(|_, _, _, _, _| {
        Ok(asset_pipeline::hooks::MetadataResult {
            files: vec![asset_pipeline::hooks::FileMetadata {
                file_name: "a.md".into(),
                metadata: serde_json::json!({"title": "A"}),
            }],
            result: EngineResult::succeeded(),
        })
    });
    harness
        .store
        .expect_put_objects()
        .withf(|bucket, prefix, _, files| {
            bucket == "default-public" && prefix == "default/docs" && files.len() == 2
        })
        .times(1)
        .returning(|_, _, _, _| Ok(()));
    let reconciler = harness.build();

    let mut spec = spec();
    spec.source.metadata_webhook_service = vec![ServiceDescriptor {
        name: "meta".into(),
        namespace: "hooks".into(),
        ..Default::default()
    }];
    let now = Utc::now();
    let next = handle(&reconciler, now, &meta(1), &spec, &status(Phase::Pending, Reason::Scheduled, now))
        .await
        .expect("status");

    assert_eq!(next.phase, Some(Phase::Ready));
    assert_eq!(next.reason, Some(Reason::Uploaded));
    assert_eq!(
        next.published_ref.base_url,
        "https://cdn.example.com/default-public/default/docs"
    );
    assert_eq!(next.published_ref.files.len(), 2);
    assert_eq!(
        next.published_ref.files[0].metadata,
        Some(serde_json::json!({"title": "A"}))
    );
    assert_eq!(next.published_ref.files[1].metadata, None);
}

#[tokio::test]
async fn test_mutation_failure_blocks_upload() {
    let mut harness = Harness::quiet();
    harness
        .buckets
        .expect_find_bucket()
        .returning(|_, _| Ok(Some(ready_bucket())));
    harness
        .store
        .expect_list_objects()
        .returning(|_, _| Ok(Vec::new()));
    harness
        .loader
        .expect_load()
        .returning(|_, _, _, _| Ok(loaded(&["a.md"])));
    harness.mutator.expect_mutate().returning(|_, _, _, _, _| {
        let mut result = EngineResult::default();
        result
            .messages
            .insert("hooks/rewrite".into(), vec![Message::new("a.md", "no")]);
        Ok(result)
    });
    harness.store.expect_put_objects().never();
    let reconciler = harness.build();

    let mut spec = spec();
    spec.source.mutation_webhook_service = vec![ServiceDescriptor::default()];
    let now = Utc::now();
    let next = handle(&reconciler, now, &meta(1), &spec, &status(Phase::Pending, Reason::Scheduled, now))
        .await
        .expect("status");
    assert_eq!(next.phase, Some(Phase::Failed));
    assert_eq!(next.reason, Some(Reason::MutationFailed));
    assert!(next.message.contains("a.md"));
}

#[tokio::test]
async fn test_pull_failure_is_reported() {
    let mut harness = Harness::quiet();
    harness
        .buckets
        .expect_find_bucket()
        .returning(|_, _| Ok(Some(ready_bucket())));
    harness
        .store
        .expect_list_objects()
        .returning(|_, _| Ok(Vec::new()));
    harness.loader.expect_load().returning(|_, _, _, _| {
        Err(AssetError::PathTraversal {
            entry: "../x".into(),
        })
    });
    let reconciler = harness.build();

    let now = Utc::now();
    let next = handle(&reconciler, now, &meta(1), &spec(), &status(Phase::Pending, Reason::Scheduled, now))
        .await
        .expect("status");
    assert_eq!(next.reason, Some(Reason::PullingFailed));
}

#[tokio::test]
async fn test_delete_removes_content_when_bucket_ready() {
    let mut harness = Harness::quiet();
    harness
        .buckets
        .expect_find_bucket()
        .returning(|_, _| Ok(Some(ready_bucket())));
    harness
        .store
        .expect_list_objects()
        .returning(|_, _| Ok(vec!["default/docs/a.md".into()]));
    harness
        .store
        .expect_delete_objects()
        .withf(|bucket, prefix| bucket == "default-public" && prefix == "default/docs")
        .times(1)
        .returning(|_, _| Ok(()));
    let reconciler = harness.build();

    let mut deleting = meta(1);
    deleting.deletion_requested = true;
    let current = status(Phase::Ready, Reason::Uploaded, Utc::now());
    assert_eq!(handle(&reconciler, Utc::now(), &deleting, &spec(), &current).await, None);
}

#[tokio::test]
async fn test_delete_surfaces_store_errors() {
    let mut harness = Harness::quiet();
    harness
        .buckets
        .expect_find_bucket()
        .returning(|_, _| Ok(Some(ready_bucket())));
    harness
        .store
        .expect_list_objects()
        .returning(|_, _| Err(AssetError::Store("denied".into())));
    let reconciler = harness.build();

    let mut deleting = meta(1);
    deleting.deletion_requested = true;
    let result = reconciler
        .handle(
            &CancellationToken::new(),
            Utc::now(),
            &deleting,
            &spec(),
            &AssetStatus::default(),
        )
        .await;
    assert!(matches!(result, Err(AssetError::Store(_))));
}
