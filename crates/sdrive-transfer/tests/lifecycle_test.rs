//! Revision lifecycle: access exclusion, conflict policy, deletion.

mod common;

use std::sync::{Arc, Mutex};

use common::{config, pattern, Harness, CLIENT_ID};
use sdrive_core::{ApiError, Revision, RevisionState, TransferError};
use sdrive_transfer::api::DriveApi;
use sdrive_transfer::{revision, ProgressFn};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn active_revision_cannot_be_written() {
    let h = Harness::new(config(16, 2));
    let active = h.upload(&pattern(20)).await.expect("upload");

    let err = revision::open_for_writing(&h.client, &h.file, &active, 20, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::InvalidState(_)));
}

#[tokio::test]
async fn draft_revision_cannot_be_read() {
    let h = Harness::new(config(16, 2));
    let draft = revision::create(&h.client, &h.file, None).await.expect("draft");
    assert!(draft.is_draft());

    let cancel = CancellationToken::new();
    let err = revision::open_for_reading(&h.client, &h.file, &draft, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::InvalidState(_)));

    // A stale local copy claiming otherwise is checked against the server.
    let claimed = Revision {
        state: RevisionState::Active,
        ..draft
    };
    let err = revision::open_for_reading(&h.client, &h.file, &claimed, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::InvalidState(_)));
    assert!(h.client.pool_usage().is_idle());
}

#[tokio::test]
async fn writer_opened_directly_finalizes_draft() {
    let h = Harness::new(config(16, 2));
    let cancel = CancellationToken::new();
    let draft = revision::create(&h.client, &h.file, None).await.expect("draft");

    let data = pattern(40);
    let writer = revision::open_for_writing(&h.client, &h.file, &draft, data.len() as u64, &cancel)
        .await
        .expect("writer");
    assert_eq!(h.client.pool_usage().upload_file, 1);

    let calls = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&calls);
    let progress: ProgressFn = Arc::new(move |done, total| sink.lock().unwrap().push((done, total)));
    let active = writer
        .write(&data[..], Vec::new(), None, Some(progress), &cancel)
        .await
        .expect("write");
    let calls = calls.lock().unwrap().clone();
    assert!(calls.iter().all(|&(_, total)| total == 40), "{calls:?}");
    assert_eq!(calls.iter().map(|&(done, _)| done).max(), Some(40));
    assert_eq!(active.id, draft.id);
    assert_eq!(active.state, RevisionState::Active);
    assert!(h.client.pool_usage().is_idle());

    let (content, _) = h.download(&active).await.expect("download");
    assert_eq!(content, data);
}

#[tokio::test]
async fn own_draft_is_resumed() {
    let h = Harness::new(config(16, 2));
    let abandoned = h
        .drive
        .create_revision(&h.file, None, CLIENT_ID)
        .await
        .expect("draft");

    let revision = h.upload(&pattern(33)).await.expect("upload");
    assert_eq!(revision.id, abandoned);
    assert_eq!(revision.state, RevisionState::Active);
}

#[tokio::test]
async fn foreign_draft_conflict_is_returned() {
    let h = Harness::new(config(16, 2));
    let foreign = h
        .drive
        .create_revision(&h.file, None, "another-client")
        .await
        .expect("draft");

    let err = h.upload(&pattern(33)).await.unwrap_err();
    match err {
        TransferError::Api(ApiError::RevisionConflict(conflict)) => {
            assert_eq!(conflict.draft_revision_id, Some(foreign));
            assert_eq!(conflict.draft_client_id.as_deref(), Some("another-client"));
        }
        other => panic!("expected a revision conflict, got {other}"),
    }
    assert!(h.client.pool_usage().is_idle());
}

#[tokio::test]
async fn obsolete_revision_can_be_deleted_but_active_cannot() {
    let h = Harness::new(config(16, 2));
    let first = h.upload(&pattern(50)).await.expect("first");
    let second = h.upload(&pattern(60)).await.expect("second");
    let blobs = h.drive.block_urls(&h.file, &first.id);
    assert_eq!(blobs.len(), 4);

    let err = h.client.delete_revision(&h.file, &second.id).await.unwrap_err();
    assert!(matches!(err, TransferError::Api(ApiError::Rejected { .. })));

    h.client
        .delete_revision(&h.file, &first.id)
        .await
        .expect("delete obsolete");
    let err = h.client.get_revision(&h.file, &first.id).await.unwrap_err();
    assert!(matches!(err, TransferError::Api(ApiError::NotFound(_))));
    for url in blobs {
        assert!(h.drive.blobs().get(&url).await.is_err(), "{url} still stored");
    }
}
