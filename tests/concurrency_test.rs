//! Concurrent access to upload sessions.

mod common;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Duration;

use common::{chunks, payload, TestEnv};
use filevault::file::{CacheFlusher, FileNodeRepository, UploadSessionRepository};
use filevault::{AccessMode, ErrorKind};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_chunk_writes() {
    let env = Arc::new(TestEnv::local().await);
    let (owner, root) = env.account("alice").await;
    let data = Arc::new(payload(16 * 8 + 5, 9));

    let created = env
        .vault
        .uploads
        .create_new_file(owner, root, "parallel.bin", "", data.len() as u64)
        .await
        .unwrap();
    let plan = created.plan.unwrap();
    let id = created.file.id;
    assert_eq!(plan.chunk_count, 9);

    let mut handles = Vec::new();
    for index in 0..plan.chunk_count {
        let env = Arc::clone(&env);
        let data = Arc::clone(&data);
        handles.push(tokio::spawn(async move {
            let start = plan.offset_of(index) as usize;
            let len = plan.chunk_len(index).unwrap() as usize;
            env.vault
                .uploads
                .upload_chunk(owner, id, index, &data[start..start + len])
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert!(env
        .vault
        .uploads
        .list_missing_chunks(owner, id)
        .await
        .unwrap()
        .is_empty());
    env.vault.uploads.complete_file(owner, id).await.unwrap();
    assert_eq!(env.read_all(owner, id).await, *data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_chunk_written_concurrently() {
    let env = Arc::new(TestEnv::memory().await);
    let (owner, root) = env.account("alice").await;
    let data = payload(32, 2);

    let created = env
        .vault
        .uploads
        .create_new_file(owner, root, "dup.bin", "", 32)
        .await
        .unwrap();
    let id = created.file.id;

    let mut handles = Vec::new();
    for _ in 0..6 {
        let env = Arc::clone(&env);
        let chunk = data[..16].to_vec();
        handles.push(tokio::spawn(async move {
            env.vault.uploads.upload_chunk(owner, id, 0, &chunk).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let status = env.vault.uploads.upload_status(owner, id).await.unwrap();
    assert_eq!(status.missing_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_hydration_loads_once() {
    let env = TestEnv::local().await;
    let (owner, root) = env.account("alice").await;
    let created = env
        .vault
        .uploads
        .create_new_file(owner, root, "cold.bin", "", 64)
        .await
        .unwrap();
    let id = created.file.id;

    let env = Arc::new(env.reopen().await);
    assert_eq!(env.vault.cache.hydration_count(), 0);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let env = Arc::clone(&env);
        handles.push(tokio::spawn(async move {
            env.vault.uploads.upload_status(owner, id).await
        }));
    }
    for handle in handles {
        let status = handle.await.unwrap().unwrap();
        assert_eq!(status.chunk_count, 4);
        assert_eq!(status.missing_count, 4);
    }

    assert_eq!(env.vault.cache.hydration_count(), 1);
    assert_eq!(env.vault.cache.len().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_flusher_runs_alongside_writers() {
    let env = Arc::new(TestEnv::local().await);
    let (owner, root) = env.account("alice").await;
    let data = Arc::new(payload(16 * 12, 4));

    let created = env
        .vault
        .uploads
        .create_new_file(owner, root, "flushed.bin", "", data.len() as u64)
        .await
        .unwrap();
    let plan = created.plan.unwrap();
    let id = created.file.id;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let flusher = CacheFlusher::spawn(
        Arc::clone(&env.vault.cache),
        Duration::from_millis(2),
        shutdown_rx,
    );

    let mut handles = Vec::new();
    for index in 0..plan.chunk_count {
        let env = Arc::clone(&env);
        let data = Arc::clone(&data);
        handles.push(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(index)).await;
            let start = plan.offset_of(index) as usize;
            let len = plan.chunk_len(index).unwrap() as usize;
            env.vault
                .uploads
                .upload_chunk(owner, id, index, &data[start..start + len])
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    shutdown_tx.send(true).unwrap();
    flusher.await.unwrap();

    // The final flush leaves the stored bitmap in step with the cache
    let mut conn = env.vault.db.pool().acquire().await.unwrap();
    let session = UploadSessionRepository::get_by_node(&mut conn, id)
        .await
        .unwrap()
        .unwrap();
    assert!(session.chunk_bitmap().is_all_zero());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_races_writers() {
    let env = Arc::new(TestEnv::local().await);
    let (owner, root) = env.account("alice").await;
    let data = payload(16 * 10, 6);

    let created = env
        .vault
        .uploads
        .create_new_file(owner, root, "doomed.bin", "", data.len() as u64)
        .await
        .unwrap();
    let plan = created.plan.unwrap();
    let id = created.file.id;
    let object_path = env.object_path(created.file.backing_object.as_deref().unwrap());

    let mut handles = Vec::new();
    for (index, chunk) in chunks(&plan, &data) {
        let env = Arc::clone(&env);
        let chunk = chunk.to_vec();
        handles.push(tokio::spawn(async move {
            env.vault.uploads.upload_chunk(owner, id, index, &chunk).await
        }));
    }
    let cancel = {
        let env = Arc::clone(&env);
        tokio::spawn(async move { env.vault.uploads.cancel_upload(owner, id).await })
    };

    cancel.await.unwrap().unwrap();
    for handle in handles {
        if let Err(e) = handle.await.unwrap() {
            assert!(
                matches!(e.kind(), ErrorKind::InvalidState | ErrorKind::NotFound),
                "unexpected error: {e}"
            );
        }
    }

    assert!(!object_path.exists());
    assert_eq!(env.used_space(owner).await, 0);
    assert_eq!(env.size_of(root).await, 0);
    let mut conn = env.vault.db.pool().acquire().await.unwrap();
    assert!(FileNodeRepository::get_by_id(&mut conn, id)
        .await
        .unwrap()
        .is_none());
    assert!(UploadSessionRepository::get_by_node(&mut conn, id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_keep_aggregates_exact() {
    let env = Arc::new(TestEnv::local().await);
    let (owner, root) = env.account("alice").await;
    let docs = env
        .vault
        .tree
        .create_directory(owner, root, "docs")
        .await
        .unwrap()
        .id;

    let mut handles = Vec::new();
    for i in 0..10u64 {
        let env = Arc::clone(&env);
        handles.push(tokio::spawn(async move {
            env.vault
                .uploads
                .create_new_file(owner, docs, &format!("f{i}.bin"), "", 10 + i)
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let expected: i64 = (0..10).map(|i| 10 + i).sum();
    assert_eq!(env.size_of(docs).await, expected);
    assert_eq!(env.size_of(root).await, expected);
    assert_eq!(env.used_space(owner).await, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_races_create() {
    let env = Arc::new(TestEnv::local().await);
    let (owner, root) = env.account("alice").await;

    for round in 0..8 {
        let tmp = env
            .vault
            .tree
            .create_directory(owner, root, &format!("tmp{round}"))
            .await
            .unwrap()
            .id;

        let create = {
            let env = Arc::clone(&env);
            tokio::spawn(async move {
                env.vault
                    .uploads
                    .create_new_file(owner, tmp, "racing.bin", "", 40)
                    .await
            })
        };
        let delete = {
            let env = Arc::clone(&env);
            tokio::spawn(async move { env.vault.tree.delete_nodes(owner, &[tmp]).await })
        };

        delete.await.unwrap().unwrap();
        match create.await.unwrap() {
            Ok(created) => {
                let id = created.file.id;
                let object = created.file.backing_object.unwrap();
                assert!(!env.object_path(&object).exists());
                let err = env.vault.uploads.upload_status(owner, id).await.unwrap_err();
                assert_eq!(err.kind(), ErrorKind::NotFound);
            }
            Err(e) => assert_eq!(e.kind(), ErrorKind::NotFound, "unexpected error: {e}"),
        }

        assert_eq!(env.vault.cache.len().await, 0);
        assert_eq!(env.used_space(owner).await, 0);
        assert_eq!(env.size_of(root).await, 0);
    }
}

/// Alice uploads into her own tree, bob shares an inbox with her.
async fn shared_inbox(env: &TestEnv) -> (i64, i64, i64, i64) {
    let (alice, alice_root) = env.account("alice").await;
    let (bob, bob_root) = env.account("bob").await;
    let inbox = env
        .vault
        .tree
        .create_directory(bob, bob_root, "inbox")
        .await
        .unwrap()
        .id;
    env.vault
        .shares
        .grant(
            bob,
            inbox,
            alice,
            AccessMode::ReadWrite,
            chrono::Utc::now() + chrono::Duration::days(1),
        )
        .await
        .unwrap();
    (alice, alice_root, bob, inbox)
}

async fn owner_of(env: &TestEnv, id: i64) -> i64 {
    let mut conn = env.vault.db.pool().acquire().await.unwrap();
    FileNodeRepository::require(&mut conn, id)
        .await
        .unwrap()
        .owner_id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_move_races_cancel() {
    let env = Arc::new(TestEnv::local().await);
    let (alice, alice_root, bob, inbox) = shared_inbox(&env).await;

    let created = env
        .vault
        .uploads
        .create_new_file(alice, alice_root, "handoff.bin", "", 48)
        .await
        .unwrap();
    let id = created.file.id;
    env.vault
        .uploads
        .upload_chunk(alice, id, 0, &payload(16, 3))
        .await
        .unwrap();

    let moving = {
        let env = Arc::clone(&env);
        tokio::spawn(async move { env.vault.tree.move_nodes(alice, &[id], inbox).await })
    };
    let cancel = {
        let env = Arc::clone(&env);
        tokio::spawn(async move { env.vault.uploads.cancel_upload(alice, id).await })
    };
    let moved = moving.await.unwrap();
    let cancelled = cancel.await.unwrap();

    match (moved, cancelled) {
        (Ok(()), Err(e)) => {
            assert_eq!(e.kind(), ErrorKind::Unauthorized, "unexpected error: {e}");
            assert_eq!(owner_of(&env, id).await, bob);
            assert_eq!(env.used_space(bob).await, 48);
            assert_eq!(env.used_space(alice).await, 0);
            assert_eq!(env.size_of(inbox).await, 48);
            // The moved session kept the chunk alice wrote
            let status = env.vault.uploads.upload_status(bob, id).await.unwrap();
            assert_eq!(status.missing_count, 2);
        }
        (Err(e), Ok(())) => {
            assert_eq!(e.kind(), ErrorKind::NotFound, "unexpected error: {e}");
            assert_eq!(env.used_space(alice).await, 0);
            assert_eq!(env.used_space(bob).await, 0);
            assert_eq!(env.vault.cache.len().await, 0);
        }
        (moved, cancelled) => panic!("expected exactly one winner: {moved:?} {cancelled:?}"),
    }

    assert!(!env.vault.cache.contains(alice, id).await);
    let err = env
        .vault
        .uploads
        .upload_chunk(alice, id, 1, &payload(16, 3))
        .await
        .unwrap_err();
    assert!(
        matches!(err.kind(), ErrorKind::Unauthorized | ErrorKind::NotFound),
        "unexpected error: {err}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_move_races_complete() {
    let env = Arc::new(TestEnv::local().await);
    let (alice, alice_root, bob, inbox) = shared_inbox(&env).await;
    let data = payload(40, 8);

    let created = env
        .vault
        .uploads
        .create_new_file(alice, alice_root, "finished.bin", "", data.len() as u64)
        .await
        .unwrap();
    let id = created.file.id;
    for (index, chunk) in chunks(&created.plan.unwrap(), &data) {
        env.vault
            .uploads
            .upload_chunk(alice, id, index, chunk)
            .await
            .unwrap();
    }

    let moving = {
        let env = Arc::clone(&env);
        tokio::spawn(async move { env.vault.tree.move_nodes(alice, &[id], inbox).await })
    };
    let complete = {
        let env = Arc::clone(&env);
        tokio::spawn(async move { env.vault.uploads.complete_file(alice, id).await })
    };
    moving.await.unwrap().unwrap();

    if let Err(e) = complete.await.unwrap() {
        assert_eq!(e.kind(), ErrorKind::Unauthorized, "unexpected error: {e}");
        assert!(!env.vault.cache.contains(alice, id).await);
        // Progress made under the old owner survived the handoff
        env.vault.uploads.complete_file(bob, id).await.unwrap();
    }

    assert_eq!(owner_of(&env, id).await, bob);
    assert_eq!(env.used_space(bob).await, data.len() as i64);
    assert_eq!(env.used_space(alice).await, 0);
    assert_eq!(env.read_all(bob, id).await, data);
}
