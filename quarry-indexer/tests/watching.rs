mod common;

use anyhow::Result;
use common::{Fixture, eventually};
use quarry_indexer::IndexError;
use quarry_indexer::coordinator::{IndexingCoordinator, ResourceOutcome};
use quarry_indexer::events::IndexEvent;
use quarry_indexer::handler::ChangeOutcome;
use quarry_indexer::progress::IndexStatus;
use quarry_indexer::watcher::ChangeKind;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_watching_requires_a_completed_pass() -> Result<()> {
    let fx = Fixture::new()?;
    fx.write("a.txt", "hello\n")?;
    let coordinator = fx.coordinator();
    let scope = CancellationToken::new();

    let err = coordinator.start_watching(&scope).await.unwrap_err();
    assert!(matches!(err, IndexError::NotReady { .. }));

    fx.provider.fail.store(true, Ordering::SeqCst);
    assert!(!coordinator.start_indexing().await);
    let err = coordinator.start_watching(&scope).await.unwrap_err();
    assert!(matches!(err, IndexError::NotReady { status } if status == "FAILED"));
    Ok(())
}

#[tokio::test]
async fn test_start_and_stop_are_idempotent() -> Result<()> {
    let fx = Fixture::new()?;
    fx.write("a.txt", "hello\n")?;
    let coordinator = fx.coordinator();
    let scope = CancellationToken::new();

    // Stopping before anything started is harmless
    coordinator.stop_watching().await;

    assert!(coordinator.start_indexing().await);
    coordinator.start_watching(&scope).await?;
    coordinator.start_watching(&scope).await?;
    assert_eq!(coordinator.progress().status, IndexStatus::Watching);

    coordinator.stop_watching().await;
    coordinator.stop_watching().await;
    assert_eq!(coordinator.progress().status, IndexStatus::Ready);

    // And it can start again
    coordinator.start_watching(&scope).await?;
    assert_eq!(coordinator.progress().status, IndexStatus::Watching);
    coordinator.close().await;
    assert_eq!(coordinator.progress().status, IndexStatus::Ready);
    Ok(())
}

#[tokio::test]
async fn test_cancelling_the_scope_stops_the_watch() -> Result<()> {
    let fx = Fixture::new()?;
    fx.write("a.txt", "hello\n")?;
    let coordinator = fx.coordinator();
    let scope = CancellationToken::new();

    assert!(coordinator.start_indexing().await);
    coordinator.start_watching(&scope).await?;
    scope.cancel();

    assert!(
        eventually(Duration::from_secs(5), || {
            coordinator.progress().status == IndexStatus::Ready
        })
        .await
    );
    coordinator.stop_watching().await;
    Ok(())
}

#[tokio::test]
async fn test_pass_during_watch_stays_watching() -> Result<()> {
    let fx = Fixture::new()?;
    fx.write("a.txt", "hello\n")?;
    let coordinator = fx.coordinator();
    let scope = CancellationToken::new();

    assert!(coordinator.start_indexing().await);
    coordinator.start_watching(&scope).await?;
    assert!(coordinator.start_indexing().await);
    assert_eq!(coordinator.progress().status, IndexStatus::Watching);
    coordinator.close().await;
    Ok(())
}

#[tokio::test]
async fn test_change_handler_applies_single_changes() -> Result<()> {
    let fx = Fixture::new()?;
    fx.write("a.txt", "first version\n")?;
    fx.write("b.txt", "sibling\n")?;
    let coordinator = fx.coordinator();
    assert!(coordinator.start_indexing().await);
    let handler = coordinator.change_handler();
    let sibling_hash = fx.hashes().await?[&fx.id("b.txt")].clone();

    // Create
    fx.write("new.md", "a brand new note\n")?;
    let outcome = handler
        .handle_file_change(&fx.path("new.md"), ChangeKind::Create)
        .await?;
    assert!(matches!(
        outcome,
        ChangeOutcome::Updated(ResourceOutcome::Indexed { segments: 1, .. })
    ));
    assert_eq!(fx.entries_for("new.md").len(), 1);
    assert!(fx.hashes().await?.contains_key(&fx.id("new.md")));

    // Modify
    fx.write("a.txt", "second version\n")?;
    handler
        .handle_file_change(&fx.path("a.txt"), ChangeKind::Modify)
        .await?;
    let entries = fx.entries_for("a.txt");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].text, "second version\n");

    // A modify event with identical bytes changes nothing
    let calls = fx.provider.calls();
    let outcome = handler
        .handle_file_change(&fx.path("a.txt"), ChangeKind::Modify)
        .await?;
    assert_eq!(outcome, ChangeOutcome::Updated(ResourceOutcome::Unchanged));
    assert_eq!(fx.provider.calls(), calls);

    // Excluded and foreign paths
    fx.write(".hidden.txt", "secret\n")?;
    fx.write("node_modules/x/index.js", "x\n")?;
    for rel in [".hidden.txt", "node_modules/x/index.js"] {
        let outcome = handler
            .handle_file_change(&fx.path(rel), ChangeKind::Create)
            .await?;
        assert_eq!(outcome, ChangeOutcome::Ignored);
        assert!(fx.entries_for(rel).is_empty());
    }
    let outside = handler
        .handle_file_change(Path::new("/definitely/elsewhere.txt"), ChangeKind::Create)
        .await?;
    assert_eq!(outside, ChangeOutcome::Ignored);

    // Delete
    fx.remove("new.md")?;
    let outcome = handler
        .handle_file_change(&fx.path("new.md"), ChangeKind::Delete)
        .await?;
    assert_eq!(outcome, ChangeOutcome::Removed { segments: 1 });
    assert!(fx.entries_for("new.md").is_empty());
    assert!(!fx.hashes().await?.contains_key(&fx.id("new.md")));

    // Siblings were never rewritten
    assert_eq!(fx.hashes().await?[&fx.id("b.txt")], sibling_hash);
    Ok(())
}

#[tokio::test]
async fn test_modify_of_vanished_file_is_a_delete() -> Result<()> {
    let fx = Fixture::new()?;
    fx.write("a.txt", "soon gone\n")?;
    let coordinator = fx.coordinator();
    assert!(coordinator.start_indexing().await);
    let handler = coordinator.change_handler();

    fx.remove("a.txt")?;
    let outcome = handler
        .handle_file_change(&fx.path("a.txt"), ChangeKind::Modify)
        .await?;
    assert_eq!(outcome, ChangeOutcome::Removed { segments: 1 });
    assert!(fx.hashes().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_failed_change_forgets_the_record() -> Result<()> {
    let fx = Fixture::new()?;
    fx.write("a.txt", "original\n")?;
    let coordinator = fx.coordinator();
    assert!(coordinator.start_indexing().await);
    let handler = coordinator.change_handler();

    fx.provider.fail.store(true, Ordering::SeqCst);
    fx.write("a.txt", "edited\n")?;
    let err = handler
        .handle_file_change(&fx.path("a.txt"), ChangeKind::Modify)
        .await
        .unwrap_err();
    assert!(matches!(err, IndexError::Embedding { .. }));

    // No stale segments and no hash, so the next pass redoes the file
    assert!(fx.entries_for("a.txt").is_empty());
    assert!(fx.hashes().await?.is_empty());

    fx.provider.fail.store(false, Ordering::SeqCst);
    assert!(coordinator.start_indexing().await);
    assert_eq!(fx.entries_for("a.txt")[0].text, "edited\n");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_live_watch_follows_the_filesystem() -> Result<()> {
    let fx = Fixture::new()?;
    fx.write("a.txt", "already here\n")?;
    let coordinator = fx.coordinator();
    let mut events = fx.events.subscribe();
    let scope = CancellationToken::new();

    assert!(coordinator.start_indexing().await);
    coordinator.start_watching(&scope).await?;

    fx.write("live.txt", "written while watching\n")?;
    assert!(
        eventually(Duration::from_secs(10), || !fx.entries_for("live.txt").is_empty()).await,
        "new file was never indexed"
    );

    fx.remove("live.txt")?;
    assert!(
        eventually(Duration::from_secs(10), || fx.entries_for("live.txt").is_empty()).await,
        "deleted file was never removed"
    );
    assert!(!fx.entries_for("a.txt").is_empty());

    coordinator.stop_watching().await;
    assert_eq!(coordinator.progress().status, IndexStatus::Ready);
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, IndexEvent::WatchFailed { .. }));
    }
    Ok(())
}

#[tokio::test]
async fn test_directory_moved_in_and_out() -> Result<()> {
    let fx = Fixture::new()?;
    fx.write("incoming.txt", "sibling with a similar name\n")?;
    let coordinator = fx.coordinator();
    assert!(coordinator.start_indexing().await);
    let handler = coordinator.change_handler();

    let staging = tempfile::tempdir()?;
    let staged = staging.path().join("incoming");
    std::fs::create_dir_all(staged.join("deeper"))?;
    std::fs::create_dir_all(staged.join("node_modules"))?;
    std::fs::write(staged.join("one.txt"), "first moved file\n")?;
    std::fs::write(staged.join("deeper/two.md"), "second moved file\n")?;
    std::fs::write(staged.join("node_modules/dep.js"), "excluded\n")?;

    // One event for the directory stands for everything inside it
    std::fs::rename(&staged, fx.path("incoming"))?;
    let outcome = handler
        .handle_file_change(&fx.path("incoming"), ChangeKind::Create)
        .await?;
    assert_eq!(
        outcome,
        ChangeOutcome::Synced {
            indexed: 2,
            removed: 0
        }
    );
    assert_eq!(fx.entries_for("incoming/one.txt").len(), 1);
    assert_eq!(fx.entries_for("incoming/deeper/two.md").len(), 1);
    assert!(fx.entries_for("incoming/node_modules/dep.js").is_empty());

    std::fs::rename(fx.path("incoming"), staging.path().join("gone"))?;
    let outcome = handler
        .handle_file_change(&fx.path("incoming"), ChangeKind::Delete)
        .await?;
    assert_eq!(outcome, ChangeOutcome::Removed { segments: 2 });
    assert!(fx.entries_for("incoming/one.txt").is_empty());
    assert!(fx.entries_for("incoming/deeper/two.md").is_empty());

    let hashes = fx.hashes().await?;
    assert_eq!(hashes.len(), 1);
    assert!(hashes.contains_key(&fx.id("incoming.txt")));
    assert_eq!(fx.entries_for("incoming.txt").len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_directory_change_drops_files_no_longer_inside() -> Result<()> {
    let fx = Fixture::new()?;
    fx.write("notes/keep.txt", "kept\n")?;
    fx.write("notes/old.txt", "replaced while unwatched\n")?;
    let coordinator = fx.coordinator();
    assert!(coordinator.start_indexing().await);
    let handler = coordinator.change_handler();

    fx.remove("notes/old.txt")?;
    let outcome = handler
        .handle_file_change(&fx.path("notes"), ChangeKind::Modify)
        .await?;
    assert_eq!(
        outcome,
        ChangeOutcome::Synced {
            indexed: 0,
            removed: 1
        }
    );
    assert!(fx.entries_for("notes/old.txt").is_empty());
    assert_eq!(fx.entries_for("notes/keep.txt").len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_live_watch_follows_directory_moves() -> Result<()> {
    let fx = Fixture::new()?;
    fx.write("a.txt", "already here\n")?;
    let coordinator = fx.coordinator();
    let scope = CancellationToken::new();
    assert!(coordinator.start_indexing().await);
    coordinator.start_watching(&scope).await?;

    let staging = tempfile::tempdir()?;
    let staged = staging.path().join("batch");
    std::fs::create_dir_all(&staged)?;
    std::fs::write(staged.join("moved.txt"), "arrived with its directory\n")?;

    std::fs::rename(&staged, fx.path("batch"))?;
    assert!(
        eventually(Duration::from_secs(10), || {
            !fx.entries_for("batch/moved.txt").is_empty()
        })
        .await,
        "moved-in directory was never indexed"
    );

    std::fs::rename(fx.path("batch"), staging.path().join("batch-out"))?;
    assert!(
        eventually(Duration::from_secs(10), || {
            fx.entries_for("batch/moved.txt").is_empty()
        })
        .await,
        "moved-out directory left segments behind"
    );
    assert!(!fx.hashes().await?.contains_key(&fx.id("batch/moved.txt")));

    coordinator.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_change_flood_converges_while_watching() -> Result<()> {
    let mut fx = Fixture::new()?;
    fx.settings.channel_capacity = 1;
    fx.write("a.txt", "already here\n")?;
    let coordinator = fx.coordinator();
    let scope = CancellationToken::new();
    assert!(coordinator.start_indexing().await);
    coordinator.start_watching(&scope).await?;

    let names = (0..150).map(|i| format!("flood/{i:03}.txt")).collect::<Vec<_>>();
    for (i, name) in names.iter().enumerate() {
        fx.write(name, format!("flood file number {i}\n"))?;
    }

    assert!(
        eventually(Duration::from_secs(20), || {
            names.iter().all(|n| fx.entries_for(n).len() == 1)
        })
        .await,
        "index never caught up with the flood"
    );
    assert_eq!(coordinator.progress().status, IndexStatus::Watching);
    assert_eq!(fx.entries_for("a.txt").len(), 1);

    coordinator.close().await;
    assert_eq!(coordinator.progress().status, IndexStatus::Ready);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_removed_root_fails_the_watch() -> Result<()> {
    let fx = Fixture::new()?;
    fx.write("a.txt", "soon without a home\n")?;
    let coordinator = fx.coordinator();
    let mut events = fx.events.subscribe();
    let scope = CancellationToken::new();
    assert!(coordinator.start_indexing().await);
    coordinator.start_watching(&scope).await?;

    std::fs::remove_dir_all(&fx.root)?;
    assert!(
        eventually(Duration::from_secs(10), || {
            coordinator.progress().status == IndexStatus::Failed
        })
        .await,
        "watch kept running without its root"
    );
    assert!(coordinator.progress().error.is_some());

    let mut failures = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, IndexEvent::WatchFailed { .. }) {
            failures += 1;
        }
    }
    assert_eq!(failures, 1);

    coordinator.close().await;
    assert_eq!(coordinator.progress().status, IndexStatus::Failed);
    Ok(())
}
