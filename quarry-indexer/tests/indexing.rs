mod common;

use anyhow::Result;
use common::{CountingProvider, Fixture, PROJECT};
use quarry_indexer::coordinator::{IndexingCoordinator, LocalFolderCoordinator};
use quarry_indexer::events::IndexEvent;
use quarry_indexer::extract::DocumentExtractor;
use quarry_indexer::filter::PathFilter;
use quarry_indexer::progress::IndexStatus;
use quarry_indexer::segment::keys;
use quarry_indexer::storage::{
    EmbeddingStore, IndexStateStore, MetadataFilter, SqliteEmbeddingStore, SqliteIndexStateStore,
    connect_pool,
};
use quarry_indexer::{CoordinatorContext, IndexError};
use sqlx::SqlitePool;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;

fn write_project(fx: &Fixture) -> Result<()> {
    fx.write("a.txt", "alpha notes\nsecond line\n")?;
    fx.write("b.md", "# Beta\n\nSome markdown body text.\n")?;
    fx.write("nested/c.txt", "gamma lives in a subdirectory\n")?;
    Ok(())
}

fn line_range(entry: &quarry_indexer::storage::VectorEntry) -> (usize, usize) {
    let get = |key: &str| -> usize { entry.metadata[key].parse().unwrap() };
    (get(keys::START_LINE), get(keys::END_LINE))
}

#[tokio::test]
async fn test_second_pass_without_changes_embeds_nothing() -> Result<()> {
    let fx = Fixture::new()?;
    write_project(&fx)?;
    let coordinator = fx.coordinator();

    assert!(coordinator.start_indexing().await);
    let calls = fx.provider.calls();
    let entries = fx.embeddings.entries();
    let states = fx.states.list_states(PROJECT).await?;
    assert!(calls > 0);
    assert_eq!(states.len(), 3);

    assert!(coordinator.start_indexing().await);
    assert_eq!(fx.provider.calls(), calls);
    assert_eq!(fx.embeddings.entries(), entries);
    assert_eq!(fx.states.list_states(PROJECT).await?, states);

    let stats = coordinator.pipeline().stats();
    assert_eq!(stats.files_unchanged, 3);
    assert_eq!(stats.files_indexed, 0);
    Ok(())
}

#[tokio::test]
async fn test_modifying_one_file_reembeds_only_that_file() -> Result<()> {
    let fx = Fixture::new()?;
    write_project(&fx)?;
    let coordinator = fx.coordinator();
    assert!(coordinator.start_indexing().await);
    let before = fx.hashes().await?;
    let texts_before = fx.provider.texts();

    fx.write("b.md", "# Beta\n\nRewritten body with different words.\n")?;
    assert!(coordinator.start_indexing().await);

    let after = fx.hashes().await?;
    let b = fx.id("b.md");
    assert_ne!(before[&b], after[&b]);
    for (path, hash) in &before {
        if *path != b {
            assert_eq!(&after[path], hash, "{path} should be untouched");
        }
    }
    assert_eq!(
        fx.provider.texts() - texts_before,
        fx.entries_for("b.md").len()
    );
    assert!(
        fx.entries_for("b.md")
            .iter()
            .all(|e| e.text.contains("Rewritten"))
    );
    Ok(())
}

#[tokio::test]
async fn test_deleted_file_leaves_no_trace() -> Result<()> {
    let fx = Fixture::new()?;
    write_project(&fx)?;
    let coordinator = fx.coordinator();
    assert!(coordinator.start_indexing().await);
    assert!(!fx.entries_for("a.txt").is_empty());

    fx.remove("a.txt")?;
    assert!(coordinator.start_indexing().await);

    assert!(fx.entries_for("a.txt").is_empty());
    assert!(!fx.hashes().await?.contains_key(&fx.id("a.txt")));
    let filter = MetadataFilter::new().eq(keys::FILE_PATH, fx.id("a.txt"));
    let query = CountingProvider::vector_for("alpha notes\nsecond line\n");
    assert!(fx.embeddings.search(&query, 10, Some(&filter)).await?.is_empty());
    assert_eq!(coordinator.pipeline().stats().files_removed, 1);
    Ok(())
}

#[tokio::test]
async fn test_chunk_line_ranges_cover_the_file() -> Result<()> {
    let fx = Fixture::new()?;
    let total_lines = 120;
    let content: String = (1..=total_lines)
        .map(|i| format!("line {i:03} carries a few words of text\n"))
        .collect();
    fx.write("long.txt", &content)?;
    let coordinator = fx.coordinator();
    assert!(coordinator.start_indexing().await);

    let mut entries = fx.entries_for("long.txt");
    entries.sort_by_key(|e| e.metadata[keys::CHUNK_INDEX].parse::<usize>().unwrap());
    assert!(entries.len() > 5);
    assert_eq!(
        entries[0].metadata[keys::CHUNK_TOTAL],
        entries.len().to_string()
    );

    let ranges: Vec<(usize, usize)> = entries.iter().map(line_range).collect();
    assert_eq!(ranges[0].0, 1);
    assert_eq!(ranges.last().unwrap().1, total_lines);
    for (start, end) in &ranges {
        assert!(start <= end);
        assert!(*end <= total_lines);
    }
    for pair in ranges.windows(2) {
        let ((prev_start, prev_end), (next_start, next_end)) = (pair[0], pair[1]);
        assert!(next_start >= prev_start, "{ranges:?}");
        assert!(next_end >= prev_end, "{ranges:?}");
        assert!(next_start <= prev_end + 1, "gap between chunks: {ranges:?}");
    }
    Ok(())
}

#[tokio::test]
async fn test_failed_checkpoint_is_redone_without_duplicates() -> Result<()> {
    let fx = Fixture::new()?;
    write_project(&fx)?;
    let coordinator = fx.coordinator();

    // Segments are written but the hashes never reach the state store
    fx.states.fail_saves.store(true, Ordering::SeqCst);
    assert!(!coordinator.start_indexing().await);
    let progress = coordinator.progress();
    assert_eq!(progress.status, IndexStatus::Failed);
    assert!(progress.error.unwrap().contains("persistence"));
    let written = fx.embeddings.entries().len();
    assert!(written > 0);
    assert!(fx.hashes().await?.is_empty());

    fx.states.fail_saves.store(false, Ordering::SeqCst);
    let texts_before = fx.provider.texts();
    assert!(coordinator.start_indexing().await);

    assert_eq!(fx.provider.texts() - texts_before, written);
    assert_eq!(fx.embeddings.entries().len(), written);
    assert_eq!(fx.hashes().await?.len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_text_and_pdf_project_end_to_end() -> Result<()> {
    let fx = Fixture::new()?;
    fx.write("a.txt", "line1\nline2\nline3")?;
    fx.write("b.pdf", [0x25, 0x50, 0x44, 0x46, 0x00, 0x01, 0xfe, 0xff])?;
    let coordinator = fx.coordinator();
    assert!(coordinator.start_indexing().await);

    let a = fx.entries_for("a.txt");
    assert_eq!(a.len(), 1);
    assert_eq!(a[0].text, "line1\nline2\nline3");
    assert_eq!(line_range(&a[0]), (1, 3));

    let b = fx.entries_for("b.pdf");
    assert!(!b.is_empty());
    assert!(b.iter().all(|e| !e.metadata.contains_key(keys::START_LINE)));
    assert!(b.iter().all(|e| e.metadata[keys::EXTENSION] == "pdf"));
    assert_eq!(fx.states.list_states(PROJECT).await?.len(), 2);

    fx.remove("b.pdf")?;
    assert!(coordinator.start_indexing().await);

    let remaining = fx.embeddings.entries();
    assert!(!remaining.is_empty());
    assert!(
        remaining
            .iter()
            .all(|e| e.metadata[keys::FILE_PATH] == fx.id("a.txt"))
    );
    let states = fx.states.list_states(PROJECT).await?;
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].file_path, fx.id("a.txt"));
    Ok(())
}

#[tokio::test]
async fn test_docx_is_extracted_without_line_numbers() -> Result<()> {
    let fx = Fixture::new()?;
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())?;
    zip.write_all(
        br#"<?xml version="1.0" encoding="UTF-8"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>Onboarding checklist</w:t></w:r></w:p>
    <w:p><w:r><w:t>Request a laptop</w:t></w:r></w:p>
  </w:body>
</w:document>"#,
    )?;
    fx.write("guide.docx", zip.finish()?.into_inner())?;

    let ctx = fx
        .context()
        .with_extractor(Arc::new(DocumentExtractor::new()));
    let coordinator = LocalFolderCoordinator::new(
        &ctx,
        vec![fx.root.clone()],
        PathFilter::permissive(&[fx.root.clone()]),
    );
    assert!(coordinator.start_indexing().await);

    let entries = fx.entries_for("guide.docx");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].text, "Onboarding checklist\nRequest a laptop");
    assert!(!entries[0].metadata.contains_key(keys::START_LINE));
    Ok(())
}

#[tokio::test]
async fn test_binary_and_oversized_files() -> Result<()> {
    let mut fx = Fixture::new()?;
    fx.settings.max_file_bytes = 256;
    fx.write("small.txt", "fits\n")?;
    fx.write("data.xyz", [0u8, 159, 146, 150, 0, 1])?;
    fx.write("huge.txt", "x".repeat(1024))?;
    let coordinator = fx.coordinator();
    assert!(coordinator.start_indexing().await);

    let hashes = fx.hashes().await?;
    // Binary content has nothing to embed but is remembered
    assert!(hashes.contains_key(&fx.id("data.xyz")));
    assert!(fx.entries_for("data.xyz").is_empty());
    // Oversized files are skipped and retried next pass
    assert!(!hashes.contains_key(&fx.id("huge.txt")));
    assert!(fx.entries_for("huge.txt").is_empty());

    let stats = coordinator.pipeline().stats();
    assert_eq!(stats.files_indexed, 1);
    assert_eq!(stats.files_skipped, 2);
    assert_eq!(stats.errors, 1);
    Ok(())
}

#[tokio::test]
async fn test_excluded_paths_are_not_indexed() -> Result<()> {
    let fx = Fixture::new()?;
    fx.write("keep.md", "kept\n")?;
    fx.write(".secret.txt", "hidden\n")?;
    fx.write("node_modules/pkg/index.js", "module.exports = {}\n")?;
    fx.write("target/debug/out.txt", "build output\n")?;
    let coordinator = fx.coordinator();
    assert!(coordinator.start_indexing().await);

    let hashes = fx.hashes().await?;
    assert_eq!(hashes.len(), 1);
    assert!(hashes.contains_key(&fx.id("keep.md")));
    Ok(())
}

#[tokio::test]
async fn test_embedding_failure_fails_the_pass() -> Result<()> {
    let fx = Fixture::new()?;
    write_project(&fx)?;
    let mut events = fx.events.subscribe();
    let coordinator = fx.coordinator();

    fx.provider.fail.store(true, Ordering::SeqCst);
    assert!(!coordinator.start_indexing().await);

    let progress = coordinator.progress();
    assert_eq!(progress.status, IndexStatus::Failed);
    assert!(progress.error.unwrap().contains("Embedding failed"));
    assert!(fx.embeddings.entries().is_empty());
    assert!(fx.hashes().await?.is_empty());

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(IndexEvent::IndexingStarted { .. })));
    assert!(matches!(
        seen.last(),
        Some(IndexEvent::IndexingFailed { reason, .. }) if reason.contains("model crashed")
    ));
    assert!(seen.iter().all(|e| e.project_id() == PROJECT));

    // FAILED is left by running another pass
    fx.provider.fail.store(false, Ordering::SeqCst);
    assert!(coordinator.start_indexing().await);
    assert_eq!(coordinator.progress().status, IndexStatus::Ready);
    assert_eq!(coordinator.progress().error, None);
    assert_eq!(fx.hashes().await?.len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_unreadable_state_store_fails_the_pass() -> Result<()> {
    let fx = Fixture::new()?;
    write_project(&fx)?;
    let coordinator = fx.coordinator();

    fx.states.fail_reads.store(true, Ordering::SeqCst);
    assert!(!coordinator.start_indexing().await);
    let progress = coordinator.progress();
    assert_eq!(progress.status, IndexStatus::Failed);
    assert!(progress.error.unwrap().contains("disk I/O error"));
    assert_eq!(fx.provider.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_missing_root_keeps_the_index() -> Result<()> {
    let fx = Fixture::new()?;
    write_project(&fx)?;
    let coordinator = fx.coordinator();
    assert!(coordinator.start_indexing().await);
    let entries = fx.embeddings.entries().len();

    let moved = fx.dir.path().with_extension("moved");
    std::fs::rename(&fx.root, &moved)?;
    let passed = coordinator.start_indexing().await;
    std::fs::rename(&moved, &fx.root)?;

    assert!(!passed);
    assert!(coordinator.progress().error.unwrap().contains("does not exist"));
    assert_eq!(fx.embeddings.entries().len(), entries);
    assert_eq!(fx.hashes().await?.len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_progress_is_observable() -> Result<()> {
    let fx = Fixture::new()?;
    write_project(&fx)?;
    let coordinator = fx.coordinator();
    let receiver = coordinator.subscribe();
    assert_eq!(receiver.borrow().status, IndexStatus::NotStarted);

    assert!(coordinator.start_indexing().await);
    let progress = receiver.borrow().clone();
    assert_eq!(progress.status, IndexStatus::Ready);
    assert_eq!(progress.total_files, 3);
    assert_eq!(progress.processed_files, 3);
    Ok(())
}

#[tokio::test]
async fn test_clear_removes_everything_for_the_source() -> Result<()> {
    let fx = Fixture::new()?;
    write_project(&fx)?;
    let coordinator = fx.coordinator();
    assert!(coordinator.start_indexing().await);

    let removed = coordinator.pipeline().clear().await?;
    assert!(removed > 0);
    assert!(fx.embeddings.entries().is_empty());
    assert!(fx.hashes().await?.is_empty());
    Ok(())
}

async fn open_sqlite(
    fx: &Fixture,
    db_path: &Path,
) -> Result<(LocalFolderCoordinator, CoordinatorContext, SqlitePool)> {
    let pool = connect_pool(db_path).await?;
    let ctx = CoordinatorContext::new(
        PROJECT,
        fx.provider.clone(),
        Arc::new(SqliteEmbeddingStore::from_pool(pool.clone()).await?),
        Arc::new(SqliteIndexStateStore::from_pool(pool.clone()).await?),
    )
    .with_settings(fx.settings);
    let coordinator = LocalFolderCoordinator::new(
        &ctx,
        vec![fx.root.clone()],
        PathFilter::permissive(&[fx.root.clone()]),
    );
    Ok((coordinator, ctx, pool))
}

#[tokio::test]
async fn test_sqlite_stores_survive_a_restart() -> Result<()> {
    let fx = Fixture::new()?;
    write_project(&fx)?;
    let db_dir = tempfile::tempdir()?;
    let db_path = db_dir.path().join("index.db");

    let (first, _, pool) = open_sqlite(&fx, &db_path).await?;
    assert!(first.start_indexing().await);
    let calls = fx.provider.calls();
    pool.close().await;

    let (second, ctx, _) = open_sqlite(&fx, &db_path).await?;
    assert!(second.start_indexing().await);
    assert_eq!(fx.provider.calls(), calls);
    assert_eq!(ctx.states.list_states(PROJECT).await?.len(), 3);

    let filter = MetadataFilter::new().eq(keys::PROJECT_ID, PROJECT);
    let hits = ctx
        .embeddings
        .search(&CountingProvider::vector_for("gamma"), 2, Some(&filter))
        .await?;
    assert_eq!(hits.len(), 2);
    assert!(hits[0].score >= hits[1].score);
    Ok(())
}

#[tokio::test]
async fn test_not_ready_error_names_the_status() -> Result<()> {
    let fx = Fixture::new()?;
    let coordinator = fx.coordinator();
    let scope = tokio_util::sync::CancellationToken::new();
    match coordinator.start_watching(&scope).await {
        Err(IndexError::NotReady { status }) => assert_eq!(status, "NOT_STARTED"),
        other => panic!("expected NotReady, got {other:?}"),
    }
    Ok(())
}
