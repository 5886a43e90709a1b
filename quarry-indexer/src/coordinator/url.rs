//! Coordinator for URL sources.
//!
//! Each configured URL is one resource. Watching is polling: every
//! `poll_interval` the coordinator runs another incremental pass, which only
//! re-embeds pages whose bytes changed.

use super::pipeline::{IndexPipeline, ResourceSource};
use super::{CoordinatorContext, IndexingCoordinator};
use crate::error::{IndexError, Result};
use crate::extract::{RawResource, SkipReason};
use crate::progress::{IndexProgress, IndexStatus};
use crate::source::SourceType;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct UrlSource {
    urls: Vec<String>,
    client: reqwest::Client,
    max_bytes: u64,
}

impl UrlSource {
    pub fn new(urls: Vec<String>, max_bytes: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("quarry/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| IndexError::config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            urls,
            client,
            max_bytes,
        })
    }

    async fn fetch(&self, url: &str) -> std::result::Result<RawResource, SkipReason> {
        let unreadable = |e: reqwest::Error| SkipReason::Unreadable(e.to_string());

        let mut response = self.client.get(url).send().await.map_err(unreadable)?;
        let status = response.status();
        if !status.is_success() {
            return Err(SkipReason::Unreadable(format!("HTTP {status}")));
        }
        if let Some(size) = response.content_length().filter(|&n| n > self.max_bytes) {
            return Err(SkipReason::TooLarge {
                size,
                limit: self.max_bytes,
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        // Servers may omit or understate Content-Length
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(unreadable)? {
            bytes.extend_from_slice(&chunk);
            if bytes.len() as u64 > self.max_bytes {
                return Err(SkipReason::TooLarge {
                    size: bytes.len() as u64,
                    limit: self.max_bytes,
                });
            }
        }

        let resource = RawResource::new(url, bytes);
        Ok(match content_type {
            Some(ct) => resource.with_content_type(ct),
            None => resource,
        })
    }
}

#[async_trait]
impl ResourceSource for UrlSource {
    async fn enumerate(&self) -> Result<Vec<String>> {
        let mut urls = self.urls.clone();
        urls.sort();
        urls.dedup();
        Ok(urls)
    }

    async fn load(&self, id: &str) -> std::result::Result<RawResource, SkipReason> {
        debug!("Fetching {}", id);
        self.fetch(id).await
    }
}

struct PollSession {
    token: CancellationToken,
    worker: JoinHandle<()>,
}

pub struct UrlCoordinator {
    pipeline: Arc<IndexPipeline>,
    poll_interval: Duration,
    session: Mutex<Option<PollSession>>,
}

impl UrlCoordinator {
    pub fn new(ctx: &CoordinatorContext, urls: Vec<String>) -> Result<Self> {
        let source = UrlSource::new(urls, ctx.settings.max_file_bytes)?;
        Ok(Self {
            pipeline: Arc::new(IndexPipeline::new(ctx, SourceType::Url, Arc::new(source))),
            poll_interval: ctx.settings.poll_interval,
            session: Mutex::new(None),
        })
    }

    pub fn pipeline(&self) -> &Arc<IndexPipeline> {
        &self.pipeline
    }

    async fn poll(pipeline: Arc<IndexPipeline>, every: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately and the baseline pass already ran
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if !pipeline.run_pass().await {
                        warn!("Polling pass failed, stopping the poll loop");
                        break;
                    }
                }
            }
        }

        pipeline.set_watching(false);
        pipeline
            .tracker()
            .transition(IndexStatus::Watching, IndexStatus::Ready);
    }
}

#[async_trait]
impl IndexingCoordinator for UrlCoordinator {
    fn source_type(&self) -> SourceType {
        SourceType::Url
    }

    fn progress(&self) -> IndexProgress {
        self.pipeline.tracker().get()
    }

    fn subscribe(&self) -> watch::Receiver<IndexProgress> {
        self.pipeline.tracker().subscribe()
    }

    async fn start_indexing(&self) -> bool {
        self.pipeline.run_pass().await
    }

    async fn start_watching(&self, scope: &CancellationToken) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.as_ref().is_some_and(|s| !s.worker.is_finished()) {
            return Ok(());
        }
        session.take();

        let status = self.pipeline.tracker().status();
        if !status.has_baseline() {
            return Err(IndexError::NotReady {
                status: status.to_string(),
            });
        }

        let token = scope.child_token();
        self.pipeline.set_watching(true);
        self.pipeline
            .tracker()
            .transition(IndexStatus::Ready, IndexStatus::Watching);
        let worker = tokio::spawn(Self::poll(
            self.pipeline.clone(),
            self.poll_interval,
            token.clone(),
        ));
        info!(
            project = %self.pipeline.project_id(),
            every = ?self.poll_interval,
            "Started polling URLs"
        );
        *session = Some(PollSession { token, worker });
        Ok(())
    }

    async fn stop_watching(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.token.cancel();
            if let Err(e) = session.worker.await {
                warn!("Poll worker ended abnormally: {}", e);
            }
        }
    }

    async fn close(&self) {
        self.stop_watching().await;
    }
}
