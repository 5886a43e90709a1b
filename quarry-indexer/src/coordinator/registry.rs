//! Maps source types to coordinator constructors.

use super::{CoordinatorContext, IndexingCoordinator, LocalFolderCoordinator, UrlCoordinator};
use crate::config::FilterSettings;
use crate::error::{IndexError, Result};
use crate::filter::PathFilter;
use crate::source::{KnowledgeSourceConfig, SourceType};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

pub type CoordinatorConstructor = Box<
    dyn Fn(
            &CoordinatorContext,
            &KnowledgeSourceConfig,
            &FilterSettings,
        ) -> Result<Arc<dyn IndexingCoordinator>>
        + Send
        + Sync,
>;

#[derive(Default)]
pub struct CoordinatorRegistry {
    constructors: HashMap<SourceType, CoordinatorConstructor>,
}

impl CoordinatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the local folder and URL coordinators.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(SourceType::LocalFolders, Box::new(build_local_folders));
        registry.register(SourceType::Url, Box::new(build_urls));
        registry
    }

    /// Register a constructor, replacing any previous one for the type.
    pub fn register(&mut self, source_type: SourceType, constructor: CoordinatorConstructor) {
        self.constructors.insert(source_type, constructor);
    }

    pub fn supports(&self, source_type: SourceType) -> bool {
        self.constructors.contains_key(&source_type)
    }

    pub fn build(
        &self,
        ctx: &CoordinatorContext,
        source: &KnowledgeSourceConfig,
        filter: &FilterSettings,
    ) -> Result<Arc<dyn IndexingCoordinator>> {
        let source_type = source.source_type();
        let constructor = self.constructors.get(&source_type).ok_or_else(|| {
            IndexError::config(format!("no coordinator registered for {source_type}"))
        })?;
        debug!(source = %source.resource_identifier(), "Building coordinator");
        constructor(ctx, source, filter)
    }

    /// One coordinator per source type.
    ///
    /// Index state is keyed by project and source type, so two sources of the
    /// same type are merged first; separate coordinators would each treat the
    /// other's resources as deleted.
    pub fn build_all(
        &self,
        ctx: &CoordinatorContext,
        sources: &[KnowledgeSourceConfig],
        filter: &FilterSettings,
    ) -> Result<Vec<Arc<dyn IndexingCoordinator>>> {
        merge_sources(sources)
            .iter()
            .map(|source| self.build(ctx, source, filter))
            .collect()
    }
}

/// Union the resources of sources sharing a type, in first-seen order.
pub fn merge_sources(sources: &[KnowledgeSourceConfig]) -> Vec<KnowledgeSourceConfig> {
    let mut merged: Vec<KnowledgeSourceConfig> = Vec::new();
    for source in sources {
        let existing = merged
            .iter_mut()
            .find(|m| m.source_type() == source.source_type());
        match (existing, source) {
            (None, _) => merged.push(source.clone()),
            (
                Some(KnowledgeSourceConfig::LocalFolders { paths, .. }),
                KnowledgeSourceConfig::LocalFolders { paths: more, .. },
            ) => {
                for path in more {
                    if !paths.contains(path) {
                        paths.push(path.clone());
                    }
                }
            }
            (
                Some(KnowledgeSourceConfig::Url { urls, .. }),
                KnowledgeSourceConfig::Url { urls: more, .. },
            ) => {
                for url in more {
                    if !urls.contains(url) {
                        urls.push(url.clone());
                    }
                }
            }
            _ => {}
        }
    }
    merged
}

fn build_local_folders(
    ctx: &CoordinatorContext,
    source: &KnowledgeSourceConfig,
    filter: &FilterSettings,
) -> Result<Arc<dyn IndexingCoordinator>> {
    let KnowledgeSourceConfig::LocalFolders { paths, .. } = source else {
        return Err(IndexError::config("expected a local_folders source"));
    };
    if paths.is_empty() {
        return Err(IndexError::config("local_folders source has no paths"));
    }
    // Watch events report canonical paths on some platforms
    let roots: Vec<PathBuf> = paths
        .iter()
        .map(|p| std::fs::canonicalize(p).unwrap_or_else(|_| p.clone()))
        .collect();
    let path_filter = PathFilter::new(&roots, filter)?;
    Ok(Arc::new(LocalFolderCoordinator::new(ctx, roots, path_filter)))
}

fn build_urls(
    ctx: &CoordinatorContext,
    source: &KnowledgeSourceConfig,
    _filter: &FilterSettings,
) -> Result<Arc<dyn IndexingCoordinator>> {
    let KnowledgeSourceConfig::Url { urls, .. } = source else {
        return Err(IndexError::config("expected a url source"));
    };
    for url in urls {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(IndexError::config(format!("unsupported URL {url}")));
        }
    }
    Ok(Arc::new(UrlCoordinator::new(ctx, urls.clone())?))
}
