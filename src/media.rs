//! Разрешение источников медиа по запросу удалённого пира.

use crate::error::{Result, SignalError};
use crate::peer::types::{MediaStream, MediaTrack, TrackKind};
use crate::utils::random_id;
use async_trait::async_trait;

#[async_trait]
pub trait MediaResolver: Send + Sync {
    /// Какие из запрошенных источников можно отдать
    async fn resolve_available_sources(&self, requested: &[String]) -> Vec<String>;

    async fn acquire_local_media(&self, sources: &[String]) -> Result<MediaStream>;
}

/// Считает доступными все запрошенные источники, по видеотреку на каждый
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughResolver;

#[async_trait]
impl MediaResolver for PassthroughResolver {
    async fn resolve_available_sources(&self, requested: &[String]) -> Vec<String> {
        requested.to_vec()
    }

    async fn acquire_local_media(&self, sources: &[String]) -> Result<MediaStream> {
        if sources.is_empty() {
            return Err(SignalError::MediaUnavailable("no sources to capture".into()));
        }
        let stream_id = random_id();
        let tracks = sources
            .iter()
            .enumerate()
            .map(|(i, source)| MediaTrack {
                id: format!("{stream_id}-video-{i}"),
                kind: TrackKind::Video,
                source: source.clone(),
            })
            .collect();
        Ok(MediaStream {
            id: stream_id,
            tracks,
        })
    }
}
