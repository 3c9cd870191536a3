//! Seam between the session state machine and the cluster API, kept narrow
//! so tests can script pages, streams and failures.

use argus_core::{LiteMeta, RawEvent, ResourceFilter, WatchTuning};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use kube::api::Api;
use kube::core::DynamicObject;
use kube::Client;
use thiserror::Error;

pub type EventStream = BoxStream<'static, Result<RawEvent, SourceError>>;

#[derive(Debug, Error)]
pub enum SourceError {
    /// The resume point is no longer valid on the server; callers must
    /// rebuild from a fresh listing.
    #[error("stale resource version: {0}")]
    Stale(String),
    #[error("{0}")]
    Api(String),
}

/// One page of a snapshot listing.
#[derive(Debug, Default)]
pub struct SnapshotPage {
    pub items: Vec<LiteMeta>,
    /// List-level resource version, the checkpoint fallback for empty results.
    pub resource_version: Option<String>,
    pub continue_token: Option<String>,
}

/// What a session needs from the control plane.
#[async_trait]
pub trait WatchSource: Send + Sync {
    async fn fetch_page(&self, limit: u32, token: Option<&str>)
        -> Result<SnapshotPage, SourceError>;

    async fn open_watch(&self, resource_version: &str) -> Result<EventStream, SourceError>;
}

/// Production source backed by a dynamic-typed API handle scoped to one
/// filter.
pub struct KubeSource {
    api: Api<DynamicObject>,
    filter: ResourceFilter,
    watch_timeout_secs: u32,
    bookmarks: bool,
}

impl KubeSource {
    /// Resolve the filter's kind against the cluster and build an API handle
    /// scoped to its namespace.
    pub async fn connect(
        client: &Client,
        filter: &ResourceFilter,
        tuning: &WatchTuning,
    ) -> anyhow::Result<Self> {
        let (ar, namespaced) = argus_kubehub::resolve_kind(client, &filter.kind).await?;
        let api = argus_kubehub::dynamic_api(client.clone(), &ar, namespaced, filter.namespace_opt());
        Ok(Self {
            api,
            filter: filter.clone(),
            watch_timeout_secs: tuning.watch_timeout_secs,
            bookmarks: tuning.keep_alive,
        })
    }
}

#[async_trait]
impl WatchSource for KubeSource {
    async fn fetch_page(
        &self,
        limit: u32,
        token: Option<&str>,
    ) -> Result<SnapshotPage, SourceError> {
        let page = argus_kubehub::fetch_page(&self.api, &self.filter, limit, token)
            .await
            .map_err(|err| SourceError::Api(format!("{err:#}")))?;
        Ok(SnapshotPage {
            items: page.items,
            resource_version: page.resource_version,
            continue_token: page.continue_token,
        })
    }

    async fn open_watch(&self, resource_version: &str) -> Result<EventStream, SourceError> {
        let stream = argus_kubehub::open_watch(
            &self.api,
            &self.filter,
            resource_version,
            self.watch_timeout_secs,
            self.bookmarks,
        )
        .await
        .map_err(classify_kube_error)?;
        Ok(stream.map_err(classify_kube_error).boxed())
    }
}

fn classify_kube_error(err: kube::Error) -> SourceError {
    if let kube::Error::Api(resp) = &err {
        if argus_kubehub::is_stale_signal(resp.code, &resp.message) {
            return SourceError::Stale(resp.message.clone());
        }
    }
    SourceError::Api(err.to_string())
}
