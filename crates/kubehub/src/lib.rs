//! Kubernetes plumbing: client bootstrap, kind resolution, paged listing and raw watch streams.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use argus_core::{LiteMeta, RawEvent, ResourceFilter};
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{Api, ListParams, WatchParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind, ObjectMeta, WatchEvent};
use kube::discovery::{Discovery, Scope};
use kube::Client;
use metrics::counter;
use tracing::warn;

/// kube rejects watch timeouts at or above 295s, keep a margin below that.
const MAX_WATCH_TIMEOUT_SECS: u32 = 290;

const CHANGE_CAUSE_ANNOTATION: &str = "kubernetes.io/change-cause";
const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";
const CREATED_BY_LABEL: &str = "app.kubernetes.io/created-by";

/// Build a client from the ambient environment: in-cluster service account
/// first, kubeconfig as the fallback.
pub async fn default_client() -> Result<Client> {
    Client::try_default()
        .await
        .context("creating kube client from environment")
}

/// Well-known kinds resolved without a discovery round trip. Returns the
/// resource coordinates and whether the kind is namespaced.
pub fn builtin_resource(kind: &str) -> Option<(ApiResource, bool)> {
    let (group, version, plural, namespaced) = match kind {
        "ConfigMap" => ("", "v1", "configmaps", true),
        "Secret" => ("", "v1", "secrets", true),
        "Service" => ("", "v1", "services", true),
        "Namespace" => ("", "v1", "namespaces", false),
        "Deployment" => ("apps", "v1", "deployments", true),
        "DaemonSet" => ("apps", "v1", "daemonsets", true),
        "StatefulSet" => ("apps", "v1", "statefulsets", true),
        "Ingress" => ("networking.k8s.io", "v1", "ingresses", true),
        _ => return None,
    };
    let gvk = GroupVersionKind::gvk(group, version, kind);
    Some((ApiResource::from_gvk_with_plural(&gvk, plural), namespaced))
}

/// Resolve a kind name to API coordinates: builtin table first, then a
/// discovery scan over every served group for an exact kind match.
pub async fn resolve_kind(client: &Client, kind: &str) -> Result<(ApiResource, bool)> {
    if let Some(found) = builtin_resource(kind) {
        return Ok(found);
    }
    let discovery = Discovery::new(client.clone())
        .run()
        .await
        .context("running api discovery")?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.kind == kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar, namespaced));
            }
        }
    }
    Err(anyhow!("kind {kind} is not served by this cluster"))
}

/// Dynamic API handle scoped to the filter's namespace when the kind allows it.
pub fn dynamic_api(
    client: Client,
    ar: &ApiResource,
    namespaced: bool,
    namespace: Option<&str>,
) -> Api<DynamicObject> {
    match namespace {
        Some(ns) if namespaced => Api::namespaced_with(client, ns, ar),
        _ => Api::all_with(client, ar),
    }
}

/// One page of a snapshot listing.
pub struct ListPage {
    pub items: Vec<LiteMeta>,
    /// List-level resource version, the checkpoint fallback when no item carries one.
    pub resource_version: Option<String>,
    pub continue_token: Option<String>,
}

/// Fetch one page of objects matching the filter. Unreadable items are
/// skipped rather than failing the page.
pub async fn fetch_page(
    api: &Api<DynamicObject>,
    filter: &ResourceFilter,
    limit: u32,
    token: Option<&str>,
) -> Result<ListPage> {
    let mut lp = ListParams::default().limit(limit);
    if let Some(name) = filter.name_opt() {
        lp = lp.fields(&format!("metadata.name={name}"));
    }
    if let Some(tok) = token {
        lp = lp.continue_token(tok);
    }
    let list = api
        .list(&lp)
        .await
        .with_context(|| format!("listing {}", filter.kind))?;
    let mut items = Vec::with_capacity(list.items.len());
    for obj in &list.items {
        match lite_meta(obj) {
            Ok(m) => items.push(m),
            Err(err) => warn!(kind = %filter.kind, error = %err, "skipping unreadable object in listing"),
        }
    }
    let continue_token = list.metadata.continue_.filter(|t| !t.is_empty());
    Ok(ListPage {
        items,
        resource_version: list.metadata.resource_version,
        continue_token,
    })
}

/// Open a raw watch stream from the given resource version. Malformed
/// events are dropped in the adapter so callers only see usable traffic.
pub async fn open_watch(
    api: &Api<DynamicObject>,
    filter: &ResourceFilter,
    resource_version: &str,
    timeout_secs: u32,
    bookmarks: bool,
) -> Result<BoxStream<'static, Result<RawEvent, kube::Error>>, kube::Error> {
    let mut wp = WatchParams::default().timeout(timeout_secs.min(MAX_WATCH_TIMEOUT_SECS));
    if let Some(name) = filter.name_opt() {
        wp = wp.fields(&format!("metadata.name={name}"));
    }
    if !bookmarks {
        wp = wp.disable_bookmarks();
    }
    let stream = api.watch(&wp, resource_version).await?;
    Ok(stream
        .filter_map(|item| async move {
            match item {
                Ok(ev) => raw_event(ev).map(Ok),
                Err(err) => Some(Err(err)),
            }
        })
        .boxed())
}

/// True when an error payload means the watch checkpoint is no longer valid
/// and the session must rebuild from a fresh listing.
pub fn is_stale_signal(code: u16, message: &str) -> bool {
    code == 410 || message.contains("Expired") || message.contains("too old")
}

/// Map a wire event to the session-facing shape. Returns None for events
/// whose metadata cannot be read.
pub fn raw_event(ev: WatchEvent<DynamicObject>) -> Option<RawEvent> {
    let (obj, wrap): (DynamicObject, fn(LiteMeta) -> RawEvent) = match ev {
        WatchEvent::Added(o) => (o, RawEvent::Added),
        WatchEvent::Modified(o) => (o, RawEvent::Modified),
        WatchEvent::Deleted(o) => (o, RawEvent::Deleted),
        WatchEvent::Bookmark(b) => {
            return Some(RawEvent::Bookmark {
                resource_version: b.metadata.resource_version,
            });
        }
        WatchEvent::Error(e) => {
            return Some(RawEvent::Failed {
                message: e.message,
                code: e.code,
            });
        }
    };
    match lite_meta(&obj) {
        Ok(meta) => Some(wrap(meta)),
        Err(err) => {
            warn!(error = %err, "dropping malformed watch event");
            counter!("argus_events_malformed_total", 1u64);
            None
        }
    }
}

/// Extract the lightweight metadata the engine tracks. A missing name is an
/// error since no stable key can be formed; other fields degrade to empty.
pub fn lite_meta(obj: &DynamicObject) -> Result<LiteMeta> {
    let name = obj
        .metadata
        .name
        .clone()
        .ok_or_else(|| anyhow!("object missing metadata.name"))?;
    Ok(LiteMeta {
        namespace: obj.metadata.namespace.clone().unwrap_or_default(),
        name,
        resource_version: obj.metadata.resource_version.clone().unwrap_or_default(),
        creation_ts: obj.metadata.creation_timestamp.as_ref().map(|t| t.0),
        actor: actor_of(&obj.metadata),
    })
}

/// Best-effort attribution of who touched the object. The change-cause
/// annotation is taken verbatim, a kubectl last-applied blob credits
/// kubectl, and the created-by label overrides both when present.
fn actor_of(meta: &ObjectMeta) -> String {
    let mut actor = String::from("unknown");
    if let Some(annotations) = &meta.annotations {
        if let Some(cause) = annotations.get(CHANGE_CAUSE_ANNOTATION) {
            actor = cause.clone();
        } else if let Some(applied) = annotations.get(LAST_APPLIED_ANNOTATION) {
            if applied.contains("kubectl") {
                actor = "kubectl".into();
            }
        }
    }
    if let Some(labels) = &meta.labels {
        if let Some(owner) = labels.get(CREATED_BY_LABEL) {
            actor = owner.clone();
        }
    }
    actor
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::collections::BTreeMap;

    fn object(meta: ObjectMeta) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: meta,
            data: serde_json::json!({}),
        }
    }

    #[test]
    fn builtin_table_covers_common_kinds() {
        let (ar, namespaced) = builtin_resource("Ingress").unwrap();
        assert_eq!(ar.group, "networking.k8s.io");
        assert_eq!(ar.plural, "ingresses");
        assert!(namespaced);

        let (ar, namespaced) = builtin_resource("Namespace").unwrap();
        assert_eq!(ar.group, "");
        assert!(!namespaced);

        assert!(builtin_resource("CronTab").is_none());
    }

    #[test]
    fn lite_meta_requires_a_name() {
        let obj = object(ObjectMeta {
            namespace: Some("default".into()),
            resource_version: Some("12".into()),
            ..Default::default()
        });
        assert!(lite_meta(&obj).is_err());
    }

    #[test]
    fn lite_meta_extracts_fields() {
        let created = chrono::Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let obj = object(ObjectMeta {
            name: Some("web".into()),
            namespace: Some("prod".into()),
            resource_version: Some("3141".into()),
            creation_timestamp: Some(Time(created)),
            ..Default::default()
        });
        let meta = lite_meta(&obj).unwrap();
        assert_eq!(meta.key(), "prod/web");
        assert_eq!(meta.resource_version, "3141");
        assert_eq!(meta.creation_ts, Some(created));
        assert_eq!(meta.actor, "unknown");
    }

    #[test]
    fn actor_prefers_change_cause_over_last_applied() {
        let mut annotations = BTreeMap::new();
        annotations.insert(CHANGE_CAUSE_ANNOTATION.to_string(), "rollout v2".to_string());
        annotations.insert(
            LAST_APPLIED_ANNOTATION.to_string(),
            "{\"managed-by\":\"kubectl\"}".to_string(),
        );
        let meta = ObjectMeta {
            annotations: Some(annotations),
            ..Default::default()
        };
        assert_eq!(actor_of(&meta), "rollout v2");
    }

    #[test]
    fn actor_credits_kubectl_from_last_applied() {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            LAST_APPLIED_ANNOTATION.to_string(),
            "{\"apiVersion\":\"v1\",\"metadata\":{\"annotations\":{\"kubectl.kubernetes.io\":1}}}"
                .to_string(),
        );
        let meta = ObjectMeta {
            annotations: Some(annotations),
            ..Default::default()
        };
        assert_eq!(actor_of(&meta), "kubectl");
    }

    #[test]
    fn created_by_label_wins_over_annotations() {
        let mut annotations = BTreeMap::new();
        annotations.insert(CHANGE_CAUSE_ANNOTATION.to_string(), "rollout v2".to_string());
        let mut labels = BTreeMap::new();
        labels.insert(CREATED_BY_LABEL.to_string(), "ci-bot".to_string());
        let meta = ObjectMeta {
            annotations: Some(annotations),
            labels: Some(labels),
            ..Default::default()
        };
        assert_eq!(actor_of(&meta), "ci-bot");
    }

    #[test]
    fn error_events_map_to_failed() {
        let ev: WatchEvent<DynamicObject> = WatchEvent::Error(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "too old resource version: 1 (2)".into(),
            reason: "Expired".into(),
            code: 410,
        });
        match raw_event(ev) {
            Some(RawEvent::Failed { message, code }) => {
                assert_eq!(code, 410);
                assert!(is_stale_signal(code, &message));
            }
            other => panic!("unexpected mapping: {other:?}"),
        }
    }

    #[test]
    fn nameless_events_are_dropped() {
        let ev: WatchEvent<DynamicObject> = WatchEvent::Added(object(ObjectMeta::default()));
        assert!(raw_event(ev).is_none());
    }
}
