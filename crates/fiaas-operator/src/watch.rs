//! Application resources as a feed of CREATE/UPDATE/DELETE changes
//!
//! The kube watcher re-lists every object after each reconnect. The
//! [`ChangeTracker`] remembers the last resourceVersion per object so that a
//! re-list of an unchanged object produces nothing, and objects missing from
//! a re-list are reported as deleted.

use std::collections::{HashMap, HashSet};
use std::fmt;

use futures::{stream, Stream, StreamExt};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, ResourceExt};
use tracing::debug;

use fiaas_common::crd::ApplicationResource;
use fiaas_common::{Error, Result};
use fiaas_spec::RawSpecDocument;

/// Server-side watch timeout; below the client read timeout so idle watches
/// are closed by the API server first
const WATCH_TIMEOUT_SECS: u32 = 25;

/// What happened to an application resource
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// First time the resource is seen
    Create,
    /// A new version of a known resource
    Update,
    /// The resource is gone
    Delete,
}

impl Operation {
    /// Upper-case name used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One change notification for an application
#[derive(Clone, Debug, PartialEq)]
pub struct AppChange {
    /// Kind of change
    pub operation: Operation,
    /// Application name
    pub name: String,
    /// Namespace of the application resource
    pub namespace: String,
    /// Deployment id carried by the resource
    pub deployment_id: String,
    /// Pipeline callback URL annotated on the resource
    pub callback_url: Option<String>,
    /// Submitted document; for deletes, the last known one
    pub document: RawSpecDocument,
}

impl AppChange {
    fn from_resource<A: ApplicationResource>(resource: &A, operation: Operation) -> Self {
        let spec = resource.application_spec();
        let namespace = resource.namespace().unwrap_or_default();
        let deployment_id = resource.deployment_id();
        Self {
            operation,
            name: spec.application.clone(),
            namespace: namespace.clone(),
            deployment_id: deployment_id.clone(),
            callback_url: resource.callback_url(),
            document: RawSpecDocument::new(
                spec.application.clone(),
                namespace,
                spec.image.clone(),
                deployment_id,
                spec.config.clone(),
            ),
        }
    }
}

type ObjectKey = (String, String);

#[derive(Debug)]
struct Seen {
    resource_version: Option<String>,
    last: AppChange,
}

/// Turns raw watcher events into [`AppChange`]s
#[derive(Debug, Default)]
pub struct ChangeTracker {
    seen: HashMap<ObjectKey, Seen>,
    relisted: Option<HashSet<ObjectKey>>,
}

fn key_of<A: ApplicationResource>(resource: &A) -> ObjectKey {
    (resource.namespace().unwrap_or_default(), resource.name_any())
}

impl ChangeTracker {
    /// Create a tracker that has seen nothing
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of resources currently known
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether no resources are known
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Changes implied by one watcher event, in order
    pub fn observe<A: ApplicationResource>(&mut self, event: Event<A>) -> Vec<AppChange> {
        match event {
            Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            Event::InitApply(resource) => {
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(key_of(&resource));
                }
                self.applied(&resource).into_iter().collect()
            }
            Event::Apply(resource) => self.applied(&resource).into_iter().collect(),
            Event::InitDone => {
                let Some(relisted) = self.relisted.take() else {
                    return Vec::new();
                };
                let gone: Vec<ObjectKey> = self
                    .seen
                    .keys()
                    .filter(|key| !relisted.contains(*key))
                    .cloned()
                    .collect();
                gone.into_iter()
                    .filter_map(|key| self.seen.remove(&key))
                    .map(|seen| AppChange {
                        operation: Operation::Delete,
                        ..seen.last
                    })
                    .collect()
            }
            Event::Delete(resource) => {
                self.seen.remove(&key_of(&resource));
                vec![AppChange::from_resource(&resource, Operation::Delete)]
            }
        }
    }

    fn applied<A: ApplicationResource>(&mut self, resource: &A) -> Option<AppChange> {
        let key = key_of(resource);
        let resource_version = resource.resource_version();
        let previous = self.seen.get(&key);
        if let (Some(previous), Some(rv)) = (previous, resource_version.as_ref()) {
            if previous.resource_version.as_ref() == Some(rv) {
                debug!(name = %key.1, resource_version = %rv, "Unchanged application resource");
                return None;
            }
        }
        let operation = if previous.is_some() {
            Operation::Update
        } else {
            Operation::Create
        };
        let change = AppChange::from_resource(resource, operation);
        self.seen.insert(
            key,
            Seen {
                resource_version,
                last: change.clone(),
            },
        );
        Some(change)
    }
}

/// Watch `api` and yield every application change. Watch errors are yielded
/// as [`Error::ClusterUnavailable`] and the watch keeps going with backoff.
pub fn application_changes<A: ApplicationResource>(
    api: Api<A>,
) -> impl Stream<Item = Result<AppChange>> + Send {
    let mut tracker = ChangeTracker::new();
    watcher::watcher(api, watcher::Config::default().timeout(WATCH_TIMEOUT_SECS))
        .default_backoff()
        .flat_map(move |event| {
            let items: Vec<Result<AppChange>> = match event {
                Ok(event) => tracker.observe(event).into_iter().map(Ok).collect(),
                Err(e) => vec![Err(Error::cluster_unavailable(e.to_string()))],
            };
            stream::iter(items)
        })
}
