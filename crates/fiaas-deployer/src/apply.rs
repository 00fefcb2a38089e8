//! Create-or-update of one desired object with conflict retry

use fiaas_common::metrics::record_conflict;
use fiaas_common::retry::{retry_with_backoff_if, RetryConfig};
use fiaas_common::{Error, Result};
use tracing::debug;

use crate::cluster::ClusterClient;
use crate::object::ManagedObject;
use crate::result::ObjectOutcome;

/// Bring the live object in line with `desired`.
///
/// Reads the live object by name, creates it when absent, otherwise merges
/// `desired` into it and replaces it unless it already matches. A stale
/// resourceVersion restarts the read-merge-write cycle; once `retry` is
/// exhausted the object fails with [`Error::ConflictExhausted`]. Other
/// errors are returned immediately.
pub async fn apply_object(
    client: &dyn ClusterClient,
    desired: &ManagedObject,
    retry: &RetryConfig,
    preserve_replicas: bool,
) -> Result<ObjectOutcome> {
    let kind = desired.kind();
    let name = desired.name();
    let namespace = desired.namespace();
    let operation = format!("apply {}/{}", kind, name);

    let result = retry_with_backoff_if(
        retry,
        &operation,
        || async move {
            match client.get(kind, namespace, name).await? {
                None => {
                    client.create(desired).await?;
                    Ok::<_, Error>(ObjectOutcome::Created)
                }
                Some(live) => {
                    let merged = desired.merge_live(&live, preserve_replicas)?;
                    if merged.is_satisfied_by(&live)? {
                        debug!(kind = %kind, name = %name, "live object already matches");
                        return Ok(ObjectOutcome::Unchanged);
                    }
                    client.replace(&merged).await?;
                    Ok(ObjectOutcome::Updated)
                }
            }
        },
        |e: &Error| {
            if e.is_conflict() {
                record_conflict(kind.as_str());
                true
            } else {
                false
            }
        },
    )
    .await;

    match result {
        Err(e) if e.is_conflict() => Err(Error::conflict_exhausted(
            kind.as_str(),
            name,
            retry.max_attempts,
        )),
        other => other,
    }
}
