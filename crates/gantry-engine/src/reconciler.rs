//! Boot-time reconciliation
//!
//! A new incarnation must never inherit containers from a previous one.
//! Every backend container tagged with this executor's owner name is
//! destroyed before the control plane starts; any failure is fatal.

use crate::OWNER_PROPERTY;
use gantry_backend::{Backend, BackendError};

/// Destroy all backend containers owned by `owner_name`.
/// Returns how many were destroyed.
pub async fn reconcile(backend: &dyn Backend, owner_name: &str) -> Result<usize, BackendError> {
    let handles = backend
        .containers_by_property(OWNER_PROPERTY, owner_name)
        .await?;

    for handle in &handles {
        tracing::info!(handle = %handle, owner = %owner_name, "Destroying stale container");
        backend.destroy(handle).await?;
    }

    if !handles.is_empty() {
        tracing::info!(count = handles.len(), "Reconciliation destroyed stale containers");
    }
    Ok(handles.len())
}
