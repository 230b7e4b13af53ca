//! Operator control of transforms: start and stop.
//!
//! Control operations do not take the execution lock. Stopping also
//! disables the transform, so a tick already in flight finishes its unit of
//! work and no new tick starts.

use chrono::Utc;
use snafu::prelude::*;
use tracing::info;

use crate::error::{
    ControlError, ControlMetadataSnafu, ControlNotFoundSnafu, ControlStoreSnafu,
};
use crate::model::{Transform, TransformMetadata, TransformStatus};
use crate::runner::TransformServices;
use crate::store::update_transform;

async fn load(services: &TransformServices, id: &str) -> Result<Transform, ControlError> {
    services
        .transforms
        .get(id)
        .await
        .context(ControlStoreSnafu { id })?
        .context(ControlNotFoundSnafu { id })
}

async fn load_metadata(
    services: &TransformServices,
    transform: &Transform,
) -> Result<Option<TransformMetadata>, ControlError> {
    let Some(metadata_id) = &transform.metadata_id else {
        return Ok(None);
    };
    services
        .metadata
        .read(metadata_id)
        .await
        .context(ControlMetadataSnafu {
            id: transform.id.as_str(),
        })
}

/// Enable `id` so the scheduler runs it again.
///
/// A failed or stopped transform is reset to `init` and resumes from its
/// committed progress. A finished single-shot transform starts over.
pub async fn start_transform(
    services: &TransformServices,
    id: &str,
) -> Result<Transform, ControlError> {
    let transform = load(services, id).await?;

    if let Some(mut metadata) = load_metadata(services, &transform).await? {
        let reset = match metadata.status {
            TransformStatus::Failed | TransformStatus::Stopped => {
                metadata.status = TransformStatus::Init;
                metadata.failure_reason = None;
                true
            }
            TransformStatus::Finished if !transform.continuous => {
                let mut fresh = TransformMetadata::new(
                    metadata.id.clone(),
                    metadata.transform_id.clone(),
                    Utc::now(),
                );
                fresh.seq_no = metadata.seq_no;
                fresh.primary_term = metadata.primary_term;
                metadata = fresh;
                true
            }
            _ => false,
        };

        if reset {
            metadata.last_updated_at = Utc::now();
            services
                .metadata
                .write(metadata, true)
                .await
                .context(ControlMetadataSnafu { id })?;
        }
    }

    let now = Utc::now();
    let transform = update_transform(services.transforms.as_ref(), &transform, |t| {
        t.enabled = true;
        t.enabled_at = Some(now);
        t.updated_at = now;
    })
    .await
    .context(ControlStoreSnafu { id })?;

    info!(target = %transform.id, "Started transform");
    Ok(transform)
}

/// Stop `id`: mark its metadata stopped and disable it.
pub async fn stop_transform(
    services: &TransformServices,
    id: &str,
) -> Result<Transform, ControlError> {
    let transform = load(services, id).await?;

    if let Some(mut metadata) = load_metadata(services, &transform).await? {
        metadata.status = TransformStatus::Stopped;
        metadata.last_updated_at = Utc::now();
        services
            .metadata
            .write(metadata, true)
            .await
            .context(ControlMetadataSnafu { id })?;
    }

    let now = Utc::now();
    let transform = update_transform(services.transforms.as_ref(), &transform, |t| {
        t.disable(now)
    })
    .await
    .context(ControlStoreSnafu { id })?;

    info!(target = %transform.id, "Stopped transform");
    Ok(transform)
}
