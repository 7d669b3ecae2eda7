use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::{error::AppError, storage::store::StorageManager};

pub const ARTIFACT_CONTENT_TYPE: &str = "image/png";
const ARTIFACT_EXTENSION: &str = "png";
const DATE_BUCKET_FORMAT: &str = "%Y%m%d";

/// Location of a job's artifact relative to the storage root,
/// `YYYYMMDD/<image_name>.png`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactLocation {
    path: String,
    file_name: String,
}

impl ArtifactLocation {
    pub fn as_str(&self) -> &str {
        &self.path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn content_type(&self) -> &'static str {
        ARTIFACT_CONTENT_TYPE
    }
}

impl fmt::Display for ArtifactLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// Pure mapping from a job's identity to where its artifact lives.
///
/// The date bucket comes from the job's creation time, so a job that finishes
/// after midnight is still found under the day it was submitted.
pub fn locate(image_name: &str, created_at: DateTime<Utc>) -> ArtifactLocation {
    let file_name = format!("{image_name}.{ARTIFACT_EXTENSION}");
    let path = format!("{}/{file_name}", created_at.format(DATE_BUCKET_FORMAT));

    ArtifactLocation { path, file_name }
}

pub type ArtifactStream = BoxStream<'static, Result<Bytes, object_store::Error>>;

pub async fn write_artifact(
    storage: &StorageManager,
    location: &ArtifactLocation,
    bytes: Bytes,
) -> Result<(), AppError> {
    storage.put(location.as_str(), bytes).await?;
    Ok(())
}

/// Opens the artifact for streaming. A missing object is `ArtifactNotFound`.
pub async fn open_artifact(
    storage: &StorageManager,
    location: &ArtifactLocation,
) -> Result<ArtifactStream, AppError> {
    match storage.get_stream(location.as_str()).await {
        Ok(stream) => Ok(stream),
        Err(object_store::Error::NotFound { .. }) => {
            Err(AppError::ArtifactNotFound(location.to_string()))
        }
        Err(err) => Err(AppError::Storage(err)),
    }
}
