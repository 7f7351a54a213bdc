//! S3 object-store access for export: bucket construction, pre-flight
//! head checks and uploads.

use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Everything needed to talk to one bucket, credentials included.
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
    /// Custom endpoint for S3-compatible stores (e.g. MinIO).
    pub endpoint: Option<String>,
}

/// Build an S3 bucket instance from settings.
pub fn build_bucket(settings: &S3Settings) -> Result<Bucket> {
    let region = match &settings.endpoint {
        Some(endpoint) => Region::Custom {
            region: settings.region.clone(),
            endpoint: endpoint.clone(),
        },
        None => settings
            .region
            .parse()
            .map_err(|e| Error::ObjectStore {
                detail: format!("invalid region {:?}: {e}", settings.region),
            })?,
    };
    let credentials = Credentials::new(
        Some(&settings.access_key),
        Some(&settings.secret_key),
        settings.session_token.as_deref(),
        None,
        None,
    )
    .map_err(|e| Error::ObjectStore {
        detail: format!("invalid S3 credentials: {e}"),
    })?;

    let bucket = Bucket::new(&settings.bucket, region, credentials).map_err(|e| {
        Error::ObjectStore {
            detail: format!("cannot create bucket handle: {e}"),
        }
    })?;
    Ok(if settings.endpoint.is_some() {
        *bucket.with_path_style()
    } else {
        *bucket
    })
}

/// Check bucket connectivity once at startup.
pub async fn check_connectivity(bucket: &Bucket) -> Result<()> {
    match bucket.exists().await {
        Ok(_) => {
            info!("S3 connectivity check succeeded for bucket: {}", bucket.name());
            Ok(())
        }
        Err(e) => Err(Error::ObjectStore {
            detail: format!("S3 connectivity check failed for {}: {e}", bucket.name()),
        }),
    }
}

/// Pre-flight existence check via a head request.
pub async fn object_exists(bucket: &Bucket, key: &str) -> Result<bool> {
    match bucket.head_object(key).await {
        Ok((_, code)) if code == 200 => {
            debug!("object {key} already present");
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(S3Error::HttpFailWithBody(404, _)) => Ok(false),
        Err(e) => Err(Error::ObjectStore {
            detail: format!("S3 head_object {key}: {e}"),
        }),
    }
}

/// Upload one object.
pub async fn put_object(bucket: &Bucket, key: &str, data: &[u8]) -> Result<()> {
    let response = bucket
        .put_object(key, data)
        .await
        .map_err(|e| Error::ObjectStore {
            detail: format!("S3 put_object {key}: {e}"),
        })?;
    let code = response.status_code();
    if code == 200 || code == 201 {
        Ok(())
    } else {
        Err(Error::ObjectStore {
            detail: format!("S3 put_object {key}: HTTP {code}"),
        })
    }
}
