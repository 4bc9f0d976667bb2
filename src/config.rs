//! Component factory for environment-based configuration.
//!
//! Clients are constructed explicitly, once per region/deployment, and
//! shared by reference; there is no process-wide client cache. The factory
//! only reads the environment, so switching between development and
//! production needs no code changes.

use crate::faststore::{FastStore, HttpFastStore, LocalFastStore};
use crate::Result;

use object_store::{aws::AmazonS3Builder, memory::InMemory, ObjectStore};
use std::sync::Arc;
use tracing::info;

pub struct ComponentFactory;

impl ComponentFactory {
    /// Create the object store from environment
    ///
    /// Environment variables:
    /// - STORAGE_BACKEND: "memory" (default) or "s3"
    /// - S3_BUCKET: S3 bucket name (required for s3)
    /// - S3_REGION: S3 region (default: us-east-1)
    /// - S3_ENDPOINT: Custom S3 endpoint (optional, for MinIO)
    /// - AWS_ACCESS_KEY_ID: AWS credentials (optional, uses IAM role if not set)
    /// - AWS_SECRET_ACCESS_KEY: AWS credentials (optional)
    pub fn create_object_store() -> Result<Arc<dyn ObjectStore>> {
        let backend = std::env::var("STORAGE_BACKEND").unwrap_or_else(|_| "memory".to_string());

        match backend.as_str() {
            "memory" => {
                info!("Using in-memory object store (development mode)");
                Ok(Arc::new(InMemory::new()))
            }
            "s3" => {
                let bucket = std::env::var("S3_BUCKET").map_err(|_| {
                    crate::Error::Config("S3_BUCKET required when STORAGE_BACKEND=s3".to_string())
                })?;
                let region = std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string());

                info!("Using S3 object store: bucket={}, region={}", bucket, region);

                let mut builder = AmazonS3Builder::new()
                    .with_bucket_name(&bucket)
                    .with_region(&region);

                // Support custom endpoints (MinIO, LocalStack)
                if let Ok(endpoint) = std::env::var("S3_ENDPOINT") {
                    info!("Using custom S3 endpoint: {}", endpoint);
                    builder = builder.with_endpoint(&endpoint).with_allow_http(true);
                }

                // Use explicit credentials if provided, otherwise use IAM role
                if let Ok(key) = std::env::var("AWS_ACCESS_KEY_ID") {
                    builder = builder.with_access_key_id(&key);
                }
                if let Ok(secret) = std::env::var("AWS_SECRET_ACCESS_KEY") {
                    builder = builder.with_secret_access_key(&secret);
                }

                Ok(Arc::new(builder.build()?))
            }
            _ => Err(crate::Error::Config(format!(
                "Unknown STORAGE_BACKEND: {}. Use 'memory' or 's3'",
                backend
            ))),
        }
    }

    /// Create the fast store from environment
    ///
    /// Environment variables:
    /// - FAST_STORE_BACKEND: "none" (default), "local", or "http"
    /// - FAST_STORE_URL: base URL (required for http)
    ///
    /// Returns `None` when no fast store is configured; the fast read path
    /// is then unavailable, everything else works.
    pub fn create_fast_store() -> Result<Option<Arc<dyn FastStore>>> {
        let backend = std::env::var("FAST_STORE_BACKEND").unwrap_or_else(|_| "none".to_string());

        match backend.as_str() {
            "none" => Ok(None),
            "local" => {
                info!("Using in-memory fast store (development mode)");
                Ok(Some(Arc::new(LocalFastStore::new())))
            }
            "http" => {
                let url = std::env::var("FAST_STORE_URL").map_err(|_| {
                    crate::Error::Config(
                        "FAST_STORE_URL required when FAST_STORE_BACKEND=http".to_string(),
                    )
                })?;
                info!("Using HTTP fast store at {}", url);
                Ok(Some(Arc::new(HttpFastStore::new(url)?)))
            }
            _ => Err(crate::Error::Config(format!(
                "Unknown FAST_STORE_BACKEND: {}. Use 'none', 'local' or 'http'",
                backend
            ))),
        }
    }
}
