// BSD 3-Clause License
// Copyright (c) 2025, NØNOS - NOXRUN
//
//! Object-store adapter for session workspaces.
//!
//! Workspaces live under `{prefix}sessions/{session_id}/` in one bucket.
//! The control plane relies only on read-your-writes by key; listings are
//! used solely for prefix deletion, where eventual consistency is tolerable
//! because deletion is retried by the retention policy.

use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object store request failed: {0}")]
    Request(String),

    #[error("object store response unreadable: {0}")]
    Body(String),
}

/// S3-compatible object store scoped to one bucket.
#[derive(Clone)]
pub struct ObjectStore {
    client: Client,
    bucket: String,
    prefix: String,
    presign_ttl: Duration,
}

impl ObjectStore {
    pub async fn connect(config: &StorageConfig) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if !config.access_key.is_empty() {
            loader = loader.credentials_provider(Credentials::new(
                config.access_key.clone(),
                config.secret_key.clone(),
                None,
                None,
                "noxrun",
            ));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }

        let sdk_config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();

        info!(
            "Object store client ready (bucket: {}, endpoint: {})",
            config.bucket,
            config.endpoint.as_deref().unwrap_or("aws")
        );

        Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            prefix: normalize_prefix(&config.prefix),
            presign_ttl: Duration::from_secs(config.presign_ttl_secs),
        }
    }

    /// Key prefix for a session's workspace, relative to the bucket.
    pub fn workspace_prefix(&self, session_id: &str) -> String {
        workspace_prefix_key(&self.prefix, session_id)
    }

    /// The `s3://` form persisted on the session row and handed to containers.
    pub fn workspace_url(&self, session_id: &str) -> String {
        format!("s3://{}/{}", self.bucket, self.workspace_prefix(session_id))
    }

    /// Bucket-relative key for a workspace file.
    pub fn object_key(&self, session_id: &str, relative_path: &str) -> String {
        format!("{}{}", self.workspace_prefix(session_id), relative_path)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: Option<&str>,
    ) -> Result<(), StorageError> {
        let mut req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(data.into());
        if let Some(ct) = content_type {
            req = req.content_type(ct);
        }
        req.send()
            .await
            .map_err(|e| StorageError::Request(e.to_string()))?;
        debug!("Stored object {}", key);
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => {
                let data = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| StorageError::Body(e.to_string()))?;
                Ok(Some(data.into_bytes()))
            }
            Err(err) => {
                if err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    Ok(None)
                } else {
                    Err(StorageError::Request(err.to_string()))
                }
            }
        }
    }

    /// Object size in bytes, or None when absent.
    pub async fn size_of(&self, key: &str) -> Result<Option<i64>, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(output.content_length().unwrap_or(0))),
            Err(err) => {
                if err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(None)
                } else {
                    Err(StorageError::Request(err.to_string()))
                }
            }
        }
    }

    /// Delete every object under a prefix. Returns the number removed.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<u64, StorageError> {
        let mut deleted = 0u64;
        let mut continuation: Option<String> = None;

        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .max_keys(1000);
            if let Some(token) = &continuation {
                req = req.continuation_token(token.clone());
            }
            let page = req
                .send()
                .await
                .map_err(|e| StorageError::Request(e.to_string()))?;

            let keys: Vec<String> = page
                .contents()
                .iter()
                .filter_map(|o| o.key().map(String::from))
                .collect();

            if !keys.is_empty() {
                let identifiers: Vec<ObjectIdentifier> = keys
                    .iter()
                    .filter_map(|k| ObjectIdentifier::builder().key(k).build().ok())
                    .collect();
                let delete = Delete::builder()
                    .set_objects(Some(identifiers))
                    .quiet(true)
                    .build()
                    .map_err(|e| StorageError::Request(e.to_string()))?;

                self.client
                    .delete_objects()
                    .bucket(&self.bucket)
                    .delete(delete)
                    .send()
                    .await
                    .map_err(|e| StorageError::Request(e.to_string()))?;
                deleted += keys.len() as u64;
            }

            continuation = page
                .next_continuation_token()
                .map(String::from)
                .filter(|_| page.is_truncated().unwrap_or(false));
            if continuation.is_none() {
                break;
            }
        }

        if deleted > 0 {
            debug!("Deleted {} objects under {}", deleted, prefix);
        }
        Ok(deleted)
    }

    /// Presigned GET URL for large downloads.
    pub async fn presign_get(&self, key: &str) -> Result<String, StorageError> {
        let presigning = PresigningConfig::builder()
            .expires_in(self.presign_ttl)
            .build()
            .map_err(|e| StorageError::Request(e.to_string()))?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| StorageError::Request(e.to_string()))?;
        Ok(presigned.uri().to_string())
    }

    /// Liveness probe for the health rollup.
    pub async fn healthy(&self) -> bool {
        match self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!("Object store health probe failed: {}", e);
                false
            }
        }
    }
}

/// Normalize the configured root prefix to "" or "segment/".
fn normalize_prefix(raw: &str) -> String {
    match raw.trim_matches('/') {
        "" => String::new(),
        p => format!("{}/", p),
    }
}

fn workspace_prefix_key(prefix: &str, session_id: &str) -> String {
    format!("{}sessions/{}/", prefix, session_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("/"), "");
        assert_eq!(normalize_prefix("sandbox"), "sandbox/");
        assert_eq!(normalize_prefix("/sandbox/"), "sandbox/");
        assert_eq!(normalize_prefix("a/b/"), "a/b/");
    }

    #[test]
    fn test_workspace_key_layout() {
        assert_eq!(
            workspace_prefix_key("", "sess_abcdefgh12345678"),
            "sessions/sess_abcdefgh12345678/"
        );
        assert_eq!(
            workspace_prefix_key("sandbox/", "sess_abcdefgh12345678"),
            "sandbox/sessions/sess_abcdefgh12345678/"
        );
    }
}
