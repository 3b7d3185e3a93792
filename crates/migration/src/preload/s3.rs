//! Narrow object-storage client used by the bundle preload.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct ObjectData {
    pub bytes: Vec<u8>,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ListObjectItem {
    pub key: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub size: i64,
}

#[derive(Debug, Clone)]
pub struct ListObjectsResult {
    pub items: Vec<ListObjectItem>,
    pub next_continuation_token: Option<String>,
}

#[derive(Debug, Clone, Error)]
pub enum S3ClientError {
    #[error("not found")]
    NotFound,
    #[error("throttled: {0}")]
    Throttled(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Read-only subset of the S3 API.
#[async_trait]
pub trait S3Api: Send + Sync {
    async fn head_bucket(&self, bucket: &str) -> Result<(), S3ClientError>;

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectData>, S3ClientError>;

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
        max_keys: Option<i32>,
    ) -> Result<ListObjectsResult, S3ClientError>;
}

#[cfg(feature = "s3")]
pub use aws::AwsS3Client;

#[cfg(feature = "s3")]
mod aws {
    use async_trait::async_trait;
    use aws_config::{BehaviorVersion, Region, SdkConfig};
    use aws_sdk_s3::Client;
    use aws_sdk_s3::error::ProvideErrorMetadata;
    use chrono::{DateTime, Utc};

    use super::{ListObjectItem, ListObjectsResult, ObjectData, S3Api, S3ClientError};

    #[derive(Debug, Clone)]
    pub struct AwsS3Client {
        client: Client,
    }

    impl AwsS3Client {
        pub fn from_sdk_config(config: &SdkConfig) -> Self {
            Self {
                client: Client::new(config),
            }
        }

        pub async fn load_sdk_config(region: Option<&str>) -> SdkConfig {
            let mut loader = aws_config::defaults(BehaviorVersion::latest());
            if let Some(region) = region {
                loader = loader.region(Region::new(region.to_string()));
            }
            loader.load().await
        }
    }

    fn to_chrono(time: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(time.secs(), time.subsec_nanos())
    }

    #[async_trait]
    impl S3Api for AwsS3Client {
        async fn head_bucket(&self, bucket: &str) -> Result<(), S3ClientError> {
            self.client
                .head_bucket()
                .bucket(bucket)
                .send()
                .await
                .map_err(map_sdk_error)?;
            Ok(())
        }

        async fn get_object(
            &self,
            bucket: &str,
            key: &str,
        ) -> Result<Option<ObjectData>, S3ClientError> {
            match self
                .client
                .get_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
            {
                Ok(out) => {
                    let last_modified = out.last_modified().and_then(to_chrono);
                    let bytes = out
                        .body
                        .collect()
                        .await
                        .map_err(|e| {
                            S3ClientError::Internal(format!("failed to collect object body: {e}"))
                        })?
                        .into_bytes()
                        .to_vec();
                    Ok(Some(ObjectData {
                        bytes,
                        last_modified,
                    }))
                }
                Err(err) => {
                    let mapped = map_sdk_error(err);
                    if matches!(mapped, S3ClientError::NotFound) {
                        Ok(None)
                    } else {
                        Err(mapped)
                    }
                }
            }
        }

        async fn list_objects(
            &self,
            bucket: &str,
            prefix: &str,
            continuation: Option<&str>,
            max_keys: Option<i32>,
        ) -> Result<ListObjectsResult, S3ClientError> {
            let mut req = self.client.list_objects_v2().bucket(bucket).prefix(prefix);

            if let Some(token) = continuation {
                req = req.continuation_token(token);
            }
            if let Some(max_keys) = max_keys {
                req = req.max_keys(max_keys);
            }

            let out = req.send().await.map_err(map_sdk_error)?;
            let items = out
                .contents()
                .iter()
                .filter_map(|item| {
                    item.key().map(|key| ListObjectItem {
                        key: key.to_string(),
                        last_modified: item.last_modified().and_then(to_chrono),
                        size: item.size().unwrap_or_default(),
                    })
                })
                .collect();

            Ok(ListObjectsResult {
                items,
                next_continuation_token: out.next_continuation_token().map(|s| s.to_string()),
            })
        }
    }

    fn map_sdk_error<E>(err: aws_sdk_s3::error::SdkError<E>) -> S3ClientError
    where
        E: ProvideErrorMetadata + std::fmt::Debug,
    {
        let fallback = format!("{err:?}");

        match err {
            aws_sdk_s3::error::SdkError::ServiceError(service_err) => {
                let code = service_err.err().code().unwrap_or("Unknown");
                let message = service_err
                    .err()
                    .message()
                    .map(str::to_string)
                    .unwrap_or_else(|| fallback.clone());
                match code {
                    "NoSuchKey" | "NotFound" | "NoSuchBucket" => S3ClientError::NotFound,
                    "SlowDown" | "Throttling" | "ThrottlingException" => {
                        S3ClientError::Throttled(message)
                    }
                    "InvalidBucketName" | "InvalidArgument" => S3ClientError::InvalidInput(message),
                    _ => S3ClientError::Internal(message),
                }
            }
            aws_sdk_s3::error::SdkError::TimeoutError(_)
            | aws_sdk_s3::error::SdkError::DispatchFailure(_) => S3ClientError::Unavailable(fallback),
            _ => S3ClientError::Internal(fallback),
        }
    }
}
