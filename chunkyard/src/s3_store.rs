use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::primitives::ByteStream as AwsByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use std::env;
use tracing::{debug, warn};

use crate::{ByteStream, ObjectStoreGateway, StoredObject, UploadError, UploadResult};

/// S3 rejects multipart parts below 5 MiB except the last one.
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;
const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;

/// Configuration for an S3-compatible object store
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Base used to build returned object URLs, e.g. a CDN origin
    pub public_base_url: Option<String>,
    pub force_path_style: bool,
    pub part_size: usize,
}

impl S3Config {
    pub fn new<B: Into<String>, R: Into<String>>(bucket: B, region: R) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
            endpoint_url: None,
            access_key_id: None,
            secret_access_key: None,
            public_base_url: None,
            force_path_style: false,
            part_size: DEFAULT_PART_SIZE,
        }
    }

    /// Read `CHUNKYARD_S3_*` environment variables
    ///
    /// `CHUNKYARD_S3_BUCKET` is required; credentials fall back to the default
    /// AWS provider chain when the key pair is absent.
    pub fn from_env() -> UploadResult<Self> {
        fn get_env(key: &str) -> UploadResult<String> {
            env::var(key).map_err(|_| UploadError::invalid(format!("{} environment variable required", key)))
        }

        let mut config = Self::new(
            get_env("CHUNKYARD_S3_BUCKET")?,
            env::var("CHUNKYARD_S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
        );
        config.endpoint_url = env::var("CHUNKYARD_S3_ENDPOINT_URL").ok();
        config.access_key_id = env::var("CHUNKYARD_S3_ACCESS_KEY_ID").ok();
        config.secret_access_key = env::var("CHUNKYARD_S3_SECRET_ACCESS_KEY").ok();
        config.public_base_url = env::var("CHUNKYARD_S3_PUBLIC_BASE_URL").ok();
        config.force_path_style = env::var("CHUNKYARD_S3_FORCE_PATH_STYLE")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(config.endpoint_url.is_some());
        Ok(config)
    }

    pub fn with_endpoint<S: Into<String>>(mut self, endpoint_url: S) -> Self {
        self.endpoint_url = Some(endpoint_url.into());
        self.force_path_style = true;
        self
    }

    pub fn with_credentials<A: Into<String>, S: Into<String>>(mut self, access_key_id: A, secret: S) -> Self {
        self.access_key_id = Some(access_key_id.into());
        self.secret_access_key = Some(secret.into());
        self
    }

    pub fn with_public_base_url<S: Into<String>>(mut self, base: S) -> Self {
        self.public_base_url = Some(base.into());
        self
    }

    pub fn with_part_size(mut self, bytes: usize) -> Self {
        self.part_size = bytes.max(MIN_PART_SIZE);
        self
    }

    /// URL under which `key` is readable once stored
    pub fn object_url(&self, key: &str) -> String {
        if let Some(base) = &self.public_base_url {
            return format!("{}/{}", base.trim_end_matches('/'), key);
        }
        match &self.endpoint_url {
            Some(endpoint) => format!("{}/{}/{}", endpoint.trim_end_matches('/'), self.bucket, key),
            None => format!("https://{}.s3.{}.amazonaws.com/{}", self.bucket, self.region, key),
        }
    }
}

/// Object store gateway backed by an S3-compatible service
///
/// The assembled stream is sent as a multipart upload, buffering one part at a
/// time. The object only becomes visible on `CompleteMultipartUpload`; any
/// stream or backend error aborts the multipart upload instead.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    config: S3Config,
}

impl S3ObjectStore {
    pub async fn new(config: S3Config) -> UploadResult<Self> {
        let client = Self::create_client(&config).await;
        Ok(Self { client, config })
    }

    pub fn from_client(client: Client, config: S3Config) -> Self {
        Self { client, config }
    }

    async fn create_client(config: &S3Config) -> Client {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if let (Some(key), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                key.clone(),
                secret.clone(),
                None,
                None,
                "chunkyard",
            ));
        }
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint.clone());
        }

        let aws_config = loader.load().await;

        Client::from_conf(
            aws_sdk_s3::config::Builder::from(&aws_config)
                .force_path_style(config.force_path_style)
                .build(),
        )
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> UploadResult<CompletedPart> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.config.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(AwsByteStream::from(data))
            .send()
            .await
            .map_err(UploadError::backend)?;

        Ok(CompletedPart::builder()
            .e_tag(output.e_tag().unwrap_or_default())
            .part_number(part_number)
            .build())
    }

    /// Push every part of `stream`; returns the completed parts and byte count
    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        mut stream: ByteStream,
    ) -> UploadResult<(Vec<CompletedPart>, u64)> {
        let part_size = self.config.part_size.max(MIN_PART_SIZE);
        let mut parts = Vec::new();
        let mut buffer = BytesMut::with_capacity(part_size);
        let mut total: u64 = 0;

        while let Some(piece) = stream.next().await {
            let piece = piece.map_err(UploadError::backend)?;
            total += piece.len() as u64;
            buffer.extend_from_slice(&piece);

            while buffer.len() >= part_size {
                let part = buffer.split_to(part_size).freeze();
                let number = parts.len() as i32 + 1;
                parts.push(self.upload_part(key, upload_id, number, part).await?);
            }
        }

        if !buffer.is_empty() {
            let number = parts.len() as i32 + 1;
            parts.push(self.upload_part(key, upload_id, number, buffer.freeze()).await?);
        }

        Ok((parts, total))
    }

    async fn abort(&self, key: &str, upload_id: &str) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.config.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            warn!(key, upload_id, error = %e, "failed to abort multipart upload, orphaned parts may remain");
        }
    }
}

#[async_trait]
impl ObjectStoreGateway for S3ObjectStore {
    async fn put(
        &self,
        key: &str,
        stream: ByteStream,
        content_type: &str,
    ) -> UploadResult<StoredObject> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.config.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(UploadError::backend)?;

        let upload_id = created
            .upload_id()
            .ok_or_else(|| UploadError::invalid("S3 did not return an upload id"))?
            .to_string();

        let (parts, size_bytes) = match self.upload_parts(key, &upload_id, stream).await {
            Ok(result) => result,
            Err(e) => {
                self.abort(key, &upload_id).await;
                return Err(e);
            }
        };

        // Multipart uploads need at least one part; empty objects go through PutObject.
        if parts.is_empty() {
            self.abort(key, &upload_id).await;
            let output = self
                .client
                .put_object()
                .bucket(&self.config.bucket)
                .key(key)
                .content_type(content_type)
                .body(AwsByteStream::from(Bytes::new()))
                .send()
                .await
                .map_err(UploadError::backend)?;

            return Ok(StoredObject {
                key: key.to_string(),
                url: self.config.object_url(key),
                size_bytes: 0,
                etag: output.e_tag,
            });
        }

        let part_count = parts.len();
        let completed = self
            .client
            .complete_multipart_upload()
            .bucket(&self.config.bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await;

        let completed = match completed {
            Ok(output) => output,
            Err(e) => {
                self.abort(key, &upload_id).await;
                return Err(UploadError::backend(e));
            }
        };

        debug!(key, size_bytes, part_count, "completed multipart upload");

        Ok(StoredObject {
            key: key.to_string(),
            url: self.config.object_url(key),
            size_bytes,
            etag: completed.e_tag,
        })
    }
}
