//! Process-wide S3 SDK handle.
//!
//! The SDK spawns I/O threads, so the handle may only be created after a
//! potential service daemonisation and only once per process lifetime.
//! Workers are plain blocking threads; the context owns a small tokio
//! runtime and exposes blocking wrappers over the async SDK calls.

use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketCannedAcl, CompletedMultipartUpload, CompletedPart, Delete, ObjectCannedAcl,
    ObjectIdentifier,
};
use aws_sdk_s3::Client;

use crate::config::BenchConfig;

use super::registry::{MultipartBackend, UploadPart, UploadRegistry};

/// Max keys per multi-object delete request (S3 API limit).
const MULTI_DELETE_BATCH: usize = 1000;

pub struct S3Context {
    runtime: tokio::runtime::Runtime,
    client: Client,
}

static CONTEXT: OnceLock<Arc<S3Context>> = OnceLock::new();

/// Return the process-wide context, creating it on first use. The SDK init
/// cannot be repeated within one process, so later calls reuse the first
/// handle regardless of config changes (S3 settings never change between
/// phases of a run).
pub fn get_or_init(cfg: &BenchConfig) -> Result<Arc<S3Context>> {
    if let Some(ctx) = CONTEXT.get() {
        return Ok(Arc::clone(ctx));
    }
    let ctx = Arc::new(S3Context::init(cfg)?);
    Ok(Arc::clone(CONTEXT.get_or_init(|| ctx)))
}

impl S3Context {
    fn init(cfg: &BenchConfig) -> Result<S3Context> {
        tracing::debug!("initializing S3 SDK");

        // Avoid the long instance-metadata-service timeout when credentials
        // are already configured; an explicit environment value wins.
        if std::env::var_os("AWS_EC2_METADATA_DISABLED").is_none() {
            std::env::set_var("AWS_EC2_METADATA_DISABLED", "true");
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("fleetbench-s3")
            .enable_all()
            .build()
            .context("build S3 runtime")?;

        let region = cfg
            .s3_region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region))
            .force_path_style(true);

        if let (Some(access), Some(secret)) = (&cfg.s3_access_key, &cfg.s3_secret_key) {
            builder =
                builder.credentials_provider(Credentials::new(access, secret, None, None, "fleetbench"));
        } else {
            // fall back to the ambient credential chain (env, profile, ...)
            let shared = runtime.block_on(
                aws_config::defaults(BehaviorVersion::latest()).load(),
            );
            if let Some(provider) = shared.credentials_provider() {
                builder = builder.credentials_provider(provider);
            }
        }

        if let Some(endpoint) = &cfg.s3_endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());

        Ok(S3Context { runtime, client })
    }

    pub fn put_object(&self, bucket: &str, object: &str, body: Vec<u8>) -> Result<()> {
        self.runtime
            .block_on(
                self.client
                    .put_object()
                    .bucket(bucket)
                    .key(object)
                    .body(ByteStream::from(body))
                    .send(),
            )
            .map_err(|e| anyhow::anyhow!("put object {}/{}: {}", bucket, object, e))?;
        Ok(())
    }

    /// Download one object, returning the number of bytes received.
    pub fn get_object(&self, bucket: &str, object: &str) -> Result<u64> {
        let out = self
            .runtime
            .block_on(self.client.get_object().bucket(bucket).key(object).send())
            .map_err(|e| anyhow::anyhow!("get object {}/{}: {}", bucket, object, e))?;
        let bytes = self
            .runtime
            .block_on(out.body.collect())
            .map_err(|e| anyhow::anyhow!("read object body {}/{}: {}", bucket, object, e))?;
        Ok(bytes.into_bytes().len() as u64)
    }

    pub fn stat_object(&self, bucket: &str, object: &str) -> Result<()> {
        self.runtime
            .block_on(self.client.head_object().bucket(bucket).key(object).send())
            .map_err(|e| anyhow::anyhow!("stat object {}/{}: {}", bucket, object, e))?;
        Ok(())
    }

    pub fn delete_object(&self, bucket: &str, object: &str) -> Result<()> {
        self.runtime
            .block_on(self.client.delete_object().bucket(bucket).key(object).send())
            .map_err(|e| anyhow::anyhow!("delete object {}/{}: {}", bucket, object, e))?;
        Ok(())
    }

    pub fn upload_part(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_number: i32,
        body: Vec<u8>,
    ) -> Result<UploadPart> {
        let out = self
            .runtime
            .block_on(
                self.client
                    .upload_part()
                    .bucket(bucket)
                    .key(object)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(body))
                    .send(),
            )
            .map_err(|e| anyhow::anyhow!("upload part {} of {}/{}: {}", part_number, bucket, object, e))?;
        Ok(UploadPart {
            part_number,
            etag: out.e_tag().unwrap_or_default().to_string(),
        })
    }

    /// Complete a shared upload. Parts are sorted ascending here because S3
    /// requires ascending part numbers and the registry returns them in
    /// registration order.
    pub fn complete_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        mut parts: Vec<UploadPart>,
    ) -> Result<()> {
        parts.sort_by_key(|p| p.part_number);
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .into_iter()
                    .map(|p| {
                        CompletedPart::builder()
                            .part_number(p.part_number)
                            .e_tag(p.etag)
                            .build()
                    })
                    .collect(),
            ))
            .build();
        self.runtime
            .block_on(
                self.client
                    .complete_multipart_upload()
                    .bucket(bucket)
                    .key(object)
                    .upload_id(upload_id)
                    .multipart_upload(completed)
                    .send(),
            )
            .map_err(|e| anyhow::anyhow!("complete multipart {}/{}: {}", bucket, object, e))?;
        Ok(())
    }

    pub fn abort_multipart_upload(&self, bucket: &str, object: &str, upload_id: &str) -> Result<()> {
        self.runtime
            .block_on(
                self.client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(object)
                    .upload_id(upload_id)
                    .send(),
            )
            .map_err(|e| anyhow::anyhow!("abort multipart {}/{}: {}", bucket, object, e))?;
        Ok(())
    }

    /// Drain the registry after an interruption and abort every leftover
    /// upload server-side. Abort failures are logged and do not stop the
    /// drain.
    pub fn abort_unfinished_uploads(&self, registry: &UploadRegistry) {
        while let Some((bucket, object, upload_id)) = registry.take_next_unfinished() {
            if let Err(err) = self.abort_multipart_upload(&bucket, &object, &upload_id) {
                tracing::warn!("{:#}", err);
            }
        }
    }

    pub fn list_objects(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut req = self.client.list_objects_v2().bucket(bucket);
            if let Some(p) = prefix {
                req = req.prefix(p);
            }
            if let Some(token) = &continuation {
                req = req.continuation_token(token);
            }
            let out = self
                .runtime
                .block_on(req.send())
                .map_err(|e| anyhow::anyhow!("list objects in {}: {}", bucket, e))?;
            for obj in out.contents() {
                if let Some(key) = obj.key() {
                    keys.push(key.to_string());
                }
            }
            match out.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(keys)
    }

    /// Multi-object delete in batches of up to 1000 keys.
    pub fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<()> {
        for chunk in keys.chunks(MULTI_DELETE_BATCH) {
            let objects = chunk
                .iter()
                .map(|k| ObjectIdentifier::builder().key(k).build())
                .collect::<Result<Vec<_>, _>>()
                .context("build delete object identifiers")?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .build()
                .context("build multi-delete request")?;
            self.runtime
                .block_on(
                    self.client
                        .delete_objects()
                        .bucket(bucket)
                        .delete(delete)
                        .send(),
                )
                .map_err(|e| anyhow::anyhow!("multi-delete in {}: {}", bucket, e))?;
        }
        Ok(())
    }

    pub fn put_bucket_acl(&self, bucket: &str) -> Result<()> {
        self.runtime
            .block_on(
                self.client
                    .put_bucket_acl()
                    .bucket(bucket)
                    .acl(BucketCannedAcl::Private)
                    .send(),
            )
            .map_err(|e| anyhow::anyhow!("put bucket acl {}: {}", bucket, e))?;
        Ok(())
    }

    pub fn get_bucket_acl(&self, bucket: &str) -> Result<()> {
        self.runtime
            .block_on(self.client.get_bucket_acl().bucket(bucket).send())
            .map_err(|e| anyhow::anyhow!("get bucket acl {}: {}", bucket, e))?;
        Ok(())
    }

    pub fn put_object_acl(&self, bucket: &str, object: &str) -> Result<()> {
        self.runtime
            .block_on(
                self.client
                    .put_object_acl()
                    .bucket(bucket)
                    .key(object)
                    .acl(ObjectCannedAcl::Private)
                    .send(),
            )
            .map_err(|e| anyhow::anyhow!("put object acl {}/{}: {}", bucket, object, e))?;
        Ok(())
    }

    pub fn get_object_acl(&self, bucket: &str, object: &str) -> Result<()> {
        self.runtime
            .block_on(self.client.get_object_acl().bucket(bucket).key(object).send())
            .map_err(|e| anyhow::anyhow!("get object acl {}/{}: {}", bucket, object, e))?;
        Ok(())
    }
}

impl MultipartBackend for S3Context {
    fn create_multipart_upload(&self, bucket: &str, object: &str) -> Result<String> {
        let out = self
            .runtime
            .block_on(
                self.client
                    .create_multipart_upload()
                    .bucket(bucket)
                    .key(object)
                    .send(),
            )
            .map_err(|e| {
                anyhow::anyhow!("multipart upload creation failed, bucket {}: {}", bucket, e)
            })?;
        out.upload_id()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("no upload id for {}/{}", bucket, object))
    }
}

impl std::fmt::Debug for S3Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Context").finish_non_exhaustive()
    }
}
