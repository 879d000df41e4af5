//! Shared multipart upload registry.
//!
//! Several workers may cooperate on one large object: exactly one obtains
//! the upload ID, each registers its completed parts, exactly one observes
//! the final byte and completes the upload. On interruption the registry
//! hands out the leftovers so the caller can abort them server-side.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::Result;

use super::key::UploadKey;

/// One completed part, recorded in upload order. The caller of the final
/// completion must sort by part number ascending before sending (S3 rejects
/// unordered part lists).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPart {
    pub part_number: i32,
    pub etag: String,
}

#[derive(Debug)]
struct UploadRecord {
    upload_id: String,
    bytes_done: u64,
    parts: Vec<UploadPart>,
}

/// Backend seam for creating multipart uploads, so the registry can be
/// exercised without a live S3 endpoint.
pub trait MultipartBackend {
    fn create_multipart_upload(&self, bucket: &str, object: &str) -> Result<String>;
}

/// Thread-safe map of in-progress shared uploads. A record exists exactly
/// while its upload is in progress; it is removed on completion-ready or on
/// abort-drain.
#[derive(Debug, Default)]
pub struct UploadRegistry {
    map: Mutex<BTreeMap<UploadKey, UploadRecord>>,
}

impl UploadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the existing upload ID for this object, or create one through
    /// the backend. At most one `create_multipart_upload` is ever issued per
    /// key per run.
    pub fn get_or_create_upload_id(
        &self,
        bucket: &str,
        object: &str,
        backend: &dyn MultipartBackend,
    ) -> Result<String> {
        let mut map = self.map.lock().unwrap();

        let key = UploadKey::new(bucket, object);
        if let Some(record) = map.get(&key) {
            return Ok(record.upload_id.clone());
        }

        let upload_id = backend.create_multipart_upload(bucket, object)?;
        map.insert(
            key,
            UploadRecord {
                upload_id: upload_id.clone(),
                bytes_done: 0,
                parts: Vec::new(),
            },
        );

        Ok(upload_id)
    }

    /// Record a completed part. When `bytes_just_uploaded` brings the total
    /// to `object_total_size`, the record is removed and the full parts list
    /// is returned; the caller then owns completion. Returns `None` while
    /// the upload is unfinished, and also for parts arriving after the
    /// upload was completed or aborted (those are dropped silently, since
    /// completion or abort is already in flight).
    pub fn register_completed_part(
        &self,
        bucket: &str,
        object: &str,
        bytes_just_uploaded: u64,
        object_total_size: u64,
        part: UploadPart,
    ) -> Option<Vec<UploadPart>> {
        let mut map = self.map.lock().unwrap();

        let key = UploadKey::new(bucket, object);
        let record = match map.get_mut(&key) {
            Some(record) => record,
            None => {
                tracing::debug!(bucket, object, "rejecting part add of aborted upload");
                return None;
            }
        };

        record.parts.push(part);
        record.bytes_done += bytes_just_uploaded;

        if record.bytes_done < object_total_size {
            return None;
        }

        // ready for completion: remove the record, hand parts to the caller
        let record = map.remove(&key).expect("record present under lock");
        Some(record.parts)
    }

    /// Pop one arbitrary unfinished upload, or `None` when the registry is
    /// drained. Only used on error paths to abort leftovers; it may hand out
    /// uploads other workers are still adding parts to, which is fine there
    /// because nobody needs those uploads to complete anymore.
    pub fn take_next_unfinished(&self) -> Option<(String, String, String)> {
        let mut map = self.map.lock().unwrap();

        let key = map.keys().next()?.clone();
        let record = map.remove(&key).expect("record present under lock");
        Some((key.bucket, key.object, record.upload_id))
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend that counts creations and hands out deterministic IDs.
    #[derive(Default)]
    struct CountingBackend {
        creates: AtomicUsize,
    }

    impl MultipartBackend for CountingBackend {
        fn create_multipart_upload(&self, _bucket: &str, object: &str) -> Result<String> {
            let n = self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(format!("upload-{}-{}", object, n))
        }
    }

    struct FailingBackend;

    impl MultipartBackend for FailingBackend {
        fn create_multipart_upload(&self, bucket: &str, _object: &str) -> Result<String> {
            anyhow::bail!("multipart upload creation failed, bucket: {}", bucket)
        }
    }

    #[test]
    fn second_caller_reuses_upload_id() {
        let registry = UploadRegistry::new();
        let backend = CountingBackend::default();

        let a = registry
            .get_or_create_upload_id("bkt", "obj", &backend)
            .unwrap();
        let b = registry
            .get_or_create_upload_id("bkt", "obj", &backend)
            .unwrap();

        assert_eq!(a, b);
        assert_eq!(backend.creates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn create_failure_propagates_and_inserts_nothing() {
        let registry = UploadRegistry::new();
        assert!(registry
            .get_or_create_upload_id("bkt", "obj", &FailingBackend)
            .is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn two_workers_cooperate_on_one_object() {
        // Two workers, 10 MiB object, 5 MiB parts: the second register call
        // returns both parts.
        let registry = UploadRegistry::new();
        let backend = CountingBackend::default();
        let total = 10 * 1024 * 1024;
        let part_size = 5 * 1024 * 1024;

        let id_a = registry
            .get_or_create_upload_id("bkt", "big", &backend)
            .unwrap();
        let id_b = registry
            .get_or_create_upload_id("bkt", "big", &backend)
            .unwrap();
        assert_eq!(id_a, id_b);

        let first = registry.register_completed_part(
            "bkt",
            "big",
            part_size,
            total,
            UploadPart {
                part_number: 2,
                etag: "etag-2".into(),
            },
        );
        assert!(first.is_none());

        let mut parts = registry
            .register_completed_part(
                "bkt",
                "big",
                part_size,
                total,
                UploadPart {
                    part_number: 1,
                    etag: "etag-1".into(),
                },
            )
            .expect("final part returns the full list");

        assert_eq!(parts.len(), 2);
        parts.sort_by_key(|p| p.part_number);
        assert_eq!(parts[0].part_number, 1);
        assert_eq!(parts[1].part_number, 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn late_part_after_completion_is_dropped() {
        let registry = UploadRegistry::new();
        let backend = CountingBackend::default();

        registry
            .get_or_create_upload_id("bkt", "obj", &backend)
            .unwrap();
        let done = registry.register_completed_part(
            "bkt",
            "obj",
            100,
            100,
            UploadPart {
                part_number: 1,
                etag: "e1".into(),
            },
        );
        assert!(done.is_some());

        let late = registry.register_completed_part(
            "bkt",
            "obj",
            100,
            200,
            UploadPart {
                part_number: 2,
                etag: "e2".into(),
            },
        );
        assert!(late.is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn abort_drain_reaches_empty_in_finitely_many_calls() {
        let registry = UploadRegistry::new();
        let backend = CountingBackend::default();

        for i in 0..5 {
            registry
                .get_or_create_upload_id("bkt", &format!("obj{}", i), &backend)
                .unwrap();
        }

        let mut drained = Vec::new();
        while let Some((bucket, object, upload_id)) = registry.take_next_unfinished() {
            assert_eq!(bucket, "bkt");
            assert!(!upload_id.is_empty());
            drained.push(object);
        }

        assert_eq!(drained.len(), 5);
        assert!(registry.is_empty());
        assert!(registry.take_next_unfinished().is_none());
    }
}
