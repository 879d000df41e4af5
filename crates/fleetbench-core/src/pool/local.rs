//! Local phase workers: rank-sliced filesystem and S3 object I/O.
//!
//! Ranks split the work by striding: worker `r` of `n` handles items where
//! `i % n == r`. File and object contents are synthetic zero-filled blocks;
//! every block boundary is a yield point for interrupt/time-limit checks.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::BenchConfig;
use crate::phase::BenchPhase;
use crate::s3::context::{self, S3Context};
use crate::s3::registry::UploadRegistry;

use super::worker::{PhaseWorker, WorkerControl};

pub struct LocalWorker {
    rank: usize,
    num_workers: usize,
    cfg: Arc<BenchConfig>,
    registry: Arc<UploadRegistry>,
    s3: Option<Arc<S3Context>>,
}

impl LocalWorker {
    pub fn new(
        rank: usize,
        num_workers: usize,
        cfg: Arc<BenchConfig>,
        registry: Arc<UploadRegistry>,
    ) -> LocalWorker {
        LocalWorker {
            rank,
            num_workers,
            cfg,
            registry,
            s3: None,
        }
    }

    /// Indexes of this worker's slice of `count` items.
    fn slice(&self, count: u64) -> impl Iterator<Item = u64> + '_ {
        let rank = self.rank as u64;
        let stride = self.num_workers as u64;
        (0..count).filter(move |i| i % stride == rank)
    }

    fn dir_path(&self, index: u64) -> PathBuf {
        let paths = &self.cfg.bench_paths;
        paths[(index as usize) % paths.len()].join(format!("d{:04}", index))
    }

    fn file_path(&self, index: u64) -> PathBuf {
        let paths = &self.cfg.bench_paths;
        paths[(index as usize) % paths.len()].join(format!("f{:04}", index))
    }

    fn object_name(index: u64) -> String {
        format!("f{:04}", index)
    }

    fn bucket_for(&self, index: u64) -> &str {
        let buckets = &self.cfg.buckets;
        &buckets[(index as usize) % buckets.len()]
    }

    fn uses_s3_files(&self) -> bool {
        !self.cfg.buckets.is_empty()
    }

    fn s3(&self) -> Result<&Arc<S3Context>> {
        self.s3
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("S3 phase requested without S3 configuration"))
    }

    fn create_dirs(&self, ctl: &WorkerControl) -> Result<()> {
        for i in self.slice(self.cfg.num_dirs) {
            ctl.check_abort()?;
            let path = self.dir_path(i);
            fs::create_dir_all(&path)
                .with_context(|| format!("create dir {}", path.display()))?;
            ctl.stats.inc_ops(1);
        }
        Ok(())
    }

    fn delete_dirs(&self, ctl: &WorkerControl) -> Result<()> {
        for i in self.slice(self.cfg.num_dirs) {
            ctl.check_abort()?;
            let path = self.dir_path(i);
            fs::remove_dir(&path)
                .with_context(|| format!("remove dir {}", path.display()))?;
            ctl.stats.inc_ops(1);
        }
        Ok(())
    }

    fn create_files(&self, ctl: &WorkerControl) -> Result<()> {
        let block_size = self.cfg.block_size.max(1);
        let block = vec![0u8; block_size as usize];
        for i in self.slice(self.cfg.num_files) {
            let path = self.file_path(i);
            let mut file = File::create(&path)
                .with_context(|| format!("create file {}", path.display()))?;
            let mut remaining = self.cfg.file_size;
            while remaining > 0 {
                ctl.check_abort()?;
                let n = remaining.min(block_size);
                file.write_all(&block[..n as usize])
                    .with_context(|| format!("write {}", path.display()))?;
                ctl.stats.add_bytes(n);
                remaining -= n;
            }
            ctl.stats.inc_ops(1);
        }
        Ok(())
    }

    fn read_files(&self, ctl: &WorkerControl) -> Result<()> {
        let block_size = self.cfg.block_size.max(1) as usize;
        let mut block = vec![0u8; block_size];
        for i in self.slice(self.cfg.num_files) {
            let path = self.file_path(i);
            let mut file =
                File::open(&path).with_context(|| format!("open file {}", path.display()))?;
            loop {
                ctl.check_abort()?;
                let n = file
                    .read(&mut block)
                    .with_context(|| format!("read {}", path.display()))?;
                if n == 0 {
                    break;
                }
                ctl.stats.add_bytes(n as u64);
            }
            ctl.stats.inc_ops(1);
        }
        Ok(())
    }

    fn stat_files(&self, ctl: &WorkerControl) -> Result<()> {
        for i in self.slice(self.cfg.num_files) {
            ctl.check_abort()?;
            let path = self.file_path(i);
            fs::metadata(&path).with_context(|| format!("stat {}", path.display()))?;
            ctl.stats.inc_ops(1);
        }
        Ok(())
    }

    fn delete_files(&self, ctl: &WorkerControl) -> Result<()> {
        for i in self.slice(self.cfg.num_files) {
            ctl.check_abort()?;
            let path = self.file_path(i);
            fs::remove_file(&path)
                .with_context(|| format!("remove file {}", path.display()))?;
            ctl.stats.inc_ops(1);
        }
        Ok(())
    }

    fn drop_caches(&self, ctl: &WorkerControl) -> Result<()> {
        // only one worker needs to do this per host
        if self.rank != 0 {
            return Ok(());
        }
        unsafe { libc::sync() };
        fs::write("/proc/sys/vm/drop_caches", "3")
            .context("write /proc/sys/vm/drop_caches (requires root)")?;
        ctl.stats.inc_ops(1);
        Ok(())
    }

    /// S3 write phase. Objects at or below block size are a single put; for
    /// larger objects all workers cooperate on the same object, each
    /// uploading its slice of the parts through the shared registry.
    fn s3_create_objects(&self, ctl: &WorkerControl) -> Result<()> {
        let s3 = self.s3()?;
        let size = self.cfg.file_size;
        let part_size = self.cfg.block_size.max(1);

        if size <= part_size {
            for i in self.slice(self.cfg.num_files) {
                ctl.check_abort()?;
                let (bucket, object) = (self.bucket_for(i), Self::object_name(i));
                s3.put_object(bucket, &object, vec![0u8; size as usize])?;
                ctl.stats.add_bytes(size);
                ctl.stats.inc_ops(1);
            }
            return Ok(());
        }

        let num_parts = size.div_ceil(part_size);
        for i in 0..self.cfg.num_files {
            let (bucket, object) = (self.bucket_for(i), Self::object_name(i));
            let my_parts: Vec<u64> = (0..num_parts)
                .filter(|p| p % self.num_workers as u64 == self.rank as u64)
                .collect();
            if my_parts.is_empty() {
                continue;
            }

            let upload_id =
                self.registry
                    .get_or_create_upload_id(bucket, &object, s3.as_ref())?;

            for part_index in my_parts {
                ctl.check_abort()?;
                let offset = part_index * part_size;
                let len = part_size.min(size - offset);
                let part = s3.upload_part(
                    bucket,
                    &object,
                    &upload_id,
                    (part_index + 1) as i32,
                    vec![0u8; len as usize],
                )?;
                ctl.stats.add_bytes(len);

                if let Some(parts) =
                    self.registry
                        .register_completed_part(bucket, &object, len, size, part)
                {
                    // last byte arrived; this worker owns completion
                    s3.complete_multipart_upload(bucket, &object, &upload_id, parts)?;
                    ctl.stats.inc_ops(1);
                }
            }
        }
        Ok(())
    }

    fn s3_read_objects(&self, ctl: &WorkerControl) -> Result<()> {
        let s3 = self.s3()?;
        for i in self.slice(self.cfg.num_files) {
            ctl.check_abort()?;
            let bytes = s3.get_object(self.bucket_for(i), &Self::object_name(i))?;
            ctl.stats.add_bytes(bytes);
            ctl.stats.inc_ops(1);
        }
        Ok(())
    }

    fn s3_stat_objects(&self, ctl: &WorkerControl) -> Result<()> {
        let s3 = self.s3()?;
        for i in self.slice(self.cfg.num_files) {
            ctl.check_abort()?;
            s3.stat_object(self.bucket_for(i), &Self::object_name(i))?;
            ctl.stats.inc_ops(1);
        }
        Ok(())
    }

    fn s3_delete_objects(&self, ctl: &WorkerControl) -> Result<()> {
        let s3 = self.s3()?;
        for i in self.slice(self.cfg.num_files) {
            ctl.check_abort()?;
            s3.delete_object(self.bucket_for(i), &Self::object_name(i))?;
            ctl.stats.inc_ops(1);
        }
        Ok(())
    }

    /// Whole-bucket listing from one worker (rank 0).
    fn s3_list_objects(&self, ctl: &WorkerControl) -> Result<()> {
        if self.rank != 0 {
            return Ok(());
        }
        let s3 = self.s3()?;
        for bucket in &self.cfg.buckets {
            ctl.check_abort()?;
            let keys = s3.list_objects(bucket, None)?;
            ctl.stats.inc_ops(keys.len() as u64);
        }
        Ok(())
    }

    /// Parallel listing: buckets are sliced across workers.
    fn s3_list_objects_parallel(&self, ctl: &WorkerControl) -> Result<()> {
        let s3 = self.s3()?;
        for i in self.slice(self.cfg.buckets.len() as u64) {
            ctl.check_abort()?;
            let keys = s3.list_objects(&self.cfg.buckets[i as usize], None)?;
            ctl.stats.inc_ops(keys.len() as u64);
        }
        Ok(())
    }

    fn s3_multi_delete(&self, ctl: &WorkerControl) -> Result<()> {
        let s3 = self.s3()?;
        for i in self.slice(self.cfg.buckets.len() as u64) {
            ctl.check_abort()?;
            let bucket = &self.cfg.buckets[i as usize];
            let keys = s3.list_objects(bucket, None)?;
            s3.delete_objects(bucket, &keys)?;
            ctl.stats.inc_ops(keys.len() as u64);
        }
        Ok(())
    }

    fn s3_bucket_acl(&self, ctl: &WorkerControl, put: bool) -> Result<()> {
        let s3 = self.s3()?;
        for i in self.slice(self.cfg.buckets.len() as u64) {
            ctl.check_abort()?;
            let bucket = &self.cfg.buckets[i as usize];
            if put {
                s3.put_bucket_acl(bucket)?;
            } else {
                s3.get_bucket_acl(bucket)?;
            }
            ctl.stats.inc_ops(1);
        }
        Ok(())
    }

    fn s3_object_acl(&self, ctl: &WorkerControl, put: bool) -> Result<()> {
        let s3 = self.s3()?;
        for i in self.slice(self.cfg.num_files) {
            ctl.check_abort()?;
            let (bucket, object) = (self.bucket_for(i), Self::object_name(i));
            if put {
                s3.put_object_acl(bucket, &object)?;
            } else {
                s3.get_object_acl(bucket, &object)?;
            }
            ctl.stats.inc_ops(1);
        }
        Ok(())
    }
}

impl PhaseWorker for LocalWorker {
    fn prepare(&mut self, _ctl: &WorkerControl) -> Result<()> {
        for path in &self.cfg.bench_paths {
            if !path.exists() {
                anyhow::bail!("bench path does not exist: {}", path.display());
            }
        }
        if self.cfg.phases.needs_s3() || self.uses_s3_files() {
            if self.cfg.buckets.is_empty() {
                anyhow::bail!("S3 phases selected but no buckets configured");
            }
            self.s3 = Some(context::get_or_init(&self.cfg)?);
        }
        Ok(())
    }

    fn run_phase(
        &mut self,
        phase: BenchPhase,
        _bench_id: Option<&str>,
        ctl: &WorkerControl,
    ) -> Result<()> {
        use BenchPhase::*;
        let result = match phase {
            Idle | Terminate => Ok(()),
            Sync => {
                unsafe { libc::sync() };
                ctl.stats.inc_ops(1);
                Ok(())
            }
            DropCaches => self.drop_caches(ctl),
            CreateDirs => self.create_dirs(ctl),
            DeleteDirs => self.delete_dirs(ctl),
            CreateFiles if self.uses_s3_files() => self.s3_create_objects(ctl),
            CreateFiles => self.create_files(ctl),
            ReadFiles if self.uses_s3_files() => self.s3_read_objects(ctl),
            ReadFiles => self.read_files(ctl),
            StatFiles if self.uses_s3_files() => self.s3_stat_objects(ctl),
            StatFiles => self.stat_files(ctl),
            DeleteFiles if self.uses_s3_files() => self.s3_delete_objects(ctl),
            DeleteFiles => self.delete_files(ctl),
            ListObjects => self.s3_list_objects(ctl),
            ListObjParallel => self.s3_list_objects_parallel(ctl),
            MultiDelObj => self.s3_multi_delete(ctl),
            PutBucketAcl => self.s3_bucket_acl(ctl, true),
            GetBucketAcl => self.s3_bucket_acl(ctl, false),
            PutObjAcl => self.s3_object_acl(ctl, true),
            GetObjAcl => self.s3_object_acl(ctl, false),
        };

        // a failed or aborted shared upload leaves registry entries behind;
        // drain and abort them so nothing leaks server-side
        if result.is_err() && phase == CreateFiles && self.uses_s3_files() {
            if let Some(s3) = &self.s3 {
                s3.abort_unfinished_uploads(&self.registry);
            }
        }

        result
    }
}
