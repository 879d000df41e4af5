//! Benchmark phases, their wire codes, and the canonical run order.

use serde::{Deserialize, Serialize};

/// One indivisible benchmark operation, executed by all workers in lock-step.
/// The numeric value is the wire code transmitted to services via
/// `/startphase?benchphasecode=N` and must stay stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BenchPhase {
    Idle = 0,
    Sync = 1,
    DropCaches = 2,
    CreateDirs = 3,
    CreateFiles = 4,
    StatFiles = 5,
    ReadFiles = 6,
    DeleteFiles = 7,
    DeleteDirs = 8,
    ListObjects = 9,
    ListObjParallel = 10,
    MultiDelObj = 11,
    PutBucketAcl = 12,
    PutObjAcl = 13,
    GetObjAcl = 14,
    GetBucketAcl = 15,
    Terminate = 16,
}

impl BenchPhase {
    pub fn wire_code(self) -> u8 {
        self as u8
    }

    pub fn from_wire_code(code: u8) -> Option<BenchPhase> {
        use BenchPhase::*;
        let phase = match code {
            0 => Idle,
            1 => Sync,
            2 => DropCaches,
            3 => CreateDirs,
            4 => CreateFiles,
            5 => StatFiles,
            6 => ReadFiles,
            7 => DeleteFiles,
            8 => DeleteDirs,
            9 => ListObjects,
            10 => ListObjParallel,
            11 => MultiDelObj,
            12 => PutBucketAcl,
            13 => PutObjAcl,
            14 => GetObjAcl,
            15 => GetBucketAcl,
            16 => Terminate,
            _ => return None,
        };
        Some(phase)
    }

    /// Short name used in the results table and in stats trees.
    pub fn name(self) -> &'static str {
        use BenchPhase::*;
        match self {
            Idle => "idle",
            Sync => "sync",
            DropCaches => "dropcaches",
            CreateDirs => "mkdirs",
            CreateFiles => "write",
            StatFiles => "stat",
            ReadFiles => "read",
            DeleteFiles => "rmfiles",
            DeleteDirs => "rmdirs",
            ListObjects => "listobj",
            ListObjParallel => "listobj-par",
            MultiDelObj => "multidel",
            PutBucketAcl => "put-bacl",
            PutObjAcl => "put-oacl",
            GetObjAcl => "get-oacl",
            GetBucketAcl => "get-bacl",
            Terminate => "terminate",
        }
    }
}

/// The order in which selected phases run within one iteration. Multiple
/// phases can be selected for a single run; this ordering guarantees that
/// creates precede reads and reads precede deletes.
pub const CANONICAL_PHASE_ORDER: [BenchPhase; 13] = [
    BenchPhase::CreateDirs,
    BenchPhase::CreateFiles,
    BenchPhase::StatFiles,
    BenchPhase::PutBucketAcl,
    BenchPhase::PutObjAcl,
    BenchPhase::GetObjAcl,
    BenchPhase::GetBucketAcl,
    BenchPhase::ListObjects,
    BenchPhase::ListObjParallel,
    BenchPhase::ReadFiles,
    BenchPhase::MultiDelObj,
    BenchPhase::DeleteFiles,
    BenchPhase::DeleteDirs,
];

/// Which phases the user enabled for this run. Travels to services inside
/// the prepare payload, so services run the same selection as the master.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseSelection {
    #[serde(default)]
    pub sync: bool,
    #[serde(default)]
    pub drop_caches: bool,
    #[serde(default)]
    pub create_dirs: bool,
    #[serde(default)]
    pub create_files: bool,
    #[serde(default)]
    pub stat_files: bool,
    #[serde(default)]
    pub read_files: bool,
    #[serde(default)]
    pub delete_files: bool,
    #[serde(default)]
    pub delete_dirs: bool,
    #[serde(default)]
    pub list_objects: bool,
    #[serde(default)]
    pub list_obj_parallel: bool,
    #[serde(default)]
    pub multi_del_obj: bool,
    #[serde(default)]
    pub put_bucket_acl: bool,
    #[serde(default)]
    pub put_obj_acl: bool,
    #[serde(default)]
    pub get_obj_acl: bool,
    #[serde(default)]
    pub get_bucket_acl: bool,
}

impl PhaseSelection {
    pub fn is_enabled(&self, phase: BenchPhase) -> bool {
        use BenchPhase::*;
        match phase {
            Sync => self.sync,
            DropCaches => self.drop_caches,
            CreateDirs => self.create_dirs,
            CreateFiles => self.create_files,
            StatFiles => self.stat_files,
            ReadFiles => self.read_files,
            DeleteFiles => self.delete_files,
            DeleteDirs => self.delete_dirs,
            ListObjects => self.list_objects,
            ListObjParallel => self.list_obj_parallel,
            MultiDelObj => self.multi_del_obj,
            PutBucketAcl => self.put_bucket_acl,
            PutObjAcl => self.put_obj_acl,
            GetObjAcl => self.get_obj_acl,
            GetBucketAcl => self.get_bucket_acl,
            Idle | Terminate => false,
        }
    }

    /// Enabled phases in canonical run order (sync/drop-caches are handled
    /// separately by the coordinator and never appear here).
    pub fn enabled_phases(&self) -> Vec<BenchPhase> {
        CANONICAL_PHASE_ORDER
            .iter()
            .copied()
            .filter(|p| self.is_enabled(*p))
            .collect()
    }

    /// True if any enabled phase talks to S3.
    pub fn needs_s3(&self) -> bool {
        self.list_objects
            || self.list_obj_parallel
            || self.multi_del_obj
            || self.put_bucket_acl
            || self.put_obj_acl
            || self.get_obj_acl
            || self.get_bucket_acl
    }
}
