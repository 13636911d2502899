/*
 * Copyright 2024 Oxide Computer Company
 */

/*!
 * Target discovery: enumeration of disks, fdisk partitions, VTOC slices
 * and previously installed OS instances, into a registry of attribute
 * records.  Enumeration is best-effort per object; a disk that cannot be
 * characterised is logged and left out without disturbing the rest.
 */

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use slog::{info, warn};
use uuid::Uuid;

use crate::attr::AttrSet;
use crate::errors::TdError;
use crate::run;
use crate::{devmap, disk, svm, zfs, Core};

const DISKINFO: &str = "/usr/bin/diskinfo";
const PRTVTOC: &str = "/usr/sbin/prtvtoc";
const FDISK: &str = "/usr/sbin/fdisk";
const IOSTAT: &str = "/usr/bin/iostat";
const EEPROM: &str = "/usr/sbin/eeprom";
const BEADM: &str = "/sbin/beadm";
const ZPOOL: &str = "/sbin/zpool";
const MOUNT: &str = "/sbin/mount";
const UMOUNT: &str = "/sbin/umount";

/*
 * Reasons an OS instance cannot be upgraded in place.  The bits are
 * orthogonal and may be combined.
 */
pub const UF_ROOT_UNMOUNTABLE: u32 = 1 << 0;
pub const UF_VAR_UNMOUNTABLE: u32 = 1 << 1;
pub const UF_NO_INST_RELEASE: u32 = 1 << 2;
pub const UF_NO_CLUSTER: u32 = 1 << 3;
pub const UF_NO_CLUSTERTOC: u32 = 1 << 4;
pub const UF_NO_BOOTENVRC: u32 = 1 << 5;
pub const UF_ZONES_NOT_UPGRADEABLE: u32 = 1 << 6;
pub const UF_NO_USR_PACKAGES: u32 = 1 << 7;
pub const UF_NO_VERSION: u32 = 1 << 8;
pub const UF_SVM_ROOT_MIRROR: u32 = 1 << 9;
pub const UF_WRONG_METACLUSTER: u32 = 1 << 10;
pub const UF_OS_TOO_OLD: u32 = 1 << 11;

/*
 * Metaclusters an upgrade can start from:
 */
const METACLUSTERS: &[&str] = &[
    "SUNWCreq", "SUNWCuser", "SUNWCprog", "SUNWCall", "SUNWCXall",
    "SUNWCrnet",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Disk,
    Partition,
    Slice,
    Os,
}

impl ObjectKind {
    pub fn label(&self) -> &'static str {
        match self {
            ObjectKind::Disk => "disk",
            ObjectKind::Partition => "partition",
            ObjectKind::Slice => "slice",
            ObjectKind::Os => "OS instance",
        }
    }
}

/**
 * The discovery registry and its per-kind cursors.  Records live until
 * release() is called; handed-out references borrow from the registry.
 */
pub struct Discovery {
    core: Core,
    registry: HashMap<ObjectKind, Vec<AttrSet>>,
    cursors: HashMap<ObjectKind, Option<usize>>,
}

impl Discovery {
    pub fn new(core: &Core) -> Discovery {
        Discovery {
            core: core.clone(),
            registry: HashMap::new(),
            cursors: HashMap::new(),
        }
    }

    /**
     * Enumerate all objects of a kind, returning how many were found.
     * Enumeration is idempotent per kind until release() is called.
     */
    pub fn discover(&mut self, kind: ObjectKind) -> Result<usize, TdError> {
        if let Some(objs) = self.registry.get(&kind) {
            return Ok(objs.len());
        }

        let objs = match kind {
            ObjectKind::Disk => self.discover_disks()?,
            ObjectKind::Partition => self.discover_partitions()?,
            ObjectKind::Slice => self.discover_slices()?,
            ObjectKind::Os => self.discover_os()?,
        };

        info!(self.core.log(), "discovered {} {} objects", objs.len(),
            kind.label());

        let n = objs.len();
        self.registry.insert(kind, objs);
        self.cursors.insert(kind, None);
        Ok(n)
    }

    pub fn objects(&self, kind: ObjectKind) -> &[AttrSet] {
        self.registry.get(&kind).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /**
     * Advance the per-kind cursor; returns false at the end of the
     * enumeration.
     */
    pub fn get_next(&mut self, kind: ObjectKind) -> bool {
        let len = self.objects(kind).len();
        let cur = self.cursors.entry(kind).or_insert(None);
        let next = match *cur {
            None => 0,
            Some(i) => i + 1,
        };
        if next < len {
            *cur = Some(next);
            true
        } else {
            false
        }
    }

    /**
     * The record at the current cursor position.
     */
    pub fn attributes(&self, kind: ObjectKind) -> Option<&AttrSet> {
        let i = (*self.cursors.get(&kind)?)?;
        self.registry.get(&kind)?.get(i)
    }

    fn disk_known(&mut self, disk_name: &str) -> Result<bool, TdError> {
        self.discover(ObjectKind::Disk)?;
        Ok(self.objects(ObjectKind::Disk).iter().any(|d| {
            d.get_text("disk.name").map(|n| n == disk_name).unwrap_or(false)
        }))
    }

    /**
     * All partition records for one disk.
     */
    pub fn partitions_of_disk(&mut self, disk_name: &str)
        -> Result<Vec<&AttrSet>, TdError>
    {
        if !self.disk_known(disk_name)? {
            return Err(TdError::NoDevice);
        }
        self.discover(ObjectKind::Partition)?;

        Ok(self
            .objects(ObjectKind::Partition)
            .iter()
            .filter(|p| {
                p.get_text("part.disk-name")
                    .map(|n| n == disk_name)
                    .unwrap_or(false)
            })
            .collect())
    }

    /**
     * All slice records for one disk.
     */
    pub fn slices_of_disk(&mut self, disk_name: &str)
        -> Result<Vec<&AttrSet>, TdError>
    {
        if !self.disk_known(disk_name)? {
            return Err(TdError::NoDevice);
        }
        self.discover(ObjectKind::Slice)?;

        Ok(self
            .objects(ObjectKind::Slice)
            .iter()
            .filter(|s| {
                s.get_text("slice.disk-name")
                    .map(|n| n == disk_name)
                    .unwrap_or(false)
            })
            .collect())
    }

    /**
     * Free the registry.  A subsequent discover() re-enumerates from
     * scratch.
     */
    pub fn release(&mut self) {
        self.registry.clear();
        self.cursors.clear();
    }

    fn discover_disks(&mut self) -> Result<Vec<AttrSet>, TdError> {
        let core = &self.core;
        let log = core.log();

        let listing = match run::capture_string(core, &[DISKINFO]) {
            Ok(s) => s,
            Err(e) => {
                warn!(log, "disk inventory failed: {}", e);
                return Err(TdError::DiscoveryFailed);
            }
        };
        let reports = match disk::parse_diskinfo(&listing) {
            Ok(r) => r,
            Err(e) => {
                warn!(log, "disk inventory unreadable: {}", e);
                return Err(TdError::DiscoveryFailed);
            }
        };

        let bootpath = boot_device_path(core);

        let mut out = Vec::new();
        for r in reports.iter() {
            match disk_record(core, r, bootpath.as_deref()) {
                Ok(a) => out.push(a),
                Err(e) => {
                    warn!(log, "skipping disk {}: {}", r.name, e);
                }
            }
        }

        Ok(out)
    }

    fn discover_partitions(&mut self) -> Result<Vec<AttrSet>, TdError> {
        self.discover(ObjectKind::Disk)?;
        let core = self.core.clone();
        let log = core.log();

        let disks: Vec<String> = self
            .objects(ObjectKind::Disk)
            .iter()
            .filter_map(|d| d.get_text("disk.name").ok().map(String::from))
            .collect();

        let mut out = Vec::new();
        for d in disks.iter() {
            let table = read_fdisk_table(&core, d);

            let rows = match table {
                Some(rows) => rows,
                None => {
                    /*
                     * No fdisk label; the whole disk stands in as a
                     * single implicit partition.
                     */
                    let sectors = self.disk_sectors(d).unwrap_or(0);
                    out.push(implicit_partition(d, sectors));
                    continue;
                }
            };

            if let Some((i, j)) = disk::partitions_overlap(&rows) {
                warn!(log, "disk {}: partitions {} and {} overlap", d,
                    i + 1, j + 1);
            }

            for (i, row) in rows.iter().enumerate() {
                if !row.is_used() {
                    continue;
                }
                out.push(partition_record(d, i + 1, row));
            }
        }

        Ok(out)
    }

    fn disk_sectors(&self, disk_name: &str) -> Option<u64> {
        self.objects(ObjectKind::Disk)
            .iter()
            .find(|d| {
                d.get_text("disk.name").map(|n| n == disk_name)
                    .unwrap_or(false)
            })
            .and_then(|d| d.get_uint64("disk.size-sectors").ok())
    }

    fn discover_slices(&mut self) -> Result<Vec<AttrSet>, TdError> {
        self.discover(ObjectKind::Partition)?;
        let core = self.core.clone();
        let log = core.log();

        /*
         * Slice enumeration covers the installable partition of each
         * disk that has one.
         */
        let mut disks: Vec<(String, u64, u64)> = Vec::new();
        for p in self.objects(ObjectKind::Partition).iter() {
            let id = p.get_uint8("part.id").unwrap_or(0);
            if !disk::is_solaris_part(id) {
                continue;
            }
            let d = match p.get_text("part.disk-name") {
                Ok(d) => d.to_string(),
                Err(_) => continue,
            };
            let begin = p.get_uint64("part.begin-sector").unwrap_or(0);
            let count = p.get_uint64("part.sector-count").unwrap_or(0);
            disks.push((d, begin, count));
        }

        let mut out = Vec::new();
        for (d, _pbegin, pcount) in disks.iter() {
            let raw = disk::slice_raw(d, 2);
            let vtoc = match run::capture_string(&core, &[PRTVTOC, &raw]) {
                Ok(s) => match disk::parse_prtvtoc(&s) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(log, "skipping slices of {}: {}", d, e);
                        continue;
                    }
                },
                Err(e) => {
                    warn!(log, "skipping slices of {}: {}", d, e);
                    continue;
                }
            };

            for s in vtoc.slices.iter() {
                if !s.in_use() {
                    continue;
                }

                if *pcount != 0
                    && !disk::slice_within(s.first_sector, s.sector_count,
                        0, *pcount)
                {
                    warn!(log, "slice {}s{} extends past its partition",
                        d, s.index);
                }

                let name = format!("{}s{}", d, s.index);
                let mut a = slice_record(d, s);

                if probe_worthy(s.tag) {
                    if let Some(m) = self.svm_probe(&name) {
                        record_mirror(&mut a, &m);
                    }
                }

                out.push(a);
            }
        }

        Ok(out)
    }

    /**
     * Check one slice for an SVM state database by temp-mounting it
     * read-only.  Expensive, so only root-capable slices are probed.
     */
    fn svm_probe(&self, slice_name: &str) -> Option<svm::MirrorInfo> {
        let core = &self.core;
        let log = core.log();

        let (d, i) = disk::split_slice_name(slice_name)?;
        let blockdev = disk::slice_block(d, i);

        let mnt = temp_dir("td-svm");
        if std::fs::create_dir_all(&mnt).is_err() {
            return None;
        }

        let mntstr = mnt.to_string_lossy().to_string();
        let mounted = run::run(core,
            &[MOUNT, "-F", "ufs", "-o", "ro", &blockdev, &mntstr]).is_ok();

        let mut found = None;
        if mounted {
            if svm::has_state_db(&mnt) {
                info!(log, "slice {} carries an SVM state database",
                    slice_name);
                if svm::start(core).is_ok() {
                    if let Ok(config) = svm::read_config(core) {
                        found = svm::mirror_for_slice(&config, slice_name)
                            .map(|m| remap_mirror(core, &mnt, m));
                    }
                    svm::stop(core);
                }
            }

            if run::run(core, &[UMOUNT, &mntstr]).is_err() {
                warn!(log, "could not unmount probe directory {}", mntstr);
            }
        }

        let _ = std::fs::remove_dir(&mnt);
        found
    }

    fn discover_os(&mut self) -> Result<Vec<AttrSet>, TdError> {
        let core = self.core.clone();
        let log = core.log();

        let listing = match run::capture_string(&core, &[BEADM, "list", "-H"])
        {
            Ok(s) => s,
            Err(e) => {
                warn!(log, "boot environment listing failed: {}", e);
                return Ok(Vec::new());
            }
        };

        let mut out = Vec::new();
        for be in parse_beadm_list(&listing) {
            match self.os_record(&be) {
                Some(a) => out.push(a),
                None => {
                    warn!(log, "skipping boot environment {}", be.name);
                }
            }
        }

        Ok(out)
    }

    fn os_record(&mut self, be: &BeEntry) -> Option<AttrSet> {
        let core = self.core.clone();
        let log = core.log();

        let (root, we_mounted) = match &be.mountpoint {
            Some(mp) => (PathBuf::from(mp), false),
            None => {
                let mnt = temp_dir("td-be");
                std::fs::create_dir_all(&mnt).ok()?;
                let mntstr = mnt.to_string_lossy().to_string();
                if run::run(&core, &[BEADM, "mount", &be.name, &mntstr])
                    .is_err()
                {
                    let _ = std::fs::remove_dir(&mnt);
                    return None;
                }
                (mnt, true)
            }
        };

        let build = build_id_of(&root);
        let device = self.be_root_device(&be.name);
        let mut reasons = analyze_os_instance(&root);

        let mut a = AttrSet::new();
        let mut ok = true;

        match build {
            Some(b) => {
                let _ = a.add_text("os.build-id", &b);
            }
            None => {
                warn!(log, "boot environment {} has no release identity",
                    be.name);
                ok = false;
            }
        }

        match device {
            Some(dev) => {
                /*
                 * If the root device is an SVM or mirrored component the
                 * slice record will carry the metadevice identity; here
                 * we note only the mirror blocker bit.
                 */
                if dev.starts_with("/dev/md/") {
                    reasons |= UF_SVM_ROOT_MIRROR;
                }
                let _ = a.add_text("os.slice-name", &dev);
            }
            None => {
                warn!(log, "boot environment {} has no resolvable root \
                    device", be.name);
                ok = false;
            }
        }

        if reasons != 0 {
            let _ = a.add_uint32("os.upgrade-reasons", reasons);
        }

        if we_mounted {
            let _ = run::run(&core, &[BEADM, "unmount", &be.name]);
            let _ = std::fs::remove_dir(&root);
        }

        if ok {
            Some(a)
        } else {
            None
        }
    }

    /**
     * Resolve a boot environment's backing vdev to an installer-side
     * /dev/dsk path.
     */
    fn be_root_device(&mut self, be_name: &str) -> Option<String> {
        let core = self.core.clone();

        let pools = run::capture_string(&core,
            &[ZPOOL, "list", "-Ho", "name"]).ok()?;

        for pool in pools.lines().map(str::trim) {
            if pool.is_empty() {
                continue;
            }
            let ds = format!("{}/ROOT/{}", pool, be_name);
            match zfs::dataset_exists(&core, &ds) {
                Ok(true) => (),
                _ => continue,
            }

            let status = run::capture_string(&core,
                &[ZPOOL, "status", "-P", pool]).ok()?;
            for dev in parse_pool_devices(&status) {
                if dev.starts_with("/dev/dsk/") {
                    return Some(dev);
                }
                /*
                 * A physical path wants remapping into our /dev tree:
                 */
                if let Ok(Some(n)) = devmap::target_to_install(&core, &dev) {
                    return Some(format!("/dev/dsk/{}", n));
                }
            }
        }

        None
    }
}

fn temp_dir(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}.{}", label,
        Uuid::new_v4().to_hyphenated()))
}

fn boot_device_path(core: &Core) -> Option<String> {
    let out = run::capture_string(core, &[EEPROM, "bootpath"]).ok()?;
    let v = out.trim().strip_prefix("bootpath=")?.trim();
    if v.is_empty() || v == "data not available." {
        return None;
    }
    Some(strip_minor(v).to_string())
}

/*
 * Physical device paths end in ":<minor>"; disk-level comparison wants
 * the minor stripped.
 */
fn strip_minor(p: &str) -> &str {
    match p.rfind(':') {
        Some(i) if i > p.rfind('/').unwrap_or(0) => &p[..i],
        _ => p,
    }
}

fn disk_record(core: &Core, r: &disk::DiskReport, bootpath: Option<&str>)
    -> anyhow::Result<AttrSet>
{
    let raw = disk::slice_raw(&r.name, 2);
    let vt = run::capture_string(core, &[PRTVTOC, &raw])
        .and_then(|s| disk::parse_prtvtoc(&s))?;

    let devpath = devmap::install_to_target(&format!("{}s2", r.name))
        .ok()
        .flatten();
    let devid = device_id_of(core, &r.name);

    Ok(assemble_disk_record(r, &vt, devpath, devid, bootpath))
}

fn assemble_disk_record(
    r: &disk::DiskReport,
    vt: &disk::Vtoc,
    devpath: Option<String>,
    devid: Option<String>,
    bootpath: Option<&str>,
) -> AttrSet {
    let is_boot = match (bootpath, devpath.as_deref()) {
        (Some(b), Some(p)) => strip_minor(p) == b,
        _ => false,
    };

    let mut a = AttrSet::new();
    let _ = a.add_text("disk.name", &r.name);
    let _ = a.add_uint64("disk.size-mb", vt.geometry.size_mb());
    let _ = a.add_uint64("disk.size-sectors",
        vt.geometry.accessible_sectors());
    let _ = a.add_text("disk.type", r.dtype.name());
    let _ = a.add_boolean("disk.is-boot-disk", is_boot);

    if !r.vendor.is_empty() && r.vendor != "-" {
        let _ = a.add_text("disk.vendor", &r.vendor);
    }
    if let Some(v) = &vt.volume_name {
        let _ = a.add_text("disk.volume-name", v);
    }
    if let Some(id) = devid {
        let _ = a.add_text("disk.device-id", &id);
    }
    if let Some(p) = devpath {
        let _ = a.add_text("disk.device-path", &p);
    }

    a
}

fn device_id_of(core: &Core, disk_name: &str) -> Option<String> {
    let out = run::capture_string(core, &[IOSTAT, "-En", disk_name]).ok()?;
    for l in out.lines() {
        if let Some(v) = l.trim().strip_prefix("Device Id:") {
            let v = v.trim();
            if !v.is_empty() {
                return Some(v.to_string());
            }
        }
    }
    None
}

fn read_fdisk_table(core: &Core, disk_name: &str)
    -> Option<Vec<disk::FdiskRow>>
{
    let raw = disk::disk_raw_p0(disk_name);
    let out = run::capture_string(core, &[FDISK, "-W", "-", &raw]).ok()?;
    disk::parse_fdisk_table(&out).ok()
}

fn implicit_partition(disk_name: &str, sectors: u64) -> AttrSet {
    let mut a = AttrSet::new();
    let _ = a.add_text("part.name", &format!("{}p1", disk_name));
    let _ = a.add_text("part.disk-name", disk_name);
    let _ = a.add_uint8("part.id", disk::SUNIXOS2);
    let _ = a.add_boolean("part.active", true);
    let _ = a.add_uint64("part.begin-sector", 0);
    let _ = a.add_uint64("part.sector-count", sectors);
    let _ = a.add_uint32("part.begin-cyl", 0);
    let _ = a.add_uint32("part.begin-head", 0);
    let _ = a.add_uint32("part.begin-sect", 1);
    let _ = a.add_uint32("part.end-cyl", 0);
    let _ = a.add_uint32("part.end-head", 0);
    let _ = a.add_uint32("part.end-sect", 0);
    a
}

fn partition_record(disk_name: &str, number: usize, row: &disk::FdiskRow)
    -> AttrSet
{
    let mut a = AttrSet::new();
    let _ = a.add_text("part.name", &format!("{}p{}", disk_name, number));
    let _ = a.add_text("part.disk-name", disk_name);
    let _ = a.add_uint8("part.id", row.id);
    let _ = a.add_boolean("part.active", row.active);
    let _ = a.add_uint64("part.begin-sector", row.rsect);
    let _ = a.add_uint64("part.sector-count", row.numsect);
    let _ = a.add_uint32("part.begin-cyl", row.bcyl);
    let _ = a.add_uint32("part.begin-head", row.bhead);
    let _ = a.add_uint32("part.begin-sect", row.bsect);
    let _ = a.add_uint32("part.end-cyl", row.ecyl);
    let _ = a.add_uint32("part.end-head", row.ehead);
    let _ = a.add_uint32("part.end-sect", row.esect);
    a
}

fn slice_record(disk_name: &str, s: &disk::VtocSlice) -> AttrSet {
    let mut a = AttrSet::new();
    let _ = a.add_text("slice.name", &format!("{}s{}", disk_name, s.index));
    let _ = a.add_text("slice.disk-name", disk_name);
    let _ = a.add_uint32("slice.index", s.index);
    let _ = a.add_uint32("slice.tag", s.tag);
    let _ = a.add_uint32("slice.flags", s.flags);
    let _ = a.add_uint64("slice.first-sector", s.first_sector);
    let _ = a.add_uint64("slice.sector-count", s.sector_count);
    a
}

/**
 * Rewrite a mirror's component names from the target's /dev tree (found
 * under the probe mountpoint) into the installer's naming.  Components
 * that do not map keep their target-side name.
 */
fn remap_mirror(core: &Core, target_root: &Path, m: svm::MirrorInfo)
    -> svm::MirrorInfo
{
    let devdir = target_root.join("dev/dsk");
    let components = m
        .components
        .iter()
        .map(|c| {
            devmap::install_to_target_in(&devdir, c)
                .ok()
                .flatten()
                .and_then(|phys| {
                    devmap::target_to_install(core, &phys).ok().flatten()
                })
                .unwrap_or_else(|| c.clone())
        })
        .collect();

    svm::MirrorInfo { md_name: m.md_name, components }
}

fn record_mirror(a: &mut AttrSet, m: &svm::MirrorInfo) {
    let _ = a.add_text("slice.md-name", &m.md_name);
    let _ = a.add_text_array("slice.md-components", m.components.clone());
}

/*
 * Tags that clearly cannot host a Solaris root are not worth the
 * expensive mount-and-probe.
 */
fn probe_worthy(tag: u32) -> bool {
    !matches!(
        tag,
        disk::TAG_BOOT
            | disk::TAG_SWAP
            | disk::TAG_BACKUP
            | disk::TAG_ALTSCTR
            | disk::TAG_CACHE
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeEntry {
    pub name: String,
    pub mountpoint: Option<String>,
}

/**
 * Parse beadm list -H output: semicolon-delimited fields, of which we
 * need the name and the current mountpoint.
 */
pub fn parse_beadm_list(data: &str) -> Vec<BeEntry> {
    let mut out = Vec::new();

    for l in data.lines() {
        let l = l.trim();
        if l.is_empty() {
            continue;
        }
        let f: Vec<&str> = l.split(';').collect();
        if f.is_empty() || f[0].is_empty() {
            continue;
        }

        let mountpoint = match f.get(3).copied().unwrap_or("-") {
            "" | "-" => None,
            mp => Some(mp.to_string()),
        };

        out.push(BeEntry { name: f[0].to_string(), mountpoint });
    }

    out
}

/**
 * Pull the vdev paths out of zpool status -P output: indented config
 * lines whose first column is an absolute path.
 */
pub fn parse_pool_devices(data: &str) -> Vec<String> {
    let mut out = Vec::new();

    for l in data.lines() {
        let t = l.trim_start();
        if !t.starts_with('/') {
            continue;
        }
        if let Some(dev) = t.split_whitespace().next() {
            out.push(dev.to_string());
        }
    }

    out
}

/**
 * Extract the build identity from the first line of /etc/release: the
 * token naming the build, e.g. "snv_151" from "Solaris Nevada snv_151
 * X86".
 */
pub fn parse_release(data: &str) -> Option<String> {
    let line = data.lines().map(str::trim).find(|l| !l.is_empty())?;
    let toks: Vec<&str> = line.split_whitespace().collect();

    if let Some(t) = toks.iter().find(|t| {
        let mut it = t.splitn(2, '_');
        let (a, b) = (it.next().unwrap_or(""), it.next().unwrap_or(""));
        !a.is_empty()
            && !b.is_empty()
            && b.chars().next().map_or(false, |c| c.is_ascii_digit())
    }) {
        return Some(t.to_string());
    }

    /*
     * Older layouts: the banner word, then the release family, then the
     * build.
     */
    toks.get(2).or_else(|| toks.get(1)).map(|t| t.to_string())
}

/**
 * Extract a build identity from INST_RELEASE (OS= and VERSION= lines).
 */
pub fn parse_inst_release(data: &str) -> Option<String> {
    let mut os = None;
    let mut version = None;

    for l in data.lines() {
        let l = l.trim();
        if let Some(v) = l.strip_prefix("OS=") {
            os = Some(v.to_string());
        } else if let Some(v) = l.strip_prefix("VERSION=") {
            version = Some(v.to_string());
        }
    }

    match (os, version) {
        (Some(o), Some(v)) => Some(format!("{}_{}", o, v)),
        _ => None,
    }
}

fn build_id_of(root: &Path) -> Option<String> {
    if let Ok(data) = std::fs::read_to_string(root.join("etc/release")) {
        if let Some(b) = parse_release(&data) {
            return Some(b);
        }
    }

    let inst = root.join("var/sadm/system/admin/INST_RELEASE");
    if let Ok(data) = std::fs::read_to_string(inst) {
        return parse_inst_release(&data);
    }

    None
}

/**
 * Upgrade eligibility analysis over a mounted OS instance.  Returns the
 * combined blocker bits; zero means no blocker found here.
 */
pub fn analyze_os_instance(root: &Path) -> u32 {
    let mut reasons = 0;

    let admin = root.join("var/sadm/system/admin");

    if !admin.join("INST_RELEASE").is_file() {
        reasons |= UF_NO_INST_RELEASE;
    }

    match std::fs::read_to_string(admin.join("CLUSTER")) {
        Ok(data) => {
            let cluster = data
                .lines()
                .filter_map(|l| l.trim().strip_prefix("CLUSTER="))
                .next()
                .unwrap_or("")
                .to_string();
            if !METACLUSTERS.contains(&cluster.as_str()) {
                reasons |= UF_WRONG_METACLUSTER;
            }
        }
        Err(_) => reasons |= UF_NO_CLUSTER,
    }

    if !admin.join(".clustertoc").is_file() {
        reasons |= UF_NO_CLUSTERTOC;
    }

    if !root.join("boot/solaris/bootenv.rc").is_file() {
        reasons |= UF_NO_BOOTENVRC;
    }

    match std::fs::read_dir(root.join("var/sadm/pkg")) {
        Ok(mut d) => {
            if d.next().is_none() {
                reasons |= UF_NO_USR_PACKAGES;
            }
        }
        Err(_) => reasons |= UF_NO_USR_PACKAGES,
    }

    if build_id_of(root).is_none() {
        reasons |= UF_NO_VERSION;
    } else if let Some(v) = inst_release_version(root) {
        if v < 8 {
            reasons |= UF_OS_TOO_OLD;
        }
    }

    /*
     * An installed non-global zone whose zonepath is gone cannot be
     * carried through an upgrade.
     */
    if let Ok(index) = std::fs::read_to_string(root.join("etc/zones/index"))
    {
        for l in index.lines() {
            let l = l.trim();
            if l.is_empty() || l.starts_with('#') {
                continue;
            }
            let f: Vec<&str> = l.split(':').collect();
            if f.len() < 3 || f[0] == "global" || f[1] != "installed" {
                continue;
            }
            let zp = f[2].trim_start_matches('/');
            if !root.join(zp).join("root").is_dir() {
                reasons |= UF_ZONES_NOT_UPGRADEABLE;
            }
        }
    }

    reasons
}

fn inst_release_version(root: &Path) -> Option<u32> {
    let inst = root.join("var/sadm/system/admin/INST_RELEASE");
    let data = std::fs::read_to_string(inst).ok()?;
    data.lines()
        .filter_map(|l| l.trim().strip_prefix("VERSION="))
        .next()
        .and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_core;

    #[test]
    fn beadm_listing() {
        let bes = parse_beadm_list(
            "solaris;11111111;NR;/;6.2G;static;1297197730\n\
             snv_151;22222222;-;-;5.0G;static;1290000000\n\
             \n",
        );
        assert_eq!(bes.len(), 2);
        assert_eq!(bes[0].name, "solaris");
        assert_eq!(bes[0].mountpoint.as_deref(), Some("/"));
        assert_eq!(bes[1].name, "snv_151");
        assert!(bes[1].mountpoint.is_none());
    }

    #[test]
    fn pool_device_listing() {
        let devs = parse_pool_devices(
            "  pool: rpool\n\
             \x20state: ONLINE\n\
             config:\n\
             \n\
             \tNAME                      STATE     READ WRITE CKSUM\n\
             \trpool                     ONLINE       0     0     0\n\
             \t  /dev/dsk/c0t0d0s0       ONLINE       0     0     0\n\
             \n\
             errors: No known data errors\n",
        );
        assert_eq!(devs, vec!["/dev/dsk/c0t0d0s0".to_string()]);
    }

    #[test]
    fn release_parsing() {
        assert_eq!(
            parse_release("           Solaris Nevada snv_151 X86\n"),
            Some("snv_151".to_string())
        );
        assert_eq!(
            parse_release("  OpenIndiana Hipster 2021.04 (powered by \
                illumos)\n"),
            Some("2021.04".to_string())
        );
        assert!(parse_release("\n\n").is_none());
    }

    #[test]
    fn inst_release_parsing() {
        assert_eq!(
            parse_inst_release("OS=Solaris\nVERSION=10\nREV=0\n"),
            Some("Solaris_10".to_string())
        );
        assert!(parse_inst_release("REV=0\n").is_none());
    }

    #[test]
    fn probe_short_circuit() {
        assert!(probe_worthy(disk::TAG_ROOT));
        assert!(probe_worthy(disk::TAG_UNASSIGNED));
        assert!(probe_worthy(disk::TAG_USR));
        assert!(!probe_worthy(disk::TAG_SWAP));
        assert!(!probe_worthy(disk::TAG_BACKUP));
        assert!(!probe_worthy(disk::TAG_BOOT));
    }

    #[test]
    fn minor_stripping() {
        assert_eq!(
            strip_minor("/pci@0,0/ide@0/cmdk@0,0:a"),
            "/pci@0,0/ide@0/cmdk@0,0"
        );
        assert_eq!(strip_minor("/pci@0,0/ide@0/cmdk@0,0"),
            "/pci@0,0/ide@0/cmdk@0,0");
    }

    #[test]
    fn analysis_of_upgradeable_instance() {
        let td = tempfile::tempdir().unwrap();
        let root = td.path();

        let admin = root.join("var/sadm/system/admin");
        std::fs::create_dir_all(&admin).unwrap();
        std::fs::write(admin.join("INST_RELEASE"),
            "OS=Solaris\nVERSION=11\nREV=0\n").unwrap();
        std::fs::write(admin.join("CLUSTER"), "CLUSTER=SUNWCXall\n")
            .unwrap();
        std::fs::write(admin.join(".clustertoc"), "").unwrap();

        std::fs::create_dir_all(root.join("boot/solaris")).unwrap();
        std::fs::write(root.join("boot/solaris/bootenv.rc"), "").unwrap();

        std::fs::create_dir_all(root.join("var/sadm/pkg/SUNWcs")).unwrap();

        std::fs::create_dir_all(root.join("etc")).unwrap();
        std::fs::write(root.join("etc/release"),
            "    Solaris Nevada snv_151 X86\n").unwrap();

        assert_eq!(analyze_os_instance(root), 0);
    }

    #[test]
    fn analysis_flags_blockers() {
        let td = tempfile::tempdir().unwrap();
        let root = td.path();

        let r = analyze_os_instance(root);
        assert_ne!(r & UF_NO_INST_RELEASE, 0);
        assert_ne!(r & UF_NO_CLUSTER, 0);
        assert_ne!(r & UF_NO_CLUSTERTOC, 0);
        assert_ne!(r & UF_NO_BOOTENVRC, 0);
        assert_ne!(r & UF_NO_USR_PACKAGES, 0);
        assert_ne!(r & UF_NO_VERSION, 0);
        assert_eq!(r & UF_WRONG_METACLUSTER, 0);
    }

    #[test]
    fn analysis_flags_old_os_and_bad_cluster() {
        let td = tempfile::tempdir().unwrap();
        let root = td.path();

        let admin = root.join("var/sadm/system/admin");
        std::fs::create_dir_all(&admin).unwrap();
        std::fs::write(admin.join("INST_RELEASE"),
            "OS=Solaris\nVERSION=7\nREV=0\n").unwrap();
        std::fs::write(admin.join("CLUSTER"), "CLUSTER=SUNWCnotreal\n")
            .unwrap();

        let r = analyze_os_instance(root);
        assert_ne!(r & UF_OS_TOO_OLD, 0);
        assert_ne!(r & UF_WRONG_METACLUSTER, 0);
        assert_eq!(r & UF_NO_INST_RELEASE, 0);
    }

    #[test]
    fn boot_disk_record_assembly() {
        let report = disk::DiskReport {
            dtype: disk::DiskType::Ata,
            name: "c0t0d0".to_string(),
            vendor: "VBOX".to_string(),
            product: "HARDDISK".to_string(),
            size_mb: 60 * 1024,
            removable: false,
        };
        let vt = disk::Vtoc {
            geometry: disk::Geometry {
                bytes_per_sector: 512,
                sectors_per_track: 63,
                tracks_per_cylinder: 255,
                sectors_per_cylinder: 16065,
                cylinders: 7652,
                accessible_cylinders: 7650,
            },
            slices: Vec::new(),
            volume_name: None,
        };

        let a = assemble_disk_record(
            &report,
            &vt,
            Some("/pci@0,0/ide@0/cmdk@0,0:c".to_string()),
            Some("id1,cmdk@AVBOX_HARDDISK=123".to_string()),
            Some("/pci@0,0/ide@0/cmdk@0,0"),
        );

        assert_eq!(a.get_text("disk.name").unwrap(), "c0t0d0");
        assert_eq!(a.get_text("disk.type").unwrap(), "ATA");
        assert_eq!(
            a.get_uint64("disk.size-mb").unwrap(),
            16065u64 * 7650 * 512 / (1024 * 1024)
        );
        assert_eq!(a.get_uint64("disk.size-sectors").unwrap(),
            16065 * 7650);
        assert!(a.get_boolean("disk.is-boot-disk").unwrap());
        assert_eq!(a.get_text("disk.vendor").unwrap(), "VBOX");
        assert!(a.get_text("disk.device-id").is_ok());

        /*
         * A different boot path must not claim this disk:
         */
        let b = assemble_disk_record(
            &report,
            &vt,
            Some("/pci@0,0/ide@0/cmdk@0,0:c".to_string()),
            None,
            Some("/pci@0,0/ide@1/cmdk@0,0"),
        );
        assert!(!b.get_boolean("disk.is-boot-disk").unwrap());
        /*
         * Optional attributes are absent, not empty:
         */
        assert!(!b.contains("disk.device-id"));
        assert!(!b.contains("disk.volume-name"));
    }

    #[test]
    fn mirrored_slice_record() {
        let s = disk::VtocSlice {
            index: 0,
            tag: disk::TAG_ROOT,
            flags: 0,
            first_sector: 16065,
            sector_count: 125028900,
        };
        let mut a = slice_record("c0t0d0", &s);

        let m = svm::MirrorInfo {
            md_name: "d10".to_string(),
            components: vec![
                "c0t0d0s0".to_string(),
                "c0t1d0s0".to_string(),
            ],
        };
        record_mirror(&mut a, &m);

        assert_eq!(a.get_text("slice.name").unwrap(), "c0t0d0s0");
        assert_eq!(a.get_text("slice.md-name").unwrap(), "d10");
        assert_eq!(
            a.get_text_array("slice.md-components").unwrap(),
            &["c0t0d0s0".to_string(), "c0t1d0s0".to_string()]
        );
    }

    #[test]
    fn cursor_walks_registry() {
        let core = test_core();
        let mut d = Discovery::new(&core);

        /*
         * Seed the registry directly; cursor semantics do not depend on
         * how the records got there.
         */
        let mut a = AttrSet::new();
        a.add_text("disk.name", "c0t0d0").unwrap();
        let mut b = AttrSet::new();
        b.add_text("disk.name", "c0t1d0").unwrap();
        d.registry.insert(ObjectKind::Disk, vec![a, b]);
        d.cursors.insert(ObjectKind::Disk, None);

        assert!(d.attributes(ObjectKind::Disk).is_none());

        assert!(d.get_next(ObjectKind::Disk));
        assert_eq!(
            d.attributes(ObjectKind::Disk).unwrap()
                .get_text("disk.name").unwrap(),
            "c0t0d0"
        );

        assert!(d.get_next(ObjectKind::Disk));
        assert_eq!(
            d.attributes(ObjectKind::Disk).unwrap()
                .get_text("disk.name").unwrap(),
            "c0t1d0"
        );

        assert!(!d.get_next(ObjectKind::Disk));

        d.release();
        assert!(d.objects(ObjectKind::Disk).is_empty());
    }
}
