/*
 * Copyright 2024 Oxide Computer Company
 */

/*!
 * Target instantiation: materialising fdisk partitions, VTOC slices, ZFS
 * pools, datasets and volumes, boot environments, ramdisks and plain
 * directories from an attribute-set description.  Validation runs before
 * any side effect, steps run in order, and a failed step short-circuits
 * the rest.
 */

use std::path::PathBuf;

use slog::{info, warn};
use uuid::Uuid;

use crate::attr::AttrSet;
use crate::disk::{self, FdiskRow, Geometry, VtocSlice};
use crate::errors::TiError;
use crate::run;
use crate::{zfs, Core, ALT_ROOT};

const FDISK: &str = "/usr/sbin/fdisk";
const FMTHARD: &str = "/usr/sbin/fmthard";
const PRTVTOC: &str = "/usr/sbin/prtvtoc";
const MKFILE: &str = "/usr/sbin/mkfile";
const LOFIADM: &str = "/usr/sbin/lofiadm";
const NEWFS: &str = "/usr/sbin/newfs";
const MKDIR: &str = "/usr/bin/mkdir";
const RMDIR: &str = "/usr/bin/rmdir";
const MOUNT: &str = "/sbin/mount";
const UMOUNT: &str = "/sbin/umount";
const SWAP: &str = "/usr/sbin/swap";
const DUMPADM: &str = "/usr/sbin/dumpadm";

/*
 * The marker property stamped on a new root pool; the installer flips it
 * to "ready" once the whole installation has succeeded.
 */
pub const INSTALL_PROP: &str = "org.opensolaris.caiman:install";

pub const VOL_TYPE_GENERIC: u8 = 0;
pub const VOL_TYPE_SWAP: u8 = 1;
pub const VOL_TYPE_DUMP: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    Fdisk,
    Vtoc,
    ZfsRpool,
    ZfsFs,
    ZfsVol,
    Be,
    Ramdisk,
    Directory,
}

impl TargetType {
    pub fn from_attr(v: &str) -> Option<TargetType> {
        Some(match v {
            "fdisk" => TargetType::Fdisk,
            "vtoc" => TargetType::Vtoc,
            "zfs-rpool" => TargetType::ZfsRpool,
            "zfs-fs" => TargetType::ZfsFs,
            "zfs-vol" => TargetType::ZfsVol,
            "be" => TargetType::Be,
            "ramdisk" => TargetType::Ramdisk,
            "directory" => TargetType::Directory,
            _ => return None,
        })
    }
}

fn target_type(core: &Core, a: &AttrSet) -> Result<TargetType, TiError> {
    match a.get_text("target-type").ok().and_then(TargetType::from_attr) {
        Some(t) => Ok(t),
        None => {
            warn!(core.log(), "missing or unknown target-type attribute");
            Err(TiError::InvalidFdiskAttr)
        }
    }
}

/**
 * Create the target described by the attribute set.
 */
pub fn ti_create(core: &Core, a: &AttrSet) -> Result<(), TiError> {
    match target_type(core, a)? {
        TargetType::Fdisk => create_fdisk(core, &fdisk_attrs(core, a)?),
        TargetType::Vtoc => create_vtoc(core, &vtoc_attrs(core, a)?),
        TargetType::ZfsRpool => {
            create_rpool(core, &rpool_attrs(core, a)?)
        }
        TargetType::ZfsFs => create_fs(core, &fs_attrs(core, a)?),
        TargetType::ZfsVol => create_vol(core, &vol_attrs(core, a)?),
        TargetType::Be => create_be(core, &be_attrs(core, a)?),
        TargetType::Ramdisk => {
            create_ramdisk(core, &ramdisk_attrs(core, a)?)
        }
        TargetType::Directory => {
            create_directory(core, &directory_attrs(core, a)?)
        }
    }
}

/**
 * Release the target described by the attribute set, undoing the
 * corresponding ti_create.
 */
pub fn ti_release(core: &Core, a: &AttrSet) -> Result<(), TiError> {
    match target_type(core, a)? {
        TargetType::Fdisk | TargetType::Vtoc => {
            /*
             * Partition tables are replaced, not released.
             */
            Ok(())
        }
        TargetType::ZfsRpool => {
            release_rpool(core, &rpool_attrs(core, a)?)
        }
        TargetType::ZfsFs => release_fs(core, &fs_attrs(core, a)?),
        TargetType::ZfsVol => release_vol(core, &vol_attrs(core, a)?),
        TargetType::Be => release_be(core, &be_attrs(core, a)?),
        TargetType::Ramdisk => {
            release_ramdisk(core, &ramdisk_attrs(core, a)?)
        }
        TargetType::Directory => {
            release_directory(core, &directory_attrs(core, a)?)
        }
    }
}

/**
 * Flip the install marker on a root pool to "ready".  Called by the
 * installer once image transfer has completed successfully.
 */
pub fn mark_ready(core: &Core, pool: &str) -> Result<(), TiError> {
    if zfs::zfs_set(core, pool, INSTALL_PROP, "ready").is_err() {
        return Err(TiError::ZfsSetPropFailed);
    }
    Ok(())
}

/*
 * Attribute extraction helpers.  Each branch reports its own invalid-
 * attribute error, with the offending name logged.
 */

fn req_text(core: &Core, a: &AttrSet, n: &str, e: TiError)
    -> Result<String, TiError>
{
    match a.get_text(n) {
        Ok(v) => Ok(v.to_string()),
        Err(err) => {
            warn!(core.log(), "bad attribute set: {}", err);
            Err(e)
        }
    }
}

fn opt_boolean(a: &AttrSet, n: &str) -> bool {
    a.get_boolean(n).unwrap_or(false)
}

fn req_count(core: &Core, a: &AttrSet, n: &str, e: TiError)
    -> Result<usize, TiError>
{
    match a.get_uint16(n) {
        Ok(v) => Ok(v as usize),
        Err(err) => {
            warn!(core.log(), "bad attribute set: {}", err);
            Err(e)
        }
    }
}

fn check_len(core: &Core, n: &str, have: usize, want: usize, e: TiError)
    -> Result<(), TiError>
{
    if have != want {
        warn!(core.log(), "attribute {} has {} elements, expected {}", n,
            have, want);
        return Err(e);
    }
    Ok(())
}

/*
 * ---------------------------------------------------------------------
 * FDISK
 */

#[derive(Debug, Clone)]
struct FdiskAttrs {
    disk: String,
    wdisk: bool,
    parts: Vec<FdiskRow>,
    preserve: Vec<bool>,
}

fn fdisk_attrs(core: &Core, a: &AttrSet) -> Result<FdiskAttrs, TiError> {
    const E: TiError = TiError::InvalidFdiskAttr;

    let disk = req_text(core, a, "fdisk.disk-name", E)?;
    if !disk::is_disk_name(&disk) {
        warn!(core.log(), "fdisk.disk-name {:?} is not a disk name", disk);
        return Err(E);
    }

    if opt_boolean(a, "fdisk.wdisk-fl") {
        return Ok(FdiskAttrs {
            disk,
            wdisk: true,
            parts: Vec::new(),
            preserve: Vec::new(),
        });
    }

    let n = req_count(core, a, "fdisk.part-count", E)?;
    if n == 0 || n > 4 {
        warn!(core.log(), "fdisk.part-count {} out of range", n);
        return Err(E);
    }

    let ids = a.get_uint8_array("fdisk.part-ids").map_err(|err| {
        warn!(core.log(), "bad attribute set: {}", err);
        E
    })?;
    let active = a.get_boolean_array("fdisk.part-active").map_err(|err| {
        warn!(core.log(), "bad attribute set: {}", err);
        E
    })?;

    let chs = |name: &str| -> Result<Vec<u32>, TiError> {
        let v = a.get_uint32_array(name).map_err(|err| {
            warn!(core.log(), "bad attribute set: {}", err);
            E
        })?;
        check_len(core, name, v.len(), n, E)?;
        Ok(v.to_vec())
    };

    let sect = |name: &str| -> Result<Vec<u64>, TiError> {
        let v = a.get_uint64_array(name).map_err(|err| {
            warn!(core.log(), "bad attribute set: {}", err);
            E
        })?;
        check_len(core, name, v.len(), n, E)?;
        Ok(v.to_vec())
    };

    check_len(core, "fdisk.part-ids", ids.len(), n, E)?;
    check_len(core, "fdisk.part-active", active.len(), n, E)?;

    let bheads = chs("fdisk.part-bheads")?;
    let bsects = chs("fdisk.part-bsects")?;
    let bcyls = chs("fdisk.part-bcyls")?;
    let eheads = chs("fdisk.part-eheads")?;
    let esects = chs("fdisk.part-esects")?;
    let ecyls = chs("fdisk.part-ecyls")?;
    let rsects = sect("fdisk.part-rsects")?;
    let numsects = sect("fdisk.part-numsects")?;

    let preserve = match a.get_boolean_array("fdisk.part-preserve") {
        Ok(v) => {
            check_len(core, "fdisk.part-preserve", v.len(), n, E)?;
            v.to_vec()
        }
        Err(_) => vec![false; n],
    };

    let mut parts = Vec::with_capacity(n);
    for i in 0..n {
        parts.push(FdiskRow {
            id: ids[i],
            active: active[i],
            bhead: bheads[i],
            bsect: bsects[i],
            bcyl: bcyls[i],
            ehead: eheads[i],
            esect: esects[i],
            ecyl: ecyls[i],
            rsect: rsects[i],
            numsect: numsects[i],
        });
    }

    Ok(FdiskAttrs { disk, wdisk: false, parts, preserve })
}

/**
 * Merge a requested table with the existing one: slots marked preserve
 * keep whatever is on disk; all other slots are replaced by the request
 * (or emptied, beyond the requested count).  The result always has four
 * slots.
 */
fn merge_fdisk(
    existing: &[FdiskRow],
    parts: &[FdiskRow],
    preserve: &[bool],
) -> Vec<FdiskRow> {
    let mut out = Vec::with_capacity(4);
    for i in 0..4 {
        let keep = preserve.get(i).copied().unwrap_or(false);
        if keep {
            out.push(existing.get(i).copied().unwrap_or_default());
        } else {
            out.push(parts.get(i).copied().unwrap_or_default());
        }
    }
    out
}

/**
 * A single Solaris2 partition covering the whole disk.
 */
fn whole_disk_table(total_sectors: u64) -> Vec<FdiskRow> {
    let mut rows = vec![FdiskRow::default(); 4];
    rows[0] = FdiskRow {
        id: disk::SUNIXOS2,
        active: true,
        bhead: 0,
        bsect: 1,
        bcyl: 0,
        ehead: 254,
        esect: 63,
        ecyl: 1023,
        rsect: 0,
        numsect: total_sectors,
    };
    rows
}

fn disk_geometry(core: &Core, disk_name: &str) -> Option<Geometry> {
    let raw = disk::slice_raw(disk_name, 2);
    let out = run::capture_string(core, &[PRTVTOC, &raw]).ok()?;
    disk::parse_prtvtoc(&out).ok().map(|v| v.geometry)
}

fn write_table_file(core: &Core, label: &str, contents: &str)
    -> Option<PathBuf>
{
    if core.dry_run() {
        return None;
    }

    let p = std::env::temp_dir()
        .join(format!("{}.{}", label, Uuid::new_v4().to_hyphenated()));
    match std::fs::write(&p, contents) {
        Ok(()) => Some(p),
        Err(e) => {
            warn!(core.log(), "could not write {}: {}", p.display(), e);
            None
        }
    }
}

fn create_fdisk(core: &Core, t: &FdiskAttrs) -> Result<(), TiError> {
    let log = core.log();
    let raw = disk::disk_raw_p0(&t.disk);

    let table = if t.wdisk {
        let sectors = match disk_geometry(core, &t.disk) {
            Some(g) => g.accessible_sectors(),
            None => {
                warn!(log, "cannot read geometry of {}", t.disk);
                return Err(TiError::FdiskWriteFailed);
            }
        };
        whole_disk_table(sectors)
    } else {
        let existing = run::capture_string(core, &[FDISK, "-W", "-", &raw])
            .ok()
            .and_then(|s| disk::parse_fdisk_table(&s).ok())
            .unwrap_or_default();
        merge_fdisk(&existing, &t.parts, &t.preserve)
    };

    info!(log, "WRITE FDISK TABLE: {}", t.disk);

    let contents = disk::format_fdisk_table(&table);
    let file = write_table_file(core, "ti-fdisk", &contents);
    let fstr = match &file {
        Some(p) => p.to_string_lossy().to_string(),
        None => "/dev/null".to_string(),
    };

    let r = run::run(core, &[FDISK, "-n", "-F", &fstr, &raw]);

    if let Some(p) = file {
        let _ = std::fs::remove_file(p);
    }

    if let Err(e) = r {
        warn!(log, "fdisk write on {}: {}", t.disk, e);
        return Err(TiError::FdiskWriteFailed);
    }

    Ok(())
}

/*
 * ---------------------------------------------------------------------
 * VTOC
 */

#[derive(Debug, Clone)]
struct VtocAttrs {
    disk: String,
    default_layout: bool,
    slices: Vec<VtocSlice>,
}

fn vtoc_attrs(core: &Core, a: &AttrSet) -> Result<VtocAttrs, TiError> {
    const E: TiError = TiError::InvalidVtocAttr;

    let disk = req_text(core, a, "vtoc.disk-name", E)?;
    if !disk::is_disk_name(&disk) {
        warn!(core.log(), "vtoc.disk-name {:?} is not a disk name", disk);
        return Err(E);
    }

    if opt_boolean(a, "vtoc.default-layout") {
        return Ok(VtocAttrs { disk, default_layout: true,
            slices: Vec::new() });
    }

    let n = req_count(core, a, "vtoc.slice-count", E)?;
    if n == 0 || n > 16 {
        warn!(core.log(), "vtoc.slice-count {} out of range", n);
        return Err(E);
    }

    let u16s = |name: &str| -> Result<Vec<u16>, TiError> {
        let v = a.get_uint16_array(name).map_err(|err| {
            warn!(core.log(), "bad attribute set: {}", err);
            E
        })?;
        check_len(core, name, v.len(), n, E)?;
        Ok(v.to_vec())
    };
    let u64s = |name: &str| -> Result<Vec<u64>, TiError> {
        let v = a.get_uint64_array(name).map_err(|err| {
            warn!(core.log(), "bad attribute set: {}", err);
            E
        })?;
        check_len(core, name, v.len(), n, E)?;
        Ok(v.to_vec())
    };

    let nums = u16s("vtoc.slice-nums")?;
    let tags = u16s("vtoc.slice-tags")?;
    let flags = u16s("vtoc.slice-flags")?;
    let firsts = u64s("vtoc.slice-1stsecs")?;
    let sizes = u64s("vtoc.slice-sizes")?;

    /*
     * The per-slice partition indexes are carried for callers that lay
     * out several disks from one description; they are validated for
     * shape but not otherwise used when writing a single label.
     */
    if let Ok(parts) = a.get_uint16_array("vtoc.slice-parts") {
        check_len(core, "vtoc.slice-parts", parts.len(), n, E)?;
    }

    let mut slices = Vec::with_capacity(n);
    for i in 0..n {
        if nums[i] > 15 {
            warn!(core.log(), "vtoc.slice-nums[{}] = {} out of range", i,
                nums[i]);
            return Err(E);
        }
        slices.push(VtocSlice {
            index: nums[i] as u32,
            tag: tags[i] as u32,
            flags: flags[i] as u32,
            first_sector: firsts[i],
            sector_count: sizes[i],
        });
    }

    Ok(VtocAttrs { disk, default_layout: false, slices })
}

/*
 * Stock layout: slice 2 is the conventional backup slice covering the
 * whole partition; slice 1 holds swap, sized at 2 GiB but capped at a
 * tenth of the partition; slice 0 is the root and takes everything else.
 * The first cylinder is left alone for the label and boot block.
 */
fn default_vtoc_layout(geom: &Geometry) -> Vec<VtocSlice> {
    let spc = geom.sectors_per_cylinder.max(1);
    let total = geom.accessible_sectors();

    let swap_want = 2048 * 1024 * 1024 / geom.bytes_per_sector.max(1);
    let swap_sectors = swap_want.min(total / 10) / spc * spc;

    let root_first = spc + swap_sectors;

    vec![
        VtocSlice {
            index: 0,
            tag: disk::TAG_ROOT,
            flags: 0,
            first_sector: root_first,
            sector_count: total.saturating_sub(root_first),
        },
        VtocSlice {
            index: 1,
            tag: disk::TAG_SWAP,
            flags: disk::FLAG_UNMNT,
            first_sector: spc,
            sector_count: swap_sectors,
        },
        VtocSlice {
            index: 2,
            tag: disk::TAG_BACKUP,
            flags: disk::FLAG_UNMNT,
            first_sector: 0,
            sector_count: total,
        },
    ]
}

/**
 * Render the datafile consumed by fmthard -s.
 */
fn fmthard_lines(slices: &[VtocSlice]) -> String {
    let mut out = String::new();
    for s in slices.iter() {
        out.push_str(&format!(
            "{} {} 0x{:02x} {} {}\n",
            s.index, s.tag, s.flags, s.first_sector, s.sector_count
        ));
    }
    out
}

fn create_vtoc(core: &Core, t: &VtocAttrs) -> Result<(), TiError> {
    let log = core.log();
    let raw = disk::slice_raw(&t.disk, 2);

    let slices = if t.default_layout {
        let geom = match disk_geometry(core, &t.disk) {
            Some(g) => g,
            None => {
                warn!(log, "cannot read geometry of {}", t.disk);
                return Err(TiError::VtocWriteFailed);
            }
        };
        default_vtoc_layout(&geom)
    } else {
        t.slices.clone()
    };

    info!(log, "WRITE VTOC: {} ({} slices)", t.disk, slices.len());

    let contents = fmthard_lines(&slices);
    let file = write_table_file(core, "ti-vtoc", &contents);
    let fstr = match &file {
        Some(p) => p.to_string_lossy().to_string(),
        None => "/dev/null".to_string(),
    };

    let r = run::run(core, &[FMTHARD, "-s", &fstr, &raw]);

    if let Some(p) = file {
        let _ = std::fs::remove_file(p);
    }

    if let Err(e) = r {
        warn!(log, "fmthard on {}: {}", t.disk, e);
        return Err(TiError::VtocWriteFailed);
    }

    Ok(())
}

/*
 * ---------------------------------------------------------------------
 * ZFS root pool
 */

#[derive(Debug, Clone)]
struct RpoolAttrs {
    name: String,
    device: String,
    preserve: bool,
}

fn rpool_attrs(core: &Core, a: &AttrSet) -> Result<RpoolAttrs, TiError> {
    const E: TiError = TiError::InvalidZfsRpoolAttr;

    let name = req_text(core, a, "zfs.rpool.name", E)?;
    if name.contains('/') || name.contains('@') {
        warn!(core.log(), "zfs.rpool.name {:?} is not a pool name", name);
        return Err(E);
    }
    let device = req_text(core, a, "zfs.rpool.device", E)?;
    let preserve = opt_boolean(a, "zfs.rpool.preserve");

    Ok(RpoolAttrs { name, device, preserve })
}

fn create_rpool(core: &Core, t: &RpoolAttrs) -> Result<(), TiError> {
    let log = core.log();

    match zfs::pool_exists(core, &t.name) {
        Ok(true) if t.preserve => {
            info!(log, "pool {} exists and is preserved", t.name);
            return Ok(());
        }
        Ok(true) => {
            if zfs::pool_destroy(core, &t.name).is_err() {
                return Err(TiError::ZfsPoolCreateFailed);
            }
        }
        Ok(false) => (),
        Err(e) => {
            warn!(log, "cannot probe for pool {}: {}", t.name, e);
            return Err(TiError::ZfsPoolCreateFailed);
        }
    }

    if let Err(e) = zfs::pool_create(core, &t.name, &t.device) {
        warn!(log, "pool create {}: {}", t.name, e);
        return Err(TiError::ZfsPoolCreateFailed);
    }

    /*
     * The boot loader expects its directory on the pool dataset, which
     * mounts at /<pool> unless something has been configured:
     */
    let mp = zfs::pool_mountpoint(core, &t.name)
        .unwrap_or_else(|_| format!("/{}", t.name));
    let grub = format!("{}/boot/grub", mp);
    if run::run(core, &[MKDIR, "-p", &grub]).is_err() {
        return Err(TiError::MkdirFailed);
    }

    if zfs::zfs_set(core, &t.name, INSTALL_PROP, "busy").is_err() {
        return Err(TiError::ZfsSetPropFailed);
    }

    Ok(())
}

/**
 * Pull the swap device paths out of swap -l output.
 */
fn parse_swap_l(data: &str) -> Vec<String> {
    data.lines()
        .skip(1)
        .filter_map(|l| l.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

fn release_pool_swap(core: &Core, pool: &str) {
    let log = core.log();
    let prefix = format!("/dev/zvol/dsk/{}/", pool);

    let listing = match run::capture_string(core, &[SWAP, "-l"]) {
        Ok(s) => s,
        Err(_) => return,
    };

    for dev in parse_swap_l(&listing) {
        if dev.starts_with(&prefix) {
            if let Err(e) = run::run(core, &[SWAP, "-d", &dev]) {
                warn!(log, "swap -d {}: {}", dev, e);
            }
        }
    }
}

fn release_rpool(core: &Core, t: &RpoolAttrs) -> Result<(), TiError> {
    let log = core.log();

    /*
     * Dump first, then swap, then the pool itself.  Dump deregistration
     * is advisory; a dump device outside the pool is left alone.
     */
    if let Err(e) = run::run(core, &[DUMPADM, "-d", "swap"]) {
        warn!(log, "dump device release: {}", e);
    }

    release_pool_swap(core, &t.name);

    match zfs::pool_destroy(core, &t.name) {
        Ok(_) => Ok(()),
        Err(e) => {
            warn!(log, "pool destroy {}: {}", t.name, e);
            Err(TiError::ZfsPoolReleaseFailed)
        }
    }
}

/*
 * ---------------------------------------------------------------------
 * ZFS file systems
 */

#[derive(Debug, Clone)]
struct FsAttrs {
    pool: String,
    names: Vec<String>,
    properties: Vec<Vec<(String, String)>>,
}

fn property_sets(
    core: &Core,
    a: &AttrSet,
    attr: &str,
    n: usize,
    e: TiError,
) -> Result<Vec<Vec<(String, String)>>, TiError> {
    let mut out = vec![Vec::new(); n];

    let sets = match a.get_set_array(attr) {
        Ok(s) => s,
        Err(_) => return Ok(out),
    };
    check_len(core, attr, sets.len(), n, e)?;

    for (i, set) in sets.iter().enumerate() {
        let names = set.get_text_array("zfs.prop.names").map_err(|err| {
            warn!(core.log(), "bad attribute set: {}", err);
            e
        })?;
        let values = set.get_text_array("zfs.prop.values").map_err(|err| {
            warn!(core.log(), "bad attribute set: {}", err);
            e
        })?;
        if names.len() != values.len() {
            warn!(core.log(), "zfs.prop.names and zfs.prop.values differ \
                in length");
            return Err(e);
        }
        out[i] = names
            .iter()
            .cloned()
            .zip(values.iter().cloned())
            .collect();
    }

    Ok(out)
}

fn fs_attrs(core: &Core, a: &AttrSet) -> Result<FsAttrs, TiError> {
    const E: TiError = TiError::InvalidZfsFsAttr;

    let pool = req_text(core, a, "zfs.fs.pool-name", E)?;
    let names = a.get_text_array("zfs.fs.names").map_err(|err| {
        warn!(core.log(), "bad attribute set: {}", err);
        E
    })?;
    if names.is_empty() {
        warn!(core.log(), "zfs.fs.names is empty");
        return Err(E);
    }

    if a.contains("zfs.fs.fs-num") {
        let n = req_count(core, a, "zfs.fs.fs-num", E)?;
        check_len(core, "zfs.fs.names", names.len(), n, E)?;
    }

    let properties =
        property_sets(core, a, "zfs.fs.properties", names.len(), E)?;

    Ok(FsAttrs { pool, names: names.to_vec(), properties })
}

fn create_fs(core: &Core, t: &FsAttrs) -> Result<(), TiError> {
    let log = core.log();

    for (name, props) in t.names.iter().zip(t.properties.iter()) {
        let ds = format!("{}/{}", t.pool, name);

        match zfs::dataset_exists(core, &ds) {
            Ok(true) => {
                info!(log, "dataset {} already exists", ds);
            }
            Ok(false) => {
                if let Err(e) = zfs::dataset_create(core, &ds, true) {
                    warn!(log, "dataset create {}: {}", ds, e);
                    return Err(TiError::ZfsFsCreateFailed);
                }
            }
            Err(e) => {
                warn!(log, "cannot probe for dataset {}: {}", ds, e);
                return Err(TiError::ZfsFsCreateFailed);
            }
        }

        for (pn, pv) in props.iter() {
            if zfs::zfs_set(core, &ds, pn, pv).is_err() {
                return Err(TiError::ZfsSetPropFailed);
            }
        }
    }

    Ok(())
}

fn release_fs(core: &Core, t: &FsAttrs) -> Result<(), TiError> {
    let log = core.log();
    let mut failed = false;

    for name in t.names.iter().rev() {
        let ds = format!("{}/{}", t.pool, name);
        if let Err(e) = zfs::dataset_destroy(core, &ds) {
            warn!(log, "dataset destroy {}: {}", ds, e);
            failed = true;
        }
    }

    if failed {
        Err(TiError::ZfsPoolReleaseFailed)
    } else {
        Ok(())
    }
}

/*
 * ---------------------------------------------------------------------
 * ZFS volumes
 */

#[derive(Debug, Clone)]
struct VolDef {
    name: String,
    size_mb: u64,
    vtype: u8,
    props: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
struct VolAttrs {
    pool: String,
    vols: Vec<VolDef>,
}

fn vol_attrs(core: &Core, a: &AttrSet) -> Result<VolAttrs, TiError> {
    const E: TiError = TiError::InvalidZfsVolAttr;

    let pool = req_text(core, a, "zfs.vol.pool-name", E)?;
    let names = a.get_text_array("zfs.vol.names").map_err(|err| {
        warn!(core.log(), "bad attribute set: {}", err);
        E
    })?;
    if names.is_empty() {
        warn!(core.log(), "zfs.vol.names is empty");
        return Err(E);
    }
    let n = names.len();

    if a.contains("zfs.vol.vol-num") {
        let c = req_count(core, a, "zfs.vol.vol-num", E)?;
        check_len(core, "zfs.vol.names", n, c, E)?;
    }

    let sizes = a.get_uint32_array("zfs.vol.sizes-mb").map_err(|err| {
        warn!(core.log(), "bad attribute set: {}", err);
        E
    })?;
    check_len(core, "zfs.vol.sizes-mb", sizes.len(), n, E)?;

    let types = match a.get_uint8_array("zfs.vol.types") {
        Ok(t) => {
            check_len(core, "zfs.vol.types", t.len(), n, E)?;
            t.to_vec()
        }
        Err(_) => vec![VOL_TYPE_GENERIC; n],
    };
    for t in types.iter() {
        if *t > VOL_TYPE_DUMP {
            warn!(core.log(), "zfs.vol.types value {} unknown", t);
            return Err(E);
        }
    }

    let properties = property_sets(core, a, "zfs.vol.properties", n, E)?;

    let vols = names
        .iter()
        .enumerate()
        .map(|(i, name)| VolDef {
            name: name.clone(),
            size_mb: sizes[i] as u64,
            vtype: types[i],
            props: properties[i].clone(),
        })
        .collect();

    Ok(VolAttrs { pool, vols })
}

fn pagesize() -> u64 {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as u64
    } else {
        4096
    }
}

fn create_vol(core: &Core, t: &VolAttrs) -> Result<(), TiError> {
    let log = core.log();

    for v in t.vols.iter() {
        let blocksize = match v.vtype {
            VOL_TYPE_SWAP => Some(format!("{}", pagesize())),
            VOL_TYPE_DUMP => Some("131072".to_string()),
            _ => None,
        };

        if let Err(e) = zfs::zvol_create(core, &t.pool, &v.name,
            v.size_mb, blocksize.as_deref())
        {
            warn!(log, "volume create {}/{}: {}", t.pool, v.name, e);
            return Err(TiError::ZfsVolCreateFailed);
        }

        for (pn, pv) in v.props.iter() {
            let ds = format!("{}/{}", t.pool, v.name);
            if zfs::zfs_set(core, &ds, pn, pv).is_err() {
                return Err(TiError::ZfsSetPropFailed);
            }
        }

        /*
         * Swap and dump registration failures leave a usable volume
         * behind, so they do not fail the operation.
         */
        let zdev = disk::zvol_block(&t.pool, &v.name);
        match v.vtype {
            VOL_TYPE_SWAP => {
                if let Err(e) = run::run(core, &[SWAP, "-a", &zdev]) {
                    warn!(log, "swap -a {}: {}", zdev, e);
                }
            }
            VOL_TYPE_DUMP => {
                if let Err(e) =
                    run::run(core, &[DUMPADM, "-n", "-d", &zdev])
                {
                    warn!(log, "dumpadm -d {}: {}", zdev, e);
                }
            }
            _ => (),
        }
    }

    Ok(())
}

fn release_vol(core: &Core, t: &VolAttrs) -> Result<(), TiError> {
    let log = core.log();
    let mut failed = false;

    let active_swap = run::capture_string(core, &[SWAP, "-l"])
        .map(|s| parse_swap_l(&s))
        .unwrap_or_default();

    for v in t.vols.iter().rev() {
        let zdev = disk::zvol_block(&t.pool, &v.name);

        if v.vtype == VOL_TYPE_SWAP && active_swap.contains(&zdev) {
            if let Err(e) = run::run(core, &[SWAP, "-d", &zdev]) {
                warn!(log, "swap -d {}: {}", zdev, e);
            }
        }

        let ds = format!("{}/{}", t.pool, v.name);
        if let Err(e) = zfs::dataset_destroy(core, &ds) {
            warn!(log, "volume destroy {}: {}", ds, e);
            failed = true;
        }
    }

    if failed {
        Err(TiError::ZfsPoolReleaseFailed)
    } else {
        Ok(())
    }
}

/*
 * ---------------------------------------------------------------------
 * Boot environment
 */

#[derive(Debug, Clone)]
struct BeAttrs {
    name: String,
    rpool: String,
    fs_names: Vec<String>,
    shared_fs_names: Vec<String>,
}

fn be_attrs(core: &Core, a: &AttrSet) -> Result<BeAttrs, TiError> {
    const E: TiError = TiError::InvalidBeAttr;

    let name = req_text(core, a, "be.name", E)?;
    let rpool = req_text(core, a, "be.rpool-name", E)?;
    if rpool.contains('/') || rpool.contains('@') {
        warn!(core.log(), "be.rpool-name {:?} is not a pool name", rpool);
        return Err(E);
    }

    let fs_names = a
        .get_text_array("be.fs-names")
        .map(|v| v.to_vec())
        .unwrap_or_default();
    let shared_fs_names = a
        .get_text_array("be.shared-fs-names")
        .map(|v| v.to_vec())
        .unwrap_or_default();

    Ok(BeAttrs { name, rpool, fs_names, shared_fs_names })
}

fn be_dataset(t: &BeAttrs) -> String {
    format!("{}/ROOT/{}", t.rpool, t.name)
}

fn create_be(core: &Core, t: &BeAttrs) -> Result<(), TiError> {
    let log = core.log();

    match zfs::pool_exists(core, &t.rpool) {
        Ok(true) => (),
        Ok(false) => {
            warn!(log, "pool {} does not exist; a boot environment \
                needs an existing root pool", t.rpool);
            return Err(TiError::BeCreateFailed);
        }
        Err(e) => {
            warn!(log, "cannot probe for pool {}: {}", t.rpool, e);
            return Err(TiError::BeCreateFailed);
        }
    }

    /*
     * The BE container dataset:
     */
    let rootds = format!("{}/ROOT", t.rpool);
    let be_step = |r: anyhow::Result<()>| -> Result<(), TiError> {
        match r {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(log, "boot environment setup: {}", e);
                Err(TiError::BeCreateFailed)
            }
        }
    };

    match zfs::dataset_exists(core, &rootds) {
        Ok(true) => (),
        Ok(false) => {
            be_step(zfs::dataset_create(core, &rootds, false))?;
            be_step(zfs::zfs_set(core, &rootds, "canmount", "off"))?;
            be_step(zfs::zfs_set(core, &rootds, "mountpoint", "legacy"))?;
        }
        Err(e) => {
            warn!(log, "cannot probe for dataset {}: {}", rootds, e);
            return Err(TiError::BeCreateFailed);
        }
    }

    /*
     * The BE itself:
     */
    let beds = be_dataset(t);
    be_step(zfs::dataset_create(core, &beds, false))?;
    be_step(zfs::zfs_set(core, &beds, "canmount", "noauto"))?;
    be_step(zfs::zfs_set(core, &beds, "mountpoint", "legacy"))?;

    let uuid = Uuid::new_v4().to_hyphenated().to_string();
    info!(log, "boot environment UUID: {}", uuid);
    be_step(zfs::zfs_set(core, &beds, "org.opensolaris.libbe:uuid",
        &uuid))?;
    be_step(zfs::zfs_set(core, &beds, "org.opensolaris.libbe:policy",
        "static"))?;

    for f in t.fs_names.iter() {
        let ds = format!("{}/{}", beds, f);
        be_step(zfs::dataset_create(core, &ds, true))?;
        be_step(zfs::zfs_set(core, &ds, "canmount", "noauto"))?;
        be_step(zfs::zfs_set(core, &ds, "mountpoint", "legacy"))?;
    }

    /*
     * Mount the BE at the alternate root:
     */
    if run::run(core, &[MKDIR, "-p", ALT_ROOT]).is_err() {
        return Err(TiError::BeMountFailed);
    }
    if run::run(core, &[MOUNT, "-F", "zfs", &beds, ALT_ROOT]).is_err() {
        return Err(TiError::BeMountFailed);
    }

    for f in t.fs_names.iter() {
        let ds = format!("{}/{}", beds, f);
        let mp = format!("{}/{}", ALT_ROOT, f);
        if run::run(core, &[MKDIR, "-p", &mp]).is_err() {
            return Err(TiError::BeMountFailed);
        }
        if run::run(core, &[MOUNT, "-F", "zfs", &ds, &mp]).is_err() {
            return Err(TiError::BeMountFailed);
        }
    }

    /*
     * Shared file systems live outside the BE and mount underneath its
     * mountpoint:
     */
    for s in t.shared_fs_names.iter() {
        let ds = format!("{}/{}", t.rpool, s);
        match zfs::dataset_exists(core, &ds) {
            Ok(true) => (),
            Ok(false) => be_step(zfs::dataset_create(core, &ds, true))?,
            Err(e) => {
                warn!(log, "cannot probe for dataset {}: {}", ds, e);
                return Err(TiError::BeCreateFailed);
            }
        }

        let mp = format!("{}/{}", ALT_ROOT, s);
        if zfs::zfs_set(core, &ds, "mountpoint", &mp).is_err() {
            return Err(TiError::BeMountFailed);
        }
        if zfs::zfs_mount(core, &ds).is_err() {
            return Err(TiError::BeMountFailed);
        }
    }

    Ok(())
}

fn release_be(core: &Core, t: &BeAttrs) -> Result<(), TiError> {
    let log = core.log();
    let beds = be_dataset(t);

    for s in t.shared_fs_names.iter().rev() {
        let ds = format!("{}/{}", t.rpool, s);
        let _ = zfs::zfs_unmount(core, &ds);
    }

    for f in t.fs_names.iter().rev() {
        let mp = format!("{}/{}", ALT_ROOT, f);
        if run::run(core, &[UMOUNT, &mp]).is_err() {
            warn!(log, "could not unmount {}", mp);
        }
    }

    if run::run(core, &[UMOUNT, ALT_ROOT]).is_err() {
        warn!(log, "could not unmount {}", ALT_ROOT);
    }

    match zfs::dataset_destroy(core, &beds) {
        Ok(_) => Ok(()),
        Err(e) => {
            warn!(log, "boot environment destroy {}: {}", beds, e);
            Err(TiError::ZfsPoolReleaseFailed)
        }
    }
}

/*
 * ---------------------------------------------------------------------
 * Ramdisk and directory
 */

#[derive(Debug, Clone)]
struct RamdiskAttrs {
    path: String,
    size_mb: u64,
    mountpoint: String,
}

fn ramdisk_attrs(core: &Core, a: &AttrSet) -> Result<RamdiskAttrs, TiError> {
    const E: TiError = TiError::InvalidRamdiskAttr;

    let path = req_text(core, a, "ramdisk.path", E)?;
    let mountpoint = req_text(core, a, "ramdisk.mountpoint", E)?;
    let size_mb = match a.get_uint32("ramdisk.size-mb") {
        Ok(v) if v > 0 => v as u64,
        Ok(_) => {
            warn!(core.log(), "ramdisk.size-mb must be nonzero");
            return Err(E);
        }
        Err(err) => {
            warn!(core.log(), "bad attribute set: {}", err);
            return Err(E);
        }
    };

    if !path.starts_with('/') || !mountpoint.starts_with('/') {
        warn!(core.log(), "ramdisk paths must be fully qualified");
        return Err(E);
    }

    Ok(RamdiskAttrs { path, size_mb, mountpoint })
}

fn lofi_device_of(core: &Core, path: &str) -> Option<String> {
    let out = run::capture_string(core, &[LOFIADM, path]).ok()?;
    let dev = out.trim().to_string();
    if dev.starts_with("/dev/lofi/") {
        Some(dev)
    } else {
        None
    }
}

fn create_ramdisk(core: &Core, t: &RamdiskAttrs) -> Result<(), TiError> {
    let log = core.log();

    let size = format!("{}m", t.size_mb);
    if run::run(core, &[MKFILE, "-n", &size, &t.path]).is_err() {
        return Err(TiError::RamdiskMkfileFailed);
    }

    let dev = match run::run_output(core, &[LOFIADM, "-a", &t.path]) {
        Ok(Some(out)) if out.status.success() => {
            String::from_utf8_lossy(&out.stdout).trim().to_string()
        }
        Ok(Some(_)) | Err(_) => {
            warn!(log, "could not attach {} to lofi", t.path);
            return Err(TiError::RamdiskLofiadmFailed);
        }
        Ok(None) => {
            /*
             * Dry run; stand-in device for the remaining (also skipped)
             * steps.
             */
            "/dev/lofi/1".to_string()
        }
    };

    info!(log, "ramdisk lofi device: {}", dev);

    let rdev = dev.replacen("/lofi/", "/rlofi/", 1);
    if run::run(core, &[NEWFS, &rdev]).is_err() {
        return Err(TiError::NewfsFailed);
    }

    if run::run(core, &[MKDIR, "-p", &t.mountpoint]).is_err() {
        return Err(TiError::MkdirFailed);
    }

    if run::run(core,
        &[MOUNT, "-F", "ufs", "-o", "nologging", &dev, &t.mountpoint])
        .is_err()
    {
        return Err(TiError::MountFailed);
    }

    Ok(())
}

fn release_ramdisk(core: &Core, t: &RamdiskAttrs) -> Result<(), TiError> {
    let log = core.log();

    if run::run(core, &[UMOUNT, &t.mountpoint]).is_err() {
        return Err(TiError::UnmountFailed);
    }

    if let Some(dev) = lofi_device_of(core, &t.path) {
        if run::run(core, &[LOFIADM, "-d", &dev]).is_err() {
            return Err(TiError::RamdiskLofiadmFailed);
        }
    }

    if !core.dry_run() {
        if let Err(e) = std::fs::remove_file(&t.path) {
            warn!(log, "could not remove {}: {}", t.path, e);
        }
    }

    if run::run(core, &[RMDIR, &t.mountpoint]).is_err() {
        return Err(TiError::RmdirFailed);
    }

    Ok(())
}

#[derive(Debug, Clone)]
struct DirectoryAttrs {
    path: String,
}

fn directory_attrs(core: &Core, a: &AttrSet)
    -> Result<DirectoryAttrs, TiError>
{
    const E: TiError = TiError::InvalidDirectoryAttr;

    let path = req_text(core, a, "directory.path", E)?;
    if !path.starts_with('/') {
        warn!(core.log(), "directory.path must be fully qualified");
        return Err(E);
    }

    Ok(DirectoryAttrs { path })
}

fn create_directory(core: &Core, t: &DirectoryAttrs)
    -> Result<(), TiError>
{
    if run::run(core, &[MKDIR, "-p", &t.path]).is_err() {
        return Err(TiError::MkdirFailed);
    }
    Ok(())
}

fn release_directory(core: &Core, t: &DirectoryAttrs)
    -> Result<(), TiError>
{
    if run::run(core, &[RMDIR, &t.path]).is_err() {
        return Err(TiError::RmdirFailed);
    }
    Ok(())
}
