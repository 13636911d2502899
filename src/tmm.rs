/*
 * Copyright 2024 Oxide Computer Company
 */

/*!
 * The target mount manager: attaching a discovered root and the file
 * systems named by its vfstab underneath the alternate root, with fsck
 * policy, a retry queue for entries whose dependencies mount later, SVM
 * mirror detection, swap activation, and strict LIFO teardown.
 */

use std::ffi::CString;
use std::path::Path;

use slog::{info, warn};

use crate::attr::AttrSet;
use crate::errors::TmmError;
use crate::run;
use crate::vfstab::{self, VfstabEntry};
use crate::{disk, mnttab, svm, Core, ALT_ROOT};

const MOUNT: &str = "/sbin/mount";
const UMOUNT: &str = "/sbin/umount";
const FSCK: &str = "/usr/sbin/fsck";
const SWAP: &str = "/usr/sbin/swap";
const ZONEADM: &str = "/usr/sbin/zoneadm";
const MKDIR: &str = "/usr/bin/mkdir";

/**
 * A file system we mounted, as recorded for teardown.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedFs {
    pub special: String,
    pub mountpoint: String,
    pub fstype: String,
}

#[derive(Debug, Clone)]
struct DeferredMount {
    blockdev: String,
    mountpoint: String,
    fstype: String,
    opts: Option<String>,
}

/**
 * The mount manager's in-process state, owned by the Core and guarded by
 * its mutex.  Teardown walks each list in reverse of execution order.
 */
#[derive(Debug, Default)]
pub struct TmmState {
    mounts: Vec<MountedFs>,
    swaps: Vec<String>,
    zones: Vec<String>,
    deferred: Vec<DeferredMount>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    NoRetries,
    DoRetries,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FsckStatus {
    Clean,
    Dirty,
    AlreadyMounted,
    Unknown(i32),
}

/*
 * fsck -m exit statuses for the file system types we handle:
 */
fn classify_fsck(code: i32) -> FsckStatus {
    match code {
        0 => FsckStatus::Clean,
        32 => FsckStatus::Dirty,
        33 => FsckStatus::AlreadyMounted,
        n => FsckStatus::Unknown(n),
    }
}

fn dev_of(path: &str) -> Option<(u64, u64)> {
    let cname = CString::new(path.to_string()).ok()?;
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::stat(cname.as_ptr(), &mut st) } != 0 {
        return None;
    }
    Some((st.st_dev as u64, st.st_rdev as u64))
}

/**
 * List the file systems currently attached by the mount manager, oldest
 * first.
 */
pub fn mounted(core: &Core) -> Vec<MountedFs> {
    core.tmm_state().mounts.clone()
}

/**
 * List the swap devices added by the mount manager, oldest first.
 */
pub fn swaps(core: &Core) -> Vec<String> {
    core.tmm_state().swaps.clone()
}

fn record_mount(core: &Core, special: &str, mountpoint: &str, fstype: &str) {
    core.tmm_state().mounts.push(MountedFs {
        special: special.to_string(),
        mountpoint: mountpoint.to_string(),
        fstype: fstype.to_string(),
    });
}

fn mount_args<'a>(
    blockdev: &'a str,
    mountpoint: &'a str,
    fstype: &'a str,
    opts: &'a Option<String>,
) -> Vec<&'a str> {
    let mut args = vec![MOUNT, "-F", fstype];
    if let Some(o) = opts.as_deref() {
        args.push("-o");
        args.push(o);
    }
    args.push(blockdev);
    args.push(mountpoint);
    args
}

fn attempt_mount(
    core: &Core,
    blockdev: &str,
    mountpoint: &str,
    fstype: &str,
    opts: &Option<String>,
) -> bool {
    let args = mount_args(blockdev, mountpoint, fstype, opts);
    match run::run(core, &args) {
        Ok(()) => {
            record_mount(core, blockdev, mountpoint, fstype);
            true
        }
        Err(e) => {
            warn!(core.log(), "mount {} at {}: {}", blockdev, mountpoint, e);
            false
        }
    }
}

/**
 * Mount one file system, deciding cleanliness with fsck -m first.  A
 * dirty UFS file system is preened (fsck -o p); other types get fsck -y.
 * A device that is already mounted counts as success if the existing
 * mount really is the same device.  A mount failure under DoRetries is
 * queued rather than reported; the queue is drained by
 * mount_and_add_swap().
 */
pub fn mount_filesys(
    core: &Core,
    blockdev: &str,
    rawdev: &str,
    mountpoint: &str,
    fstype: &str,
    opts: Option<&str>,
    retry: RetryPolicy,
) -> Result<(), TmmError> {
    let log = core.log();
    let opts = opts.map(str::to_string);

    if run::run(core, &[MKDIR, "-p", mountpoint]).is_err() {
        return Err(TmmError::ErrMountFail);
    }

    let out = match run::capture(core, &[FSCK, "-F", fstype, "-m", rawdev]) {
        Ok(out) => out,
        Err(e) => {
            warn!(log, "fsck -m {}: {}", rawdev, e);
            return Err(TmmError::ErrFsckFailure);
        }
    };

    match classify_fsck(out.status.code().unwrap_or(-1)) {
        FsckStatus::Clean => (),
        FsckStatus::Dirty => {
            info!(log, "{} needs checking; running fsck", rawdev);
            let r = if fstype == "ufs" {
                run::run(core, &[FSCK, "-F", fstype, "-o", "p", rawdev])
            } else {
                run::run(core, &[FSCK, "-F", fstype, "-y", rawdev])
            };
            if let Err(e) = r {
                warn!(log, "fsck {}: {}", rawdev, e);
                return Err(TmmError::ErrFsckFailure);
            }
        }
        FsckStatus::AlreadyMounted => {
            /*
             * Succeed only if what is mounted is really this device.
             */
            let m = mnttab::mounts().unwrap_or_default();
            if let Some(ent) = mnttab::mount_of(&m, blockdev) {
                let mounted = dev_of(&ent.mount_point).map(|(d, _)| d);
                let want = dev_of(blockdev).map(|(_, r)| r);
                if mounted.is_some() && mounted == want {
                    info!(log, "{} already mounted at {}", blockdev,
                        ent.mount_point);
                    return Ok(());
                }
            }
            warn!(log, "{} busy under a different mount", blockdev);
            return Err(TmmError::ErrMountFail);
        }
        FsckStatus::Unknown(n) => {
            warn!(log, "fsck -m {} returned {}; manual fsck required",
                rawdev, n);
            return Err(TmmError::ErrMustManualFsck);
        }
    }

    if attempt_mount(core, blockdev, mountpoint, fstype, &opts) {
        return Ok(());
    }

    match retry {
        RetryPolicy::DoRetries => {
            info!(log, "queueing {} for mount retry", blockdev);
            core.tmm_state().deferred.push(DeferredMount {
                blockdev: blockdev.to_string(),
                mountpoint: mountpoint.to_string(),
                fstype: fstype.to_string(),
                opts,
            });
            Ok(())
        }
        RetryPolicy::NoRetries => Err(TmmError::ErrMountFail),
    }
}

/**
 * Re-attempt queued work until the queue empties or a full pass makes no
 * progress, in which case the first queued entry's error is returned.
 * No ordering is imposed beyond progress-or-failure.
 */
fn retry_until_quiescent<T>(
    queue: &mut Vec<T>,
    mut attempt: impl FnMut(&T) -> bool,
    err: TmmError,
) -> Result<(), TmmError> {
    loop {
        if queue.is_empty() {
            return Ok(());
        }

        let before = queue.len();
        queue.retain(|e| !attempt(e));
        if queue.len() == before {
            return Err(err);
        }
    }
}

fn drain_deferred(core: &Core) -> Result<(), TmmError> {
    let mut queue = std::mem::take(&mut core.tmm_state().deferred);

    retry_until_quiescent(
        &mut queue,
        |d| attempt_mount(core, &d.blockdev, &d.mountpoint, &d.fstype,
            &d.opts),
        TmmError::ErrMountFail,
    )
}

/*
 * The subset of vfstab entries that mount_and_add_swap acts on: file
 * systems we can mount under the alternate root, and swap devices.  The
 * root entry is excluded (the root is mounted before the vfstab can be
 * read) and so are read-only entries, which cannot be upgraded in place.
 */
pub(crate) fn plan_vfstab(
    entries: &[VfstabEntry],
) -> Result<(Vec<(String, Option<String>, String, String, Option<String>)>,
    Vec<String>), TmmError>
{
    let mut mounts = Vec::new();
    let mut swaps = Vec::new();

    for e in entries.iter() {
        if e.is_swap() {
            if let Some(sp) = &e.special {
                swaps.push(sp.clone());
            }
            continue;
        }

        if !e.is_mountable_fs() || !e.at_boot() || e.is_read_only() {
            continue;
        }

        let mp = match &e.mount_point {
            Some(mp) if mp == "/" => continue,
            Some(mp) => mp.clone(),
            None => return Err(TmmError::ErrMountFail),
        };
        let sp = match &e.special {
            Some(sp) => sp.clone(),
            None => return Err(TmmError::ErrMountFail),
        };
        let fstype = match &e.fstype {
            Some(t) => t.clone(),
            None => return Err(TmmError::ErrMountFail),
        };

        mounts.push((sp, e.fsckdev.clone(), mp, fstype,
            e.mount_options.clone()));
    }

    Ok((mounts, swaps))
}

fn swap_add(core: &Core, device: &str) -> Result<(), TmmError> {
    if let Err(e) = run::run(core, &[SWAP, "-a", device]) {
        warn!(core.log(), "swap -a {}: {}", device, e);
        return Err(TmmError::ErrAddSwap);
    }
    core.tmm_state().swaps.push(device.to_string());
    Ok(())
}

fn mount_zones(core: &Core, altroot: &str) -> Result<(), TmmError> {
    let out = match run::capture(core,
        &[ZONEADM, "-R", altroot, "list", "-pi"])
    {
        Ok(out) if out.status.success() => out,
        _ => {
            /*
             * No zone support on this image.
             */
            return Ok(());
        }
    };

    let listing = String::from_utf8_lossy(&out.stdout).to_string();
    for l in listing.lines() {
        let f: Vec<&str> = l.split(':').collect();
        if f.len() < 3 || f[1] == "global" || f[2] != "installed" {
            continue;
        }

        let zone = f[1].to_string();
        if run::run(core, &[ZONEADM, "-R", altroot, "-z", &zone, "mount"])
            .is_err()
        {
            warn!(core.log(), "could not mount zone {}", zone);
            return Err(TmmError::ErrZoneMountFail);
        }
        core.tmm_state().zones.push(zone);
    }

    Ok(())
}

/**
 * Mount the root file system of a candidate slice read-only at the
 * alternate root, then mount every eligible vfstab entry and add every
 * swap device it names.  On success the mount and swap lists describe
 * exactly what was attached, in order.
 */
pub fn mount_and_add_swap(core: &Core, root_slice: &str)
    -> Result<(), TmmError>
{
    let log = core.log();

    /*
     * Discovery hands out root devices as full /dev/dsk paths; accept
     * either those or bare slice names.
     */
    let root_slice = root_slice.trim_start_matches("/dev/dsk/");

    let (disk_name, idx) = match disk::split_slice_name(root_slice) {
        Some(v) => v,
        None => {
            warn!(log, "bad root slice name: {:?}", root_slice);
            return Err(TmmError::ErrMountFail);
        }
    };

    let mut blockdev = disk::slice_block(disk_name, idx);
    let mut rawdev = disk::slice_raw(disk_name, idx);

    mount_filesys(core, &blockdev, &rawdev, ALT_ROOT, "ufs", Some("ro"),
        RetryPolicy::NoRetries)?;

    /*
     * If the root is really half of an SVM mirror, shift the mount onto
     * the metadevice before working from it.
     */
    let mut mdattrs = AttrSet::new();
    set_mntdev_if_svm(core, ALT_ROOT, Some("ro"), &mut blockdev,
        &mut rawdev, &mut mdattrs)?;

    let vfstab_path = format!("{}/etc/vfstab", ALT_ROOT);
    let data = match std::fs::read_to_string(&vfstab_path) {
        Ok(d) => d,
        Err(e) => {
            warn!(log, "could not open {}: {}", vfstab_path, e);
            return Err(TmmError::ErrOpeningVfstab);
        }
    };

    let entries = vfstab::parse_vfstab(&data)?;
    let (mounts, swapdevs) = plan_vfstab(&entries)?;

    for (sp, fsckdev, mp, fstype, opts) in mounts.iter() {
        let target = format!("{}{}", ALT_ROOT, mp);
        let raw = fsckdev.clone()
            .unwrap_or_else(|| sp.replace("/dev/dsk/", "/dev/rdsk/"));
        mount_filesys(core, sp, &raw, &target, fstype, opts.as_deref(),
            RetryPolicy::DoRetries)?;
    }

    drain_deferred(core)?;

    for dev in swapdevs.iter() {
        /*
         * Swap files live inside the tree we just mounted; devices are
         * named absolutely.
         */
        let dev = if dev.starts_with("/dev/") {
            dev.clone()
        } else {
            format!("{}{}", ALT_ROOT, dev)
        };
        swap_add(core, &dev)?;
    }

    mount_zones(core, ALT_ROOT)?;

    Ok(())
}

/**
 * After a candidate root has been mounted, check it for an SVM-mirrored
 * root.  When one is found the mount is shifted onto the metadevice, the
 * caller's device names are rewritten in place, and the mirror identity
 * is recorded in the supplied attribute set.  Returns whether a mirror
 * was found.
 */
pub fn set_mntdev_if_svm(
    core: &Core,
    mountpoint: &str,
    opts: Option<&str>,
    blockdev: &mut String,
    rawdev: &mut String,
    attrs: &mut AttrSet,
) -> Result<bool, TmmError> {
    let log = core.log();
    let root = Path::new(mountpoint);

    if !svm::has_state_db(root) {
        return Ok(false);
    }

    if let Err(e) = svm::start(core) {
        warn!(log, "SVM state database found but SVM not startable: {}", e);
        return Ok(false);
    }

    let config = match svm::read_config(core) {
        Ok(c) => c,
        Err(e) => {
            warn!(log, "could not read SVM configuration: {}", e);
            svm::stop(core);
            return Ok(false);
        }
    };

    let slice = blockdev.trim_start_matches("/dev/dsk/");
    let mirror = match svm::mirror_for_slice(&config, slice) {
        Some(m) => m,
        None => {
            svm::stop(core);
            return Ok(false);
        }
    };

    info!(log, "root on SVM mirror {} ({:?})", mirror.md_name,
        mirror.components);

    if run::run(core, &[UMOUNT, mountpoint]).is_err() {
        svm::stop(core);
        return Err(TmmError::ErrUmountFail);
    }

    let mdblock = mirror.block_path();
    let o = opts.map(str::to_string);
    if !attempt_mount(core, &mdblock, mountpoint, "ufs", &o) {
        svm::stop(core);
        return Err(TmmError::ErrMountFail);
    }

    /*
     * The previous mount record for this mountpoint now refers to the
     * metadevice.
     */
    {
        let mut st = core.tmm_state();
        let md = mdblock.clone();
        let mp = mountpoint.to_string();
        st.mounts.retain(|m| {
            !(m.mountpoint == mp && m.special != md)
        });
    }

    /*
     * Component names in the configuration are the target's own; record
     * them as the installer sees them.
     */
    let devdir = root.join("dev/dsk");
    let mut comps = Vec::new();
    for c in mirror.components.iter() {
        let mapped = crate::devmap::install_to_target_in(&devdir, c)
            .ok()
            .flatten()
            .and_then(|phys| {
                crate::devmap::target_to_install(core, &phys).ok().flatten()
            });
        comps.push(mapped.unwrap_or_else(|| c.clone()));
    }

    let _ = attrs.add_text("slice.md-name", &mirror.md_name);
    let _ = attrs.add_text_array("slice.md-components", comps);

    *blockdev = mdblock;
    *rawdev = mirror.raw_path();

    svm::stop(core);
    Ok(true)
}

/**
 * Unmount everything we mounted, zones first, newest mount first.  All
 * entries are attempted; the first failure is reported.
 */
pub fn umount_all(core: &Core) -> Result<(), TmmError> {
    let log = core.log();
    let mut first_err = None;

    let zones = {
        let mut st = core.tmm_state();
        std::mem::take(&mut st.zones)
    };
    for z in zones.iter().rev() {
        if run::run(core, &[ZONEADM, "-R", ALT_ROOT, "-z", z, "unmount"])
            .is_err()
        {
            warn!(log, "could not unmount zone {}", z);
            first_err.get_or_insert(TmmError::ErrUmountFail);
        }
    }

    let mounts = {
        let mut st = core.tmm_state();
        std::mem::take(&mut st.mounts)
    };
    for m in mounts.iter().rev() {
        if run::run(core, &[UMOUNT, &m.mountpoint]).is_err() {
            warn!(log, "could not unmount {}", m.mountpoint);
            first_err.get_or_insert(TmmError::ErrUmountFail);
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/**
 * Delete every swap device we added, newest first.
 */
pub fn unswap_all(core: &Core) -> Result<(), TmmError> {
    let log = core.log();
    let mut first_err = None;

    let swaps = {
        let mut st = core.tmm_state();
        std::mem::take(&mut st.swaps)
    };
    for dev in swaps.iter().rev() {
        if run::run(core, &[SWAP, "-d", dev]).is_err() {
            warn!(log, "could not delete swap {}", dev);
            first_err.get_or_insert(TmmError::ErrDeleteSwap);
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/**
 * Full teardown: unmount everything, then remove the swap we added.
 */
pub fn umount_and_delete_swap(core: &Core) -> Result<(), TmmError> {
    let um = umount_all(core);
    let us = unswap_all(core);
    um.and(us)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_core;

    #[test]
    fn fsck_classification() {
        assert_eq!(classify_fsck(0), FsckStatus::Clean);
        assert_eq!(classify_fsck(32), FsckStatus::Dirty);
        assert_eq!(classify_fsck(33), FsckStatus::AlreadyMounted);
        assert_eq!(classify_fsck(34), FsckStatus::Unknown(34));
        assert_eq!(classify_fsck(-1), FsckStatus::Unknown(-1));
    }

    #[test]
    fn retry_queue_reaches_quiescence() {
        /*
         * Entry "b" only succeeds once "a" has succeeded, and "c" only
         * once "b" has; the queue must converge without any dependency
         * analysis.
         */
        let mut done: Vec<char> = Vec::new();
        let mut queue = vec!['c', 'b', 'a'];

        let r = retry_until_quiescent(
            &mut queue,
            |e| {
                let ok = match e {
                    'a' => true,
                    'b' => done.contains(&'a'),
                    'c' => done.contains(&'b'),
                    _ => false,
                };
                if ok {
                    done.push(*e);
                }
                ok
            },
            TmmError::ErrMountFail,
        );
        assert!(r.is_ok());
        assert_eq!(done.len(), 3);
    }

    #[test]
    fn retry_queue_fails_without_progress() {
        let mut queue = vec!['x', 'y'];
        let r = retry_until_quiescent(
            &mut queue,
            |e| *e == 'y',
            TmmError::ErrMountFail,
        );
        assert_eq!(r.unwrap_err(), TmmError::ErrMountFail);
        assert_eq!(queue, vec!['x']);
    }

    #[test]
    fn vfstab_planning() {
        let entries = vfstab::parse_vfstab(
            "/dev/dsk/c0t0d0s0 /dev/rdsk/c0t0d0s0 / ufs 1 yes -\n\
             /dev/dsk/c0t0d0s6 /dev/rdsk/c0t0d0s6 /usr ufs 1 yes ro\n\
             /dev/dsk/c0t0d0s7 /dev/rdsk/c0t0d0s7 /export ufs 2 yes -\n\
             /dev/dsk/c0t0d0s5 /dev/rdsk/c0t0d0s5 /opt ufs 2 no -\n\
             /dev/dsk/c0t0d0s1 - - swap - no -\n\
             /swapfile - - swap - no -\n\
             swap - /tmp tmpfs - yes -\n",
        )
        .unwrap();

        let (mounts, swaps) = plan_vfstab(&entries).unwrap();

        /*
         * Only /export survives: the root is pre-mounted, /usr is
         * read-only, /opt is not mounted at boot, and tmpfs is not a
         * mountable target type.
         */
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].0, "/dev/dsk/c0t0d0s7");
        assert_eq!(mounts[0].2, "/export");

        assert_eq!(
            swaps,
            vec!["/dev/dsk/c0t0d0s1".to_string(), "/swapfile".to_string()]
        );
    }

    #[test]
    fn vfstab_planning_requires_fields() {
        let entries = vfstab::parse_vfstab(
            "/dev/dsk/c0t0d0s7 /dev/rdsk/c0t0d0s7 - ufs 2 yes -\n",
        )
        .unwrap();
        assert_eq!(
            plan_vfstab(&entries).unwrap_err(),
            TmmError::ErrMountFail
        );
    }

    #[test]
    fn teardown_is_lifo_and_clears_state() {
        let core = test_core();
        core.set_dry_run(true);

        record_mount(&core, "/dev/dsk/c0t0d0s0", "/a", "ufs");
        record_mount(&core, "/dev/dsk/c0t0d0s7", "/a/export", "ufs");
        core.tmm_state().swaps.push("/dev/dsk/c0t0d0s1".to_string());

        assert_eq!(mounted(&core).len(), 2);
        assert_eq!(swaps(&core).len(), 1);

        /*
         * Under dry-run the umount/swap commands are skipped but the
         * lists must still drain.
         */
        umount_and_delete_swap(&core).unwrap();
        assert!(mounted(&core).is_empty());
        assert!(swaps(&core).is_empty());
    }
}
