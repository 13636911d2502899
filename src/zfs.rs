/*
 * Copyright 2024 Oxide Computer Company
 */

/*!
 * Wrappers for zpool(1M) and zfs(1M).  Existence probes distinguish
 * "does not exist" from real failure by the tail of the child's stderr,
 * so discovery and idempotent creation do not need a separate listing
 * pass.
 */

use anyhow::{bail, Result};
use slog::info;

use crate::run::{self, OutputExt};
use crate::Core;

const ZFS: &str = "/sbin/zfs";
const ZPOOL: &str = "/sbin/zpool";

pub fn dataset_exists(core: &Core, dataset: &str) -> Result<bool> {
    if dataset.contains('@') {
        bail!("no @ allowed here");
    }

    let out = run::capture(core, &[ZFS, "list", "-Ho", "name", dataset])?;

    if !out.status.success() {
        let errmsg = String::from_utf8_lossy(&out.stderr);
        if errmsg.trim().ends_with("dataset does not exist") {
            return Ok(false);
        }
        bail!("zfs list failed: {}", out.info());
    }

    Ok(true)
}

pub fn dataset_create(core: &Core, dataset: &str, parents: bool)
    -> Result<()>
{
    if dataset.contains('@') {
        bail!("no @ allowed here");
    }

    info!(core.log(), "CREATE DATASET: {}", dataset);

    if parents {
        run::run(core, &[ZFS, "create", "-p", dataset])
    } else {
        run::run(core, &[ZFS, "create", dataset])
    }
}

pub fn dataset_destroy(core: &Core, dataset: &str) -> Result<bool> {
    if dataset.contains('@') {
        bail!("no @ allowed here");
    }

    info!(core.log(), "DESTROY DATASET: {}", dataset);

    let out =
        match run::run_output(core, &[ZFS, "destroy", "-r", dataset])? {
            Some(out) => out,
            None => return Ok(true),
        };

    if !out.status.success() {
        let errmsg = String::from_utf8_lossy(&out.stderr);
        if errmsg.trim().ends_with("dataset does not exist") {
            return Ok(false);
        }
        bail!("zfs destroy failed: {}", out.info());
    }

    Ok(true)
}

pub fn zfs_set(core: &Core, dataset: &str, n: &str, v: &str) -> Result<()> {
    info!(core.log(), "SET DATASET PROPERTY ON {}: {} = {}", dataset, n, v);

    run::run(core, &[ZFS, "set", &format!("{}={}", n, v), dataset])
}

pub fn zfs_get(core: &Core, dataset: &str, n: &str) -> Result<String> {
    run::capture_string(
        core,
        &[ZFS, "get", "-H", "-o", "value", n, dataset],
    )
}

pub fn zfs_mount(core: &Core, dataset: &str) -> Result<()> {
    run::run(core, &[ZFS, "mount", dataset])
}

pub fn zfs_unmount(core: &Core, dataset: &str) -> Result<()> {
    run::run(core, &[ZFS, "unmount", dataset])
}

pub fn zvol_create(
    core: &Core,
    pool: &str,
    name: &str,
    size_mb: u64,
    volblocksize: Option<&str>,
) -> Result<()> {
    let volume = format!("{}/{}", pool, name);
    let size = format!("{}m", size_mb);

    info!(core.log(), "CREATE VOLUME ({}MB): {}", size_mb, volume);

    if let Some(bs) = volblocksize {
        run::run(core, &[ZFS, "create", "-p", "-b", bs, "-V", &size, &volume])
    } else {
        run::run(core, &[ZFS, "create", "-p", "-V", &size, &volume])
    }
}

pub fn pool_exists(core: &Core, name: &str) -> Result<bool> {
    if name.contains('/') || name.contains('@') {
        bail!("no / or @ allowed here");
    }

    let out = run::capture(core, &[ZPOOL, "list", "-Ho", "name", name])?;

    if !out.status.success() {
        let errmsg = String::from_utf8_lossy(&out.stderr);
        if errmsg.trim().ends_with("no such pool") {
            return Ok(false);
        }
        bail!("zpool list failed: {}", out.info());
    }

    Ok(true)
}

pub fn pool_create(core: &Core, name: &str, device: &str) -> Result<()> {
    if name.contains('/') || name.contains('@') {
        bail!("no / or @ allowed here");
    }

    info!(core.log(), "CREATE POOL: {} ON {}", name, device);

    run::run(core, &[ZPOOL, "create", "-f", name, device])
}

pub fn pool_destroy(core: &Core, name: &str) -> Result<bool> {
    if name.contains('/') || name.contains('@') {
        bail!("no / or @ allowed here");
    }

    info!(core.log(), "DESTROY POOL: {}", name);

    let out = match run::run_output(core, &[ZPOOL, "destroy", "-f", name])? {
        Some(out) => out,
        None => return Ok(true),
    };

    if !out.status.success() {
        let errmsg = String::from_utf8_lossy(&out.stderr);
        if errmsg.trim().ends_with("no such pool") {
            return Ok(false);
        }
        bail!("zpool destroy failed: {}", out.info());
    }

    Ok(true)
}

pub fn pool_mountpoint(core: &Core, name: &str) -> Result<String> {
    zfs_get(core, name, "mountpoint")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_core;

    #[test]
    fn name_guards() {
        let core = test_core();
        core.set_dry_run(true);

        assert!(dataset_create(&core, "rpool/a@snap", false).is_err());
        assert!(dataset_destroy(&core, "rpool/a@snap").is_err());
        assert!(pool_create(&core, "rpool/nested", "c0t0d0s0").is_err());
        assert!(pool_destroy(&core, "bad@pool").is_err());
    }

    #[test]
    fn dry_run_mutations_succeed() {
        let core = test_core();
        core.set_dry_run(true);

        dataset_create(&core, "rpool/ROOT/test", true).unwrap();
        zfs_set(&core, "rpool/ROOT/test", "canmount", "noauto").unwrap();
        zvol_create(&core, "rpool", "swap", 2048, Some("4096")).unwrap();
        pool_create(&core, "rpool", "c0t0d0s0").unwrap();
        assert!(pool_destroy(&core, "rpool").unwrap());
        assert!(dataset_destroy(&core, "rpool/ROOT/test").unwrap());
    }
}
