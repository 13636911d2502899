/*
 * Copyright 2024 Oxide Computer Company
 */

/*!
 * Solaris Volume Manager interrogation.  A root that lives on an SVM
 * mirror is detected by the state-database replica configuration on the
 * slice; once SVM is started, the mirror topology is read back from the
 * metastat concise listing.
 */

use std::path::Path;

use anyhow::Result;
use slog::{info, trace};

use crate::run;
use crate::Core;

const METASTAT: &str = "/usr/sbin/metastat";
const METAINIT: &str = "/usr/sbin/metainit";

/*
 * Replica configuration relative to a mounted root:
 */
const MDDB_CF: &str = "etc/lvm/mddb.cf";

/**
 * A mirrored metadevice and the physical slices underneath it.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorInfo {
    pub md_name: String,
    pub components: Vec<String>,
}

impl MirrorInfo {
    pub fn block_path(&self) -> String {
        format!("/dev/md/dsk/{}", self.md_name)
    }

    pub fn raw_path(&self) -> String {
        format!("/dev/md/rdsk/{}", self.md_name)
    }
}

/**
 * Whether a mounted root carries a state-database replica configuration,
 * i.e. whether SVM was in use on that root.
 */
pub fn has_state_db(root: &Path) -> bool {
    let p = root.join(MDDB_CF);
    match std::fs::read_to_string(&p) {
        Ok(data) => data
            .lines()
            .map(str::trim)
            .any(|l| !l.is_empty() && !l.starts_with('#')),
        Err(_) => false,
    }
}

/**
 * Start SVM from the state database replicas.  This is what boot does;
 * the configured metadevices become available under /dev/md.
 */
pub fn start(core: &Core) -> Result<()> {
    info!(core.log(), "starting SVM from state database");
    run::run(core, &[METAINIT, "-r"])
}

/**
 * There is no administrative command that undoes metainit -r short of
 * clearing the configuration, which would damage the target.  Leaving
 * the metadevices configured is harmless, so shutdown is advisory.
 */
pub fn stop(core: &Core) {
    trace!(core.log(), "leaving SVM metadevices configured");
}

/**
 * Read the current metadevice configuration.
 */
pub fn read_config(core: &Core) -> Result<String> {
    run::capture_string(core, &[METASTAT, "-p"])
}

/*
 * One line of metastat -p output, split into the metadevice name and the
 * remaining tokens.
 */
fn split_line(l: &str) -> Option<(&str, Vec<&str>)> {
    let mut it = l.split_whitespace();
    let name = it.next()?;
    if !name.starts_with('d') {
        return None;
    }
    Some((name, it.collect()))
}

/**
 * Find the mirror, if any, whose submirrors are built on the given
 * slice, and collect every physical slice component of that mirror.
 * Input is metastat -p output: mirrors read "dM -m dA dB ...", and
 * submirrors are stripes reading "dA rows cols c0t0d0s0 ...".
 */
pub fn mirror_for_slice(config: &str, slice: &str) -> Option<MirrorInfo> {
    let mut mirrors: Vec<(&str, Vec<&str>)> = Vec::new();
    let mut stripes: Vec<(&str, Vec<&str>)> = Vec::new();

    for l in config.lines() {
        let l = l.trim();
        if l.is_empty() || l.starts_with('#') {
            continue;
        }

        let (name, rest) = match split_line(l) {
            Some(v) => v,
            None => continue,
        };

        if rest.first() == Some(&"-m") {
            let subs = rest[1..]
                .iter()
                .take_while(|t| t.starts_with('d'))
                .copied()
                .collect::<Vec<_>>();
            mirrors.push((name, subs));
        } else if rest.first().map_or(false, |t| !t.starts_with('-')) {
            /*
             * A stripe; the slice components are picked out of it below.
             */
            stripes.push((name, rest));
        }
    }

    let components_of = |sub: &str| -> Vec<String> {
        stripes
            .iter()
            .filter(|(n, _)| *n == sub)
            .flat_map(|(_, rest)| {
                rest.iter()
                    .filter(|t| crate::disk::split_slice_name(t).is_some())
                    .map(|t| t.to_string())
            })
            .collect()
    };

    for (md, subs) in mirrors.iter() {
        let comps: Vec<String> =
            subs.iter().flat_map(|s| components_of(s)).collect();
        if comps.iter().any(|c| c == slice) {
            return Some(MirrorInfo {
                md_name: md.to_string(),
                components: comps,
            });
        }
    }

    None
}

#[cfg(test)]
mod test {
    use super::*;

    const METASTAT_P: &str = "\
d10 -m d20 d30 1
d20 1 1 c0t0d0s0
d30 1 1 c0t1d0s0
d51 -p d50 -o 2048 -b 204800
d50 2 1 c0t0d0s5 1 c0t1d0s5 -i 32b
";

    #[test]
    fn finds_mirror_for_member_slice() {
        let m = mirror_for_slice(METASTAT_P, "c0t0d0s0").unwrap();
        assert_eq!(m.md_name, "d10");
        assert_eq!(
            m.components,
            vec!["c0t0d0s0".to_string(), "c0t1d0s0".to_string()]
        );
        assert_eq!(m.block_path(), "/dev/md/dsk/d10");
        assert_eq!(m.raw_path(), "/dev/md/rdsk/d10");

        /*
         * Both member slices resolve to the same mirror:
         */
        let m2 = mirror_for_slice(METASTAT_P, "c0t1d0s0").unwrap();
        assert_eq!(m, m2);
    }

    #[test]
    fn non_member_slice_has_no_mirror() {
        assert!(mirror_for_slice(METASTAT_P, "c0t0d0s7").is_none());
        /*
         * s5 is in a stripe used by a soft partition, not a mirror:
         */
        assert!(mirror_for_slice(METASTAT_P, "c0t0d0s5").is_none());
    }

    #[test]
    fn state_db_detection() {
        let td = tempfile::tempdir().unwrap();
        assert!(!has_state_db(td.path()));

        let lvm = td.path().join("etc/lvm");
        std::fs::create_dir_all(&lvm).unwrap();
        std::fs::write(
            lvm.join("mddb.cf"),
            "# mddb.cf, do not hand edit\n",
        )
        .unwrap();
        assert!(!has_state_db(td.path()));

        std::fs::write(
            lvm.join("mddb.cf"),
            "# mddb.cf, do not hand edit\n\
             /dev/dsk/c0t0d0s7 16 8192 /pci@0,0/ide@0/cmdk@0,0:h\n",
        )
        .unwrap();
        assert!(has_state_db(td.path()));
    }
}
