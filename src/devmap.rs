/*
 * Copyright 2024 Oxide Computer Company
 */

/*!
 * Mapping device names between the running installer and the target.
 * The /dev/dsk names in a target's vfstab or metadevice configuration
 * refer to the target's own /devices tree; to operate on those devices
 * from the installer we find the installer-side /dev/dsk symlink that
 * resolves to the same physical device.  A rewrite ruleset dropped in
 * /tmp covers devfs transitions the direct comparison cannot.
 */

use std::path::{Component, Path, PathBuf};

use anyhow::Result;
use regex::Regex;
use slog::{info, warn};
use walkdir::WalkDir;

use crate::Core;

pub const DEV_DSK: &str = "/dev/dsk";

/*
 * Conventional location of optional rewrite rulesets:
 */
pub const RULES_GLOB: &str = "/tmp/physdevmap.nawk.*";

pub struct RewriteRule {
    pub pattern: Regex,
    pub replacement: String,
}

/**
 * Parse a rewrite ruleset: one rule per line, a regular expression and a
 * replacement separated by whitespace.  Comments and malformed lines are
 * ignored; the ruleset is advisory.
 */
pub fn parse_rules(data: &str) -> Vec<RewriteRule> {
    let mut out = Vec::new();

    for l in data.lines() {
        let l = l.trim();
        if l.is_empty() || l.starts_with('#') {
            continue;
        }

        let f: Vec<&str> = l.split_whitespace().collect();
        if f.len() != 2 {
            continue;
        }

        if let Ok(pattern) = Regex::new(f[0]) {
            out.push(RewriteRule { pattern, replacement: f[1].to_string() });
        }
    }

    out
}

/**
 * Load every ruleset matching the conventional glob.  Absence of rule
 * files simply means no rewriting is attempted.
 */
pub fn load_rules(core: &Core, pattern: &str) -> Vec<RewriteRule> {
    let mut out = Vec::new();

    let paths = match glob::glob(pattern) {
        Ok(p) => p,
        Err(e) => {
            warn!(core.log(), "bad rewrite rule glob {:?}: {}", pattern, e);
            return out;
        }
    };

    for p in paths {
        let p = match p {
            Ok(p) => p,
            Err(_) => continue,
        };
        match std::fs::read_to_string(&p) {
            Ok(data) => {
                let rules = parse_rules(&data);
                info!(
                    core.log(),
                    "loaded {} rewrite rules from {}",
                    rules.len(),
                    p.display()
                );
                out.extend(rules);
            }
            Err(e) => {
                warn!(
                    core.log(),
                    "could not read rewrite rules {}: {}",
                    p.display(),
                    e
                );
            }
        }
    }

    out
}

/**
 * Apply the first matching rule, if any.
 */
pub fn apply_rules(rules: &[RewriteRule], path: &str) -> Option<String> {
    for r in rules.iter() {
        if r.pattern.is_match(path) {
            return Some(
                r.pattern.replace(path, r.replacement.as_str()).to_string(),
            );
        }
    }
    None
}

/*
 * The comparable portion of a physical device path is everything after
 * the "/devices" component; symlink targets are usually relative
 * ("../../devices/...") and targets from another boot are absolute.
 */
fn devices_suffix(p: &str) -> Option<&str> {
    p.find("/devices/").map(|i| &p[i + "/devices".len()..])
}

fn normalize(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => (),
            c => out.push(c.as_os_str()),
        }
    }
    out
}

/**
 * Scan a /dev/dsk directory for the symlink that resolves to the given
 * physical device path, returning the link's base name.
 */
pub fn target_to_install_in(devdir: &Path, target: &str)
    -> Result<Option<String>>
{
    let want = match devices_suffix(target) {
        Some(s) => s.to_string(),
        None => target.to_string(),
    };

    for ent in WalkDir::new(devdir).min_depth(1).max_depth(1) {
        let ent = match ent {
            Ok(e) => e,
            Err(_) => continue,
        };

        let link = match std::fs::read_link(ent.path()) {
            Ok(l) => l,
            Err(_) => continue,
        };

        let ls = link.to_string_lossy();
        let have = match devices_suffix(&ls) {
            Some(s) => s.to_string(),
            None => ls.to_string(),
        };

        if have == want {
            if let Some(n) = ent.file_name().to_str() {
                return Ok(Some(n.to_string()));
            }
        }
    }

    Ok(None)
}

/**
 * Map a target-side physical device path to the installer's /dev/dsk
 * name.  The direct symlink comparison is the primary path; the rewrite
 * ruleset is consulted only when it fails.
 */
pub fn target_to_install(core: &Core, target: &str)
    -> Result<Option<String>>
{
    if let Some(n) = target_to_install_in(Path::new(DEV_DSK), target)? {
        return Ok(Some(n));
    }

    let rules = load_rules(core, RULES_GLOB);
    if let Some(rewritten) = apply_rules(&rules, target) {
        info!(
            core.log(),
            "device path {:?} rewritten to {:?}", target, rewritten
        );
        if let Some(n) =
            target_to_install_in(Path::new(DEV_DSK), &rewritten)?
        {
            return Ok(Some(n));
        }
    }

    Ok(None)
}

/**
 * Map an installer-side /dev/dsk name to the physical device path it
 * points at; the inverse of target_to_install().
 */
pub fn install_to_target_in(devdir: &Path, name: &str)
    -> Result<Option<String>>
{
    let p = devdir.join(name);
    let link = match std::fs::read_link(&p) {
        Ok(l) => l,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(None)
        }
        Err(e) => return Err(e.into()),
    };

    let resolved = if link.is_absolute() {
        normalize(&link)
    } else {
        normalize(&devdir.join(link))
    };

    Ok(Some(resolved.to_string_lossy().to_string()))
}

pub fn install_to_target(name: &str) -> Result<Option<String>> {
    install_to_target_in(Path::new(DEV_DSK), name)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn rules_parse_and_apply() {
        let rules = parse_rules(
            "# devfs transitions\n\
             \n\
             /pci@0,0/pci-ide@1f,1	/pci@0,0/pci-ide@1f,2\n\
             not-a-rule\n\
             [broken	replacement\n",
        );
        assert_eq!(rules.len(), 1);

        let out = apply_rules(
            &rules,
            "/devices/pci@0,0/pci-ide@1f,1/ide@0/cmdk@0,0:a",
        )
        .unwrap();
        assert_eq!(out, "/devices/pci@0,0/pci-ide@1f,2/ide@0/cmdk@0,0:a");

        assert!(apply_rules(&rules, "/devices/pci@1,0/disk@0:a").is_none());
    }

    #[test]
    fn suffix_comparison() {
        assert_eq!(
            devices_suffix("/devices/pci@0,0/cmdk@0,0:a"),
            Some("/pci@0,0/cmdk@0,0:a")
        );
        assert_eq!(
            devices_suffix("../../devices/pci@0,0/cmdk@0,0:a"),
            Some("/pci@0,0/cmdk@0,0:a")
        );
        assert_eq!(devices_suffix("/dev/dsk/c0t0d0s0"), None);
    }

    #[test]
    fn maps_target_path_to_link_name() {
        let td = tempfile::tempdir().unwrap();
        let dsk = td.path().join("dev/dsk");
        std::fs::create_dir_all(&dsk).unwrap();

        symlink(
            "../../devices/pci@0,0/ide@0/cmdk@0,0:a",
            dsk.join("c0t0d0s0"),
        )
        .unwrap();
        symlink(
            "../../devices/pci@0,0/ide@0/cmdk@0,0:b",
            dsk.join("c0t0d0s1"),
        )
        .unwrap();

        let n = target_to_install_in(
            &dsk,
            "/devices/pci@0,0/ide@0/cmdk@0,0:b",
        )
        .unwrap();
        assert_eq!(n.as_deref(), Some("c0t0d0s1"));

        let n = target_to_install_in(
            &dsk,
            "/devices/pci@0,0/ide@1/cmdk@0,0:a",
        )
        .unwrap();
        assert!(n.is_none());
    }

    #[test]
    fn maps_link_name_to_target_path() {
        let td = tempfile::tempdir().unwrap();
        let dsk = td.path().join("dev/dsk");
        std::fs::create_dir_all(&dsk).unwrap();
        symlink(
            "../../devices/pci@0,0/ide@0/cmdk@0,0:a",
            dsk.join("c0t0d0s0"),
        )
        .unwrap();

        let p = install_to_target_in(&dsk, "c0t0d0s0").unwrap().unwrap();
        assert!(p.ends_with("/devices/pci@0,0/ide@0/cmdk@0,0:a"));
        assert!(!p.contains(".."));

        assert!(install_to_target_in(&dsk, "c9t9d9s9")
            .unwrap()
            .is_none());
    }
}
