/*
 * Copyright 2024 Oxide Computer Company
 */

/*!
 * Reading mnttab(4): the kernel's table of active mounts.  The mount
 * manager consults this to verify "already mounted" conditions and to
 * find what is currently attached at a mount point.
 */

use std::collections::HashMap;

use anyhow::{bail, Result};

#[derive(Debug, Clone)]
pub enum MountOptionValue {
    Present,
    Value(String),
}

#[derive(Debug, Clone)]
pub struct Mount {
    pub special: String,
    pub mount_point: String,
    pub fstype: String,
    pub options: HashMap<String, MountOptionValue>,
    pub time: u64,
}

/**
 * Parse mnttab contents.  Fields are tab-delimited.  The result is a list
 * rather than a dictionary as there may be more than one entry for a
 * particular mount point; the last entry for a mount point is the
 * effective one.
 */
pub fn parse_mnttab(data: &str) -> Result<Vec<Mount>> {
    let mut out = Vec::new();

    for (lineno, l) in data.lines().enumerate() {
        let l = l.trim_end();
        if l.is_empty() {
            continue;
        }

        let r: Vec<&str> = l.split('\t').collect();
        if r.len() < 5 {
            bail!("mnttab line {}: {} fields", lineno + 1, r.len());
        }

        let mut options = HashMap::new();
        for p in r[3].split(',') {
            let terms: Vec<&str> = p.splitn(2, '=').collect();

            let v = if terms.len() == 2 {
                MountOptionValue::Value(terms[1].to_string())
            } else {
                MountOptionValue::Present
            };

            options.insert(terms[0].to_string(), v);
        }

        out.push(Mount {
            special: r[0].to_string(),
            mount_point: r[1].to_string(),
            fstype: r[2].to_string(),
            options,
            time: r[4].parse().unwrap_or(0),
        });
    }

    Ok(out)
}

/**
 * Read mnttab(4) and produce the list of active mounts.
 */
pub fn mounts() -> Result<Vec<Mount>> {
    let data = std::fs::read_to_string("/etc/mnttab")?;
    parse_mnttab(&data)
}

/**
 * The mount currently effective at a mount point, if any.
 */
pub fn mount_at<'a>(mounts: &'a [Mount], mount_point: &str)
    -> Option<&'a Mount>
{
    mounts.iter().rev().find(|m| m.mount_point == mount_point)
}

/**
 * The mount, if any, whose backing device is the given special.
 */
pub fn mount_of<'a>(mounts: &'a [Mount], special: &str) -> Option<&'a Mount> {
    mounts.iter().rev().find(|m| m.special == special)
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = "rpool/ROOT/solaris\t/\tzfs\tdev=4490002\t0\n\
        /devices\t/devices\tdevfs\tdev=8580000\t1618434703\n\
        proc\t/proc\tproc\tdev=8600000\t1618434703\n\
        swap\t/tmp\ttmpfs\txattr,dev=8680001\t1618434703\n\
        /dev/dsk/c0t0d0s0\t/a\tufs\trw,intr,largefiles,logging,\
        xattr,onerror=panic,dev=800000\t1618434710\n";

    #[test]
    fn parses_fields() {
        let m = parse_mnttab(SAMPLE).unwrap();
        assert_eq!(m.len(), 5);
        assert_eq!(m[0].special, "rpool/ROOT/solaris");
        assert_eq!(m[0].mount_point, "/");
        assert_eq!(m[0].fstype, "zfs");
        assert_eq!(m[4].time, 1618434710);
    }

    #[test]
    fn parses_options() {
        let m = parse_mnttab(SAMPLE).unwrap();
        let ufs = &m[4];
        assert!(matches!(
            ufs.options.get("rw"),
            Some(MountOptionValue::Present)
        ));
        match ufs.options.get("onerror") {
            Some(MountOptionValue::Value(v)) => assert_eq!(v, "panic"),
            other => panic!("unexpected onerror option: {:?}", other),
        }
    }

    #[test]
    fn lookup_by_mount_point_and_special() {
        let m = parse_mnttab(SAMPLE).unwrap();
        assert_eq!(mount_at(&m, "/a").unwrap().special, "/dev/dsk/c0t0d0s0");
        assert_eq!(mount_of(&m, "proc").unwrap().mount_point, "/proc");
        assert!(mount_at(&m, "/nope").is_none());
    }

    #[test]
    fn short_line_is_an_error() {
        assert!(parse_mnttab("only\tthree\tfields\n").is_err());
    }
}
