/*
 * Copyright 2024 Oxide Computer Company
 */

/*!
 * Parsing vfstab(4) from a discovered root.  Seven whitespace-delimited
 * fields per line; a literal "-" marks an absent field.  Comment and
 * blank lines are skipped, trailing whitespace is tolerated, and a line
 * with fewer than seven fields poisons the operation that needed it.
 */

use crate::errors::TmmError;

/*
 * File system types the mount manager is prepared to mount from a vfstab:
 */
pub const MOUNTABLE_FSTYPES: &[&str] = &["ufs", "s5", "vxfs"];

#[derive(Debug, Clone, PartialEq)]
pub struct VfstabEntry {
    pub special: Option<String>,
    pub fsckdev: Option<String>,
    pub mount_point: Option<String>,
    pub fstype: Option<String>,
    pub fsck_pass: Option<String>,
    pub mount_at_boot: Option<String>,
    pub mount_options: Option<String>,
}

impl VfstabEntry {
    pub fn at_boot(&self) -> bool {
        self.mount_at_boot.as_deref() == Some("yes")
    }

    pub fn is_swap(&self) -> bool {
        self.fstype.as_deref() == Some("swap")
    }

    /**
     * Whether this is a file system entry of a type we mount onto the
     * alternate root.
     */
    pub fn is_mountable_fs(&self) -> bool {
        match self.fstype.as_deref() {
            Some(t) => MOUNTABLE_FSTYPES.contains(&t),
            None => false,
        }
    }

    /**
     * Whether the entry's options include a bare read-only flag.
     */
    pub fn is_read_only(&self) -> bool {
        match self.mount_options.as_deref() {
            Some(opts) => opts.split(',').any(|o| o == "ro"),
            None => false,
        }
    }
}

fn field(v: &str) -> Option<String> {
    if v == "-" {
        None
    } else {
        Some(v.to_string())
    }
}

/**
 * Parse the contents of a vfstab file.
 */
pub fn parse_vfstab(data: &str) -> Result<Vec<VfstabEntry>, TmmError> {
    let mut out = Vec::new();

    for l in data.lines() {
        let l = l.trim();
        if l.is_empty() || l.starts_with('#') {
            continue;
        }

        let f: Vec<&str> = l.split_whitespace().collect();
        if f.len() < 7 {
            return Err(TmmError::ErrMountFail);
        }

        out.push(VfstabEntry {
            special: field(f[0]),
            fsckdev: field(f[1]),
            mount_point: field(f[2]),
            fstype: field(f[3]),
            fsck_pass: field(f[4]),
            mount_at_boot: field(f[5]),
            mount_options: field(f[6]),
        });
    }

    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = "\
#device         device          mount           FS      fsck    mount   mount
#to mount       to fsck         point           type    pass    at boot options
#
fd      -       /dev/fd fd      -       no      -
/proc   -       /proc   proc    -       no      -
/dev/dsk/c0t0d0s1       -       -       swap    -       no      -
/dev/dsk/c0t0d0s0       /dev/rdsk/c0t0d0s0      /       ufs     1       yes     -
/dev/dsk/c0t0d0s6       /dev/rdsk/c0t0d0s6      /usr    ufs     1       yes     ro
swap    -       /tmp    tmpfs   -       yes     -   \t
";

    #[test]
    fn skips_comments_and_blanks() {
        let v = parse_vfstab(SAMPLE).unwrap();
        assert_eq!(v.len(), 6);
        assert_eq!(v[0].mount_point.as_deref(), Some("/dev/fd"));
    }

    #[test]
    fn dash_means_absent() {
        let v = parse_vfstab(SAMPLE).unwrap();
        let swapdev = &v[2];
        assert_eq!(swapdev.special.as_deref(), Some("/dev/dsk/c0t0d0s1"));
        assert!(swapdev.fsckdev.is_none());
        assert!(swapdev.mount_point.is_none());
        assert!(swapdev.mount_options.is_none());
        assert!(swapdev.is_swap());
        assert!(!swapdev.at_boot());
    }

    #[test]
    fn classification() {
        let v = parse_vfstab(SAMPLE).unwrap();
        let root = &v[3];
        assert!(root.is_mountable_fs());
        assert!(root.at_boot());
        assert!(!root.is_read_only());

        let usr = &v[4];
        assert!(usr.is_read_only());

        let tmp = &v[5];
        assert!(!tmp.is_mountable_fs());
    }

    #[test]
    fn trailing_whitespace_tolerated() {
        let v = parse_vfstab("a b /mp ufs 1 yes -   \n").unwrap();
        assert_eq!(v[0].mount_point.as_deref(), Some("/mp"));
    }

    #[test]
    fn short_line_fails() {
        assert_eq!(
            parse_vfstab("/dev/dsk/c0t0d0s0 - / ufs 1 yes\n").unwrap_err(),
            TmmError::ErrMountFail
        );
    }

    #[test]
    fn read_only_flag_needs_exact_token() {
        let v =
            parse_vfstab("a b /mp ufs 1 yes rw,nointr,robust\n").unwrap();
        assert!(!v[0].is_read_only());
        let v = parse_vfstab("a b /mp ufs 1 yes intr,ro\n").unwrap();
        assert!(v[0].is_read_only());
    }
}
