/*
 * Copyright 2024 Oxide Computer Company
 */

/*!
 * Disk naming and on-disk label handling: cNtNdNsN name manipulation,
 * device path construction, and parsers for the label-reporting tools
 * (diskinfo, prtvtoc, fdisk -W) whose output drives both discovery and
 * instantiation.
 */

use anyhow::{bail, Result};

/*
 * VTOC partition tags:
 */
pub const TAG_UNASSIGNED: u32 = 0;
pub const TAG_BOOT: u32 = 1;
pub const TAG_ROOT: u32 = 2;
pub const TAG_SWAP: u32 = 3;
pub const TAG_USR: u32 = 4;
pub const TAG_BACKUP: u32 = 5;
pub const TAG_STAND: u32 = 6;
pub const TAG_VAR: u32 = 7;
pub const TAG_HOME: u32 = 8;
pub const TAG_ALTSCTR: u32 = 9;
pub const TAG_CACHE: u32 = 10;

/*
 * VTOC flags:
 */
pub const FLAG_UNMNT: u32 = 0x01;
pub const FLAG_RONLY: u32 = 0x10;

/*
 * fdisk system ids for installable Solaris partitions.  The older id is
 * shared with Linux swap; the newer one is unambiguous.
 */
pub const SUNIXOS: u8 = 130;
pub const SUNIXOS2: u8 = 191;

pub fn is_solaris_part(id: u8) -> bool {
    id == SUNIXOS2 || id == SUNIXOS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskType {
    Ata,
    Scsi,
    Fibre,
    Usb,
    Sata,
    Firewire,
    Unknown,
}

impl DiskType {
    pub fn from_report(s: &str) -> DiskType {
        match s.to_ascii_uppercase().as_str() {
            "ATA" => DiskType::Ata,
            "SCSI" => DiskType::Scsi,
            "FC" | "FIBRE" => DiskType::Fibre,
            "USB" => DiskType::Usb,
            "SATA" => DiskType::Sata,
            "1394" | "FIREWIRE" => DiskType::Firewire,
            _ => DiskType::Unknown,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DiskType::Ata => "ATA",
            DiskType::Scsi => "SCSI",
            DiskType::Fibre => "FIBRE",
            DiskType::Usb => "USB",
            DiskType::Sata => "SATA",
            DiskType::Firewire => "FIREWIRE",
            DiskType::Unknown => "UNKNOWN",
        }
    }
}

/**
 * Check that a name is a bare cNtNdN or cNdN disk name; target and LUN
 * are optional but controller and disk numbers are not.
 */
pub fn is_disk_name(n: &str) -> bool {
    parse_disk_name(n).is_some()
}

fn take_num(s: &str) -> Option<(&str, &str)> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or_else(|| s.len());
    if end == 0 {
        None
    } else {
        Some((&s[..end], &s[end..]))
    }
}

fn parse_disk_name(n: &str) -> Option<&str> {
    let rest = n.strip_prefix('c')?;
    let (_, rest) = take_num(rest)?;
    let rest = if let Some(r) = rest.strip_prefix('t') {
        let (_, r) = take_num(r)?;
        r
    } else {
        rest
    };
    let rest = rest.strip_prefix('d')?;
    let (_, rest) = take_num(rest)?;
    if rest.is_empty() {
        Some(n)
    } else {
        None
    }
}

/**
 * Split a cNtNdNsN slice name into the disk name and the slice index.
 */
pub fn split_slice_name(n: &str) -> Option<(&str, u32)> {
    let s = n.rfind('s')?;
    let (disk, idx) = (&n[..s], &n[s + 1..]);
    let idx: u32 = idx.parse().ok()?;
    if idx > 15 || !is_disk_name(disk) {
        return None;
    }
    Some((disk, idx))
}

/*
 * Device path construction.  The "p0" device addresses the whole disk on
 * x86; "s2" conventionally addresses the backup slice.
 */

pub fn slice_block(disk: &str, slice: u32) -> String {
    format!("/dev/dsk/{}s{}", disk, slice)
}

pub fn slice_raw(disk: &str, slice: u32) -> String {
    format!("/dev/rdsk/{}s{}", disk, slice)
}

pub fn disk_raw_p0(disk: &str) -> String {
    format!("/dev/rdsk/{}p0", disk)
}

pub fn zvol_block(pool: &str, vol: &str) -> String {
    format!("/dev/zvol/dsk/{}/{}", pool, vol)
}

/**
 * One row of an fdisk partition table, in the column order used by
 * fdisk -W and -F.  All four slots are represented; an id of zero is an
 * empty slot.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FdiskRow {
    pub id: u8,
    pub active: bool,
    pub bhead: u32,
    pub bsect: u32,
    pub bcyl: u32,
    pub ehead: u32,
    pub esect: u32,
    pub ecyl: u32,
    pub rsect: u64,
    pub numsect: u64,
}

impl FdiskRow {
    pub fn is_used(&self) -> bool {
        self.id != 0
    }
}

/**
 * Parse the output of fdisk -W - (comment lines begin with '*'; data
 * rows carry ten numeric columns).
 */
pub fn parse_fdisk_table(data: &str) -> Result<Vec<FdiskRow>> {
    let mut out = Vec::new();

    for l in data.lines() {
        let l = l.trim();
        if l.is_empty() || l.starts_with('*') {
            continue;
        }

        let f: Vec<&str> = l.split_whitespace().collect();
        if f.len() < 10 {
            bail!("fdisk table row with {} columns: {:?}", f.len(), l);
        }

        let n = |i: usize| -> Result<u64> {
            match f[i].parse() {
                Ok(v) => Ok(v),
                Err(_) => bail!("fdisk table column {}: {:?}", i, f[i]),
            }
        };

        out.push(FdiskRow {
            id: n(0)? as u8,
            active: n(1)? != 0,
            bhead: n(2)? as u32,
            bsect: n(3)? as u32,
            bcyl: n(4)? as u32,
            ehead: n(5)? as u32,
            esect: n(6)? as u32,
            ecyl: n(7)? as u32,
            rsect: n(8)?,
            numsect: n(9)?,
        });
    }

    Ok(out)
}

/**
 * Render a table in the format fdisk -F consumes.
 */
pub fn format_fdisk_table(rows: &[FdiskRow]) -> String {
    let mut out = String::new();
    out.push_str(
        "* Id    Act  Bhead  Bsect  Bcyl    Ehead  Esect  Ecyl    \
        Rsect      Numsect\n",
    );
    for r in rows {
        out.push_str(&format!(
            "  {}    {}    {}    {}    {}    {}    {}    {}    {}    {}\n",
            r.id,
            if r.active { 128 } else { 0 },
            r.bhead,
            r.bsect,
            r.bcyl,
            r.ehead,
            r.esect,
            r.ecyl,
            r.rsect,
            r.numsect,
        ));
    }
    out
}

/**
 * Partition ranges on one disk must not overlap.  Returns the indexes of
 * the first offending pair.
 */
pub fn partitions_overlap(rows: &[FdiskRow]) -> Option<(usize, usize)> {
    for i in 0..rows.len() {
        if !rows[i].is_used() {
            continue;
        }
        for j in (i + 1)..rows.len() {
            if !rows[j].is_used() {
                continue;
            }
            let (ab, ae) = (rows[i].rsect, rows[i].rsect + rows[i].numsect);
            let (bb, be) = (rows[j].rsect, rows[j].rsect + rows[j].numsect);
            if ab < be && bb < ae {
                return Some((i, j));
            }
        }
    }
    None
}

/**
 * A slice extent must lie inside its containing range (the Solaris
 * partition on x86, the whole disk on SPARC).
 */
pub fn slice_within(first: u64, count: u64, lo: u64, hi: u64) -> bool {
    first >= lo && first.saturating_add(count) <= hi
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Geometry {
    pub bytes_per_sector: u64,
    pub sectors_per_track: u64,
    pub tracks_per_cylinder: u64,
    pub sectors_per_cylinder: u64,
    pub cylinders: u64,
    pub accessible_cylinders: u64,
}

impl Geometry {
    pub fn accessible_sectors(&self) -> u64 {
        self.sectors_per_cylinder * self.accessible_cylinders
    }

    pub fn size_mb(&self) -> u64 {
        self.accessible_sectors() * self.bytes_per_sector / (1024 * 1024)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VtocSlice {
    pub index: u32,
    pub tag: u32,
    pub flags: u32,
    pub first_sector: u64,
    pub sector_count: u64,
}

impl VtocSlice {
    /**
     * A slice is in use if it carries a tag or a size.
     */
    pub fn in_use(&self) -> bool {
        self.tag != TAG_UNASSIGNED || self.sector_count != 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct Vtoc {
    pub geometry: Geometry,
    pub slices: Vec<VtocSlice>,
    pub volume_name: Option<String>,
}

/**
 * Parse prtvtoc output: the dimensions block in the comment header, an
 * optional volume name, and one data row per defined slice.
 */
pub fn parse_prtvtoc(data: &str) -> Result<Vtoc> {
    let mut vtoc = Vtoc::default();

    for l in data.lines() {
        let l = l.trim();
        if l.is_empty() {
            continue;
        }

        if let Some(c) = l.strip_prefix('*') {
            let c = c.trim();
            let f: Vec<&str> = c.split_whitespace().collect();
            if f.len() >= 2 {
                let num = || -> u64 { f[0].parse().unwrap_or(0) };
                match &f[1..] {
                    ["bytes/sector"] => {
                        vtoc.geometry.bytes_per_sector = num()
                    }
                    ["sectors/track"] => {
                        vtoc.geometry.sectors_per_track = num()
                    }
                    ["tracks/cylinder"] => {
                        vtoc.geometry.tracks_per_cylinder = num()
                    }
                    ["sectors/cylinder"] => {
                        vtoc.geometry.sectors_per_cylinder = num()
                    }
                    ["cylinders"] => vtoc.geometry.cylinders = num(),
                    ["accessible", "cylinders"] => {
                        vtoc.geometry.accessible_cylinders = num()
                    }
                    _ => (),
                }
            }
            if let Some(v) = c.strip_prefix("Volume Name:") {
                let v = v.trim();
                if !v.is_empty() {
                    vtoc.volume_name = Some(v.to_string());
                }
            }
            continue;
        }

        /*
         * Data row: partition tag flags first count last [mountpoint]
         */
        let f: Vec<&str> = l.split_whitespace().collect();
        if f.len() < 6 {
            bail!("prtvtoc row with {} columns: {:?}", f.len(), l);
        }

        let idx: u32 = match f[0].parse() {
            Ok(v) => v,
            Err(_) => bail!("prtvtoc slice index: {:?}", f[0]),
        };
        let tag: u32 = f[1].parse().unwrap_or(0);
        let flags = u32::from_str_radix(f[2], 16).unwrap_or(0);
        let first: u64 = match f[3].parse() {
            Ok(v) => v,
            Err(_) => bail!("prtvtoc first sector: {:?}", f[3]),
        };
        let count: u64 = match f[4].parse() {
            Ok(v) => v,
            Err(_) => bail!("prtvtoc sector count: {:?}", f[4]),
        };

        vtoc.slices.push(VtocSlice {
            index: idx,
            tag,
            flags,
            first_sector: first,
            sector_count: count,
        });
    }

    Ok(vtoc)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskReport {
    pub dtype: DiskType,
    pub name: String,
    pub vendor: String,
    pub product: String,
    pub size_mb: u64,
    pub removable: bool,
}

fn parse_size_mb(value: &str, unit: &str) -> u64 {
    let v: f64 = value.parse().unwrap_or(0.0);
    let mb = match unit {
        "KiB" => v / 1024.0,
        "MiB" => v,
        "GiB" => v * 1024.0,
        "TiB" => v * 1024.0 * 1024.0,
        _ => 0.0,
    };
    mb as u64
}

/**
 * Parse diskinfo output.  Columns: TYPE DISK VID PID SIZE RMV SSD; the
 * PID column may itself contain spaces, so rows are picked apart from
 * both ends.
 */
pub fn parse_diskinfo(data: &str) -> Result<Vec<DiskReport>> {
    let mut out = Vec::new();

    for l in data.lines() {
        let l = l.trim();
        if l.is_empty() || l.starts_with("TYPE") {
            continue;
        }

        let f: Vec<&str> = l.split_whitespace().collect();
        if f.len() < 7 {
            bail!("diskinfo row with {} columns: {:?}", f.len(), l);
        }

        let n = f.len();
        let rmv = f[n - 2];
        let unit = f[n - 3];
        let size = f[n - 4];

        out.push(DiskReport {
            dtype: DiskType::from_report(f[0]),
            name: f[1].to_string(),
            vendor: f[2].to_string(),
            product: f[3..n - 4].join(" "),
            size_mb: parse_size_mb(size, unit),
            removable: rmv == "yes",
        });
    }

    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn disk_names() {
        assert!(is_disk_name("c0t0d0"));
        assert!(is_disk_name("c1d0"));
        assert!(is_disk_name("c10t37d2"));
        assert!(!is_disk_name("c0t0d0s0"));
        assert!(!is_disk_name("c0t0"));
        assert!(!is_disk_name("sda"));
        assert!(!is_disk_name(""));
    }

    #[test]
    fn slice_names() {
        assert_eq!(split_slice_name("c0t0d0s0"), Some(("c0t0d0", 0)));
        assert_eq!(split_slice_name("c1d0s15"), Some(("c1d0", 15)));
        assert_eq!(split_slice_name("c1d0s16"), None);
        assert_eq!(split_slice_name("c0t0d0"), None);
    }

    #[test]
    fn device_paths() {
        assert_eq!(slice_block("c0t0d0", 0), "/dev/dsk/c0t0d0s0");
        assert_eq!(slice_raw("c0t0d0", 2), "/dev/rdsk/c0t0d0s2");
        assert_eq!(disk_raw_p0("c0t0d0"), "/dev/rdsk/c0t0d0p0");
        assert_eq!(
            zvol_block("rpool", "swap"),
            "/dev/zvol/dsk/rpool/swap"
        );
    }

    const FDISK_W: &str = "\
* /dev/rdsk/c0t0d0p0 default fdisk table
* Dimensions:
*      512 bytes/sector
*       63 sectors/track
*      255 tracks/cylinder
*     7297 cylinders
*
* systid:
*  130: SUNIXOS
*  191: SUNIXOS2
*
* Id    Act  Bhead  Bsect  Bcyl    Ehead  Esect  Ecyl    Rsect      Numsect
  191   128  0      1      1       254    63     1023    63         125045135
  0     0    0      0      0       0      0      0       0          0
  0     0    0      0      0       0      0      0       0          0
  0     0    0      0      0       0      0      0       0          0
";

    #[test]
    fn fdisk_parse() {
        let t = parse_fdisk_table(FDISK_W).unwrap();
        assert_eq!(t.len(), 4);
        assert_eq!(t[0].id, SUNIXOS2);
        assert!(t[0].active);
        assert_eq!(t[0].rsect, 63);
        assert_eq!(t[0].numsect, 125045135);
        assert!(!t[1].is_used());
    }

    #[test]
    fn fdisk_round_trip() {
        let t = parse_fdisk_table(FDISK_W).unwrap();
        let again = parse_fdisk_table(&format_fdisk_table(&t)).unwrap();
        assert_eq!(t, again);
    }

    #[test]
    fn overlap_detection() {
        let mut t = parse_fdisk_table(FDISK_W).unwrap();
        assert_eq!(partitions_overlap(&t), None);

        t[1] = FdiskRow {
            id: 11,
            rsect: 1000,
            numsect: 4096,
            ..FdiskRow::default()
        };
        assert_eq!(partitions_overlap(&t), Some((0, 1)));

        /*
         * Adjacent but not overlapping:
         */
        t[1].rsect = 63 + 125045135;
        assert_eq!(partitions_overlap(&t), None);
    }

    #[test]
    fn slice_bounds() {
        assert!(slice_within(16065, 125028900, 63, 63 + 125045135));
        assert!(!slice_within(0, 100, 63, 1000));
        assert!(!slice_within(900, 200, 63, 1000));
    }

    const PRTVTOC: &str = "\
* /dev/rdsk/c0t0d0s2 partition map
*
* Dimensions:
*     512 bytes/sector
*      63 sectors/track
*     255 tracks/cylinder
*   16065 sectors/cylinder
*    7297 cylinders
*    7295 accessible cylinders
*
* Flags:
*   1: unmountable
*  10: read-only
*
*                          First     Sector    Last
* Partition  Tag  Flags    Sector     Count    Sector  Mount Directory
       0      2    00      16065 125028900 125044964
       1      3    01          0     16065     16064
       2      5    01          0 125045199 125045198
";

    #[test]
    fn prtvtoc_parse() {
        let v = parse_prtvtoc(PRTVTOC).unwrap();
        assert_eq!(v.geometry.bytes_per_sector, 512);
        assert_eq!(v.geometry.sectors_per_cylinder, 16065);
        assert_eq!(v.geometry.accessible_cylinders, 7295);
        assert_eq!(v.geometry.accessible_sectors(), 16065 * 7295);

        assert_eq!(v.slices.len(), 3);
        let s0 = &v.slices[0];
        assert_eq!(s0.index, 0);
        assert_eq!(s0.tag, TAG_ROOT);
        assert_eq!(s0.first_sector, 16065);
        assert_eq!(s0.sector_count, 125028900);
        let s1 = &v.slices[1];
        assert_eq!(s1.tag, TAG_SWAP);
        assert_eq!(s1.flags, FLAG_UNMNT);
        assert!(s1.in_use());
    }

    #[test]
    fn unused_slice_detection() {
        let s = VtocSlice {
            index: 4,
            tag: TAG_UNASSIGNED,
            flags: 0,
            first_sector: 0,
            sector_count: 0,
        };
        assert!(!s.in_use());
    }

    const DISKINFO: &str = "\
TYPE    DISK                    VID      PID              SIZE          RMV SSD
ATA     c0t0d0                  VBOX     HARDDISK         60.00 GiB     no  no
SCSI    c2t0d0                  HITACHI  OPEN-V      -SUN 2048.00 MiB   no  no
USB     c3t0d0                  SanDisk  Cruzer Blade     7.45 GiB      yes no
";

    #[test]
    fn diskinfo_parse() {
        let d = parse_diskinfo(DISKINFO).unwrap();
        assert_eq!(d.len(), 3);

        assert_eq!(d[0].dtype, DiskType::Ata);
        assert_eq!(d[0].name, "c0t0d0");
        assert_eq!(d[0].size_mb, 60 * 1024);
        assert!(!d[0].removable);

        /*
         * A product name containing spaces must not shift the numeric
         * columns:
         */
        assert_eq!(d[1].product, "OPEN-V -SUN");
        assert_eq!(d[1].size_mb, 2048);

        assert_eq!(d[2].dtype, DiskType::Usb);
        assert!(d[2].removable);
    }

    #[test]
    fn disk_type_mapping() {
        assert_eq!(DiskType::from_report("SATA"), DiskType::Sata);
        assert_eq!(DiskType::from_report("NVME"), DiskType::Unknown);
        assert_eq!(DiskType::from_report("1394"), DiskType::Firewire);
        assert_eq!(DiskType::Fibre.name(), "FIBRE");
    }
}
