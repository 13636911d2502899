/*
 * Copyright 2024 Oxide Computer Company
 */

/*!
 * Error taxonomies for the three public components.  The namespaces are
 * disjoint and errors cross module boundaries unchanged; narrative detail
 * (the failing command, the child's stderr) goes to the log at the point
 * of failure rather than into the error value.  The numeric code of each
 * variant doubles as the CLI exit code.
 */

use thiserror::Error;

/**
 * Failures from target instantiation.  The Invalid*Attr variants are
 * produced by attribute validation before any side effect; the rest map
 * one-to-one onto the step that failed.
 */
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TiError {
    #[error("invalid fdisk attribute set")]
    InvalidFdiskAttr = 1,
    #[error("invalid VTOC attribute set")]
    InvalidVtocAttr = 2,
    #[error("invalid ZFS root pool attribute set")]
    InvalidZfsRpoolAttr = 3,
    #[error("invalid ZFS filesystem attribute set")]
    InvalidZfsFsAttr = 4,
    #[error("invalid ZFS volume attribute set")]
    InvalidZfsVolAttr = 5,
    #[error("invalid boot environment attribute set")]
    InvalidBeAttr = 6,
    #[error("invalid ramdisk attribute set")]
    InvalidRamdiskAttr = 7,
    #[error("invalid directory attribute set")]
    InvalidDirectoryAttr = 8,
    #[error("could not create ZFS pool")]
    ZfsPoolCreateFailed = 9,
    #[error("could not release ZFS pool")]
    ZfsPoolReleaseFailed = 10,
    #[error("could not create ZFS filesystem")]
    ZfsFsCreateFailed = 11,
    #[error("could not create ZFS volume")]
    ZfsVolCreateFailed = 12,
    #[error("could not set ZFS property")]
    ZfsSetPropFailed = 13,
    #[error("could not create boot environment")]
    BeCreateFailed = 14,
    #[error("could not mount boot environment")]
    BeMountFailed = 15,
    #[error("could not write fdisk partition table")]
    FdiskWriteFailed = 16,
    #[error("could not write VTOC")]
    VtocWriteFailed = 17,
    #[error("could not create ramdisk backing file")]
    RamdiskMkfileFailed = 18,
    #[error("could not attach ramdisk lofi device")]
    RamdiskLofiadmFailed = 19,
    #[error("could not construct file system")]
    NewfsFailed = 20,
    #[error("could not create directory")]
    MkdirFailed = 21,
    #[error("could not mount file system")]
    MountFailed = 22,
    #[error("could not unmount file system")]
    UnmountFailed = 23,
    #[error("could not remove directory")]
    RmdirFailed = 24,
}

impl TiError {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/**
 * Failures from target discovery.  Enumeration is best-effort per object;
 * these cover only whole-operation failure.
 */
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TdError {
    #[error("discovery failed")]
    DiscoveryFailed = 1,
    #[error("no such device")]
    NoDevice = 2,
    #[error("out of memory")]
    NoMemory = 3,
}

impl TdError {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/**
 * Failures from the target mount manager.
 */
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TmmError {
    #[error("could not open vfstab")]
    ErrOpeningVfstab = 1,
    #[error("mount failed")]
    ErrMountFail = 2,
    #[error("file system requires manual fsck")]
    ErrMustManualFsck = 3,
    #[error("fsck failed")]
    ErrFsckFailure = 4,
    #[error("could not add swap device")]
    ErrAddSwap = 5,
    #[error("could not delete swap device")]
    ErrDeleteSwap = 6,
    #[error("unmount failed")]
    ErrUmountFail = 7,
    #[error("could not mount non-global zones")]
    ErrZoneMountFail = 8,
}

impl TmmError {
    pub fn code(self) -> i32 {
        self as i32
    }
}
