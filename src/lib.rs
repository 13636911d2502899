/*
 * Copyright 2024 Oxide Computer Company
 */

/*!
 * Target preparation layer for the installer: discovery of disks,
 * partitions, slices and existing OS instances (td), materialisation of
 * fdisk/VTOC/ZFS/boot-environment targets from attribute sets (ti), and
 * mounting of a discovered root and its vfstab entries under an alternate
 * root (tmm).
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use slog::Logger;

pub mod attr;
pub mod devmap;
pub mod disk;
pub mod errors;
pub mod logger;
pub mod mnttab;
pub mod run;
pub mod svm;
pub mod td;
pub mod ti;
pub mod tmm;
pub mod vfstab;
pub mod zfs;

/*
 * The directory underneath which a discovered or newly created root is
 * mounted while the installer works on it:
 */
pub const ALT_ROOT: &str = "/a";

/**
 * Shared context for every public entry point.  One of these is expected
 * per process; clones are cheap and refer to the same mount/swap state and
 * dry-run switch.
 */
#[derive(Clone)]
pub struct Core {
    log: Logger,
    dryrun: Arc<AtomicBool>,
    tmm: Arc<Mutex<tmm::TmmState>>,
}

impl Core {
    pub fn new(log: Logger) -> Core {
        Core {
            log,
            dryrun: Arc::new(AtomicBool::new(false)),
            tmm: Arc::new(Mutex::new(tmm::TmmState::default())),
        }
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    /**
     * When the dry-run switch is set, no command that would mutate system
     * state is executed.  Attribute validation and logging proceed as
     * normal.  The switch is enforced in one place, the run module.
     */
    pub fn set_dry_run(&self, enable: bool) {
        self.dryrun.store(enable, Ordering::SeqCst);
    }

    pub fn dry_run(&self) -> bool {
        self.dryrun.load(Ordering::SeqCst)
    }

    pub(crate) fn tmm_state(&self) -> MutexGuard<tmm::TmmState> {
        /*
         * A poisoned mutex means another caller panicked mid-operation;
         * there is no useful recovery beyond propagating the state as-is.
         */
        match self.tmm.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_core() -> Core {
    use slog::o;

    Core::new(Logger::root(slog::Discard, o!()))
}
