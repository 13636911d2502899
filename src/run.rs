/*
 * Copyright 2024 Oxide Computer Company
 */

/*!
 * Every external command in the crate is executed through this module.
 * The argument vector is logged before the fork, the child's stderr is
 * relayed to the log at WARN, and success means the child exited with
 * status 0.  This is also the one place the dry-run switch is honoured:
 * mutating invocations are skipped outright, while read-only captures
 * always run.
 */

use std::process::{Command, Output};

use anyhow::{bail, Result};
use slog::{info, warn};

use crate::Core;

pub trait OutputExt {
    fn info(&self) -> String;
}

impl OutputExt for Output {
    fn info(&self) -> String {
        let mut out = String::new();

        if let Some(code) = self.status.code() {
            out.push_str(&format!("exit code {}", code));
        } else {
            out.push_str("terminated by signal");
        }

        let stderr = String::from_utf8_lossy(&self.stderr).trim().to_string();
        let extra = if stderr.is_empty() {
            /*
             * Some commands emit their failure message on stdout:
             */
            String::from_utf8_lossy(&self.stdout).trim().to_string()
        } else {
            stderr
        };

        if !extra.is_empty() {
            out.push_str(": ");
            out.push_str(&extra);
        }

        out
    }
}

fn spawn(core: &Core, args: &[&str]) -> Result<Output> {
    let log = core.log();

    info!(log, "exec: {:?}", args);

    let out = Command::new(args[0])
        .env_clear()
        .args(&args[1..])
        .output()?;

    let stderr = String::from_utf8_lossy(&out.stderr);
    for l in stderr.lines() {
        let l = l.trim_end();
        if !l.is_empty() {
            warn!(log, "{}: {}", args[0], l);
        }
    }

    Ok(out)
}

/**
 * Run a command that mutates system state.  Under dry-run the command is
 * not executed and Ok(None) is returned; otherwise the output is handed
 * back for inspection regardless of exit status.  Callers that cannot
 * tolerate failure should use run() instead.
 */
pub fn run_output(core: &Core, args: &[&str]) -> Result<Option<Output>> {
    if core.dry_run() {
        info!(core.log(), "dry run; skipping exec: {:?}", args);
        return Ok(None);
    }

    Ok(Some(spawn(core, args)?))
}

/**
 * Run a command that mutates system state, failing unless it exits 0.
 * Under dry-run the command is skipped and the call succeeds.
 */
pub fn run(core: &Core, args: &[&str]) -> Result<()> {
    if let Some(out) = run_output(core, args)? {
        if !out.status.success() {
            bail!("exec {:?}: failed: {}", args, out.info());
        }
    }

    Ok(())
}

/**
 * Run a read-only command and capture its output.  Never skipped by
 * dry-run; the exit status is left to the caller.
 */
pub fn capture(core: &Core, args: &[&str]) -> Result<Output> {
    spawn(core, args)
}

/**
 * Run a read-only command that must succeed, returning trimmed stdout.
 */
pub fn capture_string(core: &Core, args: &[&str]) -> Result<String> {
    let out = capture(core, args)?;
    if !out.status.success() {
        bail!("exec {:?}: failed: {}", args, out.info());
    }

    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}
