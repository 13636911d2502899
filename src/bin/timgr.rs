/*
 * Copyright 2024 Oxide Computer Company
 */

/*!
 * Instantiation wrapper: reads a JSON-serialized attribute set produced
 * by the host binding and creates or releases the target it describes.
 * The exit code is the numeric instantiation error, or zero on success.
 */

use std::io::Read;
use std::process::exit;

use anyhow::{anyhow, bail, Context, Result};
use slog::crit;

use target_tools::attr::AttrSet;
use target_tools::{logger, ti, Core};

fn usage(opts: &getopts::Options) {
    let s = opts.usage("timgr create|release [-n] [-v] FILE");
    println!("{}", s);
}

fn load_attrs(path: &str) -> Result<AttrSet> {
    let data = if path == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| anyhow!("reading {}", path))?
    };

    Ok(serde_json::from_str(&data)
        .with_context(|| anyhow!("parsing {}", path))?)
}

fn main() -> Result<()> {
    let cmd = match std::env::args().nth(1) {
        Some(c) => c,
        None => {
            usage(&getopts::Options::new());
            exit(1);
        }
    };

    let mut opts = getopts::Options::new();
    opts.optflag("n", "", "dry run; validate and log only");
    opts.optflagmulti("v", "", "raise log verbosity (repeatable)");

    let mat = match opts.parse(std::env::args().skip(2)) {
        Ok(mat) => mat,
        Err(e) => {
            usage(&opts);
            eprintln!("invalid options: {}", e);
            exit(1);
        }
    };

    let file = match mat.free.first() {
        Some(f) => f.clone(),
        None => {
            usage(&opts);
            exit(1);
        }
    };

    let log = logger::init(&logger::Config {
        level: logger::Level::from_verbosity(mat.opt_count("v")),
        ..logger::Config::default()
    })?;

    let core = Core::new(log.clone());
    core.set_dry_run(mat.opt_present("n"));

    let attrs = load_attrs(&file)?;

    let r = match cmd.as_str() {
        "create" => ti::ti_create(&core, &attrs),
        "release" => ti::ti_release(&core, &attrs),
        n => {
            usage(&opts);
            bail!("invalid command: {}", n);
        }
    };

    if let Err(e) = r {
        crit!(log, "{} failed: {}", cmd, e);
        exit(e.code());
    }

    Ok(())
}
