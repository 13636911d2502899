/*
 * Copyright 2024 Oxide Computer Company
 */

/*!
 * Test bench for target discovery: run a full enumeration and print what
 * was found, or list the partitions or slices of one disk.
 */

use std::process::exit;

use anyhow::Result;
use slog::crit;

use target_tools::attr::AttrSet;
use target_tools::td::{Discovery, ObjectKind};
use target_tools::{logger, Core};

fn usage(opts: &getopts::Options) {
    let s = opts.usage("tdmgtst [-v] -d | -p DISK | -s DISK");
    println!("{}", s);
}

fn print_object(a: &AttrSet) {
    let mut names: Vec<&str> = a.iter().map(|(n, _)| n).collect();
    names.sort_unstable();
    for n in names {
        if let Some(v) = a.value(n) {
            println!("\t{} = {}", n, v);
        }
    }
}

fn main() -> Result<()> {
    let mut opts = getopts::Options::new();
    opts.optflag("d", "", "discover and print every object");
    opts.optopt("p", "", "list partitions of one disk", "DISK");
    opts.optopt("s", "", "list slices of one disk", "DISK");
    opts.optflagmulti("v", "", "raise log verbosity (repeatable)");

    let mat = match opts.parse(std::env::args().skip(1)) {
        Ok(mat) => mat,
        Err(e) => {
            usage(&opts);
            eprintln!("invalid options: {}", e);
            exit(1);
        }
    };

    let log = logger::init(&logger::Config {
        level: logger::Level::from_verbosity(mat.opt_count("v")),
        ..logger::Config::default()
    })?;

    let core = Core::new(log.clone());
    let mut d = Discovery::new(&core);

    if mat.opt_present("d") {
        let kinds = [
            ObjectKind::Disk,
            ObjectKind::Partition,
            ObjectKind::Slice,
            ObjectKind::Os,
        ];

        for kind in kinds.iter() {
            match d.discover(*kind) {
                Ok(n) => {
                    println!("{} {} object(s):", n, kind.label());
                }
                Err(e) => {
                    crit!(log, "discovery of {} objects failed: {}",
                        kind.label(), e);
                    exit(1);
                }
            }

            let mut i = 0;
            while d.get_next(*kind) {
                if let Some(a) = d.attributes(*kind) {
                    println!("    {} {}:", kind.label(), i);
                    print_object(a);
                }
                i += 1;
            }
        }
        return Ok(());
    }

    if let Some(disk) = mat.opt_str("p") {
        match d.partitions_of_disk(&disk) {
            Ok(parts) => {
                println!("{} partition(s) on {}:", parts.len(), disk);
                for p in parts {
                    print_object(p);
                }
            }
            Err(e) => {
                crit!(log, "{}: {}", disk, e);
                exit(1);
            }
        }
        return Ok(());
    }

    if let Some(disk) = mat.opt_str("s") {
        match d.slices_of_disk(&disk) {
            Ok(slices) => {
                println!("{} slice(s) on {}:", slices.len(), disk);
                for s in slices {
                    print_object(s);
                }
            }
            Err(e) => {
                crit!(log, "{}: {}", disk, e);
                exit(1);
            }
        }
        return Ok(());
    }

    usage(&opts);
    exit(1);
}
