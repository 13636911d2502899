/*
 * Copyright 2024 Oxide Computer Company
 */

/*!
 * The message sink the rest of the crate emits into.  Two orthogonal
 * destinations (console and file) hang off one slog Logger, behind a
 * process-global severity gate that drops records before any formatting
 * work.  Additional destinations may be registered process-wide.
 */

use std::fs::OpenOptions;
use std::io;
use std::panic::{RefUnwindSafe, UnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use atty::Stream;
use slog::{o, Drain, Logger, OwnedKVList, Record};

/**
 * Message severities, least to most verbose.  NONE suppresses everything.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    None = 0,
    Emergency = 1,
    Error = 2,
    Warn = 3,
    Info = 4,
    Trace = 5,
}

impl Level {
    /**
     * Each -v on a CLI raises the level one notch from the WARN default.
     */
    pub fn from_verbosity(n: usize) -> Level {
        match n {
            0 => Level::Warn,
            1 => Level::Info,
            _ => Level::Trace,
        }
    }
}

/*
 * The current gate.  Stored as the numeric rank so the hot path is a
 * single atomic load.
 */
static GATE: AtomicUsize = AtomicUsize::new(Level::Warn as usize);

pub fn set_level(l: Level) {
    GATE.store(l as usize, Ordering::SeqCst);
}

pub fn level() -> Level {
    match GATE.load(Ordering::SeqCst) {
        0 => Level::None,
        1 => Level::Emergency,
        2 => Level::Error,
        3 => Level::Warn,
        4 => Level::Info,
        _ => Level::Trace,
    }
}

fn rank(l: slog::Level) -> usize {
    match l {
        slog::Level::Critical => Level::Emergency as usize,
        slog::Level::Error => Level::Error as usize,
        slog::Level::Warning => Level::Warn as usize,
        slog::Level::Info => Level::Info as usize,
        slog::Level::Debug | slog::Level::Trace => Level::Trace as usize,
    }
}

fn passes(l: slog::Level) -> bool {
    let gate = GATE.load(Ordering::SeqCst);
    gate != 0 && rank(l) <= gate
}

fn level_of(l: slog::Level) -> Level {
    match l {
        slog::Level::Critical => Level::Emergency,
        slog::Level::Error => Level::Error,
        slog::Level::Warning => Level::Warn,
        slog::Level::Info => Level::Info,
        slog::Level::Debug | slog::Level::Trace => Level::Trace,
    }
}

type Hook = Box<dyn Fn(Level, &str) + Send + Sync>;

static HOOKS: Mutex<Vec<Hook>> = Mutex::new(Vec::new());

/**
 * Register an extra destination.  Registration is process-global and
 * permanent; every message that passes the gate is delivered, regardless
 * of the console/file configuration.
 */
pub fn register_destination(hook: Hook) {
    if let Ok(mut h) = HOOKS.lock() {
        h.push(hook);
    }
}

pub struct Config {
    pub level: Level,
    pub console: bool,
    pub file: Option<PathBuf>,
    pub utc_timestamps: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            level: Level::Warn,
            console: true,
            file: None,
            utc_timestamps: false,
        }
    }
}

type SinkDrain =
    Box<dyn Drain<Ok = (), Err = slog::Never> + Send + Sync + RefUnwindSafe + UnwindSafe>;

struct Sink {
    console: Option<SinkDrain>,
    file: Option<SinkDrain>,
}

impl Drain for Sink {
    type Ok = ();
    type Err = slog::Never;

    fn log(&self, record: &Record, kv: &OwnedKVList)
        -> std::result::Result<(), slog::Never>
    {
        if !passes(record.level()) {
            return Ok(());
        }

        if let Some(c) = &self.console {
            c.log(record, kv)?;
        }
        if let Some(f) = &self.file {
            f.log(record, kv)?;
        }

        if let Ok(hooks) = HOOKS.lock() {
            if !hooks.is_empty() {
                let msg = format!("{}", record.msg());
                for h in hooks.iter() {
                    h(level_of(record.level()), &msg);
                }
            }
        }

        Ok(())
    }
}

fn no_timestamp(w: &mut dyn io::Write) -> io::Result<()> {
    write!(w, "")
}

/**
 * Initialise a logger for the requested destinations.  The interactive
 * console gets the compact format; a pipe or a file gets the full one.
 */
pub fn init(config: &Config) -> Result<Logger> {
    set_level(config.level);

    let console: Option<SinkDrain> = if config.console {
        let dec = slog_term::TermDecorator::new().stdout().build();
        if atty::is(Stream::Stdout) {
            let mut f = slog_term::CompactFormat::new(dec);
            if config.utc_timestamps {
                f = f.use_utc_timestamp();
            } else {
                f = f.use_custom_timestamp(no_timestamp);
            }
            Some(Box::new(Mutex::new(f.build()).fuse()))
        } else {
            let mut f = slog_term::FullFormat::new(dec).use_original_order();
            if config.utc_timestamps {
                f = f.use_utc_timestamp();
            } else {
                f = f.use_custom_timestamp(no_timestamp);
            }
            Some(Box::new(Mutex::new(f.build()).fuse()))
        }
    } else {
        None
    };

    let file: Option<SinkDrain> = if let Some(path) = &config.file {
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        let dec = slog_term::PlainDecorator::new(f);
        let mut fmt = slog_term::FullFormat::new(dec).use_original_order();
        if config.utc_timestamps {
            fmt = fmt.use_utc_timestamp();
        } else {
            fmt = fmt.use_custom_timestamp(no_timestamp);
        }
        Some(Box::new(Mutex::new(fmt.build()).fuse()))
    } else {
        None
    };

    Ok(Logger::root(Sink { console, file }, o!()))
}

#[cfg(test)]
mod test {
    use super::*;
    use slog::{info, warn};
    use std::sync::Arc;

    #[test]
    fn verbosity_mapping() {
        assert_eq!(Level::from_verbosity(0), Level::Warn);
        assert_eq!(Level::from_verbosity(1), Level::Info);
        assert_eq!(Level::from_verbosity(2), Level::Trace);
        assert_eq!(Level::from_verbosity(9), Level::Trace);
    }

    /*
     * The gate and the hook registry are process-global; messages are
     * tagged so concurrent tests cannot pollute the assertion.
     */
    /*
     * init() stores the configured level in the global gate, so tests
     * that construct loggers must not interleave.
     */
    static SERIAL: Mutex<()> = Mutex::new(());

    #[test]
    fn gate_and_hooks() {
        let _guard = SERIAL.lock().unwrap();
        let seen = Arc::new(Mutex::new(Vec::<(Level, String)>::new()));
        let seen2 = Arc::clone(&seen);
        register_destination(Box::new(move |l, m| {
            if m.starts_with("gate-test:") {
                seen2.lock().unwrap().push((l, m.to_string()));
            }
        }));

        let log = init(&Config {
            level: Level::Warn,
            console: false,
            file: None,
            utc_timestamps: false,
        })
        .unwrap();

        info!(log, "gate-test: dropped below the gate");
        warn!(log, "gate-test: kept");

        set_level(Level::Info);
        info!(log, "gate-test: kept now");

        let seen = seen.lock().unwrap();
        let msgs = seen.iter().map(|(_, m)| m.as_str()).collect::<Vec<_>>();
        assert_eq!(msgs,
            vec!["gate-test: kept", "gate-test: kept now"]);
        assert_eq!(seen[0].0, Level::Warn);
    }

    #[test]
    fn file_destination_receives_messages() {
        let _guard = SERIAL.lock().unwrap();
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("install_log");

        let log = init(&Config {
            level: Level::Warn,
            console: false,
            file: Some(path.clone()),
            utc_timestamps: false,
        })
        .unwrap();

        warn!(log, "file-test: something notable");
        drop(log);

        let data = std::fs::read_to_string(&path).unwrap();
        assert!(data.contains("file-test: something notable"));
    }
}
