//! Daemon file logger: timestamped lines appended to
//! `<logs>/current.log`, mirrored to stderr when configured. The current
//! file is rotated on startup when non-empty; only the newest N rotations
//! are kept.

use anyhow::Result;
use blah_core::{LoggingConfig, now_millis};
use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    fn parse(value: &str) -> Self {
        match value {
            "debug" => Level::Debug,
            "warn" => Level::Warn,
            "error" => Level::Error,
            _ => Level::Info,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

pub struct Logger {
    path: PathBuf,
    level: Level,
    print: bool,
}

impl Logger {
    /// Open (and rotate) the log directory per config.
    pub fn open(dir: &Path, config: &LoggingConfig) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join("current.log");
        rotate_if_nonempty(dir, &path, config.retain)?;
        Ok(Self {
            path,
            level: Level::parse(&config.level),
            print: config.print,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn debug(&self, msg: &str) {
        self.log(Level::Debug, msg);
    }

    pub fn info(&self, msg: &str) {
        self.log(Level::Info, msg);
    }

    pub fn warn(&self, msg: &str) {
        self.log(Level::Warn, msg);
    }

    pub fn error(&self, msg: &str) {
        self.log(Level::Error, msg);
    }

    fn log(&self, level: Level, msg: &str) {
        if level < self.level {
            return;
        }
        let line = format!("{} {} {msg}", Utc::now().to_rfc3339(), level.as_str());
        if self.print {
            eprintln!("[blah-code] {line}");
        }
        let _ = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{line}"));
    }

    /// The newest `lines` lines of the current log.
    pub fn tail(&self, lines: usize) -> Vec<String> {
        let Ok(content) = fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        let all: Vec<&str> = content.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].iter().map(ToString::to_string).collect()
    }
}

fn rotate_if_nonempty(dir: &Path, current: &Path, retain: usize) -> Result<()> {
    let is_nonempty = fs::metadata(current).map(|m| m.len() > 0).unwrap_or(false);
    if is_nonempty {
        fs::rename(current, dir.join(format!("current-{}.log", now_millis())))?;
    }
    prune_rotated(dir, retain)?;
    Ok(())
}

fn prune_rotated(dir: &Path, retain: usize) -> Result<()> {
    let mut rotated: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("current-") && n.ends_with(".log"))
                .unwrap_or(false)
        })
        .collect();
    rotated.sort();
    if rotated.len() > retain {
        let excess = rotated.len() - retain;
        for path in rotated.into_iter().take(excess) {
            let _ = fs::remove_file(path);
        }
    }
    Ok(())
}
