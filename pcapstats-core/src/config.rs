//! Line-oriented configuration format. Deliberately not TOML: the wire
//! format itself — `Keyword Value`, `#` comments, unknown keywords are
//! fatal — is a defined external interface, not an ambient concern a
//! generic `toml`/`serde` loader gets to pick for us.

use crate::error::Error;
use crate::fragment::OverlapModel;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Emerg,
    Alert,
    Crit,
    Err,
    Warning,
    Notice,
    Info,
    Debug,
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_ascii_uppercase().as_str() {
            "EMERG" => Ok(LogLevel::Emerg),
            "ALERT" => Ok(LogLevel::Alert),
            "CRIT" => Ok(LogLevel::Crit),
            "ERR" => Ok(LogLevel::Err),
            "WARNING" => Ok(LogLevel::Warning),
            "NOTICE" => Ok(LogLevel::Notice),
            "INFO" => Ok(LogLevel::Info),
            "DEBUG" => Ok(LogLevel::Debug),
            other => Err(Error::Config(format!("unknown LogLevel '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: LogLevel,
    pub frag_age_limit: u64,
    pub frag_max_mem: usize,
    pub frag_model: OverlapModel,
    pub flow_max_mem: usize,
    pub flow_age_limit: u64,
    pub host_max_mem: usize,
    pub host_age_limit: u64,
    /// Run aging expiry on a dedicated thread instead of inline after
    /// every packet. See `sweeper::BackgroundSweeper`.
    pub background_sweeper: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Notice,
            frag_age_limit: 60,
            frag_max_mem: 4 << 20,
            frag_model: OverlapModel::First,
            flow_max_mem: 16 << 20,
            flow_age_limit: 300,
            host_max_mem: 16 << 20,
            host_age_limit: 300,
            background_sweeper: false,
        }
    }
}

const MIN_MAX_MEM: usize = 1024;

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let text = fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("could not read {}: {e}", path.as_ref().display())))?;
        Self::from_str_lines(&text)
    }

    /// Parses the `Keyword Value` line format directly; a single bad
    /// line fails the whole load, matching `read_config_file`'s
    /// all-or-nothing contract.
    pub fn from_str_lines(text: &str) -> Result<Self, Error> {
        let mut config = Config::default();

        for (lineno, raw_line) in text.lines().enumerate() {
            let linenum = lineno + 1;
            let line = strip_comment(raw_line).trim();
            if line.is_empty() {
                continue;
            }

            let mut parts = line.splitn(2, char::is_whitespace);
            let keyword = parts.next().unwrap_or_default();
            let value = parts.next().unwrap_or_default().trim();

            if value.is_empty() {
                return Err(Error::Config(format!("missing value for '{keyword}' at line {linenum}")));
            }

            apply_keyword(&mut config, keyword, value, linenum)?;
        }

        Ok(config)
    }

    /// Applied on `SIGHUP`. Rejects any change to table geometry
    /// (`*MaxMem`/`*AgeLimit`); on rejection the running configuration is
    /// left untouched.
    pub fn reload(&mut self, candidate: Config) -> Result<(), Error> {
        if candidate.frag_max_mem != self.frag_max_mem {
            return Err(Error::Config("changing FragMaxMem requires a restart".to_string()));
        }
        if candidate.flow_max_mem != self.flow_max_mem {
            return Err(Error::Config("changing FlowMaxMem requires a restart".to_string()));
        }
        if candidate.host_max_mem != self.host_max_mem {
            return Err(Error::Config("changing HostMaxMem requires a restart".to_string()));
        }
        if candidate.frag_age_limit != self.frag_age_limit {
            return Err(Error::Config("changing FragAgeLimit requires a restart".to_string()));
        }
        if candidate.flow_age_limit != self.flow_age_limit {
            return Err(Error::Config("changing FlowAgeLimit requires a restart".to_string()));
        }
        if candidate.host_age_limit != self.host_age_limit {
            return Err(Error::Config("changing HostAgeLimit requires a restart".to_string()));
        }
        if candidate.background_sweeper != self.background_sweeper {
            return Err(Error::Config("changing BackgroundSweeper requires a restart".to_string()));
        }

        *self = candidate;
        Ok(())
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn apply_keyword(config: &mut Config, keyword: &str, value: &str, linenum: usize) -> Result<(), Error> {
    match keyword {
        "LogLevel" => {
            config.log_level = value.parse().map_err(|e| {
                warn!(line = linenum, "bad LogLevel value");
                e
            })?;
        }
        "FragAgeLimit" => config.frag_age_limit = parse_u64(value, linenum)?,
        "FragMaxMem" => config.frag_max_mem = parse_max_mem(value, linenum, "FragMaxMem")?,
        "FragModel" => config.frag_model = value.parse()?,
        "FlowMaxMem" => config.flow_max_mem = parse_max_mem(value, linenum, "FlowMaxMem")?,
        "FlowAgeLimit" => config.flow_age_limit = parse_u64(value, linenum)?,
        "HostMaxMem" => config.host_max_mem = parse_max_mem(value, linenum, "HostMaxMem")?,
        "HostAgeLimit" => config.host_age_limit = parse_u64(value, linenum)?,
        "BackgroundSweeper" => config.background_sweeper = parse_bool(value, linenum)?,
        other => return Err(Error::Config(format!("bad option '{other}' at line {linenum}"))),
    }
    Ok(())
}

fn parse_u64(value: &str, linenum: usize) -> Result<u64, Error> {
    value.parse().map_err(|_| Error::Config(format!("bad integer '{value}' at line {linenum}")))
}

fn parse_bool(value: &str, linenum: usize) -> Result<bool, Error> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" => Ok(true),
        "no" | "false" => Ok(false),
        other => Err(Error::Config(format!("bad boolean '{other}' at line {linenum}"))),
    }
}

fn parse_max_mem(value: &str, linenum: usize, keyword: &str) -> Result<usize, Error> {
    let parsed: usize = value.parse().map_err(|_| Error::Config(format!("bad integer '{value}' at line {linenum}")))?;
    if parsed < MIN_MAX_MEM {
        return Err(Error::Config(format!("minimum {keyword} value is {MIN_MAX_MEM}")));
    }
    Ok(parsed)
}
