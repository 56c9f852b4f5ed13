//! Instance config store — parse and rewrite `redis.conf`.
//!
//! The file is a list of `<key> <value>` directives. Unknown directives are
//! kept verbatim and in order; recognised ones get typed accessors. Comment
//! and blank lines are dropped on parse.
//!
//! Writing puts one space between key and value and ends every line with
//! `\n`. Whitespace before the key, between key and value, and after the
//! value is normalized away; whitespace inside the value is kept. Text
//! already in that form round-trips byte for byte.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

pub const PORT: &str = "port";
pub const REQUIRE_PASS: &str = "requirepass";
pub const DIR: &str = "dir";
pub const PIDFILE: &str = "pidfile";
pub const LOGFILE: &str = "logfile";
pub const SAVE: &str = "save";
pub const DBFILENAME: &str = "dbfilename";

/// Snapshot file name when `dbfilename` is not set.
pub const DEFAULT_DBFILENAME: &str = "dump.rdb";

#[derive(Debug, Error)]
pub enum ConfError {
    #[error("failed to access {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("line {line}: directive {content:?} has no value")]
    Parse { line: usize, content: String },

    #[error("directive {0} is not set")]
    Missing(&'static str),

    #[error("directive {key} has invalid value {value:?}")]
    Invalid { key: &'static str, value: String },
}

pub type ConfResult<T> = Result<T, ConfError>;

/// One `<key> <value>` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub key: String,
    pub value: String,
}

/// An ordered set of directives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedisConf {
    directives: Vec<Directive>,
}

impl RedisConf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse config text.
    pub fn parse(text: &str) -> ConfResult<Self> {
        let mut directives = Vec::new();
        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(char::is_whitespace) else {
                return Err(ConfError::Parse {
                    line: index + 1,
                    content: line.to_string(),
                });
            };
            let value = value.trim();
            if value.is_empty() {
                return Err(ConfError::Parse {
                    line: index + 1,
                    content: line.to_string(),
                });
            }
            directives.push(Directive {
                key: key.to_string(),
                value: value.to_string(),
            });
        }
        Ok(Self { directives })
    }

    /// Load and parse a config file.
    pub fn load(path: &Path) -> ConfResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Write the config to `path` through a sibling temp file and rename.
    pub fn save(&self, path: &Path) -> ConfResult<()> {
        let io_err = |source| ConfError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, self.to_string()).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)?;
        debug!(?path, directives = self.directives.len(), "config written");
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Directive> {
        self.directives.iter()
    }

    pub fn len(&self) -> usize {
        self.directives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }

    /// First value of `key`. Keys compare case-insensitively.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.directives
            .iter()
            .find(|d| d.key.eq_ignore_ascii_case(key))
            .map(|d| d.value.as_str())
    }

    /// Every value of a repeatable key such as `save`.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.directives
            .iter()
            .filter(move |d| d.key.eq_ignore_ascii_case(key))
            .map(|d| d.value.as_str())
    }

    /// Replace the first occurrence of `key` in place, or append it.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .directives
            .iter_mut()
            .find(|d| d.key.eq_ignore_ascii_case(key))
        {
            Some(directive) => directive.value = value,
            None => self.directives.push(Directive {
                key: key.to_string(),
                value,
            }),
        }
    }

    /// Replace every occurrence of `key` with `values`, keeping the position
    /// of the first occurrence.
    pub fn set_all(&mut self, key: &str, values: &[&str]) {
        let position = self
            .directives
            .iter()
            .position(|d| d.key.eq_ignore_ascii_case(key))
            .unwrap_or(self.directives.len());
        self.directives.retain(|d| !d.key.eq_ignore_ascii_case(key));
        let position = position.min(self.directives.len());
        let replacement = values.iter().map(|value| Directive {
            key: key.to_string(),
            value: value.to_string(),
        });
        self.directives.splice(position..position, replacement);
    }

    /// Remove every occurrence of `key`. Returns whether any existed.
    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.directives.len();
        self.directives.retain(|d| !d.key.eq_ignore_ascii_case(key));
        before != self.directives.len()
    }

    /// Copy the named keys from `src`; keys `src` lacks are left untouched.
    pub fn copy_from(&mut self, src: &RedisConf, keys: &[&str]) {
        for key in keys {
            let values: Vec<&str> = src.get_all(key).collect();
            if !values.is_empty() {
                self.set_all(key, &values);
            }
        }
    }

    // ── Typed accessors ────────────────────────────────────────────

    pub fn port(&self) -> ConfResult<u16> {
        let value = self.get(PORT).ok_or(ConfError::Missing(PORT))?;
        match value.parse::<u16>() {
            Ok(port) if port > 0 => Ok(port),
            _ => Err(ConfError::Invalid {
                key: PORT,
                value: value.to_string(),
            }),
        }
    }

    pub fn require_pass(&self) -> Option<&str> {
        self.get(REQUIRE_PASS)
    }

    /// The `save` policy, opaque.
    pub fn save_policy(&self) -> Option<&str> {
        self.get(SAVE)
    }

    pub fn dir(&self) -> Option<PathBuf> {
        self.get(DIR).map(|d| PathBuf::from(unquote(d)))
    }

    pub fn pidfile(&self) -> Option<PathBuf> {
        self.get(PIDFILE).map(|p| PathBuf::from(unquote(p)))
    }

    pub fn logfile(&self) -> Option<PathBuf> {
        self.get(LOGFILE).map(|p| PathBuf::from(unquote(p)))
    }

    /// Where the server writes its snapshot: `dir` joined with `dbfilename`.
    pub fn snapshot_path(&self) -> ConfResult<PathBuf> {
        let dir = self.dir().ok_or(ConfError::Missing(DIR))?;
        let file = self.get(DBFILENAME).map(unquote).unwrap_or(DEFAULT_DBFILENAME);
        Ok(dir.join(file))
    }
}

impl fmt::Display for RedisConf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for directive in &self.directives {
            writeln!(f, "{} {}", directive.key, directive.value)?;
        }
        Ok(())
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}
