//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Validation failures
//! here are startup errors, intentionally.

use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use serde::Deserialize;

/// Errors produced by [`Config`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<std::io::Error>,
    },
}

/// Errors produced by [`Retentions`] validation.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionsError {
    /// The retention list was empty.
    #[error("retention list may not be empty")]
    Empty,
    /// A retention duration was zero or negative.
    #[error("retention durations must be positive, got {0}")]
    NonPositive(i64),
    /// The retention list was not strictly increasing.
    #[error("retention durations must be strictly increasing: {prev} then {next}")]
    NotIncreasing {
        /// The earlier duration.
        prev: i64,
        /// The offending successor.
        next: i64,
    },
}

/// The ordered rollup windows of the daemon, in seconds.
///
/// Strictly increasing; index 0 is the flush interval, the finest grain.
/// Immutable for a process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Vec<i64>")]
pub struct Retentions(Vec<i64>);

impl Retentions {
    /// Validate and build a retention schedule.
    ///
    /// # Errors
    ///
    /// Returns an error if `levels` is empty, holds a non-positive duration
    /// or is not strictly increasing.
    pub fn new(levels: Vec<i64>) -> Result<Self, RetentionsError> {
        if levels.is_empty() {
            return Err(RetentionsError::Empty);
        }
        for window in levels.windows(2) {
            if window[1] <= window[0] {
                return Err(RetentionsError::NotIncreasing {
                    prev: window[0],
                    next: window[1],
                });
            }
        }
        if let Some(&level) = levels.iter().find(|&&level| level <= 0) {
            return Err(RetentionsError::NonPositive(level));
        }
        Ok(Self(levels))
    }

    /// The flush interval, retention level 0.
    #[must_use]
    pub fn interval(&self) -> i64 {
        self.0[0]
    }

    /// Every retention level, finest first.
    #[must_use]
    pub fn levels(&self) -> &[i64] {
        &self.0
    }

    /// The levels coarser than the flush interval.
    #[must_use]
    pub fn coarse(&self) -> &[i64] {
        &self.0[1..]
    }
}

impl TryFrom<Vec<i64>> for Retentions {
    type Error = RetentionsError;

    fn try_from(levels: Vec<i64>) -> Result<Self, Self::Error> {
        Self::new(levels)
    }
}

fn default_listen() -> SocketAddr {
    "0.0.0.0:8125".parse().expect("valid socket address")
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
/// Selection of the backing store.
pub enum StoreConfig {
    /// Keep everything in process memory.
    Memory,
    /// Persist to a Redis instance.
    Redis(stowage_store::redis::Config),
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory
    }
}

/// Main configuration struct for this program.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The rollup windows, in seconds. The first is the flush interval.
    pub retentions: Retentions,
    /// Worker pool configuration.
    #[serde(default)]
    pub pool: stowage_pool::Config,
    /// The address the UDP receiver binds to.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// The backing store.
    #[serde(default)]
    pub store: StoreConfig,
}

impl Config {
    /// Load configuration from the YAML file at `path`.
    ///
    /// # Errors
    ///
    /// Function will return an error if the file cannot be read or does not
    /// deserialize into a valid configuration.
    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        Ok(serde_yaml::from_str(&contents)?)
    }
}
