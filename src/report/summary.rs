use std::{
    fs::File,
    io::{self, Read, Write},
    path::Path,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::alloc::{
    ledger::{AllocRecord, Ledger},
    stats::{Counters, Statistics},
};

/// Everything the tracer knows at shutdown, in a form that can be written to
/// disk
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub statistics: Statistics,
    pub counters: Counters,
    /// Live records, oldest first
    pub leaks: Vec<AllocRecord>,
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("report i/o failed: {0}")]
    IoError(#[from] io::Error),
    #[error("report is not valid json: {0}")]
    SerdeJsonError(#[from] serde_json::Error),
}

impl Report {
    pub fn new(counters: &Counters, ledger: &Ledger) -> Self {
        Self {
            statistics: counters.statistics(),
            counters: *counters,
            leaks: ledger.live().copied().collect(),
        }
    }

    pub fn leaked_bytes(&self) -> u64 {
        self.leaks.iter().map(|r| r.size as u64).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.leaks.is_empty() && self.counters.illegal_frees == 0 && self.counters.double_frees == 0
    }

    pub fn write_to_file<P>(&self, path: P) -> Result<(), ReportError>
    where
        P: AsRef<Path>,
    {
        let mut file = File::create(path)?;
        file.write_all(&serde_json::to_vec_pretty(self)?)?;
        file.write_all(b"\n")?;
        Ok(())
    }

    pub fn from_file<P>(path: P) -> Result<Self, ReportError>
    where
        P: AsRef<Path>,
    {
        let mut file = File::open(path)?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        Ok(serde_json::from_str(&buf)?)
    }
}
