// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Labeled output of all instances
//!
//! Every line read from a child, and every status change of an instance, is
//! emitted as a single [`Record`]. A [`Sink`] must write each record atomically,
//! lines from different instances may interleave but a line is never torn.

use std::fmt;
use std::io::{self, Write};
use std::sync::Mutex;

/// The child output stream a line was read from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn as_str(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    /// One complete line of child output, without its line terminator
    Output {
        id: usize,
        stream: Stream,
        line: String,
    },
    /// Lifecycle of an instance, i.e. started or exited successfully
    Status { id: usize, message: String },
    /// Failures attributed to an instance
    Error { id: usize, message: String },
    /// Supervisor level notices
    Notice(String),
}

impl Record {
    /// The instance this record belongs to, if any
    pub fn id(&self) -> Option<usize> {
        match *self {
            Record::Output { id, .. } | Record::Status { id, .. } | Record::Error { id, .. } => {
                Some(id)
            }
            Record::Notice(_) => None,
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Record::Output { id, stream, line } => write!(f, "[{:3}] {}: {}", id, stream, line),
            Record::Status { id, message } => write!(f, "[{:3}] {}", id, message),
            Record::Error { id, message } => write!(f, "[{:3}] error: {}", id, message),
            Record::Notice(message) => f.write_str(message),
        }
    }
}

/// Destination for records, shared by every reader and waiter task
pub trait Sink: Send + Sync {
    /// Write one record, atomically with respect to other calls
    fn emit(&self, record: Record);
}

/// Child output to stdout, everything else to stderr
#[derive(Clone, Copy, Debug, Default)]
pub struct Console;

impl Sink for Console {
    fn emit(&self, record: Record) {
        // the std handles are locked for the whole line, write errors (closed pipe) are dropped
        let result = match record {
            Record::Output { .. } => writeln!(io::stdout().lock(), "{}", record),
            _ => writeln!(io::stderr().lock(), "{}", record),
        };

        if let Err(e) = result {
            tracing::debug!("failed to write record: {}", e);
        }
    }
}

/// Keeps all records in memory, in emission order
#[derive(Debug, Default)]
pub struct Collector {
    records: Mutex<Vec<Record>>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Record> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// All output lines of one instance and stream, in order
    pub fn lines(&self, id: usize, stream: Stream) -> Vec<String> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                Record::Output {
                    id: i,
                    stream: s,
                    line,
                } if i == id && s == stream => Some(line),
                _ => None,
            })
            .collect()
    }
}

impl Sink for Collector {
    fn emit(&self, record: Record) {
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }
}
