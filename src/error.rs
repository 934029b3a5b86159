// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;

use thiserror::Error;

use crate::output::Stream;
use crate::template::TemplateError;

#[derive(Error, Debug)]
pub enum ErrorKind {
    #[error("io error: {0}")]
    IoError(#[from] io::Error),
    #[error("cannot spawn {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("cannot create {0} pipe")]
    MissingPipe(Stream),
    #[error("cannot render argument {argument:?}: {source}")]
    Template {
        argument: String,
        source: TemplateError,
    },
    #[error("cannot start instance {id}: {source}")]
    Start { id: usize, source: Box<Error> },
    #[error("cannot send SIGKILL to instance {id}: {source}")]
    Kill { id: usize, source: nix::Error },
    #[error("instance {0} is not running")]
    NotRunning(usize),
    #[error("waiting task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("an error occured: {0}")]
    ErrorStr(&'static str),
}

#[derive(Error, Debug)]
#[error(transparent)]
pub struct Error(ErrorKind);

impl Error {
    fn from_kind(kind: ErrorKind) -> Self {
        Self(kind)
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }
}

impl<E> From<E> for Error
where
    E: Into<ErrorKind>,
{
    fn from(err: E) -> Self {
        Self::from_kind(err.into())
    }
}

impl From<&'static str> for Error {
    fn from(err: &'static str) -> Self {
        Self::from_kind(ErrorKind::ErrorStr(err))
    }
}
