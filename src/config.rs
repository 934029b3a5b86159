// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::num::NonZeroUsize;

use crate::procs::InstanceSpec;
use crate::template;
use crate::{Error, ErrorKind};

/// What to run, and how many times
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunnerConfig {
    pub instances: NonZeroUsize,
    pub program: String,
    /// Passed to every instance, rendered per instance when `template` is set
    pub args: Vec<String>,
    pub template: bool,
}

impl RunnerConfig {
    pub fn new<P, I, A>(instances: NonZeroUsize, program: P, args: I) -> Self
    where
        P: Into<String>,
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        Self {
            instances,
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            template: true,
        }
    }

    /// The command line of each instance, ids 1 through `instances`
    pub fn instance_specs(&self) -> Result<Vec<InstanceSpec>, Error> {
        (1..=self.instances.get())
            .map(|id| -> Result<InstanceSpec, Error> {
                let args = self
                    .args
                    .iter()
                    .map(|arg| self.render(arg, id))
                    .collect::<Result<Vec<_>, _>>()?;

                Ok(InstanceSpec::new(self.program.clone(), args))
            })
            .collect()
    }

    fn render(&self, arg: &str, id: usize) -> Result<String, Error> {
        if !self.template {
            return Ok(arg.to_string());
        }

        template::render(arg, id).map_err(|source| {
            ErrorKind::Template {
                argument: arg.to_string(),
                source,
            }
            .into()
        })
    }
}
