// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Run many instances of a program in parallel
//!
//! Output of every instance is labeled with its id, the supervisor waits for all of
//! them to exit, including after an interrupt.

pub mod config;
mod error;
pub mod output;
pub mod procs;
pub mod signals;
pub mod template;

pub use error::{Error, ErrorKind};
