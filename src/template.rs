// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-instance argument templating
//!
//! `{instance_id}` is replaced by the 1-based id of the instance being started,
//! `{{` and `}}` produce literal braces.

use thiserror::Error;

pub const INSTANCE_ID: &str = "instance_id";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown placeholder {{{0}}}")]
    UnknownPlaceholder(String),
    #[error("unclosed placeholder")]
    Unclosed,
    #[error("unmatched '}}'")]
    UnmatchedClose,
}

/// Render `template` for the instance with the given id
pub fn render(template: &str, instance_id: usize) -> Result<String, TemplateError> {
    let mut rendered = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                rendered.push('{');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => return Err(TemplateError::Unclosed),
                    }
                }

                if name.trim() != INSTANCE_ID {
                    return Err(TemplateError::UnknownPlaceholder(name));
                }

                rendered.push_str(&instance_id.to_string());
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                rendered.push('}');
            }
            '}' => return Err(TemplateError::UnmatchedClose),
            c => rendered.push(c),
        }
    }

    Ok(rendered)
}
