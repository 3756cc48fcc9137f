/*
 * Copyright (C) 2024 The Helmsman Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::error::Error;
use std::fmt;

pub type DynError = Box<dyn Error + Send + Sync>;

#[derive(Debug)]
struct ContextError {
    context: String,
    source: Box<dyn Error + Send + Sync>,
}

impl ContextError {
    fn new(context: impl Into<String>, source: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self {
            context: context.into(),
            source: source.into(),
        }
    }
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.source)
    }
}

impl Error for ContextError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.source.as_ref())
    }
}

#[derive(Debug)]
struct SimpleError(String);

impl SimpleError {
    fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl fmt::Display for SimpleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for SimpleError {}

pub fn with_context<E>(error: E, context: impl Into<String>) -> Box<dyn Error + Send + Sync>
where
    E: Into<Box<dyn Error + Send + Sync>>,
{
    Box::new(ContextError::new(context, error))
}

pub fn new_error(message: impl Into<String>) -> Box<dyn Error + Send + Sync> {
    Box::new(SimpleError::new(message))
}

/// The leader lease guarding a store mutation was no longer held.
///
/// The controller treats this as a signal to abort the current tick,
/// resign, and campaign again. It is never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LostLeadership;

impl fmt::Display for LostLeadership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "leadership lost: guarded store write was rejected")
    }
}

impl Error for LostLeadership {}

/// Walks the source chain looking for a `LostLeadership` marker.
pub fn is_lost_leadership(err: &DynError) -> bool {
    if err.downcast_ref::<LostLeadership>().is_some() {
        return true;
    }
    let mut source = err.source();
    while let Some(cause) = source {
        if cause.downcast_ref::<LostLeadership>().is_some() {
            return true;
        }
        source = cause.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_context_preserves_source() {
        let inner = new_error("boom");
        let wrapped = with_context(inner, "while testing");
        assert_eq!(wrapped.to_string(), "while testing: boom");
        assert!(wrapped.source().is_some());
    }

    #[test]
    fn lost_leadership_is_found_through_context() {
        let err: DynError = Box::new(LostLeadership);
        let wrapped = with_context(err, "updating record");
        assert!(is_lost_leadership(&wrapped));

        let plain = new_error("unrelated");
        assert!(!is_lost_leadership(&plain));
    }
}
