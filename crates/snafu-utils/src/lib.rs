//! Error plumbing shared by the arena allocator crates.
//!
//! - [`Location`] is captured implicitly by every error variant so that a
//!   rejected free can be traced back to the check that rejected it.
//! - [`GenericError`] is the catch-all error of binaries.
//! - [`Report`] renders an error followed by its chain of sources, each with
//!   the location recorded through [`ErrorLocation`].

#![no_std]

extern crate alloc;

use alloc::{boxed::Box, string::String, vec, vec::Vec};
use core::{error::Error, fmt};

use snafu::{GenerateImplicitData, Snafu};

/// Source location where an error value was constructed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static core::panic::Location<'static>);

impl Location {
    #[must_use]
    pub fn file(&self) -> &'static str {
        self.0.file()
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.0.line()
    }
}

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(core::panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Snafu)]
#[snafu(whatever, display("{message}"))]
pub struct GenericError {
    message: String,
    #[snafu(implicit)]
    location: Location,
    #[snafu(source(from(Box<dyn Error>, Some)))]
    source: Option<Box<dyn Error>>,
}

/// Errors that know where they were constructed.
pub trait ErrorLocation {
    fn location(&self) -> Option<Location>;
}

impl ErrorLocation for GenericError {
    fn location(&self) -> Option<Location> {
        Some(self.location)
    }
}

type Locator = fn(&(dyn Error + 'static)) -> Option<Location>;

fn locate<T>(error: &(dyn Error + 'static)) -> Option<Location>
where
    T: Error + ErrorLocation + 'static,
{
    error.downcast_ref::<T>()?.location()
}

/// Multi-line rendering of an error and its sources.
///
/// ```text
/// Error: scenario failed
///   at crates/arena-demo/src/main.rs:92:60
///
/// Caused by:
///    0: block at offset 0x40 is already free
///       at crates/arena-alloc/src/buddy.rs:215:13
/// ```
///
/// Locations are shown for [`GenericError`] and for every type registered
/// with [`Report::locate`].
pub struct Report<E> {
    error: E,
    locators: Vec<Locator>,
}

impl<E> fmt::Debug for Report<E>
where
    E: Error + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<E> fmt::Display for Report<E>
where
    E: Error + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Error: {}", self.error)?;
        if let Some(loc) = self.location_of(&self.error) {
            writeln!(f, "  at {loc}")?;
        }
        let mut source = self.error.source();
        if source.is_some() {
            writeln!(f)?;
            writeln!(f, "Caused by:")?;
        }
        let mut index = 0;
        while let Some(s) = source {
            writeln!(f, "{index:4}: {s}")?;
            if let Some(loc) = self.location_of(s) {
                writeln!(f, "      at {loc}")?;
            }
            source = s.source();
            index += 1;
        }
        Ok(())
    }
}

impl<E> Report<E> {
    pub fn new(error: E) -> Self {
        Self {
            error,
            locators: vec![locate::<GenericError> as Locator],
        }
    }

    /// Shows the location of errors of type `T` found in the chain.
    #[must_use]
    pub fn locate<T>(mut self) -> Self
    where
        T: Error + ErrorLocation + 'static,
    {
        self.locators.push(locate::<T>);
        self
    }

    fn location_of(&self, error: &(dyn Error + 'static)) -> Option<Location> {
        self.locators.iter().find_map(|locator| locator(error))
    }
}
