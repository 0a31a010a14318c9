//! Environment variable helpers
//!
//! [`EnvReader`] reads every variable a component needs and remembers what was
//! missing or unparsable, so configuration errors are reported together
//! instead of one restart at a time.

use std::fmt::Display;
use std::str::FromStr;

use crate::error::{CommonError, Result};

type Lookup<'a> = Box<dyn Fn(&str) -> Option<String> + 'a>;

/// Collecting reader over environment variables
pub struct EnvReader<'a> {
    lookup: Lookup<'a>,
    missing: Vec<String>,
    invalid: Vec<CommonError>,
}

impl EnvReader<'static> {
    /// Reader over the process environment
    pub fn new() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }
}

impl Default for EnvReader<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> EnvReader<'a> {
    /// Reader over an arbitrary lookup function (used by tests)
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + 'a,
    {
        Self {
            lookup: Box::new(lookup),
            missing: Vec::new(),
            invalid: Vec::new(),
        }
    }

    /// Value of `name`; blank values count as unset
    pub fn optional(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// First set variable among `names`
    pub fn first_of(&self, names: &[&str]) -> Option<String> {
        names.iter().find_map(|name| self.optional(name))
    }

    /// Value of `name`, recording it as missing when unset
    pub fn required(&mut self, name: &str) -> Option<String> {
        let value = self.optional(name);
        if value.is_none() {
            self.missing.push(name.to_string());
        }
        value
    }

    /// First set variable among `names`, recording `A or B` as missing when none is set
    pub fn required_any(&mut self, names: &[&str]) -> Option<String> {
        let value = self.first_of(names);
        if value.is_none() {
            self.missing.push(names.join(" or "));
        }
        value
    }

    /// Parse `name` into `T`, falling back to `default` when unset
    pub fn parse_or<T>(&mut self, name: &str, default: T) -> T
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.optional(name) {
            None => default,
            Some(raw) => match raw.parse::<T>() {
                Ok(value) => value,
                Err(e) => {
                    self.invalid
                        .push(CommonError::invalid_var(name, raw, e.to_string()));
                    default
                },
            },
        }
    }

    /// Boolean flag accepting true/false, 1/0, yes/no, on/off
    pub fn flag(&mut self, name: &str, default: bool) -> bool {
        match self.optional(name) {
            None => default,
            Some(raw) => match raw.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" => false,
                _ => {
                    self.invalid.push(CommonError::invalid_var(
                        name,
                        raw,
                        "expected a boolean",
                    ));
                    default
                },
            },
        }
    }

    /// Record a validation failure discovered by the caller
    pub fn reject(&mut self, name: &str, value: impl Into<String>, reason: impl Into<String>) {
        self.invalid
            .push(CommonError::invalid_var(name, value, reason));
    }

    /// Fail if anything was missing or invalid
    ///
    /// Missing variables take precedence; otherwise the first invalid value is reported.
    pub fn finish(self) -> Result<()> {
        if !self.missing.is_empty() {
            return Err(CommonError::MissingVars(self.missing));
        }
        match self.invalid.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
