//! RFC 8601 `Authentication-Results` entries.
//!
//! Checks contribute individual method results (`spf=pass`,
//! `dkim=fail header.d=...`); the pipeline folds them into a single
//! header field under its own hostname, with the DMARC verdict leading.

use std::{fmt, str::FromStr};

use postrider_common::Field;
use thiserror::Error;

/// A method result value per RFC 8601 §2.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultValue {
    /// The method passed.
    Pass,
    /// The method failed.
    Fail,
    /// SPF-style weak failure.
    SoftFail,
    /// Verified but no definite result.
    Neutral,
    /// The method was not attempted or not applicable.
    None,
    /// Transient evaluation error.
    TempError,
    /// Permanent evaluation error (malformed input, bad policy).
    PermError,
    /// Result overridden by local policy.
    Policy,
}

impl ResultValue {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::SoftFail => "softfail",
            Self::Neutral => "neutral",
            Self::None => "none",
            Self::TempError => "temperror",
            Self::PermError => "permerror",
            Self::Policy => "policy",
        }
    }
}

impl fmt::Display for ResultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned for unrecognized result values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown authentication result value {0:?}")]
pub struct ResultValueParseError(pub String);

impl FromStr for ResultValue {
    type Err = ResultValueParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pass" => Ok(Self::Pass),
            "fail" => Ok(Self::Fail),
            "softfail" => Ok(Self::SoftFail),
            "neutral" => Ok(Self::Neutral),
            "none" => Ok(Self::None),
            "temperror" => Ok(Self::TempError),
            "permerror" => Ok(Self::PermError),
            "policy" => Ok(Self::Policy),
            _ => Err(ResultValueParseError(s.to_owned())),
        }
    }
}

/// A `ptype.property=value` annotation on a method result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prop {
    /// Property type (`smtp`, `header`, `dns`, ...).
    pub ptype: String,
    /// Property name within the type.
    pub name: String,
    /// Property value.
    pub value: String,
}

impl Prop {
    /// Creates a property annotation.
    pub fn new(
        ptype: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            ptype: ptype.into(),
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One authentication method result contributed by a check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    /// Method name (`spf`, `dkim`, `dmarc`, ...).
    pub method: String,
    /// The method's result.
    pub value: ResultValue,
    /// Optional free-form reason.
    pub reason: Option<String>,
    /// Property annotations, in order.
    pub props: Vec<Prop>,
}

impl AuthResult {
    /// Creates a result with no reason or properties.
    pub fn new(method: impl Into<String>, value: ResultValue) -> Self {
        Self {
            method: method.into(),
            value,
            reason: None,
            props: Vec::new(),
        }
    }

    /// Attaches a reason string.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Appends a property annotation.
    #[must_use]
    pub fn with_prop(
        mut self,
        ptype: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.props.push(Prop::new(ptype, name, value));
        self
    }

    /// Looks up a property value by type and name.
    pub fn prop(&self, ptype: &str, name: &str) -> Option<&str> {
        self.props
            .iter()
            .find(|p| p.ptype.eq_ignore_ascii_case(ptype) && p.name.eq_ignore_ascii_case(name))
            .map(|p| p.value.as_str())
    }
}

impl fmt::Display for AuthResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.method, self.value)?;
        if let Some(reason) = &self.reason {
            write!(f, " reason=\"{reason}\"")?;
        }
        for prop in &self.props {
            write!(f, " {}.{}={}", prop.ptype, prop.name, prop.value)?;
        }
        Ok(())
    }
}

/// Folds method results into a single `Authentication-Results` field
/// under `hostname`. An empty result list renders as `none`.
pub fn assemble(hostname: &str, results: &[AuthResult]) -> Field {
    let value = if results.is_empty() {
        format!("{hostname}; none")
    } else {
        let mut value = hostname.to_owned();
        for result in results {
            value.push_str("; ");
            value.push_str(&result.to_string());
        }
        value
    };
    Field::new("Authentication-Results", value)
}
