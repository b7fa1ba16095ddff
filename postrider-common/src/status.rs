//! SMTP-shaped reply errors.
//!
//! Every failure the pipeline surfaces to a message source carries a
//! reply code, an enhanced status code triple, and structured fields
//! naming the check or modifier responsible and the recipient at the
//! point of failure.

use std::{error::Error, fmt, str::FromStr, sync::Arc};

use thiserror::Error as ThisError;

/// An RFC 3463 enhanced status code triple `class.subject.detail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnhancedCode(pub u8, pub u16, pub u16);

impl EnhancedCode {
    /// The class digit (`2`, `4`, or `5`).
    pub const fn class(self) -> u8 {
        self.0
    }

    /// Whether this code may be used to reject a message.
    ///
    /// Only class 4 (temporary) and class 5 (permanent) codes are
    /// acceptable reject codes; anything else is a configuration error.
    pub const fn is_reject_class(self) -> bool {
        matches!(self.0, 4 | 5)
    }
}

impl fmt::Display for EnhancedCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

/// Error returned when parsing an enhanced status code from a string.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
#[error("malformed enhanced status code {0:?}")]
pub struct EnhancedCodeParseError(pub String);

impl FromStr for EnhancedCode {
    type Err = EnhancedCodeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || EnhancedCodeParseError(s.to_owned());
        let mut parts = s.split('.');
        let (Some(class), Some(subject), Some(detail), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };
        let class: u8 = class.parse().map_err(|_| malformed())?;
        let subject: u16 = subject.parse().map_err(|_| malformed())?;
        let detail: u16 = detail.parse().map_err(|_| malformed())?;
        if class > 9 {
            return Err(malformed());
        }
        Ok(Self(class, subject, detail))
    }
}

/// An SMTP reply error.
///
/// Carries the reply code, enhanced code, human-readable message, an
/// optional cause, and diagnostic fields identifying where in the
/// pipeline the error originated. Diagnostic fields are first-write-wins
/// so the innermost annotation survives nesting.
#[derive(Debug, Clone)]
pub struct SmtpError {
    /// The three-digit SMTP reply code.
    pub code: u16,
    /// The enhanced status code.
    pub enhanced: EnhancedCode,
    /// Human-readable reply text.
    pub message: String,
    /// Name of the check that produced this error, if any.
    pub check: Option<String>,
    /// Name of the modifier that produced this error, if any.
    pub modifier: Option<String>,
    /// The recipient address at the point of failure, if any.
    pub effective_rcpt: Option<String>,
    source: Option<Arc<dyn Error + Send + Sync>>,
}

impl SmtpError {
    /// Creates a reply error from code, enhanced code, and message.
    pub fn new(code: u16, enhanced: EnhancedCode, message: impl Into<String>) -> Self {
        Self {
            code,
            enhanced,
            message: message.into(),
            check: None,
            modifier: None,
            effective_rcpt: None,
            source: None,
        }
    }

    /// Attaches an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Names the check this error originated from, unless already named.
    #[must_use]
    pub fn with_check(mut self, name: &str) -> Self {
        self.check.get_or_insert_with(|| name.to_owned());
        self
    }

    /// Names the modifier this error originated from, unless already named.
    #[must_use]
    pub fn with_modifier(mut self, name: &str) -> Self {
        self.modifier.get_or_insert_with(|| name.to_owned());
        self
    }

    /// Records the recipient at the point of failure, unless already set.
    #[must_use]
    pub fn with_effective_rcpt(mut self, rcpt: &str) -> Self {
        self.effective_rcpt.get_or_insert_with(|| rcpt.to_owned());
        self
    }

    /// Whether this is a permanent (5xx) rejection.
    pub const fn is_permanent(&self) -> bool {
        self.code >= 500
    }

    /// Whether this is a temporary (4xx) rejection.
    pub const fn is_temporary(&self) -> bool {
        self.code >= 400 && self.code < 500
    }
}

impl fmt::Display for SmtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.code, self.enhanced, self.message)?;
        if let Some(check) = &self.check {
            write!(f, " (check: {check})")?;
        }
        if let Some(modifier) = &self.modifier {
            write!(f, " (modifier: {modifier})")?;
        }
        if let Some(rcpt) = &self.effective_rcpt {
            write!(f, " (rcpt: {rcpt})")?;
        }
        Ok(())
    }
}

impl Error for SmtpError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| &**e as &(dyn Error + 'static))
    }
}
