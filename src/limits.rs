use regex::Regex;
use std::collections::HashMap;
use thiserror::Error;

/// Named length policies for user-facing identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Limit {
    DisplayName,
    Uid,
    Secret,
    Chan,
    ChanSecret,
}

impl Limit {
    pub fn field(self) -> &'static str {
        match self {
            Limit::DisplayName => "displayName",
            Limit::Uid => "uid",
            Limit::Secret => "secret",
            Limit::Chan => "channel",
            Limit::ChanSecret => "channelSecret",
        }
    }
}

/// Minimum bounds of 0 admit the empty secret of public channels and
/// empty user secrets on registration (the server generates one).
pub const DEFAULT_BOUNDS: [(Limit, (usize, usize)); 5] = [
    (Limit::DisplayName, (1, 64)),
    (Limit::Uid, (1, 32)),
    (Limit::Secret, (0, 64)),
    (Limit::Chan, (1, 64)),
    (Limit::ChanSecret, (0, 64)),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} must be between {min} and {max} characters long")]
    Length {
        field: &'static str,
        min: usize,
        max: usize,
    },
    #[error("{field} must contain only alphanumeric and underscores")]
    Charset { field: &'static str },
    #[error("invalid email address")]
    Email,
}

const ALFA_PATTERN: &str = "^[A-Za-z0-9_]*$";
const EMAIL_PATTERN: &str = r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$";

/// Immutable validation policy: the limit table plus the compiled
/// identifier and email patterns. Built once at startup and plumbed
/// through constructors.
#[derive(Debug, Clone)]
pub struct Policy {
    bounds: HashMap<Limit, (usize, usize)>,
    alfa: Regex,
    email: Regex,
}

impl Default for Policy {
    fn default() -> Self {
        Policy::new(&DEFAULT_BOUNDS)
    }
}

impl Policy {
    pub fn new(bounds: &[(Limit, (usize, usize))]) -> Self {
        Policy {
            bounds: bounds.iter().copied().collect(),
            alfa: Regex::new(ALFA_PATTERN).expect("identifier pattern"),
            email: Regex::new(EMAIL_PATTERN).expect("email pattern"),
        }
    }

    pub fn bounds(&self, lim: Limit) -> (usize, usize) {
        self.bounds.get(&lim).copied().unwrap_or((0, usize::MAX))
    }

    pub fn check_len(&self, value: &str, lim: Limit) -> Result<(), ValidationError> {
        let (min, max) = self.bounds(lim);
        if value.len() < min || value.len() > max {
            return Err(ValidationError::Length {
                field: lim.field(),
                min,
                max,
            });
        }
        Ok(())
    }

    pub fn check_len_all(&self, pairs: &[(&str, Limit)]) -> Result<(), ValidationError> {
        for (value, lim) in pairs {
            self.check_len(value, *lim)?;
        }
        Ok(())
    }

    pub fn check_name(&self, field: &'static str, value: &str) -> Result<(), ValidationError> {
        if !self.alfa.is_match(value) {
            return Err(ValidationError::Charset { field });
        }
        Ok(())
    }

    pub fn check_email(&self, value: &str) -> Result<(), ValidationError> {
        if !self.email.is_match(value) {
            return Err(ValidationError::Email);
        }
        Ok(())
    }
}
