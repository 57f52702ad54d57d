//! Log redaction of user data

use serde::{Deserialize, Serialize};

/// How much user data is hidden in logs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedactionLevel {
    /// Log user data as-is
    #[default]
    None,
    /// Tag user data so a post-processor can scrub it
    Partial,
    /// Same tagging as partial; metadata tagging is the host's concern
    Full,
}

/// Wraps user data before it reaches a log sink
#[derive(Clone, Copy, Debug, Default)]
pub struct Redactor {
    level: RedactionLevel,
}

impl Redactor {
    /// Redactor at `level`
    pub fn new(level: RedactionLevel) -> Self {
        Self { level }
    }

    /// Current level
    pub fn level(&self) -> RedactionLevel {
        self.level
    }

    /// Wrap a document id or content for logging
    pub fn user<'a, T: std::fmt::Display + ?Sized>(&self, value: &'a T) -> Redacted<'a, T> {
        Redacted { value, tagged: self.level != RedactionLevel::None }
    }
}

/// Display wrapper produced by [`Redactor::user`]
pub struct Redacted<'a, T: ?Sized> {
    value: &'a T,
    tagged: bool,
}

impl<T: std::fmt::Display + ?Sized> std::fmt::Display for Redacted<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.tagged {
            write!(f, "<ud>{}</ud>", self.value)
        } else {
            write!(f, "{}", self.value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redaction_levels() {
        assert_eq!(Redactor::new(RedactionLevel::None).user("doc-1").to_string(), "doc-1");
        assert_eq!(Redactor::new(RedactionLevel::Partial).user("doc-1").to_string(), "<ud>doc-1</ud>");
        assert_eq!(Redactor::new(RedactionLevel::Full).user("doc-1").to_string(), "<ud>doc-1</ud>");
    }
}
