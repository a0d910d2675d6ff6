use std::fmt;

/// Prefix put in front of every perch channel unless configured otherwise.
pub const DEFAULT_PREFIX: &str = "dev.perch";

/// Name of a method channel: `<prefix>.<api>.<method>[.<suffix>]`.
///
/// The suffix lets several instances of one API share a messenger; an empty
/// suffix means none. An empty prefix is omitted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelName {
    prefix: String,
    api: String,
    method: String,
    suffix: Option<String>,
}

impl ChannelName {
    pub fn new(
        prefix: impl Into<String>,
        api: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            api: api.into(),
            method: method.into(),
            suffix: None,
        }
    }

    /// A channel under [`DEFAULT_PREFIX`].
    pub fn perch(api: impl Into<String>, method: impl Into<String>) -> Self {
        Self::new(DEFAULT_PREFIX, api, method)
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        let suffix = suffix.into();
        self.suffix = (!suffix.is_empty()).then_some(suffix);
        self
    }

    pub fn api(&self) -> &str {
        &self.api
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn suffix(&self) -> Option<&str> {
        self.suffix.as_deref()
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.prefix.is_empty() {
            write!(f, "{}.", self.prefix)?;
        }
        write!(f, "{}.{}", self.api, self.method)?;
        if let Some(suffix) = &self.suffix {
            write!(f, ".{suffix}")?;
        }
        Ok(())
    }
}

impl From<ChannelName> for String {
    fn from(name: ChannelName) -> Self {
        name.to_string()
    }
}
