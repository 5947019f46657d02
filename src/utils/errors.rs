use thiserror::Error;

#[derive(Error, Debug)]
pub enum TabaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Build error: {0}")]
    Build(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Build aborted")]
    Aborted,
}

impl TabaError {
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse(message.into())
    }

    pub fn build(message: impl Into<String>) -> Self {
        Self::Build(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

pub type Result<T> = std::result::Result<T, TabaError>;

impl From<regex::Error> for TabaError {
    fn from(err: regex::Error) -> Self {
        TabaError::parse(format!("Regex error: {}", err))
    }
}

impl From<anyhow::Error> for TabaError {
    fn from(err: anyhow::Error) -> Self {
        TabaError::build(err.to_string())
    }
}

impl From<glob::PatternError> for TabaError {
    fn from(err: glob::PatternError) -> Self {
        TabaError::config(format!("Invalid glob pattern: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_prefixes_kind() {
        assert_eq!(
            TabaError::parse("unexpected token").to_string(),
            "Parse error: unexpected token"
        );
        assert_eq!(
            TabaError::config("bad outDir").to_string(),
            "Configuration error: bad outDir"
        );
    }

    #[test]
    fn test_io_errors_convert() {
        let err: TabaError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, TabaError::Io(_)));
    }
}
