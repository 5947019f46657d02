// Shared utilities module
pub mod errors;
pub mod hash;
pub mod logging;
pub mod matcher;
pub mod mime;
pub mod text;

pub use errors::*;
pub use logging::*;
pub use matcher::{default_ignored, Matcher, MatcherSet};
