pub mod deploy;
pub mod engine;
pub mod error;
pub mod filters;
pub mod identifiers;
pub mod test_utils;
