pub mod connectors;
pub mod error;
pub mod expr;
pub mod loader;
pub mod model;
pub mod runtime;

pub use error::EngineError;
