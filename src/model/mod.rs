pub mod definition;
pub mod instance;
pub mod token;
