pub mod completion;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod knowledge;
pub mod prompt;
pub mod schema;
pub mod validator;
