pub mod autocommit;
pub mod engine;
