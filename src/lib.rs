pub mod config;
pub mod error;
pub mod facts;
pub mod index;
pub mod query;
pub mod store;
