pub mod auth;
pub mod config;
pub mod connectors;
pub mod db;
pub mod decoder;
pub mod error;
pub mod labs;
pub mod linking;
pub mod output;
pub mod records;
pub mod server;
pub mod status;
pub mod sync;
pub mod tokens;
