pub mod app;
pub mod audit;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod db;
pub mod error;
pub mod history;
pub mod ingest;
pub mod mailer;
pub mod model;
