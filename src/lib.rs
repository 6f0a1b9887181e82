pub mod analyzers;
pub mod bisect;
pub mod config;
pub mod fetch;
pub mod ingest;
pub mod model;
pub mod output;
pub mod publish;
