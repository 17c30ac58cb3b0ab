pub mod checkpoint;
pub mod config;
pub mod data;
pub mod entropy;
pub mod eval;
pub mod metrics;
pub mod model;
pub mod record;
pub mod subsample;
