pub mod audit;
pub mod build_info;
pub mod checks;
pub mod cli;
pub mod collection;
pub mod commands;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod refresh;
pub mod segmenter;
pub mod segments;
pub mod store;
