pub mod archive;
pub mod batch;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod download;
pub mod error;
pub mod fs_util;
pub mod job;
pub mod metadata;
pub mod output;
pub mod pool;
pub mod prompt;
pub mod resolver;
pub mod rules;
pub mod worker;
