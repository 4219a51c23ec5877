pub mod alerts;
pub mod api;
pub mod backup;
pub mod drill;
pub mod errors;
pub mod jobs;
pub mod meta;
pub mod monitor;
pub mod obs;
pub mod replication;
pub mod report;
pub mod retention;
pub mod storage;
pub mod util;
pub mod validate;

#[cfg(test)]
pub mod test_support;
