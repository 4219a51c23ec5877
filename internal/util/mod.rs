pub mod config;
pub mod poll;
pub mod process;
pub mod shutdown;
pub mod storage_volume;
pub mod usage;
