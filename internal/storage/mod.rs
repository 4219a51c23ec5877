pub mod checksum;
pub mod object_store;
