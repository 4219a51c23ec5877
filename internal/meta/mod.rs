pub mod catalog;
pub mod cursor;
pub mod models;
