pub mod artifact;
pub mod db;
pub mod store;
pub mod types;
