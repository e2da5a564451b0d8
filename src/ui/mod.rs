pub mod overhead;
pub mod summary;
