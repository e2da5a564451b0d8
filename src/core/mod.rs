pub mod output;
pub mod process;
pub mod types;
