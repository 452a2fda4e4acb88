pub mod filter;
pub mod persistence;
pub mod project;
pub mod report;
pub mod selection;
