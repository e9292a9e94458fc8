pub mod catalog;
pub mod cli;
pub mod config;
pub mod model;

pub use catalog::{CatalogError, CatalogPublisher, InMemoryCatalog, SqlCatalog};
pub use model::{Attributes, Record, RecordHandle, RecordType, Status};
