//! Blob storage and product output.
pub mod blob;
pub mod product;

pub use blob::FileBlobStore;
pub use product::{JsonlProductSink, ProductRecord};
