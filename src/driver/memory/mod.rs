mod catalog;
mod driver;

pub use catalog::MemoryResourceCatalog;
pub use driver::{create_memory_driver, MemoryDriverOptions};
