//! Broker driver implementations.
//!
//! This module provides concrete implementations of the domain-level
//! [`BrokerDriver`](crate::BrokerDriver) trait, exposed only through
//! constructor functions. Transport code must not depend on
//! driver-specific types.

mod memory;

pub use memory::{create_memory_driver, MemoryDriverOptions, MemoryResourceCatalog};
