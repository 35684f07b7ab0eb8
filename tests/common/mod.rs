#![allow(dead_code)] // Each test binary uses a different subset

pub mod builders;
pub mod slow_store;
pub mod strategies;

pub use builders::*;
pub use slow_store::SlowStore;
