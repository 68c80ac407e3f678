pub mod customer;
pub mod database;
pub mod datasets;
pub mod deployment;
pub mod filter_spec;
pub mod identifier;
pub mod metadata;
pub mod metrics;
pub mod population;
