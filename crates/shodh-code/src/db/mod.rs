pub mod metadata_store;
pub mod migrations;
pub mod observability;

pub use metadata_store::MetadataStore;
pub use observability::ObservabilityStore;
