pub mod compactor;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod store;
pub mod tenant;
pub mod wal;
