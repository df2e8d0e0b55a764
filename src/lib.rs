pub mod aggregation;
pub mod config;
pub mod daemon;
pub mod error;
pub mod gaps;
pub mod ingest;
pub mod interpolation;
pub mod lock;
pub mod logging;
pub mod measurement;
pub mod period;
pub mod process;
pub mod quantity;
pub mod raster;
pub mod rebuild;
pub mod routing;
pub mod shutdown;
pub mod store;
pub mod toolchain;

#[cfg(feature = "distributed")]
pub mod mqtt;
#[cfg(feature = "distributed")]
pub mod postgres_store;

pub use error::*;
pub use logging::init_tracing;
