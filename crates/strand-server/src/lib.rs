// Strand node binary support: configuration loading, logging, metrics and startup

pub mod metrics; // Metrics and observability
pub mod model; // Command line and configuration
pub mod startup; // Application startup utilities

pub use strand_core::Configuration;
