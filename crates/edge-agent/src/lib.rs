pub mod config;
pub mod configurator;
pub mod convergence;
pub mod link;
pub mod runner;
pub mod sink;
pub mod supervisor;
pub mod telemetry;

#[cfg(test)]
pub mod test_support;

pub use common::version;
pub use configurator::{Configurator, DynConfigurator};
