//! Built-in feature modules.

pub mod relay;

pub use relay::RelayModule;
