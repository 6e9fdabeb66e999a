pub mod relay_service;

#[cfg(test)]
mod relay_service_tests;

pub use relay_service::{Connection, DeliveryReceipt, RelayService, RelayServiceDependencies};
