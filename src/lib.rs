//! dripmail: consent-gated transactional and drip-campaign email.

pub mod api;
pub mod assets;
pub mod campaign;
pub mod config;
pub mod consent;
pub mod error;
pub mod pipeline;
pub mod render;
pub mod series;
pub mod store;
pub mod token;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;
