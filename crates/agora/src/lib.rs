//! Agora: mirror chat traffic between channels grouped into hubs.
//!
//! - [`store`]: hub persistence behind the [`store::HubStore`] trait
//! - [`hub`]: hub models and the capacity-limited [`hub::HubService`]
//! - [`relay`]: event dispatch and fan-out

pub mod db;
pub mod hub;
pub mod relay;
pub mod settings;
pub mod store;
