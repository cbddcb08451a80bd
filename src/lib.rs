pub mod admission;
pub mod conciliation;
pub mod configurator;
pub mod controller;
pub mod crd;
pub mod error;
pub mod factory;
pub mod helpers;
pub mod labels;
pub mod resolver;
pub mod store;
pub mod version;
pub mod webhook;
