pub mod arcgis;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod output;
pub mod pipeline;
pub mod registry;
pub mod store;
