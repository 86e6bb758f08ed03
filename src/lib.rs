pub mod dag;
pub mod errors;
pub mod factory;
pub mod factory_config;
