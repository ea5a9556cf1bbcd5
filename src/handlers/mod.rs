pub mod health_handlers;
pub mod release_handlers;
