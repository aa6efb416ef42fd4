pub mod datastream_handlers;
pub mod health_handlers;
