pub mod client_config;
pub mod client_events;
pub mod publisher;
pub mod ros_client;
pub mod ros_error;
pub mod subscriber;
