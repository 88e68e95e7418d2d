pub mod rpc_client;
pub mod rpc_server;
pub mod rpc_value;
