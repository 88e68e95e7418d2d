pub mod node_api;
pub mod node_rpc_handler;
