//! Publish / subscribe transport for a ROS-style robotics middleware: registration with the
//!  naming registry ("master"), point-to-point streaming connections to peers, and typed
//!  publish / subscribe on top of them.

pub mod client;
pub mod manager;
pub mod master;
pub mod node;
pub mod rpc;
pub mod test_util;
pub mod topic;
pub mod transport;
pub mod util;
pub mod wire;
