pub mod receiver_manager;
pub mod sender_manager;
