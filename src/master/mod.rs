pub mod master_api;
