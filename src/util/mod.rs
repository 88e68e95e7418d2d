pub mod buf;
pub mod cancellation;
pub mod safe_converter;
