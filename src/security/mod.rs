pub mod address;
pub mod validate;

pub use address::{is_obfuscated_ip, is_private_address};
pub use validate::{
    validate_inbound_path, validate_outbound_url, validate_websocket_path, ValidationError,
};
