//! Numeric error codes carried in replies
//!
//! Values below [`STD_ERR_BASE`] are platform `errno` values passed through
//! unchanged. Protocol-level failures live at `STD_ERR_BASE + n`.

/// No error
pub const SUCCESS: i32 = 0;

/// First protocol-level error code
pub const STD_ERR_BASE: i32 = 0x20000;

/// Unspecified failure
pub const OTHER: i32 = STD_ERR_BASE;
/// Argument encoding did not match the command
pub const JSON_SYNTAX: i32 = STD_ERR_BASE + 1;
/// Malformed message
pub const PROTOCOL: i32 = STD_ERR_BASE + 2;
/// Command is not registered
pub const INV_COMMAND: i32 = STD_ERR_BASE + 3;
/// Redirect target is not in the peer registry
pub const UNKNOWN_PEER: i32 = STD_ERR_BASE + 20;
/// Peer does not advertise a usable transport
pub const INV_TRANSPORT: i32 = STD_ERR_BASE + 21;

/// Human-readable text for an error code
pub fn describe(code: i32) -> String {
    match code {
        SUCCESS => "Success".to_string(),
        OTHER => "Unspecified failure".to_string(),
        JSON_SYNTAX => "JSON syntax error".to_string(),
        PROTOCOL => "Protocol format error".to_string(),
        INV_COMMAND => "Invalid command".to_string(),
        UNKNOWN_PEER => "unknown peer".to_string(),
        INV_TRANSPORT => "Invalid transport name".to_string(),
        c if c > 0 && c < STD_ERR_BASE => std::io::Error::from_raw_os_error(c).to_string(),
        c => format!("Error code {}", c),
    }
}
