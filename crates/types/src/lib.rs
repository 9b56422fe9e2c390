pub mod changeset;
pub mod command;
pub mod connection;
pub mod device;
pub mod diagnostics;
pub mod event;
pub mod events;
pub mod ids;
pub mod llm;
pub mod roaming;
pub mod system_service;
pub mod topology;
pub mod wire;

pub use changeset::*;
pub use command::*;
pub use connection::*;
pub use device::*;
pub use diagnostics::*;
pub use event::*;
pub use events::*;
pub use ids::*;
pub use llm::*;
pub use roaming::*;
pub use system_service::*;
pub use topology::*;

/// Current time as integer milliseconds since the Unix epoch, the unit
/// used by every wire timestamp and storage key in the system.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Normalize a MAC address for comparison and keying: lowercase hex with
/// separators stripped. Accepts `AA:BB:CC:DD:EE:FF`, `aa-bb-..` or bare hex.
pub fn normalize_mac(mac: &str) -> String {
    mac.chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect::<String>()
        .to_ascii_lowercase()
}
