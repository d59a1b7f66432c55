//! Tunnel security: traffic obfuscation and the kill switch.

pub mod kill_switch;
pub mod traffic_obfuscation;

pub use kill_switch::{KillSwitchManager, KillSwitchState};
pub use traffic_obfuscation::{ObfuscationProfile, Obfuscator};
