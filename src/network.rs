//! Network-facing components: NUT client, Wake-on-LAN, host discovery.

pub mod discovery;
pub mod nut;
pub mod wol;
