//! Neighbor-table output parser.

use std::sync::OnceLock;

use regex::Regex;

fn mac_regex() -> &'static Regex {
    static MAC: OnceLock<Regex> = OnceLock::new();
    MAC.get_or_init(|| Regex::new(r"([0-9a-fA-F]{2}:){5}[0-9a-fA-F]{2}").expect("static MAC pattern"))
}

/// Extract the first MAC address from `ip neighbor show <ip>` output, upper-cased.
/// Input: "192.168.1.20 dev eth0 lladdr aa:bb:cc:dd:ee:ff REACHABLE"
pub fn parse_neighbor_mac(output: &str) -> Option<String> {
    mac_regex().find(output).map(|m| m.as_str().to_uppercase())
}
