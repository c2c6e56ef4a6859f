//! Configuration module
//!
//! Tunnel configurations, the daemon settings file, persisted user knobs
//! and the per-tunnel configuration store.

use crate::types::KeyMaterial;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

pub mod knobs;
pub mod store;
pub mod toml_config;

/// AmneziaWG obfuscation parameters
///
/// All optional; absent values fall back to plain WireGuard behaviour.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Obfuscation {
    pub jc: Option<u32>,
    pub jmin: Option<u32>,
    pub jmax: Option<u32>,
    pub s1: Option<u32>,
    pub s2: Option<u32>,
    pub h1: Option<u32>,
    pub h2: Option<u32>,
    pub h3: Option<u32>,
    pub h4: Option<u32>,
}

impl Obfuscation {
    fn entries(&self) -> [(&'static str, Option<u32>); 9] {
        [
            ("Jc", self.jc),
            ("Jmin", self.jmin),
            ("Jmax", self.jmax),
            ("S1", self.s1),
            ("S2", self.s2),
            ("H1", self.h1),
            ("H2", self.h2),
            ("H3", self.h3),
            ("H4", self.h4),
        ]
    }
}

/// `[Interface]` section of a tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub private_key: KeyMaterial,

    /// Addresses in CIDR notation
    #[serde(default)]
    pub addresses: Vec<String>,

    #[serde(default)]
    pub dns: Vec<String>,

    pub listen_port: Option<u16>,

    pub mtu: Option<u16>,

    #[serde(default)]
    pub obfuscation: Obfuscation,
}

/// `[Peer]` section of a tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub public_key: String,

    pub preshared_key: Option<KeyMaterial>,

    /// `host:port` of the remote peer
    pub endpoint: Option<String>,

    #[serde(default)]
    pub allowed_ips: Vec<String>,

    pub persistent_keepalive: Option<u16>,
}

/// Routing and crypto configuration of a single tunnel
///
/// Passed through to the backend untouched; the supervisor only validates
/// its shape and renders it for the engine tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub interface: InterfaceConfig,

    #[serde(default, rename = "peer")]
    pub peers: Vec<PeerConfig>,
}

impl TunnelConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.interface.private_key.is_well_formed() {
            return Err("Interface private key is not a valid base64 key".to_string());
        }

        if let Some(0) = self.interface.mtu {
            return Err("MTU cannot be zero".to_string());
        }

        for (index, peer) in self.peers.iter().enumerate() {
            if !KeyMaterial::new(peer.public_key.clone()).is_well_formed() {
                return Err(format!("Peer {} has an invalid public key", index));
            }
            if let Some(ref psk) = peer.preshared_key {
                if !psk.is_well_formed() {
                    return Err(format!("Peer {} has an invalid preshared key", index));
                }
            }
            if let Some(ref endpoint) = peer.endpoint {
                match endpoint.rsplit_once(':') {
                    Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
                    _ => return Err(format!("Peer {} has an invalid endpoint: {}", index, endpoint)),
                }
            }
        }

        Ok(())
    }

    /// Render in the `awg-quick` file format
    pub fn to_quick_string(&self) -> String {
        let mut out = String::from("[Interface]\n");
        let iface = &self.interface;
        if !iface.addresses.is_empty() {
            let _ = writeln!(out, "Address = {}", iface.addresses.join(", "));
        }
        if !iface.dns.is_empty() {
            let _ = writeln!(out, "DNS = {}", iface.dns.join(", "));
        }
        if let Some(mtu) = iface.mtu {
            let _ = writeln!(out, "MTU = {}", mtu);
        }
        self.write_engine_interface(&mut out);
        self.write_peers(&mut out);
        out
    }

    /// Render in the `awg setconf` format
    ///
    /// Same as [`TunnelConfig::to_quick_string`] without the keys that only
    /// `awg-quick` understands (addresses, DNS, MTU).
    pub fn to_setconf_string(&self) -> String {
        let mut out = String::from("[Interface]\n");
        self.write_engine_interface(&mut out);
        self.write_peers(&mut out);
        out
    }

    fn write_engine_interface(&self, out: &mut String) {
        let iface = &self.interface;
        if let Some(port) = iface.listen_port {
            let _ = writeln!(out, "ListenPort = {}", port);
        }
        for (key, value) in iface.obfuscation.entries() {
            if let Some(value) = value {
                let _ = writeln!(out, "{} = {}", key, value);
            }
        }
        let _ = writeln!(out, "PrivateKey = {}", iface.private_key.expose());
    }

    fn write_peers(&self, out: &mut String) {
        for peer in &self.peers {
            out.push_str("\n[Peer]\n");
            let _ = writeln!(out, "PublicKey = {}", peer.public_key);
            if let Some(ref psk) = peer.preshared_key {
                let _ = writeln!(out, "PresharedKey = {}", psk.expose());
            }
            if !peer.allowed_ips.is_empty() {
                let _ = writeln!(out, "AllowedIPs = {}", peer.allowed_ips.join(", "));
            }
            if let Some(ref endpoint) = peer.endpoint {
                let _ = writeln!(out, "Endpoint = {}", endpoint);
            }
            if let Some(keepalive) = peer.persistent_keepalive {
                let _ = writeln!(out, "PersistentKeepalive = {}", keepalive);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=";
    const PEER: &str = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=";

    fn sample() -> TunnelConfig {
        TunnelConfig {
            interface: InterfaceConfig {
                private_key: KeyMaterial::new(KEY.to_string()),
                addresses: vec!["10.0.0.2/32".to_string()],
                dns: vec!["1.1.1.1".to_string()],
                listen_port: None,
                mtu: Some(1280),
                obfuscation: Obfuscation {
                    jc: Some(4),
                    h1: Some(1),
                    ..Default::default()
                },
            },
            peers: vec![PeerConfig {
                public_key: PEER.to_string(),
                preshared_key: None,
                endpoint: Some("vpn.example.com:51820".to_string()),
                allowed_ips: vec!["0.0.0.0/0".to_string(), "::/0".to_string()],
                persistent_keepalive: Some(25),
            }],
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_invalid_configs() {
        let mut bad_key = sample();
        bad_key.interface.private_key = KeyMaterial::new("nope".to_string());
        assert!(bad_key.validate().is_err());

        let mut bad_endpoint = sample();
        bad_endpoint.peers[0].endpoint = Some("vpn.example.com".to_string());
        assert!(bad_endpoint.validate().is_err());

        let mut bad_mtu = sample();
        bad_mtu.interface.mtu = Some(0);
        assert!(bad_mtu.validate().is_err());
    }

    #[test]
    fn test_quick_format_contains_addresses_and_obfuscation() {
        let rendered = sample().to_quick_string();
        assert!(rendered.starts_with("[Interface]\n"));
        assert!(rendered.contains("Address = 10.0.0.2/32\n"));
        assert!(rendered.contains("MTU = 1280\n"));
        assert!(rendered.contains("Jc = 4\n"));
        assert!(rendered.contains("H1 = 1\n"));
        assert!(!rendered.contains("Jmin"));
        assert!(rendered.contains(&format!("PrivateKey = {}\n", KEY)));
        assert!(rendered.contains("AllowedIPs = 0.0.0.0/0, ::/0\n"));
        assert!(rendered.contains("PersistentKeepalive = 25\n"));
    }

    #[test]
    fn test_setconf_format_omits_quick_only_keys() {
        let rendered = sample().to_setconf_string();
        assert!(!rendered.contains("Address"));
        assert!(!rendered.contains("DNS"));
        assert!(!rendered.contains("MTU"));
        assert!(rendered.contains("Endpoint = vpn.example.com:51820\n"));
    }
}
