//! Network topology payload published by the topology agent.

use serde::{Deserialize, Serialize};

/// An IP address assigned to a tap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddress {
    pub ip: String,
}

impl IpAddress {
    pub fn new(ip: impl Into<String>) -> Self {
        Self { ip: ip.into() }
    }
}

/// A bridge member interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
}

impl Interface {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A tap device with its MAC and addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tap {
    pub name: String,
    pub mac: String,
    #[serde(default)]
    pub ip_addresses: Vec<IpAddress>,
}

/// A bridge and the interfaces attached to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bridge {
    pub name: String,
    #[serde(default)]
    pub interfaces: Vec<Interface>,
}

/// Complete topology stored under a single key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub bridge: Option<Bridge>,
    #[serde(default)]
    pub taps: Vec<Tap>,
}

impl Topology {
    /// Build one of the two sample topologies.
    ///
    /// `1` yields `bridge1` with both interfaces and both taps; anything else
    /// yields `bridge2` with a single interface and tap.
    pub fn sample(id: u32) -> Self {
        let if1 = Interface::new("interface1");
        let if2 = Interface::new("interface2");
        let tap1 = Tap {
            name: "tap1".into(),
            mac: "00:00:00:00:00:00".into(),
            ip_addresses: vec![IpAddress::new("127.0.0.1"), IpAddress::new("127.0.0.2")],
        };
        let tap2 = Tap {
            name: "tap2".into(),
            mac: "00:00:ff:00:00:00".into(),
            ip_addresses: vec![IpAddress::new("127.0.0.4"), IpAddress::new("127.0.0.3")],
        };

        if id == 1 {
            Self {
                bridge: Some(Bridge {
                    name: "bridge1".into(),
                    interfaces: vec![if1, if2],
                }),
                taps: vec![tap1, tap2],
            }
        } else {
            Self {
                bridge: Some(Bridge {
                    name: "bridge2".into(),
                    interfaces: vec![if2],
                }),
                taps: vec![tap1],
            }
        }
    }

    /// Name of the bridge, if any.
    pub fn bridge_name(&self) -> Option<&str> {
        self.bridge.as_ref().map(|b| b.name.as_str())
    }
}
