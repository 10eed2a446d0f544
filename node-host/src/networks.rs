use shared_types::{NetworkInfo, UsefulLink};

/// A network the light node can join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Network {
    pub id: &'static str,
    /// Consensus endpoint passed as `--core.ip`
    pub core_ip: &'static str,
    /// Value of `--p2p.network`
    pub p2p_network: &'static str,
    links: &'static [(&'static str, &'static str, &'static str)],
}

const NETWORKS: &[Network] = &[
    Network {
        id: "arabica-10",
        core_ip: "consensus-validator.celestia-arabica-10.com",
        p2p_network: "arabica",
        links: &[
            (
                "Faucet",
                "https://faucet.celestia-arabica-10.com",
                "https://faucet.celestia-arabica-10.com",
            ),
            (
                "Block Explorer",
                "https://explorer.celestia-arabica-10.com",
                "https://explorer.celestia-arabica-10.com",
            ),
        ],
    },
    Network {
        id: "mocha-4",
        core_ip: "rpc-mocha.pops.one",
        p2p_network: "mocha",
        links: &[
            (
                "Faucet",
                "https://discord.com/invite/YsnTPcSfWQ",
                "Join Celestia's Discord Channel",
            ),
            (
                "Block Explorer",
                "https://celestia.explorers.guru",
                "https://celestia.explorers.guru",
            ),
        ],
    },
];

pub fn find(id: &str) -> Option<&'static Network> {
    NETWORKS.iter().find(|n| n.id == id)
}

pub fn all() -> &'static [Network] {
    NETWORKS
}

impl Network {
    pub fn info(&self) -> NetworkInfo {
        NetworkInfo {
            id: self.id.to_string(),
            core_ip: self.core_ip.to_string(),
            p2p_network: self.p2p_network.to_string(),
            links: self
                .links
                .iter()
                .map(|(name, url, text)| UsefulLink {
                    name: name.to_string(),
                    url: url.to_string(),
                    text: text.to_string(),
                })
                .collect(),
        }
    }
}
