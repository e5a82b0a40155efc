//! Connector records and the merged (user-facing) connector view

use std::fmt;

use crate::adapter::ProviderHandle;
use crate::caip::Namespace;

/// Well-known connector ids
pub mod ids {
    pub const WALLET_CONNECT: &str = "walletConnect";
    pub const AUTH: &str = "ID_AUTH";
    pub const INJECTED: &str = "injected";
}

/// How a wallet is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorKind {
    /// `window.ethereum`-style global provider
    Injected,
    /// EIP-6963 / wallet-standard announcement
    Announced,
    WalletConnect,
    /// Embedded wallet (email / social login / local key)
    Auth,
    External,
    MultiChain,
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectorKind::Injected => write!(f, "INJECTED"),
            ConnectorKind::Announced => write!(f, "ANNOUNCED"),
            ConnectorKind::WalletConnect => write!(f, "WALLET_CONNECT"),
            ConnectorKind::Auth => write!(f, "AUTH"),
            ConnectorKind::External => write!(f, "EXTERNAL"),
            ConnectorKind::MultiChain => write!(f, "MULTI_CHAIN"),
        }
    }
}

/// Display metadata
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectorMetadata {
    pub icon: Option<String>,
    pub rdns: Option<String>,
    /// Wallet registry id
    pub explorer_id: Option<String>,
}

/// One reachable wallet-provider path within a namespace
#[derive(Debug, Clone)]
pub struct Connector {
    pub id: String,
    pub name: String,
    namespace: Namespace,
    pub kind: ConnectorKind,
    pub metadata: ConnectorMetadata,
    pub provider: Option<ProviderHandle>,
}

impl Connector {
    pub fn new(id: &str, name: &str, namespace: Namespace, kind: ConnectorKind) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            namespace,
            kind,
            metadata: ConnectorMetadata::default(),
            provider: None,
        }
    }

    pub fn with_provider(mut self, provider: ProviderHandle) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_icon(mut self, icon: &str) -> Self {
        self.metadata.icon = Some(icon.to_string());
        self
    }

    pub fn with_rdns(mut self, rdns: &str) -> Self {
        self.metadata.rdns = Some(rdns.to_string());
        self
    }

    pub fn with_explorer_id(mut self, explorer_id: &str) -> Self {
        self.metadata.explorer_id = Some(explorer_id.to_string());
        self
    }

    /// Fixed at construction
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Name used for de-duplication and grouping
    pub fn display_name(&self) -> &str {
        normalize_name(&self.name)
    }

    /// Same wallet, same namespace
    pub fn same_identity(&self, other: &Connector) -> bool {
        self.namespace == other.namespace && self.display_name() == other.display_name()
    }
}

/// Wallets announce under slightly different names per namespace
pub fn normalize_name(name: &str) -> &str {
    match name {
        "Trust Wallet" => "Trust",
        other => other,
    }
}

/// An entry of the merged connector view
#[derive(Debug, Clone)]
pub enum MergedConnector {
    Single(Connector),
    /// One wallet present in several namespaces
    MultiChain {
        name: String,
        icon: Option<String>,
        members: Vec<Connector>,
    },
    /// The embedded wallet across namespaces
    Auth {
        name: String,
        icon: Option<String>,
        members: Vec<Connector>,
    },
}

impl MergedConnector {
    pub fn name(&self) -> &str {
        match self {
            MergedConnector::Single(c) => &c.name,
            MergedConnector::MultiChain { name, .. } | MergedConnector::Auth { name, .. } => name,
        }
    }

    pub fn kind(&self) -> ConnectorKind {
        match self {
            MergedConnector::Single(c) => c.kind,
            MergedConnector::MultiChain { .. } => ConnectorKind::MultiChain,
            MergedConnector::Auth { .. } => ConnectorKind::Auth,
        }
    }

    /// Per-namespace connectors this entry stands for
    pub fn members(&self) -> Vec<&Connector> {
        match self {
            MergedConnector::Single(c) => vec![c],
            MergedConnector::MultiChain { members, .. } | MergedConnector::Auth { members, .. } => {
                members.iter().collect()
            }
        }
    }

    pub fn member_for(&self, namespace: &Namespace) -> Option<&Connector> {
        self.members()
            .into_iter()
            .find(|c| c.namespace() == namespace)
    }
}

/// Group connectors by display name. A group spanning several namespaces
/// becomes a multi-chain (or auth) entry; the first connector seen per
/// namespace wins inside a group. Output order follows first appearance.
pub fn merge_connectors(connectors: &[Connector]) -> Vec<MergedConnector> {
    let mut groups: Vec<(&str, Vec<&Connector>)> = Vec::new();

    for connector in connectors {
        let name = connector.display_name();
        if name.is_empty() {
            continue;
        }
        match groups.iter_mut().find(|(n, _)| *n == name) {
            Some((_, members)) => {
                if !members.iter().any(|m| m.namespace() == connector.namespace()) {
                    members.push(connector);
                }
            }
            None => groups.push((name, vec![connector])),
        }
    }

    groups
        .into_iter()
        .filter_map(|(_, members)| {
            let first = (*members.first()?).clone();
            if members.len() == 1 {
                return Some(MergedConnector::Single(first));
            }
            let name = first.name.clone();
            let icon = first.metadata.icon.clone();
            let members: Vec<Connector> = members.into_iter().cloned().collect();
            if first.id == ids::AUTH {
                Some(MergedConnector::Auth {
                    name,
                    icon,
                    members,
                })
            } else {
                Some(MergedConnector::MultiChain {
                    name,
                    icon,
                    members,
                })
            }
        })
        .collect()
}
