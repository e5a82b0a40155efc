//! Session-namespace negotiation
//!
//! Builds the `optionalNamespaces` proposal from the requested networks and
//! reads back what an approved session actually granted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use super::{Session, SessionNamespace};
use crate::caip::{networks, CaipAddress, CaipNetwork, CaipNetworkId, Namespace};
use crate::connector::ids;
use crate::types::{Account, Connection};

pub const DEFAULT_EVENTS: &[&str] = &["accountsChanged", "chainChanged"];

const EIP155_METHODS: &[&str] = &[
    "eth_accounts",
    "eth_requestAccounts",
    "eth_sendRawTransaction",
    "eth_sign",
    "eth_signTransaction",
    "eth_signTypedData",
    "eth_signTypedData_v3",
    "eth_signTypedData_v4",
    "eth_sendTransaction",
    "personal_sign",
    "wallet_switchEthereumChain",
    "wallet_addEthereumChain",
    "wallet_getPermissions",
    "wallet_requestPermissions",
    "wallet_registerOnboarding",
    "wallet_watchAsset",
    "wallet_scanQRCode",
    // EIP-5792
    "wallet_getCallsStatus",
    "wallet_showCallsStatus",
    "wallet_sendCalls",
    "wallet_getCapabilities",
    // EIP-7715
    "wallet_grantPermissions",
    "wallet_revokePermissions",
    // EIP-7811
    "wallet_getAssets",
];

const SOLANA_METHODS: &[&str] = &[
    "solana_signMessage",
    "solana_signTransaction",
    "solana_requestAccounts",
    "solana_getAccounts",
    "solana_signAllTransactions",
    "solana_signAndSendTransaction",
];

const BIP122_METHODS: &[&str] = &["sendTransfer", "signMessage", "signPsbt", "getAccountAddresses"];

/// Deprecated Solana genesis ids some wallets still expect
const SOLANA_LEGACY_ALIASES: &[(&str, &str)] = &[
    (networks::SOLANA_MAINNET_REF, "4sGjMW1sUnHzSxGspuhpqLDx6wiyjNtZ"),
    (networks::SOLANA_DEVNET_REF, "8E9rvCKLFQia2Y35HXjjpWzj8weVo44K"),
];

/// Map a deprecated Solana id a wallet granted back to the network the dApp
/// requested
pub fn canonical_chain(chain: CaipNetworkId) -> CaipNetworkId {
    if chain.namespace().as_str() != Namespace::SOLANA {
        return chain;
    }
    SOLANA_LEGACY_ALIASES
        .iter()
        .find(|(_, legacy)| *legacy == chain.reference())
        .and_then(|(canonical, _)| CaipNetworkId::new(Namespace::solana(), *canonical).ok())
        .unwrap_or(chain)
}

/// One namespace of a session proposal
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalNamespace {
    pub chains: Vec<String>,
    pub methods: Vec<String>,
    pub events: Vec<String>,
    /// Chain reference -> RPC URL
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rpc_map: BTreeMap<String, String>,
}

/// `optionalNamespaces` keyed by namespace
pub type ProposalNamespaces = BTreeMap<String, ProposalNamespace>;

/// Caller overrides applied after the generated defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NamespaceOverrides {
    pub methods: BTreeMap<String, Vec<String>>,
    pub chains: BTreeMap<String, Vec<String>>,
    pub events: BTreeMap<String, Vec<String>>,
    /// Keyed by CAIP-2 id (`eip155:1`)
    pub rpc_map: BTreeMap<String, String>,
}

pub fn default_methods(namespace: &str) -> &'static [&'static str] {
    match namespace {
        Namespace::EIP155 => EIP155_METHODS,
        Namespace::SOLANA => SOLANA_METHODS,
        Namespace::BIP122 => BIP122_METHODS,
        _ => &[],
    }
}

pub fn default_namespace(namespace: &str) -> ProposalNamespace {
    ProposalNamespace {
        chains: Vec::new(),
        methods: default_methods(namespace).iter().map(|m| m.to_string()).collect(),
        events: DEFAULT_EVENTS.iter().map(|e| e.to_string()).collect(),
        rpc_map: BTreeMap::new(),
    }
}

/// Build the proposal for `networks`, then apply `overrides`
pub fn create_namespaces(
    networks: &[CaipNetwork],
    overrides: Option<&NamespaceOverrides>,
) -> ProposalNamespaces {
    let mut proposal = ProposalNamespaces::new();

    for network in networks {
        let namespace = proposal
            .entry(network.namespace().to_string())
            .or_insert_with(|| default_namespace(network.namespace().as_str()));

        let caip_id = network.caip_network_id.to_string();
        push_unique(&mut namespace.chains, caip_id);

        if network.namespace().as_str() == Namespace::SOLANA {
            for (canonical, legacy) in SOLANA_LEGACY_ALIASES {
                if network.id == *canonical {
                    push_unique(&mut namespace.chains, format!("{}:{}", Namespace::SOLANA, legacy));
                }
            }
        }

        if let Some(rpc_url) = &network.rpc_url {
            namespace.rpc_map.insert(network.id.clone(), rpc_url.clone());
        }
    }

    apply_namespace_overrides(proposal, overrides)
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

/// Namespaces named by any override are created from defaults when missing;
/// list overrides replace, and the first rpcMap override for a namespace
/// replaces its generated map
pub fn apply_namespace_overrides(
    mut base: ProposalNamespaces,
    overrides: Option<&NamespaceOverrides>,
) -> ProposalNamespaces {
    let Some(overrides) = overrides else {
        return base;
    };

    let rpc_namespaces = overrides
        .rpc_map
        .keys()
        .filter_map(|id| id.split_once(':').map(|(ns, _)| ns.to_string()));
    let touched: Vec<String> = overrides
        .methods
        .keys()
        .chain(overrides.chains.keys())
        .chain(overrides.events.keys())
        .cloned()
        .chain(rpc_namespaces)
        .collect();
    for ns in touched {
        base.entry(ns.clone()).or_insert_with(|| default_namespace(&ns));
    }

    for (ns, methods) in &overrides.methods {
        if let Some(namespace) = base.get_mut(ns) {
            namespace.methods = methods.clone();
        }
    }
    for (ns, chains) in &overrides.chains {
        if let Some(namespace) = base.get_mut(ns) {
            namespace.chains = chains.clone();
        }
    }
    for (ns, events) in &overrides.events {
        if let Some(namespace) = base.get_mut(ns) {
            namespace.events = events.clone();
        }
    }

    let mut replaced: Vec<&str> = Vec::new();
    for (caip_id, rpc_url) in &overrides.rpc_map {
        let Some((ns, reference)) = caip_id.split_once(':') else {
            continue;
        };
        let Some(namespace) = base.get_mut(ns) else {
            continue;
        };
        if !replaced.contains(&ns) {
            namespace.rpc_map.clear();
            replaced.push(ns);
        }
        namespace.rpc_map.insert(reference.to_string(), rpc_url.clone());
    }

    base
}

/// Every chain a session approved: granted chains plus account prefixes
pub fn chains_from_session(namespaces: &BTreeMap<String, SessionNamespace>) -> Vec<CaipNetworkId> {
    let mut chains: Vec<CaipNetworkId> = Vec::new();
    for namespace in namespaces.values() {
        let granted = namespace
            .chains
            .iter()
            .flatten()
            .filter_map(|c| c.parse::<CaipNetworkId>().ok());
        let from_accounts = namespace
            .accounts
            .iter()
            .filter_map(|a| a.parse::<CaipAddress>().ok())
            .map(|a| a.network().clone());
        for chain in granted.chain(from_accounts).map(canonical_chain) {
            if !chains.contains(&chain) {
                chains.push(chain);
            }
        }
    }
    chains
}

/// One WalletConnect connection per namespace the session granted accounts in
pub fn connections_from_session(session: &Session) -> BTreeMap<Namespace, Connection> {
    let mut connections: BTreeMap<Namespace, Connection> = BTreeMap::new();

    for (key, namespace) in &session.namespaces {
        for raw in &namespace.accounts {
            let account: CaipAddress = match raw.parse() {
                Ok(account) => account,
                Err(_) => {
                    warn!("Ignoring malformed session account {} in {}", raw, key);
                    continue;
                }
            };
            let connection = connections
                .entry(account.namespace().clone())
                .or_insert_with(|| {
                    Connection::new(ids::WALLET_CONNECT, Vec::new())
                        .with_network(canonical_chain(account.network().clone()))
                });
            if !connection.has_address(account.address()) {
                connection.accounts.push(Account::new(account.address()));
            }
        }
    }

    connections
}
