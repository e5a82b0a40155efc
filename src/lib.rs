//! multiconnect - multi-namespace wallet connection orchestration
//!
//! Tracks wallet sessions across unrelated chain namespaces (EVM, Solana,
//! Bitcoin) behind one adapter contract: connector registry, per-namespace
//! connections with an explicit active selection, persisted rehydration and
//! WalletConnect session negotiation.

pub mod adapter;
pub mod caip;
pub mod client;
pub mod config;
pub mod connector;
pub mod controllers;
pub mod error;
pub mod storage;
pub mod store;
pub mod types;
pub mod wallet;
pub mod walletconnect;

#[cfg(test)]
mod testing;

pub use adapter::{AdapterEvent, ChainAdapter, ConnectParams, ConnectResult, WalletProvider};
pub use caip::{networks, CaipAddress, CaipNetwork, CaipNetworkId, Namespace};
pub use client::{MultiConnect, MultiConnectBuilder};
pub use config::{ConnectConfig, OperationPolicy};
pub use connector::{Connector, ConnectorKind, MergedConnector};
pub use controllers::{ChainController, ConnectionController, ConnectorController, DisconnectParams};
pub use error::ConnectError;
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use types::{Account, Connection, ConnectionStatus};
