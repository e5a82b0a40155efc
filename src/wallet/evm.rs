//! EVM Wallet Implementation
//!
//! A secp256k1 key wallet answering EIP-1193 requests, signing with ethers-rs.

use async_trait::async_trait;
use ethers_core::types::{Address, Signature};
use ethers_core::utils::to_checksum;
use ethers_signers::{LocalWallet, Signer};
use k256::ecdsa::SigningKey;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::WalletError;
use crate::adapter::evm::parse_chain_id;
use crate::adapter::{ProviderError, ProviderEvent, WalletProvider};

/// EVM wallet for signing messages on behalf of the auth connector
pub struct EvmWallet {
    /// The underlying wallet (private key)
    wallet: LocalWallet,
    chain_id: AtomicU64,
    /// Chains `wallet_switchEthereumChain` accepts
    chains: Vec<u64>,
    connected: AtomicBool,
    events: broadcast::Sender<ProviderEvent>,
}

impl EvmWallet {
    /// Create a new wallet from a private key (hex string, with or without 0x prefix)
    pub fn from_private_key(private_key: &str, chain_id: u64) -> Result<Self, WalletError> {
        let key = private_key.strip_prefix("0x").unwrap_or(private_key);
        let bytes = hex::decode(key)
            .map_err(|e| WalletError::InvalidPrivateKey(format!("{}", e)))?;
        let signing_key = SigningKey::from_slice(&bytes)
            .map_err(|e| WalletError::InvalidPrivateKey(format!("{}", e)))?;

        let (events, _) = broadcast::channel(16);
        Ok(Self {
            wallet: LocalWallet::from(signing_key).with_chain_id(chain_id),
            chain_id: AtomicU64::new(chain_id),
            chains: vec![chain_id],
            connected: AtomicBool::new(false),
            events,
        })
    }

    /// Also accept switches to `chains`
    pub fn with_chains(mut self, chains: &[u64]) -> Self {
        for chain in chains {
            if !self.chains.contains(chain) {
                self.chains.push(*chain);
            }
        }
        self
    }

    /// Start out having already granted the dApp its accounts
    pub fn authorized(self) -> Self {
        self.connected.store(true, Ordering::SeqCst);
        self
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    /// EIP-55 checksummed address
    pub fn address_string(&self) -> String {
        to_checksum(&self.wallet.address(), None)
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Sign a message (personal_sign / eth_sign format)
    pub async fn sign_message(&self, message: &[u8]) -> Result<Signature, WalletError> {
        self.wallet
            .sign_message(message)
            .await
            .map_err(|e| WalletError::SigningFailed(format!("{}", e)))
    }

    /// The user revoked the dApp from the wallet side
    pub fn revoke(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!("Embedded EVM wallet {} revoked", self.address_string());
            let _ = self.events.send(ProviderEvent::new("accountsChanged", json!([])));
        }
    }

    fn accounts(&self) -> Value {
        if self.is_connected() {
            json!([self.address_string()])
        } else {
            json!([])
        }
    }

    fn switch_chain(&self, params: &Value) -> Result<Value, ProviderError> {
        let requested = params
            .get(0)
            .and_then(|p| p.get("chainId"))
            .and_then(parse_chain_id)
            .ok_or_else(|| ProviderError::new(-32602, "chainId is required"))?;
        if !self.chains.contains(&requested) {
            return Err(ProviderError::new(
                ProviderError::UNRECOGNIZED_CHAIN,
                &format!("Unrecognized chain ID \"0x{:x}\"", requested),
            ));
        }

        if self.chain_id.swap(requested, Ordering::SeqCst) != requested {
            debug!("Embedded EVM wallet moved to chain {}", requested);
            let _ = self
                .events
                .send(ProviderEvent::new("chainChanged", json!(format!("0x{:x}", requested))));
        }
        Ok(Value::Null)
    }

    async fn personal_sign(&self, params: &Value) -> Result<Value, ProviderError> {
        let payload = params
            .get(0)
            .and_then(Value::as_str)
            .ok_or_else(|| WalletError::InvalidParams("missing message".to_string()))?;
        let signer = params
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| WalletError::InvalidParams("missing address".to_string()))?;
        if !self.is_connected() || !signer.eq_ignore_ascii_case(&self.address_string()) {
            return Err(ProviderError::new(
                ProviderError::UNAUTHORIZED,
                &format!("{} is not authorized", signer),
            ));
        }

        let message = match payload.strip_prefix("0x").map(hex::decode) {
            Some(Ok(bytes)) => bytes,
            _ => payload.as_bytes().to_vec(),
        };
        let signature = self.sign_message(&message).await?;
        Ok(json!(format!("0x{}", hex::encode(signature.to_vec()))))
    }
}

#[async_trait]
impl WalletProvider for EvmWallet {
    async fn request(&self, method: &str, params: Value) -> Result<Value, ProviderError> {
        match method {
            "eth_requestAccounts" => {
                self.connected.store(true, Ordering::SeqCst);
                Ok(self.accounts())
            }
            "eth_accounts" => Ok(self.accounts()),
            "eth_chainId" => Ok(json!(format!("0x{:x}", self.chain_id()))),
            "wallet_switchEthereumChain" => self.switch_chain(&params),
            "personal_sign" => self.personal_sign(&params).await,
            "wallet_revokePermissions" => {
                self.connected.store(false, Ordering::SeqCst);
                Ok(Value::Null)
            }
            other => Err(ProviderError::unsupported_method(other)),
        }
    }

    fn events(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }
}

impl std::fmt::Debug for EvmWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvmWallet")
            .field("address", &self.address_string())
            .field("chain_id", &self.chain_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterEvent, ChainAdapter, ConnectParams, EvmAdapter, ProviderHandle};
    use crate::caip::{networks, Namespace};
    use crate::wallet::auth_connector;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    // Test private key (DO NOT USE IN PRODUCTION)
    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const TEST_ADDR: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";

    #[test]
    fn test_wallet_from_private_key() {
        let wallet = EvmWallet::from_private_key(TEST_KEY, 1).unwrap();
        assert_eq!(wallet.address_string(), TEST_ADDR);

        let wallet = EvmWallet::from_private_key(&TEST_KEY[2..], 42161).unwrap();
        assert_eq!(wallet.chain_id(), 42161);

        assert!(EvmWallet::from_private_key("0x1234", 1).is_err());
        assert!(EvmWallet::from_private_key("not hex", 1).is_err());
    }

    #[tokio::test]
    async fn test_accounts_require_connect() {
        let wallet = EvmWallet::from_private_key(TEST_KEY, 1).unwrap();
        assert_eq!(wallet.request("eth_accounts", json!([])).await.unwrap(), json!([]));

        let accounts = assert_ok!(wallet.request("eth_requestAccounts", json!([])).await);
        assert_eq!(accounts, json!([TEST_ADDR]));
        assert_eq!(wallet.request("eth_chainId", json!([])).await.unwrap(), json!("0x1"));

        wallet
            .request("wallet_revokePermissions", json!([{ "eth_accounts": {} }]))
            .await
            .unwrap();
        assert!(!wallet.is_connected());

        let remembered = EvmWallet::from_private_key(TEST_KEY, 1).unwrap().authorized();
        assert_eq!(
            remembered.request("eth_accounts", json!([])).await.unwrap(),
            json!([TEST_ADDR])
        );
    }

    #[tokio::test]
    async fn test_switch_chain() {
        let wallet = EvmWallet::from_private_key(TEST_KEY, 1)
            .unwrap()
            .with_chains(&[137]);
        let mut events = wallet.events();

        assert_ok!(
            wallet
                .request("wallet_switchEthereumChain", json!([{ "chainId": "0x89" }]))
                .await
        );
        assert_eq!(wallet.chain_id(), 137);
        assert_eq!(
            events.recv().await.unwrap(),
            ProviderEvent::new("chainChanged", json!("0x89"))
        );

        let err = assert_err!(
            wallet
                .request("wallet_switchEthereumChain", json!([{ "chainId": "0xa4b1" }]))
                .await
        );
        assert_eq!(err.code, ProviderError::UNRECOGNIZED_CHAIN);
    }

    #[tokio::test]
    async fn test_personal_sign_recovers_to_signer() {
        let wallet = EvmWallet::from_private_key(TEST_KEY, 1).unwrap();
        let params = json!(["0x68656c6c6f", TEST_ADDR]);

        // Not connected yet
        let err = assert_err!(wallet.request("personal_sign", params.clone()).await);
        assert_eq!(err.code, ProviderError::UNAUTHORIZED);

        wallet.request("eth_requestAccounts", json!([])).await.unwrap();
        let raw = assert_ok!(wallet.request("personal_sign", params).await);
        let bytes = hex::decode(raw.as_str().unwrap().trim_start_matches("0x")).unwrap();
        let signature = Signature::try_from(bytes.as_slice()).unwrap();
        assert_eq!(signature.recover("hello").unwrap(), wallet.address());
    }

    #[tokio::test]
    async fn test_drives_evm_adapter_as_auth_connector() {
        let wallet = Arc::new(EvmWallet::from_private_key(TEST_KEY, 1).unwrap());
        let adapter = EvmAdapter::new();
        adapter
            .register_provider(auth_connector(
                Namespace::eip155(),
                ProviderHandle::from(wallet.clone()),
            ))
            .await;
        let mut events = adapter.subscribe();

        let result = assert_ok!(
            adapter
                .connect(crate::connector::ids::AUTH, &ConnectParams::default())
                .await
        );
        assert_eq!(result.address, TEST_ADDR);
        assert_eq!(result.chain_id, Some(networks::mainnet().caip_network_id));

        wallet.revoke();
        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            AdapterEvent::AccountsChanged {
                connector_id: crate::connector::ids::AUTH.to_string(),
                accounts: Vec::new(),
            }
        );
    }
}
