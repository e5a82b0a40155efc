//! Solana Wallet Implementation
//!
//! An ed25519 key wallet answering wallet-standard requests
//! (`standard:connect`, `standard:accounts`, `standard:disconnect`,
//! `solana:signMessage`).

use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::info;

use super::WalletError;
use crate::adapter::{ProviderError, ProviderEvent, WalletProvider};

pub struct SolanaWallet {
    signing_key: SigningKey,
    /// wallet-standard chain name
    chain: String,
    connected: AtomicBool,
    events: broadcast::Sender<ProviderEvent>,
}

impl SolanaWallet {
    /// Create a wallet from a 32-byte secret seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            signing_key: SigningKey::from_bytes(seed),
            chain: "solana:mainnet".to_string(),
            connected: AtomicBool::new(false),
            events,
        }
    }

    /// Create a wallet from a 64-byte keypair (32 secret + 32 public)
    pub fn from_keypair_bytes(keypair: &[u8]) -> Result<Self, WalletError> {
        let bytes: &[u8; 64] = keypair.try_into().map_err(|_| {
            WalletError::InvalidPrivateKey(format!("Expected 64 bytes, got {}", keypair.len()))
        })?;
        let signing_key = SigningKey::from_keypair_bytes(bytes)
            .map_err(|e| WalletError::InvalidPrivateKey(format!("{}", e)))?;
        Ok(Self::from_seed(&signing_key.to_bytes()))
    }

    /// Create a wallet from a base58 encoded keypair
    pub fn from_base58(keypair: &str) -> Result<Self, WalletError> {
        let bytes = bs58::decode(keypair)
            .into_vec()
            .map_err(|e| WalletError::InvalidPrivateKey(format!("Invalid base58: {}", e)))?;
        Self::from_keypair_bytes(&bytes)
    }

    /// Report devnet as the wallet's chain
    pub fn devnet(mut self) -> Self {
        self.chain = "solana:devnet".to_string();
        self
    }

    /// Start out having already granted the dApp its account
    pub fn authorized(self) -> Self {
        self.connected.store(true, Ordering::SeqCst);
        self
    }

    /// Get the public key as a base58 string
    pub fn pubkey_string(&self) -> String {
        bs58::encode(self.signing_key.verifying_key().as_bytes()).into_string()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn sign_bytes(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// The user disconnected the dApp from the wallet side
    pub fn revoke(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!("Embedded Solana wallet {} revoked", self.pubkey_string());
            let _ = self.events.send(ProviderEvent::new("disconnect", Value::Null));
        }
    }

    fn accounts(&self) -> Value {
        if !self.is_connected() {
            return json!({ "accounts": [] });
        }
        json!({
            "accounts": [{ "address": self.pubkey_string(), "chains": [self.chain] }]
        })
    }

    fn sign_message(&self, params: &Value) -> Result<Value, ProviderError> {
        let account = params
            .get("account")
            .and_then(Value::as_str)
            .ok_or_else(|| WalletError::InvalidParams("missing account".to_string()))?;
        if !self.is_connected() || account != self.pubkey_string() {
            return Err(ProviderError::new(
                ProviderError::UNAUTHORIZED,
                &format!("{} is not authorized", account),
            ));
        }

        let encoded = params
            .get("message")
            .and_then(Value::as_str)
            .ok_or_else(|| WalletError::InvalidParams("missing message".to_string()))?;
        let message = bs58::decode(encoded)
            .into_vec()
            .map_err(|e| WalletError::InvalidParams(format!("message is not base58: {}", e)))?;

        let signature = self.sign_bytes(&message);
        Ok(json!({ "signature": bs58::encode(signature.to_bytes()).into_string() }))
    }
}

#[async_trait]
impl WalletProvider for SolanaWallet {
    async fn request(&self, method: &str, params: Value) -> Result<Value, ProviderError> {
        match method {
            "standard:connect" => {
                self.connected.store(true, Ordering::SeqCst);
                Ok(self.accounts())
            }
            "standard:accounts" => Ok(self.accounts()),
            "standard:disconnect" => {
                self.connected.store(false, Ordering::SeqCst);
                Ok(Value::Null)
            }
            "solana:signMessage" => self.sign_message(&params),
            other => Err(ProviderError::unsupported_method(other)),
        }
    }

    fn events(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }
}

impl std::fmt::Debug for SolanaWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolanaWallet")
            .field("pubkey", &self.pubkey_string())
            .field("chain", &self.chain)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{ChainAdapter, ConnectParams, ProviderHandle, SolanaAdapter};
    use crate::adapter::solana::is_valid_address;
    use crate::caip::{networks, Namespace};
    use crate::connector::ids;
    use crate::wallet::auth_connector;
    use ed25519_dalek::Verifier;
    use std::sync::Arc;
    use tokio_test::assert_ok;

    #[test]
    fn test_pubkey_string() {
        let wallet = SolanaWallet::from_seed(&[7u8; 32]);
        assert!(is_valid_address(&wallet.pubkey_string()));
    }

    #[test]
    fn test_keypair_bytes_must_match() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let wallet = SolanaWallet::from_keypair_bytes(&key.to_keypair_bytes()).unwrap();
        assert_eq!(
            wallet.pubkey_string(),
            bs58::encode(key.verifying_key().as_bytes()).into_string()
        );

        let encoded = bs58::encode(key.to_keypair_bytes()).into_string();
        assert!(SolanaWallet::from_base58(&encoded).is_ok());

        let mut mismatched = key.to_keypair_bytes();
        mismatched[63] ^= 0xff;
        assert!(SolanaWallet::from_keypair_bytes(&mismatched).is_err());
        assert!(SolanaWallet::from_keypair_bytes(&[0u8; 32]).is_err());
    }

    #[tokio::test]
    async fn test_signs_through_solana_adapter() {
        let wallet = Arc::new(SolanaWallet::from_seed(&[7u8; 32]).devnet());
        let adapter = SolanaAdapter::new();
        adapter
            .register_provider(auth_connector(
                Namespace::solana(),
                ProviderHandle::from(wallet.clone()),
            ))
            .await;

        let result = assert_ok!(adapter.connect(ids::AUTH, &ConnectParams::default()).await);
        assert_eq!(result.address, wallet.pubkey_string());
        assert_eq!(result.chain_id, Some(networks::solana_devnet().caip_network_id));

        let encoded = assert_ok!(adapter.sign_message(ids::AUTH, &result.address, "gm").await);
        let bytes: [u8; 64] = bs58::decode(encoded).into_vec().unwrap().try_into().unwrap();
        let signature = Signature::from_bytes(&bytes);
        assert!(wallet
            .signing_key
            .verifying_key()
            .verify(b"gm", &signature)
            .is_ok());

        adapter.disconnect(ids::AUTH).await.unwrap();
        assert!(!wallet.is_connected());
        assert!(adapter.get_accounts(ids::AUTH).await.unwrap().is_empty());
    }
}
