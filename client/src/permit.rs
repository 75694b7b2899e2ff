//! Entry-fee authorization.
//!
//! A bet is an EIP-2612 `Permit` signed over EIP-712 typed data and bundled
//! into the `join_queue` request. The server submits the permit on-chain, so
//! the payload must match the token's verifier exactly.

use crate::channel::Emitter;
use crate::session::Wallet;
use crate::{Error, Result};
use clawbet_types::api::{JoinQueue, JoinQueueAck};
use ethers::contract::abigen;
use ethers::providers::Middleware;
use ethers::signers::Signer;
use ethers::types::transaction::eip712::{EIP712Domain, Eip712DomainType, TypedData};
use ethers::types::{Address, Signature, U256};
use ethers::utils::to_checksum;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

abigen!(
    Erc20Permit,
    r#"[
        function name() external view returns (string)
        function version() external view returns (string)
        function nonces(address owner) external view returns (uint256)
    ]"#
);

pub const PERMIT_TYPE: &str = "Permit";

/// On-chain values the permit domain and message depend on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PermitMetadata {
    pub name: String,
    pub nonce: U256,
    pub version: String,
}

/// Reads token metadata needed to build a permit.
pub trait TokenReader: Send + Sync + 'static {
    fn permit_metadata(
        &self,
        owner: Address,
    ) -> impl Future<Output = Result<PermitMetadata>> + Send;
}

impl<M: Middleware + 'static> TokenReader for Erc20Permit<M> {
    async fn permit_metadata(&self, owner: Address) -> Result<PermitMetadata> {
        let name = self.name();
        let nonce = self.nonces(owner);
        let version = self.version();
        let (name, nonce, version) = tokio::try_join!(name.call(), nonce.call(), version.call())
            .map_err(|e| Error::Contract(e.to_string()))?;
        Ok(PermitMetadata {
            name,
            nonce,
            version,
        })
    }
}

/// Signs permit typed data on behalf of the wallet owner.
pub trait PermitSigner: Send + Sync + 'static {
    fn sign_permit(&self, permit: &TypedData) -> impl Future<Output = Result<Signature>> + Send;
}

impl<S: Signer + 'static> PermitSigner for S {
    async fn sign_permit(&self, permit: &TypedData) -> Result<Signature> {
        self.sign_typed_data(permit)
            .await
            .map_err(|e| Error::Signing(e.to_string()))
    }
}

#[derive(Clone, Debug)]
pub struct PermitConfig {
    /// Stablecoin contract (the permit's verifying contract).
    pub token: Address,
    /// Game contract allowed to pull the stake.
    pub spender: Address,
    pub validity: Duration,
}

impl PermitConfig {
    pub fn new(token: Address, spender: Address) -> Self {
        Self {
            token,
            spender,
            validity: Duration::from_secs(clawbet_types::PERMIT_VALIDITY_SECS),
        }
    }
}

/// Result of one bet attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BetOutcome {
    /// No wallet connected; nothing was sent.
    Skipped,
    Queued { position: i64 },
    Rejected { error: String },
}

fn address_type(name: &str) -> Eip712DomainType {
    Eip712DomainType {
        name: name.to_string(),
        r#type: "address".to_string(),
    }
}

fn uint_type(name: &str) -> Eip712DomainType {
    Eip712DomainType {
        name: name.to_string(),
        r#type: "uint256".to_string(),
    }
}

fn string_type(name: &str) -> Eip712DomainType {
    Eip712DomainType {
        name: name.to_string(),
        r#type: "string".to_string(),
    }
}

/// Build the `Permit(owner, spender, value, nonce, deadline)` payload.
pub fn permit_typed_data(
    metadata: &PermitMetadata,
    chain_id: u64,
    token: Address,
    owner: Address,
    spender: Address,
    value: U256,
    deadline: u64,
) -> TypedData {
    let domain = EIP712Domain {
        name: Some(metadata.name.clone()),
        version: Some(metadata.version.clone()),
        chain_id: Some(U256::from(chain_id)),
        verifying_contract: Some(token),
        salt: None,
    };

    let mut types = BTreeMap::new();
    types.insert(
        "EIP712Domain".to_string(),
        vec![
            string_type("name"),
            string_type("version"),
            uint_type("chainId"),
            address_type("verifyingContract"),
        ],
    );
    types.insert(
        PERMIT_TYPE.to_string(),
        vec![
            address_type("owner"),
            address_type("spender"),
            uint_type("value"),
            uint_type("nonce"),
            uint_type("deadline"),
        ],
    );

    let mut message = BTreeMap::new();
    message.insert("owner".to_string(), Value::String(to_checksum(&owner, None)));
    message.insert(
        "spender".to_string(),
        Value::String(to_checksum(&spender, None)),
    );
    message.insert("value".to_string(), Value::String(value.to_string()));
    message.insert(
        "nonce".to_string(),
        Value::String(metadata.nonce.to_string()),
    );
    message.insert("deadline".to_string(), Value::String(deadline.to_string()));

    TypedData {
        domain,
        types,
        primary_type: PERMIT_TYPE.to_string(),
        message,
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Reads, signs and submits a queue entry.
pub struct BetAuthorizer<R, S> {
    reader: R,
    signer: S,
    config: PermitConfig,
}

impl<R: TokenReader, S: PermitSigner> BetAuthorizer<R, S> {
    pub fn new(reader: R, signer: S, config: PermitConfig) -> Self {
        Self {
            reader,
            signer,
            config,
        }
    }

    /// Read token metadata and sign a permit for `amount`. Returns the
    /// `join_queue` request carrying it.
    pub async fn prepare(&self, wallet: &Wallet, amount: u32) -> Result<JoinQueue> {
        let metadata = self.reader.permit_metadata(wallet.address).await?;
        let deadline = unix_now() + self.config.validity.as_secs();
        let permit = permit_typed_data(
            &metadata,
            wallet.chain_id,
            self.config.token,
            wallet.address,
            self.config.spender,
            U256::from(amount),
            deadline,
        );
        let signature = self.signer.sign_permit(&permit).await?;
        debug!(nonce = %metadata.nonce, deadline, "permit signed");

        Ok(JoinQueue {
            address: to_checksum(&wallet.address, None),
            amount,
            deadline,
            signature: format!("0x{signature}"),
        })
    }

    /// Sign a permit for `amount` and ask the server for a queue slot.
    ///
    /// Returns [`BetOutcome::Skipped`] without touching the network when no
    /// wallet is connected. Token read and signing failures are errors; a
    /// negative acknowledgement is [`BetOutcome::Rejected`].
    pub async fn approve_and_bet<E: Emitter>(
        &self,
        channel: &E,
        wallet: Option<&Wallet>,
        amount: u32,
    ) -> Result<BetOutcome> {
        let Some(wallet) = wallet else {
            debug!("no wallet connected, bet skipped");
            return Ok(BetOutcome::Skipped);
        };
        let request = self.prepare(wallet, amount).await?;
        let ack = channel.request(request).await?;
        Ok(bet_outcome(ack))
    }
}

/// Interpret a `join_queue` acknowledgement.
pub fn bet_outcome(ack: JoinQueueAck) -> BetOutcome {
    match (ack.status.is_ok(), ack.position) {
        (true, Some(position)) if position >= 0 => {
            info!(position, "joined queue");
            BetOutcome::Queued { position }
        }
        _ => {
            let error = ack
                .error
                .unwrap_or_else(|| "Failed to join the queue".to_string());
            warn!(%error, "join_queue rejected");
            BetOutcome::Rejected { error }
        }
    }
}
