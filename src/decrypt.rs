use crate::api::{ContractAddress, Handle, UserDecryptRequest, UserDecryptResponse, UserPubKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use secp256k1::ecdh::SharedSecret;
use secp256k1::ecdsa::Signature;
use secp256k1::hashes::{sha256, Hash};
use secp256k1::{generate_keypair, rand, Message, PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

pub const DEFAULT_WINDOW_DAYS: u32 = 7;
pub const MAX_WINDOW_DAYS: u32 = 365;
/// Tolerated clock drift for permits that start in the future, in seconds.
pub const MAX_CLOCK_SKEW: i64 = 5 * 60;

const PERMIT_DOMAIN: &[u8] = b"encrypted-mercado/user-decrypt";
const PERMIT_VERSION: u8 = 1;
const ENVELOPE_TAG: &[u8] = b"encrypted-mercado/reencrypt/v1";
const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecryptError {
    #[error("Decryption window is expired or not valid yet")]
    ExpiredWindow,
    #[error("ACL denied")]
    AclDenied,
    #[error("Permit signature doesn't match the user")]
    BadSignature,
    #[error("Decryption oracle unavailable")]
    OracleUnavailable,
}
impl DecryptError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DecryptError::OracleUnavailable)
    }
}

/// Keypair that only lives for a single decryption. The oracle re-encrypts
/// under `public`; dropping the keypair makes the response unreadable.
pub struct EphemeralKeypair {
    secret: SecretKey,
    pub public: PublicKey,
}
impl EphemeralKeypair {
    pub fn generate() -> Self {
        let (secret, public) = generate_keypair(&mut rand::thread_rng());
        Self { secret, public }
    }
    /// Recovers the plaintext the oracle sealed for this keypair.
    pub fn open(&self, response: &UserDecryptResponse) -> Result<u32, DecryptError> {
        let sealed: [u8; 4] = response
            .ciphertext
            .as_slice()
            .try_into()
            .map_err(|_| DecryptError::OracleUnavailable)?;
        let pad = envelope_pad(&response.oracle_key, &self.secret);
        Ok(u32::from_be_bytes(xor(sealed, pad)))
    }
}

/// Re-encrypts `value` for `recipient`. Returns the one-time public key the
/// recipient needs next to the sealed bytes.
pub fn seal(value: u32, recipient: &PublicKey) -> (PublicKey, Vec<u8>) {
    let (secret, public) = generate_keypair(&mut rand::thread_rng());
    let pad = envelope_pad(recipient, &secret);
    (public, xor(value.to_be_bytes(), pad).to_vec())
}

fn envelope_pad(point: &PublicKey, scalar: &SecretKey) -> [u8; 4] {
    let mut preimage = ENVELOPE_TAG.to_vec();
    preimage.extend_from_slice(&SharedSecret::new(point, scalar).secret_bytes());
    let digest = sha256::Hash::hash(&preimage);
    let mut pad = [0; 4];
    pad.copy_from_slice(&digest[..4]);
    pad
}

fn xor(bytes: [u8; 4], pad: [u8; 4]) -> [u8; 4] {
    let mut out = [0; 4];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = bytes[i] ^ pad[i];
    }
    out
}

/// Structured message the owner of a handle signs to authorize one
/// ephemeral key for a set of contracts during a limited window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptPermit {
    pub public_key: PublicKey,
    pub contracts: Vec<ContractAddress>,
    /// Unix seconds.
    pub window_start: i64,
    pub window_days: u32,
}
impl DecryptPermit {
    pub fn new(public_key: PublicKey, contracts: Vec<ContractAddress>, start: DateTime<Utc>) -> Self {
        Self {
            public_key,
            contracts,
            window_start: start.timestamp(),
            window_days: DEFAULT_WINDOW_DAYS,
        }
    }
    pub fn from_request(request: &UserDecryptRequest) -> Self {
        Self {
            public_key: request.public_key,
            contracts: request.contracts.clone(),
            window_start: request.window_start,
            window_days: request.window_days,
        }
    }
    /// Version 1 encoding: domain, separator, version, key, length-prefixed
    /// contracts and the window, integers big endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = PERMIT_DOMAIN.to_vec();
        bytes.push(0x00);
        bytes.push(PERMIT_VERSION);
        bytes.extend_from_slice(&self.public_key.serialize());
        bytes.extend_from_slice(&(self.contracts.len() as u32).to_be_bytes());
        for contract in &self.contracts {
            bytes.extend_from_slice(contract.as_bytes());
        }
        bytes.extend_from_slice(&self.window_start.to_be_bytes());
        bytes.extend_from_slice(&self.window_days.to_be_bytes());
        bytes
    }
    pub fn message(&self) -> Message {
        Message::from_hashed_data::<sha256::Hash>(&self.encode())
    }
    pub fn sign(&self, signer: &SecretKey) -> Signature {
        signer.sign_ecdsa(self.message())
    }
    pub fn verify(&self, signature: &Signature, user: &UserPubKey) -> Result<(), DecryptError> {
        signature
            .verify(&self.message(), user)
            .map_err(|_| DecryptError::BadSignature)
    }
    pub fn check_window(&self, now: DateTime<Utc>) -> Result<(), DecryptError> {
        if !(1..=MAX_WINDOW_DAYS).contains(&self.window_days) {
            return Err(DecryptError::ExpiredWindow);
        }
        let now = now.timestamp();
        if self.window_start > now.saturating_add(MAX_CLOCK_SKEW) {
            return Err(DecryptError::ExpiredWindow);
        }
        let end = self
            .window_start
            .saturating_add(i64::from(self.window_days) * SECONDS_PER_DAY);
        if now > end {
            return Err(DecryptError::ExpiredWindow);
        }
        Ok(())
    }
    pub fn covers(&self, contract: &ContractAddress) -> bool {
        self.contracts.contains(contract)
    }
    /// Signs the permit as `signer` and wraps it into a request for `handle`.
    pub fn request(
        &self,
        handle: Handle,
        contract: ContractAddress,
        signer: &SecretKey,
    ) -> UserDecryptRequest {
        UserDecryptRequest {
            handle,
            contract,
            user: PublicKey::from_secret_key_global(signer),
            public_key: self.public_key,
            contracts: self.contracts.clone(),
            signature: self.sign(signer),
            window_start: self.window_start,
            window_days: self.window_days,
        }
    }
}

#[async_trait]
pub trait DecryptionOracle {
    async fn user_decrypt(
        &self,
        request: &UserDecryptRequest,
    ) -> Result<UserDecryptResponse, DecryptError>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}
impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Decrypts `handle` of `contract` on behalf of the owner of `signer`.
///
/// The zero handle is `0` and never reaches the oracle. Only
/// `OracleUnavailable` is retried, doubling the pause each time.
pub async fn user_decrypt<O: DecryptionOracle + ?Sized>(
    oracle: &O,
    handle: &Handle,
    contract: &ContractAddress,
    signer: &SecretKey,
    retry: &RetryPolicy,
) -> Result<u32, DecryptError> {
    if handle.is_zero() {
        return Ok(0);
    }
    let keypair = EphemeralKeypair::generate();
    let permit = DecryptPermit::new(keypair.public, vec![*contract], Utc::now());
    let request = permit.request(*handle, *contract, signer);
    let mut backoff = retry.initial_backoff;
    let mut attempt = 1;
    loop {
        match oracle.user_decrypt(&request).await {
            Err(err) if err.is_retryable() && attempt < retry.attempts => {
                warn!(
                    "Decryption of {} failed ({}), attempt {}/{}, retrying in {:?}",
                    handle, err, attempt, retry.attempts, backoff
                );
                sleep(backoff).await;
                backoff = (backoff * 2).min(retry.max_backoff);
                attempt += 1;
            }
            result => {
                let response = result?;
                if response.handle != *handle {
                    return Err(DecryptError::OracleUnavailable);
                }
                debug!("Decrypted {} after {} attempt(s)", handle, attempt);
                return keypair.open(&response);
            }
        }
    }
}
