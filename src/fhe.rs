use crate::api::{ContractAddress, EncryptedInput, Handle, InputProof, UserPubKey};
use crate::db::DB;
use async_trait::async_trait;
use log::{debug, trace};
use secp256k1::hashes::{sha256, Hash};
use secp256k1::rand::{self, Rng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

const INPUT_PROOF_TAG: &[u8] = b"encrypted-mercado/input-proof/v1";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FheError {
    #[error("Unknown ciphertext handle {0}")]
    UnknownHandle(Handle),
    #[error("Ciphertext {0} has type {1:?} but {2:?} was expected")]
    TypeMismatch(Handle, CipherType, CipherType),
    #[error("Input proof for {0} does not bind it to this submitter and contract")]
    InvalidProof(Handle),
    #[error("Couldn't persist ciphertext: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherType {
    Bool,
    Uint32,
}

/// Encrypted-integer capability of the host.
///
/// Every operation consumes handles and yields a fresh one; nothing is ever
/// edited in place. `decrypt` is reserved to the decryption oracle.
#[async_trait]
pub trait Fhe {
    async fn trivial_encrypt(&self, value: u32) -> Result<Handle, FheError>;
    /// Wrapping subtraction modulo 2^32.
    async fn sub(&self, lhs: &Handle, rhs: &Handle) -> Result<Handle, FheError>;
    /// Encrypted `lhs < rhs` against a plaintext scalar.
    async fn lt_scalar(&self, lhs: &Handle, rhs: u32) -> Result<Handle, FheError>;
    /// Encrypted `condition ? if_true : if_false`.
    async fn select(
        &self,
        condition: &Handle,
        if_true: &Handle,
        if_false: &Handle,
    ) -> Result<Handle, FheError>;
    async fn verify_input(
        &self,
        handle: &Handle,
        proof: &InputProof,
        user: &UserPubKey,
        contract: &ContractAddress,
    ) -> Result<Handle, FheError>;
    async fn encrypt_input(
        &self,
        value: u32,
        user: &UserPubKey,
        contract: &ContractAddress,
    ) -> Result<EncryptedInput, FheError>;
    async fn decrypt(&self, handle: &Handle) -> Result<u32, FheError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ciphertext {
    pub kind: CipherType,
    pub value: u32,
    /// Submitted by a user through `encrypt_input`.
    pub input: bool,
}

/// Stand-in for the coprocessor. Keeps plaintexts next to their handles,
/// so it only fits tests and local development.
///
/// With a database attached every ciphertext is written through to it,
/// so handles stored by the market survive a restart.
#[derive(Default)]
pub struct TestFhe {
    ciphertexts: RwLock<HashMap<Handle, Ciphertext>>,
    db: Option<Arc<Box<dyn DB + Send + Sync>>>,
}
impl TestFhe {
    pub async fn persistent(db: Arc<Box<dyn DB + Send + Sync>>) -> anyhow::Result<Self> {
        let ciphertexts: HashMap<_, _> = db.get_ciphertexts().await?.into_iter().collect();
        debug!("Loaded {} ciphertexts", ciphertexts.len());
        Ok(Self {
            ciphertexts: RwLock::new(ciphertexts),
            db: Some(db),
        })
    }
    async fn store(&self, kind: CipherType, value: u32, input: bool) -> Result<Handle, FheError> {
        let mut handle = Handle::from_bytes(rand::thread_rng().gen());
        let mut ciphertexts = self.ciphertexts.write().await;
        while handle.is_zero() || ciphertexts.contains_key(&handle) {
            handle = Handle::from_bytes(rand::thread_rng().gen());
        }
        let ciphertext = Ciphertext { kind, value, input };
        if let Some(db) = &self.db {
            db.store_ciphertext(&handle, &ciphertext)
                .await
                .map_err(|err| FheError::Storage(format!("{:#}", err)))?;
        }
        ciphertexts.insert(handle, ciphertext);
        trace!("Stored {:?} ciphertext {}", kind, handle);
        Ok(handle)
    }
    async fn load(&self, handle: &Handle, kind: CipherType) -> Result<Ciphertext, FheError> {
        let ciphertext = *self
            .ciphertexts
            .read()
            .await
            .get(handle)
            .ok_or(FheError::UnknownHandle(*handle))?;
        if ciphertext.kind != kind {
            return Err(FheError::TypeMismatch(*handle, ciphertext.kind, kind));
        }
        Ok(ciphertext)
    }
    fn input_proof(handle: &Handle, user: &UserPubKey, contract: &ContractAddress) -> InputProof {
        let mut preimage = INPUT_PROOF_TAG.to_vec();
        preimage.extend_from_slice(handle.as_bytes());
        preimage.extend_from_slice(&user.serialize());
        preimage.extend_from_slice(contract.as_bytes());
        InputProof::new(sha256::Hash::hash(&preimage)[..].to_vec())
    }
}
#[async_trait]
impl Fhe for TestFhe {
    async fn trivial_encrypt(&self, value: u32) -> Result<Handle, FheError> {
        self.store(CipherType::Uint32, value, false).await
    }
    async fn sub(&self, lhs: &Handle, rhs: &Handle) -> Result<Handle, FheError> {
        let lhs = self.load(lhs, CipherType::Uint32).await?;
        let rhs = self.load(rhs, CipherType::Uint32).await?;
        self.store(CipherType::Uint32, lhs.value.wrapping_sub(rhs.value), false).await
    }
    async fn lt_scalar(&self, lhs: &Handle, rhs: u32) -> Result<Handle, FheError> {
        let lhs = self.load(lhs, CipherType::Uint32).await?;
        self.store(CipherType::Bool, u32::from(lhs.value < rhs), false).await
    }
    async fn select(
        &self,
        condition: &Handle,
        if_true: &Handle,
        if_false: &Handle,
    ) -> Result<Handle, FheError> {
        let condition = self.load(condition, CipherType::Bool).await?;
        let if_true = self.load(if_true, CipherType::Uint32).await?;
        let if_false = self.load(if_false, CipherType::Uint32).await?;
        let value = if condition.value != 0 {
            if_true.value
        } else {
            if_false.value
        };
        self.store(CipherType::Uint32, value, false).await
    }
    async fn verify_input(
        &self,
        handle: &Handle,
        proof: &InputProof,
        user: &UserPubKey,
        contract: &ContractAddress,
    ) -> Result<Handle, FheError> {
        let ciphertext = match self.load(handle, CipherType::Uint32).await {
            Ok(ciphertext) => ciphertext,
            Err(_) => return Err(FheError::InvalidProof(*handle)),
        };
        if !ciphertext.input || Self::input_proof(handle, user, contract) != *proof {
            return Err(FheError::InvalidProof(*handle));
        }
        Ok(*handle)
    }
    async fn encrypt_input(
        &self,
        value: u32,
        user: &UserPubKey,
        contract: &ContractAddress,
    ) -> Result<EncryptedInput, FheError> {
        let handle = self.store(CipherType::Uint32, value, true).await?;
        let proof = Self::input_proof(&handle, user, contract);
        Ok(EncryptedInput { handle, proof })
    }
    async fn decrypt(&self, handle: &Handle) -> Result<u32, FheError> {
        if handle.is_zero() {
            return Ok(0);
        }
        Ok(self
            .ciphertexts
            .read()
            .await
            .get(handle)
            .ok_or(FheError::UnknownHandle(*handle))?
            .value)
    }
}
