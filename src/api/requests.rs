use secp256k1::ecdsa::Signature;
use serde::{Deserialize, Serialize};

use super::*;

// Requests
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct AccessRequest {
    pub user: UserPubKey,
    pub challenge: String,
    pub sig: Signature,
}
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PostRequest<T> {
    pub access: AccessRequest,
    pub data: T,
}
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoginRequest {
    pub user: UserPubKey,
    pub challenge: String,
    pub sig: Signature,
}
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct NewPredictionRequest {
    pub title: String,
    pub options: Vec<String>,
}
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PlaceBetRequest {
    pub prediction: PredictionId,
    pub choice: Handle,
    pub proof: InputProof,
}
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EncryptInputRequest {
    pub value: u32,
}
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PredictionRequest {
    pub prediction: PredictionId,
}
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct UserBetRequest {
    pub prediction: PredictionId,
    pub user: UserPubKey,
}
/// Wire form of a user decryption request. `signature` covers the permit
/// rebuilt from `public_key`, `contracts`, `window_start` and `window_days`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct UserDecryptRequest {
    pub handle: Handle,
    pub contract: ContractAddress,
    pub user: UserPubKey,
    pub public_key: secp256k1::PublicKey,
    pub contracts: Vec<ContractAddress>,
    pub signature: Signature,
    pub window_start: i64,
    pub window_days: u32,
}
