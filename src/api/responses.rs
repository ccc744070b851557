use serde::{Deserialize, Serialize};

use super::*;
use crate::decrypt::DecryptError;

#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
pub struct EncryptedInput {
    pub handle: Handle,
    pub proof: InputProof,
}
#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
pub struct MarketInfo {
    pub contract: ContractAddress,
    pub starting_points: u32,
    pub bet_cost: u32,
    pub max_options: usize,
    pub max_remaining_bets: u32,
}
#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
pub struct UserDecryptResponse {
    pub handle: Handle,
    pub oracle_key: secp256k1::PublicKey,
    pub ciphertext: Vec<u8>,
}
#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
pub struct DecryptDenied {
    pub reason: DecryptError,
}
