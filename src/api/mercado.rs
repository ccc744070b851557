use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserPubKey = secp256k1::PublicKey;
pub type PredictionId = u64;

pub const STARTING_POINTS: u32 = 100;
pub const BET_COST: u32 = 10;
pub const MAX_OPTIONS: usize = 4;
pub const MAX_REMAINING_BETS: u32 = 10;

/// Opaque reference to an encrypted 32 bit value.
///
/// Handles are produced, never edited. The all-zero handle means that no
/// ciphertext has been produced yet and always decrypts to `0`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Handle(pub(crate) [u8; 32]);

/// Identity of a market instance. Acts as the ledger principal in ACLs and
/// scopes input proofs and decryption permits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ContractAddress(pub(crate) [u8; 20]);

/// Evidence that an externally supplied ciphertext was formed by `user` for
/// one contract.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct InputProof(pub(crate) Vec<u8>);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Principal {
    User(UserPubKey),
    Contract(ContractAddress),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub user: UserPubKey,
    pub remaining_bets: u32,
    pub balance: Handle,
}
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: PredictionId,
    pub title: String,
    pub options: Vec<String>,
    pub creator: UserPubKey,
    pub created_at: DateTime<Utc>,
    pub total_bets: u64,
}
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bet {
    pub prediction: PredictionId,
    pub user: UserPubKey,
    pub choice: Handle,
    pub amount: Handle,
}

/// Observable signals of the market. Never carries encrypted payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MercadoEvent {
    UserRegistered { user: UserPubKey },
    PredictionCreated { id: PredictionId, creator: UserPubKey },
    BetPlaced { prediction: PredictionId, user: UserPubKey },
}
