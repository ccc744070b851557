use std::{
    fmt::{Debug, Display, Formatter},
    str::FromStr,
};

use secp256k1::rand::{self, Rng};

use super::*;

impl Handle {
    pub const ZERO: Handle = Handle([0; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}
impl Display for Handle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", to_hex(&self.0))
    }
}
impl Debug for Handle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handle({})", self)
    }
}
impl FromStr for Handle {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(from_hex(s)?))
    }
}
impl From<Handle> for String {
    fn from(handle: Handle) -> Self {
        handle.to_string()
    }
}
impl TryFrom<String> for Handle {
    type Error = anyhow::Error;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl ContractAddress {
    pub fn random() -> Self {
        Self(rand::thread_rng().gen())
    }
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}
impl Display for ContractAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", to_hex(&self.0))
    }
}
impl Debug for ContractAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContractAddress({})", self)
    }
}
impl FromStr for ContractAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(from_hex(s)?))
    }
}
impl From<ContractAddress> for String {
    fn from(address: ContractAddress) -> Self {
        address.to_string()
    }
}
impl TryFrom<String> for ContractAddress {
    type Error = anyhow::Error;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl InputProof {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}
impl Display for InputProof {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", to_hex(&self.0))
    }
}
impl Debug for InputProof {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "InputProof({})", self)
    }
}
impl From<InputProof> for String {
    fn from(proof: InputProof) -> Self {
        proof.to_string()
    }
}
impl TryFrom<String> for InputProof {
    type Error = anyhow::Error;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        Ok(Self(from_hex_vec(&s)?))
    }
}

impl Display for Principal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User(user) => write!(f, "User({})", user),
            Self::Contract(contract) => write!(f, "Contract({})", contract),
        }
    }
}
impl From<UserPubKey> for Principal {
    fn from(user: UserPubKey) -> Self {
        Self::User(user)
    }
}
impl From<ContractAddress> for Principal {
    fn from(contract: ContractAddress) -> Self {
        Self::Contract(contract)
    }
}

impl Display for MercadoEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserRegistered { user } => write!(f, "UserRegistered({})", user),
            Self::PredictionCreated { id, creator } => {
                write!(f, "PredictionCreated({}, {})", id, creator)
            }
            Self::BetPlaced { prediction, user } => write!(f, "BetPlaced({}, {})", prediction, user),
        }
    }
}
