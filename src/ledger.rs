use crate::acl::{grant_all, Acl};
use crate::api::{ContractAddress, Handle, UserPubKey, STARTING_POINTS};
use crate::fhe::{Fhe, FheError};
use log::trace;
use std::sync::Arc;

/// Confidential balance arithmetic.
///
/// The ledger never learns a plaintext. It only produces new balance handles.
/// Persisting a returned handle is up to the caller, so that it lands
/// together with the plaintext counters it belongs to, and so is calling
/// `allow_owner` once it has landed.
pub struct Ledger {
    fhe: Arc<dyn Fhe + Send + Sync>,
    acl: Arc<dyn Acl + Send + Sync>,
    contract: ContractAddress,
}
impl Ledger {
    pub fn new(
        fhe: Arc<dyn Fhe + Send + Sync>,
        acl: Arc<dyn Acl + Send + Sync>,
        contract: ContractAddress,
    ) -> Self {
        Self { fhe, acl, contract }
    }
    /// Mints the starting balance of a newly registered account.
    pub async fn open(&self, user: &UserPubKey) -> Result<Handle, FheError> {
        let balance = self.fhe.trivial_encrypt(STARTING_POINTS).await?;
        trace!("Opened balance {} for {}", balance, user);
        Ok(balance)
    }
    /// Subtracts `amount` from `balance` and returns the superseding handle.
    ///
    /// Underflow wraps modulo 2^32 like every encrypted 32 bit integer. The
    /// market never debits more than `STARTING_POINTS` in total, so it is
    /// not reachable from the bet flow.
    pub async fn debit(
        &self,
        user: &UserPubKey,
        balance: &Handle,
        amount: &Handle,
    ) -> Result<Handle, FheError> {
        let balance = self.fhe.sub(balance, amount).await?;
        trace!("Debited {} from {}, new balance {}", amount, user, balance);
        Ok(balance)
    }
    /// Lets `user` and the market contract use `handle`.
    pub async fn allow_owner(&self, handle: &Handle, user: &UserPubKey) -> anyhow::Result<()> {
        grant_all(&*self.acl, handle, [(*user).into(), self.contract.into()]).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::acl::HostAcl;
    use crate::api::{Principal, BET_COST};
    use crate::fhe::TestFhe;
    use secp256k1::{generate_keypair, rand};

    #[tokio::test]
    async fn open_and_debit() {
        let fhe = Arc::new(TestFhe::default());
        let acl = Arc::new(HostAcl::default());
        let contract = ContractAddress::random();
        let ledger = Ledger::new(fhe.clone(), acl.clone(), contract);
        let (_, alice) = generate_keypair(&mut rand::thread_rng());
        let (_, bob) = generate_keypair(&mut rand::thread_rng());

        let opened = ledger.open(&alice).await.unwrap();
        assert_eq!(fhe.decrypt(&opened).await.unwrap(), STARTING_POINTS);
        assert!(!acl.is_authorized(&opened, &Principal::User(alice)).await);
        ledger.allow_owner(&opened, &alice).await.unwrap();
        assert!(acl.is_authorized(&opened, &Principal::User(alice)).await);
        assert!(acl.is_authorized(&opened, &Principal::Contract(contract)).await);
        assert!(!acl.is_authorized(&opened, &Principal::User(bob)).await);

        let cost = fhe.trivial_encrypt(BET_COST).await.unwrap();
        let debited = ledger.debit(&alice, &opened, &cost).await.unwrap();
        assert_ne!(debited, opened);
        assert_eq!(fhe.decrypt(&debited).await.unwrap(), STARTING_POINTS - BET_COST);
        assert!(!acl.is_authorized(&debited, &Principal::User(alice)).await);
        ledger.allow_owner(&debited, &alice).await.unwrap();
        assert!(acl.is_authorized(&debited, &Principal::User(alice)).await);
        assert!(!acl.is_authorized(&cost, &Principal::User(alice)).await);
    }
}
