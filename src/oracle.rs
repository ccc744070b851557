use crate::acl::Acl;
use crate::api::{UserDecryptRequest, UserDecryptResponse};
use crate::decrypt::{seal, DecryptError, DecryptPermit, DecryptionOracle};
use crate::fhe::Fhe;
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, warn};
use std::sync::Arc;

/// Decryption oracle over the host's ciphertexts and ACL.
///
/// Stateless: every request carries its own permit and ephemeral key.
pub struct Oracle {
    fhe: Arc<dyn Fhe + Send + Sync>,
    acl: Arc<dyn Acl + Send + Sync>,
}
impl Oracle {
    pub fn new(fhe: Arc<dyn Fhe + Send + Sync>, acl: Arc<dyn Acl + Send + Sync>) -> Self {
        Self { fhe, acl }
    }
    async fn authorize(&self, request: &UserDecryptRequest) -> Result<(), DecryptError> {
        let permit = DecryptPermit::from_request(request);
        permit.check_window(Utc::now())?;
        permit.verify(&request.signature, &request.user)?;
        if !permit.covers(&request.contract)
            || !self
                .acl
                .is_authorized(&request.handle, &request.user.into())
                .await
            || !self
                .acl
                .is_authorized(&request.handle, &request.contract.into())
                .await
        {
            return Err(DecryptError::AclDenied);
        }
        Ok(())
    }
}
#[async_trait]
impl DecryptionOracle for Oracle {
    async fn user_decrypt(
        &self,
        request: &UserDecryptRequest,
    ) -> Result<UserDecryptResponse, DecryptError> {
        if let Err(err) = self.authorize(request).await {
            warn!(
                "Denied decryption of {} for {} on {}: {}",
                request.handle, request.user, request.contract, err
            );
            return Err(err);
        }
        let value = self.fhe.decrypt(&request.handle).await.map_err(|err| {
            error!("Couldn't decrypt {}: {}", request.handle, err);
            DecryptError::OracleUnavailable
        })?;
        let (oracle_key, ciphertext) = seal(value, &request.public_key);
        debug!("Re-encrypted {} for {}", request.handle, request.user);
        Ok(UserDecryptResponse {
            handle: request.handle,
            oracle_key,
            ciphertext,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::acl::{grant_all, HostAcl};
    use crate::api::{ContractAddress, Handle};
    use crate::decrypt::{user_decrypt, EphemeralKeypair, RetryPolicy};
    use crate::fhe::TestFhe;
    use secp256k1::{generate_keypair, rand, SecretKey};

    struct Setup {
        oracle: Oracle,
        contract: ContractAddress,
        balance: Handle,
        alice: SecretKey,
        bob: SecretKey,
    }
    async fn setup() -> Setup {
        let fhe = Arc::new(TestFhe::default());
        let acl = Arc::new(HostAcl::default());
        let contract = ContractAddress::random();
        let (alice, alice_pub) = generate_keypair(&mut rand::thread_rng());
        let (bob, _) = generate_keypair(&mut rand::thread_rng());
        let balance = fhe.trivial_encrypt(90).await.unwrap();
        grant_all(&*acl, &balance, [alice_pub.into(), contract.into()])
            .await
            .unwrap();
        Setup {
            oracle: Oracle::new(fhe, acl),
            contract,
            balance,
            alice,
            bob,
        }
    }

    #[tokio::test]
    async fn owner_decrypts_others_denied() {
        let s = setup().await;
        let retry = RetryPolicy::default();
        assert_eq!(
            user_decrypt(&s.oracle, &s.balance, &s.contract, &s.alice, &retry).await,
            Ok(90)
        );
        assert_eq!(
            user_decrypt(&s.oracle, &s.balance, &s.contract, &s.bob, &retry).await,
            Err(DecryptError::AclDenied)
        );
        // The handle is only listed for its own contract.
        assert_eq!(
            user_decrypt(
                &s.oracle,
                &s.balance,
                &ContractAddress::random(),
                &s.alice,
                &retry
            )
            .await,
            Err(DecryptError::AclDenied)
        );
    }

    #[tokio::test]
    async fn contract_outside_signed_scope() {
        let s = setup().await;
        let keypair = EphemeralKeypair::generate();
        let permit = DecryptPermit::new(keypair.public, vec![ContractAddress::random()], Utc::now());
        let request = permit.request(s.balance, s.contract, &s.alice);
        assert_eq!(
            s.oracle.user_decrypt(&request).await,
            Err(DecryptError::AclDenied)
        );
    }

    #[tokio::test]
    async fn expired_window() {
        let s = setup().await;
        let keypair = EphemeralKeypair::generate();
        let permit = DecryptPermit::new(
            keypair.public,
            vec![s.contract],
            Utc::now() - chrono::Duration::days(8),
        );
        let request = permit.request(s.balance, s.contract, &s.alice);
        assert_eq!(
            s.oracle.user_decrypt(&request).await,
            Err(DecryptError::ExpiredWindow)
        );
    }

    #[tokio::test]
    async fn forged_signature() {
        let s = setup().await;
        let keypair = EphemeralKeypair::generate();
        let permit = DecryptPermit::new(keypair.public, vec![s.contract], Utc::now());
        let mut request = permit.request(s.balance, s.contract, &s.alice);
        // Bob signs but claims to be Alice.
        request.signature = permit.sign(&s.bob);
        assert_eq!(
            s.oracle.user_decrypt(&request).await,
            Err(DecryptError::BadSignature)
        );

        // Alice's signature doesn't carry over to a different ephemeral key.
        let mut request = permit.request(s.balance, s.contract, &s.alice);
        request.public_key = EphemeralKeypair::generate().public;
        assert_eq!(
            s.oracle.user_decrypt(&request).await,
            Err(DecryptError::BadSignature)
        );
    }

    #[tokio::test]
    async fn response_only_opens_with_ephemeral_key() {
        let s = setup().await;
        let keypair = EphemeralKeypair::generate();
        let permit = DecryptPermit::new(keypair.public, vec![s.contract], Utc::now());
        let request = permit.request(s.balance, s.contract, &s.alice);
        let response = s.oracle.user_decrypt(&request).await.unwrap();
        assert_eq!(response.handle, s.balance);
        assert_ne!(response.ciphertext, 90u32.to_be_bytes().to_vec());
        assert_eq!(keypair.open(&response), Ok(90));
    }
}
