use crate::api::{Handle, Principal};
use crate::db::DB;
use anyhow::Result;
use async_trait::async_trait;
use log::{debug, trace};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Append-only permission sets keyed by handle identity.
///
/// There is no revoke. Two handles encrypting the same plaintext have
/// independent ACLs.
#[async_trait]
pub trait Acl {
    async fn grant(&self, handle: &Handle, principal: Principal) -> Result<()>;
    async fn is_authorized(&self, handle: &Handle, principal: &Principal) -> bool;
}

/// Grants held in memory, written through to the database when one is
/// attached.
#[derive(Default)]
pub struct HostAcl {
    grants: RwLock<HashMap<Handle, HashSet<Principal>>>,
    db: Option<Arc<Box<dyn DB + Send + Sync>>>,
}
impl HostAcl {
    pub async fn persistent(db: Arc<Box<dyn DB + Send + Sync>>) -> Result<Self> {
        let mut grants: HashMap<Handle, HashSet<Principal>> = HashMap::new();
        for (handle, principal) in db.get_grants().await? {
            grants.entry(handle).or_default().insert(principal);
        }
        debug!("Loaded grants on {} handles", grants.len());
        Ok(Self {
            grants: RwLock::new(grants),
            db: Some(db),
        })
    }
}
#[async_trait]
impl Acl for HostAcl {
    async fn grant(&self, handle: &Handle, principal: Principal) -> Result<()> {
        let mut grants = self.grants.write().await;
        let principals = grants.entry(*handle).or_default();
        if principals.contains(&principal) {
            return Ok(());
        }
        if let Some(db) = &self.db {
            db.add_grant(handle, &principal).await?;
        }
        principals.insert(principal);
        trace!("Granted {} on {}", principal, handle);
        Ok(())
    }
    async fn is_authorized(&self, handle: &Handle, principal: &Principal) -> bool {
        self.grants
            .read()
            .await
            .get(handle)
            .map_or(false, |principals| principals.contains(principal))
    }
}

/// Grants every principal in `principals` on `handle`.
pub async fn grant_all(
    acl: &(dyn Acl + Send + Sync),
    handle: &Handle,
    principals: impl IntoIterator<Item = Principal>,
) -> Result<()> {
    for principal in principals {
        acl.grant(handle, principal).await?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::ContractAddress;
    use crate::db::SQLite;
    use secp256k1::{generate_keypair, rand};

    #[tokio::test]
    async fn grants_are_per_handle_and_idempotent() {
        let acl = HostAcl::default();
        let (_, alice) = generate_keypair(&mut rand::thread_rng());
        let (_, bob) = generate_keypair(&mut rand::thread_rng());
        let contract = ContractAddress::random();
        let balance = Handle::from_bytes([1; 32]);
        let same_value = Handle::from_bytes([2; 32]);

        assert!(!acl.is_authorized(&balance, &alice.into()).await);
        grant_all(&acl, &balance, [alice.into(), contract.into()])
            .await
            .unwrap();
        acl.grant(&balance, alice.into()).await.unwrap();

        assert!(acl.is_authorized(&balance, &alice.into()).await);
        assert!(acl.is_authorized(&balance, &contract.into()).await);
        assert!(!acl.is_authorized(&balance, &bob.into()).await);
        assert!(!acl.is_authorized(&same_value, &alice.into()).await);
        assert_eq!(acl.grants.read().await[&balance].len(), 2);
    }

    #[tokio::test]
    async fn grants_survive_reload() {
        let db: Arc<Box<dyn DB + Send + Sync>> =
            Arc::new(Box::new(SQLite::new(None).await.unwrap()));
        let (_, alice) = generate_keypair(&mut rand::thread_rng());
        let contract = ContractAddress::random();
        let balance = Handle::from_bytes([1; 32]);

        let acl = HostAcl::persistent(db.clone()).await.unwrap();
        grant_all(&acl, &balance, [alice.into(), contract.into()])
            .await
            .unwrap();
        acl.grant(&balance, alice.into()).await.unwrap();
        assert_eq!(db.get_grants().await.unwrap().len(), 2);

        let reloaded = HostAcl::persistent(db).await.unwrap();
        assert!(reloaded.is_authorized(&balance, &alice.into()).await);
        assert!(reloaded.is_authorized(&balance, &contract.into()).await);
        assert!(!reloaded.is_authorized(&Handle::ZERO, &alice.into()).await);
    }
}
