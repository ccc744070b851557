use crate::acl::Acl;
use crate::api::*;
use crate::db::DB;
use crate::fhe::{Fhe, FheError};
use crate::ledger::Ledger;
use anyhow::{anyhow, Context};
use axum::http::StatusCode;
use chrono::{Duration, Utc};
use log::{debug, trace};
use secp256k1::ecdsa::Signature;
use secp256k1::hashes::sha256::Hash;
use secp256k1::rand::distributions::Alphanumeric;
use secp256k1::rand::Rng;
use secp256k1::{rand, Message};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum MercadoError {
    #[error("Account is already registered")]
    AlreadyRegistered,
    #[error("Account is not registered")]
    NotRegistered,
    #[error("A prediction needs between 1 and {max} options, got {0}", max = MAX_OPTIONS)]
    InvalidOptionCount(usize),
    #[error("Prediction {0} doesn't exist")]
    OutOfRange(PredictionId),
    #[error("Account already bet on this prediction")]
    AlreadyBet,
    #[error("Account has no bets left")]
    NoRemainingBets,
    #[error("Input proof doesn't bind the choice to this account and contract")]
    InvalidProof,
    #[error("Access denied: {0}")]
    AccessDenied(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
impl MercadoError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            MercadoError::AlreadyRegistered | MercadoError::AlreadyBet => StatusCode::CONFLICT,
            MercadoError::OutOfRange(_) => StatusCode::NOT_FOUND,
            MercadoError::NotRegistered | MercadoError::NoRemainingBets => StatusCode::FORBIDDEN,
            MercadoError::InvalidOptionCount(_) | MercadoError::InvalidProof => {
                StatusCode::BAD_REQUEST
            }
            MercadoError::AccessDenied(_) => StatusCode::UNAUTHORIZED,
            MercadoError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
impl From<FheError> for MercadoError {
    fn from(err: FheError) -> Self {
        match err {
            FheError::InvalidProof(_) => MercadoError::InvalidProof,
            err => MercadoError::Internal(anyhow!(err)),
        }
    }
}
type Result<T> = std::result::Result<T, MercadoError>;

/// The confidential prediction market.
///
/// Mutations take `&mut self` and run one at a time behind the server's
/// lock. Every guard is checked before the first effect; the plaintext
/// effects of a bet are committed in a single transaction.
pub struct Mercado {
    db: Arc<Box<dyn DB + Send + Sync>>,
    fhe: Arc<dyn Fhe + Send + Sync>,
    ledger: Ledger,
    contract: ContractAddress,
    events: broadcast::Sender<MercadoEvent>,
}
impl Mercado {
    pub fn new(
        db: Arc<Box<dyn DB + Send + Sync>>,
        fhe: Arc<dyn Fhe + Send + Sync>,
        acl: Arc<dyn Acl + Send + Sync>,
        contract: ContractAddress,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            db,
            ledger: Ledger::new(fhe.clone(), acl, contract),
            fhe,
            contract,
            events,
        }
    }
    pub fn contract(&self) -> ContractAddress {
        self.contract
    }
    pub fn subscribe(&self) -> broadcast::Receiver<MercadoEvent> {
        self.events.subscribe()
    }
    fn publish(&self, event: MercadoEvent) {
        debug!("{}", event);
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    pub async fn register(&mut self, user: &UserPubKey) -> Result<()> {
        if self.db.get_account(user).await?.is_some() {
            debug!("User {} tried to register twice", user);
            return Err(MercadoError::AlreadyRegistered);
        }
        let balance = self.ledger.open(user).await?;
        self.db
            .create_account(&Account {
                user: *user,
                remaining_bets: MAX_REMAINING_BETS,
                balance,
            })
            .await?;
        self.ledger.allow_owner(&balance, user).await?;
        self.publish(MercadoEvent::UserRegistered { user: *user });
        Ok(())
    }
    pub async fn create_prediction(
        &mut self,
        creator: &UserPubKey,
        title: String,
        options: Vec<String>,
    ) -> Result<PredictionId> {
        if !self.is_registered(creator).await? {
            debug!("Unregistered user {} tried to create a prediction", creator);
            return Err(MercadoError::NotRegistered);
        }
        if options.is_empty() || options.len() > MAX_OPTIONS {
            debug!("Rejected prediction with {} options", options.len());
            return Err(MercadoError::InvalidOptionCount(options.len()));
        }
        let prediction = self
            .db
            .add_prediction(&title, &options, creator, Utc::now())
            .await?;
        self.publish(MercadoEvent::PredictionCreated {
            id: prediction.id,
            creator: *creator,
        });
        Ok(prediction.id)
    }
    /// Places the single bet of `user` on `prediction`.
    ///
    /// `choice` is an option index encrypted by the user together with its
    /// input proof. Indices past the last option are clamped to the last
    /// one, under encryption.
    pub async fn place_bet(
        &mut self,
        user: &UserPubKey,
        prediction: PredictionId,
        choice: &Handle,
        proof: &InputProof,
    ) -> Result<()> {
        let Some(target) = self.db.get_prediction(prediction).await? else {
            debug!("User {} bet on unknown prediction {}", user, prediction);
            return Err(MercadoError::OutOfRange(prediction));
        };
        let Some(account) = self.db.get_account(user).await? else {
            debug!("Unregistered user {} tried to bet", user);
            return Err(MercadoError::NotRegistered);
        };
        if account.remaining_bets == 0 {
            debug!("User {} has no bets left", user);
            return Err(MercadoError::NoRemainingBets);
        }
        if self.db.get_bet(prediction, user).await?.is_some() {
            debug!("User {} already bet on {}", user, prediction);
            return Err(MercadoError::AlreadyBet);
        }
        let choice = self
            .fhe
            .verify_input(choice, proof, user, &self.contract)
            .await?;

        let option_count =
            u32::try_from(target.options.len()).context("option count doesn't fit u32")?;
        let in_range = self.fhe.lt_scalar(&choice, option_count).await?;
        let last = self.fhe.trivial_encrypt(option_count.saturating_sub(1)).await?;
        let choice = self.fhe.select(&in_range, &choice, &last).await?;

        let amount = self.fhe.trivial_encrypt(BET_COST).await?;
        let balance = self.ledger.debit(user, &account.balance, &amount).await?;

        self.db
            .commit_bet(
                &Bet {
                    prediction,
                    user: *user,
                    choice,
                    amount,
                },
                &balance,
            )
            .await?;
        // Only handles that made it into the market get granted.
        for handle in [&balance, &choice, &amount] {
            self.ledger.allow_owner(handle, user).await?;
        }
        self.publish(MercadoEvent::BetPlaced {
            prediction,
            user: *user,
        });
        Ok(())
    }

    pub async fn is_registered(&self, user: &UserPubKey) -> Result<bool> {
        Ok(self.db.get_account(user).await?.is_some())
    }
    pub async fn get_remaining_bets(&self, user: &UserPubKey) -> Result<u32> {
        Ok(self
            .db
            .get_account(user)
            .await?
            .map_or(0, |account| account.remaining_bets))
    }
    pub async fn get_encrypted_balance(&self, user: &UserPubKey) -> Result<Handle> {
        Ok(self
            .db
            .get_account(user)
            .await?
            .map_or(Handle::ZERO, |account| account.balance))
    }
    pub async fn get_prediction_count(&self) -> Result<u64> {
        Ok(self.db.get_prediction_count().await?)
    }
    pub async fn get_prediction(&self, prediction: PredictionId) -> Result<Prediction> {
        self.db
            .get_prediction(prediction)
            .await?
            .ok_or(MercadoError::OutOfRange(prediction))
    }
    pub async fn get_predictions(&self) -> Result<Vec<Prediction>> {
        Ok(self.db.get_predictions().await?)
    }
    pub async fn has_user_bet(&self, prediction: PredictionId, user: &UserPubKey) -> Result<bool> {
        Ok(self.db.get_bet(prediction, user).await?.is_some())
    }
    pub async fn get_user_encrypted_choice(
        &self,
        prediction: PredictionId,
        user: &UserPubKey,
    ) -> Result<Handle> {
        Ok(self
            .db
            .get_bet(prediction, user)
            .await?
            .map_or(Handle::ZERO, |bet| bet.choice))
    }
    pub async fn get_user_encrypted_bet_amount(
        &self,
        prediction: PredictionId,
        user: &UserPubKey,
    ) -> Result<Handle> {
        Ok(self
            .db
            .get_bet(prediction, user)
            .await?
            .map_or(Handle::ZERO, |bet| bet.amount))
    }
    pub fn market_info(&self) -> MarketInfo {
        MarketInfo {
            contract: self.contract,
            starting_points: STARTING_POINTS,
            bet_cost: BET_COST,
            max_options: MAX_OPTIONS,
            max_remaining_bets: MAX_REMAINING_BETS,
        }
    }
    /// Encrypts `value` as an input of `user` for this market. Stands in for
    /// the client-side relayer.
    pub async fn encrypt_input(&self, user: &UserPubKey, value: u32) -> Result<EncryptedInput> {
        Ok(self.fhe.encrypt_input(value, user, &self.contract).await?)
    }

    pub async fn check_access(&self, access: &AccessRequest) -> Result<UserPubKey> {
        let Some((db_sig, last_access)) = self
            .db
            .get_last_access(&access.user, &access.challenge)
            .await?
        else {
            debug!("User {} has no session for this challenge", access.user);
            return Err(MercadoError::AccessDenied(format!(
                "no session for {}",
                access.user
            )));
        };
        if access.sig != db_sig {
            debug!(
                "User {} tried to access with invalid access token",
                access.user
            );
            return Err(MercadoError::AccessDenied(format!(
                "access token for user {} is invalid",
                access.user
            )));
        }
        if last_access < Utc::now() - Duration::days(7) {
            debug!(
                "User {} tried to access after more than 7 days",
                access.user
            );
            return Err(MercadoError::AccessDenied(
                "last login was more than 7 days ago".to_string(),
            ));
        }
        Ok(access.user)
    }
    pub async fn create_login_challenge(&mut self, user: &UserPubKey) -> Result<String> {
        let challenge: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(30)
            .map(char::from)
            .collect();
        trace!("Generated login challenge {}", challenge);
        self.db.create_session(user, &challenge).await?;
        Ok(challenge)
    }
    pub async fn try_login(
        &mut self,
        user: &UserPubKey,
        sig: &Signature,
        challenge: &str,
    ) -> Result<()> {
        sig.verify(
            &Message::from_hashed_data::<Hash>(challenge.as_bytes()),
            user,
        )
        .map_err(|_| MercadoError::AccessDenied(format!("bad login signature for {}", user)))?;
        self.db.update_access_token(user, sig, challenge).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::acl::HostAcl;
    use crate::db::SQLite;
    use crate::fhe::TestFhe;
    use async_trait::async_trait;
    use chrono::DateTime;
    use secp256k1::{generate_keypair, PublicKey, SecretKey};

    async fn new_market() -> (Mercado, Arc<TestFhe>, Arc<HostAcl>) {
        let fhe = Arc::new(TestFhe::default());
        let acl = Arc::new(HostAcl::default());
        let market = Mercado::new(
            Arc::new(Box::new(SQLite::new(None).await.unwrap())),
            fhe.clone(),
            acl.clone(),
            ContractAddress::random(),
        );
        (market, fhe, acl)
    }
    fn user() -> UserPubKey {
        generate_keypair(&mut rand::thread_rng()).1
    }
    fn weather() -> (String, Vec<String>) {
        (
            "Weather".to_string(),
            vec!["Sun".to_string(), "Rain".to_string()],
        )
    }
    async fn bet(
        market: &mut Mercado,
        user: &UserPubKey,
        prediction: PredictionId,
        choice: u32,
    ) -> Result<()> {
        let input = market.encrypt_input(user, choice).await?;
        market
            .place_bet(user, prediction, &input.handle, &input.proof)
            .await
    }

    #[tokio::test]
    async fn alice_bets_on_the_weather() {
        let (mut market, fhe, acl) = new_market().await;
        let alice = user();
        let mut events = market.subscribe();

        market.register(&alice).await.unwrap();
        assert!(market.is_registered(&alice).await.unwrap());
        assert_eq!(market.get_remaining_bets(&alice).await.unwrap(), 10);
        let balance = market.get_encrypted_balance(&alice).await.unwrap();
        assert_eq!(fhe.decrypt(&balance).await.unwrap(), 100);

        let (title, options) = weather();
        let id = market
            .create_prediction(&alice, title.clone(), options.clone())
            .await
            .unwrap();
        assert_eq!(id, 0);
        assert_eq!(market.get_prediction_count().await.unwrap(), 1);
        let prediction = market.get_prediction(0).await.unwrap();
        assert_eq!(prediction.title, title);
        assert_eq!(prediction.options, options);
        assert_eq!(prediction.creator, alice);
        assert_eq!(prediction.total_bets, 0);

        bet(&mut market, &alice, 0, 1).await.unwrap();
        assert!(market.has_user_bet(0, &alice).await.unwrap());
        assert_eq!(market.get_remaining_bets(&alice).await.unwrap(), 9);
        assert_eq!(market.get_prediction(0).await.unwrap().total_bets, 1);
        let balance = market.get_encrypted_balance(&alice).await.unwrap();
        assert_eq!(fhe.decrypt(&balance).await.unwrap(), 90);
        let choice = market.get_user_encrypted_choice(0, &alice).await.unwrap();
        assert_eq!(fhe.decrypt(&choice).await.unwrap(), 1);
        let amount = market.get_user_encrypted_bet_amount(0, &alice).await.unwrap();
        assert_eq!(fhe.decrypt(&amount).await.unwrap(), 10);

        for handle in [balance, choice, amount] {
            assert!(acl.is_authorized(&handle, &alice.into()).await);
            assert!(acl.is_authorized(&handle, &market.contract().into()).await);
        }

        assert_eq!(
            events.recv().await.unwrap(),
            MercadoEvent::UserRegistered { user: alice }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            MercadoEvent::PredictionCreated {
                id: 0,
                creator: alice
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            MercadoEvent::BetPlaced {
                prediction: 0,
                user: alice
            }
        );
    }

    #[tokio::test]
    async fn register_once() {
        let (mut market, _, _) = new_market().await;
        let alice = user();
        market.register(&alice).await.unwrap();
        let balance = market.get_encrypted_balance(&alice).await.unwrap();
        assert!(matches!(
            market.register(&alice).await,
            Err(MercadoError::AlreadyRegistered)
        ));
        assert_eq!(market.get_encrypted_balance(&alice).await.unwrap(), balance);
        assert_eq!(market.get_remaining_bets(&alice).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn unknown_reads_are_empty() {
        let (market, fhe, _) = new_market().await;
        let bob = user();
        assert!(!market.is_registered(&bob).await.unwrap());
        assert_eq!(market.get_remaining_bets(&bob).await.unwrap(), 0);
        let balance = market.get_encrypted_balance(&bob).await.unwrap();
        assert_eq!(balance, Handle::ZERO);
        assert_eq!(fhe.decrypt(&balance).await.unwrap(), 0);
        assert!(!market.has_user_bet(3, &bob).await.unwrap());
        assert_eq!(market.get_user_encrypted_choice(3, &bob).await.unwrap(), Handle::ZERO);
        assert_eq!(
            market.get_user_encrypted_bet_amount(3, &bob).await.unwrap(),
            Handle::ZERO
        );
        assert!(matches!(
            market.get_prediction(0).await,
            Err(MercadoError::OutOfRange(0))
        ));
    }

    #[tokio::test]
    async fn huge_prediction_ids_are_out_of_range() {
        let (mut market, _, _) = new_market().await;
        let alice = user();
        market.register(&alice).await.unwrap();
        let (title, options) = weather();
        market.create_prediction(&alice, title, options).await.unwrap();

        let huge = u64::MAX;
        assert!(matches!(
            market.get_prediction(huge).await,
            Err(MercadoError::OutOfRange(id)) if id == huge
        ));
        assert!(matches!(
            bet(&mut market, &alice, huge, 0).await,
            Err(MercadoError::OutOfRange(id)) if id == huge
        ));
        assert!(!market.has_user_bet(huge, &alice).await.unwrap());
        assert_eq!(
            market.get_user_encrypted_choice(huge, &alice).await.unwrap(),
            Handle::ZERO
        );
        assert_eq!(market.get_remaining_bets(&alice).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn prediction_option_bounds() {
        let (mut market, _, _) = new_market().await;
        let alice = user();
        assert!(matches!(
            market
                .create_prediction(&alice, "Weather".to_string(), vec!["Sun".to_string()])
                .await,
            Err(MercadoError::NotRegistered)
        ));
        market.register(&alice).await.unwrap();
        for count in [0, MAX_OPTIONS + 1] {
            let options = vec!["Maybe".to_string(); count];
            assert!(matches!(
                market
                    .create_prediction(&alice, "Weather".to_string(), options)
                    .await,
                Err(MercadoError::InvalidOptionCount(c)) if c == count
            ));
        }
        assert_eq!(market.get_prediction_count().await.unwrap(), 0);
        for count in 1..=MAX_OPTIONS {
            let options = vec!["Maybe".to_string(); count];
            let id = market
                .create_prediction(&alice, "Weather".to_string(), options)
                .await
                .unwrap();
            assert_eq!(id, count as u64 - 1);
        }
        assert_eq!(market.get_prediction_count().await.unwrap(), MAX_OPTIONS as u64);
        assert_eq!(market.get_predictions().await.unwrap().len(), MAX_OPTIONS);
    }

    #[tokio::test]
    async fn bet_guards() {
        let (mut market, fhe, _) = new_market().await;
        let alice = user();
        let bob = user();
        market.register(&alice).await.unwrap();
        let (title, options) = weather();
        market.create_prediction(&alice, title, options).await.unwrap();

        // Range is checked before registration.
        let input = market.encrypt_input(&bob, 0).await.unwrap();
        assert!(matches!(
            market.place_bet(&bob, 5, &input.handle, &input.proof).await,
            Err(MercadoError::OutOfRange(5))
        ));
        assert!(matches!(
            market.place_bet(&bob, 0, &input.handle, &input.proof).await,
            Err(MercadoError::NotRegistered)
        ));

        // Bob's input can't be replayed by Alice.
        assert!(matches!(
            market.place_bet(&alice, 0, &input.handle, &input.proof).await,
            Err(MercadoError::InvalidProof)
        ));
        assert!(!market.has_user_bet(0, &alice).await.unwrap());
        assert_eq!(market.get_remaining_bets(&alice).await.unwrap(), 10);

        bet(&mut market, &alice, 0, 0).await.unwrap();
        let balance = market.get_encrypted_balance(&alice).await.unwrap();
        assert!(matches!(
            bet(&mut market, &alice, 0, 1).await,
            Err(MercadoError::AlreadyBet)
        ));
        assert_eq!(market.get_remaining_bets(&alice).await.unwrap(), 9);
        assert_eq!(market.get_prediction(0).await.unwrap().total_bets, 1);
        assert_eq!(market.get_encrypted_balance(&alice).await.unwrap(), balance);
        let choice = market.get_user_encrypted_choice(0, &alice).await.unwrap();
        assert_eq!(fhe.decrypt(&choice).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn bets_run_out() {
        let (mut market, fhe, _) = new_market().await;
        let alice = user();
        market.register(&alice).await.unwrap();
        for _ in 0..=MAX_REMAINING_BETS {
            market
                .create_prediction(&alice, "Coin".to_string(), vec!["Heads".to_string()])
                .await
                .unwrap();
        }
        for prediction in 0..u64::from(MAX_REMAINING_BETS) {
            bet(&mut market, &alice, prediction, 0).await.unwrap();
        }
        assert_eq!(market.get_remaining_bets(&alice).await.unwrap(), 0);
        let balance = market.get_encrypted_balance(&alice).await.unwrap();
        assert_eq!(fhe.decrypt(&balance).await.unwrap(), 0);

        let last = u64::from(MAX_REMAINING_BETS);
        assert!(matches!(
            bet(&mut market, &alice, last, 0).await,
            Err(MercadoError::NoRemainingBets)
        ));
        assert!(!market.has_user_bet(last, &alice).await.unwrap());
        assert_eq!(market.get_prediction(last).await.unwrap().total_bets, 0);
    }

    #[tokio::test]
    async fn out_of_range_choice_is_clamped() {
        let (mut market, fhe, _) = new_market().await;
        let alice = user();
        market.register(&alice).await.unwrap();
        let (title, options) = weather();
        market.create_prediction(&alice, title, options).await.unwrap();

        bet(&mut market, &alice, 0, 7).await.unwrap();
        let choice = market.get_user_encrypted_choice(0, &alice).await.unwrap();
        assert_eq!(fhe.decrypt(&choice).await.unwrap(), 1);
        let balance = market.get_encrypted_balance(&alice).await.unwrap();
        assert_eq!(fhe.decrypt(&balance).await.unwrap(), 90);
    }

    #[tokio::test]
    async fn login() {
        let (mut market, _, _) = new_market().await;
        let (secret, alice): (SecretKey, PublicKey) = generate_keypair(&mut rand::thread_rng());
        let challenge = market.create_login_challenge(&alice).await.unwrap();
        assert_eq!(challenge.len(), 30);
        let sig = secret.sign_ecdsa(Message::from_hashed_data::<Hash>(challenge.as_bytes()));
        let access = AccessRequest {
            user: alice,
            challenge: challenge.clone(),
            sig,
        };
        assert!(matches!(
            market.check_access(&access).await,
            Err(MercadoError::AccessDenied(_))
        ));

        let (other, _) = generate_keypair(&mut rand::thread_rng());
        let forged = other.sign_ecdsa(Message::from_hashed_data::<Hash>(challenge.as_bytes()));
        assert!(matches!(
            market.try_login(&alice, &forged, &challenge).await,
            Err(MercadoError::AccessDenied(_))
        ));

        market.try_login(&alice, &sig, &challenge).await.unwrap();
        assert_eq!(market.check_access(&access).await.unwrap(), alice);
        let replay = AccessRequest {
            sig: forged,
            ..access
        };
        assert!(matches!(
            market.check_access(&replay).await,
            Err(MercadoError::AccessDenied(_))
        ));
    }

    /// Delegates to SQLite but fails every bet commit and session lookup.
    struct Unreliable(Arc<Box<dyn DB + Send + Sync>>);
    #[async_trait]
    impl DB for Unreliable {
        async fn create_account(&self, account: &Account) -> anyhow::Result<()> {
            self.0.create_account(account).await
        }
        async fn get_account(&self, user: &UserPubKey) -> anyhow::Result<Option<Account>> {
            self.0.get_account(user).await
        }
        async fn add_prediction(
            &self,
            title: &str,
            options: &[String],
            creator: &UserPubKey,
            created_at: DateTime<Utc>,
        ) -> anyhow::Result<Prediction> {
            self.0.add_prediction(title, options, creator, created_at).await
        }
        async fn get_prediction_count(&self) -> anyhow::Result<u64> {
            self.0.get_prediction_count().await
        }
        async fn get_prediction(&self, id: PredictionId) -> anyhow::Result<Option<Prediction>> {
            self.0.get_prediction(id).await
        }
        async fn get_predictions(&self) -> anyhow::Result<Vec<Prediction>> {
            self.0.get_predictions().await
        }
        async fn get_bet(
            &self,
            prediction: PredictionId,
            user: &UserPubKey,
        ) -> anyhow::Result<Option<Bet>> {
            self.0.get_bet(prediction, user).await
        }
        async fn commit_bet(&self, _: &Bet, _: &Handle) -> anyhow::Result<()> {
            Err(anyhow!("disk full"))
        }
        async fn create_session(&self, user: &UserPubKey, challenge: &str) -> anyhow::Result<()> {
            self.0.create_session(user, challenge).await
        }
        async fn update_access_token(
            &self,
            user: &UserPubKey,
            sig: &Signature,
            challenge: &str,
        ) -> anyhow::Result<()> {
            self.0.update_access_token(user, sig, challenge).await
        }
        async fn get_last_access(
            &self,
            _: &UserPubKey,
            _: &str,
        ) -> anyhow::Result<Option<(Signature, DateTime<Utc>)>> {
            Err(anyhow!("database is locked"))
        }
        async fn get_contract(&self) -> anyhow::Result<Option<ContractAddress>> {
            self.0.get_contract().await
        }
        async fn set_contract(&self, contract: &ContractAddress) -> anyhow::Result<()> {
            self.0.set_contract(contract).await
        }
        async fn store_ciphertext(
            &self,
            handle: &Handle,
            ciphertext: &crate::fhe::Ciphertext,
        ) -> anyhow::Result<()> {
            self.0.store_ciphertext(handle, ciphertext).await
        }
        async fn get_ciphertexts(&self) -> anyhow::Result<Vec<(Handle, crate::fhe::Ciphertext)>> {
            self.0.get_ciphertexts().await
        }
        async fn add_grant(&self, handle: &Handle, principal: &Principal) -> anyhow::Result<()> {
            self.0.add_grant(handle, principal).await
        }
        async fn get_grants(&self) -> anyhow::Result<Vec<(Handle, Principal)>> {
            self.0.get_grants().await
        }
    }

    #[tokio::test]
    async fn failed_commit_grants_nothing() {
        let db: Arc<Box<dyn DB + Send + Sync>> =
            Arc::new(Box::new(SQLite::new(None).await.unwrap()));
        let acl = Arc::new(HostAcl::persistent(db.clone()).await.unwrap());
        let mut market = Mercado::new(
            Arc::new(Box::new(Unreliable(db.clone()))),
            Arc::new(TestFhe::default()),
            acl,
            ContractAddress::random(),
        );
        let alice = user();
        market.register(&alice).await.unwrap();
        let balance = market.get_encrypted_balance(&alice).await.unwrap();
        let (title, options) = weather();
        market.create_prediction(&alice, title, options).await.unwrap();
        assert_eq!(db.get_grants().await.unwrap().len(), 2);

        assert!(matches!(
            bet(&mut market, &alice, 0, 1).await,
            Err(MercadoError::Internal(_))
        ));
        assert_eq!(db.get_grants().await.unwrap().len(), 2);
        assert_eq!(market.get_encrypted_balance(&alice).await.unwrap(), balance);
        assert!(!market.has_user_bet(0, &alice).await.unwrap());
    }

    #[tokio::test]
    async fn session_lookup_failures_are_internal() {
        let db: Arc<Box<dyn DB + Send + Sync>> =
            Arc::new(Box::new(SQLite::new(None).await.unwrap()));
        let mut market = Mercado::new(
            Arc::new(Box::new(Unreliable(db))),
            Arc::new(TestFhe::default()),
            Arc::new(HostAcl::default()),
            ContractAddress::random(),
        );
        let (secret, alice): (SecretKey, PublicKey) = generate_keypair(&mut rand::thread_rng());
        let challenge = market.create_login_challenge(&alice).await.unwrap();
        let sig = secret.sign_ecdsa(Message::from_hashed_data::<Hash>(challenge.as_bytes()));
        market.try_login(&alice, &sig, &challenge).await.unwrap();
        let access = AccessRequest {
            user: alice,
            challenge,
            sig,
        };
        let err = market.check_access(&access).await.unwrap_err();
        assert!(matches!(err, MercadoError::Internal(_)), "{}", err);
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
