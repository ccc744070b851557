use anyhow::{bail, Result};
use async_trait::async_trait;
use log::warn;
use reqwest::{Response, StatusCode};
use secp256k1::hashes::sha256::Hash;
use secp256k1::{Message, SecretKey};
use serde::Serialize;

use crate::api::*;
use crate::decrypt::{DecryptError, DecryptionOracle};

pub struct Client {
    url: String,
    client: reqwest::Client,
}
impl Client {
    pub fn new(url: String) -> Self {
        let client = reqwest::Client::new();
        Self { url, client }
    }
    async fn post<T: Serialize + ?Sized>(&self, route: &str, body: &T) -> Result<Response> {
        Ok(self
            .client
            .post(self.url.clone() + route)
            .json(body)
            .send()
            .await?)
    }
    async fn get(&self, route: &str) -> Result<Response> {
        Ok(self.client.get(self.url.clone() + route).send().await?)
    }

    pub async fn get_login_challenge(&self, user: UserPubKey) -> Result<String> {
        let response = self.post("/get_login_challenge", &user).await?;
        Ok(bail_if_err(response, StatusCode::OK).await?.text().await?)
    }
    pub async fn try_login(&self, request: LoginRequest) -> Result<()> {
        let response = self.post("/try_login", &request).await?;
        bail_if_err(response, StatusCode::OK).await?;
        Ok(())
    }
    /// Runs the whole challenge flow and returns the access to attach to
    /// later requests.
    pub async fn login(&self, secret_key: &SecretKey) -> Result<AccessRequest> {
        let user = UserPubKey::from_secret_key_global(secret_key);
        let challenge = self.get_login_challenge(user).await?;
        let sig = secret_key.sign_ecdsa(Message::from_hashed_data::<Hash>(challenge.as_bytes()));
        self.try_login(LoginRequest {
            user,
            challenge: challenge.clone(),
            sig,
        })
        .await?;
        Ok(AccessRequest {
            user,
            challenge,
            sig,
        })
    }

    pub async fn register(&self, access: AccessRequest) -> Result<()> {
        let response = self.post("/register", &access).await?;
        bail_if_err(response, StatusCode::CREATED).await?;
        Ok(())
    }
    pub async fn create_prediction(
        &self,
        request: NewPredictionRequest,
        access: AccessRequest,
    ) -> Result<PredictionId> {
        let request = PostRequest {
            access,
            data: request,
        };
        let response = self.post("/create_prediction", &request).await?;
        Ok(bail_if_err(response, StatusCode::CREATED)
            .await?
            .json()
            .await?)
    }
    pub async fn place_bet(&self, request: PlaceBetRequest, access: AccessRequest) -> Result<()> {
        let request = PostRequest {
            access,
            data: request,
        };
        let response = self.post("/place_bet", &request).await?;
        bail_if_err(response, StatusCode::CREATED).await?;
        Ok(())
    }
    pub async fn encrypt_input(
        &self,
        request: EncryptInputRequest,
        access: AccessRequest,
    ) -> Result<EncryptedInput> {
        let request = PostRequest {
            access,
            data: request,
        };
        let response = self.post("/encrypt_input", &request).await?;
        Ok(bail_if_err(response, StatusCode::OK).await?.json().await?)
    }

    pub async fn is_registered(&self, user: UserPubKey) -> Result<bool> {
        let response = self.post("/is_registered", &user).await?;
        Ok(bail_if_err(response, StatusCode::OK).await?.json().await?)
    }
    pub async fn get_remaining_bets(&self, user: UserPubKey) -> Result<u32> {
        let response = self.post("/get_remaining_bets", &user).await?;
        Ok(bail_if_err(response, StatusCode::OK).await?.json().await?)
    }
    pub async fn get_encrypted_balance(&self, user: UserPubKey) -> Result<Handle> {
        let response = self.post("/get_encrypted_balance", &user).await?;
        Ok(bail_if_err(response, StatusCode::OK).await?.json().await?)
    }
    pub async fn get_prediction_count(&self) -> Result<u64> {
        let response = self.get("/get_prediction_count").await?;
        Ok(bail_if_err(response, StatusCode::OK).await?.json().await?)
    }
    pub async fn get_prediction(&self, prediction: PredictionId) -> Result<Prediction> {
        let response = self
            .post("/get_prediction", &PredictionRequest { prediction })
            .await?;
        Ok(bail_if_err(response, StatusCode::OK).await?.json().await?)
    }
    pub async fn get_predictions(&self) -> Result<Vec<Prediction>> {
        let response = self.get("/get_predictions").await?;
        Ok(bail_if_err(response, StatusCode::OK).await?.json().await?)
    }
    pub async fn has_user_bet(&self, request: UserBetRequest) -> Result<bool> {
        let response = self.post("/has_user_bet", &request).await?;
        Ok(bail_if_err(response, StatusCode::OK).await?.json().await?)
    }
    pub async fn get_user_encrypted_choice(&self, request: UserBetRequest) -> Result<Handle> {
        let response = self.post("/get_user_encrypted_choice", &request).await?;
        Ok(bail_if_err(response, StatusCode::OK).await?.json().await?)
    }
    pub async fn get_user_encrypted_bet_amount(&self, request: UserBetRequest) -> Result<Handle> {
        let response = self
            .post("/get_user_encrypted_bet_amount", &request)
            .await?;
        Ok(bail_if_err(response, StatusCode::OK).await?.json().await?)
    }
    pub async fn get_market_info(&self) -> Result<MarketInfo> {
        let response = self.get("/get_market_info").await?;
        Ok(bail_if_err(response, StatusCode::OK).await?.json().await?)
    }
}

#[async_trait]
impl DecryptionOracle for Client {
    async fn user_decrypt(
        &self,
        request: &UserDecryptRequest,
    ) -> Result<UserDecryptResponse, DecryptError> {
        let response = self.post("/user_decrypt", request).await.map_err(|e| {
            warn!("Couldn't reach decryption oracle: {}", e);
            DecryptError::OracleUnavailable
        })?;
        match response.status() {
            StatusCode::OK => response
                .json()
                .await
                .map_err(|_| DecryptError::OracleUnavailable),
            StatusCode::SERVICE_UNAVAILABLE => Err(DecryptError::OracleUnavailable),
            _ => match response.json::<DecryptDenied>().await {
                Ok(denied) => Err(denied.reason),
                Err(_) => Err(DecryptError::OracleUnavailable),
            },
        }
    }
}

async fn bail_if_err(response: Response, expected: StatusCode) -> Result<Response> {
    if response.status() != expected {
        bail!("{}: {}", response.status(), response.text().await?)
    }
    Ok(response)
}
