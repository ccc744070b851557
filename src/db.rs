use crate::api::*;
use crate::fhe::Ciphertext;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use secp256k1::ecdsa::Signature;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{query, Executor, Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;

pub const DB_CONN: &str = "sqlite::memory:";

#[async_trait]
pub trait DB {
    async fn create_account(&self, account: &Account) -> Result<()>;
    async fn get_account(&self, user: &UserPubKey) -> Result<Option<Account>>;
    async fn add_prediction(
        &self,
        title: &str,
        options: &[String],
        creator: &UserPubKey,
        created_at: DateTime<Utc>,
    ) -> Result<Prediction>;
    async fn get_prediction_count(&self) -> Result<u64>;
    async fn get_prediction(&self, prediction: PredictionId) -> Result<Option<Prediction>>;
    async fn get_predictions(&self) -> Result<Vec<Prediction>>;
    async fn get_bet(&self, prediction: PredictionId, user: &UserPubKey) -> Result<Option<Bet>>;
    /// Stores `bet`, moves the bettor to `balance`, spends one remaining bet
    /// and counts the bet on its prediction. All or nothing.
    async fn commit_bet(&self, bet: &Bet, balance: &Handle) -> Result<()>;

    async fn create_session(&self, user: &UserPubKey, challenge: &str) -> Result<()>;
    async fn update_access_token(
        &self,
        user: &UserPubKey,
        sig: &Signature,
        challenge: &str,
    ) -> Result<()>;
    /// `None` when the user never completed a login for `challenge`.
    async fn get_last_access(
        &self,
        user: &UserPubKey,
        challenge: &str,
    ) -> Result<Option<(Signature, DateTime<Utc>)>>;

    /// The contract address the stored handles were granted to.
    async fn get_contract(&self) -> Result<Option<ContractAddress>>;
    async fn set_contract(&self, contract: &ContractAddress) -> Result<()>;
    async fn store_ciphertext(&self, handle: &Handle, ciphertext: &Ciphertext) -> Result<()>;
    async fn get_ciphertexts(&self) -> Result<Vec<(Handle, Ciphertext)>>;
    async fn add_grant(&self, handle: &Handle, principal: &Principal) -> Result<()>;
    async fn get_grants(&self) -> Result<Vec<(Handle, Principal)>>;
}
pub struct SQLite {
    connection: SqlitePool,
}
impl SQLite {
    pub async fn new(db_conn: Option<String>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_conn.as_deref().unwrap_or(DB_CONN))?
            .create_if_missing(true);
        // A single long lived connection keeps in-memory databases alive.
        let connection = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await
            .context("couldn't open database")?;
        connection
            .execute(
                "CREATE TABLE IF NOT EXISTS accounts (\
                pubkey TEXT NOT NULL,\
                remaining_bets INTEGER NOT NULL,\
                balance TEXT NOT NULL,\
                PRIMARY KEY (pubkey)\
                )",
            )
            .await?;
        connection
            .execute(
                "CREATE TABLE IF NOT EXISTS predictions (\
                id INTEGER NOT NULL,\
                title TEXT NOT NULL,\
                options TEXT NOT NULL,\
                creator TEXT NOT NULL,\
                created_at INTEGER NOT NULL,\
                total_bets INTEGER NOT NULL DEFAULT 0,\
                PRIMARY KEY (id)\
                )",
            )
            .await?;
        connection
            .execute(
                "CREATE TABLE IF NOT EXISTS bets (\
                prediction INTEGER NOT NULL,\
                user TEXT NOT NULL,\
                choice TEXT NOT NULL,\
                amount TEXT NOT NULL,\
                PRIMARY KEY (prediction, user)\
                )",
            )
            .await?;
        connection
            .execute(
                "CREATE TABLE IF NOT EXISTS sessions (\
                pubkey TEXT NOT NULL,\
                challenge TEXT NOT NULL,\
                access_token TEXT,\
                last_access INTEGER,\
                PRIMARY KEY (pubkey, challenge)\
                )",
            )
            .await?;
        connection
            .execute(
                "CREATE TABLE IF NOT EXISTS market (\
                id INTEGER NOT NULL CHECK (id = 0),\
                contract TEXT NOT NULL,\
                PRIMARY KEY (id)\
                )",
            )
            .await?;
        connection
            .execute(
                "CREATE TABLE IF NOT EXISTS ciphertexts (\
                handle TEXT NOT NULL,\
                kind TEXT NOT NULL,\
                value INTEGER NOT NULL,\
                input BOOLEAN NOT NULL,\
                PRIMARY KEY (handle)\
                )",
            )
            .await?;
        connection
            .execute(
                "CREATE TABLE IF NOT EXISTS acl (\
                handle TEXT NOT NULL,\
                principal TEXT NOT NULL,\
                PRIMARY KEY (handle, principal)\
                )",
            )
            .await?;
        Ok(Self { connection })
    }
    fn row_to_prediction(row: SqliteRow) -> Result<Prediction> {
        let id: i64 = row.get("id");
        let options: String = row.get("options");
        let creator: String = row.get("creator");
        let total_bets: i64 = row.get("total_bets");
        Ok(Prediction {
            id: u64::try_from(id)?,
            title: row.get("title"),
            options: serde_json::from_str(&options)
                .with_context(|| format!("couldn't parse options of prediction {}", id))?,
            creator: UserPubKey::from_str(&creator)?,
            created_at: timestamp(row.get("created_at"))?,
            total_bets: u64::try_from(total_bets)?,
        })
    }
}
fn timestamp(seconds: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .with_context(|| format!("{} is not a valid timestamp", seconds))
}
#[async_trait]
impl DB for SQLite {
    async fn create_account(&self, account: &Account) -> Result<()> {
        self.connection
            .execute(
                query(
                    "INSERT INTO accounts (\
                pubkey,\
                remaining_bets,\
                balance)\
                VALUES (?,?,?)",
                )
                .bind(account.user.to_string())
                .bind(i64::from(account.remaining_bets))
                .bind(account.balance.to_string()),
            )
            .await
            .with_context(|| format!("couldn't create account for {}", account.user))?;
        Ok(())
    }
    async fn get_account(&self, user: &UserPubKey) -> Result<Option<Account>> {
        let row = self
            .connection
            .fetch_optional(
                query("SELECT remaining_bets, balance FROM accounts WHERE pubkey = ?")
                    .bind(user.to_string()),
            )
            .await
            .with_context(|| format!("couldn't get account {}", user))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let remaining_bets: i64 = row.get("remaining_bets");
        let balance: String = row.get("balance");
        Ok(Some(Account {
            user: *user,
            remaining_bets: u32::try_from(remaining_bets)?,
            balance: balance.parse()?,
        }))
    }
    async fn add_prediction(
        &self,
        title: &str,
        options: &[String],
        creator: &UserPubKey,
        created_at: DateTime<Utc>,
    ) -> Result<Prediction> {
        let mut tx = self.connection.begin().await?;
        let id: i64 = query("SELECT COUNT(*) FROM predictions")
            .fetch_one(&mut *tx)
            .await?
            .get(0);
        query(
            "INSERT INTO predictions (\
            id,\
            title,\
            options,\
            creator,\
            created_at,\
            total_bets)\
            VALUES (?,?,?,?,?,0)",
        )
        .bind(id)
        .bind(title)
        .bind(serde_json::to_string(options)?)
        .bind(creator.to_string())
        .bind(created_at.timestamp())
        .execute(&mut *tx)
        .await
        .context("couldn't insert prediction")?;
        tx.commit().await?;
        Ok(Prediction {
            id: u64::try_from(id)?,
            title: title.to_string(),
            options: options.to_vec(),
            creator: *creator,
            created_at: timestamp(created_at.timestamp())?,
            total_bets: 0,
        })
    }
    async fn get_prediction_count(&self) -> Result<u64> {
        let count: i64 = self
            .connection
            .fetch_one(query("SELECT COUNT(*) FROM predictions"))
            .await?
            .get(0);
        Ok(u64::try_from(count)?)
    }
    async fn get_prediction(&self, prediction: PredictionId) -> Result<Option<Prediction>> {
        // Ids are assigned from 0 upwards, nothing past i64::MAX is stored.
        let Ok(id) = i64::try_from(prediction) else {
            return Ok(None);
        };
        self.connection
            .fetch_optional(query("SELECT * FROM predictions WHERE id = ?").bind(id))
            .await
            .with_context(|| format!("couldn't get prediction {}", prediction))?
            .map(Self::row_to_prediction)
            .transpose()
    }
    async fn get_predictions(&self) -> Result<Vec<Prediction>> {
        self.connection
            .fetch_all(query("SELECT * FROM predictions ORDER BY id"))
            .await?
            .into_iter()
            .map(Self::row_to_prediction)
            .collect()
    }
    async fn get_bet(&self, prediction: PredictionId, user: &UserPubKey) -> Result<Option<Bet>> {
        let Ok(id) = i64::try_from(prediction) else {
            return Ok(None);
        };
        let row = self
            .connection
            .fetch_optional(
                query("SELECT choice, amount FROM bets WHERE prediction = ? AND user = ?")
                    .bind(id)
                    .bind(user.to_string()),
            )
            .await
            .with_context(|| format!("couldn't get bet of {} on {}", user, prediction))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let choice: String = row.get("choice");
        let amount: String = row.get("amount");
        Ok(Some(Bet {
            prediction,
            user: *user,
            choice: choice.parse()?,
            amount: amount.parse()?,
        }))
    }
    async fn commit_bet(&self, bet: &Bet, balance: &Handle) -> Result<()> {
        let prediction = i64::try_from(bet.prediction)?;
        // Dropping the transaction on any early return rolls it back.
        let mut tx = self.connection.begin().await?;
        let debited = query(
            "UPDATE accounts \
            SET balance = ?, remaining_bets = remaining_bets - 1 \
            WHERE pubkey = ? AND remaining_bets > 0",
        )
        .bind(balance.to_string())
        .bind(bet.user.to_string())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if debited != 1 {
            bail!("Account {} has no bets left to spend", bet.user);
        }
        query(
            "INSERT INTO bets (\
            prediction,\
            user,\
            choice,\
            amount)\
            VALUES (?,?,?,?)",
        )
        .bind(prediction)
        .bind(bet.user.to_string())
        .bind(bet.choice.to_string())
        .bind(bet.amount.to_string())
        .execute(&mut *tx)
        .await
        .with_context(|| format!("couldn't store bet of {} on {}", bet.user, bet.prediction))?;
        let counted = query("UPDATE predictions SET total_bets = total_bets + 1 WHERE id = ?")
            .bind(prediction)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if counted != 1 {
            bail!("Prediction {} doesn't exist", bet.prediction);
        }
        tx.commit().await?;
        Ok(())
    }

    async fn create_session(&self, user: &UserPubKey, challenge: &str) -> Result<()> {
        self.connection
            .execute(
                query("INSERT INTO sessions (pubkey, challenge) VALUES (?,?)")
                    .bind(user.to_string())
                    .bind(challenge),
            )
            .await?;
        Ok(())
    }
    async fn update_access_token(
        &self,
        user: &UserPubKey,
        sig: &Signature,
        challenge: &str,
    ) -> Result<()> {
        let updated = self
            .connection
            .execute(
                query(
                    "UPDATE sessions SET access_token = ?, last_access = ? \
                    WHERE pubkey = ? AND challenge = ?",
                )
                .bind(sig.to_string())
                .bind(Utc::now().timestamp())
                .bind(user.to_string())
                .bind(challenge),
            )
            .await?
            .rows_affected();
        if updated != 1 {
            bail!("No login challenge \"{}\" for user {}", challenge, user);
        }
        Ok(())
    }
    async fn get_last_access(
        &self,
        user: &UserPubKey,
        challenge: &str,
    ) -> Result<Option<(Signature, DateTime<Utc>)>> {
        let row = self
            .connection
            .fetch_optional(
                query(
                    "SELECT access_token, last_access FROM sessions \
                    WHERE pubkey = ? AND challenge = ? AND access_token IS NOT NULL",
                )
                .bind(user.to_string())
                .bind(challenge),
            )
            .await
            .with_context(|| format!("couldn't get session of {}", user))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let sig: String = row.get("access_token");
        Ok(Some((
            Signature::from_str(&sig)?,
            timestamp(row.get("last_access"))?,
        )))
    }

    async fn get_contract(&self) -> Result<Option<ContractAddress>> {
        let row = self
            .connection
            .fetch_optional(query("SELECT contract FROM market WHERE id = 0"))
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let contract: String = row.get("contract");
        Ok(Some(contract.parse()?))
    }
    async fn set_contract(&self, contract: &ContractAddress) -> Result<()> {
        self.connection
            .execute(
                query("INSERT INTO market (id, contract) VALUES (0, ?)")
                    .bind(contract.to_string()),
            )
            .await
            .context("couldn't store market contract")?;
        Ok(())
    }
    async fn store_ciphertext(&self, handle: &Handle, ciphertext: &Ciphertext) -> Result<()> {
        self.connection
            .execute(
                query(
                    "INSERT INTO ciphertexts (\
                handle,\
                kind,\
                value,\
                input)\
                VALUES (?,?,?,?)",
                )
                .bind(handle.to_string())
                .bind(serde_json::to_string(&ciphertext.kind)?)
                .bind(i64::from(ciphertext.value))
                .bind(ciphertext.input),
            )
            .await
            .with_context(|| format!("couldn't store ciphertext {}", handle))?;
        Ok(())
    }
    async fn get_ciphertexts(&self) -> Result<Vec<(Handle, Ciphertext)>> {
        self.connection
            .fetch_all(query("SELECT * FROM ciphertexts"))
            .await?
            .into_iter()
            .map(|row| -> Result<(Handle, Ciphertext)> {
                let handle: String = row.get("handle");
                let kind: String = row.get("kind");
                let value: i64 = row.get("value");
                Ok((
                    handle.parse()?,
                    Ciphertext {
                        kind: serde_json::from_str(&kind)
                            .with_context(|| format!("couldn't parse kind of {}", handle))?,
                        value: u32::try_from(value)?,
                        input: row.get("input"),
                    },
                ))
            })
            .collect()
    }
    async fn add_grant(&self, handle: &Handle, principal: &Principal) -> Result<()> {
        self.connection
            .execute(
                query("INSERT OR IGNORE INTO acl (handle, principal) VALUES (?,?)")
                    .bind(handle.to_string())
                    .bind(serde_json::to_string(principal)?),
            )
            .await
            .with_context(|| format!("couldn't grant {} on {}", principal, handle))?;
        Ok(())
    }
    async fn get_grants(&self) -> Result<Vec<(Handle, Principal)>> {
        self.connection
            .fetch_all(query("SELECT handle, principal FROM acl"))
            .await?
            .into_iter()
            .map(|row| -> Result<(Handle, Principal)> {
                let handle: String = row.get("handle");
                let principal: String = row.get("principal");
                Ok((
                    handle.parse()?,
                    serde_json::from_str(&principal)
                        .with_context(|| format!("couldn't parse grantee on {}", handle))?,
                ))
            })
            .collect()
    }
}
