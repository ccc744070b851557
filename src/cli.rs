#![allow(unused)]
use std::str::FromStr;

use anyhow::{Context, Result};
use api::*;
use clap::{Parser, Subcommand};
use secp256k1::{ecdsa::Signature, generate_keypair, rand, SecretKey};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWriteExt},
};

use crate::client::Client;
use crate::decrypt::{user_decrypt, RetryPolicy};

mod api;
mod client;
mod decrypt;

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Commands,
    #[arg(short, long, default_value = "http://127.0.0.1:8081")]
    url: String,
}
#[derive(Subcommand)]
enum Commands {
    GenerateKeys,
    Login,
    Register,
    CreatePrediction {
        #[arg(short, long)]
        title: String,
        /// Repeat once per option.
        #[arg(short, long)]
        option: Vec<String>,
    },
    PlaceBet {
        #[arg(short, long)]
        prediction: PredictionId,
        /// Index of the chosen option, encrypted before it leaves.
        #[arg(short, long)]
        choice: u32,
    },
    GetPredictions,
    GetPrediction {
        #[arg(short, long)]
        prediction: PredictionId,
    },
    DecryptBalance,
    DecryptBet {
        #[arg(short, long)]
        prediction: PredictionId,
    },
    MarketInfo,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Args::parse();
    let client = Client::new(cli.url);

    match cli.command {
        Commands::GenerateKeys => {
            let keys = generate_keypair(&mut rand::thread_rng());
            println!("Pubkey: {}", keys.1);
            write_file("ecdsa.key", &keys.0.display_secret().to_string()).await?;
            write_file("ecdsa.pub", &keys.1.to_string()).await?;
        }
        Commands::Login => {
            let access = client.login(&read_secret().await?).await?;
            write_file("access_token", &access.sig.to_string()).await?;
            write_file("challenge", &access.challenge).await?;
            println!("Logged in as {}", access.user);
        }
        Commands::Register => {
            client.register(get_access().await?).await?;
            println!("Registered with {} points", STARTING_POINTS);
        }
        Commands::CreatePrediction { title, option } => {
            let request = NewPredictionRequest {
                title,
                options: option,
            };
            let id = client.create_prediction(request, get_access().await?).await?;
            println!("Created new prediction: {}", id);
        }
        Commands::PlaceBet { prediction, choice } => {
            let access = get_access().await?;
            let input = client
                .encrypt_input(EncryptInputRequest { value: choice }, access.clone())
                .await?;
            let request = PlaceBetRequest {
                prediction,
                choice: input.handle,
                proof: input.proof,
            };
            client.place_bet(request, access).await?;
            println!("Placed bet on {}", prediction);
        }
        Commands::GetPredictions => {
            let response = client.get_predictions().await?;
            println!("{:#?}", response);
        }
        Commands::GetPrediction { prediction } => {
            let response = client.get_prediction(prediction).await?;
            println!("{:#?}", response);
            let user = read_public().await?;
            let bet = client
                .has_user_bet(UserBetRequest { prediction, user })
                .await?;
            println!("You have bet: {}", bet);
        }
        Commands::DecryptBalance => {
            let secret = read_secret().await?;
            let user = read_public().await?;
            let balance = client.get_encrypted_balance(user).await?;
            let contract = client.get_market_info().await?.contract;
            let points =
                user_decrypt(&client, &balance, &contract, &secret, &RetryPolicy::default())
                    .await?;
            println!("Balance: {} points", points);
            println!(
                "Remaining bets: {}",
                client.get_remaining_bets(user).await?
            );
        }
        Commands::DecryptBet { prediction } => {
            let secret = read_secret().await?;
            let user = read_public().await?;
            let contract = client.get_market_info().await?.contract;
            let request = UserBetRequest { prediction, user };
            let retry = RetryPolicy::default();
            let choice = client.get_user_encrypted_choice(request.clone()).await?;
            let choice = user_decrypt(&client, &choice, &contract, &secret, &retry).await?;
            let amount = client.get_user_encrypted_bet_amount(request).await?;
            let amount = user_decrypt(&client, &amount, &contract, &secret, &retry).await?;
            let options = client.get_prediction(prediction).await?.options;
            let label = usize::try_from(choice)
                .ok()
                .and_then(|choice| options.get(choice))
                .map_or("?", String::as_str);
            println!("Choice: {} ({}) | Amount: {} points", choice, label, amount);
        }
        Commands::MarketInfo => {
            let response = client.get_market_info().await?;
            println!("{:#?}", response);
        }
    }
    Ok(())
}
async fn get_access() -> Result<AccessRequest> {
    let user = read_public().await?;
    let sig = read_token().await?;
    let challenge = read_file("challenge").await?;
    Ok(AccessRequest {
        user,
        sig,
        challenge,
    })
}
async fn read_secret() -> Result<SecretKey> {
    Ok(SecretKey::from_str(&read_file("ecdsa.key").await?)?)
}
async fn read_public() -> Result<UserPubKey> {
    Ok(UserPubKey::from_str(&read_file("ecdsa.pub").await?)?)
}
async fn read_token() -> Result<Signature> {
    Ok(Signature::from_str(&read_file("access_token").await?)?)
}
async fn read_file(path: &str) -> Result<String> {
    let mut file = File::open(path)
        .await
        .with_context(|| format!("couldn't open {}", path))?;
    let mut contents = vec![];
    file.read_to_end(&mut contents).await?;
    Ok(String::from_utf8(contents)?.trim().to_string())
}
async fn write_file(path: &str, contents: &str) -> Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(contents.as_bytes()).await?;
    Ok(())
}
