//! Environment-driven configuration.
//!
//! Loaded once at startup after `dotenv`. Missing required secrets are the
//! only process-fatal condition; everything else has a default.

use anyhow::{Context, Result};
use std::env;

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
const DEFAULT_DATABASE_URL: &str = "sqlite:diabuddy.db?mode=rwc";
const DEFAULT_DIAGNOSE_ADDR: &str = "127.0.0.1:8080";

#[derive(Debug, Clone)]
pub struct Config {
    pub telegram_token: String,
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub openai_model: String,
    pub database_url: String,
    pub diagnose_addr: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let telegram_token =
            env::var("TELEGRAM_BOT_TOKEN").context("TELEGRAM_BOT_TOKEN must be set")?;
        let openai_api_key = env::var("OPENAI_API_KEY").context("OPENAI_API_KEY must be set")?;

        Ok(Self {
            telegram_token,
            openai_api_key,
            openai_base_url: env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_OPENAI_BASE_URL.to_string()),
            openai_model: env::var("OPENAI_MODEL")
                .unwrap_or_else(|_| DEFAULT_OPENAI_MODEL.to_string()),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
            diagnose_addr: env::var("DIAGNOSE_ADDR")
                .unwrap_or_else(|_| DEFAULT_DIAGNOSE_ADDR.to_string()),
        })
    }
}
