use anyhow::Result;
use std::sync::Arc;
use teloxide::dispatching::dialogue::InMemStorage;
use teloxide::prelude::*;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use diabuddy::bot::{callback_handler, message_handler};
use diabuddy::config::Config;
use diabuddy::dialogue::State;
use diabuddy::gpt::GptClient;
use diabuddy::reminders::ReminderScheduler;
use diabuddy::staging::SessionStore;
use diabuddy::{api, db};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting diabetes diary bot");

    let config = Config::from_env()?;

    let pool = db::connect(&config.database_url).await?;
    db::init_schema(&pool).await?;

    let bot = Bot::new(&config.telegram_token);

    let gpt = Arc::new(GptClient::new(
        config.openai_api_key.clone(),
        config.openai_base_url.clone(),
        config.openai_model.clone(),
    ));
    let store = Arc::new(SessionStore::new());

    let scheduler = ReminderScheduler::new(bot.clone(), pool.clone());
    scheduler.schedule_all().await?;

    // The diagnose endpoint lives beside the bot, not inside it
    let diagnose_addr = config.diagnose_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = api::serve(&diagnose_addr).await {
            error!(error = %e, "Diagnose endpoint stopped");
        }
    });

    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .enter_dialogue::<Message, InMemStorage<State>, State>()
                .endpoint(message_handler),
        )
        .branch(
            Update::filter_callback_query()
                .enter_dialogue::<CallbackQuery, InMemStorage<State>, State>()
                .endpoint(callback_handler),
        );

    info!("Bot initialized, starting dispatcher");

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![
            InMemStorage::<State>::new(),
            pool,
            store,
            scheduler,
            gpt
        ])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}
