use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::bot::BotDispatcher;
use crate::collaborators::{ChatTransport, Collaborators, MailProvider, TextGenerator};
use crate::config::MailSyncConfig;
use crate::database::MailSyncDatabase;
use crate::gmail::{GmailClient, GoogleOAuth};
use crate::http_client::build_http_client;
use crate::ingest::NotificationIngestor;
use crate::llm_client::LlmClient;
use crate::renewal::RenewalScheduler;
use crate::reply::ReplyStateMachine;
use crate::retry::RetryPolicy;
use crate::server::{self, ServerState};
use crate::subscription::SubscriptionManager;
use crate::sync_engine::SyncEngine;
use crate::telegram::{self, TelegramClient};

/// Every long-lived component, wired once at startup.
pub struct MailSyncRuntime {
    pub config: Arc<MailSyncConfig>,
    pub collab: Collaborators,
    pub oauth: GoogleOAuth,
    pub telegram: Option<TelegramClient>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub sync: Arc<SyncEngine>,
    pub ingestor: Arc<NotificationIngestor>,
    pub reply: Arc<ReplyStateMachine>,
    pub renewal: Arc<RenewalScheduler>,
    pub dispatcher: Arc<BotDispatcher>,
}

pub struct MailSyncRuntimeBuilder {
    config: MailSyncConfig,
    database: Option<Arc<MailSyncDatabase>>,
    provider: Option<Arc<dyn MailProvider>>,
    generator: Option<Arc<dyn TextGenerator>>,
    chat: Option<Arc<dyn ChatTransport>>,
}

impl MailSyncRuntimeBuilder {
    pub fn new(config: MailSyncConfig) -> Self {
        Self {
            config,
            database: None,
            provider: None,
            generator: None,
            chat: None,
        }
    }

    pub fn with_database(mut self, database: Arc<MailSyncDatabase>) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn MailProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_chat(mut self, chat: Arc<dyn ChatTransport>) -> Self {
        self.chat = Some(chat);
        self
    }

    pub fn build(self) -> Result<MailSyncRuntime> {
        let config = self.config;
        let http = build_http_client().context("failed to build HTTP client")?;

        let db = match self.database {
            Some(db) => db,
            None => Arc::new(
                MailSyncDatabase::new(&config.database_path)
                    .with_context(|| format!("failed to open database {}", config.database_path))?,
            ),
        };

        let oauth = GoogleOAuth::new(
            config.google_client_id.clone(),
            config.google_client_secret.clone(),
            config.google_redirect_uri.clone(),
            http.clone(),
        );

        let provider: Arc<dyn MailProvider> = match self.provider {
            Some(provider) => provider,
            None => {
                if config.google_client_id.trim().is_empty()
                    || config.gmail_pubsub_topic.trim().is_empty()
                {
                    return Err(anyhow!(
                        "GOOGLE_CLIENT_ID and GMAIL_PUBSUB_TOPIC are required"
                    ));
                }
                Arc::new(GmailClient::new(
                    http.clone(),
                    oauth.clone(),
                    db.clone(),
                    config.gmail_pubsub_topic.clone(),
                ))
            }
        };

        let generator: Arc<dyn TextGenerator> = match self.generator {
            Some(generator) => generator,
            None => {
                if config.llm_api_key.is_none() {
                    tracing::warn!("No LLM API key configured; summaries will likely fail");
                }
                Arc::new(LlmClient::new(
                    config.llm_api_url.clone(),
                    config.llm_api_key.clone().unwrap_or_default(),
                    config.llm_model.clone(),
                    http.clone(),
                ))
            }
        };

        let telegram = if config.telegram_bot_token.trim().is_empty() {
            None
        } else {
            Some(TelegramClient::new(&config.telegram_bot_token, http.clone()))
        };
        let chat: Arc<dyn ChatTransport> = match (self.chat, telegram.clone()) {
            (Some(chat), _) => chat,
            (None, Some(client)) => Arc::new(client),
            (None, None) => return Err(anyhow!("TELEGRAM_BOT_TOKEN is required")),
        };

        let collab = Collaborators {
            provider,
            generator,
            chat,
            db,
            retry: RetryPolicy::from_config(&config.retry),
        };

        let config = Arc::new(config);
        let subscriptions = Arc::new(SubscriptionManager::new(collab.clone()));
        // One reply machine: notifications and user actions share its context locks.
        let reply = Arc::new(ReplyStateMachine::new(collab.clone()));
        let sync = Arc::new(SyncEngine::new(
            collab.clone(),
            subscriptions.clone(),
            reply.clone(),
            config.item_concurrency,
        ));
        let ingestor = Arc::new(NotificationIngestor::new(collab.clone(), sync.clone()));
        let renewal = Arc::new(RenewalScheduler::new(
            collab.clone(),
            subscriptions.clone(),
            config.renewal_interval(),
        ));
        let dispatcher = Arc::new(BotDispatcher::new(
            collab.clone(),
            config.clone(),
            subscriptions.clone(),
            reply.clone(),
        ));

        tracing::info!(
            "Runtime ready (renewal every {}h, context ttl {}h, item concurrency {})",
            renewal.interval().as_secs() / 3600,
            config.context_ttl().num_hours(),
            config.item_concurrency
        );

        Ok(MailSyncRuntime {
            config,
            collab,
            oauth,
            telegram,
            subscriptions,
            sync,
            ingestor,
            reply,
            renewal,
            dispatcher,
        })
    }
}

impl MailSyncRuntime {
    pub fn bootstrap(config: MailSyncConfig) -> Result<Self> {
        MailSyncRuntimeBuilder::new(config).build()
    }

    pub fn server_state(&self) -> Result<Arc<ServerState>> {
        Ok(Arc::new(ServerState {
            config: self.config.clone(),
            auth: server::load_auth_config(&self.config)?,
            collab: self.collab.clone(),
            oauth: self.oauth.clone(),
            dispatcher: self.dispatcher.clone(),
            ingestor: self.ingestor.clone(),
            renewal: self.renewal.clone(),
            reply: self.reply.clone(),
        }))
    }

    pub fn spawn_renewal_loop(&self) -> JoinHandle<()> {
        tokio::spawn(self.renewal.clone().run_forever())
    }

    /// Periodically drop reply contexts nobody finished.
    pub fn spawn_context_expiry_loop(&self) -> JoinHandle<()> {
        let reply = self.reply.clone();
        let ttl = self.config.context_ttl();
        let every = self.config.context_sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match reply.purge_expired(Utc::now() - ttl) {
                    Ok(0) => {}
                    Ok(purged) => tracing::info!("Purged {} expired reply context(s)", purged),
                    Err(e) => tracing::error!("Context expiry sweep failed: {}", e),
                }
            }
        })
    }

    /// Long polling, or webhook registration when configured.
    pub async fn start_telegram(&self) -> Result<Option<JoinHandle<()>>> {
        let Some(client) = self.telegram.clone() else {
            return Ok(None);
        };

        if self.config.telegram_use_webhook {
            let url = format!(
                "{}/telegram/webhook",
                self.config.public_base_url.trim_end_matches('/')
            );
            client
                .set_webhook(&url, self.config.telegram_webhook_secret.as_deref())
                .await
                .context("failed to register Telegram webhook")?;
            tracing::info!("Telegram webhook registered at {}", url);
            return Ok(None);
        }

        Ok(Some(tokio::spawn(telegram::run_polling(
            client,
            self.dispatcher.clone(),
        ))))
    }

    /// Start background loops and serve HTTP until the server exits.
    pub async fn serve(self) -> Result<()> {
        let state = self.server_state()?;
        self.spawn_renewal_loop();
        self.spawn_context_expiry_loop();
        self.start_telegram().await?;
        server::serve(state).await
    }
}
