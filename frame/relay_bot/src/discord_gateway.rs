use anyhow::{bail, Context, Result as AnyResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use relay_kit::ChatMessage;
use reqwest::{Client as HttpClient, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::chat_platform::{ChannelRef, ChatPlatform};
use crate::relay_config::DiscordConfig;

const DISCORD_MESSAGE_LIMIT: usize = 2_000;
const GUILD_TEXT_CHANNEL: u8 = 0;
const INGRESS_PAGE_SIZE: usize = 50;

#[derive(Debug, Deserialize)]
struct DiscordUser {
    id: String,
    username: String,
    #[serde(default)]
    bot: bool,
}

#[derive(Debug, Deserialize)]
struct DiscordGuild {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct DiscordChannel {
    id: String,
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiscordMessageReference {
    #[serde(default)]
    message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiscordMessage {
    id: String,
    author: DiscordUser,
    #[serde(default)]
    content: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    message_reference: Option<DiscordMessageReference>,
}

impl DiscordMessage {
    fn into_chat_message(self, channel: &ChannelRef) -> ChatMessage {
        ChatMessage {
            id: self.id,
            author: self.author.username,
            author_id: self.author.id,
            author_is_bot: self.author.bot,
            content: self.content,
            timestamp: self.timestamp,
            guild_id: channel.guild_id.clone(),
            guild_name: channel.guild_name.clone(),
            channel_id: channel.channel_id.clone(),
            channel_name: channel.channel_name.clone(),
            reply_to_id: self.message_reference.and_then(|reference| reference.message_id),
        }
    }
}

fn snowflake(id: &str) -> u64 {
    id.parse().unwrap_or(0)
}

struct DiscordApi {
    http: HttpClient,
    api_base: String,
    token: String,
}

impl DiscordApi {
    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> AnyResult<T> {
        let url = format!("{}/{}", self.api_base, path.trim_start_matches('/'));
        let req = self
            .http
            .request(method, url)
            .header("Authorization", format!("Bot {}", self.token))
            .query(query);
        let req = if let Some(body) = body {
            req.json(&body)
        } else {
            req
        };
        let response = req
            .send()
            .await
            .with_context(|| format!("discord api {} request failed", path))?;
        let status = response.status();
        if !status.is_success() {
            let detail: Value = response.json().await.unwrap_or(Value::Null);
            let message = detail
                .get("message")
                .and_then(|value| value.as_str())
                .unwrap_or("unknown discord api error");
            bail!("discord api {} failed [{}]: {}", path, status.as_u16(), message);
        }
        response
            .json()
            .await
            .with_context(|| format!("discord api {} parse response failed", path))
    }

    async fn messages(
        &self,
        channel: &ChannelRef,
        limit: usize,
        after: Option<&str>,
    ) -> AnyResult<Vec<DiscordMessage>> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(after) = after {
            query.push(("after", after.to_string()));
        }
        self.call(
            Method::GET,
            &format!("channels/{}/messages", channel.channel_id),
            &query,
            None,
        )
        .await
    }
}

/// Discord over plain REST: login check, channel listing, history, posting,
/// and a polling ingress per listened channel.
pub struct DiscordRestGateway {
    api: Arc<DiscordApi>,
    poll_interval: Duration,
    ready: watch::Sender<bool>,
    self_user: OnceLock<String>,
    ingress_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscordRestGateway {
    pub fn new(cfg: &DiscordConfig, token: String) -> AnyResult<Self> {
        let http = HttpClient::builder()
            .build()
            .context("failed to build reqwest client for discord")?;
        let (ready, _) = watch::channel(false);
        Ok(Self {
            api: Arc::new(DiscordApi {
                http,
                api_base: cfg.api_base.trim_end_matches('/').to_string(),
                token,
            }),
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            ready,
            self_user: OnceLock::new(),
            ingress_tasks: Mutex::new(Vec::new()),
        })
    }

    /// Checks the token against `users/@me` and flips the ready signal.
    pub async fn login(&self) -> AnyResult<()> {
        let me: DiscordUser = self
            .api
            .call(Method::GET, "users/@me", &[], None)
            .await
            .context("discord login failed")?;
        info!("discord logged in as {} ({})", me.username, me.id);
        let _ = self.self_user.set(me.id);
        self.ready.send_replace(true);
        Ok(())
    }

    /// Retries `login` on a fixed interval until it succeeds.
    pub async fn login_until_ready(&self, retry_interval: Duration) {
        loop {
            match self.login().await {
                Ok(()) => return,
                Err(err) => {
                    warn!("{:#}, retry in {:?}", err, retry_interval);
                    tokio::time::sleep(retry_interval).await;
                }
            }
        }
    }

    fn spawn_ingress_task(
        &self,
        channel: ChannelRef,
        sink: mpsc::Sender<ChatMessage>,
    ) -> JoinHandle<()> {
        let api = self.api.clone();
        let poll_interval = self.poll_interval;
        tokio::spawn(async move {
            // start after the newest existing message so history is not replayed
            let mut cursor = loop {
                match api.messages(&channel, 1, None).await {
                    Ok(messages) => break messages.into_iter().next().map(|message| message.id),
                    Err(err) => {
                        warn!(
                            "discord ingress baseline for {} failed: {:#}",
                            channel.label(),
                            err
                        );
                        tokio::time::sleep(poll_interval).await;
                    }
                }
            };
            info!(
                "discord ingress polling {} from {:?}",
                channel.label(),
                cursor
            );

            loop {
                tokio::time::sleep(poll_interval).await;
                let mut messages = match api
                    .messages(&channel, INGRESS_PAGE_SIZE, cursor.as_deref())
                    .await
                {
                    Ok(messages) => messages,
                    Err(err) => {
                        warn!("discord ingress poll of {} failed: {:#}", channel.label(), err);
                        continue;
                    }
                };
                messages.sort_by_key(|message| snowflake(&message.id));
                for message in messages {
                    cursor = Some(message.id.clone());
                    debug!(
                        "discord ingress {} message {} from {}",
                        channel.label(),
                        message.id,
                        message.author.username
                    );
                    if sink.send(message.into_chat_message(&channel)).await.is_err() {
                        warn!("discord ingress sink closed, stop polling {}", channel.label());
                        return;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl ChatPlatform for DiscordRestGateway {
    fn platform(&self) -> &str {
        "discord"
    }

    async fn wait_until_ready(&self) {
        let mut ready = self.ready.subscribe();
        let _ = ready.wait_for(|ready| *ready).await;
    }

    fn self_user_id(&self) -> Option<String> {
        self.self_user.get().cloned()
    }

    async fn list_channels(&self) -> AnyResult<Vec<ChannelRef>> {
        let guilds: Vec<DiscordGuild> = self
            .api
            .call(Method::GET, "users/@me/guilds", &[], None)
            .await?;
        let mut refs = Vec::new();
        for guild in guilds {
            let channels: Vec<DiscordChannel> = self
                .api
                .call(
                    Method::GET,
                    &format!("guilds/{}/channels", guild.id),
                    &[],
                    None,
                )
                .await?;
            for channel in channels {
                if channel.kind != GUILD_TEXT_CHANNEL {
                    continue;
                }
                debug!("guild:{}, channel:{:?}", guild.name, channel.name);
                refs.push(ChannelRef {
                    guild_id: guild.id.clone(),
                    guild_name: guild.name.clone(),
                    channel_id: channel.id,
                    channel_name: channel.name.unwrap_or_default(),
                });
            }
        }
        Ok(refs)
    }

    async fn fetch_recent_messages(
        &self,
        channel: &ChannelRef,
        limit: usize,
    ) -> AnyResult<Vec<ChatMessage>> {
        let mut messages = self.api.messages(channel, limit, None).await?;
        // newest first
        messages.sort_by_key(|message| std::cmp::Reverse(snowflake(&message.id)));
        Ok(messages
            .into_iter()
            .map(|message| message.into_chat_message(channel))
            .collect())
    }

    async fn post_text(&self, channel: &ChannelRef, text: &str) -> AnyResult<()> {
        let chars = text.chars().count();
        if chars > DISCORD_MESSAGE_LIMIT {
            bail!(
                "message of {} chars exceeds discord limit {}",
                chars,
                DISCORD_MESSAGE_LIMIT
            );
        }
        let sent: Value = self
            .api
            .call(
                Method::POST,
                &format!("channels/{}/messages", channel.channel_id),
                &[],
                Some(json!({ "content": text })),
            )
            .await?;
        debug!(
            "discord posted message {:?} to {}",
            sent.get("id"),
            channel.label()
        );
        Ok(())
    }

    async fn start_ingress(
        &self,
        channels: Vec<ChannelRef>,
        sink: mpsc::Sender<ChatMessage>,
    ) -> AnyResult<()> {
        let mut tasks = self.ingress_tasks.lock().await;
        if !tasks.is_empty() {
            warn!("discord ingress already started");
            return Ok(());
        }
        if channels.is_empty() {
            warn!("discord ingress started with no channels");
        }
        for channel in channels {
            tasks.push(self.spawn_ingress_task(channel, sink.clone()));
        }
        Ok(())
    }
}
