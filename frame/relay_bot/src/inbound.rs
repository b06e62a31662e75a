use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use log::{debug, info, warn};
use relay_kit::{ChatMessage, ConversationSnapshot, PipeSender};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::chat_platform::{truncate_for_platform, ChannelRef, ChatPlatform};

/// Reacts to one message arriving on a listened channel.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, message: ChatMessage) -> AnyResult<()>;
}

/// Drains the ingress channel one message at a time until the platform side
/// closes it.
pub async fn run_inbound(handler: Arc<dyn InboundHandler>, mut ingress: mpsc::Receiver<ChatMessage>) {
    info!("inbound handler {} started", handler.name());
    while let Some(message) = ingress.recv().await {
        let message_id = message.id.clone();
        if let Err(err) = handler.handle(message).await {
            warn!(
                "inbound handler {} failed on message {}: {:#}",
                handler.name(),
                message_id,
                err
            );
        }
    }
    warn!("inbound handler {} ingress closed", handler.name());
}

fn is_own_message(platform: &dyn ChatPlatform, message: &ChatMessage) -> bool {
    platform
        .self_user_id()
        .is_some_and(|self_id| self_id == message.author_id)
}

fn channel_of(message: &ChatMessage) -> ChannelRef {
    ChannelRef {
        guild_id: message.guild_id.clone(),
        guild_name: message.guild_name.clone(),
        channel_id: message.channel_id.clone(),
        channel_name: message.channel_name.clone(),
    }
}

/// First `@name` token of `content`, without the `@`.
pub fn mentioned_user(content: &str) -> Option<&str> {
    let start = content.find('@')? + 1;
    let rest = &content[start..];
    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    let name = &rest[..end];
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Public side: every community message becomes a snapshot for the private side.
pub struct PublicInbound {
    pub platform: Arc<dyn ChatPlatform>,
    pub snapshot_sender: Arc<PipeSender<ConversationSnapshot>>,
    pub history_limit: usize,
    pub ignore_authors: Vec<String>,
}

impl PublicInbound {
    fn is_ignored_author(&self, author: &str) -> bool {
        self.ignore_authors.iter().any(|ignored| ignored == author)
    }
}

#[async_trait]
impl InboundHandler for PublicInbound {
    fn name(&self) -> &str {
        "public"
    }

    async fn handle(&self, message: ChatMessage) -> AnyResult<()> {
        if is_own_message(self.platform.as_ref(), &message) {
            return Ok(());
        }
        if self.is_ignored_author(&message.author) {
            debug!("message {} from ignored author {}", message.id, message.author);
            return Ok(());
        }
        if let Some(mentioned) = mentioned_user(&message.content) {
            if !self.is_ignored_author(mentioned) {
                info!("message {} mentions user {}", message.id, mentioned);
            }
        }

        let channel = channel_of(&message);
        let history = self
            .platform
            .fetch_recent_messages(&channel, self.history_limit)
            .await
            .with_context(|| format!("fetch history of {} failed", channel.label()))?;
        let snapshot = ConversationSnapshot::from_messages(history);
        if snapshot.is_empty() {
            warn!("history of {} is empty, nothing to relay", channel.label());
            return Ok(());
        }

        let records = snapshot.len();
        let seq = self.snapshot_sender.send_until_delivered(snapshot).await?;
        info!(
            "message {} relayed as snapshot frame {} ({} records) on {}",
            message.id,
            seq,
            records,
            self.snapshot_sender.path().display()
        );
        Ok(())
    }
}

/// Private side: whatever the humans type is the reply for the public side.
pub struct PrivateInbound {
    pub platform: Arc<dyn ChatPlatform>,
    pub reply_sender: Arc<PipeSender<String>>,
    pub echo: bool,
    pub message_max_chars: usize,
}

#[async_trait]
impl InboundHandler for PrivateInbound {
    fn name(&self) -> &str {
        "private"
    }

    async fn handle(&self, message: ChatMessage) -> AnyResult<()> {
        if is_own_message(self.platform.as_ref(), &message) {
            return Ok(());
        }
        if message.content.trim().is_empty() {
            debug!("message {} has no text, skipped", message.id);
            return Ok(());
        }

        let seq = self
            .reply_sender
            .send_until_delivered(message.content.clone())
            .await?;
        info!(
            "human reply {} from {} sent as frame {} on {}",
            message.id,
            message.author,
            seq,
            self.reply_sender.path().display()
        );

        if self.echo {
            let channel = channel_of(&message);
            let echo = truncate_for_platform(
                &format!("Echo from private: {}", message.content),
                self.message_max_chars,
            );
            self.platform
                .post_text(&channel, &echo)
                .await
                .with_context(|| format!("echo to {} failed", channel.label()))?;
        }
        Ok(())
    }
}
