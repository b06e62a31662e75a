use anyhow::Result as AnyResult;
use async_trait::async_trait;
use relay_kit::ChatMessage;
use tokio::sync::mpsc;

/// A text channel the bot can read from and post to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRef {
    pub guild_id: String,
    pub guild_name: String,
    pub channel_id: String,
    pub channel_name: String,
}

impl ChannelRef {
    pub fn label(&self) -> String {
        format!("{}#{}", self.guild_name, self.channel_name)
    }
}

#[async_trait]
pub trait ChatPlatform: Send + Sync {
    fn platform(&self) -> &str;

    /// Resolves once the platform connection has logged in.
    async fn wait_until_ready(&self);

    /// Identity of the bot account, known after ready.
    fn self_user_id(&self) -> Option<String>;

    async fn list_channels(&self) -> AnyResult<Vec<ChannelRef>>;

    /// Most recent messages of `channel`, newest first.
    async fn fetch_recent_messages(
        &self,
        channel: &ChannelRef,
        limit: usize,
    ) -> AnyResult<Vec<ChatMessage>>;

    /// Posts `text` as is. Callers truncate to the platform ceiling first.
    async fn post_text(&self, channel: &ChannelRef, text: &str) -> AnyResult<()>;

    /// Starts delivering new messages of `channels` into `sink`, oldest first.
    async fn start_ingress(
        &self,
        channels: Vec<ChannelRef>,
        sink: mpsc::Sender<ChatMessage>,
    ) -> AnyResult<()>;
}

/// Looks up a text channel by name, optionally restricted to one guild.
pub fn find_channel(channels: &[ChannelRef], guild: Option<&str>, name: &str) -> Option<ChannelRef> {
    channels
        .iter()
        .filter(|channel| guild.map_or(true, |guild| channel.guild_name == guild))
        .find(|channel| channel.channel_name == name)
        .cloned()
}

/// Cuts `text` to at most `max_chars` characters on a char boundary.
pub fn truncate_for_platform(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_pos, _)) => text[..byte_pos].to_string(),
        None => text.to_string(),
    }
}
