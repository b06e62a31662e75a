use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use relay_kit::{
    ConversationSnapshot, DecisionDecodeError, EscalationPolicy, PipeReceiver, PipeSender, Route,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

use crate::chat_platform::{find_channel, truncate_for_platform, ChannelRef, ChatPlatform};
use crate::decision_pipeline::{DecisionPipeline, PipelineError, PipelineOutcome, PipelineRun};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    WaitReady,
    ResolveDestination,
    ReadPayload,
    Dispatch,
}

/// What a relay loop does with one payload read from its pipe.
#[async_trait]
pub trait PayloadDispatcher: Send + Sync {
    type Payload: DeserializeOwned + Send + 'static;

    fn direction(&self) -> &str;

    async fn dispatch(&self, destination: &ChannelRef, payload: Self::Payload) -> AnyResult<()>;
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub guild: Option<String>,
    pub output_channel: String,
    pub retry_interval: Duration,
}

/// One direction of the relay. Runs for the lifetime of the process.
pub struct RelayLoop<D: PayloadDispatcher> {
    platform: Arc<dyn ChatPlatform>,
    receiver: PipeReceiver<D::Payload>,
    dispatcher: D,
    settings: LoopSettings,
    state: RelayState,
    destination: Option<ChannelRef>,
    pending: Option<D::Payload>,
}

impl<D: PayloadDispatcher> RelayLoop<D> {
    pub fn new(
        platform: Arc<dyn ChatPlatform>,
        receiver: PipeReceiver<D::Payload>,
        dispatcher: D,
        settings: LoopSettings,
    ) -> Self {
        Self {
            platform,
            receiver,
            dispatcher,
            settings,
            state: RelayState::WaitReady,
            destination: None,
            pending: None,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn destination(&self) -> Option<&ChannelRef> {
        self.destination.as_ref()
    }

    pub async fn run(mut self) {
        info!(
            "relay loop {} started on pipe {}",
            self.dispatcher.direction(),
            self.receiver.path().display()
        );
        loop {
            self.step().await;
        }
    }

    /// Performs the work of the current state and moves to the next one.
    /// Every failure is logged here; nothing escapes the loop.
    pub async fn step(&mut self) {
        match self.state {
            RelayState::WaitReady => {
                self.platform.wait_until_ready().await;
                info!(
                    "relay loop {}: {} platform ready",
                    self.dispatcher.direction(),
                    self.platform.platform()
                );
                self.state = RelayState::ResolveDestination;
            }
            RelayState::ResolveDestination => self.resolve_destination().await,
            RelayState::ReadPayload => self.read_payload().await,
            RelayState::Dispatch => {
                self.state = RelayState::ReadPayload;
                let (Some(payload), Some(destination)) =
                    (self.pending.take(), self.destination.as_ref())
                else {
                    return;
                };
                if let Err(err) = self.dispatcher.dispatch(destination, payload).await {
                    error!(
                        "relay loop {}: dispatch failed, message dropped: {:#}",
                        self.dispatcher.direction(),
                        err
                    );
                }
            }
        }
    }

    async fn resolve_destination(&mut self) {
        let found = match self.platform.list_channels().await {
            Ok(channels) => find_channel(
                &channels,
                self.settings.guild.as_deref(),
                &self.settings.output_channel,
            ),
            Err(err) => {
                warn!(
                    "relay loop {}: list channels failed: {:#}",
                    self.dispatcher.direction(),
                    err
                );
                None
            }
        };

        match found {
            Some(channel) => {
                info!(
                    "relay loop {}: output channel resolved to {} ({})",
                    self.dispatcher.direction(),
                    channel.label(),
                    channel.channel_id
                );
                self.destination = Some(channel);
                self.state = RelayState::ReadPayload;
            }
            None => {
                warn!(
                    "relay loop {}: output channel {} not found (guild filter {:?}), retry in {:?}",
                    self.dispatcher.direction(),
                    self.settings.output_channel,
                    self.settings.guild,
                    self.settings.retry_interval
                );
                tokio::time::sleep(self.settings.retry_interval).await;
            }
        }
    }

    async fn read_payload(&mut self) {
        match self.receiver.receive().await {
            Ok(payload) => {
                debug!(
                    "relay loop {}: frame {:?} received",
                    self.dispatcher.direction(),
                    self.receiver.last_seq()
                );
                self.pending = Some(payload);
                self.state = RelayState::Dispatch;
            }
            Err(err) if err.is_transport() => {
                warn!(
                    "relay loop {}: read from pipe {} failed, retry in {:?}: {}",
                    self.dispatcher.direction(),
                    self.receiver.path().display(),
                    self.settings.retry_interval,
                    err
                );
                tokio::time::sleep(self.settings.retry_interval).await;
            }
            Err(err) => {
                error!(
                    "relay loop {}: dropping undecodable payload: {}",
                    self.dispatcher.direction(),
                    err
                );
            }
        }
    }
}

/// Private side: snapshot in, escalation notice or autonomous reply out.
pub struct DecisionDispatch {
    pub pipeline: DecisionPipeline,
    pub policy: EscalationPolicy,
    pub platform: Arc<dyn ChatPlatform>,
    pub reply_sender: Arc<PipeSender<String>>,
    pub message_max_chars: usize,
    pub escalate_on_decode_failure: bool,
}

pub fn escalation_notice(outcome: &PipelineOutcome) -> String {
    format!(
        "Received message from server:\n{}\nSuggested reply (score {}/10, {}): {}",
        outcome.run.transcript.trim_end(),
        outcome.decision.score,
        outcome.decision.reason,
        outcome.decision.reply
    )
}

pub fn decode_failure_notice(run: &PipelineRun, err: &DecisionDecodeError) -> String {
    format!(
        "Received message from server:\n{}\nSummary: {}\nReply draft could not be decoded ({}): {}",
        run.transcript.trim_end(),
        run.summary,
        err,
        run.raw_reply
    )
}

impl DecisionDispatch {
    async fn post(&self, destination: &ChannelRef, text: &str) -> AnyResult<()> {
        let text = truncate_for_platform(text, self.message_max_chars);
        self.platform
            .post_text(destination, &text)
            .await
            .with_context(|| format!("post to {} failed", destination.label()))
    }
}

#[async_trait]
impl PayloadDispatcher for DecisionDispatch {
    type Payload = ConversationSnapshot;

    fn direction(&self) -> &str {
        "public->private"
    }

    async fn dispatch(
        &self,
        destination: &ChannelRef,
        snapshot: ConversationSnapshot,
    ) -> AnyResult<()> {
        let outcome = match self.pipeline.run(&snapshot).await {
            Ok(outcome) => outcome,
            Err(PipelineError::Decode { run, source }) => {
                error!(
                    "pipeline run {} decode failed after {}ms: {}, raw output: {:?}",
                    run.run_id,
                    run.elapsed_ms(),
                    source,
                    run.raw_reply
                );
                if self.escalate_on_decode_failure {
                    self.post(destination, &decode_failure_notice(&run, &source))
                        .await?;
                    info!("pipeline run {} escalated after decode failure", run.run_id);
                }
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        match self.policy.route(&outcome.decision) {
            Route::Escalate => {
                info!(
                    "pipeline run {} score {} >= {}, escalating to {}",
                    outcome.run.run_id,
                    outcome.decision.score,
                    self.policy.threshold(),
                    destination.label()
                );
                self.post(destination, &escalation_notice(&outcome)).await?;
            }
            Route::AutoReply => {
                info!(
                    "pipeline run {} score {} < {}, replying autonomously",
                    outcome.run.run_id,
                    outcome.decision.score,
                    self.policy.threshold()
                );
                let seq = self
                    .reply_sender
                    .send_until_delivered(outcome.decision.reply)
                    .await?;
                info!(
                    "pipeline run {} reply sent as frame {} on {}",
                    outcome.run.run_id,
                    seq,
                    self.reply_sender.path().display()
                );
            }
        }
        Ok(())
    }
}

/// Public side: text in, posted to the output channel.
pub struct TextDispatch {
    pub platform: Arc<dyn ChatPlatform>,
    pub message_max_chars: usize,
}

#[async_trait]
impl PayloadDispatcher for TextDispatch {
    type Payload = String;

    fn direction(&self) -> &str {
        "private->public"
    }

    async fn dispatch(&self, destination: &ChannelRef, text: String) -> AnyResult<()> {
        if text.trim().is_empty() {
            warn!("empty reply from private side, nothing to post");
            return Ok(());
        }
        let text = truncate_for_platform(&text, self.message_max_chars);
        self.platform
            .post_text(destination, &text)
            .await
            .with_context(|| format!("post to {} failed", destination.label()))?;
        info!(
            "posted reply to {}, {} chars",
            destination.label(),
            text.chars().count()
        );
        Ok(())
    }
}
