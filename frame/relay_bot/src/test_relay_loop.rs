use relay_kit::{
    ensure_pipe, ConversationSnapshot, EscalationPolicy, PipeReceiver, PipeSender,
};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::chat_platform::ChatPlatform;
use crate::decision_pipeline::{DecisionPipeline, Stage};
use crate::inbound::{run_inbound, InboundHandler, PrivateInbound, PublicInbound};
use crate::reasoning_agent::AgentError;
use crate::relay_loop::{DecisionDispatch, LoopSettings, RelayLoop, RelayState, TextDispatch};
use crate::test_utils::{
    sample_message, test_channel, MemoryChatPlatform, ScriptedAgent, TEST_BOT_ID,
};

const RETRY: Duration = Duration::from_millis(20);
const MAX_STEPS: usize = 500;

fn init_test_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Pipes {
    _dir: tempfile::TempDir,
    p2v: PathBuf,
    v2p: PathBuf,
}

fn pipes() -> Pipes {
    let dir = tempfile::tempdir().unwrap();
    let p2v = dir.path().join("message_public_to_private.pipe");
    let v2p = dir.path().join("message_private_to_public.pipe");
    Pipes { _dir: dir, p2v, v2p }
}

fn ready_platform() -> Arc<MemoryChatPlatform> {
    let platform = Arc::new(MemoryChatPlatform::new());
    platform.add_channel(test_channel("random"));
    platform.add_channel(test_channel("general"));
    platform.set_ready();
    platform
}

fn settings() -> LoopSettings {
    LoopSettings {
        guild: None,
        output_channel: "general".to_string(),
        retry_interval: RETRY,
    }
}

fn two_topic_snapshot() -> ConversationSnapshot {
    ConversationSnapshot::from_messages(vec![
        sample_message("3", "carol", "also the docs link is broken", 3, None),
        sample_message("2", "bob", "try the arm64 build", 2, Some("1")),
        sample_message("1", "alice", "how do I install it on a pi?", 1, None),
    ])
}

fn one_topic_snapshot() -> ConversationSnapshot {
    ConversationSnapshot::from_messages(vec![
        sample_message("3", "alice", "that worked, thanks", 3, Some("2")),
        sample_message("2", "bob", "try the arm64 build", 2, Some("1")),
        sample_message("1", "alice", "how do I install it on a pi?", 1, None),
    ])
}

/// One full scripted pipeline run per entry of `replies`.
fn decision_agent(replies: &[&str]) -> ScriptedAgent {
    let mut agent = ScriptedAgent::new();
    for reply in replies {
        agent = agent
            .respond(Stage::Segmentation, "## install on a pi\nalice, bob")
            .respond(Stage::Aggregation, "install on a pi")
            .respond(Stage::Synthesis, "arm users cannot find the install steps")
            .respond(Stage::ReplyDrafting, reply);
    }
    agent
}

fn private_loop(
    platform: &Arc<MemoryChatPlatform>,
    agent: Arc<ScriptedAgent>,
    pipes: &Pipes,
    escalate_on_decode_failure: bool,
) -> RelayLoop<DecisionDispatch> {
    let platform: Arc<dyn ChatPlatform> = platform.clone();
    RelayLoop::new(
        platform.clone(),
        PipeReceiver::new(&pipes.p2v),
        DecisionDispatch {
            pipeline: DecisionPipeline::new(agent),
            policy: EscalationPolicy::new(6).unwrap(),
            platform,
            reply_sender: Arc::new(PipeSender::new(&pipes.v2p, RETRY)),
            message_max_chars: 1900,
            escalate_on_decode_failure,
        },
        settings(),
    )
}

fn public_loop(platform: &Arc<MemoryChatPlatform>, pipes: &Pipes) -> RelayLoop<TextDispatch> {
    let platform: Arc<dyn ChatPlatform> = platform.clone();
    RelayLoop::new(
        platform.clone(),
        PipeReceiver::new(&pipes.v2p),
        TextDispatch {
            platform,
            message_max_chars: 10,
        },
        settings(),
    )
}

async fn drive_until<D: crate::relay_loop::PayloadDispatcher>(
    relay: &mut RelayLoop<D>,
    target: RelayState,
) {
    for _ in 0..MAX_STEPS {
        if relay.state() == target {
            return;
        }
        relay.step().await;
    }
    panic!("relay loop never reached {:?}, stuck in {:?}", target, relay.state());
}

/// Reads one payload while `send` writes it, leaving the loop in Dispatch.
async fn deliver<D: crate::relay_loop::PayloadDispatcher>(
    relay: &mut RelayLoop<D>,
    sender: &PipeSender<D::Payload>,
    payload: D::Payload,
) where
    D::Payload: serde::Serialize,
{
    let (_, sent) = tokio::join!(drive_until(relay, RelayState::Dispatch), sender.send(payload));
    sent.unwrap();
}

#[tokio::test]
async fn loop_waits_ready_then_resolves_output_channel() {
    init_test_log();
    let pipes = pipes();
    let platform = Arc::new(MemoryChatPlatform::new());
    let mut relay = public_loop(&platform, &pipes);
    assert_eq!(relay.state(), RelayState::WaitReady);

    let not_ready = tokio::time::timeout(Duration::from_millis(50), relay.step()).await;
    assert!(not_ready.is_err());

    platform.set_ready();
    relay.step().await;
    assert_eq!(relay.state(), RelayState::ResolveDestination);

    // no channel yet: stays put
    relay.step().await;
    relay.step().await;
    assert_eq!(relay.state(), RelayState::ResolveDestination);
    assert!(relay.destination().is_none());

    platform.add_channel(test_channel("general"));
    relay.step().await;
    assert_eq!(relay.state(), RelayState::ReadPayload);
    assert_eq!(relay.destination().unwrap().channel_id, "chan-general");
}

#[tokio::test]
async fn high_score_escalates_to_output_channel() {
    init_test_log();
    let pipes = pipes();
    ensure_pipe(&pipes.p2v).unwrap();
    let platform = ready_platform();
    let agent = Arc::new(decision_agent(&[r#"{"score": 8, "reason": "r", "reply": "x"}"#]));
    let mut relay = private_loop(&platform, agent, &pipes, true);

    let sender = PipeSender::new(&pipes.p2v, RETRY);
    deliver(&mut relay, &sender, two_topic_snapshot()).await;
    relay.step().await;

    assert_eq!(relay.state(), RelayState::ReadPayload);
    let posts = platform.posts();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].0, "chan-general");
    assert!(posts[0].1.starts_with("Received message from server:"));
    assert!(posts[0].1.contains("alice: how do I install it on a pi?"));
    assert!(posts[0].1.ends_with("Suggested reply (score 8/10, r): x"));
    // nothing went back to the public side
    assert!(!pipes.v2p.exists());
}

#[tokio::test]
async fn low_score_reply_goes_back_over_the_opposite_pipe() {
    init_test_log();
    let pipes = pipes();
    ensure_pipe(&pipes.p2v).unwrap();
    ensure_pipe(&pipes.v2p).unwrap();
    let platform = ready_platform();
    let agent = Arc::new(decision_agent(&[r#"{"score": 3, "reason": "r", "reply": "y"}"#]));
    let mut relay = private_loop(&platform, agent, &pipes, true);

    let sender = PipeSender::new(&pipes.p2v, RETRY);
    deliver(&mut relay, &sender, two_topic_snapshot()).await;

    let mut replies = PipeReceiver::<String>::new(&pipes.v2p);
    let (_, reply) = tokio::join!(relay.step(), replies.receive());
    assert_eq!(reply.unwrap(), "y");
    assert_eq!(replies.last_seq(), Some(1));
    assert!(platform.posts().is_empty());
}

#[tokio::test]
async fn undecodable_reply_is_escalated_and_loop_keeps_serving() {
    init_test_log();
    let pipes = pipes();
    ensure_pipe(&pipes.p2v).unwrap();
    let platform = ready_platform();
    let agent = Arc::new(decision_agent(&[
        "a human should take this one",
        r#"{"score": 9, "reason": "angry user", "reply": "sorry"}"#,
    ]));
    let mut relay = private_loop(&platform, agent, &pipes, true);
    let sender = PipeSender::new(&pipes.p2v, RETRY);

    deliver(&mut relay, &sender, two_topic_snapshot()).await;
    relay.step().await;
    assert_eq!(relay.state(), RelayState::ReadPayload);
    let posts = platform.posts();
    assert_eq!(posts.len(), 1);
    assert!(posts[0].1.contains("Reply draft could not be decoded"));
    assert!(posts[0].1.contains("a human should take this one"));

    deliver(&mut relay, &sender, one_topic_snapshot()).await;
    relay.step().await;
    let posts = platform.posts();
    assert_eq!(posts.len(), 2);
    assert!(posts[1].1.ends_with("Suggested reply (score 9/10, angry user): sorry"));
}

#[tokio::test]
async fn undecodable_reply_is_dropped_silently_when_fallback_is_off() {
    init_test_log();
    let pipes = pipes();
    ensure_pipe(&pipes.p2v).unwrap();
    let platform = ready_platform();
    let agent = Arc::new(decision_agent(&[
        "not json",
        r#"{"score": 7, "reason": "r", "reply": "z"}"#,
    ]));
    let mut relay = private_loop(&platform, agent, &pipes, false);
    let sender = PipeSender::new(&pipes.p2v, RETRY);

    deliver(&mut relay, &sender, two_topic_snapshot()).await;
    relay.step().await;
    assert!(platform.posts().is_empty());
    assert_eq!(relay.state(), RelayState::ReadPayload);

    deliver(&mut relay, &sender, two_topic_snapshot()).await;
    relay.step().await;
    assert_eq!(platform.posts().len(), 1);
}

#[tokio::test]
async fn stage_failure_drops_the_snapshot_and_loop_keeps_serving() {
    init_test_log();
    let pipes = pipes();
    ensure_pipe(&pipes.p2v).unwrap();
    let platform = ready_platform();
    let agent = ScriptedAgent::new().fail(
        Stage::Segmentation,
        AgentError::Api {
            status: 503,
            message: "overloaded".to_string(),
        },
    );
    let agent = agent
        .respond(Stage::Segmentation, "## docs
carol")
        .respond(Stage::Aggregation, "docs")
        .respond(Stage::Synthesis, "broken docs link")
        .respond(
            Stage::ReplyDrafting,
            r#"{"score": 6, "reason": "needs a fix", "reply": "fixing it"}"#,
        );
    let mut relay = private_loop(&platform, Arc::new(agent), &pipes, true);
    let sender = PipeSender::new(&pipes.p2v, RETRY);

    deliver(&mut relay, &sender, two_topic_snapshot()).await;
    relay.step().await;
    assert_eq!(relay.state(), RelayState::ReadPayload);
    assert!(platform.posts().is_empty());

    deliver(&mut relay, &sender, two_topic_snapshot()).await;
    relay.step().await;
    let posts = platform.posts();
    assert_eq!(posts.len(), 1);
    // the threshold itself escalates
    assert!(posts[0].1.ends_with("Suggested reply (score 6/10, needs a fix): fixing it"));
}

#[tokio::test]
async fn failed_post_does_not_stop_the_loop() {
    init_test_log();
    let pipes = pipes();
    ensure_pipe(&pipes.v2p).unwrap();
    let platform = ready_platform();
    let mut relay = public_loop(&platform, &pipes);
    let sender = PipeSender::<String>::new(&pipes.v2p, RETRY);

    platform.set_fail_posts(true);
    deliver(&mut relay, &sender, "lost".to_string()).await;
    relay.step().await;
    assert_eq!(relay.state(), RelayState::ReadPayload);
    assert!(platform.posts().is_empty());

    platform.set_fail_posts(false);
    deliver(&mut relay, &sender, "kept".to_string()).await;
    relay.step().await;
    assert_eq!(platform.posts(), vec![("chan-general".to_string(), "kept".to_string())]);
}

#[tokio::test]
async fn public_loop_posts_reply_truncated() {
    init_test_log();
    let pipes = pipes();
    ensure_pipe(&pipes.v2p).unwrap();
    let platform = ready_platform();
    let mut relay = public_loop(&platform, &pipes);
    let sender = PipeSender::<String>::new(&pipes.v2p, RETRY);

    deliver(&mut relay, &sender, "see the install guide".to_string()).await;
    relay.step().await;
    assert_eq!(
        platform.posts(),
        vec![("chan-general".to_string(), "see the in".to_string())]
    );
}

#[tokio::test]
async fn pipe_deleted_mid_run_is_retried_until_the_peer_recreates_it() {
    init_test_log();
    let pipes = pipes();
    ensure_pipe(&pipes.v2p).unwrap();
    let platform = ready_platform();
    let mut relay = public_loop(&platform, &pipes);
    let sender = PipeSender::<String>::new(&pipes.v2p, RETRY);

    deliver(&mut relay, &sender, "before".to_string()).await;
    relay.step().await;
    assert_eq!(relay.state(), RelayState::ReadPayload);

    std::fs::remove_file(&pipes.v2p).unwrap();

    // the read fails, the loop sleeps and stays
    relay.step().await;
    relay.step().await;
    assert_eq!(relay.state(), RelayState::ReadPayload);
    assert!(!pipes.v2p.exists());

    // the sender recreates the fifo before writing
    let (_, sent) = tokio::join!(
        drive_until(&mut relay, RelayState::Dispatch),
        sender.send_until_delivered("after".to_string())
    );
    assert_eq!(sent.unwrap(), 2);
    relay.step().await;
    assert_eq!(
        platform.posts(),
        vec![
            ("chan-general".to_string(), "before".to_string()),
            ("chan-general".to_string(), "after".to_string())
        ]
    );
}

#[tokio::test]
async fn garbage_frame_is_dropped_and_next_frame_served() {
    init_test_log();
    let pipes = pipes();
    ensure_pipe(&pipes.v2p).unwrap();
    let platform = ready_platform();
    let mut relay = public_loop(&platform, &pipes);
    drive_until(&mut relay, RelayState::ReadPayload).await;

    let path = pipes.v2p.clone();
    let writer = tokio::task::spawn_blocking(move || {
        let mut pipe = OpenOptions::new().write(true).open(&path).unwrap();
        pipe.write_all(b"\x80\x04 truncated pickle").unwrap();
    });
    let (_, written) = tokio::join!(relay.step(), writer);
    written.unwrap();
    assert_eq!(relay.state(), RelayState::ReadPayload);
    assert!(platform.posts().is_empty());

    let sender = PipeSender::<String>::new(&pipes.v2p, RETRY);
    deliver(&mut relay, &sender, "ok".to_string()).await;
    relay.step().await;
    assert_eq!(platform.posts().len(), 1);
}

#[tokio::test]
async fn two_topic_snapshot_yields_two_segments() {
    let agent = Arc::new(
        ScriptedAgent::new()
            .respond(
                Stage::Segmentation,
                "## Installing on a Raspberry Pi\n\
                 [2025-03-01 12:01:00] alice: how do I install it on a pi?\n\
                 [2025-03-01 12:02:00] bob: try the arm64 build\n\
                 ## Broken documentation link\n\
                 [2025-03-01 12:03:00] carol: also the docs link is broken\n",
            )
            .respond(Stage::Aggregation, "install, docs")
            .respond(Stage::Synthesis, "onboarding friction")
            .respond(Stage::ReplyDrafting, r#"{"score": 4, "reason": "r", "reply": "y"}"#),
    );
    let outcome = DecisionPipeline::new(agent)
        .run(&two_topic_snapshot())
        .await
        .unwrap();
    assert!(outcome.run.segments.len() >= 2);
}

#[tokio::test]
async fn single_topic_snapshot_yields_one_segment() {
    let agent = Arc::new(
        ScriptedAgent::new()
            .respond(
                Stage::Segmentation,
                "## Installing on a Raspberry Pi\n\
                 alice asks how to install on a pi, bob points to the arm64 build, alice confirms.",
            )
            .respond(Stage::Aggregation, "install")
            .respond(Stage::Synthesis, "arm onboarding")
            .respond(Stage::ReplyDrafting, r#"{"score": 2, "reason": "r", "reply": "y"}"#),
    );
    let outcome = DecisionPipeline::new(agent)
        .run(&one_topic_snapshot())
        .await
        .unwrap();
    assert_eq!(outcome.run.segments.len(), 1);
}

fn public_inbound(platform: &Arc<MemoryChatPlatform>, p2v: &Path) -> PublicInbound {
    PublicInbound {
        platform: platform.clone(),
        snapshot_sender: Arc::new(PipeSender::new(p2v, RETRY)),
        history_limit: 5,
        ignore_authors: vec!["rudyrrr".to_string()],
    }
}

#[tokio::test]
async fn public_inbound_relays_channel_history_as_snapshot() {
    init_test_log();
    let pipes = pipes();
    let platform = ready_platform();
    platform.set_history(
        "chan-general",
        vec![
            sample_message("3", "carol", "also the docs link is broken", 3, None),
            sample_message("2", "bob", "try the arm64 build", 2, Some("1")),
            sample_message("1", "alice", "how do I install it on a pi?", 1, None),
        ],
    );
    let handler = public_inbound(&platform, &pipes.p2v);
    ensure_pipe(&pipes.p2v).unwrap();

    let mut receiver = PipeReceiver::<ConversationSnapshot>::new(&pipes.p2v);
    let trigger = sample_message("3", "carol", "also the docs link is broken", 3, None);
    let (handled, snapshot) = tokio::join!(handler.handle(trigger), receiver.receive());
    handled.unwrap();
    let snapshot = snapshot.unwrap();
    assert_eq!(snapshot.len(), 3);
    assert_eq!(snapshot.latest().unwrap().id, "3");
    assert_eq!(
        snapshot.get("2").unwrap().original_thread_id.as_deref(),
        Some("1")
    );
}

#[tokio::test]
async fn public_inbound_skips_own_and_ignored_authors() {
    init_test_log();
    let pipes = pipes();
    let platform = ready_platform();
    let handler = public_inbound(&platform, &pipes.p2v);

    let mut own = sample_message("9", "relay", "Echo", 9, None);
    own.author_id = TEST_BOT_ID.to_string();
    let founder = sample_message("8", "rudyrrr", "I'll handle it", 8, None);
    for message in [own, founder] {
        tokio::time::timeout(Duration::from_millis(500), handler.handle(message))
            .await
            .unwrap()
            .unwrap();
    }
    assert!(!pipes.p2v.exists());
}

#[tokio::test]
async fn private_inbound_forwards_human_reply_and_echoes() {
    init_test_log();
    let pipes = pipes();
    ensure_pipe(&pipes.v2p).unwrap();
    let platform = ready_platform();
    let handler = PrivateInbound {
        platform: platform.clone(),
        reply_sender: Arc::new(PipeSender::new(&pipes.v2p, RETRY)),
        echo: true,
        message_max_chars: 1900,
    };

    let mut receiver = PipeReceiver::<String>::new(&pipes.v2p);
    let human = sample_message("20", "rudyrrr", "we ship arm builds next week", 20, None);
    let (handled, reply) = tokio::join!(handler.handle(human), receiver.receive());
    handled.unwrap();
    assert_eq!(reply.unwrap(), "we ship arm builds next week");
    assert_eq!(
        platform.posts(),
        vec![(
            "chan-general".to_string(),
            "Echo from private: we ship arm builds next week".to_string()
        )]
    );
}

#[tokio::test]
async fn ingress_message_flows_through_private_inbound() {
    init_test_log();
    let pipes = pipes();
    ensure_pipe(&pipes.v2p).unwrap();
    let platform = ready_platform();
    let handler: Arc<dyn InboundHandler> = Arc::new(PrivateInbound {
        platform: platform.clone(),
        reply_sender: Arc::new(PipeSender::new(&pipes.v2p, RETRY)),
        echo: true,
        message_max_chars: 1900,
    });

    let (sink, ingress) = mpsc::channel(4);
    platform
        .start_ingress(vec![test_channel("general")], sink)
        .await
        .unwrap();
    let inbound = tokio::spawn(run_inbound(handler, ingress));

    let mut receiver = PipeReceiver::<String>::new(&pipes.v2p);
    let human = sample_message("21", "rudyrrr", "docs are fixed now", 21, None);
    let (_, reply) = tokio::join!(platform.inject(human), receiver.receive());
    assert_eq!(reply.unwrap(), "docs are fixed now");

    let posts = platform.wait_for_posts(1, Duration::from_secs(2)).await;
    assert_eq!(
        posts,
        vec![(
            "chan-general".to_string(),
            "Echo from private: docs are fixed now".to_string()
        )]
    );
    inbound.abort();
}
