use log::{info, warn};
use relay_kit::{relay_get_unix_timestamp_ms, ConversationSnapshot, Decision, DecisionDecodeError};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::reasoning_agent::{AgentError, Persona, ReasoningAgent};

const SPLITTER: Persona = Persona {
    name: "conversation_split",
    system_message: "You are an expert who can split the conversation history into several parts. \
        Each part is a whole conversation of one topic.",
    structured_decision: false,
};

const TOPIC_GROUP: Persona = Persona {
    name: "topic_group",
    system_message: "You are an expert who can summarize the conversation topic and aggregate \
        the parts that share the same topic.",
    structured_decision: false,
};

const BUSINESS_THEME: Persona = Persona {
    name: "business_theme_agent",
    system_message: "You are a business analyst who excels at discovering business themes in \
        conversation transcripts.",
    structured_decision: false,
};

const FOUNDER_ACTOR: Persona = Persona {
    name: "founder_actor",
    system_message: "You are a founder actor of the company. You answer community members on \
        behalf of the founders and judge how much a real founder needs to step in.",
    structured_decision: true,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Segmentation,
    Aggregation,
    Synthesis,
    ReplyDrafting,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Segmentation,
        Stage::Aggregation,
        Stage::Synthesis,
        Stage::ReplyDrafting,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Segmentation => "segmentation",
            Stage::Aggregation => "aggregation",
            Stage::Synthesis => "synthesis",
            Stage::ReplyDrafting => "reply_drafting",
        }
    }

    pub fn persona(&self) -> &'static Persona {
        match self {
            Stage::Segmentation => &SPLITTER,
            Stage::Aggregation => &TOPIC_GROUP,
            Stage::Synthesis => &BUSINESS_THEME,
            Stage::ReplyDrafting => &FOUNDER_ACTOR,
        }
    }

    /// Wraps the previous stage output, unchanged, in this stage's instruction.
    pub fn prompt(&self, input: &str) -> String {
        let instruction = match self {
            Stage::Segmentation => {
                "Please split the conversation history into several parts, each part is a whole \
                 conversation of a topic. Start every part with a line `## <topic>`."
            }
            Stage::Aggregation => {
                "Please organize the conversation parts into topics, merging the parts that share \
                 a topic."
            }
            Stage::Synthesis => {
                "Please find the business theme from the conversation history or the last message."
            }
            Stage::ReplyDrafting => {
                "Please try to reply to the last message based on the chat history summary. \
                 Answer with a JSON object {\"score\", \"reason\", \"reply\"}: score is an integer \
                 from 1 to 10 rating how much a human founder needs to reply, reason explains the \
                 score, reply is the message to post."
            }
        };
        format!("{}\n\n{}", instruction, input)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One topic-coherent part of the segmentation output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub topic: String,
    pub body: String,
}

const UNTITLED_SEGMENT: &str = "conversation";

fn heading_text(line: &str) -> Option<&str> {
    let rest = line.trim_start().strip_prefix('#')?;
    let rest = rest.trim_start_matches('#');
    if rest.starts_with(' ') {
        Some(rest.trim())
    } else {
        None
    }
}

/// Reads the segmentation output as markdown-headed parts. Text before the
/// first heading is preamble and dropped; output with no heading at all is a
/// single segment.
pub fn parse_segments(output: &str) -> Vec<Segment> {
    let mut segments: Vec<Segment> = Vec::new();
    let mut preamble = String::new();

    for line in output.lines() {
        if let Some(topic) = heading_text(line) {
            segments.push(Segment {
                topic: topic.to_string(),
                body: String::new(),
            });
            continue;
        }
        let body = match segments.last_mut() {
            Some(segment) => &mut segment.body,
            None => &mut preamble,
        };
        body.push_str(line);
        body.push('\n');
    }

    if segments.is_empty() {
        let body = preamble.trim();
        if body.is_empty() {
            return Vec::new();
        }
        return vec![Segment {
            topic: UNTITLED_SEGMENT.to_string(),
            body: body.to_string(),
        }];
    }

    for segment in segments.iter_mut() {
        segment.body = segment.body.trim().to_string();
    }
    segments
}

/// Everything one run produced so far. Owned by the run, never shared.
#[derive(Debug, Clone, Default)]
pub struct PipelineRun {
    pub run_id: String,
    pub started_at_ms: u64,
    pub transcript: String,
    pub segmentation: String,
    pub segments: Vec<Segment>,
    pub topics: String,
    pub summary: String,
    pub raw_reply: String,
}

impl PipelineRun {
    fn new(transcript: String) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at_ms: relay_get_unix_timestamp_ms(),
            transcript,
            ..Default::default()
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        relay_get_unix_timestamp_ms().saturating_sub(self.started_at_ms)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub run: PipelineRun,
    pub decision: Decision,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("snapshot is empty, nothing to analyze")]
    EmptySnapshot,
    #[error("pipeline run {run_id} stage {stage} failed: {source}")]
    Stage {
        run_id: String,
        stage: Stage,
        #[source]
        source: AgentError,
    },
    #[error("pipeline run {} reply decode failed: {source}", run.run_id)]
    Decode {
        run: Box<PipelineRun>,
        #[source]
        source: DecisionDecodeError,
    },
}

/// Segmentation, aggregation, synthesis, then reply drafting, strictly in order.
pub struct DecisionPipeline {
    agent: Arc<dyn ReasoningAgent>,
}

impl DecisionPipeline {
    pub fn new(agent: Arc<dyn ReasoningAgent>) -> Self {
        Self { agent }
    }

    pub async fn run(
        &self,
        snapshot: &ConversationSnapshot,
    ) -> Result<PipelineOutcome, PipelineError> {
        if snapshot.is_empty() {
            return Err(PipelineError::EmptySnapshot);
        }

        let mut run = PipelineRun::new(snapshot.transcript());
        info!(
            "pipeline run {} started with {} records",
            run.run_id,
            snapshot.len()
        );

        run.segmentation = self
            .run_stage(&run.run_id, Stage::Segmentation, &run.transcript)
            .await?;
        run.segments = parse_segments(&run.segmentation);
        if run.segments.is_empty() {
            warn!("pipeline run {} segmentation found no segments", run.run_id);
        }

        run.topics = self
            .run_stage(&run.run_id, Stage::Aggregation, &run.segmentation)
            .await?;
        run.summary = self
            .run_stage(&run.run_id, Stage::Synthesis, &run.topics)
            .await?;
        run.raw_reply = self
            .run_stage(&run.run_id, Stage::ReplyDrafting, &run.summary)
            .await?;

        match Decision::decode(&run.raw_reply) {
            Ok(decision) => {
                info!(
                    "pipeline run {} finished in {}ms: {} segments, score {}",
                    run.run_id,
                    run.elapsed_ms(),
                    run.segments.len(),
                    decision.score
                );
                Ok(PipelineOutcome { run, decision })
            }
            Err(source) => Err(PipelineError::Decode {
                run: Box::new(run),
                source,
            }),
        }
    }

    async fn run_stage(
        &self,
        run_id: &str,
        stage: Stage,
        input: &str,
    ) -> Result<String, PipelineError> {
        let persona = stage.persona();
        self.agent
            .run_stage(persona, &stage.prompt(input))
            .await
            .map_err(|source| PipelineError::Stage {
                run_id: run_id.to_string(),
                stage,
                source,
            })
    }
}
