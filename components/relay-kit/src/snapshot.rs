use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

const PERMALINK_BASE: &str = "https://discord.com/channels";

/// A message as fetched from the chat platform, before thread resolution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub author: String,
    pub author_id: String,
    pub author_is_bot: bool,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub guild_id: String,
    pub guild_name: String,
    pub channel_id: String,
    pub channel_name: String,
    #[serde(default)]
    pub reply_to_id: Option<String>,
}

impl ChatMessage {
    pub fn permalink(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            PERMALINK_BASE, self.guild_id, self.channel_id, self.id
        )
    }

    pub fn channel_qualifier(&self) -> String {
        format!("{}_{}", self.guild_name, self.channel_name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub author: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub link: String,
    pub is_thread_root: bool,
    pub is_reply: bool,
    pub author_is_automated: bool,
    pub channel_qualifier: String,
    #[serde(default)]
    pub reply_to_id: Option<String>,
    /// Root of the reply chain this record belongs to. Equal to `id` for a
    /// root; `None` when the chain leaves the snapshot or loops.
    #[serde(default)]
    pub original_thread_id: Option<String>,
}

impl MessageRecord {
    fn from_chat_message(msg: ChatMessage) -> Self {
        let link = msg.permalink();
        let channel_qualifier = msg.channel_qualifier();
        let is_reply = msg.reply_to_id.is_some();
        Self {
            id: msg.id,
            author: msg.author,
            content: msg.content,
            timestamp: msg.timestamp,
            link,
            is_thread_root: !is_reply,
            is_reply,
            author_is_automated: msg.author_is_bot,
            channel_qualifier,
            reply_to_id: msg.reply_to_id,
            original_thread_id: None,
        }
    }

    pub fn transcript_line(&self) -> String {
        format!(
            "[{}] {}: {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.author,
            self.content
        )
    }
}

/// A point-in-time slice of one channel, in fetch order, with an id index.
///
/// Built once per triggering event, sent across the pipe once, then dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SnapshotWire", into = "SnapshotWire")]
pub struct ConversationSnapshot {
    records: Vec<MessageRecord>,
    index: HashMap<String, usize>,
}

#[derive(Clone, Serialize, Deserialize)]
struct SnapshotWire {
    records: Vec<MessageRecord>,
}

impl From<SnapshotWire> for ConversationSnapshot {
    fn from(wire: SnapshotWire) -> Self {
        Self::from_records(wire.records)
    }
}

impl From<ConversationSnapshot> for SnapshotWire {
    fn from(snapshot: ConversationSnapshot) -> Self {
        SnapshotWire {
            records: snapshot.records,
        }
    }
}

impl ConversationSnapshot {
    /// Builds a snapshot from messages in fetch order (newest first for the
    /// platform adapters). Duplicate ids keep their first occurrence.
    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        let records = messages
            .into_iter()
            .map(MessageRecord::from_chat_message)
            .collect();
        let mut snapshot = Self::from_records(records);

        let resolved: Vec<Option<String>> = snapshot
            .records
            .iter()
            .map(|record| snapshot.find_original_thread(record))
            .collect();
        for (record, thread_id) in snapshot.records.iter_mut().zip(resolved) {
            record.original_thread_id = thread_id;
        }
        snapshot
    }

    fn from_records(records: Vec<MessageRecord>) -> Self {
        let mut index = HashMap::with_capacity(records.len());
        let mut kept = Vec::with_capacity(records.len());
        for record in records {
            if index.contains_key(&record.id) {
                continue;
            }
            index.insert(record.id.clone(), kept.len());
            kept.push(record);
        }
        Self {
            records: kept,
            index,
        }
    }

    fn find_original_thread(&self, record: &MessageRecord) -> Option<String> {
        if record.is_thread_root {
            return Some(record.id.clone());
        }

        let mut visited = HashSet::new();
        visited.insert(record.id.as_str());
        let mut next = record.reply_to_id.as_deref();
        while let Some(parent_id) = next {
            if !visited.insert(parent_id) {
                return None;
            }
            let parent = self.get(parent_id)?;
            if parent.is_thread_root {
                return Some(parent.id.clone());
            }
            next = parent.reply_to_id.as_deref();
        }
        None
    }

    pub fn records(&self) -> &[MessageRecord] {
        &self.records
    }

    pub fn get(&self, id: &str) -> Option<&MessageRecord> {
        self.index.get(id).map(|pos| &self.records[*pos])
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn index_len(&self) -> usize {
        self.index.len()
    }

    /// The record that heads the fetch order, i.e. the triggering message.
    pub fn latest(&self) -> Option<&MessageRecord> {
        self.records.first()
    }

    /// Oldest-first rendering, one `[timestamp] author: content` line each.
    pub fn transcript(&self) -> String {
        let mut ordered: Vec<&MessageRecord> = self.records.iter().collect();
        ordered.sort_by_key(|record| record.timestamp);
        let mut transcript = String::new();
        for record in ordered {
            transcript.push_str(&record.transcript_line());
            transcript.push('\n');
        }
        transcript
    }
}
