//! Core domain model for roost: task kinds, scopes, and collected records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "roost-core";

/// The kind of engagement list a collection run walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Followers,
    Following,
    Likers,
    Retweeters,
    Tweets,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Followers => "followers",
            TaskKind::Following => "following",
            TaskKind::Likers => "likers",
            TaskKind::Retweeters => "retweeters",
            TaskKind::Tweets => "tweets",
        }
    }

    /// Provenance column carried on every record of this task: tweet-scoped
    /// tasks point at the tweet, account-scoped tasks at the account.
    pub fn provenance_key(&self) -> &'static str {
        match self {
            TaskKind::Likers | TaskKind::Retweeters => "source_tweet",
            _ => "source_account",
        }
    }

    pub fn is_tweet_task(&self) -> bool {
        matches!(self, TaskKind::Tweets)
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "followers" => Ok(TaskKind::Followers),
            "following" => Ok(TaskKind::Following),
            "likers" | "likes" => Ok(TaskKind::Likers),
            "retweeters" | "retweets" => Ok(TaskKind::Retweeters),
            "tweets" => Ok(TaskKind::Tweets),
            other => Err(format!("unknown task kind: {other}")),
        }
    }
}

/// One deduplication/checkpoint namespace: a task run against a single
/// target (an account handle or a tweet URL).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub task: TaskKind,
    pub target: String,
}

impl Scope {
    pub fn new(task: TaskKind, target: impl Into<String>) -> Self {
        Self {
            task,
            target: target.into(),
        }
    }

    /// Filesystem-safe fragment of the target. Handles lose their `@`,
    /// URLs lose their scheme, and path/query punctuation becomes `_`.
    pub fn slug(&self) -> String {
        self.target
            .trim()
            .trim_start_matches('@')
            .replace("https://", "")
            .replace("http://", "")
            .chars()
            .map(|c| match c {
                '/' | ':' | '?' | '&' => '_',
                c => c,
            })
            .collect()
    }

    /// Base name shared by every data shard of this scope.
    pub fn base_filename(&self) -> String {
        format!("{}_{}", self.slug(), self.task)
    }

    /// Stable name used for checkpoint and job-state files.
    pub fn job_name(&self) -> String {
        format!("{}_{}", self.task, self.slug())
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} of {}", self.task, self.target)
    }
}

/// A single collected item. Immutable once produced; never mutated after
/// extraction, only written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub task_type: TaskKind,
    pub source: String,
    pub scraped_at: DateTime<Utc>,
    pub attrs: BTreeMap<String, String>,
}

impl Record {
    pub fn new(
        id: impl Into<String>,
        task_type: TaskKind,
        source: impl Into<String>,
        scraped_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            task_type,
            source: source.into(),
            scraped_at,
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    /// Flat-file column order: provenance columns first, then attribute
    /// keys in their stored order.
    pub fn columns(&self) -> Vec<String> {
        let mut columns = vec![
            "id".to_string(),
            "task_type".to_string(),
            self.task_type.provenance_key().to_string(),
            "scraped_at".to_string(),
        ];
        columns.extend(self.attrs.keys().cloned());
        columns
    }

    /// Value for a named column; empty when this record lacks it.
    pub fn column_value(&self, column: &str) -> String {
        match column {
            "id" => self.id.clone(),
            "task_type" => self.task_type.as_str().to_string(),
            "scraped_at" => self.scraped_at.to_rfc3339(),
            c if c == self.task_type.provenance_key() => self.source.clone(),
            c => self.attrs.get(c).cloned().unwrap_or_default(),
        }
    }
}
