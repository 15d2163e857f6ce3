//! SQLite-backed [`Repository`].
//!
//! A [`rusqlite::Connection`] wrapped in an `Arc<Mutex<…>>` keeps the store
//! `Send + Sync` while respecting SQLite's single-writer requirement.  The
//! schema is applied at open so in-process tests need no migration step.
//!
//! JSON-shaped columns (config, participants, metadata, attachments, event
//! payloads) are stored as TEXT.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::domain::{AgentRun, Channel, Chat, Event, EventType, Message};

use super::{Repository, RepositoryError, Result};

/// DDL executed when the store is opened.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS channels (
    id        TEXT PRIMARY KEY NOT NULL,
    type      TEXT NOT NULL,
    status    TEXT NOT NULL DEFAULT 'offline',
    config    TEXT NOT NULL DEFAULT '{}',
    last_seen TEXT
);

CREATE TABLE IF NOT EXISTS chats (
    chat_id      TEXT PRIMARY KEY NOT NULL,
    channel_id   TEXT NOT NULL,
    participants TEXT NOT NULL DEFAULT '[]',
    metadata     TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_chats_channel ON chats (channel_id);

CREATE TABLE IF NOT EXISTS messages (
    msg_id      TEXT PRIMARY KEY NOT NULL,
    chat_id     TEXT NOT NULL,
    channel_id  TEXT NOT NULL,
    sender_id   TEXT NOT NULL,
    text        TEXT NOT NULL,
    timestamp   TEXT NOT NULL,
    attachments TEXT NOT NULL DEFAULT '[]',
    metadata    TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_messages_chat_ts ON messages (chat_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages (sender_id);

CREATE TABLE IF NOT EXISTS agent_runs (
    run_id         TEXT PRIMARY KEY NOT NULL,
    chat_id        TEXT NOT NULL,
    channel_id     TEXT NOT NULL,
    requested_by   TEXT NOT NULL,
    status         TEXT NOT NULL,
    started_at     TEXT,
    finished_at    TEXT,
    steps_executed INTEGER NOT NULL DEFAULT 0,
    tools_called   TEXT NOT NULL DEFAULT '[]',
    output_text    TEXT,
    summary        TEXT,
    error          TEXT
);
CREATE INDEX IF NOT EXISTS idx_runs_chat ON agent_runs (chat_id);
CREATE INDEX IF NOT EXISTS idx_runs_status ON agent_runs (status);

CREATE TABLE IF NOT EXISTS events (
    id      INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id  TEXT,
    seq     INTEGER NOT NULL,
    type    TEXT NOT NULL,
    payload TEXT NOT NULL DEFAULT '{}',
    ts      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_run_seq ON events (run_id, seq);
CREATE INDEX IF NOT EXISTS idx_events_seq ON events (seq);
"#;

/// SQLite-backed, thread-safe repository.
pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open (or create) the database at `path` and initialise the schema.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        // WAL improves concurrent read behavior.  `PRAGMA journal_mode`
        // returns a result row, so query_row rather than execute_batch.
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database — used by tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ─── Column helpers ───────────────────────────────────────────────────────────

fn enum_to_str<T: serde::Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        Value::String(s) => Ok(s),
        other => Err(RepositoryError::InvalidValue(other.to_string())),
    }
}

fn enum_from_str<T: DeserializeOwned>(s: &str) -> Result<T> {
    Ok(serde_json::from_value(Value::String(s.to_owned()))?)
}

fn ts_to_str(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn ts_from_str(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::InvalidValue(format!("timestamp {s}: {e}")))
}

fn opt_ts_from_str(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|v| ts_from_str(&v)).transpose()
}

fn json_from_str(s: &str) -> Result<Value> {
    Ok(serde_json::from_str(s)?)
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<(Message, String, String, String)> {
    Ok((
        Message {
            msg_id: row.get(0)?,
            chat_id: row.get(1)?,
            channel_id: row.get(2)?,
            sender_id: row.get(3)?,
            text: row.get(4)?,
            timestamp: Utc::now(), // patched from the raw column below
            attachments: Vec::new(),
            metadata: Value::Null,
        },
        row.get::<_, String>(5)?,
        row.get::<_, String>(6)?,
        row.get::<_, String>(7)?,
    ))
}

// ─── Repository impl ──────────────────────────────────────────────────────────

#[async_trait]
impl Repository for SqliteRepository {
    async fn upsert_channel(&self, channel: &Channel) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO channels (id, type, status, config, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
               type = excluded.type,
               status = excluded.status,
               config = excluded.config,
               last_seen = excluded.last_seen",
            params![
                channel.id,
                enum_to_str(&channel.channel_type)?,
                enum_to_str(&channel.status)?,
                serde_json::to_string(&channel.config)?,
                channel.last_seen.as_ref().map(ts_to_str),
            ],
        )?;
        Ok(())
    }

    async fn list_channels(&self) -> Result<Vec<Channel>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT id, type, status, config, last_seen FROM channels ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;

        let mut channels = Vec::new();
        for row in rows {
            let (id, channel_type, status, config, last_seen) = row?;
            channels.push(Channel {
                id,
                channel_type: enum_from_str(&channel_type)?,
                status: enum_from_str(&status)?,
                config: json_from_str(&config)?,
                last_seen: opt_ts_from_str(last_seen)?,
            });
        }
        Ok(channels)
    }

    async fn upsert_chat(&self, chat: &Chat) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO chats (chat_id, channel_id, participants, metadata)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(chat_id) DO UPDATE SET
               channel_id = excluded.channel_id,
               participants = excluded.participants,
               metadata = excluded.metadata",
            params![
                chat.chat_id,
                chat.channel_id,
                serde_json::to_string(&chat.participants)?,
                serde_json::to_string(&chat.metadata)?,
            ],
        )?;
        Ok(())
    }

    async fn list_chats(&self, channel_id: Option<&str>) -> Result<Vec<Chat>> {
        let conn = self.lock();
        let (sql, filter) = match channel_id {
            Some(id) => (
                "SELECT chat_id, channel_id, participants, metadata FROM chats
                 WHERE channel_id = ?1 ORDER BY chat_id",
                Some(id.to_owned()),
            ),
            None => (
                "SELECT chat_id, channel_id, participants, metadata FROM chats ORDER BY chat_id",
                None,
            ),
        };
        let mut stmt = conn.prepare(sql)?;
        let map_row = |row: &Row<'_>| -> rusqlite::Result<(String, String, String, String)> {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        };
        let rows: Vec<(String, String, String, String)> = match filter {
            Some(id) => stmt
                .query_map(params![id], map_row)?
                .collect::<rusqlite::Result<_>>()?,
            None => stmt.query_map([], map_row)?.collect::<rusqlite::Result<_>>()?,
        };

        let mut chats = Vec::new();
        for (chat_id, channel_id, participants, metadata) in rows {
            chats.push(Chat {
                chat_id,
                channel_id,
                participants: serde_json::from_str(&participants)?,
                metadata: json_from_str(&metadata)?,
            });
        }
        Ok(chats)
    }

    async fn add_message(&self, message: &Message) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO messages
               (msg_id, chat_id, channel_id, sender_id, text, timestamp, attachments, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.msg_id,
                message.chat_id,
                message.channel_id,
                message.sender_id,
                message.text,
                ts_to_str(&message.timestamp),
                serde_json::to_string(&message.attachments)?,
                serde_json::to_string(&message.metadata)?,
            ],
        )?;
        Ok(())
    }

    async fn list_messages(&self, chat_id: &str, limit: usize) -> Result<Vec<Message>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT msg_id, chat_id, channel_id, sender_id, text, timestamp, attachments, metadata
             FROM messages WHERE chat_id = ?1
             ORDER BY timestamp DESC LIMIT ?2",
        )?;
        let rows: Vec<(Message, String, String, String)> = stmt
            .query_map(params![chat_id, limit as i64], row_to_message)?
            .collect::<rusqlite::Result<_>>()?;

        let mut messages = Vec::new();
        for (mut message, timestamp, attachments, metadata) in rows {
            message.timestamp = ts_from_str(&timestamp)?;
            message.attachments = serde_json::from_str(&attachments)?;
            message.metadata = json_from_str(&metadata)?;
            messages.push(message);
        }
        // Newest-first query; reverse to chronological.
        messages.reverse();
        Ok(messages)
    }

    async fn upsert_run(&self, run: &AgentRun) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO agent_runs
               (run_id, chat_id, channel_id, requested_by, status, started_at, finished_at,
                steps_executed, tools_called, output_text, summary, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(run_id) DO UPDATE SET
               status = excluded.status,
               started_at = excluded.started_at,
               finished_at = excluded.finished_at,
               steps_executed = excluded.steps_executed,
               tools_called = excluded.tools_called,
               output_text = excluded.output_text,
               summary = excluded.summary,
               error = excluded.error",
            params![
                run.run_id,
                run.chat_id,
                run.channel_id,
                run.requested_by,
                run.status.as_str(),
                run.started_at.as_ref().map(ts_to_str),
                run.finished_at.as_ref().map(ts_to_str),
                run.steps_executed,
                serde_json::to_string(&run.tools_called)?,
                run.output_text,
                run.summary,
                run.error,
            ],
        )?;
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<AgentRun>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT run_id, chat_id, channel_id, requested_by, status, started_at,
                        finished_at, steps_executed, tools_called, output_text, summary, error
                 FROM agent_runs WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, u32>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, Option<String>>(9)?,
                        row.get::<_, Option<String>>(10)?,
                        row.get::<_, Option<String>>(11)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            run_id,
            chat_id,
            channel_id,
            requested_by,
            status,
            started_at,
            finished_at,
            steps_executed,
            tools_called,
            output_text,
            summary,
            error,
        )) = row
        else {
            return Ok(None);
        };

        Ok(Some(AgentRun {
            run_id,
            chat_id,
            channel_id,
            requested_by,
            status: enum_from_str(&status)?,
            started_at: opt_ts_from_str(started_at)?,
            finished_at: opt_ts_from_str(finished_at)?,
            steps_executed,
            tools_called: serde_json::from_str(&tools_called)?,
            output_text,
            summary,
            error,
        }))
    }

    async fn add_event(&self, event: &Event) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO events (run_id, seq, type, payload, ts) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.run_id,
                event.seq as i64,
                event.event_type.as_str(),
                serde_json::to_string(&event.payload)?,
                ts_to_str(&event.ts),
            ],
        )?;
        Ok(())
    }

    async fn tail_events(
        &self,
        run_id: Option<&str>,
        after_seq: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Event>> {
        let conn = self.lock();

        let mut sql =
            String::from("SELECT run_id, seq, type, payload, ts FROM events");
        let mut clauses: Vec<&str> = Vec::new();
        let mut args: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(rid) = run_id {
            clauses.push("run_id = ?");
            args.push(rid.to_owned().into());
        }
        if let Some(seq) = after_seq {
            clauses.push("seq > ?");
            args.push((seq as i64).into());
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY seq DESC LIMIT ?");
        args.push((limit as i64).into());

        let mut stmt = conn.prepare(&sql)?;
        let rows: Vec<(Option<String>, i64, String, String, String)> = stmt
            .query_map(rusqlite::params_from_iter(args), |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;

        let mut events = Vec::new();
        for (run_id, seq, event_type, payload, ts) in rows {
            let event_type = EventType::parse(&event_type)
                .ok_or_else(|| RepositoryError::InvalidValue(event_type.clone()))?;
            events.push(Event {
                run_id,
                seq: seq as u64,
                event_type,
                payload: json_from_str(&payload)?,
                ts: ts_from_str(&ts)?,
            });
        }
        // Newest-first query; reverse so the tail reads in seq order.
        events.reverse();
        Ok(events)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChannelStatus, ChannelType, RunStatus, gen_id};
    use chrono::Duration;
    use serde_json::json;

    fn repo() -> SqliteRepository {
        SqliteRepository::in_memory().unwrap()
    }

    fn message(chat_id: &str, text: &str, ts: DateTime<Utc>) -> Message {
        Message {
            msg_id: gen_id("msg"),
            chat_id: chat_id.to_owned(),
            channel_id: "webchat-1".to_owned(),
            sender_id: "u1".to_owned(),
            text: text.to_owned(),
            timestamp: ts,
            attachments: vec![],
            metadata: json!({}),
        }
    }

    fn event(bus_seq: u64, run_id: Option<&str>) -> Event {
        Event {
            run_id: run_id.map(str::to_owned),
            seq: bus_seq,
            event_type: EventType::RunProgress,
            payload: json!({ "seq": bus_seq }),
            ts: Utc::now(),
        }
    }

    #[tokio::test]
    async fn channel_upsert_round_trips() {
        let repo = repo();
        let mut ch = Channel::new("webchat-1", ChannelType::Webchat);
        repo.upsert_channel(&ch).await.unwrap();

        ch.status = ChannelStatus::Ready;
        ch.last_seen = Some(Utc::now());
        repo.upsert_channel(&ch).await.unwrap();

        let channels = repo.list_channels().await.unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].status, ChannelStatus::Ready);
        assert!(channels[0].last_seen.is_some());
    }

    #[tokio::test]
    async fn chats_filter_by_channel() {
        let repo = repo();
        for (chat, channel) in [("c1", "webchat-1"), ("c2", "telegram-1")] {
            repo.upsert_chat(&Chat {
                chat_id: chat.to_owned(),
                channel_id: channel.to_owned(),
                participants: vec!["u1".to_owned()],
                metadata: json!({}),
            })
            .await
            .unwrap();
        }
        assert_eq!(repo.list_chats(None).await.unwrap().len(), 2);
        let filtered = repo.list_chats(Some("webchat-1")).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].chat_id, "c1");
    }

    #[tokio::test]
    async fn messages_return_chronological_window() {
        let repo = repo();
        let base = Utc::now();
        for i in 0..5 {
            repo.add_message(&message("c1", &format!("m{i}"), base + Duration::seconds(i)))
                .await
                .unwrap();
        }

        let recent = repo.list_messages("c1", 3).await.unwrap();
        let texts: Vec<&str> = recent.iter().map(|m| m.text.as_str()).collect();
        // Last three messages, oldest of the window first.
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn run_upsert_and_get() {
        let repo = repo();
        let mut run = AgentRun::queued("c1", "webchat-1", "u1");
        repo.upsert_run(&run).await.unwrap();

        run.status = RunStatus::Completed;
        run.started_at = Some(Utc::now());
        run.finished_at = Some(Utc::now());
        run.output_text = Some("done".to_owned());
        run.tools_called = vec!["core.echo".to_owned()];
        run.steps_executed = 2;
        repo.upsert_run(&run).await.unwrap();

        let stored = repo.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert_eq!(stored.output_text.as_deref(), Some("done"));
        assert_eq!(stored.tools_called, vec!["core.echo"]);
        assert_eq!(stored.steps_executed, 2);
        assert!(stored.finished_at.unwrap() >= stored.started_at.unwrap());
    }

    #[tokio::test]
    async fn get_missing_run_is_none() {
        assert!(repo().get_run("run_missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tail_events_filters_and_orders() {
        let repo = repo();
        for seq in 1..=10u64 {
            let run = if seq % 2 == 0 { Some("run_a") } else { None };
            repo.add_event(&event(seq, run)).await.unwrap();
        }

        // Scoped to run_a, after seq 4 → 6, 8, 10 ascending.
        let tail = repo
            .tail_events(Some("run_a"), Some(4), 200)
            .await
            .unwrap();
        let seqs: Vec<u64> = tail.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![6, 8, 10]);

        // Limit keeps the newest window.
        let tail = repo.tail_events(None, None, 3).await.unwrap();
        let seqs: Vec<u64> = tail.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![8, 9, 10]);
    }
}
