use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::{mpsc, oneshot};

use crate::core::error::IndexError;
use crate::core::models::{
    Attachment, AttachmentListing, DomainCount, IndexStats, Record, RecordSummary, SenderCount,
    TimelineBucket, TimelineGrouping,
};
use crate::core::pattern::extract_address;

/// Schema DDL run on open.
///
/// `emails_fts` is an external-content FTS5 table kept in step with `emails`
/// by triggers, so a row and its full-text projection change in the same
/// statement.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS emails (
    pk INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    thread_id TEXT NOT NULL DEFAULT '',
    from_raw TEXT NOT NULL DEFAULT '',
    from_email TEXT NOT NULL DEFAULT '',
    from_name TEXT NOT NULL DEFAULT '',
    from_domain TEXT NOT NULL DEFAULT '',
    to_emails TEXT NOT NULL DEFAULT '[]',
    cc_emails TEXT NOT NULL DEFAULT '[]',
    subject TEXT NOT NULL DEFAULT '',
    date_header TEXT NOT NULL DEFAULT '',
    snippet TEXT NOT NULL DEFAULT '',
    body TEXT NOT NULL DEFAULT '',
    body_html TEXT NOT NULL DEFAULT '',
    reply_text TEXT,
    label_ids TEXT NOT NULL DEFAULT '[]',
    timestamp INTEGER NOT NULL DEFAULT 0,
    size_estimate INTEGER NOT NULL DEFAULT 0,
    has_attachments INTEGER NOT NULL DEFAULT 0,
    parse_warnings TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_emails_from_email ON emails(from_email);
CREATE INDEX IF NOT EXISTS idx_emails_from_domain ON emails(from_domain);
CREATE INDEX IF NOT EXISTS idx_emails_timestamp ON emails(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_emails_thread ON emails(thread_id);

CREATE TABLE IF NOT EXISTS attachments (
    message_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    attachment_id TEXT NOT NULL DEFAULT '',
    filename TEXT NOT NULL DEFAULT '',
    mime_type TEXT NOT NULL DEFAULT '',
    size INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (message_id, position)
);

CREATE INDEX IF NOT EXISTS idx_attachments_mime ON attachments(mime_type);

CREATE VIRTUAL TABLE IF NOT EXISTS emails_fts USING fts5(
    subject,
    body,
    from_email,
    from_name,
    content='emails',
    content_rowid='pk'
);

CREATE TRIGGER IF NOT EXISTS emails_ai AFTER INSERT ON emails BEGIN
    INSERT INTO emails_fts(rowid, subject, body, from_email, from_name)
    VALUES (new.pk, new.subject, new.body, new.from_email, new.from_name);
END;

CREATE TRIGGER IF NOT EXISTS emails_ad AFTER DELETE ON emails BEGIN
    INSERT INTO emails_fts(emails_fts, rowid, subject, body, from_email, from_name)
    VALUES ('delete', old.pk, old.subject, old.body, old.from_email, old.from_name);
END;

CREATE TRIGGER IF NOT EXISTS emails_au AFTER UPDATE ON emails BEGIN
    INSERT INTO emails_fts(emails_fts, rowid, subject, body, from_email, from_name)
    VALUES ('delete', old.pk, old.subject, old.body, old.from_email, old.from_name);
    INSERT INTO emails_fts(rowid, subject, body, from_email, from_name)
    VALUES (new.pk, new.subject, new.body, new.from_email, new.from_name);
END;
";

const UPSERT: &str = "
INSERT INTO emails (
    id, thread_id, from_raw, from_email, from_name, from_domain, to_emails, cc_emails,
    subject, date_header, snippet, body, body_html, reply_text, label_ids, timestamp,
    size_estimate, has_attachments, parse_warnings
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
ON CONFLICT(id) DO UPDATE SET
    thread_id = excluded.thread_id,
    from_raw = excluded.from_raw,
    from_email = excluded.from_email,
    from_name = excluded.from_name,
    from_domain = excluded.from_domain,
    to_emails = excluded.to_emails,
    cc_emails = excluded.cc_emails,
    subject = excluded.subject,
    date_header = excluded.date_header,
    snippet = excluded.snippet,
    body = excluded.body,
    body_html = excluded.body_html,
    reply_text = excluded.reply_text,
    label_ids = excluded.label_ids,
    timestamp = excluded.timestamp,
    size_estimate = excluded.size_estimate,
    has_attachments = excluded.has_attachments,
    parse_warnings = excluded.parse_warnings
";

const SUMMARY_COLUMNS: &str =
    "e.id, e.thread_id, e.from_raw, e.subject, e.snippet, e.timestamp, e.has_attachments";

// ---------------------------------------------------------------------------
// Commands sent from async world → background thread
// ---------------------------------------------------------------------------

type Reply<T> = oneshot::Sender<Result<T, IndexError>>;

enum IndexCmd {
    Ingest {
        record: Box<Record>,
        reply: Reply<bool>,
    },
    Get {
        id: String,
        reply: Reply<Record>,
    },
    Remove {
        id: String,
        reply: Reply<bool>,
    },
    Search {
        text: String,
        limit: usize,
        reply: Reply<Vec<RecordSummary>>,
    },
    Stats {
        top_n: usize,
        reply: Reply<IndexStats>,
    },
    ListByDomain {
        domain: String,
        limit: usize,
        reply: Reply<Vec<RecordSummary>>,
    },
    ListBySender {
        email: String,
        limit: usize,
        reply: Reply<Vec<RecordSummary>>,
    },
    Attachments {
        mime_filter: Option<String>,
        reply: Reply<Vec<AttachmentListing>>,
    },
    IdsMissingBody {
        reply: Reply<Vec<String>>,
    },
    Timeline {
        grouping: TimelineGrouping,
        limit: usize,
        reply: Reply<Vec<TimelineBucket>>,
    },
    Clear {
        reply: Reply<()>,
    },
}

// ---------------------------------------------------------------------------
// IndexHandle: Clone + Send + Sync async facade
// ---------------------------------------------------------------------------

/// Handle to the indexed store. All statements run on one background thread
/// that owns the connection, so ingests are serialized.
#[derive(Clone)]
pub struct IndexHandle {
    tx: mpsc::UnboundedSender<IndexCmd>,
}

impl IndexHandle {
    /// Open (or create) the database and spawn the background thread.
    pub fn open(db_file: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = db_file.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_file)?;
        conn.execute_batch(SCHEMA)?;

        let (tx, rx) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name("mailmirror-index".into())
            .spawn(move || Self::run_loop(conn, rx))?;

        Ok(IndexHandle { tx })
    }

    // -- async methods -------------------------------------------------------

    async fn call<T>(&self, cmd: impl FnOnce(Reply<T>) -> IndexCmd) -> Result<T, IndexError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(cmd(reply))
            .map_err(|_| IndexError::Unavailable)?;
        rx.await.map_err(|_| IndexError::Unavailable)?
    }

    /// Upsert keyed by `record.id`. Returns true when the row is new.
    pub async fn ingest(&self, record: Record) -> Result<bool, IndexError> {
        self.call(|reply| IndexCmd::Ingest {
            record: Box::new(record),
            reply,
        })
        .await
    }

    pub async fn get(&self, id: &str) -> Result<Record, IndexError> {
        let id = id.to_string();
        self.call(|reply| IndexCmd::Get { id, reply }).await
    }

    pub async fn remove(&self, id: &str) -> Result<bool, IndexError> {
        let id = id.to_string();
        self.call(|reply| IndexCmd::Remove { id, reply }).await
    }

    /// Full-text search over subject, body and sender. Best match first,
    /// newest first among equals.
    pub async fn search(&self, text: &str, limit: usize) -> Result<Vec<RecordSummary>, IndexError> {
        let text = text.to_string();
        self.call(|reply| IndexCmd::Search { text, limit, reply })
            .await
    }

    pub async fn stats(&self, top_n: usize) -> Result<IndexStats, IndexError> {
        self.call(|reply| IndexCmd::Stats { top_n, reply }).await
    }

    pub async fn list_by_domain(
        &self,
        domain: &str,
        limit: usize,
    ) -> Result<Vec<RecordSummary>, IndexError> {
        let domain = domain.trim_start_matches('@').to_lowercase();
        self.call(|reply| IndexCmd::ListByDomain {
            domain,
            limit,
            reply,
        })
        .await
    }

    pub async fn list_by_sender(
        &self,
        email: &str,
        limit: usize,
    ) -> Result<Vec<RecordSummary>, IndexError> {
        let email = extract_address(email);
        self.call(|reply| IndexCmd::ListBySender {
            email,
            limit,
            reply,
        })
        .await
    }

    /// Attachment metadata, optionally restricted to a MIME type prefix
    /// such as `image/` or `application/pdf`.
    pub async fn attachments(
        &self,
        mime_filter: Option<&str>,
    ) -> Result<Vec<AttachmentListing>, IndexError> {
        let mime_filter = mime_filter.map(|m| m.to_lowercase());
        self.call(|reply| IndexCmd::Attachments { mime_filter, reply })
            .await
    }

    /// Ids whose stored body is empty; candidates for a forced re-fetch.
    pub async fn ids_missing_body(&self) -> Result<Vec<String>, IndexError> {
        self.call(|reply| IndexCmd::IdsMissingBody { reply }).await
    }

    /// Message volume per period, newest period first.
    pub async fn timeline(
        &self,
        grouping: TimelineGrouping,
        limit: usize,
    ) -> Result<Vec<TimelineBucket>, IndexError> {
        self.call(|reply| IndexCmd::Timeline {
            grouping,
            limit,
            reply,
        })
        .await
    }

    pub async fn clear(&self) -> Result<(), IndexError> {
        self.call(|reply| IndexCmd::Clear { reply }).await
    }

    // -- background thread ---------------------------------------------------

    fn run_loop(conn: Connection, mut rx: mpsc::UnboundedReceiver<IndexCmd>) {
        while let Some(cmd) = rx.blocking_recv() {
            match cmd {
                IndexCmd::Ingest { record, reply } => {
                    let _ = reply.send(Self::do_ingest(&conn, &record));
                }
                IndexCmd::Get { id, reply } => {
                    let _ = reply.send(Self::do_get(&conn, &id));
                }
                IndexCmd::Remove { id, reply } => {
                    let _ = reply.send(Self::do_remove(&conn, &id));
                }
                IndexCmd::Search { text, limit, reply } => {
                    let _ = reply.send(Self::do_search(&conn, &text, limit));
                }
                IndexCmd::Stats { top_n, reply } => {
                    let _ = reply.send(Self::do_stats(&conn, top_n));
                }
                IndexCmd::ListByDomain {
                    domain,
                    limit,
                    reply,
                } => {
                    let _ = reply.send(Self::do_list_where(&conn, "e.from_domain", &domain, limit));
                }
                IndexCmd::ListBySender {
                    email,
                    limit,
                    reply,
                } => {
                    let _ = reply.send(Self::do_list_where(&conn, "e.from_email", &email, limit));
                }
                IndexCmd::Attachments { mime_filter, reply } => {
                    let _ = reply.send(Self::do_attachments(&conn, mime_filter.as_deref()));
                }
                IndexCmd::IdsMissingBody { reply } => {
                    let _ = reply.send(Self::do_ids_missing_body(&conn));
                }
                IndexCmd::Timeline {
                    grouping,
                    limit,
                    reply,
                } => {
                    let _ = reply.send(Self::do_timeline(&conn, grouping, limit));
                }
                IndexCmd::Clear { reply } => {
                    let _ = reply.send(Self::do_clear(&conn));
                }
            }
        }
        log::debug!("Index thread exiting");
    }

    // -- synchronous DB operations -------------------------------------------

    fn do_ingest(conn: &Connection, record: &Record) -> Result<bool, IndexError> {
        let (from_email, from_name, from_domain) = sender_parts(&record.from);

        let tx = conn.unchecked_transaction()?;
        let existed = tx
            .query_row("SELECT 1 FROM emails WHERE id = ?1", [&record.id], |_| Ok(()))
            .optional()?
            .is_some();

        tx.execute(
            UPSERT,
            params![
                record.id,
                record.thread_id,
                record.from,
                from_email,
                from_name,
                from_domain,
                serde_json::to_string(&record.to)?,
                serde_json::to_string(&record.cc)?,
                record.subject,
                record.date,
                record.snippet,
                record.body_text,
                record.body_html,
                record.reply_text,
                serde_json::to_string(&record.label_ids)?,
                record.timestamp,
                record.size_estimate as i64,
                record.has_attachments(),
                serde_json::to_string(&record.parse_warnings)?,
            ],
        )?;

        tx.execute("DELETE FROM attachments WHERE message_id = ?1", [&record.id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO attachments
                 (message_id, position, attachment_id, filename, mime_type, size)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (position, att) in record.attachments.iter().enumerate() {
                stmt.execute(params![
                    record.id,
                    position as i64,
                    att.attachment_id,
                    att.filename,
                    att.mime_type,
                    att.size as i64,
                ])?;
            }
        }

        tx.commit()?;
        Ok(!existed)
    }

    fn do_get(conn: &Connection, id: &str) -> Result<Record, IndexError> {
        let row = conn
            .query_row(
                "SELECT id, thread_id, from_raw, to_emails, cc_emails, subject, date_header,
                        snippet, body, body_html, reply_text, label_ids, timestamp,
                        size_estimate, parse_warnings
                 FROM emails WHERE id = ?1",
                [id],
                StoredRow::from_row,
            )
            .optional()?
            .ok_or_else(|| IndexError::NotFound(id.to_string()))?;

        let mut stmt = conn.prepare(
            "SELECT attachment_id, message_id, filename, mime_type, size
             FROM attachments WHERE message_id = ?1 ORDER BY position",
        )?;
        let attachments = stmt
            .query_map([id], attachment_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        row.into_record(attachments)
    }

    fn do_remove(conn: &Connection, id: &str) -> Result<bool, IndexError> {
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM attachments WHERE message_id = ?1", [id])?;
        let n = tx.execute("DELETE FROM emails WHERE id = ?1", [id])?;
        tx.commit()?;
        Ok(n > 0)
    }

    fn do_search(conn: &Connection, text: &str, limit: usize) -> Result<Vec<RecordSummary>, IndexError> {
        let query = prepare_fts_query(text);
        log::debug!("FTS search: '{}' -> '{}'", text, query);
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT {SUMMARY_COLUMNS}
             FROM emails_fts JOIN emails e ON e.pk = emails_fts.rowid
             WHERE emails_fts MATCH ?1
             ORDER BY emails_fts.rank, e.timestamp DESC, e.id
             LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![query, limit as i64], summary_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn do_stats(conn: &Connection, top_n: usize) -> Result<IndexStats, IndexError> {
        let (total, threads, unique_domains, oldest, newest): (i64, i64, i64, Option<i64>, Option<i64>) =
            conn.query_row(
                "SELECT COUNT(*),
                        COUNT(DISTINCT NULLIF(thread_id, '')),
                        COUNT(DISTINCT NULLIF(from_domain, '')),
                        MIN(timestamp),
                        MAX(timestamp)
                 FROM emails",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )?;

        let mut stmt = conn.prepare(
            "SELECT from_email, MAX(from_name), COUNT(*) AS n
             FROM emails WHERE from_email != ''
             GROUP BY from_email
             ORDER BY n DESC, from_email
             LIMIT ?1",
        )?;
        let top_senders = stmt
            .query_map([top_n as i64], |row| {
                Ok(SenderCount {
                    email: row.get(0)?,
                    name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    count: row.get::<_, i64>(2)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT from_domain, COUNT(*) AS n
             FROM emails WHERE from_domain != ''
             GROUP BY from_domain
             ORDER BY n DESC, from_domain
             LIMIT ?1",
        )?;
        let top_domains = stmt
            .query_map([top_n as i64], |row| {
                Ok(DomainCount {
                    domain: row.get(0)?,
                    count: row.get::<_, i64>(1)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(IndexStats {
            total: total as u64,
            threads: threads as u64,
            unique_domains: unique_domains as u64,
            top_senders,
            top_domains,
            date_range: oldest.zip(newest),
        })
    }

    fn do_list_where(
        conn: &Connection,
        column: &str,
        value: &str,
        limit: usize,
    ) -> Result<Vec<RecordSummary>, IndexError> {
        let sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM emails e
             WHERE {column} = ?1
             ORDER BY e.timestamp DESC, e.id
             LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![value, limit as i64], summary_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn do_attachments(
        conn: &Connection,
        mime_filter: Option<&str>,
    ) -> Result<Vec<AttachmentListing>, IndexError> {
        let mut stmt = conn.prepare(
            "SELECT a.attachment_id, a.message_id, a.filename, a.mime_type, a.size,
                    e.subject, e.from_raw, e.timestamp
             FROM attachments a JOIN emails e ON e.id = a.message_id
             WHERE ?1 IS NULL OR substr(lower(a.mime_type), 1, length(?1)) = ?1
             ORDER BY e.timestamp DESC, a.message_id, a.position",
        )?;
        let rows = stmt
            .query_map([mime_filter], |row| {
                Ok(AttachmentListing {
                    attachment: attachment_from_row(row)?,
                    subject: row.get(5)?,
                    from: row.get(6)?,
                    timestamp: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn do_ids_missing_body(conn: &Connection) -> Result<Vec<String>, IndexError> {
        let mut stmt = conn.prepare(
            "SELECT id FROM emails
             WHERE body = '' AND body_html = ''
             ORDER BY timestamp DESC, id",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    fn do_timeline(
        conn: &Connection,
        grouping: TimelineGrouping,
        limit: usize,
    ) -> Result<Vec<TimelineBucket>, IndexError> {
        let format = match grouping {
            TimelineGrouping::Day => "%Y-%m-%d",
            TimelineGrouping::Week => "%Y-W%W",
            TimelineGrouping::Month => "%Y-%m",
        };
        let mut stmt = conn.prepare(
            "SELECT strftime(?1, timestamp / 1000, 'unixepoch') AS period, COUNT(*)
             FROM emails
             GROUP BY period
             ORDER BY period DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![format, limit as i64], |row| {
                Ok(TimelineBucket {
                    period: row.get(0)?,
                    count: row.get::<_, i64>(1)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn do_clear(conn: &Connection) -> Result<(), IndexError> {
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM attachments", [])?;
        tx.execute("DELETE FROM emails", [])?;
        tx.commit()?;
        Ok(())
    }
}

/// Columns of one `emails` row, before the JSON columns are decoded.
struct StoredRow {
    id: String,
    thread_id: String,
    from: String,
    to: String,
    cc: String,
    subject: String,
    date: String,
    snippet: String,
    body_text: String,
    body_html: String,
    reply_text: Option<String>,
    label_ids: String,
    timestamp: i64,
    size_estimate: i64,
    parse_warnings: String,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(StoredRow {
            id: row.get(0)?,
            thread_id: row.get(1)?,
            from: row.get(2)?,
            to: row.get(3)?,
            cc: row.get(4)?,
            subject: row.get(5)?,
            date: row.get(6)?,
            snippet: row.get(7)?,
            body_text: row.get(8)?,
            body_html: row.get(9)?,
            reply_text: row.get(10)?,
            label_ids: row.get(11)?,
            timestamp: row.get(12)?,
            size_estimate: row.get(13)?,
            parse_warnings: row.get(14)?,
        })
    }

    fn into_record(self, attachments: Vec<Attachment>) -> Result<Record, IndexError> {
        Ok(Record {
            id: self.id,
            thread_id: self.thread_id,
            label_ids: serde_json::from_str(&self.label_ids)?,
            from: self.from,
            to: serde_json::from_str(&self.to)?,
            cc: serde_json::from_str(&self.cc)?,
            subject: self.subject,
            date: self.date,
            snippet: self.snippet,
            body_text: self.body_text,
            body_html: self.body_html,
            reply_text: self.reply_text,
            timestamp: self.timestamp,
            size_estimate: self.size_estimate.max(0) as u64,
            attachments,
            parse_warnings: serde_json::from_str(&self.parse_warnings)?,
        })
    }
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<RecordSummary> {
    Ok(RecordSummary {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        from: row.get(2)?,
        subject: row.get(3)?,
        snippet: row.get(4)?,
        timestamp: row.get(5)?,
        has_attachments: row.get(6)?,
    })
}

fn attachment_from_row(row: &Row<'_>) -> rusqlite::Result<Attachment> {
    Ok(Attachment {
        attachment_id: row.get(0)?,
        message_id: row.get(1)?,
        filename: row.get(2)?,
        mime_type: row.get(3)?,
        size: row.get::<_, i64>(4)?.max(0) as u64,
    })
}

/// Split a `From` header into (address, display name, domain).
/// The address and domain are lower-cased.
pub(crate) fn sender_parts(from: &str) -> (String, String, String) {
    let email = extract_address(from);
    let name = match from.find('<') {
        Some(open) => from[..open].trim().trim_matches('"').trim().to_string(),
        None => String::new(),
    };
    let domain = email
        .rsplit_once('@')
        .map(|(_, d)| d.to_string())
        .unwrap_or_default();
    (email, name, domain)
}

/// Turn free text into an FTS5 query: each word becomes a quoted prefix
/// term, so operators and punctuation in user input are matched literally.
fn prepare_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .filter(|word| word.chars().any(char::is_alphanumeric))
        .map(|word| format!("\"{}\"*", word.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}
