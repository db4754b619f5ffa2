//! The event store: a single SQLite file with the primary indices the
//! query paths need. Reads go through the pool concurrently; writes are
//! serialized by the ingest pipeline's writer lease.

use std::collections::HashSet;
use std::path::Path;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::debug;

use crate::error::Result;
use crate::event::{self, Event};
use crate::filter::Filter;
use crate::now_unix;

pub const DB_FILE: &str = "relay.db";

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY,
        pubkey TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        kind INTEGER NOT NULL,
        tags TEXT NOT NULL,
        content TEXT NOT NULL,
        sig TEXT NOT NULL,
        received_at INTEGER NOT NULL,
        expires_at INTEGER,
        d_tag TEXT NOT NULL DEFAULT ''
    )",
    "CREATE INDEX IF NOT EXISTS events_pubkey ON events (pubkey)",
    "CREATE INDEX IF NOT EXISTS events_kind ON events (kind)",
    "CREATE INDEX IF NOT EXISTS events_created_at ON events (created_at DESC)",
    "CREATE INDEX IF NOT EXISTS events_pubkey_kind ON events (pubkey, kind)",
];

#[derive(Debug, PartialEq)]
pub enum PutOutcome {
    Stored,
    /// The same id is already present.
    Duplicate,
    /// A newer event holds this replaceable slot.
    Stale,
}

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(data_dir: &Path) -> Result<Store> {
        std::fs::create_dir_all(data_dir)?;
        let options = SqliteConnectOptions::new()
            .filename(data_dir.join(DB_FILE))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Store { pool })
    }

    /// Inserts an event, displacing any replaceable predecessor in the same
    /// transaction. The caller decides what to do with a `Stale` outcome.
    pub async fn put(&self, event: &Event) -> Result<PutOutcome> {
        let mut tx = self.pool.begin().await?;

        if event::is_replaceable(event.kind) || event::is_param_replaceable(event.kind) {
            let holder = if event::is_param_replaceable(event.kind) {
                sqlx::query("SELECT id, created_at FROM events WHERE pubkey = ? AND kind = ? AND d_tag = ?")
                    .bind(&event.pubkey)
                    .bind(event.kind as i64)
                    .bind(event.d_tag())
                    .fetch_optional(&mut *tx)
                    .await?
            } else {
                sqlx::query("SELECT id, created_at FROM events WHERE pubkey = ? AND kind = ?")
                    .bind(&event.pubkey)
                    .bind(event.kind as i64)
                    .fetch_optional(&mut *tx)
                    .await?
            };
            if let Some(row) = holder {
                let held_id: String = row.try_get("id")?;
                let held_created_at: i64 = row.try_get("created_at")?;
                // Newest created_at wins; ties go to the smaller id.
                if held_created_at > event.created_at
                    || (held_created_at == event.created_at && held_id <= event.id)
                {
                    return Ok(if held_id == event.id {
                        PutOutcome::Duplicate
                    } else {
                        PutOutcome::Stale
                    });
                }
                sqlx::query("DELETE FROM events WHERE id = ?")
                    .bind(&held_id)
                    .execute(&mut *tx)
                    .await?;
                debug!("replaced {} with {}", held_id, event.id);
            }
        }

        let inserted = sqlx::query(
            "INSERT INTO events (id, pubkey, created_at, kind, tags, content, sig, received_at, expires_at, d_tag)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&event.id)
        .bind(&event.pubkey)
        .bind(event.created_at)
        .bind(event.kind as i64)
        .bind(serde_json::to_string(&event.tags).unwrap_or_default())
        .bind(&event.content)
        .bind(&event.sig)
        .bind(event.received_at)
        .bind(event.expiration())
        .bind(event.d_tag())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(if inserted.rows_affected() == 0 {
            PutOutcome::Duplicate
        } else {
            PutOutcome::Stored
        })
    }

    /// Removes the given ids, but only rows authored by `author`.
    pub async fn delete_by_author(&self, author: &str, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM events WHERE pubkey = ");
        qb.push_bind(author.to_string());
        qb.push(" AND id IN (");
        let mut sep = qb.separated(", ");
        for id in ids {
            sep.push_bind(id.clone());
        }
        qb.push(")");
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    /// Backfill for a filter disjunction: newest first, deduplicated by id,
    /// capped at `min(filter.limit, global_limit)` per filter. Expired
    /// events are never returned.
    pub async fn query(&self, filters: &[Filter], global_limit: usize) -> Result<Vec<Event>> {
        self.query_at(filters, global_limit, now_unix()).await
    }

    pub(crate) async fn query_at(
        &self,
        filters: &[Filter],
        global_limit: usize,
        now: i64,
    ) -> Result<Vec<Event>> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut merged: Vec<Event> = Vec::new();
        for filter in filters {
            let cap = filter.limit.map_or(global_limit, |l| l.min(global_limit));
            if cap == 0 {
                continue;
            }
            let mut matched = 0usize;
            for event in self.select_candidates(filter, cap, now).await? {
                if !filter.matches(&event) {
                    continue;
                }
                matched += 1;
                if seen.insert(event.id.clone()) {
                    merged.push(event);
                }
                if matched >= cap {
                    break;
                }
            }
        }
        merged.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(merged)
    }

    /// NIP-45: number of distinct events the disjunction matches, with the
    /// same matching rules as `query` but no ordering or limits.
    pub async fn count(&self, filters: &[Filter]) -> Result<u64> {
        let now = now_unix();
        let mut seen: HashSet<String> = HashSet::new();
        for filter in filters {
            for event in self.select_all_candidates(filter, now).await? {
                if filter.matches(&event) {
                    seen.insert(event.id);
                }
            }
        }
        Ok(seen.len() as u64)
    }

    pub async fn total_events(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }

    /// Drops rows whose expiration has passed. Run at operator discretion.
    pub async fn purge_expired(&self) -> Result<u64> {
        let purged = sqlx::query("DELETE FROM events WHERE expires_at IS NOT NULL AND expires_at <= ?")
            .bind(now_unix())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(purged)
    }

    /// One filter's SQL pushdown: kinds, ids/authors (exact or prefix),
    /// since/until and the limit all travel into the statement; tag and
    /// search constraints are post-filtered by `Filter::matches`, so the
    /// limit is only pushed down when no post-scan is needed.
    async fn select_candidates(
        &self,
        filter: &Filter,
        cap: usize,
        now: i64,
    ) -> Result<Vec<Event>> {
        let mut qb = self.candidate_query(filter, now);
        if !filter.needs_post_scan() {
            qb.push(" LIMIT ");
            qb.push_bind(cap as i64);
        }
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_event).collect()
    }

    async fn select_all_candidates(&self, filter: &Filter, now: i64) -> Result<Vec<Event>> {
        let mut qb = self.candidate_query(filter, now);
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_event).collect()
    }

    fn candidate_query(&self, filter: &Filter, now: i64) -> QueryBuilder<'static, Sqlite> {
        let mut qb = QueryBuilder::new(
            "SELECT id, pubkey, created_at, kind, tags, content, sig, received_at \
             FROM events WHERE (expires_at IS NULL OR expires_at > ",
        );
        qb.push_bind(now);
        qb.push(")");
        if let Some(ids) = &filter.ids {
            push_hex_match(&mut qb, "id", ids);
        }
        if let Some(authors) = &filter.authors {
            push_hex_match(&mut qb, "pubkey", authors);
        }
        if let Some(kinds) = &filter.kinds {
            if kinds.is_empty() {
                qb.push(" AND 0");
            } else {
                qb.push(" AND kind IN (");
                let mut sep = qb.separated(", ");
                for kind in kinds {
                    sep.push_bind(*kind as i64);
                }
                qb.push(")");
            }
        }
        if let Some(since) = filter.since {
            qb.push(" AND created_at >= ");
            qb.push_bind(since);
        }
        if let Some(until) = filter.until {
            qb.push(" AND created_at <= ");
            qb.push_bind(until);
        }
        qb.push(" ORDER BY created_at DESC, id ASC");
        qb
    }
}

/// `column = value` for full 64-char hex, `LIKE 'prefix%'` for shorter
/// prefixes. Values outside the lowercase hex charset can never match a
/// hex column and must not reach LIKE, where a `%` or `_` would act as a
/// wildcard, flood the pushed-down limit window with false positives and
/// crowd out real matches; they contribute an always-false disjunct
/// instead, exactly as `Filter::matches` treats them.
fn push_hex_match(qb: &mut QueryBuilder<'static, Sqlite>, column: &str, values: &[String]) {
    if values.is_empty() {
        // An empty set matches nothing.
        qb.push(" AND 0");
        return;
    }
    qb.push(" AND (");
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            qb.push(" OR ");
        }
        if !event::is_hex_prefix(value) {
            qb.push("0");
        } else if value.len() == 64 {
            qb.push(column);
            qb.push(" = ");
            qb.push_bind(value.clone());
        } else {
            qb.push(column);
            qb.push(" LIKE ");
            qb.push_bind(format!("{value}%"));
        }
    }
    qb.push(")");
}

fn row_to_event(row: &SqliteRow) -> Result<Event> {
    let tags_json: String = row.try_get("tags")?;
    Ok(Event {
        id: row.try_get("id")?,
        pubkey: row.try_get("pubkey")?,
        created_at: row.try_get("created_at")?,
        kind: row.try_get::<i64, _>("kind")? as u16,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        content: row.try_get("content")?,
        sig: row.try_get("sig")?,
        received_at: row.try_get("received_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    async fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        (dir, store)
    }

    fn filter(json: serde_json::Value) -> Filter {
        serde_json::from_value(json).unwrap()
    }

    #[tokio::test]
    async fn put_then_query_round_trips() {
        let (_dir, store) = open_store().await;
        let (keys, pubkey) = testutil::keypair();
        let event = testutil::sign_event(&keys, 1, vec![], "hello", 100);
        assert_eq!(store.put(&event).await.unwrap(), PutOutcome::Stored);

        let found = store
            .query(&[filter(serde_json::json!({"authors": [pubkey]}))], 500)
            .await
            .unwrap();
        assert_eq!(found, vec![event]);
    }

    #[tokio::test]
    async fn duplicate_insert_is_reported() {
        let (_dir, store) = open_store().await;
        let (keys, _) = testutil::keypair();
        let event = testutil::sign_event(&keys, 1, vec![], "hello", 100);
        assert_eq!(store.put(&event).await.unwrap(), PutOutcome::Stored);
        assert_eq!(store.put(&event).await.unwrap(), PutOutcome::Duplicate);
        assert_eq!(store.total_events().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn replaceable_keeps_only_the_newest() {
        let (_dir, store) = open_store().await;
        let (keys, pubkey) = testutil::keypair();
        let old = testutil::sign_event(&keys, 0, vec![], "v1", 100);
        let new = testutil::sign_event(&keys, 0, vec![], "v2", 200);
        store.put(&old).await.unwrap();
        assert_eq!(store.put(&new).await.unwrap(), PutOutcome::Stored);

        let found = store
            .query(&[filter(serde_json::json!({"authors": [pubkey], "kinds": [0]}))], 500)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].content, "v2");
    }

    #[tokio::test]
    async fn stale_replaceable_is_rejected() {
        let (_dir, store) = open_store().await;
        let (keys, _) = testutil::keypair();
        let newer = testutil::sign_event(&keys, 0, vec![], "v2", 200);
        let stale = testutil::sign_event(&keys, 0, vec![], "v1", 150);
        store.put(&newer).await.unwrap();
        assert_eq!(store.put(&stale).await.unwrap(), PutOutcome::Stale);
        assert_eq!(store.total_events().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn replaceable_tie_goes_to_smaller_id() {
        let (_dir, store) = open_store().await;
        let (keys, _) = testutil::keypair();
        let a = testutil::sign_event(&keys, 10_002, vec![], "a", 100);
        let b = testutil::sign_event(&keys, 10_002, vec![], "b", 100);
        let (winner, loser) = if a.id < b.id { (a, b) } else { (b, a) };
        store.put(&winner).await.unwrap();
        assert_eq!(store.put(&loser).await.unwrap(), PutOutcome::Stale);

        let (_dir2, store2) = open_store().await;
        store2.put(&loser).await.unwrap();
        assert_eq!(store2.put(&winner).await.unwrap(), PutOutcome::Stored);
        let found = store2.query(&[Filter::default()], 500).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, winner.id);
    }

    #[tokio::test]
    async fn param_replaceable_is_keyed_by_d_tag() {
        let (_dir, store) = open_store().await;
        let (keys, _) = testutil::keypair();
        let d = |v: &str| vec![vec!["d".to_string(), v.to_string()]];
        let post_a1 = testutil::sign_event(&keys, 30_023, d("a"), "a v1", 100);
        let post_b = testutil::sign_event(&keys, 30_023, d("b"), "b v1", 100);
        let post_a2 = testutil::sign_event(&keys, 30_023, d("a"), "a v2", 200);
        store.put(&post_a1).await.unwrap();
        store.put(&post_b).await.unwrap();
        store.put(&post_a2).await.unwrap();

        let found = store
            .query(&[filter(serde_json::json!({"kinds": [30023]}))], 500)
            .await
            .unwrap();
        let contents: Vec<&str> = found.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["a v2", "b v1"]);
    }

    #[tokio::test]
    async fn missing_d_tag_reads_as_empty() {
        let (_dir, store) = open_store().await;
        let (keys, _) = testutil::keypair();
        let bare = testutil::sign_event(&keys, 30_001, vec![], "v1", 100);
        let empty_d = testutil::sign_event(
            &keys,
            30_001,
            vec![vec!["d".to_string(), String::new()]],
            "v2",
            200,
        );
        store.put(&bare).await.unwrap();
        store.put(&empty_d).await.unwrap();
        let found = store.query(&[Filter::default()], 500).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].content, "v2");
    }

    #[tokio::test]
    async fn delete_by_author_is_scoped() {
        let (_dir, store) = open_store().await;
        let (alice, _) = testutil::keypair();
        let (bob, _) = testutil::keypair();
        let alices = testutil::sign_event(&alice, 1, vec![], "mine", 100);
        let bobs = testutil::sign_event(&bob, 1, vec![], "not mine", 100);
        store.put(&alices).await.unwrap();
        store.put(&bobs).await.unwrap();

        let removed = store
            .delete_by_author(&alices.pubkey, &[alices.id.clone(), bobs.id.clone()])
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let left = store.query(&[Filter::default()], 500).await.unwrap();
        assert_eq!(left, vec![bobs]);
    }

    #[tokio::test]
    async fn expired_events_are_skipped_and_purged() {
        let (_dir, store) = open_store().await;
        let (keys, _) = testutil::keypair();
        let exp = |ts: i64| vec![vec!["expiration".to_string(), ts.to_string()]];
        let short_lived = testutil::sign_event(&keys, 1, exp(1_000), "soon gone", 100);
        let durable = testutil::sign_event(&keys, 1, vec![], "stays", 100);
        store.put(&short_lived).await.unwrap();
        store.put(&durable).await.unwrap();

        let before = store.query_at(&[Filter::default()], 500, 999).await.unwrap();
        assert_eq!(before.len(), 2);
        let after = store.query_at(&[Filter::default()], 500, 1_000).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].content, "stays");

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.total_events().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn prefix_queries_hit_the_sql_path() {
        let (_dir, store) = open_store().await;
        let (keys, pubkey) = testutil::keypair();
        let event = testutil::sign_event(&keys, 1, vec![], "x", 100);
        store.put(&event).await.unwrap();

        for len in [1, 2, 63, 64] {
            let found = store
                .query(&[filter(serde_json::json!({"authors": [&pubkey[..len]]}))], 500)
                .await
                .unwrap();
            assert_eq!(found.len(), 1, "author prefix of {len}");
            let found = store
                .query(&[filter(serde_json::json!({"ids": [&event.id[..len]]}))], 500)
                .await
                .unwrap();
            assert_eq!(found.len(), 1, "id prefix of {len}");
        }
    }

    #[tokio::test]
    async fn like_wildcards_cannot_widen_prefix_matches() {
        let (_dir, store) = open_store().await;
        let (alice, alice_pubkey) = testutil::keypair();
        let (bob, _) = testutil::keypair();
        // Older events by alice, newer noise by bob.
        for i in 0..3 {
            let event = testutil::sign_event(&alice, 1, vec![], &format!("a{i}"), 100 + i);
            store.put(&event).await.unwrap();
        }
        for i in 0..5 {
            let event = testutil::sign_event(&bob, 1, vec![], &format!("b{i}"), 200 + i);
            store.put(&event).await.unwrap();
        }

        // `_` is not a hex prefix: it must match nothing, not act as a
        // single-character LIKE wildcard.
        let found = store
            .query(&[filter(serde_json::json!({"authors": ["_"]}))], 500)
            .await
            .unwrap();
        assert!(found.is_empty());

        // A wildcard value alongside a real prefix must not flood the
        // pushed-down limit window with bob's newer rows and crowd out
        // alice's older matches.
        let found = store
            .query(
                &[filter(serde_json::json!({
                    "authors": [&alice_pubkey[..8], "%"],
                    "limit": 3
                }))],
                500,
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 3);
        assert!(found.iter().all(|e| e.pubkey == alice_pubkey));

        // The empty prefix matches every author, as the predicate does.
        let found = store
            .query(&[filter(serde_json::json!({"authors": [""]}))], 500)
            .await
            .unwrap();
        assert_eq!(found.len(), 8);
    }

    #[tokio::test]
    async fn limits_order_and_dedup() {
        let (_dir, store) = open_store().await;
        let (keys, pubkey) = testutil::keypair();
        for i in 0..10 {
            let event = testutil::sign_event(&keys, 1, vec![], &format!("n{i}"), 100 + i);
            store.put(&event).await.unwrap();
        }

        // Newest first, capped by the filter limit.
        let found = store
            .query(&[filter(serde_json::json!({"limit": 3}))], 500)
            .await
            .unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(found[0].created_at, 109);
        assert!(found.windows(2).all(|w| w[0].created_at >= w[1].created_at));

        // The global limit caps oversized filter limits.
        let found = store
            .query(&[filter(serde_json::json!({"limit": 9999}))], 5)
            .await
            .unwrap();
        assert_eq!(found.len(), 5);

        // limit 0 means no backfill at all.
        let found = store
            .query(&[filter(serde_json::json!({"limit": 0}))], 500)
            .await
            .unwrap();
        assert!(found.is_empty());

        // Overlapping filters in a disjunction return each event once.
        let found = store
            .query(
                &[
                    filter(serde_json::json!({"authors": [pubkey]})),
                    filter(serde_json::json!({"kinds": [1]})),
                ],
                500,
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 10);
    }

    #[tokio::test]
    async fn tag_and_search_filters_post_scan() {
        let (_dir, store) = open_store().await;
        let (keys, _) = testutil::keypair();
        let target = "ab".repeat(32);
        let tagged = testutil::sign_event(
            &keys,
            1,
            vec![vec!["e".to_string(), target.clone()]],
            "reply",
            100,
        );
        let plain = testutil::sign_event(&keys, 1, vec![], "Nostr is neat", 200);
        store.put(&tagged).await.unwrap();
        store.put(&plain).await.unwrap();

        let found = store
            .query(&[filter(serde_json::json!({"#e": [target]}))], 500)
            .await
            .unwrap();
        assert_eq!(found, vec![tagged]);

        let found = store
            .query(&[filter(serde_json::json!({"search": "nostr", "limit": 1}))], 500)
            .await
            .unwrap();
        assert_eq!(found, vec![plain]);
    }

    #[tokio::test]
    async fn count_matches_query_semantics() {
        let (_dir, store) = open_store().await;
        let (keys, pubkey) = testutil::keypair();
        for i in 0..4 {
            let event = testutil::sign_event(&keys, 1, vec![], &format!("{i}"), 100 + i);
            store.put(&event).await.unwrap();
        }
        let filters = [
            filter(serde_json::json!({"authors": [pubkey], "kinds": [1]})),
            filter(serde_json::json!({"kinds": [1], "limit": 1})),
        ];
        // Limits do not apply to COUNT, and overlap is deduplicated.
        assert_eq!(store.count(&filters).await.unwrap(), 4);
        assert_eq!(store.count(&filters[..1]).await.unwrap(), 4);
    }
}
