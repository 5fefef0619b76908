use crate::error::{Result, TallyError};
use crate::models::{
    BallotEntry, ResultRecord, ThresholdKind, TieBreakRequest, TieKind, Vote, VoteMethod,
    VoteOption, VoteParams, VoteState,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{migrate::MigrateDatabase, Row, Sqlite};

pub struct Database {
    pool: SqlitePool,
}

/// Results as written by a tally run, together with the exact JSON stored.
#[derive(Debug, Clone)]
pub struct StoredResults {
    pub text: String,
    pub data_json: String,
    pub record: ResultRecord,
}

impl Database {
    pub async fn new(db_url: &str, max_connections: u32) -> Result<Self> {
        // Create database if it doesn't exist
        if !Sqlite::database_exists(db_url).await.unwrap_or(false) {
            Sqlite::create_database(db_url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(db_url)
            .await?;

        Self::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    /// A private in-memory database. The single connection is never recycled,
    /// otherwise the data would vanish with it.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Self::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS votes (
                id TEXT PRIMARY KEY,
                ballot_set_id TEXT NOT NULL,
                name TEXT NOT NULL,
                method TEXT NOT NULL,
                state TEXT NOT NULL,
                majority_threshold TEXT,
                num_seats INTEGER,
                results TEXT,
                results_data TEXT,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vote_options (
                id TEXT PRIMARY KEY,
                vote_id TEXT NOT NULL,
                name TEXT NOT NULL,
                position INTEGER NOT NULL,
                FOREIGN KEY (vote_id) REFERENCES votes(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ballot_entries (
                voter_id TEXT NOT NULL,
                option_id TEXT NOT NULL,
                value INTEGER NOT NULL,
                cast_at TEXT NOT NULL,
                PRIMARY KEY (voter_id, option_id),
                FOREIGN KEY (option_id) REFERENCES vote_options(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tie_breaks (
                vote_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                round INTEGER NOT NULL,
                tied_options TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (vote_id) REFERENCES votes(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn create_vote(&self, vote: &Vote) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO votes (id, ballot_set_id, name, method, state, majority_threshold, num_seats, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&vote.id)
        .bind(&vote.ballot_set_id)
        .bind(&vote.name)
        .bind(vote.method.as_str())
        .bind(vote.state.as_str())
        .bind(vote.params.majority_threshold.map(|t| t.as_str()))
        .bind(vote.params.num_seats.map(i64::from))
        .bind(vote.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        for option in &vote.options {
            sqlx::query(
                r#"
                INSERT INTO vote_options (id, vote_id, name, position)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(&option.id)
            .bind(&vote.id)
            .bind(&option.name)
            .bind(option.position)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_vote(&self, vote_id: &str) -> Result<Vote> {
        let row = sqlx::query(
            r#"
            SELECT id, ballot_set_id, name, method, state, majority_threshold, num_seats, created_at
            FROM votes
            WHERE id = ?
            "#,
        )
        .bind(vote_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| TallyError::NotFound(format!("vote {}", vote_id)))?;

        let options = sqlx::query(
            r#"
            SELECT id, vote_id, name, position
            FROM vote_options
            WHERE vote_id = ?
            ORDER BY position
            "#,
        )
        .bind(vote_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(option_from_row)
        .collect::<Result<Vec<_>>>()?;

        vote_from_row(&row, options)
    }

    pub async fn votes_in_ballot_set(&self, ballot_set_id: &str) -> Result<Vec<Vote>> {
        let ids: Vec<String> = sqlx::query(
            r#"
            SELECT id FROM votes
            WHERE ballot_set_id = ?
            ORDER BY created_at, id
            "#,
        )
        .bind(ballot_set_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| row.try_get::<String, _>("id"))
        .collect::<std::result::Result<_, _>>()?;

        let mut votes = Vec::with_capacity(ids.len());
        for id in ids {
            votes.push(self.get_vote(&id).await?);
        }
        Ok(votes)
    }

    /// Ids of every vote currently in one of the given states.
    pub async fn vote_ids_in_state(&self, state: VoteState) -> Result<Vec<String>> {
        let ids = sqlx::query("SELECT id FROM votes WHERE state = ? ORDER BY id")
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| row.try_get::<String, _>("id"))
            .collect::<std::result::Result<_, _>>()?;
        Ok(ids)
    }

    /// Moves `vote_id` from `from` to `to`. Returns false when the vote was not
    /// in `from`, in which case nothing changed.
    pub async fn transition(&self, vote_id: &str, from: VoteState, to: VoteState) -> Result<bool> {
        let done = sqlx::query("UPDATE votes SET state = ? WHERE id = ? AND state = ?")
            .bind(to.as_str())
            .bind(vote_id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() == 1)
    }

    pub async fn update_params(
        &self,
        vote_id: &str,
        params: &VoteParams,
        allowed: [VoteState; 2],
    ) -> Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE votes
            SET majority_threshold = ?, num_seats = ?
            WHERE id = ? AND state IN (?, ?)
            "#,
        )
        .bind(params.majority_threshold.map(|t| t.as_str()))
        .bind(params.num_seats.map(i64::from))
        .bind(vote_id)
        .bind(allowed[0].as_str())
        .bind(allowed[1].as_str())
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    pub async fn insert_option(&self, option: &VoteOption, required: VoteState) -> Result<bool> {
        let done = sqlx::query(
            r#"
            INSERT INTO vote_options (id, vote_id, name, position)
            SELECT ?, ?, ?, ?
            WHERE EXISTS (SELECT 1 FROM votes WHERE id = ? AND state = ?)
            "#,
        )
        .bind(&option.id)
        .bind(&option.vote_id)
        .bind(&option.name)
        .bind(option.position)
        .bind(&option.vote_id)
        .bind(required.as_str())
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    pub async fn delete_option(
        &self,
        vote_id: &str,
        option_id: &str,
        required: VoteState,
    ) -> Result<bool> {
        let done = sqlx::query(
            r#"
            DELETE FROM vote_options
            WHERE id = ? AND vote_id = ?
              AND EXISTS (SELECT 1 FROM votes WHERE id = ? AND state = ?)
            "#,
        )
        .bind(option_id)
        .bind(vote_id)
        .bind(vote_id)
        .bind(required.as_str())
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    pub async fn delete_vote(&self, vote_id: &str, required: VoteState) -> Result<bool> {
        let done = sqlx::query("DELETE FROM votes WHERE id = ? AND state = ?")
            .bind(vote_id)
            .bind(required.as_str())
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() == 1)
    }

    /// Appends one voter's entries. The vote must still be live and the voter
    /// must not have voted on it before.
    pub async fn insert_ballot(&self, vote_id: &str, entries: &[BallotEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let state_str: String = sqlx::query("SELECT state FROM votes WHERE id = ?")
            .bind(vote_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| TallyError::NotFound(format!("vote {}", vote_id)))?
            .try_get("state")?;
        let state = parse_state(&state_str)?;
        if state != VoteState::Live {
            return Err(TallyError::invalid_state(
                state,
                "ballots are only accepted while the vote is live",
            ));
        }

        if let Some(voter_id) = entries.first().map(|e| &e.voter_id) {
            let already = sqlx::query(
                r#"
                SELECT 1 FROM ballot_entries be
                JOIN vote_options o ON o.id = be.option_id
                WHERE o.vote_id = ? AND be.voter_id = ?
                LIMIT 1
                "#,
            )
            .bind(vote_id)
            .bind(voter_id)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
            if already {
                return Err(TallyError::InvalidBallot(format!(
                    "voter {} has already voted",
                    voter_id
                )));
            }
        }

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO ballot_entries (voter_id, option_id, value, cast_at)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(&entry.voter_id)
            .bind(&entry.option_id)
            .bind(entry.value)
            .bind(entry.cast_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// All entries for options of `vote_id`, ordered by voter then rank.
    pub async fn entries_for_vote(&self, vote_id: &str) -> Result<Vec<BallotEntry>> {
        sqlx::query(
            r#"
            SELECT be.voter_id, be.option_id, be.value, be.cast_at
            FROM ballot_entries be
            JOIN vote_options o ON o.id = be.option_id
            WHERE o.vote_id = ?
            ORDER BY be.voter_id, be.value, o.position
            "#,
        )
        .bind(vote_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| -> Result<BallotEntry> {
            Ok(BallotEntry {
                voter_id: row.try_get("voter_id")?,
                option_id: row.try_get("option_id")?,
                value: row.try_get("value")?,
                cast_at: parse_timestamp(&row.try_get::<String, _>("cast_at")?)?,
            })
        })
        .collect()
    }

    /// Records a tie request and pauses the vote in one step. Returns false,
    /// writing nothing, when the vote is no longer counting.
    pub async fn open_tie_break(&self, request: &TieBreakRequest) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query("UPDATE votes SET state = ? WHERE id = ? AND state = ?")
            .bind(VoteState::PausedForTieBreak.as_str())
            .bind(&request.vote_id)
            .bind(VoteState::Counting.as_str())
            .execute(&mut *tx)
            .await?;
        if moved.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO tie_breaks (vote_id, kind, round, tied_options, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&request.vote_id)
        .bind(request.kind.as_str())
        .bind(i64::from(request.round))
        .bind(serde_json::to_string(&request.tied_option_ids)?)
        .bind(request.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn get_tie_break(&self, vote_id: &str) -> Result<Option<TieBreakRequest>> {
        let row = sqlx::query(
            r#"
            SELECT vote_id, kind, round, tied_options, created_at
            FROM tie_breaks
            WHERE vote_id = ?
            "#,
        )
        .bind(vote_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let kind_str: String = row.try_get("kind")?;
        let kind = TieKind::parse(&kind_str)
            .ok_or_else(|| TallyError::Corrupt(format!("unknown tie kind: {}", kind_str)))?;
        let round: i64 = row.try_get("round")?;
        let tied: String = row.try_get("tied_options")?;

        Ok(Some(TieBreakRequest {
            vote_id: row.try_get("vote_id")?,
            kind,
            round: u32::try_from(round)
                .map_err(|_| TallyError::Corrupt(format!("bad tie round: {}", round)))?,
            tied_option_ids: serde_json::from_str(&tied)?,
            created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        }))
    }

    /// Deletes the pending request and resumes counting in one step. Returns
    /// false when there was nothing to resolve.
    pub async fn resolve_tie_break(&self, vote_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM tie_breaks WHERE vote_id = ?")
            .bind(vote_id)
            .execute(&mut *tx)
            .await?;
        let moved = sqlx::query("UPDATE votes SET state = ? WHERE id = ? AND state = ?")
            .bind(VoteState::Counting.as_str())
            .bind(vote_id)
            .bind(VoteState::PausedForTieBreak.as_str())
            .execute(&mut *tx)
            .await?;

        if deleted.rows_affected() != 1 || moved.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Writes the results and closes the vote in one step.
    pub async fn store_results(
        &self,
        vote_id: &str,
        record: &ResultRecord,
        text: &str,
    ) -> Result<bool> {
        let data = serde_json::to_string(record)?;
        let done = sqlx::query(
            r#"
            UPDATE votes
            SET results = ?, results_data = ?, state = ?
            WHERE id = ? AND state = ?
            "#,
        )
        .bind(text)
        .bind(data)
        .bind(VoteState::Closed.as_str())
        .bind(vote_id)
        .bind(VoteState::Counting.as_str())
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    pub async fn get_results(&self, vote_id: &str) -> Result<Option<StoredResults>> {
        let row = sqlx::query("SELECT results, results_data FROM votes WHERE id = ?")
            .bind(vote_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| TallyError::NotFound(format!("vote {}", vote_id)))?;

        let text: Option<String> = row.try_get("results")?;
        let data: Option<String> = row.try_get("results_data")?;
        match (text, data) {
            (Some(text), Some(data_json)) => {
                let record = serde_json::from_str(&data_json)?;
                Ok(Some(StoredResults {
                    text,
                    data_json,
                    record,
                }))
            }
            _ => Ok(None),
        }
    }

    /// Administrative reset back to live. Any orphaned tie request goes with it.
    pub async fn reset_to_live(&self, vote_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query(
            r#"
            UPDATE votes SET state = ?, results = NULL, results_data = NULL
            WHERE id = ? AND state IN (?, ?, ?)
            "#,
        )
        .bind(VoteState::Live.as_str())
        .bind(vote_id)
        .bind(VoteState::Counting.as_str())
        .bind(VoteState::PausedForTieBreak.as_str())
        .bind(VoteState::Closed.as_str())
        .execute(&mut *tx)
        .await?;
        if moved.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM tie_breaks WHERE vote_id = ?")
            .bind(vote_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }
}

fn option_from_row(row: &SqliteRow) -> Result<VoteOption> {
    Ok(VoteOption {
        id: row.try_get("id")?,
        vote_id: row.try_get("vote_id")?,
        name: row.try_get("name")?,
        position: row.try_get("position")?,
    })
}

fn vote_from_row(row: &SqliteRow, options: Vec<VoteOption>) -> Result<Vote> {
    let method_str: String = row.try_get("method")?;
    let method = VoteMethod::parse(&method_str)
        .ok_or_else(|| TallyError::Corrupt(format!("unknown voting method: {}", method_str)))?;
    let state = parse_state(&row.try_get::<String, _>("state")?)?;

    let majority_threshold = match row.try_get::<Option<String>, _>("majority_threshold")? {
        Some(raw) => Some(ThresholdKind::parse(&raw).ok_or_else(|| {
            TallyError::Corrupt(format!("unknown majority threshold: {}", raw))
        })?),
        None => None,
    };
    let num_seats = match row.try_get::<Option<i64>, _>("num_seats")? {
        Some(n) => Some(
            u32::try_from(n).map_err(|_| TallyError::Corrupt(format!("bad seat count: {}", n)))?,
        ),
        None => None,
    };

    Ok(Vote {
        id: row.try_get("id")?,
        ballot_set_id: row.try_get("ballot_set_id")?,
        name: row.try_get("name")?,
        method,
        state,
        options,
        params: VoteParams {
            majority_threshold,
            num_seats,
        },
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn parse_state(raw: &str) -> Result<VoteState> {
    VoteState::parse(raw).ok_or_else(|| TallyError::Corrupt(format!("unknown vote state: {}", raw)))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TallyError::Corrupt(format!("failed to parse timestamp {}: {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transitions_only_apply_from_the_expected_state() {
        let db = Database::in_memory().await.unwrap();
        let vote = Vote::new("set".into(), "Motion".into(), VoteMethod::Threshold);
        db.create_vote(&vote).await.unwrap();

        assert!(!db.transition(&vote.id, VoteState::Live, VoteState::Counting).await.unwrap());
        assert!(db.transition(&vote.id, VoteState::Unopened, VoteState::Live).await.unwrap());
        assert!(!db.transition(&vote.id, VoteState::Unopened, VoteState::Live).await.unwrap());

        let stored = db.get_vote(&vote.id).await.unwrap();
        assert_eq!(stored.state, VoteState::Live);
        assert_eq!(stored.options.len(), 3);
        assert_eq!(stored.options[0].name, "yes");
    }

    #[tokio::test]
    async fn tie_break_rows_come_and_go_with_the_pause() {
        let db = Database::in_memory().await.unwrap();
        let vote = Vote::new("set".into(), "Board".into(), VoteMethod::Ranked);
        db.create_vote(&vote).await.unwrap();
        db.transition(&vote.id, VoteState::Unopened, VoteState::Live).await.unwrap();

        let request = TieBreakRequest {
            vote_id: vote.id.clone(),
            kind: TieKind::Eliminate,
            round: 2,
            tied_option_ids: vec!["a".into(), "b".into()],
            created_at: Utc::now(),
        };
        // Not counting yet, so nothing is written.
        assert!(!db.open_tie_break(&request).await.unwrap());
        assert!(db.get_tie_break(&vote.id).await.unwrap().is_none());

        db.transition(&vote.id, VoteState::Live, VoteState::Counting).await.unwrap();
        assert!(db.open_tie_break(&request).await.unwrap());
        let pending = db.get_tie_break(&vote.id).await.unwrap().unwrap();
        assert_eq!(pending.tied_option_ids, request.tied_option_ids);
        assert_eq!(db.get_vote(&vote.id).await.unwrap().state, VoteState::PausedForTieBreak);

        assert!(db.resolve_tie_break(&vote.id).await.unwrap());
        assert!(!db.resolve_tie_break(&vote.id).await.unwrap());
        assert_eq!(db.get_vote(&vote.id).await.unwrap().state, VoteState::Counting);
    }

    #[tokio::test]
    async fn reset_drops_results_and_orphaned_ties() {
        let db = Database::in_memory().await.unwrap();
        let vote = Vote::new("set".into(), "Board".into(), VoteMethod::Ranked);
        db.create_vote(&vote).await.unwrap();
        db.transition(&vote.id, VoteState::Unopened, VoteState::Live).await.unwrap();
        db.transition(&vote.id, VoteState::Live, VoteState::Counting).await.unwrap();
        db.open_tie_break(&TieBreakRequest {
            vote_id: vote.id.clone(),
            kind: TieKind::FinalSeat,
            round: 1,
            tied_option_ids: vec!["a".into()],
            created_at: Utc::now(),
        })
        .await
        .unwrap();

        assert!(db.reset_to_live(&vote.id).await.unwrap());
        assert!(db.get_tie_break(&vote.id).await.unwrap().is_none());
        assert!(db.get_results(&vote.id).await.unwrap().is_none());
        assert!(!db.reset_to_live(&vote.id).await.unwrap());
    }
}
