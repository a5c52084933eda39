// SQLite-backed job/page store. One connection behind a sync mutex, short
// explicit transactions, statuses validated against the transition tables
// before every write. Counters are never incremented in place: they are
// recomputed from COUNT(*) so they cannot drift from the page rows.

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::core::errors::{StoreError, StoreResult};
use crate::core::types::{
    DetectionPayload, GlossaryEntry, ReadingMode, RemovalMethod, TranslatedRegion,
    TypesetOverrides,
};
use crate::jobs::state::{JobStatus, PageStatus};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    job_id              TEXT PRIMARY KEY,
    user_id             TEXT NOT NULL,
    title               TEXT NOT NULL DEFAULT '',
    reading_mode        TEXT NOT NULL DEFAULT 'single_page',
    source_language     TEXT NOT NULL DEFAULT 'ko',
    text_removal        TEXT NOT NULL DEFAULT 'fast',
    overwrite_text      INTEGER NOT NULL DEFAULT 1,
    skip_translation    INTEGER NOT NULL DEFAULT 0,
    glossary            TEXT NOT NULL DEFAULT '[]',
    detection_backend   TEXT,
    status              TEXT NOT NULL DEFAULT 'draft',
    total_pages         INTEGER NOT NULL DEFAULT 0,
    processed_pages     INTEGER NOT NULL DEFAULT 0,
    failed_pages        INTEGER NOT NULL DEFAULT 0,
    error_message       TEXT,
    created_at          TEXT NOT NULL,
    completed_at        TEXT
);

CREATE TABLE IF NOT EXISTS pages (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id              TEXT NOT NULL REFERENCES jobs(job_id) ON DELETE CASCADE,
    chapter_number      INTEGER NOT NULL DEFAULT 1,
    page_order          INTEGER NOT NULL DEFAULT 0,
    original_filename   TEXT NOT NULL,
    original_path       TEXT NOT NULL,
    translated_path     TEXT,
    typeset_path        TEXT,
    status              TEXT NOT NULL DEFAULT 'pending',
    detection_payload   TEXT,
    translation_payload TEXT,
    typeset_overrides   TEXT,
    error_message       TEXT,
    processing_secs     REAL
);

CREATE INDEX IF NOT EXISTS idx_pages_job ON pages(job_id, chapter_number, page_order);
";

/// Parameters for a new job. Pages are added separately while the job is in
/// draft.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub user_id: String,
    pub title: String,
    pub reading_mode: ReadingMode,
    pub source_language: String,
    pub text_removal: RemovalMethod,
    pub overwrite_text: bool,
    pub skip_translation: bool,
    pub glossary: Vec<GlossaryEntry>,
    pub detection_backend: Option<String>,
}

impl Default for NewJob {
    fn default() -> Self {
        Self {
            user_id: "anonymous".to_string(),
            title: String::new(),
            reading_mode: ReadingMode::SinglePage,
            source_language: "ko".to_string(),
            text_removal: RemovalMethod::Fast,
            overwrite_text: true,
            skip_translation: false,
            glossary: Vec::new(),
            detection_backend: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: String,
    pub user_id: String,
    pub title: String,
    pub reading_mode: ReadingMode,
    pub source_language: String,
    pub text_removal: RemovalMethod,
    pub overwrite_text: bool,
    pub skip_translation: bool,
    pub glossary: Vec<GlossaryEntry>,
    pub detection_backend: Option<String>,
    pub status: JobStatus,
    pub total_pages: i64,
    pub processed_pages: i64,
    pub failed_pages: i64,
    pub error_message: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PageRecord {
    pub id: i64,
    pub job_id: String,
    pub chapter_number: i64,
    pub page_order: i64,
    pub original_filename: String,
    pub original_path: String,
    pub translated_path: Option<String>,
    pub typeset_path: Option<String>,
    pub status: PageStatus,
    pub detection_payload: Option<DetectionPayload>,
    pub translation_payload: Option<Vec<TranslatedRegion>>,
    pub typeset_overrides: Option<TypesetOverrides>,
    pub error_message: Option<String>,
    pub processing_secs: Option<f64>,
}

pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    pub fn open(path: &str) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn create_job(&self, new: &NewJob) -> StoreResult<String> {
        let job_id = Uuid::new_v4().to_string();
        let glossary = serde_json::to_string(&new.glossary)?;
        let reading_mode = match new.reading_mode {
            ReadingMode::SinglePage => "single_page",
            ReadingMode::Strip => "strip",
        };
        let text_removal = match new.text_removal {
            RemovalMethod::Fast => "fast",
            RemovalMethod::Quality => "quality",
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO jobs (job_id, user_id, title, reading_mode, source_language,
                               text_removal, overwrite_text, skip_translation, glossary,
                               detection_backend, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'draft', ?11)",
            params![
                job_id,
                new.user_id,
                new.title,
                reading_mode,
                new.source_language,
                text_removal,
                new.overwrite_text as i64,
                new.skip_translation as i64,
                glossary,
                new.detection_backend,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(job_id)
    }

    /// Add a page to a draft job and bump the authoritative total.
    pub fn add_page(
        &self,
        job_id: &str,
        chapter_number: i64,
        page_order: i64,
        original_filename: &str,
        original_path: &str,
    ) -> StoreResult<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO pages (job_id, chapter_number, page_order, original_filename,
                                original_path, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending')",
            params![job_id, chapter_number, page_order, original_filename, original_path],
        )?;
        let page_id = tx.last_insert_rowid();
        let updated = tx.execute(
            "UPDATE jobs
             SET total_pages = (SELECT COUNT(*) FROM pages WHERE job_id = ?1)
             WHERE job_id = ?1",
            params![job_id],
        )?;
        if updated == 0 {
            return Err(StoreError::JobNotFound(job_id.to_string()));
        }
        tx.commit()?;
        Ok(page_id)
    }

    /// Move a draft job into the queueable pending state.
    pub fn submit_job(&self, job_id: &str) -> StoreResult<()> {
        self.set_job_status(job_id, JobStatus::Pending)
    }

    pub fn get_job(&self, job_id: &str) -> StoreResult<JobRecord> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT job_id, user_id, title, reading_mode, source_language, text_removal,
                    overwrite_text, skip_translation, glossary, detection_backend, status,
                    total_pages, processed_pages, failed_pages, error_message, created_at,
                    completed_at
             FROM jobs WHERE job_id = ?1",
            params![job_id],
            row_to_job,
        )
        .optional()?
        .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?
    }

    pub fn get_page(&self, page_id: i64) -> StoreResult<PageRecord> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("{PAGE_SELECT} WHERE id = ?1"),
            params![page_id],
            row_to_page,
        )
        .optional()?
        .ok_or(StoreError::PageNotFound(page_id))?
    }

    /// All pages of a job in chapter / page order.
    pub fn pages_for_job(&self, job_id: &str) -> StoreResult<Vec<PageRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{PAGE_SELECT} WHERE job_id = ?1 ORDER BY chapter_number, page_order, id"
        ))?;
        let rows = stmt.query_map(params![job_id], row_to_page)?;
        let mut pages = Vec::new();
        for row in rows {
            pages.push(row??);
        }
        Ok(pages)
    }

    pub fn pending_page_ids(&self, job_id: &str) -> StoreResult<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id FROM pages WHERE job_id = ?1 AND status = 'pending'
             ORDER BY chapter_number, page_order, id",
        )?;
        let rows = stmt.query_map(params![job_id], |row| row.get::<_, i64>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Validated job transition. Terminal states also stamp `completed_at`.
    pub fn set_job_status(&self, job_id: &str, to: JobStatus) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let current: String = tx
            .query_row(
                "SELECT status FROM jobs WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
        let from = JobStatus::parse(&current)
            .ok_or_else(|| StoreError::Corrupt(format!("job status '{current}'")))?;
        if !from.can_transition(to) {
            return Err(StoreError::IllegalTransition {
                entity: "job",
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let completed_at = to.is_terminal().then(|| Utc::now().to_rfc3339());
        tx.execute(
            "UPDATE jobs SET status = ?2, completed_at = COALESCE(?3, completed_at)
             WHERE job_id = ?1",
            params![job_id, to.as_str(), completed_at],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// The only job-fatal path: dispatch errors. Allowed from pending or
    /// processing.
    pub fn fail_job(&self, job_id: &str, message: &str) -> StoreResult<()> {
        self.set_job_status(job_id, JobStatus::Failed)?;
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE jobs SET error_message = ?2 WHERE job_id = ?1",
            params![job_id, message],
        )?;
        Ok(())
    }

    /// Validated page transition.
    pub fn set_page_status(&self, page_id: i64, to: PageStatus) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let current: String = tx
            .query_row(
                "SELECT status FROM pages WHERE id = ?1",
                params![page_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(StoreError::PageNotFound(page_id))?;
        let from = PageStatus::parse(&current)
            .ok_or_else(|| StoreError::Corrupt(format!("page status '{current}'")))?;
        if !from.can_transition(to) {
            return Err(StoreError::IllegalTransition {
                entity: "page",
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        tx.execute(
            "UPDATE pages SET status = ?2 WHERE id = ?1",
            params![page_id, to.as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn mark_page_failed(&self, page_id: i64, message: &str) -> StoreResult<()> {
        self.set_page_status(page_id, PageStatus::Failed)?;
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE pages SET error_message = ?2 WHERE id = ?1",
            params![page_id, message],
        )?;
        Ok(())
    }

    /// Detection payload is persisted before translation so partial progress
    /// survives a later failure. Each run fully overwrites the previous one.
    pub fn save_detection_payload(
        &self,
        page_id: i64,
        payload: &DetectionPayload,
    ) -> StoreResult<()> {
        let json = serde_json::to_string(payload)?;
        self.update_page_column(page_id, "detection_payload", &json)
    }

    pub fn save_translation_payload(
        &self,
        page_id: i64,
        payload: &[TranslatedRegion],
    ) -> StoreResult<()> {
        let json = serde_json::to_string(payload)?;
        self.update_page_column(page_id, "translation_payload", &json)
    }

    pub fn save_typeset_overrides(
        &self,
        page_id: i64,
        overrides: &TypesetOverrides,
    ) -> StoreResult<()> {
        let json = serde_json::to_string(overrides)?;
        self.update_page_column(page_id, "typeset_overrides", &json)
    }

    pub fn set_typeset_path(&self, page_id: i64, path: &str) -> StoreResult<()> {
        self.update_page_column(page_id, "typeset_path", path)
    }

    fn update_page_column(&self, page_id: i64, column: &str, value: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            // Column names are fixed strings from this module, never input.
            &format!("UPDATE pages SET {column} = ?2 WHERE id = ?1"),
            params![page_id, value],
        )?;
        if updated == 0 {
            return Err(StoreError::PageNotFound(page_id));
        }
        Ok(())
    }

    /// Terminal success for a page: output path + wall-clock seconds.
    pub fn complete_page(
        &self,
        page_id: i64,
        translated_path: Option<&str>,
        processing_secs: f64,
    ) -> StoreResult<()> {
        self.set_page_status(page_id, PageStatus::Completed)?;
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE pages
             SET translated_path = COALESCE(?2, translated_path),
                 processing_secs = ?3, error_message = NULL
             WHERE id = ?1",
            params![page_id, translated_path, processing_secs],
        )?;
        Ok(())
    }

    /// Explicit reset for retries and manual re-runs. Not a status edge:
    /// the row is put back to pending wholesale, payloads left in place to
    /// be overwritten by the next run.
    pub fn reset_page_for_rerun(&self, page_id: i64) -> StoreResult<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE pages SET status = 'pending', error_message = NULL,
                              processing_secs = NULL
             WHERE id = ?1",
            params![page_id],
        )?;
        if updated == 0 {
            return Err(StoreError::PageNotFound(page_id));
        }
        Ok(())
    }

    /// Recompute job counters from the page rows and finalize the job when
    /// every page is terminal. Runs in one transaction; safe to call after
    /// every page completion from any worker.
    pub fn recompute_counters(&self, job_id: &str) -> StoreResult<JobStatus> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let (total, processed, failed): (i64, i64, i64) = tx.query_row(
            "SELECT COUNT(*),
                    COUNT(*) FILTER (WHERE status = 'completed'),
                    COUNT(*) FILTER (WHERE status = 'failed')
             FROM pages WHERE job_id = ?1",
            params![job_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let current: String = tx
            .query_row(
                "SELECT status FROM jobs WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
        let mut status = JobStatus::parse(&current)
            .ok_or_else(|| StoreError::Corrupt(format!("job status '{current}'")))?;

        tx.execute(
            "UPDATE jobs SET total_pages = ?2, processed_pages = ?3, failed_pages = ?4
             WHERE job_id = ?1",
            params![job_id, total, processed, failed],
        )?;

        if status == JobStatus::Processing && total > 0 && processed + failed >= total {
            let next = if failed == 0 {
                JobStatus::Completed
            } else {
                JobStatus::CompletedWithErrors
            };
            tx.execute(
                "UPDATE jobs SET status = ?2, completed_at = ?3 WHERE job_id = ?1",
                params![job_id, next.as_str(), Utc::now().to_rfc3339()],
            )?;
            status = next;
        }

        tx.commit()?;
        Ok(status)
    }
}

const PAGE_SELECT: &str = "SELECT id, job_id, chapter_number, page_order, original_filename,
        original_path, translated_path, typeset_path, status, detection_payload,
        translation_payload, typeset_overrides, error_message, processing_secs
 FROM pages";

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<StoreResult<JobRecord>> {
    let reading_mode: String = row.get(3)?;
    let text_removal: String = row.get(5)?;
    let glossary: String = row.get(8)?;
    let status: String = row.get(10)?;

    Ok((|| {
        Ok(JobRecord {
            job_id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            reading_mode: match reading_mode.as_str() {
                "strip" => ReadingMode::Strip,
                _ => ReadingMode::SinglePage,
            },
            source_language: row.get(4)?,
            text_removal: match text_removal.as_str() {
                "quality" => RemovalMethod::Quality,
                _ => RemovalMethod::Fast,
            },
            overwrite_text: row.get::<_, i64>(6)? != 0,
            skip_translation: row.get::<_, i64>(7)? != 0,
            glossary: serde_json::from_str(&glossary)?,
            detection_backend: row.get(9)?,
            status: JobStatus::parse(&status)
                .ok_or_else(|| StoreError::Corrupt(format!("job status '{status}'")))?,
            total_pages: row.get(11)?,
            processed_pages: row.get(12)?,
            failed_pages: row.get(13)?,
            error_message: row.get(14)?,
            created_at: row.get(15)?,
            completed_at: row.get(16)?,
        })
    })())
}

fn row_to_page(row: &Row<'_>) -> rusqlite::Result<StoreResult<PageRecord>> {
    let status: String = row.get(8)?;
    let detection: Option<String> = row.get(9)?;
    let translation: Option<String> = row.get(10)?;
    let overrides: Option<String> = row.get(11)?;

    Ok((|| {
        Ok(PageRecord {
            id: row.get(0)?,
            job_id: row.get(1)?,
            chapter_number: row.get(2)?,
            page_order: row.get(3)?,
            original_filename: row.get(4)?,
            original_path: row.get(5)?,
            translated_path: row.get(6)?,
            typeset_path: row.get(7)?,
            status: PageStatus::parse(&status)
                .ok_or_else(|| StoreError::Corrupt(format!("page status '{status}'")))?,
            detection_payload: detection.as_deref().map(serde_json::from_str).transpose()?,
            translation_payload: translation
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            typeset_overrides: overrides.as_deref().map(serde_json::from_str).transpose()?,
            error_message: row.get(12)?,
            processing_secs: row.get(13)?,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{BBox, Region};

    fn draft_job(store: &JobStore, pages: usize) -> String {
        let job_id = store.create_job(&NewJob::default()).unwrap();
        for i in 0..pages {
            store
                .add_page(&job_id, 1, i as i64, &format!("p{i}.png"), &format!("in/p{i}.png"))
                .unwrap();
        }
        job_id
    }

    fn processing_job(store: &JobStore, pages: usize) -> (String, Vec<i64>) {
        let job_id = draft_job(store, pages);
        store.submit_job(&job_id).unwrap();
        store.set_job_status(&job_id, JobStatus::Processing).unwrap();
        let ids = store.pending_page_ids(&job_id).unwrap();
        (job_id, ids)
    }

    #[test]
    fn create_and_fetch_round_trip() {
        let store = JobStore::open_in_memory().unwrap();
        let job_id = store
            .create_job(&NewJob {
                title: "Chapter 3".to_string(),
                glossary: vec![GlossaryEntry {
                    source_name: "지후".to_string(),
                    target_name: "Jihu".to_string(),
                    gender: Some("male".to_string()),
                }],
                ..NewJob::default()
            })
            .unwrap();
        let job = store.get_job(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Draft);
        assert_eq!(job.title, "Chapter 3");
        assert_eq!(job.glossary.len(), 1);
        assert_eq!(job.total_pages, 0);
    }

    #[test]
    fn add_page_bumps_total_from_count() {
        let store = JobStore::open_in_memory().unwrap();
        let job_id = draft_job(&store, 3);
        assert_eq!(store.get_job(&job_id).unwrap().total_pages, 3);
        let pages = store.pages_for_job(&job_id).unwrap();
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0].page_order, 0);
        assert_eq!(pages[0].status, PageStatus::Pending);
    }

    #[test]
    fn add_page_to_missing_job_fails() {
        let store = JobStore::open_in_memory().unwrap();
        let err = store.add_page("nope", 1, 0, "a.png", "in/a.png").unwrap_err();
        assert!(matches!(err, StoreError::JobNotFound(_)));
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let store = JobStore::open_in_memory().unwrap();
        let job_id = draft_job(&store, 1);
        // draft -> processing skips pending
        let err = store
            .set_job_status(&job_id, JobStatus::Processing)
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));

        let (_, ids) = processing_job(&store, 1);
        // pending -> completed skips processing
        let err = store
            .set_page_status(ids[0], PageStatus::Completed)
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[test]
    fn counters_recompute_and_finalize_clean_job() {
        let store = JobStore::open_in_memory().unwrap();
        let (job_id, ids) = processing_job(&store, 2);
        for id in &ids {
            store.set_page_status(*id, PageStatus::Processing).unwrap();
            store.complete_page(*id, Some("out.png"), 1.5).unwrap();
        }
        let status = store.recompute_counters(&job_id).unwrap();
        assert_eq!(status, JobStatus::Completed);
        let job = store.get_job(&job_id).unwrap();
        assert_eq!(job.processed_pages, 2);
        assert_eq!(job.failed_pages, 0);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn three_of_five_gives_completed_with_errors() {
        let store = JobStore::open_in_memory().unwrap();
        let (job_id, ids) = processing_job(&store, 5);
        for (i, id) in ids.iter().enumerate() {
            store.set_page_status(*id, PageStatus::Processing).unwrap();
            if i < 3 {
                store.complete_page(*id, Some("out.png"), 1.0).unwrap();
            } else {
                store.mark_page_failed(*id, "translation exhausted").unwrap();
            }
            store.recompute_counters(&job_id).unwrap();
        }
        let job = store.get_job(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::CompletedWithErrors);
        assert_eq!(job.processed_pages, 3);
        assert_eq!(job.failed_pages, 2);
        assert_eq!(job.total_pages, 5);
    }

    #[test]
    fn job_stays_processing_while_pages_remain() {
        let store = JobStore::open_in_memory().unwrap();
        let (job_id, ids) = processing_job(&store, 3);
        store.set_page_status(ids[0], PageStatus::Processing).unwrap();
        store.complete_page(ids[0], None, 0.5).unwrap();
        let status = store.recompute_counters(&job_id).unwrap();
        assert_eq!(status, JobStatus::Processing);
        // Invariant: processed + failed <= total.
        let job = store.get_job(&job_id).unwrap();
        assert!(job.processed_pages + job.failed_pages <= job.total_pages);
    }

    #[test]
    fn payloads_round_trip_and_overwrite() {
        let store = JobStore::open_in_memory().unwrap();
        let (_, ids) = processing_job(&store, 1);
        let page_id = ids[0];

        let payload = DetectionPayload::ungrouped(vec![Region::new(
            BBox::new(1, 2, 30, 10),
            "안녕",
            0.9,
        )]);
        store.save_detection_payload(page_id, &payload).unwrap();
        let stored = store.get_page(page_id).unwrap().detection_payload.unwrap();
        assert_eq!(stored.regions.len(), 1);
        assert_eq!(stored.regions[0].text, "안녕");

        // A later run fully overwrites the payload.
        store
            .save_detection_payload(page_id, &DetectionPayload::default())
            .unwrap();
        let stored = store.get_page(page_id).unwrap().detection_payload.unwrap();
        assert!(stored.regions.is_empty());
    }

    #[test]
    fn failure_then_rerun_clears_error_and_overwrites() {
        let store = JobStore::open_in_memory().unwrap();
        let (job_id, ids) = processing_job(&store, 2);
        let page_id = ids[0];

        store.set_page_status(page_id, PageStatus::Processing).unwrap();
        store.mark_page_failed(page_id, "provider quota").unwrap();
        store.recompute_counters(&job_id).unwrap();

        let page = store.get_page(page_id).unwrap();
        assert_eq!(page.status, PageStatus::Failed);
        assert_eq!(page.error_message.as_deref(), Some("provider quota"));
        // Sibling page untouched.
        assert_eq!(store.get_page(ids[1]).unwrap().status, PageStatus::Pending);
        assert_eq!(store.get_job(&job_id).unwrap().failed_pages, 1);

        store.reset_page_for_rerun(page_id).unwrap();
        let page = store.get_page(page_id).unwrap();
        assert_eq!(page.status, PageStatus::Pending);
        assert!(page.error_message.is_none());

        store.set_page_status(page_id, PageStatus::Processing).unwrap();
        store.complete_page(page_id, Some("out.png"), 2.0).unwrap();
        store.recompute_counters(&job_id).unwrap();
        let job = store.get_job(&job_id).unwrap();
        assert_eq!(job.processed_pages, 1);
        assert_eq!(job.failed_pages, 0);
    }

    #[test]
    fn fail_job_records_message() {
        let store = JobStore::open_in_memory().unwrap();
        let job_id = draft_job(&store, 1);
        store.submit_job(&job_id).unwrap();
        store.fail_job(&job_id, "no pages on disk").unwrap();
        let job = store.get_job(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("no pages on disk"));
    }

    #[test]
    fn on_disk_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let job_id = {
            let store = JobStore::open(path.to_str().unwrap()).unwrap();
            draft_job(&store, 1)
        };
        let store = JobStore::open(path.to_str().unwrap()).unwrap();
        assert_eq!(store.get_job(&job_id).unwrap().total_pages, 1);
    }
}
