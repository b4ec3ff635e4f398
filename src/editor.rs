//! Row editor for a provider's date-specific hours.
//!
//! Each row moves through `Viewing → Editing → Saving → Viewing`. The
//! editor owns the transitions: only one row may be in flight at a time,
//! and an action that does not fit a row's state is refused rather than
//! silently ignored.

use std::str::FromStr;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::Mutex;
use tracing::debug;
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateFormat {
    /// `dd/mm/yyyy`
    Dmy,
    /// `mm/dd/yyyy`
    Mdy,
    /// `yyyy/mm/dd`
    Ymd,
}

impl DateFormat {
    fn pattern(self) -> &'static str {
        match self {
            DateFormat::Dmy => "%d/%m/%Y",
            DateFormat::Mdy => "%m/%d/%Y",
            DateFormat::Ymd => "%Y/%m/%d",
        }
    }

    /// Parse in this format; ISO `YYYY-MM-DD` is always accepted too.
    pub fn parse(self, s: &str) -> Option<NaiveDate> {
        let s = s.trim();
        NaiveDate::parse_from_str(s, self.pattern())
            .ok()
            .or_else(|| parse_date(s))
    }

    pub fn format(self, date: NaiveDate) -> String {
        date.format(self.pattern()).to_string()
    }
}

impl FromStr for DateFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DMY" => Ok(DateFormat::Dmy),
            "MDY" => Ok(DateFormat::Mdy),
            "YMD" => Ok(DateFormat::Ymd),
            other => Err(format!("unknown date format {other:?} (expected DMY, MDY or YMD)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditorConfig {
    pub provider_id: Ulid,
    pub date_format: DateFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowState {
    Viewing,
    Editing,
    /// A store call for this row is in flight.
    Saving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowId(u64);

impl std::fmt::Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "row {}", self.0)
    }
}

/// The text a user has typed into a row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowDraft {
    pub date: String,
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorRow {
    pub id: RowId,
    pub state: RowState,
    pub draft: RowDraft,
    /// What the store currently holds for this row; `None` until first saved.
    pub saved: Option<DateSpecificOverride>,
}

#[derive(Debug)]
pub enum EditorError {
    RowNotFound(RowId),
    /// Another row is being edited or saved.
    Busy(RowId),
    InvalidTransition {
        row: RowId,
        from: RowState,
        action: &'static str,
    },
    Parse(String),
    Engine(EngineError),
}

impl std::fmt::Display for EditorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EditorError::RowNotFound(row) => write!(f, "{row} not found"),
            EditorError::Busy(row) => write!(f, "{row} is still being edited"),
            EditorError::InvalidTransition { row, from, action } => {
                write!(f, "cannot {action} {row} while {from:?}")
            }
            EditorError::Parse(msg) => write!(f, "{msg}"),
            EditorError::Engine(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for EditorError {}

impl From<EngineError> for EditorError {
    fn from(e: EngineError) -> Self {
        EditorError::Engine(e)
    }
}

#[derive(Default)]
struct Rows {
    rows: Vec<EditorRow>,
    next_id: u64,
}

impl Rows {
    fn next_id(&mut self) -> RowId {
        self.next_id += 1;
        RowId(self.next_id)
    }

    fn active(&self) -> Option<RowId> {
        self.rows
            .iter()
            .find(|r| r.state != RowState::Viewing)
            .map(|r| r.id)
    }

    fn ensure_idle(&self, except: RowId) -> Result<(), EditorError> {
        match self.active() {
            Some(active) if active != except => Err(EditorError::Busy(active)),
            _ => Ok(()),
        }
    }

    fn get_mut(&mut self, id: RowId) -> Result<&mut EditorRow, EditorError> {
        self.rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(EditorError::RowNotFound(id))
    }

    fn remove(&mut self, id: RowId) {
        self.rows.retain(|r| r.id != id);
    }
}

fn expect_state(
    row: &EditorRow,
    allowed: &[RowState],
    action: &'static str,
) -> Result<(), EditorError> {
    if allowed.contains(&row.state) {
        Ok(())
    } else {
        Err(EditorError::InvalidTransition {
            row: row.id,
            from: row.state,
            action,
        })
    }
}

/// Date-specific hours editor for one provider.
///
/// The row table sits behind a mutex that is never held across a store
/// call; a row in `Saving` marks the call in flight instead.
pub struct OverrideEditor {
    engine: Arc<Engine>,
    config: EditorConfig,
    rows: Mutex<Rows>,
}

impl OverrideEditor {
    pub fn new(engine: Arc<Engine>, config: EditorConfig) -> Self {
        Self {
            engine,
            config,
            rows: Mutex::new(Rows::default()),
        }
    }

    pub fn config(&self) -> &EditorConfig {
        &self.config
    }

    fn draft_of(&self, entry: &DateSpecificOverride) -> RowDraft {
        RowDraft {
            date: self.config.date_format.format(entry.date),
            start: format_clock(entry.start),
            end: format_clock(entry.end),
        }
    }

    fn parse_draft(&self, draft: &RowDraft) -> Result<DateSpecificOverride, EditorError> {
        let date = self
            .config
            .date_format
            .parse(&draft.date)
            .ok_or_else(|| EditorError::Parse(format!("invalid date {:?}", draft.date)))?;
        let start = parse_clock(&draft.start)
            .ok_or_else(|| EditorError::Parse(format!("invalid start time {:?}", draft.start)))?;
        let end = parse_clock(&draft.end)
            .ok_or_else(|| EditorError::Parse(format!("invalid end time {:?}", draft.end)))?;
        Ok(DateSpecificOverride {
            provider_id: self.config.provider_id,
            date,
            start,
            end,
        })
    }

    /// Replace the table with the provider's stored overrides, date ascending.
    pub async fn load(&self) -> Result<(), EditorError> {
        if let Some(active) = self.rows.lock().await.active() {
            return Err(EditorError::Busy(active));
        }
        let stored = self.engine.list_overrides(self.config.provider_id).await;

        let mut rows = self.rows.lock().await;
        if let Some(active) = rows.active() {
            return Err(EditorError::Busy(active));
        }
        rows.rows.clear();
        for entry in stored {
            let id = rows.next_id();
            rows.rows.push(EditorRow {
                id,
                state: RowState::Viewing,
                draft: self.draft_of(&entry),
                saved: Some(entry),
            });
        }
        Ok(())
    }

    pub async fn rows(&self) -> Vec<EditorRow> {
        self.rows.lock().await.rows.clone()
    }

    pub async fn row(&self, id: RowId) -> Option<EditorRow> {
        self.rows.lock().await.rows.iter().find(|r| r.id == id).cloned()
    }

    /// Insert an empty row at the top, already in `Editing`.
    pub async fn add_row(&self) -> Result<RowId, EditorError> {
        let mut rows = self.rows.lock().await;
        if let Some(active) = rows.active() {
            return Err(EditorError::Busy(active));
        }
        let id = rows.next_id();
        rows.rows.insert(
            0,
            EditorRow {
                id,
                state: RowState::Editing,
                draft: RowDraft::default(),
                saved: None,
            },
        );
        Ok(id)
    }

    pub async fn edit_row(&self, id: RowId) -> Result<(), EditorError> {
        let mut rows = self.rows.lock().await;
        rows.ensure_idle(id)?;
        let row = rows.get_mut(id)?;
        expect_state(row, &[RowState::Viewing], "edit")?;
        row.state = RowState::Editing;
        Ok(())
    }

    /// Replace the row's text fields.
    pub async fn set_draft(&self, id: RowId, draft: RowDraft) -> Result<(), EditorError> {
        let mut rows = self.rows.lock().await;
        let row = rows.get_mut(id)?;
        expect_state(row, &[RowState::Editing], "change")?;
        row.draft = draft;
        Ok(())
    }

    /// Parse the draft and store it. The row returns to `Editing` on any
    /// failure so the user can correct it.
    pub async fn save_row(&self, id: RowId) -> Result<DateSpecificOverride, EditorError> {
        let (entry, previous) = {
            let mut rows = self.rows.lock().await;
            let row = rows.get_mut(id)?;
            expect_state(row, &[RowState::Editing], "save")?;
            let entry = self.parse_draft(&row.draft)?;
            if entry.end < entry.start {
                return Err(EditorError::Parse(format!(
                    "end {} is before start {}",
                    format_clock(entry.end),
                    format_clock(entry.start)
                )));
            }
            row.state = RowState::Saving;
            (entry, row.saved.clone())
        };

        let result = self.store(&entry, previous.as_ref()).await;

        let mut rows = self.rows.lock().await;
        let row = rows.get_mut(id)?;
        match result {
            Ok(()) => {
                row.state = RowState::Viewing;
                row.draft = self.draft_of(&entry);
                row.saved = Some(entry.clone());
                // The store keeps one override per date; a second row for
                // the same date now shows stale hours.
                rows.rows.retain(|r| {
                    r.id == id || r.saved.as_ref().is_none_or(|s| s.date != entry.date)
                });
                debug!(provider = %entry.provider_id, date = %entry.date, "override saved");
                Ok(entry)
            }
            Err(e) => {
                row.state = RowState::Editing;
                Err(e)
            }
        }
    }

    /// A row whose date changed replaces its old override in one step.
    async fn store(
        &self,
        entry: &DateSpecificOverride,
        previous: Option<&DateSpecificOverride>,
    ) -> Result<(), EditorError> {
        match previous {
            Some(prev) => self.engine.move_override(prev.date, entry.clone()).await?,
            None => self.engine.upsert_override(entry.clone()).await?,
        }
        Ok(())
    }

    /// Abandon the draft. A row that was never saved disappears.
    pub async fn cancel_row(&self, id: RowId) -> Result<(), EditorError> {
        let mut rows = self.rows.lock().await;
        let row = rows.get_mut(id)?;
        expect_state(row, &[RowState::Editing], "cancel")?;
        match row.saved.clone() {
            Some(saved) => {
                row.draft = self.draft_of(&saved);
                row.state = RowState::Viewing;
            }
            None => rows.remove(id),
        }
        Ok(())
    }

    /// Remove the row and its stored override.
    pub async fn delete_row(&self, id: RowId) -> Result<(), EditorError> {
        let (saved, prior) = {
            let mut rows = self.rows.lock().await;
            rows.ensure_idle(id)?;
            let row = rows.get_mut(id)?;
            expect_state(row, &[RowState::Viewing, RowState::Editing], "delete")?;
            let Some(saved) = row.saved.clone() else {
                rows.remove(id);
                return Ok(());
            };
            let prior = row.state;
            row.state = RowState::Saving;
            (saved, prior)
        };

        let result = self
            .engine
            .remove_override(self.config.provider_id, saved.date)
            .await;

        let mut rows = self.rows.lock().await;
        match result {
            Ok(_) => {
                rows.remove(id);
                Ok(())
            }
            Err(e) => {
                if let Ok(row) = rows.get_mut(id) {
                    row.state = prior;
                }
                Err(e.into())
            }
        }
    }
}
