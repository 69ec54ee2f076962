//! Changeset lifecycle around element writes.
//!
//! Every write needs an open changeset. Depending on configuration a
//! changeset is either opened and closed around each request, or kept open
//! per user and reused until it is closed explicitly or by the server. A write
//! refused because its changeset was closed behind our back is replayed once
//! in a freshly opened changeset.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;

use super::api::{OsmApi, OsmApiError};
use super::payload::{changeset_xml, ChangesetId, EditError, EditRequest, PayloadError};

#[derive(Error, Debug)]
pub enum ChangesetError {
    #[error(transparent)]
    Api(#[from] OsmApiError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error("invalid edit: {0}")]
    Invalid(#[from] EditError),
}

/// Identifies whose changeset is whose without keeping raw tokens around.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn from_token(token: &str) -> Self {
        let digest = Sha256::digest(token.as_bytes());
        Self(digest.iter().map(|byte| format!("{:02x}", byte)).collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EditOutcome {
    pub changeset: ChangesetId,
    /// Trimmed response body: the new ID for creates, the new version for updates.
    pub response: String,
    pub retried: bool,
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub changeset: Option<ChangesetId>,
    /// Outcomes of the edits that were written, in input order.
    pub completed: Vec<EditOutcome>,
    /// The error that stopped the batch, if any. Edits after it were not attempted.
    pub error: Option<ChangesetError>,
}

/// Idle time after which OSM closes a changeset on its own.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// A user's reused changeset. `id` is `None` until the first write.
struct OpenChangeset {
    id: Option<ChangesetId>,
    last_used: Instant,
}

impl OpenChangeset {
    fn new() -> Self {
        Self {
            id: None,
            last_used: Instant::now(),
        }
    }

    fn set(&mut self, changeset: ChangesetId) {
        self.id = Some(changeset);
        self.last_used = Instant::now();
    }
}

type Slot = Arc<Mutex<OpenChangeset>>;

pub struct ChangesetManager {
    api: Arc<dyn OsmApi>,
    created_by: String,
    comment: String,
    reuse: bool,
    idle_timeout: Duration,
    /// One slot per user. The map lock is only held for lookups; a slot's own
    /// lock is held while its changeset is being created.
    open: parking_lot::Mutex<HashMap<SessionKey, Slot>>,
}

impl ChangesetManager {
    pub fn new(api: Arc<dyn OsmApi>, created_by: &str, comment: &str, reuse: bool) -> Self {
        Self {
            api,
            created_by: created_by.to_string(),
            comment: comment.to_string(),
            reuse,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            open: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Forget reused changesets idle for longer than `idle_timeout`.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub async fn current(&self, token: &str) -> Option<ChangesetId> {
        let slot = self.open.lock().get(&SessionKey::from_token(token)).cloned()?;
        let id = slot.lock().await.id;
        id
    }

    /// The caller's slot, created on first use. Slots nobody else holds whose
    /// changeset is unset or idle past the timeout are dropped on the way.
    fn slot(&self, key: &SessionKey) -> Slot {
        let mut open = self.open.lock();
        let before = open.len();
        open.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(entry) => entry.id.is_some() && entry.last_used.elapsed() < self.idle_timeout,
                Err(_) => true,
            }
        });
        if open.len() < before {
            log::debug!("Forgot {} idle changesets", before - open.len());
        }
        open.entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(OpenChangeset::new())))
            .clone()
    }

    async fn open_changeset(&self, token: &str) -> Result<ChangesetId, ChangesetError> {
        let xml = changeset_xml(&self.created_by, &self.comment)?;
        Ok(self.api.create_changeset(token, xml).await?)
    }

    /// Returns the caller's open changeset, opening one when needed.
    async fn acquire(&self, token: &str, key: &SessionKey) -> Result<ChangesetId, ChangesetError> {
        if !self.reuse {
            return self.open_changeset(token).await;
        }
        let slot = self.slot(key);
        // Held across the create call so concurrent requests of one user share a changeset.
        let mut entry = slot.lock().await;
        let changeset = match entry.id {
            Some(changeset) => changeset,
            None => self.open_changeset(token).await?,
        };
        entry.set(changeset);
        Ok(changeset)
    }

    async fn release(&self, token: &str, changeset: ChangesetId) {
        if self.reuse {
            return;
        }
        if let Err(err) = self.api.close_changeset(token, changeset).await {
            log::warn!("Failed to close changeset {}: {}", changeset, err);
        }
    }

    /// Writes `edit` into `changeset`. If the server reports the changeset as
    /// closed, a new one is opened and the write is retried exactly once;
    /// `changeset` is updated to the one actually used.
    async fn write_with_retry(
        &self,
        token: &str,
        key: &SessionKey,
        changeset: &mut ChangesetId,
        edit: &EditRequest,
    ) -> Result<EditOutcome, ChangesetError> {
        let path = edit.path();
        match self.api.write(token, &path, edit.to_xml(*changeset)?).await {
            Ok(body) => Ok(EditOutcome {
                changeset: *changeset,
                response: body.trim().to_string(),
                retried: false,
            }),
            Err(err) if err.is_changeset_closed() => {
                log::warn!(
                    "Changeset {} is no longer open, retrying {} in a new changeset",
                    changeset,
                    path
                );
                let stale = *changeset;
                if let Err(close_err) = self.api.close_changeset(token, stale).await {
                    log::debug!("Closing stale changeset {} failed: {}", stale, close_err);
                }

                let fresh = if self.reuse {
                    let slot = self.slot(key);
                    let mut entry = slot.lock().await;
                    match entry.id {
                        // Another request already replaced the stale changeset.
                        Some(current) if current != stale => current,
                        _ => {
                            entry.id = None;
                            let fresh = self.open_changeset(token).await?;
                            entry.set(fresh);
                            fresh
                        }
                    }
                } else {
                    self.open_changeset(token).await?
                };
                *changeset = fresh;

                let body = self.api.write(token, &path, edit.to_xml(fresh)?).await?;
                Ok(EditOutcome {
                    changeset: fresh,
                    response: body.trim().to_string(),
                    retried: true,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Applies one edit in its own changeset, or in the caller's reused one.
    pub async fn apply(
        &self,
        token: &str,
        edit: &EditRequest,
    ) -> Result<EditOutcome, ChangesetError> {
        edit.validate()?;
        let key = SessionKey::from_token(token);
        let mut changeset = self.acquire(token, &key).await?;
        let result = self
            .write_with_retry(token, &key, &mut changeset, edit)
            .await;
        self.release(token, changeset).await;
        result
    }

    /// Applies several edits in a single changeset, stopping at the first failure.
    ///
    /// An empty batch opens no changeset. The changeset is closed afterwards
    /// unless changesets are reused, including after a partial failure.
    pub async fn apply_batch(
        &self,
        token: &str,
        edits: &[EditRequest],
    ) -> Result<BatchOutcome, ChangesetError> {
        if edits.is_empty() {
            return Ok(BatchOutcome {
                changeset: None,
                completed: Vec::new(),
                error: None,
            });
        }
        let key = SessionKey::from_token(token);
        let mut changeset = self.acquire(token, &key).await?;
        let mut completed = Vec::with_capacity(edits.len());
        let mut error = None;
        for edit in edits {
            let result = match edit.validate() {
                Ok(()) => {
                    self.write_with_retry(token, &key, &mut changeset, edit)
                        .await
                }
                Err(err) => Err(err.into()),
            };
            match result {
                Ok(outcome) => completed.push(outcome),
                Err(err) => {
                    log::warn!("Stopping batch at {}: {}", edit.path(), err);
                    error = Some(err);
                    break;
                }
            }
        }
        self.release(token, changeset).await;
        Ok(BatchOutcome {
            changeset: Some(changeset),
            completed,
            error,
        })
    }

    /// Closes the caller's reused changeset. Returns the closed ID, if there was one.
    pub async fn close(&self, token: &str) -> Result<Option<ChangesetId>, ChangesetError> {
        let slot = self.open.lock().remove(&SessionKey::from_token(token));
        let changeset = match slot {
            Some(slot) => slot.lock().await.id.take(),
            None => None,
        };
        match changeset {
            Some(changeset) => {
                self.api.close_changeset(token, changeset).await?;
                Ok(Some(changeset))
            }
            None => Ok(None),
        }
    }
}
