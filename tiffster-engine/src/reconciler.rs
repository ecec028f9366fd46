//! Window reconciliation.
//!
//! One reconciliation per page-changed notification:
//!
//! ```text
//! Idle -> Validating -> Deciding -> Evicting -> Adding -> Committed
//!             |            |
//!             |            +-> NoOp        (page already current)
//!             +-> Rejected                 (malformed notification)
//! ```
//!
//! The committed window only changes when every phase succeeded. A failed
//! or cancelled reconciliation leaves the previous window in place, so the
//! next notification is diffed against the last known-good state.

use std::sync::Arc;

use tiffster_core::{
    compute_window, EngineConfig, PageChanged, PageNumber, ReconcilePhase, TiffsterError,
    TiffsterResult, ValidationError,
};
use tiffster_storage::{DocumentCache, PageResidency};
use tokio::sync::Mutex;
use tracing::Instrument;

use crate::retry::RetryExecutor;

pub const EVICT_LABEL: &str = "WindowReconciler: evict_pages";
pub const ENSURE_RESIDENT_LABEL: &str = "WindowReconciler: ensure_resident";

// ============================================================================
// DECISION
// ============================================================================

/// What one reconciliation will do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowPlan {
    pub page: PageNumber,
    /// Window committed on success.
    pub window: Vec<PageNumber>,
    /// Previously resident pages that fall out of the window.
    pub to_evict: Vec<PageNumber>,
    /// Window pages not yet resident. Never contains `page` itself, which
    /// the caller that triggered the notification materializes.
    pub to_add: Vec<PageNumber>,
    /// `page` is in the window but was outside the previous one, so an
    /// earlier reconciliation may have evicted it after the caller made it
    /// resident. Adding re-ensures it; this is free when it is still there.
    pub ensure_page: bool,
    /// No window had been committed yet.
    pub bootstrap: bool,
}

impl WindowPlan {
    pub fn decide(
        page: PageNumber,
        previous: Option<&[PageNumber]>,
        window_size: u32,
        total_pages: Option<PageNumber>,
    ) -> Self {
        let window = compute_window(page, window_size, total_pages);

        let (to_evict, to_add) = match previous {
            Some(previous) => (
                previous
                    .iter()
                    .copied()
                    .filter(|p| *p != page && !window.contains(p))
                    .collect(),
                window
                    .iter()
                    .copied()
                    .filter(|p| *p != page && !previous.contains(p))
                    .collect(),
            ),
            None => (
                Vec::new(),
                window.iter().copied().filter(|p| *p != page).collect(),
            ),
        };

        let ensure_page =
            window.contains(&page) && previous.map_or(true, |previous| !previous.contains(&page));

        Self {
            page,
            window,
            to_evict,
            to_add,
            ensure_page,
            bootstrap: previous.is_none(),
        }
    }

    /// Pages the Adding phase makes resident, ascending.
    pub fn adding(&self) -> Vec<PageNumber> {
        let mut pages = self.to_add.clone();
        if self.ensure_page {
            pages.push(self.page);
            pages.sort_unstable();
        }
        pages
    }
}

/// How a notification was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Malformed notification; dropped without side effects.
    Rejected(ValidationError),
    /// The page is already current.
    NoOp,
    /// The notification is for a document that is not (or no longer) active.
    Superseded {
        document_id: String,
        active: Option<String>,
    },
    Committed(WindowPlan),
}

// ============================================================================
// RECONCILER
// ============================================================================

/// Diffs the window on each notification and drives residency changes.
///
/// Reconciliations are serialized internally, so concurrent callers are
/// safe; the Deciding to Committed span never interleaves.
pub struct WindowReconciler<M: PageResidency> {
    residency: Arc<M>,
    cache: DocumentCache,
    retry: RetryExecutor,
    window_size: u32,
    in_flight: Mutex<()>,
}

impl<M: PageResidency> WindowReconciler<M> {
    pub fn new(residency: Arc<M>, cache: DocumentCache, retry: RetryExecutor, window_size: u32) -> Self {
        Self {
            residency,
            cache,
            retry,
            window_size,
            in_flight: Mutex::new(()),
        }
    }

    pub fn from_config(residency: Arc<M>, cache: DocumentCache, config: &EngineConfig) -> Self {
        Self::new(
            residency,
            cache,
            RetryExecutor::new(config.retry.clone()),
            config.window_size,
        )
    }

    pub fn cache(&self) -> &DocumentCache {
        &self.cache
    }

    pub fn window_size(&self) -> u32 {
        self.window_size
    }

    /// Reconcile the resident window against a page-changed notification.
    ///
    /// Rejected, no-op and superseded notifications are `Ok`. An `Err` is
    /// always [`TiffsterError::Aborted`] (or a poisoned cache lock) and means
    /// nothing was committed.
    pub async fn reconcile(&self, event: &PageChanged) -> TiffsterResult<ReconcileOutcome> {
        let span = tracing::info_span!(
            "reconcile",
            event_id = %event.id,
            document_id = %event.document_id,
            page = event.page_number,
        );
        self.reconcile_inner(event).instrument(span).await
    }

    async fn reconcile_inner(&self, event: &PageChanged) -> TiffsterResult<ReconcileOutcome> {
        // Validating
        if let Err(e) = event.validate() {
            tracing::warn!(error = %e, "Rejected page-changed notification");
            return Ok(ReconcileOutcome::Rejected(e));
        }

        let _in_flight = self.in_flight.lock().await;

        let active = self.cache.active_document()?;
        if active.as_deref() != Some(event.document_id.as_str()) {
            tracing::info!(active = ?active, "Notification for inactive document dropped");
            return Ok(ReconcileOutcome::Superseded {
                document_id: event.document_id.clone(),
                active,
            });
        }

        let state = self.cache.window_state()?;
        if state.current_page == Some(event.page_number) {
            tracing::debug!("Page already current");
            return Ok(ReconcileOutcome::NoOp);
        }

        // Deciding
        let plan = WindowPlan::decide(
            event.page_number,
            state.current_window.as_deref(),
            self.window_size,
            state.total_pages,
        );
        tracing::debug!(
            window = ?plan.window,
            to_evict = ?plan.to_evict,
            to_add = ?plan.to_add,
            bootstrap = plan.bootstrap,
            "Window decided"
        );

        let document_id = event.document_id.as_str();

        // Evicting
        if !plan.to_evict.is_empty() {
            let evicted = self
                .retry
                .run(EVICT_LABEL, || self.residency.evict(document_id, &plan.to_evict))
                .await;
            if let Err(e) = evicted {
                return self.fail(event, ReconcilePhase::Evicting, e);
            }
        }

        // Adding
        let adding = plan.adding();
        if !adding.is_empty() {
            let added = self
                .retry
                .run(ENSURE_RESIDENT_LABEL, || {
                    self.residency.ensure_resident(document_id, &adding)
                })
                .await;
            if let Err(e) = added {
                return self.fail(event, ReconcilePhase::Adding, e);
            }
        }

        // Committed
        if !self
            .cache
            .commit_window(document_id, event.page_number, plan.window.clone())?
        {
            return self.superseded(event);
        }

        tracing::info!(window = ?plan.window, "Window committed");
        Ok(ReconcileOutcome::Committed(plan))
    }

    fn superseded(&self, event: &PageChanged) -> TiffsterResult<ReconcileOutcome> {
        let active = self.cache.active_document()?;
        tracing::info!(active = ?active, "Document switched mid-reconciliation, not committed");
        Ok(ReconcileOutcome::Superseded {
            document_id: event.document_id.clone(),
            active,
        })
    }

    fn fail(
        &self,
        event: &PageChanged,
        phase: ReconcilePhase,
        error: TiffsterError,
    ) -> TiffsterResult<ReconcileOutcome> {
        if error.is_inactive_document() {
            return self.superseded(event);
        }
        tracing::error!(%phase, error = %error, "Reconciliation aborted, window unchanged");
        Err(TiffsterError::aborted(phase, error))
    }
}
