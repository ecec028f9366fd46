//! Tiffster Engine - Window Reconciliation
//!
//! Keeps a sliding window of pages around the page a user is looking at
//! resident (staged locally and mirrored remotely), reconciling it on every
//! page-changed notification:
//!
//! - [`RetryExecutor`]: bounded exponential-backoff retry
//! - [`WindowReconciler`]: diff-and-apply with an all-or-nothing commit
//! - [`reconcile_worker`]: single-flight queue consumer with acks
//! - [`PageWindowService`]: on-demand page opening and read surface
//! - [`Engine`]: everything above wired from one `EngineConfig`

pub mod engine;
pub mod reconciler;
pub mod retry;
pub mod service;
pub mod telemetry;
pub mod worker;

pub use engine::{Engine, Reconciler};
pub use reconciler::{ReconcileOutcome, WindowPlan, WindowReconciler};
pub use retry::{retry_with_backoff, RetryExecutor};
pub use service::{NotificationPublisher, PageWindowService};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};
pub use worker::{reconcile_worker, Ack, Delivery, WorkerMetrics, WorkerSnapshot};
