//! Per-call execution context.
//!
//! An [`ExecutionContext`] travels with one call. It carries:
//! - the cancellation signal, observed by the handler and by the transport
//! - call-scoped options (timeout, metadata)
//! - the error accumulator the handler writes validation errors into
//!
//! The accumulator is plain data ([`ErrorPayload`]), so a remote handler's
//! errors cross the wire unchanged and the caller sees the same structure
//! whether the handler ran locally or remotely.
//!
//! # Example
//!
//! ```
//! use procwire_dispatch::ExecutionContext;
//!
//! let ctx = ExecutionContext::new();
//! ctx.add_error("order is closed");
//! ctx.add_field_error("quantity", "must be positive");
//!
//! let errors = ctx.errors();
//! assert_eq!(errors.general(), ["order is closed"]);
//! assert_eq!(errors.field("quantity"), Some(&["must be positive".to_string()][..]));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{DispatchError, Result};

/// Errors scoped to one field, in the order they were added.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldErrors {
    /// Field name.
    pub field: String,
    /// Messages for this field.
    pub messages: Vec<String>,
}

/// Accumulated validation errors.
///
/// Wire shape: an ordered list of general errors plus an ordered mapping from
/// field name to that field's ordered messages. Fields keep the order of
/// their first error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    general: Vec<String>,
    #[serde(default)]
    fields: Vec<FieldErrors>,
}

impl ErrorPayload {
    /// Create an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a general error.
    pub fn add_general(&mut self, message: impl Into<String>) {
        self.general.push(message.into());
    }

    /// Append an error for `field`.
    pub fn add_field(&mut self, field: impl Into<String>, message: impl Into<String>) {
        let field = field.into();
        let message = message.into();
        match self.fields.iter_mut().find(|f| f.field == field) {
            Some(entry) => entry.messages.push(message),
            None => self.fields.push(FieldErrors {
                field,
                messages: vec![message],
            }),
        }
    }

    /// Append everything from `other`, keeping order.
    pub fn merge(&mut self, other: ErrorPayload) {
        self.general.extend(other.general);
        for entry in other.fields {
            for message in entry.messages {
                self.add_field(entry.field.clone(), message);
            }
        }
    }

    /// General errors in insertion order.
    pub fn general(&self) -> &[String] {
        &self.general
    }

    /// Field errors in order of first appearance.
    pub fn fields(&self) -> &[FieldErrors] {
        &self.fields
    }

    /// Messages for one field.
    pub fn field(&self, name: &str) -> Option<&[String]> {
        self.fields
            .iter()
            .find(|f| f.field == name)
            .map(|f| f.messages.as_slice())
    }

    /// Total number of messages, general and field-scoped.
    pub fn len(&self) -> usize {
        self.general.len() + self.fields.iter().map(|f| f.messages.len()).sum::<usize>()
    }

    /// True when no error has been recorded.
    pub fn is_empty(&self) -> bool {
        self.general.is_empty() && self.fields.is_empty()
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for message in &self.general {
            if !first {
                f.write_str("; ")?;
            }
            f.write_str(message)?;
            first = false;
        }
        for entry in &self.fields {
            for message in &entry.messages {
                if !first {
                    f.write_str("; ")?;
                }
                write!(f, "{}: {}", entry.field, message)?;
                first = false;
            }
        }
        if first {
            f.write_str("no errors")?;
        }
        Ok(())
    }
}

/// Optional per-call transport options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Deadline for the whole call, measured from dispatch.
    pub timeout: Option<Duration>,
    /// Key/value metadata sent with a remote call.
    pub metadata: HashMap<String, String>,
}

impl CallOptions {
    /// Create empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the call deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

struct ContextInner {
    cancel: CancellationToken,
    options: CallOptions,
    errors: Mutex<ErrorPayload>,
}

/// Context shared by the caller and the handler of one call.
///
/// `ExecutionContext` is `Clone`; clones share the same cancellation token and
/// error accumulator. Create a fresh context per call.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

impl ExecutionContext {
    /// Create a context with default options and its own cancellation token.
    pub fn new() -> Self {
        Self::build(CancellationToken::new(), CallOptions::default())
    }

    /// Create a context with call options.
    pub fn with_options(options: CallOptions) -> Self {
        Self::build(CancellationToken::new(), options)
    }

    /// Create a context observing an existing cancellation token.
    pub fn with_token(cancel: CancellationToken, options: CallOptions) -> Self {
        Self::build(cancel, options)
    }

    fn build(cancel: CancellationToken, options: CallOptions) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                cancel,
                options,
                errors: Mutex::new(ErrorPayload::new()),
            }),
        }
    }

    /// Call options.
    #[inline]
    pub fn options(&self) -> &CallOptions {
        &self.inner.options
    }

    /// Metadata value for `key`.
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.inner.options.metadata.get(key).map(|s| s.as_str())
    }

    /// The cancellation token for this call.
    #[inline]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Request cancellation of the call.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// Whether cancellation has been requested.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Wait until cancellation is requested.
    pub async fn cancelled(&self) {
        self.inner.cancel.cancelled().await
    }

    /// Return `Err(Cancelled)` if cancellation has been requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        Ok(())
    }

    /// Record a general error.
    pub fn add_error(&self, message: impl Into<String>) {
        self.inner.errors.lock().add_general(message);
    }

    /// Record an error for `field`.
    pub fn add_field_error(&self, field: impl Into<String>, message: impl Into<String>) {
        self.inner.errors.lock().add_field(field, message);
    }

    /// Whether any error has been recorded.
    pub fn has_errors(&self) -> bool {
        !self.inner.errors.lock().is_empty()
    }

    /// Snapshot of the accumulated errors.
    pub fn errors(&self) -> ErrorPayload {
        self.inner.errors.lock().clone()
    }

    /// Append errors produced elsewhere (a remote handler).
    pub fn merge_errors(&self, payload: ErrorPayload) {
        if payload.is_empty() {
            return;
        }
        self.inner.errors.lock().merge(payload);
    }

    /// Turn a finished execution into the caller-visible outcome.
    ///
    /// A success with a non-empty accumulator becomes `ValidationFailed`.
    /// A `ValidationFailed` raised by the handler is folded into the
    /// accumulator so the returned payload is always the full accumulator.
    pub(crate) fn settle<T>(&self, result: Result<T>) -> Result<T> {
        match result {
            Ok(_) if self.has_errors() => Err(DispatchError::ValidationFailed(self.errors())),
            Ok(value) => Ok(value),
            Err(DispatchError::ValidationFailed(payload)) => {
                self.merge_errors(payload);
                Err(DispatchError::ValidationFailed(self.errors()))
            }
            Err(e) => Err(e),
        }
    }

    /// Deadline for a call dispatched now. A timeout too large to represent
    /// means no deadline.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.inner
            .options
            .timeout
            .and_then(|limit| Instant::now().checked_add(limit))
    }

    /// Run `fut` under this context's cancellation and deadline.
    pub(crate) async fn guard<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        self.guard_until(self.deadline(), fut).await
    }

    /// Run `fut` under cancellation and a fixed deadline.
    ///
    /// Cancellation wins over completion when both are ready.
    pub(crate) async fn guard_until<T>(
        &self,
        deadline: Option<Instant>,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let bounded = async {
            match deadline {
                Some(at) => tokio::time::timeout_at(at, fut)
                    .await
                    .unwrap_or(Err(DispatchError::DeadlineExceeded)),
                None => fut.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(DispatchError::Cancelled),
            result = bounded => result,
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("cancelled", &self.is_cancelled())
            .field("options", &self.inner.options)
            .field("errors", &*self.inner.errors.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_keeps_order() {
        let mut payload = ErrorPayload::new();
        payload.add_general("first");
        payload.add_field("name", "required");
        payload.add_general("second");
        payload.add_field("age", "too low");
        payload.add_field("name", "too short");

        assert_eq!(payload.general(), ["first", "second"]);
        assert_eq!(payload.fields()[0].field, "name");
        assert_eq!(payload.fields()[1].field, "age");
        assert_eq!(payload.field("name").unwrap(), ["required", "too short"]);
        assert_eq!(payload.len(), 5);
    }

    #[test]
    fn test_payload_merge_appends() {
        let mut left = ErrorPayload::new();
        left.add_field("name", "required");

        let mut right = ErrorPayload::new();
        right.add_general("remote");
        right.add_field("name", "taken");
        right.add_field("email", "invalid");

        left.merge(right);

        assert_eq!(left.general(), ["remote"]);
        assert_eq!(left.field("name").unwrap(), ["required", "taken"]);
        assert_eq!(left.field("email").unwrap(), ["invalid"]);
    }

    #[test]
    fn test_payload_display() {
        let mut payload = ErrorPayload::new();
        assert_eq!(payload.to_string(), "no errors");

        payload.add_general("closed");
        payload.add_field("qty", "negative");
        assert_eq!(payload.to_string(), "closed; qty: negative");
    }

    #[test]
    fn test_context_clones_share_state() {
        let ctx = ExecutionContext::new();
        let handler_side = ctx.clone();

        handler_side.add_field_error("name", "required");
        handler_side.cancel();

        assert!(ctx.has_errors());
        assert!(ctx.is_cancelled());
        assert!(matches!(ctx.check_cancelled(), Err(DispatchError::Cancelled)));
    }

    #[test]
    fn test_settle_success_with_errors_is_validation_failure() {
        let ctx = ExecutionContext::new();
        ctx.add_error("nope");

        match ctx.settle(Ok(42)) {
            Err(DispatchError::ValidationFailed(p)) => assert_eq!(p.general(), ["nope"]),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_settle_folds_explicit_validation_error() {
        let ctx = ExecutionContext::new();
        ctx.add_error("from accumulator");

        let mut explicit = ErrorPayload::new();
        explicit.add_field("sku", "unknown");

        match ctx.settle::<()>(Err(DispatchError::ValidationFailed(explicit))) {
            Err(DispatchError::ValidationFailed(p)) => {
                assert_eq!(p.general(), ["from accumulator"]);
                assert_eq!(p.field("sku").unwrap(), ["unknown"]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_call_options_builder() {
        let options = CallOptions::new()
            .timeout(Duration::from_secs(3))
            .metadata("tenant", "acme");

        let ctx = ExecutionContext::with_options(options);
        assert_eq!(ctx.options().timeout, Some(Duration::from_secs(3)));
        assert_eq!(ctx.metadata("tenant"), Some("acme"));
        assert_eq!(ctx.metadata("missing"), None);
    }

    #[tokio::test]
    async fn test_guard_deadline() {
        let ctx = ExecutionContext::with_options(CallOptions::new().timeout(Duration::from_millis(20)));
        let result = ctx
            .guard(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(DispatchError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_unrepresentable_timeout_means_no_deadline() {
        let ctx = ExecutionContext::with_options(CallOptions::new().timeout(Duration::MAX));
        assert!(ctx.deadline().is_none());

        let result = ctx.guard(async { Ok(5) }).await;
        assert_eq!(result.unwrap(), 5);

        let bounded = ExecutionContext::with_options(CallOptions::new().timeout(Duration::from_secs(1)));
        assert!(bounded.deadline().is_some());
    }

    #[tokio::test]
    async fn test_guard_cancellation() {
        let ctx = ExecutionContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result = ctx.guard(std::future::pending::<Result<()>>()).await;
        assert!(matches!(result, Err(DispatchError::Cancelled)));
    }

    #[tokio::test]
    async fn test_guard_passes_result_through() {
        let ctx = ExecutionContext::new();
        assert_eq!(ctx.guard(async { Ok(7) }).await.unwrap(), 7);
    }
}
