// Copyright The pvelb Authors
// SPDX-License-Identifier: Apache-2.0

//! The operator notification contract.
//!
//! Delivery (SMTP or anything else) is an external collaborator; the engine
//! only knows this trait. Implementations must never fail the caller: a
//! notification that cannot be delivered is logged and dropped.

use async_trait::async_trait;
use tracing::warn;

/// Delivers out-of-band notifications to the operator.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers one message. Infallible by contract; implementations swallow
    /// and log their own delivery problems.
    async fn notify(&self, message: &str);
}

/// Fallback notifier that surfaces messages through the log stream only.
/// Used when mail sending is switched off or unconfigured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl LogNotifier {
    /// A new log-only notifier.
    #[must_use]
    pub fn new() -> Self {
        LogNotifier
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str) {
        warn!(message, "operator notification");
    }
}
