// Copyright 2024-2026 muster-core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-request tracing span, opened at `requestInstance` and closed on release.

use tracing::Span;

/// Span covering one pool request's full lifetime, from intake through
/// instance selection, task execution, and release.
#[derive(Clone)]
pub struct RequestSpan {
    span: Span,
}

impl RequestSpan {
    pub fn open(model: &str, sequence: u64, task_kind: &str) -> Self {
        let span = tracing::info_span!(
            "pool_request",
            model = model,
            sequence = sequence,
            task_kind = task_kind,
            instance_id = tracing::field::Empty,
        );
        Self { span }
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }

    pub fn record_instance(&self, instance_id: &str) {
        self.span.record("instance_id", instance_id);
    }
}

/// Convenience extension for entering a span around an async block's poll.
pub trait SpanExt {
    fn in_request_span(self, span: &RequestSpan) -> tracing::instrument::Instrumented<Self>
    where
        Self: Sized + std::future::Future;
}

impl<F: std::future::Future> SpanExt for F {
    fn in_request_span(self, span: &RequestSpan) -> tracing::instrument::Instrumented<Self> {
        use tracing::Instrument;
        self.instrument(span.span.clone())
    }
}
