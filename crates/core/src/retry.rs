//! Failure handling
//!
//! Every step error funnels into [`Balancer::fail`]. Backend-side failures
//! while sending the request are retried on another selection; everything
//! else ends the request with the fixed error response, or silently when the
//! client can no longer be written to.

use std::time::Instant;

use crate::engine::Balancer;
use crate::error::ProxyError;
use crate::io::Network;
use crate::pool::{ContextId, State};
use crate::slots::Interest;

impl<N: Network> Balancer<N> {
    /// Route a step error for one context
    pub(crate) fn fail(&mut self, id: ContextId, err: ProxyError) {
        let Some(state) = self.pool.get(id).map(|c| c.state) else {
            return;
        };

        match state {
            State::SendingRequest => self.retry(id, err),
            State::ReceivingRequest | State::ReceivingResponse => {
                tracing::warn!(context = id.index(), ?state, error = %err, "request failed");
                self.enter_error(id);
            }
            State::SendingResponse | State::Error => {
                tracing::debug!(context = id.index(), ?state, error = %err, "client write failed");
                if let Some(ctx) = self.pool.get_mut(id) {
                    ctx.state = State::Done;
                }
            }
            State::Done => {}
        }
    }

    fn retry(&mut self, id: ContextId, err: ProxyError) {
        let Some(ctx) = self.pool.get(id) else {
            return;
        };
        let failed = ctx.backend_idx;
        let tries = ctx.tries;

        if let (Some(idx), false) = (failed, err.is_selection_failure()) {
            self.backends
                .record_error(idx, self.limits.max_backend_errors, Instant::now());
        }
        tracing::warn!(
            context = id.index(),
            backend = ?failed,
            attempt = tries,
            error = %err,
            "backend attempt failed"
        );
        self.close_backend(id);

        if tries < self.limits.max_tries {
            match self.policy.select(&self.backends) {
                Ok(next) => {
                    if let Some(ctx) = self.pool.get_mut(id) {
                        ctx.backend_idx = Some(next);
                        ctx.tries += 1;
                        ctx.cursor = 0;
                        tracing::debug!(
                            context = id.index(),
                            backend = next,
                            attempt = ctx.tries,
                            "retrying"
                        );
                    }
                    return;
                }
                Err(err) => {
                    tracing::warn!(
                        context = id.index(),
                        error = %err,
                        "no backend left to retry on"
                    );
                }
            }
        }

        self.enter_error(id);
    }

    /// Switch a context to writing the error response
    fn enter_error(&mut self, id: ContextId) {
        let Some(ctx) = self.pool.get_mut(id) else {
            return;
        };

        ctx.state = State::Error;
        ctx.cursor = 0;

        if let Err(err) = self
            .network
            .reregister(&mut ctx.client, ctx.client_slot, Interest::Writable)
        {
            tracing::debug!(context = id.index(), error = %err, "client unusable, dropping");
            ctx.state = State::Done;
        }
    }
}
