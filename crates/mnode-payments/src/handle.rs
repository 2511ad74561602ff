//! Running payment loop handle
//!
//! A loop runs on its own tokio task. The handle carries the stop signal
//! in and the errors out; the error channel closes when the task exits,
//! which is the only join point. A loop waits for room in the channel
//! rather than dropping errors, unless a stop was requested.

use crate::error::PaymentError;
use std::future::Future;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Errors buffered for a caller that is not reading yet
const ERROR_BUFFER: usize = 16;

/// Stop signal as seen from inside the loop
pub(crate) type StopSignal = watch::Receiver<bool>;

/// Handle to a spawned payment loop
#[derive(Debug)]
pub struct PaymentLoop {
    stop: watch::Sender<bool>,
    errors: mpsc::Receiver<PaymentError>,
}

impl PaymentLoop {
    /// Spawn `run` on the current tokio runtime
    pub(crate) fn spawn<F, Fut>(run: F) -> Self
    where
        F: FnOnce(StopSignal, ErrorSink) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, stop_rx) = watch::channel(false);
        let (tx, errors) = mpsc::channel(ERROR_BUFFER);
        tokio::spawn(run(stop_rx, ErrorSink { tx }));
        Self { stop, errors }
    }

    /// Ask the loop to exit. The current cycle is not interrupted
    /// mid-call, but no new one starts. Idempotent, also after exit.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Next error, or `None` once the loop has exited
    pub async fn recv(&mut self) -> Option<PaymentError> {
        self.errors.recv().await
    }

    /// Everything the loop still reports until it exits
    pub async fn drain(&mut self) -> Vec<PaymentError> {
        let mut errors = Vec::new();
        while let Some(err) = self.recv().await {
            errors.push(err);
        }
        errors
    }
}

/// Sending half of the error channel
pub(crate) struct ErrorSink {
    tx: mpsc::Sender<PaymentError>,
}

impl ErrorSink {
    /// Surface an error the loop survives, waiting for the reader to make
    /// room. Gives up once a stop is requested.
    pub(crate) async fn report(&self, err: PaymentError, stop: &mut StopSignal) {
        tokio::select! {
            biased;
            sent = self.tx.send(err) => {
                if sent.is_err() {
                    debug!("error receiver gone");
                }
            }
            _ = stopped(stop) => warn!("stop requested, dropping pending error"),
        }
    }

    /// Surface the error that ends the loop
    pub(crate) async fn fatal(self, err: PaymentError) {
        // receiver gone means nobody is interested any more
        let _ = self.tx.send(err).await;
    }
}

/// Resolves once a stop was requested or the handle is gone
pub(crate) async fn stopped(stop: &mut StopSignal) {
    if *stop.borrow_and_update() {
        return;
    }
    while stop.changed().await.is_ok() {
        if *stop.borrow_and_update() {
            return;
        }
    }
}
