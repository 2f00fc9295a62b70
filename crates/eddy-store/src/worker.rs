use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread;

use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::command::Command;
use crate::error::{StoreError, StoreResult};
use crate::state::StoreState;
use crate::store::EntityStore;

/// The single consumer of a store's mailbox.
pub(crate) struct Worker {
    pub(crate) state: Arc<StoreState>,
    mailbox: mpsc::WeakUnboundedSender<Command>,
}

impl Worker {
    /// A fresh handle to the store, while any other handle is alive.
    pub(crate) fn handle(&self) -> Option<EntityStore> {
        self.mailbox
            .upgrade()
            .map(|sender| EntityStore::from_parts(Arc::clone(&self.state), sender))
    }
}

/// Start the worker thread for `state` and return its mailbox.
///
/// The worker drives a current-thread runtime on a dedicated OS thread and
/// applies commands one at a time, in post order. It keeps only a weak
/// sender, so it stops once every store handle is dropped.
pub(crate) fn spawn(state: Arc<StoreState>) -> StoreResult<mpsc::UnboundedSender<Command>> {
    let (sender, receiver) = mpsc::unbounded_channel();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(StoreError::WorkerSpawn)?;
    let name = state.config.worker_thread_name.clone();
    let worker = Worker {
        state,
        mailbox: sender.downgrade(),
    };

    thread::Builder::new()
        .name(name.clone())
        .spawn(move || runtime.block_on(run(worker, receiver)))
        .map_err(StoreError::WorkerSpawn)?;

    info!(thread = %name, "store worker started");
    Ok(sender)
}

async fn run(worker: Worker, mut receiver: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = receiver.recv().await {
        let name = command.name();
        debug!(command = name, "applying command");

        // A failing or panicking command must not take the mailbox down.
        let outcome = AssertUnwindSafe(command.apply(&worker))
            .catch_unwind()
            .await;
        let failure = match outcome {
            Ok(Ok(())) => continue,
            Ok(Err(error)) => {
                warn!(command = name, %error, "command failed");
                error
            }
            Err(payload) => {
                let error = StoreError::Panicked(panic_message(payload.as_ref()));
                error!(command = name, %error, "command panicked");
                error
            }
        };
        let reported = std::panic::catch_unwind(AssertUnwindSafe(|| {
            worker.state.dispatcher.on_error(&failure)
        }));
        if let Err(payload) = reported {
            error!(
                command = name,
                panic = %panic_message(payload.as_ref()),
                "error handler panicked"
            );
        }
    }
    info!("store worker stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic".to_string()
    }
}
