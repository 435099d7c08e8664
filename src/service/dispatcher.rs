//! The host scheduler.
//!
//! One actor plays the part of the host's single logical thread: every
//! completion callback and every host task runs inside its handler, one at a
//! time. Units of work run on spawned tokio tasks (the worker contexts) and
//! report back by message; the actor delivers their results strictly in
//! submission order.

use crate::config::DispatchSettings;
use crate::error::{DatabaseError, TickError};
use crate::types::result::AsyncResult;
use crate::types::unit::UnitOfWork;
use futures::FutureExt;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

/// Work to run on the host thread.
pub type HostTask = Box<dyn FnOnce() + Send + 'static>;

/// Completion callback for one unit of work.
pub type Completion = Box<dyn FnOnce(AsyncResult) + Send + 'static>;

pub enum DispatcherMessage {
    /// Run `unit` in a worker; hand its result to `on_complete` on the host.
    Submit {
        unit: UnitOfWork,
        on_complete: Completion,
    },
    /// Run a task on the host thread.
    RunOnHost(HostTask),
    /// Resolve once everything submitted before this message has delivered.
    Flush(RpcReplyPort<()>),

    // Internal messages (sent by workers)
    /// A worker finished the unit with this ticket.
    Completed { ticket: u64, result: AsyncResult },
}

impl fmt::Debug for DispatcherMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatcherMessage::Submit { unit, .. } => {
                f.debug_struct("Submit").field("unit", unit).finish_non_exhaustive()
            }
            DispatcherMessage::RunOnHost(_) => f.write_str("RunOnHost"),
            DispatcherMessage::Flush(_) => f.write_str("Flush"),
            DispatcherMessage::Completed { ticket, result } => f
                .debug_struct("Completed")
                .field("ticket", ticket)
                .field("is_error", &result.is_error())
                .finish(),
        }
    }
}

/// Handle for submitting work to the host scheduler.
#[derive(Clone)]
pub struct Dispatcher {
    actor: ActorRef<DispatcherMessage>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("actor", &self.actor.get_id())
            .finish()
    }
}

impl Dispatcher {
    /// Queue `unit` for a worker. Returns immediately; `on_complete` fires
    /// exactly once on the host thread, never from inside this call.
    pub fn submit<F>(&self, unit: UnitOfWork, on_complete: F) -> Result<(), TickError>
    where
        F: FnOnce(AsyncResult) + Send + 'static,
    {
        ractor::cast!(
            self.actor,
            DispatcherMessage::Submit {
                unit,
                on_complete: Box::new(on_complete),
            }
        )
        .map_err(|e| {
            warn!(error = %e, "dispatcher unreachable; unit of work dropped");
            TickError::RactorError(format!("Submit failed: {e}"))
        })
    }

    pub fn run_on_host<F>(&self, task: F) -> Result<(), TickError>
    where
        F: FnOnce() + Send + 'static,
    {
        ractor::cast!(self.actor, DispatcherMessage::RunOnHost(Box::new(task)))
            .map_err(|e| TickError::RactorError(format!("RunOnHost failed: {e}")))
    }

    /// Wait until every unit submitted before this call has been delivered.
    pub async fn flush(&self) -> Result<(), TickError> {
        ractor::call!(self.actor, DispatcherMessage::Flush)
            .map_err(|e| TickError::RactorError(format!("Flush RPC failed: {e}")))
    }

    pub fn stop(&self) {
        self.actor.stop(None);
    }
}

struct DispatcherState {
    next_ticket: u64,
    /// Ticket whose result is delivered next.
    next_delivery: u64,
    callbacks: BTreeMap<u64, Completion>,
    parked: BTreeMap<u64, AsyncResult>,
    flush_waiters: Vec<(u64, RpcReplyPort<()>)>,
    workers: Option<Arc<Semaphore>>,
}

impl DispatcherState {
    fn deliver_ready(&mut self) {
        while let Some(result) = self.parked.remove(&self.next_delivery) {
            let ticket = self.next_delivery;
            self.next_delivery += 1;
            let Some(callback) = self.callbacks.remove(&ticket) else {
                warn!(ticket, "no callback registered for completed unit");
                continue;
            };
            debug!(ticket, is_error = result.is_error(), "delivering result");
            run_guarded("completion callback", move || callback(result));
        }

        let delivered = self.next_delivery;
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.flush_waiters)
            .into_iter()
            .partition(|(bound, _)| *bound <= delivered);
        self.flush_waiters = waiting;
        for (_, reply) in ready {
            let _ = reply.send(());
        }
    }
}

struct DispatcherActor;

#[ractor::async_trait]
impl Actor for DispatcherActor {
    type Msg = DispatcherMessage;
    type State = DispatcherState;
    type Arguments = DispatchSettings;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        settings: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        debug!(max_workers = ?settings.max_workers, "dispatcher starting");
        Ok(DispatcherState {
            next_ticket: 0,
            next_delivery: 0,
            callbacks: BTreeMap::new(),
            parked: BTreeMap::new(),
            flush_waiters: Vec::new(),
            workers: settings
                .max_workers
                .map(|n| Arc::new(Semaphore::new(n.max(1)))),
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            DispatcherMessage::Submit { unit, on_complete } => {
                let ticket = state.next_ticket;
                state.next_ticket += 1;
                state.callbacks.insert(ticket, on_complete);
                spawn_worker(myself, ticket, unit, state.workers.clone());
            }
            DispatcherMessage::RunOnHost(task) => {
                run_guarded("host task", task);
            }
            DispatcherMessage::Flush(reply) => {
                if state.next_delivery >= state.next_ticket {
                    let _ = reply.send(());
                } else {
                    state.flush_waiters.push((state.next_ticket, reply));
                }
            }
            DispatcherMessage::Completed { ticket, result } => {
                state.parked.insert(ticket, result);
                state.deliver_ready();
            }
        }
        Ok(())
    }
}

fn spawn_worker(
    myself: ActorRef<DispatcherMessage>,
    ticket: u64,
    unit: UnitOfWork,
    workers: Option<Arc<Semaphore>>,
) {
    tokio::spawn(async move {
        let _permit = match workers {
            Some(sem) => sem.acquire_owned().await.ok(),
            None => None,
        };
        let what = unit.describe();
        debug!(ticket, what, "worker running unit");
        let result = AssertUnwindSafe(unit.run())
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                AsyncResult::Error(DatabaseError::new(format!(
                    "{what} worker panicked: {}",
                    panic_message(&*panic)
                )))
            });
        if let Err(e) = ractor::cast!(myself, DispatcherMessage::Completed { ticket, result }) {
            warn!(ticket, error = %e, "dispatcher gone; result discarded");
        }
    });
}

fn run_guarded(what: &str, f: impl FnOnce()) {
    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(f)) {
        error!(what, panic = %panic_message(&*panic), "panic on host thread");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

pub async fn spawn(settings: DispatchSettings) -> Result<Dispatcher, TickError> {
    let (actor, _jh) = Actor::spawn(None, DispatcherActor, settings)
        .await
        .map_err(|e| TickError::RactorError(format!("failed to spawn dispatcher: {e}")))?;
    Ok(Dispatcher { actor })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn host_tasks_run_in_order_and_survive_panics() {
        let dispatcher = spawn(DispatchSettings::default()).await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let first = tx.clone();
        dispatcher.run_on_host(move || first.send(1).unwrap()).unwrap();
        dispatcher.run_on_host(|| panic!("boom")).unwrap();
        dispatcher.run_on_host(move || tx.send(2).unwrap()).unwrap();

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        dispatcher.flush().await.unwrap();
        dispatcher.stop();
    }

    #[test]
    fn panic_payloads_are_readable() {
        let payload: Box<dyn Any + Send> = Box::new(String::from("bad row"));
        assert_eq!(panic_message(&*payload), "bad row");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*payload), "unknown panic");
    }
}
