//! Background watcher for device attach and removal.
//!
//! One worker thread per listener blocks in the platform status change
//! call. Reader set membership changes are tracked through the virtual
//! notification entry, with a probe-detected polling fallback for
//! platforms that do not signal it; card presence transitions become
//! [`DeviceEvent`]s delivered to every subscribed handler.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::connection::Device;
use crate::error::SmartCardError;
use crate::pcsc::{Pcsc, ReaderState, ScardError, Scope, StateFlags};

const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A card arrival or removal observed on a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Arrived(Device),
    Removed(Device),
}

/// Token returned by [`DeviceListener::subscribe`]; used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerKey(usize);

type EventHandler = dyn Fn(&DeviceEvent) + Send + Sync;

struct Worker {
    thread: JoinHandle<()>,
    done: mpsc::Receiver<()>,
}

struct ListenerState<C> {
    context: Option<Arc<C>>,
    worker: Option<Worker>,
}

struct Shared<B: Pcsc> {
    backend: B,
    state: Mutex<ListenerState<B::Context>>,
    handlers: Mutex<BTreeMap<usize, Arc<EventHandler>>>,
    next_key: AtomicUsize,
    stop: AtomicBool,
}

/// Watches for card arrival and removal across all readers.
pub struct DeviceListener<B>
where
    B: Pcsc + Clone + Send + Sync + 'static,
{
    shared: Arc<Shared<B>>,
}

impl<B> DeviceListener<B>
where
    B: Pcsc + Clone + Send + Sync + 'static,
{
    pub fn new(backend: B) -> Self {
        DeviceListener {
            shared: Arc::new(Shared {
                backend,
                state: Mutex::new(ListenerState {
                    context: None,
                    worker: None,
                }),
                handlers: Mutex::new(BTreeMap::new()),
                next_key: AtomicUsize::new(0),
                stop: AtomicBool::new(false),
            }),
        }
    }

    /// Subscribe to all device events. Handlers run on the worker thread;
    /// a panicking handler is logged and does not affect the others.
    pub fn subscribe(&self, handler: impl Fn(&DeviceEvent) + Send + Sync + 'static) -> HandlerKey {
        let key = self.shared.next_key.fetch_add(1, Ordering::Relaxed);
        self.shared.handlers.lock().insert(key, Arc::new(handler));

        HandlerKey(key)
    }

    pub fn on_arrived(&self, handler: impl Fn(&Device) + Send + Sync + 'static) -> HandlerKey {
        self.subscribe(move |event| {
            if let DeviceEvent::Arrived(device) = event {
                handler(device);
            }
        })
    }

    pub fn on_removed(&self, handler: impl Fn(&Device) + Send + Sync + 'static) -> HandlerKey {
        self.subscribe(move |event| {
            if let DeviceEvent::Removed(device) = event {
                handler(device);
            }
        })
    }

    pub fn unsubscribe(&self, key: HandlerKey) {
        self.shared.handlers.lock().remove(&key.0);
    }

    /// Start the worker. Starting an already running listener is a no-op;
    /// if the context cannot be established no worker runs and no events
    /// are ever emitted.
    pub fn start(&self) -> Result<(), SmartCardError> {
        let mut state = self.shared.state.lock();
        if state.worker.is_some() {
            return Ok(());
        }

        self.shared.stop.store(false, Ordering::SeqCst);
        let context = Arc::new(self.shared.backend.establish(Scope::User)?);
        state.context = Some(Arc::clone(&context));

        let (done_tx, done_rx) = mpsc::channel();
        let backend = self.shared.backend.clone();
        let shared = Arc::clone(&self.shared);
        let thread = thread::Builder::new()
            .name("device-listener".into())
            .spawn(move || run_worker(backend, shared, done_tx))?;

        state.worker = Some(Worker {
            thread,
            done: done_rx,
        });
        info!("device listener started");

        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().worker.is_some()
    }

    /// Stop the worker: cancel the blocking wait, signal the stop flag and
    /// join with a bounded timeout. Stopping twice is a no-op.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);

        let worker = {
            let mut state = self.shared.state.lock();
            if let Some(context) = state.context.as_ref() {
                let _ = self.shared.backend.cancel(context);
            }
            state.worker.take()
        };

        let joined = match worker {
            Some(worker) => match worker.done.recv_timeout(WORKER_JOIN_TIMEOUT) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    let _ = worker.thread.join();
                    true
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!("device listener worker did not stop within {WORKER_JOIN_TIMEOUT:?}");
                    false
                }
            },
            None => true,
        };

        // Only release the context once the worker can no longer touch it.
        if joined {
            let mut state = self.shared.state.lock();
            if let Some(context) = state.context.take() {
                self.shared.backend.release(&context);
            }
        }

        info!("device listener stopped");
    }
}

impl<B> Drop for DeviceListener<B>
where
    B: Pcsc + Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.stop();
    }
}

fn current_context<B: Pcsc>(shared: &Shared<B>) -> Option<Arc<B::Context>> {
    shared.state.lock().context.clone()
}

fn emit<B: Pcsc>(shared: &Shared<B>, event: &DeviceEvent) {
    debug!(?event, "device event");

    let handlers: Vec<Arc<EventHandler>> = shared.handlers.lock().values().cloned().collect();
    for handler in handlers {
        if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
            warn!("device event handler panicked");
        }
    }
}

/// One-shot probe: a platform that reports the notification reader as
/// unknown will not signal reader list changes through it, so membership
/// has to be detected by comparing reader counts.
fn probe_pnp_workaround<B: Pcsc>(backend: &B, context: &B::Context) -> bool {
    let mut states = [ReaderState::pnp_notification()];

    match backend.get_status_change(context, Some(Duration::ZERO), &mut states) {
        Ok(()) => states[0].event.contains(StateFlags::UNKNOWN),
        Err(_) => false,
    }
}

/// Reconcile the tracked reader list with the platform's: drop vanished
/// readers (emitting removals for those that still held a card), append new
/// ones and probe their initial state.
fn sync_reader_list<B: Pcsc>(
    backend: &B,
    context: &B::Context,
    states: &mut Vec<ReaderState>,
    shared: &Shared<B>,
) -> Result<(), ScardError> {
    let names = backend.list_readers(context)?;

    let mut kept = Vec::with_capacity(names.len() + 1);
    for state in states.drain(..) {
        if state.is_pnp_notification() || names.iter().any(|name| *name == state.name) {
            kept.push(state);
        } else {
            if state.current.contains(StateFlags::PRESENT) {
                emit(shared, &DeviceEvent::Removed(Device::new(state.name, state.atr)));
            } else {
                debug!(reader = %state.name, "reader removed");
            }
        }
    }

    let added: Vec<String> = names
        .into_iter()
        .filter(|name| !kept.iter().any(|state| state.name == *name))
        .collect();

    if !added.is_empty() {
        let mut added_states: Vec<ReaderState> = added.into_iter().map(ReaderState::new).collect();
        // Populate presence and ATRs for the new entries; a timeout simply
        // means nothing is known yet.
        let _ = backend.get_status_change(context, Some(Duration::ZERO), &mut added_states);
        kept.extend(added_states);
    }

    *states = kept;

    Ok(())
}

fn reestablish<B: Pcsc>(backend: &B, shared: &Shared<B>) -> bool {
    let mut state = shared.state.lock();
    if let Some(old) = state.context.take() {
        backend.release(&old);
    }

    match backend.establish(Scope::User) {
        Ok(context) => {
            state.context = Some(Arc::new(context));
            true
        }
        Err(error) => {
            warn!(%error, "could not re-establish smart card context");
            false
        }
    }
}

fn run_worker<B>(backend: B, shared: Arc<Shared<B>>, done: mpsc::Sender<()>)
where
    B: Pcsc + Clone + Send + Sync + 'static,
{
    let Some(context) = current_context(&shared) else {
        let _ = done.send(());
        return;
    };

    let use_polling_workaround = probe_pnp_workaround(&backend, &context);
    if use_polling_workaround {
        debug!("platform does not signal reader list changes, using polling fallback");
    }

    let mut states = vec![ReaderState::pnp_notification()];
    prime_states(&backend, &context, &mut states, &shared);
    drop(context);

    'main: while !shared.stop.load(Ordering::SeqCst) {
        let Some(context) = current_context(&shared) else {
            break;
        };

        match backend.get_status_change(&context, None, &mut states) {
            Ok(()) => {}
            Err(ScardError::Cancelled) => break,
            Err(error) if error.is_service_unavailable() => {
                debug!(%error, "smart card service lost, re-establishing");
                if !reestablish(&backend, &shared) {
                    break;
                }
                // Keep the tracked entries: presence transitions that
                // happened during the outage surface on the next wait.
                if let Some(context) = current_context(&shared) {
                    let _ = sync_reader_list(&backend, &context, &mut states, &shared);
                }
                continue;
            }
            Err(error) => {
                warn!(%error, "status change wait failed");
                break;
            }
        }

        // Reader list changes, iterated until quiescent.
        loop {
            if shared.stop.load(Ordering::SeqCst) {
                break 'main;
            }

            let changed = if use_polling_workaround {
                backend
                    .list_readers(&context)
                    .map(|names| names.len() != states.len() - 1)
                    .unwrap_or(false)
            } else {
                states[0].event.contains(StateFlags::CHANGED)
            };
            if !changed {
                break;
            }

            states[0].sync_current_state();
            states[0].event.remove(StateFlags::CHANGED);
            if sync_reader_list(&backend, &context, &mut states, &shared).is_err() {
                break;
            }
        }

        // Card presence transitions.
        for state in states.iter_mut().skip(1) {
            let was_present = state.current.contains(StateFlags::PRESENT);
            let now_present = state.event.contains(StateFlags::PRESENT);

            if was_present != now_present {
                let device = Device::new(state.name.clone(), state.atr.clone());
                let event = if now_present {
                    DeviceEvent::Arrived(device)
                } else {
                    DeviceEvent::Removed(device)
                };
                emit(&shared, &event);
            }

            state.sync_current_state();
        }
        states[0].sync_current_state();
    }

    let _ = done.send(());
}

/// Populate the initial reader list and acknowledge current card state so
/// that only transitions observed from here on produce events.
fn prime_states<B: Pcsc>(backend: &B, context: &B::Context, states: &mut Vec<ReaderState>, shared: &Shared<B>) {
    if let Err(error) = sync_reader_list(backend, context, states, shared) {
        warn!(%error, "could not build initial reader list");
    }

    let _ = backend.get_status_change(context, Some(Duration::ZERO), states);
    for state in states.iter_mut() {
        state.sync_current_state();
        state.event.remove(StateFlags::CHANGED);
    }
}
