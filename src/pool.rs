//! Warm pool: pre-boots VMs so acquisition latency approaches zero, while
//! never letting one guest serve two callers.
//!
//! Each VM is tracked by a slot moving through `booting → warm → active →
//! dead`; dead is terminal and the slot leaves the registry.  Released
//! runners are destroyed, never recycled — a fresh boot replaces them in
//! the background.  Waiters queue FIFO and are served strictly in arrival
//! order as slots warm up.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use tokio::sync::{Notify, broadcast, oneshot};

use crate::error::CarapaceError;
use crate::runner::Guest;

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of warm VMs the pool converges toward.
    pub target_size: usize,
    /// Hard cap on live VMs (warm + booting + active).
    pub max_size: usize,
    /// Default deadline for `acquire` when the caller supplies none.
    pub acquire_timeout_ms: u64,
    /// Evict warm VMs older than this to limit state drift; `None`
    /// disables eviction.
    pub max_warm_age_ms: Option<u64>,
    /// Debounce between a refill trigger and the refill computation.
    pub refill_debounce_ms: u64,
    /// Delay before re-attempting a boot after a failure.
    pub boot_retry_delay_ms: u64,
    /// How long `start` waits for the first VM to warm.
    pub first_warm_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            target_size: 2,
            max_size: 4,
            acquire_timeout_ms: 30_000,
            max_warm_age_ms: None,
            refill_debounce_ms: 50,
            boot_retry_delay_ms: 5_000,
            first_warm_timeout_ms: 180_000,
        }
    }
}

/// Slot lifecycle.  `Dead` is terminal: the slot is removed from the
/// registry and its VM is never revived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Booting,
    Warm,
    Active,
}

struct Slot<V> {
    state: SlotState,
    vm: Option<Arc<V>>,
    /// Kept for operator-facing debugging; only `warm_at` drives policy.
    #[allow(dead_code)]
    created_at: Instant,
    warm_at: Option<Instant>,
    #[allow(dead_code)]
    acquired_at: Option<Instant>,
}

/// Notifications emitted as slots change state.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    Warm { slot: u64 },
    BootFailed { slot: u64 },
    Released { slot: u64 },
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub warm: usize,
    pub booting: usize,
    pub active: usize,
    /// Live (non-dead) slots.
    pub total: usize,
    pub waiters: usize,
    pub target_size: usize,
    pub max_size: usize,
}

struct Waiter<V> {
    id: u64,
    tx: oneshot::Sender<Result<Arc<V>, CarapaceError>>,
}

struct PoolInner<V> {
    slots: HashMap<u64, Slot<V>>,
    waiters: VecDeque<Waiter<V>>,
    target_size: usize,
    next_slot_id: u64,
    next_waiter_id: u64,
    started: bool,
    stopping: bool,
    last_boot_error: Option<String>,
}

type BootFn<V> = Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<V>, CarapaceError>> + Send + Sync>;

/// The pool itself.  Generic over the guest handle so scheduling logic is
/// exercised in tests with scripted guests; production uses `VmRunner`.
pub struct WarmPool<V: Guest> {
    config: PoolConfig,
    boot: BootFn<V>,
    inner: Mutex<PoolInner<V>>,
    refill_notify: Notify,
    events: broadcast::Sender<PoolEvent>,
    /// Handle back to the owning `Arc`, for the background tasks this
    /// pool spawns about itself.
    weak_self: Weak<WarmPool<V>>,
}

impl<V: Guest> WarmPool<V> {
    pub fn new(mut config: PoolConfig, boot: BootFn<V>) -> Arc<Self> {
        config.target_size = config.target_size.min(config.max_size);
        let (events, _) = broadcast::channel(64);
        Arc::new_cyclic(|weak| Self {
            inner: Mutex::new(PoolInner {
                slots: HashMap::new(),
                waiters: VecDeque::new(),
                target_size: config.target_size,
                next_slot_id: 0,
                next_waiter_id: 0,
                started: false,
                stopping: false,
                last_boot_error: None,
            }),
            config,
            boot,
            refill_notify: Notify::new(),
            events,
            weak_self: weak.clone(),
        })
    }

    fn strong(&self) -> Arc<Self> {
        self.weak_self.upgrade().expect("pool Arc still alive")
    }

    /// Subscribe to slot state-change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Mark the pool started, begin refilling, and block until at least
    /// one slot is warm — or fail when every initial boot attempt fails
    /// or the first-warm budget elapses.
    pub async fn start(&self) -> Result<(), CarapaceError> {
        {
            let mut inner = self.inner.lock().expect("pool lock poisoned");
            if inner.stopping {
                return Err(CarapaceError::PoolStopped);
            }
            if inner.started {
                return Ok(());
            }
            inner.started = true;
        }

        let pool = self.strong();
        tokio::spawn(async move { pool.refill_loop().await });

        let mut rx = self.events.subscribe();
        self.refill_notify.notify_one();

        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.config.first_warm_timeout_ms);
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(PoolEvent::Warm { .. })) => return Ok(()),
                Ok(Ok(PoolEvent::BootFailed { .. })) => {
                    let (stats, last_error) = {
                        let inner = self.inner.lock().expect("pool lock poisoned");
                        (count(&inner, self.config.max_size), inner.last_boot_error.clone())
                    };
                    if stats.warm == 0 && stats.booting == 0 {
                        return Err(CarapaceError::BootFailure {
                            message: format!(
                                "all initial boot attempts failed (last: {})",
                                last_error.unwrap_or_else(|| "unknown".into())
                            ),
                            serial_tail: None,
                        });
                    }
                }
                Ok(Ok(PoolEvent::Released { .. })) => {}
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(CarapaceError::PoolStopped);
                }
                Err(_) => {
                    return Err(CarapaceError::BootFailure {
                        message: format!(
                            "no VM warmed within {}ms",
                            self.config.first_warm_timeout_ms
                        ),
                        serial_tail: None,
                    });
                }
            }
        }
    }

    /// Take the oldest warm VM, or wait FIFO for one to warm up.
    pub async fn acquire(&self, timeout_ms: Option<u64>) -> Result<Arc<V>, CarapaceError> {
        let timeout = Duration::from_millis(timeout_ms.unwrap_or(self.config.acquire_timeout_ms));
        let started_waiting = Instant::now();

        let (rx, waiter_id) = {
            let mut inner = self.inner.lock().expect("pool lock poisoned");
            if !inner.started || inner.stopping {
                return Err(CarapaceError::PoolStopped);
            }

            let evicted = self.evict_stale(&mut inner);

            if let Some(vm) = self.take_oldest_warm(&mut inner) {
                drop(inner);
                self.shutdown_all(evicted);
                self.refill_notify.notify_one();
                return Ok(vm);
            }

            let (tx, rx) = oneshot::channel();
            let waiter_id = inner.next_waiter_id;
            inner.next_waiter_id += 1;
            inner.waiters.push_back(Waiter { id: waiter_id, tx });
            drop(inner);
            self.shutdown_all(evicted);
            (rx, waiter_id)
        };

        self.refill_notify.notify_one();

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without an answer; treat like a timeout.
            Ok(Err(_)) | Err(_) => {
                let mut inner = self.inner.lock().expect("pool lock poisoned");
                inner.waiters.retain(|w| w.id != waiter_id);
                drop(inner);
                Err(CarapaceError::PoolExhausted {
                    waited_ms: started_waiting.elapsed().as_millis() as u64,
                })
            }
        }
    }

    /// Destroy a previously acquired VM.  The slot dies, a background
    /// shutdown runs, and a refill is triggered.  Unknown VMs are shut
    /// down and otherwise ignored.
    pub fn release(&self, vm: &Arc<V>) {
        let slot_id = {
            let mut inner = self.inner.lock().expect("pool lock poisoned");
            let found = inner
                .slots
                .iter()
                .find(|(_, s)| s.vm.as_ref().is_some_and(|v| Arc::ptr_eq(v, vm)))
                .map(|(id, _)| *id);
            if let Some(id) = found {
                inner.slots.remove(&id);
            }
            found
        };

        match slot_id {
            Some(id) => {
                tracing::debug!(slot = id, vm = vm.id(), "released VM");
                let _ = self.events.send(PoolEvent::Released { slot: id });
            }
            None => tracing::warn!(vm = vm.id(), "release of unknown VM; destroying anyway"),
        }

        let vm = Arc::clone(vm);
        tokio::spawn(async move { vm.shutdown().await });
        self.refill_notify.notify_one();
    }

    /// Change the warm target (clamped to the hard cap).  Growth kicks the
    /// refill immediately; shrink lets the refill tick evict the surplus.
    pub fn resize(&self, new_target: usize) -> PoolStats {
        {
            let mut inner = self.inner.lock().expect("pool lock poisoned");
            inner.target_size = new_target.min(self.config.max_size);
        }
        self.refill_notify.notify_one();
        self.stats()
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().expect("pool lock poisoned");
        count(&inner, self.config.max_size)
    }

    pub fn status_line(&self) -> String {
        let s = self.stats();
        format!(
            "pool: warm={} booting={} active={} waiters={} target={} max={}",
            s.warm, s.booting, s.active, s.waiters, s.target_size, s.max_size
        )
    }

    /// Stop the pool: reject pending waiters, destroy every live VM in
    /// parallel, clear the registry.  Idempotent.
    pub async fn stop(&self) {
        let (waiters, vms) = {
            let mut inner = self.inner.lock().expect("pool lock poisoned");
            if inner.stopping {
                return;
            }
            inner.stopping = true;
            let waiters: Vec<_> = inner.waiters.drain(..).collect();
            let vms: Vec<_> = inner
                .slots
                .drain()
                .filter_map(|(_, slot)| slot.vm)
                .collect();
            (waiters, vms)
        };

        // Wake the refill loop so it observes `stopping` and exits.
        self.refill_notify.notify_one();

        for waiter in waiters {
            let _ = waiter.tx.send(Err(CarapaceError::PoolStopped));
        }

        let shutdowns = vms
            .into_iter()
            .map(|vm| async move { vm.shutdown().await });
        futures_util::future::join_all(shutdowns).await;
        tracing::info!("pool stopped");
    }

    // ── Refill machinery ─────────────────────────────────────────────

    async fn refill_loop(self: Arc<Self>) {
        loop {
            self.refill_notify.notified().await;
            if self.is_stopping() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(self.config.refill_debounce_ms)).await;
            if self.is_stopping() {
                return;
            }
            self.refill_once();
        }
    }

    /// One refill pass: boot `min(needed, can_boot)` VMs, or lazily evict
    /// surplus warm slots after a shrink.
    fn refill_once(&self) {
        let (to_boot, surplus) = {
            let mut inner = self.inner.lock().expect("pool lock poisoned");
            if !inner.started || inner.stopping {
                return;
            }
            let stats = count(&inner, self.config.max_size);
            let needed = inner
                .target_size
                .saturating_sub(stats.warm + stats.booting);
            let can_boot = self.config.max_size.saturating_sub(stats.total);
            let n = needed.min(can_boot);

            let mut slot_ids = Vec::with_capacity(n);
            for _ in 0..n {
                let id = inner.next_slot_id;
                inner.next_slot_id += 1;
                inner.slots.insert(
                    id,
                    Slot {
                        state: SlotState::Booting,
                        vm: None,
                        created_at: Instant::now(),
                        warm_at: None,
                        acquired_at: None,
                    },
                );
                slot_ids.push(id);
            }

            let surplus = if n == 0 {
                let excess = (stats.warm + stats.booting).saturating_sub(inner.target_size);
                self.take_excess_warm(&mut inner, excess)
            } else {
                Vec::new()
            };

            (slot_ids, surplus)
        };

        self.shutdown_all(surplus);

        for slot_id in to_boot {
            let pool = self.strong();
            let boot = Arc::clone(&self.boot);
            tokio::spawn(async move {
                let result = (boot)().await;
                pool.on_boot_complete(slot_id, result);
            });
        }
    }

    fn on_boot_complete(&self, slot_id: u64, result: Result<Arc<V>, CarapaceError>) {
        match result {
            Ok(vm) => {
                let leftover = {
                    let mut inner = self.inner.lock().expect("pool lock poisoned");
                    if inner.stopping || !inner.slots.contains_key(&slot_id) {
                        Some(vm)
                    } else {
                        // Serve the queue head directly if someone is
                        // waiting, else park the slot as warm.
                        let mut vm = Some(vm);
                        while let Some(waiter) = inner.waiters.pop_front() {
                            let candidate = vm.take().expect("vm present until sent");
                            match waiter.tx.send(Ok(Arc::clone(&candidate))) {
                                Ok(()) => {
                                    let slot =
                                        inner.slots.get_mut(&slot_id).expect("slot exists");
                                    slot.state = SlotState::Active;
                                    slot.vm = Some(candidate);
                                    slot.warm_at = Some(Instant::now());
                                    slot.acquired_at = Some(Instant::now());
                                    break;
                                }
                                // Receiver gave up (timeout); try the next.
                                Err(_) => vm = Some(candidate),
                            }
                        }
                        if let Some(vm) = vm {
                            let slot = inner.slots.get_mut(&slot_id).expect("slot exists");
                            slot.state = SlotState::Warm;
                            slot.vm = Some(vm);
                            slot.warm_at = Some(Instant::now());
                        }
                        None
                    }
                };

                if let Some(vm) = leftover {
                    // Pool stopped while this boot was in flight.
                    tokio::spawn(async move { vm.shutdown().await });
                    return;
                }

                let _ = self.events.send(PoolEvent::Warm { slot: slot_id });
                // A handed-off slot counts as an acquisition; converge again.
                self.refill_notify.notify_one();
            }
            Err(e) => {
                tracing::warn!(slot = slot_id, "boot failed: {e}");
                let retry = e.is_retryable();
                {
                    let mut inner = self.inner.lock().expect("pool lock poisoned");
                    inner.slots.remove(&slot_id);
                    inner.last_boot_error = Some(e.to_string());
                }
                let _ = self.events.send(PoolEvent::BootFailed { slot: slot_id });

                // A transient boot failure earns one delayed re-attempt;
                // config-level faults (missing image, bad paths) wait for
                // the next acquire/release to trigger a refill instead of
                // spinning on a boot that cannot succeed.
                if retry {
                    let pool = self.strong();
                    let delay = Duration::from_millis(self.config.boot_retry_delay_ms);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        pool.refill_notify.notify_one();
                    });
                }
            }
        }
    }

    // ── Slot selection helpers (called under the lock) ───────────────

    /// Oldest-warm-first keeps any one VM from idling long enough to
    /// drift from the others.
    fn take_oldest_warm(&self, inner: &mut PoolInner<V>) -> Option<Arc<V>> {
        let slot_id = inner
            .slots
            .iter()
            .filter(|(_, s)| s.state == SlotState::Warm)
            .min_by_key(|(_, s)| s.warm_at)
            .map(|(id, _)| *id)?;
        let slot = inner.slots.get_mut(&slot_id).expect("slot exists");
        slot.state = SlotState::Active;
        slot.acquired_at = Some(Instant::now());
        slot.vm.clone()
    }

    /// Remove warm slots whose age exceeds `max_warm_age_ms`; their VMs
    /// are returned for asynchronous destruction.
    fn evict_stale(&self, inner: &mut PoolInner<V>) -> Vec<Arc<V>> {
        let Some(max_age_ms) = self.config.max_warm_age_ms else {
            return Vec::new();
        };
        let max_age = Duration::from_millis(max_age_ms);
        let stale: Vec<u64> = inner
            .slots
            .iter()
            .filter(|(_, s)| {
                s.state == SlotState::Warm
                    && s.warm_at.is_some_and(|t| t.elapsed() > max_age)
            })
            .map(|(id, _)| *id)
            .collect();
        stale
            .into_iter()
            .filter_map(|id| {
                tracing::debug!(slot = id, "evicting stale warm VM");
                inner.slots.remove(&id).and_then(|s| s.vm)
            })
            .collect()
    }

    /// After a shrink: pull the `excess` oldest warm slots for teardown.
    fn take_excess_warm(&self, inner: &mut PoolInner<V>, excess: usize) -> Vec<Arc<V>> {
        let mut warm: Vec<(u64, Option<Instant>)> = inner
            .slots
            .iter()
            .filter(|(_, s)| s.state == SlotState::Warm)
            .map(|(id, s)| (*id, s.warm_at))
            .collect();
        warm.sort_by_key(|(_, warm_at)| *warm_at);
        warm.into_iter()
            .take(excess)
            .filter_map(|(id, _)| inner.slots.remove(&id).and_then(|s| s.vm))
            .collect()
    }

    fn shutdown_all(&self, vms: Vec<Arc<V>>) {
        for vm in vms {
            tokio::spawn(async move { vm.shutdown().await });
        }
        self.refill_notify.notify_one();
    }

    fn is_stopping(&self) -> bool {
        self.inner.lock().expect("pool lock poisoned").stopping
    }
}

fn count<V>(inner: &PoolInner<V>, max_size: usize) -> PoolStats {
    let mut warm = 0;
    let mut booting = 0;
    let mut active = 0;
    for slot in inner.slots.values() {
        match slot.state {
            SlotState::Warm => warm += 1,
            SlotState::Booting => booting += 1,
            SlotState::Active => active += 1,
        }
    }
    PoolStats {
        warm,
        booting,
        active,
        total: warm + booting + active,
        waiters: inner.waiters.len(),
        target_size: inner.target_size,
        max_size,
    }
}
