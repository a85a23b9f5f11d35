//! The client-facing mutex. A [`Mutex`] names one client of one lock: it
//! composes the transactional primitives in [`crate::ops`] into
//! `try_acquire` / `acquire` / `release`, keeps a background heartbeat task
//! alive while this client owns the lock, and hosts the `auto_release`
//! reaper loop that frees locks whose owners went silent.
//!
//! Cross-process synchronization comes entirely from the store's commit
//! order. In-process, a `Mutex` is meant to be driven by one task; callers
//! that share an instance serialize the foreground calls themselves.
//! Distinct instances may share a store handle freely.
//!
//! Liveness works in two halves. While a client owns the lock, its heartbeat
//! task bumps the owner record's versionstamp every second; failures there
//! are logged and swallowed, because the other half is authoritative: any
//! number of reapers running [`Mutex::auto_release`] watch the owner record
//! and, once it sits unchanged for a full `max_age`, presume the owner dead
//! and hand the lock to the queue head.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use rand::RngCore;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{CResult, Error};
use crate::ops::{self, Owner};
use crate::schema::Schema;
use crate::store::tuple::Subspace;
use crate::store::{Store, Txn};

/// How often the owner refreshes its heartbeat stamp. Reapers should use a
/// max_age comfortably above this.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

pub struct Mutex<S: Store> {
    store: Arc<S>,
    schema: Schema,
    name: String,

    /// Stop signal for the running heartbeat task, if any. Taking and
    /// cancelling the token is idempotent, so racing release calls are
    /// safe.
    hb_stop: std::sync::Mutex<Option<CancellationToken>>,
}

/// A fresh 32-character hex client name. Panics only if the thread RNG
/// cannot produce bytes, which is an environmental failure.
fn random_name() -> String {
    let mut raw = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut raw);
    hex::encode(raw)
}

impl<S: Store + Send + Sync + 'static> Mutex<S> {
    /// Creates a client of the lock rooted at `root`. An empty name is
    /// replaced with a random one. Ensures an owner key exists before
    /// anyone watches: the unowned sentinel `""` gives the very first
    /// `watch_owner` a real key to follow, without evicting a live owner
    /// when this client arrives late.
    pub fn new(store: Arc<S>, root: Subspace, name: &str) -> CResult<Self> {
        let name = if name.is_empty() { random_name() } else { name.to_owned() };
        let schema = Schema::new(root);
        store.transact(|txn| {
            if txn.scan(schema.owner_range(), Some(1))?.is_empty() {
                ops::tx::set_owner(txn, &schema, "")?;
            }
            Ok(())
        })?;
        Ok(Mutex { store, schema, name, hb_stop: std::sync::Mutex::new(None) })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attempts to take the lock without blocking. Returns true when this
    /// client now owns it (or already did); otherwise joins the wait queue
    /// and returns false. On success the heartbeat task is running before
    /// this returns.
    pub fn try_acquire(&self) -> CResult<bool> {
        let acquired = self.store.transact(|txn| {
            let owner = ops::tx::get_owner(txn, &self.schema)?;
            if owner.name == self.name {
                return Ok(true);
            }
            if owner.name.is_empty() {
                ops::tx::set_owner(txn, &self.schema, &self.name)?;
                return Ok(true);
            }
            ops::tx::enqueue(txn, &self.schema, &self.name)?;
            Ok(false)
        })?;
        if acquired {
            self.start_heartbeat()?;
        }
        Ok(acquired)
    }

    /// Takes the lock, waiting in queue order for it to come free. Returns
    /// `Error::Cancelled` when ctx fires first.
    ///
    /// The watch is armed before each attempt: a release that lands right
    /// after a failed attempt may already have promoted this client, and a
    /// watch armed only afterwards would follow a key that never changes
    /// again.
    pub async fn acquire(&self, ctx: &CancellationToken) -> CResult<()> {
        loop {
            let watch = ops::watch_owner(self.store.as_ref(), &self.schema)?;
            if self.try_acquire()? {
                return Ok(());
            }
            watch.recv(ctx).await?;
        }
    }

    /// Releases the lock and promotes the queue head, if any, to owner in
    /// the same transaction. A call by a non-owner is a no-op. Idempotent.
    pub fn release(&self) -> CResult<()> {
        self.store.transact(|txn| {
            let owner = ops::tx::get_owner(txn, &self.schema)?;
            if owner.name != self.name {
                return Ok(());
            }
            let next = ops::tx::dequeue(txn, &self.schema)?;
            ops::tx::set_owner(txn, &self.schema, &next)
        })?;
        if let Some(stop) = self.hb_stop.lock()?.take() {
            stop.cancel();
        }
        Ok(())
    }

    /// Reaps dead owners until ctx is cancelled. Any number of reapers may
    /// run, against the same or different processes.
    ///
    /// The loop keeps a snapshot of the last observed owner record and the
    /// instant it last changed. A fresh single-shot watch on the owner key
    /// is armed every iteration; a one-shot timer fires once per snapshot
    /// epoch, `max_age` after the last change. When either wakes the loop,
    /// one transaction re-reads the record: if the name or heartbeat moved,
    /// or `max_age` has not elapsed, the lock is live; otherwise the owner
    /// is presumed dead and the queue head takes over, in that same
    /// transaction. The timer is re-armed only when the record changed, so
    /// an idle unowned lock parks the reaper on its watch.
    pub async fn auto_release(&self, ctx: &CancellationToken, max_age: Duration) -> CResult<()> {
        let mut snapshot = ops::get_owner(self.store.as_ref(), &self.schema)?;
        let mut tstamp = Instant::now();
        let mut timer_live = true;
        loop {
            let watch = ops::watch_owner(self.store.as_ref(), &self.schema)?;
            tokio::select! {
                _ = ctx.cancelled() => return Err(Error::Cancelled),
                fired = watch.fired() => fired?,
                _ = time::sleep_until(tstamp + max_age), if timer_live => timer_live = false,
            }

            let mut reaped = false;
            let cur = self.store.transact(|txn| {
                reaped = false;
                let cur = ops::tx::get_owner(txn, &self.schema)?;
                if cur.name != snapshot.name
                    || cur.hbeat != snapshot.hbeat
                    || tstamp.elapsed() < max_age
                {
                    return Ok(cur);
                }
                // No transition and no heartbeat for a full max_age: presume
                // the owner dead and hand the lock to the queue head.
                let next = ops::tx::dequeue(txn, &self.schema)?;
                ops::tx::set_owner(txn, &self.schema, &next)?;
                reaped = true;
                Ok(Owner { name: next, hbeat: Vec::new() })
            })?;
            if reaped {
                debug!("reaped dead owner {:?}, lock passed to {:?}", snapshot.name, cur.name);
            }

            if cur.name != snapshot.name || cur.hbeat != snapshot.hbeat {
                snapshot = cur;
                tstamp = Instant::now();
                timer_live = true;
            }
        }
    }

    /// Spawns the heartbeat task unless one is already running. The task
    /// refreshes the owner stamp every [`HEARTBEAT_INTERVAL`] until its stop
    /// token fires; store errors are best-effort only, since a reaper
    /// elsewhere recovers the lock if they persist.
    fn start_heartbeat(&self) -> CResult<()> {
        let mut slot = self.hb_stop.lock()?;
        if slot.is_some() {
            return Ok(());
        }
        let stop = CancellationToken::new();
        let token = stop.clone();
        let store = Arc::clone(&self.store);
        let schema = self.schema.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            let mut tick = time::interval(HEARTBEAT_INTERVAL);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tick.tick() => {
                        if let Err(err) = ops::heartbeat(store.as_ref(), &schema, &name) {
                            warn!("heartbeat for {name}: {err}");
                        }
                    }
                }
            }
        });
        *slot = Some(stop);
        Ok(())
    }
}

impl<S: Store> Drop for Mutex<S> {
    fn drop(&mut self) {
        // The heartbeat task must not outlive its client.
        if let Ok(mut slot) = self.hb_stop.lock() {
            if let Some(stop) = slot.take() {
                stop.cancel();
            }
        }
    }
}
