//! The per-audience API token cache
//!
//! The cache guarantees that at most one token exchange is outstanding for an
//! audience at any moment, no matter how many tasks ask for that audience's
//! token at once. Callers that arrive while an exchange is in flight join it
//! and observe the same token or the same failure.
//!
//! Looking up a slot and registering a new in-flight exchange happen under a
//! single acquisition of the table lock, so two callers can never both decide
//! to start an exchange. The lock is never held across an `.await`.
//!
//! A successful exchange is cached until it is explicitly invalidated or the
//! whole table is reset; a failed exchange leaves the slot empty so that the
//! next caller retries. Nothing is retried automatically.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use contxt_clock::{Clock, System, UnixTime};
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::{AccessToken, AudienceName, AudienceNameRef, SessionError};

type SharedExchange = Shared<BoxFuture<'static, Result<AccessToken, SessionError>>>;

/// A token held in the cache
#[derive(Clone, Debug)]
pub struct CachedApiToken {
    /// The audience the token was issued for
    pub audience: AudienceName,
    /// The token itself
    pub token: AccessToken,
    /// When the exchange that produced the token settled
    pub fetched_at: UnixTime,
}

enum Slot {
    Ready(CachedApiToken),
    InFlight { id: u64, exchange: SharedExchange },
}

#[derive(Default)]
struct Table {
    generation: u64,
    next_id: u64,
    slots: HashMap<AudienceName, Slot>,
}

impl Table {
    fn settle(
        &mut self,
        audience: &AudienceNameRef,
        id: u64,
        generation: u64,
        result: &Result<AccessToken, SessionError>,
        fetched_at: UnixTime,
    ) {
        if self.generation != generation {
            tracing::debug!(%audience, "cache was reset while exchanging, discarding result");
            return;
        }

        let owns_slot = matches!(
            self.slots.get(audience),
            Some(Slot::InFlight { id: current, .. }) if *current == id
        );

        match result {
            Ok(token) if owns_slot || !self.slots.contains_key(audience) => {
                tracing::trace!(%audience, "caching api token");
                self.slots.insert(
                    audience.to_owned(),
                    Slot::Ready(CachedApiToken {
                        audience: audience.to_owned(),
                        token: token.clone(),
                        fetched_at,
                    }),
                );
            }
            Err(_) if owns_slot => {
                tracing::trace!(%audience, "exchange failed, clearing in-flight entry");
                self.slots.remove(audience);
            }
            _ => {}
        }
    }
}

/// A cache of API tokens keyed by audience, coalescing concurrent requests
pub struct AudienceTokenCache<C = System> {
    table: Arc<Mutex<Table>>,
    clock: C,
}

impl AudienceTokenCache<System> {
    /// Constructs a new, empty cache
    pub fn new() -> Self {
        Self::with_clock(System)
    }
}

impl Default for AudienceTokenCache<System> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> AudienceTokenCache<C> {
    /// Constructs a new, empty cache stamping tokens using `clock`
    pub fn with_clock(clock: C) -> Self {
        Self {
            table: Arc::default(),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        lock_table(&self.table)
    }

    /// Forgets the cached or in-flight token for an audience
    ///
    /// Callers already waiting on an in-flight exchange still receive its
    /// outcome; only later callers are affected.
    pub fn invalidate(&self, audience: &AudienceNameRef) {
        if self.lock().slots.remove(audience).is_some() {
            tracing::debug!(%audience, "invalidated api token");
        }
    }

    /// Forgets every cached and in-flight token
    ///
    /// Exchanges that were in flight when the cache was reset will still
    /// complete for their waiters, but their results are never cached.
    pub fn reset(&self) {
        let mut table = self.lock();
        table.generation += 1;
        table.slots.clear();
        tracing::debug!(generation = table.generation, "reset api token cache");
    }

    /// Gets the cached token for an audience, if one is ready
    pub fn cached(&self, audience: &AudienceNameRef) -> Option<CachedApiToken> {
        match self.lock().slots.get(audience) {
            Some(Slot::Ready(cached)) => Some(cached.clone()),
            _ => None,
        }
    }

    /// The number of times the cache has been reset
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Whether an exchange is currently outstanding for an audience
    pub fn is_in_flight(&self, audience: &AudienceNameRef) -> bool {
        matches!(
            self.lock().slots.get(audience),
            Some(Slot::InFlight { .. })
        )
    }
}

impl<C> AudienceTokenCache<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    /// Gets the token for an audience, starting an exchange only if necessary
    ///
    /// If a token is cached it is returned immediately. If an exchange is
    /// already in flight, this call joins it. Otherwise `exchange` is invoked to
    /// build a new exchange future, which is registered before this call
    /// waits on it. `exchange` is called while the table is locked and must
    /// only construct the future, not poll it or touch this cache.
    pub async fn fetch<F, Fut>(
        &self,
        audience: &AudienceNameRef,
        exchange: F,
    ) -> Result<AccessToken, SessionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AccessToken, SessionError>> + Send + 'static,
    {
        let lookup = {
            let mut table = self.lock();
            self.lookup(&mut table, audience, exchange)
        };

        lookup.resolve().await
    }

    /// Like [`fetch()`][Self::fetch()], but only within the given generation
    ///
    /// Returns `None` without calling `exchange` if the cache has been
    /// [reset][Self::reset()] since `generation` was observed. Callers use
    /// this to guarantee that the credential an exchange is built from
    /// belongs to the generation the exchange is registered under.
    pub async fn fetch_in_generation<F, Fut>(
        &self,
        audience: &AudienceNameRef,
        generation: u64,
        exchange: F,
    ) -> Option<Result<AccessToken, SessionError>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AccessToken, SessionError>> + Send + 'static,
    {
        let lookup = {
            let mut table = self.lock();
            if table.generation != generation {
                tracing::debug!(
                    %audience,
                    expected = generation,
                    current = table.generation,
                    "cache was reset before exchanging, not registering"
                );
                return None;
            }
            self.lookup(&mut table, audience, exchange)
        };

        Some(lookup.resolve().await)
    }

    fn lookup<F, Fut>(&self, table: &mut Table, audience: &AudienceNameRef, exchange: F) -> Lookup
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AccessToken, SessionError>> + Send + 'static,
    {
        match table.slots.get(audience) {
            Some(Slot::Ready(cached)) => {
                tracing::trace!(%audience, "api token cache hit");
                Lookup::Ready(cached.token.clone())
            }
            Some(Slot::InFlight { exchange, .. }) => {
                tracing::debug!(%audience, "joining in-flight token exchange");
                Lookup::Pending(exchange.clone())
            }
            None => {
                let id = table.next_id;
                table.next_id += 1;

                tracing::debug!(%audience, "starting token exchange");

                let pending = settle_into(
                    Arc::downgrade(&self.table),
                    audience.to_owned(),
                    id,
                    table.generation,
                    self.clock.clone(),
                    exchange(),
                )
                .boxed()
                .shared();

                table.slots.insert(
                    audience.to_owned(),
                    Slot::InFlight {
                        id,
                        exchange: pending.clone(),
                    },
                );
                Lookup::Pending(pending)
            }
        }
    }
}

enum Lookup {
    Ready(AccessToken),
    Pending(SharedExchange),
}

impl Lookup {
    async fn resolve(self) -> Result<AccessToken, SessionError> {
        match self {
            Self::Ready(token) => Ok(token),
            Self::Pending(pending) => pending.await,
        }
    }
}

async fn settle_into<C, Fut>(
    table: Weak<Mutex<Table>>,
    audience: AudienceName,
    id: u64,
    generation: u64,
    clock: C,
    exchange: Fut,
) -> Result<AccessToken, SessionError>
where
    C: Clock,
    Fut: Future<Output = Result<AccessToken, SessionError>>,
{
    let result = exchange.await;

    if let Some(table) = table.upgrade() {
        lock_table(&table).settle(&audience, id, generation, &result, clock.now());
    }

    result
}

fn lock_table(table: &Mutex<Table>) -> MutexGuard<'_, Table> {
    // The table is left consistent between statements, so a panic elsewhere
    // while holding the lock does not invalidate it.
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<C: fmt::Debug> fmt::Debug for AudienceTokenCache<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let table = self.lock();
        let mut ready = Vec::new();
        let mut in_flight = Vec::new();
        for (name, slot) in &table.slots {
            match slot {
                Slot::Ready(_) => ready.push(name.as_str()),
                Slot::InFlight { .. } => in_flight.push(name.as_str()),
            }
        }

        f.debug_struct("AudienceTokenCache")
            .field("generation", &table.generation)
            .field("ready", &ready)
            .field("in_flight", &in_flight)
            .field("clock", &self.clock)
            .finish()
    }
}
