//! Connection lifecycle supervisor, written once for every wire engine.
//!
//! [`Session`] owns the state machine, retry with exponential backoff,
//! the idle keepalive, link monitoring and background reconnection. The
//! engine behind it only has to perform one connection attempt and run
//! one command at a time.
//!
//! The live wire sits in a single-slot async mutex, so every command
//! (caller, batch, keepalive probe, health check) is serialized. Each
//! command also watches an abort epoch that `disconnect()` and link loss
//! bump, which is how an in-flight command is rejected without waiting
//! for its timeout.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime};

use log::{debug, error, info, trace, warn};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::stats::{ConnectionState, SessionStats};
use crate::error::{ConnectionError, Error, Result};
use crate::transport::{Connector, LinkWatch, SessionConfig, Wire};

/// How long `connect()` waits for another caller's connect cycle.
pub const CONNECT_WAIT_CEILING: Duration = Duration::from_secs(30);

/// Timeout for keepalive and health probes.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle intervals after which a connection is considered stale.
const STALE_INTERVALS: u32 = 3;

/// Backoff stops doubling after this many steps.
const MAX_BACKOFF_SHIFT: u32 = 16;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Delay before connection attempt `attempt` (1-based) of a cycle.
///
/// Zero for the first attempt, then `base × 2^(attempt − 2)`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    if attempt < 2 {
        return Duration::ZERO;
    }
    let shift = (attempt - 2).min(MAX_BACKOFF_SHIFT);
    base.saturating_mul(1 << shift)
}

/// A supervised CLI session to one device.
///
/// Generic over the [`Connector`] that opens links; see
/// [`SshSession`](super::SshSession) and
/// [`TelnetSession`](super::TelnetSession).
pub struct Session<C: Connector> {
    shared: Arc<Shared<C>>,
}

struct Shared<C: Connector> {
    config: SessionConfig,
    connector: C,
    state: watch::Sender<ConnectionState>,
    /// Single-slot lock around the live link.
    wire: AsyncMutex<Option<C::Wire>>,
    /// Bumped to reject the in-flight command and fence off stale connects.
    abort: watch::Sender<u64>,
    lifecycle: Mutex<Lifecycle>,
}

#[derive(Default)]
struct Lifecycle {
    attempts: u32,
    last_activity: Option<(Instant, SystemTime)>,
    elevated: bool,
    learned_prompt: Option<String>,
    /// Set by `disconnect()`; no reconnect may be scheduled afterwards.
    shutdown: bool,
    keepalive: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Lifecycle {
    fn touch(&mut self) {
        self.last_activity = Some((Instant::now(), SystemTime::now()));
    }

    fn idle(&self) -> Option<Duration> {
        self.last_activity.map(|(at, _)| at.elapsed())
    }

    fn stop_timers(&mut self) {
        for task in [self.keepalive.take(), self.monitor.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

impl<C: Connector> Session<C> {
    /// Create a disconnected session. Nothing happens until `connect()`.
    pub fn new(config: SessionConfig, connector: C) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (abort, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                state,
                wire: AsyncMutex::new(None),
                abort,
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        }
    }

    /// The configuration this session was built with.
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Connect, retrying with exponential backoff.
    ///
    /// Returns immediately when already connected. When another connect
    /// cycle is running, waits for it to resolve instead of starting a
    /// second one.
    pub async fn connect(&self) -> Result<()> {
        let shared = &self.shared;
        let mut entered = false;
        shared.state.send_if_modified(|state| {
            if matches!(
                state,
                ConnectionState::Disconnected | ConnectionState::Error
            ) {
                *state = ConnectionState::Connecting;
                entered = true;
                true
            } else {
                false
            }
        });
        if !entered {
            return shared.await_settled().await;
        }

        shared.lifecycle().shutdown = false;
        info!(
            "Connecting to {} over {:?}",
            shared.config.socket_addr(),
            shared.config.transport
        );
        let epoch = shared.epoch();
        shared.establish(epoch).await
    }

    /// Close the session and stop all background work.
    ///
    /// Rejects the in-flight command with a connection-lost error.
    /// Calling it again is a no-op.
    pub async fn disconnect(&self) {
        let shared = &self.shared;
        shared.abort.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
        let previous = shared.state.send_replace(ConnectionState::Disconnected);
        let reconnect = {
            let mut lc = shared.lifecycle();
            lc.shutdown = true;
            lc.reconnect.take()
        };
        if let Some(task) = reconnect {
            task.abort();
        }
        shared.teardown().await;

        if previous != ConnectionState::Disconnected {
            info!("Disconnected from {}", shared.config.socket_addr());
        }
    }

    /// Whether the session is connected right now.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Run one command. `None` uses the configured command timeout.
    pub async fn execute_command(&self, command: &str, timeout: Option<Duration>) -> Result<String> {
        let shared = &self.shared;
        let timeout = timeout.unwrap_or(shared.config.command_timeout);
        let mut abort = shared.abort.subscribe();
        let mut slot = shared.wire.lock().await;
        debug!("Executing '{command}' on {}", shared.config.socket_addr());
        shared.run_locked(&mut slot, &mut abort, command, timeout).await
    }

    /// Run commands one after another.
    ///
    /// Never fails: a command that errors is logged and yields an empty
    /// string at its index.
    pub async fn execute_multiple_commands(
        &self,
        commands: &[&str],
        timeout: Option<Duration>,
    ) -> Vec<String> {
        let timeout = timeout.unwrap_or(self.shared.config.command_timeout);
        let mut outputs = Vec::with_capacity(commands.len());

        for (index, command) in commands.iter().enumerate() {
            let budget = <C::Wire as Wire>::batch_timeout(command, timeout);
            match self.execute_command(command, Some(budget)).await {
                Ok(output) => {
                    <C::Wire as Wire>::review_output(command, &output);
                    outputs.push(output);
                }
                Err(e) => {
                    warn!(
                        "Batch command {}/{} '{command}' failed: {e}",
                        index + 1,
                        commands.len()
                    );
                    outputs.push(String::new());
                }
            }
        }
        outputs
    }

    /// Probe the device. False when disconnected or the probe fails.
    pub async fn health_check(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        match self
            .execute_command(self.shared.probe_command(), Some(PROBE_TIMEOUT))
            .await
        {
            Ok(_) => true,
            Err(e) => {
                debug!("Health check on {} failed: {e}", self.shared.config.socket_addr());
                false
            }
        }
    }

    /// Snapshot of the session's state and activity.
    pub fn stats(&self) -> SessionStats {
        let state = self.state();
        let lc = self.shared.lifecycle();
        SessionStats {
            state,
            connected: state == ConnectionState::Connected,
            last_activity: lc.last_activity.map(|(_, wall)| wall),
            idle_time: lc.idle(),
            attempts: lc.attempts,
            elevated: lc.elevated,
            learned_prompt: lc.learned_prompt.clone(),
        }
    }
}

impl<C: Connector> Drop for Session<C> {
    fn drop(&mut self) {
        let mut lc = self.shared.lifecycle();
        lc.shutdown = true;
        for task in [lc.keepalive.take(), lc.monitor.take(), lc.reconnect.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

impl<C: Connector> Shared<C> {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn epoch(&self) -> u64 {
        *self.abort.borrow()
    }

    fn probe_command(&self) -> &str {
        self.config
            .probe_command
            .as_deref()
            .unwrap_or(<C::Wire as Wire>::PROBE_COMMAND)
    }

    /// Wait for a running connect cycle to resolve.
    async fn await_settled(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let settled = tokio::time::timeout(CONNECT_WAIT_CEILING, async {
            rx.wait_for(|state| !state.is_transient())
                .await
                .map(|state| *state)
        })
        .await;

        match settled {
            Ok(Ok(ConnectionState::Connected)) => Ok(()),
            Ok(_) => Err(ConnectionError::NotConnected.into()),
            Err(_) => Err(ConnectionError::ConnectWaitExceeded(CONNECT_WAIT_CEILING).into()),
        }
    }

    /// One connect cycle of up to `max_attempts` attempts.
    async fn establish(self: &Arc<Self>, epoch: u64) -> Result<()> {
        let max = self.config.max_attempts.max(1);
        let addr = self.config.socket_addr();
        let mut last = None;

        for attempt in 1..=max {
            let delay = backoff_delay(self.config.retry_delay, attempt);
            if !delay.is_zero() {
                debug!("Waiting {delay:?} before attempt {attempt}/{max} to {addr}");
                tokio::time::sleep(delay).await;
            }
            self.lifecycle().attempts = attempt;

            let budget = C::attempt_budget(&self.config);
            let outcome = tokio::time::timeout(budget, self.connector.attempt(&self.config)).await;
            match outcome {
                Ok(Ok((wire, link))) => return self.install(wire, link, epoch).await,
                Ok(Err(e)) => {
                    warn!("Attempt {attempt}/{max} to {addr} failed: {e}");
                    last = Some(e);
                }
                Err(_) => {
                    warn!("Attempt {attempt}/{max} to {addr} timed out after {budget:?}");
                    last = Some(Error::timeout(format!("connect to {addr}"), budget));
                }
            }
        }

        if self.epoch() == epoch {
            self.state.send_replace(ConnectionState::Error);
        }
        error!("Giving up on {addr} after {max} attempts");
        Err(ConnectionError::AttemptsExhausted {
            attempts: max,
            last: Box::new(last.unwrap_or_else(|| ConnectionError::NotConnected.into())),
        }
        .into())
    }

    /// Make a fresh link live and start its keepalive and monitor.
    async fn install(self: &Arc<Self>, wire: C::Wire, link: LinkWatch, epoch: u64) -> Result<()> {
        let elevated = wire.elevated();
        let prompt = wire.learned_prompt().map(str::to_owned);

        let mut slot = self.wire.lock().await;
        let stale = slot.replace(wire);
        // disconnect() bumps the epoch before it publishes Disconnected.
        let published = self.state.send_if_modified(|state| {
            if self.epoch() != epoch {
                return false;
            }
            *state = ConnectionState::Connected;
            true
        });
        let rejected = if published { None } else { slot.take() };
        drop(slot);

        for old in [stale, rejected].into_iter().flatten() {
            old.close().await;
        }
        if !published {
            debug!("Session closed while connecting, dropping the new link");
            return Err(ConnectionError::Closed.into());
        }

        {
            let mut lc = self.lifecycle();
            lc.attempts = 0;
            lc.touch();
            lc.elevated = elevated;
            lc.learned_prompt = prompt;
        }

        let keepalive = tokio::spawn(keepalive_loop(
            Arc::downgrade(self),
            self.config.keepalive_interval,
        ));
        let monitor = tokio::spawn(monitor_link(Arc::downgrade(self), link));
        {
            let mut lc = self.lifecycle();
            lc.stop_timers();
            lc.keepalive = Some(keepalive);
            lc.monitor = Some(monitor);
        }

        info!("Connected to {}", self.config.socket_addr());
        Ok(())
    }

    /// Run a command on the locked slot, racing the abort epoch.
    async fn run_locked(
        &self,
        slot: &mut Option<C::Wire>,
        abort: &mut watch::Receiver<u64>,
        command: &str,
        timeout: Duration,
    ) -> Result<String> {
        let Some(wire) = slot.as_mut() else {
            return Err(ConnectionError::NotConnected.into());
        };

        let result = tokio::select! {
            result = wire.execute(command, timeout) => result,
            _ = abort.changed() => Err(ConnectionError::Closed.into()),
        };

        if result.is_ok() {
            let mut lc = self.lifecycle();
            lc.touch();
            lc.elevated = wire.elevated();
            lc.learned_prompt = wire.learned_prompt().map(str::to_owned);
        }
        result
    }

    /// Keepalive probe; skipped when a command holds the slot.
    async fn probe(&self) {
        let mut abort = self.abort.subscribe();
        let Ok(mut slot) = self.wire.try_lock() else {
            trace!("Command in flight, skipping keepalive probe");
            return;
        };
        match self
            .run_locked(&mut slot, &mut abort, self.probe_command(), PROBE_TIMEOUT)
            .await
        {
            Ok(_) => trace!("Keepalive probe to {} ok", self.config.socket_addr()),
            Err(e) => debug!("Keepalive probe to {} failed: {e}", self.config.socket_addr()),
        }
    }

    /// Stop timers, reject the in-flight command and close the link.
    async fn teardown(&self) {
        {
            let mut lc = self.lifecycle();
            lc.stop_timers();
            lc.elevated = false;
            lc.learned_prompt = None;
        }
        self.abort.send_modify(|epoch| *epoch = epoch.wrapping_add(1));

        let wire = self.wire.lock().await.take();
        if let Some(wire) = wire {
            wire.close().await;
        }
    }

    /// Handle an unexpected loss of a connected link.
    ///
    /// Only the first detector acts; later ones see the state already moved.
    async fn recover(self: Arc<Self>) {
        let mut won = false;
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Disconnected;
                won = true;
                true
            } else {
                false
            }
        });
        if !won {
            return;
        }

        self.teardown().await;
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let mut lc = self.lifecycle();
        if lc.shutdown {
            return;
        }
        if lc.reconnect.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("Reconnect to {} already scheduled", self.config.socket_addr());
            return;
        }
        lc.reconnect = Some(tokio::spawn(reconnect_loop(Arc::downgrade(self))));
    }
}

/// Probe when idle, force a reconnect when stale.
async fn keepalive_loop<C: Connector>(shared: Weak<Shared<C>>, interval: Duration) {
    if interval.is_zero() {
        return;
    }
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(session) = shared.upgrade() else {
            return;
        };
        if session.state() != ConnectionState::Connected {
            return;
        }
        // A command in flight is activity, however long it runs.
        if session.wire.try_lock().is_err() {
            trace!("Command in flight, skipping keepalive check");
            continue;
        }

        let idle = session.lifecycle().idle().unwrap_or_default();
        if idle > interval * STALE_INTERVALS {
            warn!(
                "No activity on {} for {idle:?}, forcing reconnect",
                session.config.socket_addr()
            );
            tokio::spawn(session.recover());
            return;
        }
        if idle > interval {
            session.probe().await;
        }
    }
}

/// Wait for the link to close and start recovery if it was live.
async fn monitor_link<C: Connector>(shared: Weak<Shared<C>>, mut link: LinkWatch) {
    link.closed().await;
    let Some(session) = shared.upgrade() else {
        return;
    };
    if session.state() != ConnectionState::Connected {
        return;
    }
    warn!(
        "Connection to {} closed unexpectedly",
        session.config.socket_addr()
    );
    tokio::spawn(session.recover());
}

/// Background reconnection after an unexpected drop.
///
/// Boxed so its type does not depend on the tasks it ends up spawning.
fn reconnect_loop<C: Connector>(shared: Weak<Shared<C>>) -> BoxFuture {
    Box::pin(async move {
        let mut cycle: u32 = 0;
        loop {
            cycle += 1;
            let Some(delay) = shared.upgrade().map(|s| s.config.retry_delay) else {
                return;
            };
            tokio::time::sleep(delay).await;

            let Some(session) = shared.upgrade() else {
                return;
            };
            if session.lifecycle().shutdown {
                return;
            }

            let mut entered = false;
            session.state.send_if_modified(|state| {
                if matches!(
                    state,
                    ConnectionState::Disconnected | ConnectionState::Error
                ) {
                    *state = ConnectionState::Reconnecting;
                    entered = true;
                    true
                } else {
                    false
                }
            });
            if !entered {
                // A caller's connect() got there first.
                if session.await_settled().await.is_ok() {
                    return;
                }
                continue;
            }

            let addr = session.config.socket_addr();
            info!("Reconnecting to {addr} (cycle {cycle})");
            let epoch = session.epoch();
            match session.establish(epoch).await {
                Ok(()) => {
                    info!("Reconnected to {addr}");
                    return;
                }
                Err(e) => {
                    warn!("Reconnect cycle {cycle} to {addr} failed: {e}");
                    if session
                        .config
                        .max_reconnect_cycles
                        .is_some_and(|max| cycle >= max)
                    {
                        error!("Giving up on {addr} after {cycle} reconnect cycles");
                        return;
                    }
                    if session.epoch() == epoch {
                        session.state.send_replace(ConnectionState::Disconnected);
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_law() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 1), Duration::ZERO);
        assert_eq!(backoff_delay(base, 2), base);
        assert_eq!(backoff_delay(base, 3), base * 2);
        assert_eq!(backoff_delay(base, 4), base * 4);
        assert_eq!(backoff_delay(base, 5), base * 8);
    }

    #[test]
    fn test_backoff_saturates() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 200), backoff_delay(base, 18));
        assert_eq!(backoff_delay(Duration::MAX, 10), Duration::MAX);
    }

    #[test]
    fn test_lifecycle_idle_tracks_touch() {
        let mut lc = Lifecycle::default();
        assert!(lc.idle().is_none());
        lc.touch();
        assert!(lc.idle().is_some());
    }
}
