use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, tick, Receiver};
use tracing::{error, info, warn};

use crate::config::BackoffConfig;
use crate::engine::{Engine, PersistedState};
use crate::network::TickBroadcast;
use crate::persistence::PersistenceGateway;
use crate::resolver::TickReport;

/// Phase of the authoritative tick loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickPhase {
    Idle,
    Resolving,
    Persisting,
    Broadcasting,
}

/// Whether tick saves are currently reaching the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceHealth {
    Healthy,
    /// Saves are failing; the next attempt happens at `retry_at_tick`.
    Degraded {
        consecutive_failures: u32,
        since_tick: u64,
        retry_at_tick: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    Failed,
    /// Skipped while waiting out the backoff.
    Deferred,
}

/// Outcome of one full resolve, persist, broadcast cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub tick: TickReport,
    pub save: SaveOutcome,
    pub delivered: usize,
    pub elapsed: Duration,
}

/// What a finished [`TickScheduler::run`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub overruns: u64,
    /// Timer events dropped because a cycle ran past the interval.
    pub skipped: u64,
    pub final_save: SaveOutcome,
}

/// Drives the engine once per interval.
///
/// Resolution runs under the engine lock; persistence and broadcast happen
/// after it is released, in that order, on this same thread. A cycle that
/// overruns the interval causes the missed timer events to be skipped.
pub struct TickScheduler<B: TickBroadcast> {
    engine: Arc<Engine>,
    gateway: PersistenceGateway,
    broadcast: Arc<B>,
    interval: Duration,
    backoff: BackoffConfig,
    phase: TickPhase,
    health: PersistenceHealth,
}

impl<B: TickBroadcast> TickScheduler<B> {
    pub fn new(
        engine: Arc<Engine>,
        gateway: PersistenceGateway,
        broadcast: Arc<B>,
        interval: Duration,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            engine,
            gateway,
            broadcast,
            interval,
            backoff,
            phase: TickPhase::Idle,
            health: PersistenceHealth::Healthy,
        }
    }

    pub fn phase(&self) -> TickPhase {
        self.phase
    }

    pub fn persistence_health(&self) -> PersistenceHealth {
        self.health
    }

    pub fn run_cycle(&mut self) -> CycleReport {
        let started = Instant::now();

        self.phase = TickPhase::Resolving;
        let (report, state) = self.engine.resolve_tick();

        self.phase = TickPhase::Persisting;
        let save = self.persist(report.tick, &state);

        self.phase = TickPhase::Broadcasting;
        let delivered = self.broadcast.broadcast_tick(report.tick);

        self.phase = TickPhase::Idle;
        let elapsed = started.elapsed();
        info!(
            target: "surge::tick",
            tick = report.tick,
            players = report.players,
            commands = report.executed.len(),
            rejected = report.rejected(),
            resolve_us = report.elapsed.as_micros() as u64,
            cycle_us = elapsed.as_micros() as u64,
            delivered,
            "tick.completed"
        );
        CycleReport {
            tick: report,
            save,
            delivered,
            elapsed,
        }
    }

    fn persist(&mut self, tick: u64, state: &PersistedState) -> SaveOutcome {
        if let PersistenceHealth::Degraded { retry_at_tick, .. } = self.health {
            if tick < retry_at_tick {
                return SaveOutcome::Deferred;
            }
        }

        match self.gateway.save(state) {
            Ok(()) => {
                if let PersistenceHealth::Degraded {
                    consecutive_failures,
                    since_tick,
                    ..
                } = self.health
                {
                    info!(
                        target: "surge::persistence",
                        tick,
                        since_tick,
                        consecutive_failures,
                        "persistence.recovered"
                    );
                }
                self.health = PersistenceHealth::Healthy;
                SaveOutcome::Saved
            }
            Err(err) => {
                let (failures, since_tick) = match self.health {
                    PersistenceHealth::Healthy => (1, tick),
                    PersistenceHealth::Degraded {
                        consecutive_failures,
                        since_tick,
                        ..
                    } => (consecutive_failures + 1, since_tick),
                };
                let delay = self.backoff.delay_after(failures);
                self.health = PersistenceHealth::Degraded {
                    consecutive_failures: failures,
                    since_tick,
                    retry_at_tick: tick + delay,
                };
                warn!(
                    target: "surge::persistence",
                    tick,
                    failures,
                    retry_in_ticks = delay,
                    %err,
                    "persistence.degraded"
                );
                SaveOutcome::Failed
            }
        }
    }

    /// Save the current state regardless of backoff. Used on shutdown.
    pub fn flush(&mut self) -> SaveOutcome {
        let state = self.engine.snapshot();
        match self.gateway.save(&state) {
            Ok(()) => {
                self.health = PersistenceHealth::Healthy;
                SaveOutcome::Saved
            }
            Err(err) => {
                error!(target: "surge::persistence", %err, "persistence.final_save_failed");
                SaveOutcome::Failed
            }
        }
    }

    /// Tick until `shutdown` fires or its sender goes away, then flush.
    ///
    /// A cycle that outlasts the interval drops the timer events that piled
    /// up meanwhile, so cycles never run back to back to catch up.
    pub fn run(mut self, shutdown: Receiver<()>) -> RunSummary {
        let ticker = tick(self.interval);
        let mut cycles = 0u64;
        let mut overruns = 0u64;
        let mut skipped_total = 0u64;
        info!(
            target: "surge::tick",
            interval_ms = self.interval.as_millis() as u64,
            start_tick = self.engine.tick(),
            "scheduler.started"
        );
        loop {
            select! {
                recv(ticker) -> _ => {
                    let report = self.run_cycle();
                    cycles += 1;
                    if report.elapsed > self.interval {
                        let mut skipped = 0u64;
                        while ticker.try_recv().is_ok() {
                            skipped += 1;
                        }
                        overruns += 1;
                        skipped_total += skipped;
                        warn!(
                            target: "surge::tick",
                            tick = report.tick.tick,
                            elapsed_ms = report.elapsed.as_millis() as u64,
                            skipped,
                            "tick.overrun"
                        );
                    }
                }
                recv(shutdown) -> _ => break,
            }
        }
        let final_save = self.flush();
        info!(
            target: "surge::tick",
            tick = self.engine.tick(),
            cycles,
            overruns,
            ?final_save,
            "scheduler.stopped"
        );
        RunSummary {
            cycles,
            overruns,
            skipped: skipped_total,
            final_save,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use crate::config::RobotDefaults;
    use crate::directory::PlayerDirectory;
    use crate::persistence::{KeyValueStore, MemoryStore, PersistenceError, WriteBatch};
    use crate::world::WorldState;

    #[derive(Default)]
    struct RecordingBroadcast {
        ticks: Mutex<Vec<u64>>,
    }

    impl TickBroadcast for RecordingBroadcast {
        fn broadcast_tick(&self, tick: u64) -> usize {
            self.ticks.lock().unwrap().push(tick);
            1
        }
    }

    /// Memory store whose writes fail while `down` is set.
    #[derive(Clone, Default)]
    struct FlakyStore {
        inner: MemoryStore,
        down: Arc<AtomicBool>,
    }

    impl KeyValueStore for FlakyStore {
        fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
            self.inner.get(key)
        }

        fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, PersistenceError> {
            self.inner.scan_prefix(prefix)
        }

        fn apply(&mut self, batch: WriteBatch) -> Result<(), PersistenceError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(PersistenceError::Io {
                    path: "flaky-store".into(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "store offline"),
                });
            }
            self.inner.apply(batch)
        }

        fn clear(&mut self) -> Result<(), PersistenceError> {
            self.inner.clear()
        }
    }

    fn scheduler(
        store: FlakyStore,
    ) -> (TickScheduler<RecordingBroadcast>, Arc<RecordingBroadcast>) {
        let engine = Arc::new(Engine::new(
            WorldState::empty(4, 4, Some(0)),
            PlayerDirectory::new(),
            RobotDefaults::default(),
        ));
        let broadcast = Arc::new(RecordingBroadcast::default());
        let scheduler = TickScheduler::new(
            engine,
            PersistenceGateway::new(Box::new(store)),
            Arc::clone(&broadcast),
            Duration::from_millis(10),
            BackoffConfig {
                initial_ticks: 2,
                max_ticks: 4,
            },
        );
        (scheduler, broadcast)
    }

    fn stored_tick(store: &FlakyStore) -> Option<u64> {
        let gateway = PersistenceGateway::new(Box::new(store.clone()));
        gateway.load_world_snapshot().unwrap().map(|w| w.tick)
    }

    #[test]
    fn cycle_saves_then_broadcasts_next_tick() {
        let store = FlakyStore::default();
        let (mut scheduler, broadcast) = scheduler(store.clone());
        for _ in 0..3 {
            let report = scheduler.run_cycle();
            assert_eq!(report.save, SaveOutcome::Saved);
        }
        assert_eq!(*broadcast.ticks.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(stored_tick(&store), Some(3));
        assert_eq!(scheduler.phase(), TickPhase::Idle);
    }

    #[test]
    fn failed_saves_back_off_and_recover() {
        let store = FlakyStore::default();
        let (mut scheduler, broadcast) = scheduler(store.clone());
        store.down.store(true, Ordering::SeqCst);

        assert_eq!(scheduler.run_cycle().save, SaveOutcome::Failed);
        assert_eq!(
            scheduler.persistence_health(),
            PersistenceHealth::Degraded {
                consecutive_failures: 1,
                since_tick: 1,
                retry_at_tick: 3,
            }
        );
        assert_eq!(scheduler.run_cycle().save, SaveOutcome::Deferred);
        assert_eq!(scheduler.run_cycle().save, SaveOutcome::Failed);
        assert_eq!(
            scheduler.persistence_health(),
            PersistenceHealth::Degraded {
                consecutive_failures: 2,
                since_tick: 1,
                retry_at_tick: 7,
            }
        );

        store.down.store(false, Ordering::SeqCst);
        for _ in 4..7 {
            assert_eq!(scheduler.run_cycle().save, SaveOutcome::Deferred);
        }
        assert_eq!(stored_tick(&store), None);
        assert_eq!(scheduler.run_cycle().save, SaveOutcome::Saved);
        assert_eq!(scheduler.persistence_health(), PersistenceHealth::Healthy);
        assert_eq!(stored_tick(&store), Some(7));

        // Ticks kept flowing to clients the whole time.
        assert_eq!(
            *broadcast.ticks.lock().unwrap(),
            vec![1, 2, 3, 4, 5, 6, 7]
        );
    }

    #[test]
    fn run_stops_on_shutdown_and_flushes() {
        let store = FlakyStore::default();
        let (scheduler, broadcast) = scheduler(store.clone());
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        let handle = std::thread::spawn(move || scheduler.run(shutdown_rx));

        let deadline = Instant::now() + Duration::from_secs(5);
        while broadcast.ticks.lock().unwrap().len() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        shutdown_tx.send(()).unwrap();
        let summary = handle.join().unwrap();

        let ticks = broadcast.ticks.lock().unwrap().clone();
        assert!(ticks.len() >= 3);
        let expected: Vec<u64> = (1..=ticks.len() as u64).collect();
        assert_eq!(ticks, expected);
        assert_eq!(summary.cycles, ticks.len() as u64);
        assert_eq!(summary.final_save, SaveOutcome::Saved);
        assert_eq!(stored_tick(&store), ticks.last().copied());
    }

    /// Broadcast that takes longer than the tick interval.
    struct SlowBroadcast {
        delay: Duration,
        ticks: Mutex<Vec<u64>>,
    }

    impl TickBroadcast for SlowBroadcast {
        fn broadcast_tick(&self, tick: u64) -> usize {
            std::thread::sleep(self.delay);
            self.ticks.lock().unwrap().push(tick);
            0
        }
    }

    #[test]
    fn overrunning_cycles_skip_missed_timer_events() {
        let engine = Arc::new(Engine::new(
            WorldState::empty(4, 4, Some(0)),
            PlayerDirectory::new(),
            RobotDefaults::default(),
        ));
        let broadcast = Arc::new(SlowBroadcast {
            delay: Duration::from_millis(35),
            ticks: Mutex::new(Vec::new()),
        });
        let scheduler = TickScheduler::new(
            Arc::clone(&engine),
            PersistenceGateway::new(Box::new(MemoryStore::new())),
            Arc::clone(&broadcast),
            Duration::from_millis(10),
            BackoffConfig::default(),
        );
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        let handle = std::thread::spawn(move || scheduler.run(shutdown_rx));

        let deadline = Instant::now() + Duration::from_secs(5);
        while broadcast.ticks.lock().unwrap().len() < 4 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        shutdown_tx.send(()).unwrap();
        let summary = handle.join().unwrap();

        let ticks = broadcast.ticks.lock().unwrap().clone();
        assert!(ticks.len() >= 4);
        assert!(summary.overruns > 0);
        assert_eq!(summary.overruns, summary.cycles);
        assert_eq!(summary.cycles, ticks.len() as u64);
        let expected: Vec<u64> = (1..=ticks.len() as u64).collect();
        assert_eq!(ticks, expected);
        assert_eq!(engine.tick(), summary.cycles);
    }

    #[test]
    fn shutdown_saves_commands_staged_since_the_last_tick() {
        let store = FlakyStore::default();
        let engine = Arc::new(Engine::new(
            WorldState::from_snapshot(
                crate::world::WorldSnapshot {
                    tick: 0,
                    width: 1,
                    height: 1,
                    cells: vec![(
                        crate::world::GridPos::new(0, 0),
                        crate::world::Entity::Spawn(crate::world::Spawn {
                            cooldown_until: 0,
                            cooldown_amount: 10,
                            energy_required: 50,
                        }),
                    )],
                },
                Some(0),
            ),
            PlayerDirectory::new(),
            RobotDefaults::default(),
        ));
        let scheduler = TickScheduler::new(
            Arc::clone(&engine),
            PersistenceGateway::new(Box::new(store.clone())),
            Arc::new(RecordingBroadcast::default()),
            Duration::from_secs(60),
            BackoffConfig::default(),
        );
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        let handle = std::thread::spawn(move || scheduler.run(shutdown_rx));

        engine.register("TKA".into(), "ada").unwrap();
        engine
            .stage("TKA", sim_runtime::StagedCommand::new("HARVEST", Vec::new()))
            .unwrap();
        engine.commit("TKA").unwrap();
        engine
            .stage("TKA", sim_runtime::StagedCommand::new("REPAIR", Vec::new()))
            .unwrap();
        shutdown_tx.send(()).unwrap();
        let summary = handle.join().unwrap();

        assert_eq!(summary.cycles, 0);
        assert_eq!(summary.final_save, SaveOutcome::Saved);
        let gateway = PersistenceGateway::new(Box::new(store));
        let directory = gateway.load_player_directory().unwrap().unwrap();
        assert_eq!(directory.players.len(), 1);
        assert_eq!(directory.players[0].committed.len(), 1);
        assert_eq!(directory.players[0].staged.len(), 1);
    }
}
