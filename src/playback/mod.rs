//! Playback orchestration: the public control surface over the whole
//! pipeline.
//!
//! A [`Playback`] owns every input stream, the merge engine, the virtual-time
//! scheduler, and the demultiplexor. Its lifecycle is configure → start/run →
//! dispose:
//!
//! - [`add_input`](Playback::add_input) registers a raw source with its
//!   deserializer chain; purely configuration, nothing starts.
//! - [`observe`](Playback::observe) declares interest in an output type on
//!   every configured input and returns its demultiplexed channel. Call it
//!   before the events of interest are produced; there is no replay.
//! - [`start`](Playback::start) spawns exactly one pump thread over the merged
//!   queues, then one producer thread per input.
//! - [`run`](Playback::run) is `start` plus blocking until the pump finishes,
//!   returning the first unrecoverable source error, if any.
//! - [`dispose`](Playback::dispose) tears everything down deterministically
//!   and is also invoked from `Drop` as a backstop.

pub(crate) mod input;
pub(crate) mod pump;

pub use input::{EnvelopeSource, RawSource, VecSource};

use crate::config::PlaybackConfig;
use crate::demux::{Demultiplexor, EventStream};
use crate::deserialize::{CompositeDeserializer, SubscribableEvent};
use crate::error::{Error, Result};
use crate::playback::input::{InputLauncher, PumpMessage, TypedInput};
use crate::playback::pump::QueueInput;
use crate::scheduler::VirtualScheduler;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Configuring,
    Running,
    Finished,
    Disposed,
}

/// Top-level owner of the replay pipeline.
pub struct Playback {
    config: PlaybackConfig,
    scheduler: VirtualScheduler,
    demux: Arc<Demultiplexor>,
    inputs: Vec<Box<dyn InputLauncher>>,
    stage: Stage,
    shutdown_flag: Arc<AtomicBool>,
    shutdown_tx: Option<Sender<()>>,
    shutdown_rx: Receiver<()>,
    producer_handles: Vec<JoinHandle<()>>,
    pump_handle: Option<JoinHandle<Result<()>>>,
}

impl Playback {
    /// Create a playback with the given configuration.
    ///
    /// # Errors
    /// Returns a configuration error when the configuration is invalid.
    pub fn new(config: PlaybackConfig) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = unbounded();
        Ok(Self {
            demux: Arc::new(Demultiplexor::new(config.channel_capacity)),
            config,
            scheduler: VirtualScheduler::new(),
            inputs: Vec::new(),
            stage: Stage::Configuring,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            shutdown_tx: Some(shutdown_tx),
            shutdown_rx,
            producer_handles: Vec::new(),
            pump_handle: None,
        })
    }

    /// Register one raw source together with its deserializer chain.
    ///
    /// # Errors
    /// Returns a configuration error once the playback has started.
    pub fn add_input<S>(
        &mut self,
        source: S,
        deserializer: CompositeDeserializer<S::Record>,
    ) -> Result<()>
    where
        S: RawSource + 'static,
        S::Record: 'static,
    {
        if self.stage != Stage::Configuring {
            return Err(Error::configuration("inputs can only be added before start"));
        }
        debug!(input = source.name(), "input registered");
        self.inputs.push(Box::new(TypedInput::new(source, deserializer)));
        Ok(())
    }

    /// Declare interest in `T` on every configured input and subscribe to its
    /// output channel.
    ///
    /// Deserializers only build transforms for declared types, so events of
    /// `T` produced before this call are neither converted nor replayed.
    ///
    /// # Errors
    /// Returns [`Error::Disposed`] after disposal.
    pub fn observe<T: SubscribableEvent>(&mut self) -> Result<EventStream<T>> {
        if self.stage == Stage::Disposed {
            return Err(Error::Disposed);
        }
        let registration = T::registration();
        let mut claimed = false;
        for input in &mut self.inputs {
            claimed |= input.add_known_type(&registration);
        }
        if !claimed {
            warn!(
                type_name = registration.type_name(),
                "no configured input can produce this type; only fallback-routed events will arrive"
            );
        }
        Ok(self.demux.subscribe::<T>())
    }

    /// Start the pipeline: one pump thread over all merged queues, then one
    /// producer thread per input.
    ///
    /// # Errors
    /// Returns a configuration error when no inputs are registered or the
    /// playback already started, and a resource error when a thread cannot be
    /// spawned.
    pub fn start(&mut self) -> Result<()> {
        match self.stage {
            Stage::Configuring => {},
            Stage::Running => return Err(Error::configuration("playback already started")),
            Stage::Finished => return Err(Error::configuration("playback already finished")),
            Stage::Disposed => return Err(Error::Disposed),
        }
        if self.inputs.is_empty() {
            return Err(Error::configuration("playback needs at least one input"));
        }

        let mut senders: Vec<Sender<PumpMessage>> = Vec::with_capacity(self.inputs.len());
        let mut queues: Vec<QueueInput> = Vec::with_capacity(self.inputs.len());
        for _ in &self.inputs {
            let (sender, receiver) = match self.config.queue_capacity {
                Some(capacity) => bounded(capacity),
                None => unbounded(),
            };
            senders.push(sender);
            queues.push(QueueInput { records: receiver, shutdown: self.shutdown_rx.clone() });
        }

        // The pump goes up before any producer so no queue can grow unowned.
        self.pump_handle =
            Some(pump::spawn(queues, self.scheduler.clone(), Arc::clone(&self.demux))?);

        for (input, sender) in self.inputs.iter_mut().zip(senders) {
            let handle = input.launch(sender, Arc::clone(&self.shutdown_flag))?;
            self.producer_handles.push(handle);
        }

        self.stage = Stage::Running;
        info!(inputs = self.inputs.len(), "playback started");
        Ok(())
    }

    /// Start if needed, then block until the pump finishes.
    ///
    /// # Errors
    /// Returns the first unrecoverable source error. Events already delivered
    /// to subscribers are not retracted.
    pub fn run(&mut self) -> Result<()> {
        if self.stage == Stage::Configuring {
            self.start()?;
        }
        if self.stage != Stage::Running {
            return Err(Error::configuration("playback is not running"));
        }

        let handle = self
            .pump_handle
            .take()
            .ok_or_else(|| Error::Internal { message: "pump handle missing".into() })?;
        let outcome = handle
            .join()
            .map_err(|_| Error::Internal { message: "pump thread panicked".into() })?;

        for handle in self.producer_handles.drain(..) {
            let _ = handle.join();
        }
        self.stage = Stage::Finished;
        outcome
    }

    /// Tear down producers and the pump deterministically. Idempotent; also
    /// invoked from `Drop`.
    pub fn dispose(&mut self) {
        if self.stage == Stage::Disposed {
            return;
        }
        debug!("disposing playback");
        self.shutdown_flag.store(true, Ordering::Relaxed);
        // Disconnecting the shutdown channel unblocks the pump's pulls.
        self.shutdown_tx.take();
        if let Some(handle) = self.pump_handle.take() {
            let _ = handle.join();
        }
        for handle in self.producer_handles.drain(..) {
            let _ = handle.join();
        }
        self.stage = Stage::Disposed;
    }

    /// Handle to the virtual-time scheduler, for temporal operators.
    #[must_use]
    pub fn scheduler(&self) -> VirtualScheduler {
        self.scheduler.clone()
    }

    /// Virtual duration elapsed since the first observed event.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.scheduler.elapsed()
    }

    /// Number of registered inputs.
    #[must_use]
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Whether the pipeline threads are up.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.stage == Stage::Running
    }
}

impl Drop for Playback {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Playback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Playback")
            .field("stage", &self.stage)
            .field("inputs", &self.inputs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deserialize::{EventRegistration, IdentityTypeMap};
    use crate::types::{ReplayEvent, Timestamp, Timestamped};
    use chrono::{TimeZone, Utc};

    #[derive(Debug, Clone, PartialEq)]
    struct Sample(u32);
    impl ReplayEvent for Sample {}
    impl SubscribableEvent for Sample {
        fn registration() -> EventRegistration {
            EventRegistration::passthrough::<Self>()
        }
    }

    fn ts(secs: i64) -> Timestamp {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn sample_input(values: &[(u32, i64)]) -> VecSource<Timestamped<Sample>> {
        VecSource::new(
            "samples",
            values.iter().map(|&(v, secs)| Timestamped::new(Sample(v), ts(secs))).collect(),
        )
    }

    fn identity_chain() -> CompositeDeserializer<Timestamped<Sample>> {
        CompositeDeserializer::new().with_map(IdentityTypeMap::<Sample>::new())
    }

    #[test]
    fn zero_inputs_cannot_start() {
        let mut playback = Playback::new(PlaybackConfig::default()).unwrap();
        assert!(matches!(playback.start(), Err(Error::Configuration { .. })));
    }

    #[test]
    fn double_start_is_rejected() {
        let mut playback = Playback::new(PlaybackConfig::default()).unwrap();
        playback.add_input(sample_input(&[(1, 1)]), identity_chain()).unwrap();
        playback.start().unwrap();
        assert!(matches!(playback.start(), Err(Error::Configuration { .. })));
        playback.dispose();
    }

    #[test]
    fn add_input_after_start_is_rejected() {
        let mut playback = Playback::new(PlaybackConfig::default()).unwrap();
        playback.add_input(sample_input(&[(1, 1)]), identity_chain()).unwrap();
        playback.start().unwrap();
        assert!(playback.add_input(sample_input(&[(2, 2)]), identity_chain()).is_err());
        playback.dispose();
    }

    #[test]
    fn run_delivers_and_reports_elapsed_virtual_time() {
        let mut playback = Playback::new(PlaybackConfig::default()).unwrap();
        playback.add_input(sample_input(&[(10, 100), (20, 160)]), identity_chain()).unwrap();
        let mut stream = playback.observe::<Sample>().unwrap();

        playback.run().unwrap();
        assert_eq!(playback.elapsed(), Duration::from_secs(60));

        assert_eq!(stream.blocking_next_event().unwrap().value.0, 10);
        assert_eq!(stream.blocking_next_event().unwrap().value.0, 20);
        assert!(stream.blocking_next_event().is_none());
    }

    #[test]
    fn dispose_is_idempotent_and_blocks_further_use() {
        let mut playback = Playback::new(PlaybackConfig::default()).unwrap();
        playback.add_input(sample_input(&[(1, 1)]), identity_chain()).unwrap();
        playback.dispose();
        playback.dispose();
        assert!(matches!(playback.start(), Err(Error::Disposed)));
        assert!(matches!(playback.observe::<Sample>(), Err(Error::Disposed)));
    }

    #[test]
    fn dispose_unblocks_a_running_pump() {
        struct Stalled;
        impl RawSource for Stalled {
            type Record = Timestamped<Sample>;

            fn name(&self) -> &str {
                "stalled"
            }

            fn run(
                self: Box<Self>,
                sink: &mut dyn FnMut(Self::Record) -> bool,
            ) -> Result<()> {
                // Emits one item, then spins until told to stop.
                let mut sent = false;
                loop {
                    let keep_going = if sent {
                        std::thread::sleep(Duration::from_millis(1));
                        sink(Timestamped::new(Sample(0), Utc.timestamp_opt(9999, 0).unwrap()))
                    } else {
                        sent = true;
                        sink(Timestamped::new(Sample(1), Utc.timestamp_opt(1, 0).unwrap()))
                    };
                    if !keep_going {
                        return Ok(());
                    }
                }
            }
        }

        let mut playback = Playback::new(PlaybackConfig::default()).unwrap();
        playback.add_input(Stalled, identity_chain()).unwrap();
        playback.start().unwrap();
        playback.dispose();
        assert!(!playback.is_running());
    }
}
