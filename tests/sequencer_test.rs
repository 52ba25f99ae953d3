// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-sensor-provisioning project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rust_sensor_provisioning::config::{PersistPolicy, SerialConfig};
use rust_sensor_provisioning::modbus::drivers::{LinkError, LinkOpener, LinkSettings, ModbusLink};
use rust_sensor_provisioning::modbus::{
    ModbusTransport, RegisterBus, TransportError, CMD_SOFT_REBOOT, REG_BUS_ADDRESS, REG_COMMAND,
    REG_FEATURE_FLAGS, REG_LIVENESS, REG_SERIAL,
};
use rust_sensor_provisioning::provisioning::{
    CancellationSignals, ProvisioningObserver, ProvisioningSequencer, ProvisioningTask, RowRef,
    SequencerTiming, SerialSink, TaskOutcome,
};
use tokio::time::Instant;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Call {
    Read { address: u16, device_id: u8 },
    Write { address: u16, value: u16, device_id: u8 },
}

type Handler = Box<dyn FnMut(&Call) -> Result<Vec<u16>, TransportError> + Send>;

/// Register bus answering from a script and recording every call
struct ScriptedBus {
    calls: Mutex<Vec<(Instant, Call)>>,
    handler: Mutex<Handler>,
}

impl ScriptedBus {
    fn new(handler: impl FnMut(&Call) -> Result<Vec<u16>, TransportError> + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            handler: Mutex::new(Box::new(handler)),
        })
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().iter().map(|(_, c)| *c).collect()
    }

    fn timed_calls(&self) -> Vec<(Instant, Call)> {
        self.calls.lock().unwrap().clone()
    }

    fn writes(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Write { .. }))
            .collect()
    }

    fn dispatch(&self, call: Call) -> Result<Vec<u16>, TransportError> {
        self.calls.lock().unwrap().push((Instant::now(), call));
        let mut handler = self.handler.lock().unwrap();
        (*handler)(&call)
    }
}

#[async_trait::async_trait]
impl RegisterBus for ScriptedBus {
    async fn read_holding(
        &self,
        address: u16,
        device_id: u8,
        _count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        self.dispatch(Call::Read { address, device_id })
    }

    async fn write_single(
        &self,
        address: u16,
        value: u16,
        device_id: u8,
    ) -> Result<(), TransportError> {
        self.dispatch(Call::Write {
            address,
            value,
            device_id,
        })
        .map(|_| ())
    }
}

fn link_failure() -> TransportError {
    TransportError::Communication {
        port: "/dev/ttyTEST".to_string(),
        attempts: 2,
        source: LinkError::Timeout(Duration::from_secs(1)),
    }
}

/// A well-behaved device: `serial` at the probe address, alive everywhere
fn healthy(serial: u16) -> impl FnMut(&Call) -> Result<Vec<u16>, TransportError> + Send {
    move |call| match *call {
        Call::Read {
            address: REG_SERIAL,
            device_id: 1,
        } => Ok(vec![serial]),
        Call::Read {
            address: REG_FEATURE_FLAGS,
            ..
        } => Ok(vec![0x0201]),
        Call::Read { .. } => Ok(vec![1]),
        Call::Write { .. } => Ok(Vec::new()),
    }
}

#[derive(Default)]
struct RecordingObserver {
    logs: Mutex<Vec<String>>,
    statuses: Mutex<Vec<(RowRef, TaskOutcome)>>,
    started: Mutex<Vec<RowRef>>,
    finished: Mutex<Vec<RowRef>>,
}

impl RecordingObserver {
    fn statuses(&self) -> Vec<(RowRef, TaskOutcome)> {
        self.statuses.lock().unwrap().clone()
    }

    fn logs(&self) -> Vec<String> {
        self.logs.lock().unwrap().clone()
    }
}

impl ProvisioningObserver for RecordingObserver {
    fn on_log(&self, line: &str) {
        self.logs.lock().unwrap().push(line.to_string());
    }

    fn on_task_status(&self, row: &RowRef, outcome: &TaskOutcome) {
        self.statuses.lock().unwrap().push((*row, *outcome));
    }

    fn on_task_started(&self, row: &RowRef) {
        self.started.lock().unwrap().push(*row);
    }

    fn on_task_finished(&self, row: &RowRef) {
        self.finished.lock().unwrap().push(*row);
    }
}

#[derive(Default)]
struct RecordingSink {
    persisted: Mutex<Vec<(RowRef, u16)>>,
    fail: bool,
}

impl RecordingSink {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn persisted(&self) -> Vec<(RowRef, u16)> {
        self.persisted.lock().unwrap().clone()
    }
}

impl SerialSink for RecordingSink {
    fn persist(&self, row: &RowRef, serial: u16) -> anyhow::Result<()> {
        self.persisted.lock().unwrap().push((*row, serial));
        if self.fail {
            anyhow::bail!("disk full");
        }
        Ok(())
    }
}

struct Harness {
    bus: Arc<ScriptedBus>,
    observer: Arc<RecordingObserver>,
    sink: Arc<RecordingSink>,
    sequencer: ProvisioningSequencer<Arc<ScriptedBus>>,
}

fn harness(bus: Arc<ScriptedBus>) -> Harness {
    harness_with(bus, RecordingSink::default(), SequencerTiming::default())
}

fn harness_with(bus: Arc<ScriptedBus>, sink: RecordingSink, timing: SequencerTiming) -> Harness {
    let observer = Arc::new(RecordingObserver::default());
    let sink = Arc::new(sink);
    let sequencer = ProvisioningSequencer::new(bus.clone(), observer.clone(), sink.clone())
        .with_timing(timing);
    Harness {
        bus,
        observer,
        sink,
        sequencer,
    }
}

fn task(row: u32, address: u16, buzzer_disable: bool) -> ProvisioningTask {
    ProvisioningTask::new(RowRef(row), address, buzzer_disable, true).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_single_device_is_provisioned() {
    init_logger();
    let h = harness(ScriptedBus::new(healthy(1001)));
    let signals = CancellationSignals::new();

    let report = h.sequencer.run(&[task(2, 5, false)], &signals).await;

    assert_eq!(report.outcomes, vec![(RowRef(2), TaskOutcome::Ok(1001))]);
    assert!(!report.aborted);
    assert_eq!(h.sink.persisted(), vec![(RowRef(2), 1001)]);
    assert_eq!(h.observer.statuses(), vec![(RowRef(2), TaskOutcome::Ok(1001))]);
    assert_eq!(
        h.bus.calls(),
        vec![
            Call::Read { address: REG_SERIAL, device_id: 1 },
            Call::Read { address: REG_SERIAL, device_id: 1 },
            Call::Write { address: REG_BUS_ADDRESS, value: 5, device_id: 1 },
            Call::Write { address: REG_COMMAND, value: CMD_SOFT_REBOOT, device_id: 1 },
            Call::Read { address: REG_LIVENESS, device_id: 5 },
        ]
    );
    assert_eq!(*h.observer.started.lock().unwrap(), vec![RowRef(2)]);
    assert_eq!(*h.observer.finished.lock().unwrap(), vec![RowRef(2)]);
}

#[tokio::test(start_paused = true)]
async fn test_buzzer_bit_is_cleared_before_reboot() {
    init_logger();
    let bus = ScriptedBus::new(|call: &Call| match *call {
        Call::Read { address: REG_SERIAL, .. } => Ok(vec![2002]),
        Call::Read { address: REG_FEATURE_FLAGS, .. } => Ok(vec![0x0203]),
        Call::Read { .. } => Ok(vec![0]),
        Call::Write { .. } => Ok(Vec::new()),
    });
    let h = harness(bus);

    let report = h
        .sequencer
        .run(&[task(3, 12, true)], &CancellationSignals::new())
        .await;

    assert_eq!(report.outcome(RowRef(3)), Some(TaskOutcome::Ok(2002)));
    assert_eq!(
        h.bus.writes(),
        vec![
            Call::Write { address: REG_BUS_ADDRESS, value: 12, device_id: 1 },
            Call::Write { address: REG_FEATURE_FLAGS, value: 0x0003, device_id: 1 },
            Call::Write { address: REG_COMMAND, value: CMD_SOFT_REBOOT, device_id: 1 },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_disabled_task_never_touches_the_bus() {
    init_logger();
    let h = harness(ScriptedBus::new(healthy(1001)));
    let disabled = ProvisioningTask::new(RowRef(2), 5, false, false).unwrap();

    let report = h.sequencer.run(&[disabled], &CancellationSignals::new()).await;

    assert_eq!(report.outcomes, vec![(RowRef(2), TaskOutcome::Skipped)]);
    assert!(h.bus.calls().is_empty());
    assert!(h.sink.persisted().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_address_write_failure_fails_task_without_persisting() {
    init_logger();
    let bus = ScriptedBus::new(|call: &Call| match *call {
        Call::Write { address: REG_BUS_ADDRESS, .. } => Err(link_failure()),
        Call::Read { .. } => Ok(vec![1001]),
        Call::Write { .. } => Ok(Vec::new()),
    });
    let h = harness(bus);

    let report = h
        .sequencer
        .run(&[task(2, 5, false)], &CancellationSignals::new())
        .await;

    assert_eq!(report.outcomes, vec![(RowRef(2), TaskOutcome::Fail)]);
    assert!(h.sink.persisted().is_empty());
    assert!(!h
        .bus
        .writes()
        .iter()
        .any(|c| matches!(c, Call::Write { address: REG_COMMAND, .. })));

    let logs = h.observer.logs();
    let failure = logs
        .iter()
        .find(|l| l.contains("FAIL"))
        .expect("failure is logged");
    assert!(failure.starts_with("row 2:"));
    assert!(failure.contains("write address"));
    assert!(failure.contains("Communication"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_task_does_not_stop_the_run() {
    init_logger();
    let mut serials = vec![1002u16, 1002, 1001, 1001].into_iter();
    let mut current = 0u16;
    let bus = ScriptedBus::new(move |call: &Call| match *call {
        Call::Read { address: REG_SERIAL, .. } => {
            if let Some(next) = serials.next() {
                current = next;
            }
            Ok(vec![current])
        }
        // The first device never comes back at address 5
        Call::Read { address: REG_LIVENESS, device_id: 5 } => Err(link_failure()),
        Call::Read { .. } => Ok(vec![0]),
        Call::Write { .. } => Ok(Vec::new()),
    });
    let h = harness(bus);

    let report = h
        .sequencer
        .run(&[task(2, 5, false), task(3, 6, false)], &CancellationSignals::new())
        .await;

    assert_eq!(
        report.outcomes,
        vec![(RowRef(2), TaskOutcome::Fail), (RowRef(3), TaskOutcome::Ok(1001))]
    );
    assert_eq!(h.sink.persisted(), vec![(RowRef(3), 1001)]);
}

#[tokio::test(start_paused = true)]
async fn test_verification_timeout_is_bounded() {
    init_logger();
    let bus = ScriptedBus::new(|call: &Call| match *call {
        Call::Read { address: REG_LIVENESS, .. } => Err(link_failure()),
        Call::Read { .. } => Ok(vec![1001]),
        Call::Write { .. } => Ok(Vec::new()),
    });
    let timing = SequencerTiming {
        boot_settle: Duration::from_millis(500),
        verify_poll: Duration::from_millis(300),
        verify_timeout: Duration::from_millis(2000),
        ..SequencerTiming::default()
    };
    let h = harness_with(bus, RecordingSink::default(), timing);

    let report = h
        .sequencer
        .run(&[task(2, 5, false)], &CancellationSignals::new())
        .await;
    let finished = Instant::now();

    assert_eq!(report.outcomes, vec![(RowRef(2), TaskOutcome::Fail)]);
    assert!(h.sink.persisted().is_empty());

    let calls = h.bus.timed_calls();
    let first_probe = calls
        .iter()
        .find(|(_, c)| matches!(c, Call::Read { address: REG_LIVENESS, .. }))
        .map(|(at, _)| *at)
        .unwrap();
    let elapsed = finished - first_probe;
    assert!(elapsed >= timing.verify_timeout, "gave up after {:?}", elapsed);
    assert!(
        elapsed <= timing.verify_timeout + timing.verify_poll,
        "waited {:?}",
        elapsed
    );
    assert!(h.observer.logs().iter().any(|l| l.contains("no reply at address 5")));
}

#[tokio::test(start_paused = true)]
async fn test_known_serial_is_never_reconfigured() {
    init_logger();
    // The first device keeps answering at the probe address for a while
    // before the operator plugs in the second one
    let mut serial_reads = 0u32;
    let bus = ScriptedBus::new(move |call: &Call| match *call {
        Call::Read { address: REG_SERIAL, .. } => {
            serial_reads += 1;
            Ok(vec![if serial_reads <= 6 { 1001 } else { 1002 }])
        }
        Call::Read { .. } => Ok(vec![0]),
        Call::Write { .. } => Ok(Vec::new()),
    });
    let h = harness(bus);

    let report = h
        .sequencer
        .run(&[task(2, 5, false), task(3, 6, false)], &CancellationSignals::new())
        .await;

    assert_eq!(
        report.outcomes,
        vec![(RowRef(2), TaskOutcome::Ok(1001)), (RowRef(3), TaskOutcome::Ok(1002))]
    );
    assert_eq!(h.sink.persisted(), vec![(RowRef(2), 1001), (RowRef(3), 1002)]);

    // Only one address write per device
    let address_writes: Vec<u16> = h
        .bus
        .writes()
        .into_iter()
        .filter_map(|c| match c {
            Call::Write { address: REG_BUS_ADDRESS, value, .. } => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(address_writes, vec![5, 6]);
}

#[tokio::test(start_paused = true)]
async fn test_skip_while_only_known_serial_answers() {
    init_logger();
    let signals = CancellationSignals::new();
    let operator = signals.clone();
    let mut serial_reads = 0u32;
    let bus = ScriptedBus::new(move |call: &Call| match *call {
        Call::Read { address: REG_SERIAL, .. } => {
            serial_reads += 1;
            // Device 1001 stays plugged in, the operator gives up on row 3
            if serial_reads == 10 {
                operator.request_skip();
            }
            Ok(vec![1001])
        }
        Call::Read { .. } => Ok(vec![0]),
        Call::Write { .. } => Ok(Vec::new()),
    });
    let h = harness(bus);

    let report = h
        .sequencer
        .run(&[task(2, 5, false), task(3, 6, false)], &signals)
        .await;

    assert_eq!(
        report.outcomes,
        vec![(RowRef(2), TaskOutcome::Ok(1001)), (RowRef(3), TaskOutcome::Skipped)]
    );
    assert_eq!(h.bus.writes().len(), 2);
    assert!(!signals.take_skip());
}

#[tokio::test(start_paused = true)]
async fn test_skip_during_discovery_leaves_bus_untouched() {
    init_logger();
    let signals = CancellationSignals::new();
    let operator = signals.clone();
    let mut polls = 0u32;
    let bus = ScriptedBus::new(move |call: &Call| {
        polls += 1;
        if polls == 3 {
            operator.request_skip();
        }
        match *call {
            Call::Read { .. } => Err(link_failure()),
            Call::Write { .. } => Ok(Vec::new()),
        }
    });
    let h = harness(bus);

    let report = h.sequencer.run(&[task(2, 5, false)], &signals).await;

    assert_eq!(report.outcomes, vec![(RowRef(2), TaskOutcome::Skipped)]);
    assert!(h.bus.writes().is_empty());
    assert_eq!(h.bus.calls().len(), 3);
    assert!(h.sink.persisted().is_empty());

    // The repeated bus error is reported once, with its row
    let errors: Vec<String> = h
        .observer
        .logs()
        .into_iter()
        .filter(|l| l.contains("bus error"))
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("row 2:"));
}

#[tokio::test(start_paused = true)]
async fn test_skip_before_reboot_suppresses_reboot_write() {
    init_logger();
    let signals = CancellationSignals::new();
    let operator = signals.clone();
    let bus = ScriptedBus::new(move |call: &Call| match *call {
        Call::Write { address: REG_BUS_ADDRESS, .. } => {
            operator.request_skip();
            Ok(Vec::new())
        }
        Call::Read { .. } => Ok(vec![1001]),
        Call::Write { .. } => Ok(Vec::new()),
    });
    let h = harness(bus);

    let report = h.sequencer.run(&[task(2, 5, false)], &signals).await;

    assert_eq!(report.outcomes, vec![(RowRef(2), TaskOutcome::Skipped)]);
    assert_eq!(
        h.bus.writes(),
        vec![Call::Write { address: REG_BUS_ADDRESS, value: 5, device_id: 1 }]
    );
    assert!(h.sink.persisted().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_skip_during_verification() {
    init_logger();
    let signals = CancellationSignals::new();
    let operator = signals.clone();
    let mut probes = 0u32;
    let bus = ScriptedBus::new(move |call: &Call| match *call {
        Call::Read { address: REG_LIVENESS, .. } => {
            probes += 1;
            if probes == 2 {
                operator.request_skip();
            }
            Err(link_failure())
        }
        Call::Read { .. } => Ok(vec![1001]),
        Call::Write { .. } => Ok(Vec::new()),
    });
    let h = harness(bus);

    let report = h.sequencer.run(&[task(2, 5, false)], &signals).await;

    assert_eq!(report.outcomes, vec![(RowRef(2), TaskOutcome::Skipped)]);
    assert!(h.sink.persisted().is_empty());
    assert!(h.observer.logs().iter().any(|l| l == "row 2: skipped by operator"));
}

#[tokio::test(start_paused = true)]
async fn test_stop_after_first_task_leaves_second_unreported() {
    init_logger();
    let signals = CancellationSignals::new();
    let operator = signals.clone();
    let bus = ScriptedBus::new(healthy(1001));
    let observer = Arc::new(RecordingObserver::default());

    /// Sink that stops the run once the first serial is recorded
    struct StopAfterPersist {
        inner: RecordingSink,
        signals: CancellationSignals,
    }
    impl SerialSink for StopAfterPersist {
        fn persist(&self, row: &RowRef, serial: u16) -> anyhow::Result<()> {
            self.signals.request_stop();
            self.inner.persist(row, serial)
        }
    }

    let sink = Arc::new(StopAfterPersist {
        inner: RecordingSink::default(),
        signals: operator,
    });
    let sequencer = ProvisioningSequencer::new(bus.clone(), observer.clone(), sink.clone());

    let report = sequencer
        .run(&[task(2, 5, false), task(3, 6, false)], &signals)
        .await;

    assert_eq!(report.outcomes, vec![(RowRef(2), TaskOutcome::Ok(1001))]);
    assert!(report.aborted);
    assert_eq!(observer.statuses(), vec![(RowRef(2), TaskOutcome::Ok(1001))]);
    assert_eq!(*observer.started.lock().unwrap(), vec![RowRef(2)]);
    assert_eq!(bus.calls().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_discovery_reports_nothing() {
    init_logger();
    let signals = CancellationSignals::new();
    let operator = signals.clone();
    let mut polls = 0u32;
    let bus = ScriptedBus::new(move |_call: &Call| {
        polls += 1;
        if polls == 4 {
            operator.request_stop();
        }
        Err(link_failure())
    });
    let h = harness(bus);
    let disabled = ProvisioningTask::new(RowRef(3), 6, false, false).unwrap();

    let report = h
        .sequencer
        .run(&[task(2, 5, false), disabled], &signals)
        .await;

    assert!(report.outcomes.is_empty());
    assert!(report.aborted);
    assert!(h.observer.statuses().is_empty());
    assert_eq!(h.bus.calls().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_stop_before_run_does_nothing() {
    init_logger();
    let h = harness(ScriptedBus::new(healthy(1001)));
    let signals = CancellationSignals::new();
    signals.request_stop();

    let report = h
        .sequencer
        .run(&[task(2, 5, false), task(3, 6, false)], &signals)
        .await;

    assert!(report.outcomes.is_empty());
    assert!(report.aborted);
    assert!(h.bus.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_persistence_failure_keeps_ok_outcome() {
    init_logger();
    let mut serial = 1000u16;
    let bus = ScriptedBus::new(move |call: &Call| match *call {
        // Every discovery poll sees a fresh device
        Call::Read { address: REG_SERIAL, .. } => {
            serial += 1;
            Ok(vec![serial])
        }
        Call::Read { .. } => Ok(vec![0]),
        Call::Write { .. } => Ok(Vec::new()),
    });
    let h = harness_with(bus, RecordingSink::failing(), SequencerTiming::default());

    let report = h
        .sequencer
        .run(&[task(2, 5, false), task(3, 6, false)], &CancellationSignals::new())
        .await;

    // The serial comes from the configuration read, not from the discovery poll
    assert_eq!(
        report.outcomes,
        vec![(RowRef(2), TaskOutcome::Ok(1002)), (RowRef(3), TaskOutcome::Ok(1004))]
    );
    assert_eq!(h.sink.persisted().len(), 2);
    assert!(h
        .observer
        .logs()
        .iter()
        .any(|l| l.starts_with("row 2: could not record SN=1002") && l.contains("disk full")));
}

#[tokio::test(start_paused = true)]
async fn test_persist_after_read_records_serial_of_failed_device() {
    init_logger();
    let bus = ScriptedBus::new(|call: &Call| match *call {
        Call::Read { address: REG_LIVENESS, .. } => Err(link_failure()),
        Call::Read { .. } => Ok(vec![3003]),
        Call::Write { .. } => Ok(Vec::new()),
    });
    let timing = SequencerTiming {
        persist_policy: PersistPolicy::AfterRead,
        ..SequencerTiming::default()
    };
    let h = harness_with(bus, RecordingSink::default(), timing);

    let report = h
        .sequencer
        .run(&[task(4, 9, false)], &CancellationSignals::new())
        .await;

    assert_eq!(report.outcomes, vec![(RowRef(4), TaskOutcome::Fail)]);
    assert_eq!(h.sink.persisted(), vec![(RowRef(4), 3003)]);
}

#[tokio::test(start_paused = true)]
async fn test_target_on_probe_address_fails_without_bus_traffic() {
    init_logger();
    let timing = SequencerTiming {
        probe_address: 7,
        ..SequencerTiming::default()
    };
    let h = harness_with(ScriptedBus::new(healthy(1001)), RecordingSink::default(), timing);

    let report = h
        .sequencer
        .run(&[task(2, 7, false)], &CancellationSignals::new())
        .await;

    assert_eq!(report.outcomes, vec![(RowRef(2), TaskOutcome::Fail)]);
    assert!(h.bus.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_empty_feature_flags_answer_fails_before_any_flag_write() {
    init_logger();
    let bus = ScriptedBus::new(|call: &Call| match *call {
        Call::Read { address: REG_FEATURE_FLAGS, .. } => Ok(Vec::new()),
        Call::Read { .. } => Ok(vec![1001]),
        Call::Write { .. } => Ok(Vec::new()),
    });
    let h = harness(bus);

    let report = h
        .sequencer
        .run(&[task(2, 5, true)], &CancellationSignals::new())
        .await;

    assert_eq!(report.outcomes, vec![(RowRef(2), TaskOutcome::Fail)]);
    assert_eq!(
        h.bus.writes(),
        vec![Call::Write { address: REG_BUS_ADDRESS, value: 5, device_id: 1 }]
    );
    assert!(h
        .observer
        .logs()
        .iter()
        .any(|l| l.contains("read feature flags")));
}

#[tokio::test(start_paused = true)]
async fn test_stop_right_after_discovery_skips_configuration() {
    init_logger();
    let signals = CancellationSignals::new();
    let operator = signals.clone();
    let bus = ScriptedBus::new(move |call: &Call| match *call {
        Call::Read { address: REG_SERIAL, .. } => {
            operator.request_stop();
            Ok(vec![1001])
        }
        _ => Ok(vec![1]),
    });
    let h = harness(bus);

    let report = h.sequencer.run(&[task(2, 5, false)], &signals).await;

    assert!(report.outcomes.is_empty());
    assert!(report.aborted);
    assert_eq!(
        h.bus.calls(),
        vec![Call::Read { address: REG_SERIAL, device_id: 1 }]
    );
}

/// Link on which unit 1 answers SN=1001 and every other unit never replies
struct SilentTargetLink {
    rebooted_at: Arc<Mutex<Option<Instant>>>,
}

#[async_trait::async_trait]
impl ModbusLink for SilentTargetLink {
    async fn read_holding_registers(
        &mut self,
        unit: u8,
        _address: u16,
        _count: u16,
    ) -> Result<Vec<u16>, LinkError> {
        if unit == 1 {
            Ok(vec![1001])
        } else {
            std::future::pending().await
        }
    }

    async fn write_single_register(
        &mut self,
        _unit: u8,
        address: u16,
        _value: u16,
    ) -> Result<(), LinkError> {
        if address == REG_COMMAND {
            *self.rebooted_at.lock().unwrap() = Some(Instant::now());
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        true
    }

    async fn close(&mut self) {}
}

struct SilentTargetOpener {
    rebooted_at: Arc<Mutex<Option<Instant>>>,
}

#[async_trait::async_trait]
impl LinkOpener for SilentTargetOpener {
    async fn open(&self, _settings: &LinkSettings) -> io::Result<Box<dyn ModbusLink>> {
        Ok(Box::new(SilentTargetLink {
            rebooted_at: self.rebooted_at.clone(),
        }))
    }
}

struct SilentTargetHarness {
    rebooted_at: Arc<Mutex<Option<Instant>>>,
    observer: Arc<RecordingObserver>,
    sequencer: ProvisioningSequencer<Arc<ModbusTransport>>,
    timing: SequencerTiming,
}

async fn silent_target_harness() -> SilentTargetHarness {
    let rebooted_at = Arc::new(Mutex::new(None));
    let transport = ModbusTransport::new(
        SilentTargetOpener {
            rebooted_at: rebooted_at.clone(),
        },
        SerialConfig::default(),
    );
    assert!(transport.connect("/dev/ttyTEST").await);

    let timing = SequencerTiming {
        boot_settle: Duration::ZERO,
        verify_poll: Duration::from_millis(200),
        verify_timeout: Duration::from_millis(3000),
        ..SequencerTiming::default()
    };
    let observer = Arc::new(RecordingObserver::default());
    let sequencer = ProvisioningSequencer::new(
        transport,
        observer.clone(),
        Arc::new(RecordingSink::default()),
    )
    .with_timing(timing);
    SilentTargetHarness {
        rebooted_at,
        observer,
        sequencer,
        timing,
    }
}

#[tokio::test(start_paused = true)]
async fn test_verification_window_holds_over_slow_transport() {
    init_logger();
    let h = silent_target_harness().await;

    let report = h
        .sequencer
        .run(&[task(2, 5, false)], &CancellationSignals::new())
        .await;
    let finished = Instant::now();

    assert_eq!(report.outcomes, vec![(RowRef(2), TaskOutcome::Fail)]);
    let rebooted_at = h.rebooted_at.lock().unwrap().expect("reboot command was sent");
    let elapsed = finished - rebooted_at;
    assert!(elapsed >= h.timing.verify_timeout, "gave up after {:?}", elapsed);
    assert!(
        elapsed <= h.timing.verify_timeout + h.timing.verify_poll,
        "waited {:?}",
        elapsed
    );
    assert!(h.observer.logs().iter().any(|l| l.contains("no reply at address 5")));
}

#[tokio::test(start_paused = true)]
async fn test_skip_is_noticed_while_liveness_read_is_pending() {
    init_logger();
    let h = silent_target_harness().await;
    let signals = CancellationSignals::new();
    let operator = signals.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        operator.request_skip();
    });

    let report = h.sequencer.run(&[task(2, 5, false)], &signals).await;
    let finished = Instant::now();

    assert_eq!(report.outcomes, vec![(RowRef(2), TaskOutcome::Skipped)]);
    let rebooted_at = h.rebooted_at.lock().unwrap().expect("reboot command was sent");
    // The transport alone would need 2.2 s to give up on the pending read
    assert!(
        finished - rebooted_at <= Duration::from_millis(1500) + h.timing.verify_poll,
        "skip noticed after {:?}",
        finished - rebooted_at
    );
}
