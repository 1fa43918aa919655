//! Producer duty cycle.
//!
//! Drives a capture device through repeating cycles:
//! open device, capture for a bounded window, publish at most one envelope,
//! release the device, cool down, repeat. Capturing continuously would
//! waste device contention and bandwidth when only a periodic sample is
//! needed; capping at one publish per cycle bounds the publish rate no
//! matter how fast the device produces frames.
//!
//! Retry policy is explicit in the state machine: a failed device open
//! enters `DeviceErrorBackoff` and retries after the cooldown interval,
//! indefinitely. Nothing inside a cycle is fatal to the loop.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::bus::BusPublisher;
use crate::capture::{BoxedHandle, CaptureDevice, FrameProcessor, Passthrough};
use crate::envelope::Envelope;

const DEFAULT_CAPTURE_WINDOW: Duration = Duration::from_secs(5);
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);
const DEFAULT_READ_PAUSE: Duration = Duration::from_millis(100);
const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

/// Exactly one state is active at a time per producer instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleState {
    OpeningDevice,
    Capturing,
    Cooldown,
    DeviceErrorBackoff,
}

#[derive(Clone, Debug)]
pub struct DutyCycleConfig {
    /// Raw-artifact topic the envelope is published to.
    pub topic: String,
    /// Media type tag attached to published envelopes.
    pub media_type: String,
    /// Bounded window to wait for a frame each cycle.
    pub capture_window: Duration,
    /// Sleep between cycles, and the backoff after a failed device open.
    pub cooldown: Duration,
    /// Pause between read attempts inside the capture window.
    pub read_pause: Duration,
}

impl Default for DutyCycleConfig {
    fn default() -> Self {
        Self {
            topic: "camera/feed".to_string(),
            media_type: crate::envelope::DEFAULT_MEDIA_TYPE.to_string(),
            capture_window: DEFAULT_CAPTURE_WINDOW,
            cooldown: DEFAULT_COOLDOWN,
            read_pause: DEFAULT_READ_PAUSE,
        }
    }
}

pub struct DutyCycle {
    cfg: DutyCycleConfig,
    device: Box<dyn CaptureDevice>,
    processor: Box<dyn FrameProcessor>,
    state: CycleState,
    handle: Option<BoxedHandle>,
    cycles_completed: u64,
    frames_published: u64,
}

impl DutyCycle {
    pub fn new(cfg: DutyCycleConfig, device: Box<dyn CaptureDevice>) -> Self {
        Self {
            cfg,
            device,
            processor: Box::new(Passthrough),
            state: CycleState::OpeningDevice,
            handle: None,
            cycles_completed: 0,
            frames_published: 0,
        }
    }

    pub fn with_processor(mut self, processor: Box<dyn FrameProcessor>) -> Self {
        self.processor = processor;
        self
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed
    }

    pub fn frames_published(&self) -> u64 {
        self.frames_published
    }

    /// Run until the shutdown flag is set. The flag is honored between
    /// states, not inside a capture window.
    pub fn run(&mut self, bus: &impl BusPublisher, shutdown: &AtomicBool) {
        log::info!(
            "duty cycle started: source={} topic={} window={:?} cooldown={:?}",
            self.device.source_id(),
            self.cfg.topic,
            self.cfg.capture_window,
            self.cfg.cooldown
        );
        while !shutdown.load(Ordering::SeqCst) {
            let pause = self.step(bus);
            sleep_with_shutdown(pause, shutdown);
        }
        self.handle = None;
        log::info!(
            "duty cycle stopped after {} cycles, {} frames published",
            self.cycles_completed,
            self.frames_published
        );
    }

    /// Execute the current state's entry action, transition, and return
    /// the pause to take before the next step.
    pub fn step(&mut self, bus: &impl BusPublisher) -> Duration {
        match self.state {
            CycleState::OpeningDevice => match self.device.open() {
                Ok(handle) => {
                    self.handle = Some(handle);
                    self.state = CycleState::Capturing;
                    Duration::ZERO
                }
                Err(e) => {
                    log::warn!(
                        "failed to open {}: {:#}; backing off",
                        self.device.source_id(),
                        e
                    );
                    self.state = CycleState::DeviceErrorBackoff;
                    Duration::ZERO
                }
            },
            CycleState::Capturing => {
                match self.handle.take() {
                    Some(handle) => self.capture_window(handle, bus),
                    // Cannot happen through normal stepping; recover via backoff.
                    None => self.state = CycleState::DeviceErrorBackoff,
                }
                Duration::ZERO
            }
            CycleState::Cooldown => {
                self.cycles_completed += 1;
                self.state = CycleState::OpeningDevice;
                self.cfg.cooldown
            }
            CycleState::DeviceErrorBackoff => {
                self.handle = None;
                self.state = CycleState::OpeningDevice;
                self.cfg.cooldown
            }
        }
    }

    /// Read frames for at most the capture window; publish at most one
    /// envelope, then exit the window immediately. The handle is dropped
    /// before entering cooldown on every path.
    fn capture_window(&mut self, mut handle: BoxedHandle, bus: &impl BusPublisher) {
        let deadline = Instant::now() + self.cfg.capture_window;
        let mut published = false;

        while Instant::now() < deadline {
            match handle.read_frame() {
                Ok(Some(frame)) => {
                    match self.publish_frame(frame, bus) {
                        Ok(()) => self.frames_published += 1,
                        Err(e) => log::warn!("frame publish dropped: {:#}", e),
                    }
                    published = true;
                    break;
                }
                Ok(None) => std::thread::sleep(self.cfg.read_pause),
                Err(e) => {
                    // Not fatal to the cycle; keep trying until the window closes.
                    log::warn!("frame read failed: {:#}", e);
                    std::thread::sleep(self.cfg.read_pause);
                }
            }
        }

        drop(handle);
        if !published {
            log::warn!("no frame captured within {:?}", self.cfg.capture_window);
        }
        self.state = CycleState::Cooldown;
    }

    fn publish_frame(&mut self, frame: crate::capture::Frame, bus: &impl BusPublisher) -> Result<()> {
        let frame = self.processor.process(frame)?;
        let envelope = Envelope::from_artifact(&frame.bytes, &self.cfg.media_type);
        let payload = envelope.to_payload()?;
        bus.publish(&self.cfg.topic, &payload)?;
        log::info!(
            "published {} byte frame to {}",
            frame.bytes.len(),
            self.cfg.topic
        );
        Ok(())
    }
}

fn sleep_with_shutdown(total: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + total;
    while !shutdown.load(Ordering::SeqCst) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        std::thread::sleep(remaining.min(SHUTDOWN_POLL));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureHandle, Frame};
    use anyhow::anyhow;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};

    struct RecordingBus {
        published: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl RecordingBus {
        fn new() -> Self {
            Self {
                published: Mutex::new(Vec::new()),
            }
        }

        fn count(&self) -> usize {
            self.published.lock().unwrap().len()
        }
    }

    impl BusPublisher for RecordingBus {
        fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.to_vec()));
            Ok(())
        }
    }

    struct FailingBus;

    impl BusPublisher for FailingBus {
        fn publish(&self, _topic: &str, _payload: &[u8]) -> Result<()> {
            Err(anyhow!("not connected"))
        }
    }

    /// Device whose handles yield a fixed frame on every read, with a
    /// drop counter to observe release.
    struct EagerDevice {
        releases: Arc<AtomicUsize>,
        fail_open: bool,
    }

    impl CaptureDevice for EagerDevice {
        fn open(&mut self) -> Result<crate::capture::BoxedHandle> {
            if self.fail_open {
                return Err(anyhow!("device busy"));
            }
            Ok(Box::new(EagerHandle {
                releases: self.releases.clone(),
            }))
        }

        fn source_id(&self) -> &str {
            "stub://eager"
        }
    }

    struct EagerHandle {
        releases: Arc<AtomicUsize>,
    }

    impl CaptureHandle for EagerHandle {
        fn read_frame(&mut self) -> Result<Option<Frame>> {
            Ok(Some(Frame {
                bytes: b"frame".to_vec(),
            }))
        }
    }

    impl Drop for EagerHandle {
        fn drop(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct SilentDevice;

    impl CaptureDevice for SilentDevice {
        fn open(&mut self) -> Result<crate::capture::BoxedHandle> {
            Ok(Box::new(SilentHandle))
        }

        fn source_id(&self) -> &str {
            "stub://silent"
        }
    }

    struct SilentHandle;

    impl CaptureHandle for SilentHandle {
        fn read_frame(&mut self) -> Result<Option<Frame>> {
            Ok(None)
        }
    }

    fn fast_config() -> DutyCycleConfig {
        DutyCycleConfig {
            capture_window: Duration::from_millis(20),
            cooldown: Duration::from_millis(40),
            read_pause: Duration::from_millis(1),
            ..DutyCycleConfig::default()
        }
    }

    #[test]
    fn open_failure_backs_off_and_retries_indefinitely() {
        let bus = RecordingBus::new();
        let device = EagerDevice {
            releases: Arc::new(AtomicUsize::new(0)),
            fail_open: true,
        };
        let mut cycle = DutyCycle::new(fast_config(), Box::new(device));

        for _ in 0..3 {
            assert_eq!(cycle.state(), CycleState::OpeningDevice);
            cycle.step(&bus);
            assert_eq!(cycle.state(), CycleState::DeviceErrorBackoff);
            let pause = cycle.step(&bus);
            assert_eq!(pause, Duration::from_millis(40));
        }
        assert_eq!(bus.count(), 0);
    }

    #[test]
    fn publishes_at_most_one_envelope_per_cycle() {
        let bus = RecordingBus::new();
        let releases = Arc::new(AtomicUsize::new(0));
        let device = EagerDevice {
            releases: releases.clone(),
            fail_open: false,
        };
        let mut cycle = DutyCycle::new(fast_config(), Box::new(device));

        cycle.step(&bus); // open
        assert_eq!(cycle.state(), CycleState::Capturing);
        cycle.step(&bus); // capture window
        assert_eq!(cycle.state(), CycleState::Cooldown);

        // One publish even though the device had a frame for every read.
        assert_eq!(bus.count(), 1);
        assert_eq!(cycle.frames_published(), 1);
        // Handle released before cooldown.
        assert_eq!(releases.load(Ordering::SeqCst), 1);

        let pause = cycle.step(&bus); // cooldown
        assert_eq!(pause, Duration::from_millis(40));
        assert_eq!(cycle.state(), CycleState::OpeningDevice);
        assert_eq!(cycle.cycles_completed(), 1);
    }

    #[test]
    fn empty_window_proceeds_to_cooldown_without_publish() {
        let bus = RecordingBus::new();
        let mut cycle = DutyCycle::new(fast_config(), Box::new(SilentDevice));

        cycle.step(&bus);
        cycle.step(&bus);
        assert_eq!(cycle.state(), CycleState::Cooldown);
        assert_eq!(bus.count(), 0);
    }

    #[test]
    fn publish_failure_does_not_abort_the_cycle() {
        let releases = Arc::new(AtomicUsize::new(0));
        let device = EagerDevice {
            releases: releases.clone(),
            fail_open: false,
        };
        let mut cycle = DutyCycle::new(fast_config(), Box::new(device));

        cycle.step(&FailingBus);
        cycle.step(&FailingBus);
        assert_eq!(cycle.state(), CycleState::Cooldown);
        assert_eq!(cycle.frames_published(), 0);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn processor_runs_once_per_cycle_on_the_selected_frame() {
        struct CountingProcessor {
            runs: Arc<AtomicUsize>,
        }

        impl FrameProcessor for CountingProcessor {
            fn process(&mut self, mut frame: Frame) -> Result<Frame> {
                self.runs.fetch_add(1, Ordering::SeqCst);
                frame.bytes.truncate(2);
                Ok(frame)
            }
        }

        let bus = RecordingBus::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let device = EagerDevice {
            releases: Arc::new(AtomicUsize::new(0)),
            fail_open: false,
        };
        let mut cycle = DutyCycle::new(fast_config(), Box::new(device))
            .with_processor(Box::new(CountingProcessor { runs: runs.clone() }));

        cycle.step(&bus);
        cycle.step(&bus);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let published = bus.published.lock().unwrap();
        let envelope = Envelope::from_payload(&published[0].1).expect("envelope");
        assert_eq!(
            envelope.artifact_bytes().expect("artifact"),
            Some(b"fr".to_vec())
        );
    }

    #[test]
    fn run_honors_shutdown_between_states() {
        let bus = RecordingBus::new();
        let device = EagerDevice {
            releases: Arc::new(AtomicUsize::new(0)),
            fail_open: false,
        };
        let mut cycle = DutyCycle::new(fast_config(), Box::new(device));
        let shutdown = AtomicBool::new(true);
        cycle.run(&bus, &shutdown);
        assert_eq!(bus.count(), 0);
    }
}
