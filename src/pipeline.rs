//! Pipeline orchestrator: three cooperating workers wired together through
//! the sinks in [`crate::queue`], driven by the demuxer and the transport.
//! Mirrors the shape of the reference pipeline (USB pump / decoder feeder /
//! render poll) while generalizing its fixed decoder and window to the
//! facades in [`crate::decoder`] and [`crate::renderer`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{error, info, warn};

use crate::auth::Authenticator;
use crate::decoder::VideoDecoder;
use crate::demux::ReassemblyBuffer;
use crate::protocol::{encode_packet, ConfigSubtype, PacketType};
use crate::queue::{BoundedDropQueue, DroppingQueue};
use crate::renderer::Renderer;
use crate::usb::{AccessoryIdentity, ReadOutcome, Transport, UsbTransport};

const VIDEO_QUEUE_CAPACITY: usize = 30;
const AUDIO_QUEUE_CAPACITY: usize = 50;
const FRAME_QUEUE_CAPACITY: usize = 1;

const USB_READ_TIMEOUT: Duration = Duration::from_millis(100);
const USB_READ_CHUNK: usize = 16384;
const VIDEO_GET_TIMEOUT: Duration = Duration::from_millis(100);
const RENDER_POLL_TIMEOUT: Duration = Duration::from_millis(16);
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);
const VIDEO_DROP_LOG_INTERVAL: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Connecting,
    Authenticating,
    Streaming,
    Stopping,
}

pub type StatusCallback = Box<dyn Fn(&str) + Send + Sync>;
pub type ConfigCallback = Box<dyn Fn(u8, &[u8]) + Send + Sync>;

struct Shared {
    running: AtomicBool,
    state: Mutex<PipelineState>,
    video_queue: BoundedDropQueue<Vec<u8>>,
    audio_queue: BoundedDropQueue<Vec<u8>>,
    frame_queue: DroppingQueue<crate::decoder::Frame>,
    decoder: Arc<Mutex<Box<dyn VideoDecoder>>>,
    authenticator: Authenticator,
    video_drops: AtomicU32,
    status_cb: Option<StatusCallback>,
    config_cb: Option<ConfigCallback>,
}

impl Shared {
    fn report_status(&self, msg: &str) {
        info!("{}", msg);
        if let Some(cb) = &self.status_cb {
            cb(msg);
        }
    }

    fn set_state(&self, state: PipelineState) {
        *self.state.lock().unwrap() = state;
    }

    /// Locks the decoder, recovering from poison instead of panicking. A
    /// panic caught inside one worker's decode call must not also take
    /// down the other worker that shares this mutex (the config arm of
    /// `route_packet`, running on the USB pump thread).
    fn lock_decoder(&self) -> MutexGuard<'_, Box<dyn VideoDecoder>> {
        self.decoder.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Orchestrates the USB pump, decoder feeder, and render poll workers.
/// Constructed fresh per `start()`/`stop()` cycle, matching the reference
/// pipeline's non-idempotent lifecycle.
#[derive(Default)]
pub struct Pipeline {
    shared: Option<Arc<Shared>>,
    usb_thread: Option<JoinHandle<()>>,
    decoder_thread: Option<JoinHandle<()>>,
    render_thread: Option<JoinHandle<()>>,
}

impl Pipeline {
    pub fn state(&self) -> PipelineState {
        match &self.shared {
            Some(shared) => *shared.state.lock().unwrap(),
            None => PipelineState::Idle,
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared
            .as_ref()
            .map(|s| s.running.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Connect over USB, then hand off to [`Pipeline::start_with_transport`].
    /// Not idempotent across a `stop()` without a fresh [`Pipeline`].
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        &mut self,
        identity: AccessoryIdentity,
        authenticator: Authenticator,
        decoder: Box<dyn VideoDecoder>,
        renderer: Box<dyn Renderer>,
        status_cb: Option<StatusCallback>,
        config_cb: Option<ConfigCallback>,
    ) -> crate::error::Result<()> {
        let transport = Transport::connect(&identity)?;
        self.start_with_transport(Box::new(transport), authenticator, decoder, renderer, status_cb, config_cb)
    }

    /// Construct the sinks, launch the three workers against an
    /// already-connected transport, and return once they are alive. Split
    /// out of `start()` so tests can drive the pipeline against a fake
    /// transport instead of real USB hardware.
    #[allow(clippy::too_many_arguments)]
    fn start_with_transport(
        &mut self,
        transport: Box<dyn UsbTransport>,
        authenticator: Authenticator,
        decoder: Box<dyn VideoDecoder>,
        mut renderer: Box<dyn Renderer>,
        status_cb: Option<StatusCallback>,
        config_cb: Option<ConfigCallback>,
    ) -> crate::error::Result<()> {
        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            state: Mutex::new(PipelineState::Connecting),
            video_queue: BoundedDropQueue::new(VIDEO_QUEUE_CAPACITY),
            audio_queue: BoundedDropQueue::new(AUDIO_QUEUE_CAPACITY),
            frame_queue: DroppingQueue::new(FRAME_QUEUE_CAPACITY),
            decoder: Arc::new(Mutex::new(decoder)),
            authenticator,
            video_drops: AtomicU32::new(0),
            status_cb,
            config_cb,
        });
        shared.set_state(PipelineState::Authenticating);

        if !renderer.start() {
            shared.report_status("renderer failed to start");
            return Err(crate::error::DriverError::TransportOpen(
                "renderer failed to start".into(),
            ));
        }

        let usb_shared = shared.clone();
        let usb_thread = std::thread::Builder::new()
            .name("usb-pump".into())
            .spawn(move || usb_pump_loop(usb_shared, transport))
            .expect("spawn usb-pump thread");

        let decoder_shared = shared.clone();
        let decoder_thread = std::thread::Builder::new()
            .name("decoder-feeder".into())
            .spawn(move || decoder_feeder_loop(decoder_shared))
            .expect("spawn decoder-feeder thread");

        let render_shared = shared.clone();
        let render_thread = std::thread::Builder::new()
            .name("render-poll".into())
            .spawn(move || render_poll_loop(render_shared, renderer.as_mut()))
            .expect("spawn render-poll thread");

        shared.report_status("pipeline started");

        self.shared = Some(shared);
        self.usb_thread = Some(usb_thread);
        self.decoder_thread = Some(decoder_thread);
        self.render_thread = Some(render_thread);
        Ok(())
    }

    /// Signal all workers to stop, clear queues, and join with a bounded
    /// timeout. Always safe to call, including on an already-stopped
    /// pipeline.
    pub fn stop(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        shared.set_state(PipelineState::Stopping);
        shared.running.store(false, Ordering::SeqCst);
        shared.video_queue.clear();
        shared.audio_queue.clear();
        shared.frame_queue.clear();

        for handle in [
            self.usb_thread.take(),
            self.decoder_thread.take(),
            self.render_thread.take(),
        ]
        .into_iter()
        .flatten()
        {
            join_bounded(handle, JOIN_TIMEOUT);
        }

        shared.set_state(PipelineState::Idle);
        shared.report_status("pipeline stopped");
    }
}

/// Joins a worker thread, logging (but not panicking on) a join that takes
/// longer than `timeout` to observe. `JoinHandle` has no bounded-wait API,
/// so this polls `is_finished` before falling back to a blocking join.
fn join_bounded(handle: JoinHandle<()>, timeout: Duration) {
    let poll = Duration::from_millis(10);
    let mut waited = Duration::ZERO;
    while !handle.is_finished() && waited < timeout {
        std::thread::sleep(poll);
        waited += poll;
    }
    if let Err(e) = handle.join() {
        error!("worker thread panicked: {}", panic_message(&e));
    }
}

/// Renders a caught panic payload as a string for logging. Panic payloads
/// are almost always `&str` or `String`; anything else is reported
/// generically rather than guessed at.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn usb_pump_loop(shared: Arc<Shared>, mut transport: Box<dyn UsbTransport>) {
    let mut reassembly = ReassemblyBuffer::new();

    while shared.running.load(Ordering::SeqCst) {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            pump_once(&shared, transport.as_mut(), &mut reassembly)
        }));
        let keep_going = match outcome {
            Ok(keep_going) => keep_going,
            Err(e) => {
                error!("usb pump worker panicked: {}", panic_message(&e));
                shared.set_state(PipelineState::Stopping);
                false
            }
        };
        if !keep_going {
            break;
        }
    }

    shared.running.store(false, Ordering::SeqCst);
    transport.disconnect();
}

/// One read-and-route cycle. Returns `false` if the pump should stop (a
/// fatal transport error or an `AuthFail`).
fn pump_once(shared: &Arc<Shared>, transport: &mut dyn UsbTransport, reassembly: &mut ReassemblyBuffer) -> bool {
    let chunk = match transport.read(USB_READ_CHUNK, USB_READ_TIMEOUT) {
        Ok(ReadOutcome::Data(data)) => data,
        Ok(ReadOutcome::Timeout) => return true,
        Err(e) => {
            shared.report_status(&format!("USB connection lost: {}", e));
            shared.set_state(PipelineState::Stopping);
            return false;
        }
    };
    if chunk.is_empty() {
        return true;
    }

    for packet in reassembly.feed(&chunk) {
        if !route_packet(shared, transport, packet.kind, &packet.payload) {
            shared.set_state(PipelineState::Stopping);
            return false;
        }
    }
    true
}

/// Returns `false` if the pipeline should stop after this packet (an
/// `AuthFail`).
fn route_packet(shared: &Arc<Shared>, transport: &mut dyn UsbTransport, kind: PacketType, payload: &[u8]) -> bool {
    match kind {
        PacketType::AuthChallenge => {
            match shared.authenticator.sign(payload) {
                Ok(sig) => {
                    let response = encode_packet(PacketType::AuthResponse, &sig);
                    if let Err(e) = transport.write(&response) {
                        shared.report_status(&format!("failed to write auth response: {}", e));
                    } else {
                        shared.report_status("auth response sent");
                    }
                }
                Err(e) => {
                    warn!("auth challenge rejected: {}", e);
                }
            }
            true
        }
        PacketType::AuthSuccess => {
            shared.report_status("authentication successful");
            shared.set_state(PipelineState::Streaming);
            true
        }
        PacketType::AuthFail => {
            shared.report_status("authentication failed");
            false
        }
        PacketType::Config => {
            if payload.is_empty() {
                return true;
            }
            let subtype = ConfigSubtype::from_byte(payload[0]);
            let data = &payload[1..];
            // Applied inline on this worker, not via a queue, so that config
            // is guaranteed observed before the next video payload. A panic
            // inside the decoder facade here is caught by the pump worker's
            // top-level catch in `usb_pump_loop`; `lock_decoder` keeps the
            // mutex usable afterwards for the decoder-feeder worker.
            match subtype {
                ConfigSubtype::VideoSps => shared.lock_decoder().set_sps(data),
                ConfigSubtype::VideoPps => shared.lock_decoder().set_pps(data),
                ConfigSubtype::AudioAac | ConfigSubtype::Other(_) => {}
            }
            if let Some(cb) = &shared.config_cb {
                cb(subtype.to_byte(), data);
            }
            true
        }
        PacketType::Video => {
            if shared.video_queue.try_put(payload.to_vec()).is_err() {
                let n = shared.video_drops.fetch_add(1, Ordering::Relaxed) + 1;
                if n % VIDEO_DROP_LOG_INTERVAL == 0 {
                    warn!("dropped {} video packets (ingress queue full)", n);
                }
            }
            true
        }
        PacketType::Audio => {
            let _ = shared.audio_queue.try_put(payload.to_vec());
            true
        }
        PacketType::Heartbeat => true,
        PacketType::AuthResponse => true,
    }
}

fn decoder_feeder_loop(shared: Arc<Shared>) {
    while shared.running.load(Ordering::SeqCst) {
        let Some(payload) = shared.video_queue.get(VIDEO_GET_TIMEOUT) else {
            continue;
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| shared.lock_decoder().decode(&payload)));
        match outcome {
            Ok(Some(frame)) => {
                shared.frame_queue.put(frame);
            }
            Ok(None) => {}
            Err(e) => {
                error!("video decoder panicked: {}", panic_message(&e));
                shared.set_state(PipelineState::Stopping);
                shared.running.store(false, Ordering::SeqCst);
                break;
            }
        }
    }
    let _ = catch_unwind(AssertUnwindSafe(|| shared.lock_decoder().stop()));
}

fn render_poll_loop(shared: Arc<Shared>, renderer: &mut dyn Renderer) {
    while shared.running.load(Ordering::SeqCst) {
        let outcome = catch_unwind(AssertUnwindSafe(|| render_once(&shared, &mut *renderer)));
        let keep_going = match outcome {
            Ok(keep_going) => keep_going,
            Err(e) => {
                error!("renderer panicked: {}", panic_message(&e));
                shared.set_state(PipelineState::Stopping);
                false
            }
        };
        if !keep_going {
            break;
        }
    }
    let _ = catch_unwind(AssertUnwindSafe(|| renderer.stop()));
    shared.running.store(false, Ordering::SeqCst);
}

/// One poll cycle. Returns `false` if the render worker should stop (the
/// renderer reported it's no longer running).
fn render_once(shared: &Arc<Shared>, renderer: &mut dyn Renderer) -> bool {
    if !renderer.is_running() {
        shared.report_status("renderer stopped externally");
        shared.set_state(PipelineState::Stopping);
        return false;
    }
    if let Some(frame) = shared.frame_queue.get(RENDER_POLL_TIMEOUT) {
        renderer.update_frame(&frame);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::make_pem;
    use crate::decoder::NullDecoder;
    use crate::renderer::NullRenderer;
    use std::collections::VecDeque;

    fn test_authenticator(seed: u8) -> Authenticator {
        Authenticator::load_from_pem(&make_pem(&[seed; 32])).unwrap()
    }

    fn test_shared(authenticator: Authenticator) -> Shared {
        Shared {
            running: AtomicBool::new(true),
            state: Mutex::new(PipelineState::Streaming),
            video_queue: BoundedDropQueue::new(VIDEO_QUEUE_CAPACITY),
            audio_queue: BoundedDropQueue::new(AUDIO_QUEUE_CAPACITY),
            frame_queue: DroppingQueue::new(FRAME_QUEUE_CAPACITY),
            decoder: Arc::new(Mutex::new(Box::new(NullDecoder::default()) as Box<dyn VideoDecoder>)),
            authenticator,
            video_drops: AtomicU32::new(0),
            status_cb: None,
            config_cb: None,
        }
    }

    /// Transport stand-in backed by a queue of canned reads and a record of
    /// every write, for asserting on routing order without real USB
    /// hardware.
    struct MockTransport {
        reads: VecDeque<Vec<u8>>,
        writes: Vec<Vec<u8>>,
    }

    impl MockTransport {
        fn new(reads: Vec<Vec<u8>>) -> Self {
            Self {
                reads: reads.into(),
                writes: Vec::new(),
            }
        }
    }

    impl UsbTransport for MockTransport {
        fn read(&mut self, _max_len: usize, _timeout: Duration) -> crate::error::Result<ReadOutcome> {
            match self.reads.pop_front() {
                Some(chunk) => Ok(ReadOutcome::Data(chunk)),
                None => Ok(ReadOutcome::Timeout),
            }
        }

        fn write(&mut self, data: &[u8]) -> crate::error::Result<()> {
            self.writes.push(data.to_vec());
            Ok(())
        }

        fn disconnect(&mut self) {}
    }

    /// A transport that always has more data, for exercising stop
    /// responsiveness under a saturated ingress stream.
    struct SaturatedTransport {
        chunk: Vec<u8>,
    }

    impl UsbTransport for SaturatedTransport {
        fn read(&mut self, _max_len: usize, _timeout: Duration) -> crate::error::Result<ReadOutcome> {
            Ok(ReadOutcome::Data(self.chunk.clone()))
        }

        fn write(&mut self, _data: &[u8]) -> crate::error::Result<()> {
            Ok(())
        }

        fn disconnect(&mut self) {}
    }

    #[test]
    fn auth_challenge_writes_response_before_next_packet_is_routed() {
        let authenticator = test_authenticator(1);
        let challenge = [0u8; 32];
        let expected_sig = authenticator.sign(&challenge).unwrap();
        let shared = Arc::new(test_shared(authenticator));
        let mut transport = MockTransport::new(vec![]);

        assert!(route_packet(&shared, &mut transport, PacketType::AuthChallenge, &challenge));
        assert_eq!(transport.writes, vec![encode_packet(PacketType::AuthResponse, &expected_sig)]);

        // The response was already on the wire by the time the next packet
        // is routed: routing a Video packet here doesn't add another write,
        // and the video payload reaches the ingress queue untouched.
        assert!(route_packet(&shared, &mut transport, PacketType::Video, &[1, 2, 3]));
        assert_eq!(transport.writes.len(), 1);
        assert_eq!(shared.video_queue.get(Duration::from_millis(10)), Some(vec![1, 2, 3]));
    }

    #[test]
    fn auth_fail_stops_pump_and_transitions_to_stopping() {
        let shared = Arc::new(test_shared(test_authenticator(2)));
        let mut transport = MockTransport::new(vec![]);
        let mut reassembly = ReassemblyBuffer::new();

        let chunk = encode_packet(PacketType::AuthFail, &[]);
        let mut saw_auth_fail = false;
        for packet in reassembly.feed(&chunk) {
            saw_auth_fail = true;
            assert!(!route_packet(&shared, &mut transport, packet.kind, &packet.payload));
        }
        assert!(saw_auth_fail);

        // pump_once() sets Stopping itself when route_packet returns false;
        // exercise that directly too.
        let mut reassembly = ReassemblyBuffer::new();
        let mut transport = MockTransport::new(vec![encode_packet(PacketType::AuthFail, &[])]);
        assert!(!pump_once(&shared, &mut transport, &mut reassembly));
        assert_eq!(*shared.state.lock().unwrap(), PipelineState::Stopping);
    }

    #[test]
    fn transport_fatal_error_transitions_to_stopping() {
        struct FailingTransport;
        impl UsbTransport for FailingTransport {
            fn read(&mut self, _max_len: usize, _timeout: Duration) -> crate::error::Result<ReadOutcome> {
                Err(crate::error::DriverError::TransportFatal("cable unplugged".into()))
            }
            fn write(&mut self, _data: &[u8]) -> crate::error::Result<()> {
                Ok(())
            }
            fn disconnect(&mut self) {}
        }

        let shared = Arc::new(test_shared(test_authenticator(3)));
        let mut transport = FailingTransport;
        let mut reassembly = ReassemblyBuffer::new();
        assert!(!pump_once(&shared, &mut transport, &mut reassembly));
        assert_eq!(*shared.state.lock().unwrap(), PipelineState::Stopping);
    }

    #[test]
    fn decoder_panic_is_caught_and_stops_the_pipeline() {
        struct PanickingDecoder;
        impl VideoDecoder for PanickingDecoder {
            fn set_sps(&mut self, _sps: &[u8]) {}
            fn set_pps(&mut self, _pps: &[u8]) {}
            fn decode(&mut self, _payload: &[u8]) -> Option<crate::decoder::Frame> {
                panic!("boom");
            }
            fn stop(&mut self) {}
        }

        let mut shared = test_shared(test_authenticator(4));
        shared.decoder = Arc::new(Mutex::new(Box::new(PanickingDecoder)));
        shared.video_queue.try_put(vec![1, 2, 3]).unwrap();
        let shared = Arc::new(shared);

        decoder_feeder_loop(shared.clone());

        assert!(!shared.running.load(Ordering::SeqCst));
        assert_eq!(*shared.state.lock().unwrap(), PipelineState::Stopping);
        // lock_decoder() recovers from poison instead of panicking, so this
        // must not panic even though the mutex was poisoned mid-decode above.
        let _guard = shared.lock_decoder();
    }

    #[test]
    fn renderer_reporting_not_running_stops_render_worker() {
        let shared = Arc::new(test_shared(test_authenticator(5)));
        let mut renderer = NullRenderer::default();
        // never start()ed, so is_running() is false from the first poll
        render_poll_loop(shared.clone(), &mut renderer);
        assert!(!shared.running.load(Ordering::SeqCst));
        assert_eq!(*shared.state.lock().unwrap(), PipelineState::Stopping);
    }

    #[test]
    fn stop_is_responsive_under_a_saturated_ingress_stream() {
        let authenticator = test_authenticator(6);
        let chunk = encode_packet(PacketType::Video, &[0u8; 16]);
        let transport: Box<dyn UsbTransport> = Box::new(SaturatedTransport { chunk });

        let mut pipeline = Pipeline::default();
        pipeline
            .start_with_transport(
                transport,
                authenticator,
                Box::new(NullDecoder::default()),
                Box::new(NullRenderer::default()),
                None,
                None,
            )
            .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        let started = std::time::Instant::now();
        pipeline.stop();
        let elapsed = started.elapsed();

        assert!(!pipeline.is_running());
        assert!(elapsed < Duration::from_secs(1), "stop() took {:?}", elapsed);
    }
}
