//! Execution contexts for the capture loop.
//!
//! By default the loop runs in a worker child process: the viewer re-runs its
//! own executable with hidden flags, the worker streams frames over its
//! stdout, and the viewer's reader task publishes each one into the shared
//! slot. STOP travels the other way over the worker's stdin; end of stdin
//! means the same. The thread variant runs the same loop in-process against
//! the slot directly.

use std::io::{Read, Write};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use replicator_platform::screen::{CaptureBackend, CaptureError, CaptureRegion, PixelBuffer};
use replicator_platform::window::WindowHandle;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::capture::FrameCapture;
use crate::capture_loop::{run_capture_loop, CaptureLoopError, LoopStats};
use crate::protocol::{self, ProtocolError, WorkerEvent};
use crate::slot::{FrameSink, SharedFrameSlot};

/// Hidden flag that switches the executable into worker mode.
pub const WORKER_MODE_FLAG: &str = "--worker-mode";
pub const WINDOW_HANDLE_FLAG: &str = "--window-handle";
pub const REGION_FLAG: &str = "--region";

/// Opens the OS capture backend for a resolved window.
pub type OpenBackend =
    Box<dyn FnOnce(WindowHandle) -> Result<Box<dyn CaptureBackend>, CaptureError> + Send>;

// --- Worker side ---

/// Frame sink that encodes every publish onto a byte stream.
pub struct PipeSink<W: Write> {
    writer: Mutex<W>,
    stop: Arc<AtomicBool>,
}

impl<W: Write> PipeSink<W> {
    pub fn new(writer: W, stop: Arc<AtomicBool>) -> Self {
        Self {
            writer: Mutex::new(writer),
            stop,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write> FrameSink for PipeSink<W> {
    fn publish(&self, frame: Option<PixelBuffer>) -> std::io::Result<()> {
        let msg = protocol::frame(frame.as_ref());
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        protocol::write_message(&mut *writer, &msg)
    }

    fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Watch the control stream on a background thread and raise `stop` on
/// STOP, end of stream, or a broken stream.
pub fn watch_for_stop<R>(mut reader: R, stop: Arc<AtomicBool>) -> std::thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    std::thread::spawn(move || {
        loop {
            match protocol::read_message(&mut reader) {
                Ok(Some(msg)) if msg.msg_type == protocol::STOP => {
                    debug!("STOP received");
                    break;
                }
                Ok(Some(msg)) => {
                    warn!("ignoring message 0x{:02x} on control stream", msg.msg_type);
                }
                Ok(None) => {
                    debug!("control stream closed");
                    break;
                }
                Err(e) => {
                    warn!("control stream failed: {}", e);
                    break;
                }
            }
        }
        stop.store(true, Ordering::SeqCst);
    })
}

/// Run the capture loop for `handle`, writing frames to `out` until `stop`
/// is raised. If capture cannot start, an UNAVAILABLE message carrying the
/// reason is written before returning the error.
pub fn run_worker<W, F>(
    handle: WindowHandle,
    region: Option<CaptureRegion>,
    open_backend: F,
    out: W,
    stop: Arc<AtomicBool>,
) -> Result<LoopStats>
where
    W: Write,
    F: FnOnce(WindowHandle) -> Result<Box<dyn CaptureBackend>, CaptureError>,
{
    info!("worker starting for window {}", handle);
    let sink = PipeSink::new(out, stop);

    match run_capture_loop(|| open_backend(handle).map(FrameCapture::bind), region, &sink) {
        Ok(stats) => Ok(stats),
        Err(CaptureLoopError::Unavailable(e)) => {
            let mut out = sink.into_inner();
            let msg = protocol::unavailable(&e.to_string())?;
            protocol::write_message(&mut out, &msg).context("failed to report capture failure")?;
            Err(e).context("capture unavailable")
        }
        Err(e @ CaptureLoopError::SinkClosed(_)) => Err(e).context("viewer closed the frame pipe"),
    }
}

/// Worker entry point on the process's own stdio.
pub fn run_worker_stdio<F>(handle: WindowHandle, region: Option<CaptureRegion>, open_backend: F) -> Result<()>
where
    F: FnOnce(WindowHandle) -> Result<Box<dyn CaptureBackend>, CaptureError>,
{
    let stop = Arc::new(AtomicBool::new(false));
    let _watcher = watch_for_stop(std::io::stdin(), Arc::clone(&stop));

    let out = std::io::BufWriter::with_capacity(1 << 20, std::io::stdout().lock());
    let stats = run_worker(handle, region, open_backend, out, stop)?;
    info!("worker exiting ({} frames, {} misses)", stats.frames, stats.misses);
    Ok(())
}

/// Arguments that start the worker for `handle`.
pub fn worker_args(handle: WindowHandle, region: Option<CaptureRegion>) -> Vec<String> {
    // `flag=value` form: handles and region origins may be negative.
    let mut args = vec![
        WORKER_MODE_FLAG.to_string(),
        format!("{}={}", WINDOW_HANDLE_FLAG, handle.raw()),
    ];
    if let Some(region) = region {
        args.push(format!("{}={}", REGION_FLAG, region));
    }
    args
}

// --- Viewer side ---

/// Publish every message from the worker's output into `slot` until the
/// stream ends. Once stop is requested the stream is still drained, but
/// nothing more reaches the slot. Returns the number of messages read.
pub async fn pump_frames<R>(mut reader: R, slot: &SharedFrameSlot) -> Result<u64, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut count = 0;
    let mut discarded = 0u64;
    while let Some(msg) = protocol::read_message_async(&mut reader).await? {
        count += 1;
        // Keep reading: a worker blocked writing to a full pipe cannot exit.
        if slot.is_stop_requested() {
            discarded += 1;
            continue;
        }
        match msg.into_event()? {
            WorkerEvent::Frame(frame) => slot.publish(Some(frame)),
            WorkerEvent::NoFrame => slot.publish(None),
            WorkerEvent::Unavailable(reason) => {
                slot.report_fault(format!("capture unavailable: {}", reason));
            }
            WorkerEvent::Stop => warn!("unexpected STOP from worker"),
        }
    }
    if discarded > 0 {
        debug!("discarded {} worker messages after stop", discarded);
    }
    Ok(count)
}

/// Tell the worker to stop. The stream is closed afterwards, so a worker
/// that misses the message still sees end of stream.
pub async fn send_stop<W>(mut writer: W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    protocol::write_message_async(&mut writer, &protocol::stop()).await
}

pub struct WorkerProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    reader: JoinHandle<()>,
}

pub struct CaptureThread {
    handle: std::thread::JoinHandle<()>,
}

/// The running capture loop, wherever it lives.
pub enum CaptureContext {
    Process(WorkerProcess),
    Thread(CaptureThread),
}

impl CaptureContext {
    /// Start `exe` as a worker for `handle`. Must be called inside a tokio
    /// runtime.
    pub fn spawn_process(
        exe: &Path,
        handle: WindowHandle,
        region: Option<CaptureRegion>,
        slot: Arc<SharedFrameSlot>,
    ) -> Result<Self> {
        let mut child = Command::new(exe)
            .args(worker_args(handle, region))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start capture worker {}", exe.display()))?;

        let stdout = child.stdout.take().context("worker stdout not captured")?;
        let stdin = child.stdin.take();
        info!("capture worker started (pid {:?}) for window {}", child.id(), handle);

        let reader = tokio::spawn(async move {
            match pump_frames(stdout, &slot).await {
                Ok(count) => {
                    debug!("worker stream ended after {} messages", count);
                    if !slot.is_stop_requested() {
                        slot.report_fault("capture worker exited unexpectedly");
                    }
                }
                Err(e) => {
                    if !slot.is_stop_requested() {
                        slot.report_fault(format!("capture worker stream failed: {}", e));
                    }
                }
            }
        });

        Ok(Self::Process(WorkerProcess { child, stdin, reader }))
    }

    /// Run the capture loop on a thread of this process.
    pub fn spawn_thread(
        handle: WindowHandle,
        region: Option<CaptureRegion>,
        open_backend: OpenBackend,
        slot: Arc<SharedFrameSlot>,
    ) -> Result<Self> {
        let thread = std::thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                let result = run_capture_loop(
                    || open_backend(handle).map(FrameCapture::bind),
                    region,
                    &*slot,
                );
                if let Err(e) = result {
                    slot.report_fault(e.to_string());
                }
            })
            .context("failed to start capture thread")?;

        info!("capture thread started for window {}", handle);
        Ok(Self::Thread(CaptureThread { handle: thread }))
    }

    /// Wait up to `timeout` for the context to exit after stop was
    /// requested; a worker process still running after that is killed, a
    /// thread is detached.
    pub async fn shutdown(self, slot: &SharedFrameSlot, timeout: Duration) {
        slot.request_stop();
        match self {
            CaptureContext::Process(worker) => worker.shutdown(timeout).await,
            CaptureContext::Thread(thread) => thread.shutdown(timeout).await,
        }
        debug!("slot took {} publishes", slot.publish_count());
    }
}

impl WorkerProcess {
    async fn shutdown(mut self, timeout: Duration) {
        if let Some(stdin) = self.stdin.take() {
            if let Err(e) = send_stop(stdin).await {
                debug!("could not send STOP to worker: {}", e);
            }
        }

        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => info!("capture worker exited: {}", status),
            Ok(Err(e)) => error!("failed to wait for capture worker: {}", e),
            Err(_) => {
                warn!("capture worker did not stop within {:?}, killing it", timeout);
                if let Err(e) = self.child.kill().await {
                    error!("failed to kill capture worker: {}", e);
                }
            }
        }

        if tokio::time::timeout(timeout, &mut self.reader).await.is_err() {
            self.reader.abort();
        }
    }
}

impl CaptureThread {
    async fn shutdown(self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.handle.is_finished() {
            if tokio::time::Instant::now() >= deadline {
                warn!("capture thread did not stop within {:?}, detaching it", timeout);
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        if self.handle.join().is_err() {
            error!("capture thread panicked");
        } else {
            info!("capture thread stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::tests::ScriptedBackend;
    use crate::display::{DisplayLoop, DisplaySettings, HostSurface};
    use crate::protocol::Message;
    use std::io::Cursor;
    use std::time::Instant;
    use tokio::io::AsyncWriteExt;

    /// Backend that raises a stop flag on its `stop_on`-th copy.
    struct CountingBackend {
        inner: ScriptedBackend,
        calls: u32,
        stop_on: u32,
        stop: Arc<AtomicBool>,
    }

    impl CaptureBackend for CountingBackend {
        fn handle(&self) -> WindowHandle {
            self.inner.handle()
        }

        fn client_size(&self) -> Result<(i32, i32), CaptureError> {
            self.inner.client_size()
        }

        fn copy_region(&mut self, region: &CaptureRegion, dest: &mut [u8]) -> Result<u32, CaptureError> {
            self.calls += 1;
            if self.calls == self.stop_on {
                self.stop.store(true, Ordering::SeqCst);
            }
            self.inner.copy_region(region, dest)
        }
    }

    fn decode_all(mut buf: &[u8]) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(msg) = protocol::read_message(&mut buf).unwrap() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_worker_args() {
        assert_eq!(
            worker_args(WindowHandle(0x1a2b), None),
            vec!["--worker-mode", "--window-handle=6699"]
        );
        assert_eq!(
            worker_args(WindowHandle(5), Some(CaptureRegion::new(-8, 8, 640, 480))),
            vec!["--worker-mode", "--window-handle=5", "--region=-8,8,640,480"]
        );
    }

    #[test]
    fn test_pipe_sink_encodes_frames() {
        let sink = PipeSink::new(Vec::new(), Arc::new(AtomicBool::new(false)));
        sink.publish(Some(PixelBuffer::filled(8, 2, 9))).unwrap();
        sink.publish(None).unwrap();

        let messages = decode_all(&sink.into_inner());
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].msg_type, protocol::FRAME);
        assert_eq!(messages[1].msg_type, protocol::NO_FRAME);
    }

    #[test]
    fn test_watcher_raises_stop_on_message() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut input = Vec::new();
        protocol::write_message(&mut input, &protocol::stop()).unwrap();
        watch_for_stop(Cursor::new(input), Arc::clone(&stop)).join().unwrap();
        assert!(stop.load(Ordering::SeqCst));
    }

    #[test]
    fn test_watcher_raises_stop_on_eof() {
        let stop = Arc::new(AtomicBool::new(false));
        watch_for_stop(Cursor::new(Vec::new()), Arc::clone(&stop)).join().unwrap();
        assert!(stop.load(Ordering::SeqCst));
    }

    #[test]
    fn test_worker_streams_until_stopped() {
        let stop = Arc::new(AtomicBool::new(false));
        let backend = CountingBackend {
            inner: ScriptedBackend::sized(16, 4),
            calls: 0,
            stop_on: 4,
            stop: Arc::clone(&stop),
        };

        let mut out = Vec::new();
        let stats = run_worker(
            WindowHandle(0x42),
            None,
            |_| Ok(Box::new(backend) as Box<dyn CaptureBackend>),
            &mut out,
            stop,
        )
        .unwrap();

        assert_eq!(stats.frames, 3);
        let messages = decode_all(&out);
        assert_eq!(messages.len(), 3);
        assert!(messages.iter().all(|m| m.msg_type == protocol::FRAME));
    }

    #[test]
    fn test_worker_reports_unavailable() {
        let mut out = Vec::new();
        let result = run_worker(
            WindowHandle(0x42),
            None,
            |_| Err(CaptureError::WindowNotFound),
            &mut out,
            Arc::new(AtomicBool::new(false)),
        );
        assert!(result.is_err());

        let messages = decode_all(&out);
        assert_eq!(messages.len(), 1);
        match messages[0].clone().into_event().unwrap() {
            WorkerEvent::Unavailable(reason) => assert!(reason.contains("no unique window")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pump_publishes_latest_and_faults() {
        let (mut worker_side, viewer_side) = tokio::io::duplex(1024);
        let slot = SharedFrameSlot::new();

        let writer = tokio::spawn(async move {
            let frames = [
                protocol::frame(Some(&PixelBuffer::filled(8, 1, 1))),
                protocol::frame(Some(&PixelBuffer::filled(16, 2, 2))),
                protocol::frame(None),
                protocol::frame(Some(&PixelBuffer::filled(8, 3, 3))),
                protocol::unavailable("window closed").unwrap(),
            ];
            for msg in &frames {
                protocol::write_message_async(&mut worker_side, msg).await.unwrap();
            }
            worker_side.shutdown().await.unwrap();
        });

        let count = pump_frames(viewer_side, &slot).await.unwrap();
        writer.await.unwrap();

        assert_eq!(count, 5);
        assert_eq!(slot.publish_count(), 4);
        assert_eq!(slot.read_latest().unwrap().dimensions(), (3, 8));
        assert_eq!(slot.take_fault().as_deref(), Some("capture unavailable: window closed"));
    }

    #[tokio::test]
    async fn test_pump_drains_without_publishing_after_stop() {
        let (mut worker_side, viewer_side) = tokio::io::duplex(1024);
        let slot = SharedFrameSlot::new();
        slot.request_stop();

        let writer = tokio::spawn(async move {
            for i in 0..5 {
                let msg = protocol::frame(Some(&PixelBuffer::filled(8, 2, i)));
                protocol::write_message_async(&mut worker_side, &msg).await.unwrap();
            }
            worker_side.shutdown().await.unwrap();
        });

        let count = pump_frames(viewer_side, &slot).await.unwrap();
        writer.await.unwrap();

        assert_eq!(count, 5);
        assert!(slot.publish_count() <= 1);
        assert!(slot.read_latest().is_none());
    }

    #[tokio::test]
    async fn test_pump_stops_publishing_mid_stream() {
        let (mut worker_side, viewer_side) = tokio::io::duplex(1 << 16);
        let slot = Arc::new(SharedFrameSlot::new());

        let first = protocol::frame(Some(&PixelBuffer::filled(8, 1, 1)));
        protocol::write_message_async(&mut worker_side, &first).await.unwrap();

        let pump_slot = Arc::clone(&slot);
        let pump = tokio::spawn(async move { pump_frames(viewer_side, &pump_slot).await });

        while slot.publish_count() < 1 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        slot.request_stop();
        for _ in 0..10 {
            let msg = protocol::frame(Some(&PixelBuffer::filled(16, 2, 2)));
            protocol::write_message_async(&mut worker_side, &msg).await.unwrap();
        }
        drop(worker_side);

        assert_eq!(pump.await.unwrap().unwrap(), 11);
        assert_eq!(slot.publish_count(), 1);
        assert_eq!(slot.read_latest().unwrap().dimensions(), (1, 8));
    }

    #[tokio::test]
    async fn test_pump_rejects_corrupt_frame() {
        let (mut worker_side, viewer_side) = tokio::io::duplex(1024);
        let slot = SharedFrameSlot::new();

        let bad = Message::new(protocol::FRAME, vec![8, 0, 0, 0, 2, 0, 0, 0, 1, 2, 3]);
        protocol::write_message_async(&mut worker_side, &bad).await.unwrap();
        drop(worker_side);

        assert!(matches!(
            pump_frames(viewer_side, &slot).await,
            Err(ProtocolError::BadFrame(_))
        ));
        assert!(slot.read_latest().is_none());
    }

    #[tokio::test]
    async fn test_send_stop_then_eof() {
        let (viewer_side, mut worker_side) = tokio::io::duplex(64);
        send_stop(viewer_side).await.unwrap();

        let msg = protocol::read_message_async(&mut worker_side).await.unwrap().unwrap();
        assert_eq!(msg.msg_type, protocol::STOP);
        assert!(protocol::read_message_async(&mut worker_side).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_thread_context_stops_within_timeout() {
        let slot = Arc::new(SharedFrameSlot::new());
        let context = CaptureContext::spawn_thread(
            WindowHandle(0x42),
            None,
            Box::new(|_| Ok(Box::new(ScriptedBackend::sized(32, 8)) as Box<dyn CaptureBackend>)),
            Arc::clone(&slot),
        )
        .unwrap();

        while slot.publish_count() < 5 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        context.shutdown(&slot, Duration::from_secs(5)).await;

        assert!(slot.is_stop_requested());
        let after = slot.publish_count();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(slot.publish_count(), after);
        assert!(slot.take_fault().is_none());
    }

    #[tokio::test]
    async fn test_thread_context_reports_open_failure() {
        let slot = Arc::new(SharedFrameSlot::new());
        let context = CaptureContext::spawn_thread(
            WindowHandle(0x42),
            None,
            Box::new(|_| Err(CaptureError::WindowNotFound)),
            Arc::clone(&slot),
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while slot.take_fault().is_none() {
            assert!(Instant::now() < deadline, "fault never reported");
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        context.shutdown(&slot, Duration::from_secs(1)).await;
        assert_eq!(slot.publish_count(), 0);
    }

    #[derive(Default)]
    struct SizeRecorder {
        sizes: Vec<(u32, u32)>,
        bitmaps: usize,
    }

    impl HostSurface for SizeRecorder {
        fn set_size(&mut self, width: u32, height: u32) {
            self.sizes.push((width, height));
        }
        fn set_bitmap(&mut self, _pixels: &[u8], _width: u32, _height: u32) {
            self.bitmaps += 1;
        }
        fn update_bitmap_in_place(&mut self, _pixels: &[u8]) {}
        fn set_rate_label(&mut self, _text: &str) {}
        fn request_repaint(&mut self) {}
    }

    #[tokio::test]
    async fn test_region_width_aligned_end_to_end() {
        let slot = Arc::new(SharedFrameSlot::new());
        let context = CaptureContext::spawn_thread(
            WindowHandle(0x42),
            Some(CaptureRegion::new(0, 0, 37, 12)),
            Box::new(|_| Ok(Box::new(ScriptedBackend::sized(640, 480)) as Box<dyn CaptureBackend>)),
            Arc::clone(&slot),
        )
        .unwrap();

        let first = loop {
            if let Some(frame) = slot.read_latest() {
                break frame;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        };

        let mut surface = SizeRecorder::default();
        let mut display = DisplayLoop::start(
            Arc::clone(&slot),
            DisplaySettings::default(),
            &first,
            &mut surface,
            Instant::now(),
        );
        for _ in 0..5 {
            display.tick(&mut surface, Instant::now());
        }
        context.shutdown(&slot, Duration::from_secs(5)).await;

        assert_eq!(surface.sizes, vec![(32, 12)]);
        assert_eq!(surface.bitmaps, 1);
        assert_eq!(first.pixel(0, 0), Some([3, 2, 1]));
    }

    #[tokio::test]
    async fn test_narrow_region_yields_no_frames() {
        let slot = Arc::new(SharedFrameSlot::new());
        let context = CaptureContext::spawn_thread(
            WindowHandle(0x42),
            Some(CaptureRegion::new(0, 0, 4, 12)),
            Box::new(|_| Ok(Box::new(ScriptedBackend::sized(640, 480)) as Box<dyn CaptureBackend>)),
            Arc::clone(&slot),
        )
        .unwrap();

        while slot.publish_count() < 10 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(slot.read_latest().is_none());
        context.shutdown(&slot, Duration::from_secs(5)).await;
    }
}
