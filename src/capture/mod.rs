//! Video source capture
//!
//! ## Responsibilities
//!
//! - Own the capture pipeline for one camera: an ffmpeg child process
//!   decoding the source (device, file or network stream) to raw BGR24
//!   frames on stdout
//! - Loop playback for finite files, exhaustion reporting for live sources
//! - Idempotent release of the child on every exit path, including the
//!   signal-driven one
//!
//! The reader is synchronous by design: the detection loop is a blocking
//! capture/detect/publish cycle and concurrency across cameras comes from
//! process multiplicity.

use crate::error::{Error, Result};
use std::io::Read;
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

/// One decoded frame in BGR24 layout
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl RawFrame {
    /// Encode to JPEG at the given quality (1-100). This is the wire image
    /// format published on the frame topic: encode once, serve many.
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let expected = (self.width * self.height * 3) as usize;
        if self.data.len() != expected {
            return Err(Error::Encode(format!(
                "frame buffer is {} bytes, expected {}",
                self.data.len(),
                expected
            )));
        }

        // BGR -> RGB channel swap for the encoder
        let mut rgb = self.data.clone();
        for px in rgb.chunks_exact_mut(3) {
            px.swap(0, 2);
        }

        let mut out = Vec::new();
        let mut encoder =
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        encoder
            .encode(&rgb, self.width, self.height, image::ColorType::Rgb8)
            .map_err(|e| Error::Encode(e.to_string()))?;
        Ok(out)
    }
}

/// Classified capture source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// V4L2 device, by index
    Device(i32),
    /// Finite video file; loops back to the start on EOF
    File(String),
    /// Live network stream (RTSP/HTTP/UDP)
    Stream(String),
}

impl SourceKind {
    /// Classify a source string: a bare integer or `/dev/videoN` is a
    /// device, an existing path is a finite file, anything else is treated
    /// as a live stream URL.
    pub fn parse(source: &str) -> Self {
        if let Some(index) = parse_device_index(source) {
            return SourceKind::Device(index);
        }
        if Path::new(source).is_file() {
            return SourceKind::File(source.to_string());
        }
        SourceKind::Stream(source.to_string())
    }

    /// Finite sources are replayed from the start on exhaustion
    pub fn is_finite(&self) -> bool {
        matches!(self, SourceKind::File(_))
    }
}

/// Parse a device index from `N` or `/dev/videoN`
pub fn parse_device_index(source: &str) -> Option<i32> {
    if let Ok(index) = source.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = source.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            return stripped.parse().ok();
        }
    }
    None
}

/// Lock-free release path for a [`VideoSource`].
///
/// The detection loop holds the source mutex for the whole blocking
/// `read_frame`, so the signal path must not need that lock to stop
/// capture. The handle kills the decode child by PID: the blocked read
/// returns EOF immediately and the loop unwinds on its own.
#[derive(Clone)]
pub struct SourceReleaseHandle {
    child_pid: Arc<AtomicI32>,
    released: Arc<AtomicBool>,
}

impl SourceReleaseHandle {
    /// Mark the source released and kill the decode child. Idempotent, and
    /// never blocks on the source lock.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let pid = self.child_pid.load(Ordering::SeqCst);
        if pid > 0 {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
        tracing::info!(pid = pid, "Capture pipeline release requested");
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

/// Capture pipeline for one camera
pub struct VideoSource {
    kind: SourceKind,
    width: u32,
    height: u32,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    /// Frames delivered since the last (re)spawn; a respawn that yields no
    /// frames means the source itself is unusable
    frames_since_spawn: u64,
    /// Decode child PID, shared with release handles (0 = not running)
    child_pid: Arc<AtomicI32>,
    released: Arc<AtomicBool>,
}

impl VideoSource {
    /// Open the source. Fails fast with `SourceUnavailable` when the decode
    /// pipeline cannot be started; the owning process should exit non-zero.
    pub fn open(source: &str, width: u32, height: u32) -> Result<Self> {
        let kind = SourceKind::parse(source);
        let mut video = Self {
            kind,
            width,
            height,
            child: None,
            stdout: None,
            frames_since_spawn: 0,
            child_pid: Arc::new(AtomicI32::new(0)),
            released: Arc::new(AtomicBool::new(false)),
        };
        video.spawn_reader()?;
        Ok(video)
    }

    /// Handle for releasing this source without the source lock (signal path)
    pub fn release_handle(&self) -> SourceReleaseHandle {
        SourceReleaseHandle {
            child_pid: self.child_pid.clone(),
            released: self.released.clone(),
        }
    }

    pub fn kind(&self) -> &SourceKind {
        &self.kind
    }

    pub fn is_finite(&self) -> bool {
        self.kind.is_finite()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");

        match &self.kind {
            SourceKind::Device(index) => {
                cmd.arg("-f")
                    .arg("video4linux2")
                    .arg("-i")
                    .arg(format!("/dev/video{index}"));
            }
            SourceKind::File(path) => {
                // -re paces decoding at native frame rate so looped files
                // behave like a live feed
                cmd.arg("-re").arg("-i").arg(path);
            }
            SourceKind::Stream(url) => {
                if url.starts_with("rtsp://") {
                    cmd.arg("-rtsp_transport").arg("tcp");
                }
                cmd.arg("-fflags")
                    .arg("nobuffer")
                    .arg("-flags")
                    .arg("low_delay")
                    .arg("-i")
                    .arg(url);
            }
        }

        cmd.arg("-an")
            .arg("-vf")
            .arg(format!("scale={}:{}", self.width, self.height))
            .arg("-pix_fmt")
            .arg("bgr24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            // ffmpeg errors land in the worker's per-camera log file
            .stderr(Stdio::inherit());
        cmd
    }

    fn spawn_reader(&mut self) -> Result<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(Error::SourceExhausted("source released".to_string()));
        }
        self.kill_child();

        let mut child = self.build_command().spawn().map_err(|e| {
            Error::SourceUnavailable(format!("failed to start decode pipeline: {e}"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            Error::SourceUnavailable("decode pipeline has no stdout".to_string())
        })?;
        self.child_pid.store(child.id() as i32, Ordering::SeqCst);

        self.child = Some(child);
        self.stdout = Some(stdout);
        self.frames_since_spawn = 0;

        // A release that raced the spawn saw pid 0; reap the child here
        if self.released.load(Ordering::SeqCst) {
            self.kill_child();
            return Err(Error::SourceExhausted("source released".to_string()));
        }

        tracing::debug!(kind = ?self.kind, "Capture pipeline started");
        Ok(())
    }

    /// Read one frame, blocking until it is available.
    ///
    /// On EOF: a finite file is reopened from the start (loop playback); a
    /// live source returns `SourceExhausted`. A source that produces EOF
    /// without ever delivering a frame returns `SourceUnavailable`.
    pub fn read_frame(&mut self) -> Result<RawFrame> {
        let frame_len = (self.width * self.height * 3) as usize;

        loop {
            if self.released.load(Ordering::SeqCst) {
                return Err(Error::SourceExhausted("source released".to_string()));
            }

            let stdout = self.stdout.as_mut().ok_or_else(|| {
                Error::SourceExhausted("capture pipeline not running".to_string())
            })?;

            let mut data = vec![0u8; frame_len];
            match stdout.read_exact(&mut data) {
                Ok(()) => {
                    self.frames_since_spawn += 1;
                    return Ok(RawFrame {
                        data,
                        width: self.width,
                        height: self.height,
                    });
                }
                Err(e) => {
                    if self.frames_since_spawn == 0 {
                        self.release();
                        return Err(Error::SourceUnavailable(format!(
                            "source produced no frames: {e}"
                        )));
                    }
                    if self.is_finite() {
                        tracing::debug!(kind = ?self.kind, "Finite source exhausted, looping playback");
                        self.spawn_reader()?;
                        continue;
                    }
                    self.release();
                    return Err(Error::SourceExhausted(format!("live source ended: {e}")));
                }
            }
        }
    }

    fn kill_child(&mut self) {
        self.stdout = None;
        self.child_pid.store(0, Ordering::SeqCst);
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    /// Release the capture pipeline and reap the child. The signal path uses
    /// [`SourceReleaseHandle`] instead, since this needs the source lock;
    /// double release is a no-op beyond reaping.
    pub fn release(&mut self) {
        let first = !self.released.swap(true, Ordering::SeqCst);
        // Reap even after a handle-side release, which kills without waiting
        self.kill_child();
        if first {
            tracing::info!(kind = ?self.kind, "Capture pipeline released");
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl Drop for VideoSource {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_device_index() {
        assert_eq!(parse_device_index("0"), Some(0));
        assert_eq!(parse_device_index("/dev/video2"), Some(2));
        assert_eq!(parse_device_index("/dev/video"), None);
        assert_eq!(parse_device_index("rtsp://host/stream"), None);
    }

    #[test]
    fn test_source_kind_classification() {
        assert_eq!(SourceKind::parse("1"), SourceKind::Device(1));
        assert_eq!(
            SourceKind::parse("rtsp://cam.local/stream"),
            SourceKind::Stream("rtsp://cam.local/stream".to_string())
        );
        assert!(!SourceKind::parse("rtsp://cam.local/stream").is_finite());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not a real video").unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let kind = SourceKind::parse(&path);
        assert_eq!(kind, SourceKind::File(path));
        assert!(kind.is_finite());
    }

    #[test]
    fn test_to_jpeg_produces_jpeg_magic() {
        let frame = RawFrame {
            data: vec![128u8; 8 * 8 * 3],
            width: 8,
            height: 8,
        };
        let jpeg = frame.to_jpeg(80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_to_jpeg_rejects_wrong_buffer_size() {
        let frame = RawFrame {
            data: vec![0u8; 10],
            width: 8,
            height: 8,
        };
        assert!(frame.to_jpeg(80).is_err());
    }

    fn stream_source(width: u32, height: u32) -> VideoSource {
        VideoSource {
            kind: SourceKind::Stream("rtsp://unreachable/".to_string()),
            width,
            height,
            child: None,
            stdout: None,
            frames_since_spawn: 0,
            child_pid: Arc::new(AtomicI32::new(0)),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stand-in for a stalled live source: a child whose stdout stays open
    /// but never produces data
    fn attach_silent_child(video: &mut VideoSource) {
        let mut child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        video.stdout = child.stdout.take();
        video
            .child_pid
            .store(child.id() as i32, Ordering::SeqCst);
        video.child = Some(child);
        // Past the no-frames-ever fast-fail path
        video.frames_since_spawn = 1;
    }

    #[test]
    fn test_double_release_is_noop() {
        // Release before any read; the pipeline may or may not have started
        // depending on the environment, so only exercise idempotence.
        let mut video = stream_source(4, 4);
        video.release();
        assert!(video.is_released());
        video.release();
        assert!(video.is_released());
    }

    #[test]
    fn test_release_handle_unblocks_reader_holding_lock() {
        use std::sync::Mutex;
        use std::time::{Duration, Instant};

        let mut video = stream_source(4, 4);
        attach_silent_child(&mut video);
        let handle = video.release_handle();
        let source = Arc::new(Mutex::new(video));

        // Reader holds the source lock for the whole blocking read, exactly
        // like the detection loop does
        let reader = {
            let source = source.clone();
            std::thread::spawn(move || source.lock().unwrap().read_frame())
        };
        std::thread::sleep(Duration::from_millis(200));

        // The handle must release without the lock and without waiting for
        // the stalled read to finish on its own
        let released_at = Instant::now();
        handle.release();
        assert!(released_at.elapsed() < Duration::from_secs(1));
        assert!(handle.is_released());

        // Killing the child ends the read promptly with an error
        let result = reader.join().unwrap();
        assert!(released_at.elapsed() < Duration::from_secs(3));
        assert!(matches!(result, Err(Error::SourceExhausted(_))));
    }

    #[test]
    fn test_read_after_release_fails_fast() {
        let mut video = stream_source(4, 4);
        attach_silent_child(&mut video);
        video.release_handle().release();
        assert!(matches!(
            video.read_frame(),
            Err(Error::SourceExhausted(_))
        ));
    }
}
