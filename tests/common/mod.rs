//! Common test utilities

#![allow(dead_code)]

use image::{ImageBuffer, Rgba, RgbaImage};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use stillcast::encoder::{CompressionEngine, CompressionProperties, MediaTime};
use stillcast::session::Dispatcher;
use stillcast::{Backend, EngineFactory, Error, Frame, Result, SessionConfig, TaskId, TaskStatus};

/// Route library logs to the test harness; safe to call from every test
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Generate a test image with a solid color and optional gradient
pub fn generate_test_image(width: u32, height: u32, base_color: [u8; 4]) -> RgbaImage {
    let mut img = ImageBuffer::new(width, height);

    for (x, y, pixel) in img.enumerate_pixels_mut() {
        // Add subtle gradient to make frames distinguishable
        let r = base_color[0].saturating_add((x % 50) as u8);
        let g = base_color[1].saturating_add((y % 50) as u8);
        let b = base_color[2];
        let a = base_color[3];
        *pixel = Rgba([r, g, b, a]);
    }

    img
}

/// Generate a numbered test image, one color per screenshot
pub fn generate_numbered_image(width: u32, height: u32, number: u32) -> RgbaImage {
    let colors = [
        [255, 100, 100, 255], // Red-ish
        [100, 255, 100, 255], // Green-ish
        [100, 100, 255, 255], // Blue-ish
        [255, 255, 100, 255], // Yellow-ish
        [255, 100, 255, 255], // Magenta-ish
        [100, 255, 255, 255], // Cyan-ish
    ];

    let color = colors[(number as usize) % colors.len()];
    generate_test_image(width, height, color)
}

/// A burst of `count` distinguishable frames
pub fn generate_frames(count: u32, width: u32, height: u32) -> Vec<Frame> {
    (0..count)
        .map(|i| Frame::from_rgba_image(generate_numbered_image(width, height, i)))
        .collect()
}

/// Save a test image as JPEG
pub fn save_jpeg<P: AsRef<Path>>(img: &RgbaImage, path: P, quality: u8) -> std::io::Result<()> {
    // Convert RGBA to RGB for JPEG
    let rgb_img: image::RgbImage = image::DynamicImage::ImageRgba8(img.clone()).to_rgb8();

    let file = std::fs::File::create(path)?;
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(file, quality);
    encoder
        .encode_image(&rgb_img)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

    Ok(())
}

/// Save a test image as PNG
pub fn save_png<P: AsRef<Path>>(img: &RgbaImage, path: P) -> std::io::Result<()> {
    img.save(path)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
}

/// Verify that a file exists and has non-zero size
pub fn verify_file_exists_with_size<P: AsRef<Path>>(path: P) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => meta.len() > 0,
        Err(_) => false,
    }
}

/// Check that a file is an Annex-B stream: it opens on a 4-byte start code
pub fn verify_annexb_header<P: AsRef<Path>>(path: P) -> bool {
    use std::io::Read;

    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return false,
    };

    let mut header = [0u8; 4];
    if file.read_exact(&mut header).is_err() {
        return false;
    }

    header == [0x00, 0x00, 0x00, 0x01]
}

/// Get file size in bytes
pub fn get_file_size<P: AsRef<Path>>(path: P) -> Option<u64> {
    std::fs::metadata(path).ok().map(|m| m.len())
}

/// Every `(task, status)` change seen by an observer, in order
#[derive(Clone, Default)]
pub struct StatusLog {
    events: Arc<Mutex<Vec<(TaskId, TaskStatus)>>>,
}

impl StatusLog {
    pub fn observer(&self) -> impl Fn(TaskId, TaskStatus) + Send + Sync + 'static {
        let events = Arc::clone(&self.events);
        move |id: TaskId, status: TaskStatus| events.lock().unwrap().push((id, status))
    }

    pub fn events(&self) -> Vec<(TaskId, TaskStatus)> {
        self.events.lock().unwrap().clone()
    }

    /// Statuses of one task, in the order they were reported
    pub fn statuses(&self, id: TaskId) -> Vec<TaskStatus> {
        self.events()
            .into_iter()
            .filter(|(task, _)| *task == id)
            .map(|(_, status)| status)
            .collect()
    }
}

/// Loopback engine that rejects every frame after the first `accept`
pub struct FailingFactory {
    pub accept: u64,
}

impl EngineFactory for FailingFactory {
    fn open(
        &self,
        config: &SessionConfig,
        dispatcher: Dispatcher,
    ) -> Result<Box<dyn CompressionEngine>> {
        Ok(Box::new(FailingEngine {
            inner: Backend::Loopback.open(config, dispatcher)?,
            remaining: self.accept,
        }))
    }
}

struct FailingEngine {
    inner: Box<dyn CompressionEngine>,
    remaining: u64,
}

impl CompressionEngine for FailingEngine {
    fn configure(&mut self, properties: &CompressionProperties) -> Result<()> {
        self.inner.configure(properties)
    }

    fn encode(&mut self, frame: &Frame, pts: MediaTime) -> Result<()> {
        if self.remaining == 0 {
            return Err(Error::Encode("frame rejected".to_string()));
        }
        self.remaining -= 1;
        self.inner.encode(frame, pts)
    }

    fn complete_frames(&mut self) -> Result<()> {
        self.inner.complete_frames()
    }

    fn invalidate(&mut self) {
        self.inner.invalidate()
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

/// Engine whose first frame comes back as an error through the output
/// callback, the way a hardware encoder reports a bad status
#[derive(Default)]
pub struct CallbackFailingFactory {
    pub encode_calls: Arc<AtomicU64>,
}

impl EngineFactory for CallbackFailingFactory {
    fn open(
        &self,
        _: &SessionConfig,
        dispatcher: Dispatcher,
    ) -> Result<Box<dyn CompressionEngine>> {
        Ok(Box::new(CallbackFailingEngine {
            dispatcher,
            encode_calls: Arc::clone(&self.encode_calls),
        }))
    }
}

struct CallbackFailingEngine {
    dispatcher: Dispatcher,
    encode_calls: Arc<AtomicU64>,
}

impl CompressionEngine for CallbackFailingEngine {
    fn configure(&mut self, _: &CompressionProperties) -> Result<()> {
        Ok(())
    }

    fn encode(&mut self, _: &Frame, _: MediaTime) -> Result<()> {
        if self.encode_calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.dispatcher
                .deliver(Err(Error::Encode("status -12902".to_string())));
        }
        Ok(())
    }

    fn complete_frames(&mut self) -> Result<()> {
        Ok(())
    }

    fn invalidate(&mut self) {}

    fn name(&self) -> &'static str {
        "callback-failing"
    }
}

/// Refuses to construct any session
pub struct RejectingFactory;

impl EngineFactory for RejectingFactory {
    fn open(&self, _: &SessionConfig, _: Dispatcher) -> Result<Box<dyn CompressionEngine>> {
        Err(Error::SessionInit("engine refused".to_string()))
    }
}

/// Blocks engine submissions until opened
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    changed: Condvar,
}

impl Gate {
    pub fn closed() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.changed.notify_all();
    }

    fn pass(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.changed.wait(open).unwrap();
        }
    }
}

/// Loopback factory that refuses the sessions whose open order is listed,
/// optionally holding every frame at a gate
pub struct SelectiveFactory {
    reject: Vec<u64>,
    gate: Option<Arc<Gate>>,
    opened: AtomicU64,
}

impl SelectiveFactory {
    pub fn new(reject: Vec<u64>) -> Self {
        Self {
            reject,
            gate: None,
            opened: AtomicU64::new(0),
        }
    }

    pub fn gated(mut self, gate: Arc<Gate>) -> Self {
        self.gate = Some(gate);
        self
    }
}

impl EngineFactory for SelectiveFactory {
    fn open(
        &self,
        config: &SessionConfig,
        dispatcher: Dispatcher,
    ) -> Result<Box<dyn CompressionEngine>> {
        let nth = self.opened.fetch_add(1, Ordering::SeqCst);
        if self.reject.contains(&nth) {
            return Err(Error::SessionInit(format!("session {} refused", nth)));
        }
        let inner = Backend::Loopback.open(config, dispatcher)?;
        let engine: Box<dyn CompressionEngine> = match &self.gate {
            Some(gate) => Box::new(GatedEngine {
                inner,
                gate: Arc::clone(gate),
            }),
            None => inner,
        };
        Ok(engine)
    }
}

struct GatedEngine {
    inner: Box<dyn CompressionEngine>,
    gate: Arc<Gate>,
}

impl CompressionEngine for GatedEngine {
    fn configure(&mut self, properties: &CompressionProperties) -> Result<()> {
        self.inner.configure(properties)
    }

    fn encode(&mut self, frame: &Frame, pts: MediaTime) -> Result<()> {
        self.gate.pass();
        self.inner.encode(frame, pts)
    }

    fn complete_frames(&mut self) -> Result<()> {
        self.inner.complete_frames()
    }

    fn invalidate(&mut self) {
        self.inner.invalidate()
    }

    fn name(&self) -> &'static str {
        "gated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_test_image() {
        let img = generate_test_image(100, 100, [255, 0, 0, 255]);
        assert_eq!(img.width(), 100);
        assert_eq!(img.height(), 100);
    }

    #[test]
    fn test_save_png() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.png");

        let img = generate_test_image(100, 100, [255, 0, 0, 255]);
        save_png(&img, &path).unwrap();

        assert!(verify_file_exists_with_size(&path));
    }
}
