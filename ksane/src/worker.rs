//! Background acquisition of one preview or final scan.

use crate::{
    error::{KsaneError, Result},
    events::ScanKind,
    normalize::{self, convert_row, ImageFormat, Raster},
    option::SharedHandle,
    registry::lock,
};
use libsane::{DeviceHandle, FrameFormat, Parameters, SaneError};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
};
use tokio::sync::{mpsc, oneshot};

/// Reads after a cancel before giving up on the device acknowledging it.
const MAX_DRAIN_READS: usize = 1024;

#[derive(Debug)]
pub(crate) enum WorkerMessage {
    Progress(u8),
    Finished(ScanOutcome),
}

/// Result of one acquisition.
#[derive(Debug)]
pub(crate) struct ScanOutcome {
    pub kind: ScanKind,
    /// `Ok` when every frame was read up to its end.
    pub status: std::result::Result<(), SaneError>,
    /// Layout of `data`: separate colour frames are reported as one
    /// interleaved RGB frame and the line count is always known.
    pub parameters: Option<Parameters>,
    pub data: Vec<u8>,
}

/// Cancels the running scan from any thread.
///
/// A request stays latched until the next preview or final scan begins, so
/// it also stops a batch that sits between two pages.
#[derive(Debug, Clone, Default)]
pub struct ScanCanceller {
    state: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    token: Mutex<Option<oneshot::Sender<()>>>,
    requested: AtomicBool,
}

impl ScanCanceller {
    pub fn cancel(&self) {
        self.state.requested.store(true, Ordering::SeqCst);

        let sender = self
            .state
            .token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(sender) = sender {
            log::debug!("Request scan cancellation");
            _ = sender.send(());
        }
    }

    pub(crate) fn is_requested(&self) -> bool {
        self.state.requested.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.state.requested.store(false, Ordering::SeqCst);
    }

    fn arm(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut token = self.state.token.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_requested() {
            _ = tx.send(());
        } else {
            *token = Some(tx);
        }
        rx
    }
}

#[derive(Debug, Default)]
struct WorkerState {
    progress: AtomicU8,
    running: AtomicBool,
    frame_ready: AtomicBool,
    image_resized: AtomicBool,
    status: Mutex<Option<std::result::Result<(), SaneError>>>,
    parameters: Mutex<Option<Parameters>>,
}

pub(crate) struct ScanWorker {
    handle: SharedHandle,
    preview: Arc<Mutex<Raster>>,
    state: Arc<WorkerState>,
    canceller: ScanCanceller,
    thread: Option<JoinHandle<()>>,
    messages: Option<mpsc::Receiver<WorkerMessage>>,
}

impl ScanWorker {
    pub fn new(handle: SharedHandle, preview: Arc<Mutex<Raster>>, canceller: ScanCanceller) -> Self {
        Self {
            handle,
            preview,
            state: Arc::default(),
            canceller,
            thread: None,
            messages: None,
        }
    }

    /// Spawns the first acquisition of a preview or batch, forgetting
    /// earlier cancel requests.
    pub fn begin(&mut self, kind: ScanKind, invert: bool, chunk_size: usize) -> Result<()> {
        if self.is_running() {
            return Err(KsaneError::Busy);
        }
        self.canceller.reset();
        self.start(kind, invert, chunk_size)
    }

    /// Spawns the acquisition thread. `invert` is sampled once here.
    pub fn start(&mut self, kind: ScanKind, invert: bool, chunk_size: usize) -> Result<()> {
        if self.is_running() {
            return Err(KsaneError::Busy);
        }
        self.join();

        self.state.progress.store(0, Ordering::Relaxed);
        self.state.frame_ready.store(false, Ordering::Relaxed);
        self.state.image_resized.store(false, Ordering::Relaxed);
        *self.state.status.lock().unwrap_or_else(PoisonError::into_inner) = None;
        *self.state.parameters.lock().unwrap_or_else(PoisonError::into_inner) = None;

        let (messages_tx, messages_rx) = mpsc::channel(32);
        let acquisition = Acquisition {
            kind,
            invert,
            chunk_size: chunk_size.max(1),
            state: self.state.clone(),
            preview: self.preview.clone(),
            messages: messages_tx,
            cancel: self.canceller.arm(),
            last_progress: 0,
        };
        let handle = self.handle.clone();

        self.state.running.store(true, Ordering::SeqCst);

        let spawned = thread::Builder::new()
            .name(format!("scan-{}", kind.to_string().to_lowercase()))
            .spawn(move || acquisition.run(handle));

        match spawned {
            Ok(thread) => {
                self.thread = Some(thread);
                self.messages = Some(messages_rx);
                Ok(())
            }
            Err(err) => {
                self.state.running.store(false, Ordering::SeqCst);
                Err(KsaneError::Spawn(err))
            }
        }
    }

    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    /// A cancel arrived since the current preview or batch began.
    pub fn cancel_requested(&self) -> bool {
        self.canceller.is_requested()
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    pub fn scan_progress(&self) -> u8 {
        self.state.progress.load(Ordering::Relaxed)
    }

    /// Whether the last acquisition read every frame completely.
    pub fn frame_ready(&self) -> bool {
        self.state.frame_ready.load(Ordering::Relaxed)
    }

    /// Terminal status of the last acquisition, `None` while running.
    pub fn status(&self) -> Option<std::result::Result<(), SaneError>> {
        *self.state.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn parameters(&self) -> Option<Parameters> {
        *self.state.parameters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The preview raster changed dimensions during the scan.
    pub fn image_resized(&self) -> bool {
        self.state.image_resized.load(Ordering::Relaxed)
    }

    pub fn try_recv(&mut self) -> Option<WorkerMessage> {
        self.messages.as_mut()?.try_recv().ok()
    }

    /// Blocks until the next message. `None` once the worker is gone.
    pub fn blocking_recv(&mut self) -> Option<WorkerMessage> {
        self.messages.as_mut()?.blocking_recv()
    }

    /// Waits for the thread of a finished acquisition to exit.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Scan thread panicked");
            }
        }
    }
}

impl Drop for ScanWorker {
    fn drop(&mut self) {
        self.canceller.cancel();
        // The thread ends on its own once nobody listens.
        self.messages = None;
        self.join();
    }
}

struct Acquisition {
    kind: ScanKind,
    invert: bool,
    chunk_size: usize,
    state: Arc<WorkerState>,
    preview: Arc<Mutex<Raster>>,
    messages: mpsc::Sender<WorkerMessage>,
    cancel: oneshot::Receiver<()>,
    last_progress: u8,
}

impl Acquisition {
    fn run(mut self, handle: SharedHandle) {
        log::debug!("{} scan started", self.kind);

        let mut image = ImageBuffer::default();
        let status = {
            let mut device = lock(&handle);
            self.acquire(device.as_mut(), &mut image)
        };

        let parameters = match status {
            Ok(()) => image.finish(),
            Err(_) => None,
        };

        match &status {
            Ok(()) => log::debug!("{} scan done", self.kind),
            Err(err) => log::debug!("{} scan ended with {err:?}", self.kind),
        }

        self.state.frame_ready.store(status.is_ok(), Ordering::Relaxed);
        *self.state.status.lock().unwrap_or_else(PoisonError::into_inner) = Some(status);
        if let Some(parameters) = parameters {
            *self.state.parameters.lock().unwrap_or_else(PoisonError::into_inner) =
                Some(parameters);
        }
        self.state.running.store(false, Ordering::SeqCst);

        let outcome = ScanOutcome {
            kind: self.kind,
            status,
            parameters,
            data: image.data,
        };
        if self.messages.blocking_send(WorkerMessage::Finished(outcome)).is_err() {
            log::debug!("Scan result receiver was dropped");
        }
    }

    fn cancelled(&mut self) -> bool {
        match self.cancel.try_recv() {
            Ok(()) => {
                log::debug!("Scan cancelled");
                true
            }
            Err(oneshot::error::TryRecvError::Closed) => {
                log::debug!("Cancel sender was dropped");
                true
            }
            Err(oneshot::error::TryRecvError::Empty) => false,
        }
    }

    /// Tells the device to abandon the frame and reads until it agrees.
    fn abort(&mut self, device: &mut dyn DeviceHandle) -> std::result::Result<(), SaneError> {
        log::trace!("Call sane_cancel()");
        device.cancel();

        let mut buf = [0u8; 4096];
        for _ in 0..MAX_DRAIN_READS {
            if device.read(&mut buf).is_err() {
                return Err(SaneError::Cancelled);
            }
        }

        log::warn!("Device still delivers data after cancel");
        Err(SaneError::Cancelled)
    }

    fn acquire(
        &mut self,
        device: &mut dyn DeviceHandle,
        image: &mut ImageBuffer,
    ) -> std::result::Result<(), SaneError> {
        let mut window = vec![0u8; self.chunk_size];
        let mut acquired = 0usize;

        loop {
            if self.cancelled() {
                return self.abort(device);
            }

            log::trace!("Call sane_start()");
            device.start()?;

            log::trace!("Call sane_get_parameters()");
            let frame = device.parameters()?;
            log::debug!("Start frame with parameters {frame:?}");

            image.begin_frame(&frame);
            if self.kind == ScanKind::Preview {
                self.prepare_preview(image);
            }

            let passes = if frame.format.channel().is_some() { 3 } else { 1 };
            let total = image.lines.map(|lines| lines * frame.bytes_per_line * passes);

            let mut offset = 0;
            let mut converted = 0;
            loop {
                if self.cancelled() {
                    return self.abort(device);
                }

                log::trace!("Call sane_read()");
                let read = match device.read(&mut window) {
                    Ok(read) => read,
                    Err(SaneError::EOF) => break,
                    Err(err) => return Err(err),
                };

                let chunk = &mut window[..read];
                if self.invert && self.kind == ScanKind::Final {
                    chunk.iter_mut().for_each(|byte| *byte = !*byte);
                }
                image.write(&frame, offset, chunk);

                offset += read;
                acquired += read;

                if self.kind == ScanKind::Preview {
                    let rows = offset / frame.bytes_per_line.max(1);
                    converted = self.update_preview(image, converted, rows);
                }

                if let Some(total) = total.filter(|total| *total > 0) {
                    let progress = (acquired * 100 / total).min(100) as u8;
                    self.report_progress(progress);
                }
            }

            if self.kind == ScanKind::Preview {
                let rows = offset / frame.bytes_per_line.max(1);
                self.update_preview(image, converted, rows);
            }

            if frame.last_frame {
                break;
            }
        }

        self.report_progress(100);

        Ok(())
    }

    fn report_progress(&mut self, progress: u8) {
        self.state.progress.store(progress, Ordering::Relaxed);

        if progress >= self.last_progress.saturating_add(5) || (progress == 100 && self.last_progress != 100) {
            self.last_progress = progress;
            // Progress is best effort, a full channel just drops an update.
            _ = self.messages.try_send(WorkerMessage::Progress(progress));
        }
    }

    fn prepare_preview(&self, image: &ImageBuffer) {
        let height = image.lines.unwrap_or(0);
        let mut preview = self.preview.lock().unwrap_or_else(PoisonError::into_inner);
        if preview.width() != image.width || preview.height() != height {
            log::debug!("Resize preview to {}x{height}", image.width);
            preview.resize(image.width, height);
            self.state.image_resized.store(true, Ordering::Relaxed);
        }
        preview.fill_white();
    }

    /// Converts rows `from..to` of the image into the preview raster.
    fn update_preview(&self, image: &ImageBuffer, from: usize, to: usize) -> usize {
        if to <= from || image.format == ImageFormat::None {
            return from;
        }

        let row_bytes = image.format.row_bytes(image.width);
        let mut preview = self.preview.lock().unwrap_or_else(PoisonError::into_inner);

        if to > preview.height() {
            preview.resize(image.width, to);
            self.state.image_resized.store(true, Ordering::Relaxed);
        }

        for y in from..to {
            let start = y * image.stride;
            let Some(src) = image.data.get(start..start + row_bytes) else {
                return y;
            };
            if let Some(dst) = preview.row_mut(y) {
                convert_row(image.format, src, dst, self.invert);
            }
        }

        to
    }
}

/// Image assembled from the frames of one acquisition.
#[derive(Debug, Default)]
struct ImageBuffer {
    data: Vec<u8>,
    format: ImageFormat,
    stride: usize,
    width: usize,
    lines: Option<usize>,
    depth: usize,
    separate: bool,
}

impl ImageBuffer {
    fn begin_frame(&mut self, frame: &Parameters) {
        self.format = normalize::image_format(frame);
        self.stride = match normalize::bytes_per_line(frame) {
            0 => frame.bytes_per_line,
            stride => stride,
        };
        self.width = frame.pixels_per_line;
        self.lines = frame.lines;
        self.depth = frame.depth;
        self.separate = frame.format.channel().is_some();

        if let Some(lines) = frame.lines {
            let size = lines * self.stride;
            if self.separate {
                self.data.resize(size, 0);
            } else {
                self.data.clear();
                self.data.reserve(size);
            }
        } else if !self.separate {
            self.data.clear();
        }
    }

    /// Places `chunk`, read at byte `offset` of the device frame, into the
    /// image. Row padding of colour frames is dropped and separate colour
    /// frames are interleaved.
    fn write(&mut self, frame: &Parameters, mut offset: usize, chunk: &[u8]) {
        let bpl = frame.bytes_per_line.max(1);
        let mut rest = chunk;

        if frame.format.channel().is_none() && bpl == self.stride {
            self.store(offset, rest);
            return;
        }

        let bps = (frame.depth / 8).max(1);
        while !rest.is_empty() {
            let row = offset / bpl;
            let col = offset % bpl;
            let take = (bpl - col).min(rest.len());
            let (part, tail) = rest.split_at(take);

            match frame.format.channel() {
                None => {
                    let useful = self.stride.saturating_sub(col).min(part.len());
                    self.store(row * self.stride + col, &part[..useful]);
                }
                Some(channel) => {
                    let samples = frame.pixels_per_line * bps;
                    for (i, byte) in part.iter().enumerate() {
                        let col = col + i;
                        if col >= samples {
                            break;
                        }
                        let at = row * self.stride + (col / bps) * 3 * bps + channel * bps + col % bps;
                        self.store(at, &[*byte]);
                    }
                }
            }

            offset += take;
            rest = tail;
        }
    }

    fn store(&mut self, at: usize, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let end = at + bytes.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[at..end].copy_from_slice(bytes);
    }

    /// Fixes the line count and returns the layout of the data.
    fn finish(&mut self) -> Option<Parameters> {
        if self.stride == 0 {
            return None;
        }

        let lines = match self.lines {
            Some(lines) => lines,
            None => self.data.len() / self.stride,
        };
        self.data.resize(lines * self.stride, 0);

        Some(Parameters {
            format: if self.separate {
                FrameFormat::RGB
            } else {
                match self.format {
                    ImageFormat::Rgb8 | ImageFormat::Rgb16 => FrameFormat::RGB,
                    _ => FrameFormat::Gray,
                }
            },
            last_frame: true,
            bytes_per_line: self.stride,
            pixels_per_line: self.width,
            lines: Some(lines),
            depth: self.depth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(format: FrameFormat, depth: usize, ppl: usize, bpl: usize, lines: Option<usize>) -> Parameters {
        Parameters {
            format,
            last_frame: format.channel().map_or(true, |channel| channel == 2),
            bytes_per_line: bpl,
            pixels_per_line: ppl,
            lines,
            depth,
        }
    }

    #[test]
    fn gray_frames_keep_device_stride() {
        let frame = frame(FrameFormat::Gray, 8, 3, 4, Some(2));
        let mut image = ImageBuffer::default();
        image.begin_frame(&frame);

        image.write(&frame, 0, &[1, 2, 3, 0, 4]);
        image.write(&frame, 5, &[5, 6, 0]);

        let parameters = image.finish().unwrap();
        assert_eq!(parameters.bytes_per_line, 4);
        assert_eq!(parameters.lines, Some(2));
        assert_eq!(image.data, vec![1, 2, 3, 0, 4, 5, 6, 0]);
    }

    #[test]
    fn rgb_padding_is_dropped() {
        let frame = frame(FrameFormat::RGB, 8, 1, 4, Some(2));
        let mut image = ImageBuffer::default();
        image.begin_frame(&frame);

        image.write(&frame, 0, &[1, 2, 3, 99, 4, 5]);
        image.write(&frame, 6, &[6, 99]);

        let parameters = image.finish().unwrap();
        assert_eq!(parameters.bytes_per_line, 3);
        assert_eq!(image.data, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn separate_frames_are_interleaved() {
        let mut image = ImageBuffer::default();
        for (format, value) in [(FrameFormat::Red, 1), (FrameFormat::Green, 2), (FrameFormat::Blue, 3)] {
            let frame = frame(format, 8, 2, 2, Some(1));
            image.begin_frame(&frame);
            image.write(&frame, 0, &[value, value * 10]);
        }

        let parameters = image.finish().unwrap();
        assert_eq!(parameters.format, FrameFormat::RGB);
        assert_eq!(parameters.bytes_per_line, 6);
        assert_eq!(image.data, vec![1, 2, 3, 10, 20, 30]);
    }

    #[test]
    fn unknown_line_count_follows_data() {
        let frame = frame(FrameFormat::Gray, 8, 2, 2, None);
        let mut image = ImageBuffer::default();
        image.begin_frame(&frame);

        image.write(&frame, 0, &[1, 2, 3, 4, 5]);

        let parameters = image.finish().unwrap();
        assert_eq!(parameters.lines, Some(2));
        assert_eq!(image.data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn cancel_reaches_an_armed_scan() {
        let canceller = ScanCanceller::default();

        let mut token = canceller.arm();
        assert!(token.try_recv().is_err());
        canceller.cancel();
        assert_eq!(token.try_recv(), Ok(()));
    }

    #[test]
    fn cancel_between_scans_stops_the_next_one() {
        let canceller = ScanCanceller::default();
        canceller.cancel();
        assert!(canceller.is_requested());

        let mut token = canceller.arm();
        assert_eq!(token.try_recv(), Ok(()));

        canceller.reset();
        assert!(!canceller.is_requested());
        let mut token = canceller.arm();
        assert!(token.try_recv().is_err());
    }
}
