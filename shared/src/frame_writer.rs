//! Persistence of captured frame stacks and calibration archives.
//!
//! [`FrameWriterHandle`] writes frames to disk on a worker thread pool fed by a
//! bounded channel. Each frame of a stack becomes one 16-bit PNG page under a
//! directory named after the stack; `write_stack` spreads the pages over the
//! workers and returns once all of them are on disk, reporting any failure.
//! Archives of named float arrays are written synchronously as JSON.

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, unbounded, Sender, TrySendError};
use image::{ImageBuffer, Luma};
use ndarray::Array2;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{info, warn};

use crate::camera_interface::Frame;

/// Named array data grouped under a label, e.g. per-channel deformation maps
pub type ArchiveData = BTreeMap<String, BTreeMap<String, Array2<f32>>>;

/// Destination for acquired data.
pub trait FrameSink: Send + Sync {
    /// Persist an ordered stack of frames under `name`
    fn write_stack(&self, frames: &[Frame], name: &str) -> Result<()>;

    /// Persist labelled array data under `name`
    fn write_archive(&self, archive: &ArchiveData, name: &str) -> Result<()>;
}

/// Path of one page of a stack
pub fn page_path(stack_dir: &Path, page: usize) -> PathBuf {
    stack_dir.join(format!("page_{page:03}.png"))
}

pub struct FrameWriterHandle {
    root: PathBuf,
    sender: Mutex<Option<Sender<FrameWriteTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    failures: Arc<AtomicUsize>,
}

struct FrameWriteTask {
    frame: Frame,
    filepath: PathBuf,
    done: Option<Sender<std::result::Result<(), String>>>,
}

impl FrameWriterHandle {
    pub fn new(root: impl Into<PathBuf>, num_workers: usize, buffer_size: usize) -> Result<Self> {
        if num_workers == 0 {
            anyhow::bail!("Frame writer needs at least one worker");
        }
        let (sender, receiver) = bounded::<FrameWriteTask>(buffer_size);
        let failures = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::new();
        for worker_id in 0..num_workers {
            let receiver = receiver.clone();
            let failures = failures.clone();

            let handle = std::thread::Builder::new()
                .name(format!("frame-writer-{worker_id}"))
                .spawn(move || {
                    info!("Frame writer worker {} started", worker_id);
                    while let Ok(task) = receiver.recv() {
                        let outcome = save_frame(&task.frame, &task.filepath).map_err(|e| {
                            failures.fetch_add(1, Ordering::SeqCst);
                            warn!(
                                "Worker {} failed to save frame to {}: {:#}",
                                worker_id,
                                task.filepath.display(),
                                e
                            );
                            format!("{}: {e:#}", task.filepath.display())
                        });
                        if let Some(done) = task.done {
                            let _ = done.send(outcome);
                        }
                    }
                    info!("Frame writer worker {} shutting down", worker_id);
                })
                .context("Failed to spawn frame writer worker")?;

            workers.push(handle);
        }

        Ok(Self {
            root: root.into(),
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            failures,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of frames the workers failed to write
    pub fn failed_writes(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    /// Close the queue and block until every queued frame is written.
    ///
    /// Later writes are rejected.
    pub fn wait_for_completion(&self) {
        drop(self.sender.lock().unwrap().take());

        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        if workers.is_empty() {
            return;
        }
        for (worker_id, handle) in workers.into_iter().enumerate() {
            if let Err(e) = handle.join() {
                warn!("Worker {} panicked: {:?}", worker_id, e);
            }
        }

        info!("All frame writer workers completed");
    }

    /// Queue a single frame, failing immediately if the queue is full
    pub fn write_frame(&self, frame: &Frame, filepath: PathBuf) -> Result<()> {
        let guard = self.sender.lock().unwrap();
        let sender = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Frame writer workers have shut down"))?;

        let task = FrameWriteTask {
            frame: frame.clone(),
            filepath: filepath.clone(),
            done: None,
        };
        match sender.try_send(task) {
            Ok(_) => Ok(()),
            Err(TrySendError::Full(_)) => {
                anyhow::bail!(
                    "Frame writer queue full, cannot write to {}",
                    filepath.display()
                )
            }
            Err(TrySendError::Disconnected(_)) => {
                anyhow::bail!("Frame writer workers have shut down")
            }
        }
    }

    /// Queue a single frame, waiting for room in the queue.
    ///
    /// The worker reports the write outcome on `done`.
    fn enqueue(
        &self,
        frame: &Frame,
        filepath: PathBuf,
        done: Sender<std::result::Result<(), String>>,
    ) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Frame writer workers have shut down"))?;

        sender
            .send(FrameWriteTask {
                frame: frame.clone(),
                filepath,
                done: Some(done),
            })
            .map_err(|_| anyhow::anyhow!("Frame writer workers have shut down"))
    }
}

impl FrameSink for FrameWriterHandle {
    fn write_stack(&self, frames: &[Frame], name: &str) -> Result<()> {
        let stack_dir = self.root.join(name);
        let (done_tx, done_rx) = unbounded();
        for (page, frame) in frames.iter().enumerate() {
            self.enqueue(frame, page_path(&stack_dir, page), done_tx.clone())
                .with_context(|| format!("Failed to queue page {page} of {name}"))?;
        }
        drop(done_tx);

        let mut failed = Vec::new();
        for _ in 0..frames.len() {
            match done_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(message)) => failed.push(message),
                Err(_) => anyhow::bail!("Frame writer workers stopped before {name} was written"),
            }
        }
        if let Some(first) = failed.first() {
            anyhow::bail!(
                "{} of {} pages of {} failed to write, first: {}",
                failed.len(),
                frames.len(),
                name,
                first
            );
        }
        Ok(())
    }

    fn write_archive(&self, archive: &ArchiveData, name: &str) -> Result<()> {
        let path = self.root.join(format!("{name}.json"));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create archive: {}", path.display()))?;
        serde_json::to_writer(std::io::BufWriter::new(file), archive)
            .with_context(|| format!("Failed to write archive: {}", path.display()))?;
        info!("Wrote archive with {} entries to {}", archive.len(), path.display());
        Ok(())
    }
}

impl Drop for FrameWriterHandle {
    fn drop(&mut self) {
        self.wait_for_completion();
    }
}

fn save_frame(frame: &Frame, filepath: &Path) -> Result<()> {
    if let Some(parent) = filepath.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let (height, width) = frame.dim();
    let img_buffer: ImageBuffer<Luma<u16>, Vec<u16>> =
        ImageBuffer::from_raw(width as u32, height as u32, frame.iter().copied().collect())
            .context("Frame buffer does not match its dimensions")?;
    img_buffer.save(filepath)?;
    Ok(())
}

/// Sink keeping everything in memory, for tests and dry runs
#[derive(Default)]
pub struct MemorySink {
    stacks: Mutex<Vec<(String, Vec<Frame>)>>,
    archives: Mutex<Vec<(String, ArchiveData)>>,
    fail_writes: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink that rejects every write
    pub fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    /// Stack names in write order
    pub fn stack_names(&self) -> Vec<String> {
        self.stacks
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn stack(&self, name: &str) -> Option<Vec<Frame>> {
        self.stacks
            .lock()
            .unwrap()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, frames)| frames.clone())
    }

    pub fn archive(&self, name: &str) -> Option<ArchiveData> {
        self.archives
            .lock()
            .unwrap()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, data)| data.clone())
    }
}

impl FrameSink for MemorySink {
    fn write_stack(&self, frames: &[Frame], name: &str) -> Result<()> {
        if self.fail_writes {
            anyhow::bail!("Memory sink rejects {name}");
        }
        self.stacks
            .lock()
            .unwrap()
            .push((name.to_string(), frames.to_vec()));
        Ok(())
    }

    fn write_archive(&self, archive: &ArchiveData, name: &str) -> Result<()> {
        if self.fail_writes {
            anyhow::bail!("Memory sink rejects {name}");
        }
        self.archives
            .lock()
            .unwrap()
            .push((name.to_string(), archive.clone()));
        Ok(())
    }
}
