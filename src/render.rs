use anyhow::{anyhow, Context, Result};
use itertools::Itertools;
use std::collections::BTreeMap;
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::organ::{
    RenderRequest, DEFAULT_NOTE_DURATION_SECS, FIRST_KEYBOARD_NOTE, KEYBOARD_NOTE_COUNT,
    TRACKS_PER_BANK,
};
use crate::synth::{self, RENDER_SAMPLE_RATE};
use crate::voice::{self, RenderJob};
use crate::wav;

pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Bank index file kept next to the rendered tracks; one `number: name`
/// line per bank present in the directory.
const BANK_INDEX_FILE: &str = "tco.txt";

/// Shared state for one render run: the cancellation flag handed out to the
/// caller and an optional progress callback.
pub struct RenderSession {
    cancel: Arc<AtomicBool>,
    progress: Option<Box<dyn FnMut(u8) + Send>>,
    last_progress: u8,
}

impl RenderSession {
    pub fn new() -> Self {
        RenderSession {
            cancel: Arc::new(AtomicBool::new(false)),
            progress: None,
            last_progress: 0,
        }
    }

    /// A handle another thread can use to stop the render.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn set_progress_callback(&mut self, callback: impl FnMut(u8) + Send + 'static) {
        self.progress = Some(Box::new(callback));
    }

    /// Reports progress, never moving backwards or repeating a value.
    fn report(&mut self, percent: u8) {
        if percent > self.last_progress {
            self.last_progress = percent;
            if let Some(callback) = self.progress.as_mut() {
                callback(percent);
            }
        }
    }
}

impl Default for RenderSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal state of one bank render.
#[derive(Debug)]
pub enum RenderOutcome {
    Success { output_dir: PathBuf },
    Cancelled { output_dir: PathBuf },
    Error { message: String },
}

enum PoolStatus {
    Completed,
    Cancelled,
    Aborted(String),
}

enum WorkerReply {
    /// `pcm` is None for a silent track that needs no file.
    Rendered { worker: usize, index: usize, track: u32, pcm: Option<Vec<i16>> },
    Failed { index: usize, message: String },
}

/// Renders every keyboard note of one bank into `request.output_dir` and
/// updates the bank index on success.
pub fn render_bank(
    request: &RenderRequest,
    session: &mut RenderSession,
    worker_count: usize,
) -> RenderOutcome {
    let output_dir = request.output_dir.clone();
    match render_bank_inner(request, session, worker_count) {
        Ok(PoolStatus::Completed) => {
            match update_bank_index(&output_dir, request.bank_number, &request.bank_name) {
                Ok(()) => RenderOutcome::Success { output_dir },
                Err(e) => RenderOutcome::Error { message: format!("{:#}", e) },
            }
        }
        Ok(PoolStatus::Cancelled) => RenderOutcome::Cancelled { output_dir },
        Ok(PoolStatus::Aborted(message)) => RenderOutcome::Error { message },
        Err(e) => RenderOutcome::Error { message: format!("{:#}", e) },
    }
}

/// Renders a bank into memory instead of files, for performance export.
/// Tracks arrive in strict note order; a silent track is `None`. Cancellation
/// returns only the tracks drained before the signal was observed.
pub fn render_bank_to_memory(
    request: &RenderRequest,
    session: &mut RenderSession,
    worker_count: usize,
) -> Result<Vec<(u32, Option<Vec<i16>>)>> {
    let mut tracks = Vec::new();
    let status = run_pool(request, session, worker_count, &mut |track, pcm| {
        tracks.push((track, pcm));
        Ok(())
    })?;
    match status {
        PoolStatus::Aborted(message) => Err(anyhow!(message)),
        _ => Ok(tracks),
    }
}

fn render_bank_inner(
    request: &RenderRequest,
    session: &mut RenderSession,
    worker_count: usize,
) -> Result<PoolStatus> {
    fs::create_dir_all(&request.output_dir)
        .with_context(|| format!("Failed to create {:?}", request.output_dir))?;

    let output_dir = request.output_dir.clone();
    run_pool(request, session, worker_count, &mut |track, pcm| match pcm {
        Some(pcm) => {
            let path = output_dir.join(format!("{:04}.wav", track));
            wav::write_render_wav(&path, &pcm, RENDER_SAMPLE_RATE)?;
            log::debug!("[Pool] Wrote {:?}", path);
            Ok(())
        }
        None => {
            log::debug!("[Pool] Track {} is silent, no file", track);
            Ok(())
        }
    })
}

fn run_pool(
    request: &RenderRequest,
    session: &mut RenderSession,
    worker_count: usize,
    sink: &mut dyn FnMut(u32, Option<Vec<i16>>) -> Result<()>,
) -> Result<PoolStatus> {
    let jobs = build_jobs(request);
    let voiced = jobs.iter().filter(|j| !j.voices.is_empty()).count();
    log::info!(
        "[Pool] Rendering bank {} ('{}'): {} notes, {} voiced, {} workers",
        request.bank_number,
        request.bank_name,
        jobs.len(),
        voiced,
        worker_count
    );

    let worker_count = worker_count.max(1);
    let (reply_tx, reply_rx) = channel();
    let mut job_senders = Vec::with_capacity(worker_count);
    let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(worker_count);
    for id in 0..worker_count {
        let (job_tx, job_rx) = channel();
        handles.push(spawn_worker(id, job_rx, reply_tx.clone(), request.organ_data.gain_db));
        job_senders.push(job_tx);
    }
    drop(reply_tx);

    let status = coordinate(jobs, &job_senders, &reply_rx, session, sink);

    // Closing the job channels lets every worker drain out, whatever the
    // coordinator decided.
    drop(job_senders);
    for handle in handles {
        let _ = handle.join();
    }
    status
}

fn spawn_worker(
    id: usize,
    jobs: Receiver<(usize, RenderJob)>,
    replies: Sender<WorkerReply>,
    global_gain_db: f32,
) -> JoinHandle<()> {
    thread::spawn(move || {
        while let Ok((index, job)) = jobs.recv() {
            let track = job.track;
            let rendered = catch_unwind(AssertUnwindSafe(|| {
                if job.voices.is_empty() {
                    None
                } else {
                    let (pcm, _peak) = synth::synthesize(&job, global_gain_db, RENDER_SAMPLE_RATE);
                    Some(pcm)
                }
            }));
            let reply = match rendered {
                Ok(pcm) => WorkerReply::Rendered { worker: id, index, track, pcm },
                Err(_) => WorkerReply::Failed {
                    index,
                    message: format!("Render worker {} panicked on track {}", id, track),
                },
            };
            if replies.send(reply).is_err() {
                break; // coordinator is gone
            }
        }
        log::debug!("[Pool] Worker {} finished", id);
    })
}

/// Dispatches jobs to workers and feeds results to the sink strictly in note
/// order, so output is deterministic regardless of worker timing.
fn coordinate(
    jobs: Vec<RenderJob>,
    senders: &[Sender<(usize, RenderJob)>],
    replies: &Receiver<WorkerReply>,
    session: &mut RenderSession,
    sink: &mut dyn FnMut(u32, Option<Vec<i16>>) -> Result<()>,
) -> Result<PoolStatus> {
    let total = jobs.len();
    let mut queue = jobs.into_iter().enumerate();
    let mut dispatched = 0usize;
    let mut completed = 0usize;
    let mut next_expected = 0usize;
    let mut pending: BTreeMap<usize, (u32, Option<Vec<i16>>)> = BTreeMap::new();
    let mut cancelled = session.is_cancelled();

    if !cancelled {
        for sender in senders {
            if let Some((index, job)) = queue.next() {
                sender
                    .send((index, job))
                    .map_err(|_| anyhow!("Worker exited before accepting work"))?;
                dispatched += 1;
            }
        }
    }

    while completed < dispatched {
        let reply = replies.recv().context("All render workers exited unexpectedly")?;
        match reply {
            WorkerReply::Rendered { worker, index, track, pcm } => {
                completed += 1;
                pending.insert(index, (track, pcm));

                if session.is_cancelled() {
                    cancelled = true;
                }
                while let Some((track, pcm)) = pending.remove(&next_expected) {
                    next_expected += 1;
                    if cancelled {
                        log::debug!("[Pool] Discarding track {} after cancellation", track);
                        continue;
                    }
                    sink(track, pcm)?;
                    session.report((next_expected * 100 / total) as u8);
                }

                // Refill after the drain so slow result handling throttles
                // dispatch.
                if !cancelled {
                    if let Some((next_index, job)) = queue.next() {
                        if senders[worker].send((next_index, job)).is_err() {
                            return Ok(PoolStatus::Aborted(format!(
                                "Render worker {} exited early",
                                worker
                            )));
                        }
                        dispatched += 1;
                    }
                }
            }
            WorkerReply::Failed { index, message } => {
                log::error!("[Pool] Job {} failed: {}", index, message);
                return Ok(PoolStatus::Aborted(message));
            }
        }
    }

    if cancelled {
        log::info!("[Pool] Render cancelled after {} of {} notes", next_expected, total);
        Ok(PoolStatus::Cancelled)
    } else {
        Ok(PoolStatus::Completed)
    }
}

/// Expands a request into one job per keyboard note, in ascending note order.
fn build_jobs(request: &RenderRequest) -> Vec<RenderJob> {
    let organ = &request.organ_data;
    let tremulants = voice::active_tremulants(&request.combination, organ);

    let mut active_stops = Vec::new();
    for id in &request.combination {
        if let Some(stop) = organ.stops.get(id) {
            active_stops.push(stop);
        } else if !voice::is_tremulant_id(id) {
            log::warn!("[Pool] Combination names unknown stop '{}'", id);
        }
    }

    (0..KEYBOARD_NOTE_COUNT)
        .map(|offset| {
            let note = FIRST_KEYBOARD_NOTE + offset;
            let voices = active_stops
                .iter()
                .flat_map(|stop| voice::resolve_note(stop, note, organ, request.stretch_strategy))
                .collect();
            RenderJob {
                note,
                track: note as u32 + request.bank_number * TRACKS_PER_BANK,
                voices,
                tremulants: tremulants.clone(),
                duration_samples: note_duration_secs(request, offset as usize)
                    * RENDER_SAMPLE_RATE as usize,
            }
        })
        .collect()
}

/// Per-note render length in seconds; a short duration list repeats its last
/// entry across the remaining keyboard.
fn note_duration_secs(request: &RenderRequest, index: usize) -> usize {
    match request.note_durations.as_deref() {
        Some(durations) => durations
            .get(index)
            .or(durations.last())
            .copied()
            .unwrap_or(DEFAULT_NOTE_DURATION_SECS) as usize,
        None => DEFAULT_NOTE_DURATION_SECS as usize,
    }
}

/// Merges this bank into the index file, rewriting it sorted by bank number.
/// Other banks' entries are preserved; this bank's name is replaced.
fn update_bank_index(output_dir: &Path, bank_number: u32, bank_name: &str) -> Result<()> {
    let path = output_dir.join(BANK_INDEX_FILE);
    let mut entries: BTreeMap<u32, String> = BTreeMap::new();

    if path.exists() {
        let existing = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        for line in existing.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.split_once(':') {
                Some((number, name)) => match number.trim().parse::<u32>() {
                    Ok(number) => {
                        entries.insert(number, name.trim().to_string());
                    }
                    Err(_) => log::warn!("[Index] Ignoring malformed line '{}'", line),
                },
                None => log::warn!("[Index] Ignoring malformed line '{}'", line),
            }
        }
    }

    let name = if bank_name.is_empty() {
        format!("Bank {}", bank_number)
    } else {
        bank_name.to_string()
    };
    entries.insert(bank_number, name);

    let body = entries.iter().map(|(number, name)| format!("{}: {}", number, name)).join("\n");
    fs::write(&path, body + "\n").with_context(|| format!("Failed to write {:?}", path))?;
    Ok(())
}
