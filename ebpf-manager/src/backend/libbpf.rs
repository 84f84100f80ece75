//! Backend using libbpf to create maps and consume perf and BPF ring buffers.
//!
//! libbpf buffers are callback based: a dedicated polling thread drives
//! `poll()` and forwards the records it gets into a bounded channel the
//! reader blocks on. Closing the reader stops the polling thread, which in
//! turn disconnects the channel and wakes up a pending `read()`.
use std::{
    any::Any,
    ffi::CString,
    mem,
    os::{
        fd::{AsFd, AsRawFd, RawFd},
        unix::ffi::OsStrExt,
    },
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Condvar, Mutex},
    thread,
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use log::{debug, error, warn};

use super::*;
use crate::map::{MapCleanupType, MapKind, MapOptions, MapOrigin, MapSpec};

/// Timeout when polling for new records from BPF.
const BPF_POLL_TIMEOUT_MS: u64 = 200;
/// Number of records buffered between the polling thread and the reader.
const RECORDS_CHANNEL_CAPACITY: usize = 4096;

/// Backend relying on libbpf. Requires CAP_BPF.
#[derive(Clone, Copy, Debug, Default)]
pub struct LibbpfBackend;

impl Backend for LibbpfBackend {
    fn load_map(&self, spec: &MapSpec, options: &MapOptions) -> Result<Box<dyn MapObject>> {
        Ok(Box::new(LibbpfMap::load(spec, options)?))
    }

    fn open_reader(
        &self,
        map: &dyn MapObject,
        config: &ReaderConfig,
    ) -> Result<Box<dyn RecordReader>> {
        let map = map
            .as_any()
            .downcast_ref::<LibbpfMap>()
            .ok_or_else(|| anyhow!("Map {} was not created by libbpf", map.spec().name))?;

        // The polling thread owns its own handle on the map.
        let handle = libbpf_rs::MapHandle::try_from(&map.handle)?;
        let reader = match map.spec.kind {
            MapKind::PerfEventArray => PollReader::perf_buffer(&map.spec.name, handle, config)?,
            MapKind::RingBuf => PollReader::ring_buffer(&map.spec.name, handle)?,
            kind => bail!(
                "Map {} of type {:?} can't be used as a ring buffer",
                map.spec.name,
                kind
            ),
        };

        Ok(Box::new(reader))
    }
}

/// Map created (or reused) through libbpf.
pub struct LibbpfMap {
    spec: MapSpec,
    handle: libbpf_rs::MapHandle,
    origin: MapOrigin,
    pin_path: Option<PathBuf>,
}

impl LibbpfMap {
    fn load(spec: &MapSpec, options: &MapOptions) -> Result<LibbpfMap> {
        if let Some(path) = &options.pin_path {
            if options.reuse_pinned && path.exists() {
                let handle = libbpf_rs::MapHandle::from_pinned_path(path)
                    .or_else(|e| bail!("Failed to reuse pinned map {}: {}", spec.name, e))?;
                debug!("Reusing map {} pinned at {}", spec.name, path.display());

                return Ok(LibbpfMap {
                    spec: spec.clone(),
                    handle,
                    origin: MapOrigin::External,
                    pin_path: Some(path.clone()),
                });
            }
        }

        let mut max_entries = spec.max_entries;
        match spec.kind {
            MapKind::PerfEventArray if max_entries == 0 => {
                max_entries = u32::try_from(libbpf_rs::num_possible_cpus()?)?;
            }
            MapKind::RingBuf if max_entries == 0 => {
                bail!("Ring buffer map {} needs a size (max_entries)", spec.name);
            }
            _ => (),
        }

        let opts = libbpf_sys::bpf_map_create_opts {
            sz: mem::size_of::<libbpf_sys::bpf_map_create_opts>() as libbpf_sys::size_t,
            ..Default::default()
        };
        let handle = libbpf_rs::MapHandle::create(
            spec.kind.into(),
            Some(spec.name.as_str()),
            spec.key_size,
            spec.value_size,
            max_entries,
            &opts,
        )
        .or_else(|e| bail!("Failed to create map {}: {}", spec.name, e))?;

        if let Some(path) = &options.pin_path {
            pin(&handle, path).or_else(|e| bail!("Failed to pin map {}: {}", spec.name, e))?;
        }

        Ok(LibbpfMap {
            spec: spec.clone(),
            handle,
            origin: MapOrigin::Internal,
            pin_path: options.pin_path.clone(),
        })
    }

    pub fn handle(&self) -> &libbpf_rs::MapHandle {
        &self.handle
    }
}

impl MapObject for LibbpfMap {
    fn spec(&self) -> &MapSpec {
        &self.spec
    }

    fn origin(&self) -> MapOrigin {
        self.origin
    }

    fn pin_path(&self) -> Option<&Path> {
        self.pin_path.as_deref()
    }

    fn fd(&self) -> Option<RawFd> {
        Some(self.handle.as_fd().as_raw_fd())
    }

    fn close(self: Box<Self>, cleanup: MapCleanupType) -> Result<()> {
        if let Some(path) = &self.pin_path {
            if cleanup.covers(self.origin) {
                std::fs::remove_file(path).or_else(|e| {
                    bail!("Failed to unpin map {} ({}): {}", self.spec.name, path.display(), e)
                })?;
            }
        }
        // The file descriptor is closed when the handle is dropped.
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn pin(handle: &libbpf_rs::MapHandle, path: &Path) -> Result<()> {
    let cpath = CString::new(path.as_os_str().as_bytes())?;
    let ret = unsafe { libbpf_sys::bpf_obj_pin(handle.as_fd().as_raw_fd(), cpath.as_ptr()) };
    if ret < 0 {
        return Err(std::io::Error::from_raw_os_error(-ret).into());
    }
    Ok(())
}

#[derive(Default)]
struct PollState {
    paused: bool,
    closed: bool,
}

/// Control block shared between a reader and its polling thread.
#[derive(Default)]
struct PollControl {
    state: Mutex<PollState>,
    cond: Condvar,
}

impl PollControl {
    /// Wait while the reader is paused. Returns false once it is closed.
    fn wait_active(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        while state.paused && !state.closed {
            state = self.cond.wait(state).unwrap();
        }
        !state.closed
    }

    fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut PollState),
    {
        f(&mut self.state.lock().unwrap());
        self.cond.notify_all();
    }
}

type RecordSender = mpsc::SyncSender<Result<Record>>;

/// Reader fed by a libbpf polling thread.
struct PollReader {
    rx: Mutex<mpsc::Receiver<Result<Record>>>,
    control: Arc<PollControl>,
}

impl PollReader {
    fn perf_buffer(
        name: &str,
        handle: libbpf_rs::MapHandle,
        config: &ReaderConfig,
    ) -> Result<PollReader> {
        let pages = size_to_pages(config.size, page_size()?);
        if config.watermark > 1 {
            warn!(
                "{name}: watermark ({}) is not supported by libbpf perf buffers, ignoring",
                config.watermark
            );
        }

        Self::spawn(name, move |tx, ready, control| {
            let sample_tx = tx.clone();
            let lost_tx = tx.clone();
            let perf = match libbpf_rs::PerfBufferBuilder::new(&handle)
                .pages(pages)
                .sample_cb(move |cpu: i32, data: &[u8]| {
                    // Errors mean the reader is gone, nothing to report to.
                    let _ = sample_tx.send(Ok(Record::sample(cpu as u32, data)));
                })
                .lost_cb(move |cpu: i32, count: u64| {
                    let _ = lost_tx.send(Ok(Record::lost(cpu as u32, count)));
                })
                .build()
            {
                Ok(perf) => perf,
                Err(e) => {
                    let _ = ready.send(Err(anyhow!("Failed to build perf buffer: {e}")));
                    return;
                }
            };
            let _ = ready.send(Ok(()));

            poll_loop(&control, &tx, |timeout| perf.poll(timeout));
        })
    }

    fn ring_buffer(name: &str, handle: libbpf_rs::MapHandle) -> Result<PollReader> {
        Self::spawn(name, move |tx, ready, control| {
            let sample_tx = tx.clone();
            let mut builder = libbpf_rs::RingBufferBuilder::new();
            // BPF ring buffers are shared by all CPUs, use a single lane.
            let rb = match builder.add(&handle, move |data: &[u8]| -> i32 {
                let _ = sample_tx.send(Ok(Record::sample(0, data)));
                0
            }) {
                Ok(_) => builder.build(),
                Err(e) => Err(e),
            };
            let rb = match rb {
                Ok(rb) => rb,
                Err(e) => {
                    let _ = ready.send(Err(anyhow!("Failed to build ring buffer: {e}")));
                    return;
                }
            };
            let _ = ready.send(Ok(()));

            poll_loop(&control, &tx, |timeout| rb.poll(timeout));
        })
    }

    /// Start a polling thread. The buffer is built within the thread, `body`
    /// reports whether that worked through the `ready` channel.
    fn spawn<F>(name: &str, body: F) -> Result<PollReader>
    where
        F: FnOnce(RecordSender, mpsc::SyncSender<Result<()>>, Arc<PollControl>) + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(RECORDS_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let control = Arc::new(PollControl::default());

        let thread_control = Arc::clone(&control);
        thread::Builder::new()
            .name(format!("poll-{name}"))
            .spawn(move || body(tx, ready_tx, thread_control))?;

        ready_rx.recv()??;

        Ok(PollReader {
            rx: Mutex::new(rx),
            control,
        })
    }
}

fn poll_loop<P>(control: &PollControl, tx: &RecordSender, mut poll: P)
where
    P: FnMut(Duration) -> libbpf_rs::Result<()>,
{
    while control.wait_active() {
        if let Err(e) = poll(Duration::from_millis(BPF_POLL_TIMEOUT_MS)) {
            match e.kind() {
                // Received EINTR while polling, e.g. because of a signal.
                libbpf_rs::ErrorKind::Interrupted => (),
                _ => {
                    error!("Unexpected error while polling ({e})");
                    if tx.send(Err(anyhow!("polling error: {e}"))).is_err() {
                        break;
                    }
                }
            }
        }
    }
}

fn to_read_result(entry: Result<Record>) -> Result<Record, ReadError> {
    entry.map_err(ReadError::Other)
}

impl RecordReader for PollReader {
    fn read(&self) -> Result<Record, ReadError> {
        let rx = self.rx.lock().unwrap();
        let mut pending = None;

        // Records queued before a pause, or pushed by a poll in flight when
        // it happened, are withheld until the reader is resumed.
        loop {
            if !self.control.wait_active() {
                // Closed: drain what is left until the polling thread is
                // gone.
                return match pending {
                    Some(entry) => to_read_result(entry),
                    None => rx.recv().map_or(Err(ReadError::Closed), to_read_result),
                };
            }
            if let Some(entry) = pending.take() {
                return to_read_result(entry);
            }

            match rx.recv_timeout(Duration::from_millis(BPF_POLL_TIMEOUT_MS)) {
                // Checked against the pause state on the next iteration.
                Ok(entry) => pending = Some(entry),
                Err(mpsc::RecvTimeoutError::Timeout) => (),
                // All senders are gone: the polling thread exited.
                Err(mpsc::RecvTimeoutError::Disconnected) => return Err(ReadError::Closed),
            }
        }
    }

    fn pause(&self) -> Result<()> {
        self.control.update(|s| s.paused = true);
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        self.control.update(|s| s.paused = false);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.control.update(|s| s.closed = true);
        Ok(())
    }
}
