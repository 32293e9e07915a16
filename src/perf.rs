#![allow(non_upper_case_globals)]

//! Wide hardware breakpoints on top of `perf_event_open(2)`: one breakpoint
//! event per online processor (per thread and processor when scoped to a
//! process), each sampling every access into its own ring buffer, drained
//! by a dispatcher thread per registration.

use bitflags::bitflags;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::unistd::{close, pipe2};

use std::num::NonZeroUsize;
use std::os::raw::{c_int, c_ulong, c_void};
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::slice;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::arch::Address;
use crate::backend::Backend;
use crate::breakpoint::Breakpoint;
use crate::config::WatchConfig;
use crate::event::Hex;
use crate::handler::{Trigger, TriggerHandler};
use crate::util;

pub const PERF_TYPE_BREAKPOINT: u32 = 5;
pub const PERF_ATTR_SIZE_VER5: u32 = 112;

const PERF_RECORD_LOST: u32 = 2;
const PERF_RECORD_SAMPLE: u32 = 9;

const PERF_EVENT_IOC_ENABLE: c_ulong = 0x2400;
const PERF_EVENT_IOC_DISABLE: c_ulong = 0x2401;
const PERF_FLAG_FD_CLOEXEC: c_ulong = 0x08;

// callchain entries at or above this value are context markers, not frames
const PERF_CONTEXT_MAX: u64 = -4095i64 as u64;

const DATA_HEAD_OFFSET: usize = 1024;
const DATA_TAIL_OFFSET: usize = 1032;

const RECORD_HEADER_SIZE: usize = 8;

bitflags! {
    pub struct AttrFlags: u64 {
        const Disabled      = 1 << 0;
        const Inherit       = 1 << 1;
        const ExcludeUser   = 1 << 4;
        const ExcludeKernel = 1 << 5;
        const ExcludeHv     = 1 << 6;
    }
}

bitflags! {
    pub struct SampleType: u64 {
        const Ip        = 1 << 0;
        const Tid       = 1 << 1;
        const Addr      = 1 << 3;
        const Callchain = 1 << 5;
    }
}

/// `struct perf_event_attr`, ABI version 5.
#[derive(Debug, Default, Clone)]
#[repr(C)]
pub struct Attr {
    kind: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    bp_addr: u64,
    bp_len: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    reserved: u16,
}

impl Attr {
    pub fn breakpoint(breakpoint: &Breakpoint, options: &WatchConfig) -> Self {
        let mut flags = AttrFlags::Disabled | AttrFlags::ExcludeHv;
        if options.exclude_kernel {
            flags |= AttrFlags::ExcludeKernel;
        }
        if options.pid.is_some() {
            flags |= AttrFlags::Inherit;
        }

        Self {
            kind: PERF_TYPE_BREAKPOINT,
            size: PERF_ATTR_SIZE_VER5,
            sample_period: 1,
            sample_type: (SampleType::Ip
                | SampleType::Tid
                | SampleType::Addr
                | SampleType::Callchain)
                .bits(),
            flags: flags.bits(),
            wakeup_events: 1,
            bp_type: breakpoint.bp_type(),
            bp_addr: breakpoint.address(),
            bp_len: breakpoint.bp_len(),
            ..Self::default()
        }
    }

    pub fn flags(&self) -> AttrFlags {
        AttrFlags::from_bits_truncate(self.flags)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Record {
    Sample(Trigger),
    Lost(u64),
    Other(u32),
}

fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let mut word = [0u8; 4];
    word.copy_from_slice(buf.get(offset..offset + 4)?);
    Some(u32::from_ne_bytes(word))
}

fn read_u64(buf: &[u8], offset: usize) -> Option<u64> {
    let mut word = [0u8; 8];
    word.copy_from_slice(buf.get(offset..offset + 8)?);
    Some(u64::from_ne_bytes(word))
}

/// Decodes one ring buffer record, header included. Sample bodies follow
/// the `sample_type` set up in [`Attr::breakpoint`]: ip, pid/tid, addr,
/// callchain.
pub(crate) fn decode_record(record: &[u8]) -> Option<Record> {
    let kind = read_u32(record, 0)?;
    match kind {
        PERF_RECORD_SAMPLE => {
            let mut offset = RECORD_HEADER_SIZE;
            let ip = read_u64(record, offset)?;
            offset += 8;
            let pid = read_u32(record, offset)?;
            let tid = read_u32(record, offset + 4)?;
            offset += 8;
            let addr = read_u64(record, offset)?;
            offset += 8;
            let nr = read_u64(record, offset)? as usize;
            offset += 8;

            let mut callchain = Vec::with_capacity(nr.min(128));
            for i in 0..nr {
                let ip = read_u64(record, offset + i * 8)?;
                if ip < PERF_CONTEXT_MAX {
                    callchain.push(ip);
                }
            }

            Some(Record::Sample(Trigger {
                cpu: 0,
                pid,
                tid,
                ip,
                addr,
                callchain,
            }))
        }
        PERF_RECORD_LOST => read_u64(record, RECORD_HEADER_SIZE + 8).map(Record::Lost),
        other => Some(Record::Other(other)),
    }
}

/// Copies `out.len()` bytes starting at the free-running `offset` out of a
/// power-of-two sized ring.
pub(crate) fn copy_wrapped(ring: &[u8], offset: u64, out: &mut [u8]) {
    let start = (offset % ring.len() as u64) as usize;
    let first = out.len().min(ring.len() - start);
    let (head, rest) = out.split_at_mut(first);
    head.copy_from_slice(&ring[start..start + first]);
    rest.copy_from_slice(&ring[..rest.len()]);
}

struct RingBuffer {
    base: NonNull<c_void>,
    len: usize,
    page_size: usize,
}

// The mapping is only touched by the dispatcher thread that owns it.
unsafe impl Send for RingBuffer {}

impl RingBuffer {
    fn map(fd: RawFd, data_pages: usize, page_size: usize) -> nix::Result<Self> {
        let len = (data_pages + 1) * page_size;
        let length = NonZeroUsize::new(len).ok_or(Errno::EINVAL)?;
        let base = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )?
        };

        let base = NonNull::new(base).ok_or(Errno::EINVAL)?;
        Ok(Self {
            base,
            len,
            page_size,
        })
    }

    fn control(&self, offset: usize) -> &AtomicU64 {
        unsafe { &*(self.base.as_ptr().cast::<u8>().add(offset) as *const AtomicU64) }
    }

    fn data(&self) -> &[u8] {
        unsafe {
            slice::from_raw_parts(
                self.base.as_ptr().cast::<u8>().add(self.page_size),
                self.len - self.page_size,
            )
        }
    }

    fn drain<F: FnMut(&[u8])>(&self, mut f: F) {
        let head = self.control(DATA_HEAD_OFFSET).load(Ordering::Acquire);
        let mut tail = self.control(DATA_TAIL_OFFSET).load(Ordering::Relaxed);
        let data = self.data();

        let mut header = [0u8; RECORD_HEADER_SIZE];
        let mut record = Vec::new();

        while tail < head {
            copy_wrapped(data, tail, &mut header);
            let size = u16::from_ne_bytes([header[6], header[7]]) as usize;
            if size < RECORD_HEADER_SIZE || size > data.len() {
                tracing::warn!("corrupt perf record of size {}; discarding buffer", size);
                break;
            }

            record.resize(size, 0);
            copy_wrapped(data, tail, &mut record);
            f(&record[..]);

            tail += size as u64;
        }

        self.control(DATA_TAIL_OFFSET).store(head, Ordering::Release);
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        unsafe { munmap(self.base.as_ptr(), self.len).ok() };
    }
}

struct PerfEvent {
    tid: i32,
    cpu: u32,
    fd: RawFd,
    ring: Option<RingBuffer>,
}

impl PerfEvent {
    fn open(
        attr: &Attr,
        tid: i32,
        cpu: u32,
        data_pages: usize,
        page_size: usize,
    ) -> nix::Result<Self> {
        let fd = util::perf_event_open(attr, tid, cpu as c_int, -1, PERF_FLAG_FD_CLOEXEC)?;
        let mut event = Self {
            tid,
            cpu,
            fd,
            ring: None,
        };
        event.ring = Some(RingBuffer::map(fd, data_pages, page_size)?);
        Ok(event)
    }

    fn enable(&self) -> nix::Result<()> {
        util::ioctl(self.fd, PERF_EVENT_IOC_ENABLE, 0)
    }

    fn disable(&self) -> nix::Result<()> {
        util::ioctl(self.fd, PERF_EVENT_IOC_DISABLE, 0)
    }
}

impl Drop for PerfEvent {
    fn drop(&mut self) {
        self.disable().ok();
        drop(self.ring.take());
        close(self.fd).ok();
    }
}

struct Dispatcher {
    events: Vec<PerfEvent>,
    wake: RawFd,
    handler: Arc<TriggerHandler>,
    stopped: Arc<AtomicBool>,
}

impl Dispatcher {
    fn run(&self) {
        if let Err(errno) = self.dispatch() {
            self.stopped.store(true, Ordering::Release);
            self.handler.fault(errno);
        }
    }

    /// Delivers samples until the wake pipe hangs up. Returns an error when
    /// delivery stops for any other reason.
    fn dispatch(&self) -> Result<(), Errno> {
        let count = self.events.len();
        let mut live = vec![true; count];

        loop {
            if !live.contains(&true) {
                // every watched thread or processor went away
                return Err(Errno::ESRCH);
            }

            let mut fds = self
                .events
                .iter()
                .zip(&live)
                .map(|(event, &live)| PollFd::new(if live { event.fd } else { -1 }, PollFlags::POLLIN))
                .collect::<Vec<_>>();
            fds.push(PollFd::new(self.wake, PollFlags::POLLIN));

            match poll(&mut fds, -1) {
                Ok(_) => (),
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    tracing::error!("breakpoint dispatcher stopped: {}", err);
                    return Err(err);
                }
            }

            let revents = |fd: &PollFd| fd.revents().unwrap_or_else(PollFlags::empty);

            if revents(&fds[count]).intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
                return Ok(());
            }

            for (i, fd) in fds[..count].iter().enumerate() {
                let ready = revents(fd);
                if ready.intersects(PollFlags::POLLIN) {
                    self.drain(i);
                }
                if ready.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                    let event = &self.events[i];
                    tracing::debug!("breakpoint event for tid {} on cpu {} hung up", event.tid, event.cpu);
                    live[i] = false;
                }
            }
        }
    }

    fn drain(&self, index: usize) {
        let event = &self.events[index];
        let ring = match event.ring {
            Some(ref ring) => ring,
            None => return,
        };

        ring.drain(|record| match decode_record(record) {
            Some(Record::Sample(mut trigger)) => {
                trigger.cpu = event.cpu;
                self.handler.fire(&trigger);
            }
            Some(Record::Lost(lost)) => {
                tracing::warn!("cpu {} dropped {} watchpoint samples", event.cpu, lost);
            }
            Some(Record::Other(_)) => (),
            None => tracing::warn!("truncated perf record on cpu {}", event.cpu),
        });
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        close(self.wake).ok();
    }
}

/// A live wide breakpoint. Dropping the dispatcher it owns closes every
/// per-processor event.
#[derive(Debug)]
pub struct PerfHandle {
    address: Address,
    events: usize,
    wake: RawFd,
    stopped: Arc<AtomicBool>,
    dispatcher: JoinHandle<()>,
}

impl PerfHandle {
    pub fn address(&self) -> Address {
        self.address
    }

    /// Number of perf events backing this breakpoint.
    pub fn events(&self) -> usize {
        self.events
    }

    /// False once the dispatcher has given up and released the events.
    pub fn is_live(&self) -> bool {
        !self.stopped.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub struct PerfBackend {
    options: WatchConfig,
    page_size: usize,
}

impl PerfBackend {
    pub fn new(options: WatchConfig) -> Self {
        Self {
            options,
            page_size: util::page_size(),
        }
    }

    /// Threads to open events for. perf scopes a pid to a single thread and
    /// `inherit` only follows threads created later, so every existing
    /// thread of the target gets its own events.
    fn targets(&self) -> Result<Vec<i32>, Errno> {
        match self.options.pid {
            Some(pid) => util::process_threads(pid).map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => Errno::ESRCH,
                _ => util::errno_of(&e),
            }),
            None => Ok(vec![-1]),
        }
    }

    fn open_all(&self, attr: &Attr) -> Result<Vec<PerfEvent>, Errno> {
        let cpus = util::online_cpus().map_err(|e| util::errno_of(&e))?;
        let targets = self.targets()?;

        // returning early drops the partial set, closing whatever was opened
        let mut events = Vec::with_capacity(targets.len() * cpus.len());
        for tid in targets {
            for &cpu in &cpus {
                match PerfEvent::open(attr, tid, cpu, self.options.buffer_pages, self.page_size) {
                    Ok(event) => events.push(event),
                    Err(Errno::ESRCH) if tid != -1 && Some(tid) != self.options.pid => {
                        tracing::debug!("thread {} exited before it could be watched", tid);
                        break;
                    }
                    Err(errno) => return Err(errno),
                }
            }
        }

        if events.is_empty() {
            return Err(Errno::ESRCH);
        }
        Ok(events)
    }
}

impl Backend for PerfBackend {
    type Handle = PerfHandle;

    fn register(
        &mut self,
        breakpoint: &Breakpoint,
        handler: Arc<TriggerHandler>,
    ) -> Result<PerfHandle, Errno> {
        let attr = Attr::breakpoint(breakpoint, &self.options);
        let events = self.open_all(&attr)?;
        for event in &events {
            event.enable()?;
        }

        let count = events.len();
        let (wake_rx, wake_tx) = pipe2(OFlag::O_CLOEXEC)?;
        let stopped = Arc::new(AtomicBool::new(false));
        let dispatcher = Dispatcher {
            events,
            wake: wake_rx,
            handler,
            stopped: stopped.clone(),
        };

        let spawned = thread::Builder::new()
            .name(format!("mwatch-{}", Hex(breakpoint.address())))
            .spawn(move || dispatcher.run());

        match spawned {
            Ok(thread) => {
                tracing::debug!(
                    "breakpoint at {} armed through {} events",
                    Hex(breakpoint.address()),
                    count
                );
                Ok(PerfHandle {
                    address: breakpoint.address(),
                    events: count,
                    wake: wake_tx,
                    stopped,
                    dispatcher: thread,
                })
            }
            Err(err) => {
                close(wake_tx).ok();
                Err(util::errno_of(&err))
            }
        }
    }

    fn is_live(&self, handle: &PerfHandle) -> bool {
        handle.is_live()
    }

    fn unregister(&mut self, handle: PerfHandle) {
        // hanging up the wake pipe stops the dispatcher, which then drops
        // (disables, unmaps, closes) every event it owns
        close(handle.wake).ok();
        if handle.dispatcher.join().is_err() {
            tracing::error!(
                "dispatcher for {} panicked; its events were released during unwind",
                Hex(handle.address)
            );
        }
    }
}
