use nix::errno::Errno;
use nix::libc;
use nix::unistd::{sysconf, SysconfVar};

use std::fs;
use std::io;
use std::os::raw::{c_int, c_ulong};
use std::os::unix::io::RawFd;

use crate::perf::Attr;

const CPU_ONLINE: &str = "/sys/devices/system/cpu/online";
const DEFAULT_PAGE_SIZE: usize = 4096;

pub(crate) fn perf_event_open(
    attr: &Attr,
    pid: libc::pid_t,
    cpu: c_int,
    group_fd: RawFd,
    flags: c_ulong,
) -> nix::Result<RawFd> {
    let res = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const Attr,
            pid,
            cpu,
            group_fd,
            flags,
        )
    };
    Errno::result(res).map(|fd| fd as RawFd)
}

pub(crate) fn ioctl(fd: RawFd, request: c_ulong, arg: c_ulong) -> nix::Result<()> {
    Errno::result(unsafe { libc::ioctl(fd, request as _, arg) }).map(drop)
}

pub(crate) fn page_size() -> usize {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as usize,
        _ => DEFAULT_PAGE_SIZE,
    }
}

pub(crate) fn online_cpus() -> io::Result<Vec<u32>> {
    let list = fs::read_to_string(CPU_ONLINE)?;
    parse_cpu_list(&list)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("malformed cpu list `{}`", list.trim())))
}

/// Thread ids of process `pid`, as listed under `/proc/<pid>/task`.
pub(crate) fn process_threads(pid: libc::pid_t) -> io::Result<Vec<libc::pid_t>> {
    let mut tids = Vec::new();
    for entry in fs::read_dir(format!("/proc/{}/task", pid))? {
        let name = entry?.file_name();
        if let Some(tid) = name.to_str().and_then(|n| n.parse().ok()) {
            tids.push(tid);
        }
    }

    tids.sort_unstable();
    Ok(tids)
}

/// Parses the kernel's cpu list format, e.g. `0-3,6,8-9`.
pub(crate) fn parse_cpu_list(list: &str) -> Option<Vec<u32>> {
    let mut cpus = Vec::new();
    for range in list.trim().split(',').filter(|r| !r.is_empty()) {
        let mut bounds = range.splitn(2, '-');
        let lo = bounds.next()?.trim().parse::<u32>().ok()?;
        let hi = match bounds.next() {
            Some(hi) => hi.trim().parse::<u32>().ok()?,
            None => lo,
        };
        if hi < lo {
            return None;
        }
        cpus.extend(lo..=hi);
    }

    if cpus.is_empty() {
        None
    } else {
        Some(cpus)
    }
}

/// Maps an I/O failure onto the errno the hardware layer would have reported.
pub(crate) fn errno_of(err: &io::Error) -> Errno {
    err.raw_os_error()
        .map(Errno::from_i32)
        .unwrap_or(Errno::EIO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_cpu() {
        assert_eq!(parse_cpu_list("0\n"), Some(vec![0]));
    }

    #[test]
    fn parses_ranges_and_gaps() {
        assert_eq!(parse_cpu_list("0-3,6,8-9\n"), Some(vec![0, 1, 2, 3, 6, 8, 9]));
    }

    #[test]
    fn rejects_malformed_lists() {
        assert_eq!(parse_cpu_list(""), None);
        assert_eq!(parse_cpu_list("3-1"), None);
        assert_eq!(parse_cpu_list("a-b"), None);
    }

    #[test]
    fn lists_threads_of_this_process() {
        let (tx, rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let worker = std::thread::spawn(move || {
            tx.send(nix::unistd::gettid().as_raw()).unwrap();
            done_rx.recv().ok();
        });

        let tid = rx.recv().unwrap();
        let tids = process_threads(std::process::id() as libc::pid_t).unwrap();
        assert!(tids.contains(&(std::process::id() as libc::pid_t)));
        assert!(tids.contains(&tid));

        done_tx.send(()).unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn missing_process_has_no_threads() {
        let err = process_threads(libc::pid_t::MAX).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn errno_falls_back_to_eio() {
        let err = io::Error::new(io::ErrorKind::Other, "synthetic");
        assert_eq!(errno_of(&err), Errno::EIO);
        assert_eq!(errno_of(&io::Error::from_raw_os_error(libc::ENOENT)), Errno::ENOENT);
    }
}
