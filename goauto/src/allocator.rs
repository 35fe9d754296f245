// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of goauto

//! Reserves an arena inside the target's address space by attaching with
//! ptrace and executing a single remote `mmap` syscall. The eBPF programs
//! use the arena for allocations the target never sees.

use std::fs;

use log::{debug, warn};
use nix::libc;
use nix::sys::ptrace;
use nix::sys::wait::{WaitPidFlag, waitpid};
use nix::unistd::Pid;

use crate::errors::AutoError;
use crate::utils::online_cpu_count;

/// Size of the remote arena.
const ALLOC_SIZE: u64 = 15 * 1024 * 1024;

// A newly forked thread can appear between task-list scans; individual
// attaches are retried to absorb the race.
const ATTACH_RETRIES: usize = 10;

/// The `(start, end)` window reserved in the target, plus the CPU count the
/// eBPF allocator partitions it by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationDetails {
    pub start_addr: u64,
    pub end_addr: u64,
    pub num_cpus: u64,
}

/// Attach to every thread of `pid`, run `mmap` on its main thread, detach.
pub fn allocate(pid: i32) -> Result<AllocationDetails, AutoError> {
    let num_cpus = online_cpu_count()?;
    let attached = attach_all_threads(pid)?;

    let result = remote_mmap(Pid::from_raw(pid), ALLOC_SIZE);

    // Detach in reverse attach order whether or not the call worked.
    for tid in attached.into_iter().rev() {
        if let Err(e) = ptrace::detach(tid, None) {
            warn!("ptrace detach from tid {tid} failed: {e}");
        }
    }

    let start_addr = result?;
    debug!(
        "remote mmap in pid {pid}: {:#x}..{:#x}",
        start_addr,
        start_addr + ALLOC_SIZE
    );
    Ok(AllocationDetails {
        start_addr,
        end_addr: start_addr + ALLOC_SIZE,
        num_cpus,
    })
}

fn read_tids(pid: i32) -> Result<Vec<Pid>, AutoError> {
    let mut tids = Vec::new();
    for entry in fs::read_dir(format!("/proc/{pid}/task"))? {
        let entry = entry?;
        if let Ok(tid) = entry.file_name().to_string_lossy().parse::<i32>() {
            tids.push(Pid::from_raw(tid));
        }
    }
    Ok(tids)
}

/// Stop the whole thread group, rescanning the task list until no new
/// threads appear between scans.
fn attach_all_threads(pid: i32) -> Result<Vec<Pid>, AutoError> {
    let mut attached: Vec<Pid> = Vec::new();
    loop {
        let tids = read_tids(pid)?;
        let new: Vec<Pid> = tids
            .into_iter()
            .filter(|t| !attached.contains(t))
            .collect();
        if new.is_empty() {
            break;
        }
        for tid in new {
            if attach_thread(tid)? {
                attached.push(tid);
            }
        }
    }
    if attached.is_empty() {
        return Err(AutoError::PtraceAttachFailed {
            tid: pid,
            source: nix::Error::ESRCH,
        });
    }
    Ok(attached)
}

/// Attach one thread and wait for its ptrace-stop. Returns `Ok(false)` when
/// the thread exited before we could attach.
fn attach_thread(tid: Pid) -> Result<bool, AutoError> {
    let mut last = nix::Error::ESRCH;
    for _ in 0..ATTACH_RETRIES {
        match ptrace::attach(tid) {
            Ok(()) => {
                waitpid(tid, Some(WaitPidFlag::__WALL)).map_err(|source| {
                    AutoError::PtraceAttachFailed {
                        tid: tid.as_raw(),
                        source,
                    }
                })?;
                return Ok(true);
            }
            Err(nix::Error::ESRCH) => return Ok(false),
            Err(e) => last = e,
        }
    }
    Err(AutoError::PtraceAttachFailed {
        tid: tid.as_raw(),
        source: last,
    })
}

fn mmap_error(pid: Pid, reason: String) -> AutoError {
    AutoError::RemoteMmapFailed {
        pid: pid.as_raw(),
        reason,
    }
}

/// Execute `mmap(0, length, RWX, ANON|PRIVATE|POPULATE, -1, 0)` at the
/// stopped main thread's current instruction pointer: save registers and
/// code, patch in a syscall instruction, single-step, restore.
#[cfg(target_arch = "x86_64")]
fn remote_mmap(pid: Pid, length: u64) -> Result<u64, AutoError> {
    let saved_regs =
        ptrace::getregs(pid).map_err(|e| mmap_error(pid, format!("getregs: {e}")))?;
    let ip = saved_regs.rip;
    let saved_word = ptrace::read(pid, ip as ptrace::AddressType)
        .map_err(|e| mmap_error(pid, format!("read text: {e}")))?;

    // `syscall` is 0f 05.
    let patched = (saved_word as u64 & !0xffff) | 0x050f;
    ptrace::write(pid, ip as ptrace::AddressType, patched as libc::c_long)
        .map_err(|e| mmap_error(pid, format!("write text: {e}")))?;

    let mut regs = saved_regs;
    regs.rax = libc::SYS_mmap as u64;
    regs.rdi = 0;
    regs.rsi = length;
    regs.rdx = (libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC) as u64;
    regs.r10 = (libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_POPULATE) as u64;
    regs.r8 = u64::MAX; // fd = -1
    regs.r9 = 0;

    let stepped = ptrace::setregs(pid, regs)
        .and_then(|()| ptrace::step(pid, None))
        .and_then(|()| waitpid(pid, Some(WaitPidFlag::__WALL)).map(|_| ()))
        .and_then(|()| ptrace::getregs(pid));

    // Restore before inspecting the result so a failed syscall still
    // leaves the target untouched.
    ptrace::write(pid, ip as ptrace::AddressType, saved_word)
        .map_err(|e| mmap_error(pid, format!("restore text: {e}")))?;
    ptrace::setregs(pid, saved_regs)
        .map_err(|e| mmap_error(pid, format!("restore regs: {e}")))?;

    let result = stepped
        .map(|r| r.rax)
        .map_err(|e| mmap_error(pid, format!("single step: {e}")))?;
    syscall_return(pid, result)
}

/// As above, with `svc #0` and the arm64 syscall convention (`mmap` is 222,
/// number in x8, result in x0).
#[cfg(target_arch = "aarch64")]
fn remote_mmap(pid: Pid, length: u64) -> Result<u64, AutoError> {
    use nix::sys::ptrace::regset::NT_PRSTATUS;

    let saved_regs = ptrace::getregset::<NT_PRSTATUS>(pid)
        .map_err(|e| mmap_error(pid, format!("getregset: {e}")))?;
    let ip = saved_regs.pc;
    let saved_word = ptrace::read(pid, ip as ptrace::AddressType)
        .map_err(|e| mmap_error(pid, format!("read text: {e}")))?;

    // `svc #0` is d4000001.
    let patched = (saved_word as u64 & !0xffff_ffff) | 0xd400_0001;
    ptrace::write(pid, ip as ptrace::AddressType, patched as libc::c_long)
        .map_err(|e| mmap_error(pid, format!("write text: {e}")))?;

    let mut regs = saved_regs;
    regs.regs[8] = libc::SYS_mmap as u64;
    regs.regs[0] = 0;
    regs.regs[1] = length;
    regs.regs[2] = (libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC) as u64;
    regs.regs[3] = (libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_POPULATE) as u64;
    regs.regs[4] = u64::MAX; // fd = -1
    regs.regs[5] = 0;

    let stepped = ptrace::setregset::<NT_PRSTATUS>(pid, regs)
        .and_then(|()| ptrace::step(pid, None))
        .and_then(|()| waitpid(pid, Some(WaitPidFlag::__WALL)).map(|_| ()))
        .and_then(|()| ptrace::getregset::<NT_PRSTATUS>(pid));

    ptrace::write(pid, ip as ptrace::AddressType, saved_word)
        .map_err(|e| mmap_error(pid, format!("restore text: {e}")))?;
    ptrace::setregset::<NT_PRSTATUS>(pid, saved_regs)
        .map_err(|e| mmap_error(pid, format!("restore regs: {e}")))?;

    let result = stepped
        .map(|r| r.regs[0])
        .map_err(|e| mmap_error(pid, format!("single step: {e}")))?;
    syscall_return(pid, result)
}

fn syscall_return(pid: Pid, value: u64) -> Result<u64, AutoError> {
    let signed = value as i64;
    if (-4095..0).contains(&signed) {
        return Err(mmap_error(pid, format!("mmap returned errno {}", -signed)));
    }
    Ok(value)
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn remote_mmap(pid: Pid, _length: u64) -> Result<u64, AutoError> {
    Err(mmap_error(pid, "unsupported architecture".to_string()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_syscall_return_classification() {
        let pid = Pid::from_raw(1);
        assert_eq!(syscall_return(pid, 0x7f00_0000_0000).unwrap(), 0x7f00_0000_0000);
        // -12 (ENOMEM) as u64.
        let err = syscall_return(pid, (-12i64) as u64);
        assert!(matches!(err, Err(AutoError::RemoteMmapFailed { .. })));
    }

    #[test]
    fn test_allocation_window_size() {
        let details = AllocationDetails {
            start_addr: 0x1000,
            end_addr: 0x1000 + ALLOC_SIZE,
            num_cpus: 8,
        };
        assert_eq!(details.end_addr - details.start_addr, 15 * 1024 * 1024);
    }
}
