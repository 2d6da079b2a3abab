//! Win32 backend.
//!
//! A handle to the tracked process is kept open for as long as it is
//! tracked; without one the kernel discards the exit code as soon as the
//! process ends.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::mem;
use std::os::windows::ffi::OsStringExt;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use winapi::shared::minwindef::{DWORD, FALSE, FILETIME};
use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
use winapi::um::processthreadsapi::{
    GetExitCodeProcess, GetProcessHandleCount, GetProcessTimes, OpenProcess,
};
use winapi::um::psapi::{GetProcessMemoryInfo, PROCESS_MEMORY_COUNTERS};
use winapi::um::synchapi::WaitForSingleObject;
use winapi::um::sysinfoapi::{GlobalMemoryStatusEx, MEMORYSTATUSEX};
use winapi::um::tlhelp32::{
    CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W,
    TH32CS_SNAPPROCESS,
};
use winapi::um::winbase::WAIT_OBJECT_0;
use winapi::um::winnt::{HANDLE, PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_VM_READ, SYNCHRONIZE};

use super::{
    name_matches, Liveness, ProbeError, ProcessEntry, ProcessIdentity, ProcessSample,
    ProcessSource, Termination,
};

/// 100ns intervals between 1601-01-01 and 1970-01-01.
const EPOCH_DIFFERENCE: u64 = 116_444_736_000_000_000;

struct OwnedHandle(HANDLE);

// Process handles may be used from any thread.
unsafe impl Send for OwnedHandle {}

impl OwnedHandle {
    fn open(pid: u32) -> Option<Self> {
        let access = PROCESS_QUERY_LIMITED_INFORMATION | PROCESS_VM_READ | SYNCHRONIZE;
        let mut handle = unsafe { OpenProcess(access, FALSE, pid) };
        if handle.is_null() {
            // VM_READ is refused for protected processes.
            handle = unsafe {
                OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION | SYNCHRONIZE, FALSE, pid)
            };
        }
        (!handle.is_null()).then_some(OwnedHandle(handle))
    }

    fn times(&self) -> Option<ProcessTimes> {
        let mut creation: FILETIME = unsafe { mem::zeroed() };
        let mut exit: FILETIME = unsafe { mem::zeroed() };
        let mut kernel: FILETIME = unsafe { mem::zeroed() };
        let mut user: FILETIME = unsafe { mem::zeroed() };
        let ok = unsafe { GetProcessTimes(self.0, &mut creation, &mut exit, &mut kernel, &mut user) };
        (ok != 0).then(|| ProcessTimes {
            creation: filetime_u64(&creation),
            kernel: filetime_u64(&kernel),
            user: filetime_u64(&user),
        })
    }

    fn has_exited(&self) -> bool {
        unsafe { WaitForSingleObject(self.0, 0) == WAIT_OBJECT_0 }
    }

    fn exit_code(&self) -> Option<DWORD> {
        let mut code: DWORD = 0;
        let ok = unsafe { GetExitCodeProcess(self.0, &mut code) };
        (ok != 0).then_some(code)
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

struct ProcessTimes {
    creation: u64,
    kernel: u64,
    user: u64,
}

struct SnapshotEntry {
    pid: u32,
    exe: String,
    threads: u32,
}

fn filetime_u64(ft: &FILETIME) -> u64 {
    (u64::from(ft.dwHighDateTime) << 32) | u64::from(ft.dwLowDateTime)
}

fn filetime_to_utc(ft: u64) -> DateTime<Utc> {
    let millis = ft.saturating_sub(EPOCH_DIFFERENCE) / 10_000;
    Utc.timestamp_millis_opt(millis as i64)
        .single()
        .unwrap_or_else(Utc::now)
}

fn snapshot_processes() -> io::Result<Vec<SnapshotEntry>> {
    let snap = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) };
    if snap == INVALID_HANDLE_VALUE {
        return Err(io::Error::last_os_error());
    }
    let snap = OwnedHandle(snap);

    let mut entry: PROCESSENTRY32W = unsafe { mem::zeroed() };
    entry.dwSize = mem::size_of::<PROCESSENTRY32W>() as DWORD;
    let mut out = Vec::new();
    let mut ok = unsafe { Process32FirstW(snap.0, &mut entry) };
    while ok != 0 {
        let len = entry
            .szExeFile
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(entry.szExeFile.len());
        out.push(SnapshotEntry {
            pid: entry.th32ProcessID,
            exe: OsString::from_wide(&entry.szExeFile[..len])
                .to_string_lossy()
                .into_owned(),
            threads: entry.cntThreads,
        });
        ok = unsafe { Process32NextW(snap.0, &mut entry) };
    }
    Ok(out)
}

/// Win32 process source.
#[derive(Default)]
pub struct Win32Source {
    handles: Mutex<HashMap<ProcessIdentity, OwnedHandle>>,
}

impl Win32Source {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_handle<T>(
        &self,
        identity: &ProcessIdentity,
        f: impl FnOnce(&OwnedHandle) -> T,
    ) -> Option<T> {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        if !handles.contains_key(identity) {
            let handle = OwnedHandle::open(identity.pid)?;
            // A recycled PID has a different creation time.
            if handle.times()?.creation != identity.start_token {
                return None;
            }
            handles.insert(*identity, handle);
        }
        handles.get(identity).map(f)
    }
}

impl ProcessSource for Win32Source {
    fn find_by_name(&self, name: &str) -> Result<Option<ProcessEntry>, ProbeError> {
        let mut best: Option<(ProcessEntry, OwnedHandle)> = None;
        for entry in snapshot_processes()? {
            if !name_matches(&entry.exe, name) {
                continue;
            }
            let Some(handle) = OwnedHandle::open(entry.pid) else {
                continue;
            };
            let Some(times) = handle.times() else {
                continue;
            };
            if handle.has_exited() {
                continue;
            }
            let older = best
                .as_ref()
                .map_or(true, |(b, _)| times.creation < b.identity.start_token);
            if older {
                let found = ProcessEntry {
                    identity: ProcessIdentity {
                        pid: entry.pid,
                        start_token: times.creation,
                    },
                    name: entry.exe,
                    start_time: filetime_to_utc(times.creation),
                };
                best = Some((found, handle));
            }
        }

        Ok(best.map(|(found, handle)| {
            let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            handles.insert(found.identity, handle);
            found
        }))
    }

    fn identify(&self, pid: u32) -> Result<ProcessEntry, ProbeError> {
        let exe = snapshot_processes()?
            .into_iter()
            .find(|e| e.pid == pid)
            .map(|e| e.exe)
            .ok_or(ProbeError::NotFound { pid })?;
        let handle = OwnedHandle::open(pid).ok_or(ProbeError::AccessDenied { pid })?;
        let times = handle.times().ok_or(ProbeError::AccessDenied { pid })?;
        let identity = ProcessIdentity {
            pid,
            start_token: times.creation,
        };
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.insert(identity, handle);
        Ok(ProcessEntry {
            identity,
            name: exe,
            start_time: filetime_to_utc(times.creation),
        })
    }

    fn liveness(&self, identity: &ProcessIdentity) -> Liveness {
        let status = self.with_handle(identity, |handle| {
            if !handle.has_exited() {
                return None;
            }
            Some(match handle.exit_code() {
                // Sign-extend so NTSTATUS codes compare as negative numbers.
                Some(code) => Termination::ExitCode(i64::from(code as i32)),
                None => Termination::Unknown,
            })
        });
        match status {
            Some(None) => Liveness::Running,
            Some(Some(termination)) => Liveness::Exited(termination),
            None => Liveness::Exited(Termination::Unknown),
        }
    }

    fn sample(&self, identity: &ProcessIdentity) -> Result<ProcessSample, ProbeError> {
        let pid = identity.pid;
        let threads = snapshot_processes()?
            .into_iter()
            .find(|e| e.pid == pid)
            .map(|e| e.threads)
            .ok_or(ProbeError::NotFound { pid })?;

        self.with_handle(identity, |handle| {
            if handle.has_exited() {
                return Err(ProbeError::NotFound { pid });
            }
            let times = handle.times().ok_or(ProbeError::AccessDenied { pid })?;

            let mut counters: PROCESS_MEMORY_COUNTERS = unsafe { mem::zeroed() };
            counters.cb = mem::size_of::<PROCESS_MEMORY_COUNTERS>() as DWORD;
            let ok = unsafe { GetProcessMemoryInfo(handle.0, &mut counters, counters.cb) };
            if ok == 0 {
                return Err(ProbeError::AccessDenied { pid });
            }

            let mut handle_count: DWORD = 0;
            let handles_ok = unsafe { GetProcessHandleCount(handle.0, &mut handle_count) } != 0;

            Ok(ProcessSample {
                cpu_seconds: (times.kernel + times.user) as f64 / 10_000_000.0,
                rss_bytes: counters.WorkingSetSize as u64,
                vms_bytes: counters.PagefileUsage as u64,
                thread_count: threads,
                handle_count: handles_ok.then_some(handle_count),
            })
        })
        .unwrap_or(Err(ProbeError::NotFound { pid }))
    }

    fn total_memory_bytes(&self) -> Option<u64> {
        let mut status: MEMORYSTATUSEX = unsafe { mem::zeroed() };
        status.dwLength = mem::size_of::<MEMORYSTATUSEX>() as DWORD;
        let ok = unsafe { GlobalMemoryStatusEx(&mut status) };
        (ok != 0).then_some(status.ullTotalPhys)
    }

    fn forget(&self, identity: &ProcessIdentity) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.remove(identity);
    }
}
