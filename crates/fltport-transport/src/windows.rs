//! Filter manager backend (`fltlib`).
//!
//! Ports are opened with `FilterConnectCommunicationPort`; fetches are
//! overlapped `FilterGetMessage` calls whose completions arrive on an I/O
//! completion port shared by every worker. A worker that dequeues another
//! worker's completion parks it for the owner to pick up on its next wait.

use std::collections::HashMap;
use std::ffi::c_void;
use std::iter;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, HANDLE};
use windows_sys::Win32::Storage::InstallableFileSystems::{
    FilterAggregateStandardInformation, FilterAttach, FilterConnectCommunicationPort,
    FilterDetach, FilterFindClose, FilterFindFirst, FilterFindNext, FilterGetMessage, FilterLoad,
    FilterReplyMessage, FilterSendMessage, FilterUnload, FILTER_MESSAGE_HEADER,
    FILTER_REPLY_HEADER,
};
use windows_sys::Win32::System::IO::{
    CancelIoEx, CreateIoCompletionPort, GetOverlappedResult, GetQueuedCompletionStatus,
    OVERLAPPED,
};

use crate::error::{Result, TransportError};
use crate::manager::{FilterInfo, FilterManager};
use crate::traits::{CommunicationPort, CompletionPort, FetchRequest, FilterTransport, WaitStatus};

/// `FILTER_MESSAGE_HEADER` / `FILTER_REPLY_HEADER` size on the wire.
const NATIVE_HEADER_SIZE: usize = 16;

const WAIT_TIMEOUT: u32 = 258;
const ERROR_NOT_FOUND: u32 = 1168;
const HRESULT_IO_PENDING: i32 = 0x8007_03E5_u32 as i32;
const HRESULT_NO_MORE_ITEMS: i32 = 0x8007_0103_u32 as i32;
const HRESULT_INSUFFICIENT_BUFFER: i32 = 0x8007_007A_u32 as i32;

const FLTFL_ASI_IS_MINIFILTER: u32 = 0x1;
const FLTFL_ASI_IS_LEGACYFILTER: u32 = 0x2;

fn hresult_from_win32(code: u32) -> i32 {
    if code == 0 {
        0
    } else {
        ((code & 0xFFFF) | 0x8007_0000) as i32
    }
}

// Win32 errors wrapped in an HRESULT map back to their code so io::Error
// can classify them.
fn win32_from_hresult(hr: i32) -> i32 {
    if (hr as u32) & 0xFFFF_0000 == 0x8007_0000 {
        (hr as u32 & 0xFFFF) as i32
    } else {
        hr
    }
}

fn check(op: &'static str, hr: i32) -> Result<()> {
    if hr < 0 {
        Err(TransportError::Native { op, status: hr })
    } else {
        Ok(())
    }
}

fn last_error(op: &'static str) -> TransportError {
    // SAFETY: reads the calling thread's last-error value.
    let code = unsafe { GetLastError() };
    TransportError::Native {
        op,
        status: hresult_from_win32(code),
    }
}

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(iter::once(0)).collect()
}

/// 8-byte aligned scratch for structures beginning with a `u64` field.
fn aligned(bytes: usize) -> Vec<u64> {
    vec![0u64; bytes.div_ceil(8)]
}

fn as_bytes(storage: &[u64]) -> &[u8] {
    // SAFETY: any u64 slice is a valid, initialized byte slice of 8x length.
    unsafe { std::slice::from_raw_parts(storage.as_ptr().cast::<u8>(), storage.len() * 8) }
}

fn as_bytes_mut(storage: &mut [u64]) -> &mut [u8] {
    // SAFETY: as above; the borrow is exclusive.
    unsafe { std::slice::from_raw_parts_mut(storage.as_mut_ptr().cast::<u8>(), storage.len() * 8) }
}

struct RawHandle(HANDLE);

// SAFETY: kernel handles are process-wide and usable from any thread.
unsafe impl Send for RawHandle {}
unsafe impl Sync for RawHandle {}

/// Storage the kernel writes into while a fetch is outstanding.
#[repr(C)]
struct NativeFetch {
    overlapped: OVERLAPPED,
    storage: Vec<u64>,
}

// SAFETY: the OVERLAPPED is only touched by the kernel and the owning port.
unsafe impl Send for NativeFetch {}

#[derive(Clone, Copy)]
struct Parked {
    bytes: u32,
    error: u32,
}

struct PortShared {
    handle: RawHandle,
    closed: AtomicBool,
    in_flight: Mutex<HashMap<u64, Box<NativeFetch>>>,
    parked: Mutex<HashMap<u64, Parked>>,
    // Cancelled fetches whose completion packet may still be queued.
    retired: Mutex<HashMap<u64, Box<NativeFetch>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PortShared {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn release(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(TransportError::Closed);
        }
        // SAFETY: the handle was returned by FilterConnectCommunicationPort and
        // is closed exactly once, guarded by `closed`.
        let ok = unsafe { CloseHandle(self.handle.0) };
        lock(&self.retired).clear();
        if ok == 0 {
            return Err(last_error("CloseHandle"));
        }
        Ok(())
    }
}

/// Transport over the Windows filter manager.
#[derive(Debug, Default, Clone, Copy)]
pub struct FilterManagerTransport;

impl FilterManagerTransport {
    pub fn new() -> Self {
        Self
    }
}

impl FilterTransport for FilterManagerTransport {
    type Port = FilterPort;
    type Completion = FilterCompletion;

    fn connect(&self, port_name: &str) -> Result<FilterPort> {
        let name = to_wide(port_name);
        let mut handle: HANDLE = ptr::null_mut();
        // SAFETY: `name` is NUL-terminated and outlives the call; no context or
        // security attributes are passed; `handle` is a valid out pointer.
        let hr = unsafe {
            FilterConnectCommunicationPort(
                name.as_ptr(),
                0,
                ptr::null(),
                0,
                ptr::null(),
                &mut handle,
            )
        };
        if hr < 0 {
            return Err(TransportError::Connect {
                name: port_name.to_string(),
                source: std::io::Error::from_raw_os_error(win32_from_hresult(hr)),
            });
        }
        debug!(port = port_name, "filter port connected");
        Ok(FilterPort {
            shared: Arc::new(PortShared {
                handle: RawHandle(handle),
                closed: AtomicBool::new(false),
                in_flight: Mutex::new(HashMap::new()),
                parked: Mutex::new(HashMap::new()),
                retired: Mutex::new(HashMap::new()),
            }),
        })
    }

    fn bind_completion(&self, port: &FilterPort, concurrency: usize) -> Result<FilterCompletion> {
        port.shared.ensure_open()?;
        let threads = u32::try_from(concurrency).unwrap_or(u32::MAX);
        // SAFETY: associates the open port handle with a new completion port.
        let handle =
            unsafe { CreateIoCompletionPort(port.shared.handle.0, ptr::null_mut(), 0, threads) };
        if handle.is_null() {
            return Err(last_error("CreateIoCompletionPort"));
        }
        Ok(FilterCompletion {
            handle: RawHandle(handle),
            port: Arc::clone(&port.shared),
            closed: AtomicBool::new(false),
        })
    }

    fn transport_name(&self) -> &'static str {
        "filter-manager"
    }
}

/// Connected filter communication port.
pub struct FilterPort {
    shared: Arc<PortShared>,
}

impl CommunicationPort for FilterPort {
    fn send_message(&self, command: &[u8], response: &mut [u8]) -> Result<usize> {
        self.shared.ensure_open()?;
        let mut returned = 0u32;
        let (out_ptr, out_len) = if response.is_empty() {
            (ptr::null_mut(), 0)
        } else {
            (response.as_mut_ptr().cast::<c_void>(), response.len() as u32)
        };
        // SAFETY: both buffers are valid for the lengths passed and outlive
        // the synchronous call.
        let hr = unsafe {
            FilterSendMessage(
                self.shared.handle.0,
                command.as_ptr().cast::<c_void>(),
                command.len() as u32,
                out_ptr,
                out_len,
                &mut returned,
            )
        };
        check("FilterSendMessage", hr)?;
        Ok(returned as usize)
    }

    fn get_message(&self, request: &mut FetchRequest) -> Result<()> {
        self.shared.ensure_open()?;
        let mut native = Box::new(NativeFetch {
            // SAFETY: OVERLAPPED is plain data and must start zeroed.
            overlapped: unsafe { mem::zeroed() },
            storage: aligned(NATIVE_HEADER_SIZE + request.capacity()),
        });
        let overlapped: *mut OVERLAPPED = &mut native.overlapped;
        let buffer = native.storage.as_mut_ptr().cast::<FILTER_MESSAGE_HEADER>();
        let buffer_len = (native.storage.len() * 8) as u32;
        let token = overlapped as usize as u64;

        request.begin(token)?;
        lock(&self.shared.in_flight).insert(token, native);

        // SAFETY: the boxed storage and OVERLAPPED stay at a fixed address in
        // `in_flight` (or `retired`) until the completion is consumed or the
        // port is closed.
        let hr = unsafe { FilterGetMessage(self.shared.handle.0, buffer, buffer_len, overlapped) };
        if hr < 0 && hr != HRESULT_IO_PENDING {
            lock(&self.shared.in_flight).remove(&token);
            request.abandon();
            return Err(TransportError::Native {
                op: "FilterGetMessage",
                status: hr,
            });
        }
        Ok(())
    }

    fn reply_message(&self, request: &FetchRequest, reply: &[u8]) -> Result<()> {
        self.shared.ensure_open()?;
        let total = NATIVE_HEADER_SIZE + reply.len();
        let mut storage = aligned(total);
        let header = FILTER_REPLY_HEADER {
            Status: 0,
            MessageId: request.message_key(),
        };
        // SAFETY: `storage` is 8-byte aligned and at least header-sized.
        unsafe { ptr::write(storage.as_mut_ptr().cast::<FILTER_REPLY_HEADER>(), header) };
        as_bytes_mut(&mut storage)[NATIVE_HEADER_SIZE..total].copy_from_slice(reply);

        // SAFETY: the reply buffer is valid for `total` bytes during the call.
        let hr = unsafe {
            FilterReplyMessage(
                self.shared.handle.0,
                storage.as_ptr().cast::<FILTER_REPLY_HEADER>(),
                total as u32,
            )
        };
        check("FilterReplyMessage", hr)
    }

    fn cancel_io(&self, request: &mut FetchRequest) -> Result<()> {
        if !request.is_pending() {
            return Ok(());
        }
        let token = request.token();
        let native = lock(&self.shared.in_flight).remove(&token);
        request.abandon();
        let Some(native) = native else {
            return Ok(());
        };
        let overlapped: *const OVERLAPPED = &native.overlapped;

        // SAFETY: `overlapped` identifies an I/O issued on this handle.
        let ok = unsafe { CancelIoEx(self.shared.handle.0, overlapped) };
        if ok == 0 {
            // SAFETY: reads the calling thread's last-error value.
            let code = unsafe { GetLastError() };
            if code != ERROR_NOT_FOUND {
                lock(&self.shared.retired).insert(token, native);
                return Err(TransportError::Native {
                    op: "CancelIoEx",
                    status: hresult_from_win32(code),
                });
            }
        }

        let mut transferred = 0u32;
        // SAFETY: blocks until the cancelled I/O has settled so the kernel no
        // longer writes into `native`.
        unsafe { GetOverlappedResult(self.shared.handle.0, overlapped, &mut transferred, 1) };

        if lock(&self.shared.parked).remove(&token).is_none() {
            // The completion packet is still queued; keep the storage alive
            // until it is drained or the port closes.
            lock(&self.shared.retired).insert(token, native);
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.shared.release()
    }
}

impl Drop for FilterPort {
    fn drop(&mut self) {
        if !self.shared.closed.load(Ordering::Acquire) {
            if let Err(err) = self.shared.release() {
                warn!(%err, "failed to close filter port on drop");
            }
        }
    }
}

/// I/O completion port bound to a [`FilterPort`].
pub struct FilterCompletion {
    handle: RawHandle,
    port: Arc<PortShared>,
    closed: AtomicBool,
}

impl FilterCompletion {
    fn finish(&self, request: &mut FetchRequest, parked: Parked) -> Result<WaitStatus> {
        let token = request.token();
        let Some(native) = lock(&self.port.in_flight).remove(&token) else {
            request.abandon();
            return Err(TransportError::Closed);
        };
        if parked.error != 0 {
            request.abandon();
            return Err(TransportError::Native {
                op: "FilterGetMessage",
                status: hresult_from_win32(parked.error),
            });
        }

        let raw = as_bytes(&native.storage);
        let total = (parked.bytes as usize).clamp(NATIVE_HEADER_SIZE, raw.len());
        let mut key = [0u8; 8];
        key.copy_from_slice(&raw[8..16]);
        request.complete(u64::from_le_bytes(key), &raw[NATIVE_HEADER_SIZE..total])?;
        Ok(WaitStatus::Completed)
    }

    fn reap(&self, token: u64) {
        if lock(&self.port.retired).remove(&token).is_some() {
            lock(&self.port.parked).remove(&token);
        }
    }

    fn release(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(TransportError::Closed);
        }
        // SAFETY: the completion port handle is closed exactly once.
        if unsafe { CloseHandle(self.handle.0) } == 0 {
            return Err(last_error("CloseHandle"));
        }
        Ok(())
    }
}

impl CompletionPort for FilterCompletion {
    fn wait(&self, request: &mut FetchRequest, timeout: Duration) -> Result<WaitStatus> {
        if !request.is_pending() {
            return Err(TransportError::RequestState {
                op: "wait",
                state: request.state(),
            });
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let token = request.token();
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(parked) = lock(&self.port.parked).remove(&token) {
                return self.finish(request, parked);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let millis = u32::try_from(remaining.as_millis()).unwrap_or(u32::MAX - 1);
            let mut bytes = 0u32;
            let mut key = 0usize;
            let mut overlapped: *mut OVERLAPPED = ptr::null_mut();

            // SAFETY: all out pointers are valid locals.
            let ok = unsafe {
                GetQueuedCompletionStatus(
                    self.handle.0,
                    &mut bytes,
                    &mut key,
                    &mut overlapped,
                    millis,
                )
            };

            if overlapped.is_null() {
                if ok == 0 {
                    // SAFETY: reads the calling thread's last-error value.
                    let code = unsafe { GetLastError() };
                    if code == WAIT_TIMEOUT {
                        return Ok(WaitStatus::TimedOut);
                    }
                    return Err(TransportError::Native {
                        op: "GetQueuedCompletionStatus",
                        status: hresult_from_win32(code),
                    });
                }
                continue;
            }

            let error = if ok == 0 {
                // SAFETY: reads the calling thread's last-error value.
                unsafe { GetLastError() }
            } else {
                0
            };
            let completed = overlapped as usize as u64;
            let parked = Parked { bytes, error };
            if completed == token {
                return self.finish(request, parked);
            }

            lock(&self.port.parked).insert(completed, parked);
            self.reap(completed);
            if Instant::now() >= deadline {
                return Ok(WaitStatus::TimedOut);
            }
        }
    }

    fn close(&self) -> Result<()> {
        self.release()
    }
}

impl Drop for FilterCompletion {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(err) = self.release() {
                warn!(%err, "failed to close completion port on drop");
            }
        }
    }
}

/// [`FilterManager`] over `fltlib`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FltLib;

impl FltLib {
    pub fn new() -> Self {
        Self
    }
}

fn optional_wide(s: Option<&str>) -> Option<Vec<u16>> {
    s.map(to_wide)
}

fn wide_ptr(s: &Option<Vec<u16>>) -> *const u16 {
    s.as_ref().map_or(ptr::null(), |w| w.as_ptr())
}

fn read_wide(entry: &[u8], offset: usize, len: usize) -> String {
    let Some(bytes) = entry.get(offset..offset + len) else {
        return String::new();
    };
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

fn u16_at(b: &[u8], at: usize) -> usize {
    u16::from_le_bytes([b[at], b[at + 1]]) as usize
}

fn u32_at(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

/// Parse one `FILTER_AGGREGATE_STANDARD_INFORMATION` chain.
fn parse_aggregate(buf: &[u8], out: &mut Vec<FilterInfo>) {
    let mut offset = 0usize;
    loop {
        let entry = &buf[offset..];
        if entry.len() < 28 {
            return;
        }
        let next = u32_at(entry, 0) as usize;
        let flags = u32_at(entry, 4);
        if flags & FLTFL_ASI_IS_MINIFILTER != 0 {
            out.push(FilterInfo {
                frame_id: u32_at(entry, 12),
                instance_count: u32_at(entry, 16),
                name: read_wide(entry, u16_at(entry, 22), u16_at(entry, 20)),
                altitude: read_wide(entry, u16_at(entry, 26), u16_at(entry, 24)),
            });
        } else if flags & FLTFL_ASI_IS_LEGACYFILTER != 0 {
            out.push(FilterInfo {
                frame_id: 0,
                instance_count: 0,
                name: read_wide(entry, u16_at(entry, 14), u16_at(entry, 12)),
                altitude: read_wide(entry, u16_at(entry, 18), u16_at(entry, 16)),
            });
        }
        if next == 0 || offset + next >= buf.len() {
            return;
        }
        offset += next;
    }
}

impl FilterManager for FltLib {
    fn load(&self, name: &str) -> Result<()> {
        let name = to_wide(name);
        // SAFETY: NUL-terminated string valid for the call.
        check("FilterLoad", unsafe { FilterLoad(name.as_ptr()) })
    }

    fn unload(&self, name: &str) -> Result<()> {
        let name = to_wide(name);
        // SAFETY: NUL-terminated string valid for the call.
        check("FilterUnload", unsafe { FilterUnload(name.as_ptr()) })
    }

    fn attach(&self, name: &str, volume: &str, instance: Option<&str>) -> Result<String> {
        let name = to_wide(name);
        let volume = to_wide(volume);
        let instance = optional_wide(instance);
        let mut created = [0u16; 256];
        // SAFETY: all strings are NUL-terminated; `created` is writable for
        // the byte size passed.
        let hr = unsafe {
            FilterAttach(
                name.as_ptr(),
                volume.as_ptr(),
                wide_ptr(&instance),
                (created.len() * 2) as u32,
                created.as_mut_ptr(),
            )
        };
        check("FilterAttach", hr)?;
        let end = created.iter().position(|c| *c == 0).unwrap_or(created.len());
        Ok(String::from_utf16_lossy(&created[..end]))
    }

    fn detach(&self, name: &str, volume: &str, instance: Option<&str>) -> Result<()> {
        let name = to_wide(name);
        let volume = to_wide(volume);
        let instance = optional_wide(instance);
        // SAFETY: all strings are NUL-terminated and valid for the call.
        let hr = unsafe { FilterDetach(name.as_ptr(), volume.as_ptr(), wide_ptr(&instance)) };
        check("FilterDetach", hr)
    }

    fn enumerate(&self) -> Result<Vec<FilterInfo>> {
        let mut filters = Vec::new();
        let mut storage = aligned(1024);
        let mut returned = 0u32;
        let mut find: HANDLE = ptr::null_mut();

        let mut hr = loop {
            // SAFETY: `storage` is writable for the size passed; `find` is a
            // valid out pointer.
            let hr = unsafe {
                FilterFindFirst(
                    FilterAggregateStandardInformation,
                    storage.as_mut_ptr().cast::<c_void>(),
                    (storage.len() * 8) as u32,
                    &mut returned,
                    &mut find,
                )
            };
            if hr == HRESULT_INSUFFICIENT_BUFFER {
                storage = aligned(storage.len() * 16);
                continue;
            }
            break hr;
        };
        if hr == HRESULT_NO_MORE_ITEMS {
            return Ok(filters);
        }
        check("FilterFindFirst", hr)?;

        loop {
            parse_aggregate(&as_bytes(&storage)[..returned as usize], &mut filters);
            // SAFETY: `find` was opened by FilterFindFirst above.
            hr = unsafe {
                FilterFindNext(
                    find,
                    FilterAggregateStandardInformation,
                    storage.as_mut_ptr().cast::<c_void>(),
                    (storage.len() * 8) as u32,
                    &mut returned,
                )
            };
            if hr == HRESULT_INSUFFICIENT_BUFFER {
                storage = aligned(storage.len() * 16);
                continue;
            }
            if hr < 0 {
                break;
            }
        }

        // SAFETY: closes the enumeration handle opened above.
        unsafe { FilterFindClose(find) };
        if hr != HRESULT_NO_MORE_ITEMS {
            check("FilterFindNext", hr)?;
        }
        Ok(filters)
    }
}
