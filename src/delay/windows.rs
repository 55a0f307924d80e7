#![allow(unsafe_code)] /* ntdll exports require unsafe */

/*
 *     ______   __  __     __         ______     ______
 *    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
 *    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
 *     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
 *      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
 *
 * Author: Colin MacRitchie / Ripple Group
 */
/* Windows delay via ntdll!NtDelayExecution */
use parking_lot::Mutex;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use windows_sys::Win32::{
    Foundation::{
        BOOLEAN, NTSTATUS, STATUS_ALERTED, STATUS_INVALID_PARAMETER, STATUS_SUCCESS,
        STATUS_TIMEOUT, STATUS_USER_APC,
    },
    System::LibraryLoader::{GetModuleHandleW, GetProcAddress},
};

use super::{Calibratable, CallProbe, DelayError, PreciseDelay, sample_granularity};
use crate::config::DelayConfig;
use crate::interval::DelayInterval;

/// `NTSTATUS NtDelayExecution(BOOLEAN Alertable, PLARGE_INTEGER DelayInterval)`
type NtDelayExecutionFn =
    unsafe extern "system" fn(alertable: BOOLEAN, delay_interval: *mut i64) -> NTSTATUS;

/// `NTSTATUS NtSetTimerResolution(ULONG DesiredResolution, BOOLEAN SetResolution, PULONG CurrentResolution)`
type NtSetTimerResolutionFn =
    unsafe extern "system" fn(desired: u32, set: BOOLEAN, current: *mut u32) -> NTSTATUS;

type RawProc = unsafe extern "system" fn() -> isize;

const SYMBOL: &str = "ntdll!NtDelayExecution";
const TIMER_SYMBOL: &str = "ntdll!NtSetTimerResolution";

/* Timer interrupt period requested while any provider is alive, in 100ns units (0.5ms) */
const TIMER_RESOLUTION_TICKS: u32 = 5_000;

/// Resolved entry points, `None` if ntdll does not export them
static NT_DELAY_EXECUTION: OnceLock<Option<NtDelayExecutionFn>> = OnceLock::new();
static NT_SET_TIMER_RESOLUTION: OnceLock<Option<NtSetTimerResolutionFn>> = OnceLock::new();

/* Live providers holding the raised timer resolution */
static RESOLUTION_HOLDERS: Mutex<usize> = Mutex::new(0);

/// Looks up an ntdll export by its NUL-terminated name
fn ntdll_proc(name: &'static [u8]) -> Option<RawProc> {
    let module_name: Vec<u16> = "ntdll.dll".encode_utf16().chain(Some(0)).collect();

    // SAFETY: module_name is NUL-terminated UTF-16. ntdll is mapped into every
    // process, so the handle needs no reference counting.
    let module = unsafe { GetModuleHandleW(module_name.as_ptr()) };
    if module.is_null() {
        #[cfg(feature = "tracing")]
        tracing::warn!("ntdll.dll is not loaded");
        return None;
    }

    // SAFETY: valid module handle and NUL-terminated ASCII symbol name
    let symbol = unsafe { GetProcAddress(module, name.as_ptr()) };

    #[cfg(feature = "tracing")]
    {
        let symbol_name = String::from_utf8_lossy(&name[..name.len() - 1]);
        if symbol.is_some() {
            tracing::debug!(symbol = %symbol_name, "ntdll entry point resolved");
        } else {
            tracing::warn!(symbol = %symbol_name, "ntdll entry point missing");
        }
    }

    symbol
}

/// Resolves `NtDelayExecution` once per process
fn resolve() -> Option<NtDelayExecutionFn> {
    *NT_DELAY_EXECUTION.get_or_init(|| {
        // SAFETY: every NT release exporting NtDelayExecution uses this signature
        ntdll_proc(b"NtDelayExecution\0")
            .map(|proc| unsafe { std::mem::transmute::<RawProc, NtDelayExecutionFn>(proc) })
    })
}

/// Resolves `NtSetTimerResolution` once per process
fn resolve_timer_resolution() -> Option<NtSetTimerResolutionFn> {
    *NT_SET_TIMER_RESOLUTION.get_or_init(|| {
        // SAFETY: every NT release exporting NtSetTimerResolution uses this signature
        ntdll_proc(b"NtSetTimerResolution\0")
            .map(|proc| unsafe { std::mem::transmute::<RawProc, NtSetTimerResolutionFn>(proc) })
    })
}

/// Keeps the system timer interrupt at [`TIMER_RESOLUTION_TICKS`]
///
/// `NtDelayExecution` wakes on the timer interrupt, which defaults to 15.6ms. The
/// request is per process, so holders are counted and the last one to drop restores it.
#[derive(Debug)]
struct TimerResolution {
    set_timer_resolution: NtSetTimerResolutionFn,
}

impl TimerResolution {
    fn acquire() -> Result<Self, DelayError> {
        let set_timer_resolution =
            resolve_timer_resolution().ok_or(DelayError::Unavailable(TIMER_SYMBOL))?;

        let mut holders = RESOLUTION_HOLDERS.lock();
        if *holders == 0 {
            let mut current = 0u32;

            // SAFETY: resolved from ntdll with a matching signature; current is a live ULONG
            let status = unsafe { set_timer_resolution(TIMER_RESOLUTION_TICKS, 1, &mut current) };
            if status < 0 {
                return Err(DelayError::NativeFailure {
                    status: i64::from(status),
                });
            }

            #[cfg(feature = "tracing")]
            tracing::debug!(
                requested_100ns = TIMER_RESOLUTION_TICKS,
                current_100ns = current,
                "Timer resolution raised"
            );
        }
        *holders += 1;

        Ok(Self { set_timer_resolution })
    }
}

impl Drop for TimerResolution {
    fn drop(&mut self) {
        let mut holders = RESOLUTION_HOLDERS.lock();
        *holders = holders.saturating_sub(1);

        if *holders == 0 {
            let mut current = 0u32;

            // SAFETY: same entry point and argument contract as in acquire
            let _status = unsafe { (self.set_timer_resolution)(TIMER_RESOLUTION_TICKS, 0, &mut current) };

            #[cfg(feature = "tracing")]
            tracing::debug!(status = _status, current_100ns = current, "Timer resolution restored");
        }
    }
}

/// Maps a status returned by `NtDelayExecution`
///
/// Timeout and wake-by-APC are both success; callers cannot tell them apart.
fn map_status(status: NTSTATUS, raw: i64) -> Result<(), DelayError> {
    match status {
        STATUS_SUCCESS | STATUS_TIMEOUT | STATUS_ALERTED | STATUS_USER_APC => Ok(()),
        STATUS_INVALID_PARAMETER => Err(DelayError::InvalidParameter(format!(
            "NtDelayExecution rejected interval {raw}"
        ))),
        other => Err(DelayError::NativeFailure {
            status: i64::from(other),
        }),
    }
}

/// Windows delay provider using `NtDelayExecution`
#[derive(Debug)]
pub struct WindowsDelay {
    /// Resolved native entry point
    nt_delay_execution: NtDelayExecutionFn,
    /// Raised timer interrupt period, released on drop
    _resolution: TimerResolution,
    /// Samples per calibration run
    calibration_samples: usize,
    /// Calibrated granularity in nanoseconds
    granularity_ns: AtomicU64,
}

impl WindowsDelay {
    /// Creates a new Windows delay provider
    ///
    /// # Errors
    ///
    /// Returns [`DelayError::Unavailable`] if ntdll does not export `NtDelayExecution`
    /// or `NtSetTimerResolution`, and [`DelayError::NativeFailure`] if the timer
    /// resolution cannot be raised.
    pub fn new(config: &DelayConfig) -> Result<Self, DelayError> {
        let nt_delay_execution = resolve().ok_or(DelayError::Unavailable(SYMBOL))?;
        let resolution = TimerResolution::acquire()?;

        Ok(Self {
            nt_delay_execution,
            _resolution: resolution,
            calibration_samples: config.calibration_samples,
            granularity_ns: AtomicU64::new(0),
        })
    }

    /// Issues the native wait without tracing or metrics
    #[inline]
    fn delay_raw(&self, interval: DelayInterval, alertable: bool) -> Result<(), DelayError> {
        let mut raw = interval.as_raw();

        // SAFETY: the entry point was resolved from ntdll with a matching signature and
        // `raw` is a live LARGE_INTEGER for the duration of the call.
        let status = unsafe { (self.nt_delay_execution)(BOOLEAN::from(alertable), &mut raw) };

        map_status(status, interval.as_raw())
    }
}

impl PreciseDelay for WindowsDelay {
    #[inline]
    fn delay(&self, interval: DelayInterval, alertable: bool) -> Result<(), DelayError> {
        let probe = CallProbe::start(self.platform_name(), interval, alertable);
        let result = self.delay_raw(interval, alertable);
        probe.finish(&result);
        result
    }

    #[inline]
    fn calibrated_granularity_ns(&self) -> u64 {
        self.granularity_ns.load(Ordering::Relaxed)
    }

    fn platform_name(&self) -> &'static str {
        "Windows (NtDelayExecution)"
    }
}

impl Calibratable for WindowsDelay {
    fn calibrate(&mut self) -> Result<(), DelayError> {
        let granularity = self.measure_granularity()?;
        self.granularity_ns.store(granularity, Ordering::Relaxed);
        Ok(())
    }

    fn measure_granularity(&self) -> Result<u64, DelayError> {
        // One tick is the smallest relative request the kernel accepts
        let minimal = DelayInterval::from_raw(-1);
        sample_granularity(self.calibration_samples, || self.delay_raw(minimal, false))
    }
}
