//! Syscall surface.
//!
//! A flat dispatch table maps syscall numbers to typed unpack functions.
//! Each unpack function validates its raw arguments, invokes the handler
//! and reports through the classic convention: calls flagged `errno` return
//! `0` or `-1` with the code stored in the VCPU's errno slot, the rest
//! return their value directly. Urgent signals are handled on the common
//! return path.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::{self, When};
use crate::errno::{Errno, KResult};
use crate::process;
use crate::sched::vcpu::{self, Mcontext, SchedParams, Vcpu, VcpuState, Vid};
use crate::sched::vcpu_signal;
use crate::sched::waitqueue::{WaitQueue, WakeupFlags};
use crate::sched::Qos;
use crate::signal::{SigInfo, SigNo, SigSet, SIGKILL, SIGSET_URGENT, SIGSUSPEND};

/// Seconds/nanoseconds pair used at the syscall boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TimeSpec {
    pub sec: i64,
    pub nsec: i64,
}

impl TimeSpec {
    pub fn from_duration(d: Duration) -> TimeSpec {
        TimeSpec {
            sec: d.as_secs() as i64,
            nsec: d.subsec_nanos() as i64,
        }
    }

    pub fn to_duration(self) -> Option<Duration> {
        if self.sec < 0 || !(0..1_000_000_000).contains(&self.nsec) {
            return None;
        }
        Some(Duration::new(self.sec as u64, self.nsec as u32))
    }
}

/// Scheduling parameters at the syscall boundary.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct UserSchedParams {
    pub qos: i32,
    pub priority: i32,
}

/// VCPU acquisition record at the syscall boundary.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct UserVcpuAttr {
    pub func: fn(usize),
    pub arg: usize,
    pub stack_size: usize,
    pub groupid: Vid,
    pub qos: i32,
    pub priority: i32,
    pub data: isize,
}

/// Target scopes of `sigsend`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SigScope {
    Vcpu = 0,
    VcpuGroup = 1,
    Proc = 2,
    ProcGroup = 3,
    Session = 4,
    Children = 5,
}

impl SigScope {
    fn from_raw(raw: usize) -> Option<SigScope> {
        match raw {
            0 => Some(SigScope::Vcpu),
            1 => Some(SigScope::VcpuGroup),
            2 => Some(SigScope::Proc),
            3 => Some(SigScope::ProcGroup),
            4 => Some(SigScope::Session),
            5 => Some(SigScope::Children),
            _ => None,
        }
    }
}

pub const MONOTONIC_CLOCK: usize = 0;

/// `timedwait`-style flag: the timespec is an absolute monotonic time.
pub const WAIT_ABSTIME: usize = 2;

/// Syscall numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Sysno {
    ClockGettime = 0,
    ClockNanosleep = 1,
    ClockGetres = 2,
    SigWait = 3,
    SigTimedwait = 4,
    SigPending = 5,
    SigSend = 6,
    SigUrgent = 7,
    WqCreate = 8,
    WqDispose = 9,
    WqWait = 10,
    WqTimedwait = 11,
    WqWakeup = 12,
    WqWakeupThenTimedwait = 13,
    VcpuErrno = 14,
    VcpuGetid = 15,
    VcpuGetgrp = 16,
    VcpuGetdata = 17,
    VcpuSetdata = 18,
    VcpuAcquire = 19,
    VcpuRelinquishSelf = 20,
    VcpuSuspend = 21,
    VcpuResume = 22,
    VcpuYield = 23,
    VcpuRwMcontext = 24,
    VcpuGetschedparams = 25,
    VcpuSetschedparams = 26,
}

type SysFn = fn(&Arc<Vcpu>, &[usize; 4]) -> KResult<isize>;

struct SysEntry {
    f: SysFn,
    errno: bool,
}

const fn e(f: SysFn) -> SysEntry {
    SysEntry { f, errno: true }
}

const fn v(f: SysFn) -> SysEntry {
    SysEntry { f, errno: false }
}

static TABLE: [SysEntry; 27] = [
    e(sc_clock_gettime),
    e(sc_clock_nanosleep),
    e(sc_clock_getres),
    e(sc_sigwait),
    e(sc_sigtimedwait),
    e(sc_sigpending),
    e(sc_sigsend),
    v(sc_sigurgent),
    e(sc_wq_create),
    e(sc_wq_dispose),
    e(sc_wq_wait),
    e(sc_wq_timedwait),
    e(sc_wq_wakeup),
    e(sc_wq_wakeup_then_timedwait),
    v(sc_vcpu_errno),
    v(sc_vcpu_getid),
    v(sc_vcpu_getgrp),
    v(sc_vcpu_getdata),
    v(sc_vcpu_setdata),
    e(sc_vcpu_acquire),
    v(sc_vcpu_relinquish_self),
    e(sc_vcpu_suspend),
    e(sc_vcpu_resume),
    v(sc_vcpu_yield),
    e(sc_vcpu_rw_mcontext),
    e(sc_vcpu_getschedparams),
    e(sc_vcpu_setschedparams),
];

/// Entry point. Unknown numbers report `ENOSYS` through the errno slot.
pub fn syscall(no: u32, args: [usize; 4]) -> isize {
    let vp = vcpu::current();

    let (res, has_errno) = if (no as usize) < TABLE.len() {
        let entry = &TABLE[no as usize];
        ((entry.f)(&vp, &args), entry.errno)
    } else {
        (Err(Errno::NoSys), true)
    };

    if vcpu_signal::sigpending(&vp).intersects(SIGSET_URGENT) {
        handle_urgent_signals(&vp);
    }

    if has_errno {
        match res {
            Ok(_) => 0,
            Err(err) => {
                vp.set_errno(err.as_raw());
                -1
            }
        }
    } else {
        res.unwrap_or(0)
    }
}

/// Consumes urgent pending signals on the syscall return: a kill request
/// terminates the VCPU, a suspend request suspends it.
fn handle_urgent_signals(vp: &Arc<Vcpu>) {
    let sigs = {
        let _s = crate::sched::lock();
        let mut c = vp.sched.lock();
        let sigs = c.pending_sigs.intersect(SIGSET_URGENT);
        c.pending_sigs = c.pending_sigs.difference(SIGSET_URGENT);
        c.in_sigurgent = false;
        sigs
    };

    if sigs.has(SIGKILL) {
        vp.sched.lock().pending_sigs.insert(SIGKILL);
        vcpu::check_urgent(vp);
        // Adopted threads cannot unwind; the kill stays pending.
        return;
    }
    if sigs.has(SIGSUSPEND) {
        let _ = vcpu::suspend(vp);
    }
}

fn user_when(flags: usize, ts: TimeSpec) -> KResult<When> {
    let d = ts.to_duration().ok_or(Errno::Inval)?;
    if flags & WAIT_ABSTIME != 0 {
        Ok(When::At(clock::ticks_from_duration(d)))
    } else {
        Ok(When::In(d))
    }
}

// Pointer-argument helpers. The syscall boundary deals in raw addresses;
// validation is a null check plus the type discipline of the unpackers.

unsafe fn out_ref<'a, T>(addr: usize) -> KResult<&'a mut T> {
    if addr == 0 {
        return Err(Errno::Inval);
    }
    Ok(unsafe { &mut *(addr as *mut T) })
}

unsafe fn in_ref<'a, T>(addr: usize) -> KResult<&'a T> {
    if addr == 0 {
        return Err(Errno::Inval);
    }
    Ok(unsafe { &*(addr as *const T) })
}

// -- Clock ----------------------------------------------------------------

fn sc_clock_gettime(_vp: &Arc<Vcpu>, args: &[usize; 4]) -> KResult<isize> {
    if args[0] != MONOTONIC_CLOCK {
        return Err(Errno::Inval);
    }
    let out = unsafe { out_ref::<TimeSpec>(args[1])? };
    *out = TimeSpec::from_duration(clock::duration_from_ticks(clock::now()));
    Ok(0)
}

fn sc_clock_nanosleep(_vp: &Arc<Vcpu>, args: &[usize; 4]) -> KResult<isize> {
    if args[0] != MONOTONIC_CLOCK {
        return Err(Errno::Inval);
    }
    let wtp = unsafe { in_ref::<TimeSpec>(args[2])? };
    let when = user_when(args[1], *wtp)?;

    let mut rem = Duration::ZERO;
    let res = process::nanosleep(when, Some(&mut rem));
    if res == Err(Errno::Intr) && args[3] != 0 {
        let rmtp = unsafe { out_ref::<TimeSpec>(args[3])? };
        *rmtp = TimeSpec::from_duration(rem);
    }
    res.map(|_| 0)
}

fn sc_clock_getres(_vp: &Arc<Vcpu>, args: &[usize; 4]) -> KResult<isize> {
    if args[0] != MONOTONIC_CLOCK {
        return Err(Errno::Inval);
    }
    let out = unsafe { out_ref::<TimeSpec>(args[1])? };
    *out = TimeSpec::from_duration(clock::resolution());
    Ok(0)
}

// -- Signals --------------------------------------------------------------

static SIGWAIT_WQ: conquer_once::spin::OnceCell<WaitQueue> = conquer_once::spin::OnceCell::uninit();

fn sigwait_wq() -> &'static WaitQueue {
    SIGWAIT_WQ.get_or_init(WaitQueue::new)
}

fn sc_sigwait(_vp: &Arc<Vcpu>, args: &[usize; 4]) -> KResult<isize> {
    let set = SigSet::from_bits(args[0] as u32);
    let out = unsafe { out_ref::<SigInfo>(args[1])? };
    *out = vcpu_signal::sigwait(sigwait_wq(), set)?;
    Ok(0)
}

fn sc_sigtimedwait(_vp: &Arc<Vcpu>, args: &[usize; 4]) -> KResult<isize> {
    let set = SigSet::from_bits(args[0] as u32);
    let wtp = unsafe { in_ref::<TimeSpec>(args[2])? };
    let when = user_when(args[1], *wtp)?;
    let out = unsafe { out_ref::<SigInfo>(args[3])? };
    *out = vcpu_signal::sigtimedwait(sigwait_wq(), set, when)?;
    Ok(0)
}

fn sc_sigpending(vp: &Arc<Vcpu>, args: &[usize; 4]) -> KResult<isize> {
    let out = unsafe { out_ref::<u32>(args[0])? };
    *out = vcpu_signal::sigpending(vp).bits();
    Ok(0)
}

fn sc_sigsend(vp: &Arc<Vcpu>, args: &[usize; 4]) -> KResult<isize> {
    let scope = SigScope::from_raw(args[0]).ok_or(Errno::Inval)?;
    let id = args[1] as Vid;
    let signo = args[2] as SigNo;

    match scope {
        SigScope::Vcpu => {
            let target = if id == 0 {
                vp.clone()
            } else {
                process::vcpu_by_id(id)?
            };
            vcpu_signal::sigsend(&target, signo)?;
        }
        SigScope::VcpuGroup => {
            process::sigsend_group(id, signo)?;
        }
        // One kernel process: the process-wide scopes coincide.
        SigScope::Proc | SigScope::ProcGroup | SigScope::Session => {
            let targets: Vec<Arc<Vcpu>> = process::all_vcpus();
            for t in targets {
                vcpu_signal::sigsend(&t, signo)?;
            }
        }
        SigScope::Children => return Err(Errno::Srch),
    }
    Ok(0)
}

fn sc_sigurgent(_vp: &Arc<Vcpu>, _args: &[usize; 4]) -> KResult<isize> {
    // Nothing to do here: the common return path handles urgent signals.
    Ok(0)
}

// -- User wait queues -----------------------------------------------------

fn sc_wq_create(_vp: &Arc<Vcpu>, args: &[usize; 4]) -> KResult<isize> {
    let out = unsafe { out_ref::<i32>(args[1])? };
    *out = process::wq_create(args[0] as i32)?;
    Ok(0)
}

fn sc_wq_dispose(_vp: &Arc<Vcpu>, args: &[usize; 4]) -> KResult<isize> {
    process::wq_dispose(args[0] as i32).map(|_| 0)
}

fn sc_wq_wait(_vp: &Arc<Vcpu>, args: &[usize; 4]) -> KResult<isize> {
    process::wq_wait(args[0] as i32).map(|_| 0)
}

fn sc_wq_timedwait(_vp: &Arc<Vcpu>, args: &[usize; 4]) -> KResult<isize> {
    let wtp = unsafe { in_ref::<TimeSpec>(args[2])? };
    let when = user_when(args[1], *wtp)?;
    process::wq_timedwait(args[0] as i32, when, None).map(|_| 0)
}

fn sc_wq_wakeup(_vp: &Arc<Vcpu>, args: &[usize; 4]) -> KResult<isize> {
    let flags = if args[1] != 0 {
        WakeupFlags::ONE
    } else {
        WakeupFlags::empty()
    };
    process::wq_wakeup(args[0] as i32, flags).map(|_| 0)
}

fn sc_wq_wakeup_then_timedwait(_vp: &Arc<Vcpu>, args: &[usize; 4]) -> KResult<isize> {
    let wtp = unsafe { in_ref::<TimeSpec>(args[3])? };
    let d = wtp.to_duration().ok_or(Errno::Inval)?;
    process::wq_wakeup_then_timedwait(args[0] as i32, args[1] as i32, When::In(d)).map(|_| 0)
}

// -- VCPUs ----------------------------------------------------------------

fn sc_vcpu_errno(vp: &Arc<Vcpu>, _args: &[usize; 4]) -> KResult<isize> {
    Ok(vp.errno() as isize)
}

fn sc_vcpu_getid(vp: &Arc<Vcpu>, _args: &[usize; 4]) -> KResult<isize> {
    Ok(vp.id() as isize)
}

fn sc_vcpu_getgrp(vp: &Arc<Vcpu>, _args: &[usize; 4]) -> KResult<isize> {
    Ok(vp.group_id() as isize)
}

fn sc_vcpu_getdata(vp: &Arc<Vcpu>, _args: &[usize; 4]) -> KResult<isize> {
    Ok(vp.data())
}

fn sc_vcpu_setdata(vp: &Arc<Vcpu>, args: &[usize; 4]) -> KResult<isize> {
    vp.set_data(args[0] as isize);
    Ok(0)
}

fn sc_vcpu_acquire(_vp: &Arc<Vcpu>, args: &[usize; 4]) -> KResult<isize> {
    let attr = unsafe { in_ref::<UserVcpuAttr>(args[0])? };
    let id_out = unsafe { out_ref::<Vid>(args[1])? };

    let qos = Qos::from_raw(attr.qos as u8).ok_or(Errno::Inval)?;
    if !(i8::MIN as i32..=i8::MAX as i32).contains(&attr.priority) {
        return Err(Errno::Inval);
    }

    let func = attr.func;
    let arg = attr.arg;
    let new = vcpu::acquire(vcpu::VcpuAcquireAttr {
        func: Box::new(move || func(arg)),
        kernel_stack_size: attr.stack_size,
        user_stack_size: attr.stack_size,
        is_user: true,
        groupid: attr.groupid,
        params: SchedParams {
            qos,
            priority: attr.priority as i8,
        },
        data: attr.data,
    })?;
    *id_out = new.id();
    Ok(0)
}

fn sc_vcpu_relinquish_self(vp: &Arc<Vcpu>, _args: &[usize; 4]) -> KResult<isize> {
    vcpu::relinquish_current().map(|_| 0).or_else(|_| {
        log::warn!("vcpu {} cannot relinquish (not pool-managed)", vp.id());
        Ok(0)
    })
}

fn sc_vcpu_suspend(vp: &Arc<Vcpu>, args: &[usize; 4]) -> KResult<isize> {
    let target = if args[0] == 0 {
        vp.clone()
    } else {
        process::vcpu_by_id(args[0] as Vid)?
    };
    vcpu::suspend(&target).map(|_| 0)
}

fn sc_vcpu_resume(_vp: &Arc<Vcpu>, args: &[usize; 4]) -> KResult<isize> {
    let target = process::vcpu_by_id(args[0] as Vid)?;
    vcpu::resume(&target, false);
    Ok(0)
}

fn sc_vcpu_yield(_vp: &Arc<Vcpu>, _args: &[usize; 4]) -> KResult<isize> {
    vcpu::yield_now();
    Ok(0)
}

fn sc_vcpu_rw_mcontext(_vp: &Arc<Vcpu>, args: &[usize; 4]) -> KResult<isize> {
    let target = process::vcpu_by_id(args[0] as Vid)?;
    let ctx = unsafe { out_ref::<Mcontext>(args[1])? };
    vcpu::rw_mcontext(&target, ctx, args[2] != 0).map(|_| 0)
}

fn sc_vcpu_getschedparams(vp: &Arc<Vcpu>, args: &[usize; 4]) -> KResult<isize> {
    let target = if args[0] == 0 {
        vp.clone()
    } else {
        process::vcpu_by_id(args[0] as Vid)?
    };
    if target.state() == VcpuState::Terminating {
        return Err(Errno::Srch);
    }
    let out = unsafe { out_ref::<UserSchedParams>(args[1])? };
    let params = vcpu::get_sched_params(&target);
    *out = UserSchedParams {
        qos: params.qos as i32,
        priority: params.priority as i32,
    };
    Ok(0)
}

fn sc_vcpu_setschedparams(vp: &Arc<Vcpu>, args: &[usize; 4]) -> KResult<isize> {
    let target = if args[0] == 0 {
        vp.clone()
    } else {
        process::vcpu_by_id(args[0] as Vid)?
    };
    let raw = unsafe { in_ref::<UserSchedParams>(args[1])? };
    let qos = Qos::from_raw(raw.qos as u8).ok_or(Errno::Inval)?;
    if !(i8::MIN as i32..=i8::MAX as i32).contains(&raw.priority) {
        return Err(Errno::Inval);
    }
    vcpu::set_sched_params(
        &target,
        SchedParams {
            qos,
            priority: raw.priority as i8,
        },
    )
    .map(|_| 0)
}
