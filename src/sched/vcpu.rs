//! Virtual processors.
//!
//! A VCPU is the schedulable unit: a saved machine context, a kernel stack
//! (here: the backing host thread), optional user stack, scheduling state
//! and a pending-signal set. VCPUs are acquired from a reuse pool, run one
//! entry closure, and relinquish themselves back into the pool when done.
//!
//! Host threads that call into the runtime without having been acquired are
//! adopted on first contact, the same way the boot thread of execution is
//! grandfathered in at startup.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI32, AtomicIsize, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use crate::clock::{self, Ticks, TICKS_INFINITY};
use crate::errno::{Errno, KResult};
use crate::kernel::{kernel, VCPU_MAIN_GROUP};
use crate::signal::{SigSet, SIGKILL, SIGVPDS, SIGVPRQ};

use super::waitqueue::{WaitQueue, Wres};
use super::{
    qos_quantum, Qos, SchedState, QOS_PRI_COUNT, QOS_PRI_HIGHEST, QOS_PRI_LOWEST,
    SCHED_PRI_HIGHEST, SCHED_PRI_LOWEST,
};

pub type Vid = u32;

/// Scheduling state of a VCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VcpuState {
    /// Created but never configured.
    Initiated = 0,
    /// Runnable, sitting on a ready FIFO.
    Ready,
    /// Owns the virtual CPU.
    Running,
    /// Blocked on a wait queue.
    Waiting,
    /// Taken off the CPU until resumed.
    Suspended,
    /// Queued for finalization.
    Terminating,
}

/// What backs a VCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VcpuKind {
    /// The startup VCPU; runs the scheduler chores.
    Boot,
    /// Scheduled when nothing else is ready.
    Idle,
    /// Pool-managed VCPU with its own trampoline thread.
    Scheduled,
    /// A foreign host thread grandfathered into the runtime.
    Adopted,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct VcpuFlags: u8 {
        /// Owned by user space.
        const USER_OWNED = 0x02;
        /// Currently assigned to an owner (not pooled).
        const ACQUIRED = 0x04;
    }
}

/// QoS category plus intra-QoS priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedParams {
    pub qos: Qos,
    pub priority: i8,
}

impl Default for SchedParams {
    fn default() -> Self {
        SchedParams {
            qos: Qos::Utility,
            priority: super::QOS_PRI_DEFAULT,
        }
    }
}

/// Saved pseudo machine context, readable and writable while the VCPU is
/// suspended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Mcontext {
    pub pc: u64,
    pub sp: u64,
    pub usp: u64,
    pub arg: u64,
    pub sr: u16,
}

/// Execution image: machine context plus the stack geometry.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ExecImage {
    pub mcontext: Mcontext,
    pub kernel_stack: usize,
    pub user_stack: usize,
}

/// Wait-timeout descriptor linked into the scheduler's timeout queue.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimeoutEntry {
    pub deadline: Ticks,
    pub valid: bool,
}

/// Mutable scheduler-owned portion of a VCPU. Only mutated while holding the
/// scheduler lock; the spin lock makes the aliasing explicit and cheap.
pub(crate) struct VcpuCell {
    pub state: VcpuState,
    pub qos: Qos,
    pub qos_priority: i8,
    pub sched_priority: u8,
    pub effective_priority: u8,
    pub priority_bias: i8,
    pub quantum_countdown: i32,
    pub on_ready_queue: bool,

    pub pending_sigs: SigSet,
    pub sigmask: SigSet,
    pub wait_sigs: SigSet,

    pub timeout: TimeoutEntry,
    pub waiting_on: Option<WaitQueue>,
    pub wait_start_time: Ticks,
    pub wakeup_reason: Option<Wres>,

    pub suspension_count: i16,
    pub suspension_time: Ticks,
    pub in_sigurgent: bool,
}

/// Run permit for the backing thread. Parked VCPUs block here; wake and
/// resume edges grant exactly one permit.
pub(crate) struct Gate {
    open: parking_lot::Mutex<bool>,
    cv: parking_lot::Condvar,
}

impl Gate {
    fn new() -> Gate {
        Gate {
            open: parking_lot::Mutex::new(false),
            cv: parking_lot::Condvar::new(),
        }
    }

    /// Parks until a permit is granted, then consumes it.
    pub(crate) fn block(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cv.wait(&mut open);
        }
        *open = false;
    }

    /// Grants the permit.
    pub(crate) fn open(&self) {
        let mut open = self.open.lock();
        *open = true;
        self.cv.notify_one();
    }
}

type EntryFn = Box<dyn FnOnce() + Send + 'static>;

pub struct Vcpu {
    id: AtomicU32,
    groupid: AtomicU32,
    kind: VcpuKind,
    flags: AtomicU8,
    uerrno: AtomicI32,
    udata: AtomicIsize,
    pub(crate) sched: spin::Mutex<VcpuCell>,
    pub(crate) ctx: spin::Mutex<ExecImage>,
    pub(crate) entry: spin::Mutex<Option<EntryFn>>,
    pub(crate) gate: Gate,
}

impl Vcpu {
    pub(crate) fn new(kind: VcpuKind, params: SchedParams, id: Vid, groupid: Vid) -> Arc<Vcpu> {
        let mut cell = VcpuCell {
            state: VcpuState::Initiated,
            qos: params.qos,
            qos_priority: params.priority,
            sched_priority: 0,
            effective_priority: 0,
            priority_bias: 0,
            quantum_countdown: qos_quantum(params.qos),
            on_ready_queue: false,
            pending_sigs: SigSet::EMPTY,
            sigmask: SigSet::ALL,
            wait_sigs: SigSet::EMPTY,
            timeout: TimeoutEntry {
                deadline: TICKS_INFINITY,
                valid: false,
            },
            waiting_on: None,
            wait_start_time: 0,
            wakeup_reason: None,
            suspension_count: 0,
            suspension_time: 0,
            in_sigurgent: false,
        };
        sched_params_changed(&mut cell);

        Arc::new(Vcpu {
            id: AtomicU32::new(id),
            groupid: AtomicU32::new(groupid),
            kind,
            flags: AtomicU8::new(0),
            uerrno: AtomicI32::new(0),
            udata: AtomicIsize::new(0),
            sched: spin::Mutex::new(cell),
            ctx: spin::Mutex::new(ExecImage::default()),
            entry: spin::Mutex::new(None),
            gate: Gate::new(),
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(params: SchedParams) -> Arc<Vcpu> {
        Vcpu::new(VcpuKind::Scheduled, params, 0, 0)
    }

    pub fn id(&self) -> Vid {
        self.id.load(Ordering::Acquire)
    }

    pub fn group_id(&self) -> Vid {
        self.groupid.load(Ordering::Acquire)
    }

    pub fn state(&self) -> VcpuState {
        self.sched.lock().state
    }

    pub fn errno(&self) -> i32 {
        self.uerrno.load(Ordering::Acquire)
    }

    pub fn set_errno(&self, err: i32) {
        self.uerrno.store(err, Ordering::Release);
    }

    pub fn data(&self) -> isize {
        self.udata.load(Ordering::Acquire)
    }

    pub fn set_data(&self, data: isize) {
        self.udata.store(data, Ordering::Release);
    }

    pub(crate) fn kind(&self) -> VcpuKind {
        self.kind
    }

    pub(crate) fn flags(&self) -> VcpuFlags {
        VcpuFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_flags(&self, flags: VcpuFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    pub fn is_user(&self) -> bool {
        self.flags().contains(VcpuFlags::USER_OWNED)
    }

    fn set_id(&self, id: Vid, groupid: Vid) {
        self.id.store(id, Ordering::Release);
        self.groupid.store(groupid, Ordering::Release);
    }
}

/// Derives the absolute and effective priority from QoS, intra-QoS priority
/// and the transient bias. The idle band has a single priority level.
pub(crate) fn sched_params_changed(c: &mut VcpuCell) {
    if c.qos > Qos::Idle {
        let sp = ((c.qos as i32 - 1) * QOS_PRI_COUNT as i32)
            + (c.qos_priority as i32 - QOS_PRI_LOWEST as i32)
            + 1;
        let eff = (sp + c.priority_bias as i32)
            .clamp(SCHED_PRI_LOWEST as i32 + 1, SCHED_PRI_HIGHEST as i32);
        c.sched_priority = sp as u8;
        c.effective_priority = eff as u8;
    } else {
        c.sched_priority = SCHED_PRI_LOWEST;
        c.effective_priority = SCHED_PRI_LOWEST;
    }
}

/// Shrinks a negative priority bias by `prop` toward zero.
pub(crate) fn reduce_sched_penalty(c: &mut VcpuCell, prop: i8) {
    if c.priority_bias < 0 {
        let bias = c.priority_bias.saturating_add(prop);
        c.priority_bias = bias.min(0);
        sched_params_changed(c);
    }
}

// ---------------------------------------------------------------------------
// Current VCPU
// ---------------------------------------------------------------------------

struct CurrentSlot(RefCell<Option<Arc<Vcpu>>>);

impl Drop for CurrentSlot {
    fn drop(&mut self) {
        // Adopted threads unregister themselves when the host thread dies.
        if let Some(vp) = self.0.borrow_mut().take() {
            if vp.kind() == VcpuKind::Adopted {
                if let Some(k) = crate::kernel::try_kernel() {
                    let id = vp.id();
                    if id != 0 {
                        k.registry.lock().remove(&id);
                    }
                }
                vp.sched.lock().state = VcpuState::Terminating;
            }
        }
    }
}

thread_local! {
    static CURRENT: CurrentSlot = CurrentSlot(RefCell::new(None));
}

pub(crate) fn install_current(vp: Arc<Vcpu>) {
    CURRENT.with(|c| *c.0.borrow_mut() = Some(vp));
}

/// The VCPU executing the caller. A host thread that was never acquired is
/// adopted on first use.
pub fn current() -> Arc<Vcpu> {
    if let Some(vp) = CURRENT.with(|c| c.0.borrow().clone()) {
        return vp;
    }
    adopt_current()
}

pub fn current_id() -> Vid {
    current().id()
}

fn adopt_current() -> Arc<Vcpu> {
    let k = kernel();
    let id = k.alloc_vid();
    let vp = Vcpu::new(VcpuKind::Adopted, SchedParams::default(), id, VCPU_MAIN_GROUP);
    vp.sched.lock().state = VcpuState::Running;
    vp.set_flags(VcpuFlags::ACQUIRED);
    k.registry.lock().insert(id, vp.clone());
    install_current(vp.clone());
    log::debug!("adopted host thread as vcpu {}", id);
    vp
}

// ---------------------------------------------------------------------------
// Acquire / relinquish
// ---------------------------------------------------------------------------

/// Configuration for [`acquire`].
pub struct VcpuAcquireAttr {
    pub func: EntryFn,
    /// Kernel stack size; 0 selects the default.
    pub kernel_stack_size: usize,
    pub user_stack_size: usize,
    pub is_user: bool,
    /// Group to place the VCPU in; 0 selects the main group.
    pub groupid: Vid,
    pub params: SchedParams,
    pub data: isize,
}

pub const VCPU_DEFAULT_KERNEL_STACK_SIZE: usize = 256 * 1024;

fn validate_params(params: &SchedParams) -> KResult<()> {
    if params.qos < Qos::Background || params.qos > Qos::Realtime {
        return Err(Errno::Inval);
    }
    if params.priority < QOS_PRI_LOWEST || params.priority > QOS_PRI_HIGHEST {
        return Err(Errno::Inval);
    }
    Ok(())
}

/// Obtains a VCPU, preferring the reuse pool over a fresh allocation, and
/// configures it with the given entry closure and scheduling parameters. The
/// returned VCPU is suspended; resume it to start execution.
pub fn acquire(attr: VcpuAcquireAttr) -> KResult<Arc<Vcpu>> {
    validate_params(&attr.params)?;
    let k = kernel();

    let mut vp = match k.pool.checkout() {
        Some(vp) => vp,
        None => spawn_fresh(&attr)?,
    };

    // A pool hit may hand back a VCPU that has not finished entering the
    // suspended state yet. Ownership transfers only once it has. A cached
    // VCPU that got killed while parked is replaced by a fresh one.
    loop {
        match vp.state() {
            VcpuState::Suspended => break,
            VcpuState::Terminating => {
                vp = spawn_fresh(&attr)?;
            }
            _ => std::thread::yield_now(),
        }
    }

    let kernel_stack = if attr.kernel_stack_size == 0 {
        VCPU_DEFAULT_KERNEL_STACK_SIZE
    } else {
        attr.kernel_stack_size
    };
    {
        let mut img = vp.ctx.lock();
        *img = ExecImage {
            mcontext: Mcontext {
                pc: 0,
                sp: kernel_stack as u64,
                usp: attr.user_stack_size as u64,
                arg: attr.data as u64,
                sr: 0,
            },
            kernel_stack,
            user_stack: attr.user_stack_size,
        };
    }
    *vp.entry.lock() = Some(attr.func);
    set_sched_params(&vp, attr.params)?;

    let mut flags = VcpuFlags::ACQUIRED;
    if attr.is_user {
        flags |= VcpuFlags::USER_OWNED;
    }
    vp.set_flags(flags);

    let id = k.alloc_vid();
    let groupid = if attr.groupid == 0 {
        VCPU_MAIN_GROUP
    } else {
        attr.groupid
    };
    vp.set_id(id, groupid);
    vp.set_errno(0);
    vp.set_data(attr.data);
    k.registry.lock().insert(id, vp.clone());

    log::debug!("acquired vcpu {} (group {})", id, groupid);
    Ok(vp)
}

fn spawn_fresh(attr: &VcpuAcquireAttr) -> KResult<Arc<Vcpu>> {
    let vp = Vcpu::new(VcpuKind::Scheduled, attr.params, 0, 0);
    {
        // Fresh VCPUs go straight from initiated into suspended state.
        let mut c = vp.sched.lock();
        c.state = VcpuState::Suspended;
        c.suspension_count = 1;
    }

    let thread_vp = vp.clone();
    std::thread::Builder::new()
        .name("vpsched-vcpu".into())
        .stack_size(VCPU_DEFAULT_KERNEL_STACK_SIZE)
        .spawn(move || vcpu_main(thread_vp))
        .map_err(|_| Errno::NoMem)?;

    Ok(vp)
}

/// Panic payload used to drive a VCPU thread back to its trampoline.
struct VcpuAbort {
    relinquish: bool,
}

enum RunOutcome {
    Done,
    Relinquish,
    Killed,
}

fn run_entry(vp: &Arc<Vcpu>, f: EntryFn) -> RunOutcome {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => RunOutcome::Done,
        Err(payload) => match payload.downcast::<VcpuAbort>() {
            Ok(abort) => {
                if abort.relinquish {
                    RunOutcome::Relinquish
                } else {
                    RunOutcome::Killed
                }
            }
            Err(_) => {
                log::error!("vcpu {} entry panicked", vp.id());
                RunOutcome::Done
            }
        },
    }
}

/// Trampoline of every pool-managed VCPU thread. Runs entry closures until
/// the pool rejects the VCPU or it is killed, then queues itself for
/// finalization.
fn vcpu_main(vp: Arc<Vcpu>) {
    install_current(vp.clone());
    vp.gate.block();

    loop {
        let f = vp.entry.lock().take();
        let Some(f) = f else {
            // Resumed without a closure: either a kill raced the pool or the
            // resume was spurious.
            if crate::sched::vcpu_signal::sigpending(&vp).has(SIGKILL) {
                break;
            }
            vp.gate.block();
            continue;
        };

        match run_entry(&vp, f) {
            RunOutcome::Killed => break,
            RunOutcome::Done | RunOutcome::Relinquish => {
                if !relinquish_for_reuse(&vp) {
                    break;
                }
            }
        }
    }

    unregister(&vp);
    super::terminate_current(&vp);
    log::debug!("vcpu thread exiting");
}

fn unregister(vp: &Arc<Vcpu>) {
    let old = vp.id.swap(0, Ordering::AcqRel);
    if old != 0 {
        kernel().registry.lock().remove(&old);
    }
}

/// Clears the VCPU's identity and checks it back into the pool. Parks until
/// reacquired; returns `false` when the pool is full and the VCPU must be
/// terminated instead.
fn relinquish_for_reuse(vp: &Arc<Vcpu>) -> bool {
    unregister(vp);
    vp.groupid.store(0, Ordering::Release);
    vp.set_errno(0);
    vp.set_data(0);
    vp.set_flags(VcpuFlags::empty());
    {
        let _s = super::lock();
        let mut c = vp.sched.lock();
        c.pending_sigs = SigSet::EMPTY;
        c.priority_bias = 0;
        sched_params_changed(&mut c);
    }

    if kernel().pool.checkin(vp.clone()) {
        log::trace!("vcpu parked in the reuse pool");
        let _ = suspend(vp);
        true
    } else {
        false
    }
}

/// Relinquishes the calling VCPU. For pool-managed VCPUs this does not
/// return; the thread unwinds to its trampoline which recycles or destroys
/// it. Adopted threads cannot relinquish and get `EPERM`.
pub fn relinquish_current() -> KResult<()> {
    let vp = current();
    if vp.kind() != VcpuKind::Scheduled {
        return Err(Errno::Perm);
    }
    panic::panic_any(VcpuAbort { relinquish: true });
}

// ---------------------------------------------------------------------------
// Suspend / resume
// ---------------------------------------------------------------------------

/// Suspends `vp`, counting nested requests. Suspending the calling VCPU
/// takes effect immediately; suspending another VCPU is deferred to its next
/// preemption point via the deferred-suspend signal.
pub fn suspend(vp: &Arc<Vcpu>) -> KResult<()> {
    let self_suspend = CURRENT
        .with(|c| c.0.borrow().clone())
        .map(|cur| Arc::ptr_eq(&cur, vp))
        .unwrap_or(false);

    let mut s = super::lock();
    {
        let c = vp.sched.lock();
        if c.state == VcpuState::Terminating
            || vp.kind() == VcpuKind::Boot
            || vp.kind() == VcpuKind::Idle
        {
            return Err(Errno::Srch);
        }
        if !vp.is_user() && !(c.state == VcpuState::Initiated || self_suspend) {
            // No involuntary suspension of kernel-owned VCPUs.
            return Err(Errno::Perm);
        }
        if c.suspension_count == i16::MAX {
            return Err(Errno::Inval);
        }
    }

    let mut c = vp.sched.lock();
    if c.state == VcpuState::Suspended || c.pending_sigs.has(SIGVPDS) {
        // Already suspended or a request is in flight; just nest.
        c.suspension_count += 1;
        return Ok(());
    }
    if c.state == VcpuState::Initiated {
        c.suspension_count += 1;
        c.state = VcpuState::Suspended;
        return Ok(());
    }
    if self_suspend {
        c.suspension_count += 1;
        c.state = VcpuState::Suspended;
        c.suspension_time = clock::now();
        drop(c);
        s.reschedule_away_from(vp);
        drop(s);
        vp.gate.block();
        return Ok(());
    }

    // Some other VCPU in ready, running or waiting state: defer.
    c.suspension_count += 1;
    drop(c);
    drop(s);
    let _ = crate::sched::vcpu_signal::sigsend(vp, SIGVPDS);
    Ok(())
}

/// Acts on a pending deferred-suspend request. Called at preemption points;
/// parks the calling thread until the matching resume.
pub(crate) fn do_pending_deferred_suspend(vp: &Arc<Vcpu>) {
    if !vp.sched.lock().pending_sigs.has(SIGVPDS) {
        return;
    }

    let mut s = super::lock();
    let park = {
        let mut c = vp.sched.lock();
        if c.pending_sigs.has(SIGVPDS) && c.suspension_count > 0 {
            c.pending_sigs.remove(SIGVPDS);
            c.state = VcpuState::Suspended;
            c.suspension_time = clock::now();
            true
        } else {
            c.pending_sigs.remove(SIGVPDS);
            false
        }
    };
    if park {
        s.reschedule_away_from(vp);
        drop(s);
        vp.gate.block();
    }
}

pub(crate) fn resume_locked(s: &mut SchedState, vp: &Arc<Vcpu>, force: bool) {
    let mut c = vp.sched.lock();
    c.pending_sigs.remove(SIGVPDS);

    if c.suspension_count == 0 {
        return;
    }
    if force {
        c.suspension_count = 0;
    } else {
        c.suspension_count -= 1;
    }
    if c.suspension_count != 0 {
        return;
    }

    if c.priority_bias < 0 {
        let prop = -c.priority_bias;
        reduce_sched_penalty(&mut c, prop);
    }

    let parked = c.state == VcpuState::Suspended
        || (c.state == VcpuState::Ready && !c.on_ready_queue);
    if !parked {
        // Deferred request withdrawn before the target ever parked.
        return;
    }

    if vp.kind() == VcpuKind::Adopted {
        c.state = VcpuState::Running;
        drop(c);
        vp.gate.open();
        return;
    }

    let eff = c.effective_priority;
    drop(c);
    s.add_vcpu_locked(vp, eff);
    vp.gate.open();
}

/// Resumes `vp`. With `force`, the suspension count is zeroed; otherwise it
/// is decremented, and the VCPU becomes runnable when it reaches zero.
/// Resuming a VCPU that is not suspended is a no-op.
pub fn resume(vp: &Arc<Vcpu>, force: bool) {
    let mut s = super::lock();
    resume_locked(&mut s, vp, force);
}

pub fn suspended(vp: &Arc<Vcpu>) -> bool {
    let c = vp.sched.lock();
    c.suspension_count > 0
}

/// Reads or writes the machine context of a VCPU that is suspended or about
/// to become so. `EBUSY` if the target is neither.
pub fn rw_mcontext(vp: &Arc<Vcpu>, ctx: &mut Mcontext, is_read: bool) -> KResult<()> {
    loop {
        {
            let _s = super::lock();
            let c = vp.sched.lock();
            let quiesced = c.state == VcpuState::Suspended
                || (c.state == VcpuState::Waiting && c.pending_sigs.has(SIGVPDS));
            if quiesced {
                let mut img = vp.ctx.lock();
                if is_read {
                    *ctx = img.mcontext;
                } else {
                    img.mcontext = *ctx;
                }
                return Ok(());
            }
            if !c.pending_sigs.has(SIGVPDS) {
                return Err(Errno::Busy);
            }
        }
        yield_now();
    }
}

// ---------------------------------------------------------------------------
// Yield and urgent delivery
// ---------------------------------------------------------------------------

/// Yields the remainder of the current quantum.
pub fn yield_now() {
    let vp = current();
    check_urgent(&vp);
    do_pending_deferred_suspend(&vp);

    let mut s = super::lock();
    let is_model_running = Arc::ptr_eq(&s.running, &vp);
    if is_model_running && vp.state() == VcpuState::Running {
        {
            let mut c = vp.sched.lock();
            if c.priority_bias < 0 {
                let half = -c.priority_bias / 2;
                reduce_sched_penalty(&mut c, half);
            }
        }
        let eff = vp.sched.lock().effective_priority;
        s.add_vcpu_locked(&vp, eff);
        if let Some(next) = s.highest_priority_ready() {
            s.switch_to(&next);
        }
    }
    drop(s);
    std::thread::yield_now();
}

/// Delivers pending kill/relinquish requests by unwinding the calling VCPU
/// thread to its trampoline. Only pool-managed VCPUs unwind; everything else
/// observes the request through error returns. Must be called without any
/// runtime lock held.
pub(crate) fn check_urgent(vp: &Arc<Vcpu>) {
    if vp.kind() != VcpuKind::Scheduled || !vp.flags().contains(VcpuFlags::ACQUIRED) {
        return;
    }
    let (kill, relinquish) = {
        let mut c = vp.sched.lock();
        let kill = c.pending_sigs.has(SIGKILL);
        let rq = c.pending_sigs.has(SIGVPRQ);
        if rq {
            c.pending_sigs.remove(SIGVPRQ);
        }
        (kill, rq)
    };
    if kill {
        log::debug!("vcpu {} aborting on kill request", vp.id());
        panic::panic_any(VcpuAbort { relinquish: false });
    }
    if relinquish {
        log::debug!("vcpu {} honoring relinquish request", vp.id());
        panic::panic_any(VcpuAbort { relinquish: true });
    }
}

// ---------------------------------------------------------------------------
// Scheduling parameters
// ---------------------------------------------------------------------------

pub fn get_sched_params(vp: &Arc<Vcpu>) -> SchedParams {
    let c = vp.sched.lock();
    SchedParams {
        qos: c.qos,
        priority: c.qos_priority,
    }
}

/// Current effective priority, including transient boosts and penalties.
pub fn get_current_priority(vp: &Arc<Vcpu>) -> u8 {
    vp.sched.lock().effective_priority
}

/// Changes QoS and intra-QoS priority. A ready VCPU is re-queued at its new
/// priority; a running one additionally gets a fresh quantum.
pub fn set_sched_params(vp: &Arc<Vcpu>, params: SchedParams) -> KResult<()> {
    validate_params(&params)?;

    let mut s = super::lock();
    let state = {
        let c = vp.sched.lock();
        if c.qos == params.qos && c.qos_priority == params.priority {
            return Ok(());
        }
        c.state
    };

    match state {
        VcpuState::Initiated
        | VcpuState::Running
        | VcpuState::Waiting
        | VcpuState::Suspended => {
            let mut c = vp.sched.lock();
            c.qos = params.qos;
            c.qos_priority = params.priority;
            if state == VcpuState::Running {
                c.quantum_countdown = qos_quantum(c.qos);
            }
            sched_params_changed(&mut c);
        }
        VcpuState::Ready => {
            s.remove_vcpu_locked(vp);
            let eff = {
                let mut c = vp.sched.lock();
                c.qos = params.qos;
                c.qos_priority = params.priority;
                sched_params_changed(&mut c);
                c.effective_priority
            };
            s.add_vcpu_locked(vp, eff);
        }
        VcpuState::Terminating => return Err(Errno::Srch),
    }
    Ok(())
}
