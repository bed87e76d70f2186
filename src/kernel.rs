//! The kernel aggregate.
//!
//! One once-initialized instance holds the monotonic clock, the scheduler
//! state, the VCPU registry and reuse pool, and the finalizer machinery.
//! Initialization is lazy: the first call into the runtime boots it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use conquer_once::spin::OnceCell;
use crossbeam_queue::SegQueue;

use crate::clock::{self, MonotonicClock};
use crate::sched::vcpu::{SchedParams, Vcpu, VcpuKind, Vid};
use crate::sched::vcpu_pool::VcpuPool;
use crate::sched::waitqueue::WaitQueue;
use crate::sched::{Qos, SchedState, QOS_PRI_HIGHEST};

/// Group id shared by the boot thread of execution and adopted threads.
pub const VCPU_MAIN_GROUP: Vid = 1;

const BOOT_VID: Vid = 1;
const IDLE_VID: Vid = 2;

pub(crate) struct Kernel {
    pub(crate) clock: MonotonicClock,
    pub(crate) sched: spin::Mutex<SchedState>,
    pub(crate) registry: spin::Mutex<BTreeMap<Vid, Arc<Vcpu>>>,
    pub(crate) pool: VcpuPool,
    /// The boot VCPU's chore loop waits here.
    pub(crate) sched_wq: WaitQueue,
    /// Sleepers of `clock_nanosleep` wait here.
    pub(crate) sleep_wq: WaitQueue,
    /// Terminated VCPUs awaiting destruction by the boot VCPU.
    pub(crate) finalizer: SegQueue<Arc<Vcpu>>,
    next_vid: AtomicU32,
    next_groupid: AtomicU32,
}

impl Kernel {
    pub(crate) fn alloc_vid(&self) -> Vid {
        self.next_vid.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn alloc_groupid(&self) -> Vid {
        self.next_groupid.fetch_add(1, Ordering::Relaxed)
    }
}

static KERNEL: OnceCell<Kernel> = OnceCell::uninit();

pub(crate) fn try_kernel() -> Option<&'static Kernel> {
    KERNEL.get()
}

/// The kernel singleton; boots the runtime on first use.
pub(crate) fn kernel() -> &'static Kernel {
    KERNEL.get_or_init(|| {
        let boot = Vcpu::new(
            VcpuKind::Boot,
            SchedParams {
                qos: Qos::Realtime,
                priority: QOS_PRI_HIGHEST,
            },
            BOOT_VID,
            VCPU_MAIN_GROUP,
        );
        let idle = Vcpu::new(
            VcpuKind::Idle,
            SchedParams {
                qos: Qos::Idle,
                priority: 0,
            },
            IDLE_VID,
            VCPU_MAIN_GROUP,
        );

        let sched = SchedState::new(boot.clone(), idle.clone());

        let mut registry = BTreeMap::new();
        registry.insert(BOOT_VID, boot.clone());
        registry.insert(IDLE_VID, idle.clone());

        let k = Kernel {
            clock: MonotonicClock::new(),
            sched: spin::Mutex::new(sched),
            registry: spin::Mutex::new(registry),
            pool: VcpuPool::new(),
            sched_wq: WaitQueue::new(),
            sleep_wq: WaitQueue::new(),
            finalizer: SegQueue::new(),
            next_vid: AtomicU32::new(IDLE_VID + 1),
            next_groupid: AtomicU32::new(VCPU_MAIN_GROUP + 1),
        };

        // The spawned threads block on the kernel singleton until this
        // initializer returns.
        std::thread::Builder::new()
            .name("vpsched-boot".into())
            .spawn(move || {
                crate::sched::vcpu::install_current(boot);
                crate::sched::run_chores();
            })
            .expect("failed to spawn the boot vcpu thread");

        std::thread::Builder::new()
            .name("vpsched-idle".into())
            .spawn(move || {
                crate::sched::vcpu::install_current(idle);
                loop {
                    std::thread::park();
                }
            })
            .expect("failed to spawn the idle vcpu thread");

        clock::start_tick_thread();

        log::info!("vpsched kernel booted");
        k
    })
}

/// Boots the runtime eagerly. Optional; the first call into any API boots it
/// lazily.
pub fn init() {
    let _ = kernel();
}
