//! A preemptive virtual-processor scheduler with a dispatch-queue layer on
//! top, as a hosted runtime.
//!
//! Two tiers make up the execution substrate:
//!
//! - The **scheduler** ([`sched`]): priority-ordered ready queues over
//!   virtual processors (VCPUs), wait queues as the one blocking primitive,
//!   signal delivery, wait timeouts, quantum-driven preemption and
//!   cooperative yielding. Each VCPU is backed by a host thread; the single
//!   virtual CPU is modeled by the scheduler's bookkeeping.
//! - The **dispatcher** ([`dispatch`]): multiplexes submitted work items,
//!   timers and signal monitors over an elastic pool of worker VCPUs, with
//!   QoS-derived scheduling parameters, suspension, cancellation and orderly
//!   termination.
//!
//! The runtime boots lazily on first use; [`init`] boots it eagerly.
//!
//! ```no_run
//! use vpsched::dispatch::{DispatchAttr, Dispatcher};
//!
//! let dq = Dispatcher::create(DispatchAttr::default()).unwrap();
//! dq.run_async(|| println!("hello from a worker vcpu")).unwrap();
//! let answer = dq.run_sync(|| 42).unwrap();
//! assert_eq!(answer, 42);
//! ```

pub mod clock;
pub mod dispatch;
pub mod errno;
mod kernel;
pub mod process;
pub mod sched;
pub mod signal;
pub mod syscall;

pub use clock::{Ticks, When};
pub use errno::{Errno, KResult};
pub use kernel::{init, VCPU_MAIN_GROUP};
pub use sched::vcpu::{Mcontext, SchedParams, Vcpu, VcpuAcquireAttr, VcpuState, Vid};
pub use sched::waitqueue::{WaitQueue, WakeupFlags, Wres};
pub use sched::Qos;
pub use signal::{SigInfo, SigNo, SigSet};
