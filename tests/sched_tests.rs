//! Scheduler-level integration tests: wait queues, timeouts, signal
//! delivery, suspend/resume and preemption, exercised on the live runtime.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use vpsched::sched::{self, vcpu, vcpu_signal};
use vpsched::signal::{SIGUSR1, SIGUSR2};
use vpsched::{Errno, Qos, SchedParams, SigSet, VcpuAcquireAttr, WaitQueue, WakeupFlags, When};

fn poll_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

#[test]
fn wait_returns_on_explicit_wakeup() {
    vpsched::init();
    let wq = WaitQueue::new();
    let woken = Arc::new(AtomicBool::new(false));

    let wq2 = wq.clone();
    let woken2 = woken.clone();
    let waiter = thread::spawn(move || {
        wq2.wait(None).expect("wait should end with a wakeup");
        woken2.store(true, Ordering::Release);
    });

    assert!(poll_until(Duration::from_secs(2), || wq.waiter_count() == 1));
    assert!(!woken.load(Ordering::Acquire));

    wq.wake(WakeupFlags::ONE | WakeupFlags::CSW);
    waiter.join().unwrap();
    assert!(woken.load(Ordering::Acquire));
    assert_eq!(wq.waiter_count(), 0);
    sched::audit();
}

#[test]
fn timedwait_expires() {
    vpsched::init();
    let wq = WaitQueue::new();

    let start = Instant::now();
    let mut rem = Duration::from_secs(9);
    let res = wq.timedwait(None, When::In(Duration::from_millis(50)), Some(&mut rem));
    let elapsed = start.elapsed();

    assert_eq!(res, Err(Errno::TimedOut));
    assert!(elapsed >= Duration::from_millis(45), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "returned far too late: {elapsed:?}");
    assert_eq!(rem, Duration::ZERO);
}

#[test]
fn timedwait_past_deadline_fails_immediately() {
    vpsched::init();
    let wq = WaitQueue::new();
    let res = wq.timedwait(None, When::At(0), None);
    assert_eq!(res, Err(Errno::TimedOut));
}

#[test]
fn deinit_busy_while_occupied() {
    vpsched::init();
    let wq = WaitQueue::new();

    let wq2 = wq.clone();
    let waiter = thread::spawn(move || {
        let _ = wq2.timedwait(None, When::In(Duration::from_secs(5)), None);
    });

    assert!(poll_until(Duration::from_secs(2), || wq.waiter_count() == 1));
    assert_eq!(wq.deinit(), Err(Errno::Busy));

    wq.wake(WakeupFlags::empty());
    waiter.join().unwrap();
    assert_eq!(wq.deinit(), Ok(()));
}

#[test]
fn signal_cuts_a_timed_wait_short() {
    vpsched::init();
    let wq = WaitQueue::new();
    let (tx, rx) = mpsc::channel();

    let wq2 = wq.clone();
    let waiter = thread::spawn(move || {
        tx.send(vcpu::current()).unwrap();
        let start = Instant::now();
        let res = vcpu_signal::sigtimedwait(&wq2, SigSet::of(SIGUSR1), When::In(Duration::from_secs(1)));
        (res, start.elapsed())
    });

    let target = rx.recv().unwrap();
    thread::sleep(Duration::from_millis(100));
    vcpu_signal::sigsend(&target, SIGUSR1).unwrap();

    let (res, elapsed) = waiter.join().unwrap();
    let info = res.expect("the monitored signal should end the wait");
    assert_eq!(info.signo, SIGUSR1);
    assert!(
        elapsed < Duration::from_millis(600),
        "signal did not cut the wait short: {elapsed:?}"
    );
}

#[test]
fn signal_sent_before_the_wait_is_not_lost() {
    vpsched::init();
    let wq = WaitQueue::new();
    let me = vcpu::current();

    vcpu_signal::sigsend(&me, SIGUSR2).unwrap();
    let info = vcpu_signal::sigtimedwait(&wq, SigSet::of(SIGUSR2), When::In(Duration::from_secs(1)))
        .expect("pending signal must complete the wait immediately");
    assert_eq!(info.signo, SIGUSR2);
    assert!(!vcpu_signal::sigpending(&me).has(SIGUSR2), "signal not consumed");
}

#[test]
fn sigwait_picks_the_lowest_pending_signal() {
    vpsched::init();
    let wq = WaitQueue::new();
    let me = vcpu::current();

    vcpu_signal::sigsend(&me, SIGUSR2).unwrap();
    vcpu_signal::sigsend(&me, SIGUSR1).unwrap();

    let set = SigSet::of(SIGUSR1).with(SIGUSR2);
    let first = vcpu_signal::sigwait(&wq, set).unwrap();
    assert_eq!(first.signo, SIGUSR1);
    let second = vcpu_signal::sigwait(&wq, set).unwrap();
    assert_eq!(second.signo, SIGUSR2);
}

#[test]
fn acquired_vcpu_runs_its_entry_closure() {
    vpsched::init();
    let ran = Arc::new(AtomicBool::new(false));

    let ran2 = ran.clone();
    let vp = vcpu::acquire(VcpuAcquireAttr {
        func: Box::new(move || {
            ran2.store(true, Ordering::Release);
        }),
        kernel_stack_size: 0,
        user_stack_size: 0,
        is_user: false,
        groupid: 0,
        params: SchedParams::default(),
        data: 7,
    })
    .expect("acquire failed");

    assert!(vp.id() > 0);
    assert_eq!(vp.data(), 7);
    vcpu::resume(&vp, false);

    assert!(poll_until(Duration::from_secs(3), || ran.load(Ordering::Acquire)));
    sched::audit();
}

#[test]
fn invalid_sched_params_are_rejected() {
    vpsched::init();
    let res = vcpu::acquire(VcpuAcquireAttr {
        func: Box::new(|| {}),
        kernel_stack_size: 0,
        user_stack_size: 0,
        is_user: false,
        groupid: 0,
        params: SchedParams {
            qos: Qos::Idle, // not acquirable
            priority: 0,
        },
        data: 0,
    });
    assert!(matches!(res, Err(Errno::Inval)));
}

#[test]
fn vcpu_pool_recycles_many_short_lived_vcpus() {
    vpsched::init();
    let done = Arc::new(AtomicU64::new(0));

    for _ in 0..40 {
        let done2 = done.clone();
        let vp = vcpu::acquire(VcpuAcquireAttr {
            func: Box::new(move || {
                done2.fetch_add(1, Ordering::AcqRel);
            }),
            kernel_stack_size: 0,
            user_stack_size: 0,
            is_user: false,
            groupid: 0,
            params: SchedParams::default(),
            data: 0,
        })
        .unwrap();
        vcpu::resume(&vp, false);
        assert!(poll_until(Duration::from_secs(3), || {
            done.load(Ordering::Acquire) > 0
        }));
    }

    assert!(poll_until(Duration::from_secs(5), || {
        done.load(Ordering::Acquire) == 40
    }));
    sched::audit();
}

#[test]
fn suspend_holds_a_vcpu_and_nested_resume_releases_it() {
    vpsched::init();
    let counter = Arc::new(AtomicU64::new(0));
    let stop = Arc::new(AtomicBool::new(false));

    let c2 = counter.clone();
    let stop2 = stop.clone();
    let vp = vcpu::acquire(VcpuAcquireAttr {
        func: Box::new(move || {
            while !stop2.load(Ordering::Acquire) {
                c2.fetch_add(1, Ordering::AcqRel);
                vcpu::yield_now();
            }
        }),
        kernel_stack_size: 0,
        user_stack_size: 0,
        is_user: true,
        groupid: 0,
        params: SchedParams::default(),
        data: 0,
    })
    .unwrap();
    vcpu::resume(&vp, false);

    assert!(poll_until(Duration::from_secs(3), || {
        counter.load(Ordering::Acquire) > 0
    }));

    // Two suspensions must be matched by two resumes.
    vcpu::suspend(&vp).unwrap();
    vcpu::suspend(&vp).unwrap();
    assert!(poll_until(Duration::from_secs(3), || vcpu::suspended(&vp)));

    let frozen = {
        thread::sleep(Duration::from_millis(50));
        let a = counter.load(Ordering::Acquire);
        thread::sleep(Duration::from_millis(100));
        a == counter.load(Ordering::Acquire)
    };
    assert!(frozen, "suspended vcpu kept running");

    vcpu::resume(&vp, false);
    thread::sleep(Duration::from_millis(50));
    assert!(vcpu::suspended(&vp), "single resume undid a double suspend");

    vcpu::resume(&vp, false);
    assert!(poll_until(Duration::from_secs(3), || {
        let a = counter.load(Ordering::Acquire);
        thread::sleep(Duration::from_millis(20));
        counter.load(Ordering::Acquire) > a
    }));

    // Resume with a zero count is a no-op.
    vcpu::resume(&vp, false);

    stop.store(true, Ordering::Release);
    assert!(poll_until(Duration::from_secs(3), || {
        let a = counter.load(Ordering::Acquire);
        thread::sleep(Duration::from_millis(20));
        counter.load(Ordering::Acquire) == a
    }));
}

#[test]
fn involuntary_suspend_of_kernel_owned_vcpu_is_denied() {
    vpsched::init();
    let stop = Arc::new(AtomicBool::new(false));

    let stop2 = stop.clone();
    let vp = vcpu::acquire(VcpuAcquireAttr {
        func: Box::new(move || {
            while !stop2.load(Ordering::Acquire) {
                vcpu::yield_now();
                thread::sleep(Duration::from_millis(1));
            }
        }),
        kernel_stack_size: 0,
        user_stack_size: 0,
        is_user: false,
        groupid: 0,
        params: SchedParams::default(),
        data: 0,
    })
    .unwrap();
    vcpu::resume(&vp, false);

    // Give it a moment to leave the suspended state.
    assert!(poll_until(Duration::from_secs(3), || !vcpu::suspended(&vp)));
    assert_eq!(vcpu::suspend(&vp), Err(Errno::Perm));
    stop.store(true, Ordering::Release);
}

#[test]
fn mcontext_is_accessible_while_suspended() {
    vpsched::init();
    let vp = vcpu::acquire(VcpuAcquireAttr {
        func: Box::new(|| {}),
        kernel_stack_size: 0,
        user_stack_size: 0,
        is_user: true,
        groupid: 0,
        params: SchedParams::default(),
        data: 0,
    })
    .unwrap();

    // Still suspended: read, modify, write, read back.
    let mut ctx = vpsched::Mcontext::default();
    vcpu::rw_mcontext(&vp, &mut ctx, true).unwrap();
    ctx.pc = 0x1234;
    vcpu::rw_mcontext(&vp, &mut ctx, false).unwrap();
    let mut ctx2 = vpsched::Mcontext::default();
    vcpu::rw_mcontext(&vp, &mut ctx2, true).unwrap();
    assert_eq!(ctx2.pc, 0x1234);

    vcpu::resume(&vp, false);
}

#[test]
fn higher_priority_vcpu_preempts_a_busy_loop() {
    vpsched::init();
    let stop = Arc::new(AtomicBool::new(false));

    let stop_a = stop.clone();
    let a = vcpu::acquire(VcpuAcquireAttr {
        func: Box::new(move || {
            while !stop_a.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }
        }),
        kernel_stack_size: 0,
        user_stack_size: 0,
        is_user: false,
        groupid: 0,
        params: SchedParams {
            qos: Qos::Interactive,
            priority: -1,
        },
        data: 0,
    })
    .unwrap();
    vcpu::resume(&a, false);

    let stop_b = stop.clone();
    let b = vcpu::acquire(VcpuAcquireAttr {
        func: Box::new(move || {
            while !stop_b.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }
        }),
        kernel_stack_size: 0,
        user_stack_size: 0,
        is_user: false,
        groupid: 0,
        params: SchedParams {
            qos: Qos::Interactive,
            priority: 1,
        },
        data: 0,
    })
    .unwrap();
    let b_id = b.id();
    vcpu::resume(&b, false);

    // The quantum interrupt must hand the virtual CPU to the more important
    // VCPU within a few ticks.
    assert!(
        poll_until(Duration::from_secs(2), || sched::running_vcpu_id() == b_id),
        "the higher-priority vcpu never became the running one"
    );

    stop.store(true, Ordering::Release);
}

#[test]
fn mtx_provides_mutual_exclusion_and_cnd_wakes_waiters() {
    vpsched::init();
    use vpsched::sched::cnd::Cnd;
    use vpsched::sched::mtx::Mtx;

    let shared = Arc::new((Mtx::new(0u64), Cnd::new()));

    let mut joins = Vec::new();
    for _ in 0..4 {
        let shared2 = shared.clone();
        joins.push(thread::spawn(move || {
            for _ in 0..100 {
                let mut g = shared2.0.lock();
                *g += 1;
            }
            shared2.1.broadcast();
        }));
    }

    // Wait on the condition variable until all increments arrived.
    {
        let (mtx, cnd) = &*shared;
        let mut g = mtx.lock();
        let deadline = Instant::now() + Duration::from_secs(5);
        while *g < 400 {
            assert!(Instant::now() < deadline, "lost wakeup: count = {}", *g);
            let (g2, _res) = cnd.wait(g);
            g = g2;
        }
        assert_eq!(*g, 400);
    }

    for j in joins {
        j.join().unwrap();
    }
}

#[test]
fn group_kill_terminates_every_member() {
    vpsched::init();
    let group = 7777u32;
    let counters = [Arc::new(AtomicU64::new(0)), Arc::new(AtomicU64::new(0))];

    for counter in counters.iter() {
        let c2 = counter.clone();
        let vp = vcpu::acquire(VcpuAcquireAttr {
            func: Box::new(move || loop {
                c2.fetch_add(1, Ordering::AcqRel);
                vcpu::yield_now();
                thread::sleep(Duration::from_millis(1));
            }),
            kernel_stack_size: 0,
            user_stack_size: 0,
            is_user: true,
            groupid: group,
            params: SchedParams::default(),
            data: 0,
        })
        .unwrap();
        assert_eq!(vp.group_id(), group);
        vcpu::resume(&vp, false);
    }

    assert!(poll_until(Duration::from_secs(3), || {
        counters.iter().all(|c| c.load(Ordering::Acquire) > 0)
    }));

    let hit = vpsched::process::kill_group(group);
    assert_eq!(hit, 2);

    // Both loops must die at their next preemption point.
    assert!(poll_until(Duration::from_secs(3), || {
        let a: Vec<u64> = counters.iter().map(|c| c.load(Ordering::Acquire)).collect();
        thread::sleep(Duration::from_millis(30));
        counters
            .iter()
            .zip(a.iter())
            .all(|(c, before)| c.load(Ordering::Acquire) == *before)
    }));
    assert!(poll_until(Duration::from_secs(3), || {
        vpsched::process::vcpus_in_group(group).is_empty()
    }));
}

#[test]
fn wait_boost_raises_effective_priority_of_long_sleepers() {
    vpsched::init();
    let wq = WaitQueue::new();
    let (tx, rx) = mpsc::channel();

    let wq2 = wq.clone();
    let sleeper = vcpu::acquire(VcpuAcquireAttr {
        func: Box::new(move || {
            let me = vcpu::current();
            let _ = wq2.wait(None);
            tx.send(vcpu::get_current_priority(&me)).unwrap();
        }),
        kernel_stack_size: 0,
        user_stack_size: 0,
        is_user: false,
        groupid: 0,
        params: SchedParams {
            qos: Qos::Background,
            priority: 0,
        },
        data: 0,
    })
    .unwrap();
    vcpu::resume(&sleeper, false);

    assert!(poll_until(Duration::from_secs(2), || wq.waiter_count() == 1));
    // Let it sit well past one quarter second, then wake it.
    thread::sleep(Duration::from_millis(600));
    wq.wake(WakeupFlags::ONE);

    let woken_pri = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let base = {
        // background 0 sits at the bottom band
        let params = vcpu::get_sched_params(&sleeper);
        assert_eq!(params.qos, Qos::Background);
        9 // (background - 1) * 16 + (0 - -8) + 1
    };
    assert!(
        woken_pri > base,
        "no wait boost applied: woken at {woken_pri}, base {base}"
    );
}
