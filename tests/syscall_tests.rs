//! Syscall-surface tests: the number table, the errno convention, user
//! wait-queue handles and the clock group.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use vpsched::syscall::{self, SigScope, Sysno, TimeSpec};
use vpsched::Errno;

fn sc(no: Sysno, args: [usize; 4]) -> isize {
    syscall::syscall(no as u32, args)
}

fn current_errno() -> i32 {
    sc(Sysno::VcpuErrno, [0; 4]) as i32
}

#[test]
fn unknown_syscall_reports_enosys() {
    vpsched::init();
    assert_eq!(syscall::syscall(9999, [0; 4]), -1);
    assert_eq!(current_errno(), Errno::NoSys.as_raw());
}

#[test]
fn vcpu_identity_calls() {
    vpsched::init();
    let id = sc(Sysno::VcpuGetid, [0; 4]);
    assert!(id > 0);
    let grp = sc(Sysno::VcpuGetgrp, [0; 4]);
    assert_eq!(grp as u32, vpsched::VCPU_MAIN_GROUP);

    assert_eq!(sc(Sysno::VcpuSetdata, [12345, 0, 0, 0]), 0);
    assert_eq!(sc(Sysno::VcpuGetdata, [0; 4]), 12345);
}

#[test]
fn clock_gettime_is_monotonic() {
    vpsched::init();
    let mut a = TimeSpec::default();
    let mut b = TimeSpec::default();

    assert_eq!(
        sc(Sysno::ClockGettime, [0, &mut a as *mut TimeSpec as usize, 0, 0]),
        0
    );
    thread::sleep(Duration::from_millis(20));
    assert_eq!(
        sc(Sysno::ClockGettime, [0, &mut b as *mut TimeSpec as usize, 0, 0]),
        0
    );

    let at = a.to_duration().unwrap();
    let bt = b.to_duration().unwrap();
    assert!(bt > at, "clock went backwards: {at:?} -> {bt:?}");

    // Bad clock id and null output are rejected.
    assert_eq!(sc(Sysno::ClockGettime, [7, 0, 0, 0]), -1);
    assert_eq!(current_errno(), Errno::Inval.as_raw());
}

#[test]
fn clock_getres_reports_the_tick() {
    vpsched::init();
    let mut res = TimeSpec::default();
    assert_eq!(
        sc(Sysno::ClockGetres, [0, &mut res as *mut TimeSpec as usize, 0, 0]),
        0
    );
    assert_eq!(res.to_duration().unwrap(), vpsched::clock::resolution());
}

#[test]
fn nanosleep_sleeps_for_roughly_the_requested_time() {
    vpsched::init();
    let wtp = TimeSpec::from_duration(Duration::from_millis(50));
    let start = Instant::now();
    let r = sc(
        Sysno::ClockNanosleep,
        [0, 0, &wtp as *const TimeSpec as usize, 0],
    );
    let elapsed = start.elapsed();

    assert_eq!(r, 0);
    assert!(elapsed >= Duration::from_millis(45), "woke early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "overslept: {elapsed:?}");
}

#[test]
fn user_wait_queue_handles() {
    vpsched::init();
    let mut od: i32 = -1;
    assert_eq!(sc(Sysno::WqCreate, [0, &mut od as *mut i32 as usize, 0, 0]), 0);
    assert!(od >= 0);

    // Timed wait on the fresh queue simply times out.
    let wtp = TimeSpec::from_duration(Duration::from_millis(30));
    let r = sc(
        Sysno::WqTimedwait,
        [od as usize, 0, &wtp as *const TimeSpec as usize, 0],
    );
    assert_eq!(r, -1);
    assert_eq!(current_errno(), Errno::TimedOut.as_raw());

    // A waiter plus a wakeup round-trips.
    let woken = Arc::new(AtomicBool::new(false));
    let woken2 = woken.clone();
    let waiter = thread::spawn(move || {
        let r = sc(Sysno::WqWait, [od as usize, 0, 0, 0]);
        woken2.store(r == 0, Ordering::Release);
    });

    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(2) {
        thread::sleep(Duration::from_millis(10));
        if sc(Sysno::WqWakeup, [od as usize, 1, 0, 0]) == 0 && woken.load(Ordering::Acquire) {
            break;
        }
    }
    waiter.join().unwrap();
    assert!(woken.load(Ordering::Acquire));

    assert_eq!(sc(Sysno::WqDispose, [od as usize, 0, 0, 0]), 0);
    // The handle is gone now.
    assert_eq!(sc(Sysno::WqWait, [od as usize, 0, 0, 0]), -1);
    assert_eq!(current_errno(), Errno::BadF.as_raw());
}

#[test]
fn sigsend_and_sigpending_round_trip() {
    vpsched::init();
    let id = sc(Sysno::VcpuGetid, [0; 4]) as usize;

    assert_eq!(
        sc(
            Sysno::SigSend,
            [SigScope::Vcpu as usize, id, vpsched::signal::SIGUSR2 as usize, 0]
        ),
        0
    );

    let mut pending: u32 = 0;
    assert_eq!(
        sc(Sysno::SigPending, [&mut pending as *mut u32 as usize, 0, 0, 0]),
        0
    );
    assert!(vpsched::SigSet::from_bits(pending).has(vpsched::signal::SIGUSR2));

    // Consume it so later tests see a clean slate.
    let wtp = TimeSpec::from_duration(Duration::from_millis(500));
    let mut info = vpsched::SigInfo {
        signo: 0,
    };
    let r = sc(
        Sysno::SigTimedwait,
        [
            vpsched::SigSet::of(vpsched::signal::SIGUSR2).bits() as usize,
            0,
            &wtp as *const TimeSpec as usize,
            &mut info as *mut vpsched::SigInfo as usize,
        ],
    );
    assert_eq!(r, 0);
    assert_eq!(info.signo, vpsched::signal::SIGUSR2);
}

#[test]
fn sigsend_to_a_missing_vcpu_fails() {
    vpsched::init();
    let r = sc(
        Sysno::SigSend,
        [SigScope::Vcpu as usize, 0xfff_fff, vpsched::signal::SIGUSR1 as usize, 0],
    );
    assert_eq!(r, -1);
    assert_eq!(current_errno(), Errno::Srch.as_raw());

    let r = sc(Sysno::SigSend, [SigScope::Children as usize, 0, 1, 0]);
    assert_eq!(r, -1);
    assert_eq!(current_errno(), Errno::Srch.as_raw());
}

#[test]
fn wakeup_then_timedwait_is_atomic() {
    vpsched::init();
    let mut ping: i32 = -1;
    let mut pong: i32 = -1;
    assert_eq!(sc(Sysno::WqCreate, [0, &mut ping as *mut i32 as usize, 0, 0]), 0);
    assert_eq!(sc(Sysno::WqCreate, [0, &mut pong as *mut i32 as usize, 0, 0]), 0);

    let woken = Arc::new(AtomicBool::new(false));
    let woken2 = woken.clone();
    let peer = thread::spawn(move || {
        let r = sc(Sysno::WqWait, [ping as usize, 0, 0, 0]);
        woken2.store(r == 0, Ordering::Release);
    });

    // Let the peer reach its wait, then wake it and wait on the other queue
    // in one shot; nobody wakes us, so the wait times out.
    thread::sleep(Duration::from_millis(50));
    let wtp = TimeSpec::from_duration(Duration::from_millis(50));
    let r = sc(
        Sysno::WqWakeupThenTimedwait,
        [
            ping as usize,
            pong as usize,
            0,
            &wtp as *const TimeSpec as usize,
        ],
    );
    assert_eq!(r, -1);
    assert_eq!(current_errno(), Errno::TimedOut.as_raw());

    // Belt and braces in case the peer had not parked yet.
    let start = Instant::now();
    while !woken.load(Ordering::Acquire) && start.elapsed() < Duration::from_secs(2) {
        let _ = sc(Sysno::WqWakeup, [ping as usize, 1, 0, 0]);
        thread::sleep(Duration::from_millis(10));
    }
    peer.join().unwrap();
    assert!(woken.load(Ordering::Acquire));

    assert_eq!(sc(Sysno::WqDispose, [ping as usize, 0, 0, 0]), 0);
    assert_eq!(sc(Sysno::WqDispose, [pong as usize, 0, 0, 0]), 0);
}

#[test]
fn yield_is_harmless() {
    vpsched::init();
    assert_eq!(sc(Sysno::VcpuYield, [0; 4]), 0);
}

#[test]
fn sched_params_syscalls_round_trip() {
    vpsched::init();
    use vpsched::syscall::UserSchedParams;

    let mut p = UserSchedParams::default();
    assert_eq!(
        sc(
            Sysno::VcpuGetschedparams,
            [0, &mut p as *mut UserSchedParams as usize, 0, 0]
        ),
        0
    );
    assert_eq!(p.qos, vpsched::Qos::Utility as i32);

    let np = UserSchedParams {
        qos: vpsched::Qos::Interactive as i32,
        priority: 2,
    };
    assert_eq!(
        sc(
            Sysno::VcpuSetschedparams,
            [0, &np as *const UserSchedParams as usize, 0, 0]
        ),
        0
    );

    let mut back = UserSchedParams::default();
    assert_eq!(
        sc(
            Sysno::VcpuGetschedparams,
            [0, &mut back as *mut UserSchedParams as usize, 0, 0]
        ),
        0
    );
    assert_eq!(back.qos, vpsched::Qos::Interactive as i32);
    assert_eq!(back.priority, 2);

    // Out-of-range parameters bounce.
    let bad = UserSchedParams { qos: 42, priority: 0 };
    assert_eq!(
        sc(
            Sysno::VcpuSetschedparams,
            [0, &bad as *const UserSchedParams as usize, 0, 0]
        ),
        -1
    );
    assert_eq!(current_errno(), Errno::Inval.as_raw());
}

#[test]
fn vcpu_acquire_and_resume_via_syscalls() {
    vpsched::init();
    use vpsched::syscall::UserVcpuAttr;

    static STARTED: AtomicBool = AtomicBool::new(false);
    fn entry(arg: usize) {
        assert_eq!(arg, 77);
        STARTED.store(true, Ordering::Release);
    }

    let attr = UserVcpuAttr {
        func: entry,
        arg: 77,
        stack_size: 0,
        groupid: 0,
        qos: vpsched::Qos::Utility as i32,
        priority: 0,
        data: 0,
    };
    let mut id: u32 = 0;
    assert_eq!(
        sc(
            Sysno::VcpuAcquire,
            [
                &attr as *const UserVcpuAttr as usize,
                &mut id as *mut u32 as usize,
                0,
                0
            ]
        ),
        0
    );
    assert!(id > 0);

    assert_eq!(sc(Sysno::VcpuResume, [id as usize, 0, 0, 0]), 0);

    let start = Instant::now();
    while !STARTED.load(Ordering::Acquire) && start.elapsed() < Duration::from_secs(3) {
        thread::sleep(Duration::from_millis(2));
    }
    assert!(STARTED.load(Ordering::Acquire));
}
