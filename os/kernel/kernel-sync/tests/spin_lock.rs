use kernel_sync::{SpinLock, SpinLockGuard, SpinMutex, TicketMutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn try_lock_fails_while_held() {
    let l = SpinLock::new(1u8);

    let g1 = l.try_lock();
    assert!(g1.is_some());
    assert!(l.try_lock().is_none());
    assert!(l.is_locked());
    assert!(l.try_lock().is_none(), "a failed attempt must not release the holder");

    drop(g1);
    assert!(!l.is_locked());
    assert!(l.try_lock().is_some());
}

#[test]
fn unlocked_section_releases_and_reacquires() {
    let l = SpinLock::new(vec![1]);
    let mut g = l.lock();
    g.push(2);

    let observed_free = SpinLockGuard::unlocked(&mut g, || {
        // Another user can get in while we are "blocked".
        l.with_lock(|v| v.push(3));
        true
    });
    assert!(observed_free);
    assert!(l.is_locked());
    g.push(4);
    drop(g);

    assert_eq!(l.lock().as_slice(), &[1, 2, 3, 4]);
}

#[test]
fn lock_is_released_on_panic() {
    let l = SpinLock::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");
    assert_eq!(l.with_lock(|v| *v), 123);
}

fn hammer<L, F>(lock: Arc<L>, bump: F) -> usize
where
    L: Send + Sync + 'static,
    F: Fn(&L, &AtomicUsize) + Send + Sync + Copy + 'static,
{
    let threads = 8;
    let iters = 2_000;
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let in_cs = Arc::clone(&in_cs);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    bump(&lock, &in_cs);
                    thread::yield_now();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(in_cs.load(Ordering::SeqCst), 0);
    threads * iters
}

#[test]
fn spin_lock_is_exclusive_under_contention() {
    let lock = Arc::new(SpinLock::new(0usize));
    let expected = hammer(Arc::clone(&lock), |l, in_cs| {
        l.with_lock(|v| {
            assert_eq!(in_cs.fetch_add(1, Ordering::SeqCst), 0, "mutual exclusion violated");
            *v += 1;
            in_cs.fetch_sub(1, Ordering::SeqCst);
        });
    });
    assert_eq!(lock.with_lock(|v| *v), expected);
}

#[test]
fn ticket_mutex_is_exclusive_under_contention() {
    let lock = Arc::new(TicketMutex::new(0usize));
    let expected = hammer(Arc::clone(&lock), |l, in_cs| {
        let mut g = l.lock();
        assert_eq!(in_cs.fetch_add(1, Ordering::SeqCst), 0, "mutual exclusion violated");
        *g += 1;
        in_cs.fetch_sub(1, Ordering::SeqCst);
    });
    assert_eq!(*lock.lock(), expected);
    assert!(!lock.is_locked());
}

#[test]
fn failed_try_lock_leaves_ticket_mutex_held() {
    let m = TicketMutex::new(0u8);
    let held = m.lock();
    assert!(m.try_lock().is_none());
    assert!(m.try_lock().is_none());
    assert!(m.is_locked());

    drop(held);
    assert!(!m.is_locked());
    let again = m.try_lock();
    assert!(again.is_some());
    assert!(m.try_lock().is_none());
}

#[test]
fn spin_mutex_try_lock_and_into_inner() {
    let m = SpinMutex::new(String::from("a"));
    {
        let _g = m.lock();
        assert!(m.try_lock().is_none());
    }
    m.with_lock(|s| s.push('b'));
    assert_eq!(m.into_inner(), "ab");
}

/// Spot-check the lock types are Sync for Send payloads.
#[test]
fn locks_are_sync_for_send_t() {
    fn takes_sync<S: Sync>(_s: &S) {}
    takes_sync(&SpinLock::new(0u8));
    takes_sync(&TicketMutex::new(0u8));
}
