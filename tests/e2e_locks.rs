//! E2E: locks and signal under real thread contention: mutual exclusion,
//! shared/exclusive exclusivity, writer progress, and grant/cancel races
//! resolved exactly once.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cancelsync::{
    assert_with_log, test_complete, test_phase, CancelSource, CancelToken, Mutex, RwLock, Signal,
};

#[test]
fn e2e_mutex_never_admits_two_holders() {
    common::init_test_logging();
    test_phase!("e2e_mutex_never_admits_two_holders");

    let mutex = Arc::new(Mutex::new(0u64));
    let inside = Arc::new(AtomicUsize::new(0));
    let threads = 8;
    let per_thread = 50u64;

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let mutex = Arc::clone(&mutex);
            let inside = Arc::clone(&inside);
            thread::spawn(move || {
                let token = CancelToken::never();
                for _ in 0..per_thread {
                    let mut guard = common::block_on(mutex.lock(&token)).expect("never cancelled");
                    let others = inside.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(others, 0, "second holder observed inside critical section");
                    *guard += 1;
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker panicked");
    }

    let total = *mutex.try_lock().expect("free at the end");
    let expected = threads as u64 * per_thread;
    assert_with_log!(total == expected, "all increments kept", expected, total);
    test_complete!("e2e_mutex_never_admits_two_holders");
}

#[test]
fn e2e_mutex_grant_and_cancel_resolve_exactly_once() {
    common::init_test_logging();
    test_phase!("e2e_mutex_grant_and_cancel_resolve_exactly_once");

    // Race an unlock against a cancellation request on every iteration. The
    // waiter must resolve to exactly one outcome, and the lock must always
    // be free again afterwards: granted-then-abandoned or cancelled-with-
    // the-lock-kept would both show up here.
    let mut granted = 0u32;
    let mut cancelled = 0u32;
    let rounds = 2000u32;
    for round in 0..rounds {
        let mutex = Arc::new(Mutex::new(()));
        let source = Arc::new(CancelSource::new());
        let holder = mutex.try_lock().expect("holder");

        let waiter = {
            let mutex = Arc::clone(&mutex);
            let source = Arc::clone(&source);
            thread::spawn(move || {
                let token = source.token();
                common::block_on(mutex.lock(&token)).is_ok()
            })
        };
        let stopper = {
            let source = Arc::clone(&source);
            thread::spawn(move || {
                if round % 2 == 0 {
                    thread::yield_now();
                }
                source.request_stop();
            })
        };
        drop(holder);

        if waiter.join().expect("waiter panicked") {
            granted += 1;
        } else {
            cancelled += 1;
        }
        stopper.join().expect("stopper panicked");

        let free = mutex.try_lock().is_some();
        assert_with_log!(free, "lock free after the race", true, free);
    }
    let total = granted + cancelled;
    assert_with_log!(total == rounds, "every round resolved once", rounds, total);
    test_complete!("e2e_mutex_grant_and_cancel_resolve_exactly_once");
}

#[test]
fn e2e_rwlock_shared_and_exclusive_never_mix() {
    common::init_test_logging();
    test_phase!("e2e_rwlock_shared_and_exclusive_never_mix");

    let lock = Arc::new(RwLock::new((0u64, 0u64)));
    let readers_inside = Arc::new(AtomicUsize::new(0));
    let writer_inside = Arc::new(AtomicBool::new(false));
    let rounds = 100u64;

    let mut handles = Vec::new();
    for _ in 0..2 {
        let lock = Arc::clone(&lock);
        let readers_inside = Arc::clone(&readers_inside);
        let writer_inside = Arc::clone(&writer_inside);
        handles.push(thread::spawn(move || {
            let token = CancelToken::never();
            for _ in 0..rounds {
                let mut guard = common::block_on(lock.write(&token)).expect("never cancelled");
                assert!(!writer_inside.swap(true, Ordering::SeqCst), "two writers");
                assert_eq!(readers_inside.load(Ordering::SeqCst), 0, "reader beside writer");
                guard.0 += 1;
                guard.1 += 1;
                writer_inside.store(false, Ordering::SeqCst);
            }
        }));
    }
    for _ in 0..4 {
        let lock = Arc::clone(&lock);
        let readers_inside = Arc::clone(&readers_inside);
        let writer_inside = Arc::clone(&writer_inside);
        handles.push(thread::spawn(move || {
            let token = CancelToken::never();
            for _ in 0..rounds {
                let guard = common::block_on(lock.read(&token)).expect("never cancelled");
                readers_inside.fetch_add(1, Ordering::SeqCst);
                assert!(!writer_inside.load(Ordering::SeqCst), "writer beside reader");
                assert_eq!(guard.0, guard.1, "torn write observed");
                readers_inside.fetch_sub(1, Ordering::SeqCst);
            }
        }));
    }
    for handle in handles {
        handle.join().expect("worker panicked");
    }

    let total = lock.try_read().expect("free at the end").0;
    assert_with_log!(total == 2 * rounds, "all writes kept", 2 * rounds, total);
    test_complete!("e2e_rwlock_shared_and_exclusive_never_mix");
}

#[test]
fn e2e_rwlock_writer_makes_progress_through_reader_churn() {
    common::init_test_logging();
    test_phase!("e2e_rwlock_writer_makes_progress_through_reader_churn");

    let lock = Arc::new(RwLock::new(false));
    let mut readers = Vec::new();
    for _ in 0..4 {
        let lock = Arc::clone(&lock);
        readers.push(thread::spawn(move || {
            let token = CancelToken::never();
            // Bounded so a starved writer fails the test instead of hanging
            // it.
            for _ in 0..2_000_000u64 {
                let done = *common::block_on(lock.read(&token)).expect("never cancelled");
                if done {
                    return;
                }
            }
            panic!("writer starved by reader churn");
        }));
    }

    let token = CancelToken::never();
    thread::sleep(Duration::from_millis(5));
    *common::block_on(lock.write(&token)).expect("never cancelled") = true;
    for reader in readers {
        reader.join().expect("reader panicked");
    }
    test_complete!("e2e_rwlock_writer_makes_progress_through_reader_churn");
}

#[test]
fn e2e_rwlock_cancelled_writer_frees_queued_readers() {
    common::init_test_logging();
    test_phase!("e2e_rwlock_cancelled_writer_frees_queued_readers");

    for _ in 0..200 {
        let lock = Arc::new(RwLock::new(()));
        let source = Arc::new(CancelSource::new());
        let holder = lock.try_read().expect("holder");

        let writer = {
            let lock = Arc::clone(&lock);
            let source = Arc::clone(&source);
            thread::spawn(move || {
                let token = source.token();
                common::block_on(lock.write(&token)).is_ok()
            })
        };
        let reader = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let token = CancelToken::never();
                drop(common::block_on(lock.read(&token)).expect("never cancelled"));
            })
        };
        source.request_stop();
        drop(holder);

        let _ = writer.join().expect("writer panicked");
        reader.join().expect("reader panicked");
        let free = lock.try_write().is_some();
        assert_with_log!(free, "fully released after the race", true, free);
    }
    test_complete!("e2e_rwlock_cancelled_writer_frees_queued_readers");
}

#[test]
fn e2e_signal_set_and_cancel_race_resolves_once() {
    common::init_test_logging();
    test_phase!("e2e_signal_set_and_cancel_race_resolves_once");

    let mut granted = 0u32;
    let mut cancelled = 0u32;
    for _ in 0..500 {
        let signal = Arc::new(Signal::new());
        let source = Arc::new(CancelSource::new());

        let waiter = {
            let signal = Arc::clone(&signal);
            let source = Arc::clone(&source);
            thread::spawn(move || {
                let token = source.token();
                common::block_on(signal.wait(&token)).is_ok()
            })
        };
        let producer = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.set())
        };
        source.request_stop();

        if waiter.join().expect("waiter panicked") {
            granted += 1;
        } else {
            cancelled += 1;
        }
        producer.join().expect("producer panicked");
    }
    let total = granted + cancelled;
    assert_with_log!(total == 500, "every round resolved once", 500u32, total);
    test_complete!("e2e_signal_set_and_cancel_race_resolves_once");
}

#[test]
fn e2e_signal_crosses_threads() {
    common::init_test_logging();
    test_phase!("e2e_signal_crosses_threads");

    let signal = Arc::new(Signal::new());
    let producer = {
        let signal = Arc::clone(&signal);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signal.set();
        })
    };

    let token = CancelToken::never();
    let result = common::block_on(signal.wait(&token));
    assert_with_log!(result.is_ok(), "wait completed", true, result.is_ok());
    producer.join().expect("producer panicked");
    test_complete!("e2e_signal_crosses_threads");
}
