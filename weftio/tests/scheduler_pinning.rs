use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use weftio::{Config, Scheduler};

/// A task pinned to a specific worker runs on that worker and no other,
/// even with several other workers competing for unpinned work.
#[test]
fn pinned_task_runs_on_its_own_worker_only() {
    let _ = env_logger::try_init();

    let scheduler = Scheduler::new(Config::new().with_worker_count(3).with_scheduler_name("pin"));
    let (tx, rx) = mpsc::channel();

    let target = 2usize;
    let scheduler2 = scheduler.clone();
    scheduler.schedule_to(Some(target), move || {
        let name = weftio::ThreadWorker::current_name().unwrap();
        tx.send(name).unwrap();
        // Schedule unrelated unpinned noise so the other workers have
        // something to race for while the pinned task is in flight.
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = counter.clone();
            scheduler2.schedule(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
    });

    let worker_name = rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
    assert_eq!(worker_name, format!("pin-{target}"));
    scheduler.stop();
}
