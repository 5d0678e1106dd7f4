//! Bounded worker pool for per-key work.

use crossbeam_channel::bounded;

/// Run `f` over `items` on at most `workers` threads.
///
/// Results come back in input order. Small inputs run on the calling thread.
pub fn run_bounded<T, R, F>(workers: usize, items: Vec<T>, f: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    let workers = workers.max(1).min(items.len());
    if workers <= 1 {
        return items.into_iter().map(f).collect();
    }

    let count = items.len();
    let mut results: Vec<Option<R>> = (0..count).map(|_| None).collect();

    std::thread::scope(|s| {
        let (work_tx, work_rx) = bounded::<(usize, T)>(workers * 2);
        let (result_tx, result_rx) = bounded::<(usize, R)>(workers * 2);
        let f = &f;

        for _ in 0..workers {
            let rx = work_rx.clone();
            let tx = result_tx.clone();
            s.spawn(move || {
                for (idx, item) in rx {
                    if tx.send((idx, f(item))).is_err() {
                        return;
                    }
                }
            });
        }
        // Channels close once the workers exit.
        drop(work_rx);
        drop(result_tx);

        s.spawn(move || {
            for job in items.into_iter().enumerate() {
                if work_tx.send(job).is_err() {
                    return;
                }
            }
        });

        for (idx, result) in result_rx {
            results[idx] = Some(result);
        }
    });

    results.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_preserves_order() {
        let out = run_bounded(4, (0..100).collect(), |i: u64| {
            std::thread::sleep(Duration::from_micros((100 - i) * 10));
            i * 2
        });
        assert_eq!(out, (0..100).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_bounded_concurrency() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        run_bounded(3, (0..30).collect::<Vec<u32>>(), |_| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(2));
            active.fetch_sub(1, Ordering::SeqCst);
        });
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_empty_and_single() {
        let empty: Vec<u8> = run_bounded(8, Vec::<u8>::new(), |x| x);
        assert!(empty.is_empty());
        assert_eq!(run_bounded(8, vec![7], |x: i32| x + 1), vec![8]);
    }
}
