#[cfg(all(test, not(loom)))]
mod tests {
    use crate::memory::allocator::{Allocator, AllocatorConfig};
    use crate::memory::size_class::{MAX_FIXED_SIZE, fixed_size_to_table_index};
    use crate::sync::Arc;
    use crate::sync::barrier::Barrier;
    use crate::sync::thread;
    use std::ptr::NonNull;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn shared_allocator() -> Arc<Allocator> {
        let allocator = Arc::new(Allocator::new(AllocatorConfig {
            poison_fill: true,
            ..AllocatorConfig::default()
        }));
        allocator.initialize().unwrap();
        allocator
    }

    /// Small deterministic generator so failures replay.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u64 {
            self.0 = self.0.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
            self.0 >> 33
        }
    }

    #[test]
    fn test_two_threads_distinct_classes_for_one_second() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let allocator = shared_allocator();
        let barrier = Arc::new(Barrier::new(2));
        let per_round = 50_000usize;
        let deadline = Duration::from_secs(1);

        let handles: Vec<_> = [48usize, 512]
            .into_iter()
            .enumerate()
            .map(|(t, size)| {
                let allocator = allocator.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let mut ptrs = Vec::with_capacity(per_round);
                    let mut rounds = 0usize;
                    barrier.wait();
                    let start = Instant::now();

                    while rounds == 0 || start.elapsed() < deadline {
                        for i in 0..per_round {
                            let p = allocator.malloc(size).unwrap();
                            // Safety: Test code, `size` >= 8.
                            unsafe { p.as_ptr().cast::<u64>().write((t * per_round + i) as u64) };
                            ptrs.push(p);
                        }
                        for (i, p) in ptrs.drain(..).enumerate() {
                            // Safety: Test code.
                            unsafe {
                                assert_eq!(
                                    p.as_ptr().cast::<u64>().read(),
                                    (t * per_round + i) as u64,
                                    "thread {t} saw corruption"
                                );
                                allocator.free(p);
                            }
                        }
                        rounds += 1;
                    }
                    rounds
                })
            })
            .collect();

        let rounds: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(rounds.iter().all(|&r| r >= 1));

        let stats = allocator.stats();
        assert_eq!(stats.outstanding_bytes(), 0);
        assert_eq!(stats.live_fixed_blocks, 0);
        assert_eq!(stats.allocated_fixed, 0);
        assert_eq!(stats.pool_count, 0);
        for size in [48, 512] {
            let report = allocator.class_report(usize::from(fixed_size_to_table_index(size)));
            assert_eq!(report.pool_count(), 0);
        }
        assert_eq!(allocator.deinitialize().outstanding_bytes(), 0);
    }

    #[test]
    fn test_mixed_sizes_thread_contention() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let allocator = shared_allocator();
        let num_threads = 8u64;
        let iters = 2_000u64;
        let barrier = Arc::new(Barrier::new(num_threads as usize));

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let allocator = allocator.clone();
                let b = barrier.clone();
                thread::spawn(move || {
                    let mut rng = Lcg(t + 1);
                    let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
                    b.wait();

                    for i in 0..iters {
                        let size = if i % 97 == 0 {
                            MAX_FIXED_SIZE + 1 + (rng.next() % 200_000) as usize
                        } else {
                            1 + (rng.next() % MAX_FIXED_SIZE as u64) as usize
                        };
                        let tag = (t as u8).wrapping_mul(31).wrapping_add(i as u8);
                        let p = allocator.malloc(size).unwrap();
                        // Safety: Test code.
                        unsafe {
                            p.as_ptr().write(tag);
                            p.as_ptr().add(size - 1).write(tag);
                        }
                        live.push((p, size, tag));

                        if rng.next() % 3 == 0 {
                            let victim = (rng.next() as usize) % live.len();
                            let (p, size, tag) = live.swap_remove(victim);
                            // Safety: Test code.
                            unsafe {
                                assert_eq!(p.as_ptr().read(), tag);
                                assert_eq!(p.as_ptr().add(size - 1).read(), tag);
                                allocator.free(p);
                            }
                        }
                    }

                    for (p, size, tag) in live {
                        // Safety: Test code.
                        unsafe {
                            assert_eq!(p.as_ptr().read(), tag, "contention caused corruption in thread {t}");
                            assert_eq!(p.as_ptr().add(size - 1).read(), tag);
                            allocator.free(p);
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        for report in allocator.validate() {
            assert_eq!(report.pool_count(), 0, "class {} kept pools", report.class_index);
        }
        let stats = allocator.deinitialize();
        assert_eq!(stats.outstanding_bytes(), 0);
        assert_eq!(stats.allocated_bytes(), 0);
    }

    #[test]
    fn test_cross_thread_free() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let allocator = shared_allocator();
        let (tx, rx) = mpsc::channel::<(usize, usize)>();

        let producer = {
            let allocator = allocator.clone();
            thread::spawn(move || {
                for i in 0..5_000usize {
                    let size = [24, 200, 3000, 9000][i % 4];
                    let p = allocator.malloc(size).unwrap();
                    // Safety: Test code.
                    unsafe { p.as_ptr().cast::<usize>().write(i) };
                    tx.send((p.as_ptr() as usize, i)).unwrap();
                }
            })
        };

        let consumer = {
            let allocator = allocator.clone();
            thread::spawn(move || {
                for (addr, i) in rx {
                    let p = NonNull::new(addr as *mut u8).unwrap();
                    // Safety: Test code, the producer handed the block over.
                    unsafe {
                        assert_eq!(p.as_ptr().cast::<usize>().read(), i);
                        allocator.free(p);
                    }
                }
            })
        };

        producer.join().unwrap();
        consumer.join().unwrap();

        let stats = allocator.deinitialize();
        assert_eq!(stats.outstanding_bytes(), 0);
        assert_eq!(stats.pool_count, 0);
    }

    #[test]
    fn test_many_pools_across_classes() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let allocator = shared_allocator();

        let mut ptrs = Vec::new();
        for size in (16..=MAX_FIXED_SIZE).step_by(16) {
            for _ in 0..20 {
                ptrs.push(allocator.malloc(size).unwrap());
            }
        }
        let stats = allocator.stats();
        assert!(stats.pool_count >= crate::memory::size_class::FIXED_CLASS_COUNT);
        assert_eq!(stats.live_fixed_blocks, ptrs.len());

        // Free in a scrambled order so pools empty in between.
        let mut rng = Lcg(99);
        while !ptrs.is_empty() {
            let i = (rng.next() as usize) % ptrs.len();
            let p = ptrs.swap_remove(i);
            // Safety: Test code.
            unsafe { allocator.free(p) };
        }
        allocator.validate();
        assert_eq!(allocator.stats().allocated_fixed, 0);
        allocator.deinitialize();
    }
}
