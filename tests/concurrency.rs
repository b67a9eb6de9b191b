use std::sync::Arc;
use std::thread;

use turbo_hash::{Fixed, HashTable, Var};

const NUM_THREADS: u64 = 8;
const KEYS_PER_THREAD: u64 = 500;

#[test]
fn disjoint_ranges_union() {
    let table = Arc::new(HashTable::<Fixed, Fixed>::new(64, 4).unwrap());

    let threads: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                let start = t * KEYS_PER_THREAD;
                for k in start..start + KEYS_PER_THREAD {
                    table.put(k, k + 1).unwrap();
                }
            })
        })
        .collect();
    for handle in threads {
        handle.join().unwrap();
    }

    // Exactly the union of all ranges, nothing lost, nothing duplicated.
    assert_eq!(table.size(), (NUM_THREADS * KEYS_PER_THREAD) as usize);
    for k in 0..NUM_THREADS * KEYS_PER_THREAD {
        assert_eq!(table.get(k), Some(k + 1), "key {k}");
    }
}

#[test]
fn readers_run_against_writers() {
    let table = Arc::new(HashTable::<Fixed, Fixed>::new(16, 2).unwrap());
    for k in 0..1000u64 {
        table.put(k, k).unwrap();
    }

    let writer = {
        let table = Arc::clone(&table);
        thread::spawn(move || {
            for round in 1..=20u64 {
                for k in 0..1000 {
                    table.put(k, k + round * 10_000).unwrap();
                }
            }
        })
    };
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for _ in 0..20 {
                    for k in 0..1000u64 {
                        // Every observed value is one the writer actually
                        // wrote for this key, never a mix of two records.
                        let v = table.get(k).expect("key must stay visible");
                        assert_eq!(v % 10_000, k, "torn value for key {k}: {v}");
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for handle in readers {
        handle.join().unwrap();
    }
    for k in 0..1000u64 {
        assert_eq!(table.get(k), Some(k + 200_000));
    }
}

#[test]
fn delete_races_with_insert() {
    let table = Arc::new(HashTable::<Fixed, Fixed>::new(8, 4).unwrap());

    let threads: Vec<_> = (0..4u64)
        .map(|t| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                let start = t * 200;
                for _ in 0..30 {
                    for k in start..start + 200 {
                        table.put(k, k).unwrap();
                    }
                    for k in start..start + 200 {
                        assert!(table.delete(k));
                    }
                }
                for k in start..start + 200 {
                    table.put(k, k * 2).unwrap();
                }
            })
        })
        .collect();
    for handle in threads {
        handle.join().unwrap();
    }

    assert_eq!(table.size(), 800);
    for k in 0..800u64 {
        assert_eq!(table.get(k), Some(k * 2));
    }
}

#[test]
fn concurrent_var_keys() {
    let table = Arc::new(HashTable::<Var, Var>::new(32, 4).unwrap());

    let threads: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for i in 0..300u64 {
                    let key = format!("thread-{t}-key-{i}");
                    let value = format!("value-{i}");
                    table.put(key.as_bytes(), value.as_bytes()).unwrap();
                }
            })
        })
        .collect();
    for handle in threads {
        handle.join().unwrap();
    }

    assert_eq!(table.size(), (NUM_THREADS * 300) as usize);
    for t in 0..NUM_THREADS {
        for i in 0..300u64 {
            let key = format!("thread-{t}-key-{i}");
            assert_eq!(
                table.get(key.as_bytes()),
                Some(format!("value-{i}").into_bytes())
            );
        }
    }
}

#[test]
fn rehash_all_races_with_writers() {
    let table = Arc::new(HashTable::<Fixed, Fixed>::new(4, 2).unwrap());

    let writers: Vec<_> = (0..4u64)
        .map(|t| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                let start = t * 400;
                for k in start..start + 400 {
                    table.put(k, k).unwrap();
                }
            })
        })
        .collect();
    let rehasher = {
        let table = Arc::clone(&table);
        thread::spawn(move || {
            for _ in 0..3 {
                table.minor_rehash_all().unwrap();
            }
        })
    };

    for handle in writers {
        handle.join().unwrap();
    }
    rehasher.join().unwrap();

    assert_eq!(table.size(), 1600);
    for k in 0..1600u64 {
        assert_eq!(table.get(k), Some(k), "key {k}");
    }
}
