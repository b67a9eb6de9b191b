use turbo_hash::{Cell128, Fixed, HashTable, Var};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn load_factor_halves_after_rehash_all() {
    init_logger();
    let table = HashTable::<Fixed, Fixed>::new(2, 4).unwrap();
    for k in 0..100u64 {
        table.put(k, k).unwrap();
    }

    // 2 buckets x 4 cells x 13 claimable slots per 256-byte cell.
    assert_eq!(table.capacity(), 2 * 4 * 13);
    let before = table.load_factor();
    assert!((before - 100.0 / (2.0 * 4.0 * 13.0)).abs() < 1e-9);

    let moved = table.minor_rehash_all().unwrap();
    assert_eq!(moved, 100);

    assert_eq!(table.capacity(), 2 * 8 * 13);
    assert!((table.load_factor() - before / 2.0).abs() < 1e-9);
    for k in 0..100u64 {
        assert_eq!(table.get(k), Some(k), "key {k} lost in rehash");
    }
}

#[test]
fn occupancy_never_exceeds_claimable_capacity() {
    init_logger();
    let table = HashTable::<Fixed, Fixed>::new(2, 1).unwrap();
    for k in 0..2000u64 {
        table.put(k, k).unwrap();
        assert!(
            table.size() <= table.capacity(),
            "size {} over capacity {} after key {k}",
            table.size(),
            table.capacity()
        );
    }
    for k in 0..2000u64 {
        assert_eq!(table.get(k), Some(k));
    }
}

#[test]
fn tombstones_do_not_survive_rehash() {
    let table = HashTable::<Fixed, Var>::new(4, 2).unwrap();
    for k in 0..200u64 {
        table.put(k, format!("v{k}").as_bytes()).unwrap();
    }
    for k in (0..200u64).step_by(2) {
        assert!(table.delete(k));
    }
    assert_eq!(table.size(), 100);

    let moved = table.minor_rehash_all().unwrap();
    assert_eq!(moved, 100);

    for k in 0..200u64 {
        if k % 2 == 0 {
            assert_eq!(table.get(k), None);
        } else {
            assert_eq!(table.get(k), Some(format!("v{k}").into_bytes()));
        }
    }
}

#[test]
fn updates_survive_rehash() {
    let table = HashTable::<Var, Fixed>::new(2, 2).unwrap();
    for k in 0..150u64 {
        table.put(format!("key-{k}").as_bytes(), k).unwrap();
    }
    for k in 0..150u64 {
        table.put(format!("key-{k}").as_bytes(), k + 5000).unwrap();
    }
    assert_eq!(table.size(), 150);

    table.minor_rehash_all().unwrap();

    assert_eq!(table.size(), 150);
    for k in 0..150u64 {
        assert_eq!(table.get(format!("key-{k}").as_bytes()), Some(k + 5000));
    }
}

#[test]
fn small_cells_grow_too() {
    let table = HashTable::<Fixed, Fixed, Cell128>::new(2, 2).unwrap();
    // 2 buckets x 2 cells x 6 claimable slots.
    assert_eq!(table.capacity(), 24);
    for k in 0..500u64 {
        table.put(k, k).unwrap();
    }
    assert!(table.capacity() >= 500);
    for k in 0..500u64 {
        assert_eq!(table.get(k), Some(k));
    }
}

#[test]
fn repeated_rehash_is_idempotent_on_content() {
    let table = HashTable::<Fixed, Fixed>::new(2, 2).unwrap();
    for k in 0..64u64 {
        table.put(k, !k).unwrap();
    }
    for _ in 0..4 {
        table.minor_rehash_all().unwrap();
    }
    assert_eq!(table.size(), 64);
    for k in 0..64u64 {
        assert_eq!(table.get(k), Some(!k));
    }
}
