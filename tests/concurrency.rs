//! Concurrency properties: multi-key batch atomicity, deadlock freedom
//! and the backup concurrency bound.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_utils::thread::scope;
use rand::seq::SliceRandom;
use rand::thread_rng;
use tempfile::TempDir;

use kvs::{BackupEngine, Store};

const KEYS: [&str; 8] = ["ka", "kb", "kc", "kd", "ke", "kf", "kg", "kh"];

fn batch(value: &str) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = KEYS
        .iter()
        .map(|k| ((*k).to_owned(), value.to_owned()))
        .collect();
    pairs.shuffle(&mut thread_rng());
    pairs
}

#[test]
fn concurrent_writes_on_shuffled_key_sets_all_complete() {
    let store = Store::new();

    scope(|s| {
        for i in 0..16 {
            let store = &store;
            s.spawn(move |_| {
                let value = format!("v{i}");
                for _ in 0..50 {
                    store.write(&batch(&value)).unwrap();
                }
            });
        }
    })
    .unwrap();

    // Every batch holds all eight write locks at once, so the last
    // committed batch decides every key: the values must agree.
    let keys: Vec<String> = KEYS.iter().map(|k| (*k).to_owned()).collect();
    let results = store.read(&keys);
    assert_eq!(results.len(), KEYS.len());
    let first = results[0].1.clone().expect("key present");
    for (key, value) in &results {
        assert_eq!(value.as_deref(), Some(first.as_str()), "key {key}");
    }
}

#[test]
fn read_batches_never_observe_a_torn_write() {
    let store = Store::new();
    store
        .write(&[("a".to_owned(), "0".to_owned()), ("b".to_owned(), "0".to_owned())])
        .unwrap();
    let stop = AtomicBool::new(false);

    scope(|s| {
        let store_ref = &store;
        let stop_ref = &stop;
        s.spawn(move |_| {
            for i in 0..2000 {
                let v = i.to_string();
                store_ref
                    .write(&[("a".to_owned(), v.clone()), ("b".to_owned(), v)])
                    .unwrap();
            }
            stop_ref.store(true, Ordering::SeqCst);
        });
        for _ in 0..3 {
            s.spawn(move |_| {
                let keys = vec!["a".to_owned(), "b".to_owned()];
                while !stop_ref.load(Ordering::SeqCst) {
                    let results = store_ref.read(&keys);
                    assert_eq!(
                        results[0].1, results[1].1,
                        "read batch saw half of a write batch"
                    );
                }
            });
        }
    })
    .unwrap();
}

#[test]
fn mixed_write_and_delete_batches_make_progress() {
    let store = Store::new();

    scope(|s| {
        for i in 0..8 {
            let store = &store;
            s.spawn(move |_| {
                let value = format!("v{i}");
                let keys: Vec<String> = KEYS.iter().map(|k| (*k).to_owned()).collect();
                for round in 0..30 {
                    if (round + i) % 3 == 0 {
                        store.delete(&keys);
                    } else {
                        store.write(&batch(&value)).unwrap();
                    }
                }
            });
        }
    })
    .unwrap();
    // Reaching this point at all is the deadlock-freedom assertion.
}

#[test]
fn backups_never_exceed_their_slot_budget() {
    let store = Store::new();
    for i in 0..50 {
        store
            .write(&[(format!("key{i}"), format!("{i}"))])
            .unwrap();
    }

    let engine = Arc::new(BackupEngine::new(2));
    let dir = TempDir::new().unwrap();
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));

    let sampler = {
        let engine = engine.clone();
        let peak = peak.clone();
        let done = done.clone();
        thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                peak.fetch_max(engine.in_flight(), Ordering::SeqCst);
                thread::sleep(Duration::from_micros(200));
            }
        })
    };

    scope(|s| {
        for t in 0..6 {
            let engine = engine.clone();
            let store = &store;
            let dir = dir.path().to_owned();
            s.spawn(move |_| {
                for n in 0..5 {
                    engine
                        .backup(store, &dir.join(format!("job{t}-{n}.bck")))
                        .unwrap();
                }
            });
        }
    })
    .unwrap();

    done.store(true, Ordering::SeqCst);
    sampler.join().unwrap();
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(engine.in_flight(), 0);
}

#[test]
fn concurrent_backups_are_consistent_snapshots() {
    let store = Store::new();
    store
        .write(&[("x".to_owned(), "start".to_owned())])
        .unwrap();
    let dir = TempDir::new().unwrap();
    let engine = BackupEngine::new(4);

    scope(|s| {
        let store_ref = &store;
        let engine_ref = &engine;
        let dir_path = dir.path();
        s.spawn(move |_| {
            for i in 0..200 {
                store_ref
                    .write(&[("x".to_owned(), format!("{i}"))])
                    .unwrap();
            }
        });
        s.spawn(move |_| {
            for n in 0..20 {
                engine_ref
                    .backup(store_ref, &dir_path.join(format!("snap-{n}.bck")))
                    .unwrap();
            }
        });
    })
    .unwrap();

    // Each backup is one line, `(x, <value>)`, never empty or torn.
    for n in 0..20 {
        let text = std::fs::read_to_string(dir.path().join(format!("snap-{n}.bck"))).unwrap();
        assert!(
            text.starts_with("(x, ") && text.ends_with(")\n") && text.lines().count() == 1,
            "torn backup: {text:?}"
        );
    }
}
