use std::thread;

mod test_utils;

use test_utils::*;

#[test]
// Two threads insert ten thousand distinct keys each; the final scan sees
// all twenty thousand in order.
fn test_two_writers() {
    let (index, path) = open_default("conc_two_writers");

    let mut workers = vec![];
    for t in 0..2 {
        let local_index = index.clone();
        workers.push(thread::spawn(move || {
            let mut h = local_index.handle();
            for i in 0..10_000 {
                let key = format!("t{}-{:06}", t, i);
                let val = format!("v{}-{:06}", t, i);
                h.insert_key(key.as_bytes(), val.as_bytes(), 0, true).unwrap();
            }
        }));
    }
    for w in workers {
        w.join().unwrap();
    }

    let mut h = index.handle();
    let rows = collect_scan(&mut h);
    assert_eq!(rows.len(), 20_000);
    assert!(rows.windows(2).all(|w| w[0].0 < w[1].0));

    assert_eq!(h.check_integrity().unwrap(), 20_000);

    let _ = std::fs::remove_file(&path);
}

#[test]
// N threads each insert M distinct keys; a scan returns exactly N*M keys.
fn test_many_writers() {
    let (index, path) = open_default("conc_many_writers");

    let threads = 4;
    let per_thread = 1500;

    let mut workers = vec![];
    for t in 0..threads {
        let local_index = index.clone();
        workers.push(thread::spawn(move || {
            let mut h = local_index.handle();
            for i in 0..per_thread {
                let key = format!("w{}-{:05}", t, i);
                h.insert_key(key.as_bytes(), b"payload", 0, true).unwrap();
            }
        }));
    }
    for w in workers {
        w.join().unwrap();
    }

    let mut h = index.handle();
    assert_eq!(h.check_integrity().unwrap(), (threads * per_thread) as u64);

    let _ = std::fs::remove_file(&path);
}

#[test]
// Writers and readers share the pool; every acknowledged insert is
// immediately visible to any thread.
fn test_readers_chase_writers() {
    let (index, path) = open_default("conc_read_write");

    let (sender, receiver) = crossbeam::channel::unbounded::<Vec<u8>>();

    let mut workers = vec![];
    for t in 0..2 {
        let local_index = index.clone();
        let local_sender = sender.clone();
        workers.push(thread::spawn(move || {
            let mut h = local_index.handle();
            for i in 0..2000 {
                let key = format!("rw{}-{:05}", t, i);
                h.insert_key(key.as_bytes(), b"x", 0, true).unwrap();
                local_sender.send(key.into_bytes()).unwrap();
            }
        }));
    }
    drop(sender);

    for _ in 0..2 {
        let local_index = index.clone();
        let local_receiver = receiver.clone();
        workers.push(thread::spawn(move || {
            let mut h = local_index.handle();
            while let Ok(key) = local_receiver.recv() {
                assert_eq!(h.get(&key).unwrap(), Some(b"x".to_vec()));
            }
        }));
    }

    for w in workers {
        w.join().unwrap();
    }

    let _ = std::fs::remove_file(&path);
}

#[test]
#[cfg(feature = "benchmark")]
fn test_speed() {
    use std::env;

    use log::info;

    let action_per_thread = env::var("ACTION_PER_THREAD")
        .unwrap()
        .parse::<usize>()
        .unwrap();
    let thread_count = env::var("THREAD_COUNT").unwrap().parse::<usize>().unwrap();

    let (index, path) = open_default("conc_speed");

    let start = std::time::Instant::now();
    let mut workers = vec![];
    for t in 0..thread_count {
        let local_index = index.clone();
        workers.push(thread::spawn(move || {
            let mut h = local_index.handle();
            for i in 0..action_per_thread {
                let key = format!("s{}-{:08}", t, i);
                h.insert_key(key.as_bytes(), b"payload", 0, true).unwrap();
            }
        }));
    }
    for w in workers {
        w.join().unwrap();
    }
    let duration = start.elapsed();
    info!("{} insertion threads took: {:?}", thread_count, duration);
    info!("ms:{:?}", duration.as_millis());

    let mut h = index.handle();
    let total = (thread_count * action_per_thread) as u64;
    assert_eq!(h.check_integrity().unwrap(), total);

    let _ = std::fs::remove_file(&path);
}

#[test]
// Interleaved inserts and deletes through a channel leave exactly the
// undeleted keys behind.
fn test_insert_delete_interleaved() {
    let (index, path) = open_default("conc_insert_delete");

    let (sender, receiver) = crossbeam::channel::unbounded::<Vec<u8>>();

    let inserters: Vec<_> = (0..2)
        .map(|t| {
            let local_index = index.clone();
            let local_sender = sender.clone();
            thread::spawn(move || {
                let mut h = local_index.handle();
                for i in 0..1500 {
                    let key = format!("d{}-{:05}", t, i);
                    h.insert_key(key.as_bytes(), b"x", 0, true).unwrap();
                    local_sender.send(key.into_bytes()).unwrap();
                }
            })
        })
        .collect();

    let deleters: Vec<_> = (0..2)
        .map(|_| {
            let local_index = index.clone();
            let local_receiver = receiver.clone();
            thread::spawn(move || {
                let mut h = local_index.handle();
                let mut deleted = 0;
                while let Ok(key) = local_receiver.recv() {
                    h.delete_key(&key, 0, true).unwrap();
                    deleted += 1;
                }
                deleted
            })
        })
        .collect();

    for w in inserters {
        w.join().unwrap();
    }
    drop(sender);

    let mut total_deleted = 0;
    for w in deleters {
        total_deleted += w.join().unwrap();
    }
    assert_eq!(total_deleted, 3000);

    let mut h = index.handle();
    assert_eq!(h.check_integrity().unwrap(), 0);

    let _ = std::fs::remove_file(&path);
}
