//! End-to-end scenarios over the public surface: a subject feeding an
//! operator pipeline into plain subscribers.

use parking_lot::Mutex;
use rand::Rng;
use rill::{
    create_replay_subject, create_subject,
    operator::{buffer_count, debounce, filter, map, merge_map, unique, with_latest_from},
    from_iter, scheduler, Receiver,
};
use std::{sync::Arc, time::Duration};

/// Run ready tasks and drain the delivery scheduler.
async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    scheduler::global().flush().await;
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn filter_keeps_the_even_numbers() {
    let subject = create_subject::<i32>();
    let even = subject.pipe(filter(|v: &i32| v % 2 == 0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let errors = Arc::new(Mutex::new(0));
    let (s, e) = (seen.clone(), errors.clone());
    let _sub = even.subscribe_with(
        Receiver::next(move |v: i32| s.lock().push(v)).on_error(move |_| *e.lock() += 1),
    );
    for v in [1, 2, 3, 4] {
        subject.next(v);
    }
    subject.complete();
    settle().await;
    assert_eq!(*seen.lock(), vec![2, 4]);
    assert_eq!(*errors.lock(), 0);
}

#[tokio::test(start_paused = true)]
async fn debounce_emits_only_the_last_of_a_tight_burst() {
    let subject = create_subject::<i32>();
    let calm = subject.pipe(debounce(Duration::from_millis(50)));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    let _sub = calm.subscribe(move |v| s.lock().push(v));
    subject.next(1);
    settle().await;
    tokio::time::advance(Duration::from_millis(10)).await;
    subject.next(2);
    settle().await;
    tokio::time::advance(Duration::from_millis(10)).await;
    subject.next(3);
    settle().await;
    tokio::time::advance(Duration::from_millis(5)).await;
    subject.complete();
    settle().await;
    assert_eq!(*seen.lock(), vec![3]);
}

#[tokio::test]
async fn buffer_count_partitions_and_flushes_the_remainder() {
    let subject = create_subject::<i32>();
    let pairs = subject.pipe(buffer_count(2));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    let _sub = pairs.subscribe(move |v| s.lock().push(v));
    for v in [1, 2, 3, 4, 5] {
        subject.next(v);
    }
    subject.complete();
    settle().await;
    assert_eq!(*seen.lock(), vec![vec![1, 2], vec![3, 4], vec![5]]);
}

#[tokio::test]
async fn buffer_count_partition_law_holds_for_random_lengths() {
    let mut rng = rand::thread_rng();
    for _ in 0..10 {
        let count: usize = rng.gen_range(1..60);
        let size: usize = rng.gen_range(1..8);
        let subject = create_subject::<usize>();
        let chunks = subject.pipe(buffer_count(size));
        let seen = Arc::new(Mutex::new(Vec::<Vec<usize>>::new()));
        let s = seen.clone();
        let _sub = chunks.subscribe(move |v| s.lock().push(v));
        for v in 0..count {
            subject.next(v);
        }
        subject.complete();
        settle().await;
        let chunks = seen.lock().clone();
        let full = chunks.iter().filter(|c| c.len() == size).count();
        assert!(full >= count / size || size == 1);
        assert_eq!(chunks.iter().map(Vec::len).sum::<usize>(), count);
        let partial = chunks.iter().filter(|c| c.len() < size).count();
        assert_eq!(partial, usize::from(count % size > 0));
    }
}

#[tokio::test]
async fn with_latest_from_gates_until_the_auxiliary_has_emitted() {
    let source = create_subject::<&'static str>();
    let aux = create_subject::<i32>();
    let paired = source.pipe(with_latest_from(aux.stream()));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    let _sub = paired.subscribe(move |v| s.lock().push(v));
    source.next("a");
    settle().await;
    aux.next(1);
    settle().await;
    source.next("b");
    settle().await;
    assert_eq!(*seen.lock(), vec![("b", 1)]);
}

#[tokio::test]
async fn replay_subject_replays_then_goes_live_then_completes() {
    let subject = create_replay_subject(2);
    subject.next(1);
    subject.next(2);
    subject.next(3);
    let log = Arc::new(Mutex::new(Vec::new()));
    let (l1, l2) = (log.clone(), log.clone());
    let _sub = subject.subscribe_with(
        Receiver::next(move |v: i32| l1.lock().push(format!("next {}", v)))
            .on_complete(move || l2.lock().push("complete".to_owned())),
    );
    assert_eq!(*log.lock(), vec!["next 2".to_owned(), "next 3".to_owned()]);
    subject.next(4);
    assert_eq!(
        *log.lock(),
        vec!["next 2".to_owned(), "next 3".to_owned(), "next 4".to_owned()]
    );
    subject.complete();
    settle().await;
    assert_eq!(
        *log.lock(),
        vec![
            "next 2".to_owned(),
            "next 3".to_owned(),
            "next 4".to_owned(),
            "complete".to_owned()
        ]
    );
}

#[tokio::test]
async fn merge_map_interleaves_inners_and_completes() {
    let subject = create_subject::<i32>();
    let fanned = subject.pipe(merge_map(|n: i32, _| from_iter(vec![n * 10, n * 10 + 1])));
    let log = Arc::new(Mutex::new(Vec::new()));
    let completions = Arc::new(Mutex::new(0));
    let (l, c) = (log.clone(), completions.clone());
    let _sub = fanned.subscribe_with(
        Receiver::next(move |v: i32| l.lock().push(v)).on_complete(move || *c.lock() += 1),
    );
    subject.next(1);
    subject.next(2);
    subject.complete();
    settle().await;
    let mut seen = log.lock().clone();
    seen.sort_unstable();
    assert_eq!(seen, vec![10, 11, 20, 21]);
    assert_eq!(*completions.lock(), 1);
}

#[tokio::test]
async fn a_longer_pipeline_composes_end_to_end() {
    let subject = create_subject::<i32>();
    let processed = subject
        .pipe(unique())
        .pipe(filter(|v: &i32| v % 2 == 0))
        .pipe(map(|v: i32| v * 10))
        .pipe(buffer_count(2));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    let _sub = processed.subscribe(move |v| s.lock().push(v));
    for v in [1, 2, 2, 3, 4, 4, 5, 6] {
        subject.next(v);
    }
    subject.complete();
    settle().await;
    assert_eq!(*seen.lock(), vec![vec![20, 40], vec![60]]);
}

#[tokio::test]
async fn unsubscribing_mid_stream_stops_delivery_for_that_subscriber_only() {
    let subject = create_subject::<i32>();
    let a = Arc::new(Mutex::new(Vec::new()));
    let b = Arc::new(Mutex::new(Vec::new()));
    let (s1, s2) = (a.clone(), b.clone());
    let sub_a = subject.subscribe(move |v| s1.lock().push(v));
    let _sub_b = subject.subscribe(move |v| s2.lock().push(v));
    subject.next(1);
    sub_a.unsubscribe();
    sub_a.unsubscribe();
    subject.next(2);
    settle().await;
    assert_eq!(*a.lock(), vec![1]);
    assert_eq!(*b.lock(), vec![1, 2]);
}
