//! End-to-end tests against a live Redis at 127.0.0.1:6379.
//!
//! Each test works in its own randomly named queue, so the suite can
//! run in parallel and never needs to flush the database.

use rand::Rng as _;
use reliq::{
    Direction, ExpiryAction, FailedAction, QueueConfig, QueueError, ReliableQueue,
    RemoveFailedOptions, Sublist,
};
use std::time::{Duration, Instant};

fn queue_name() -> String {
    let rng = rand::thread_rng();
    let suffix: Vec<u8> = rng
        .sample_iter(rand::distributions::Alphanumeric)
        .take(12)
        .collect();
    let suffix = String::from_utf8(suffix).expect("from_utf8");
    format!("reliq-test-{suffix}")
}

fn config(queue_name: &str) -> QueueConfig {
    QueueConfig::new("127.0.0.1", 6379, queue_name)
}

async fn connect(config: QueueConfig) -> ReliableQueue {
    ReliableQueue::connect(config).await.expect("queue connect")
}

async fn raw_conn() -> redis::aio::MultiplexedConnection {
    redis::Client::open("redis://127.0.0.1:6379/0")
        .expect("redis client")
        .get_multiplexed_async_connection()
        .await
        .expect("redis connection")
}

async fn record_count(conn: &mut redis::aio::MultiplexedConnection, item_key: &str) -> i64 {
    redis::cmd("EXISTS")
        .arg(format!("item-{item_key}"))
        .arg(format!("meta-{item_key}"))
        .query_async(conn)
        .await
        .expect("exists")
}

async fn process_count(conn: &mut redis::aio::MultiplexedConnection, item_key: &str) -> u64 {
    redis::cmd("HGET")
        .arg(format!("meta-{item_key}"))
        .arg("process_count")
        .query_async(conn)
        .await
        .expect("hget process_count")
}

#[tokio::test]
async fn round_trip_preserves_order_and_cleans_up() {
    let name = queue_name();
    let mut queue = connect(config(&name)).await;
    let mut raw = raw_conn().await;

    queue
        .enqueue_items(vec!["a", "b", "c"])
        .await
        .expect("enqueue");

    let claimed = queue.claim_items_nonblocking(3).await.expect("claim");
    let payloads: Vec<&[u8]> = claimed.iter().map(|item| item.payload.as_slice()).collect();
    assert_eq!(payloads, vec![&b"a"[..], &b"b"[..], &b"c"[..]]);
    for item in &claimed {
        assert_eq!(item.meta.process_count, 1);
    }

    let keys: Vec<String> = claimed.iter().map(|item| item.key.to_string()).collect();
    let outcome = queue.mark_items_as_processed(claimed).await.expect("ack");
    assert_eq!(outcome.flushed.len(), 3);
    assert!(outcome.failed.is_empty());

    assert_eq!(queue.queue_length(Sublist::Unprocessed).await.expect("llen"), 0);
    assert_eq!(queue.queue_length(Sublist::Working).await.expect("llen"), 0);
    for key in &keys {
        assert_eq!(record_count(&mut raw, key).await, 0);
    }
}

#[tokio::test]
async fn poison_items_divert_to_the_failed_sublist() {
    let name = queue_name();
    let mut queue = connect(config(&name).with_requeue_limit(2)).await;
    let mut raw = raw_conn().await;

    queue.enqueue_items(vec!["x"]).await.expect("enqueue");

    // Each claim and each busy requeue counts an attempt, so with a
    // limit of 2 the second requeue pushes the count past it.
    let mut cycles = 0;
    loop {
        let mut items = queue.claim_items_nonblocking(1).await.expect("claim");
        let Some(item) = items.pop() else {
            break;
        };
        cycles += 1;
        let moved = queue
            .requeue_busy_error("boom", &[item])
            .await
            .expect("requeue");
        assert_eq!(moved, 1);
        assert!(cycles < 10, "item never diverted");
    }
    assert_eq!(cycles, 2);

    assert_eq!(queue.queue_length(Sublist::Failed).await.expect("llen"), 1);
    assert_eq!(queue.queue_length(Sublist::Unprocessed).await.expect("llen"), 0);

    let parked = queue.raw_items_failed(0).await.expect("raw failed");
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].meta.last_error.as_deref(), Some("boom"));
    assert_eq!(parked[0].meta.bail_count, 1);
    assert!(parked[0].meta.process_count > 2);
    assert_eq!(record_count(&mut raw, &parked[0].key).await, 2);
}

#[tokio::test]
async fn expired_items_are_reclaimed() {
    let name = queue_name();
    let mut queue = connect(config(&name).with_busy_expiry_time(Duration::from_secs(1))).await;
    let mut raw = raw_conn().await;

    queue.enqueue_items(vec!["y"]).await.expect("enqueue");
    let claimed = queue.claim_items_nonblocking(1).await.expect("claim");
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].meta.process_count, 1);

    tokio::time::sleep(Duration::from_secs(2)).await;

    let recovered = queue
        .handle_expired_items(None, ExpiryAction::Requeue)
        .await
        .expect("reclaim");
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].payload, b"y");

    assert_eq!(queue.queue_length(Sublist::Unprocessed).await.expect("llen"), 1);
    assert_eq!(queue.queue_length(Sublist::Working).await.expect("llen"), 0);
    assert_eq!(process_count(&mut raw, &recovered[0].key).await, 2);
}

#[tokio::test]
async fn dropping_expired_items_leaves_their_records() {
    let name = queue_name();
    let mut queue = connect(config(&name).with_busy_expiry_time(Duration::from_secs(1))).await;
    let mut raw = raw_conn().await;

    queue.enqueue_items(vec!["z"]).await.expect("enqueue");
    queue.claim_items_nonblocking(1).await.expect("claim");
    tokio::time::sleep(Duration::from_secs(2)).await;

    let dropped = queue
        .handle_expired_items(None, ExpiryAction::Drop)
        .await
        .expect("drop");
    assert_eq!(dropped.len(), 1);
    assert_eq!(queue.queue_length(Sublist::Working).await.expect("llen"), 0);
    assert_eq!(queue.queue_length(Sublist::Unprocessed).await.expect("llen"), 0);
    // The records leak on purpose so an operator can inspect them.
    assert_eq!(record_count(&mut raw, &dropped[0].key).await, 2);
}

#[tokio::test]
async fn bulk_claims_return_short_batches() {
    let name = queue_name();
    let mut queue = connect(config(&name)).await;

    queue
        .enqueue_items(vec!["1", "2", "3"])
        .await
        .expect("enqueue");

    let claimed = queue.claim_items_nonblocking(10).await.expect("claim");
    assert_eq!(claimed.len(), 3);

    let stats = queue.stats().await.expect("stats");
    assert_eq!(stats.unprocessed, 0);
    assert_eq!(stats.working, 3);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.total(), 3);

    let empty = queue.claim_items_nonblocking(10).await.expect("claim");
    assert!(empty.is_empty());
}

#[tokio::test]
async fn blocking_claims_time_out_on_an_empty_queue() {
    let name = queue_name();
    let mut queue = connect(config(&name).with_claim_wait_timeout(Duration::from_secs(1))).await;

    let started = Instant::now();
    let claimed = queue.claim_items(1).await.expect("claim");
    assert!(claimed.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(900));
}

#[tokio::test]
async fn unclaimed_items_go_back_to_the_front_of_the_line() {
    let name = queue_name();
    let mut queue = connect(config(&name)).await;

    queue.enqueue_items(vec!["a", "b"]).await.expect("enqueue");

    let mut items = queue.claim_items_nonblocking(1).await.expect("claim");
    let first = items.pop().expect("one item");
    assert_eq!(first.payload, b"a");

    let moved = queue.unclaim(&[first]).await.expect("unclaim");
    assert_eq!(moved, 1);
    assert_eq!(queue.queue_length(Sublist::Unprocessed).await.expect("llen"), 2);

    let mut items = queue.claim_items_nonblocking(1).await.expect("claim");
    let again = items.pop().expect("one item");
    assert_eq!(again.payload, b"a");
    // Unclaiming did not count as an attempt; the two claims did.
    assert_eq!(again.meta.process_count, 2);
}

#[tokio::test]
async fn acknowledging_a_reclaimed_item_reports_it_as_failed() {
    let name = queue_name();
    let mut queue = connect(config(&name)).await;

    queue.enqueue_items(vec!["once"]).await.expect("enqueue");
    let claimed = queue.claim_items_nonblocking(1).await.expect("claim");

    let outcome = queue.mark_items_as_processed(claimed).await.expect("ack");
    assert_eq!(outcome.flushed.len(), 1);

    // A second acknowledgement finds nothing to remove and must not
    // error.
    let outcome = queue
        .mark_items_as_processed(outcome.flushed)
        .await
        .expect("re-ack");
    assert!(outcome.flushed.is_empty());
    assert_eq!(outcome.failed.len(), 1);
}

#[tokio::test]
async fn failed_retention_filter_keeps_young_items() {
    let name = queue_name();
    let mut queue = connect(config(&name).with_requeue_limit(0)).await;
    let mut raw = raw_conn().await;

    queue
        .enqueue_items(vec!["old", "fresh"])
        .await
        .expect("enqueue");
    let claimed = queue.claim_items_nonblocking(2).await.expect("claim");
    assert_eq!(claimed.len(), 2);
    let old_key = claimed[0].key.to_string();
    let fresh_key = claimed[1].key.to_string();

    // With a requeue limit of 0, any busy requeue parks the item.
    let parked = queue.requeue_busy(&claimed).await.expect("requeue");
    assert_eq!(parked, 2);
    assert_eq!(queue.queue_length(Sublist::Failed).await.expect("llen"), 2);

    let _: () = redis::cmd("HSET")
        .arg(format!("meta-{old_key}"))
        .arg("process_count")
        .arg(10)
        .query_async(&mut raw)
        .await
        .expect("hset");
    let _: () = redis::cmd("HSET")
        .arg(format!("meta-{fresh_key}"))
        .arg("process_count")
        .arg(0)
        .query_async(&mut raw)
        .await
        .expect("hset");

    let (removed, examined) = queue
        .remove_failed_items(RemoveFailedOptions {
            min_fail_count: Some(5),
            ..RemoveFailedOptions::default()
        })
        .await
        .expect("remove");
    assert_eq!(removed, 1);
    assert_eq!(examined, 2);

    assert_eq!(queue.queue_length(Sublist::Failed).await.expect("llen"), 1);
    let kept = queue.raw_items_failed(0).await.expect("raw failed");
    assert_eq!(kept[0].key.to_string(), fresh_key);
    assert_eq!(record_count(&mut raw, &old_key).await, 0);
    assert_eq!(record_count(&mut raw, &fresh_key).await, 2);
}

#[tokio::test]
async fn processing_failed_items_retains_the_overflow() {
    let name = queue_name();
    let mut queue = connect(config(&name).with_requeue_limit(0)).await;

    queue
        .enqueue_items(vec!["a", "b", "c"])
        .await
        .expect("enqueue");
    let claimed = queue.claim_items_nonblocking(3).await.expect("claim");
    queue.requeue_busy(&claimed).await.expect("requeue");
    assert_eq!(queue.queue_length(Sublist::Failed).await.expect("llen"), 3);

    let mut seen = 0;
    let (item_count, error_count) = queue
        .process_failed_items(2, |_item| {
            seen += 1;
            if seen == 1 {
                Err("nope".into())
            } else {
                Ok(())
            }
        })
        .await
        .expect("process");
    assert_eq!(item_count, 2);
    assert_eq!(error_count, 1);
    assert_eq!(seen, 2);

    // The item beyond the limit went back to the failed sublist.
    assert_eq!(queue.queue_length(Sublist::Failed).await.expect("llen"), 1);
}

#[tokio::test]
async fn processing_an_empty_failed_sublist_is_a_no_op() {
    let name = queue_name();
    let mut queue = connect(config(&name)).await;

    let (item_count, error_count) = queue
        .process_failed_items(0, |_item| Ok(()))
        .await
        .expect("process");
    assert_eq!(item_count, 0);
    assert_eq!(error_count, 0);
}

#[tokio::test]
async fn handling_failed_items_can_requeue_them_unchanged() {
    let name = queue_name();
    let mut queue = connect(config(&name).with_requeue_limit(0)).await;
    let mut raw = raw_conn().await;

    queue.enqueue_items(vec!["retry-me"]).await.expect("enqueue");
    let claimed = queue.claim_items_nonblocking(1).await.expect("claim");
    queue
        .requeue_busy_error("boom", &claimed)
        .await
        .expect("requeue");
    assert_eq!(queue.queue_length(Sublist::Failed).await.expect("llen"), 1);
    let key = claimed[0].key.to_string();
    let parked_count = process_count(&mut raw, &key).await;

    let handled = queue
        .handle_failed_items(FailedAction::Requeue)
        .await
        .expect("handle");
    assert_eq!(handled.len(), 1);
    assert_eq!(queue.queue_length(Sublist::Failed).await.expect("llen"), 0);
    assert_eq!(queue.queue_length(Sublist::Unprocessed).await.expect("llen"), 1);
    // Resurrection is not an attempt; the count stays put.
    assert_eq!(process_count(&mut raw, &key).await, parked_count);
}

#[tokio::test]
async fn handling_failed_items_can_hand_them_to_the_caller() {
    let name = queue_name();
    let mut queue = connect(config(&name).with_requeue_limit(0)).await;
    let mut raw = raw_conn().await;

    queue.enqueue_items(vec!["take-me"]).await.expect("enqueue");
    let claimed = queue.claim_items_nonblocking(1).await.expect("claim");
    queue.requeue_busy(&claimed).await.expect("requeue");

    let handled = queue
        .handle_failed_items(FailedAction::Return)
        .await
        .expect("handle");
    assert_eq!(handled.len(), 1);
    assert_eq!(handled[0].payload, b"take-me");
    assert_eq!(queue.queue_length(Sublist::Failed).await.expect("llen"), 0);
    // The records stay behind for inspection.
    assert_eq!(record_count(&mut raw, &handled[0].key).await, 2);
}

#[tokio::test]
async fn retried_failed_items_resume_their_attempt_count() {
    let name = queue_name();
    let mut queue = connect(config(&name).with_requeue_limit(0)).await;
    let mut raw = raw_conn().await;

    queue.enqueue_items(vec!["stubborn"]).await.expect("enqueue");
    let claimed = queue.claim_items_nonblocking(1).await.expect("claim");
    queue.requeue_busy(&claimed).await.expect("requeue");
    let key = claimed[0].key.to_string();
    let parked_count = process_count(&mut raw, &key).await;

    let parked = queue.raw_items_failed(0).await.expect("raw failed");
    let moved = queue.requeue_failed_items(&parked).await.expect("retry");
    assert_eq!(moved, 1);

    assert_eq!(queue.queue_length(Sublist::Unprocessed).await.expect("llen"), 1);
    assert_eq!(queue.queue_length(Sublist::Failed).await.expect("llen"), 0);
    assert_eq!(process_count(&mut raw, &key).await, parked_count + 1);
}

#[tokio::test]
async fn peeking_is_not_destructive() {
    let name = queue_name();
    let mut queue = connect(config(&name)).await;

    queue.enqueue_items(vec!["p", "q"]).await.expect("enqueue");

    let front = queue
        .peek_item(Sublist::Unprocessed, Direction::Front)
        .await
        .expect("peek")
        .expect("front item");
    assert_eq!(front.payload, b"p");

    let back = queue
        .peek_item(Sublist::Unprocessed, Direction::Back)
        .await
        .expect("peek")
        .expect("back item");
    assert_eq!(back.payload, b"q");

    assert_eq!(queue.queue_length(Sublist::Unprocessed).await.expect("llen"), 2);

    let age = queue
        .get_item_age(Sublist::Unprocessed)
        .await
        .expect("age")
        .expect("an age");
    assert!(age < Duration::from_secs(30));
    assert!(queue
        .get_item_age(Sublist::Working)
        .await
        .expect("age")
        .is_none());
}

#[tokio::test]
async fn flushing_removes_lists_and_records() {
    let name = queue_name();
    let mut queue = connect(config(&name)).await;
    let mut raw = raw_conn().await;

    let items = queue
        .enqueue_items(vec!["keep", "busy"])
        .await
        .expect("enqueue");
    queue.claim_items_nonblocking(1).await.expect("claim");

    queue.flush_queue().await.expect("flush");

    let stats = queue.stats().await.expect("stats");
    assert_eq!(stats.total(), 0);
    for item in &items {
        assert_eq!(record_count(&mut raw, &item.key).await, 0);
    }

    // Peripheral probe; just exercise it against the live server.
    assert!(queue.percent_memory_used().await.is_ok());
}

#[tokio::test]
async fn usage_errors_are_rejected_up_front() {
    let name = queue_name();
    let mut queue = connect(config(&name)).await;

    let err = queue
        .enqueue_items(Vec::<Vec<u8>>::new())
        .await
        .expect_err("empty enqueue");
    assert!(matches!(err, QueueError::NothingToEnqueue));

    let err = queue
        .claim_items_nonblocking(0)
        .await
        .expect_err("zero claim");
    assert!(matches!(err, QueueError::BadClaimCount { count: 0 }));

    let err = queue
        .remove_failed_items(RemoveFailedOptions::default())
        .await
        .expect_err("no criteria");
    assert!(matches!(err, QueueError::NoRemovalCriteria));
}

#[tokio::test]
async fn single_item_aliases_forward_to_the_bulk_surface() {
    let name = queue_name();
    let mut queue = connect(config(&name)).await;

    queue.enqueue_items(vec!["solo"]).await.expect("enqueue");

    let item = queue
        .claim_item_nonblocking()
        .await
        .expect("claim")
        .expect("an item");
    assert_eq!(item.payload, b"solo");

    let moved = queue.unclaim_item(&item).await.expect("unclaim");
    assert_eq!(moved, 1);

    let item = queue
        .claim_item()
        .await
        .expect("claim")
        .expect("an item");
    let outcome = queue.mark_item_as_done(item).await.expect("ack");
    assert_eq!(outcome.flushed.len(), 1);
    assert_eq!(queue.stats().await.expect("stats").total(), 0);
}
