//! Session behavior: flush modes, buffer budget, error collection.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{all_ids, delete, drain_errors, fixture, insert, update};
use tessera_client::mem::InjectedWriteFault;
use tessera_client::{ClientError, FlushMode, RowErrorCode, Value};
use tokio::sync::oneshot;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn auto_flush_sync_never_leaves_pending_operations() {
    let fx = fixture(&[100]).await;
    let session = fx.client.new_session();

    for id in [1, 50, 150, 250] {
        session.apply(insert(&fx.table, id, "x")).await.unwrap();
        assert!(!session.has_pending_operations());
        assert_eq!(session.count_buffered_operations(), 0);
    }

    assert_eq!(all_ids(&fx.table).await, vec![1, 50, 150, 250]);
    session.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn auto_flush_sync_returns_the_row_error_and_collects_it() {
    let fx = fixture(&[]).await;
    let session = fx.client.new_session();

    session.apply(insert(&fx.table, 7, "first")).await.unwrap();
    let err = session.apply(insert(&fx.table, 7, "dup")).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Row {
            code: RowErrorCode::AlreadyPresent,
            ..
        }
    ));

    let mut errors = drain_errors(&session, 1);
    let op = errors[0].release_failed_op().unwrap();
    assert_eq!(op.row().get("id"), Some(&Value::Int64(7)));
    assert!(!errors[0].was_possibly_successful());
    session.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn manual_flush_buffers_until_flush() {
    let fx = fixture(&[100]).await;
    let session = fx.client.new_session();
    session.set_flush_mode(FlushMode::ManualFlush).unwrap();

    for id in [10, 120, 30] {
        session.apply(insert(&fx.table, id, "x")).await.unwrap();
    }
    assert_eq!(session.count_buffered_operations(), 3);
    assert!(session.has_pending_operations());
    // Nothing dispatched yet.
    assert!(all_ids(&fx.table).await.is_empty());

    session.flush().await.unwrap();
    assert_eq!(session.count_buffered_operations(), 0);
    assert!(!session.has_pending_operations());
    assert_eq!(all_ids(&fx.table).await, vec![10, 30, 120]);
    session.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn manual_flush_budget_rejects_and_returns_the_op() {
    let fx = fixture(&[]).await;
    let session = fx.client.new_session();
    session.set_flush_mode(FlushMode::ManualFlush).unwrap();
    session.set_mutation_buffer_max_ops(2);

    session.apply(insert(&fx.table, 1, "a")).await.unwrap();
    session.apply(insert(&fx.table, 2, "b")).await.unwrap();

    let err = session.apply(insert(&fx.table, 3, "c")).await.unwrap_err();
    assert!(matches!(err, ClientError::BufferSpaceExhausted(_)));
    // The rejected operation is still owned by the caller.
    let op = err.into_rejected_op().unwrap();
    assert_eq!(op.row().get("id"), Some(&Value::Int64(3)));
    assert_eq!(session.count_buffered_operations(), 2);

    session.flush().await.unwrap();
    assert_eq!(all_ids(&fx.table).await, vec![1, 2]);
    session.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_fails_until_pending_work_is_flushed() {
    let fx = fixture(&[]).await;
    let session = fx.client.new_session();
    session.set_flush_mode(FlushMode::ManualFlush).unwrap();

    session.apply(insert(&fx.table, 1, "a")).await.unwrap();
    assert!(matches!(
        session.close(),
        Err(ClientError::IllegalState(_))
    ));

    session.flush().await.unwrap();
    session.close().unwrap();

    // A closed session accepts nothing further.
    let err = session.apply(insert(&fx.table, 2, "b")).await.unwrap_err();
    assert!(matches!(err, ClientError::IllegalState(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn flush_with_nothing_buffered_completes_immediately() {
    let fx = fixture(&[]).await;
    let session = fx.client.new_session();
    session.set_flush_mode(FlushMode::ManualFlush).unwrap();

    session.flush().await.unwrap();

    session.apply(insert(&fx.table, 1, "a")).await.unwrap();
    let (tx1, rx1) = oneshot::channel();
    session.flush_async(move |result| {
        let _ = tx1.send(result);
    });

    // No intervening apply: the second callback fires inline, before any
    // outbound request could have completed.
    let second_fired = Arc::new(AtomicBool::new(false));
    let flag = second_fired.clone();
    session.flush_async(move |result| {
        assert!(result.is_ok());
        flag.store(true, Ordering::SeqCst);
    });
    assert!(second_fired.load(Ordering::SeqCst));

    rx1.await.unwrap().unwrap();
    session.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn flush_reports_partial_failure_and_keeps_the_rest() {
    let fx = fixture(&[]).await;
    let session = fx.client.new_session();
    session.set_flush_mode(FlushMode::ManualFlush).unwrap();

    session.apply(insert(&fx.table, 1, "a")).await.unwrap();
    session.apply(insert(&fx.table, 1, "dup")).await.unwrap();
    session.apply(insert(&fx.table, 2, "b")).await.unwrap();

    let err = session.flush().await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::SomeOperationsFailed { failures: 1 }
    ));

    let errors = drain_errors(&session, 1);
    assert!(matches!(
        errors[0].status(),
        ClientError::Row {
            code: RowErrorCode::AlreadyPresent,
            ..
        }
    ));
    assert_eq!(all_ids(&fx.table).await, vec![1, 2]);
    session.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn error_collector_retains_oldest_and_flags_overflow() {
    let fx = fixture(&[]).await;
    let client = tessera_client::Client::builder()
        .locator(fx.cluster.clone())
        .transport(fx.cluster.clone())
        .error_buffer_capacity(2)
        .build()
        .unwrap();
    let table = client.open_table(common::TABLE).await.unwrap();

    let session = client.new_session();
    session.set_flush_mode(FlushMode::ManualFlush).unwrap();
    // Updates of rows that do not exist: every one fails.
    for id in 1..=4 {
        session.apply(update(&table, id, "x")).await.unwrap();
    }
    let err = session.flush().await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::SomeOperationsFailed { failures: 4 }
    ));

    assert_eq!(session.count_pending_errors(), 2);
    let (errors, overflowed) = session.pending_errors();
    assert!(overflowed);
    let ids: Vec<_> = errors
        .iter()
        .map(|e| e.failed_op().unwrap().row().get("id").cloned().unwrap())
        .collect();
    // FIFO retention: the first two failures survive.
    assert_eq!(ids, vec![Value::Int64(1), Value::Int64(2)]);

    // Under capacity the next window reports no overflow.
    session.apply(update(&table, 9, "x")).await.unwrap();
    assert!(session.flush().await.is_err());
    let (errors, overflowed) = session.pending_errors();
    assert_eq!(errors.len(), 1);
    assert!(!overflowed);
    session.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn background_mode_applies_wait_for_space_instead_of_failing() {
    let fx = fixture(&[]).await;
    let session = fx.client.new_session();
    session
        .set_flush_mode(FlushMode::AutoFlushBackground)
        .unwrap();
    session.set_mutation_buffer_max_ops(1);

    for id in 0..20 {
        session.apply(insert(&fx.table, id, "x")).await.unwrap();
        // Background dispatch keeps the buffered count at zero.
        assert_eq!(session.count_buffered_operations(), 0);
    }

    session.flush().await.unwrap();
    // Flush only waits for the unit it closed; a dwell-timer flush of an
    // earlier unit may still be completing. Wait for quiescence.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while session.has_pending_operations() {
        assert!(std::time::Instant::now() < deadline, "writes never settled");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(all_ids(&fx.table).await, (0..20).collect::<Vec<_>>());
    assert_eq!(session.count_pending_errors(), 0);
    session.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn apply_async_reports_terminal_status_per_operation() {
    let fx = fixture(&[]).await;
    let session = fx.client.new_session();
    session.set_flush_mode(FlushMode::ManualFlush).unwrap();
    session.set_mutation_buffer_max_ops(1);

    let (tx1, rx1) = oneshot::channel();
    session.apply_async(insert(&fx.table, 1, "a"), move |result| {
        let _ = tx1.send(result);
    });

    // Over budget: rejected synchronously, op handed back through the
    // error.
    let (tx2, rx2) = oneshot::channel();
    session.apply_async(insert(&fx.table, 2, "b"), move |result| {
        let _ = tx2.send(result);
    });
    let rejected = rx2.await.unwrap().unwrap_err();
    let op = rejected.into_rejected_op().unwrap();
    assert_eq!(op.row().get("id"), Some(&Value::Int64(2)));

    let (flush_tx, flush_rx) = oneshot::channel();
    session.flush_async(move |result| {
        let _ = flush_tx.send(result);
    });
    flush_rx.await.unwrap().unwrap();
    rx1.await.unwrap().unwrap();

    assert_eq!(all_ids(&fx.table).await, vec![1]);
    session.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timed_out_write_is_flagged_possibly_successful() {
    let fx = fixture(&[100]).await;
    fx.cluster
        .inject_write_fault(common::TABLE, 0, InjectedWriteFault::Stall, 1)
        .unwrap();

    let session = fx.client.new_session();
    session.set_timeout(Duration::from_millis(50));
    session.set_flush_mode(FlushMode::ManualFlush).unwrap();

    // One op per tablet: the stalled tablet must not drag the other down.
    session.apply(insert(&fx.table, 1, "left")).await.unwrap();
    session.apply(insert(&fx.table, 150, "right")).await.unwrap();

    let err = session.flush().await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::SomeOperationsFailed { failures: 1 }
    ));

    let errors = drain_errors(&session, 1);
    assert!(matches!(errors[0].status(), ClientError::TimedOut(_)));
    assert!(errors[0].was_possibly_successful());
    assert_eq!(
        errors[0].failed_op().unwrap().row().get("id"),
        Some(&Value::Int64(1))
    );

    // The stalled server did apply the write: both rows are there, which
    // is exactly why the failure is only "possibly" a failure.
    assert_eq!(all_ids(&fx.table).await, vec![1, 150]);
    session.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_tablets_failure_does_not_block_the_others() {
    let fx = fixture(&[100, 200]).await;
    fx.cluster
        .inject_write_fault(common::TABLE, 1, InjectedWriteFault::Fail, 1)
        .unwrap();

    let session = fx.client.new_session();
    session.set_flush_mode(FlushMode::ManualFlush).unwrap();
    session.apply(insert(&fx.table, 10, "t0")).await.unwrap();
    session.apply(insert(&fx.table, 110, "t1")).await.unwrap();
    session.apply(insert(&fx.table, 210, "t2")).await.unwrap();

    let err = session.flush().await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::SomeOperationsFailed { failures: 1 }
    ));

    let errors = drain_errors(&session, 1);
    assert_eq!(
        errors[0].failed_op().unwrap().row().get("id"),
        Some(&Value::Int64(110))
    );
    // A hard transport failure is not ambiguous.
    assert!(!errors[0].was_possibly_successful());
    assert_eq!(all_ids(&fx.table).await, vec![10, 210]);
    session.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn flush_mode_cannot_change_with_pending_operations() {
    let fx = fixture(&[]).await;
    let session = fx.client.new_session();
    session.set_flush_mode(FlushMode::ManualFlush).unwrap();

    session.apply(insert(&fx.table, 1, "a")).await.unwrap();
    assert!(matches!(
        session.set_flush_mode(FlushMode::AutoFlushSync),
        Err(ClientError::IllegalState(_))
    ));

    session.flush().await.unwrap();
    session.set_flush_mode(FlushMode::AutoFlushSync).unwrap();
    session.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deletes_and_updates_round_trip() {
    let fx = fixture(&[]).await;
    let session = fx.client.new_session();

    session.apply(insert(&fx.table, 1, "a")).await.unwrap();
    session.apply(insert(&fx.table, 2, "b")).await.unwrap();
    session.apply(update(&fx.table, 1, "a2")).await.unwrap();
    session.apply(delete(&fx.table, 2)).await.unwrap();

    // Deleting a missing row is a row error, not a transport error.
    let err = session.apply(delete(&fx.table, 2)).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Row {
            code: RowErrorCode::NotFound,
            ..
        }
    ));
    drain_errors(&session, 1);

    assert_eq!(all_ids(&fx.table).await, vec![1]);
    session.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_op_fails_synchronously_and_is_recoverable() {
    let fx = fixture(&[]).await;
    let session = fx.client.new_session();

    // Key column left unset.
    let mut op = fx.table.new_insert();
    op.row_mut().set("val", Value::String("x".into())).unwrap();
    let err = session.apply(op).await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidArgument(_)));

    let mut errors = drain_errors(&session, 1);
    assert!(errors[0].release_failed_op().is_ok());
    session.close().unwrap();
}
