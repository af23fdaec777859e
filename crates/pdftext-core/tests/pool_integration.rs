//! Integration tests for the [`ConversionPool`].
//!
//! Inputs are plain text files standing in for PDFs, converted by the
//! [`MockBackend`], so no PDF library is involved.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pdftext_core::mock::MockBackend;
use pdftext_core::pool::{ConversionJob, ConversionPool, PoolEvent};
use pdftext_core::{Candidate, ConversionOptions, ConversionResult, ConversionStatus, WorkerContext};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn job(dir: &Path, index: usize, body: &str) -> ConversionJob {
    let name = format!("doc{index}");
    let input_path = dir.join("in").join(format!("{name}.pdf"));
    std::fs::create_dir_all(input_path.parent().unwrap()).unwrap();
    std::fs::write(&input_path, body).unwrap();
    ConversionJob {
        index,
        candidate: Candidate {
            input_path,
            output_path: dir.join("out").join(format!("{name}.txt")),
            relative_path: format!("{name}.pdf").into(),
        },
    }
}

fn context(backend: MockBackend) -> WorkerContext {
    WorkerContext::new(Arc::new(backend), ConversionOptions::default())
}

/// Drain every event until the pool closes the channel.
async fn collect(mut rx: mpsc::UnboundedReceiver<PoolEvent>) -> (usize, Vec<(usize, ConversionResult)>) {
    let mut started = 0;
    let mut finished = Vec::new();
    while let Some(event) = rx.recv().await {
        match event {
            PoolEvent::Started { .. } => started += 1,
            PoolEvent::Finished { index, result } => finished.push((index, result)),
        }
    }
    finished.sort_by_key(|(i, _)| *i);
    (started, finished)
}

#[tokio::test]
async fn single_job_completes() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let pool = ConversionPool::new(
        context(MockBackend::new()),
        2,
        None,
        CancellationToken::new(),
        tx,
    );

    let j = job(dir.path(), 0, "hello");
    let output = j.candidate.output_path.clone();
    assert!(pool.submit(j).await);
    pool.shutdown().await;

    let (started, finished) = collect(rx).await;
    assert_eq!(started, 1);
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].1.status, ConversionStatus::Converted);
    assert_eq!(std::fs::read_to_string(output).unwrap(), "hello");
}

#[tokio::test]
async fn results_are_attributed_by_index() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let backend = MockBackend::new().with_slow_delay(Duration::from_millis(50));
    let pool = ConversionPool::new(context(backend), 3, None, CancellationToken::new(), tx);

    let total = 6;
    for i in 0..total {
        // Early jobs are slow so completion order differs from submission order
        let body = if i < 2 { format!("%SLOW {i}") } else { format!("doc {i}") };
        assert!(pool.submit(job(dir.path(), i, &body)).await);
    }
    pool.shutdown().await;

    let (started, finished) = collect(rx).await;
    assert_eq!(started, total);
    assert_eq!(finished.len(), total);
    for (i, result) in &finished {
        assert_eq!(
            result.candidate.input_path.file_name().unwrap(),
            format!("doc{i}.pdf").as_str()
        );
        assert!(result.is_success());
    }
}

#[tokio::test]
async fn one_failure_does_not_affect_others() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let pool = ConversionPool::new(
        context(MockBackend::new()),
        2,
        None,
        CancellationToken::new(),
        tx,
    );

    pool.submit(job(dir.path(), 0, "fine")).await;
    pool.submit(job(dir.path(), 1, "%ENCRYPTED")).await;
    pool.submit(job(dir.path(), 2, "%PANIC")).await;
    pool.submit(job(dir.path(), 3, "also fine")).await;
    pool.shutdown().await;

    let (_, finished) = collect(rx).await;
    let statuses: Vec<_> = finished.iter().map(|(_, r)| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            ConversionStatus::Converted,
            ConversionStatus::Failed,
            ConversionStatus::Failed,
            ConversionStatus::Converted,
        ]
    );
    assert!(finished[2].1.error.as_deref().unwrap().contains("panicked"));
}

#[tokio::test]
async fn timeout_marks_job_failed() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let backend = MockBackend::new().with_slow_delay(Duration::from_secs(1));
    let pool = ConversionPool::new(
        context(backend),
        1,
        Some(Duration::from_millis(100)),
        CancellationToken::new(),
        tx,
    );

    let j = job(dir.path(), 0, "%SLOW");
    let output = j.candidate.output_path.clone();
    pool.submit(j).await;
    pool.shutdown().await;

    let (_, finished) = collect(rx).await;
    assert_eq!(finished[0].1.status, ConversionStatus::Failed);
    assert!(finished[0].1.error.as_deref().unwrap().contains("timed out"));

    // The abandoned extraction finishes in the background and must not write
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!output.exists());
    assert!(!output.parent().unwrap().exists());
}

#[tokio::test]
async fn cancellation_drops_queued_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let pool = ConversionPool::new(context(MockBackend::new()), 2, None, cancel.clone(), tx);

    // Cancel before submitting any jobs
    cancel.cancel();

    let j = job(dir.path(), 0, "never converted");
    let output = j.candidate.output_path.clone();
    assert!(!pool.submit(j).await);
    pool.shutdown().await;

    let (started, finished) = collect(rx).await;
    assert_eq!(started, 0);
    assert!(finished.is_empty());
    assert!(!output.exists());
}
