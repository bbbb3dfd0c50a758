//! Transaction runner built from a configuration file

use anyhow::Result;
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::time::Instant;
use txretry_config::ConfigLoader;
use txretry_resilience::{RetryPolicy, TransactionRunner};
use txretry_storage::{DeadlockDetected, InMemoryStore, StorageError};

const CONFIG: &str = r#"
retry:
  retry_on:
    - DeadlockDetected
  max_retries: 2
  wait_times: [1, 3]
  fuzz: false
  auto_retry: true
logging:
  level: debug
  format: compact
"#;

fn write_config(content: &str) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(content.as_bytes())?;
    Ok(file)
}

#[tokio::test(start_paused = true)]
async fn test_auto_retry_from_config_file() -> Result<()> {
    let file = write_config(CONFIG)?;
    let config = ConfigLoader::with_prefix("TXRETRY_CONFIGURED_RUNNER_TEST").from_file(file.path())?;
    txretry_logging::init_logging_from_config(&config.logging)?;

    let runner = TransactionRunner::from_config(&config.retry);
    assert!(runner.is_retrying());

    let store = InMemoryStore::new();
    let conn = store.connect();
    let runs = Arc::new(AtomicU32::new(0));

    let started = Instant::now();
    let err = runner
        .transaction(conn.as_ref(), |_tx| {
            let runs = runs.clone();
            Box::pin(async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StorageError::statement(DeadlockDetected::new("victim")))
            })
        })
        .await
        .unwrap_err();

    assert!(err.statement_error().is_some_and(|e| e.is::<DeadlockDetected>()));
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    // Configured waits of 1s and 3s
    assert_eq!(started.elapsed(), Duration::from_secs(4));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_plain_runner_by_default() -> Result<()> {
    let config = ConfigLoader::with_prefix("TXRETRY_CONFIGURED_RUNNER_TEST").from_yaml("retry:\n  max_retries: 5\n")?;
    let runner = TransactionRunner::from_config(&config.retry);
    assert!(!runner.is_retrying());

    let store = InMemoryStore::new();
    let conn = store.connect();
    let runs = Arc::new(AtomicU32::new(0));

    runner
        .transaction(conn.as_ref(), |_tx| {
            let runs = runs.clone();
            Box::pin(async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StorageError::statement(DeadlockDetected::new("victim")))
            })
        })
        .await
        .unwrap_err();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_invalid_wait_time_is_rejected() {
    let loader = ConfigLoader::with_prefix("TXRETRY_CONFIGURED_RUNNER_TEST");
    assert!(loader
        .from_yaml("retry:\n  wait_times: [1, 100000]\n")
        .is_err());
}

#[test]
fn test_policy_mirrors_defaults() {
    let config = ConfigLoader::with_prefix("TXRETRY_CONFIGURED_RUNNER_TEST")
        .from_yaml("{}")
        .unwrap();
    let policy = RetryPolicy::from_config(&config.retry);

    let names: Vec<&str> = policy.retry_on.iter().map(|c| c.name()).collect();
    assert_eq!(names, vec!["SerializationFailure", "DeadlockDetected"]);
    assert_eq!(policy.max_retries, 3);
    assert!(policy.backoff.is_fuzzed());
    assert!(!policy.auto_retry);
}
