use futures_ensemble::stream::{self, drain};
use futures_ensemble::{cancel, CancellationToken, Pipeline, PipelineError, StageOptions};
use std::collections::HashMap;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{sleep, timeout};

fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,futures_ensemble=debug"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

#[tokio::test]
async fn test_two_producers_squared_and_merged() {
  setup_tracing_for_test();
  let pipeline = Pipeline::new(CancellationToken::new(), Handle::current());

  let first = pipeline.producer("producer-1", 0..3i64, Duration::from_millis(10));
  let second = pipeline.producer("producer-2", 3..6i64, Duration::from_millis(10));
  let first = pipeline.transform("square-1", first, |n| n * n);
  let second = pipeline.transform("square-2", second, |n| n * n);
  let merged = pipeline.merge("fan-in", vec![first, second]);

  let mut values = timeout(Duration::from_secs(2), drain(&merged)).await.unwrap();
  values.sort_unstable();
  assert_eq!(values, vec![0, 1, 4, 9, 16, 25]);
  pipeline.join().await.unwrap();
  assert_eq!(pipeline.stage_count(), 0);
}

#[tokio::test]
async fn test_transform_preserves_input_order() {
  setup_tracing_for_test();
  let pipeline = Pipeline::new(CancellationToken::new(), Handle::current());

  let (tx, rx) = stream::bounded(5);
  for n in 1..=5 {
    tx.send(n).await.unwrap();
  }
  tx.close();

  let doubled = pipeline.transform_with("double", rx, |n: i32| n * 2, StageOptions::default().with_capacity(5));
  assert_eq!(drain(&doubled).await, vec![2, 4, 6, 8, 10]);
  pipeline.join().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_producer_stops_early_and_closes() {
  setup_tracing_for_test();
  let token = CancellationToken::new();
  let pipeline = Pipeline::new(token.clone(), Handle::current());
  let values = pipeline.producer("ticker", 0..100u32, Duration::from_millis(10));

  let consumer = tokio::spawn(async move { drain(&values).await });
  sleep(Duration::from_millis(55)).await;
  pipeline.cancel();

  let emitted = timeout(Duration::from_secs(1), consumer)
    .await
    .expect("output must close after cancellation")
    .unwrap();
  assert!(!emitted.is_empty());
  assert!(emitted.len() < 100, "emitted {} values", emitted.len());
  assert!(token.is_cancelled());
  pipeline.join().await.unwrap();
}

#[tokio::test]
async fn test_deadline_token_bounds_a_pipeline() {
  setup_tracing_for_test();
  let token = cancel::with_timeout(&CancellationToken::new(), Duration::from_millis(50));
  let pipeline = Pipeline::new(token, Handle::current());

  let values = pipeline.producer("slow", 0..1000u32, Duration::from_millis(5));
  let values = pipeline.transform("inc", values, |n| n + 1);

  let received = timeout(Duration::from_secs(1), drain(&values)).await.unwrap();
  assert!(received.len() < 1000);
  assert!(received.windows(2).all(|w| w[0] < w[1]), "order survives cancellation");
}

#[tokio::test]
async fn test_merge_keeps_per_source_order() {
  setup_tracing_for_test();
  let pipeline = Pipeline::new(CancellationToken::new(), Handle::current());

  let low = pipeline.producer("low", (0..50).map(|n| ("low", n)), Duration::ZERO);
  let high = pipeline.producer("high", (0..50).map(|n| ("high", n)), Duration::ZERO);
  let merged = pipeline.merge("merge", vec![low, high]);

  let mut per_source: HashMap<&str, Vec<i32>> = HashMap::new();
  for (source, n) in drain(&merged).await {
    per_source.entry(source).or_default().push(n);
  }
  for (_, values) in per_source {
    assert_eq!(values, (0..50).collect::<Vec<_>>());
  }
  pipeline.join().await.unwrap();
}

#[tokio::test]
async fn test_merge_of_no_inputs_closes_immediately() {
  setup_tracing_for_test();
  let pipeline = Pipeline::new(CancellationToken::new(), Handle::current());
  let merged = pipeline.merge::<u8>("empty", Vec::new());

  let values = timeout(Duration::from_millis(200), drain(&merged)).await.unwrap();
  assert!(values.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn test_fan_out_then_fan_in_loses_nothing() {
  setup_tracing_for_test();
  let pipeline = Pipeline::new(CancellationToken::new(), Handle::current());

  let source = pipeline.producer("source", 0..20u32, Duration::ZERO);
  let workers = pipeline.fan_out("worker", source, 3, |n| n + 1);
  assert_eq!(workers.len(), 3);
  let merged = pipeline.merge("collect", workers);

  let mut values = drain(&merged).await;
  values.sort_unstable();
  assert_eq!(values, (1..=20).collect::<Vec<_>>());
  pipeline.join().await.unwrap();
}

#[tokio::test]
async fn test_panicking_stage_closes_output_and_is_reported() {
  setup_tracing_for_test();
  let pipeline = Pipeline::new(CancellationToken::new(), Handle::current());

  let source = pipeline.producer("source", 1..=5, Duration::ZERO);
  let doubled = pipeline.transform("boom", source, |n: i32| {
    if n == 3 {
      panic!("cannot double {n}");
    }
    n * 2
  });

  let values = timeout(Duration::from_secs(1), drain(&doubled))
    .await
    .expect("a panicking stage still closes its output");
  assert_eq!(values, vec![2, 4]);
  assert_eq!(
    pipeline.join().await,
    Err(PipelineError::StagesPanicked(vec!["boom".to_string()]))
  );
}

#[tokio::test]
async fn test_paced_transform_is_cancellable() {
  setup_tracing_for_test();
  let pipeline = Pipeline::new(CancellationToken::new(), Handle::current())
    .with_options(StageOptions::default().with_pace(Duration::from_secs(60)));

  let source = pipeline.producer("source", 0..10u8, Duration::ZERO);
  let slow = pipeline.transform("slow", source, |n| n);
  assert_eq!(slow.recv().await.unwrap(), 0);

  pipeline.cancel();
  timeout(Duration::from_secs(1), pipeline.join())
    .await
    .expect("pacing sleep must observe cancellation")
    .unwrap();
  assert!(slow.recv().await.is_err());
}
