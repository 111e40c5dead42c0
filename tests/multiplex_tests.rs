use futures::stream::{self as futures_stream, BoxStream, StreamExt};
use futures_ensemble::stream::{self, drain};
use futures_ensemble::{concatenate, multiplex, CancellationToken, Multiplexer};
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
async fn test_multiplex_heterogeneous_sources() {
  setup_tracing_for_test();

  let (tx, rx) = stream::bounded(4);
  tokio::spawn(async move {
    for n in [20, 21] {
      sleep(Duration::from_millis(5)).await;
      tx.send(n).await.unwrap();
    }
  });

  let sources: Vec<BoxStream<'static, u32>> = vec![
    futures_stream::iter(vec![1, 2, 3]).boxed(),
    futures_stream::unfold(10u32, |n| async move { (n < 13).then_some((n, n + 1)) }).boxed(),
    rx.boxed(),
  ];

  let merged = multiplex(&CancellationToken::new(), sources);
  let mut values = timeout(Duration::from_secs(1), drain(&merged)).await.unwrap();
  values.sort_unstable();
  assert_eq!(values, vec![1, 2, 3, 10, 11, 12, 20, 21]);
}

#[tokio::test]
async fn test_concatenate_keeps_global_order() {
  setup_tracing_for_test();
  let sources = vec![
    futures_stream::iter(vec![1, 2]),
    futures_stream::iter(vec![]),
    futures_stream::iter(vec![3, 4, 5]),
  ];

  let joined = concatenate(&CancellationToken::new(), sources);
  assert_eq!(drain(&joined).await, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_multiplex_unwinds_pending_sources_on_cancel() {
  setup_tracing_for_test();
  let token = CancellationToken::new();
  let sources: Vec<BoxStream<'static, u8>> = vec![
    futures_stream::iter(vec![1]).boxed(),
    futures_stream::pending().boxed(),
  ];

  let merged = multiplex(&token, sources);
  assert_eq!(merged.recv().await.unwrap(), 1);

  // The pending source never ends on its own.
  assert!(timeout(Duration::from_millis(50), merged.recv()).await.is_err());

  token.cancel();
  let rest = timeout(Duration::from_secs(1), drain(&merged))
    .await
    .expect("cancellation must close the merged stream");
  assert!(rest.is_empty());
}

#[tokio::test]
async fn test_multiplexer_with_capacity_merges_channel_outputs() {
  setup_tracing_for_test();
  let multiplexer = Multiplexer::new("channels", Handle::current()).with_capacity(8);
  assert_eq!(multiplexer.name(), "channels");

  let mut receivers = Vec::new();
  for base in [0u32, 100, 200] {
    let (tx, rx) = stream::bounded(10);
    for offset in 0..10 {
      tx.send(base + offset).await.unwrap();
    }
    tx.close();
    receivers.push(rx);
  }

  let merged = multiplexer.merge(&CancellationToken::new(), receivers);
  let values = drain(&merged).await;
  assert_eq!(values.len(), 30);
  for base in [0u32, 100, 200] {
    let from_source: Vec<u32> = values.iter().copied().filter(|v| v / 100 == base / 100).collect();
    assert_eq!(from_source, (base..base + 10).collect::<Vec<_>>());
  }
}

#[tokio::test]
async fn test_dropping_merged_output_stops_relays() {
  setup_tracing_for_test();
  let merged = multiplex(
    &CancellationToken::new(),
    vec![futures_stream::repeat(7u8).boxed()],
  );
  assert_eq!(merged.recv().await.unwrap(), 7);
  merged.close();

  // At most the value already buffered remains; the endless relay gives up.
  let rest = timeout(Duration::from_secs(1), drain(&merged)).await.unwrap();
  assert!(rest.len() <= 1);
}
