use futures::stream::{self, BoxStream, StreamExt};
use futures_ensemble::{concatenate, CancellationToken, Multiplexer};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

fn ticker(label: &'static str, every_ms: u64, count: usize) -> BoxStream<'static, String> {
  stream::iter(0..count)
    .then(move |i| async move {
      tokio::time::sleep(Duration::from_millis(every_ms)).await;
      format!("{label}-{i}")
    })
    .boxed()
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Stream Multiplexer Example ---");
  let token = CancellationToken::new();

  let multiplexer = Multiplexer::new("tickers", Handle::current()).with_capacity(4);
  let merged = multiplexer.merge(
    &token,
    vec![
      ticker("fast", 30, 6),
      ticker("slow", 70, 3),
      stream::iter(vec!["static-0".to_string(), "static-1".to_string()]).boxed(),
    ],
  );
  while let Ok(value) = merged.recv().await {
    info!("Merged: {}", value);
  }

  let ordered = concatenate(&token, vec![ticker("first", 10, 2), ticker("second", 10, 2)]);
  while let Ok(value) = ordered.recv().await {
    info!("Concatenated: {}", value);
  }

  info!("--- Stream Multiplexer Example End ---");
}
