use futures_ensemble::{cancel, CancellationToken, EngineEvent, Observer, Pipeline, StageOptions};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Fan-Out / Fan-In Example ---");

  let observer = Observer::new();
  observer.add_handler(|event| {
    if let EngineEvent::StageTransition { stage, state } = event {
      info!("Stage {} -> {:?}", stage, state);
    }
  });

  // The whole pipeline gives up after two seconds at the latest.
  let token = cancel::with_timeout(&CancellationToken::new(), Duration::from_secs(2));
  let pipeline = Pipeline::new(token, Handle::current())
    .with_options(StageOptions::default().with_pace(Duration::from_millis(50)))
    .with_observer(observer);

  let first = pipeline.producer("producer-1", 0..3i64, Duration::from_millis(100));
  let second = pipeline.producer("producer-2", 3..6i64, Duration::from_millis(100));
  let first = pipeline.transform("worker-1", first, |n| n * n);
  let second = pipeline.transform("worker-2", second, |n| n * n);
  let merged = pipeline.merge("fan-in", vec![first, second]);

  while let Ok(value) = merged.recv().await {
    info!("Received {}", value);
  }

  if let Err(e) = pipeline.join().await {
    tracing::error!("{}", e);
  }
  info!("--- Fan-Out / Fan-In Example End ---");
}
