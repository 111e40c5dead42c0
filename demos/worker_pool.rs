use futures_ensemble::{CancellationToken, EngineEvent, Observer, PoolConfig, Task, TaskResult, WorkerPool};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

async fn process_text(task: Task<String>) -> TaskResult<String> {
  tokio::time::sleep(Duration::from_millis(100)).await;
  if task.payload.is_empty() {
    return TaskResult::failure(task.id, "empty payload");
  }
  TaskResult::success(task.id, format!("{}_processed", task.payload))
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Worker Pool Example ---");

  let observer = Observer::new();
  observer.add_handler(|event| {
    if let EngineEvent::TaskCompleted { worker_id, task_id, status, .. } = event {
      info!("Worker {} finished task {} ({:?})", worker_id, task_id, status);
    }
  });

  let pool = WorkerPool::<String, String>::with_observer(
    PoolConfig::new(3).with_name("text_pool"),
    Handle::current(),
    observer,
  );

  let tasks: Vec<Task<String>> = ["alpha", "beta", "", "gamma", "delta"]
    .iter()
    .enumerate()
    .map(|(id, payload)| Task::new(id as u64, payload.to_string()))
    .collect();

  match pool.process_tasks(CancellationToken::new(), tasks, process_text).await {
    Ok(results) => {
      for result in results {
        match result.output {
          Ok(output) => info!("Task {}: {}", result.task_id, output),
          Err(e) => info!("Task {} failed: {}", result.task_id, e),
        }
      }
    }
    Err(e) => tracing::error!("Pool failed: {}", e),
  }

  info!("--- Worker Pool Example End ---");
}
