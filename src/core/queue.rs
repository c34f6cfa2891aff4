//! Queue - FIFO pending list served by a single background worker
//!
//! Tasks run strictly in submission order, one at a time. The queue lock
//! is never held while a process runs, a post-handler is in flight or the
//! finished record is written.

use super::output::{OutputMux, OutputReader};
use super::registry::EngineContext;
use super::store::{FinishedStore, RecordUpdate, RecordWriter};
use super::task::{Task, TaskSpec, TaskSummary};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Notify;

/// Handle to a queue. Cheap to clone; all clones share one worker.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<QueueState>,
    wake: Notify,
    records: RecordWriter,
    runtime: Handle,
    ctx: Arc<EngineContext>,
}

struct QueueState {
    name: String,
    next_id: u32,
    pending: VecDeque<Task>,
    running: Option<RunningTask>,
    finished: FinishedStore,
    stopped: bool,
}

struct RunningTask {
    task: Task,
    mux: OutputMux,
}

impl Queue {
    /// Create an empty queue and start its worker. Needs a tokio runtime.
    pub fn new(name: &str, ctx: Arc<EngineContext>) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Internal(format!("no async runtime for queue {}: {}", name, e)))?;

        let finished = match ctx.record_path(name) {
            Some(path) => FinishedStore::with_record(path),
            None => FinishedStore::new(),
        };

        let inner = Arc::new(Inner {
            state: Mutex::new(QueueState {
                name: name.to_string(),
                next_id: 0,
                pending: VecDeque::new(),
                running: None,
                finished,
                stopped: false,
            }),
            wake: Notify::new(),
            records: RecordWriter::new(),
            runtime: runtime.clone(),
            ctx,
        });

        runtime.spawn(worker_loop(inner.clone()));
        Ok(Self { inner })
    }

    pub fn name(&self) -> String {
        self.inner.state.lock().name.clone()
    }

    /// Validate and append a task; returns its id
    pub fn enqueue(&self, spec: TaskSpec) -> Result<u32> {
        spec.validate()?;

        let id = {
            let mut state = self.inner.state.lock();
            if state.stopped {
                return Err(Error::NotFound(format!("queue {} was deleted", state.name)));
            }

            let id = state.next_id;
            state.next_id = id
                .checked_add(1)
                .ok_or_else(|| Error::Internal(format!("queue {} ran out of ids", state.name)))?;

            let mut spec = spec;
            if spec.save_output && spec.output_path.is_empty() {
                let file = self
                    .inner
                    .ctx
                    .config
                    .output_dir()
                    .join(format!("{}-{}.log", state.name, id));
                spec.output_path = file.to_string_lossy().into_owned();
            }

            state.pending.push_back(Task::new(id, spec));
            log::debug!("Queue {}: enqueued task {}", state.name, id);
            id
        };

        self.inner.wake.notify_one();
        Ok(id)
    }

    /// Pending ids in dispatch order
    pub fn list_pending(&self) -> Vec<u32> {
        self.inner.state.lock().pending.iter().map(|t| t.id).collect()
    }

    pub fn pending_details(&self, id: u32) -> Result<Task> {
        self.inner
            .state
            .lock()
            .pending
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| Error::no_such_task(id))
    }

    /// Drop a task that has not started yet. A running task is not pending.
    pub fn remove_pending(&self, id: u32) -> Result<()> {
        let mut state = self.inner.state.lock();
        let pos = state
            .pending
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| Error::no_such_task(id))?;
        state.pending.remove(pos);
        Ok(())
    }

    pub fn clear_pending(&self) {
        self.inner.state.lock().pending.clear();
    }

    /// Finished tasks, oldest completion first
    pub fn list_finished(&self) -> Vec<TaskSummary> {
        self.inner.state.lock().finished.summaries()
    }

    pub fn finished_details(&self, id: u32) -> Result<Task> {
        self.inner.state.lock().finished.get(id)
    }

    pub fn clear_finished(&self) {
        let update = {
            let mut state = self.inner.state.lock();
            let name = state.name.clone();
            state.finished.clear(&name)
        };
        self.persist(update);
    }

    /// Copy of the running task
    pub fn current_task(&self) -> Result<Task> {
        let state = self.inner.state.lock();
        state
            .running
            .as_ref()
            .map(|r| r.task.clone())
            .ok_or_else(|| Error::NoActiveTask(format!("queue {} is idle", state.name)))
    }

    /// Attach to the running task's live output
    pub fn current_output_reader(&self) -> Result<OutputReader> {
        let state = self.inner.state.lock();
        state
            .running
            .as_ref()
            .map(|r| r.mux.attach())
            .ok_or_else(|| Error::NoActiveTask(format!("queue {} is idle", state.name)))
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running.is_some()
    }

    /// In-memory rename; the returned record move goes to [`Queue::persist`]
    pub(crate) fn set_name(&self, new: &str) -> Option<RecordUpdate> {
        let mut state = self.inner.state.lock();
        state.name = new.to_string();
        state.finished.relocate(&self.inner.ctx.config.save_path, new)
    }

    /// Write a record update in the background
    pub(crate) fn persist(&self, update: Option<RecordUpdate>) {
        let Some(update) = update else {
            return;
        };
        let inner = self.inner.clone();
        self.inner
            .runtime
            .spawn(async move { inner.records.apply(update).await });
    }

    /// Stop the worker unless a task is running; pending tasks are dropped.
    /// The returned record removal goes to [`Queue::persist`].
    pub(crate) fn try_shutdown(&self) -> Result<Option<RecordUpdate>> {
        let update = {
            let mut state = self.inner.state.lock();
            if let Some(running) = &state.running {
                return Err(Error::Busy(format!(
                    "queue {} is running task {}",
                    state.name, running.task.id
                )));
            }
            state.stopped = true;
            state.pending.clear();
            state.finished.discard_record()
        };
        self.inner.wake.notify_one();
        Ok(update)
    }

    /// Stop the worker after its current task; pending tasks are dropped
    pub(crate) fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            state.stopped = true;
            state.pending.clear();
        }
        self.inner.wake.notify_one();
    }
}

async fn worker_loop(inner: Arc<Inner>) {
    loop {
        let next = {
            let mut state = inner.state.lock();
            if state.stopped {
                break;
            }
            match state.pending.pop_front() {
                Some(mut task) => {
                    task.mark_running();
                    let mux = OutputMux::new(inner.ctx.config.stream_capacity);
                    state.running = Some(RunningTask {
                        task: task.clone(),
                        mux: mux.clone(),
                    });
                    Some((task, mux))
                }
                None => None,
            }
        };

        let Some((mut task, mux)) = next else {
            inner.wake.notified().await;
            continue;
        };

        let outcome = inner.ctx.executor.run(&task, &mux).await;
        mux.close();

        task.spawn_error = outcome.spawn_error;
        task.output_error = outcome.output_error;
        task.mark_done(outcome.exit_code);
        if let Some(running) = inner.state.lock().running.as_mut() {
            running.task = task.clone();
        }

        if let Err(e) = inner.ctx.post_handler.invoke(&task).await {
            log::warn!("Task {} post-handler: {}", task.id, e);
            task.post_handler_error = Some(e.to_string());
        }

        let update = {
            let mut state = inner.state.lock();
            state.running = None;
            let name = state.name.clone();
            log::info!("Queue {}: task {} finished", name, task.id);
            state.finished.push(task, &name)
        };
        if let Some(update) = update {
            inner.records.apply(update).await;
        }
    }

    log::debug!("Queue {} worker stopped", inner.state.lock().name);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::hook::tests::RecordingLoader;
    use crate::core::hook::PostHandlerInvoker;
    use crate::core::task::{TaskState, SPAWN_FAILED_EXIT_CODE};
    use std::time::Duration;
    use tempfile::TempDir;

    fn queue_in(dir: &TempDir) -> Queue {
        let ctx = EngineContext::new(Config::with_save_path(dir.path()));
        Queue::new("build", Arc::new(ctx)).unwrap()
    }

    fn spec(dir: &TempDir, exec: &str, args: &[&str]) -> TaskSpec {
        TaskSpec::new(exec)
            .with_args(args.iter().copied())
            .with_work_dir(dir.path().to_string_lossy())
    }

    async fn wait_finished(queue: &Queue, count: usize) {
        for _ in 0..500 {
            if queue.list_finished().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("queue did not finish {} tasks", count);
    }

    async fn wait_running(queue: &Queue) {
        for _ in 0..500 {
            if queue.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("queue never started a task");
    }

    #[tokio::test]
    async fn test_echo_scenario() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir);

        let id = queue.enqueue(spec(&dir, "/bin/echo", &["hi"])).unwrap();
        assert_eq!(id, 0);
        wait_finished(&queue, 1).await;

        let ids: Vec<u32> = queue.list_finished().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![0]);
        let task = queue.finished_details(0).unwrap();
        assert_eq!(task.exit_code, Some(0));
        assert_eq!(task.spec.args, vec!["hi"]);
        assert_eq!(task.state, TaskState::Done);
        assert!(task.is_success);
    }

    #[tokio::test]
    async fn test_fifo_regardless_of_priority() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir);
        let order = dir.path().join("order");
        let order_str = order.to_string_lossy().to_string();

        let priorities = [
            crate::core::task::Priority::Low,
            crate::core::task::Priority::High,
            crate::core::task::Priority::BelowNormal,
            crate::core::task::Priority::AboveNormal,
        ];
        for (i, p) in priorities.iter().enumerate() {
            let script = format!("echo {} >> '{}'", i, order_str);
            queue
                .enqueue(spec(&dir, "/bin/sh", &["-c", &script]).with_priority(*p))
                .unwrap();
        }
        wait_finished(&queue, 4).await;

        assert_eq!(std::fs::read_to_string(&order).unwrap(), "0\n1\n2\n3\n");
        let ids: Vec<u32> = queue.list_finished().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_spawn_failure_does_not_stall_worker() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir);

        queue.enqueue(spec(&dir, "/no/such/program", &[])).unwrap();
        queue.enqueue(spec(&dir, "/bin/true", &[])).unwrap();
        wait_finished(&queue, 2).await;

        let failed = queue.finished_details(0).unwrap();
        assert_eq!(failed.exit_code, Some(SPAWN_FAILED_EXIT_CODE));
        assert!(failed.spawn_error.is_some());
        assert!(!failed.is_success);
        assert_eq!(queue.finished_details(1).unwrap().exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir);

        let err = queue.enqueue(spec(&dir, "", &[])).unwrap_err();
        assert!(matches!(err, Error::ValidationFailed(_)));
        let err = queue
            .enqueue(TaskSpec::new("/bin/true").with_work_dir("/no/such/dir"))
            .unwrap_err();
        assert!(matches!(err, Error::ValidationFailed(_)));
        // Rejected specs do not consume ids
        assert_eq!(queue.enqueue(spec(&dir, "/bin/true", &[])).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_single_running_and_pending_ops() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir);

        queue.enqueue(spec(&dir, "/bin/sleep", &["0.5"])).unwrap();
        queue.enqueue(spec(&dir, "/bin/true", &[])).unwrap();
        queue.enqueue(spec(&dir, "/bin/true", &[])).unwrap();
        wait_running(&queue).await;

        assert_eq!(queue.current_task().unwrap().id, 0);
        assert_eq!(queue.current_task().unwrap().state, TaskState::Running);
        assert_eq!(queue.list_pending(), vec![1, 2]);
        assert_eq!(queue.pending_details(2).unwrap().state, TaskState::Pending);
        assert!(matches!(queue.remove_pending(0), Err(Error::NotFound(_))));

        queue.remove_pending(1).unwrap();
        assert!(matches!(queue.remove_pending(1), Err(Error::NotFound(_))));
        assert_eq!(queue.list_pending(), vec![2]);

        wait_finished(&queue, 2).await;
        let ids: Vec<u32> = queue.list_finished().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![0, 2]);
        assert!(matches!(queue.current_task(), Err(Error::NoActiveTask(_))));
    }

    #[tokio::test]
    async fn test_clear_finished_leaves_running_task() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir);

        queue.enqueue(spec(&dir, "/bin/true", &[])).unwrap();
        wait_finished(&queue, 1).await;
        queue.enqueue(spec(&dir, "/bin/sleep", &["0.3"])).unwrap();
        wait_running(&queue).await;

        queue.clear_finished();
        assert!(queue.list_finished().is_empty());
        assert_eq!(queue.current_task().unwrap().id, 1);

        wait_finished(&queue, 1).await;
        assert_eq!(queue.list_finished()[0].id, 1);
    }

    #[tokio::test]
    async fn test_output_reader_requires_running_task() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir);
        assert!(matches!(
            queue.current_output_reader(),
            Err(Error::NoActiveTask(_))
        ));

        queue
            .enqueue(spec(&dir, "/bin/sh", &["-c", "sleep 0.3; echo live"]))
            .unwrap();
        wait_running(&queue).await;

        let mut reader = queue.current_output_reader().unwrap();
        let mut seen = Vec::new();
        while let Some(chunk) = reader.read().await {
            seen.extend(chunk);
        }
        assert_eq!(seen, b"live\n".to_vec());
    }

    #[tokio::test]
    async fn test_default_output_path_and_post_handler() {
        let dir = TempDir::new().unwrap();
        let loader = Arc::new(RecordingLoader::default());
        let ctx = EngineContext::new(Config::with_save_path(dir.path()))
            .with_post_handler(PostHandlerInvoker::new(loader.clone()));
        let queue = Queue::new("render", Arc::new(ctx)).unwrap();

        let mut task_spec = spec(&dir, "/bin/echo", &["saved"]).with_post_handler("/opt/hook.so", false);
        task_spec.save_output = true;
        queue.enqueue(task_spec).unwrap();
        wait_finished(&queue, 1).await;

        let expected = dir.path().join("output").join("render-0.log");
        let task = queue.finished_details(0).unwrap();
        assert_eq!(task.spec.output_path, expected.to_string_lossy());
        assert_eq!(std::fs::read_to_string(&expected).unwrap(), "saved\n");

        let calls = loader.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].dst, expected.to_string_lossy());
        assert_eq!(calls[0].exit_code, 0);
    }

    #[tokio::test]
    async fn test_post_handler_failure_recorded() {
        let dir = TempDir::new().unwrap();
        let ctx = EngineContext::new(Config::with_save_path(dir.path()))
            .with_post_handler(PostHandlerInvoker::new(Arc::new(RecordingLoader::default())));
        let queue = Queue::new("hooks", Arc::new(ctx)).unwrap();

        queue
            .enqueue(spec(&dir, "/bin/false", &[]).with_post_handler("/opt/missing.so", true))
            .unwrap();
        wait_finished(&queue, 1).await;

        let task = queue.finished_details(0).unwrap();
        assert_eq!(task.exit_code, Some(1));
        assert!(task.post_handler_error.is_some());
    }

    #[tokio::test]
    async fn test_shutdown_rules() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir);

        queue.enqueue(spec(&dir, "/bin/sleep", &["0.3"])).unwrap();
        wait_running(&queue).await;
        assert!(matches!(queue.try_shutdown(), Err(Error::Busy(_))));

        wait_finished(&queue, 1).await;
        queue.persist(queue.try_shutdown().unwrap());
        assert!(matches!(
            queue.enqueue(spec(&dir, "/bin/true", &[])),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_queries_do_not_wait_for_record_writes() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir);

        // Stall the record writer
        let writer = queue.inner.records.stall().await;

        queue.enqueue(spec(&dir, "/bin/true", &[])).unwrap();
        wait_finished(&queue, 1).await;
        queue.clear_finished();
        assert!(queue.list_finished().is_empty());
        queue.persist(queue.set_name("renamed"));
        assert_eq!(queue.name(), "renamed");
        assert!(!dir.path().join("build.finished.json").exists());

        drop(writer);
        let record = dir.path().join("renamed.finished.json");
        for _ in 0..500 {
            if record.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(record.exists());
    }

    #[test]
    fn test_new_without_runtime_fails() {
        let dir = TempDir::new().unwrap();
        let ctx = Arc::new(EngineContext::new(Config::with_save_path(dir.path())));
        assert!(matches!(Queue::new("q", ctx), Err(Error::Internal(_))));
    }
}
