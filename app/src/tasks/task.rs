use std::io;
use std::thread::{self, JoinHandle};

pub struct TaskMeta {
    pub name: &'static str,
    pub stack_bytes: Option<usize>,
}

pub trait AppTask {
    fn meta(&self) -> TaskMeta;

    /// Consume what you need from self, then
    /// return a closure that runs the task loop
    fn into_runner(self: Box<Self>) -> Box<dyn FnOnce() + Send + 'static>;
}

pub trait Spawner {
    fn spawn(&self, meta: TaskMeta, f: Box<dyn FnOnce() + Send + 'static>) -> io::Result<JoinHandle<()>>;
}

pub struct HostSpawner;

impl Spawner for HostSpawner {
    fn spawn(&self, meta: TaskMeta, f: Box<dyn FnOnce() + Send + 'static>) -> io::Result<JoinHandle<()>> {
        let mut b = thread::Builder::new().name(meta.name.into());
        if let Some(stack_sz) = meta.stack_bytes {
            b = b.stack_size(stack_sz);
        }
        b.spawn(f)
    }
}

/// Start one task on its own named thread.
pub fn start<T: AppTask + 'static>(task: T) -> io::Result<JoinHandle<()>> {
    let task: Box<dyn AppTask> = Box::new(task);
    let meta = task.meta();
    let name = meta.name;
    let handle = HostSpawner.spawn(meta, task.into_runner())?;
    log::debug!("started task {name}");
    Ok(handle)
}

/// Join a task unless we are that task.
pub fn join(handle: JoinHandle<()>) {
    if handle.thread().id() == thread::current().id() {
        return;
    }
    if handle.join().is_err() {
        log::error!("task panicked");
    }
}
