// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Dependency-aware task scheduler. Units of work are submitted with the
//! handles of the tasks they must wait on; ready tasks are dispatched to the
//! global rayon pool. Task bodies never block on other tasks, so a bounded
//! pool cannot deadlock on dependency order.

use std::sync::{
    Arc, Condvar, Mutex,
    atomic::{AtomicBool, Ordering},
};

use thiserror::Error;
use tracing::debug;

#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("Task {name:?} failed: {message}")]
    Failed { name: String, message: String },
    #[error("Task {name:?} skipped because dependency {dependency:?} failed")]
    DependencyFailed { name: String, dependency: String },
    #[error("Task {name:?} not started after an earlier failure")]
    Aborted { name: String },
}

type Result<T> = std::result::Result<T, Error>;

type TaskBody = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

struct Inner {
    /// Dependencies that have not completed yet.
    pending: usize,
    /// Name of the first dependency observed to fail.
    failed_dep: Option<String>,
    body: Option<TaskBody>,
    dependents: Vec<Arc<Task>>,
    result: Option<Result<()>>,
}

struct Task {
    name: String,
    inner: Mutex<Inner>,
    completed: Condvar,
}

/// Handle for awaiting a submitted task and declaring dependencies on it.
#[derive(Clone)]
pub struct TaskHandle(Arc<Task>);

pub struct TaskGraph {
    tasks: Mutex<Vec<Arc<Task>>>,
    /// Set once any task fails; tasks becoming ready afterwards are not run.
    poisoned: Arc<AtomicBool>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            poisoned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Schedule `body` to run once every task in `deps` has completed
    /// successfully. If any dependency fails, the task fails without its body
    /// ever executing.
    pub fn submit<F>(&self, name: impl Into<String>, deps: &[TaskHandle], body: F) -> TaskHandle
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let task = Arc::new(Task {
            name: name.into(),
            inner: Mutex::new(Inner {
                pending: deps.len(),
                failed_dep: None,
                body: Some(Box::new(body)),
                dependents: Vec::new(),
                result: None,
            }),
            completed: Condvar::new(),
        });

        self.tasks.lock().unwrap().push(task.clone());

        let mut already_done = 0;

        for dep in deps {
            let mut dep_inner = dep.0.inner.lock().unwrap();
            match &dep_inner.result {
                Some(Ok(())) => already_done += 1,
                Some(Err(_)) => {
                    already_done += 1;
                    task.inner
                        .lock()
                        .unwrap()
                        .failed_dep
                        .get_or_insert_with(|| dep.0.name.clone());
                }
                None => dep_inner.dependents.push(task.clone()),
            }
        }

        // Dispatch only if this call is responsible for the transition to
        // zero pending dependencies. If the last outstanding dependency
        // completes concurrently, its completion dispatches the task instead.
        let ready = {
            let mut inner = task.inner.lock().unwrap();
            inner.pending -= already_done;
            inner.pending == 0 && (already_done > 0 || deps.is_empty())
        };
        if ready {
            dispatch(&self.poisoned, task.clone());
        }

        TaskHandle(task)
    }

    /// Block until the task completes and return its outcome.
    pub fn wait(&self, handle: &TaskHandle) -> Result<()> {
        let mut inner = handle.0.inner.lock().unwrap();
        while inner.result.is_none() {
            inner = handle.0.completed.wait(inner).unwrap();
        }
        inner.result.clone().unwrap()
    }

    /// Block until every given task completes, returning the first failure in
    /// handle order.
    pub fn await_all(&self, handles: &[TaskHandle]) -> Result<()> {
        for handle in handles {
            self.wait(handle)?;
        }
        Ok(())
    }

    /// Block until every task ever submitted completes, returning the first
    /// failure in submission order.
    pub fn run_to_completion(&self) -> Result<()> {
        let mut first = None;
        let mut index = 0;

        loop {
            let task = {
                let tasks = self.tasks.lock().unwrap();
                match tasks.get(index) {
                    Some(t) => t.clone(),
                    None => break,
                }
            };
            index += 1;

            if let Err(e) = self.wait(&TaskHandle(task)) {
                first.get_or_insert(e);
            }
        }

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

fn dispatch(poisoned: &Arc<AtomicBool>, task: Arc<Task>) {
    enum Action {
        Run(TaskBody),
        Fail(Error),
    }

    let action = {
        let mut inner = task.inner.lock().unwrap();
        debug_assert_eq!(inner.pending, 0);

        if let Some(dependency) = inner.failed_dep.take() {
            Action::Fail(Error::DependencyFailed {
                name: task.name.clone(),
                dependency,
            })
        } else if poisoned.load(Ordering::SeqCst) {
            Action::Fail(Error::Aborted {
                name: task.name.clone(),
            })
        } else {
            Action::Run(inner.body.take().unwrap())
        }
    };

    match action {
        Action::Fail(e) => complete(poisoned, &task, Err(e)),
        Action::Run(body) => {
            let poisoned = poisoned.clone();

            rayon::spawn(move || {
                debug!("Task started: {:?}", task.name);

                let result = body().map_err(|e| Error::Failed {
                    name: task.name.clone(),
                    message: format!("{e:#}"),
                });

                debug!(
                    "Task {}: {:?}",
                    if result.is_ok() { "succeeded" } else { "failed" },
                    task.name,
                );

                complete(&poisoned, &task, result);
            });
        }
    }
}

fn complete(poisoned: &Arc<AtomicBool>, task: &Arc<Task>, result: Result<()>) {
    if result.is_err() {
        poisoned.store(true, Ordering::SeqCst);
    }

    let dependents = {
        let mut inner = task.inner.lock().unwrap();
        inner.result = Some(result.clone());
        std::mem::take(&mut inner.dependents)
    };
    task.completed.notify_all();

    for dependent in dependents {
        let ready = {
            let mut inner = dependent.inner.lock().unwrap();
            if result.is_err() {
                inner.failed_dep.get_or_insert_with(|| task.name.clone());
            }
            inner.pending -= 1;
            inner.pending == 0
        };
        if ready {
            dispatch(poisoned, dependent);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use anyhow::bail;
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn chain_runs_in_dependency_order() {
        let graph = TaskGraph::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let push = |entry: &'static str| {
            let log = log.clone();
            move || {
                log.lock().unwrap().push(entry);
                Ok(())
            }
        };

        let a = graph.submit("a", &[], push("a"));
        let b = graph.submit("b", &[a], push("b"));
        let c = graph.submit("c", &[b.clone()], push("c"));

        graph.await_all(&[c]).unwrap();
        assert_eq!(*log.lock().unwrap(), ["a", "b", "c"]);
        graph.wait(&b).unwrap();
    }

    #[test]
    fn diamond_waits_for_all_dependencies() {
        let graph = TaskGraph::new();
        let done = Arc::new(AtomicUsize::new(0));

        let count = |done: &Arc<AtomicUsize>| {
            let done = done.clone();
            move || {
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        };

        let a = graph.submit("a", &[], count(&done));
        let b = graph.submit("b", &[a.clone()], count(&done));
        let c = graph.submit("c", &[a], count(&done));
        let observed = Arc::new(AtomicUsize::new(0));
        let d = {
            let done = done.clone();
            let observed = observed.clone();
            graph.submit("d", &[b, c], move || {
                observed.store(done.load(Ordering::SeqCst), Ordering::SeqCst);
                Ok(())
            })
        };

        graph.await_all(&[d]).unwrap();
        // Both of d's dependencies (and transitively a) completed first.
        assert_eq!(observed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn failure_skips_dependents() {
        let graph = TaskGraph::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let a = graph.submit("a", &[], || bail!("boom"));
        let b = {
            let ran = ran.clone();
            graph.submit("b", &[a], move || {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        let c = {
            let ran = ran.clone();
            graph.submit("c", &[b.clone()], move || {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };

        let result = graph.run_to_completion();
        assert_matches!(
            result,
            Err(Error::Failed { ref name, ref message }) if name == "a" && message.contains("boom")
        );

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_matches!(
            graph.wait(&b),
            Err(Error::DependencyFailed { ref name, ref dependency })
                if name == "b" && dependency == "a"
        );
        assert_matches!(
            graph.wait(&c),
            Err(Error::DependencyFailed { ref name, ref dependency })
                if name == "c" && dependency == "b"
        );
    }

    #[test]
    fn failure_message_preserves_context_chain() {
        let graph = TaskGraph::new();

        let a = graph.submit("a", &[], || {
            use anyhow::Context;
            Err(std::io::Error::other("inner detail")).context("outer step")
        });

        assert_matches!(
            graph.wait(&a),
            Err(Error::Failed { ref message, .. })
                if message.contains("outer step") && message.contains("inner detail")
        );
    }

    #[test]
    fn independent_tasks_all_run() {
        let graph = TaskGraph::new();
        let done = Arc::new(AtomicUsize::new(0));

        for i in 0..16 {
            let done = done.clone();
            graph.submit(format!("task {i}"), &[], move || {
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        graph.run_to_completion().unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn submitting_after_failure_aborts_unstarted_work() {
        let graph = TaskGraph::new();

        let a = graph.submit("a", &[], || bail!("boom"));
        assert_matches!(graph.wait(&a), Err(Error::Failed { .. }));

        // Independent work submitted after the failure was observed must not
        // start.
        let ran = Arc::new(AtomicUsize::new(0));
        let b = {
            let ran = ran.clone();
            graph.submit("b", &[], move || {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };

        assert_matches!(graph.wait(&b), Err(Error::Aborted { ref name }) if name == "b");
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn await_all_returns_first_failure_in_handle_order() {
        let graph = TaskGraph::new();

        let a = graph.submit("a", &[], || bail!("first"));
        let b = graph.submit("b", &[a.clone()], || Ok(()));

        assert_matches!(
            graph.await_all(&[a, b]),
            Err(Error::Failed { ref name, .. }) if name == "a"
        );
    }

    #[test]
    fn depending_on_completed_task_runs_immediately() {
        let graph = TaskGraph::new();

        let a = graph.submit("a", &[], || Ok(()));
        graph.wait(&a).unwrap();

        let b = graph.submit("b", &[a], || Ok(()));
        graph.wait(&b).unwrap();
    }
}
