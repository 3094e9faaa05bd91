use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::listener::{CancelListener, ListenerId, ListenerSet, fire_isolated};
use crate::execution::snapshot::ExecutionSnapshot;
use crate::models::{CoreError, CoreErrorKind, CoreResult};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserQuestionResult {
    Yes,
    No,
    Cancel,
}

/// State changes published to [`ExecutionTaskListener`]s.
#[derive(Clone, Debug)]
pub enum ExecutionEvent {
    TotalStepCountChanged(u32),
    Worked { delta: u32, worked: u32 },
    DescriptionChanged(String),
    SubExecutionAdded(ExecutionTask),
    UserQuestionAsked(String),
    UserQuestionAnswered(UserQuestionResult),
    Canceled,
    Finished,
    Disposed,
}

pub trait ExecutionTaskListener: Send + Sync {
    fn on_event(&self, task: &ExecutionTask, event: &ExecutionEvent);
}

impl<F> ExecutionTaskListener for F
where
    F: Fn(&ExecutionTask, &ExecutionEvent) + Send + Sync,
{
    fn on_event(&self, task: &ExecutionTask, event: &ExecutionEvent) {
        self(task, event)
    }
}

type AnswerCallback = Box<dyn FnOnce(UserQuestionResult) + Send>;

/// A cancellable unit of work with progress, a description, sub-executions and at most
/// one outstanding user question.
///
/// Handles are cheap to clone and all refer to the same task. Progress should be driven
/// by a single owner; listeners may be attached and fired from any thread.
#[derive(Clone)]
pub struct ExecutionTask {
    inner: Arc<TaskInner>,
}

struct TaskInner {
    id: String,
    step_proportion: Option<f64>,
    cancelable: bool,
    state: Mutex<TaskState>,
    question_changed: Condvar,
    cancel_listeners: ListenerSet<dyn Fn() + Send + Sync>,
    task_listeners: ListenerSet<dyn ExecutionTaskListener>,
}

#[derive(Default)]
struct TaskState {
    canceled: bool,
    finished: bool,
    disposed: bool,
    total_step_count: Option<u32>,
    worked: u32,
    description: Option<String>,
    question: QuestionSlot,
    children: Vec<ExecutionTask>,
}

#[derive(Default)]
enum QuestionSlot {
    #[default]
    Idle,
    Blocking {
        question: String,
        answer: Option<UserQuestionResult>,
    },
    Callback {
        question: String,
        callback: AnswerCallback,
    },
}

impl QuestionSlot {
    fn question(&self) -> Option<&str> {
        match self {
            Self::Idle => None,
            Self::Blocking { question, .. } | Self::Callback { question, .. } => Some(question),
        }
    }
}

impl Default for ExecutionTask {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExecutionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionTask")
            .field("id", &self.inner.id)
            .field("cancelable", &self.inner.cancelable)
            .finish_non_exhaustive()
    }
}

impl ExecutionTask {
    pub fn new() -> Self {
        Self::with_options(None, true)
    }

    fn with_options(step_proportion: Option<f64>, cancelable: bool) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                id: Uuid::new_v4().to_string(),
                step_proportion,
                cancelable,
                state: Mutex::new(TaskState::default()),
                question_changed: Condvar::new(),
                cancel_listeners: ListenerSet::new(),
                task_listeners: ListenerSet::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn is_cancelable(&self) -> bool {
        self.inner.cancelable
    }

    pub fn step_proportion(&self) -> Option<f64> {
        self.inner.step_proportion
    }

    pub fn is_canceled(&self) -> bool {
        self.lock().canceled
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    pub fn total_step_count(&self) -> Option<u32> {
        self.lock().total_step_count
    }

    pub fn worked_count(&self) -> u32 {
        self.lock().worked
    }

    pub fn description(&self) -> Option<String> {
        self.lock().description.clone()
    }

    pub fn pending_question(&self) -> Option<String> {
        self.lock().question.question().map(str::to_string)
    }

    pub fn children(&self) -> Vec<ExecutionTask> {
        self.lock().children.clone()
    }

    /// A listener added to an already canceled task fires immediately. One added to a
    /// task that was disposed without being canceled never fires.
    pub fn add_cancel_listener(&self, listener: CancelListener) -> ListenerId {
        let id = self.inner.cancel_listeners.add(listener.clone());
        let (canceled, disposed) = {
            let state = self.lock();
            (state.canceled, state.disposed)
        };
        if canceled && self.inner.cancel_listeners.remove(id) {
            fire_isolated(|| listener());
        } else if disposed {
            self.inner.cancel_listeners.remove(id);
        }
        id
    }

    pub fn remove_cancel_listener(&self, id: ListenerId) -> bool {
        self.inner.cancel_listeners.remove(id)
    }

    pub fn add_listener(&self, listener: Arc<dyn ExecutionTaskListener>) -> ListenerId {
        self.inner.task_listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.task_listeners.remove(id)
    }

    pub fn set_total_step_count(&self, steps: u32) {
        if !self.update(|state| state.total_step_count = Some(steps)) {
            return;
        }
        self.emit(ExecutionEvent::TotalStepCountChanged(steps));
    }

    pub fn worked(&self, steps: u32) {
        let mut worked = 0;
        if !self.update(|state| {
            state.worked = state.worked.saturating_add(steps);
            worked = state.worked;
        }) {
            return;
        }
        self.emit(ExecutionEvent::Worked {
            delta: steps,
            worked,
        });
    }

    pub fn worked_one(&self) {
        self.worked(1);
    }

    pub fn set_description(&self, description: impl Into<String>) {
        let description = description.into();
        if !self.update(|state| state.description = Some(description.clone())) {
            return;
        }
        self.emit(ExecutionEvent::DescriptionChanged(description));
    }

    /// Creates and registers a child task. The proportion is a weighting hint only.
    ///
    /// A child requested from a canceled parent is born canceled so the subtree keeps
    /// unwinding; from a disposed parent it is born disposed.
    pub fn create_sub_execution(&self, step_proportion: Option<f64>, cancelable: bool) -> Self {
        let child = Self::with_options(step_proportion, cancelable);
        let (canceled, disposed) = {
            let mut state = self.lock();
            if !state.disposed {
                state.children.push(child.clone());
            }
            (state.canceled, state.disposed)
        };

        if canceled {
            child.cancel();
        } else if disposed {
            child.dispose();
        } else {
            self.emit(ExecutionEvent::SubExecutionAdded(child.clone()));
        }
        child
    }

    /// Cancels this task and, unconditionally, every descendant, then disposes the subtree.
    pub fn cancel(&self) {
        let children = {
            let mut state = self.lock();
            if state.canceled || state.disposed {
                return;
            }
            state.canceled = true;
            self.inner.question_changed.notify_all();
            state.children.clone()
        };

        tracing::debug!(task_id = %self.inner.id, children = children.len(), "execution canceled");
        self.inner.cancel_listeners.drain_fire(|listener| listener());
        self.emit(ExecutionEvent::Canceled);
        for child in children {
            child.cancel();
        }
        self.dispose();
    }

    /// Terminal completion. Ignored once the task was canceled or disposed.
    pub fn finished(&self) {
        {
            let mut state = self.lock();
            if state.finished || state.canceled || state.disposed {
                return;
            }
            state.finished = true;
        }

        self.emit(ExecutionEvent::Finished);
        self.dispose();
    }

    /// Releases the task and its subtree. Safe to call any number of times.
    ///
    /// Disposal alone marks neither `canceled` nor `finished`. A blocked question asker is
    /// woken with an error and a pending answer callback is dropped unanswered.
    pub fn dispose(&self) {
        let (children, abandoned_question) = {
            let mut state = self.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            let abandoned = match std::mem::take(&mut state.question) {
                QuestionSlot::Blocking { question, answer } => {
                    state.question = QuestionSlot::Blocking { question, answer };
                    None
                }
                other => Some(other),
            };
            self.inner.question_changed.notify_all();
            (state.children.clone(), abandoned)
        };
        drop(abandoned_question);

        self.emit(ExecutionEvent::Disposed);
        for child in children {
            child.dispose();
        }
        self.inner.cancel_listeners.clear();
        self.inner.task_listeners.clear();
    }

    /// Asks a question and parks the calling thread until it is answered through
    /// [`ExecutionTask::set_question_result`], or the task is canceled or disposed.
    pub fn user_question(&self, question: impl Into<String>) -> CoreResult<UserQuestionResult> {
        let question = question.into();
        {
            let mut state = self.lock();
            ensure_can_ask(&state)?;
            state.question = QuestionSlot::Blocking {
                question: question.clone(),
                answer: None,
            };
        }
        self.emit(ExecutionEvent::UserQuestionAsked(question));

        let mut state = self.lock();
        loop {
            if let QuestionSlot::Blocking {
                answer: Some(answer),
                ..
            } = state.question
            {
                state.question = QuestionSlot::Idle;
                return Ok(answer);
            }
            if state.canceled {
                state.question = QuestionSlot::Idle;
                return Err(CoreError::cancelled(
                    "execution canceled while waiting for an answer",
                ));
            }
            if state.disposed {
                state.question = QuestionSlot::Idle;
                return Err(CoreError::new(
                    CoreErrorKind::InvalidState,
                    "execution disposed while waiting for an answer",
                ));
            }
            state = self
                .inner
                .question_changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Asks a question without blocking; `on_answer` runs on the thread that answers.
    pub fn user_question_with(
        &self,
        question: impl Into<String>,
        on_answer: impl FnOnce(UserQuestionResult) + Send + 'static,
    ) -> CoreResult<()> {
        let question = question.into();
        {
            let mut state = self.lock();
            ensure_can_ask(&state)?;
            state.question = QuestionSlot::Callback {
                question: question.clone(),
                callback: Box::new(on_answer),
            };
        }
        self.emit(ExecutionEvent::UserQuestionAsked(question));
        Ok(())
    }

    pub fn set_question_result(&self, result: UserQuestionResult) -> CoreResult<()> {
        let callback = {
            let mut state = self.lock();
            match std::mem::take(&mut state.question) {
                QuestionSlot::Idle => {
                    return Err(CoreError::new(
                        CoreErrorKind::InvalidState,
                        "no user question is outstanding",
                    ));
                }
                QuestionSlot::Blocking {
                    question,
                    answer: Some(previous),
                } => {
                    state.question = QuestionSlot::Blocking {
                        question,
                        answer: Some(previous),
                    };
                    return Err(CoreError::new(
                        CoreErrorKind::InvalidState,
                        "user question was already answered",
                    ));
                }
                QuestionSlot::Blocking {
                    question,
                    answer: None,
                } => {
                    state.question = QuestionSlot::Blocking {
                        question,
                        answer: Some(result),
                    };
                    self.inner.question_changed.notify_all();
                    None
                }
                QuestionSlot::Callback { callback, .. } => Some(callback),
            }
        };

        self.emit(ExecutionEvent::UserQuestionAnswered(result));
        if let Some(callback) = callback {
            fire_isolated(|| callback(result));
        }
        Ok(())
    }

    pub fn snapshot(&self) -> ExecutionSnapshot {
        let (children, mut snapshot) = {
            let state = self.lock();
            (
                state.children.clone(),
                ExecutionSnapshot {
                    id: self.inner.id.clone(),
                    description: state.description.clone(),
                    total_step_count: state.total_step_count,
                    worked: state.worked,
                    canceled: state.canceled,
                    finished: state.finished,
                    cancelable: self.inner.cancelable,
                    step_proportion: self.inner.step_proportion,
                    user_question: state.question.question().map(str::to_string),
                    children: Vec::new(),
                },
            )
        };
        snapshot.children = children.iter().map(ExecutionTask::snapshot).collect();
        snapshot
    }

    /// Mirrors a remote snapshot onto this task, creating children by position as needed.
    /// Cancellation is never mirrored; it only travels from client to server.
    pub fn apply_snapshot(&self, snapshot: &ExecutionSnapshot) {
        let (total, worked, description) = {
            let state = self.lock();
            (state.total_step_count, state.worked, state.description.clone())
        };

        if let Some(steps) = snapshot.total_step_count
            && total != Some(steps)
        {
            self.set_total_step_count(steps);
        }
        if snapshot.worked > worked {
            self.worked(snapshot.worked - worked);
        }
        if let Some(text) = &snapshot.description
            && description.as_ref() != Some(text)
        {
            self.set_description(text.clone());
        }

        let mut children = self.children();
        while children.len() < snapshot.children.len() {
            let remote = &snapshot.children[children.len()];
            children.push(self.create_sub_execution(remote.step_proportion, remote.cancelable));
        }
        for (child, remote) in children.iter().zip(&snapshot.children) {
            child.apply_snapshot(remote);
        }

        if snapshot.finished {
            self.finished();
        }
    }

    fn update(&self, mutate: impl FnOnce(&mut TaskState)) -> bool {
        let mut state = self.lock();
        if state.disposed {
            return false;
        }
        mutate(&mut state);
        true
    }

    fn emit(&self, event: ExecutionEvent) {
        self.inner
            .task_listeners
            .fire(|listener| listener.on_event(self, &event));
    }

    fn lock(&self) -> MutexGuard<'_, TaskState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn ensure_can_ask(state: &TaskState) -> CoreResult<()> {
    if state.canceled {
        return Err(CoreError::cancelled("execution is canceled"));
    }
    if state.disposed {
        return Err(CoreError::new(
            CoreErrorKind::InvalidState,
            "execution is disposed",
        ));
    }
    if let Some(pending) = state.question.question() {
        return Err(CoreError::new(
            CoreErrorKind::InvalidState,
            format!("user question '{pending}' is still outstanding"),
        ));
    }
    Ok(())
}
