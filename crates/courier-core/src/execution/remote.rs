use std::sync::Arc;

use serde_json::Value;

use crate::execution::{
    CancelListener, ExecutionEvent, ExecutionSnapshot, ExecutionTask, ExecutionTaskListener,
    ListenerId, UserQuestionResult,
};
use crate::invocation::{
    InterimRequestCallback, InterimResponseCallback, InvocationCallback, InvocationResultCallback,
};
use crate::models::CoreError;

/// Client side: drives a local task from the terminal outcome and exposes the task's
/// cancellation as the invocation's cancellation.
pub struct ExecutionInvocationCallback {
    task: ExecutionTask,
    result: Arc<dyn InvocationResultCallback>,
}

impl ExecutionInvocationCallback {
    pub fn new(task: ExecutionTask, result: Arc<dyn InvocationResultCallback>) -> Self {
        Self { task, result }
    }
}

impl InvocationResultCallback for ExecutionInvocationCallback {
    fn finished(&self, result: Value) {
        self.task.finished();
        self.result.finished(result);
    }

    fn exception(&self, error: CoreError) {
        self.task.dispose();
        self.result.exception(error);
    }

    fn timeout(&self) {
        self.task.dispose();
        self.result.timeout();
    }
}

impl InvocationCallback for ExecutionInvocationCallback {
    fn add_cancel_listener(&self, listener: CancelListener) -> ListenerId {
        self.task.add_cancel_listener(listener)
    }

    fn remove_cancel_listener(&self, id: ListenerId) -> bool {
        self.task.remove_cancel_listener(id)
    }
}

/// Client side: mirrors server progress snapshots onto a local task.
pub struct ExecutionProgressCallback {
    task: ExecutionTask,
}

impl ExecutionProgressCallback {
    pub fn new(task: ExecutionTask) -> Self {
        Self { task }
    }
}

impl InterimResponseCallback for ExecutionProgressCallback {
    fn do_response(&self, response: Value) {
        match serde_json::from_value::<ExecutionSnapshot>(response) {
            Ok(snapshot) => self.task.apply_snapshot(&snapshot),
            Err(error) => {
                tracing::debug!(task_id = %self.task.id(), %error, "ignoring malformed progress")
            }
        }
    }
}

/// Client side: asks server questions on the local task and replies with its answer.
pub struct ExecutionQuestionCallback {
    task: ExecutionTask,
}

impl ExecutionQuestionCallback {
    pub fn new(task: ExecutionTask) -> Self {
        Self { task }
    }
}

impl InterimRequestCallback for ExecutionQuestionCallback {
    fn do_request(&self, reply: Arc<dyn InterimResponseCallback>, request: Value) {
        let question = match request {
            Value::String(question) => question,
            other => other.to_string(),
        };
        let answer_reply = reply.clone();
        let asked = self.task.user_question_with(question, move |answer| {
            answer_reply.do_response(answer_value(answer));
        });
        if let Err(error) = asked {
            tracing::debug!(task_id = %self.task.id(), %error, "question refused, answering cancel");
            reply.do_response(answer_value(UserQuestionResult::Cancel));
        }
    }
}

/// Server side: streams the task's progress and questions to the caller and cancels the
/// task when the caller cancels the invocation.
pub fn attach_server_execution(
    task: &ExecutionTask,
    result: &dyn InvocationCallback,
    progress: Arc<dyn InterimResponseCallback>,
    question: Arc<dyn InterimRequestCallback>,
) {
    let canceled = task.clone();
    result.add_cancel_listener(Arc::new(move || canceled.cancel()));
    task.add_listener(Arc::new(ServerExecutionForwarder {
        root: task.clone(),
        progress,
        question,
    }));
}

#[derive(Clone)]
struct ServerExecutionForwarder {
    root: ExecutionTask,
    progress: Arc<dyn InterimResponseCallback>,
    question: Arc<dyn InterimRequestCallback>,
}

impl ExecutionTaskListener for ServerExecutionForwarder {
    fn on_event(&self, task: &ExecutionTask, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::UserQuestionAsked(text) => {
                let target = task.clone();
                self.question.do_request(
                    Arc::new(move |answer: Value| {
                        let answer = serde_json::from_value(answer)
                            .unwrap_or(UserQuestionResult::Cancel);
                        if let Err(error) = target.set_question_result(answer) {
                            tracing::debug!(task_id = %target.id(), %error, "late answer dropped");
                        }
                    }),
                    Value::String(text.clone()),
                );
            }
            ExecutionEvent::SubExecutionAdded(child) => {
                child.add_listener(Arc::new(self.clone()));
                self.push_progress();
            }
            ExecutionEvent::Canceled
            | ExecutionEvent::Disposed
            | ExecutionEvent::UserQuestionAnswered(_) => {}
            _ => self.push_progress(),
        }
    }
}

impl ServerExecutionForwarder {
    fn push_progress(&self) {
        match serde_json::to_value(self.root.snapshot()) {
            Ok(snapshot) => self.progress.do_response(snapshot),
            Err(error) => tracing::warn!(task_id = %self.root.id(), %error, "progress snapshot not serializable"),
        }
    }
}

fn answer_value(answer: UserQuestionResult) -> Value {
    serde_json::to_value(answer).unwrap_or(Value::Null)
}
