use std::sync::{Arc, Mutex};
use std::time::Duration;

use courier_core::broker::{BrokerRegistry, MessageChannel, Peer};
use courier_core::execution::{CancelListener, ListenerId};
use courier_core::invocation::{
    CancelSource, IgnoreProgress, IgnoreQuestions, InterimRequestCallback,
    InterimResponseCallback, InvocationCallback, InvocationClient, InvocationResultCallback,
    MethodDispatcher,
};
use courier_core::models::{
    BrokerId, CoreError, CoreErrorKind, CoreResult, InvocationId, InvocationMessage, Message,
    RequestId, ResultMessage,
};
use serde_json::{Value, json};
use tokio::runtime::Handle;

#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Finished(Value),
    Exception(CoreErrorKind),
    Timeout,
}

#[derive(Default)]
struct RecordingResult {
    outcomes: Mutex<Vec<Outcome>>,
    cancel: CancelSource,
}

impl RecordingResult {
    fn outcomes(&self) -> Vec<Outcome> {
        self.outcomes.lock().unwrap().clone()
    }
}

impl InvocationResultCallback for RecordingResult {
    fn finished(&self, result: Value) {
        self.outcomes.lock().unwrap().push(Outcome::Finished(result));
    }

    fn exception(&self, error: CoreError) {
        self.outcomes
            .lock()
            .unwrap()
            .push(Outcome::Exception(error.kind));
    }

    fn timeout(&self) {
        self.outcomes.lock().unwrap().push(Outcome::Timeout);
    }
}

impl InvocationCallback for RecordingResult {
    fn add_cancel_listener(&self, listener: CancelListener) -> ListenerId {
        self.cancel.add_listener(listener)
    }

    fn remove_cancel_listener(&self, id: ListenerId) -> bool {
        self.cancel.remove_listener(id)
    }
}

#[derive(Default)]
struct RecordingChannel {
    sent: Mutex<Vec<Message>>,
}

impl RecordingChannel {
    fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }
}

impl MessageChannel for RecordingChannel {
    fn send(&self, message: Message) -> CoreResult<()> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

fn peer(channel: &Arc<RecordingChannel>) -> Peer {
    Peer::new(
        BrokerId::new("server"),
        channel.clone(),
        BrokerRegistry::new(),
    )
}

fn register(
    client: &InvocationClient,
    result: &Arc<RecordingResult>,
    channel: &Arc<RecordingChannel>,
    timeout: Duration,
) -> InvocationId {
    client
        .register_invocation(
            result.clone(),
            Arc::new(IgnoreProgress),
            Arc::new(IgnoreQuestions),
            timeout,
            peer(channel),
        )
        .unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

fn cancels_sent(channel: &RecordingChannel, invocation_id: &InvocationId) -> usize {
    channel
        .sent()
        .iter()
        .filter(|message| {
            matches!(
                message,
                Message::Invocation(InvocationMessage::Cancel { invocation_id: sent })
                    if sent == invocation_id
            )
        })
        .count()
}

#[tokio::test(flavor = "multi_thread")]
async fn finished_is_delivered_once_and_duplicates_are_dropped() {
    let client = InvocationClient::new(Handle::current());
    let channel = Arc::new(RecordingChannel::default());
    let result = Arc::new(RecordingResult::default());
    let id = register(&client, &result, &channel, Duration::from_secs(5));
    assert!(client.is_pending(&id));

    client.handle_result(ResultMessage::Finished {
        invocation_id: id.clone(),
        result: json!(42),
    });
    client.handle_result(ResultMessage::Finished {
        invocation_id: id.clone(),
        result: json!(43),
    });
    client.handle_result(ResultMessage::Exception {
        invocation_id: id.clone(),
        error: CoreError::new(CoreErrorKind::Remote, "late"),
    });

    assert_eq!(result.outcomes(), vec![Outcome::Finished(json!(42))]);
    assert!(!client.is_pending(&id));
    assert_eq!(client.pending_count(), 0);
    assert_eq!(result.cancel.listener_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_invocation_ids_are_ignored() {
    let client = InvocationClient::new(Handle::current());
    client.handle_result(ResultMessage::Finished {
        invocation_id: InvocationId::generate(),
        result: Value::Null,
    });
    client.handle_result(ResultMessage::InterimResponse {
        invocation_id: InvocationId::generate(),
        response: Value::Null,
    });
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn timeout_wins_when_it_fires_first() {
    let client = InvocationClient::new(Handle::current());
    let channel = Arc::new(RecordingChannel::default());
    let result = Arc::new(RecordingResult::default());
    let id = register(&client, &result, &channel, Duration::from_millis(40));

    wait_until(|| !result.outcomes().is_empty()).await;
    client.handle_result(ResultMessage::Finished {
        invocation_id: id.clone(),
        result: json!("too late"),
    });

    assert_eq!(result.outcomes(), vec![Outcome::Timeout]);
    assert!(!client.is_pending(&id));
    wait_until(|| cancels_sent(&channel, &id) == 1).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn completion_before_timeout_disarms_the_timer() {
    let client = InvocationClient::new(Handle::current());
    let channel = Arc::new(RecordingChannel::default());
    let result = Arc::new(RecordingResult::default());
    let id = register(&client, &result, &channel, Duration::from_millis(40));

    client.handle_result(ResultMessage::Exception {
        invocation_id: id.clone(),
        error: CoreError::new(CoreErrorKind::Remote, "service failed"),
    });
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert_eq!(
        result.outcomes(),
        vec![Outcome::Exception(CoreErrorKind::Remote)]
    );
    assert_eq!(cancels_sent(&channel, &id), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn racing_completions_deliver_exactly_one_outcome() {
    let client = InvocationClient::new(Handle::current());
    let channel = Arc::new(RecordingChannel::default());

    for _ in 0..50 {
        let result = Arc::new(RecordingResult::default());
        let id = register(&client, &result, &channel, Duration::from_millis(1));
        let finisher = tokio::task::spawn_blocking({
            let client = client.clone();
            let id = id.clone();
            move || {
                client.handle_result(ResultMessage::Finished {
                    invocation_id: id,
                    result: json!(true),
                })
            }
        });
        finisher.await.unwrap();
        wait_until(|| !client.is_pending(&id)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(result.outcomes().len(), 1);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn interim_response_keeps_the_invocation_outstanding() {
    let client = InvocationClient::new(Handle::current());
    let channel = Arc::new(RecordingChannel::default());
    let result = Arc::new(RecordingResult::default());
    let progress = Arc::new(Mutex::new(Vec::new()));
    let id = client
        .register_invocation(
            result.clone(),
            Arc::new({
                let progress = progress.clone();
                move |response: Value| progress.lock().unwrap().push(response)
            }),
            Arc::new(IgnoreQuestions),
            Duration::from_secs(5),
            peer(&channel),
        )
        .unwrap();

    for step in 1..=3 {
        client.handle_result(ResultMessage::InterimResponse {
            invocation_id: id.clone(),
            response: json!({ "worked": step }),
        });
    }

    assert!(client.is_pending(&id));
    assert_eq!(progress.lock().unwrap().len(), 3);
    assert!(result.outcomes().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn question_answers_are_correlated_by_request_id() {
    let client = InvocationClient::new(Handle::current());
    let channel = Arc::new(RecordingChannel::default());
    let result = Arc::new(RecordingResult::default());
    let replies: Arc<Mutex<Vec<(Value, Arc<dyn InterimResponseCallback>)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let id = client
        .register_invocation(
            result.clone(),
            Arc::new(IgnoreProgress),
            Arc::new({
                let replies = replies.clone();
                move |reply: Arc<dyn InterimResponseCallback>, request: Value| {
                    replies.lock().unwrap().push((request, reply))
                }
            }),
            Duration::from_secs(5),
            peer(&channel),
        )
        .unwrap();

    let first = RequestId::generate();
    let second = RequestId::generate();
    for (request_id, text) in [(&first, "first?"), (&second, "second?")] {
        client.handle_result(ResultMessage::InterimRequest {
            invocation_id: id.clone(),
            request_id: request_id.clone(),
            request: json!(text),
        });
    }

    let pending = std::mem::take(&mut *replies.lock().unwrap());
    assert_eq!(pending.len(), 2);
    for (request, reply) in pending.iter().rev() {
        reply.do_response(json!(format!("answer to {}", request.as_str().unwrap())));
    }

    let answers: Vec<(RequestId, Value)> = channel
        .sent()
        .into_iter()
        .filter_map(|message| match message {
            Message::Invocation(InvocationMessage::Response {
                invocation_id,
                request_id,
                response,
            }) if invocation_id == id => Some((request_id, response)),
            _ => None,
        })
        .collect();
    assert_eq!(
        answers,
        vec![
            (second, json!("answer to second?")),
            (first, json!("answer to first?")),
        ]
    );
}

#[test]
fn dispatcher_routes_out_of_order_answers_to_their_own_question() {
    let dispatcher = MethodDispatcher::new();
    let answers: Arc<Mutex<Vec<(&'static str, Value)>>> = Arc::new(Mutex::new(Vec::new()));
    let held: Arc<Mutex<Option<Arc<dyn InvocationCallback>>>> = Arc::new(Mutex::new(None));
    dispatcher
        .register_method(
            "ask_twice",
            Arc::new({
                let answers = answers.clone();
                let held = held.clone();
                move |result: Arc<dyn InvocationCallback>,
                      _progress: Arc<dyn InterimResponseCallback>,
                      question: Arc<dyn InterimRequestCallback>,
                      _parameter: Value|
                      -> CoreResult<()> {
                    for label in ["first", "second"] {
                        let answers = answers.clone();
                        let reply: Arc<dyn InterimResponseCallback> =
                            Arc::new(move |answer: Value| {
                                answers.lock().unwrap().push((label, answer))
                            });
                        question.do_request(reply, json!(label));
                    }
                    *held.lock().unwrap() = Some(result);
                    Ok(())
                }
            }),
        )
        .unwrap();

    let channel = Arc::new(RecordingChannel::default());
    let id = InvocationId::generate();
    dispatcher.handle_invocation(
        InvocationMessage::Invoke {
            invocation_id: id.clone(),
            method: "ask_twice".to_string(),
            parameter: Value::Null,
        },
        peer(&channel),
    );

    let requests: Vec<(RequestId, Value)> = channel
        .sent()
        .into_iter()
        .filter_map(|message| match message {
            Message::Result(ResultMessage::InterimRequest {
                request_id,
                request,
                ..
            }) => Some((request_id, request)),
            _ => None,
        })
        .collect();
    assert_eq!(requests.len(), 2);
    assert_ne!(requests[0].0, requests[1].0);
    assert_eq!(dispatcher.pending_request_count(), 2);

    for (request_id, request) in requests.iter().rev() {
        dispatcher.handle_invocation(
            InvocationMessage::Response {
                invocation_id: id.clone(),
                request_id: request_id.clone(),
                response: json!(format!("answer to {}", request.as_str().unwrap())),
            },
            peer(&channel),
        );
    }

    assert_eq!(
        *answers.lock().unwrap(),
        vec![
            ("second", json!("answer to second")),
            ("first", json!("answer to first")),
        ]
    );
    assert_eq!(dispatcher.pending_request_count(), 0);

    // A repeated answer finds no pending request.
    dispatcher.handle_invocation(
        InvocationMessage::Response {
            invocation_id: id.clone(),
            request_id: requests[0].0.clone(),
            response: json!("again"),
        },
        peer(&channel),
    );
    assert_eq!(answers.lock().unwrap().len(), 2);

    held.lock().unwrap().take().unwrap().finished(json!("done"));
    assert_eq!(dispatcher.active_invocations(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn caller_cancel_removes_record_and_notifies_server() {
    let client = InvocationClient::new(Handle::current());
    let channel = Arc::new(RecordingChannel::default());
    let result = Arc::new(RecordingResult::default());
    let id = register(&client, &result, &channel, Duration::from_secs(5));

    assert!(result.cancel.cancel());
    assert!(!client.is_pending(&id));
    wait_until(|| cancels_sent(&channel, &id) == 1).await;

    client.handle_result(ResultMessage::Finished {
        invocation_id: id.clone(),
        result: json!("ignored"),
    });
    assert!(result.outcomes().is_empty());
    assert!(!client.cancel(&id));
}

#[tokio::test(flavor = "multi_thread")]
async fn fail_delivers_local_error_once() {
    let client = InvocationClient::new(Handle::current());
    let channel = Arc::new(RecordingChannel::default());
    let result = Arc::new(RecordingResult::default());
    let id = register(&client, &result, &channel, Duration::from_secs(5));

    let pending = client.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].invocation_id, id);
    assert_eq!(pending[0].server_id, BrokerId::new("server"));

    let error = CoreError::new(CoreErrorKind::Transport, "link down");
    assert!(client.fail(&id, error.clone()));
    assert!(!client.fail(&id, error));
    assert_eq!(
        result.outcomes(),
        vec![Outcome::Exception(CoreErrorKind::Transport)]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn exception_carries_the_invocation_id() {
    let client = InvocationClient::new(Handle::current());
    let channel = Arc::new(RecordingChannel::default());
    let seen: Arc<Mutex<Option<CoreError>>> = Arc::new(Mutex::new(None));

    struct Capture(Arc<Mutex<Option<CoreError>>>, CancelSource);
    impl InvocationResultCallback for Capture {
        fn finished(&self, _result: Value) {}
        fn exception(&self, error: CoreError) {
            *self.0.lock().unwrap() = Some(error);
        }
        fn timeout(&self) {}
    }
    impl InvocationCallback for Capture {
        fn add_cancel_listener(&self, listener: CancelListener) -> ListenerId {
            self.1.add_listener(listener)
        }
        fn remove_cancel_listener(&self, id: ListenerId) -> bool {
            self.1.remove_listener(id)
        }
    }

    let id = client
        .register_invocation(
            Arc::new(Capture(seen.clone(), CancelSource::new())),
            Arc::new(IgnoreProgress),
            Arc::new(IgnoreQuestions),
            Duration::from_secs(5),
            peer(&channel),
        )
        .unwrap();
    client.handle_result(ResultMessage::Exception {
        invocation_id: id.clone(),
        error: CoreError::new(CoreErrorKind::Remote, "boom"),
    });

    let error = seen.lock().unwrap().clone().unwrap();
    assert_eq!(error.invocation, Some(id));
    assert_eq!(error.message, "boom");
}
