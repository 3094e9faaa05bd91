use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use courier_core::broker::{BrokerRegistry, InProcessBroker};
use courier_core::execution::{ExecutionEvent, ExecutionTask, UserQuestionResult};
use courier_core::invocation::{ExecutionMethod, SyncInvocation, SyncMethod};
use courier_core::models::{BrokerId, CoreError, CoreErrorKind, CoreResult};
use courier_core::{Node, RemotingConfig, logging};
use serde_json::{Value, json};

/// Each node names its end of the link after the peer it reaches.
const SERVER_LINK: &str = "server";
const CLIENT_LINK: &str = "client";

const USAGE: &str = "usage: courier <command>

commands:
  echo <json>        invoke the remote echo method with a JSON parameter
  countdown <steps>  run a remote execution with progress and a confirmation question
  methods            list the methods discovered on the server node";

fn main() -> ExitCode {
    let config = match RemotingConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("invalid configuration: {error}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&config.log_filter);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{USAGE}");
        return ExitCode::FAILURE;
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("failed to create tokio runtime: {error}");
            return ExitCode::FAILURE;
        }
    };

    let outcome = connect(&config, runtime.handle().clone()).and_then(|client| {
        match (command.as_str(), args.get(1)) {
            ("echo", Some(raw)) => echo(&client, raw),
            ("countdown", steps) => countdown(&client, steps.map(String::as_str)),
            ("methods", None) => Ok(json!(client.client().methods().method_names())),
            _ => Err(CoreError::new(CoreErrorKind::InvalidInput, USAGE)),
        }
    });

    match outcome {
        Ok(value) => {
            println!("{value}");
            ExitCode::SUCCESS
        }
        Err(error) if error.is_cancelled() => {
            eprintln!("canceled");
            ExitCode::FAILURE
        }
        Err(error) => {
            eprintln!("{error}");
            ExitCode::FAILURE
        }
    }
}

/// Wires a server and a client node over an in-process broker pair and discovers the
/// server's methods from the client.
fn connect(config: &RemotingConfig, runtime: tokio::runtime::Handle) -> CoreResult<Node> {
    let (to_server, to_client) = InProcessBroker::pair(SERVER_LINK, CLIENT_LINK, runtime.clone());

    let server_brokers = BrokerRegistry::new();
    server_brokers.add_broker(to_client)?;
    let server = Node::new(server_brokers, config.clone(), runtime.clone());
    server.register_method("echo", Arc::new(SyncMethod::new(|parameter: Value| Ok(parameter))))?;
    server.register_method("countdown", Arc::new(ExecutionMethod::new(run_countdown)))?;
    server.serve_discovery()?;
    server.listen(&BrokerId::new(CLIENT_LINK))?;

    let client_brokers = BrokerRegistry::new();
    client_brokers.add_broker(to_server)?;
    let client = Node::new(client_brokers, config.clone(), runtime);
    let server_id = BrokerId::new(SERVER_LINK);
    client.listen(&server_id)?;
    client.discover(&server_id)?;
    Ok(client)
}

fn echo(client: &Node, raw: &str) -> CoreResult<Value> {
    let parameter: Value = serde_json::from_str(raw)
        .unwrap_or_else(|_| Value::String(raw.to_string()));
    client
        .method_service("echo")
        .invoke_sync(parameter, Some(client.config().default_timeout))
}

fn countdown(client: &Node, steps: Option<&str>) -> CoreResult<Value> {
    let steps: u32 = steps.unwrap_or("5").parse().map_err(|error| {
        CoreError::new(
            CoreErrorKind::InvalidInput,
            format!("steps must be a number: {error}"),
        )
    })?;

    let task = ExecutionTask::new();
    task.add_listener(Arc::new(|task: &ExecutionTask, event: &ExecutionEvent| {
        match event {
            ExecutionEvent::Worked { worked, .. } => eprintln!(
                "progress {worked}/{} {}",
                task.total_step_count().unwrap_or_default(),
                task.description().unwrap_or_default()
            ),
            ExecutionEvent::UserQuestionAsked(question) => {
                eprintln!("{question} -> yes");
                if let Err(error) = task.set_question_result(UserQuestionResult::Yes) {
                    tracing::warn!(%error, "could not answer question");
                }
            }
            _ => {}
        }
    }));

    let bridge = Arc::new(SyncInvocation::new());
    bridge.link_execution(&task);
    client
        .method_service("countdown")
        .invoke_with_execution(&task, bridge.clone(), json!(steps));
    bridge.result_sync(Some(client.config().default_timeout))
}

fn run_countdown(task: &ExecutionTask, parameter: Value) -> CoreResult<Value> {
    let steps = parameter.as_u64().unwrap_or(5).min(u64::from(u32::MAX)) as u32;
    task.set_total_step_count(steps);
    for remaining in (1..=steps).rev() {
        if task.is_canceled() {
            return Err(CoreError::cancelled("countdown canceled"));
        }
        task.set_description(format!("{remaining} left"));
        std::thread::sleep(Duration::from_millis(100));
        task.worked_one();
    }

    let answer = task.user_question("Countdown complete. Launch?")?;
    Ok(json!({ "steps": steps, "launched": answer == UserQuestionResult::Yes }))
}
