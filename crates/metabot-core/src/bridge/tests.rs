use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use super::*;
use crate::stream::{CardStatus, ToolCallStatus};
use crate::testutil::{harness, wait_until, MockRunner, ScriptStep};
use crate::stream::AgentEvent;

fn msg(chat: &str, text: &str) -> IncomingMessage {
    IncomingMessage::text(chat, "u1", text)
}

fn ask_env_event() -> AgentEvent {
    AgentEvent::AskUser {
        tool_use_id: "q1".into(),
        questions: vec![crate::stream::Question {
            question: "Which env?".into(),
            header: "Env".into(),
            options: vec![
                crate::stream::QuestionOption { label: "dev".into(), description: None },
                crate::stream::QuestionOption { label: "prod".into(), description: None },
            ],
            multi_select: false,
        }],
    }
}

#[tokio::test(start_paused = true)]
async fn happy_path_produces_final_card_and_records() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path());

    h.runner.push_script(vec![
        ScriptStep::Emit(AgentEvent::SystemInit { session_id: "s1".into() }),
        ScriptStep::Emit(AgentEvent::ToolUseStart {
            id: "t1".into(),
            name: "Read".into(),
            input: json!({"file_path": "/a.rs"}),
        }),
        ScriptStep::Emit(AgentEvent::ToolUseDone { id: "t1".into(), is_error: false }),
        ScriptStep::Emit(AgentEvent::TextDelta { text: "world".into() }),
        ScriptStep::Emit(AgentEvent::Result {
            is_error: false,
            cost_usd: Some(0.01),
            duration_ms: Some(1234),
            result: None,
        }),
    ]);

    h.bridge.clone().handle_message(msg("c1", "hello")).await;

    let final_card = h.sender.last_card().unwrap();
    assert_eq!(final_card.status, CardStatus::Complete);
    assert_eq!(final_card.response_text, "world");
    assert_eq!(final_card.tool_calls.len(), 1);
    assert_eq!(final_card.tool_calls[0].name, "Read");
    assert_eq!(final_card.tool_calls[0].status, ToolCallStatus::Done);
    assert_eq!(final_card.cost_usd, Some(0.01));
    assert_eq!(final_card.duration_ms, Some(1234));

    // Session id discovered on the stream was persisted.
    assert_eq!(h.sessions.get_session("c1").session_id.as_deref(), Some("s1"));

    assert_eq!(h.metrics.counter_value("metabot_tasks_total", &[]), 1);
    assert_eq!(
        h.metrics
            .counter_value("metabot_tasks_by_status", &[("status", "success")]),
        1
    );
    assert_eq!(h.metrics.gauge_value("metabot_active_tasks", &[]), 0);
    assert!(!h.bridge.is_busy("c1"));

    let audit = h.audit.recent();
    assert_eq!(audit.first().unwrap().event, "task_start");
    assert_eq!(audit.last().unwrap().event, "task_complete");

    let costs = h.costs.snapshot();
    assert_eq!(costs.by_bot["testbot"].completed_tasks, 1);
}

#[tokio::test(start_paused = true)]
async fn question_reply_selects_option_and_continues() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path());

    h.runner.push_script(vec![
        ScriptStep::Emit(AgentEvent::SystemInit { session_id: "s1".into() }),
        ScriptStep::Emit(ask_env_event()),
        ScriptStep::AwaitAnswer,
        ScriptStep::Emit(AgentEvent::TextDelta { text: "deployed to prod".into() }),
        ScriptStep::Emit(AgentEvent::Result {
            is_error: false,
            cost_usd: None,
            duration_ms: None,
            result: None,
        }),
    ]);

    let bridge = h.bridge.clone();
    let task = tokio::spawn(bridge.handle_message(msg("c1", "deploy")));

    let sender = h.sender.clone();
    wait_until(move || {
        sender
            .last_card()
            .is_some_and(|card| card.status == CardStatus::WaitingForInput)
    })
    .await;

    h.bridge.clone().handle_message(msg("c1", "2")).await;
    task.await.unwrap();

    let answers = h.runner.answers.lock().unwrap().clone();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0]["answers"]["Env"], "prod");

    let final_card = h.sender.last_card().unwrap();
    assert_eq!(final_card.status, CardStatus::Complete);
    assert!(final_card.response_text.contains("deployed"));
}

#[tokio::test(start_paused = true)]
async fn unanswered_question_auto_answers_after_timeout() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path());

    h.runner.push_script(vec![
        ScriptStep::Emit(ask_env_event()),
        ScriptStep::AwaitAnswer,
        ScriptStep::Emit(AgentEvent::TextDelta { text: "went with dev".into() }),
        ScriptStep::Emit(AgentEvent::Result {
            is_error: false,
            cost_usd: None,
            duration_ms: None,
            result: None,
        }),
    ]);

    // Nobody replies; the 5 minute timer auto-answers and the task
    // continues to completion rather than aborting.
    h.bridge.clone().handle_message(msg("c1", "deploy")).await;

    let answers = h.runner.answers.lock().unwrap().clone();
    assert_eq!(answers.len(), 1);
    assert!(answers[0]["answers"]["_timeout"].is_string());

    let final_card = h.sender.last_card().unwrap();
    assert_eq!(final_card.status, CardStatus::Complete);
}

#[tokio::test(start_paused = true)]
async fn image_reply_to_question_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path());

    h.runner.push_script(vec![
        ScriptStep::Emit(ask_env_event()),
        ScriptStep::AwaitAnswer,
        ScriptStep::Emit(AgentEvent::Result {
            is_error: false,
            cost_usd: None,
            duration_ms: None,
            result: None,
        }),
    ]);

    let bridge = h.bridge.clone();
    let task = tokio::spawn(bridge.handle_message(msg("c1", "deploy")));

    let sender = h.sender.clone();
    wait_until(move || {
        sender
            .last_card()
            .is_some_and(|card| card.status == CardStatus::WaitingForInput)
    })
    .await;

    let mut image_reply = msg("c1", "");
    image_reply.image_key = Some("img-key".into());
    h.bridge.clone().handle_message(image_reply).await;

    // The question is still pending and no answer was sent.
    assert!(h.runner.answers.lock().unwrap().is_empty());
    assert!(h
        .sender
        .texts
        .lock()
        .unwrap()
        .iter()
        .any(|t| t.contains("reply with text")));

    // A proper reply still works afterwards.
    h.bridge.clone().handle_message(msg("c1", "1")).await;
    task.await.unwrap();
    let answers = h.runner.answers.lock().unwrap().clone();
    assert_eq!(answers[0]["answers"]["Env"], "dev");
}

#[tokio::test(start_paused = true)]
async fn queue_fills_to_five_then_rejects_and_drains_in_order() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path());

    h.runner.push_script(vec![ScriptStep::Hang]);
    for text in ["a", "b", "c", "d", "e"] {
        h.runner.push_script(MockRunner::quick_script(text));
    }

    let bridge = h.bridge.clone();
    let first = tokio::spawn(bridge.handle_message(msg("c1", "long-running")));
    let b = h.bridge.clone();
    wait_until(move || b.is_busy("c1")).await;

    for (i, text) in ["a", "b", "c", "d", "e"].iter().enumerate() {
        h.bridge.clone().handle_message(msg("c1", text)).await;
        assert_eq!(h.bridge.queue_len("c1"), i + 1);
    }
    let titles = h.sender.notice_titles();
    assert_eq!(titles.iter().filter(|t| *t == "Message Queued").count(), 5);

    // Sixth message: queue full.
    h.bridge.clone().handle_message(msg("c1", "f")).await;
    assert_eq!(h.bridge.queue_len("c1"), 5);
    let (_, _, color) = h
        .sender
        .notices
        .lock()
        .unwrap()
        .iter()
        .find(|(title, _, _)| title == "Queue Full")
        .cloned()
        .unwrap();
    assert_eq!(color, crate::sender::NoticeColor::Orange);

    // Stop the running task; the queue drains one at a time, in order.
    h.bridge.clone().handle_message(msg("c1", "/stop")).await;
    first.await.unwrap();

    let runner = h.runner.clone();
    let bridge = h.bridge.clone();
    wait_until(move || runner.prompts().len() == 6 && !bridge.is_busy("c1")).await;

    let prompts = h.runner.prompts();
    assert_eq!(prompts, vec!["long-running", "a", "b", "c", "d", "e"]);
    assert_eq!(h.bridge.queue_len("c1"), 0);
}

#[tokio::test(start_paused = true)]
async fn stopped_task_reports_task_was_stopped() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path());
    h.runner.push_script(vec![ScriptStep::Hang]);

    let bridge = h.bridge.clone();
    let task = tokio::spawn(bridge.handle_message(msg("c1", "work")));
    let b = h.bridge.clone();
    wait_until(move || b.is_busy("c1")).await;

    h.bridge.clone().handle_message(msg("c1", "/stop")).await;
    task.await.unwrap();

    let final_card = h.sender.last_card().unwrap();
    assert_eq!(final_card.status, CardStatus::Error);
    assert_eq!(final_card.error_message.as_deref(), Some("Task was stopped"));
}

#[tokio::test(start_paused = true)]
async fn idle_task_is_aborted_with_idle_message() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path());
    h.runner.push_script(vec![ScriptStep::Hang]);

    h.bridge.clone().handle_message(msg("c1", "work")).await;

    let final_card = h.sender.last_card().unwrap();
    assert_eq!(final_card.status, CardStatus::Error);
    assert_eq!(
        final_card.error_message.as_deref(),
        Some("Task aborted: no activity for 5 minutes")
    );
    let audit = h.audit.recent();
    assert_eq!(audit.last().unwrap().event, "task_idle_timeout");
}

#[tokio::test(start_paused = true)]
async fn crashed_stream_synthesizes_error_preserving_text() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path());
    // Stream ends without a terminal event and without any text.
    h.runner.push_script(vec![ScriptStep::Emit(AgentEvent::SystemInit {
        session_id: "s1".into(),
    })]);

    h.bridge.clone().handle_message(msg("c1", "work")).await;
    let final_card = h.sender.last_card().unwrap();
    assert_eq!(final_card.status, CardStatus::Error);
    assert_eq!(
        final_card.error_message.as_deref(),
        Some("Claude session ended unexpectedly")
    );

    // With partial text the same crash counts as a completion.
    h.runner.push_script(vec![ScriptStep::Emit(AgentEvent::TextDelta {
        text: "partial".into(),
    })]);
    h.bridge.clone().handle_message(msg("c2", "work")).await;
    let final_card = h.sender.last_card().unwrap();
    assert_eq!(final_card.status, CardStatus::Complete);
    assert_eq!(final_card.response_text, "partial");
}

#[tokio::test(start_paused = true)]
async fn final_card_retries_then_succeeds_without_fallback() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path());
    h.runner.push_script(vec![ScriptStep::Emit(AgentEvent::Result {
        is_error: false,
        cost_usd: None,
        duration_ms: None,
        result: Some("all done".into()),
    })]);

    h.sender.fail_next_updates(2);
    h.bridge.clone().handle_message(msg("c1", "work")).await;

    let final_card = h.sender.last_card().unwrap();
    assert_eq!(final_card.status, CardStatus::Complete);
    assert!(h.sender.texts.lock().unwrap().is_empty(), "no fallback expected");
}

#[tokio::test(start_paused = true)]
async fn final_card_falls_back_to_text_after_three_failures() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path());
    let long_text = "x".repeat(5000);
    h.runner.push_script(vec![ScriptStep::Emit(AgentEvent::Result {
        is_error: false,
        cost_usd: None,
        duration_ms: None,
        result: Some(long_text),
    })]);

    h.sender.fail_next_updates(3);
    h.bridge.clone().handle_message(msg("c1", "work")).await;

    let texts = h.sender.texts.lock().unwrap().clone();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].starts_with("✅"));
    // Truncated to the 2 KB fallback cap (plus marker and ellipsis).
    assert!(texts[0].chars().count() <= 2048 + 4);
}

#[tokio::test(start_paused = true)]
async fn api_task_auto_answers_and_returns_result() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path());

    h.runner.push_script(vec![
        ScriptStep::Emit(AgentEvent::SystemInit { session_id: "s9".into() }),
        ScriptStep::Emit(ask_env_event()),
        ScriptStep::AwaitAnswer,
        ScriptStep::Emit(AgentEvent::TextDelta { text: "report ready".into() }),
        ScriptStep::Emit(AgentEvent::Result {
            is_error: false,
            cost_usd: Some(0.02),
            duration_ms: Some(500),
            result: None,
        }),
    ]);

    let result = h
        .bridge
        .clone()
        .execute_api_task(ApiTaskOptions {
            prompt: "nightly report".into(),
            chat_id: "c1".into(),
            user_id: "scheduler".into(),
            send_cards: false,
        })
        .await;

    assert!(result.success);
    assert_eq!(result.response_text, "report ready");
    assert_eq!(result.session_id.as_deref(), Some("s9"));
    assert_eq!(result.cost_usd, Some(0.02));

    // Question was auto-answered, silently: no cards, no notices.
    let answers = h.runner.answers.lock().unwrap().clone();
    assert!(answers[0]["answers"]["_auto"].is_string());
    assert!(h.sender.cards.lock().unwrap().is_empty());
    assert!(h.sender.notices.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn api_task_on_busy_chat_errors_without_queueing() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path());
    h.runner.push_script(vec![ScriptStep::Hang]);

    let bridge = h.bridge.clone();
    let task = tokio::spawn(bridge.handle_message(msg("c1", "long")));
    let b = h.bridge.clone();
    wait_until(move || b.is_busy("c1")).await;

    let result = h
        .bridge
        .clone()
        .execute_api_task(ApiTaskOptions {
            prompt: "extra".into(),
            chat_id: "c1".into(),
            user_id: "scheduler".into(),
            send_cards: true,
        })
        .await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("busy"));

    h.bridge.clone().handle_message(msg("c1", "/stop")).await;
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unauthorized_messages_are_silently_dropped() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("restricted");
    std::fs::create_dir_all(&dir).unwrap();
    let runner = crate::testutil::MockRunner::new();
    let sender = crate::testutil::MockSender::new();
    let sessions = Arc::new(crate::session::SessionManager::new(
        &dir,
        "restricted",
        dir.join("work"),
    ));
    let mut config = crate::testutil::test_bot_config("restricted", &dir.join("work"));
    config.authorized_user_ids = vec!["vip".into()];
    let bridge = MessageBridge::new(BridgeContext {
        bot_name: "restricted".into(),
        config,
        sender: sender.clone(),
        runner: runner.clone(),
        sessions,
        outputs: crate::outputs::OutputsManager::new(dir.join("outputs")),
        downloads_dir: dir.join("downloads"),
        memory: None,
        metrics: Arc::new(crate::metrics::Metrics::new()),
        audit: Arc::new(crate::metrics::AuditLog::new()),
        costs: Arc::new(crate::cost::CostTracker::new()),
        api_port: None,
        api_secret: None,
    });

    bridge.clone().handle_message(msg("c1", "hello")).await;
    assert!(runner.prompts().is_empty());
    assert!(sender.cards.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unknown_command_falls_through_to_agent() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path());
    h.runner.push_script(MockRunner::quick_script("ok"));

    h.bridge.clone().handle_message(msg("c1", "/frobnicate now")).await;

    assert_eq!(h.runner.prompts(), vec!["/frobnicate now"]);
}

#[tokio::test(start_paused = true)]
async fn reset_command_clears_session_id() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path());
    h.sessions.set_session_id("c1", "s-old");

    h.bridge.clone().handle_message(msg("c1", "/reset")).await;

    assert!(h.sessions.get_session("c1").session_id.is_none());
    assert!(h.sender.notice_titles().contains(&"Session Reset".to_string()));
}

#[tokio::test(start_paused = true)]
async fn stop_without_running_task_notices() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path());

    h.bridge.clone().handle_message(msg("c1", "/stop")).await;

    assert!(h.sender.notice_titles().contains(&"No Running Task".to_string()));
}

#[tokio::test(start_paused = true)]
async fn output_files_are_sent_after_completion() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path());

    // The agent writes an output file mid-run; the mock emits the events
    // and the test drops the file into the prepared outputs dir.
    let outputs_dir = tmp.path().join("outputs").join("c1");
    h.runner.push_script(vec![
        ScriptStep::Emit(AgentEvent::SystemInit { session_id: "s1".into() }),
        ScriptStep::Sleep(Duration::from_millis(50)),
        ScriptStep::Emit(AgentEvent::Result {
            is_error: false,
            cost_usd: None,
            duration_ms: None,
            result: Some("wrote a file".into()),
        }),
    ]);

    let dir = outputs_dir.clone();
    let runner = h.runner.clone();
    let writer = tokio::spawn(async move {
        // The outputs dir is prepared before the agent starts, so waiting
        // for the start request makes the write race-free.
        wait_until(move || !runner.requests.lock().unwrap().is_empty()).await;
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("report.md"), b"# report").await.unwrap();
    });

    h.bridge.clone().handle_message(msg("c1", "make a report")).await;
    writer.await.unwrap();

    let files = h.sender.files.lock().unwrap().clone();
    assert_eq!(files.len(), 1);
    assert!(files[0].ends_with("report.md"));
    // The outputs dir is cleaned up afterwards.
    assert!(!outputs_dir.exists());
}

#[tokio::test(start_paused = true)]
async fn different_chats_run_concurrently() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path());
    h.runner.push_script(vec![ScriptStep::Hang]);
    h.runner.push_script(MockRunner::quick_script("fast"));

    let bridge = h.bridge.clone();
    let slow = tokio::spawn(bridge.handle_message(msg("slow-chat", "slow")));
    let b = h.bridge.clone();
    wait_until(move || b.is_busy("slow-chat")).await;

    // A different chat is not blocked by the first one.
    h.bridge.clone().handle_message(msg("fast-chat", "fast")).await;
    assert!(h.bridge.is_busy("slow-chat"));
    assert!(!h.bridge.is_busy("fast-chat"));

    h.bridge.clone().handle_message(msg("slow-chat", "/stop")).await;
    slow.await.unwrap();
}
