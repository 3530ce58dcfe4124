//! Comparison pipeline against three scripted endpoints.

mod common;

use std::sync::Arc;

use common::{app, delta, delta_count, done, started_targets, wait_until, ScriptedBackend};
use streamchat::observer::{ObservedEvent, RecordingObserver};
use streamchat::providers::Role;
use streamchat::{ChatApp, ChatError, ComparisonEndpoint, Domain, PanelOutcome, PipelineState, TurnOutcome};

/// Register and activate three endpoints; returns their ids in order.
fn three_endpoints(app: &ChatApp) -> Vec<String> {
    app.update_settings(|s| {
        let mut ids = Vec::new();
        for (name, key) in [("alpha", Some("sk-a".to_string())), ("beta", None), ("gamma", None)] {
            let id = s.add_endpoint(ComparisonEndpoint::new(name, format!("http://{name}.test/v1"), format!("{name}-model"), key));
            s.set_endpoint_active(&id, true)?;
            ids.push(id);
        }
        Ok(ids)
    })
    .expect("endpoints")
}

fn message_count(app: &ChatApp, chat_id: &str) -> usize {
    app.with_state(|s| s.transcript.chat(chat_id).map(|c| c.messages.len())).expect("chat")
}

#[tokio::test]
async fn test_failing_endpoint_does_not_stop_siblings() {
    let backend = ScriptedBackend::new();
    let observer = Arc::new(RecordingObserver::new());
    let app = app(backend.clone(), observer.clone());
    app.update_settings(|s| {
        s.system_prompt = "never sent to comparisons".into();
        Ok(())
    })
    .expect("settings");
    let ids = three_endpoints(&app);
    let chat_id = app.create_chat().expect("chat");

    backend.complete(&[delta("A says "), delta("hi"), done()]);
    backend.status(503, "");
    backend.complete(&[delta("C says hi"), done()]);

    let report = app.compare(&chat_id, "Say hi").await.expect("compare");

    assert_eq!(report.panels.len(), 3);
    assert_eq!(report.finalized_count(), 3);
    assert!(!report.was_cancelled());
    assert!(matches!(&report.panels[0].outcome, PanelOutcome::Completed { content, .. } if content == "A says hi"));
    assert!(matches!(
        &report.panels[1].outcome,
        PanelOutcome::Failed { message, .. }
            if message == "⚠️ Error: API Error: 503 - Request failed with status 503. Check console/settings."
    ));
    assert!(matches!(&report.panels[2].outcome, PanelOutcome::Completed { content, .. } if content == "C says hi"));

    let requests = backend.requests();
    let urls: Vec<&str> = requests.iter().map(|(t, _)| t.url.as_str()).collect();
    assert_eq!(
        urls,
        vec![
            "http://alpha.test/v1/chat/completions",
            "http://beta.test/v1/chat/completions",
            "http://gamma.test/v1/chat/completions"
        ]
    );
    assert_eq!(requests[0].0.credential.as_deref(), Some("sk-a"));
    assert!(requests[1].0.credential.is_none());
    for (target, request) in &requests {
        assert_eq!(request.model, target.model);
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.messages[0].role, Role::User);
        assert_eq!(request.messages[0].content, "Say hi");
    }

    // only the user message is kept
    assert_eq!(message_count(&app, &chat_id), 1);
    assert_eq!(started_targets(&observer), ids);
    assert_eq!(app.with_state(|s| s.pipeline_state(Domain::Comparison)), PipelineState::Finalized);
}

#[tokio::test]
async fn test_cancel_during_second_endpoint() {
    let backend = ScriptedBackend::new();
    let observer = Arc::new(RecordingObserver::new());
    let app = app(backend.clone(), observer.clone());
    let ids = three_endpoints(&app);
    let chat_id = app.create_chat().expect("chat");

    backend.complete(&[delta("first"), done()]);
    let second = backend.stream();
    backend.complete(&[delta("never"), done()]);

    let task = tokio::spawn({
        let app = app.clone();
        let chat_id = chat_id.clone();
        async move { app.compare(&chat_id, "race").await }
    });
    second.send(delta("half")).expect("send");
    wait_until(|| delta_count(&observer, &ids[1]) == 1).await;

    assert!(app.abort_comparison());
    let report = task.await.expect("join").expect("compare");

    assert!(matches!(&report.panels[0].outcome, PanelOutcome::Completed { content, .. } if content == "first"));
    assert_eq!(report.panels[1].outcome, PanelOutcome::Aborted);
    assert_eq!(report.panels[2].outcome, PanelOutcome::NotStarted);
    assert!(report.was_cancelled());
    assert_eq!(backend.requests().len(), 2);
    assert_eq!(started_targets(&observer), ids[..2].to_vec());
    assert!(observer.events().iter().any(|e| matches!(e, ObservedEvent::Aborted { target } if *target == ids[1])));
    assert_eq!(message_count(&app, &chat_id), 1);
    assert_eq!(app.with_state(|s| s.pipeline_state(Domain::Comparison)), PipelineState::Cancelled);
}

#[tokio::test]
async fn test_each_panel_times_itself() {
    let backend = ScriptedBackend::new();
    let app = app(backend.clone(), Arc::new(RecordingObserver::new()));
    three_endpoints(&app);
    let chat_id = app.create_chat().expect("chat");

    let slow = backend.stream();
    backend.complete(&[delta("b"), done()]);
    backend.complete(&[delta("c"), done()]);

    let task = tokio::spawn({
        let app = app.clone();
        let chat_id = chat_id.clone();
        async move { app.compare(&chat_id, "time me").await }
    });
    wait_until(|| backend.requests().len() == 1).await;
    tokio::time::sleep(std::time::Duration::from_millis(120)).await;
    slow.send(delta("a")).expect("send");
    slow.send(done()).expect("send");
    drop(slow);

    let report = task.await.expect("join").expect("compare");
    let times: Vec<f64> = report
        .panels
        .iter()
        .map(|p| match p.outcome {
            PanelOutcome::Completed { response_time, .. } => response_time,
            ref other => panic!("unexpected outcome {other:?}"),
        })
        .collect();
    assert!(times[0] >= 0.1);
    assert!(times[1] < 0.1 && times[2] < 0.1);
}

#[tokio::test]
async fn test_more_than_three_active_refused_before_any_write() {
    let backend = ScriptedBackend::new();
    let app = app(backend.clone(), Arc::new(RecordingObserver::new()));
    app.update_settings(|s| {
        for i in 0..4 {
            let mut e = ComparisonEndpoint::new(format!("e{i}"), "http://e.test/v1", "m", None);
            e.active = true;
            s.add_endpoint(e);
        }
        Ok(())
    })
    .expect("settings");
    let chat_id = app.create_chat().expect("chat");

    let err = app.compare(&chat_id, "hello").await.expect_err("must refuse");
    assert!(matches!(err, ChatError::Configuration(_)));
    assert_eq!(message_count(&app, &chat_id), 0);
    assert!(backend.requests().is_empty());
}

#[tokio::test]
async fn test_no_usable_endpoint_refused() {
    let backend = ScriptedBackend::new();
    let app = app(backend.clone(), Arc::new(RecordingObserver::new()));
    app.update_settings(|s| {
        let id = s.add_endpoint(ComparisonEndpoint::new("blank", "", "m", None));
        s.set_endpoint_active(&id, true)
    })
    .expect("settings");
    let chat_id = app.create_chat().expect("chat");
    assert!(matches!(app.compare(&chat_id, "hello").await, Err(ChatError::Configuration(_))));
    assert_eq!(message_count(&app, &chat_id), 0);
}

#[tokio::test]
async fn test_comparison_and_single_turn_do_not_cross_cancel() {
    let backend = ScriptedBackend::new();
    let app = app(backend.clone(), Arc::new(RecordingObserver::new()));
    app.update_settings(|s| {
        let id = s.add_endpoint(ComparisonEndpoint::new("solo", "http://solo.test/v1", "m", None));
        s.set_endpoint_active(&id, true)
    })
    .expect("settings");
    let chat_id = app.create_chat().expect("chat");

    let single_body = backend.stream();
    let single = tokio::spawn({
        let app = app.clone();
        let chat_id = chat_id.clone();
        async move { app.send_turn(&chat_id, "single").await }
    });
    wait_until(|| backend.requests().len() == 1).await;

    backend.complete(&[delta("compared"), done()]);
    let report = app.compare(&chat_id, "compare").await.expect("compare");
    assert_eq!(report.finalized_count(), 1);
    assert!(app.with_state(|s| s.cancel.live(Domain::SingleTurn).is_some()));

    single_body.send(delta("single answer")).expect("send");
    single_body.send(done()).expect("send");
    drop(single_body);
    let outcome = single.await.expect("join").expect("turn");
    assert!(matches!(outcome, TurnOutcome::Finalized { ref content, .. } if content == "single answer"));
}

/// Start a one-endpoint comparison, let one delta land, run `switch`, then
/// push more bytes. The panel must end aborted with the late bytes unseen.
async fn assert_switch_aborts_comparison(switch: impl FnOnce(&ChatApp, &str)) {
    let backend = ScriptedBackend::new();
    let observer = Arc::new(RecordingObserver::new());
    let app = app(backend.clone(), observer.clone());
    let endpoint = app
        .update_settings(|s| {
            let id = s.add_endpoint(ComparisonEndpoint::new("solo", "http://solo.test/v1", "m", None));
            s.set_endpoint_active(&id, true)?;
            Ok(id)
        })
        .expect("settings");
    let other = app.create_chat().expect("other chat");
    let chat_id = app.create_chat().expect("chat");

    let body = backend.stream();
    let task = tokio::spawn({
        let app = app.clone();
        let chat_id = chat_id.clone();
        async move { app.compare(&chat_id, "compare me").await }
    });
    body.send(delta("a")).expect("send");
    wait_until(|| delta_count(&observer, &endpoint) == 1).await;

    switch(&app, &other);
    assert!(app.with_state(|s| s.cancel.live(Domain::Comparison).is_none()));

    let _ = body.send(delta("b"));
    drop(body);
    let report = task.await.expect("join").expect("compare");
    assert_eq!(report.panels[0].outcome, PanelOutcome::Aborted);
    assert_eq!(delta_count(&observer, &endpoint), 1);
    assert!(observer.events().iter().any(|e| matches!(e, ObservedEvent::Aborted { target } if *target == endpoint)));
}

#[tokio::test]
async fn test_creating_chat_aborts_comparison() {
    assert_switch_aborts_comparison(|app, _| {
        app.create_chat().expect("new chat");
    })
    .await;
}

#[tokio::test]
async fn test_switching_active_chat_aborts_comparison() {
    assert_switch_aborts_comparison(|app, other| app.set_active_chat(Some(other)).expect("switch")).await;
}

#[tokio::test]
async fn test_identity_change_aborts_comparison() {
    assert_switch_aborts_comparison(|app, _| app.identity_changed(Some("0xABC123"))).await;
}

#[tokio::test]
async fn test_teardown_aborts_comparison() {
    assert_switch_aborts_comparison(|app, _| app.teardown()).await;
}
