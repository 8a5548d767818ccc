//! Command pump and widget-state tests (no terminal required).

use std::io::Cursor;
use std::sync::mpsc::{sync_channel, Receiver};

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

use super::commands::Job;
use super::*;

fn test_app() -> (App, Receiver<Job>) {
    let (jobs_tx, jobs_rx) = sync_channel::<Job>(COMMAND_QUEUE);
    let history = History::new(Cursor::new(""), HISTORY_LIMIT, Box::new(|_| {})).unwrap();
    (App::new(jobs_tx, history), jobs_rx)
}

fn key(code: KeyCode) -> KeyEvent {
    KeyEvent::new(code, KeyModifiers::NONE)
}

fn last_line(app: &App) -> &OutLine {
    app.lines.back().expect("output has lines")
}

#[test]
fn unknown_commands_are_reported_not_enqueued() {
    let (mut app, jobs) = test_app();
    app.run_command_line("/frobnicate".into());
    assert!(last_line(&app).error);
    assert!(last_line(&app).text.contains("frobnicate"));
    assert!(jobs.try_recv().is_err());
}

#[test]
fn arity_violations_are_reported_not_enqueued() {
    let (mut app, jobs) = test_app();
    app.run_command_line("/push only-one-arg".into());
    assert!(last_line(&app).text.contains("Expected at least 2 parameters"));
    assert!(jobs.try_recv().is_err());
}

#[test]
fn known_commands_are_enqueued() {
    let (mut app, jobs) = test_app();
    app.run_command_line("/clear".into());
    assert!(jobs.try_recv().is_ok());
}

#[test]
fn non_command_lines_go_to_the_device() {
    let (mut app, jobs) = test_app();
    app.run_command_line("print(node.heap())".into());
    assert!(jobs.try_recv().is_ok());
}

#[test]
fn output_accumulates_partial_lines() {
    let (mut app, _jobs) = test_app();
    app.append_output("hel");
    app.append_output("lo\nwor");
    assert_eq!(last_line(&app).text, "hello");
    assert_eq!(app.partial, "wor");
    app.append_output("ld\n");
    assert_eq!(last_line(&app).text, "world");
    assert!(app.partial.is_empty());
}

#[test]
fn output_buffer_is_capped() {
    let (mut app, _jobs) = test_app();
    for i in 0..(MAX_OUTPUT_LINES + 50) {
        app.append_output(&format!("line {}\n", i));
    }
    assert_eq!(app.lines.len(), MAX_OUTPUT_LINES);
    assert_eq!(app.lines.front().unwrap().text, "line 50");
}

#[test]
fn autocomplete_lists_matching_commands() {
    let (mut app, _jobs) = test_app();
    for c in "/pu".chars() {
        app.on_key(key(KeyCode::Char(c)));
    }
    assert_eq!(app.autocomplete, vec!["/push"]);

    // Tab completes to the highlighted candidate.
    app.on_key(key(KeyCode::Tab));
    assert_eq!(app.input, "/push");

    app.input.clear();
    app.input.push('/');
    app.refresh_autocomplete();
    assert!(app.autocomplete.len() > 5);
}

#[test]
fn plain_text_has_no_autocomplete() {
    let (mut app, _jobs) = test_app();
    for c in "pri".chars() {
        app.on_key(key(KeyCode::Char(c)));
    }
    assert!(app.autocomplete.is_empty());
}

#[test]
fn submitted_lines_land_in_history() {
    let (mut app, jobs) = test_app();
    for c in "/clear".chars() {
        app.on_key(key(KeyCode::Char(c)));
    }
    app.on_key(key(KeyCode::Enter));
    assert!(app.input.is_empty());
    assert!(jobs.try_recv().is_ok());
    assert_eq!(app.history.up(), "/clear");
}

#[test]
fn ctrl_b_toggles_the_browser_column() {
    let (mut app, _jobs) = test_app();
    assert_eq!(app.browser_width, BROWSER_WIDTH);
    app.on_key(KeyEvent::new(KeyCode::Char('b'), KeyModifiers::CONTROL));
    assert_eq!(app.browser_width, 0);
    app.on_key(KeyEvent::new(KeyCode::Char('b'), KeyModifiers::CONTROL));
    assert_eq!(app.browser_width, BROWSER_WIDTH);
}

#[test]
fn browser_enter_on_scripts_enqueues_a_dofile() {
    let (mut app, jobs) = test_app();
    app.apply(UiMsg::FileList(vec![
        FileRow {
            name: "app.lua".into(),
            size: 10,
        },
        FileRow {
            name: "data.txt".into(),
            size: 3,
        },
    ]));
    app.focus = Focus::Browser;

    // Row 0 is the synthetic refresh cell.
    app.browser_selected = 0;
    app.on_key(key(KeyCode::Enter));
    assert!(jobs.try_recv().is_ok());

    app.browser_selected = 1;
    app.on_key(key(KeyCode::Enter));
    assert!(jobs.try_recv().is_ok());

    // Non-scripts do nothing.
    app.browser_selected = 2;
    app.on_key(key(KeyCode::Enter));
    assert!(jobs.try_recv().is_err());
}

#[test]
fn f2_opens_the_rename_dialog_for_the_selection() {
    let (mut app, jobs) = test_app();
    app.apply(UiMsg::FileList(vec![FileRow {
        name: "app.lua".into(),
        size: 10,
    }]));
    app.focus = Focus::Browser;
    app.browser_selected = 1;
    app.on_key(key(KeyCode::F(2)));
    assert_eq!(app.rename.as_ref().unwrap().target, "app.lua");

    // Edit the name and confirm.
    app.on_key(key(KeyCode::Backspace));
    app.on_key(key(KeyCode::Backspace));
    app.on_key(key(KeyCode::Backspace));
    app.on_key(key(KeyCode::Char('t')));
    app.on_key(key(KeyCode::Char('x')));
    app.on_key(key(KeyCode::Char('t')));
    app.on_key(key(KeyCode::Enter));
    assert!(app.rename.is_none());
    assert!(jobs.try_recv().is_ok());
}

#[test]
fn rename_dialog_cancels_with_esc() {
    let (mut app, jobs) = test_app();
    app.apply(UiMsg::FileList(vec![FileRow {
        name: "app.lua".into(),
        size: 10,
    }]));
    app.focus = Focus::Browser;
    app.browser_selected = 1;
    app.on_key(key(KeyCode::F(2)));
    app.on_key(key(KeyCode::Esc));
    assert!(app.rename.is_none());
    assert!(jobs.try_recv().is_err());
}

#[test]
fn overflow_defers_one_job_then_drops() {
    let (mut app, _jobs) = test_app();
    for _ in 0..COMMAND_QUEUE {
        app.enqueue(Box::new(|_| {}));
    }
    assert!(app.deferred.is_none());
    app.enqueue(Box::new(|_| {}));
    assert!(app.deferred.is_some());
    app.enqueue(Box::new(|_| {}));
    assert!(last_line(&app).text.contains("queue is full"));
}

#[test]
fn clear_resets_the_output_pane() {
    let (mut app, _jobs) = test_app();
    app.append_output("some\ntext\npartial");
    app.apply(UiMsg::Clear);
    assert!(app.lines.is_empty());
    assert!(app.partial.is_empty());
}
