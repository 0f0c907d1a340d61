//! End-to-end hot swapping against scripted modules

use std::sync::Arc;
use std::time::Duration;

use plughost_runtime::hot_reload::{CopyToken, WatchConfig};
use plughost_runtime::{
    HostContext, LoopState, ModuleStore, READY_PROMPT, ReloadEvent, ReloadOutcome,
    StagedRetention,
};
use plughost_testing::{HostFixture, wait_until};

const WAIT: Duration = Duration::from_secs(5);

fn entry_name(host: &HostContext) -> Option<String> {
    host.current_generation().map(|g| g.entry_name().to_string())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_module_keeps_host_up_and_not_ready() {
    let mut fx = HostFixture::new();
    let host = fx.start().await;

    assert!(fx.console.contains("Plugin module not found"));
    assert!(host.current_generation().is_none());
    assert!(!host.exit_token().is_cancelled());

    fx.input.send("list");
    assert!(fx.console.wait_for("Plugin not ready", WAIT).await);
    assert_eq!(fx.connector.connects(), 0);

    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_module_dropped_in_later_is_picked_up() {
    let mut fx = HostFixture::new();
    let host = fx.start().await;
    assert!(host.is_watching());

    fx.write_module("echo:late");
    assert!(wait_until(WAIT, || entry_name(&host).as_deref() == Some("late")).await);
    assert!(fx.console.wait_for(READY_PROMPT, WAIT).await);

    fx.input.send("list");
    assert!(fx.console.wait_for("late:list", WAIT).await);

    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_initial_load_serves_commands() {
    let mut fx = HostFixture::new();
    fx.write_module("echo:v1");
    let host = fx.start().await;

    assert!(fx.console.contains("New module staged:"));
    assert!(fx.console.contains(READY_PROMPT));
    assert_eq!(fx.connector.connects(), 1);

    fx.input.send("list");
    assert!(fx.console.wait_for("v1:list", WAIT).await);
    // staging does not change what the module does
    assert_eq!(fx.loader.staged_paths().len(), 1);
    assert_ne!(fx.loader.staged_paths()[0], fx.module_path());

    let (bound, state) = host.active_loop().await.unwrap();
    assert_eq!(bound, host.current_generation().map(|g| g.id()));
    assert_eq!(state, LoopState::Running);

    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watcher_reloads_replaced_module() {
    let mut fx = HostFixture::new();
    fx.write_module("echo:v1");
    let host = fx.start().await;
    let mut events = host.subscribe();

    fx.write_module("echo:v2");
    assert!(fx.console.wait_for("Plugin change detected! Reloading...", WAIT).await);
    assert!(wait_until(WAIT, || entry_name(&host).as_deref() == Some("v2")).await);

    fx.input.send("list");
    assert!(fx.console.wait_for("v2:list", WAIT).await);

    let mut saw_signal = false;
    while let Ok(event) = events.try_recv() {
        saw_signal |= matches!(event, ReloadEvent::SignalReceived { .. });
    }
    assert!(saw_signal);

    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_build_dropped_inside_debounce_window_is_installed() {
    let mut fx = HostFixture::new().configure(|b| b.with_watch_config(WatchConfig::default()));
    fx.write_module("echo:v1");
    let host = fx.start().await;

    fx.write_module("echo:v2");
    assert!(wait_until(WAIT, || entry_name(&host).as_deref() == Some("v2")).await);

    // well inside the 500 ms window opened by v2
    tokio::time::sleep(Duration::from_millis(150)).await;
    fx.write_module("echo:v3");
    assert!(
        wait_until(WAIT, || entry_name(&host).as_deref() == Some("v3")).await,
        "current = {:?}",
        entry_name(&host)
    );

    fx.input.send("list");
    assert!(fx.console.wait_for("v3:list", WAIT).await);

    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reload_retires_and_unloads_previous_generation() {
    let mut fx = HostFixture::new();
    fx.overwrite_module("echo:v1");
    let host = fx.start().await;
    let first = host.current_generation().unwrap().id();
    let mut events = host.subscribe();

    fx.overwrite_module("echo:v2");
    let ReloadOutcome::Installed(second) = host.request_reload().await else {
        panic!("reload did not install");
    };
    assert!(second > first);
    assert_eq!(host.current_generation().unwrap().id(), second);

    assert!(wait_until(WAIT, || fx.loader.live_contexts() == 1).await);
    assert!(host.loader().retiring().is_empty());
    // delete-on-retire leaves only the current copy
    assert_eq!(fx.staged_files().len(), 1);

    let mut unloaded = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ReloadEvent::GenerationUnloaded { generation } = event {
            unloaded.push(generation);
        }
    }
    assert_eq!(unloaded, vec![first]);

    fx.input.send("list");
    assert!(fx.console.wait_for("v2:list", WAIT).await);
    assert_eq!(fx.console.count(READY_PROMPT), 2);
    // the connection outlives generations
    assert_eq!(fx.connector.connects(), 1);

    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_contract_failure_keeps_previous_generation() {
    let mut fx = HostFixture::new();
    fx.overwrite_module("echo:v1");
    let host = fx.start().await;
    let first = host.current_generation().unwrap().id();

    fx.overwrite_module("no-entry");
    let outcome = host.request_reload().await;
    assert!(matches!(outcome, ReloadOutcome::Failed(ref e) if e.contains("contract")));
    assert!(fx.console.contains("Error loading plugin:"));
    assert!(fx.console.contains("The previous plugin version is still active."));

    assert_eq!(host.current_generation().unwrap().id(), first);
    assert_eq!(fx.loader.live_contexts(), 1);
    // the rejected copy is released right away
    assert_eq!(fx.staged_files().len(), 1);

    fx.input.send("list");
    assert!(fx.console.wait_for("v1:list", WAIT).await);

    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unloadable_image_is_a_load_error() {
    let mut fx = HostFixture::new();
    fx.overwrite_module("\u{7f}ELF not really");
    let host = fx.start().await;

    assert!(fx.console.contains("Error loading plugin: failed to load"));
    assert!(!fx.console.contains("still active"));
    assert!(fx.staged_files().is_empty());

    fx.input.send("list");
    assert!(fx.console.wait_for("Plugin not ready", WAIT).await);

    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_in_flight_command_finishes_on_old_generation() {
    let mut fx = HostFixture::new();
    fx.overwrite_module("blocking:old");
    let host = fx.start().await;
    let old = host.current_generation().unwrap();

    fx.input.send("list");
    let gate = fx.loader.call_gate().clone();
    assert!(wait_until(WAIT, || gate.waiting() == 1).await);
    assert_eq!(old.in_flight(), 1);

    fx.overwrite_module("echo:new");
    let reload = tokio::spawn({
        let host = host.clone();
        async move { host.request_reload().await }
    });

    // swapped, but the old context stays loaded while the command runs
    assert!(wait_until(WAIT, || entry_name(&host).as_deref() == Some("new")).await);
    assert!(old.is_retiring());
    assert_eq!(fx.loader.live_contexts(), 2);
    assert_eq!(host.loader().retiring(), vec![old.id()]);
    drop(old);

    gate.open();
    assert!(matches!(reload.await.unwrap(), ReloadOutcome::Installed(_)));
    assert!(fx.console.wait_for("old:list", WAIT).await);
    assert!(wait_until(WAIT, || fx.loader.live_contexts() == 1).await);

    fx.input.send("list");
    assert!(fx.console.wait_for("new:list", WAIT).await);

    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_signals_during_reload_coalesce_into_one() {
    let mut fx = HostFixture::new();
    fx.overwrite_module("echo:v1");
    let host = fx.start().await;
    assert_eq!(fx.loader.loads(), 1);
    let mut events = host.subscribe();

    fx.overwrite_module("slow:v2");
    let first = tokio::spawn({
        let host = host.clone();
        async move { host.request_reload().await }
    });
    let gate = fx.loader.load_gate().clone();
    assert!(wait_until(WAIT, || gate.waiting() == 1).await);

    for _ in 0..5 {
        assert_eq!(host.request_reload().await, ReloadOutcome::Coalesced);
    }
    fx.overwrite_module("echo:v3");
    gate.open();

    let outcome = first.await.unwrap();
    assert!(matches!(outcome, ReloadOutcome::Installed(_)));
    // the running reload plus exactly one more, which saw the newest file
    assert_eq!(fx.loader.loads(), 3);
    assert_eq!(entry_name(&host).as_deref(), Some("v3"));

    let mut coalesced = 0;
    while let Ok(event) = events.try_recv() {
        if event == ReloadEvent::SignalCoalesced {
            coalesced += 1;
        }
    }
    assert_eq!(coalesced, 5);

    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_externally_closed_connection_is_reopened() {
    let mut fx = HostFixture::new();
    fx.overwrite_module("echo:v1");
    let host = fx.start().await;

    fx.input.send("list");
    assert!(fx.console.wait_for("v1:list", WAIT).await);

    fx.connector.latest().unwrap().close_externally();
    fx.input.send("get 1");
    assert!(fx.console.wait_for("v1:get 1", WAIT).await);

    assert_eq!(fx.connector.connects(), 2);
    assert_eq!(fx.connector.open_handles(), 1);
    assert!(!fx.console.contains("Error"));

    host.shutdown().await;
    assert_eq!(fx.connector.open_handles(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_connect_is_reported_and_retried() {
    let mut fx = HostFixture::new();
    fx.overwrite_module("echo:v1");
    fx.connector.fail_next(2);
    let host = fx.start().await;

    assert!(fx.console.contains("Error: failed to open connection to mock://plughost"));
    assert!(!fx.console.contains(READY_PROMPT));

    fx.input.send("list");
    assert!(fx.console.wait_for("Error: could not open the database connection", WAIT).await);
    assert!(fx.console.wait_for("Details: failed to open connection", WAIT).await);

    fx.input.send("list");
    assert!(fx.console.wait_for("v1:list", WAIT).await);
    assert_eq!(fx.connector.connects(), 1);

    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_plugin_errors_do_not_stop_the_loop() {
    let mut fx = HostFixture::new();
    fx.overwrite_module("fail");
    let host = fx.start().await;

    fx.input.send("list");
    assert!(fx.console.wait_for("Details: Plugin execution failed: scripted failure", WAIT).await);
    assert!(fx.console.contains("Error: command 'list' failed"));

    fx.overwrite_module("panic");
    assert!(matches!(host.request_reload().await, ReloadOutcome::Installed(_)));
    fx.input.send("boom");
    assert!(fx.console.wait_for("Error: command 'boom' panicked", WAIT).await);
    assert!(fx.console.contains("Details: plugin blew up on 'boom'"));

    fx.overwrite_module("echo:ok");
    assert!(matches!(host.request_reload().await, ReloadOutcome::Installed(_)));
    fx.input.send("list");
    assert!(fx.console.wait_for("ok:list", WAIT).await);

    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exit_command_ends_the_host() {
    let mut fx = HostFixture::new();
    fx.overwrite_module("echo:v1");
    let host = fx.start().await;

    fx.input.send("   ");
    fx.input.send("EXIT");
    tokio::time::timeout(WAIT, host.wait_for_exit())
        .await
        .expect("exit was not observed");
    assert!(!fx.console.contains("v1:"));

    host.shutdown().await;
    assert!(!host.is_watching());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_end_of_input_ends_the_host() {
    let mut fx = HostFixture::new();
    let host = fx.start().await;

    drop(fx.input);
    tokio::time::timeout(WAIT, host.wait_for_exit())
        .await
        .expect("end of input was not observed");

    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ensure_open_reuses_the_handle() {
    let mut fx = HostFixture::new();
    fx.overwrite_module("echo:v1");
    let host = fx.start().await;

    let a = host.connections().ensure_open().await.unwrap();
    let b = host.connections().ensure_open().await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(host.connections().open_count(), 1);

    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_keep_all_retention_and_startup_purge() {
    let mut fx = HostFixture::new()
        .configure(|b| b.with_retention(StagedRetention::KeepAll).with_purge_on_startup(true));
    fx.overwrite_module("echo:v1");

    let stale = ModuleStore::staged_path_for(&fx.module_path(), CopyToken::next());
    std::fs::write(&stale, "echo:stale").unwrap();

    let host = fx.start().await;
    assert!(!stale.exists());

    fx.overwrite_module("echo:v2");
    assert!(matches!(host.request_reload().await, ReloadOutcome::Installed(_)));
    assert!(wait_until(WAIT, || fx.loader.live_contexts() == 1).await);
    assert_eq!(fx.staged_files().len(), 2);

    host.shutdown().await;
}
