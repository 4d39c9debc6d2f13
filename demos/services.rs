use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tasker::prelude::*;
use tasker::Task;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_toml_str(
        r#"
        auto_complete_minutes = 30

        [logger]
        level = "info"
        batch_size = 10
        flush_delay_ms = 500

        [worker]
        scan_interval_secs = 1
        "#,
    )
    .expect("demo settings are valid");
    let settings = Arc::new(LiveSettings::new(settings));

    let store = Arc::new(MemoryTaskStore::new());
    for title in ["migrate billing", "rotate keys"] {
        let id = TaskId::new(title.replace(' ', "-"));
        store.insert(Task {
            id,
            title: title.to_string(),
            status: TaskStatus::Pending,
            created_at: chrono::Utc::now() - chrono::Duration::hours(2),
        });
    }
    let fresh = store.create("write changelog");

    let services = Services::start(settings, store.clone(), JsonLinesSink::stdout())
        .expect("services start");

    // A burst of requests from one client
    let logger = services.logger().for_request();
    for i in 1..=25 {
        let decision = services.admission().allow("198.51.100.7");
        if !decision.is_admitted() {
            logger.warn(
                "request rejected",
                vec![field("attempt", i), field("reason", decision.to_string())],
            );
        }
    }

    // Give the scanner a tick
    thread::sleep(Duration::from_millis(1500));

    for id in ["migrate-billing", "rotate-keys"] {
        let task = store.get(&TaskId::new(id)).expect("task exists");
        println!("{id}: {:?}", task.status);
    }
    println!("write-changelog: {:?}", store.get(&fresh).map(|t| t.status));

    let report = services.shutdown(Duration::from_secs(5));
    println!("{report:#?}");
}
