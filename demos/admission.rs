use tasker::{Admission, RateLimitSettings};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = RateLimitSettings {
        global_rate: 20.0,
        global_burst: 30,
        ip_rate: 5.0,
        ip_burst: 10,
        ..RateLimitSettings::default()
    };
    let admission = Admission::new(&settings).expect("demo settings are valid");

    // Simulate requests from different clients
    let clients = ["192.168.1.1", "192.168.1.2", "192.168.1.3"];

    for client in clients {
        for i in 1..=12 {
            let decision = admission.allow(client);
            match decision.reason() {
                None => println!("{client} - request {i} allowed"),
                Some(reason) => println!("{client} - request {i} BLOCKED ({reason})"),
            }
        }
        println!();
    }

    println!("{}", admission.global_metrics());
    println!();
    println!("{}", admission.registry().stats());
}
