//! Simulated fetch run: a toy protocol handler drives a page load
//! through the scheduler while tracing logs every decision.
//!
//! Run with `RUST_LOG=debug cargo run -p scheduler --example fetch_simulation`.

use scheduler::{
    BlacklistFlags, ConnectionError, ConnectionState, LoadFlags, LoadPriority, LoadRequest,
    ProtocolHandler, RequestKey, Scheduler, SchedulerConfig, Transport,
};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

struct LoopbackSocket;

impl Transport for LoopbackSocket {
    fn has_unexpected_input(&self) -> bool {
        false
    }
}

/// Completes every request in one shot, as if the server answered
/// instantly. URLs ending in `/missing` fail instead.
struct SimulatedHttp;

impl ProtocolHandler for SimulatedHttp {
    fn scheme(&self) -> &'static str {
        "http"
    }

    fn keepalive_identity(&self, url: &Url) -> Option<String> {
        url.host_str().map(str::to_string)
    }

    fn start(&self, scheduler: &Scheduler, request: RequestKey, resumed: bool) {
        let Some(info) = scheduler.request_info(request) else {
            return;
        };
        // The transport is plain http. A host flagged avoid-insecure
        // only loads when the caller granted the downgrade.
        let host = info.url.host_str().unwrap_or("");
        if scheduler
            .blacklist_flags(host)
            .contains(BlacklistFlags::AVOID_INSECURE)
            && !info.flags.contains(LoadFlags::ALLOW_INSECURE)
        {
            scheduler.fail(request, ConnectionError::ProtocolDowngraded);
            return;
        }
        if !resumed {
            scheduler.set_addresses(request, vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
            let _ = scheduler.next_address(request);
            scheduler.set_socket(request, Box::new(LoopbackSocket));
            scheduler.set_state(request, ConnectionState::Sent);
        }
        scheduler.set_state(request, ConnectionState::Headers);
        scheduler.set_state(request, ConnectionState::Transferring);
        let total = 16 * 1024;
        scheduler.report_progress(request, total, Some(total));
        if info.url.path().ends_with("/missing") {
            scheduler.fail(
                request,
                ConnectionError::MalformedResponse("404 Not Found".to_string()),
            );
        } else {
            scheduler.finish(request);
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = SchedulerConfig::new()
        .with_max_connections(2)
        .with_max_per_host(1);
    let sched = Scheduler::new(config);
    sched.register_handler(Arc::new(SimulatedHttp));
    // A previous session decided this host should not be fetched over
    // plain http without the caller's say-so.
    sched.add_blacklist_flags("img.example.com", BlacklistFlags::AVOID_INSECURE);

    let page = [
        ("http://example.com/", LoadPriority::Critical, LoadFlags::empty()),
        ("http://example.com/style.css", LoadPriority::High, LoadFlags::empty()),
        ("http://cdn.example.com/app.js", LoadPriority::High, LoadFlags::empty()),
        ("http://img.example.com/hero.png", LoadPriority::Low, LoadFlags::ALLOW_INSECURE),
        ("http://img.example.com/tracker.gif", LoadPriority::Low, LoadFlags::empty()),
        ("http://example.com/missing", LoadPriority::Normal, LoadFlags::empty()),
    ];
    for (url, priority, flags) in page {
        let label = url.to_string();
        let result = sched.load(
            LoadRequest::new(url)
                .with_priority(priority)
                .with_flags(flags)
                .on_status(move |status| println!("{label}: {:?}", status.state)),
        );
        if let Err(err) = result {
            eprintln!("{url}: {err}");
        }
    }

    // Pump the event loop until everything settles.
    let start = Instant::now();
    for i in 0..32u32 {
        sched.tick(start + Duration::from_millis(250) * i);
        let stats = sched.stats();
        if stats.queued == 0 && stats.running == 0 {
            break;
        }
    }

    let stats = sched.stats();
    println!(
        "done: {} queued, {} running, {} pooled sockets",
        stats.queued, stats.running, stats.keepalive_sockets
    );
}
