use cotton_upnp::fetch::HttpFetcher;
use cotton_upnp::*;
use futures_util::StreamExt;
use std::error::Error;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

fn show(d: &description::Device, indent: usize) {
    println!(
        "{:indent$}{} ({}) {}",
        "",
        d.friendly_name,
        d.device_type,
        d.udn,
        indent = indent
    );
    for s in &d.services {
        let actions = s.scpd.as_ref().map_or(0, |scpd| scpd.actions.len());
        println!(
            "{:indent$}  {} [{} actions]",
            "",
            s.service_type,
            actions,
            indent = indent
        );
    }
    for e in &d.devices {
        show(e, indent + 4);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_logging();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let service = AsyncService::new(&config)?;
    let fetcher = Arc::new(HttpFetcher::new(config.fetch_timeout())?);
    let cp = ControlPoint::start(&service, fetcher, &config);

    let mut events = cp.subscribe();
    while let Some(e) = events.next().await {
        match e {
            DeviceEvent::Added(d) => {
                print!("+ ");
                show(&d, 0);
            }
            DeviceEvent::Updated(d) => {
                println!("~ {} now at {}", d.friendly_name, d.location);
            }
            DeviceEvent::Removed(d) => println!("- {}", d.friendly_name),
            DeviceEvent::Expired(d) => {
                println!("- {} (expired)", d.friendly_name);
            }
            DeviceEvent::ResolutionFailed {
                udn,
                location,
                reason,
            } => println!("! {udn} at {location}: {reason}"),
        }
    }
    Ok(())
}
