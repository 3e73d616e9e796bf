use cotton_upnp::*;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::error::Error;
use tracing_subscriber::EnvFilter;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    init_logging();
    println!(
        "ssdp-search from {} {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let s = AsyncService::new(&config)?;

    let uuid = format!("uuid:{:032x}", rand::random::<u128>());
    s.advertise(
        uuid,
        Advertisement {
            notification_type: "test".to_string(),
            location: url::Url::parse("http://127.0.0.1/test")?,
        },
    );

    let mut map = HashMap::new();
    let mut stream = s.subscribe("ssdp:all");
    while let Some(r) = stream.next().await {
        match r {
            Notification::Alive {
                ref notification_type,
                ref unique_service_name,
                ref location,
                ..
            }
            | Notification::SearchResult {
                ref notification_type,
                ref unique_service_name,
                ref location,
                ..
            } => {
                if !map.contains_key(unique_service_name) {
                    println!("+ {notification_type}");
                    println!("  {unique_service_name} at {location}");
                    map.insert(unique_service_name.clone(), r.clone());
                }
            }
            Notification::ByeBye {
                ref notification_type,
                ref unique_service_name,
                ..
            } => {
                if map.remove(unique_service_name).is_some() {
                    println!("- {notification_type}");
                    println!("  {unique_service_name}");
                }
            }
        }
    }

    Ok(())
}
