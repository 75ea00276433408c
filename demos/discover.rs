/**
 * Discovery Example
 *
 * This example broadcasts a discovery probe on the local network and prints
 * every air conditioner that answers. v3 devices are listed without
 * credentials unless a token and key are supplied through the environment:
 *
 *   MIDEA_DEVICE_ID=147334558165565 MIDEA_TOKEN=<hex> MIDEA_KEY=<hex> \
 *       cargo run --example discover
 */
use rustmidea::{Discover, DiscoveryConfig, StaticCredentials};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    println!("--- Rustmidea - Discovery ---");

    let mut discover = Discover::new(DiscoveryConfig::default());

    // 1. Optional credentials for one v3 device
    if let (Ok(id), Ok(token), Ok(key)) = (
        std::env::var("MIDEA_DEVICE_ID"),
        std::env::var("MIDEA_TOKEN"),
        std::env::var("MIDEA_KEY"),
    ) {
        let mut credentials = StaticCredentials::new();
        match id.parse::<u64>() {
            Ok(id) => match credentials.insert_hex(id, &token, &key) {
                Ok(()) => discover = discover.with_credentials(Arc::new(credentials)),
                Err(e) => println!("[ERROR] Ignoring credentials: {}", e),
            },
            Err(e) => println!("[ERROR] Invalid MIDEA_DEVICE_ID: {}", e),
        }
    }

    // 2. Probe and collect replies
    println!("[INFO] Scanning the network for 5 seconds...");
    let devices = match discover.discover_all(Duration::from_secs(5)).await {
        Ok(devices) => devices,
        Err(e) => {
            println!("[ERROR] Discovery failed: {}", e);
            return;
        }
    };

    // 3. Print what was found
    for (i, device) in devices.iter().enumerate() {
        println!(
            "[{}] Found Device: ID={}, IP={}:{}, Version={:?}, Name={}, Authenticated={}",
            i + 1,
            device.id(),
            device.ip(),
            device.port(),
            device.version(),
            device.name().unwrap_or("-"),
            device.has_credentials()
        );
    }
    println!("[INFO] Scan finished. Total devices found: {}", devices.len());
}
