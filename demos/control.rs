/**
 * Device Control Example
 *
 * Finds one air conditioner by address, reads its capabilities and state,
 * then switches it on in cool mode at 24 degrees.
 *
 *   cargo run --example control -- 192.168.1.50
 */
use rustmidea::{DesiredState, Device, Discover, OperationalMode, SessionConfig};
use std::net::IpAddr;
use std::time::Duration;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    println!("--- Rustmidea Control Example ---");

    let Some(host) = std::env::args().nth(1).and_then(|a| a.parse::<IpAddr>().ok()) else {
        println!("Usage: control <device ip>");
        return;
    };

    // 1. Locate the device
    let descriptor = match Discover::default()
        .discover_single(host, Duration::from_secs(3))
        .await
    {
        Ok(descriptor) => descriptor,
        Err(e) => {
            println!("[ERROR] Discovery of {} failed: {}", host, e);
            return;
        }
    };
    println!("[INFO] Found device {} ({:?})", descriptor.id(), descriptor.version());

    let mut device = match Device::new(descriptor, SessionConfig::default()) {
        Ok(device) => device,
        Err(e) => {
            println!("[ERROR] {}", e);
            return;
        }
    };

    // 2. Capabilities
    match device.get_capabilities().await {
        Ok(caps) => {
            println!("Step 1: {} capabilities", caps.len());
            println!("  Modes: {:?}", caps.operational_modes());
            println!(
                "  Temperature: {} - {}",
                caps.min_temperature(),
                caps.max_temperature()
            );
        }
        Err(e) => println!("Step 1 Error: {}", e),
    }

    // 3. Current state
    match device.refresh().await {
        Ok(state) => println!("Step 2: {:?}", state),
        Err(e) => println!("Step 2 Error: {}", e),
    }

    // 4. Switch on
    let desired = DesiredState::from(device.state())
        .with_power(true)
        .with_mode(OperationalMode::Cool)
        .with_target_temperature(24.0)
        .with_beep(true);
    match device.apply(&desired).await {
        Ok(state) => println!(
            "Step 3: power={} mode={:?} target={}",
            state.power_on, state.operational_mode, state.target_temperature
        ),
        Err(e) => println!("Step 3 Error: {}", e),
    }

    device.disconnect().await;
    println!("Done!");
}
