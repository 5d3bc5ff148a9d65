use std::time::Duration;

use mavparam::{detect_ports, ManagerConfig, ParamValue, ParameterManager};
use tracing::Level;

/// Usage: param_dump [--port PORT] [--baud BAUD] [NAME [VALUE]]
///
/// Connects (auto-detecting the port unless one is given), prints the whole
/// parameter table, then reads NAME or writes VALUE to it.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let mut port = None;
    let mut baud = None;
    let mut rest = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--port" => port = args.next(),
            "--baud" => baud = args.next().and_then(|b| b.parse().ok()),
            _ => rest.push(arg),
        }
    }

    println!("Serial ports:");
    for candidate in detect_ports() {
        println!("- {}", candidate);
    }

    let mut config = ManagerConfig::default();
    config.connect_refresh_timeout = Duration::from_secs(20);
    let manager = match ParameterManager::new(config) {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            return;
        }
    };

    manager.add_connection_callback(|event| println!("Link: {:?}", event));

    if !manager.connect(port.as_deref(), baud).await {
        eprintln!("Could not connect to a vehicle");
        return;
    }

    let mut params: Vec<_> = manager.get_all_parameters().into_values().collect();
    params.sort_by_key(|p| p.index);
    println!("\n{} parameters:", params.len());
    for p in &params {
        println!("  {:<16} = {:<12} ({:?})", p.name, p.value.to_string(), p.param_type);
    }

    match rest.as_slice() {
        [name] => {
            let result = manager.get_parameter(name, None).await;
            match result.value {
                Some(value) if result.success => println!("\n{} = {}", name, value),
                _ => eprintln!("\nGet {} failed: {:?} {}", name, result.error, result.message.unwrap_or_default()),
            }
        }
        [name, value] => {
            let value = match parse_value(value) {
                Some(value) => value,
                None => {
                    eprintln!("Not a number: {}", value);
                    manager.disconnect().await;
                    return;
                }
            };
            let result = manager.set_parameter(name, value, true, None).await;
            if result.success {
                println!("\nSet {} = {} in {:?}", name, value, result.elapsed);
            } else {
                eprintln!("\nSet {} failed: {:?} {}", name, result.error, result.message.unwrap_or_default());
            }
        }
        _ => {}
    }

    manager.disconnect().await;
}

fn parse_value(text: &str) -> Option<ParamValue> {
    if text.contains('.') {
        text.parse::<f32>().ok().map(ParamValue::Float)
    } else {
        text.parse::<i64>().ok().map(ParamValue::Int)
    }
}
