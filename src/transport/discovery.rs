use std::fmt;
use std::io::Read;
use std::time::Duration;

use serde::{Serialize, Deserialize};
use serialport::{SerialPortInfo, SerialPortType};
use tracing::{debug, info, warn};

/// Baud rates accepted by `validate_port_config`
pub const SUPPORTED_BAUD_RATES: [u32; 8] = [9600, 19200, 38400, 57600, 115_200, 230_400, 460_800, 921_600];

/// USB vendor ids of flight-controller boards
const FLIGHT_CONTROLLER_VIDS: [(u16, &str); 4] = [
    (0x26AC, "PX4"),
    (0x1209, "ArduPilot"),
    (0x2DAE, "CubePilot"),
    (0x3162, "Holybro"),
];

/// STM32 virtual COM port, used by many bootloader-less boards
const STM32_VCP: (u16, u16) = (0x0483, 0x5740);

/// Generic USB-serial bridges (FTDI, CP210x, CH340, Prolific)
const USB_SERIAL_BRIDGE_VIDS: [u16; 4] = [0x0403, 0x10C4, 0x1A86, 0x067B];

const FLIGHT_CONTROLLER_KEYWORDS: [&str; 8] = [
    "px4", "pixhawk", "mavlink", "autopilot", "flight controller", "ardupilot", "cube", "fmu",
];

/// Confidence levels, highest first
const CONFIDENCE_VID: f32 = 1.0;
const CONFIDENCE_KEYWORD: f32 = 0.9;
const CONFIDENCE_STM32: f32 = 0.7;
const CONFIDENCE_BRIDGE: f32 = 0.5;
const CONFIDENCE_USB: f32 = 0.3;
const CONFIDENCE_OTHER: f32 = 0.1;

/// A serial device that might be a flight controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortCandidate {
    /// OS device path or name
    pub device_id: String,
    /// Human-readable description
    pub description: String,
    /// 0.0 - 1.0, higher is more likely a flight controller
    pub confidence: f32,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl fmt::Display for PortCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {} (confidence {:.1})", self.device_id, self.description, self.confidence)?;
        if let (Some(vid), Some(pid)) = (self.vid, self.pid) {
            write!(f, " [{:04x}:{:04x}]", vid, pid)?;
        }
        Ok(())
    }
}

/// Outcome of `validate_port_config`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortValidation {
    pub valid: bool,
    pub port_exists: bool,
    pub baud_rate_valid: bool,
    pub port_accessible: bool,
    /// Why the config is invalid
    pub reason: Option<String>,
}

/// Lists serial devices ordered by flight-controller confidence
pub fn detect_ports() -> Vec<PortCandidate> {
    match serialport::available_ports() {
        Ok(ports) => {
            let candidates = rank_ports(ports.iter().map(describe_port).collect());
            for candidate in &candidates {
                debug!(port = %candidate.device_id, confidence = candidate.confidence, "Found serial port");
            }
            candidates
        }
        Err(e) => {
            warn!(error = %e, "Failed to enumerate serial ports");
            Vec::new()
        }
    }
}

/// Best flight-controller candidate, if any port exists
pub fn find_best_port() -> Option<String> {
    let best = detect_ports().into_iter().next()?;
    if best.confidence < CONFIDENCE_BRIDGE {
        warn!(port = %best.device_id, "No flight controller signature found, using first port");
    } else {
        info!(port = %best.device_id, description = %best.description, "Selected flight controller port");
    }
    Some(best.device_id)
}

/// Best-effort open and read of a port. Does not touch the in-process port
/// registry, so it may be used while discovering.
pub fn test_port(port: &str, baud_rate: u32, timeout: Duration) -> bool {
    match serialport::new(port, baud_rate).timeout(timeout).open() {
        Ok(mut handle) => {
            let queued = handle.bytes_to_read().unwrap_or(0);
            if queued > 0 {
                let mut buffer = vec![0u8; queued as usize];
                let _ = handle.read(&mut buffer);
            }
            debug!(port = %port, queued, "Port is accessible");
            true
        }
        Err(e) => {
            debug!(port = %port, error = %e, "Port is not accessible");
            false
        }
    }
}

/// Checks that a port exists, the baud rate is supported, and the port opens
pub fn validate_port_config(port: &str, baud_rate: u32) -> PortValidation {
    let known: Vec<String> = detect_ports().into_iter().map(|c| c.device_id).collect();
    validate_against(&known, port, baud_rate, |p, b| test_port(p, b, Duration::from_secs(1)))
}

fn validate_against<F>(known: &[String], port: &str, baud_rate: u32, probe: F) -> PortValidation
where
    F: FnOnce(&str, u32) -> bool,
{
    let mut result = PortValidation {
        valid: false,
        port_exists: known.iter().any(|p| p == port),
        baud_rate_valid: false,
        port_accessible: false,
        reason: None,
    };

    if !result.port_exists {
        result.reason = Some(format!("port {} not found in available ports", port));
        return result;
    }

    result.baud_rate_valid = SUPPORTED_BAUD_RATES.contains(&baud_rate);
    if !result.baud_rate_valid {
        result.reason = Some(format!("baud rate {} not in supported list", baud_rate));
        return result;
    }

    result.port_accessible = probe(port, baud_rate);
    if !result.port_accessible {
        result.reason = Some(format!("port {} is not accessible", port));
        return result;
    }

    result.valid = true;
    result
}

fn describe_port(info: &SerialPortInfo) -> PortCandidate {
    let mut candidate = PortCandidate {
        device_id: info.port_name.clone(),
        description: String::new(),
        confidence: 0.0,
        vid: None,
        pid: None,
        manufacturer: None,
        product: None,
    };

    candidate.description = match &info.port_type {
        SerialPortType::UsbPort(usb) => {
            candidate.vid = Some(usb.vid);
            candidate.pid = Some(usb.pid);
            candidate.manufacturer = usb.manufacturer.clone();
            candidate.product = usb.product.clone();
            usb.product.clone().unwrap_or_else(|| "USB serial device".to_string())
        }
        SerialPortType::PciPort => "PCI serial port".to_string(),
        SerialPortType::BluetoothPort => "Bluetooth serial port".to_string(),
        SerialPortType::Unknown => "Serial port".to_string(),
    };
    candidate
}

fn score(candidate: &PortCandidate) -> f32 {
    let text = format!(
        "{} {} {}",
        candidate.description,
        candidate.manufacturer.as_deref().unwrap_or(""),
        candidate.product.as_deref().unwrap_or("")
    )
    .to_lowercase();

    match (candidate.vid, candidate.pid) {
        (Some(vid), _) if FLIGHT_CONTROLLER_VIDS.iter().any(|(v, _)| *v == vid) => CONFIDENCE_VID,
        _ if FLIGHT_CONTROLLER_KEYWORDS.iter().any(|k| text.contains(k)) => CONFIDENCE_KEYWORD,
        (Some(vid), Some(pid)) if (vid, pid) == STM32_VCP => CONFIDENCE_STM32,
        (Some(vid), _) if USB_SERIAL_BRIDGE_VIDS.contains(&vid) => CONFIDENCE_BRIDGE,
        (Some(_), _) => CONFIDENCE_USB,
        _ => CONFIDENCE_OTHER,
    }
}

/// Scores candidates and sorts them, most likely first. Ties keep OS order.
fn rank_ports(mut candidates: Vec<PortCandidate>) -> Vec<PortCandidate> {
    for candidate in candidates.iter_mut() {
        candidate.confidence = score(candidate);
    }
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb(device: &str, vid: u16, pid: u16, product: Option<&str>) -> PortCandidate {
        PortCandidate {
            device_id: device.to_string(),
            description: product.unwrap_or("USB serial device").to_string(),
            confidence: 0.0,
            vid: Some(vid),
            pid: Some(pid),
            manufacturer: None,
            product: product.map(str::to_string),
        }
    }

    fn native(device: &str) -> PortCandidate {
        PortCandidate {
            device_id: device.to_string(),
            description: "Serial port".to_string(),
            confidence: 0.0,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
        }
    }

    #[test]
    fn test_ranking_order() {
        let ranked = rank_ports(vec![
            native("/dev/ttyS0"),
            usb("/dev/ttyUSB0", 0x0403, 0x6001, Some("FT232R USB UART")),
            usb("/dev/ttyACM1", 0x0483, 0x5740, None),
            usb("/dev/ttyACM2", 0x1234, 0x0001, Some("Pixhawk4")),
            usb("/dev/ttyACM0", 0x26AC, 0x0032, Some("PX4 FMU v5.x")),
            usb("/dev/ttyACM3", 0x2341, 0x0043, Some("Arduino Uno")),
        ]);

        let order: Vec<&str> = ranked.iter().map(|c| c.device_id.as_str()).collect();
        assert_eq!(
            order,
            ["/dev/ttyACM0", "/dev/ttyACM2", "/dev/ttyACM1", "/dev/ttyUSB0", "/dev/ttyACM3", "/dev/ttyS0"]
        );
        assert_eq!(ranked[0].confidence, CONFIDENCE_VID);
        assert_eq!(ranked[5].confidence, CONFIDENCE_OTHER);
    }

    #[test]
    fn test_keyword_in_manufacturer() {
        let mut candidate = usb("/dev/ttyACM0", 0x1234, 0x0001, None);
        candidate.manufacturer = Some("ArduPilot Project".to_string());
        assert_eq!(score(&candidate), CONFIDENCE_KEYWORD);
    }

    #[test]
    fn test_validation_steps() {
        let known = vec!["/dev/ttyACM0".to_string()];

        let result = validate_against(&known, "/dev/ttyACM1", 115_200, |_, _| true);
        assert!(!result.valid);
        assert!(!result.port_exists);

        let result = validate_against(&known, "/dev/ttyACM0", 12345, |_, _| true);
        assert!(result.port_exists);
        assert!(!result.baud_rate_valid);
        assert!(result.reason.unwrap().contains("12345"));

        let result = validate_against(&known, "/dev/ttyACM0", 57600, |_, _| false);
        assert!(result.baud_rate_valid);
        assert!(!result.port_accessible);
        assert!(!result.valid);

        let result = validate_against(&known, "/dev/ttyACM0", 921_600, |_, _| true);
        assert!(result.valid);
        assert!(result.reason.is_none());
    }

    #[test]
    fn test_display() {
        let candidate = usb("/dev/ttyACM0", 0x26AC, 0x0011, Some("PX4 FMU"));
        assert_eq!(candidate.to_string(), "/dev/ttyACM0 - PX4 FMU (confidence 0.0) [26ac:0011]");
    }
}
