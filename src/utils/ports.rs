//! Serial port device manipulation.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use serialport::{available_ports, SerialPort, SerialPortType};

use std::{
    path::Path,
    thread,
    time::{Duration, Instant},
};

use crate::{
    error::{Error, Result},
    settings::SerialLine,
};

//==============================================================================
// Public Interface
//==============================================================================

/// Check for a device with the given path in the system. If not immediately
/// found, enter into a waiting loop, checking every period of time whether the
/// device has been created or not, until `timeout` has elapsed.
///
/// Returns `true` when the device is present.
pub(crate) fn wait_for_port(path: &str, timeout: Duration) -> bool {
    if port_present(path) {
        return true;
    }

    let pb = ProgressBar::new_spinner();
    pb.enable_steady_tick(120);
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_strings(&["⠋", "⠙", "⠚", "⠞", "⠖", "⠦", "⠴", "⠲", "⠳", "⠓"])
            .template("[BL] {spinner:.blue} {msg}"),
    );

    let waiting_period = Duration::from_secs(2);
    let started = Instant::now();
    loop {
        if port_present(path) {
            pb.finish_with_message(format!("Serial port {} is ready", style(path).green()));
            return true;
        }
        let waited = started.elapsed();
        if waited >= timeout {
            pb.finish_with_message(format!(
                "Gave up waiting on port {} after {} seconds",
                style(path).cyan(),
                style(waited.as_secs()).dim()
            ));
            return false;
        }
        pb.set_message(format!(
            "[{:03}s {}] Waiting for {} to be ready...",
            style(waited.as_secs()).dim(),
            enumerate_serial_ports().len(),
            style(path).cyan()
        ));
        thread::sleep(waiting_period);
    }
}

pub(crate) fn open_and_setup_port(line: &SerialLine) -> Result<Box<dyn SerialPort>> {
    use retry::{delay, retry_with_index};

    let data_bits = line.data_bits()?;
    let stop_bits = line.stop_bits()?;
    let parity = line.parity()?;
    let flow_control = line.flow_control()?;

    let result = retry_with_index(
        delay::Fixed::from_millis(1000).take(4),
        |index| -> std::result::Result<Box<dyn SerialPort>, serialport::Error> {
            debug!("Trying to open {} ({})", line.path, index);
            serialport::new(&line.path, line.baud_rate)
                .data_bits(data_bits)
                .stop_bits(stop_bits)
                .parity(parity)
                .flow_control(flow_control)
                .open()
        },
    );
    match result {
        Ok(mut port) => {
            // Some drivers only apply the line settings after open.
            port.set_baud_rate(line.baud_rate)?;
            port.set_data_bits(data_bits)?;
            port.set_stop_bits(stop_bits)?;
            port.set_parity(parity)?;
            port.set_flow_control(flow_control)?;

            let actual = port.baud_rate()?;
            info!("Connected to {} at {} baud", line.path, actual);
            debug!("data_bits    : {:#?}", port.data_bits()?);
            debug!("stop_bits    : {:#?}", port.stop_bits()?);
            debug!("parity       : {:#?}", port.parity()?);
            debug!("flow control : {:#?}", port.flow_control()?);

            if actual != line.baud_rate {
                return Err(Error::UnsupportedConfiguration(format!(
                    "{} refused baud rate {} (got {})",
                    line.path, line.baud_rate, actual
                )));
            }
            Ok(port)
        }
        Err(retry::Error::Operation {
            error,
            total_delay,
            tries,
        }) => {
            warn!(
                "Failed to open {} after {:?} and {} tries: {}",
                line.path, total_delay, tries, error,
            );
            Err(error.into())
        }
        Err(retry::Error::Internal(message)) => Err(Error::Critical(format!(
            "internal error while retrying to open {}: {}",
            line.path, message
        ))),
    }
}

//==============================================================================
// Private stuff
//==============================================================================

fn port_present(path: &str) -> bool {
    Path::new(path).exists()
        || enumerate_serial_ports()
            .iter()
            .any(|detected| detected.starts_with(path))
}

/// Enumerates serial devices on the system
fn enumerate_serial_ports() -> Vec<String> {
    match available_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|p| match p.port_type {
                // USB ports give us more info about the connected serial
                // controller
                SerialPortType::UsbPort(info) => format!(
                    "{}: ({} / {})",
                    p.port_name,
                    info.manufacturer.as_deref().unwrap_or(""),
                    info.product.as_deref().unwrap_or("")
                ),
                _ => p.port_name,
            })
            .collect(),
        Err(e) => {
            info!("error: {}", e);
            vec![]
        }
    }
}

#[test]
fn missing_port_is_not_present() {
    assert!(!port_present("/dev/does-not-exist-bootlab"));
    assert!(!wait_for_port("/dev/does-not-exist-bootlab", Duration::ZERO));
}
