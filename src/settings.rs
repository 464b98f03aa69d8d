//! Per-device configuration consumed read-only by every component.
//!
//! Use the [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
//! pattern to set the configurable values in code, or load a TOML device file
//! with [`DeviceConfig::load`]. Missing keys in the file take the same default
//! values as the builder.

use std::{collections::BTreeMap, fmt, fs, path::Path, path::PathBuf, str::FromStr, time::Duration};

use serde::Deserialize;
pub use serialport::{DataBits, FlowControl, Parity, StopBits};

use crate::error::{Error, Result};

// =============================================================================
// Public Interface
// =============================================================================

/// The supported SoC families. `Mstar938` is an MStar board with a few extra
/// steps (`ufts` settings, a different mboot script).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Mstar,
    Mstar938,
    Hisi,
}
impl Family {
    pub fn name(self) -> &'static str {
        match self {
            Family::Mstar => "mstar",
            Family::Mstar938 => "mstar-938",
            Family::Hisi => "hisi",
        }
    }

    pub fn is_mstar(self) -> bool {
        matches!(self, Family::Mstar | Family::Mstar938)
    }
}
impl FromStr for Family {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mstar" => Ok(Family::Mstar),
            "mstar-938" => Ok(Family::Mstar938),
            "hisi" => Ok(Family::Hisi),
            other => Err(Error::UnsupportedConfiguration(format!(
                "unknown device type `{}`",
                other
            ))),
        }
    }
}
impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How the console of the device is reached.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Connection {
    /// A local serial line.
    Serial(SerialLine),
    /// A TCP console server such as `ser2net`.
    Telnet { host: String, port: u16 },
}

/// Serial line parameters, kept as plain values so they can live in the
/// device file. Use the accessors to get the `serialport` types.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SerialLine {
    /// The port name, usually the device path.
    pub path: String,
    /// The baud rate in symbols-per-second.
    pub baud_rate: u32,
    /// Number of bits used to represent a character sent on the line.
    pub data_bits: u8,
    /// `none`, `odd` or `even`.
    pub parity: String,
    /// Number of bits to use to signal the end of a character.
    pub stop_bits: u8,
    /// `none`, `soft` or `hard`.
    pub flow_control: String,
}
impl SerialLine {
    pub fn new(path: &str) -> Self {
        SerialLine {
            path: path.to_owned(),
            ..SerialLine::default()
        }
    }

    pub fn data_bits(&self) -> Result<DataBits> {
        match self.data_bits {
            5 => Ok(DataBits::Five),
            6 => Ok(DataBits::Six),
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            other => Err(unsupported_line("data bits", &other.to_string())),
        }
    }

    pub fn parity(&self) -> Result<Parity> {
        match self.parity.as_str() {
            "none" => Ok(Parity::None),
            "odd" => Ok(Parity::Odd),
            "even" => Ok(Parity::Even),
            other => Err(unsupported_line("parity", other)),
        }
    }

    pub fn stop_bits(&self) -> Result<StopBits> {
        match self.stop_bits {
            1 => Ok(StopBits::One),
            2 => Ok(StopBits::Two),
            other => Err(unsupported_line("stop bits", &other.to_string())),
        }
    }

    pub fn flow_control(&self) -> Result<FlowControl> {
        match self.flow_control.as_str() {
            "none" => Ok(FlowControl::None),
            "soft" => Ok(FlowControl::Software),
            "hard" => Ok(FlowControl::Hardware),
            other => Err(unsupported_line("flow control", other)),
        }
    }
}
impl Default for SerialLine {
    fn default() -> Self {
        SerialLine {
            path: "/dev/ttyUSB0".into(),
            baud_rate: 115_200,
            data_bits: 8,
            parity: "none".into(),
            stop_bits: 1,
            flow_control: "none".into(),
        }
    }
}

/// Where the factory image tool lives and where its output is published for
/// TFTP.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FactorySettings {
    pub tool_dir: PathBuf,
    pub tftp_root: PathBuf,
}

/// Groups all the settings of one device and acts as the product of the
/// [`SettingsBuilder`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub hostname: String,
    /// Family tag, one of `mstar`, `mstar-938` or `hisi`. Validated by
    /// [`DeviceConfig::family`].
    pub device_type: String,
    pub connection: Connection,
    /// Line sent to the console server before the session is released.
    pub connection_command_terminate: Option<String>,

    pub bootloader_prompt: String,
    pub interrupt_boot_prompt: String,
    pub image_boot_msg: String,
    pub kernel_boot_msg: String,
    pub has_kernel_messages: bool,
    pub shell_prompt: String,
    pub recovery_prompt: String,

    #[serde(deserialize_with = "seconds")]
    pub bootloader_timeout: Duration,
    #[serde(deserialize_with = "seconds")]
    pub image_boot_msg_timeout: Duration,
    #[serde(deserialize_with = "seconds")]
    pub kernel_boot_msg_timeout: Duration,
    #[serde(deserialize_with = "seconds")]
    pub boot_cmd_timeout: Duration,
    #[serde(deserialize_with = "seconds")]
    pub shell_timeout: Duration,
    #[serde(deserialize_with = "seconds")]
    pub reset_banner_timeout: Duration,

    pub soft_boot_cmd: String,
    /// When set, resets go through the power switch instead of the reboot
    /// command.
    pub hard_reset_command: Option<String>,
    pub power_off_cmd: Option<String>,
    pub power_on_cmd: Option<String>,
    #[serde(deserialize_with = "seconds")]
    pub power_cycle_delay: Duration,
    pub pre_boot_cmd: Option<String>,

    pub send_char: bool,
    #[serde(rename = "bootloader_serial_delay_ms", deserialize_with = "millis")]
    pub bootloader_serial_delay: Duration,

    pub macaddr: Option<String>,
    pub sn: Option<String>,

    /// Address of this dispatcher as seen from the device.
    pub server_ip: String,
    pub su_server_ip: String,
    pub resource_url: String,
    pub busybox_http_port: u16,

    pub u_load_addrs: Vec<String>,
    pub z_load_addrs: Vec<String>,

    pub default_boot_cmds: String,
    /// Named boot command sequences, each a newline-delimited list.
    pub boot_cmds: BTreeMap<String, String>,

    pub factory: Option<FactorySettings>,

    /// Restrict creation of `DeviceConfig` instances unless through the
    /// `SettingsBuilder` or the loader.
    #[doc(hidden)]
    #[serde(skip)]
    _private_use_builder: (),
}
impl DeviceConfig {
    /// Parse a device file and validate its family tag.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: DeviceConfig = toml::from_str(text)?;
        config.family()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn family(&self) -> Result<Family> {
        self.device_type.parse()
    }

    /// Delay between characters when sending boot commands.
    pub fn char_delay(&self) -> Duration {
        if self.send_char {
            self.bootloader_serial_delay
        } else {
            Duration::ZERO
        }
    }

    pub fn hard_reset_available(&self) -> bool {
        self.hard_reset_command
            .as_deref()
            .map_or(false, |cmd| !cmd.trim().is_empty())
    }
}
impl Default for DeviceConfig {
    fn default() -> Self {
        SettingsBuilder::new().finalize()
    }
}

/// The builder for [`DeviceConfig`] values.
///
/// All values are optional and have default values that will be used if not
/// explicitly set.
///
/// **Example**
///
/// ```ignore
/// let config = SettingsBuilder::new()
///     .device_type("hisi")
///     .bootloader_prompt("apollo#")
///     .finalize();
/// ```
pub struct SettingsBuilder {
    config: DeviceConfig,
}
impl SettingsBuilder {
    pub fn new() -> Self {
        SettingsBuilder {
            config: DeviceConfig {
                hostname: "device".into(),
                device_type: "mstar".into(),
                connection: Connection::Telnet {
                    host: "localhost".into(),
                    port: 2000,
                },
                connection_command_terminate: None,
                bootloader_prompt: "<< MStar >>#".into(),
                interrupt_boot_prompt: "Hit any key to stop autoboot".into(),
                image_boot_msg: "Starting kernel".into(),
                kernel_boot_msg: "Freeing unused kernel memory".into(),
                has_kernel_messages: true,
                shell_prompt: "shell@|root@".into(),
                recovery_prompt: "/ #".into(),
                bootloader_timeout: Duration::from_secs(120),
                image_boot_msg_timeout: Duration::from_secs(3600),
                kernel_boot_msg_timeout: Duration::from_secs(240),
                boot_cmd_timeout: Duration::from_secs(60),
                shell_timeout: Duration::from_secs(30),
                reset_banner_timeout: Duration::from_secs(20),
                soft_boot_cmd: "reboot".into(),
                hard_reset_command: None,
                power_off_cmd: None,
                power_on_cmd: None,
                power_cycle_delay: Duration::from_secs(20),
                pre_boot_cmd: None,
                send_char: false,
                bootloader_serial_delay: Duration::ZERO,
                macaddr: None,
                sn: None,
                server_ip: "127.0.0.1".into(),
                su_server_ip: "172.16.10.41".into(),
                resource_url: "http://172.16.117.1:8000/resource".into(),
                busybox_http_port: 80,
                u_load_addrs: Vec::new(),
                z_load_addrs: Vec::new(),
                default_boot_cmds: "boot_cmds".into(),
                boot_cmds: BTreeMap::new(),
                factory: None,
                _private_use_builder: (),
            },
        }
    }

    pub fn hostname(mut self, hostname: &str) -> Self {
        self.config.hostname = hostname.into();
        self
    }

    /// Set the family tag; validated when the device is set up.
    pub fn device_type(mut self, device_type: &str) -> Self {
        self.config.device_type = device_type.into();
        self
    }

    pub fn bootloader_prompt(mut self, pattern: &str) -> Self {
        self.config.bootloader_prompt = pattern.into();
        self
    }

    pub fn interrupt_boot_prompt(mut self, pattern: &str) -> Self {
        self.config.interrupt_boot_prompt = pattern.into();
        self
    }

    pub fn image_boot_msg(mut self, pattern: &str) -> Self {
        self.config.image_boot_msg = pattern.into();
        self
    }

    pub fn kernel_boot_msg(mut self, pattern: &str) -> Self {
        self.config.kernel_boot_msg = pattern.into();
        self
    }

    pub fn has_kernel_messages(mut self, enabled: bool) -> Self {
        self.config.has_kernel_messages = enabled;
        self
    }

    pub fn shell_prompt(mut self, pattern: &str) -> Self {
        self.config.shell_prompt = pattern.into();
        self
    }

    pub fn bootloader_timeout(mut self, timeout: Duration) -> Self {
        self.config.bootloader_timeout = timeout;
        self
    }

    pub fn boot_cmd_timeout(mut self, timeout: Duration) -> Self {
        self.config.boot_cmd_timeout = timeout;
        self
    }

    pub fn soft_boot_cmd(mut self, command: &str) -> Self {
        self.config.soft_boot_cmd = command.into();
        self
    }

    /// Enable hard resets through the given power switch commands.
    pub fn hard_reset(mut self, command: &str, power_off: &str, power_on: &str) -> Self {
        self.config.hard_reset_command = Some(command.into());
        self.config.power_off_cmd = Some(power_off.into());
        self.config.power_on_cmd = Some(power_on.into());
        self
    }

    pub fn pre_boot_cmd(mut self, command: &str) -> Self {
        self.config.pre_boot_cmd = Some(command.into());
        self
    }

    /// Send characters one by one with the given delay between them.
    pub fn send_char(mut self, delay: Duration) -> Self {
        self.config.send_char = true;
        self.config.bootloader_serial_delay = delay;
        self
    }

    pub fn macaddr(mut self, mac: &str) -> Self {
        self.config.macaddr = Some(mac.into());
        self
    }

    pub fn sn(mut self, sn: &str) -> Self {
        self.config.sn = Some(sn.into());
        self
    }

    pub fn server_ip(mut self, ip: &str) -> Self {
        self.config.server_ip = ip.into();
        self
    }

    pub fn load_addresses(mut self, uimage: &[&str], zimage: &[&str]) -> Self {
        self.config.u_load_addrs = uimage.iter().map(|a| a.to_string()).collect();
        self.config.z_load_addrs = zimage.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn default_boot_cmds(mut self, name: &str) -> Self {
        self.config.default_boot_cmds = name.into();
        self
    }

    /// Register a named boot command sequence (newline-delimited).
    pub fn boot_cmds(mut self, name: &str, sequence: &str) -> Self {
        self.config.boot_cmds.insert(name.into(), sequence.into());
        self
    }

    pub fn factory(mut self, tool_dir: impl Into<PathBuf>, tftp_root: impl Into<PathBuf>) -> Self {
        self.config.factory = Some(FactorySettings {
            tool_dir: tool_dir.into(),
            tftp_root: tftp_root.into(),
        });
        self
    }

    pub fn finalize(self) -> DeviceConfig {
        self.config
    }
}
impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Private stuff
// =============================================================================

fn unsupported_line(what: &str, value: &str) -> Error {
    Error::UnsupportedConfiguration(format!("invalid serial {}: `{}`", what, value))
}

fn seconds<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    if secs < 0.0 || !secs.is_finite() {
        return Err(serde::de::Error::custom("timeouts must be positive seconds"));
    }
    Ok(Duration::from_secs_f64(secs))
}

fn millis<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let ms = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(ms))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn all_default() {
    let config = SettingsBuilder::new().finalize();
    assert_eq!(config.family().unwrap(), Family::Mstar);
    assert_eq!(config.bootloader_timeout, Duration::from_secs(120));
    assert_eq!(config.default_boot_cmds, "boot_cmds");
    assert!(!config.hard_reset_available());
    assert_eq!(config.char_delay(), Duration::ZERO);
    assert_eq!(config, DeviceConfig::default());
}

#[test]
fn device_type() {
    let config = SettingsBuilder::new().device_type("hisi").finalize();
    assert_eq!(config.family().unwrap(), Family::Hisi);
    let config = SettingsBuilder::new().device_type("mstar-938").finalize();
    assert!(config.family().unwrap().is_mstar());
}

#[test]
fn unknown_family_is_rejected() {
    let config = SettingsBuilder::new().device_type("amlogic").finalize();
    assert!(matches!(
        config.family(),
        Err(Error::UnsupportedConfiguration(_))
    ));
}

#[test]
fn hard_reset() {
    let config = SettingsBuilder::new()
        .hard_reset("pdu 3", "pdu off 3", "pdu on 3")
        .finalize();
    assert!(config.hard_reset_available());
    assert_eq!(config.power_on_cmd.as_deref(), Some("pdu on 3"));

    let mut config = config;
    config.hard_reset_command = Some("  ".into());
    assert!(!config.hard_reset_available());
}

#[test]
fn send_char() {
    let config = SettingsBuilder::new()
        .send_char(Duration::from_millis(30))
        .finalize();
    assert_eq!(config.char_delay(), Duration::from_millis(30));
}

#[test]
fn serial_line() {
    let line = SerialLine::new("/dev/ttyUSB3");
    assert_eq!(line.data_bits().unwrap(), DataBits::Eight);
    assert_eq!(line.parity().unwrap(), Parity::None);
    assert_eq!(line.stop_bits().unwrap(), StopBits::One);
    assert_eq!(line.flow_control().unwrap(), FlowControl::None);

    let bad = SerialLine {
        parity: "mark".into(),
        ..line
    };
    assert!(bad.parity().is_err());
}

#[test]
fn load_from_toml() {
    let text = r#"
        hostname = "hisi01"
        device_type = "hisi"
        bootloader_prompt = "apollo#"
        bootloader_timeout = 90
        bootloader_serial_delay_ms = 20
        send_char = true
        macaddr = "00:11:22:33:44:55"

        [connection]
        kind = "serial"
        path = "/dev/ttyUSB1"
        baud_rate = 115200

        [boot_cmds]
        boot_cmds = """
setenv serverip {IMAGE_SERVER_IP}
exec {IMAGE}
"""
    "#;
    let config = DeviceConfig::from_toml_str(text).unwrap();
    assert_eq!(config.hostname, "hisi01");
    assert_eq!(config.family().unwrap(), Family::Hisi);
    assert_eq!(config.bootloader_timeout, Duration::from_secs(90));
    assert_eq!(config.char_delay(), Duration::from_millis(20));
    assert_eq!(config.kernel_boot_msg_timeout, Duration::from_secs(240));
    match &config.connection {
        Connection::Serial(line) => {
            assert_eq!(line.path, "/dev/ttyUSB1");
            assert_eq!(line.data_bits, 8);
        }
        other => panic!("unexpected connection {:?}", other),
    }
    assert!(config.boot_cmds["boot_cmds"].contains("exec {IMAGE}"));
}

#[test]
fn load_rejects_unknown_family() {
    let err = DeviceConfig::from_toml_str("device_type = \"rockchip\"").unwrap_err();
    assert!(matches!(err, Error::UnsupportedConfiguration(_)));
}

#[test]
fn load_rejects_bad_toml() {
    let err = DeviceConfig::from_toml_str("bootloader_timeout = \"soon\"").unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}
