//! The deployment target: one lab device seen from a job.
//!
//! A [`Target`] owns everything about the device for the duration of a job:
//! its configuration, the console session, the power switch and the result
//! log. A job deploys an image, boots it, and then works on the booted device
//! through the shell or [`Target::file_system`].
//!
//! **Example** - Provisioning a device from its configuration file:
//! ```ignore
//! let config = DeviceConfig::load("lab/stb-17.toml")?;
//! let mut target = Target::new(config)?;
//! target.deploy_and_boot(
//!     DeployRequest::new("helios/20170301/images/mstar.img", "172.16.117.9"),
//!     BootRequest::default(),
//! )?;
//! ```

mod file_system;

use std::time::Duration;

use log::{debug, info, warn};

use crate::{
    boot_cmds::{self, BootCommandSequence, BootOverrides, BootTagMap, KernelFormat},
    customize::Customizer,
    error::{Error, Result},
    factory::{FactoryImage, FactoryParams, NoFactoryImage, ScriptFactoryImage},
    family::{self, DeploymentTarget},
    power::{self, PowerControl},
    provision::{self, Context, ProvisioningState},
    results::ResultLog,
    session::{ConfigConnector, Connector, Console},
    settings::DeviceConfig,
    transfer::{HttpTransfer, Transfer},
    utils,
};

// =============================================================================
// Public Interface
// =============================================================================

/// What to put on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRequest {
    /// Image path on the image server, relative to its TFTP root.
    pub image: String,
    pub image_server_ip: String,
    /// `u_boot`, `ipxe` or `uefi`.
    pub bootloader_type: String,
    pub kernel_format: KernelFormat,
    pub ramdisk: Option<String>,
    pub dtb: Option<String>,
    pub factory: FactoryParams,
}
impl DeployRequest {
    pub fn new(image: &str, image_server_ip: &str) -> Self {
        DeployRequest {
            image: image.to_owned(),
            image_server_ip: image_server_ip.to_owned(),
            bootloader_type: "u_boot".into(),
            kernel_format: KernelFormat::default(),
            ramdisk: None,
            dtb: None,
            factory: FactoryParams::default(),
        }
    }

    /// Release builds lack su and need it burned separately.
    pub fn is_release(&self) -> bool {
        self.image.contains('R')
    }
}

/// How to boot what was deployed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootRequest {
    /// Take the device as booted without touching it.
    pub skip: bool,
    /// Provision the EMMC and dump it, rather than boot for tests.
    pub emmc: bool,
    /// Named boot command sequence to use instead of the default one.
    pub boot_option: Option<String>,
    pub job_boot_cmds: Option<Vec<String>>,
    pub dynamic_boot_cmds: Option<BootCommandSequence>,
}
impl BootRequest {
    pub(crate) fn overrides(&self) -> BootOverrides {
        BootOverrides {
            job_boot_cmds: self.job_boot_cmds.clone(),
            boot_option: self.boot_option.clone(),
        }
    }
}

pub struct Target {
    config: DeviceConfig,
    family: Box<dyn DeploymentTarget>,
    connector: Box<dyn Connector>,
    console: Option<Box<dyn Console>>,
    power: Box<dyn PowerControl>,
    factory: Box<dyn FactoryImage>,
    transfer: Box<dyn Transfer>,
    results: ResultLog,
    state: ProvisioningState,
    history: Vec<ProvisioningState>,
    deployment: Option<Deployment>,
    last_boot: Option<BootRequest>,
    /// Set when a test shell timed out; the next file system access fails
    /// once so the job resets the platform.
    reset_pending: bool,
}
impl Target {
    /// A target talking to the console, power switch and factory tool named
    /// in `config`. Fails on an unknown device type, or on a hard reset
    /// without its power commands.
    pub fn new(config: DeviceConfig) -> Result<Self> {
        let family = config.family()?;
        info!("{} is a {} device", config.hostname, family.name());
        let factory: Box<dyn FactoryImage> = match &config.factory {
            Some(settings) => Box::new(ScriptFactoryImage::new(settings)),
            None => Box::new(NoFactoryImage),
        };
        Ok(Target {
            family: family::for_family(family),
            connector: Box::new(ConfigConnector::new(&config)),
            console: None,
            power: power::for_config(&config)?,
            factory,
            transfer: Box::new(HttpTransfer::new(&config.server_ip)),
            results: ResultLog::new(),
            state: ProvisioningState::Idle,
            history: Vec::new(),
            deployment: None,
            last_boot: None,
            reset_pending: false,
            config,
        })
    }

    pub fn with_connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Box::new(connector);
        self
    }

    pub fn with_power(mut self, power: impl PowerControl + 'static) -> Self {
        self.power = Box::new(power);
        self
    }

    pub fn with_factory(mut self, factory: impl FactoryImage + 'static) -> Self {
        self.factory = Box::new(factory);
        self
    }

    pub fn with_transfer(mut self, transfer: impl Transfer + 'static) -> Self {
        self.transfer = Box::new(transfer);
        self
    }

    /// Validate the deployment and compute its boot tags. The device is not
    /// touched until [`boot`](Self::boot).
    pub fn deploy(&mut self, request: DeployRequest) -> Result<()> {
        match request.bootloader_type.as_str() {
            "u_boot" => {}
            "ipxe" | "uefi" => {
                return Err(Error::UnsupportedConfiguration(format!(
                    "{} is not supported on {} devices",
                    request.bootloader_type,
                    self.family.family().name()
                )))
            }
            _ => {
                return Err(Error::UnsupportedConfiguration(
                    "Unknown bootloader type".into(),
                ))
            }
        }
        if request.image.is_empty() {
            return Err(Error::Critical("no image to deploy".into()));
        }
        info!("deploying {} to {}", request.image, self.config.hostname);

        let tags = self.boot_tags(&request);
        self.results
            .add_metadata("device.family", self.family.family().name());
        self.results.add_metadata("image", &request.image);
        self.state = ProvisioningState::Idle;
        self.history.clear();
        self.deployment = Some(Deployment { request, tags });
        Ok(())
    }

    /// Attach a fresh console and provision the device, unless it is already
    /// booted.
    pub fn boot(&mut self, request: BootRequest) -> Result<()> {
        self.attach()?;
        self.last_boot = Some(request.clone());
        if self.is_booted() {
            info!("{} is already booted", self.config.hostname);
            return Ok(());
        }

        let deployment = self
            .deployment
            .as_ref()
            .ok_or_else(|| Error::Critical("boot requested before any deploy".into()))?;
        let console = self.console.as_deref_mut().ok_or(Error::NotConnected)?;
        let mut ctx = Context {
            config: &self.config,
            target: &*self.family,
            console,
            power: &mut *self.power,
            factory: &*self.factory,
            results: &mut self.results,
            deploy: &deployment.request,
            boot: &request,
            tags: &deployment.tags,
        };
        let (history, result) = provision::factory().run(&mut ctx);

        self.state = history.last().cloned().unwrap_or(ProvisioningState::Idle);
        info!("{} is {}", self.config.hostname, self.state);
        self.history = history;
        result
    }

    pub fn deploy_and_boot(&mut self, deploy: DeployRequest, boot: BootRequest) -> Result<()> {
        self.deploy(deploy)?;
        self.boot(boot)
    }

    /// Reopen the console if it was released, and get the device shell ready
    /// for tests again.
    pub fn reconnect(&mut self) -> Result<()> {
        if self.console.is_some() {
            return Ok(());
        }
        info!("reconnecting to {}", self.config.hostname);
        self.console = Some(self.connector.connect()?);
        let release = self
            .deployment
            .as_ref()
            .map_or(false, |d| d.request.is_release());
        let mut customizer = self.customizer()?;
        customizer.install_toolkit(release)?;
        customizer.disable_auto_shutdown()
    }

    /// Hand the console back, sending the terminate command first when the
    /// connection needs one.
    pub fn release(&mut self) -> Result<()> {
        if let Some(mut console) = self.console.take() {
            if let Some(command) = &self.config.connection_command_terminate {
                console.send_line(command, self.config.char_delay())?;
            }
            debug!("released {}", console.name());
        }
        Ok(())
    }

    /// Run a host command that needs the console for itself, then take the
    /// console back.
    pub fn run_unattended(&mut self, command: &str) -> Result<String> {
        info!("running `{}` unattended", command);
        self.release()?;
        let output = utils::run_command(command);
        self.reconnect()?;
        output
    }

    /// The ROM version reported by the booted device, `0.0.0` when it does
    /// not report one.
    pub fn device_version(&mut self) -> Result<String> {
        let console = self.console.as_deref_mut().ok_or(Error::NotConnected)?;
        console.send_control('c')?;
        console.send_line("", Duration::ZERO)?;
        console.expect(&["@"], Duration::from_secs(5))?;
        console.reset_buffer();
        console.send_line("getprop ro.build.version.rom", Duration::ZERO)?;
        let version = match console.expect(&["@"], Duration::from_secs(2)) {
            Ok(found) => found
                .before
                .lines()
                .nth(1)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_owned),
            Err(err) if err.is_timeout() => None,
            Err(err) => return Err(err),
        };
        Ok(version.unwrap_or_else(|| {
            warn!("no rom version reported");
            "0.0.0".into()
        }))
    }

    /// Forget the boot so the next file system access boots again. A test
    /// shell timeout also fails that access once.
    pub fn reset_boot(&mut self, in_test_shell: bool) {
        debug!("boot reset, in test shell: {}", in_test_shell);
        self.state = ProvisioningState::Idle;
        self.reset_pending = in_test_shell;
    }

    pub fn is_booted(&self) -> bool {
        self.state == ProvisioningState::Booted
    }

    pub fn state(&self) -> &ProvisioningState {
        &self.state
    }

    /// States visited by the last provisioning run.
    pub fn history(&self) -> &[ProvisioningState] {
        &self.history
    }

    pub fn results(&self) -> &ResultLog {
        &self.results
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// The current deployment and the tags computed for it.
struct Deployment {
    request: DeployRequest,
    tags: BootTagMap,
}

impl Target {
    fn attach(&mut self) -> Result<()> {
        self.release()?;
        self.console = Some(self.connector.connect()?);
        Ok(())
    }

    fn customizer(&mut self) -> Result<Customizer<'_>> {
        let console = self.console.as_deref_mut().ok_or(Error::NotConnected)?;
        Ok(Customizer::new(
            console,
            &self.config,
            self.family.family(),
            &mut self.results,
        ))
    }

    fn boot_tags(&mut self, request: &DeployRequest) -> BootTagMap {
        let mut tags = BootTagMap::new();
        tags.insert("{IMAGE}", &request.image);
        tags.insert("{IMAGE_SERVER_IP}", &request.image_server_ip);
        tags.insert("{SERVER_IP}", &self.config.server_ip);
        tags.extend(boot_cmds::load_address_tags(
            &self.config,
            request.kernel_format,
            &mut self.results,
        ));
        tags.insert(
            "{BOOTX}",
            &boot_cmds::uboot_boot_command(
                request.kernel_format,
                request.ramdisk.is_some(),
                request.dtb.is_some(),
            ),
        );
        if let Some(ramdisk) = &request.ramdisk {
            tags.insert("{RAMDISK}", ramdisk);
        }
        if let Some(dtb) = &request.dtb {
            tags.insert("{DTB}", dtb);
        }
        tags
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        session::{ReplayConnector, ReplayLog, ReplayScript, Sent},
        settings::SettingsBuilder,
    };

    fn replayed(config: DeviceConfig, script: ReplayScript) -> (Target, ReplayLog) {
        let connector = ReplayConnector::new(script).unwrap();
        let log = connector.log();
        let target = Target::new(config).unwrap().with_connector(connector);
        (target, log)
    }

    fn request() -> DeployRequest {
        DeployRequest::new("helios/20170301/images/mstar.img", "172.16.117.9")
    }

    fn skipped() -> BootRequest {
        BootRequest {
            skip: true,
            ..BootRequest::default()
        }
    }

    #[test]
    fn unknown_device_type_is_rejected() {
        let config = SettingsBuilder::new().device_type("rockchip").finalize();
        assert!(matches!(
            Target::new(config),
            Err(Error::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn incomplete_power_switch_is_rejected() {
        let config = SettingsBuilder::new()
            .hard_reset("pdu reset", "", "")
            .finalize();
        assert!(matches!(
            Target::new(config),
            Err(Error::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn deploy_checks_the_bootloader_type() {
        let (mut target, _) = replayed(SettingsBuilder::new().finalize(), ReplayScript::new());

        let mut unknown = request();
        unknown.bootloader_type = "grub".into();
        match target.deploy(unknown) {
            Err(Error::UnsupportedConfiguration(message)) => {
                assert_eq!(message, "Unknown bootloader type")
            }
            other => panic!("unexpected {:?}", other),
        }

        let mut uefi = request();
        uefi.bootloader_type = "uefi".into();
        assert!(matches!(
            target.deploy(uefi),
            Err(Error::UnsupportedConfiguration(_))
        ));

        assert!(target.deploy(DeployRequest::new("", "172.16.117.9")).is_err());
        target.deploy(request()).unwrap();
    }

    #[test]
    fn deploy_computes_boot_tags() {
        let config = SettingsBuilder::new()
            .server_ip("172.16.117.2")
            .load_addresses(&[], &["0x80008000", "0x83000000", "0x82000000"])
            .finalize();
        let (mut target, _) = replayed(config, ReplayScript::new());
        let mut deploy = request();
        deploy.kernel_format = KernelFormat::ZImage;
        deploy.dtb = Some("helios/dtb/mstar.dtb".into());
        target.deploy(deploy).unwrap();

        let tags = &target.deployment.as_ref().unwrap().tags;
        assert_eq!(tags.get("{IMAGE}"), Some("helios/20170301/images/mstar.img"));
        assert_eq!(tags.get("{IMAGE_SERVER_IP}"), Some("172.16.117.9"));
        assert_eq!(tags.get("{SERVER_IP}"), Some("172.16.117.2"));
        assert_eq!(tags.get("{KERNEL_ADDR}"), Some("0x80008000"));
        assert_eq!(tags.get("{BOOTX}"), Some("bootz ${kernel_addr_r} - ${fdt_addr_r}"));
        assert_eq!(tags.get("{DTB}"), Some("helios/dtb/mstar.dtb"));
        assert_eq!(tags.get("{RAMDISK}"), None);
        assert_eq!(
            target.results().metadata().get("device.family").map(String::as_str),
            Some("mstar")
        );
    }

    #[test]
    fn boot_before_deploy_is_an_error() {
        let (mut target, _) = replayed(SettingsBuilder::new().finalize(), ReplayScript::new());
        assert!(matches!(
            target.boot(BootRequest::default()),
            Err(Error::Critical(_))
        ));
    }

    #[test]
    fn booted_stays_booted() {
        let config = SettingsBuilder::new().finalize();
        let (mut target, log) = replayed(config, ReplayScript::new());
        target.deploy_and_boot(request(), skipped()).unwrap();
        assert!(target.is_booted());
        assert_eq!(
            target.history(),
            [ProvisioningState::Idle, ProvisioningState::Booted]
        );

        // A second boot only reattaches the console.
        target.boot(BootRequest::default()).unwrap();
        assert!(target.is_booted());
        assert_eq!(log.entries(), vec![Sent::Connect, Sent::Connect]);

        target.deploy(request()).unwrap();
        assert_eq!(target.state(), &ProvisioningState::Idle);
    }

    #[test]
    fn released_console_gets_the_terminate_command() {
        let mut config = SettingsBuilder::new().finalize();
        config.connection_command_terminate = Some("~.".into());
        let (mut target, log) = replayed(config, ReplayScript::new());
        target.deploy_and_boot(request(), skipped()).unwrap();
        target.boot(skipped()).unwrap();
        assert_eq!(
            log.entries(),
            vec![Sent::Connect, Sent::Line("~.".into()), Sent::Connect]
        );
        target.release().unwrap();
        target.release().unwrap();
        assert_eq!(log.lines(), vec!["~.", "~."]);
    }

    #[test]
    fn reconnect_prepares_the_shell() {
        let (mut target, log) = replayed(SettingsBuilder::new().finalize(), ReplayScript::new());
        target.reconnect().unwrap();
        let lines = log.lines();
        assert_eq!(lines.first().map(String::as_str), Some("su"));
        assert!(lines.contains(&"busybox --install .".to_owned()));

        // Already connected: nothing more is sent.
        let sent = log.len();
        target.reconnect().unwrap();
        assert_eq!(log.len(), sent);
    }

    #[test]
    fn unattended_commands_release_the_console() {
        let (mut target, log) = replayed(SettingsBuilder::new().finalize(), ReplayScript::new());
        target.deploy_and_boot(request(), skipped()).unwrap();
        let output = target.run_unattended("echo flashed").unwrap();
        assert_eq!(output.trim(), "flashed");
        let connects = log.entries().iter().filter(|e| **e == Sent::Connect).count();
        assert_eq!(connects, 2);
    }

    #[test]
    fn device_version_reads_the_rom_property() {
        let script = ReplayScript::new()
            .on("^$", "shell@helios:/ $ ")
            .on(
                "^getprop ",
                "getprop ro.build.version.rom\r\nV2.1.0\r\nshell@helios:/ $ ",
            );
        let (mut target, _) = replayed(SettingsBuilder::new().finalize(), script);
        target.deploy_and_boot(request(), skipped()).unwrap();
        assert_eq!(target.device_version().unwrap(), "V2.1.0");

        let script = ReplayScript::new().on("^$", "shell@helios:/ $ ");
        let (mut target, _) = replayed(SettingsBuilder::new().finalize(), script);
        target.deploy_and_boot(request(), skipped()).unwrap();
        assert_eq!(target.device_version().unwrap(), "0.0.0");
    }
}
