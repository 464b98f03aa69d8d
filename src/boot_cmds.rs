//! Boot command sequences: where they come from, how placeholders get filled
//! in, and how each line is interpreted.
//!
//! A sequence is picked from one of four sources, first match wins:
//!
//! 1. the list supplied by the job,
//! 2. a named sequence selected through the boot option,
//! 3. a sequence computed for this deployment,
//! 4. the device's default sequence.
//!
//! The `boot_cmds_master` default disables the first two. Every line of the
//! winning sequence then gets each `{TAG}` replaced by its value.

use std::{collections::BTreeMap, fmt, str::FromStr};

use log::{debug, warn};

use crate::{
    error::{Error, Result},
    results::ResultLog,
    settings::DeviceConfig,
};

// =============================================================================
// Public Interface
// =============================================================================

/// Default sequence name that ignores job and boot option overrides.
pub const MASTER_BOOT_CMDS: &str = "boot_cmds_master";

/// Placeholder to value substitutions for one deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootTagMap(BTreeMap<String, String>);
impl BootTagMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tag: &str, value: &str) {
        self.0.insert(tag.to_owned(), value.to_owned());
    }

    pub fn get(&self, tag: &str) -> Option<&str> {
        self.0.get(tag).map(String::as_str)
    }

    pub fn extend(&mut self, other: BootTagMap) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Replace every occurrence of every tag. Unknown placeholders stay.
    pub fn apply(&self, text: &str) -> String {
        self.0
            .iter()
            .fold(text.to_owned(), |acc, (tag, value)| acc.replace(tag, value))
    }
}

/// One interpreted line of a boot command sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive<'a> {
    /// Send the text followed by an empty line.
    SendLine(&'a str),
    /// Send the named control character.
    SendControl(&'a str),
    /// Wait for the literal text.
    Expect(&'a str),
    /// Wait for the bootloader prompt, then send the line.
    Plain(&'a str),
}
impl<'a> Directive<'a> {
    pub fn parse(line: &'a str) -> Directive<'a> {
        if let Some(rest) = line.strip_prefix("sendline") {
            Directive::SendLine(rest.trim_start())
        } else if let Some(rest) = line.strip_prefix("sendcontrol") {
            Directive::SendControl(rest.trim_start())
        } else if let Some(rest) = line.strip_prefix("expect") {
            Directive::Expect(rest.trim_start())
        } else {
            Directive::Plain(line)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootCommandSequence {
    lines: Vec<String>,
}
impl BootCommandSequence {
    /// Split newline-delimited configuration text into lines.
    pub fn parse(text: &str) -> Self {
        Self::from_lines(text.lines())
    }

    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        BootCommandSequence {
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }

    /// Drop empty lines at the end of the sequence. Lines holding only
    /// whitespace are kept, they still press enter at the prompt.
    pub fn strip_trailing_empty(mut self) -> Self {
        while self.lines.last().map_or(false, |l| l.is_empty()) {
            self.lines.pop();
        }
        self
    }

    pub fn substitute(&self, tags: &BootTagMap) -> Self {
        BootCommandSequence {
            lines: self.lines.iter().map(|l| tags.apply(l)).collect(),
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn directives(&self) -> impl Iterator<Item = Directive<'_>> {
        self.lines.iter().map(|l| Directive::parse(l))
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Which source a resolved sequence came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootCommandSource {
    JobFile,
    BootOptions,
    Dynamic,
    DeviceConfig,
}
impl fmt::Display for BootCommandSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BootCommandSource::JobFile => "job file",
            BootCommandSource::BootOptions => "boot options",
            BootCommandSource::Dynamic => "dynamic",
            BootCommandSource::DeviceConfig => "device config",
        })
    }
}

/// Job level overrides of the boot commands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootOverrides {
    pub job_boot_cmds: Option<Vec<String>>,
    pub boot_option: Option<String>,
}

/// Pick the boot command sequence for this boot and fill in its tags.
pub fn resolve(
    default_name: &str,
    config: &DeviceConfig,
    overrides: &BootOverrides,
    dynamic: Option<&BootCommandSequence>,
    tags: &BootTagMap,
) -> Result<(BootCommandSequence, BootCommandSource)> {
    let master = default_name == MASTER_BOOT_CMDS;
    let (sequence, source) = match (&overrides.job_boot_cmds, &overrides.boot_option) {
        (Some(lines), _) if !master => (
            BootCommandSequence::from_lines(lines.iter().cloned()),
            BootCommandSource::JobFile,
        ),
        (_, Some(option)) if !master => (named(config, option)?, BootCommandSource::BootOptions),
        _ => match dynamic {
            Some(sequence) => (sequence.clone(), BootCommandSource::Dynamic),
            None => (named(config, default_name)?, BootCommandSource::DeviceConfig),
        },
    };
    debug!("boot commands from {}", source);

    let sequence = sequence.substitute(tags);
    if sequence.lines().iter().all(|l| l.trim().is_empty()) {
        warn!("boot commands from {} are empty", source);
    }
    Ok((sequence, source))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelFormat {
    UImage,
    ZImage,
}
impl KernelFormat {
    fn boot_command(self) -> &'static str {
        match self {
            KernelFormat::UImage => "bootm",
            KernelFormat::ZImage => "bootz",
        }
    }
}
impl Default for KernelFormat {
    fn default() -> Self {
        KernelFormat::UImage
    }
}
impl FromStr for KernelFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uImage" => Ok(KernelFormat::UImage),
            "zImage" => Ok(KernelFormat::ZImage),
            other => Err(Error::UnsupportedConfiguration(format!(
                "Unknown kernel format {}",
                other
            ))),
        }
    }
}

/// The u-boot command that starts the loaded kernel.
pub fn uboot_boot_command(format: KernelFormat, has_ramdisk: bool, has_dtb: bool) -> String {
    let mut command = format!("{} ${{kernel_addr_r}}", format.boot_command());
    match (has_ramdisk, has_dtb) {
        (true, true) => command.push_str(" ${initrd_addr_r} ${fdt_addr_r}"),
        (true, false) => command.push_str(" ${initrd_addr_r}"),
        (false, true) => command.push_str(" - ${fdt_addr_r}"),
        (false, false) => {}
    }
    command
}

/// Load address tags for a u-boot deployment. Needs exactly three configured
/// addresses (kernel, ramdisk, dtb) for the chosen kernel format; the choice
/// is recorded as result metadata.
pub fn load_address_tags(
    config: &DeviceConfig,
    format: KernelFormat,
    results: &mut ResultLog,
) -> BootTagMap {
    let (addresses, name) = match format {
        KernelFormat::UImage => (&config.u_load_addrs, "uImage"),
        KernelFormat::ZImage => (&config.z_load_addrs, "zImage"),
    };
    let mut tags = BootTagMap::new();
    if let [kernel, ramdisk, dtb] = addresses.as_slice() {
        tags.insert("{KERNEL_ADDR}", kernel);
        tags.insert("{RAMDISK_ADDR}", ramdisk);
        tags.insert("{DTB_ADDR}", dtb);
        results.add_metadata("kernel.format", name);
        results.add_metadata("kernel.load_address", kernel);
        results.add_metadata("ramdisk.load_address", ramdisk);
        results.add_metadata("dtb.load_address", dtb);
    } else if !addresses.is_empty() {
        warn!(
            "expected 3 {} load addresses, found {}; not using them",
            name,
            addresses.len()
        );
    }
    tags
}

// =============================================================================
// Private stuff
// =============================================================================

fn named(config: &DeviceConfig, name: &str) -> Result<BootCommandSequence> {
    config
        .boot_cmds
        .get(name)
        .map(|text| BootCommandSequence::parse(text))
        .ok_or_else(|| {
            Error::UnsupportedConfiguration(format!("no boot command sequence named {}", name))
        })
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingsBuilder;
    use proptest::prelude::*;

    fn config() -> DeviceConfig {
        SettingsBuilder::new()
            .boot_cmds("boot_cmds", "setenv serverip {SERVER_IP}\nboot\n\n")
            .boot_cmds("nfs", "setenv rootfs nfs\nboot")
            .boot_cmds(MASTER_BOOT_CMDS, "mstar {IMAGE}/auto_update.txt")
            .finalize()
    }

    fn job() -> Option<Vec<String>> {
        Some(vec!["job line".into()])
    }

    #[test]
    fn default_sequence_with_tags() {
        let mut tags = BootTagMap::new();
        tags.insert("{SERVER_IP}", "10.0.0.1");
        let (seq, source) =
            resolve("boot_cmds", &config(), &BootOverrides::default(), None, &tags).unwrap();
        assert_eq!(source, BootCommandSource::DeviceConfig);
        assert_eq!(seq.lines()[0], "setenv serverip 10.0.0.1");
        assert_eq!(seq.strip_trailing_empty().len(), 2);
    }

    #[test]
    fn only_empty_trailing_lines_are_stripped() {
        let seq = BootCommandSequence::from_lines(vec!["setenv bootcmd run x", " ", "", ""]);
        assert_eq!(
            seq.strip_trailing_empty().lines(),
            ["setenv bootcmd run x", " "]
        );
    }

    #[test]
    fn unknown_tags_are_left_alone() {
        let tags = BootTagMap::new();
        assert_eq!(tags.apply("tftp {KERNEL}"), "tftp {KERNEL}");
    }

    #[test]
    fn missing_named_sequence() {
        let overrides = BootOverrides {
            job_boot_cmds: None,
            boot_option: Some("ramdisk".into()),
        };
        let err = resolve("boot_cmds", &config(), &overrides, None, &BootTagMap::new())
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedConfiguration(_)));
    }

    #[test]
    fn master_ignores_job_and_option() {
        let overrides = BootOverrides {
            job_boot_cmds: job(),
            boot_option: Some("nfs".into()),
        };
        let mut tags = BootTagMap::new();
        tags.insert("{IMAGE}", "helios/V1");
        let (seq, source) =
            resolve(MASTER_BOOT_CMDS, &config(), &overrides, None, &tags).unwrap();
        assert_eq!(source, BootCommandSource::DeviceConfig);
        assert_eq!(seq.lines(), ["mstar helios/V1/auto_update.txt"]);

        let dynamic = BootCommandSequence::parse("dynamic");
        let (_, source) =
            resolve(MASTER_BOOT_CMDS, &config(), &overrides, Some(&dynamic), &tags).unwrap();
        assert_eq!(source, BootCommandSource::Dynamic);
    }

    #[test]
    fn directives() {
        assert_eq!(
            Directive::parse("sendline setenv bootargs"),
            Directive::SendLine("setenv bootargs")
        );
        assert_eq!(Directive::parse("sendcontrol c"), Directive::SendControl("c"));
        assert_eq!(Directive::parse("expect U-Boot"), Directive::Expect("U-Boot"));
        assert_eq!(Directive::parse("sendlinefoo"), Directive::SendLine("foo"));
    }

    #[test]
    fn malformed_directives_are_plain_lines() {
        for line in ["send line foo", "sendlin foo", " expect x", "tftp 0x80000000 uImage"] {
            assert_eq!(Directive::parse(line), Directive::Plain(line));
        }
    }

    #[test]
    fn uboot_commands() {
        assert_eq!(
            uboot_boot_command(KernelFormat::UImage, true, true),
            "bootm ${kernel_addr_r} ${initrd_addr_r} ${fdt_addr_r}"
        );
        assert_eq!(
            uboot_boot_command(KernelFormat::ZImage, false, true),
            "bootz ${kernel_addr_r} - ${fdt_addr_r}"
        );
        assert_eq!(
            uboot_boot_command(KernelFormat::ZImage, false, false),
            "bootz ${kernel_addr_r}"
        );
        assert!("Image".parse::<KernelFormat>().is_err());
    }

    #[test]
    fn load_addresses_follow_kernel_format() {
        let config = SettingsBuilder::new()
            .load_addresses(&["0x1", "0x2", "0x3"], &["0xa", "0xb", "0xc"])
            .finalize();
        let mut results = ResultLog::new();
        let tags = load_address_tags(&config, KernelFormat::ZImage, &mut results);
        assert_eq!(tags.get("{KERNEL_ADDR}"), Some("0xa"));
        assert_eq!(tags.get("{DTB_ADDR}"), Some("0xc"));
        assert_eq!(results.metadata()["kernel.format"], "zImage");

        let partial = SettingsBuilder::new().load_addresses(&["0x1"], &[]).finalize();
        assert!(load_address_tags(&partial, KernelFormat::UImage, &mut results).is_empty());
    }

    fn priority(job: bool, option: bool, dynamic: bool) -> BootCommandSource {
        if job {
            BootCommandSource::JobFile
        } else if option {
            BootCommandSource::BootOptions
        } else if dynamic {
            BootCommandSource::Dynamic
        } else {
            BootCommandSource::DeviceConfig
        }
    }

    proptest! {
        #[test]
        fn exactly_one_source_wins(job_set: bool, option_set: bool, dynamic_set: bool) {
            let overrides = BootOverrides {
                job_boot_cmds: if job_set { job() } else { None },
                boot_option: if option_set { Some("nfs".into()) } else { None },
            };
            let dynamic = BootCommandSequence::parse("dynamic");
            let (seq, source) = resolve(
                "boot_cmds",
                &config(),
                &overrides,
                if dynamic_set { Some(&dynamic) } else { None },
                &BootTagMap::new(),
            )
            .unwrap();
            prop_assert_eq!(source, priority(job_set, option_set, dynamic_set));
            let expected = match source {
                BootCommandSource::JobFile => "job line",
                BootCommandSource::BootOptions => "setenv rootfs nfs",
                BootCommandSource::Dynamic => "dynamic",
                BootCommandSource::DeviceConfig => "setenv serverip {SERVER_IP}",
            };
            prop_assert_eq!(seq.lines()[0].as_str(), expected);
        }

        #[test]
        fn tag_order_does_not_matter(
            entries in proptest::collection::vec(("[A-D]", "[a-z0-9]{0,4}"), 0..6),
        ) {
            let text = "{A} {B} x{C}{D} {A}";
            let mut forward = BootTagMap::new();
            for (tag, value) in &entries {
                forward.insert(&format!("{{{}}}", tag), value);
            }
            // Later inserts win, so dedup before reversing.
            let mut last: BTreeMap<&str, &str> = BTreeMap::new();
            for (tag, value) in &entries {
                last.insert(tag, value);
            }
            let mut backward = BootTagMap::new();
            for (tag, value) in last.iter().rev() {
                backward.insert(&format!("{{{}}}", tag), value);
            }
            prop_assert_eq!(forward.apply(text), backward.apply(text));
        }

        #[test]
        fn stripping_is_idempotent(lines in proptest::collection::vec("[ a-z]{0,3}", 0..8)) {
            let once = BootCommandSequence::from_lines(lines).strip_trailing_empty();
            let twice = once.clone().strip_trailing_empty();
            prop_assert_eq!(&once, &twice);
            prop_assert!(once.lines().last().map_or(true, |l| !l.is_empty()));
        }
    }
}
