//! Host-side access to a directory of the booted device.
//!
//! The device packs the directory and serves it with busybox `httpd`; the
//! host unpacks it into a scratch directory, lets the caller work on it, then
//! packs it back and serves it for the device to fetch and unpack in place.

use std::{
    fs::File,
    path::{Path, PathBuf},
};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use log::{debug, info, warn};

use super::Target;
use crate::{
    error::{Error, Result},
    shell::ShellRunner,
};

const DEVICE_ARCHIVE: &str = "/tmp/fs.tgz";

impl Target {
    /// Run `f` over a local copy of `directory` from the device. Changes made
    /// to the copy are written back to the device afterwards, whatever `f`
    /// returns. An error from `f` wins over an error writing back.
    ///
    /// Once the device httpd is up, it is always killed and the device
    /// archive always removed, even when the host could not fetch it.
    pub fn file_system<T, F>(&mut self, directory: &str, f: F) -> Result<T>
    where
        F: FnOnce(&Path) -> Result<T>,
    {
        if std::mem::take(&mut self.reset_pending) {
            return Err(Error::Critical(
                "Operation timed out, resetting platform!".into(),
            ));
        }
        if !self.is_booted() {
            let request = self.last_boot.clone().unwrap_or_default();
            info!("{} is not booted, booting it first", self.config.hostname);
            self.boot(request)?;
        }

        let location = DeviceDirectory::new(directory)?;
        let httpd = self.serve_from_device(&location)?;

        let scratch = tempfile::tempdir()?;
        let local = scratch.path().join("root").join(&location.name);
        let outcome = self.fetch_to_host(&httpd.url, scratch.path()).and_then(|_| {
            debug!("running over {}", local.display());
            f(&local)
        });

        let mut cleanup = Ok(());
        if local.exists() {
            cleanup = self.write_back(&location, &local, scratch.path());
        }
        if let Err(err) = scratch.close() {
            warn!("could not remove the scratch directory: {}", err);
        }
        let removed = self
            .shell()
            .and_then(|mut shell| shell.run(&format!("rm -f {}", DEVICE_ARCHIVE)));
        cleanup = cleanup.and(removed.map(|_| ()));
        let killed = self
            .shell()
            .and_then(|mut shell| shell.run(&format!("kill -9 {}", httpd.pid)));
        cleanup = cleanup.and(killed.map(|_| ()));

        match (outcome, cleanup) {
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(err),
            (Ok(value), Ok(())) => Ok(value),
        }
    }

    /// Pack the directory on the device and start busybox httpd next to the
    /// archive.
    fn serve_from_device(&mut self, location: &DeviceDirectory) -> Result<DeviceHttpd> {
        let port = self.config.busybox_http_port;
        let mut shell = self.shell()?;
        shell.run(&format!("mkdir -p {}", location.path))?;
        shell.run(&format!(
            "busybox tar -cmzf {} -C {} {}",
            DEVICE_ARCHIVE, location.parent, location.name
        ))?;
        shell.run("cd /tmp")?;
        let ip = shell.target_ip().map_err(|err| match err {
            Error::Network(message) => {
                warn!("{}", message);
                Error::Critical("Network error detected..aborting".into())
            }
            other => other,
        })?;
        shell.run(&format!("busybox httpd -f -p {} &", port))?;
        let output = shell.run("echo $!")?;
        let pid = output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && l.chars().all(|c| c.is_ascii_digit()))
            .last()
            .map(str::to_owned)
            .ok_or_else(|| Error::Critical("busybox httpd did not start".into()))?;
        Ok(DeviceHttpd {
            url: format!("http://{}:{}/fs.tgz", ip, port),
            pid,
        })
    }

    fn fetch_to_host(&mut self, url: &str, scratch: &Path) -> Result<()> {
        let archive = scratch.join("fs.tgz");
        self.transfer.fetch(url, &archive)?;
        unpack(&archive, &scratch.join("root"))
    }

    /// Replace the device directory with the local copy.
    fn write_back(&mut self, location: &DeviceDirectory, local: &Path, scratch: &Path) -> Result<()> {
        let upload = scratch.join("upload");
        std::fs::create_dir_all(&upload)?;
        let archive = upload.join("fs.tgz");
        pack(local, &location.name, &archive)?;
        let served = self.transfer.serve(&archive)?;
        info!("writing {} back to the device", location.path);

        let mut shell = self.shell()?;
        shell.run(&format!("rm -rf {}", location.path))?;
        shell.run(&format!(
            "busybox wget -O - {} | busybox gzip -dc | busybox tar -C {} -xmf -",
            served.url(),
            location.parent
        ))?;
        Ok(())
    }

    fn shell(&mut self) -> Result<ShellRunner<'_>> {
        let console = self.console.as_deref_mut().ok_or(Error::NotConnected)?;
        Ok(ShellRunner::new(
            console,
            &self.config.shell_prompt,
            self.config.shell_timeout,
        ))
    }
}

// =============================================================================
// Private stuff
// =============================================================================

struct DeviceDirectory {
    path: String,
    parent: String,
    name: String,
}
impl DeviceDirectory {
    fn new(directory: &str) -> Result<Self> {
        let path = PathBuf::from(directory.trim_end_matches('/'));
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        let parent = path.parent().map(|p| p.to_string_lossy().into_owned());
        match (parent, name) {
            (Some(parent), Some(name)) => Ok(DeviceDirectory {
                path: path.to_string_lossy().into_owned(),
                parent: if parent.is_empty() { "/".into() } else { parent },
                name,
            }),
            _ => Err(Error::Critical(format!(
                "cannot work on device directory `{}`",
                directory
            ))),
        }
    }
}

/// The device httpd serving the packed directory.
struct DeviceHttpd {
    url: String,
    pid: String,
}

fn pack(source: &Path, name: &str, dest: &Path) -> Result<()> {
    let encoder = GzEncoder::new(File::create(dest)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(name, source)?;
    builder.into_inner()?.finish()?;
    Ok(())
}

fn unpack(archive: &Path, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(archive)?));
    archive.unpack(dest)?;
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::{
        fs,
        sync::{Arc, Mutex},
    };

    use super::*;
    use crate::{
        session::{ReplayConnector, ReplayLog, ReplayScript},
        settings::SettingsBuilder,
        target::{BootRequest, DeployRequest},
        transfer::{ServedFile, Transfer},
    };

    const IFCONFIG: &str = "eth0      Link encap:Ethernet  HWaddr 00:30:1B:BA:02:DB\r\n\
        \x20         inet addr:172.16.117.42  Bcast:172.16.117.255  Mask:255.255.255.0\r\n\
        root@helios:/ # ";

    /// Hands out a prepared archive and keeps a listing of what is served
    /// back.
    #[derive(Clone, Default)]
    struct FakeTransfer {
        archive: Arc<Mutex<Vec<u8>>>,
        fetched: Arc<Mutex<Vec<String>>>,
        served: Arc<Mutex<Vec<String>>>,
        unreachable: bool,
    }
    impl Transfer for FakeTransfer {
        fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
            self.fetched.lock().unwrap().push(url.to_owned());
            if self.unreachable {
                return Err(Error::Network(format!("{}: connection refused", url)));
            }
            fs::write(dest, &*self.archive.lock().unwrap())?;
            Ok(())
        }

        fn serve(&self, file: &Path) -> Result<Box<dyn ServedFile>> {
            let mut archive = tar::Archive::new(GzDecoder::new(File::open(file)?));
            let mut served = self.served.lock().unwrap();
            for entry in archive.entries()? {
                served.push(entry?.path()?.to_string_lossy().into_owned());
            }
            Ok(Box::new(FakeServed))
        }
    }

    struct FakeServed;
    impl ServedFile for FakeServed {
        fn url(&self) -> &str {
            "http://172.16.117.2:8000/fs.tgz"
        }
    }

    fn device_archive() -> Vec<u8> {
        let source = tempfile::tempdir().unwrap();
        fs::write(source.path().join("hello.txt"), "hello from the box").unwrap();
        let dest = tempfile::tempdir().unwrap();
        let archive = dest.path().join("fs.tgz");
        pack(source.path(), "data", &archive).unwrap();
        fs::read(archive).unwrap()
    }

    fn booted(script: ReplayScript) -> (Target, ReplayLog, FakeTransfer) {
        booted_with(script, FakeTransfer::default())
    }

    fn booted_with(
        script: ReplayScript,
        transfer: FakeTransfer,
    ) -> (Target, ReplayLog, FakeTransfer) {
        *transfer.archive.lock().unwrap() = device_archive();
        let connector = ReplayConnector::new(script).unwrap();
        let log = connector.log();
        let mut target = Target::new(SettingsBuilder::new().finalize())
            .unwrap()
            .with_connector(connector)
            .with_transfer(transfer.clone());
        target
            .deploy_and_boot(
                DeployRequest::new("helios/20170301/images/mstar.img", "172.16.117.9"),
                BootRequest {
                    skip: true,
                    ..BootRequest::default()
                },
            )
            .unwrap();
        (target, log, transfer)
    }

    fn healthy_device() -> ReplayScript {
        ReplayScript::new()
            .on("^busybox ifconfig$", IFCONFIG)
            .on(r"^echo \$!$", "echo $!\r\n2345\r\nroot@helios:/ # ")
            .on("", "root@helios:/ # ")
    }

    fn assert_cleaned_up(log: &ReplayLog) {
        let lines = log.lines();
        assert!(lines.contains(&"rm -rf /data/local/tmp/data".to_owned()));
        assert!(lines.contains(
            &"busybox wget -O - http://172.16.117.2:8000/fs.tgz | busybox gzip -dc \
              | busybox tar -C /data/local/tmp -xmf -"
                .to_owned()
        ));
        assert!(lines.contains(&"rm -f /tmp/fs.tgz".to_owned()));
        assert_eq!(lines.last().map(String::as_str), Some("kill -9 2345"));
    }

    #[test]
    fn changes_are_written_back() {
        let (mut target, log, transfer) = booted(healthy_device());
        let mut seen = PathBuf::new();
        let greeting = target
            .file_system("/data/local/tmp/data", |local| {
                seen = local.to_owned();
                fs::write(local.join("result.txt"), "pass")?;
                Ok(fs::read_to_string(local.join("hello.txt"))?)
            })
            .unwrap();

        assert_eq!(greeting, "hello from the box");
        assert!(!seen.exists());
        assert_eq!(
            *transfer.fetched.lock().unwrap(),
            vec!["http://172.16.117.42:80/fs.tgz"]
        );
        let served = transfer.served.lock().unwrap();
        assert!(served.iter().any(|p| p == "data/result.txt"));
        assert!(served.iter().any(|p| p == "data/hello.txt"));
        assert!(log
            .lines()
            .contains(&"busybox tar -cmzf /tmp/fs.tgz -C /data/local/tmp data".to_owned()));
        assert_cleaned_up(&log);
    }

    #[test]
    fn failing_closure_still_cleans_up() {
        let (mut target, log, _) = booted(healthy_device());
        let mut seen = PathBuf::new();
        let err = target
            .file_system("/data/local/tmp/data/", |local| -> Result<()> {
                seen = local.to_owned();
                Err(Error::Critical("test suite crashed".into()))
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "test suite crashed");
        assert!(!seen.exists());
        assert_cleaned_up(&log);
    }

    #[test]
    fn unreachable_archive_still_stops_the_device_httpd() {
        let transfer = FakeTransfer {
            unreachable: true,
            ..FakeTransfer::default()
        };
        let (mut target, log, transfer) = booted_with(healthy_device(), transfer);
        let mut called = false;
        let err = target
            .file_system("/data/local/tmp/data", |_| {
                called = true;
                Ok(())
            })
            .unwrap_err();

        assert!(matches!(err, Error::Network(_)));
        assert!(!called);
        assert!(transfer.served.lock().unwrap().is_empty());
        let lines = log.lines();
        assert!(!lines.contains(&"rm -rf /data/local/tmp/data".to_owned()));
        assert_eq!(
            lines[lines.len() - 2..],
            ["rm -f /tmp/fs.tgz".to_owned(), "kill -9 2345".to_owned()]
        );

        // A second run can serve again on the same port.
        let mut target = target.with_transfer(FakeTransfer {
            archive: Arc::new(Mutex::new(device_archive())),
            ..FakeTransfer::default()
        });
        target.file_system("/data/local/tmp/data", |_| Ok(())).unwrap();
    }

    #[test]
    fn device_without_network_aborts() {
        let script = ReplayScript::new().on("^(mkdir|busybox tar|cd)", "root@helios:/ # ");
        let (mut target, _, transfer) = booted(script);
        let err = target
            .file_system("/data/local/tmp/data", |_| Ok(()))
            .unwrap_err();
        assert_eq!(err.to_string(), "Network error detected..aborting");
        assert!(transfer.fetched.lock().unwrap().is_empty());
    }

    #[test]
    fn pending_reset_fails_once() {
        let (mut target, _, _) = booted(healthy_device());
        target.reset_boot(true);
        let err = target
            .file_system("/data/local/tmp/data", |_| Ok(()))
            .unwrap_err();
        assert_eq!(err.to_string(), "Operation timed out, resetting platform!");
        assert!(!target.is_booted());

        // The lazy boot replays the skipped boot.
        target.file_system("/data/local/tmp/data", |_| Ok(())).unwrap();
        assert!(target.is_booted());
    }
}
