//! Moving files between the dispatcher host and the device over HTTP.
//!
//! The device runs a busybox `httpd` we fetch from, and fetches back from a
//! short-lived listener on the host.

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    thread::{self, JoinHandle},
};

use log::{debug, warn};
use tiny_http::{Response, Server};

use crate::error::{Error, Result};

/// A file being served until dropped.
pub trait ServedFile: Send {
    fn url(&self) -> &str;
}

pub trait Transfer: Send {
    /// Download `url` into `dest`.
    fn fetch(&self, url: &str, dest: &Path) -> Result<()>;
    /// Serve `file` over HTTP for as long as the handle lives.
    fn serve(&self, file: &Path) -> Result<Box<dyn ServedFile>>;
}

#[derive(Debug, Clone)]
pub struct HttpTransfer {
    /// Address of this host as seen by the device.
    advertise_ip: String,
}
impl HttpTransfer {
    pub fn new(advertise_ip: &str) -> Self {
        HttpTransfer {
            advertise_ip: advertise_ip.to_owned(),
        }
    }
}
impl Transfer for HttpTransfer {
    fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        debug!("fetching {} into {}", url, dest.display());
        let response = ureq::get(url)
            .call()
            .map_err(|e| Error::Network(format!("{}: {}", url, e)))?;
        let mut reader = response.into_reader();
        let mut file = File::create(dest)?;
        io::copy(&mut reader, &mut file)?;
        Ok(())
    }

    fn serve(&self, file: &Path) -> Result<Box<dyn ServedFile>> {
        let server = Server::http("0.0.0.0:0").map_err(|e| Error::Network(e.to_string()))?;
        let port = server
            .server_addr()
            .to_ip()
            .map(|addr| addr.port())
            .ok_or_else(|| Error::Network("listener has no IP address".into()))?;
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let url = format!("http://{}:{}/{}", self.advertise_ip, port, name);
        debug!("serving {} at {}", file.display(), url);

        let server = Arc::new(server);
        let worker = {
            let server = Arc::clone(&server);
            let path: PathBuf = file.to_owned();
            thread::spawn(move || serve_file(&server, &path))
        };
        Ok(Box::new(HttpServed {
            url,
            server,
            worker: Some(worker),
        }))
    }
}

struct HttpServed {
    url: String,
    server: Arc<Server>,
    worker: Option<JoinHandle<()>>,
}
impl ServedFile for HttpServed {
    fn url(&self) -> &str {
        &self.url
    }
}
impl Drop for HttpServed {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("HTTP listener for {} panicked", self.url);
            }
        }
    }
}

fn serve_file(server: &Server, path: &Path) {
    for request in server.incoming_requests() {
        debug!("{} {}", request.method(), request.url());
        let result = match File::open(path) {
            Ok(file) => request.respond(Response::from_file(file)),
            Err(_) => request.respond(Response::empty(404)),
        };
        if let Err(e) = result {
            warn!("failed to answer the device: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn serve_and_fetch_on_loopback() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("fs.tgz");
        fs::write(&source, b"payload").unwrap();

        let transfer = HttpTransfer::new("127.0.0.1");
        let served = transfer.serve(&source).unwrap();
        assert!(served.url().ends_with("/fs.tgz"));

        let dest = dir.path().join("copy");
        transfer.fetch(served.url(), &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"payload");
        drop(served);
    }

    #[test]
    fn fetch_failure_is_a_network_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let transfer = HttpTransfer::new("127.0.0.1");
        let served = transfer.serve(&missing).unwrap();
        let err = transfer
            .fetch(served.url(), &dir.path().join("out"))
            .unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }
}
