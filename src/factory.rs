//! Factory image generation.
//!
//! Factory images carry per-board data (panel index, MAC, model) and are
//! built on the host by the vendor `factory.sh` tool, then published in the
//! TFTP root so the bootloader can fetch them.

use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use log::{debug, info, warn};

use crate::{
    error::{Error, Result},
    settings::FactorySettings,
};

/// Parameters handed to the factory tool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FactoryParams {
    pub job_id: String,
    pub project_name: String,
    pub model_index: String,
    pub product_name: String,
    pub yun_os: bool,
}

pub trait FactoryImage: Send {
    /// Build the factory image and return its path relative to the TFTP root.
    fn generate(&self, params: &FactoryParams) -> Result<String>;
}

/// Runs `factory.sh` from the tool directory.
#[derive(Debug, Clone)]
pub struct ScriptFactoryImage {
    tool_dir: PathBuf,
    tftp_root: PathBuf,
}
impl ScriptFactoryImage {
    pub fn new(settings: &FactorySettings) -> Self {
        ScriptFactoryImage {
            tool_dir: settings.tool_dir.clone(),
            tftp_root: settings.tftp_root.clone(),
        }
    }
}
impl FactoryImage for ScriptFactoryImage {
    fn generate(&self, params: &FactoryParams) -> Result<String> {
        let payload = payload_name(&params.project_name)?;

        info!(
            "generating factory image for {} (job {})",
            params.project_name, params.job_id
        );
        let status = Command::new("./factory.sh")
            .current_dir(&self.tool_dir)
            .arg(&params.job_id)
            .arg(&params.project_name)
            .arg(&params.model_index)
            .arg(&params.product_name)
            .arg(if params.yun_os { "true" } else { "false" })
            .status()
            .map_err(|e| Error::FlashGeneration(format!("cannot run factory.sh: {}", e)))?;
        debug!("factory.sh exited with {}", status);

        let output = self.tool_dir.join("image").join(&params.job_id);
        if !(output.join("factory").is_file() && output.join(payload).is_file()) {
            return Err(Error::FlashGeneration("can not generate factory image".into()));
        }
        publish(&output, &self.tftp_root.join(&params.job_id))?;
        info!("generate factory image successfully");
        Ok(format!("{}/factory", params.job_id))
    }
}

/// Stand-in for devices without a factory tool.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFactoryImage;
impl FactoryImage for NoFactoryImage {
    fn generate(&self, _params: &FactoryParams) -> Result<String> {
        Err(Error::FlashGeneration(
            "no factory tool configured for this device".into(),
        ))
    }
}

fn payload_name(project: &str) -> Result<&'static str> {
    match project {
        "apollo" | "phoebus" => Ok("factory.ext4.gz"),
        "sphinx" | "titan" | "helios" => Ok("factory.img"),
        _ => {
            warn!("only support apollo, helios, sphinx, titan");
            Err(Error::FlashGeneration(
                "only support apollo, helios, sphinx, titan".into(),
            ))
        }
    }
}

fn publish(from: &Path, to: &Path) -> Result<()> {
    if to.exists() {
        fs::remove_dir_all(to)?;
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(from, to).is_err() {
        // Crossing filesystems.
        let status = Command::new("mv").arg(from).arg(to).status()?;
        if !status.success() {
            return Err(Error::FlashGeneration(format!(
                "cannot move {} to {}",
                from.display(),
                to.display()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(project: &str) -> FactoryParams {
        FactoryParams {
            job_id: "1234".into(),
            project_name: project.into(),
            model_index: "7".into(),
            product_name: "W55C".into(),
            yun_os: false,
        }
    }

    #[cfg(unix)]
    fn tool(script: &str) -> (tempfile::TempDir, ScriptFactoryImage) {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let tool_dir = dir.path().join("tool");
        fs::create_dir(&tool_dir).unwrap();
        let path = tool_dir.join("factory.sh");
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        let image = ScriptFactoryImage::new(&FactorySettings {
            tool_dir,
            tftp_root: dir.path().join("tftp"),
        });
        (dir, image)
    }

    #[test]
    fn payload_depends_on_project() {
        assert_eq!(payload_name("apollo").unwrap(), "factory.ext4.gz");
        assert_eq!(payload_name("helios").unwrap(), "factory.img");
        assert!(matches!(
            payload_name("zeus"),
            Err(Error::FlashGeneration(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn generated_image_is_published() {
        let (dir, image) = tool(
            "#!/bin/sh\nmkdir -p image/$1\ntouch image/$1/factory image/$1/factory.img\n",
        );
        assert_eq!(image.generate(&params("helios")).unwrap(), "1234/factory");
        assert!(dir.path().join("tftp/1234/factory.img").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn missing_payload_is_an_error() {
        let (_dir, image) = tool("#!/bin/sh\nmkdir -p image/$1\ntouch image/$1/factory\n");
        assert!(matches!(
            image.generate(&params("apollo")),
            Err(Error::FlashGeneration(_))
        ));
    }

    #[test]
    fn no_factory_tool() {
        assert!(NoFactoryImage.generate(&params("helios")).is_err());
    }
}
