//! Local container engine driver: building, digests, archive export.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use crate::config::BuildSpec;
use crate::errors::{DockerError, TransferError};

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalDocker;

impl LocalDocker {
    pub fn ensure_available() -> Result<Self, DockerError> {
        which::which("docker").map_err(|_| DockerError::BinaryMissing)?;
        Ok(Self)
    }

    /// `docker build` with the spec's context, dockerfile, and args.
    pub async fn build(&self, tag: &str, spec: &BuildSpec) -> Result<(), DockerError> {
        let mut args: Vec<String> = vec!["build".into(), "-t".into(), tag.into()];
        if let Some(dockerfile) = &spec.dockerfile {
            args.push("-f".into());
            args.push(dockerfile.clone());
        }
        for (key, value) in &spec.args {
            args.push("--build-arg".into());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.context.clone());

        info!("[CLI] building {tag} from {}", spec.context);
        run_local(&args).await.map(|_| ())
    }

    /// Content-addressed image id (`sha256:...`), or `None` when the
    /// reference is unknown locally.
    pub async fn image_digest(&self, reference: &str) -> Result<Option<String>, DockerError> {
        let args = [
            "image".to_string(),
            "inspect".to_string(),
            "--format".to_string(),
            "{{.Id}}".to_string(),
            reference.to_string(),
        ];
        match run_local(&args).await {
            Ok(stdout) => Ok(Some(stdout.trim().to_string())),
            Err(DockerError::Local { stderr, .. }) if stderr.contains("No such") => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Export an image to `dest`, optionally gzip-compressed. Returns
    /// the archive size in bytes. Runs on the blocking pool: the export
    /// of a large image is sustained pipe-to-disk work.
    pub async fn save(
        &self,
        image: &str,
        dest: &Path,
        compress: bool,
    ) -> Result<u64, TransferError> {
        let image = image.to_string();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || save_blocking(&image, &dest, compress))
            .await
            .map_err(|e| TransferError::Save {
                image: "archive task".to_string(),
                message: e.to_string(),
            })?
    }
}

fn save_blocking(image: &str, dest: &Path, compress: bool) -> Result<u64, TransferError> {
    use std::io::Write;

    let save_err = |message: String| TransferError::Save {
        image: image.to_string(),
        message,
    };

    let mut child = std::process::Command::new("docker")
        .args(["save", image])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| save_err(e.to_string()))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| save_err("no stdout from docker save".to_string()))?;

    let file = std::fs::File::create(dest)?;
    if compress {
        let mut encoder =
            flate2::write::GzEncoder::new(file, flate2::Compression::default());
        std::io::copy(&mut stdout, &mut encoder)
            .map_err(|e| TransferError::Compress(e.to_string()))?;
        let mut file = encoder
            .finish()
            .map_err(|e| TransferError::Compress(e.to_string()))?;
        file.flush()?;
    } else {
        let mut file = file;
        std::io::copy(&mut stdout, &mut file)?;
        file.flush()?;
    }

    let status = child.wait().map_err(|e| save_err(e.to_string()))?;
    if !status.success() {
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            use std::io::Read;
            let _ = pipe.read_to_string(&mut stderr);
        }
        return Err(save_err(stderr.trim().to_string()));
    }

    Ok(std::fs::metadata(dest)?.len())
}

async fn run_local(args: &[String]) -> Result<String, DockerError> {
    debug!("docker {}", args.join(" "));
    let output = Command::new("docker")
        .args(args)
        .output()
        .await
        .map_err(|e| DockerError::Local {
            command: args.join(" "),
            stderr: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(DockerError::Local {
            command: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
