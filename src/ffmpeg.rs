use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use tokio::process::Child;

use crate::util;

#[derive(thiserror::Error, Debug)]
pub enum MergeError {
    #[error("ffmpeg not found at {0:?}")]
    MergeToolMissing(PathBuf),
    #[error("ffmpeg failed: {0}")]
    MergeFailed(String),
    #[error("I/O error")]
    IoError(#[from] std::io::Error),
}

/// Muxes separate video and audio streams with ffmpeg, copying both without
/// re-encoding.
#[derive(Debug, Clone)]
pub struct Merger {
    program: PathBuf,
}

impl Default for Merger {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl Merger {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Whether `ffmpeg -version` runs and exits successfully.
    pub async fn is_available(&self) -> bool {
        tokio::process::Command::new(&self.program)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Merge `video` and `audio` into `output`, replacing any existing file.
    ///
    /// The inputs are deleted on success and kept when ffmpeg fails.
    pub async fn merge(&self, video: &Path, audio: &Path, output: &Path) -> Result<(), MergeError> {
        if !self.is_available().await {
            return Err(MergeError::MergeToolMissing(self.program.clone()));
        }

        self.start(video, audio, output)?.finish().await
    }

    /// Spawn ffmpeg without checking that it is installed first. Once this
    /// returns, `output` may already be partly written.
    pub fn start(&self, video: &Path, audio: &Path, output: &Path) -> Result<Mux, MergeError> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(video)
            .arg("-i")
            .arg(audio)
            .arg("-c:v")
            .arg("copy")
            .arg("-c:a")
            .arg("copy")
            .arg("-y")
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Running {:?}", cmd);
        let child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => MergeError::MergeToolMissing(self.program.clone()),
            _ => MergeError::IoError(e),
        })?;

        Ok(Mux {
            child,
            video: video.to_path_buf(),
            audio: audio.to_path_buf(),
        })
    }
}

/// A running ffmpeg mux. Dropping it kills ffmpeg.
pub struct Mux {
    child: Child,
    video: PathBuf,
    audio: PathBuf,
}

impl Mux {
    /// Wait for ffmpeg to exit, then delete the inputs if it succeeded.
    pub async fn finish(self) -> Result<(), MergeError> {
        let out = self.child.wait_with_output().await?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            let msg = if stderr.is_empty() {
                format!("exited with {}", out.status)
            } else {
                stderr
            };
            return Err(MergeError::MergeFailed(msg));
        }

        util::remove_if_exists(&self.video).await;
        util::remove_if_exists(&self.audio).await;

        Ok(())
    }
}

#[cfg(all(test, unix))]
pub(crate) mod testing {
    use std::{
        os::unix::fs::PermissionsExt,
        path::{Path, PathBuf},
    };

    const CONCAT: &str = "for last; do :; done\ncat \"$5\" \"$7\" > \"$last\"";

    /// Write an executable stand-in for ffmpeg that concatenates its two
    /// inputs into the output, or fails when `fail` is set.
    pub fn fake_ffmpeg(dir: &Path, fail: bool) -> PathBuf {
        if fail {
            script(
                dir,
                "ffmpeg-broken",
                "echo fake",
                "echo 'Invalid data found when processing input' >&2\nexit 1",
            )
        } else {
            script(dir, "ffmpeg-fake", "echo fake", CONCAT)
        }
    }

    /// Takes seconds to answer `-version`.
    pub fn slow_to_start_ffmpeg(dir: &Path) -> PathBuf {
        script(dir, "ffmpeg-slow", "exec sleep 5", CONCAT)
    }

    /// Writes part of the output, then never exits.
    pub fn stuck_ffmpeg(dir: &Path) -> PathBuf {
        script(
            dir,
            "ffmpeg-stuck",
            "echo fake",
            "for last; do :; done\necho partial > \"$last\"\nexec sleep 30",
        )
    }

    fn script(dir: &Path, name: &str, version: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let script = format!(
            "#!/bin/sh\nif [ \"$1\" = \"-version\" ]; then {}; exit 0; fi\n{}\n",
            version, body
        );

        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}
